//! Per-subject activity logs and the pending buffer that feeds them.

use std::collections::HashMap;

use fixwatch_common::Activity;

/// Default number of activities retained per subject.
pub const DEFAULT_MAX_ACTIVITIES: usize = 500;

/// Merge `incoming` into `log`.
///
/// An activity whose id is already in the log replaces that entry in place;
/// anything else is appended. Afterwards the log is cut down to the newest
/// `max_len` entries, dropping from the front.
pub fn merge_activities(log: &mut Vec<Activity>, incoming: Vec<Activity>, max_len: usize) {
    for activity in incoming {
        upsert(log, activity);
    }
    if log.len() > max_len {
        let excess = log.len() - max_len;
        log.drain(..excess);
    }
}

fn upsert(entries: &mut Vec<Activity>, activity: Activity) {
    match entries.iter_mut().find(|a| a.id == activity.id) {
        Some(existing) => *existing = activity,
        None => entries.push(activity),
    }
}

/// Activities received since the last flush, keyed by subject.
#[derive(Debug, Default)]
pub struct PendingBuffer {
    by_subject: HashMap<String, Vec<Activity>>,
}

impl PendingBuffer {
    /// Buffer an activity. A re-delivered id replaces its pending entry.
    pub fn push(&mut self, subject_id: &str, activity: Activity) {
        let entries = self.by_subject.entry(subject_id.to_string()).or_default();
        upsert(entries, activity);
    }

    pub fn is_empty(&self) -> bool {
        self.by_subject.values().all(Vec::is_empty)
    }

    /// Total number of buffered activities across subjects.
    pub fn len(&self) -> usize {
        self.by_subject.values().map(Vec::len).sum()
    }

    pub fn take(&mut self) -> HashMap<String, Vec<Activity>> {
        std::mem::take(&mut self.by_subject)
    }

    pub fn clear(&mut self) {
        self.by_subject.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fixwatch_common::{ActivityKind, ActivityStatus};

    fn activity(id: &str, details: &str) -> Activity {
        Activity {
            id: id.to_string(),
            timestamp: "2024-01-01T00:00:00Z".to_string(),
            kind: ActivityKind::Tool,
            details: details.to_string(),
            status: ActivityStatus::Pending,
        }
    }

    fn ids(log: &[Activity]) -> Vec<&str> {
        log.iter().map(|a| a.id.as_str()).collect()
    }

    #[test]
    fn test_merge_appends_new_ids_in_order() {
        let mut log = Vec::new();
        merge_activities(&mut log, vec![activity("a", "1"), activity("b", "2")], 10);
        merge_activities(&mut log, vec![activity("c", "3")], 10);
        assert_eq!(ids(&log), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_redelivered_id_replaces_in_place() {
        let mut log = Vec::new();
        merge_activities(
            &mut log,
            vec![activity("a", "Running tests"), activity("b", "x"), activity("c", "y")],
            10,
        );

        let mut update = activity("a", "Tests passed");
        update.status = ActivityStatus::Success;
        merge_activities(&mut log, vec![update], 10);

        assert_eq!(log.len(), 3);
        assert_eq!(ids(&log), vec!["a", "b", "c"]);
        assert_eq!(log[0].details, "Tests passed");
        assert_eq!(log[0].status, ActivityStatus::Success);
    }

    #[test]
    fn test_truncation_drops_oldest() {
        let mut log = Vec::new();
        let burst: Vec<Activity> = (0..25).map(|i| activity(&format!("a{}", i), "")).collect();
        merge_activities(&mut log, burst, 10);
        assert_eq!(log.len(), 10);
        assert_eq!(log.first().unwrap().id, "a15");
        assert_eq!(log.last().unwrap().id, "a24");
    }

    #[test]
    fn test_update_of_truncated_id_is_appended() {
        let mut log = Vec::new();
        merge_activities(&mut log, vec![activity("a", ""), activity("b", ""), activity("c", "")], 2);
        assert_eq!(ids(&log), vec!["b", "c"]);

        merge_activities(&mut log, vec![activity("a", "late update")], 2);
        assert_eq!(ids(&log), vec!["c", "a"]);
    }

    #[test]
    fn test_pending_buffer_dedups_per_subject() {
        let mut pending = PendingBuffer::default();
        pending.push("run-1", activity("a", "first"));
        pending.push("run-1", activity("a", "second"));
        pending.push("run-2", activity("a", "other subject"));
        assert_eq!(pending.len(), 2);

        let mut drained = pending.take();
        assert!(pending.is_empty());
        let run1 = drained.remove("run-1").unwrap();
        assert_eq!(run1.len(), 1);
        assert_eq!(run1[0].details, "second");
        assert_eq!(drained["run-2"].len(), 1);
    }
}
