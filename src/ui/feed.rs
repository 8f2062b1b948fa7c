//! Tracks what has already been printed from successive stream snapshots.

use std::collections::HashMap;

use fixwatch_common::{Activity, ExecutionMetrics};

use crate::stream::{ConnectionState, StreamSnapshot};

/// Something new in a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedItem {
    Connection {
        state: ConnectionState,
        error: Option<String>,
    },
    /// A new activity, or a known id whose status or details changed.
    Activity { subject_id: String, activity: Activity },
    Metrics {
        subject_id: String,
        metrics: ExecutionMetrics,
    },
}

#[derive(Debug, Default)]
pub struct ActivityFeed {
    connection: Option<(ConnectionState, Option<String>)>,
    seen: HashMap<String, HashMap<String, Activity>>,
    metrics: HashMap<String, ExecutionMetrics>,
}

impl ActivityFeed {
    /// Diff `snapshot` against everything reported so far. Subjects are
    /// reported in sorted order, activities in log order.
    pub fn changes(&mut self, snapshot: &StreamSnapshot) -> Vec<FeedItem> {
        let mut items = Vec::new();

        let connection = (snapshot.connection_state, snapshot.error.clone());
        if self.connection.as_ref() != Some(&connection) {
            items.push(FeedItem::Connection {
                state: connection.0,
                error: connection.1.clone(),
            });
            self.connection = Some(connection);
        }

        let mut subjects: Vec<&String> = snapshot.activities.keys().collect();
        subjects.sort();
        for subject_id in subjects {
            let seen = self.seen.entry(subject_id.clone()).or_default();
            for activity in &snapshot.activities[subject_id] {
                if seen.get(&activity.id) != Some(activity) {
                    seen.insert(activity.id.clone(), activity.clone());
                    items.push(FeedItem::Activity {
                        subject_id: subject_id.clone(),
                        activity: activity.clone(),
                    });
                }
            }
        }

        let mut subjects: Vec<&String> = snapshot.metrics.keys().collect();
        subjects.sort();
        for subject_id in subjects {
            let metrics = &snapshot.metrics[subject_id];
            if self.metrics.get(subject_id) != Some(metrics) {
                self.metrics.insert(subject_id.clone(), metrics.clone());
                items.push(FeedItem::Metrics {
                    subject_id: subject_id.clone(),
                    metrics: metrics.clone(),
                });
            }
        }

        items
    }
}
