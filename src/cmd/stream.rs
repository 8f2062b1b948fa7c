//! `fixwatch stream`: follow the live event stream of one or more runs.

use anyhow::{Result, bail};
use console::style;
use tokio::time::Instant;

use fixwatch::config::FixwatchConfig;
use fixwatch::stream::{ConnectionState, StreamIngestor, StreamSnapshot};
use fixwatch::ui::icons::{CHECK, CROSS, SPARKLE};
use fixwatch::ui::render::{format_activity, format_connection, format_metrics};
use fixwatch::ui::{ActivityFeed, FeedItem};

fn print_changes(feed: &mut ActivityFeed, snapshot: &StreamSnapshot) {
    for item in feed.changes(snapshot) {
        match item {
            FeedItem::Connection { state, error } => {
                println!("{}", format_connection(state, error.as_deref()))
            }
            FeedItem::Activity {
                subject_id,
                activity,
            } => println!("{}", format_activity(&subject_id, &activity)),
            FeedItem::Metrics {
                subject_id,
                metrics,
            } => println!("{}", format_metrics(&subject_id, &metrics)),
        }
    }
}

fn print_summary(snapshot: &StreamSnapshot, ids: &[String]) {
    println!();
    for id in ids {
        if let Some(message) = snapshot.failed_subjects.get(id) {
            println!("{}{}: {}", CROSS, style(id).bold(), style(message).red());
        } else if snapshot.completed_subjects.contains(id) {
            println!("{}{}: completed", CHECK, style(id).bold());
        } else {
            println!("  {}: unfinished", style(id).bold());
        }
        if let Some(metrics) = snapshot.metrics.get(id) {
            println!("    {}", format_metrics(id, metrics));
        }
    }
}

pub async fn cmd_stream(config: &FixwatchConfig, ids: &[String]) -> Result<()> {
    let ids: Vec<String> = ids
        .iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect();
    if ids.is_empty() {
        bail!("At least one subject id is required (--ids a,b)");
    }

    let base_url = config.base_url();
    let ingestor_config = config.ingestor_config();
    // Settled subjects still have their final activity in the pending buffer
    // for up to one flush interval.
    let drain_grace = ingestor_config.min_flush_interval() * 2;

    println!(
        "{}Following {} at {}",
        SPARKLE,
        style(ids.join(", ")).bold(),
        base_url
    );

    let ingestor = StreamIngestor::sse(base_url, ingestor_config);
    let mut rx = ingestor.subscribe();
    ingestor.connect(&ids);

    let mut feed = ActivityFeed::default();
    let mut settled_at: Option<Instant> = None;

    let snapshot = loop {
        let snapshot = rx.borrow_and_update().clone();
        print_changes(&mut feed, &snapshot);

        if snapshot.connection_state == ConnectionState::Disconnected {
            break snapshot;
        }
        if settled_at.is_none() && snapshot.all_settled(&ids) {
            settled_at = Some(Instant::now() + drain_grace);
        }

        let grace = async {
            match settled_at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break snapshot;
                }
            }
            _ = grace => {
                let snapshot = rx.borrow_and_update().clone();
                print_changes(&mut feed, &snapshot);
                break snapshot;
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Interrupted.");
                break snapshot;
            }
        }
    };

    ingestor.disconnect();
    print_summary(&snapshot, &ids);

    if let Some(error) = &snapshot.error {
        bail!("{}", error);
    }
    if !snapshot.failed_subjects.is_empty() {
        bail!(
            "{} of {} run(s) failed",
            snapshot.failed_subjects.len(),
            ids.len()
        );
    }
    Ok(())
}
