//! `fixwatch ci`: poll CI for a commit until it finishes.

use anyhow::{Result, bail};
use console::style;

use fixwatch::ci::{CiMonitor, CiTarget, MonitorSnapshot, PollState};
use fixwatch::config::FixwatchConfig;
use fixwatch::model::CiOverallStatus;
use fixwatch::ui::CiSpinner;
use fixwatch::ui::icons::{CROSS, SPARKLE};
use fixwatch::ui::render::{format_check, format_overall};

fn spinner_label(target: &CiTarget) -> String {
    let short_sha: String = target.sha.chars().take(7).collect();
    format!("{}@{}", target.branch, short_sha)
}

/// Terminal status of a finished run, if the snapshot holds one.
fn finished(snapshot: &MonitorSnapshot) -> Option<CiOverallStatus> {
    if snapshot.is_polling || snapshot.state != PollState::Idle {
        return None;
    }
    snapshot
        .status
        .as_ref()
        .map(|s| s.overall_status)
        .filter(CiOverallStatus::is_terminal)
}

pub async fn cmd_ci(
    config: &FixwatchConfig,
    branch: &str,
    sha: &str,
    auto_fix: Option<&str>,
) -> Result<()> {
    let monitor_config = config.monitor_config();
    if !monitor_config.enabled {
        println!("CI monitoring is disabled ([ci] enabled = false in fixwatch.toml).");
        return Ok(());
    }

    let mut target = CiTarget::new(branch, sha);
    if let Some((owner, repo)) = config.toml.owner_repo() {
        target = target.with_repository(owner, repo);
    }

    let max_retries = monitor_config.max_retries;
    let monitor = CiMonitor::http(config.base_url(), target.clone(), monitor_config)
        .on_complete(|status, checks| {
            tracing::info!(%status, checks = checks.len(), "CI run complete");
        });
    let mut rx = monitor.subscribe();
    let mut spinner = CiSpinner::new(&spinner_label(&target), max_retries);
    let mut fix_requested = false;

    monitor.start_polling();

    loop {
        let snapshot = rx.borrow_and_update().clone();
        spinner.update(&snapshot);

        if snapshot.state == PollState::Error {
            spinner.finish(format!(
                "{}{}",
                CROSS,
                snapshot.error.as_deref().unwrap_or("CI polling stopped")
            ));
            bail!(
                "{}",
                snapshot
                    .error
                    .unwrap_or_else(|| "CI polling stopped".to_string())
            );
        }

        if let Some(overall) = finished(&snapshot) {
            spinner.finish(format_overall(overall));
            if let Some(status) = &snapshot.status {
                for check in &status.checks {
                    println!("{}", format_check(check));
                }
            }

            if overall.is_failing()
                && !fix_requested
                && let Some(subject_id) = auto_fix
            {
                fix_requested = true;
                println!();
                println!("{}Requesting auto-fix for {}...", SPARKLE, style(subject_id).bold());
                let response = monitor.trigger_auto_fix(subject_id).await;
                println!("  {}", response.message);

                if monitor.is_polling() {
                    let target = monitor.target();
                    println!("  Watching new commit {}", style(&target.sha).bold());
                    spinner = CiSpinner::new(&spinner_label(&target), max_retries);
                    continue;
                }
            }

            if overall.is_failing() {
                bail!("CI finished with status {}", overall);
            }
            return Ok(());
        }

        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                spinner.clear();
                println!("Interrupted.");
                monitor.stop_polling();
                break;
            }
        }
    }

    Ok(())
}
