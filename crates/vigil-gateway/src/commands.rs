use std::path::Path;

use anyhow::{Context, Result};
use serde_json::json;
use vigil_core::{current_unix_timestamp_ms, InboundItem};
use vigil_runtime::{inspect_status, read_tripwire, TripwireRecord, WatchdogReport};
use vigil_store::{DurableLog, SqliteStore, StreamConfig};

use crate::config::{database_path, status_path, tripwire_path};

const PROMPT_PREVIEW_CHARS: usize = 80;

pub fn run_status_command(state_dir: &Path, json_output: bool) -> Result<()> {
    let report = inspect_status(&status_path(state_dir))?;
    let tripwire = read_tripwire(&tripwire_path(state_dir))?;
    if json_output {
        let payload = json!({ "status": report, "tripwire": tripwire });
        println!(
            "{}",
            serde_json::to_string_pretty(&payload).context("failed to encode status")?
        );
        return Ok(());
    }
    println!(
        "{}",
        render_status_summary(
            report.as_ref(),
            tripwire.as_ref(),
            current_unix_timestamp_ms()
        )
    );
    Ok(())
}

pub fn render_status_summary(
    report: Option<&WatchdogReport>,
    tripwire: Option<&TripwireRecord>,
    now_unix_ms: u64,
) -> String {
    let mut lines = Vec::new();
    match report {
        Some(report) => {
            lines.push(format!(
                "watchdog: action={} ticks={} age_ms={} pid={}",
                report.action,
                report.tick_count,
                now_unix_ms.saturating_sub(report.updated_unix_ms),
                report.pid
            ));
            lines.push(format!(
                "health: log={} bus={} bus_pending={} mode={}",
                report.log_healthy, report.bus_healthy, report.bus_pending, report.mode
            ));
            lines.push(format!(
                "queue: depth={} draining={} active_source={} consecutive_failures={} stuck_ms={}",
                report.queue.depth,
                report.queue.draining,
                report.queue.active_source.as_deref().unwrap_or("-"),
                report.consecutive_failures,
                report
                    .stuck_ms
                    .map(|value| value.to_string())
                    .unwrap_or_else(|| "-".to_string())
            ));
            if let Some(fallback) = &report.fallback {
                lines.push(format!(
                    "fallback: active={} model={} activations={}",
                    fallback.active,
                    fallback.fallback_model.as_deref().unwrap_or("-"),
                    fallback.activation_count
                ));
            }
        }
        None => lines.push("watchdog: no status snapshot yet".to_string()),
    }
    match tripwire {
        Some(record) => lines.push(format!(
            "tripwire: pid={} heartbeat_age_ms={}",
            record.pid,
            record.age_ms(now_unix_ms)
        )),
        None => lines.push("tripwire: missing".to_string()),
    }
    lines.join("\n")
}

pub async fn run_replay_preview(state_dir: &Path, json_output: bool) -> Result<()> {
    let path = database_path(state_dir);
    if !path.exists() {
        println!("no gateway store at {}", path.display());
        return Ok(());
    }
    let store = SqliteStore::open(&path, StreamConfig::default())
        .with_context(|| format!("failed to open store {}", path.display()))?;
    let pending = store
        .peek_unacked()
        .await
        .context("failed to list unacknowledged entries")?;
    if json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(&pending).context("failed to encode entries")?
        );
        return Ok(());
    }
    println!("{}", render_replay_preview(&pending));
    Ok(())
}

pub fn render_replay_preview(pending: &[InboundItem]) -> String {
    if pending.is_empty() {
        return "replay preview: nothing to replay".to_string();
    }
    let mut lines = vec![format!(
        "replay preview: {} unacknowledged entr{}",
        pending.len(),
        if pending.len() == 1 { "y" } else { "ies" }
    )];
    for item in pending {
        let mut preview: String = item.prompt.chars().take(PROMPT_PREVIEW_CHARS).collect();
        if item.prompt.chars().count() > PROMPT_PREVIEW_CHARS {
            preview.push_str("...");
        }
        lines.push(format!(
            "- {} source={} prompt={:?}",
            item.stream_id.as_deref().unwrap_or("-"),
            item.source,
            preview
        ));
    }
    lines.join("\n")
}
