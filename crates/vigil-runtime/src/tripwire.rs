use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use vigil_core::{current_unix_timestamp_ms, read_json_if_exists, write_json_atomic};

const DEFAULT_TRIPWIRE_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TripwireConfig {
    pub path: PathBuf,
    pub interval: Duration,
}

impl TripwireConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            interval: DEFAULT_TRIPWIRE_INTERVAL,
        }
    }
}

/// Liveness record for supervisors that do not trust the in-process watchdog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripwireRecord {
    pub last_heartbeat_unix_ms: u64,
    pub pid: u32,
    pub started_unix_ms: u64,
}

impl TripwireRecord {
    /// Milliseconds since the last heartbeat.
    pub fn age_ms(&self, now_unix_ms: u64) -> u64 {
        now_unix_ms.saturating_sub(self.last_heartbeat_unix_ms)
    }
}

pub fn write_tripwire(path: &Path, record: &TripwireRecord) -> Result<()> {
    write_json_atomic(path, record)
        .with_context(|| format!("failed to write tripwire {}", path.display()))
}

pub fn read_tripwire(path: &Path) -> Result<Option<TripwireRecord>> {
    read_json_if_exists(path)
        .with_context(|| format!("failed to read tripwire {}", path.display()))
}

#[derive(Debug)]
pub struct TripwireHandle {
    path: PathBuf,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl TripwireHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    pub async fn shutdown(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// Writes the tripwire once, then again on every interval until shut down.
pub fn start_tripwire(config: TripwireConfig) -> Result<TripwireHandle> {
    if config.interval.is_zero() {
        anyhow::bail!("tripwire interval must be greater than zero");
    }
    let started_unix_ms = current_unix_timestamp_ms();
    let pid = std::process::id();
    write_tripwire(
        &config.path,
        &TripwireRecord {
            last_heartbeat_unix_ms: started_unix_ms,
            pid,
            started_unix_ms,
        },
    )?;

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let path = config.path.clone();
    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let record = TripwireRecord {
                        last_heartbeat_unix_ms: current_unix_timestamp_ms(),
                        pid,
                        started_unix_ms,
                    };
                    match write_tripwire(&config.path, &record) {
                        Ok(()) => debug!(path = %config.path.display(), "tripwire refreshed"),
                        Err(error) => warn!(error = %error, "tripwire write failed"),
                    }
                }
                _ = &mut shutdown_rx => break,
            }
        }
    });
    Ok(TripwireHandle {
        path,
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    })
}

#[cfg(test)]
mod tests {
    use super::{read_tripwire, start_tripwire, TripwireConfig};
    use std::time::Duration;
    use tempfile::tempdir;

    #[tokio::test]
    async fn functional_tripwire_is_written_at_start_and_stops_cleanly() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("state").join("tripwire.json");
        assert!(read_tripwire(&path).expect("read missing").is_none());

        let mut handle = start_tripwire(TripwireConfig {
            path: path.clone(),
            interval: Duration::from_millis(20),
        })
        .expect("start");
        let first = read_tripwire(&path).expect("read").expect("record");
        assert_eq!(first.pid, std::process::id());
        assert_eq!(first.started_unix_ms, first.last_heartbeat_unix_ms);

        tokio::time::sleep(Duration::from_millis(80)).await;
        handle.shutdown().await;
        assert!(!handle.is_running());
        let later = read_tripwire(&path).expect("read").expect("record");
        assert_eq!(later.started_unix_ms, first.started_unix_ms);
        assert!(later.last_heartbeat_unix_ms >= first.last_heartbeat_unix_ms);
    }

    #[test]
    fn regression_zero_interval_is_rejected() {
        let temp = tempdir().expect("tempdir");
        let error = start_tripwire(TripwireConfig {
            path: temp.path().join("tripwire.json"),
            interval: Duration::ZERO,
        })
        .expect_err("zero interval");
        assert!(error.to_string().contains("greater than zero"));
    }
}
