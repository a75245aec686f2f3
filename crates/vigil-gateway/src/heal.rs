use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;
use vigil_resilience::{ConnectionError, SelfHeal};

use crate::config::HealCommandConfig;

/// Runs an operator-provided command (e.g. restart the agent's upstream)
/// as the self-heal hook. The connector name is exported as `VIGIL_CONNECTOR`.
pub struct HealCommand {
    config: HealCommandConfig,
}

impl HealCommand {
    pub fn new(config: HealCommandConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SelfHeal for HealCommand {
    async fn heal(&self, connector: &str) -> Result<(), ConnectionError> {
        let Some((program, args)) = self.config.argv.split_first() else {
            return Err(ConnectionError::Heal("empty heal command".to_string()));
        };
        let mut command = Command::new(program);
        command.kill_on_drop(true);
        command.args(args);
        command.env("VIGIL_CONNECTOR", connector);
        command.stdin(Stdio::null());
        command.stdout(Stdio::null());
        command.stderr(Stdio::piped());
        let child = command.spawn().map_err(|error| {
            ConnectionError::Heal(format!("failed to spawn '{program}': {error}"))
        })?;

        let timeout = self.config.timeout;
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                ConnectionError::Heal(format!(
                    "'{program}' timed out after {}ms",
                    timeout.as_millis()
                ))
            })?
            .map_err(|error| ConnectionError::Heal(format!("'{program}' failed: {error}")))?;

        if !output.status.success() {
            let status = output
                .status
                .code()
                .map(|value| value.to_string())
                .unwrap_or_else(|| "signal".to_string());
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ConnectionError::Heal(format!(
                "'{program}' exited with status {status}: {}",
                stderr.trim()
            )));
        }
        info!(connector, program = %program, "heal command succeeded");
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::HealCommand;
    use crate::config::HealCommandConfig;
    use std::time::Duration;
    use vigil_resilience::{ConnectionError, SelfHeal};

    fn heal(script: &str, timeout: Duration) -> HealCommand {
        HealCommand::new(HealCommandConfig {
            argv: vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
            timeout,
        })
    }

    #[tokio::test]
    async fn functional_heal_command_receives_connector_name() {
        let hook = heal("test \"$VIGIL_CONNECTOR\" = session", Duration::from_secs(5));
        assert_eq!(hook.heal("session").await, Ok(()));
        assert!(hook.heal("bus").await.is_err());
    }

    #[tokio::test]
    async fn regression_failing_heal_command_reports_stderr() {
        let hook = heal("echo restart refused >&2; exit 3", Duration::from_secs(5));
        let Err(ConnectionError::Heal(message)) = hook.heal("session").await else {
            panic!("expected heal failure");
        };
        assert!(message.contains("status 3"));
        assert!(message.contains("restart refused"));
    }

    #[tokio::test]
    async fn regression_hung_heal_command_is_bounded_by_timeout() {
        let hook = heal("sleep 5", Duration::from_millis(100));
        let Err(ConnectionError::Heal(message)) = hook.heal("session").await else {
            panic!("expected timeout");
        };
        assert!(message.contains("timed out"));
    }
}
