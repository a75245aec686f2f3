use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, warn};
use vigil_core::inbound::source_channel;
use vigil_core::{current_unix_timestamp_ms, ChannelSender, Notifier, SendOptions};

/// One NDJSON line for an outbound message.
pub fn render_outbound_line(target: &str, text: &str, options: &SendOptions) -> Result<String> {
    let line = serde_json::to_string(&json!({
        "type": "outbound",
        "timestamp_unix_ms": current_unix_timestamp_ms(),
        "target": target,
        "text": text,
        "options": options,
    }))
    .context("failed to encode outbound message")?;
    Ok(format!("{line}\n"))
}

/// Writes outbound messages to stdout as NDJSON; the default surface.
pub struct ConsoleChannel {
    stdout: Mutex<tokio::io::Stdout>,
}

impl ConsoleChannel {
    pub fn new() -> Self {
        Self {
            stdout: Mutex::new(tokio::io::stdout()),
        }
    }
}

impl Default for ConsoleChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelSender for ConsoleChannel {
    async fn send(&self, target: &str, text: &str, options: &SendOptions) -> Result<()> {
        let line = render_outbound_line(target, text, options)?;
        let mut stdout = self.stdout.lock().await;
        stdout
            .write_all(line.as_bytes())
            .await
            .context("failed to write outbound message to stdout")?;
        stdout.flush().await.context("failed to flush stdout")?;
        Ok(())
    }
}

/// Routes a `channel:conversation` target to the sender registered for its channel.
pub struct ChannelRouter {
    routes: HashMap<String, Arc<dyn ChannelSender>>,
    fallback: Arc<dyn ChannelSender>,
}

impl ChannelRouter {
    pub fn new(fallback: Arc<dyn ChannelSender>) -> Self {
        Self {
            routes: HashMap::new(),
            fallback,
        }
    }

    pub fn register(mut self, channel: impl Into<String>, sender: Arc<dyn ChannelSender>) -> Self {
        self.routes.insert(channel.into(), sender);
        self
    }

    pub fn resolve(&self, target: &str) -> &Arc<dyn ChannelSender> {
        self.routes
            .get(source_channel(target))
            .unwrap_or(&self.fallback)
    }
}

#[async_trait]
impl ChannelSender for ChannelRouter {
    async fn send(&self, target: &str, text: &str, options: &SendOptions) -> Result<()> {
        self.resolve(target).send(target, text, options).await
    }
}

/// Priority notifications delivered to the operator's channel target.
pub struct OperatorNotifier {
    channels: Arc<dyn ChannelSender>,
    target: String,
}

impl OperatorNotifier {
    pub fn new(channels: Arc<dyn ChannelSender>, target: impl Into<String>) -> Self {
        Self {
            channels,
            target: target.into(),
        }
    }
}

#[async_trait]
impl Notifier for OperatorNotifier {
    async fn notify_priority(&self, text: &str) {
        warn!(target_channel = %self.target, message = %text, "priority notification");
        if let Err(delivery_error) = self
            .channels
            .send(&self.target, text, &SendOptions::default())
            .await
        {
            error!(
                target_channel = %self.target,
                error = %delivery_error,
                "failed to deliver priority notification"
            );
        }
    }
}
