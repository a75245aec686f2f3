use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};
use vigil_core::{current_unix_timestamp_ms, ModelRef};
use vigil_runtime::{FallbackState, PrimaryProbe};

const PROBE_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Primary is healthy when its health URL answers 2xx.
pub struct HttpPrimaryProbe {
    client: Client,
    url: String,
}

impl HttpPrimaryProbe {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(PROBE_REQUEST_TIMEOUT)
            .build()
            .context("failed to construct reqwest client for primary probe")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl PrimaryProbe for HttpPrimaryProbe {
    async fn primary_healthy(&self, primary: &ModelRef, _state: &FallbackState) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(response) => {
                let healthy = response.status().is_success();
                debug!(
                    model = %primary,
                    status = response.status().as_u16(),
                    healthy,
                    "primary health probe"
                );
                healthy
            }
            Err(error) => {
                warn!(model = %primary, error = %error, "primary health probe failed");
                false
            }
        }
    }
}

/// Without a health URL the primary is retried once the fallback has run
/// for `cooldown`; the prompt timeout re-trips if it is still unhealthy.
pub struct CooldownProbe {
    cooldown: Duration,
    clock: Arc<dyn Fn() -> u64 + Send + Sync>,
}

impl CooldownProbe {
    pub fn new(cooldown: Duration) -> Self {
        Self::new_with_clock(cooldown, Arc::new(current_unix_timestamp_ms))
    }

    fn new_with_clock(cooldown: Duration, clock: Arc<dyn Fn() -> u64 + Send + Sync>) -> Self {
        Self { cooldown, clock }
    }
}

#[async_trait]
impl PrimaryProbe for CooldownProbe {
    async fn primary_healthy(&self, _primary: &ModelRef, state: &FallbackState) -> bool {
        let cooldown_ms = u64::try_from(self.cooldown.as_millis()).unwrap_or(u64::MAX);
        match state.active_since_unix_ms {
            Some(since) => (self.clock)().saturating_sub(since) >= cooldown_ms,
            None => true,
        }
    }
}
