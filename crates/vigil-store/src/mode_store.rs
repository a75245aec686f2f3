use async_trait::async_trait;
use tokio::sync::RwLock;
use vigil_core::GatewayMode;

use crate::StoreResult;

/// Persistence for the process-wide gateway mode flag.
#[async_trait]
pub trait ModeStore: Send + Sync {
    async fn load_mode(&self) -> StoreResult<GatewayMode>;
    async fn store_mode(&self, mode: GatewayMode) -> StoreResult<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryModeStore {
    flag: RwLock<Option<String>>,
}

impl InMemoryModeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mode(mode: GatewayMode) -> Self {
        Self {
            flag: RwLock::new(Some(mode.as_flag().to_string())),
        }
    }
}

#[async_trait]
impl ModeStore for InMemoryModeStore {
    async fn load_mode(&self) -> StoreResult<GatewayMode> {
        Ok(GatewayMode::from_flag(self.flag.read().await.as_deref()))
    }

    async fn store_mode(&self, mode: GatewayMode) -> StoreResult<()> {
        *self.flag.write().await = Some(mode.as_flag().to_string());
        Ok(())
    }
}
