use std::fmt;

use serde::{Deserialize, Serialize};

const SLEEP_FLAG: &str = "sleep";
const ACTIVE_FLAG: &str = "active";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Process-wide gateway mode persisted next to the durable log.
pub enum GatewayMode {
    #[default]
    Active,
    Sleep,
}

impl GatewayMode {
    /// Interprets the external flag: `"sleep"` is sleep, anything else is active.
    pub fn from_flag(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some(SLEEP_FLAG) => Self::Sleep,
            _ => Self::Active,
        }
    }

    pub fn as_flag(self) -> &'static str {
        match self {
            Self::Active => ACTIVE_FLAG,
            Self::Sleep => SLEEP_FLAG,
        }
    }

    pub fn is_sleep(self) -> bool {
        matches!(self, Self::Sleep)
    }
}

impl fmt::Display for GatewayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_flag())
    }
}

#[cfg(test)]
mod tests {
    use super::GatewayMode;

    #[test]
    fn unit_only_exact_sleep_flag_means_sleep() {
        assert_eq!(GatewayMode::from_flag(Some("sleep")), GatewayMode::Sleep);
        assert_eq!(GatewayMode::from_flag(Some(" sleep\n")), GatewayMode::Sleep);
        assert_eq!(GatewayMode::from_flag(Some("SLEEP")), GatewayMode::Active);
        assert_eq!(GatewayMode::from_flag(Some("paused")), GatewayMode::Active);
        assert_eq!(GatewayMode::from_flag(None), GatewayMode::Active);
    }
}
