use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelRefParseError {
    #[error("missing model identifier")]
    MissingModel,
    #[error("missing provider in '{0}'; expected <provider>/<model>")]
    MissingProvider(String),
}

/// Provider-qualified model identifier handed to the session's `set_model`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelRef {
    pub provider: String,
    pub model: String,
}

impl ModelRef {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }

    /// Parses `provider/model`. The model part may itself contain slashes
    /// (`openrouter/openai/gpt-4o-mini`).
    pub fn parse(input: &str) -> Result<Self, ModelRefParseError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ModelRefParseError::MissingModel);
        }
        let Some((provider, model)) = trimmed.split_once('/') else {
            return Err(ModelRefParseError::MissingProvider(trimmed.to_string()));
        };
        let provider = provider.trim();
        let model = model.trim();
        if provider.is_empty() {
            return Err(ModelRefParseError::MissingProvider(trimmed.to_string()));
        }
        if model.is_empty() {
            return Err(ModelRefParseError::MissingModel);
        }
        Ok(Self::new(provider.to_ascii_lowercase(), model))
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

impl FromStr for ModelRef {
    type Err = ModelRefParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

#[cfg(test)]
mod tests {
    use super::{ModelRef, ModelRefParseError};

    #[test]
    fn parses_provider_and_model() {
        let parsed = ModelRef::parse("anthropic/claude-sonnet-4").expect("valid model ref");
        assert_eq!(parsed.provider, "anthropic");
        assert_eq!(parsed.model, "claude-sonnet-4");
        assert_eq!(parsed.to_string(), "anthropic/claude-sonnet-4");
    }

    #[test]
    fn keeps_nested_model_path() {
        let parsed = ModelRef::parse("OpenRouter/openai/gpt-4o-mini").expect("valid model ref");
        assert_eq!(parsed.provider, "openrouter");
        assert_eq!(parsed.model, "openai/gpt-4o-mini");
    }

    #[test]
    fn rejects_missing_provider_or_model() {
        assert_eq!(
            ModelRef::parse("gpt-4o-mini"),
            Err(ModelRefParseError::MissingProvider("gpt-4o-mini".to_string()))
        );
        assert_eq!(
            ModelRef::parse("openai/ "),
            Err(ModelRefParseError::MissingModel)
        );
        assert_eq!(ModelRef::parse("  "), Err(ModelRefParseError::MissingModel));
    }
}
