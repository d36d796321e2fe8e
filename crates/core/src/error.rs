//! Configuration error model.

use thiserror::Error;

/// Result type returned by every `validate()` in the workspace.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration-level error.
///
/// Raised when a component is constructed with settings it cannot honour
/// (zero capacities, inverted delay bounds, ...). Runtime failures belong to
/// the component crates.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A numeric setting must be strictly positive.
    #[error("{field} must be greater than zero")]
    MustBePositive { field: &'static str },

    /// Two related settings are inconsistent with each other.
    #[error("{field} is inconsistent: {reason}")]
    Inconsistent { field: &'static str, reason: String },

    /// A value could not be parsed from its textual source.
    #[error("invalid value for {key}: {value:?}")]
    Unparsable { key: String, value: String },
}

impl ConfigError {
    pub fn must_be_positive(field: &'static str) -> Self {
        Self::MustBePositive { field }
    }

    pub fn inconsistent(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Inconsistent {
            field,
            reason: reason.into(),
        }
    }

    pub fn unparsable(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Unparsable {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Fail with [`ConfigError::MustBePositive`] when `value` is zero.
pub fn ensure_positive(field: &'static str, value: u64) -> ConfigResult<()> {
    if value == 0 {
        return Err(ConfigError::must_be_positive(field));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_positive_rejects_zero() {
        assert_eq!(
            ensure_positive("workers", 0),
            Err(ConfigError::MustBePositive { field: "workers" })
        );
        assert!(ensure_positive("workers", 1).is_ok());
    }

    #[test]
    fn messages_name_the_field() {
        let err = ConfigError::inconsistent("base_delay", "exceeds max_delay");
        assert_eq!(err.to_string(), "base_delay is inconsistent: exceeds max_delay");

        let err = ConfigError::unparsable("ADPILOT_WORKERS", "many");
        assert_eq!(err.to_string(), "invalid value for ADPILOT_WORKERS: \"many\"");
    }
}
