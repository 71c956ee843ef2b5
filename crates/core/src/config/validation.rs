//! Configuration validation rules.

use crate::config::AppConfig;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid { field: field.into(), reason: reason.into() }
}

fn check_timeout(field: &str, value: u64) -> Result<(), ConfigError> {
    if value < 100 {
        return Err(invalid(field, "must be at least 100ms"));
    }
    if value > 300_000 {
        return Err(invalid(field, "must not exceed 5 minutes (300000ms)"));
    }
    Ok(())
}

impl AppConfig {
    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if:
    /// - a network or rendezvous timeout is under 100ms or over 5 minutes
    /// - `read_buffer_size` is 0 or exceeds 1MB
    /// - `max_preload_sessions` is 0
    /// - `user_agent` is empty
    pub fn validate(&self) -> Result<(), ConfigError> {
        let session = &self.session;
        check_timeout("session.connect_timeout_ms", session.connect_timeout_ms)?;
        check_timeout("session.read_timeout_ms", session.read_timeout_ms)?;
        check_timeout("session.rendezvous_timeout_ms", session.rendezvous_timeout_ms)?;

        if session.read_buffer_size == 0 {
            return Err(invalid("session.read_buffer_size", "must be greater than 0"));
        }
        if session.read_buffer_size > 1024 * 1024 {
            return Err(invalid("session.read_buffer_size", "must not exceed 1MB"));
        }

        if self.engine.max_preload_sessions == 0 {
            return Err(invalid("engine.max_preload_sessions", "must be greater than 0"));
        }

        if self.user_agent.is_empty() {
            return Err(invalid("user_agent", "must not be empty"));
        }

        if session.account_scoped && self.account.is_empty() {
            tracing::debug!("account_scoped is set but no account is configured; keys are shared");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, SessionConfig};

    fn with_session(session: SessionConfig) -> AppConfig {
        AppConfig { session, ..Default::default() }
    }

    #[test]
    fn test_validate_default_config() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_connect_timeout_too_small() {
        let config = with_session(SessionConfig { connect_timeout_ms: 50, ..Default::default() });
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "session.connect_timeout_ms"));
    }

    #[test]
    fn test_validate_read_timeout_exceeds_limit() {
        let config = with_session(SessionConfig { read_timeout_ms: 301_000, ..Default::default() });
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "session.read_timeout_ms"));
    }

    #[test]
    fn test_validate_buffer_size_zero() {
        let config = with_session(SessionConfig { read_buffer_size: 0, ..Default::default() });
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "session.read_buffer_size"));
    }

    #[test]
    fn test_validate_zero_preload_capacity() {
        let config = AppConfig {
            engine: EngineConfig { max_preload_sessions: 0, ..Default::default() },
            ..Default::default()
        };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "engine.max_preload_sessions"));
    }

    #[test]
    fn test_validate_empty_user_agent() {
        let config = AppConfig { user_agent: String::new(), ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "user_agent"));
    }

    #[test]
    fn test_validate_edge_values() {
        let config = with_session(SessionConfig {
            connect_timeout_ms: 100,
            read_timeout_ms: 300_000,
            read_buffer_size: 1,
            ..Default::default()
        });
        assert!(config.validate().is_ok());
    }
}
