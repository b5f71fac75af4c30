//! Service configuration.

use thiserror::Error;

/// A configuration value outside its accepted range.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

/// Tunables for [`crate::IdentityService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Longest accepted email or phone number, in bytes.
    pub max_field_len: usize,
}

impl ServiceConfig {
    /// Longest address RFC 5321 allows.
    pub const DEFAULT_MAX_FIELD_LEN: usize = 320;

    /// Reject limits that would refuse every request.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.max_field_len == 0 {
            return Err(ConfigError("max_field_len must be greater than 0".to_string()));
        }
        Ok(self)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_field_len: Self::DEFAULT_MAX_FIELD_LEN,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_length_limit_is_rejected() {
        assert!(ServiceConfig { max_field_len: 0 }.validate().is_err());
        assert_eq!(
            ServiceConfig::default().validate().unwrap().max_field_len,
            320
        );
    }
}
