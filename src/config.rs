use std::time::Duration;

use thiserror::Error as ThisError;

use crate::constants::MIN_UNPRIVILEGED_INTERVAL;

#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("ttl must be between 1 and 255, got {0}")]
    InvalidTtl(u32),
    #[error("max request count must be positive when set")]
    ZeroMaxCount,
    #[error("pacing interval must be positive")]
    ZeroInterval,
    #[error("pacing interval {got:?} is below the unprivileged minimum of {min:?}")]
    IntervalBelowFloor { got: Duration, min: Duration },
    #[error("request timeout must be positive")]
    ZeroTimeout,
    #[error("deadline must be positive when set")]
    ZeroDeadline,
}

/// Settings of a ping session.
///
/// `interval` paces consecutive echo requests, `timeout` bounds the wait for
/// each reply until a first reply has been observed (after which the engine
/// waits twice the largest round-trip time seen so far), `deadline` caps the
/// whole run and `max_count` caps the number of requests. `privileged`
/// selects between a raw ICMP transport and an unprivileged datagram one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub ttl: u32,
    pub max_count: Option<u64>,
    pub interval: Duration,
    pub timeout: Duration,
    pub deadline: Option<Duration>,
    pub privileged: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: 64,
            max_count: None,
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(10),
            deadline: None,
            privileged: false,
        }
    }
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::new()
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl == 0 || self.ttl > 255 {
            return Err(ConfigError::InvalidTtl(self.ttl));
        }
        if self.max_count == Some(0) {
            return Err(ConfigError::ZeroMaxCount);
        }
        if self.interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        if !self.privileged && self.interval < MIN_UNPRIVILEGED_INTERVAL {
            return Err(ConfigError::IntervalBelowFloor {
                got: self.interval,
                min: MIN_UNPRIVILEGED_INTERVAL,
            });
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.deadline.is_some_and(|deadline| deadline.is_zero()) {
            return Err(ConfigError::ZeroDeadline);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl Default for SessionConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SessionConfig::default(),
        }
    }

    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.config.ttl = ttl;
        self
    }

    pub fn with_max_count(mut self, max_count: u64) -> Self {
        self.config.max_count = Some(max_count);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.config.deadline = Some(deadline);
        self
    }

    pub fn with_privileged(mut self, privileged: bool) -> Self {
        self.config.privileged = privileged;
        self
    }

    pub fn build(self) -> Result<SessionConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(SessionConfig::default().validate().is_ok());
    }

    #[test]
    fn builder_applies_settings() {
        let config = SessionConfig::builder()
            .with_ttl(32)
            .with_max_count(4)
            .with_interval(Duration::from_millis(250))
            .with_timeout(Duration::from_secs(2))
            .with_deadline(Duration::from_secs(30))
            .build()
            .unwrap();
        assert_eq!(config.ttl, 32);
        assert_eq!(config.max_count, Some(4));
        assert_eq!(config.interval, Duration::from_millis(250));
        assert_eq!(config.timeout, Duration::from_secs(2));
        assert_eq!(config.deadline, Some(Duration::from_secs(30)));
        assert!(!config.privileged);
    }

    #[test]
    fn rejects_out_of_range_ttl() {
        let err = SessionConfig::builder().with_ttl(0).build().unwrap_err();
        assert_eq!(err, ConfigError::InvalidTtl(0));
        let err = SessionConfig::builder().with_ttl(256).build().unwrap_err();
        assert_eq!(err, ConfigError::InvalidTtl(256));
    }

    #[test]
    fn rejects_zero_max_count() {
        let err = SessionConfig::builder()
            .with_max_count(0)
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::ZeroMaxCount);
    }

    #[test]
    fn rejects_zero_interval() {
        let err = SessionConfig::builder()
            .with_privileged(true)
            .with_interval(Duration::ZERO)
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::ZeroInterval);
    }

    #[test]
    fn unprivileged_interval_has_a_floor() {
        let err = SessionConfig::builder()
            .with_interval(Duration::from_millis(10))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::IntervalBelowFloor { .. }));

        // A privileged session may pace faster.
        assert!(SessionConfig::builder()
            .with_privileged(true)
            .with_interval(Duration::from_millis(10))
            .build()
            .is_ok());
    }

    #[test]
    fn rejects_zero_timeout_and_deadline() {
        let err = SessionConfig::builder()
            .with_timeout(Duration::ZERO)
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::ZeroTimeout);

        let err = SessionConfig::builder()
            .with_deadline(Duration::ZERO)
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::ZeroDeadline);
    }
}
