//! Pool configuration.
//!
//! All options are validated once, when the pool is constructed. A pool
//! never has to re-check them at runtime.

use std::time::Duration;

/// Configuration for a connection pool.
///
/// Obtain one with [`Config::default`] and adjust the fields that matter:
///
/// ```
/// use poolhouse::Config;
/// use std::time::Duration;
///
/// let mut config = Config::default();
/// config.max_size = 25;
/// config.acquire_timeout = Duration::from_secs(2);
/// ```
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Config {
    /// Connections opened eagerly by [`Pool::start`](crate::Pool::start),
    /// and the floor for scale-down. Must be at least 1.
    pub min_size: usize,

    /// Hard cap on concurrently open connections. Must be at least
    /// `min_size`.
    pub max_size: usize,

    /// Default bound on how long an acquire may wait, covering both
    /// queueing and any connection opened on its behalf.
    pub acquire_timeout: Duration,

    /// Idle connections above `min_size` older than this are reclaimed.
    pub idle_lifetime: Duration,

    /// Cadence of the background health pass.
    pub health_check_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_size: 2,
            max_size: 10,
            acquire_timeout: Duration::from_secs(5),
            idle_lifetime: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(5),
        }
    }
}

impl Config {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.min_size == 0 {
            return Err(ConfigError::MinSizeZero);
        }
        if self.max_size < self.min_size {
            return Err(ConfigError::SizeOrdering {
                min_size: self.min_size,
                max_size: self.max_size,
            });
        }
        for (option, value) in [
            ("acquire_timeout", self.acquire_timeout),
            ("idle_lifetime", self.idle_lifetime),
            ("health_check_interval", self.health_check_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration { option });
            }
        }
        Ok(())
    }
}

/// A configuration option failed validation at pool construction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// `min_size` must be at least 1.
    #[error("min_size must be at least 1")]
    MinSizeZero,

    /// `max_size` must be at least `min_size`.
    #[error("max_size ({max_size}) must be at least min_size ({min_size})")]
    SizeOrdering {
        /// The configured floor.
        min_size: usize,
        /// The configured cap.
        max_size: usize,
    },

    /// A duration option must be greater than zero.
    #[error("{option} must be greater than zero")]
    ZeroDuration {
        /// Name of the offending option.
        option: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.min_size <= config.max_size);
    }

    #[test]
    fn rejects_zero_min_size() {
        let mut config = Config::default();
        config.min_size = 0;
        assert_eq!(config.validate(), Err(ConfigError::MinSizeZero));
    }

    #[test]
    fn rejects_inverted_sizes() {
        let mut config = Config::default();
        config.min_size = 8;
        config.max_size = 4;
        assert_eq!(
            config.validate(),
            Err(ConfigError::SizeOrdering {
                min_size: 8,
                max_size: 4
            })
        );
    }

    #[test]
    fn rejects_zero_durations() {
        let mut config = Config::default();
        config.idle_lifetime = Duration::ZERO;
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroDuration {
                option: "idle_lifetime"
            })
        );
    }
}
