//! Engine configuration

use std::env;
use std::str::FromStr;
use std::time::Duration;

use ticketsync_shared::UserId;

use crate::connection::ReconnectPolicy;

/// Engine configuration, every value overridable from the environment
#[derive(Debug, Clone)]
pub struct EngineConfig {
    // Identity
    pub agent_name: String,
    pub agent_id: Option<UserId>,

    // Sending
    pub send_ack_timeout: Duration,
    pub reconciliation_window: Duration,

    // Typing
    pub typing_idle_window: Duration,
    pub remote_typing_ttl: Duration,
    pub typing_sweep_interval: Duration,

    // Polling
    pub poll_interval: Duration,

    // Connection
    pub reconnect: ReconnectPolicy,

    // Event bus
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            agent_name: "Agent".to_string(),
            agent_id: None,
            send_ack_timeout: Duration::from_secs(10),
            reconciliation_window: Duration::from_secs(30),
            typing_idle_window: Duration::from_secs(3),
            remote_typing_ttl: Duration::from_secs(5),
            typing_sweep_interval: Duration::from_secs(1),
            poll_interval: Duration::from_secs(5),
            reconnect: ReconnectPolicy::default(),
            event_buffer: 256,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables
    ///
    /// Unset variables fall back to [`EngineConfig::default`]; variables that
    /// are set but unparseable are reported instead of silently ignored.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            agent_name: env::var("TICKETSYNC_AGENT_NAME").unwrap_or(defaults.agent_name),
            agent_id: env::var("TICKETSYNC_AGENT_ID").ok().map(UserId::new),

            send_ack_timeout: env_millis(
                "TICKETSYNC_SEND_ACK_TIMEOUT_MS",
                defaults.send_ack_timeout,
            )?,
            reconciliation_window: env_millis(
                "TICKETSYNC_RECONCILIATION_WINDOW_MS",
                defaults.reconciliation_window,
            )?,

            typing_idle_window: env_millis(
                "TICKETSYNC_TYPING_IDLE_MS",
                defaults.typing_idle_window,
            )?,
            remote_typing_ttl: env_millis(
                "TICKETSYNC_REMOTE_TYPING_TTL_MS",
                defaults.remote_typing_ttl,
            )?,
            typing_sweep_interval: env_millis(
                "TICKETSYNC_TYPING_SWEEP_MS",
                defaults.typing_sweep_interval,
            )?,

            poll_interval: env_millis("TICKETSYNC_POLL_INTERVAL_MS", defaults.poll_interval)?,

            reconnect: ReconnectPolicy {
                base_delay: env_millis(
                    "TICKETSYNC_RECONNECT_BASE_MS",
                    defaults.reconnect.base_delay,
                )?,
                max_delay: env_millis("TICKETSYNC_RECONNECT_MAX_MS", defaults.reconnect.max_delay)?,
                max_attempts: env_parse(
                    "TICKETSYNC_RECONNECT_MAX_ATTEMPTS",
                    defaults.reconnect.max_attempts,
                )?,
            },

            event_buffer: env_parse("TICKETSYNC_EVENT_BUFFER", defaults.event_buffer)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would busy-loop timers or break the backoff cap
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("send_ack_timeout", self.send_ack_timeout),
            ("typing_idle_window", self.typing_idle_window),
            ("remote_typing_ttl", self.remote_typing_ttl),
            ("typing_sweep_interval", self.typing_sweep_interval),
            ("poll_interval", self.poll_interval),
            ("reconnect.base_delay", self.reconnect.base_delay),
        ];

        for (name, value) in non_zero {
            if value.is_zero() {
                return Err(ConfigError::OutOfRange(name, "must be greater than zero"));
            }
        }

        if self.reconnect.max_delay < self.reconnect.base_delay {
            return Err(ConfigError::OutOfRange(
                "reconnect.max_delay",
                "must not be below reconnect.base_delay",
            ));
        }

        if self.event_buffer == 0 {
            return Err(ConfigError::OutOfRange("event_buffer", "must be greater than zero"));
        }

        Ok(())
    }
}

fn env_parse<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        Err(_) => Ok(default),
    }
}

fn env_millis(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    env_parse(key, default_ms).map(Duration::from_millis)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("{0} {1}")]
    OutOfRange(&'static str, &'static str),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Allow unwrap() in tests for cleaner test code
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.typing_idle_window, Duration::from_secs(3));
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let config = EngineConfig {
            poll_interval: Duration::ZERO,
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange("poll_interval", _))
        ));
    }

    #[test]
    fn test_max_delay_below_base_rejected() {
        let mut config = EngineConfig::default();
        config.reconnect.base_delay = Duration::from_secs(10);
        config.reconnect.max_delay = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_parse_reports_garbage() {
        // Unique key so parallel tests never observe it
        std::env::set_var("TICKETSYNC_TEST_GARBAGE_MS", "soon");
        let result = env_millis("TICKETSYNC_TEST_GARBAGE_MS", Duration::from_secs(1));
        std::env::remove_var("TICKETSYNC_TEST_GARBAGE_MS");

        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_env_parse_falls_back_when_unset() {
        let value = env_parse("TICKETSYNC_TEST_UNSET_VALUE", 42u32).unwrap();
        assert_eq!(value, 42);
    }
}
