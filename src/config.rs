//! Runtime settings loaded from `LESSONBOOK_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::model::{DAY_MS, HOUR_MS, MINUTE_MS, Ms};

const DEFAULT_PASSWORD: &str = "lessonbook";

// Upper bounds keep every derived deadline far from i64 overflow.
const MAX_HOLD_MS: Ms = DAY_MS;
const MAX_REFUND_WINDOW_MS: Ms = 365 * DAY_MS;
const MAX_BACKOFF_MS: Ms = DAY_MS;
const MAX_RETENTION_MS: Ms = 3650 * DAY_MS;

/// Booking rules that depend on wall-clock distances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingPolicy {
    /// How long a HOLD reserves its slot.
    pub hold_ms: Ms,
    /// Cancelling a confirmed booking more than this long before the lesson returns the lesson.
    pub refund_window_ms: Ms,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            hold_ms: 10 * MINUTE_MS,
            refund_window_ms: 24 * HOUR_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboxPolicy {
    pub batch_size: usize,
    pub max_retries: u32,
    pub base_backoff_ms: Ms,
    pub max_backoff_ms: Ms,
}

impl Default for OutboxPolicy {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_retries: 5,
            base_backoff_ms: 30_000,
            max_backoff_ms: 300_000,
        }
    }
}

impl OutboxPolicy {
    /// Delay before a FAILED event with `retries` attempts may be retried.
    pub fn backoff_ms(&self, retries: u32) -> Ms {
        let exponent = retries.max(1) - 1;
        let factor = 1i64.checked_shl(exponent.min(62)).unwrap_or(i64::MAX);
        self.base_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms)
    }
}

/// Everything an engine needs to decide transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub booking: BookingPolicy,
    pub outbox: OutboxPolicy,
    /// PROCESSED outbox rows older than this are dropped at compaction.
    pub outbox_retention_ms: Ms,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            booking: BookingPolicy::default(),
            outbox: OutboxPolicy::default(),
            outbox_retention_ms: 7 * DAY_MS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub environment: String,
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    /// Login name that maps to the operator (admin) actor.
    pub operator_user: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub log_level: tracing::Level,
    pub worker_interval: Duration,
    pub policy: Policy,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let hold_minutes: i64 = parse_or(&lookup, "LESSONBOOK_BOOKING_HOLD_MINUTES", 10)?;
        let refund_hours: i64 = parse_or(&lookup, "LESSONBOOK_REFUND_WINDOW_HOURS", 24)?;
        let base_backoff_secs: i64 = parse_or(&lookup, "LESSONBOOK_OUTBOX_BASE_BACKOFF_SECONDS", 30)?;
        let max_backoff_secs: i64 = parse_or(&lookup, "LESSONBOOK_OUTBOX_MAX_BACKOFF_SECONDS", 300)?;
        let retention_days: i64 = parse_or(&lookup, "LESSONBOOK_OUTBOX_RETENTION_DAYS", 7)?;
        let worker_secs: u64 = parse_or(&lookup, "LESSONBOOK_WORKER_INTERVAL_SECONDS", 5)?;

        let config = Self {
            environment: lookup("LESSONBOOK_ENV").unwrap_or_else(|| "development".into()),
            bind: lookup("LESSONBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&lookup, "LESSONBOOK_PORT", 5433)?,
            data_dir: PathBuf::from(lookup("LESSONBOOK_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: lookup("LESSONBOOK_PASSWORD").unwrap_or_else(|| DEFAULT_PASSWORD.into()),
            operator_user: lookup("LESSONBOOK_OPERATOR_USER").unwrap_or_else(|| "admin".into()),
            max_connections: parse_or(&lookup, "LESSONBOOK_MAX_CONNECTIONS", 256)?,
            compact_threshold: parse_or(&lookup, "LESSONBOOK_COMPACT_THRESHOLD", 1000)?,
            metrics_port: parse_opt(&lookup, "LESSONBOOK_METRICS_PORT")?,
            tls_cert: lookup("LESSONBOOK_TLS_CERT"),
            tls_key: lookup("LESSONBOOK_TLS_KEY"),
            log_level: parse_or(&lookup, "LESSONBOOK_LOG_LEVEL", tracing::Level::INFO)?,
            worker_interval: Duration::from_secs(worker_secs),
            policy: Policy {
                booking: BookingPolicy {
                    hold_ms: hold_minutes.saturating_mul(MINUTE_MS),
                    refund_window_ms: refund_hours.saturating_mul(HOUR_MS),
                },
                outbox: OutboxPolicy {
                    batch_size: parse_or(&lookup, "LESSONBOOK_OUTBOX_BATCH_SIZE", 100)?,
                    max_retries: parse_or(&lookup, "LESSONBOOK_OUTBOX_MAX_RETRIES", 5)?,
                    base_backoff_ms: base_backoff_secs.saturating_mul(1000),
                    max_backoff_ms: max_backoff_secs.saturating_mul(1000),
                },
                outbox_retention_ms: retention_days.saturating_mul(DAY_MS),
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn is_production(&self) -> bool {
        matches!(self.environment.trim().to_ascii_lowercase().as_str(), "production" | "prod")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let booking = &self.policy.booking;
        let outbox = &self.policy.outbox;
        if booking.hold_ms <= 0 || booking.hold_ms > MAX_HOLD_MS {
            return Err(ConfigError::Invalid(
                "LESSONBOOK_BOOKING_HOLD_MINUTES",
                "must be between 1 minute and 1 day".into(),
            ));
        }
        if !(0..=MAX_REFUND_WINDOW_MS).contains(&booking.refund_window_ms) {
            return Err(ConfigError::Invalid(
                "LESSONBOOK_REFUND_WINDOW_HOURS",
                "must be between 0 and 8760 hours".into(),
            ));
        }
        if !(0..=MAX_RETENTION_MS).contains(&self.policy.outbox_retention_ms) {
            return Err(ConfigError::Invalid(
                "LESSONBOOK_OUTBOX_RETENTION_DAYS",
                "must be between 0 and 3650 days".into(),
            ));
        }
        if outbox.batch_size == 0 {
            return Err(ConfigError::Invalid("LESSONBOOK_OUTBOX_BATCH_SIZE", "must be positive".into()));
        }
        if outbox.base_backoff_ms <= 0
            || outbox.max_backoff_ms < outbox.base_backoff_ms
            || outbox.max_backoff_ms > MAX_BACKOFF_MS
        {
            return Err(ConfigError::Invalid(
                "LESSONBOOK_OUTBOX_MAX_BACKOFF_SECONDS",
                "must be at least the base backoff, which must be positive, and at most 1 day".into(),
            ));
        }
        if self.worker_interval.is_zero() {
            return Err(ConfigError::Invalid("LESSONBOOK_WORKER_INTERVAL_SECONDS", "must be positive".into()));
        }
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            return Err(ConfigError::Invalid(
                "LESSONBOOK_TLS_CERT",
                "both LESSONBOOK_TLS_CERT and LESSONBOOK_TLS_KEY must be set, or neither".into(),
            ));
        }
        if self.is_production() {
            let pw = self.password.trim().to_ascii_lowercase();
            if pw == DEFAULT_PASSWORD || pw.starts_with("change-me") {
                return Err(ConfigError::Invalid(
                    "LESSONBOOK_PASSWORD",
                    "placeholder password is not allowed in production".into(),
                ));
            }
        }
        Ok(())
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    Ok(parse_opt(lookup, key)?.unwrap_or(default))
}

fn parse_opt<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(key, format!("cannot parse {raw:?}"))),
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Invalid(&'static str, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid(key, msg) => write!(f, "invalid {key}: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config.port, 5433);
        assert_eq!(config.operator_user, "admin");
        assert_eq!(config.policy.booking.hold_ms, 10 * MINUTE_MS);
        assert_eq!(config.policy.booking.refund_window_ms, 24 * HOUR_MS);
        assert_eq!(config.policy.outbox.max_retries, 5);
        assert_eq!(config.log_level, tracing::Level::INFO);
        assert!(config.metrics_port.is_none());
    }

    #[test]
    fn overrides() {
        let config = from_pairs(&[
            ("LESSONBOOK_BOOKING_HOLD_MINUTES", "15"),
            ("LESSONBOOK_REFUND_WINDOW_HOURS", "48"),
            ("LESSONBOOK_METRICS_PORT", "9100"),
            ("LESSONBOOK_LOG_LEVEL", "debug"),
        ])
        .unwrap();
        assert_eq!(config.policy.booking.hold_ms, 15 * MINUTE_MS);
        assert_eq!(config.policy.booking.refund_window_ms, 48 * HOUR_MS);
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.log_level, tracing::Level::DEBUG);
    }

    #[test]
    fn garbage_is_rejected() {
        let err = from_pairs(&[("LESSONBOOK_PORT", "eighty")]).unwrap_err();
        assert!(err.to_string().contains("LESSONBOOK_PORT"));
    }

    #[test]
    fn zero_hold_rejected() {
        tokio_test::assert_err!(from_pairs(&[("LESSONBOOK_BOOKING_HOLD_MINUTES", "0")]));
        tokio_test::assert_ok!(from_pairs(&[("LESSONBOOK_BOOKING_HOLD_MINUTES", "1")]));
    }

    #[test]
    fn durations_are_bounded() {
        tokio_test::assert_ok!(from_pairs(&[("LESSONBOOK_BOOKING_HOLD_MINUTES", "1440")]));
        tokio_test::assert_err!(from_pairs(&[("LESSONBOOK_BOOKING_HOLD_MINUTES", "1441")]));
        tokio_test::assert_err!(from_pairs(&[(
            "LESSONBOOK_BOOKING_HOLD_MINUTES",
            "9223372036854775807"
        )]));
        tokio_test::assert_ok!(from_pairs(&[("LESSONBOOK_REFUND_WINDOW_HOURS", "0")]));
        tokio_test::assert_err!(from_pairs(&[("LESSONBOOK_REFUND_WINDOW_HOURS", "-1")]));
        tokio_test::assert_err!(from_pairs(&[(
            "LESSONBOOK_REFUND_WINDOW_HOURS",
            "9223372036854775807"
        )]));
        tokio_test::assert_err!(from_pairs(&[("LESSONBOOK_OUTBOX_RETENTION_DAYS", "-3")]));
        tokio_test::assert_err!(from_pairs(&[("LESSONBOOK_OUTBOX_RETENTION_DAYS", "100000000000")]));
        tokio_test::assert_err!(from_pairs(&[("LESSONBOOK_OUTBOX_MAX_BACKOFF_SECONDS", "86401")]));
    }

    #[test]
    fn half_tls_rejected() {
        let err = from_pairs(&[("LESSONBOOK_TLS_CERT", "/tmp/cert.pem")]).unwrap_err();
        assert!(err.to_string().contains("or neither"));
    }

    #[test]
    fn production_requires_real_password() {
        tokio_test::assert_err!(from_pairs(&[("LESSONBOOK_ENV", "production")]));
        tokio_test::assert_err!(from_pairs(&[("LESSONBOOK_ENV", "prod"), ("LESSONBOOK_PASSWORD", "change-me-now")]));
        tokio_test::assert_ok!(from_pairs(&[("LESSONBOOK_ENV", "production"), ("LESSONBOOK_PASSWORD", "s3cret-value")]));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = OutboxPolicy::default();
        assert_eq!(policy.backoff_ms(0), 30_000);
        assert_eq!(policy.backoff_ms(1), 30_000);
        assert_eq!(policy.backoff_ms(2), 60_000);
        assert_eq!(policy.backoff_ms(3), 120_000);
        assert_eq!(policy.backoff_ms(5), 300_000);
        assert_eq!(policy.backoff_ms(40), 300_000);
    }
}
