//! Session Coordinator configuration.
//!
//! Configuration is loaded from environment variables. Numeric settings
//! that are present but unparseable are rejected rather than defaulted.

use common::config::ObservabilityConfig;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default signaling (WebSocket) bind address.
pub const DEFAULT_SIGNALING_BIND_ADDRESS: &str = "0.0.0.0:3000";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default IP the media engine listens on for RTC traffic.
pub const DEFAULT_LISTEN_IP: &str = "127.0.0.1";

/// Default RTC port range.
pub const DEFAULT_RTC_MIN_PORT: u16 = 10000;
pub const DEFAULT_RTC_MAX_PORT: u16 = 10100;

/// Default bitrate limits (bits per second).
pub const DEFAULT_MAX_INCOMING_BITRATE: u32 = 1_500_000;
pub const DEFAULT_INITIAL_OUTGOING_BITRATE: u32 = 1_000_000;

/// Default bound on any single media engine call.
pub const DEFAULT_ENGINE_CALL_TIMEOUT_MS: u64 = 10_000;

/// Default HLS output location and rolling window.
pub const DEFAULT_HLS_OUTPUT_DIR: &str = "public/hls";
pub const DEFAULT_HLS_SEGMENT_SECONDS: u32 = 2;
pub const DEFAULT_HLS_LIST_SIZE: u32 = 3;

/// Default transcoder binary.
pub const DEFAULT_FFMPEG_PATH: &str = "ffmpeg";

/// Default local port the transcoder receives RTP on (RTCP on the next port).
pub const DEFAULT_EGRESS_RTP_PORT: u16 = 5004;

/// Default egress retry policy.
pub const DEFAULT_EGRESS_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_EGRESS_BACKOFF_BASE_MS: u64 = 1_000;
pub const DEFAULT_EGRESS_BACKOFF_MAX_MS: u64 = 30_000;

/// Time the transcoder gets to exit after `q` before it is killed.
pub const EGRESS_STOP_GRACE: Duration = Duration::from_secs(5);

/// Default delay between a media worker death and process exit.
pub const DEFAULT_WORKER_DEATH_EXIT_DELAY_MS: u64 = 2_000;

/// Default SC instance ID prefix.
pub const DEFAULT_SC_ID_PREFIX: &str = "sc";

/// Which sessions receive `new-producer` / `producer-closed` notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotificationScope {
    /// Every live session except the producer's owner.
    #[default]
    All,
    /// Only the other members of the owner's room.
    Room,
}

impl NotificationScope {
    /// Returns the scope as written in configuration.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            NotificationScope::All => "all",
            NotificationScope::Room => "room",
        }
    }
}

impl FromStr for NotificationScope {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(NotificationScope::All),
            "room" => Ok(NotificationScope::Room),
            other => Err(ConfigError::InvalidValue(format!(
                "SC_NOTIFICATION_SCOPE must be 'all' or 'room', got '{other}'"
            ))),
        }
    }
}

/// Media engine settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// IP the engine binds RTC sockets to.
    pub listen_ip: IpAddr,
    /// Address advertised in ICE candidates (required when `listen_ip` is unspecified).
    pub announced_address: Option<String>,
    /// Inclusive RTC port range.
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    /// Per-transport incoming bitrate cap.
    pub max_incoming_bitrate: u32,
    /// Initial outgoing bitrate estimate of WebRTC transports.
    pub initial_outgoing_bitrate: u32,
    /// Upper bound on any single engine call.
    pub call_timeout: Duration,
}

/// Egress bridge settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EgressConfig {
    /// Directory receiving `stream.m3u8` and its segments.
    pub output_dir: PathBuf,
    pub segment_seconds: u32,
    /// Number of segments kept in the playlist.
    pub list_size: u32,
    pub ffmpeg_path: PathBuf,
    /// Local port the transcoder reads RTP from.
    pub rtp_port: u16,
    /// Consecutive failures before a session is abandoned.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub stop_grace: Duration,
}

impl EgressConfig {
    /// Delay before restarting after the `attempt`-th consecutive failure
    /// (1-based): `backoff_base * 2^(attempt-1)`, capped at `backoff_max`.
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.backoff_base
            .checked_mul(1u32 << exponent)
            .map_or(self.backoff_max, |d| d.min(self.backoff_max))
    }

    /// Full path of the live playlist.
    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.output_dir.join(crate::egress::MANIFEST_FILE_NAME)
    }
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(DEFAULT_HLS_OUTPUT_DIR),
            segment_seconds: DEFAULT_HLS_SEGMENT_SECONDS,
            list_size: DEFAULT_HLS_LIST_SIZE,
            ffmpeg_path: PathBuf::from(DEFAULT_FFMPEG_PATH),
            rtp_port: DEFAULT_EGRESS_RTP_PORT,
            max_attempts: DEFAULT_EGRESS_MAX_ATTEMPTS,
            backoff_base: Duration::from_millis(DEFAULT_EGRESS_BACKOFF_BASE_MS),
            backoff_max: Duration::from_millis(DEFAULT_EGRESS_BACKOFF_MAX_MS),
            stop_grace: EGRESS_STOP_GRACE,
        }
    }
}

/// Session Coordinator configuration.
#[derive(Clone, PartialEq, Eq)]
pub struct Config {
    /// Unique identifier for this SC instance.
    pub sc_id: String,

    /// WebSocket signaling bind address (default: "0.0.0.0:3000").
    pub signaling_bind_address: String,

    /// Health endpoint bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    pub engine: EngineConfig,

    pub notification_scope: NotificationScope,

    pub egress: EgressConfig,

    /// Delay between a media worker death and process exit.
    pub worker_death_exit_delay: Duration,

    pub observability: ObservabilityConfig,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("sc_id", &self.sc_id)
            .field("signaling_bind_address", &self.signaling_bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("engine", &self.engine)
            .field("notification_scope", &self.notification_scope.as_str())
            .field("egress", &self.egress)
            .field("worker_death_exit_delay", &self.worker_death_exit_delay)
            .field("observability", &self.observability)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Parse an optional variable, falling back to `default` only when absent.
fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    match vars.get(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(format!("{name}='{raw}': {e}"))),
    }
}

fn positive<T: PartialOrd + Default + fmt::Display>(name: &str, value: T) -> Result<T, ConfigError> {
    if value > T::default() {
        Ok(value)
    } else {
        Err(ConfigError::InvalidValue(format!(
            "{name} must be greater than zero, got {value}"
        )))
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is present but invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is present but invalid.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let signaling_bind_address = vars
            .get("SC_SIGNALING_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SIGNALING_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("SC_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let listen_ip: IpAddr = vars
            .get("SC_LISTEN_IP")
            .map_or(DEFAULT_LISTEN_IP, String::as_str)
            .parse()
            .map_err(|e| ConfigError::InvalidValue(format!("SC_LISTEN_IP: {e}")))?;

        let announced_address = vars
            .get("SC_ANNOUNCED_ADDRESS")
            .filter(|s| !s.trim().is_empty())
            .cloned();

        // Clients cannot reach a wildcard address
        if listen_ip.is_unspecified() && announced_address.is_none() {
            return Err(ConfigError::MissingEnvVar(
                "SC_ANNOUNCED_ADDRESS".to_string(),
            ));
        }

        let rtc_min_port = parse_var(vars, "SC_RTC_MIN_PORT", DEFAULT_RTC_MIN_PORT)?;
        let rtc_max_port = parse_var(vars, "SC_RTC_MAX_PORT", DEFAULT_RTC_MAX_PORT)?;
        if rtc_min_port > rtc_max_port {
            return Err(ConfigError::InvalidValue(format!(
                "SC_RTC_MIN_PORT ({rtc_min_port}) must not exceed SC_RTC_MAX_PORT ({rtc_max_port})"
            )));
        }

        let max_incoming_bitrate =
            parse_var(vars, "SC_MAX_INCOMING_BITRATE", DEFAULT_MAX_INCOMING_BITRATE)?;
        let initial_outgoing_bitrate = parse_var(
            vars,
            "SC_INITIAL_OUTGOING_BITRATE",
            DEFAULT_INITIAL_OUTGOING_BITRATE,
        )?;

        let call_timeout_ms = positive(
            "SC_ENGINE_CALL_TIMEOUT_MS",
            parse_var(
                vars,
                "SC_ENGINE_CALL_TIMEOUT_MS",
                DEFAULT_ENGINE_CALL_TIMEOUT_MS,
            )?,
        )?;

        let notification_scope = vars
            .get("SC_NOTIFICATION_SCOPE")
            .map(|s| s.parse())
            .transpose()?
            .unwrap_or_default();

        let egress = Self::egress_from_vars(vars)?;

        let worker_death_exit_delay = Duration::from_millis(parse_var(
            vars,
            "SC_WORKER_DEATH_EXIT_DELAY_MS",
            DEFAULT_WORKER_DEATH_EXIT_DELAY_MS,
        )?);

        // Generate SC instance ID
        let sc_id = vars.get("SC_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().simple().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_SC_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            sc_id,
            signaling_bind_address,
            health_bind_address,
            engine: EngineConfig {
                listen_ip,
                announced_address,
                rtc_min_port,
                rtc_max_port,
                max_incoming_bitrate,
                initial_outgoing_bitrate,
                call_timeout: Duration::from_millis(call_timeout_ms),
            },
            notification_scope,
            egress,
            worker_death_exit_delay,
            observability: ObservabilityConfig::from_vars(vars),
        })
    }

    fn egress_from_vars(vars: &HashMap<String, String>) -> Result<EgressConfig, ConfigError> {
        let output_dir = vars
            .get("SC_HLS_OUTPUT_DIR")
            .map_or_else(|| PathBuf::from(DEFAULT_HLS_OUTPUT_DIR), PathBuf::from);

        let ffmpeg_path = vars
            .get("SC_FFMPEG_PATH")
            .map_or_else(|| PathBuf::from(DEFAULT_FFMPEG_PATH), PathBuf::from);

        let segment_seconds = positive(
            "SC_HLS_SEGMENT_SECONDS",
            parse_var(vars, "SC_HLS_SEGMENT_SECONDS", DEFAULT_HLS_SEGMENT_SECONDS)?,
        )?;
        let list_size = positive(
            "SC_HLS_LIST_SIZE",
            parse_var(vars, "SC_HLS_LIST_SIZE", DEFAULT_HLS_LIST_SIZE)?,
        )?;

        let rtp_port: u16 = parse_var(vars, "SC_EGRESS_RTP_PORT", DEFAULT_EGRESS_RTP_PORT)?;
        // RTCP goes to rtp_port + 1
        if rtp_port == 0 || rtp_port == u16::MAX {
            return Err(ConfigError::InvalidValue(format!(
                "SC_EGRESS_RTP_PORT must be between 1 and 65534, got {rtp_port}"
            )));
        }

        let max_attempts = positive(
            "SC_EGRESS_MAX_ATTEMPTS",
            parse_var(vars, "SC_EGRESS_MAX_ATTEMPTS", DEFAULT_EGRESS_MAX_ATTEMPTS)?,
        )?;

        let backoff_base_ms = positive(
            "SC_EGRESS_BACKOFF_BASE_MS",
            parse_var(
                vars,
                "SC_EGRESS_BACKOFF_BASE_MS",
                DEFAULT_EGRESS_BACKOFF_BASE_MS,
            )?,
        )?;
        let backoff_max_ms = parse_var(
            vars,
            "SC_EGRESS_BACKOFF_MAX_MS",
            DEFAULT_EGRESS_BACKOFF_MAX_MS,
        )?;
        if backoff_max_ms < backoff_base_ms {
            return Err(ConfigError::InvalidValue(format!(
                "SC_EGRESS_BACKOFF_MAX_MS ({backoff_max_ms}) must not be below SC_EGRESS_BACKOFF_BASE_MS ({backoff_base_ms})"
            )));
        }

        Ok(EgressConfig {
            output_dir,
            segment_seconds,
            list_size,
            ffmpeg_path,
            rtp_port,
            max_attempts,
            backoff_base: Duration::from_millis(backoff_base_ms),
            backoff_max: Duration::from_millis(backoff_max_ms),
            stop_grace: EGRESS_STOP_GRACE,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&HashMap::new()).expect("Config should load successfully");

        assert_eq!(config.signaling_bind_address, DEFAULT_SIGNALING_BIND_ADDRESS);
        assert_eq!(config.health_bind_address, DEFAULT_HEALTH_BIND_ADDRESS);
        assert_eq!(config.engine.listen_ip.to_string(), DEFAULT_LISTEN_IP);
        assert_eq!(config.engine.announced_address, None);
        assert_eq!(config.engine.rtc_min_port, 10000);
        assert_eq!(config.engine.rtc_max_port, 10100);
        assert_eq!(config.engine.max_incoming_bitrate, 1_500_000);
        assert_eq!(config.engine.initial_outgoing_bitrate, 1_000_000);
        assert_eq!(config.engine.call_timeout, Duration::from_secs(10));
        assert_eq!(config.notification_scope, NotificationScope::All);
        assert_eq!(config.egress, EgressConfig::default());
        assert_eq!(config.worker_death_exit_delay, Duration::from_secs(2));
        assert!(config.sc_id.starts_with("sc-"));
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let config = Config::from_vars(&vars(&[
            ("SC_ID", "sc-test-01"),
            ("SC_SIGNALING_BIND_ADDRESS", "127.0.0.1:3100"),
            ("SC_LISTEN_IP", "0.0.0.0"),
            ("SC_ANNOUNCED_ADDRESS", "203.0.113.7"),
            ("SC_RTC_MIN_PORT", "40000"),
            ("SC_RTC_MAX_PORT", "40100"),
            ("SC_ENGINE_CALL_TIMEOUT_MS", "250"),
            ("SC_NOTIFICATION_SCOPE", "Room"),
            ("SC_HLS_OUTPUT_DIR", "/var/hls"),
            ("SC_EGRESS_MAX_ATTEMPTS", "5"),
        ]))
        .expect("Config should load successfully");

        assert_eq!(config.sc_id, "sc-test-01");
        assert_eq!(config.signaling_bind_address, "127.0.0.1:3100");
        assert!(config.engine.listen_ip.is_unspecified());
        assert_eq!(config.engine.announced_address.as_deref(), Some("203.0.113.7"));
        assert_eq!(config.engine.rtc_min_port, 40000);
        assert_eq!(config.engine.call_timeout, Duration::from_millis(250));
        assert_eq!(config.notification_scope, NotificationScope::Room);
        assert_eq!(config.egress.output_dir, PathBuf::from("/var/hls"));
        assert_eq!(
            config.egress.manifest_path(),
            PathBuf::from("/var/hls/stream.m3u8")
        );
        assert_eq!(config.egress.max_attempts, 5);
    }

    #[test]
    fn test_wildcard_listen_ip_requires_announced_address() {
        let result = Config::from_vars(&vars(&[("SC_LISTEN_IP", "0.0.0.0")]));
        assert!(
            matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "SC_ANNOUNCED_ADDRESS")
        );
    }

    #[test]
    fn test_invalid_numbers_are_rejected() {
        for (name, value) in [
            ("SC_RTC_MIN_PORT", "70000"),
            ("SC_ENGINE_CALL_TIMEOUT_MS", "soon"),
            ("SC_ENGINE_CALL_TIMEOUT_MS", "0"),
            ("SC_EGRESS_MAX_ATTEMPTS", "0"),
            ("SC_HLS_LIST_SIZE", "-1"),
            ("SC_EGRESS_RTP_PORT", "65535"),
        ] {
            let result = Config::from_vars(&vars(&[(name, value)]));
            assert!(
                matches!(result, Err(ConfigError::InvalidValue(_))),
                "{name}={value} should be rejected"
            );
        }
    }

    #[test]
    fn test_port_range_must_be_ordered() {
        let result = Config::from_vars(&vars(&[
            ("SC_RTC_MIN_PORT", "20000"),
            ("SC_RTC_MAX_PORT", "10000"),
        ]));
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_unknown_notification_scope() {
        let result = Config::from_vars(&vars(&[("SC_NOTIFICATION_SCOPE", "everyone")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let egress = EgressConfig {
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(5),
            ..EgressConfig::default()
        };
        assert_eq!(egress.backoff_for(1), Duration::from_secs(1));
        assert_eq!(egress.backoff_for(2), Duration::from_secs(2));
        assert_eq!(egress.backoff_for(3), Duration::from_secs(4));
        assert_eq!(egress.backoff_for(4), Duration::from_secs(5));
        assert_eq!(egress.backoff_for(40), Duration::from_secs(5));
    }
}
