use std::env;
use std::str::FromStr;
use std::time::Duration;
#[cfg(test)]
use std::sync::Mutex;

use crate::channel::ChannelConfig;
use crate::probe::{Endpoint, EndpointError, Jitter, ProbeConfig};

pub const ENDPOINTS_VAR: &str = "BEACH_SYNC_ENDPOINTS";
pub const MIN_BACKOFF_VAR: &str = "BEACH_SYNC_MIN_BACKOFF_MS";
pub const MAX_BACKOFF_VAR: &str = "BEACH_SYNC_MAX_BACKOFF_MS";
pub const RETRY_THRESHOLD_VAR: &str = "BEACH_SYNC_RETRY_THRESHOLD";
pub const MAX_RECONNECTS_VAR: &str = "BEACH_SYNC_MAX_RECONNECTS";
pub const RESUME_SESSION_VAR: &str = "BEACH_SYNC_RESUME_SESSION";
pub const AUTH_TOKEN_VAR: &str = "BEACH_SYNC_AUTH_TOKEN";

const DEFAULT_ENDPOINT: &str = "127.0.0.1:8501";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid endpoint {raw}: {source}")]
    InvalidEndpoint {
        raw: String,
        #[source]
        source: EndpointError,
    },
    #[error("no endpoints configured")]
    NoEndpoints,
    #[error("{var} must be a non-negative integer, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },
    #[error("minimum backoff {min:?} exceeds maximum backoff {max:?}")]
    BackoffRange { min: Duration, max: Duration },
}

/// Client configuration. Every field has a default; environment variables
/// and CLI flags override it in that order.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoints: Vec<Endpoint>,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub retry_threshold: u32,
    pub max_reconnect_attempts: Option<u32>,
    pub resume_session_id: Option<String>,
    pub auth_token: Option<String>,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let probe = ProbeConfig::default();
        let channel = ChannelConfig::default();
        Self {
            endpoints: Endpoint::parse(DEFAULT_ENDPOINT).into_iter().collect(),
            min_backoff: probe.min_backoff,
            max_backoff: probe.max_backoff,
            retry_threshold: probe.retry_threshold,
            max_reconnect_attempts: channel.max_reconnect_attempts,
            resume_session_id: None,
            auth_token: None,
            request_timeout: Duration::from_secs(8),
            connect_timeout: channel.connect_timeout,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(raw) = non_empty_var(ENDPOINTS_VAR) {
            config.endpoints = parse_endpoints(&raw)?;
        }
        if let Some(ms) = parse_var::<u64>(MIN_BACKOFF_VAR)? {
            config.min_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(MAX_BACKOFF_VAR)? {
            config.max_backoff = Duration::from_millis(ms);
        }
        if let Some(threshold) = parse_var::<u32>(RETRY_THRESHOLD_VAR)? {
            config.retry_threshold = threshold;
        }
        if let Some(max) = parse_var::<u32>(MAX_RECONNECTS_VAR)? {
            config.max_reconnect_attempts = Some(max);
        }
        config.resume_session_id = non_empty_var(RESUME_SESSION_VAR);
        config.auth_token = non_empty_var(AUTH_TOKEN_VAR);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }
        if self.min_backoff > self.max_backoff {
            return Err(ConfigError::BackoffRange {
                min: self.min_backoff,
                max: self.max_backoff,
            });
        }
        Ok(())
    }

    pub fn probe_config(&self) -> ProbeConfig {
        ProbeConfig {
            min_backoff: self.min_backoff,
            max_backoff: self.max_backoff,
            retry_threshold: self.retry_threshold,
            jitter: Jitter::Random,
        }
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            endpoints: self.endpoints.clone(),
            probe: self.probe_config(),
            connect_timeout: self.connect_timeout,
            max_reconnect_attempts: self.max_reconnect_attempts,
            resume_session_id: self.resume_session_id.clone(),
            ..ChannelConfig::default()
        }
    }
}

/// Comma separated; blanks are skipped.
pub fn parse_endpoints(raw: &str) -> Result<Vec<Endpoint>, ConfigError> {
    let endpoints = raw
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            Endpoint::parse(entry).map_err(|source| ConfigError::InvalidEndpoint {
                raw: entry.to_string(),
                source,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    if endpoints.is_empty() {
        return Err(ConfigError::NoEndpoints);
    }
    Ok(endpoints)
}

fn non_empty_var(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_var<T: FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match non_empty_var(var) {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber { var, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::LazyLock;

    // Mutex to ensure environment variable tests don't run in parallel
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    const ALL_VARS: [&str; 7] = [
        ENDPOINTS_VAR,
        MIN_BACKOFF_VAR,
        MAX_BACKOFF_VAR,
        RETRY_THRESHOLD_VAR,
        MAX_RECONNECTS_VAR,
        RESUME_SESSION_VAR,
        AUTH_TOKEN_VAR,
    ];

    fn with_env<R>(vars: &[(&str, &str)], body: impl FnOnce() -> R) -> R {
        let _lock = ENV_MUTEX.lock().unwrap();
        let saved: Vec<(&str, Option<String>)> =
            ALL_VARS.iter().map(|var| (*var, env::var(var).ok())).collect();
        unsafe {
            for var in ALL_VARS {
                env::remove_var(var);
            }
            for (var, value) in vars {
                env::set_var(var, value);
            }
        }
        let result = body();
        unsafe {
            for (var, value) in saved {
                match value {
                    Some(value) => env::set_var(var, value),
                    None => env::remove_var(var),
                }
            }
        }
        result
    }

    #[test]
    fn defaults_point_at_local_host() {
        let config = with_env(&[], ClientConfig::from_env).unwrap();
        assert_eq!(config.endpoints.len(), 1);
        assert_eq!(config.endpoints[0].to_string(), "http://127.0.0.1:8501");
        assert_eq!(config.max_reconnect_attempts, None);
        assert!(config.auth_token.is_none());
    }

    #[test]
    fn env_overrides_every_knob() {
        let config = with_env(
            &[
                (ENDPOINTS_VAR, "apps.beach.sh/team, localhost:8501"),
                (MIN_BACKOFF_VAR, "10"),
                (MAX_BACKOFF_VAR, "100"),
                (RETRY_THRESHOLD_VAR, "4"),
                (MAX_RECONNECTS_VAR, "3"),
                (RESUME_SESSION_VAR, "session-9"),
                (AUTH_TOKEN_VAR, " token "),
            ],
            ClientConfig::from_env,
        )
        .unwrap();

        let endpoints: Vec<String> = config.endpoints.iter().map(ToString::to_string).collect();
        assert_eq!(
            endpoints,
            vec!["https://apps.beach.sh/team", "http://localhost:8501"]
        );
        let channel = config.channel_config();
        assert_eq!(channel.probe.min_backoff, Duration::from_millis(10));
        assert_eq!(channel.probe.max_backoff, Duration::from_millis(100));
        assert_eq!(channel.probe.retry_threshold, 4);
        assert_eq!(channel.max_reconnect_attempts, Some(3));
        assert_eq!(channel.resume_session_id.as_deref(), Some("session-9"));
        assert_eq!(config.auth_token.as_deref(), Some("token"));
    }

    #[test]
    fn rejects_bad_numbers_and_ranges() {
        let err = with_env(&[(MIN_BACKOFF_VAR, "soon")], ClientConfig::from_env).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidNumber {
                var: MIN_BACKOFF_VAR,
                value: "soon".into()
            }
        );

        let err = with_env(
            &[(MIN_BACKOFF_VAR, "500"), (MAX_BACKOFF_VAR, "100")],
            ClientConfig::from_env,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::BackoffRange { .. }));
    }

    #[test]
    fn endpoint_list_must_not_be_blank() {
        assert_eq!(parse_endpoints(" , ,"), Err(ConfigError::NoEndpoints));
        assert!(matches!(
            parse_endpoints("localhost:8501, ftp://nope"),
            Err(ConfigError::InvalidEndpoint { raw, .. }) if raw == "ftp://nope"
        ));
    }
}
