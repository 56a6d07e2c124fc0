use std::env;
use std::time::Duration;

use url::Url;

use crate::session::SessionError;

/// Matinee client configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the relay server (HTTP side; the websocket URL is derived).
    pub relay_server: String,
    /// Delay between signaling reconnect attempts.
    pub reconnect_delay: Duration,
    /// Interval between seat-lease keep-alives.
    pub heartbeat_interval: Duration,
}

const DEFAULT_RELAY_SERVER: &str = "http://127.0.0.1:8080";

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let server = env::var("MATINEE_RELAY_SERVER")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_RELAY_SERVER.to_string());
        // Normalize localhost to IPv4 to avoid IPv6 (::1) preference on macOS
        let server = if server.contains("://localhost") || server.starts_with("localhost") {
            server.replacen("localhost", "127.0.0.1", 1)
        } else {
            server
        };

        let reconnect_delay = env::var("MATINEE_RECONNECT_DELAY_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or_else(default_reconnect_delay);
        let heartbeat_interval = env::var("MATINEE_HEARTBEAT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or_else(default_heartbeat_interval);

        Self {
            relay_server: server,
            reconnect_delay,
            heartbeat_interval,
        }
    }

    /// Parse the configured relay server into a URL, inferring `http://`
    /// when no scheme was given.
    pub fn relay_base_url(&self) -> Result<Url, SessionError> {
        let mut base = self.relay_server.trim().to_string();
        if base.is_empty() {
            return Err(SessionError::InvalidConfig(
                "relay server url cannot be empty".into(),
            ));
        }
        if !base.contains("://") {
            base = format!("http://{base}");
        }
        Url::parse(&base)
            .map_err(|err| SessionError::InvalidConfig(format!("invalid relay server url: {err}")))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_server: DEFAULT_RELAY_SERVER.to_string(),
            reconnect_delay: default_reconnect_delay(),
            heartbeat_interval: default_heartbeat_interval(),
        }
    }
}

fn default_reconnect_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(30)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    // Mutex to ensure environment variable tests don't run in parallel
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.relay_server, "http://127.0.0.1:8080");
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
    }

    #[test]
    fn from_env_normalizes_localhost() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe {
            env::set_var("MATINEE_RELAY_SERVER", "http://localhost:9000");
        }
        let config = Config::from_env();
        assert_eq!(config.relay_server, "http://127.0.0.1:9000");
        unsafe {
            env::remove_var("MATINEE_RELAY_SERVER");
        }
    }

    #[test]
    fn base_url_infers_scheme() {
        let config = Config {
            relay_server: "example.com:8080".into(),
            ..Config::default()
        };
        let url = config.relay_base_url().expect("url");
        assert_eq!(url.scheme(), "http");
        assert_eq!(url.host_str(), Some("example.com"));
    }
}
