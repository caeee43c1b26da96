use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::transport::{BackoffPolicy, SocketTimeouts};

const CONFIG_FILE_NAME: &str = "huddle_config.json";

const DEFAULT_TYPING_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_TYPING_RESEND_MS: u64 = 2_000;
const DEFAULT_LOCAL_TYPING_IDLE_MS: u64 = 3_000;
const DEFAULT_RECONCILE_INTERVAL_MS: u64 = 30_000;
const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
const DEFAULT_BACKOFF_CAP_MS: u64 = 30_000;
const DEFAULT_EVICTION_GRACE_MS: u64 = 60_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_PING_INTERVAL_MS: u64 = 15_000;
const DEFAULT_IDLE_TIMEOUT_MS: u64 = 45_000;

/// On-disk configuration. Every field is optional; accessors apply defaults.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub socket_url: Option<String>,
    pub api_base_url: Option<String>,
    pub disable_network: Option<bool>,
    pub typing_timeout_ms: Option<u64>,
    pub typing_resend_ms: Option<u64>,
    pub local_typing_idle_ms: Option<u64>,
    pub reconcile_interval_ms: Option<u64>,
    pub backoff_base_ms: Option<u64>,
    pub backoff_cap_ms: Option<u64>,
    pub max_reconnect_attempts: Option<u32>,
    pub eviction_grace_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub ping_interval_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
}

impl AppConfig {
    pub fn network_disabled(&self) -> bool {
        self.disable_network == Some(true)
    }

    /// The socket endpoint, if it is a usable `ws://` or `wss://` URL.
    pub fn socket_url(&self) -> Option<&str> {
        let raw = non_empty(self.socket_url.as_deref())?;
        match url::Url::parse(raw) {
            Ok(u) if matches!(u.scheme(), "ws" | "wss") => Some(raw),
            _ => None,
        }
    }

    pub fn api_base_url(&self) -> Option<&str> {
        let raw = non_empty(self.api_base_url.as_deref())?;
        match url::Url::parse(raw) {
            Ok(u) if matches!(u.scheme(), "http" | "https") => Some(raw),
            _ => None,
        }
    }

    pub fn typing_timeout_ms(&self) -> u64 {
        self.typing_timeout_ms.unwrap_or(DEFAULT_TYPING_TIMEOUT_MS)
    }

    pub fn typing_timeout(&self) -> Duration {
        Duration::from_millis(self.typing_timeout_ms())
    }

    pub fn typing_resend_ms(&self) -> u64 {
        self.typing_resend_ms.unwrap_or(DEFAULT_TYPING_RESEND_MS)
    }

    pub fn local_typing_idle_ms(&self) -> u64 {
        self.local_typing_idle_ms
            .unwrap_or(DEFAULT_LOCAL_TYPING_IDLE_MS)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(
            self.reconcile_interval_ms
                .unwrap_or(DEFAULT_RECONCILE_INTERVAL_MS),
        )
    }

    pub fn eviction_grace(&self) -> Duration {
        Duration::from_millis(self.eviction_grace_ms.unwrap_or(DEFAULT_EVICTION_GRACE_MS))
    }

    pub fn max_reconnect_attempts(&self) -> Option<u32> {
        self.max_reconnect_attempts
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        let base = self.backoff_base_ms.unwrap_or(DEFAULT_BACKOFF_BASE_MS);
        let cap = self.backoff_cap_ms.unwrap_or(DEFAULT_BACKOFF_CAP_MS).max(base);
        BackoffPolicy {
            base: Duration::from_millis(base),
            cap: Duration::from_millis(cap),
        }
    }

    /// Handshake and liveness deadlines. The idle deadline is kept at two
    /// ping intervals or more so a healthy peer always has time to pong.
    pub fn socket_timeouts(&self) -> SocketTimeouts {
        let ping = self.ping_interval_ms.unwrap_or(DEFAULT_PING_INTERVAL_MS).max(1);
        let idle = self
            .idle_timeout_ms
            .unwrap_or(DEFAULT_IDLE_TIMEOUT_MS)
            .max(ping.saturating_mul(2));
        SocketTimeouts {
            connect: Duration::from_millis(
                self.connect_timeout_ms.unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
            ),
            ping_interval: Duration::from_millis(ping),
            idle: Duration::from_millis(idle),
        }
    }

    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("HUDDLE_SOCKET_URL").filter(|v| !v.trim().is_empty()) {
            self.socket_url = Some(url);
        }
        if let Some(url) = lookup("HUDDLE_API_URL").filter(|v| !v.trim().is_empty()) {
            self.api_base_url = Some(url);
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

/// Reads `<data_dir>/huddle_config.json`, falling back to defaults, then applies
/// `HUDDLE_SOCKET_URL` / `HUDDLE_API_URL` from the environment.
pub fn load_app_config(data_dir: &str) -> AppConfig {
    let path = Path::new(data_dir).join(CONFIG_FILE_NAME);
    let mut config = match std::fs::read_to_string(&path) {
        Ok(raw) => match serde_json::from_str::<AppConfig>(&raw) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %path.display(), %e, "invalid config, using defaults");
                AppConfig::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppConfig::default(),
        Err(e) => {
            tracing::warn!(path = %path.display(), %e, "failed to read config, using defaults");
            AppConfig::default()
        }
    };
    config.apply_env_overrides(|key| std::env::var(key).ok());

    if config.socket_url.is_some() && config.socket_url().is_none() {
        tracing::warn!(socket_url = ?config.socket_url, "ignoring socket_url: expected ws:// or wss://");
    }
    if config.api_base_url.is_some() && config.api_base_url().is_none() {
        tracing::warn!(api_base_url = ?config.api_base_url, "ignoring api_base_url: expected http(s)://");
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.typing_timeout_ms(), 3_000);
        assert_eq!(config.reconcile_interval(), Duration::from_secs(30));
        assert_eq!(config.eviction_grace(), Duration::from_secs(60));
        let policy = config.backoff_policy();
        assert_eq!(policy.base, Duration::from_secs(1));
        assert_eq!(policy.cap, Duration::from_secs(30));
        assert!(config.max_reconnect_attempts().is_none());
        assert!(!config.network_disabled());
        assert_eq!(config.socket_timeouts(), SocketTimeouts::default());
    }

    #[test]
    fn idle_timeout_never_below_two_pings() {
        let config = AppConfig {
            connect_timeout_ms: Some(250),
            ping_interval_ms: Some(1_000),
            idle_timeout_ms: Some(500),
            ..AppConfig::default()
        };
        let timeouts = config.socket_timeouts();
        assert_eq!(timeouts.connect, Duration::from_millis(250));
        assert_eq!(timeouts.ping_interval, Duration::from_secs(1));
        assert_eq!(timeouts.idle, Duration::from_secs(2));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = load_app_config(&dir.path().to_string_lossy());
        assert_eq!(config.typing_timeout_ms, None);
        assert_eq!(config.disable_network, None);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"{"typing_timeout_ms": 1500, "disable_network": true}"#,
        )
        .expect("write config");
        let config = load_app_config(&dir.path().to_string_lossy());
        assert_eq!(config.typing_timeout_ms(), 1_500);
        assert_eq!(config.typing_resend_ms(), 2_000);
        assert!(config.network_disabled());
    }

    #[test]
    fn garbage_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "not json").expect("write config");
        let config = load_app_config(&dir.path().to_string_lossy());
        assert_eq!(config.typing_timeout_ms, None);
    }

    #[test]
    fn env_overrides_replace_file_urls() {
        let mut config = AppConfig {
            socket_url: Some("ws://file.example/socket".into()),
            ..AppConfig::default()
        };
        config.apply_env_overrides(|key| match key {
            "HUDDLE_SOCKET_URL" => Some("wss://env.example/socket".into()),
            "HUDDLE_API_URL" => Some("   ".into()),
            _ => None,
        });
        assert_eq!(config.socket_url(), Some("wss://env.example/socket"));
        assert_eq!(config.api_base_url(), None);
    }

    #[test]
    fn rejects_urls_with_wrong_scheme() {
        let config = AppConfig {
            socket_url: Some("https://example.com/socket".into()),
            api_base_url: Some("ws://example.com".into()),
            ..AppConfig::default()
        };
        assert_eq!(config.socket_url(), None);
        assert_eq!(config.api_base_url(), None);
    }

    #[test]
    fn backoff_cap_never_below_base() {
        let config = AppConfig {
            backoff_base_ms: Some(5_000),
            backoff_cap_ms: Some(100),
            ..AppConfig::default()
        };
        let policy = config.backoff_policy();
        assert_eq!(policy.cap, Duration::from_secs(5));
    }
}
