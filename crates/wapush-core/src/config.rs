//! Configuration management
//!
//! 設定は以下の優先順位で読み込まれます:
//! 1. 環境変数
//! 2. wapush.toml 設定ファイル
//! 3. デフォルト値
//!
//! 設定ファイル内では `${VAR_NAME}` 形式で環境変数を展開できます。

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::Error;

/// Main configuration for wapush
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub webhook: WebhookConfig,

    #[serde(default)]
    pub campaign: CampaignConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub cloud_api: CloudApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Port for HTTP API server
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Bearer token required on `/api/*`; unset leaves the API open
    #[serde(default)]
    pub api_key: Option<String>,

    /// Token expected in `hub.verify_token` of the Cloud API handshake
    #[serde(default)]
    pub cloud_verify_token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_api_port(),
            api_key: None,
            cloud_verify_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Inbound message forwarding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Legacy single global destination, used when a session has no webhook
    #[serde(default)]
    pub legacy_url: Option<String>,

    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,

    /// How long the per-session webhook cache is trusted
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            legacy_url: None,
            timeout_secs: default_webhook_timeout(),
            cache_ttl_secs: default_cache_ttl(),
        }
    }
}

impl WebhookConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Campaign dispatch tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignConfig {
    /// Pause between two sends of one dispatch pass
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,

    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            pacing_ms: default_pacing_ms(),
            send_timeout_secs: default_send_timeout(),
        }
    }
}

impl CampaignConfig {
    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Whether the campaign scheduler is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_scheduler_interval")]
    pub interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_scheduler_interval(),
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Diagnostic window for the first QR code after a pairing request
    #[serde(default = "default_qr_timeout")]
    pub qr_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            qr_timeout_secs: default_qr_timeout(),
        }
    }
}

impl SessionConfig {
    pub fn qr_timeout(&self) -> Duration {
        Duration::from_secs(self.qr_timeout_secs)
    }
}

/// WhatsApp Business Cloud API endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudApiConfig {
    #[serde(default = "default_cloud_base_url")]
    pub base_url: String,

    #[serde(default = "default_cloud_api_version")]
    pub api_version: String,
}

impl Default for CloudApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_cloud_base_url(),
            api_version: default_cloud_api_version(),
        }
    }
}

fn default_api_port() -> u16 {
    3000
}

fn default_db_path() -> String {
    "data/wapush.db".to_string()
}

fn default_webhook_timeout() -> u64 {
    10
}

fn default_cache_ttl() -> u64 {
    60
}

fn default_pacing_ms() -> u64 {
    100
}

fn default_send_timeout() -> u64 {
    15
}

fn default_true() -> bool {
    true
}

fn default_scheduler_interval() -> u64 {
    60
}

fn default_qr_timeout() -> u64 {
    15
}

fn default_cloud_base_url() -> String {
    "https://graph.facebook.com".to_string()
}

fn default_cloud_api_version() -> String {
    "v21.0".to_string()
}

impl Config {
    /// 設定ファイルから環境変数を展開する
    ///
    /// `${VAR_NAME}` 形式の文字列を環境変数の値に置換します。
    /// 環境変数が存在しない場合は空文字列になります。
    fn expand_env_vars(value: &str) -> String {
        let mut result = String::new();
        let mut chars = value.chars().peekable();

        while let Some(c) = chars.next() {
            if c == '$' && chars.peek() == Some(&'{') {
                chars.next(); // '{' を消費

                let mut var_name = String::new();
                for c in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    var_name.push(c);
                }

                if let Ok(env_value) = std::env::var(&var_name) {
                    result.push_str(&env_value);
                }
            } else {
                result.push(c);
            }
        }

        result
    }

    /// TOML 文字列から設定を読み込む（環境変数展開あり、上書きなし）
    pub fn from_toml_str(content: &str) -> crate::Result<Self> {
        let expanded = Self::expand_env_vars(content);
        toml::from_str(&expanded)
            .map_err(|e| Error::Config(format!("Failed to parse TOML: {}", e)))
    }

    /// TOML 設定ファイルから設定を読み込む
    ///
    /// 設定ファイル内の `${VAR_NAME}` は環境変数の値に置換され、
    /// その後既存の環境変数で上書きされます。
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let mut cfg = Self::from_toml_str(&content)?;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    /// デフォルトパスから設定を読み込む
    ///
    /// `./wapush.toml` があればそれを使い、なければ環境変数のみから構築します。
    pub fn load() -> crate::Result<Self> {
        if Path::new("wapush.toml").exists() {
            return Self::from_toml_file("wapush.toml");
        }

        Ok(Self::from_env())
    }

    /// Load configuration from environment variables over defaults
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env_overrides();
        cfg
    }

    /// 環境変数で設定を上書きする
    fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("API_PORT") {
            if let Ok(p) = port.parse() {
                self.api.port = p;
            }
        }
        if let Ok(key) = std::env::var("API_KEY") {
            if !key.is_empty() {
                self.api.api_key = Some(key);
            }
        }
        if let Ok(token) = std::env::var("CLOUD_VERIFY_TOKEN") {
            if !token.is_empty() {
                self.api.cloud_verify_token = Some(token);
            }
        }

        if let Ok(path) = std::env::var("DATABASE_PATH") {
            if !path.is_empty() {
                self.database.db_path = path;
            }
        }

        if let Ok(url) = std::env::var("WEBHOOK_URL") {
            if !url.is_empty() {
                self.webhook.legacy_url = Some(url);
            }
        }

        if let Ok(pacing) = std::env::var("CAMPAIGN_PACING_MS") {
            if let Ok(ms) = pacing.parse() {
                self.campaign.pacing_ms = ms;
            }
        }

        if let Ok(enabled) = std::env::var("SCHEDULER_ENABLED") {
            self.scheduler.enabled = enabled.to_lowercase() != "false";
        }
        if let Ok(interval) = std::env::var("SCHEDULER_INTERVAL_SECS") {
            if let Ok(secs) = interval.parse() {
                self.scheduler.interval_secs = secs;
            }
        }

        if let Ok(base_url) = std::env::var("CLOUD_API_BASE_URL") {
            if !base_url.is_empty() {
                self.cloud_api.base_url = base_url;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.api.port, 3000);
        assert_eq!(cfg.database.db_path, "data/wapush.db");
        assert_eq!(cfg.webhook.timeout(), Duration::from_secs(10));
        assert_eq!(cfg.campaign.pacing(), Duration::from_millis(100));
        assert_eq!(cfg.campaign.send_timeout(), Duration::from_secs(15));
        assert!(cfg.scheduler.enabled);
        assert_eq!(cfg.scheduler.interval(), Duration::from_secs(60));
        assert_eq!(cfg.session.qr_timeout(), Duration::from_secs(15));
        assert_eq!(cfg.cloud_api.api_version, "v21.0");
    }

    #[test]
    fn test_expand_env_vars() {
        unsafe {
            std::env::set_var("WAPUSH_TEST_HOOK", "https://hooks.example.com");
        }
        let result = Config::expand_env_vars("url = \"${WAPUSH_TEST_HOOK}/in\"");
        assert_eq!(result, "url = \"https://hooks.example.com/in\"");
        unsafe {
            std::env::remove_var("WAPUSH_TEST_HOOK");
        }
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = Config::expand_env_vars("a${WAPUSH_TEST_MISSING_VAR}b");
        assert_eq!(result, "ab");
    }

    #[test]
    fn test_expand_env_vars_no_braces() {
        let result = Config::expand_env_vars("$HOME stays");
        assert_eq!(result, "$HOME stays");
    }

    #[test]
    fn test_toml_config_parsing() {
        let toml = r#"
[api]
port = 8080

[webhook]
legacy_url = "https://legacy.example.com/hook"

[campaign]
pacing_ms = 250

[scheduler]
enabled = false
"#;
        let cfg = Config::from_toml_str(toml).unwrap();
        assert_eq!(cfg.api.port, 8080);
        assert_eq!(
            cfg.webhook.legacy_url.as_deref(),
            Some("https://legacy.example.com/hook")
        );
        assert_eq!(cfg.webhook.timeout_secs, 10);
        assert_eq!(cfg.campaign.pacing_ms, 250);
        assert!(!cfg.scheduler.enabled);
        assert_eq!(cfg.database.db_path, "data/wapush.db");
    }

    #[test]
    fn test_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wapush.toml");
        std::fs::write(&path, "[database]\ndb_path = \"/tmp/x.db\"\n").unwrap();
        let cfg = Config::from_toml_file(&path).unwrap();
        assert!(!cfg.database.db_path.is_empty());
    }

    #[test]
    fn test_invalid_toml() {
        assert!(Config::from_toml_str("[api\nport=").is_err());
    }
}
