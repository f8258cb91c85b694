use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::classify::ClassifierRules;
use crate::core::types::Credentials;
use crate::login::selectors::LoginSelectors;

// ---------------------------------------------------------------------------
// AuthgateConfig: file-based config loader (authgate.json) with env-var fallback
// ---------------------------------------------------------------------------

pub const ENV_CONFIG_PATH: &str = "AUTHGATE_CONFIG";
pub const ENV_LOGIN_URL: &str = "AUTHGATE_LOGIN_URL";
pub const ENV_HOME_URL: &str = "AUTHGATE_HOME_URL";
pub const ENV_USERNAME: &str = "AUTHGATE_USERNAME";
pub const ENV_PASSWORD: &str = "AUTHGATE_PASSWORD";
pub const ENV_SESSION_FILE: &str = "AUTHGATE_SESSION_FILE";
pub const ENV_SECRET_NAME: &str = "AUTHGATE_SECRET_NAME";
pub const ENV_SECRET_COMMAND: &str = "AUTHGATE_SECRET_COMMAND";
pub const ENV_MAX_PAYLOAD_BYTES: &str = "AUTHGATE_MAX_PAYLOAD_BYTES";
pub const ENV_MAX_ITEM_BYTES: &str = "AUTHGATE_MAX_ITEM_BYTES";
pub const ENV_MAX_ATTEMPTS: &str = "AUTHGATE_MAX_ATTEMPTS";
pub const ENV_CODE_TIMEOUT_SECS: &str = "AUTHGATE_CODE_TIMEOUT_SECS";
pub const ENV_POLL_INTERVAL_SECS: &str = "AUTHGATE_POLL_INTERVAL_SECS";
pub const ENV_DEVICE_WAIT_SECS: &str = "AUTHGATE_DEVICE_WAIT_SECS";
pub const ENV_HEADLESS: &str = "AUTHGATE_HEADLESS";
pub const ENV_DIAGNOSTICS_DIR: &str = "AUTHGATE_DIAGNOSTICS_DIR";
pub const ENV_CHROME_EXECUTABLE: &str = "CHROME_EXECUTABLE";
pub const ENV_TELEGRAM_BOT_TOKEN: &str = "TELEGRAM_BOT_TOKEN";
pub const ENV_TELEGRAM_CHAT_ID: &str = "TELEGRAM_CHAT_ID";
pub const ENV_TELEGRAM_OPERATOR_ID: &str = "TELEGRAM_OPERATOR_ID";

/// Variable a CI runner injects the stored secret into.
pub const DEFAULT_INLINE_ENV_VAR: &str = "AUTHGATE_SESSION_STATE";
pub const DEFAULT_SECRET_NAME: &str = "AUTHGATE_SESSION";
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 48 * 1024;
pub const DEFAULT_MAX_ITEM_BYTES: usize = 4 * 1024;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_CODE_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 3;
pub const DEFAULT_DEVICE_WAIT_SECS: u64 = 90;
pub const DEFAULT_RECHECK_DELAY_MS: u64 = 2000;
pub const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Telegram bot sub-config (mirrors the `telegram` key in authgate.json).
#[derive(serde::Deserialize, Default, Clone, Debug)]
#[serde(default)]
pub struct TelegramConfig {
    /// Bot token. Never logged.
    pub bot_token: Option<String>,
    /// Chat the prompts are sent to.
    pub chat_id: Option<String>,
    /// User id whose replies are accepted. Defaults to `chat_id`, which is
    /// the user's own id in a private chat with the bot.
    pub operator_id: Option<String>,
    /// Override for self-hosted Bot API servers.
    pub api_base: Option<String>,
}

impl TelegramConfig {
    /// Bot token: JSON field → `TELEGRAM_BOT_TOKEN` env var → `None`.
    pub fn resolve_bot_token(&self) -> Option<String> {
        non_empty(self.bot_token.as_deref()).or_else(|| env_string(ENV_TELEGRAM_BOT_TOKEN))
    }

    /// Chat id: JSON field → `TELEGRAM_CHAT_ID` env var → `None`.
    pub fn resolve_chat_id(&self) -> Option<String> {
        non_empty(self.chat_id.as_deref()).or_else(|| env_string(ENV_TELEGRAM_CHAT_ID))
    }

    /// Operator id: JSON field → `TELEGRAM_OPERATOR_ID` env var → chat id.
    pub fn resolve_operator_id(&self) -> Option<String> {
        non_empty(self.operator_id.as_deref())
            .or_else(|| env_string(ENV_TELEGRAM_OPERATOR_ID))
            .or_else(|| self.resolve_chat_id())
    }

    pub fn resolve_api_base(&self) -> String {
        non_empty(self.api_base.as_deref())
            .map(|s| s.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_TELEGRAM_API_BASE.to_string())
    }
}

/// Top-level config loaded from `authgate.json`. Every field is optional; each
/// `resolve_*` accessor applies JSON → env var → default.
#[derive(serde::Deserialize, Default, Clone, Debug)]
#[serde(default)]
pub struct AuthgateConfig {
    pub login_url: Option<String>,
    pub home_url: Option<String>,
    pub session_file: Option<PathBuf>,
    pub secret_name: Option<String>,
    /// Command line used to write the secret, e.g. `gh secret set {name}`.
    pub secret_command: Option<String>,
    pub inline_env_var: Option<String>,
    pub max_payload_bytes: Option<usize>,
    pub max_item_bytes: Option<usize>,
    pub max_attempts: Option<u32>,
    pub code_timeout_secs: Option<u64>,
    pub poll_interval_secs: Option<u64>,
    pub device_wait_secs: Option<u64>,
    pub recheck_delay_ms: Option<u64>,
    pub headless: Option<bool>,
    pub chrome_executable: Option<String>,
    pub diagnostics_dir: Option<PathBuf>,
    pub telegram: TelegramConfig,
    pub selectors: LoginSelectors,
    pub classifier: ClassifierRules,
}

impl AuthgateConfig {
    pub fn resolve_login_url(&self) -> Option<String> {
        non_empty(self.login_url.as_deref()).or_else(|| env_string(ENV_LOGIN_URL))
    }

    pub fn resolve_home_url(&self) -> Option<String> {
        non_empty(self.home_url.as_deref()).or_else(|| env_string(ENV_HOME_URL))
    }

    /// Credentials come from the environment only; they are never read from
    /// the config file.
    pub fn resolve_credentials(&self) -> Option<Credentials> {
        let username = env_string(ENV_USERNAME)?;
        let password = std::env::var(ENV_PASSWORD).ok().filter(|p| !p.is_empty())?;
        Some(Credentials::new(username, password))
    }

    /// Session file: JSON field → `AUTHGATE_SESSION_FILE` → `~/.authgate/session.json`.
    pub fn resolve_session_file(&self) -> PathBuf {
        if let Some(p) = &self.session_file {
            return p.clone();
        }
        if let Some(p) = env_string(ENV_SESSION_FILE) {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(".authgate")
            .join("session.json")
    }

    pub fn resolve_secret_name(&self) -> String {
        non_empty(self.secret_name.as_deref())
            .or_else(|| env_string(ENV_SECRET_NAME))
            .unwrap_or_else(|| DEFAULT_SECRET_NAME.to_string())
    }

    /// Secret write command. `None` disables the secret backend.
    pub fn resolve_secret_command(&self) -> Option<String> {
        non_empty(self.secret_command.as_deref()).or_else(|| env_string(ENV_SECRET_COMMAND))
    }

    pub fn resolve_inline_env_var(&self) -> String {
        non_empty(self.inline_env_var.as_deref())
            .unwrap_or_else(|| DEFAULT_INLINE_ENV_VAR.to_string())
    }

    pub fn resolve_max_payload_bytes(&self) -> usize {
        self.max_payload_bytes
            .or_else(|| env_parse(ENV_MAX_PAYLOAD_BYTES))
            .unwrap_or(DEFAULT_MAX_PAYLOAD_BYTES)
    }

    pub fn resolve_max_item_bytes(&self) -> usize {
        self.max_item_bytes
            .or_else(|| env_parse(ENV_MAX_ITEM_BYTES))
            .unwrap_or(DEFAULT_MAX_ITEM_BYTES)
    }

    /// Max code attempts, clamped to at least 1.
    pub fn resolve_max_attempts(&self) -> u32 {
        self.max_attempts
            .or_else(|| env_parse(ENV_MAX_ATTEMPTS))
            .unwrap_or(DEFAULT_MAX_ATTEMPTS)
            .max(1)
    }

    pub fn resolve_code_timeout(&self) -> Duration {
        Duration::from_secs(
            self.code_timeout_secs
                .or_else(|| env_parse(ENV_CODE_TIMEOUT_SECS))
                .unwrap_or(DEFAULT_CODE_TIMEOUT_SECS),
        )
    }

    pub fn resolve_poll_interval(&self) -> Duration {
        Duration::from_secs(
            self.poll_interval_secs
                .or_else(|| env_parse(ENV_POLL_INTERVAL_SECS))
                .unwrap_or(DEFAULT_POLL_INTERVAL_SECS)
                .max(1),
        )
    }

    pub fn resolve_device_wait(&self) -> Duration {
        Duration::from_secs(
            self.device_wait_secs
                .or_else(|| env_parse(ENV_DEVICE_WAIT_SECS))
                .unwrap_or(DEFAULT_DEVICE_WAIT_SECS),
        )
    }

    pub fn resolve_recheck_delay(&self) -> Duration {
        Duration::from_millis(self.recheck_delay_ms.unwrap_or(DEFAULT_RECHECK_DELAY_MS))
    }

    /// Headless mode: JSON field → `AUTHGATE_HEADLESS` ("0"/"false" disables) → `true`.
    pub fn resolve_headless(&self) -> bool {
        if let Some(b) = self.headless {
            return b;
        }
        std::env::var(ENV_HEADLESS)
            .map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no"))
            .unwrap_or(true)
    }

    /// Browser executable override. Only returned when the path exists;
    /// otherwise the driver auto-discovers one.
    pub fn resolve_chrome_executable(&self) -> Option<String> {
        let p = non_empty(self.chrome_executable.as_deref())
            .or_else(|| env_string(ENV_CHROME_EXECUTABLE))?;
        if Path::new(&p).exists() {
            Some(p)
        } else {
            tracing::warn!("config: browser executable {} does not exist, ignoring", p);
            None
        }
    }

    pub fn resolve_diagnostics_dir(&self) -> PathBuf {
        if let Some(p) = &self.diagnostics_dir {
            return p.clone();
        }
        env_string(ENV_DIAGNOSTICS_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("authgate-diagnostics"))
    }
}

/// Load `authgate.json` from standard locations.
///
/// Search order (first found wins):
/// 1. `AUTHGATE_CONFIG` env var path
/// 2. `./authgate.json`
/// 3. `../authgate.json`
///
/// Missing file → `AuthgateConfig::default()` (all env-var fallbacks apply).
/// Parse error → log a warning, return the default.
pub fn load_config() -> AuthgateConfig {
    let mut candidates = vec![
        PathBuf::from("authgate.json"),
        PathBuf::from("../authgate.json"),
    ];
    if let Some(env_path) = env_string(ENV_CONFIG_PATH) {
        candidates.insert(0, PathBuf::from(env_path));
    }

    for path in &candidates {
        if let Some(cfg) = load_config_from(path) {
            return cfg;
        }
    }
    AuthgateConfig::default()
}

/// `None` when the file is absent; parse errors log and yield the default.
pub fn load_config_from(path: &Path) -> Option<AuthgateConfig> {
    let contents = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str::<AuthgateConfig>(&contents) {
        Ok(cfg) => {
            tracing::info!("config: loaded {}", path.display());
            Some(cfg)
        }
        Err(e) => {
            tracing::warn!("config: parse error at {}: {}; using defaults", path.display(), e);
            Some(AuthgateConfig::default())
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_values_win_and_defaults_fill_the_rest() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r##"{{
                "login_url": "https://portal.example.com/login",
                "home_url": "https://portal.example.com/home",
                "max_attempts": 0,
                "code_timeout_secs": 60,
                "telegram": {{ "chat_id": "42" }},
                "selectors": {{ "username": ["#user"] }}
            }}"##
        )
        .unwrap();

        let cfg = load_config_from(f.path()).unwrap();
        assert_eq!(
            cfg.resolve_login_url().as_deref(),
            Some("https://portal.example.com/login")
        );
        assert_eq!(cfg.resolve_max_attempts(), 1);
        assert_eq!(cfg.resolve_code_timeout(), Duration::from_secs(60));
        assert_eq!(cfg.resolve_max_item_bytes(), DEFAULT_MAX_ITEM_BYTES);
        assert_eq!(cfg.resolve_recheck_delay(), Duration::from_millis(2000));
        assert_eq!(cfg.resolve_inline_env_var(), DEFAULT_INLINE_ENV_VAR);
        assert_eq!(cfg.telegram.resolve_chat_id().as_deref(), Some("42"));
        assert_eq!(cfg.telegram.resolve_operator_id().as_deref(), Some("42"));
        assert_eq!(cfg.telegram.resolve_api_base(), DEFAULT_TELEGRAM_API_BASE);
        assert_eq!(cfg.selectors.username, vec!["#user".to_string()]);
        assert!(!cfg.selectors.password.is_empty());
        assert!(!cfg.classifier.code_phrases.is_empty());
    }

    #[test]
    fn operator_id_overrides_chat_for_group_chats() {
        let telegram = TelegramConfig {
            chat_id: Some("-100500".into()),
            operator_id: Some("42".into()),
            ..TelegramConfig::default()
        };
        assert_eq!(telegram.resolve_chat_id().as_deref(), Some("-100500"));
        assert_eq!(telegram.resolve_operator_id().as_deref(), Some("42"));
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "{{ not json").unwrap();
        let cfg = load_config_from(f.path()).unwrap();
        assert!(cfg.login_url.is_none());
    }

    #[test]
    fn missing_file_is_none() {
        assert!(load_config_from(Path::new("/definitely/not/here/authgate.json")).is_none());
    }
}
