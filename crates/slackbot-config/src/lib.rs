use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Thirty days.
pub const MAX_EXPIRES_IN_SECS: u64 = 30 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub store: Store,
    #[serde(default)]
    pub callback: Callback,
    #[serde(default)]
    pub slack: Slack,
    #[serde(default)]
    pub logging: Logging,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    pub sqlite_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Callback {
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_expires_in_secs")]
    pub expires_in_secs: u64,
    #[serde(default = "default_true")]
    pub user_scope: bool,
}

impl Default for Callback {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            expires_in_secs: default_expires_in_secs(),
            user_scope: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slack {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_bot_token_env")]
    pub bot_token_env: String,
    #[serde(default = "default_signing_secret_env")]
    pub signing_secret_env: String,
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default)]
    pub signing_secret: Option<String>,
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default = "default_true")]
    pub verify_signature: bool,
    #[serde(default = "default_signature_max_age_secs")]
    pub signature_max_age_secs: u64,
}

impl Default for Slack {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            bot_token_env: default_bot_token_env(),
            signing_secret_env: default_signing_secret_env(),
            bot_token: None,
            signing_secret: None,
            team_id: None,
            verify_signature: true,
            signature_max_age_secs: default_signature_max_age_secs(),
        }
    }
}

impl Slack {
    /// Inline `bot_token`, else the variable named by `bot_token_env`.
    pub fn resolve_bot_token(&self) -> Option<String> {
        resolve_secret(self.bot_token.as_deref(), &self.bot_token_env)
    }

    pub fn resolve_signing_secret(&self) -> Option<String> {
        resolve_secret(self.signing_secret.as_deref(), &self.signing_secret_env)
    }
}

fn resolve_secret(inline: Option<&str>, env_name: &str) -> Option<String> {
    inline
        .map(|v| v.to_string())
        .or_else(|| std::env::var(env_name).ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            format: default_log_format(),
        }
    }
}

fn default_key_prefix() -> String {
    "slack-bot-callback".to_string()
}

fn default_expires_in_secs() -> u64 {
    15 * 60
}

fn default_true() -> bool {
    true
}

fn default_api_base_url() -> String {
    "https://slack.com/api/".to_string()
}

fn default_bot_token_env() -> String {
    "SLACK_BOT_API_TOKEN".to_string()
}

fn default_signing_secret_env() -> String {
    "SLACK_SIGNING_SECRET".to_string()
}

fn default_signature_max_age_secs() -> u64 {
    300
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    parse_and_validate(&config_text)
}

/// Same checks as [`load_and_validate`] for YAML already in memory.
pub fn parse_and_validate(config_text: &str) -> Result<Config, ConfigError> {
    let value: serde_yaml::Value =
        serde_yaml::from_str(config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.store.kind != "memory" && cfg.store.kind != "sqlite" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "store.type={} is not implemented; supported: memory, sqlite",
            cfg.store.kind
        )));
    }
    if cfg.store.kind == "memory" && cfg.store.sqlite_path.is_some() {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is not supported when store.type=memory".to_string(),
        ));
    }
    if cfg.store.kind == "sqlite"
        && cfg
            .store
            .sqlite_path
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is required when store.type=sqlite".to_string(),
        ));
    }
    if cfg.callback.key_prefix.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "callback.key_prefix must not be blank".to_string(),
        ));
    }
    if cfg.callback.expires_in_secs == 0 || cfg.callback.expires_in_secs > MAX_EXPIRES_IN_SECS {
        return Err(ConfigError::UnsupportedConfig(format!(
            "callback.expires_in_secs must be between 1 and {MAX_EXPIRES_IN_SECS}"
        )));
    }
    if cfg.slack.signature_max_age_secs == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "slack.signature_max_age_secs must be >= 1".to_string(),
        ));
    }
    match url::Url::parse(&cfg.slack.api_base_url) {
        Ok(u) if u.scheme() == "http" || u.scheme() == "https" => {}
        _ => {
            return Err(ConfigError::UnsupportedConfig(format!(
                "slack.api_base_url={} must be an http(s) URL",
                cfg.slack.api_base_url
            )))
        }
    }
    if cfg.logging.format != "compact" && cfg.logging.format != "json" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "logging.format={} is not implemented; supported: compact, json",
            cfg.logging.format
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn write_temp_config(contents: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("slackbot-config-test-{nanos}.yaml"));
        std::fs::write(&path, contents).expect("write temp config");
        path.to_string_lossy().to_string()
    }

    fn base_yaml() -> String {
        r#"
server:
  listen_addr: "127.0.0.1:0"

store:
  type: "memory"

callback:
  key_prefix: "slack-bot-callback"
  expires_in_secs: 900
  user_scope: true

slack:
  api_base_url: "https://slack.com/api/"
  signing_secret: "secret"
  verify_signature: true

logging:
  filter: "info"
  format: "compact"
"#
        .to_string()
    }

    #[test]
    fn loads_full_config() {
        let path = write_temp_config(&base_yaml());
        let cfg = load_and_validate(&path).expect("base config should be accepted");
        assert_eq!(cfg.store.kind, "memory");
        assert_eq!(cfg.callback.expires_in_secs, 900);
        assert_eq!(cfg.slack.resolve_signing_secret().as_deref(), Some("secret"));
        assert_eq!(cfg.slack.signature_max_age_secs, 300);
    }

    #[test]
    fn optional_sections_take_defaults() {
        let cfg = parse_and_validate(
            r#"
server:
  listen_addr: "127.0.0.1:0"
store:
  type: "memory"
"#,
        )
        .expect("minimal config should be accepted");
        assert_eq!(cfg.callback.key_prefix, "slack-bot-callback");
        assert!(cfg.callback.user_scope);
        assert_eq!(cfg.slack.bot_token_env, "SLACK_BOT_API_TOKEN");
        assert!(cfg.slack.verify_signature);
        assert_eq!(cfg.logging.format, "compact");
    }

    #[test]
    fn supports_sqlite_store_type_with_path() {
        let path = write_temp_config(&base_yaml().replace(
            "type: \"memory\"",
            "type: \"sqlite\"\n  sqlite_path: \"./a.db\"",
        ));
        let cfg = load_and_validate(&path).expect("sqlite config should be accepted");
        assert_eq!(cfg.store.kind, "sqlite");
        assert_eq!(cfg.store.sqlite_path.as_deref(), Some("./a.db"));
    }

    #[test]
    fn rejects_sqlite_path_even_when_memory() {
        let path = write_temp_config(&base_yaml().replace(
            "type: \"memory\"",
            "type: \"memory\"\n  sqlite_path: \"./a.db\"",
        ));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaLoad(_)
                | ConfigError::SchemaValidation(_)
                | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_zero_expiry() {
        let err = parse_and_validate(&base_yaml().replace("expires_in_secs: 900", "expires_in_secs: 0"))
            .expect_err("expected invalid expiry");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_expiry_beyond_thirty_days() {
        let err = parse_and_validate(
            &base_yaml().replace("expires_in_secs: 900", "expires_in_secs: 18446744073709551615"),
        )
        .expect_err("expected invalid expiry");
        assert!(matches!(
            err,
            ConfigError::Parse(_) | ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));

        let mut cfg = parse_and_validate(&base_yaml()).expect("base config should be accepted");
        cfg.callback.expires_in_secs = MAX_EXPIRES_IN_SECS + 1;
        assert!(matches!(
            validate_runtime_support(&cfg),
            Err(ConfigError::UnsupportedConfig(_))
        ));
    }

    #[test]
    fn rejects_unsupported_log_format() {
        let err = parse_and_validate(&base_yaml().replace("format: \"compact\"", "format: \"pretty\""))
            .expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = load_and_validate("/nonexistent/slackbot.yaml").expect_err("expected read error");
        assert!(matches!(err, ConfigError::Read(_)));
    }

    #[test]
    fn secrets_fall_back_to_env() {
        let slack = Slack {
            bot_token_env: "SLACKBOT_CONFIG_TEST_TOKEN".to_string(),
            ..Slack::default()
        };
        std::env::set_var("SLACKBOT_CONFIG_TEST_TOKEN", " xoxb-test ");
        assert_eq!(slack.resolve_bot_token().as_deref(), Some("xoxb-test"));

        let inline = Slack {
            bot_token: Some("xoxb-inline".to_string()),
            ..slack
        };
        assert_eq!(inline.resolve_bot_token().as_deref(), Some("xoxb-inline"));
    }
}
