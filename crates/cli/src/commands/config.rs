use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use ekko_core::config::{AppConfig, LoadOptions, DEFAULT_CONFIG_PATHS};
use secrecy::ExposeSecret;
use toml::Value;

struct Field {
    key_path: &'static str,
    env_keys: &'static [&'static str],
    value: String,
}

impl Field {
    fn new(key_path: &'static str, env_keys: &'static [&'static str], value: String) -> Self {
        Self { key_path, env_keys, value }
    }
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for field in fields(&config) {
        let source = field_source(&field, config_file_doc.as_ref(), config_file_path.as_deref());
        lines.push(format!("- {} = {} (source: {source})", field.key_path, field.value));
    }

    lines.join("\n")
}

fn fields(config: &AppConfig) -> Vec<Field> {
    let api_key = config
        .llm
        .api_key
        .as_ref()
        .map(|key| redact_secret(key.expose_secret()))
        .unwrap_or_else(|| "<unset>".to_string());
    let personas = config
        .personas
        .iter()
        .map(|persona| persona.key.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    vec![
        Field::new(
            "database.url",
            &["EKKO_DATABASE_URL", "DB_PATH"],
            config.database.url.clone(),
        ),
        Field::new(
            "database.max_connections",
            &["EKKO_DATABASE_MAX_CONNECTIONS"],
            config.database.max_connections.to_string(),
        ),
        Field::new(
            "database.timeout_secs",
            &["EKKO_DATABASE_TIMEOUT_SECS"],
            config.database.timeout_secs.to_string(),
        ),
        Field::new(
            "discord.bot_token",
            &["EKKO_DISCORD_TOKEN", "DISCORD_TOKEN"],
            redact_secret(config.discord.bot_token.expose_secret()),
        ),
        Field::new(
            "discord.target_channels",
            &["EKKO_TARGET_CHANNELS", "TARGET_CHANNELS"],
            config.discord.target_channels.join(", "),
        ),
        Field::new("llm.api_key", &["EKKO_LLM_API_KEY", "GEMINI_API_KEY"], api_key),
        Field::new("llm.base_url", &["EKKO_LLM_BASE_URL"], config.llm.base_url.clone()),
        Field::new(
            "llm.text_models",
            &["EKKO_LLM_TEXT_MODELS"],
            config.llm.text_models.join(", "),
        ),
        Field::new(
            "llm.vision_models",
            &["EKKO_LLM_VISION_MODELS"],
            config.llm.vision_models.join(", "),
        ),
        Field::new(
            "llm.timeout_secs",
            &["EKKO_LLM_TIMEOUT_SECS"],
            config.llm.timeout_secs.to_string(),
        ),
        Field::new(
            "llm.max_retries",
            &["EKKO_LLM_MAX_RETRIES", "MAX_RETRIES"],
            config.llm.max_retries.to_string(),
        ),
        Field::new(
            "llm.concurrency",
            &["EKKO_LLM_CONCURRENCY", "API_CONCURRENCY"],
            config.llm.concurrency.to_string(),
        ),
        Field::new(
            "llm.max_output_tokens",
            &["EKKO_LLM_MAX_OUTPUT_TOKENS", "MAX_OUTPUT_TOKENS"],
            config.llm.max_output_tokens.to_string(),
        ),
        Field::new(
            "llm.temperature",
            &["EKKO_LLM_TEMPERATURE"],
            config.llm.temperature.to_string(),
        ),
        Field::new(
            "resilience.breaker_threshold",
            &["EKKO_BREAKER_THRESHOLD"],
            config.resilience.breaker_threshold.to_string(),
        ),
        Field::new(
            "resilience.breaker_cooldown_secs",
            &["EKKO_BREAKER_COOLDOWN_SECS"],
            config.resilience.breaker_cooldown_secs.to_string(),
        ),
        Field::new(
            "resilience.backoff_base_ms",
            &["EKKO_BACKOFF_BASE_MS"],
            config.resilience.backoff_base_ms.to_string(),
        ),
        Field::new(
            "resilience.backoff_max_ms",
            &["EKKO_BACKOFF_MAX_MS"],
            config.resilience.backoff_max_ms.to_string(),
        ),
        Field::new(
            "resilience.backoff_jitter_ms",
            &["EKKO_BACKOFF_JITTER_MS"],
            config.resilience.backoff_jitter_ms.to_string(),
        ),
        Field::new(
            "resilience.retry_after_cap_secs",
            &["EKKO_RETRY_AFTER_CAP_SECS"],
            config.resilience.retry_after_cap_secs.to_string(),
        ),
        Field::new(
            "conversation.history_window",
            &["EKKO_HISTORY_WINDOW"],
            config.conversation.history_window.to_string(),
        ),
        Field::new(
            "conversation.max_turn_chars",
            &["EKKO_MAX_TURN_CHARS"],
            config.conversation.max_turn_chars.to_string(),
        ),
        Field::new(
            "conversation.cooldown_secs",
            &["EKKO_COOLDOWN_SECS", "COOLDOWN_SECONDS"],
            config.conversation.cooldown_secs.to_string(),
        ),
        Field::new(
            "conversation.default_persona",
            &["EKKO_DEFAULT_PERSONA"],
            config.conversation.default_persona.clone(),
        ),
        Field::new("personas", &[], personas),
        Field::new(
            "server.bind_address",
            &["EKKO_SERVER_BIND_ADDRESS"],
            config.server.bind_address.clone(),
        ),
        Field::new(
            "server.keep_alive_port",
            &["EKKO_SERVER_KEEP_ALIVE_PORT"],
            config.server.keep_alive_port.to_string(),
        ),
        Field::new(
            "server.graceful_shutdown_secs",
            &["EKKO_SERVER_GRACEFUL_SHUTDOWN_SECS"],
            config.server.graceful_shutdown_secs.to_string(),
        ),
        Field::new(
            "logging.level",
            &["EKKO_LOGGING_LEVEL", "EKKO_LOG_LEVEL"],
            config.logging.level.clone(),
        ),
        Field::new(
            "logging.format",
            &["EKKO_LOGGING_FORMAT", "EKKO_LOG_FORMAT"],
            format!("{:?}", config.logging.format),
        ),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    DEFAULT_CONFIG_PATHS.into_iter().map(PathBuf::from).find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    field: &Field,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    // Blank variables are ignored by the loader, so they do not count here either.
    let env_hit = field.env_keys.iter().find(|key| {
        env::var(key).map(|value| !value.trim().is_empty()).unwrap_or(false)
    });
    if let Some(env_key) = env_hit {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, field.key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn redact_secret(secret: &str) -> String {
    let trimmed = secret.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    let chars = trimmed.chars().count();
    if chars <= 8 {
        return "<redacted>".to_string();
    }

    let tail: String = trimmed.chars().skip(chars - 4).collect();
    format!("<redacted>…{tail}")
}

#[cfg(test)]
mod tests {
    use toml::Value;

    use super::{contains_path, redact_secret};

    #[test]
    fn redaction_never_echoes_short_secrets() {
        assert_eq!(redact_secret(""), "<empty>");
        assert_eq!(redact_secret("abc123"), "<redacted>");
        assert_eq!(redact_secret("AIzaSyExampleKey9876"), "<redacted>…9876");
    }

    #[test]
    fn nested_key_paths_resolve_against_toml_tables() {
        let doc: Value = "[llm]\ntext_models = [\"gemini-2.0-flash\"]\n".parse().expect("toml");
        assert!(contains_path(&doc, "llm.text_models"));
        assert!(!contains_path(&doc, "llm.api_key"));
        assert!(!contains_path(&doc, "database.url"));
    }
}
