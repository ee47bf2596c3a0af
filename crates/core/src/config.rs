use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::persona::{PersonaCatalog, PersonaDefinition, DEFAULT_PERSONA_KEY};

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub discord: DiscordConfig,
    pub llm: LlmConfig,
    pub resilience: ResilienceConfig,
    pub conversation: ConversationConfig,
    pub personas: Vec<PersonaDefinition>,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct DiscordConfig {
    pub bot_token: SecretString,
    pub target_channels: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub api_key: Option<SecretString>,
    pub base_url: String,
    pub text_models: Vec<String>,
    pub vision_models: Vec<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub concurrency: usize,
    pub max_output_tokens: u32,
    pub temperature: f32,
}

#[derive(Clone, Debug)]
pub struct ResilienceConfig {
    pub breaker_threshold: u32,
    pub breaker_cooldown_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_jitter_ms: u64,
    /// Longest server-requested wait honoured before moving to the next model.
    pub retry_after_cap_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ConversationConfig {
    pub history_window: usize,
    pub max_turn_chars: usize,
    pub cooldown_secs: u64,
    pub default_persona: String,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub keep_alive_port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub discord_token: Option<String>,
    pub llm_api_key: Option<String>,
    pub llm_base_url: Option<String>,
    pub llm_max_retries: Option<u32>,
    pub llm_concurrency: Option<usize>,
    pub breaker_threshold: Option<u32>,
    pub breaker_cooldown_secs: Option<u64>,
    pub history_window: Option<usize>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

pub const DEFAULT_CONFIG_PATHS: [&str; 2] = ["ekko.toml", "config/ekko.toml"];

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://ekko_bot.sqlite?mode=rwc".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            discord: DiscordConfig {
                bot_token: String::new().into(),
                target_channels: vec!["hoi-dap".to_string()],
            },
            llm: LlmConfig {
                api_key: None,
                base_url: "https://generativelanguage.googleapis.com".to_string(),
                text_models: vec![
                    "gemini-2.0-flash".to_string(),
                    "gemini-1.5-flash".to_string(),
                    "gemini-1.5-pro".to_string(),
                ],
                vision_models: vec!["gemini-2.0-flash".to_string(), "gemini-1.5-pro".to_string()],
                timeout_secs: 30,
                max_retries: 3,
                concurrency: 2,
                max_output_tokens: 512,
                temperature: 0.6,
            },
            resilience: ResilienceConfig {
                breaker_threshold: 5,
                breaker_cooldown_secs: 30,
                backoff_base_ms: 2_000,
                backoff_max_ms: 8_000,
                backoff_jitter_ms: 500,
                retry_after_cap_secs: 20,
            },
            conversation: ConversationConfig {
                history_window: 6,
                max_turn_chars: 600,
                cooldown_secs: 2,
                default_persona: DEFAULT_PERSONA_KEY.to_string(),
            },
            personas: vec![PersonaDefinition::tieu_thu_dong()],
            server: ServerConfig {
                bind_address: "0.0.0.0".to_string(),
                keep_alive_port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATHS[0]));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    /// A usable completion API key is present. Without one the agent runs in
    /// fallback-only mode.
    pub fn has_llm_credentials(&self) -> bool {
        self.llm.api_key.as_ref().is_some_and(|key| !key.expose_secret().trim().is_empty())
    }

    pub fn has_discord_token(&self) -> bool {
        !self.discord.bot_token.expose_secret().trim().is_empty()
    }

    pub fn persona_catalog(&self) -> Result<PersonaCatalog, ConfigError> {
        PersonaCatalog::new(self.personas.iter().cloned(), &self.conversation.default_persona)
            .map_err(|error| {
                ConfigError::Validation(format!(
                    "conversation.default_persona is not a configured persona: {error}"
                ))
            })
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(discord) = patch.discord {
            if let Some(bot_token_value) = discord.bot_token {
                self.discord.bot_token = secret_value(bot_token_value);
            }
            if let Some(target_channels) = discord.target_channels {
                self.discord.target_channels = normalize_list(target_channels);
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = base_url;
            }
            if let Some(text_models) = llm.text_models {
                self.llm.text_models = normalize_list(text_models);
            }
            if let Some(vision_models) = llm.vision_models {
                self.llm.vision_models = normalize_list(vision_models);
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = llm.max_retries {
                self.llm.max_retries = max_retries;
            }
            if let Some(concurrency) = llm.concurrency {
                self.llm.concurrency = concurrency;
            }
            if let Some(max_output_tokens) = llm.max_output_tokens {
                self.llm.max_output_tokens = max_output_tokens;
            }
            if let Some(temperature) = llm.temperature {
                self.llm.temperature = temperature;
            }
        }

        if let Some(resilience) = patch.resilience {
            if let Some(threshold) = resilience.breaker_threshold {
                self.resilience.breaker_threshold = threshold;
            }
            if let Some(cooldown) = resilience.breaker_cooldown_secs {
                self.resilience.breaker_cooldown_secs = cooldown;
            }
            if let Some(base) = resilience.backoff_base_ms {
                self.resilience.backoff_base_ms = base;
            }
            if let Some(max) = resilience.backoff_max_ms {
                self.resilience.backoff_max_ms = max;
            }
            if let Some(jitter) = resilience.backoff_jitter_ms {
                self.resilience.backoff_jitter_ms = jitter;
            }
            if let Some(cap) = resilience.retry_after_cap_secs {
                self.resilience.retry_after_cap_secs = cap;
            }
        }

        if let Some(conversation) = patch.conversation {
            if let Some(history_window) = conversation.history_window {
                self.conversation.history_window = history_window;
            }
            if let Some(max_turn_chars) = conversation.max_turn_chars {
                self.conversation.max_turn_chars = max_turn_chars;
            }
            if let Some(cooldown_secs) = conversation.cooldown_secs {
                self.conversation.cooldown_secs = cooldown_secs;
            }
            if let Some(default_persona) = conversation.default_persona {
                self.conversation.default_persona = default_persona;
            }
        }

        if let Some(personas) = patch.personas {
            for (key, persona) in personas {
                self.merge_persona(key, persona);
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(keep_alive_port) = server.keep_alive_port {
                self.server.keep_alive_port = keep_alive_port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn merge_persona(&mut self, key: String, patch: PersonaPatch) {
        let index = match self.personas.iter().position(|persona| persona.key == key) {
            Some(index) => index,
            None => {
                self.personas.push(PersonaDefinition::new(key.clone(), key, String::new()));
                self.personas.len() - 1
            }
        };
        let persona = &mut self.personas[index];

        if let Some(name) = patch.name {
            persona.name = name;
        }
        if let Some(system) = patch.system {
            persona.system_instruction = system.trim().to_string();
        }
        if let Some(unavailable) = patch.unavailable {
            persona.fallbacks.unavailable = unavailable;
        }
        if let Some(overloaded) = patch.overloaded {
            persona.fallbacks.overloaded = overloaded;
        }
        if let Some(unconfigured) = patch.unconfigured {
            persona.fallbacks.unconfigured = unconfigured;
        }
        if let Some(unexpected) = patch.unexpected {
            persona.fallbacks.unexpected = unexpected;
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("EKKO_DATABASE_URL") {
            self.database.url = value;
        } else if let Some(path) = read_env("DB_PATH") {
            self.database.url = format!("sqlite://{path}?mode=rwc");
        }
        if let Some(value) = read_env("EKKO_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("EKKO_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("EKKO_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("EKKO_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env_any(&["EKKO_DISCORD_TOKEN", "DISCORD_TOKEN"]) {
            self.discord.bot_token = secret_value(value);
        }
        if let Some(value) = read_env_any(&["EKKO_TARGET_CHANNELS", "TARGET_CHANNELS"]) {
            self.discord.target_channels = parse_list(&value);
        }

        if let Some(value) = read_env_any(&["EKKO_LLM_API_KEY", "GEMINI_API_KEY"]) {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("EKKO_LLM_BASE_URL") {
            self.llm.base_url = value;
        }
        if let Some(value) = read_env("EKKO_LLM_TEXT_MODELS") {
            self.llm.text_models = parse_list(&value);
        }
        if let Some(value) = read_env("EKKO_LLM_VISION_MODELS") {
            self.llm.vision_models = parse_list(&value);
        }
        if let Some(value) = read_env("EKKO_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("EKKO_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some((key, value)) = read_env_entry(&["EKKO_LLM_MAX_RETRIES", "MAX_RETRIES"]) {
            self.llm.max_retries = parse_u32(key, &value)?;
        }
        if let Some((key, value)) = read_env_entry(&["EKKO_LLM_CONCURRENCY", "API_CONCURRENCY"]) {
            self.llm.concurrency = parse_usize(key, &value)?;
        }
        if let Some((key, value)) =
            read_env_entry(&["EKKO_LLM_MAX_OUTPUT_TOKENS", "MAX_OUTPUT_TOKENS"])
        {
            self.llm.max_output_tokens = parse_u32(key, &value)?;
        }
        if let Some(value) = read_env("EKKO_LLM_TEMPERATURE") {
            self.llm.temperature = parse_f32("EKKO_LLM_TEMPERATURE", &value)?;
        }

        if let Some(value) = read_env("EKKO_BREAKER_THRESHOLD") {
            self.resilience.breaker_threshold = parse_u32("EKKO_BREAKER_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("EKKO_BREAKER_COOLDOWN_SECS") {
            self.resilience.breaker_cooldown_secs =
                parse_u64("EKKO_BREAKER_COOLDOWN_SECS", &value)?;
        }
        if let Some(value) = read_env("EKKO_BACKOFF_BASE_MS") {
            self.resilience.backoff_base_ms = parse_u64("EKKO_BACKOFF_BASE_MS", &value)?;
        }
        if let Some(value) = read_env("EKKO_BACKOFF_MAX_MS") {
            self.resilience.backoff_max_ms = parse_u64("EKKO_BACKOFF_MAX_MS", &value)?;
        }
        if let Some(value) = read_env("EKKO_BACKOFF_JITTER_MS") {
            self.resilience.backoff_jitter_ms = parse_u64("EKKO_BACKOFF_JITTER_MS", &value)?;
        }
        if let Some(value) = read_env("EKKO_RETRY_AFTER_CAP_SECS") {
            self.resilience.retry_after_cap_secs =
                parse_u64("EKKO_RETRY_AFTER_CAP_SECS", &value)?;
        }

        if let Some(value) = read_env("EKKO_HISTORY_WINDOW") {
            self.conversation.history_window = parse_usize("EKKO_HISTORY_WINDOW", &value)?;
        }
        if let Some(value) = read_env("EKKO_MAX_TURN_CHARS") {
            self.conversation.max_turn_chars = parse_usize("EKKO_MAX_TURN_CHARS", &value)?;
        }
        if let Some((key, value)) = read_env_entry(&["EKKO_COOLDOWN_SECS", "COOLDOWN_SECONDS"]) {
            self.conversation.cooldown_secs = parse_u64(key, &value)?;
        }
        if let Some(value) = read_env("EKKO_DEFAULT_PERSONA") {
            self.conversation.default_persona = value;
        }

        if let Some(value) = read_env("EKKO_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("EKKO_SERVER_KEEP_ALIVE_PORT") {
            self.server.keep_alive_port = parse_u16("EKKO_SERVER_KEEP_ALIVE_PORT", &value)?;
        }
        if let Some(value) = read_env("EKKO_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("EKKO_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env_any(&["EKKO_LOGGING_LEVEL", "EKKO_LOG_LEVEL"]) {
            self.logging.level = value;
        }
        if let Some(value) = read_env_any(&["EKKO_LOGGING_FORMAT", "EKKO_LOG_FORMAT"]) {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(discord_token) = overrides.discord_token {
            self.discord.bot_token = secret_value(discord_token);
        }
        if let Some(llm_api_key) = overrides.llm_api_key {
            self.llm.api_key = Some(secret_value(llm_api_key));
        }
        if let Some(llm_base_url) = overrides.llm_base_url {
            self.llm.base_url = llm_base_url;
        }
        if let Some(max_retries) = overrides.llm_max_retries {
            self.llm.max_retries = max_retries;
        }
        if let Some(concurrency) = overrides.llm_concurrency {
            self.llm.concurrency = concurrency;
        }
        if let Some(threshold) = overrides.breaker_threshold {
            self.resilience.breaker_threshold = threshold;
        }
        if let Some(cooldown) = overrides.breaker_cooldown_secs {
            self.resilience.breaker_cooldown_secs = cooldown;
        }
        if let Some(history_window) = overrides.history_window {
            self.conversation.history_window = history_window;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_discord(&self.discord)?;
        validate_llm(&self.llm)?;
        validate_resilience(&self.resilience)?;
        validate_conversation(&self.conversation)?;
        validate_personas(&self.personas)?;
        self.persona_catalog()?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    DEFAULT_CONFIG_PATHS.into_iter().map(PathBuf::from).find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_discord(discord: &DiscordConfig) -> Result<(), ConfigError> {
    if discord.target_channels.is_empty() {
        return Err(ConfigError::Validation(
            "discord.target_channels must name at least one channel".to_string(),
        ));
    }

    let token = discord.bot_token.expose_secret();
    if token.chars().any(char::is_whitespace) {
        return Err(ConfigError::Validation(
            "discord.bot_token must not contain whitespace (check for a stray newline or `Bot ` prefix)"
                .to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if !llm.base_url.starts_with("http://") && !llm.base_url.starts_with("https://") {
        return Err(ConfigError::Validation(
            "llm.base_url must start with http:// or https://".to_string(),
        ));
    }

    if llm.text_models.is_empty() {
        return Err(ConfigError::Validation(
            "llm.text_models must list at least one model".to_string(),
        ));
    }
    if llm.vision_models.is_empty() {
        return Err(ConfigError::Validation(
            "llm.vision_models must list at least one model".to_string(),
        ));
    }
    if llm.text_models.iter().chain(&llm.vision_models).any(|model| model.trim().is_empty()) {
        return Err(ConfigError::Validation("llm model identifiers must not be blank".to_string()));
    }

    if llm.max_retries == 0 || llm.max_retries > 10 {
        return Err(ConfigError::Validation("llm.max_retries must be in range 1..=10".to_string()));
    }

    if llm.concurrency == 0 || llm.concurrency > 64 {
        return Err(ConfigError::Validation("llm.concurrency must be in range 1..=64".to_string()));
    }

    if llm.max_output_tokens == 0 {
        return Err(ConfigError::Validation(
            "llm.max_output_tokens must be greater than zero".to_string(),
        ));
    }

    if !(0.0..=2.0).contains(&llm.temperature) {
        return Err(ConfigError::Validation(
            "llm.temperature must be in range 0.0..=2.0".to_string(),
        ));
    }

    Ok(())
}

fn validate_resilience(resilience: &ResilienceConfig) -> Result<(), ConfigError> {
    if resilience.breaker_threshold == 0 {
        return Err(ConfigError::Validation(
            "resilience.breaker_threshold must be greater than zero".to_string(),
        ));
    }

    if resilience.breaker_cooldown_secs == 0 {
        return Err(ConfigError::Validation(
            "resilience.breaker_cooldown_secs must be greater than zero".to_string(),
        ));
    }

    if resilience.backoff_base_ms > resilience.backoff_max_ms {
        return Err(ConfigError::Validation(
            "resilience.backoff_base_ms must not exceed resilience.backoff_max_ms".to_string(),
        ));
    }

    if resilience.retry_after_cap_secs > 300 {
        return Err(ConfigError::Validation(
            "resilience.retry_after_cap_secs must be in range 0..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_conversation(conversation: &ConversationConfig) -> Result<(), ConfigError> {
    if conversation.history_window > 50 {
        return Err(ConfigError::Validation(
            "conversation.history_window must be in range 0..=50".to_string(),
        ));
    }

    if conversation.max_turn_chars == 0 {
        return Err(ConfigError::Validation(
            "conversation.max_turn_chars must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_personas(personas: &[PersonaDefinition]) -> Result<(), ConfigError> {
    for persona in personas {
        if persona.system_instruction.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "personas.{}.system must not be empty",
                persona.key
            )));
        }
        if persona.name.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "personas.{}.name must not be empty",
                persona.key
            )));
        }
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.keep_alive_port == 0 {
        return Err(ConfigError::Validation(
            "server.keep_alive_port must be greater than zero".to_string(),
        ));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn read_env_any(keys: &[&str]) -> Option<String> {
    read_env_entry(keys).map(|(_, value)| value)
}

/// First non-empty variable among `keys`, with the name that supplied it.
fn read_env_entry<'a>(keys: &[&'a str]) -> Option<(&'a str, String)> {
    keys.iter().find_map(|key| read_env(key).map(|value| (*key, value)))
}

fn parse_list(value: &str) -> Vec<String> {
    normalize_list(value.split(',').map(str::to_string).collect())
}

fn normalize_list(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}

fn invalid_override(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.trim().parse::<u16>().map_err(|_| invalid_override(key, value))
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.trim().parse::<u32>().map_err(|_| invalid_override(key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse::<u64>().map_err(|_| invalid_override(key, value))
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.trim().parse::<usize>().map_err(|_| invalid_override(key, value))
}

fn parse_f32(key: &str, value: &str) -> Result<f32, ConfigError> {
    value
        .trim()
        .parse::<f32>()
        .ok()
        .filter(|parsed| parsed.is_finite())
        .ok_or_else(|| invalid_override(key, value))
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    discord: Option<DiscordPatch>,
    llm: Option<LlmPatch>,
    resilience: Option<ResiliencePatch>,
    conversation: Option<ConversationPatch>,
    personas: Option<BTreeMap<String, PersonaPatch>>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct DiscordPatch {
    bot_token: Option<String>,
    target_channels: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    api_key: Option<String>,
    base_url: Option<String>,
    text_models: Option<Vec<String>>,
    vision_models: Option<Vec<String>>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    concurrency: Option<usize>,
    max_output_tokens: Option<u32>,
    temperature: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
struct ResiliencePatch {
    breaker_threshold: Option<u32>,
    breaker_cooldown_secs: Option<u64>,
    backoff_base_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
    backoff_jitter_ms: Option<u64>,
    retry_after_cap_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ConversationPatch {
    history_window: Option<usize>,
    max_turn_chars: Option<usize>,
    cooldown_secs: Option<u64>,
    default_persona: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PersonaPatch {
    name: Option<String>,
    system: Option<String>,
    unavailable: Option<String>,
    overloaded: Option<String>,
    unconfigured: Option<String>,
    unexpected: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    keep_alive_port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
