use ekko_agent::{runtime::StaticHistory, AiMode, CompletionOrchestrator};
use ekko_core::config::{AppConfig, LoadOptions};

use crate::commands::{block_on_runtime, CommandResult};

const COMMAND: &str = "ask";

/// One-shot reply through the full pipeline with an empty history.
pub fn run(text: &str, persona_key: Option<&str>) -> CommandResult {
    let text = text.trim();
    if text.is_empty() {
        return CommandResult::failure(COMMAND, "invalid_input", "question text is empty", 1);
    }

    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                COMMAND,
                "config_validation",
                format!("config validation failed: {error}"),
                2,
            );
        }
    };

    let catalog = match config.persona_catalog() {
        Ok(catalog) => catalog,
        Err(error) => {
            return CommandResult::failure(COMMAND, "config_validation", error.to_string(), 2);
        }
    };

    let persona = match persona_key {
        Some(key) => match catalog.get(key) {
            Some(persona) => persona.clone(),
            None => {
                let known = catalog.keys().collect::<Vec<_>>().join(", ");
                return CommandResult::failure(
                    COMMAND,
                    "invalid_input",
                    format!("unknown persona `{key}` (known: {known})"),
                    1,
                );
            }
        },
        None => catalog.default_persona().clone(),
    };

    let orchestrator = match CompletionOrchestrator::from_config(&config) {
        Ok(orchestrator) => orchestrator,
        Err(error) => {
            return CommandResult::failure(
                COMMAND,
                "backend",
                format!("completion backend setup failed: {error}"),
                4,
            );
        }
    };

    if orchestrator.ai_mode() == AiMode::FallbackOnly {
        return CommandResult::failure(
            COMMAND,
            "llm_unconfigured",
            persona.fallbacks.unconfigured.clone(),
            6,
        );
    }

    let runtime = match block_on_runtime() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                COMMAND,
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    let history = StaticHistory(Vec::new());
    let reply = runtime.block_on(orchestrator.get_reply(&persona, text, Vec::new(), &history));

    CommandResult::success(COMMAND, reply)
}
