use ekko_core::config::{AppConfig, LoadOptions};
use ekko_db::{connect_with_settings, ping};
use serde::Serialize;

use crate::commands::{block_on_runtime, CommandResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

const DEPENDENT_CHECKS: [&str; 4] =
    ["llm_api_key_readiness", "discord_token_readiness", "persona_catalog", "database_connectivity"];

pub fn run(json_output: bool) -> CommandResult {
    let report = build_report();
    let exit_code = if report.overall_status == CheckStatus::Pass { 0 } else { 1 };

    if json_output {
        let output = serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
        return CommandResult { exit_code, output };
    }

    CommandResult { exit_code, output: render_human(&report) }
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_llm_api_key(&config));
            checks.push(check_discord_token(&config));
            checks.push(check_persona_catalog(&config));
            checks.push(check_database_connectivity(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            checks.extend(DEPENDENT_CHECKS.into_iter().map(|name| DoctorCheck {
                name,
                status: CheckStatus::Skipped,
                details: "skipped because configuration did not load".to_string(),
            }));
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_llm_api_key(config: &AppConfig) -> DoctorCheck {
    if config.has_llm_credentials() {
        DoctorCheck {
            name: "llm_api_key_readiness",
            status: CheckStatus::Pass,
            details: format!(
                "api key present; {} text model(s), {} vision model(s)",
                config.llm.text_models.len(),
                config.llm.vision_models.len()
            ),
        }
    } else {
        DoctorCheck {
            name: "llm_api_key_readiness",
            status: CheckStatus::Fail,
            details: "no api key (EKKO_LLM_API_KEY / GEMINI_API_KEY); replies will be fallback-only"
                .to_string(),
        }
    }
}

fn check_discord_token(config: &AppConfig) -> DoctorCheck {
    if config.has_discord_token() {
        DoctorCheck {
            name: "discord_token_readiness",
            status: CheckStatus::Pass,
            details: format!("token present; listening in {}", config.discord.target_channels.join(", ")),
        }
    } else {
        DoctorCheck {
            name: "discord_token_readiness",
            status: CheckStatus::Fail,
            details: "no discord token (EKKO_DISCORD_TOKEN / DISCORD_TOKEN)".to_string(),
        }
    }
}

fn check_persona_catalog(config: &AppConfig) -> DoctorCheck {
    match config.persona_catalog() {
        Ok(catalog) => DoctorCheck {
            name: "persona_catalog",
            status: CheckStatus::Pass,
            details: format!(
                "{} persona(s); default `{}`",
                catalog.len(),
                catalog.default_persona().key
            ),
        },
        Err(error) => DoctorCheck {
            name: "persona_catalog",
            status: CheckStatus::Fail,
            details: error.to_string(),
        },
    }
}

fn check_database_connectivity(config: &AppConfig) -> DoctorCheck {
    let runtime = match block_on_runtime() {
        Ok(runtime) => runtime,
        Err(error) => {
            return DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Fail,
                details: format!("failed to initialize async runtime: {error}"),
            };
        }
    };

    let result = runtime.block_on(async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| format!("failed to connect to database: {error}"))?;

        let pinged = ping(&pool).await.map_err(|error| format!("database query failed: {error}"));
        pool.close().await;
        pinged
    });

    match result {
        Ok(()) => DoctorCheck {
            name: "database_connectivity",
            status: CheckStatus::Pass,
            details: format!("connected using `{}`", config.database.url),
        },
        Err(error) => {
            DoctorCheck { name: "database_connectivity", status: CheckStatus::Fail, details: error }
        }
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
