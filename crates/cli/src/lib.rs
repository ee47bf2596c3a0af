pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "ekko",
    about = "Ekko operator CLI",
    long_about = "Check Ekko readiness, apply migrations, inspect config, and send one-shot prompts.",
    after_help = "Examples:\n  ekko doctor --json\n  ekko config\n  ekko ask \"Tặng quà cho NPC được không?\""
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, completion API key readiness, and DB connectivity")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Send one prompt through the reply pipeline and print the answer")]
    Ask {
        #[arg(help = "Question to send")]
        text: String,
        #[arg(long, help = "Persona key; defaults to the configured default persona")]
        persona: Option<String>,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => commands::doctor::run(json),
        Command::Ask { text, persona } => commands::ask::run(&text, persona.as_deref()),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
