use std::process::ExitCode;

fn main() -> ExitCode {
    ekko_cli::run()
}
