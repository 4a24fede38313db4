use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    cutover::cli::run_cli().await
}
