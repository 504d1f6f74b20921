mod app;
mod cli;
mod error;
mod telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = cli::parse();
    let log_config = cli.logging.to_config();
    let _log_guard = telemetry::init(&log_config).map_err(error::CliError::from)?;
    app::run(cli).await?;
    Ok(())
}
