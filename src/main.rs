//! db-copilot server binary.

use anyhow::Context;
use db_copilot::app::App;
use db_copilot::cli::Cli;
use db_copilot::logging::init_logging;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    if let Err(e) = run().await {
        error!("{e:#}");
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse_args();
    let config = cli.load_config().context("loading configuration")?;
    init_logging(&config.logging);
    info!(
        config = %cli.config_path().display(),
        llm = %config.llm.provider,
        "Starting db-copilot"
    );

    let app = App::from_config(config)
        .await
        .context("initializing services")?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                signal.cancel();
            }
            Err(e) => error!("Cannot listen for Ctrl-C: {e}"),
        }
    });

    app.serve(shutdown).await.context("serving HTTP")?;
    Ok(())
}
