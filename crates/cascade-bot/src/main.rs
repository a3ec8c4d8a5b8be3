//! Engine entry point.

use cascade_bot::{AppConfig, AppError, Application};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "cascade", about = "Liquidation-cascade counter-trading engine")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() {
    if let Err(e) = cascade_telemetry::init_logging() {
        eprintln!("failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let args = Args::parse();
    let config = match args.config {
        Some(path) => AppConfig::from_file(&path),
        None => AppConfig::load(),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Configuration load failed");
            std::process::exit(e.exit_code());
        }
    };

    let app = match Application::new(config) {
        Ok(app) => app,
        Err(e) => {
            error!(error = %e, "Configuration invalid");
            std::process::exit(e.exit_code());
        }
    };

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received");
                shutdown.cancel();
            }
        });
    }

    match app.run(shutdown).await {
        Ok(()) => {
            info!("Normal shutdown");
            std::process::exit(0);
        }
        Err(e @ AppError::HardStopTimeout) => {
            error!(error = %e, "Forced exit");
            std::process::exit(e.exit_code());
        }
        Err(e) => {
            error!(error = %e, "Engine failed");
            std::process::exit(e.exit_code());
        }
    }
}
