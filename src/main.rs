use clap::Parser;
use tokio::signal;
use tokio::signal::unix::SignalKind;
use tracing::{error, info};
use webcam_ingest::{setup_logging, Cli, CliRunner, Commands, EXIT_CONFIG, EXIT_FAILURE};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    setup_logging(args.verbose, args.log_json)?;

    // validate must not depend on the config it is checking
    if let Commands::Validate { file } = &args.command {
        let path = file.clone().unwrap_or_else(|| args.config.clone());
        let code = CliRunner::validate_config(&path).await?;
        std::process::exit(code);
    }

    let runner = match CliRunner::load(&args).await {
        Ok(runner) => runner,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(EXIT_CONFIG);
        }
    };

    // Only the daemon installs signal handlers. Workers keep default
    // SIGTERM handling so the pool can stop them.
    let result = match args.command {
        command @ Commands::Run { .. } => {
            info!("Starting webcam-ingest v{}", env!("CARGO_PKG_VERSION"));
            runner.run(command, shutdown_signal()).await
        }
        command => runner.run(command, std::future::pending::<()>()).await,
    };

    let code = match result {
        Ok(code) => code,
        Err(e) => {
            error!("Application error: {:#}", e);
            EXIT_FAILURE
        }
    };
    std::process::exit(code);
}

async fn shutdown_signal() {
    let mut sigterm = match signal::unix::signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!("Failed to create SIGTERM handler: {}", e);
            let _ = signal::ctrl_c().await;
            info!("Received SIGINT");
            return;
        }
    };

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received SIGINT");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
    }
}
