use clap::Parser;
use coco::{Application, Config, slack, telemetry};

/// Wait for shutdown signal (SIGTERM or Ctrl+C)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down gracefully...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down gracefully...");
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI args
    let args = coco::config::Args::parse();

    // Load configuration
    let config = Config::load(&args)?;

    // If --validate flag is set, exit successfully after config validation
    if args.validate {
        println!("Configuration is valid.");
        return Ok(());
    }

    // Start the Slack sink before logging is initialised so its layer can be
    // part of the subscriber
    let (slack_layer, slack_sink) = match &config.slack_token {
        Some(token) if !config.slack_rules.is_empty() => {
            let (layer, sink) = slack::SlackSink::start(token.clone(), config.slack_rules.clone())?;
            (Some(layer), Some(sink))
        }
        _ => (None, None),
    };

    telemetry::init_telemetry(&config.log_level, slack_layer)?;
    tracing::debug!("{:?}", args);

    // Run the application with graceful shutdown on SIGTERM/Ctrl+C
    let outcome = Application::new(config)?.serve(shutdown_signal()).await;

    // Drain whatever the Slack poster still has queued
    if let Some(sink) = slack_sink {
        sink.shutdown().await;
    }

    outcome
}
