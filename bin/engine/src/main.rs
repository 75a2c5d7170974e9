use chainweave_engine::{app::App, config::EngineConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Runs one workflow.
///
/// Usage: `chainweave-engine [WORKFLOW_JSON [PAYLOAD_JSON]]`. Paths given on
/// the command line take precedence over `RUN__WORKFLOW_PATH` and
/// `RUN__PAYLOAD_PATH`. Prints the execution response as JSON and exits
/// non-zero if the run could not execute or failed.
#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,chainweave=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Load configuration from environment
    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!("Loaded configuration");

    let mut run = config.run.clone();
    let mut args = std::env::args().skip(1);
    if let Some(path) = args.next() {
        run.workflow_path = Some(PathBuf::from(path));
    }
    if let Some(path) = args.next() {
        run.payload_path = Some(PathBuf::from(path));
    }

    let app = match App::connect(&config).await {
        Ok(app) => app,
        Err(report) => {
            tracing::error!(error = %report, "Failed to start engine");
            return ExitCode::FAILURE;
        }
    };

    let response = match app.execute(&run).await {
        Ok(response) => response,
        Err(report) => {
            tracing::error!(error = %report, "Workflow could not be executed");
            return ExitCode::FAILURE;
        }
    };

    match serde_json::to_string_pretty(&response) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode execution response");
            return ExitCode::FAILURE;
        }
    }

    if response.success {
        ExitCode::SUCCESS
    } else {
        tracing::warn!(
            execution_id = %response.execution_id,
            status = response.status.as_str(),
            "Run failed"
        );
        ExitCode::FAILURE
    }
}
