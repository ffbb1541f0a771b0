use std::process::ExitCode;
use std::sync::Arc;

use posebridge_plugin::{ExitReason, HostConfig, HostRuntime, LogCrashReporter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = HostConfig::from_env();
    tracing::info!(
        plugin_dirs = ?config.plugin_dirs,
        state_file = %config.state_file.display(),
        "starting posebridge host"
    );

    let mut runtime = match HostRuntime::new(config, Arc::new(LogCrashReporter)) {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("failed to prepare host runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = runtime.start(Vec::new()).await {
        tracing::error!("host runtime failed to start: {e}");
        runtime.shutdown();
        return ExitCode::FAILURE;
    }

    let mut interface = runtime.subscribe_interface();
    tokio::spawn(async move {
        while let Ok(guid) = interface.recv().await {
            tracing::info!(plugin = %guid, "status interface refresh requested");
        }
    });

    let outcome = tokio::select! {
        reason = runtime.run() => reason,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, shutting down");
            Ok(ExitReason::EventsClosed)
        }
    };
    runtime.shutdown();

    match outcome {
        Ok(ExitReason::PluginRequested { fatal: true, guid, message }) => {
            tracing::error!(plugin = %guid, "fatal exit: {message}");
            ExitCode::FAILURE
        }
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("host runtime failed: {e}");
            ExitCode::FAILURE
        }
    }
}
