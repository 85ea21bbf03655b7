use clap::Parser;
use membrane_server::server::{
    config::{CliArgs, ServerConfig},
    gateway::dev::DevGateway,
    membrane::Membrane,
    process::ChildProcessManager,
    telemetry::init_telemetry,
};
use std::sync::Arc;
use tokio::signal;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;
    log_startup_info(&config);

    let membrane = Membrane::builder()
        .config(&config)
        .gateway(Arc::new(DevGateway::new(config.gateway_address)))
        .process_manager(Arc::new(ChildProcessManager::new(
            config.pre_commands.clone(),
            config.command.clone(),
        )))
        .build()?;

    let result = tokio::select! {
        result = membrane.start() => result,
        () = shutdown_signal() => Ok(()),
    };
    if let Err(err) = &result {
        tracing::error!(error = %err, "membrane exited");
    }

    membrane.stop().await;
    providers.shutdown();
    Ok(result?)
}

fn log_startup_info(config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!("Starting membrane with full config: {:#?}", config);
    } else {
        tracing::info!(
            service_address = %config.service_address,
            gateway_address = %config.gateway_address,
            min_workers = config.min_workers,
            "Starting membrane"
        );
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }
}
