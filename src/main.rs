use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tsnsrv::cli::{self, Args};
use tsnsrv::error::{ServeError, StartupError};
use tsnsrv::service;
use tsnsrv::tailnet::LocalTailnet;
use tsnsrv::config::TlsMode;
use tsnsrv::ServiceConfig;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tsnsrv=info")),
        )
        .init();

    let config = match Args::from_env().into_options().validate() {
        Ok(config) => config,
        Err(violations) => {
            eprintln!("{}\n", violations);
            eprintln!("{}", cli::usage());
            return ExitCode::FAILURE;
        }
    };

    // The node is dropped before returning, which stops tailscaled
    let result = tokio::select! {
        result = connect_and_serve(config) => result,
        _ = shutdown_signal() => Ok(()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "tsnsrv stopped");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn connect_and_serve(config: ServiceConfig) -> Result<(), ServeError> {
    let timeout = config.node.connect_timeout;
    let node = tokio::time::timeout(timeout, LocalTailnet::start(&config.node))
        .await
        .map_err(|_| StartupError::Timeout(timeout))?
        .map_err(StartupError::from)?;

    let scheme = match config.tls {
        TlsMode::Terminated => "https",
        TlsMode::Plaintext => "http",
    };
    info!(
        url = %format!("{}://{}:{}", scheme, node.dns_name(), config.listen_port),
        ips = ?node.tailscale_ips(),
        "Serving {}",
        config.name
    );

    service::run(config, Arc::new(node)).await
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down..."),
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
            },
            Err(e) => {
                warn!(error = %e, "Could not install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}
