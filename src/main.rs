use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};

use digest_worker::{
    app::{self, ComponentRegistry},
    cli::{Cli, Command},
    config::Config,
    observability,
};

#[tokio::main]
async fn main() -> ExitCode {
    std::panic::set_hook(Box::new(|panic_info| {
        let thread = std::thread::current();
        let thread_name = thread.name().unwrap_or("unnamed");
        let message = panic_info
            .payload()
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| {
                panic_info
                    .payload()
                    .downcast_ref::<String>()
                    .map(String::as_str)
            })
            .unwrap_or("unknown panic payload");

        if let Some(location) = panic_info.location() {
            error!(
                thread = thread_name,
                file = location.file(),
                line = location.line(),
                column = location.column(),
                message,
                "panic occurred"
            );
        } else {
            error!(
                thread = thread_name,
                message, "panic occurred without location information"
            );
        }
    }));

    let cli = Cli::parse();
    let result = match cli.command() {
        Command::Serve => serve(&cli).await,
        Command::Generate { output } => generate(&cli, output).await,
    };

    observability::tracing::shutdown();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "digest-worker exited with error");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn build_registry(cli: &Cli) -> anyhow::Result<Arc<ComponentRegistry>> {
    // Tracing initialization is handled by Telemetry::new()
    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    let registry = ComponentRegistry::build(config)
        .await
        .context("failed to build component registry")?;
    Ok(Arc::new(registry))
}

async fn serve(cli: &Cli) -> anyhow::Result<()> {
    let registry = build_registry(cli).await?;
    app::serve(registry, shutdown_signal()).await
}

async fn generate(cli: &Cli, output: Option<PathBuf>) -> anyhow::Result<()> {
    let registry = build_registry(cli).await?;
    let digest = registry
        .one_shot_generator()
        .generate()
        .await
        .context("one-shot digest generation failed")?;

    let location = match output {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            tokio::fs::write(&path, &digest.document)
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
            path.display().to_string()
        }
        None => registry.sink().write(&digest.period, &digest.document).await?,
    };

    info!(
        period = %digest.period,
        items = digest.items.len(),
        %location,
        "one-shot digest written"
    );
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C) for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT, initiating graceful shutdown"),
        () = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}
