use anyhow::Context;
use boom_register::{AppState, Config, StoreStatus, router};
use clap::Parser;
use mimalloc::MiMalloc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    let store = config.open_store();
    let path = store.path().display();
    match StoreStatus::check(&store) {
        StoreStatus::Ready { records } => info!(%path, records, "store ready"),
        StoreStatus::Absent => info!(%path, "store file will be created on first submission"),
        StoreStatus::SheetMissing => info!(
            %path,
            sheet = store.sheet_name(),
            "sheet will be added on first submission"
        ),
        StoreStatus::Unusable(err) => warn!(
            %path,
            error = %err,
            "store file is not usable, submissions will fail until it is fixed"
        ),
    }

    let app = router(AppState::new(store), config.static_dir.as_deref());
    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    info!("Server running on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server stopped with an error")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "cannot listen for ctrl-c, running until killed");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
