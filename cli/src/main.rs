//! The rill daemon: load configuration, run the startup migration, then
//! refresh all feeds on a fixed cadence until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use rill_core::{Config, RefreshController};
use rill_fetch::{AnubisSolver, ClientFactory, FeedFetcher, HostScheduler, RateLimits};
use rill_storage::Store;

fn config_path() -> PathBuf {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" || arg == "-c" {
            if let Some(path) = args.next() {
                return PathBuf::from(path);
            }
        }
    }
    std::env::var_os("RILL_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("rill.toml"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let path = config_path();
    let config = if path.exists() {
        Config::load(&path).with_context(|| format!("loading {}", path.display()))?
    } else {
        tracing::info!(path = %path.display(), "no config file, using defaults");
        Config::default()
    };

    // The ID generator must exist before the first row is written.
    rill_types::ids::init(config.node_id);

    let store = Arc::new(
        Store::open(config.database_path())
            .with_context(|| format!("opening {}", config.database_path().display()))?,
    );
    store.migrate().context("running startup migration")?;

    let factory = ClientFactory::new(config.client_config());
    let solver = Arc::new(AnubisSolver::new(Arc::clone(&store)));
    let fetcher = Arc::new(FeedFetcher::new(
        Arc::clone(&store),
        factory,
        solver,
        config.user_agent(),
        Some(config.icon_dir()),
    ));
    let limits = Arc::new(RateLimits::new(Arc::clone(&store)));
    let scheduler = Arc::new(HostScheduler::new(limits));
    let controller = RefreshController::new(Arc::clone(&store), scheduler, fetcher);

    let cancel = CancellationToken::new();
    let mut ticker = tokio::time::interval(config.refresh_interval());

    tracing::info!(
        interval_secs = config.refresh_interval().as_secs(),
        "rill started"
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                cancel.cancel();
                break;
            }
            _ = ticker.tick() => {
                if let Err(err) = controller.refresh_all(&cancel).await {
                    tracing::warn!(error = %err, "refresh pass skipped");
                }
            }
        }
    }

    Ok(())
}
