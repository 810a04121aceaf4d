//! Kitchen display board backend.
//!
//! Polls the order service for one outlet, merges each snapshot with pending
//! local status changes and the on-disk served-order cache, and publishes the
//! resulting [`BoardView`] to whatever renders it.

use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod api;
pub mod board;
pub mod config;
pub mod countdown;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod fetcher;
pub mod merge;
pub mod model;
pub mod new_items;
pub mod overlay;
pub mod scheduler;
pub mod served_cache;
pub mod session;
mod transitions;

#[cfg(test)]
mod test_support;

pub use api::{HttpOrderSource, OrderSource};
pub use board::{Board, BoardView};
pub use config::BoardConfig;
pub use error::{ApiError, BoardError};
pub use fetcher::DateFilter;
pub use merge::Buckets;
pub use model::{Bucket, Order, OrderStatus, Snapshot};
pub use session::{KeyringStore, MemoryStore, Session, SessionStore};

/// Console plus daily rolling file logging. The returned guard flushes the
/// file writer when dropped.
pub fn init_logging(log_dir: &Path) -> tracing_appender::non_blocking::WorkerGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kds_board=debug"));

    // Prune old log files before setting up the appender
    diagnostics::prune_old_logs(log_dir);
    std::fs::create_dir_all(log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    guard
}

// ============================================================================
// Entry point
// ============================================================================

pub fn run() -> anyhow::Result<()> {
    let config = BoardConfig::from_env()?;
    let _log_guard = init_logging(&diagnostics::log_dir(&config.data_dir));

    info!(about = %diagnostics::get_about_info(), "Starting KDS board v{}", env!("CARGO_PKG_VERSION"));
    info!(
        environment = ?config.environment,
        api_host = %config.api_host,
        data_dir = %config.data_dir.display(),
        "configuration"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(config))
}

async fn serve(config: BoardConfig) -> anyhow::Result<()> {
    let db = Arc::new(db::init(&config.data_dir).map_err(anyhow::Error::msg)?);
    match diagnostics::get_board_health(&db) {
        Ok(health) => info!(%health, "database ready"),
        Err(e) => warn!("board health unavailable: {e}"),
    }

    let session = Session::new(Arc::new(KeyringStore::new(config.keyring_service.clone())));
    if !session.has_credentials() {
        warn!("no stored session, the board will report the session as invalid");
    }
    let source = Arc::new(HttpOrderSource::new(&config.api_host)?);
    let board = Board::new(source, session, db, &config);

    board.on_subscription_change(|details| match details {
        Some(details) => info!(
            total_days = ?details.total_days(),
            remaining_days = ?details.remaining_days(chrono::Local::now().date_naive()),
            "subscription details changed"
        ),
        None => info!("subscription details cleared"),
    });

    let mut views = board.subscribe();
    let watcher = tokio::spawn(async move {
        while views.changed().await.is_ok() {
            let view = views.borrow_and_update().clone();
            info!(
                placed = view.buckets.placed.len(),
                cooking = view.buckets.cooking.len(),
                paid = view.buckets.paid.len(),
                served = view.buckets.served.len(),
                error = ?view.error,
                session_invalid = view.session_invalid,
                "board updated"
            );
        }
    });

    let handles = board.start();
    tokio::signal::ctrl_c().await?;
    board.shutdown();
    for handle in handles {
        if let Err(e) = handle.await {
            warn!("board task ended abnormally: {e}");
        }
    }
    watcher.abort();
    info!("KDS board stopped");
    Ok(())
}
