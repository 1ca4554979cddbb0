mod config;

use crate::config::MaintenanceConfig;
use chrono::Utc;
use docstore::{DocumentDb, MemoryDb};
use gild_expectations::{AccessMode, DispatchMode, DocExpectationStore, GarbageCollector, StoreError};
use gild_search::{Cache, JsonbDialect, MemoryCache, SearchCacheManager, SledCache, SqlTraceSource};
use gild_types::Label;
use log::{error, info, warn};
use miette::IntoDiagnostic;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> miette::Result<()> {
    env_logger::init();

    let config = MaintenanceConfig::config().into_diagnostic()?;
    info!("Starting maintenance with {config:?}");

    let db_url = gild_db::DatabaseConfig::from_environment()
        .and_then(|db_config| db_config.url())
        .into_diagnostic()?;
    gild_db::run_migrations(&db_url).into_diagnostic()?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested; finishing the current cycle");
                cancel.cancel();
            }
        }
    });

    let conn = gild_db::establish_async(&db_url).await.into_diagnostic()?;
    let source = Arc::new(SqlTraceSource::new(conn, config.window_length));
    let cache: Arc<dyn Cache> = match &config.cache_path {
        Some(path) => Arc::new(SledCache::open(path).into_diagnostic()?),
        None => Arc::new(MemoryCache::new()),
    };
    let dialect = if config.extract_text_jsonb {
        JsonbDialect::ExtractedText
    } else {
        JsonbDialect::Preserving
    };
    let manager = SearchCacheManager::new(cache, source, config.corpora.clone())
        .with_dialect(dialect)
        .with_materialized_view(config.use_materialized_view);

    let gc_store = if config.run_expectation_gc {
        // The in-process document backend; a deployment pointing at the
        // shared document database swaps in its client here.
        warn!("Expectation GC is using the in-process document backend");
        let db: Arc<dyn DocumentDb> = Arc::new(MemoryDb::new());
        Some(DocExpectationStore::new(
            db,
            AccessMode::ReadWrite,
            DispatchMode::Synchronous,
            cancel.clone(),
        ))
    } else {
        None
    };

    loop {
        info!("Starting maintenance cycle");

        if let Err(e) = manager.run_cache_population().await {
            error!("Search cache population failed: {e:?}");
        }

        if let Some(store) = &gc_store {
            if let Err(e) = run_gc_cycle(store, config.gc_max_age_days).await {
                error!("Expectation garbage collection failed: {e:?}");
            }
        }

        info!("Maintenance cycle finished");

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_secs(config.period)) => {}
        }
    }

    info!("Maintenance exiting");
    Ok(())
}

async fn run_gc_cycle(store: &DocExpectationStore, max_age_days: i64) -> Result<(), StoreError> {
    let cutoff = Utc::now() - chrono::Duration::days(max_age_days);
    for label in [Label::Positive, Label::Negative] {
        let marked = store.mark_unused_entries_for_gc(label, cutoff).await?;
        info!("Marked {marked} stale {label} entries");
    }
    let deleted = store.garbage_collect().await?;
    info!("Deleted {deleted} stale entries");
    Ok(())
}
