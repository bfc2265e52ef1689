//! Construct a pool, open a handful of pages concurrently, and shut down
//! cleanly on Ctrl-C.

use std::sync::Arc;

use browser_pool::{BrowserPool, PoolConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let pool = BrowserPool::new(PoolConfig::default());

    let mut handles = Vec::new();
    for i in 0..4 {
        let pool = Arc::clone(&pool);
        handles.push(tokio::spawn(async move {
            match pool.new_page().await {
                Ok(page) => tracing::info!(worker = i, page_id = page.id(), "opened page"),
                Err(e) => tracing::error!(worker = i, error = %e, "failed to open page"),
            }
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }

    tracing::info!("pool stats: {:?}", pool.stats().await);
    tracing::info!("press Ctrl-C to shut down");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    pool.destroy().await;

    Ok(())
}
