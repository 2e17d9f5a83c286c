use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::QueueConfig;
use crate::error::Result;
use crate::scheduler::Reaper;
use crate::store::JobStore;
use crate::strategy::StrategySet;
use crate::worker::WorkerPool;

/// One worker process: a pool of build workers plus a reaper, sharing a store.
pub struct WorkerNode {
    store: Arc<dyn JobStore>,
    strategies: StrategySet,
    config: QueueConfig,
}

impl WorkerNode {
    pub fn new(store: Arc<dyn JobStore>, strategies: StrategySet, config: QueueConfig) -> Self {
        Self {
            store,
            strategies,
            config,
        }
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// 1. Verifies configuration and every strategy's toolchain
    /// 2. Spawns the worker loops
    /// 3. Spawns the reaper
    /// 4. On shutdown, waits for in-flight builds and the reaper to finish
    ///
    /// # Errors
    ///
    /// Fails before touching any job if the configuration is invalid or a toolchain is
    /// missing.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let pool = WorkerPool::new(self.store.clone(), self.strategies, self.config.clone());
        let workers = pool.start(shutdown.clone()).await?;

        let reaper = Reaper::new(self.store, &self.config);
        let reaper_shutdown = shutdown.clone();
        let reaper_task = tokio::spawn(async move { reaper.run(reaper_shutdown).await });

        shutdown.cancelled().await;
        tracing::info!(workers = workers.len(), "Shutdown requested, draining workers");

        workers.join().await;
        if let Err(e) = reaper_task.await {
            tracing::error!(error = %e, "Reaper task ended abnormally");
        }
        tracing::info!("Worker node stopped");
        Ok(())
    }
}
