//! Polling sweeper.
//!
//! Fallback for lost or delayed webhooks: on a wall-clock interval, scan
//! non-terminal search requests whose last activity is older than a
//! threshold and poll the collaborator for each. Work per pass is
//! bounded; poll attempts are unbounded by default, with retention of
//! terminal rows handled here as a configuration choice.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::SearchTracker;
use crate::error::Result;
use crate::store::RecordStore;

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Wall-clock interval between passes.
    pub interval: Duration,
    /// Only requests idle for at least this long are polled, giving
    /// webhooks a head start.
    pub min_age: Duration,
    /// Maximum requests polled per pass.
    pub pass_limit: u32,
    /// Drop terminal rows older than this; `None` keeps them forever.
    pub retention: Option<Duration>,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            min_age: Duration::from_secs(30),
            pass_limit: 100,
            retention: None,
        }
    }
}

pub struct Sweeper {
    store: Arc<dyn RecordStore>,
    tracker: Arc<SearchTracker>,
    config: SweeperConfig,
    cancel: CancellationToken,
}

impl Sweeper {
    pub fn new(
        store: Arc<dyn RecordStore>,
        tracker: Arc<SearchTracker>,
        config: SweeperConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            tracker,
            config,
            cancel,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    #[tracing::instrument(skip(self))]
    async fn run(self) {
        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            "Search sweeper starting"
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so fresh submissions
        // get their webhook window.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.sweep_once().await {
                Ok(0) => {}
                Ok(n) => tracing::debug!(polled = n, "Sweeper pass finished"),
                Err(e) => tracing::error!(error = %e, "Sweeper pass failed"),
            }
        }
        tracing::info!("Search sweeper stopped");
    }

    /// One bounded pass; returns how many requests were polled.
    pub async fn sweep_once(&self) -> Result<usize> {
        let min_age =
            chrono::Duration::from_std(self.config.min_age).unwrap_or(chrono::Duration::zero());
        let cutoff = Utc::now() - min_age;
        let stale = self
            .store
            .stale_searches(cutoff, self.config.pass_limit)
            .await?;
        let polled = stale.len();

        for search in stale {
            let search_id = search.id().clone();
            if let Err(e) = self.tracker.resolve(search).await {
                tracing::warn!(search_id = %search_id, error = %e, "Sweeper resolution failed");
            }
        }

        if let Some(retention) = self.config.retention {
            let retention =
                chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::zero());
            let deleted = self
                .store
                .delete_terminal_searches_before(Utc::now() - retention)
                .await?;
            if deleted > 0 {
                tracing::info!(deleted, "Expired terminal search requests removed");
            }
        }

        Ok(polled)
    }
}
