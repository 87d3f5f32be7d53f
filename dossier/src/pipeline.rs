//! Pipeline assembly.
//!
//! Wires the store, the exclusion filter, the collaborator clients, the
//! five stage daemons, the search tracker, the polling sweeper and the
//! orchestrator into one running pipeline with a single cancellation
//! token for graceful shutdown. Everything is dependency-injected; there
//! are no process-wide singletons.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clients::{AddressValidator, CardNetwork, Classifier, Predictor};
use crate::error::Result;
use crate::exclusion::ExclusionFilter;
use crate::orchestrator::{Orchestrator, OrchestratorConfig};
use crate::policy::{RateLimit, RateLimiter, RetryPolicy};
use crate::search::{SearchTracker, Sweeper, SweeperConfig};
use crate::stages::{
    stage_queue, AddressWorker, ClassifyWorker, MerchantDaemon, PredictWorker, StageContext,
    StageDaemon, StageQueues, SupplierWorker,
};
use crate::stages::merchant::MerchantConfig;
use crate::stages::supplier::SupplierMatchConfig;
use crate::store::RecordStore;
use crate::types::{BatchId, StageEvent};

/// Per-stage worker-pool sizes.
#[derive(Debug, Clone, Copy)]
pub struct StageConcurrency {
    pub classify: usize,
    pub supplier: usize,
    pub address: usize,
    pub merchant: usize,
    pub predict: usize,
}

impl Default for StageConcurrency {
    fn default() -> Self {
        Self {
            classify: 3,
            supplier: 5,
            address: 5,
            merchant: 2,
            predict: 4,
        }
    }
}

/// Per-stage collaborator rate limits. `None` leaves a stage
/// unconstrained on our side.
#[derive(Debug, Clone, Copy)]
pub struct StageRateLimits {
    pub classify: Option<RateLimit>,
    pub supplier: Option<RateLimit>,
    pub address: Option<RateLimit>,
    pub merchant: Option<RateLimit>,
    pub predict: Option<RateLimit>,
}

impl Default for StageRateLimits {
    fn default() -> Self {
        Self {
            classify: Some(RateLimit::per_minute(500)),
            supplier: Some(RateLimit::per_second(100)),
            address: Some(RateLimit::per_second(50)),
            merchant: Some(RateLimit::per_second(5)),
            predict: None,
        }
    }
}

/// Everything tunable about a running pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub concurrency: StageConcurrency,
    pub rate_limits: StageRateLimits,
    pub retry: RetryPolicy,
    pub supplier: SupplierMatchConfig,
    pub merchant: MerchantConfig,
    pub sweeper: SweeperConfig,
    pub orchestrator: OrchestratorConfig,
    pub predictor_model_id: String,
    pub merchant_lookup_type: String,
}

/// The collaborator clients a pipeline needs.
pub struct Collaborators {
    pub classifier: Arc<dyn Classifier>,
    pub address_validator: Arc<dyn AddressValidator>,
    pub card_network: Arc<dyn CardNetwork>,
    pub predictor: Arc<dyn Predictor>,
}

/// A running pipeline and its background tasks.
pub struct Pipeline {
    orchestrator: Arc<Orchestrator>,
    tracker: Arc<SearchTracker>,
    cancel: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    /// Build and start all pipeline daemons.
    pub fn start(
        store: Arc<dyn RecordStore>,
        filter: Arc<ExclusionFilter>,
        collaborators: Collaborators,
        config: PipelineConfig,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<StageEvent>();

        let ctx = |limit: Option<RateLimit>| StageContext {
            store: store.clone(),
            events: events_tx.clone(),
            limiter: Arc::new(RateLimiter::new(limit)),
            retry: config.retry,
        };

        let tracker = Arc::new(SearchTracker::new(
            store.clone(),
            collaborators.card_network,
            events_tx.clone(),
            Arc::new(RateLimiter::new(config.rate_limits.merchant)),
            config.retry,
            if config.merchant_lookup_type.is_empty() {
                "SUPPLIERS".to_string()
            } else {
                config.merchant_lookup_type.clone()
            },
        ));

        let (classify_tx, classify_rx) = stage_queue();
        let (supplier_tx, supplier_rx) = stage_queue();
        let (address_tx, address_rx) = stage_queue();
        let (merchant_tx, merchant_rx) = stage_queue();
        let (predict_tx, predict_rx) = stage_queue();

        let queues = StageQueues {
            classify: classify_tx,
            supplier: supplier_tx,
            address: address_tx,
            merchant: merchant_tx,
            predict: predict_tx,
        };

        let mut tasks = Vec::new();

        tasks.push(
            StageDaemon::new(
                Arc::new(ClassifyWorker::new(
                    ctx(config.rate_limits.classify),
                    collaborators.classifier,
                )),
                classify_rx,
                config.concurrency.classify,
                cancel.child_token(),
            )
            .spawn(),
        );
        tasks.push(
            StageDaemon::new(
                Arc::new(SupplierWorker::new(
                    ctx(config.rate_limits.supplier),
                    config.supplier.clone(),
                )),
                supplier_rx,
                config.concurrency.supplier,
                cancel.child_token(),
            )
            .spawn(),
        );
        tasks.push(
            StageDaemon::new(
                Arc::new(AddressWorker::new(
                    ctx(config.rate_limits.address),
                    collaborators.address_validator,
                )),
                address_rx,
                config.concurrency.address,
                cancel.child_token(),
            )
            .spawn(),
        );
        tasks.push(
            MerchantDaemon::new(
                // Submission rate limiting lives in the tracker.
                ctx(None),
                tracker.clone(),
                merchant_rx,
                MerchantConfig {
                    concurrency: config.concurrency.merchant,
                    ..config.merchant.clone()
                },
                cancel.child_token(),
            )
            .spawn(),
        );
        tasks.push(
            StageDaemon::new(
                Arc::new(PredictWorker::new(
                    ctx(config.rate_limits.predict),
                    collaborators.predictor,
                    config.predictor_model_id.clone(),
                )),
                predict_rx,
                config.concurrency.predict,
                cancel.child_token(),
            )
            .spawn(),
        );

        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            filter,
            tracker.clone(),
            queues,
            config.orchestrator.clone(),
        ));
        tasks.push(
            orchestrator
                .clone()
                .spawn_event_loop(events_rx, cancel.child_token()),
        );
        tasks.push(orchestrator.clone().spawn_monitor(cancel.child_token()));

        tasks.push(
            Sweeper::new(
                store,
                tracker.clone(),
                config.sweeper.clone(),
                cancel.child_token(),
            )
            .spawn(),
        );

        Self {
            orchestrator,
            tracker,
            cancel,
            tasks: parking_lot::Mutex::new(tasks),
        }
    }

    /// Dispatch a seeded batch through the enabled stages.
    pub async fn submit_batch(&self, batch_id: BatchId) -> Result<()> {
        self.orchestrator.submit_batch(batch_id).await
    }

    /// Cancel a batch and its outstanding searches.
    pub async fn cancel_batch(&self, batch_id: BatchId) -> Result<()> {
        self.orchestrator.cancel_batch(batch_id).await
    }

    /// The search tracker, for webhook ingestion.
    pub fn tracker(&self) -> Arc<SearchTracker> {
        self.tracker.clone()
    }

    /// Signal shutdown and wait for every daemon to drain. Idempotent.
    pub async fn shutdown(&self) {
        tracing::info!("Pipeline shutting down");
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!("Pipeline stopped");
    }
}
