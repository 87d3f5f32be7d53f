//! Control layer for the payee enrichment pipeline.
//!
//! Wires the engine (store, exclusion filter, stage daemons, search
//! tracker, sweeper) to the HTTP surface: batch upload and status,
//! paged classifications, single-name classification, exclusion keyword
//! administration, and the merchant webhook receiver.

use std::sync::Arc;

use dossier::clients::{
    Classifier, HttpAddressValidator, HttpCardNetwork, HttpClassifier, HttpPredictor,
};
use dossier::{Collaborators, ExclusionFilter, Pipeline, PostgresStore, RecordStore};

pub mod api;
pub mod config;
pub mod errors;
pub mod telemetry;

pub use api::{router, AppState};
pub use config::{Args, Config};
pub use errors::Error;

/// The assembled application: running pipeline plus HTTP router.
pub struct Application {
    config: Config,
    state: AppState,
}

impl Application {
    /// Connect to Postgres (running migrations) and assemble everything.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let url = config
            .database
            .url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("database.url is required"))?;
        let store: Arc<dyn RecordStore> = Arc::new(PostgresStore::connect(url).await?);
        Ok(Self::with_store(config, store))
    }

    /// Assemble on an existing store; used by tests with the in-memory
    /// backend.
    pub fn with_store(config: Config, store: Arc<dyn RecordStore>) -> Self {
        let classifier: Arc<dyn Classifier> = Arc::new(HttpClassifier::new(
            config.classifier.base_url.clone(),
            config.classifier.api_key.clone().unwrap_or_default(),
            config.classifier.model.clone(),
        ));
        let collaborators = Collaborators {
            classifier: classifier.clone(),
            address_validator: Arc::new(HttpAddressValidator::new(
                config.address_validator.base_url.clone(),
                config.address_validator.api_key.clone().unwrap_or_default(),
            )),
            card_network: Arc::new(HttpCardNetwork::with_base_url(
                config.card_network_base_url(),
                config.card_network.consumer_key.clone().unwrap_or_default(),
            )),
            predictor: Arc::new(HttpPredictor::new(
                config.predictor.base_url.clone(),
                config.predictor.api_key.clone().unwrap_or_default(),
            )),
        };
        Self::with_parts(config, store, classifier, collaborators)
    }

    /// Fully dependency-injected assembly.
    pub fn with_parts(
        config: Config,
        store: Arc<dyn RecordStore>,
        classifier: Arc<dyn Classifier>,
        collaborators: Collaborators,
    ) -> Self {
        let filter = Arc::new(ExclusionFilter::new(store.clone()));
        let pipeline = Arc::new(Pipeline::start(
            store.clone(),
            filter.clone(),
            collaborators,
            config.pipeline_config(),
        ));
        let state = AppState {
            store,
            tracker: pipeline.tracker(),
            pipeline,
            filter,
            classifier,
            webhook_secret: config.card_network.webhook_secret.clone(),
        };
        Self { config, state }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn router(&self) -> axum::Router {
        api::router(self.state.clone())
    }

    /// Serve until the shutdown future resolves, then drain the
    /// pipeline.
    pub async fn serve(
        self,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "Listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;

        self.state.pipeline.shutdown().await;
        Ok(())
    }
}
