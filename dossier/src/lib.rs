//! Payee enrichment engine.
//!
//! Ingests batches of payee records and produces an enriched
//! classification for each: a categorical payee type with confidence,
//! optional industry codes, a match against the curated known-supplier
//! catalog, a validated postal address, an asynchronous merchant
//! enrichment from the card network, and a payment-outcome prediction.
//!
//! The engine is organized around five stage workers fed by an
//! orchestrator, a shared record store with compare-and-set terminal
//! writes, and a search tracker that resolves long-running bulk merchant
//! searches by webhook with a polling fallback.
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use dossier::{
//!     Batch, Collaborators, EnabledStages, ExclusionFilter, InMemoryStore,
//!     Pipeline, PipelineConfig, Record, RecordStore,
//! };
//! use dossier::clients::{MockAddressValidator, MockCardNetwork, MockClassifier, MockPredictor};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store: Arc<dyn RecordStore> = Arc::new(InMemoryStore::new());
//!     let filter = Arc::new(ExclusionFilter::new(store.clone()));
//!
//!     let pipeline = Pipeline::start(
//!         store.clone(),
//!         filter,
//!         Collaborators {
//!             classifier: Arc::new(MockClassifier::new()),
//!             address_validator: Arc::new(MockAddressValidator::new()),
//!             card_network: Arc::new(MockCardNetwork::new()),
//!             predictor: Arc::new(MockPredictor::new()),
//!         },
//!         PipelineConfig::default(),
//!     );
//!
//!     let batch = Batch::new("payees.csv".into(), "payees-1.csv".into(), EnabledStages::default());
//!     store.create_batch(&batch).await?;
//!     let record = Record::new(
//!         batch.id,
//!         "Acme Widgets Inc".into(),
//!         dossier::normalize_name("Acme Widgets Inc"),
//!         serde_json::Map::new(),
//!     );
//!     store.insert_records(&[record]).await?;
//!
//!     pipeline.submit_batch(batch.id).await?;
//!     // ... await completion via the batch status / progress projection
//!     pipeline.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod clients;
pub mod error;
pub mod exclusion;
pub mod normalize;
pub mod orchestrator;
pub mod pipeline;
pub mod policy;
pub mod progress;
pub mod search;
pub mod stages;
pub mod store;
pub mod types;

pub use error::{DossierError, Result};
pub use exclusion::{ExclusionFilter, KeywordTestResult};
pub use normalize::normalize_name;
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use pipeline::{Collaborators, Pipeline, PipelineConfig, StageConcurrency, StageRateLimits};
pub use policy::{RateLimit, RateLimiter, RetryPolicy};
pub use progress::{project, ProgressView};
pub use search::{AnySearch, SearchStatus, SearchTracker, Sweeper, SweeperConfig};
pub use store::{InMemoryStore, RecordStore};
pub use types::*;

#[cfg(feature = "postgres")]
pub use store::PostgresStore;
