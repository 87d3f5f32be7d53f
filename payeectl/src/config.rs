//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable
//! overrides. The file path defaults to `payeectl.yaml` but can be given
//! via `-f` flag or `PAYEECTL_CONFIG`. Environment variables prefixed
//! with `PAYEECTL_` override YAML values; nested fields use double
//! underscores (`PAYEECTL_CARD_NETWORK__WEBHOOK_SECRET=...`).
//!
//! Startup fails (non-zero exit) on unparseable config or missing
//! required secrets; `--validate` checks and exits without serving.

use clap::Parser;
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use dossier::clients::http::CardNetworkEnv;
use dossier::stages::merchant::MerchantConfig;
use dossier::stages::supplier::SupplierMatchConfig;
use dossier::{
    OrchestratorConfig, PipelineConfig, RateLimit, RetryPolicy, StageConcurrency, StageRateLimits,
    SweeperConfig,
};

/// Simple CLI args - just for specifying the config file.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "PAYEECTL_CONFIG", default_value = "payeectl.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

/// Root application configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    pub database: DatabaseConfig,
    pub classifier: ClassifierConfig,
    pub supplier: SupplierConfig,
    pub address_validator: AddressValidatorConfig,
    pub card_network: CardNetworkConfig,
    pub predictor: PredictorConfig,
    pub workers: WorkersConfig,
    pub merchant: MerchantSettings,
    pub batch: BatchSettings,
    pub retention: RetentionSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            database: DatabaseConfig::default(),
            classifier: ClassifierConfig::default(),
            supplier: SupplierConfig::default(),
            address_validator: AddressValidatorConfig::default(),
            card_network: CardNetworkConfig::default(),
            predictor: PredictorConfig::default(),
            workers: WorkersConfig::default(),
            merchant: MerchantSettings::default(),
            batch: BatchSettings::default(),
            retention: RetentionSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL. `DATABASE_URL` overrides this.
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClassifierConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
            api_key: None,
            model: "payee-classifier-v2".to_string(),
        }
    }
}

/// Pointer to the known-supplier read model. Replication from upstream is
/// an external daily job; the pipeline only reads.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupplierConfig {
    pub source: Option<String>,
    pub min_confidence: Option<f64>,
    pub top_n: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AddressValidatorConfig {
    pub base_url: String,
    pub api_key: Option<String>,
}

impl Default for AddressValidatorConfig {
    fn default() -> Self {
        Self {
            base_url: "https://addressvalidation.googleapis.com".to_string(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CardNetworkConfig {
    pub consumer_key: Option<String>,
    pub private_key: Option<String>,
    pub env: CardNetworkEnv,
    pub webhook_secret: Option<String>,
    /// Override the environment base URL (tests, proxies).
    pub base_url: Option<String>,
}

impl Default for CardNetworkConfig {
    fn default() -> Self {
        Self {
            consumer_key: None,
            private_key: None,
            env: CardNetworkEnv::Sandbox,
            webhook_secret: None,
            base_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PredictorConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model_id: String,
    pub enabled: bool,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            base_url: "https://predictor.internal".to_string(),
            api_key: None,
            model_id: "payment-outcome-v1".to_string(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkersConfig {
    pub concurrency: ConcurrencySettings,
    pub rate_limit: RateLimitSettings,
    /// Defer prediction until the record's other enabled stages are
    /// terminal.
    pub predict_after_enrichment: bool,
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            concurrency: ConcurrencySettings::default(),
            rate_limit: RateLimitSettings::default(),
            predict_after_enrichment: true,
            max_retries: 3,
            backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConcurrencySettings {
    pub classify: usize,
    pub supplier: usize,
    pub address: usize,
    pub merchant: usize,
    pub predict: usize,
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        let defaults = StageConcurrency::default();
        Self {
            classify: defaults.classify,
            supplier: defaults.supplier,
            address: defaults.address,
            merchant: defaults.merchant,
            predict: defaults.predict,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitSettings {
    pub classify: Option<RateLimit>,
    pub supplier: Option<RateLimit>,
    pub address: Option<RateLimit>,
    pub merchant: Option<RateLimit>,
    pub predict: Option<RateLimit>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        let defaults = StageRateLimits::default();
        Self {
            classify: defaults.classify,
            supplier: defaults.supplier,
            address: defaults.address,
            merchant: defaults.merchant,
            predict: defaults.predict,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct MerchantSettings {
    pub max_batch_size: usize,
    pub poll_interval_seconds: u64,
    pub lookup_type: String,
}

impl Default for MerchantSettings {
    fn default() -> Self {
        Self {
            max_batch_size: 3000,
            poll_interval_seconds: 60,
            lookup_type: "SUPPLIERS".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchSettings {
    /// Fan-out page size when dispatching a batch's records.
    pub sub_batch_size: u32,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self { sub_batch_size: 500 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetentionSettings {
    /// Days terminal search requests are kept before the sweeper drops
    /// them. 0 keeps them forever.
    pub search_requests_days: u32,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            search_requests_days: 30,
        }
    }
}

impl Config {
    /// Load from the YAML file plus `PAYEECTL_`-prefixed environment
    /// overrides; `DATABASE_URL` wins for the database connection.
    pub fn load(args: &Args) -> anyhow::Result<Self> {
        let mut config: Config = Figment::new()
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("PAYEECTL_").split("__"))
            .extract()?;

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database.url = Some(url);
        }

        config.validate()?;
        Ok(config)
    }

    /// Startup misconfiguration checks; failures are unrecoverable.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.url.as_deref().unwrap_or("").is_empty() {
            anyhow::bail!("database.url is required (or set DATABASE_URL)");
        }
        if self.classifier.api_key.as_deref().unwrap_or("").is_empty() {
            anyhow::bail!("classifier.api_key is required");
        }
        if self.card_network.consumer_key.as_deref().unwrap_or("").is_empty() {
            anyhow::bail!("card_network.consumer_key is required");
        }
        if self.merchant.max_batch_size == 0 {
            anyhow::bail!("merchant.max_batch_size must be positive");
        }
        Ok(())
    }

    /// Engine configuration derived from the loaded settings.
    pub fn pipeline_config(&self) -> PipelineConfig {
        let supplier_defaults = SupplierMatchConfig::default();
        PipelineConfig {
            concurrency: StageConcurrency {
                classify: self.workers.concurrency.classify,
                supplier: self.workers.concurrency.supplier,
                address: self.workers.concurrency.address,
                merchant: self.workers.concurrency.merchant,
                predict: self.workers.concurrency.predict,
            },
            rate_limits: StageRateLimits {
                classify: self.workers.rate_limit.classify,
                supplier: self.workers.rate_limit.supplier,
                address: self.workers.rate_limit.address,
                merchant: self.workers.rate_limit.merchant,
                predict: self.workers.rate_limit.predict,
            },
            retry: RetryPolicy {
                max_attempts: self.workers.max_retries.max(1),
                backoff_ms: self.workers.backoff_ms,
                ..RetryPolicy::default()
            },
            supplier: SupplierMatchConfig {
                min_confidence: self
                    .supplier
                    .min_confidence
                    .unwrap_or(supplier_defaults.min_confidence),
                top_n: self.supplier.top_n.unwrap_or(supplier_defaults.top_n),
            },
            merchant: MerchantConfig {
                max_records_per_search: self.merchant.max_batch_size,
                concurrency: self.workers.concurrency.merchant,
                ..MerchantConfig::default()
            },
            sweeper: SweeperConfig {
                interval: Duration::from_secs(self.merchant.poll_interval_seconds.max(1)),
                retention: match self.retention.search_requests_days {
                    0 => None,
                    days => Some(Duration::from_secs(u64::from(days) * 24 * 60 * 60)),
                },
                ..SweeperConfig::default()
            },
            orchestrator: OrchestratorConfig {
                sub_batch_size: self.batch.sub_batch_size.max(1),
                predict_after_enrichment: self.workers.predict_after_enrichment,
                ..OrchestratorConfig::default()
            },
            predictor_model_id: self.predictor.model_id.clone(),
            merchant_lookup_type: self.merchant.lookup_type.clone(),
        }
    }

    /// Base URL for the card network, honoring the test override.
    pub fn card_network_base_url(&self) -> String {
        self.card_network
            .base_url
            .clone()
            .unwrap_or_else(|| self.card_network.env.base_url().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.database.url = Some("postgres://localhost/payees".to_string());
        config.classifier.api_key = Some("sk-test".to_string());
        config.card_network.consumer_key = Some("ck-test".to_string());
        config
    }

    #[test]
    fn test_defaults_match_suggested_limits() {
        let config = Config::default();
        assert_eq!(config.workers.concurrency.classify, 3);
        assert_eq!(config.workers.concurrency.merchant, 2);
        assert_eq!(config.merchant.max_batch_size, 3000);
        assert_eq!(config.merchant.poll_interval_seconds, 60);
    }

    #[test]
    fn test_validation_requires_secrets() {
        let config = Config::default();
        assert!(config.validate().is_err());

        let config = valid_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pipeline_config_mapping() {
        let mut config = valid_config();
        config.merchant.max_batch_size = 1500;
        config.workers.predict_after_enrichment = false;
        config.retention.search_requests_days = 0;

        let pipeline = config.pipeline_config();
        assert_eq!(pipeline.merchant.max_records_per_search, 1500);
        assert!(!pipeline.orchestrator.predict_after_enrichment);
        assert!(pipeline.sweeper.retention.is_none());
    }
}
