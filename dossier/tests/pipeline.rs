//! End-to-end pipeline tests over the in-memory store and mock
//! collaborators: exclusion short-circuiting, webhook/poll racing,
//! no-match handling, submission auth failures, duplicate webhook
//! deliveries and cancellation.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use dossier::clients::{
    BulkSearchResults, BulkSearchStatus, ClassifierOutput, ClientError, MerchantHit,
    MockAddressValidator, MockCardNetwork, MockClassifier, MockPredictor, PredictorOutput,
};
use dossier::stages::merchant::MerchantConfig;
use dossier::{
    normalize_name, Batch, BatchId, BatchStatus, Collaborators, EnabledStages, EventId,
    ExclusionFilter, ExclusionKeyword, InMemoryStore, MerchantMatchStatus, Pipeline,
    PipelineConfig, Record, RecordId, RecordStore, RetryPolicy, SearchId, SearchStatus, Stage,
    StageStatus, Sweeper, SweeperConfig, ValidatedAddress, WebhookEvent,
};

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const WAIT_TICK: Duration = Duration::from_millis(10);

struct Harness {
    store: Arc<InMemoryStore>,
    pipeline: Pipeline,
    network: Arc<MockCardNetwork>,
    sweeper: Sweeper,
}

fn business_classification() -> ClassifierOutput {
    ClassifierOutput {
        payee_type: "Business".to_string(),
        confidence: 0.95,
        sic_code: Some("5045".to_string()),
        sic_description: Some("Computers and Software".to_string()),
        reasoning: Some("corporate name shape".to_string()),
    }
}

fn harness() -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let filter = Arc::new(ExclusionFilter::new(store.clone()));

    let classifier = Arc::new(MockClassifier::new());
    classifier.set_default(business_classification());
    let validator = Arc::new(MockAddressValidator::new());
    validator.set_default(ValidatedAddress {
        formatted_address: "1 Main St, Springfield, IL 62701".to_string(),
        components: serde_json::json!({"locality": "Springfield"}),
        latitude: Some(39.78),
        longitude: Some(-89.65),
        confidence: 0.97,
        place_id: Some("place-1".to_string()),
    });
    let network = Arc::new(MockCardNetwork::new());
    let predictor = Arc::new(MockPredictor::new());
    predictor.set_default(PredictorOutput {
        predicted_payment_success: 0.9,
        confidence: 0.8,
        risk_factors: vec![],
        recommended_payment_method: Some("ACH".to_string()),
        processing_time_estimate: None,
        fraud_risk_score: Some(0.05),
    });

    let config = PipelineConfig {
        retry: RetryPolicy {
            max_attempts: 2,
            backoff_ms: 1,
            backoff_factor: 1,
            max_backoff_ms: 2,
        },
        merchant: MerchantConfig {
            max_records_per_search: 3000,
            // Generous enough that one batch's fan-out always lands in a
            // single submission.
            linger: Duration::from_millis(50),
            concurrency: 2,
        },
        sweeper: SweeperConfig {
            // The built-in sweeper stays quiet; tests drive their own.
            interval: Duration::from_secs(3600),
            ..SweeperConfig::default()
        },
        ..PipelineConfig::default()
    };

    let pipeline = Pipeline::start(
        store.clone(),
        filter,
        Collaborators {
            classifier: classifier.clone(),
            address_validator: validator,
            card_network: network.clone(),
            predictor,
        },
        config,
    );

    let sweeper = Sweeper::new(
        store.clone(),
        pipeline.tracker(),
        SweeperConfig {
            interval: Duration::from_secs(3600),
            min_age: Duration::ZERO,
            pass_limit: 100,
            retention: None,
        },
        CancellationToken::new(),
    );

    Harness {
        store,
        pipeline,
        network,
        sweeper,
    }
}

async fn seed_batch(
    store: &InMemoryStore,
    names: &[&str],
    enabled: EnabledStages,
) -> (BatchId, Vec<RecordId>) {
    let batch = Batch::new("payees.csv".to_string(), "payees-1.csv".to_string(), enabled);
    store.create_batch(&batch).await.unwrap();
    let records: Vec<Record> = names
        .iter()
        .map(|name| {
            Record::new(
                batch.id,
                name.to_string(),
                normalize_name(name),
                serde_json::Map::new(),
            )
        })
        .collect();
    let ids = records.iter().map(|r| r.id).collect();
    store.insert_records(&records).await.unwrap();
    (batch.id, ids)
}

async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(WAIT_TICK).await;
    }
}

async fn wait_for_batch_status(store: &InMemoryStore, batch_id: BatchId, status: BatchStatus) {
    wait_for(&format!("batch status {status}"), || async move {
        store.get_batch(batch_id).await.unwrap().status == status
    })
    .await;
}

async fn wait_for_stage(store: &InMemoryStore, record_id: RecordId, stage: Stage, status: StageStatus) {
    wait_for(&format!("record stage {stage} -> {status}"), || async move {
        store.get_record(record_id).await.unwrap().stages.get(stage).status == status
    })
    .await;
}

fn hit_for(record_id: RecordId) -> MerchantHit {
    MerchantHit {
        search_request_id: record_id.as_uuid().to_string(),
        confidence: Some(0.88),
        business_name: Some("ACME WIDGETS LLC".to_string()),
        merchant_ids: vec!["m-1".to_string()],
        mcc: Some("5045".to_string()),
        ..MerchantHit::default()
    }
}

fn results_ready_event(event_id: &str, search_id: &SearchId) -> WebhookEvent {
    WebhookEvent::new(
        EventId::from(event_id),
        "BULK_SEARCH_RESULTS_READY".to_string(),
        search_id.clone(),
        serde_json::json!({
            "eventId": event_id,
            "eventType": "BULK_SEARCH_RESULTS_READY",
            "data": { "bulkRequestId": search_id.0 },
        }),
    )
}

async fn submitted_search_id(network: &MockCardNetwork) -> SearchId {
    let mut found = None;
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while found.is_none() {
        found = network
            .submissions()
            .into_iter()
            .find_map(|s| s.issued_id);
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for a bulk submission");
        }
        tokio::time::sleep(WAIT_TICK).await;
    }
    found.unwrap()
}

// ----------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------

#[tokio::test]
async fn exclusion_short_circuit() {
    let h = harness();
    h.store
        .create_keyword(ExclusionKeyword::new("bank", None, None))
        .await
        .unwrap();

    h.network
        .push_submit_response(Ok(SearchId::from("bulk-excl")));

    let (batch_id, ids) = seed_batch(
        &h.store,
        &["Bank of America", "Acme Widgets Inc"],
        EnabledStages {
            supplier: true,
            address: false,
            merchant: true,
            prediction: true,
        },
    )
    .await;
    h.pipeline.submit_batch(batch_id).await.unwrap();

    // The non-excluded record reaches the card network; resolve it.
    let search_id = submitted_search_id(&h.network).await;
    h.network.push_results(
        search_id.clone(),
        Ok(BulkSearchResults {
            status: BulkSearchStatus::Completed,
            items: vec![hit_for(ids[1])],
        }),
    );
    let event = results_ready_event("evt-excl", &search_id);
    assert!(h.store.insert_webhook_event(&event).await.unwrap());
    h.pipeline.tracker().handle_event(event).await;

    wait_for_batch_status(&h.store, batch_id, BatchStatus::Completed).await;

    let excluded = h.store.get_record(ids[0]).await.unwrap();
    assert!(excluded.is_excluded);
    assert_eq!(excluded.exclusion_keyword.as_deref(), Some("bank"));
    // Classification still ran for the excluded record.
    assert_eq!(excluded.stages.classification.status, StageStatus::Completed);
    assert!(excluded.classification.is_some());
    // Everything costly is skipped with the exclusion reason.
    for stage in [Stage::Supplier, Stage::Merchant, Stage::Prediction] {
        assert_eq!(excluded.stages.get(stage).status, StageStatus::Skipped);
        assert_eq!(excluded.stages.get(stage).error.as_deref(), Some("excluded"));
    }

    let enriched = h.store.get_record(ids[1]).await.unwrap();
    assert!(!enriched.is_excluded);
    assert_eq!(enriched.stages.classification.status, StageStatus::Completed);
    assert_eq!(enriched.stages.supplier.status, StageStatus::Completed);
    assert_eq!(enriched.stages.merchant.status, StageStatus::Completed);
    assert_eq!(enriched.stages.prediction.status, StageStatus::Completed);
    let merchant = enriched.merchant.unwrap();
    assert_eq!(merchant.match_status, MerchantMatchStatus::Matched);

    // The excluded record never appears in any submission payload.
    let excluded_corr = ids[0].as_uuid().to_string();
    for submission in h.network.submissions() {
        assert!(submission
            .searches
            .iter()
            .all(|row| row.search_request_id != excluded_corr));
    }

    let batch = h.store.get_batch(batch_id).await.unwrap();
    assert_eq!(batch.processed_records, 2);
    assert_eq!(batch.skipped_records, 1);

    h.pipeline.shutdown().await;
}

#[tokio::test]
async fn fully_excluded_batch_reports_stages_skipped() {
    let h = harness();
    h.store
        .create_keyword(ExclusionKeyword::new("bank", None, None))
        .await
        .unwrap();

    // Every record matches the keyword; nothing may reach the costly
    // stages.
    let (batch_id, ids) = seed_batch(
        &h.store,
        &["First National Bank", "Bank of Springfield"],
        EnabledStages {
            supplier: true,
            address: false,
            merchant: true,
            prediction: true,
        },
    )
    .await;
    h.pipeline.submit_batch(batch_id).await.unwrap();

    wait_for_batch_status(&h.store, batch_id, BatchStatus::Completed).await;

    for id in &ids {
        let record = h.store.get_record(*id).await.unwrap();
        assert!(record.is_excluded);
        assert_eq!(record.stages.classification.status, StageStatus::Completed);
        for stage in [Stage::Supplier, Stage::Merchant, Stage::Prediction] {
            assert_eq!(record.stages.get(stage).status, StageStatus::Skipped);
            assert_eq!(record.stages.get(stage).error.as_deref(), Some("excluded"));
        }
    }

    // No record entered the enrichment counters, so the aggregate stage
    // statuses come out skipped, not failed.
    let batch = h.store.get_batch(batch_id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Completed);
    for stage in [Stage::Supplier, Stage::Merchant, Stage::Prediction] {
        let counters = batch.stages.get(stage);
        assert_eq!(counters.status, StageStatus::Skipped, "{stage} aggregate");
        assert_eq!(counters.total, 0);
        assert_eq!(counters.processed, 0);
    }
    assert_eq!(batch.skipped_records, 2);
    assert_eq!(batch.processed_records, 2);

    // Nothing was ever submitted to the card network.
    assert!(h.network.submissions().is_empty());

    h.pipeline.shutdown().await;
}

#[tokio::test]
async fn webhook_before_poll() {
    let h = harness();
    h.network.push_submit_response(Ok(SearchId::from("bulk-wh")));

    let (batch_id, ids) = seed_batch(
        &h.store,
        &["Acme Widgets", "Globex Corp"],
        EnabledStages {
            supplier: false,
            address: false,
            merchant: true,
            prediction: false,
        },
    )
    .await;
    h.pipeline.submit_batch(batch_id).await.unwrap();

    let search_id = submitted_search_id(&h.network).await;
    h.network.push_results(
        search_id.clone(),
        Ok(BulkSearchResults {
            status: BulkSearchStatus::Completed,
            items: vec![hit_for(ids[0]), hit_for(ids[1])],
        }),
    );

    // Webhook lands first.
    let event = results_ready_event("evt-wh", &search_id);
    assert!(h.store.insert_webhook_event(&event).await.unwrap());
    h.pipeline.tracker().handle_event(event).await;

    wait_for_stage(&h.store, ids[0], Stage::Merchant, StageStatus::Completed).await;
    wait_for_stage(&h.store, ids[1], Stage::Merchant, StageStatus::Completed).await;

    let search = h.store.get_search(&search_id).await.unwrap();
    assert_eq!(search.status(), SearchStatus::Completed);
    assert_eq!(search.poll_attempts(), 0);
    let fetches_after_webhook = h.network.result_calls().len();
    assert_eq!(fetches_after_webhook, 1);

    // The late poller observes the terminal request and exits without
    // touching the collaborator again.
    let polled = h.sweeper.sweep_once().await.unwrap();
    assert_eq!(polled, 0);
    assert_eq!(h.network.result_calls().len(), fetches_after_webhook);

    wait_for_batch_status(&h.store, batch_id, BatchStatus::Completed).await;
    h.pipeline.shutdown().await;
}

#[tokio::test]
async fn poll_after_webhook_lost() {
    let h = harness();
    h.network.push_submit_response(Ok(SearchId::from("bulk-poll")));

    let (batch_id, ids) = seed_batch(
        &h.store,
        &["Acme Widgets", "Globex Corp"],
        EnabledStages {
            supplier: false,
            address: false,
            merchant: true,
            prediction: false,
        },
    )
    .await;
    h.pipeline.submit_batch(batch_id).await.unwrap();
    let search_id = submitted_search_id(&h.network).await;

    // No webhook ever arrives. First poll: still running.
    h.network.push_results(
        search_id.clone(),
        Ok(BulkSearchResults {
            status: BulkSearchStatus::InProgress,
            items: vec![],
        }),
    );
    assert_eq!(h.sweeper.sweep_once().await.unwrap(), 1);
    let search = h.store.get_search(&search_id).await.unwrap();
    assert_eq!(search.status(), SearchStatus::Polling);
    assert_eq!(search.poll_attempts(), 1);

    // Second poll: done.
    h.network.push_results(
        search_id.clone(),
        Ok(BulkSearchResults {
            status: BulkSearchStatus::Completed,
            items: vec![hit_for(ids[0]), hit_for(ids[1])],
        }),
    );
    assert_eq!(h.sweeper.sweep_once().await.unwrap(), 1);

    wait_for_stage(&h.store, ids[0], Stage::Merchant, StageStatus::Completed).await;
    wait_for_stage(&h.store, ids[1], Stage::Merchant, StageStatus::Completed).await;

    let search = h.store.get_search(&search_id).await.unwrap();
    assert_eq!(search.status(), SearchStatus::Completed);
    assert!(search.poll_attempts() > 0);

    wait_for_batch_status(&h.store, batch_id, BatchStatus::Completed).await;
    h.pipeline.shutdown().await;
}

#[tokio::test]
async fn no_match_for_entire_submission() {
    let h = harness();
    h.network.push_submit_response(Ok(SearchId::from("bulk-nm")));

    let (batch_id, ids) = seed_batch(
        &h.store,
        &["Acme Widgets", "Globex Corp"],
        EnabledStages {
            supplier: false,
            address: false,
            merchant: true,
            prediction: false,
        },
    )
    .await;
    h.pipeline.submit_batch(batch_id).await.unwrap();
    let search_id = submitted_search_id(&h.network).await;

    h.network.push_results(
        search_id.clone(),
        Ok(BulkSearchResults {
            status: BulkSearchStatus::NoMatch,
            items: vec![],
        }),
    );
    assert_eq!(h.sweeper.sweep_once().await.unwrap(), 1);

    for id in &ids {
        wait_for_stage(&h.store, *id, Stage::Merchant, StageStatus::Completed).await;
        let record = h.store.get_record(*id).await.unwrap();
        let merchant = record.merchant.expect("no-match enrichment written");
        assert_eq!(merchant.match_status, MerchantMatchStatus::NoMatch);
    }

    let search = h.store.get_search(&search_id).await.unwrap();
    assert_eq!(search.status(), SearchStatus::NoMatch);
    assert!(search.is_terminal());

    wait_for_batch_status(&h.store, batch_id, BatchStatus::Completed).await;
    h.pipeline.shutdown().await;
}

#[tokio::test]
async fn auth_failure_mid_stream_is_isolated() {
    let h = harness();
    let merchant_only = EnabledStages {
        supplier: false,
        address: false,
        merchant: true,
        prediction: false,
    };

    // First submission is acked, the second is rejected outright.
    h.network.push_submit_response(Ok(SearchId::from("bulk-ok")));
    h.network
        .push_submit_response(Err(ClientError::Auth("401 invalid consumer key".to_string())));
    h.network
        .push_submit_response(Err(ClientError::Auth("401 invalid consumer key".to_string())));

    let (batch_a, ids_a) = seed_batch(&h.store, &["Acme Widgets"], merchant_only).await;
    h.pipeline.submit_batch(batch_a).await.unwrap();
    let search_id = submitted_search_id(&h.network).await;

    let (batch_b, ids_b) = seed_batch(&h.store, &["Globex Corp"], merchant_only).await;
    h.pipeline.submit_batch(batch_b).await.unwrap();

    // Batch B's records fail terminally with the auth error.
    wait_for_stage(&h.store, ids_b[0], Stage::Merchant, StageStatus::Failed).await;
    let failed = h.store.get_record(ids_b[0]).await.unwrap();
    assert!(failed
        .stages
        .merchant
        .error
        .as_deref()
        .unwrap()
        .contains("authentication failed"));
    // Classification was unaffected; the batch as a whole did not abort.
    assert_eq!(failed.stages.classification.status, StageStatus::Completed);
    wait_for_batch_status(&h.store, batch_b, BatchStatus::Completed).await;

    // Batch A resolves normally.
    h.network.push_results(
        search_id.clone(),
        Ok(BulkSearchResults {
            status: BulkSearchStatus::Completed,
            items: vec![hit_for(ids_a[0])],
        }),
    );
    assert_eq!(h.sweeper.sweep_once().await.unwrap(), 1);
    wait_for_stage(&h.store, ids_a[0], Stage::Merchant, StageStatus::Completed).await;
    wait_for_batch_status(&h.store, batch_a, BatchStatus::Completed).await;

    h.pipeline.shutdown().await;
}

#[tokio::test]
async fn duplicate_webhook_applies_once() {
    let h = harness();
    h.network.push_submit_response(Ok(SearchId::from("bulk-dup")));

    let (batch_id, ids) = seed_batch(
        &h.store,
        &["Acme Widgets"],
        EnabledStages {
            supplier: false,
            address: false,
            merchant: true,
            prediction: false,
        },
    )
    .await;
    h.pipeline.submit_batch(batch_id).await.unwrap();
    let search_id = submitted_search_id(&h.network).await;

    h.network.push_results(
        search_id.clone(),
        Ok(BulkSearchResults {
            status: BulkSearchStatus::Completed,
            items: vec![hit_for(ids[0])],
        }),
    );

    let event = results_ready_event("evt-dup", &search_id);
    assert!(h.store.insert_webhook_event(&event).await.unwrap());
    // The replay is acknowledged but not stored a second time.
    assert!(!h.store.insert_webhook_event(&event).await.unwrap());

    h.pipeline.tracker().handle_event(event.clone()).await;
    wait_for_stage(&h.store, ids[0], Stage::Merchant, StageStatus::Completed).await;
    let first = h.store.get_record(ids[0]).await.unwrap();
    let first_enriched_at = first.merchant.as_ref().unwrap().enriched_at;

    // Even if processing raced the dedup, the second application is a
    // no-op: the stage is terminal.
    h.pipeline.tracker().handle_event(event).await;
    let second = h.store.get_record(ids[0]).await.unwrap();
    assert_eq!(second.merchant.unwrap().enriched_at, first_enriched_at);

    wait_for_batch_status(&h.store, batch_id, BatchStatus::Completed).await;
    h.pipeline.shutdown().await;
}

#[tokio::test]
async fn cancellation_after_submission() {
    let h = harness();
    h.network.push_submit_response(Ok(SearchId::from("bulk-cancel")));

    let (batch_id, ids) = seed_batch(
        &h.store,
        &["Acme Widgets", "Globex Corp"],
        EnabledStages {
            supplier: false,
            address: false,
            merchant: true,
            prediction: false,
        },
    )
    .await;
    h.pipeline.submit_batch(batch_id).await.unwrap();
    let search_id = submitted_search_id(&h.network).await;

    h.pipeline.cancel_batch(batch_id).await.unwrap();

    let search = h.store.get_search(&search_id).await.unwrap();
    assert_eq!(search.status(), SearchStatus::Cancelled);
    for id in &ids {
        let record = h.store.get_record(*id).await.unwrap();
        assert_eq!(record.stages.merchant.status, StageStatus::Failed);
        assert_eq!(record.stages.merchant.error.as_deref(), Some("cancelled"));
    }

    let batch = h.store.get_batch(batch_id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Cancelled);

    // A late webhook for the cancelled search does not resurrect it.
    h.network.push_results(
        search_id.clone(),
        Ok(BulkSearchResults {
            status: BulkSearchStatus::Completed,
            items: vec![hit_for(ids[0])],
        }),
    );
    let event = results_ready_event("evt-late", &search_id);
    h.store.insert_webhook_event(&event).await.unwrap();
    h.pipeline.tracker().handle_event(event).await;
    let search = h.store.get_search(&search_id).await.unwrap();
    assert_eq!(search.status(), SearchStatus::Cancelled);

    h.pipeline.shutdown().await;
}

#[tokio::test]
async fn oversized_group_splits_submissions() {
    let store = Arc::new(InMemoryStore::new());
    let filter = Arc::new(ExclusionFilter::new(store.clone()));
    let classifier = Arc::new(MockClassifier::new());
    classifier.set_default(business_classification());
    let network = Arc::new(MockCardNetwork::new());
    network.push_submit_response(Ok(SearchId::from("bulk-a")));
    network.push_submit_response(Ok(SearchId::from("bulk-b")));

    let pipeline = Pipeline::start(
        store.clone(),
        filter,
        Collaborators {
            classifier,
            address_validator: Arc::new(MockAddressValidator::new()),
            card_network: network.clone(),
            predictor: Arc::new(MockPredictor::new()),
        },
        PipelineConfig {
            merchant: MerchantConfig {
                max_records_per_search: 2,
                linger: Duration::from_millis(100),
                concurrency: 1,
            },
            sweeper: SweeperConfig {
                interval: Duration::from_secs(3600),
                ..SweeperConfig::default()
            },
            ..PipelineConfig::default()
        },
    );

    let (batch_id, _ids) = seed_batch(
        &store,
        &["Acme Widgets", "Globex Corp", "Initech LLC"],
        EnabledStages {
            supplier: false,
            address: false,
            merchant: true,
            prediction: false,
        },
    )
    .await;
    pipeline.submit_batch(batch_id).await.unwrap();

    let network_ref = &network;
    wait_for("two split submissions", || async move {
        network_ref.submissions().len() == 2
    })
    .await;

    let sizes: Vec<usize> = network
        .submissions()
        .iter()
        .map(|s| s.searches.len())
        .collect();
    assert_eq!(sizes.iter().sum::<usize>(), 3);
    assert!(sizes.iter().all(|len| *len <= 2));

    pipeline.shutdown().await;
}

#[tokio::test]
async fn prediction_waits_for_other_stages() {
    let h = harness();
    h.network.push_submit_response(Ok(SearchId::from("bulk-pred")));

    let (batch_id, ids) = seed_batch(
        &h.store,
        &["Acme Widgets"],
        EnabledStages {
            supplier: true,
            address: false,
            merchant: true,
            prediction: true,
        },
    )
    .await;
    h.pipeline.submit_batch(batch_id).await.unwrap();
    let search_id = submitted_search_id(&h.network).await;

    // Supplier finishes quickly; merchant is still outstanding, so
    // prediction must not have run yet.
    wait_for_stage(&h.store, ids[0], Stage::Supplier, StageStatus::Completed).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let record = h.store.get_record(ids[0]).await.unwrap();
    assert_eq!(record.stages.prediction.status, StageStatus::Pending);

    // Merchant resolves; prediction follows.
    h.network.push_results(
        search_id.clone(),
        Ok(BulkSearchResults {
            status: BulkSearchStatus::Completed,
            items: vec![hit_for(ids[0])],
        }),
    );
    h.sweeper.sweep_once().await.unwrap();

    wait_for_stage(&h.store, ids[0], Stage::Prediction, StageStatus::Completed).await;
    let record = h.store.get_record(ids[0]).await.unwrap();
    assert!(record.prediction.is_some());

    wait_for_batch_status(&h.store, batch_id, BatchStatus::Completed).await;
    h.pipeline.shutdown().await;
}

#[tokio::test]
async fn classification_failure_is_local_to_the_record() {
    let store = Arc::new(InMemoryStore::new());
    let filter = Arc::new(ExclusionFilter::new(store.clone()));
    let classifier = Arc::new(MockClassifier::new());
    classifier.set_default(business_classification());
    // The first record burns both attempts; the second gets the default.
    // Single-worker classification keeps the queue order deterministic.
    classifier.push_response(Err(ClientError::Status {
        status: 503,
        body: "unavailable".to_string(),
    }));
    classifier.push_response(Err(ClientError::Status {
        status: 503,
        body: "unavailable".to_string(),
    }));

    let pipeline = Pipeline::start(
        store.clone(),
        filter,
        Collaborators {
            classifier,
            address_validator: Arc::new(MockAddressValidator::new()),
            card_network: Arc::new(MockCardNetwork::new()),
            predictor: Arc::new(MockPredictor::new()),
        },
        PipelineConfig {
            concurrency: dossier::StageConcurrency {
                classify: 1,
                ..dossier::StageConcurrency::default()
            },
            retry: RetryPolicy {
                max_attempts: 2,
                backoff_ms: 1,
                backoff_factor: 1,
                max_backoff_ms: 2,
            },
            sweeper: SweeperConfig {
                interval: Duration::from_secs(3600),
                ..SweeperConfig::default()
            },
            ..PipelineConfig::default()
        },
    );

    let (batch_id, ids) = seed_batch(
        &store,
        &["Flaky Classify Target", "Acme Widgets"],
        EnabledStages {
            supplier: true,
            address: false,
            merchant: false,
            prediction: false,
        },
    )
    .await;
    pipeline.submit_batch(batch_id).await.unwrap();

    wait_for_batch_status(&store, batch_id, BatchStatus::Completed).await;

    // Exactly one record failed classification; the batch still
    // completed and the other record was fully processed.
    let records = store.list_records(batch_id, 0, 10).await.unwrap();
    let failed: Vec<_> = records
        .iter()
        .filter(|r| r.stages.classification.status == StageStatus::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].classification.is_none());
    let succeeded = records
        .iter()
        .find(|r| r.stages.classification.status == StageStatus::Completed)
        .unwrap();
    assert!(succeeded.classification.is_some());

    let batch = store.get_batch(batch_id).await.unwrap();
    assert_eq!(batch.processed_records, 2);
    assert_eq!(batch.stages.classification.processed, 2);
    assert_eq!(batch.stages.classification.succeeded, 1);
    let _ = ids;

    pipeline.shutdown().await;
}
