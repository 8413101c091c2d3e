use async_trait::async_trait;
use checklist_match::error::{AppError, OracleError, StoreError};
use checklist_match::models::{Batch, Confidence, JobStatus, MatchOutcome, TokenUsage, WorkItem};
use checklist_match::orchestrator::{BatchScheduler, JobContext, JobRegistry};
use checklist_match::services::{
    BlobStore, DocumentContext, MatchOracle, MemoryBlobStore, OracleAnswer, ProgressTracker, ReferenceValidator,
    ResultCombiner, ResultStore,
};
use checklist_match::SchedulerOptions;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_test::{assert_err, assert_ok};

const ALWAYS: u32 = u32::MAX;

/// 按脚本失败的 oracle
#[derive(Default)]
struct ScriptedOracle {
    /// batch_index → 前几次调用失败
    failures: HashMap<usize, u32>,
    error: Option<OracleError>,
    prepare_error: Option<OracleError>,
    delay: Duration,
    slow_batches: HashMap<usize, Duration>,
    calls: Mutex<HashMap<usize, u32>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedOracle {
    fn calls_for(&self, batch_index: usize) -> u32 {
        self.calls.lock().unwrap().get(&batch_index).copied().unwrap_or(0)
    }

    fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl MatchOracle for ScriptedOracle {
    async fn prepare(&self, _context: &DocumentContext) -> Result<(), OracleError> {
        match &self.prepare_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    async fn match_batch(
        &self,
        batch: &Batch,
        _context: &DocumentContext,
        _prior_instructions: Option<&str>,
    ) -> Result<OracleAnswer, OracleError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let n = calls.entry(batch.batch_index).or_insert(0);
            *n += 1;
            *n
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = self
            .slow_batches
            .get(&batch.batch_index)
            .copied()
            .unwrap_or(self.delay);
        tokio::time::sleep(delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let failures = self.failures.get(&batch.batch_index).copied().unwrap_or(0);
        if call <= failures {
            return Err(self
                .error
                .clone()
                .unwrap_or_else(|| OracleError::Api("scripted failure".into())));
        }

        let outcomes = batch
            .items
            .iter()
            .map(|item| MatchOutcome {
                row_id: item.row_id,
                found: true,
                confidence: Confidence::High,
                sheet_references: vec!["A-101".into()],
                spec_references: vec!["03 30 00".into()],
                notes: String::new(),
                reasoning: format!("found {}", item.description),
                validation_score: 0.9,
            })
            .collect();

        Ok(OracleAnswer {
            outcomes,
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 20,
                ..TokenUsage::default()
            },
        })
    }
}

/// 写入总是失败的存储
struct FailingBlobStore;

#[async_trait]
impl BlobStore for FailingBlobStore {
    async fn put_new(&self, key: &str, _bytes: Vec<u8>) -> Result<(), StoreError> {
        Err(StoreError::KeyCollision { key: key.to_string() })
    }

    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(None)
    }

    async fn list(&self, _partition: &str) -> Result<Vec<String>, StoreError> {
        Ok(Vec::new())
    }

    async fn delete(&self, _key: &str) -> Result<bool, StoreError> {
        Ok(false)
    }
}

struct Harness {
    scheduler: BatchScheduler,
    oracle: Arc<ScriptedOracle>,
    store: Arc<ResultStore>,
    blobs: Arc<MemoryBlobStore>,
    tracker: Arc<ProgressTracker>,
    registry: Arc<JobRegistry>,
}

impl Harness {
    fn new(oracle: ScriptedOracle, options: SchedulerOptions) -> Self {
        let blobs = Arc::new(MemoryBlobStore::new());
        Self::with_blobs(oracle, options, blobs.clone(), blobs)
    }

    fn with_blobs(
        oracle: ScriptedOracle,
        options: SchedulerOptions,
        blob_store: Arc<dyn BlobStore>,
        blobs: Arc<MemoryBlobStore>,
    ) -> Self {
        let oracle = Arc::new(oracle);
        let store = Arc::new(ResultStore::new(blob_store));
        let tracker = Arc::new(ProgressTracker::new());
        let registry = Arc::new(JobRegistry::new());
        let scheduler = BatchScheduler::new(
            oracle.clone(),
            Arc::new(ReferenceValidator::new().unwrap()),
            store.clone(),
            tracker.clone(),
            registry.clone(),
            options,
        );
        Self {
            scheduler,
            oracle,
            store,
            blobs,
            tracker,
            registry,
        }
    }

    fn combiner(&self) -> ResultCombiner {
        ResultCombiner::new(self.store.clone())
    }
}

fn catalog(n: u32) -> Vec<WorkItem> {
    (1..=n)
        .map(|i| WorkItem::new(i, "Concrete", "Foundations", format!("Check item {}", i), "Commercial"))
        .collect()
}

fn options(max_retries: u32) -> SchedulerOptions {
    SchedulerOptions {
        max_retries,
        retry_delay: Duration::from_millis(5),
        backoff_factor: 2.0,
        oracle_timeout: Duration::from_secs(5),
    }
}

fn ctx(timeout: Duration) -> JobContext {
    JobContext::new("session-1", DocumentContext::default(), timeout)
}

#[tokio::test]
async fn test_all_batches_succeed() {
    let h = Harness::new(ScriptedOracle::default(), options(3));

    let result = assert_ok!(h.scheduler.run(&catalog(125), 50, 3, ctx(Duration::from_secs(30))).await);

    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.outcomes.len(), 125);
    assert_eq!(result.fallback_count, 0);
    let rows: Vec<u32> = result.outcomes.iter().map(|o| o.row_id).collect();
    assert_eq!(rows, (1..=125).collect::<Vec<u32>>());
    assert_eq!(h.oracle.total_calls(), 3);

    let snapshot = h.tracker.get(&result.tracker_id).unwrap();
    assert_eq!(snapshot.status, JobStatus::Completed);
    assert_eq!(snapshot.progress_percentage, 100.0);
    assert_eq!(snapshot.items_processed, 125);
    assert_eq!(snapshot.found_items, 125);

    let report = h.combiner().combine("session-1", &result.process_id).await.unwrap();
    assert_eq!(report.total_batches, 3);
    assert_eq!(report.successful_batches, 3);
    assert_eq!(report.outcomes.len(), 125);
    assert_eq!(report.fallback_items, 0);
    assert_eq!(report.token_usage.input_tokens, 300);
}

#[tokio::test]
async fn test_batch_recovers_after_retries() {
    let oracle = ScriptedOracle {
        failures: HashMap::from([(2, 2)]),
        ..Default::default()
    };
    let h = Harness::new(oracle, options(2));

    let result = h
        .scheduler
        .run(&catalog(125), 50, 3, ctx(Duration::from_secs(30)))
        .await
        .unwrap();

    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.fallback_count, 0);
    assert_eq!(h.oracle.calls_for(2), 3);

    let records = h.store.records_for("session-1", &result.process_id).await.unwrap();
    let batch_two = records.iter().filter(|(_, r)| r.batch_index == 2).count();
    assert_eq!(batch_two, 3);

    let report = h.combiner().combine("session-1", &result.process_id).await.unwrap();
    assert_eq!(report.total_attempts, 5);
    assert_eq!(report.failed_batches, 0);
    assert!(report
        .outcomes
        .iter()
        .filter(|o| o.row_id > 100)
        .all(|o| o.found && o.confidence == Confidence::High));
}

#[tokio::test]
async fn test_exhausted_batch_falls_back_and_job_completes() {
    let oracle = ScriptedOracle {
        failures: HashMap::from([(0, ALWAYS)]),
        ..Default::default()
    };
    let h = Harness::new(oracle, options(1));

    let result = h
        .scheduler
        .run(&catalog(4), 2, 2, ctx(Duration::from_secs(30)))
        .await
        .unwrap();

    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.fallback_count, 2);
    assert_eq!(h.oracle.calls_for(0), 2);

    for outcome in result.outcomes.iter().filter(|o| o.row_id <= 2) {
        assert!(!outcome.found);
        assert_eq!(outcome.confidence, Confidence::Low);
        assert!(outcome.reasoning.contains("scripted failure"));
    }
    assert!(result.outcomes.iter().filter(|o| o.row_id > 2).all(|o| o.found));

    let report = h.combiner().combine("session-1", &result.process_id).await.unwrap();
    assert_eq!(report.failed_batches, 1);
    assert_eq!(report.fallback_items, 2);
    assert_eq!(report.success_rate, 50.0);
}

#[tokio::test]
async fn test_prepare_failure_fails_job_without_records() {
    let oracle = ScriptedOracle {
        prepare_error: Some(OracleError::Unreachable("connection refused".into())),
        ..Default::default()
    };
    let h = Harness::new(oracle, options(3));

    let result = h
        .scheduler
        .run(&catalog(10), 5, 2, ctx(Duration::from_secs(30)))
        .await
        .unwrap();

    assert_eq!(result.status, JobStatus::Failed);
    assert!(result.outcomes.is_empty());
    assert!(result.error.unwrap().contains("oracle unavailable"));
    assert_eq!(h.oracle.total_calls(), 0);
    assert!(h.blobs.is_empty());
    assert_eq!(h.registry.get(&result.process_id).unwrap().status, JobStatus::Failed);
}

#[tokio::test]
async fn test_deadline_lets_in_flight_attempt_finish() {
    let oracle = ScriptedOracle {
        slow_batches: HashMap::from([(1, Duration::from_millis(300))]),
        ..Default::default()
    };
    let h = Harness::new(oracle, options(5));

    let result = h
        .scheduler
        .run(&catalog(4), 2, 2, ctx(Duration::from_millis(100)))
        .await
        .unwrap();

    assert_eq!(result.status, JobStatus::Failed);
    assert!(result.error.unwrap().starts_with("deadline exceeded"));
    assert_eq!(result.unresolved_batches, 0);
    assert_eq!(h.oracle.calls_for(1), 1);
    assert_eq!(result.outcomes.len(), 4);
    assert!(result.outcomes.iter().all(|o| o.found));

    let report = h.combiner().combine("session-1", &result.process_id).await.unwrap();
    assert_eq!(report.successful_batches, 2);
    assert_eq!(report.fallback_items, 0);
}

#[tokio::test]
async fn test_deadline_stops_retries_and_keeps_partial_results() {
    let oracle = ScriptedOracle {
        failures: HashMap::from([(1, 1)]),
        slow_batches: HashMap::from([(1, Duration::from_millis(300))]),
        ..Default::default()
    };
    let h = Harness::new(oracle, options(5));

    let result = h
        .scheduler
        .run(&catalog(4), 2, 2, ctx(Duration::from_millis(100)))
        .await
        .unwrap();

    assert_eq!(result.status, JobStatus::Failed);
    assert_eq!(result.unresolved_batches, 1);
    assert_eq!(h.oracle.calls_for(1), 1);
    let rows: Vec<u32> = result.outcomes.iter().map(|o| o.row_id).collect();
    assert_eq!(rows, vec![1, 2]);

    let report = h.combiner().combine("session-1", &result.process_id).await.unwrap();
    assert_eq!(report.successful_batches, 1);
    assert_eq!(report.failed_batches, 1);
    assert!(report.outcomes.iter().filter(|o| o.row_id <= 2).all(|o| o.found));
}

#[tokio::test]
async fn test_oracle_timeout_reports_actual_limit() {
    let oracle = ScriptedOracle {
        slow_batches: HashMap::from([(0, Duration::from_secs(2))]),
        ..Default::default()
    };
    let mut opts = options(0);
    opts.oracle_timeout = Duration::from_millis(50);
    let h = Harness::new(oracle, opts);

    let started = Instant::now();
    let result = h
        .scheduler
        .run(&catalog(2), 2, 1, ctx(Duration::from_secs(30)))
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(result.fallback_count, 2);
    assert!(result
        .outcomes
        .iter()
        .all(|o| o.reasoning.contains("50毫秒")));
}

#[tokio::test]
async fn test_unreachable_oracle_fails_job() {
    let oracle = ScriptedOracle {
        failures: HashMap::from([(0, ALWAYS), (1, ALWAYS)]),
        error: Some(OracleError::Unreachable("dns lookup failed".into())),
        ..Default::default()
    };
    let h = Harness::new(oracle, options(1));

    let result = h
        .scheduler
        .run(&catalog(4), 2, 2, ctx(Duration::from_secs(30)))
        .await
        .unwrap();

    assert_eq!(result.status, JobStatus::Failed);
    assert!(result.error.unwrap().contains("unreachable"));
    assert_eq!(result.fallback_count, 4);
    assert_eq!(h.oracle.total_calls(), 4);
}

#[tokio::test]
async fn test_concurrency_limit_is_respected() {
    let oracle = ScriptedOracle {
        delay: Duration::from_millis(30),
        ..Default::default()
    };
    let h = Harness::new(oracle, options(0));

    let result = h
        .scheduler
        .run(&catalog(6), 1, 2, ctx(Duration::from_secs(30)))
        .await
        .unwrap();

    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.outcomes.len(), 6);
    let peak = h.oracle.peak_in_flight.load(Ordering::SeqCst);
    assert!(peak >= 1 && peak <= 2, "peak in flight was {}", peak);
}

#[tokio::test]
async fn test_empty_catalog_completes_immediately() {
    let h = Harness::new(ScriptedOracle::default(), options(3));

    let result = h
        .scheduler
        .run(&[], 50, 3, ctx(Duration::from_secs(30)))
        .await
        .unwrap();

    assert_eq!(result.status, JobStatus::Completed);
    assert!(result.outcomes.is_empty());

    let history = h.tracker.history(&result.tracker_id).unwrap();
    let statuses: Vec<JobStatus> = history.iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![JobStatus::Pending, JobStatus::Processing, JobStatus::Completed]
    );
    assert_eq!(history.last().unwrap().progress_percentage, 0.0);
}

#[tokio::test]
async fn test_submit_signals_completion() {
    let oracle = ScriptedOracle {
        delay: Duration::from_millis(10),
        ..Default::default()
    };
    let h = Harness::new(oracle, options(3));

    let mut handle = h
        .scheduler
        .submit(catalog(10), 5, 2, ctx(Duration::from_secs(30)));
    assert_eq!(h.registry.get(&handle.process_id).unwrap().session_id, "session-1");

    assert_eq!(handle.wait(Duration::from_secs(5)).await, Some(JobStatus::Completed));
    assert_eq!(h.registry.get(&handle.process_id).unwrap().status, JobStatus::Completed);

    let result = assert_ok!(handle.join().await);
    assert_eq!(result.outcomes.len(), 10);
}

#[tokio::test]
async fn test_store_failure_fails_job() {
    let h = Harness::with_blobs(
        ScriptedOracle::default(),
        options(3),
        Arc::new(FailingBlobStore),
        Arc::new(MemoryBlobStore::new()),
    );

    let handle = h
        .scheduler
        .submit(catalog(4), 2, 1, ctx(Duration::from_secs(30)));
    let process_id = handle.process_id.clone();

    let err = assert_err!(handle.join().await);
    assert!(matches!(err, AppError::Store(StoreError::KeyCollision { .. })));
    assert_eq!(h.registry.get(&process_id).unwrap().status, JobStatus::Failed);
}
