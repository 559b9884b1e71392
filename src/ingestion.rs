use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::model::Source;
use crate::normalizer::Normalizer;
use crate::parsers::Detector;
use crate::store::Store;
use crate::validator::{validate, ValidationResult};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    PartiallyCompleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    PartiallyCompleted,
    Failed,
}

#[derive(Debug, Clone)]
pub struct FileResult {
    pub path: PathBuf,
    pub status: FileStatus,
    /// Always equals `records_created + records_updated + records_rejected`.
    pub records_processed: usize,
    pub records_created: usize,
    pub records_updated: usize,
    pub records_rejected: usize,
    pub validation_results: Vec<ValidationResult>,
    pub error_message: Option<String>,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct BatchResult {
    pub batch_id: Uuid,
    pub status: BatchStatus,
    pub file_results: Vec<FileResult>,
}

#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub batch_id: Uuid,
    pub file: PathBuf,
    pub phase: &'static str,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: &'static str,
    pub issue_summary: String,
}

#[derive(Debug, Clone)]
pub struct StatusReport {
    pub batch_id: Option<Uuid>,
    pub status: BatchStatus,
    pub files_completed: usize,
    pub files_failed: usize,
    pub files_total: usize,
}

/// Orchestrates dialect detection, validation, normalization and storage for
/// one file, a batch, or a backgrounded batch. Per-file failures never abort
/// a batch; only transient Store errors are retried, with exponential
/// backoff bounded by `Config.ingest_retry_max`.
pub struct Orchestrator {
    store: Arc<dyn Store>,
    config: Config,
    audit_log: Mutex<Vec<AuditEntry>>,
    batches: Mutex<HashMap<Uuid, BatchResult>>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn Store>, config: Config) -> Self {
        Orchestrator {
            store,
            config,
            audit_log: Mutex::new(Vec::new()),
            batches: Mutex::new(HashMap::new()),
        }
    }

    pub async fn ingest_file(&self, path: &Path, _source_hint: Option<Source>) -> FileResult {
        self.ingest_file_for_batch(Uuid::nil(), path).await
    }

    async fn ingest_file_for_batch(&self, batch_id: Uuid, path: &Path) -> FileResult {
        let started = Utc::now();
        let start_instant = std::time::Instant::now();

        let outcome = self.run_file(path).await;

        let duration = start_instant.elapsed();
        let ended = Utc::now();

        let (status, records_processed, records_created, records_updated, records_rejected, validation_results, error_message) =
            match outcome {
                Ok((created, updated, rejected, validations)) => {
                    let any_invalid = rejected > 0;
                    let status = if any_invalid && created + updated > 0 {
                        FileStatus::PartiallyCompleted
                    } else if any_invalid {
                        FileStatus::Failed
                    } else {
                        FileStatus::Completed
                    };
                    (status, created + updated + rejected, created, updated, rejected, validations, None)
                }
                Err(e) => (FileStatus::Failed, 0, 0, 0, 0, vec![], Some(e.to_string())),
            };

        let issue_summary = validation_results
            .iter()
            .flat_map(|v| v.issues.iter())
            .map(|i| i.code)
            .collect::<Vec<_>>()
            .join(",");

        self.audit_log.lock().await.push(AuditEntry {
            batch_id,
            file: path.to_path_buf(),
            phase: "ingest",
            started_at: started,
            ended_at: ended,
            outcome: if status == FileStatus::Failed { "failed" } else { "ok" },
            issue_summary,
        });

        FileResult {
            path: path.to_path_buf(),
            status,
            records_processed,
            records_created,
            records_updated,
            records_rejected,
            validation_results,
            error_message,
            duration,
        }
    }

    /// Parses, validates and upserts every record found in `path`. Returns
    /// `(created, updated, rejected, validation_results)`; parse/validation
    /// failures surface as `Err` and are not retried, unlike
    /// `CoreError::StoreTransientError`.
    async fn run_file(&self, path: &Path) -> Result<(usize, usize, usize, Vec<ValidationResult>)> {
        let raw_bytes = tokio::fs::read(path).await?;
        let raw: serde_json::Value = serde_json::from_slice(&raw_bytes)?;

        let parsed_inputs = Detector::detect_and_parse(&raw)?;
        let normalizer = Normalizer::new(&self.config);

        let mut created = 0usize;
        let mut updated = 0usize;
        let mut rejected = 0usize;
        let mut validations = Vec::with_capacity(parsed_inputs.len());

        for input in parsed_inputs {
            let existing_accounts = self.store.all_accounts().await?;
            let validation = validate(&input, &existing_accounts);
            let is_valid = validation.is_valid;
            validations.push(validation);
            if !is_valid {
                rejected += 1;
                continue;
            }

            let record_id = crate::model::RecordId::compute(
                input.period_start,
                input.period_end,
                &input.currency.to_uppercase(),
            );
            let existing = self.store.get_record(&record_id).await?;
            let normalized = normalizer.normalize(input, existing.as_ref());

            let result = self
                .upsert_with_retry(
                    normalized.record,
                    normalized.accounts,
                    normalized.values,
                )
                .await?;

            match result.outcome {
                crate::store::UpsertOutcome::Created => created += 1,
                crate::store::UpsertOutcome::Updated => updated += 1,
            }
        }

        Ok((created, updated, rejected, validations))
    }

    async fn upsert_with_retry(
        &self,
        record: crate::model::FinancialRecord,
        accounts: Vec<crate::model::Account>,
        values: Vec<crate::model::AccountValue>,
    ) -> Result<crate::store::UpsertResult> {
        let mut attempt = 0u32;
        let mut backoff_ms = self.config.ingest_backoff_base_ms;

        loop {
            match self
                .store
                .upsert_record(record.clone(), accounts.clone(), values.clone())
                .await
            {
                Ok(result) => return Ok(result),
                Err(e) if e.is_transient() && attempt < self.config.ingest_retry_max => {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn ingest_batch(self: &Arc<Self>, paths: Vec<PathBuf>) -> BatchResult {
        let batch_id = Uuid::new_v4();
        let result = self.run_batch(batch_id, paths).await;
        self.batches.lock().await.insert(batch_id, result.clone());
        result
    }

    async fn run_batch(self: &Arc<Self>, batch_id: Uuid, paths: Vec<PathBuf>) -> BatchResult {
        let worker_count = self.config.ingest_workers.max(1);
        let mut join_set = JoinSet::new();
        let mut pending: Vec<PathBuf> = paths;
        let mut file_results = Vec::new();

        // Bound concurrency to `ingest_workers` by only keeping that many
        // tasks in flight at once.
        while !pending.is_empty() || !join_set.is_empty() {
            while join_set.len() < worker_count {
                let Some(path) = pending.pop() else { break };
                let this = Arc::clone(self);
                join_set.spawn(async move { this.ingest_file_for_batch(batch_id, &path).await });
            }
            if let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(file_result) => file_results.push(file_result),
                    Err(join_err) => file_results.push(FileResult {
                        path: PathBuf::new(),
                        status: FileStatus::Failed,
                        records_processed: 0,
                        records_created: 0,
                        records_updated: 0,
                        records_rejected: 0,
                        validation_results: vec![],
                        error_message: Some(format!("task panicked: {join_err}")),
                        duration: Duration::ZERO,
                    }),
                }
            }
        }

        let completed = file_results.iter().filter(|f| f.status == FileStatus::Completed).count();
        let failed = file_results.iter().filter(|f| f.status == FileStatus::Failed).count();
        let status = if failed == 0 {
            BatchStatus::Completed
        } else if completed > 0 || file_results.iter().any(|f| f.status == FileStatus::PartiallyCompleted) {
            BatchStatus::PartiallyCompleted
        } else {
            BatchStatus::Failed
        };

        BatchResult {
            batch_id,
            status,
            file_results,
        }
    }

    /// Enqueues a batch for background processing and returns immediately
    /// with its id; `status(Some(batch_id))` observes progress afterward.
    pub async fn ingest_batch_async(self: &Arc<Self>, paths: Vec<PathBuf>) -> Uuid {
        let batch_id = Uuid::new_v4();
        self.batches.lock().await.insert(
            batch_id,
            BatchResult {
                batch_id,
                status: BatchStatus::Pending,
                file_results: vec![],
            },
        );

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = this.run_batch(batch_id, paths).await;
            this.batches.lock().await.insert(batch_id, result);
        });

        batch_id
    }

    pub async fn status(&self, batch_id: Option<Uuid>) -> Result<StatusReport> {
        let batches = self.batches.lock().await;
        let Some(id) = batch_id else {
            return Err(CoreError::ValidationError("status() requires a batch_id".into()));
        };
        let batch = batches
            .get(&id)
            .ok_or_else(|| CoreError::DataNotFound(format!("batch {id}")))?;

        let files_completed = batch
            .file_results
            .iter()
            .filter(|f| matches!(f.status, FileStatus::Completed | FileStatus::PartiallyCompleted))
            .count();
        let files_failed = batch.file_results.iter().filter(|f| f.status == FileStatus::Failed).count();

        Ok(StatusReport {
            batch_id: Some(id),
            status: batch.status,
            files_completed,
            files_failed,
            files_total: batch.file_results.len(),
        })
    }

    pub async fn audit_log(&self) -> Vec<AuditEntry> {
        self.audit_log.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use std::io::Write;

    fn write_dialect_a(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        let body = serde_json::json!({
            "header": { "currency": "USD" },
            "columns": [{ "title": "Jan 2024", "start_date": "2024-01-01", "end_date": "2024-01-31" }],
            "rows": [
                { "name": "Revenue", "group": "revenue", "values": [10000.0] },
                { "name": "Expenses", "group": "expense", "values": [6000.0] }
            ]
        });
        file.write_all(body.to_string().as_bytes()).unwrap();
        path
    }

    #[tokio::test]
    async fn ingest_file_creates_a_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_dialect_a(&dir, "jan.json");

        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let orchestrator = Orchestrator::new(store, Config::default());
        let result = orchestrator.ingest_file(&path, None).await;

        assert_eq!(result.status, FileStatus::Completed);
        assert_eq!(result.records_created, 1);
    }

    #[tokio::test]
    async fn batch_isolates_per_file_failures() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_dialect_a(&dir, "good.json");
        let bad_path = dir.path().join("bad.json");
        std::fs::write(&bad_path, b"not json").unwrap();

        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let orchestrator = Arc::new(Orchestrator::new(store, Config::default()));
        let result = orchestrator.ingest_batch(vec![good, bad_path]).await;

        assert_eq!(result.status, BatchStatus::PartiallyCompleted);
        assert_eq!(result.file_results.len(), 2);
    }
}
