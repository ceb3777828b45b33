//! Concurrent processing of many documents.
//!
//! Documents run on spawned tasks bounded by a semaphore. Each worker owns
//! its own review state; the [`FixMemoryCache`] is the only thing they share.
//! Progress is reported over an optional event channel.

pub mod cache;
pub mod discover;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::analytics::BatchSummary;
use crate::errors::BatchError;
use crate::orchestrator::{ReviewOrchestrator, ReviewOutcome};
use crate::repair::fix_memory::FixMemory;

pub use cache::FixMemoryCache;
pub use discover::collect_documents;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_workers: usize,
    pub fix_memory_capacity: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            fix_memory_capacity: 128,
        }
    }
}

/// One document to process.
#[derive(Debug, Clone)]
pub struct DocumentInput {
    pub id: String,
    pub text: String,
    /// Where the text came from, when it was read from disk.
    pub path: Option<PathBuf>,
}

impl DocumentInput {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            path: None,
        }
    }

    /// Read a document from disk, using the path as its id.
    pub fn read(path: impl Into<PathBuf>) -> Result<Self, BatchError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|source| BatchError::ReadFailed {
            path: path.clone(),
            source,
        })?;
        Ok(Self {
            id: path.display().to_string(),
            text,
            path: Some(path),
        })
    }
}

/// Events emitted while a batch runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchEvent {
    Started {
        document: String,
    },
    Finished {
        document: String,
        iterations: u32,
        changed: bool,
        requires_human_review: bool,
        error: Option<String>,
    },
    WorkerFailed {
        document: String,
        error: String,
    },
    BatchCompleted {
        summary: BatchSummary,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerFailure {
    pub document: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub run_id: Uuid,
    /// Outcomes in input order. Documents whose worker failed are missing.
    pub outcomes: Vec<ReviewOutcome>,
    pub failures: Vec<WorkerFailure>,
    pub summary: BatchSummary,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
}

impl BatchReport {
    /// Every document converged without errors or escalation.
    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty() && self.outcomes.iter().all(ReviewOutcome::succeeded)
    }

    pub fn needs_attention(&self) -> impl Iterator<Item = &ReviewOutcome> {
        self.outcomes.iter().filter(|o| !o.succeeded())
    }
}

pub struct BatchProcessor {
    orchestrator: Arc<ReviewOrchestrator>,
    config: BatchConfig,
    cache: Arc<FixMemoryCache>,
    event_tx: Option<mpsc::Sender<BatchEvent>>,
    cancel: CancellationToken,
}

impl BatchProcessor {
    pub fn new(orchestrator: ReviewOrchestrator, config: BatchConfig) -> Self {
        let cache = Arc::new(FixMemoryCache::new(config.fix_memory_capacity));
        Self {
            orchestrator: Arc::new(orchestrator),
            config,
            cache,
            event_tx: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Share a cache with other processors, or keep it across batches.
    pub fn with_cache(mut self, cache: Arc<FixMemoryCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_event_channel(mut self, tx: mpsc::Sender<BatchEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cache(&self) -> &Arc<FixMemoryCache> {
        &self.cache
    }

    pub async fn run(&self, documents: Vec<DocumentInput>) -> BatchReport {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let workers = self.config.max_workers.max(1);
        tracing::info!(%run_id, documents = documents.len(), workers, "starting batch");

        let semaphore = Arc::new(Semaphore::new(workers));
        let mut handles: Vec<(String, JoinHandle<ReviewOutcome>)> = Vec::with_capacity(documents.len());

        for document in documents {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let orchestrator = Arc::clone(&self.orchestrator);
            let cache = Arc::clone(&self.cache);
            let event_tx = self.event_tx.clone();
            let cancel = self.cancel.clone();
            let id = document.id.clone();

            let handle = tokio::spawn(async move {
                let _permit = permit;
                emit(&event_tx, BatchEvent::Started {
                    document: document.id.clone(),
                })
                .await;

                let memory = cache.take(&document.id).unwrap_or_else(FixMemory::new);
                let mut outcome = orchestrator
                    .process_with(&document.id, &document.text, memory, &cancel)
                    .await;
                cache.put(&document.id, std::mem::take(&mut outcome.memory));

                emit(&event_tx, BatchEvent::Finished {
                    document: document.id.clone(),
                    iterations: outcome.iterations,
                    changed: outcome.changed,
                    requires_human_review: outcome.requires_human_review,
                    error: outcome.error.clone(),
                })
                .await;
                outcome
            });
            handles.push((id, handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        let mut failures = Vec::new();
        for (document, handle) in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(join_error) => {
                    let error = BatchError::WorkerPanicked {
                        document: document.clone(),
                        message: panic_message(join_error),
                    };
                    tracing::error!(%run_id, error = %error, "batch worker failed");
                    emit(&self.event_tx, BatchEvent::WorkerFailed {
                        document: document.clone(),
                        error: error.to_string(),
                    })
                    .await;
                    failures.push(WorkerFailure {
                        document,
                        error: error.to_string(),
                    });
                }
            }
        }

        let summary =
            BatchSummary::from_documents(outcomes.iter().map(|o| (&o.analytics, o.changed)));
        tracing::info!(
            %run_id,
            converged = summary.converged,
            escalated = summary.escalated,
            errored = summary.errored,
            failed_workers = failures.len(),
            "batch finished"
        );
        emit(&self.event_tx, BatchEvent::BatchCompleted {
            summary: summary.clone(),
        })
        .await;

        BatchReport {
            run_id,
            outcomes,
            failures,
            summary,
            duration: started.elapsed(),
        }
    }
}

async fn emit(tx: &Option<mpsc::Sender<BatchEvent>>, event: BatchEvent) {
    if let Some(tx) = tx {
        tx.send(event).await.ok();
    }
}

fn panic_message(error: tokio::task::JoinError) -> String {
    if error.is_cancelled() {
        return "task was cancelled".to_string();
    }
    let payload = error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::builtin::DocumentRules;
    use crate::collaborators::{FixContext, FixOutput, Validator, ValidatorKind};
    use crate::errors::CollaboratorError;
    use crate::orchestrator::{Collaborators, ReviewProfile, ReviewSettings};
    use crate::review::issue::Issue;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Tracks how many validations run at the same time.
    #[derive(Default)]
    struct ConcurrencyGauge {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Validator for ConcurrencyGauge {
        fn name(&self) -> &str {
            "gauge"
        }

        fn kind(&self) -> ValidatorKind {
            ValidatorKind::Sanity
        }

        async fn validate(&self, document: &str) -> Result<Vec<Issue>, CollaboratorError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            if document.contains("PANIC") {
                panic!("validator blew up");
            }
            if document.contains("BROKEN") {
                return Ok(vec![Issue::error("Document contains BROKEN")]);
            }
            Ok(Vec::new())
        }
    }

    struct Unbreak;

    #[async_trait]
    impl crate::collaborators::Fixer for Unbreak {
        fn name(&self) -> &str {
            "unbreak"
        }

        async fn fix(
            &self,
            document: &str,
            _issues: &[Issue],
            _context: &FixContext,
        ) -> Result<FixOutput, CollaboratorError> {
            Ok(FixOutput {
                revised_text: document.replace("BROKEN", "fine"),
                fixes_applied: vec!["Removed BROKEN".into()],
                changed: true,
            })
        }
    }

    fn processor(gauge: Arc<ConcurrencyGauge>, workers: usize) -> BatchProcessor {
        let settings = ReviewSettings {
            profile: ReviewProfile::Fast,
            rules: DocumentRules {
                required_fields: Vec::new(),
                min_body_chars: 1,
                ..DocumentRules::default()
            },
            ..ReviewSettings::default()
        };
        let collaborators = Collaborators::new(vec![gauge], Arc::new(Unbreak));
        BatchProcessor::new(
            ReviewOrchestrator::new(settings, collaborators),
            BatchConfig {
                max_workers: workers,
                fix_memory_capacity: 8,
            },
        )
    }

    fn docs(n: usize) -> Vec<DocumentInput> {
        (0..n)
            .map(|i| DocumentInput::new(format!("doc-{i}"), format!("Document {i} is BROKEN\n")))
            .collect()
    }

    #[tokio::test]
    async fn test_batch_respects_worker_limit() {
        let gauge = Arc::new(ConcurrencyGauge::default());
        let report = processor(Arc::clone(&gauge), 2).run(docs(6)).await;

        assert_eq!(report.outcomes.len(), 6);
        assert!(report.all_succeeded());
        assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(report.summary.converged, 6);
        assert_eq!(report.summary.changed, 6);
        let ids: Vec<&str> = report.outcomes.iter().map(|o| o.document_id.as_str()).collect();
        assert_eq!(ids, ["doc-0", "doc-1", "doc-2", "doc-3", "doc-4", "doc-5"]);
    }

    #[tokio::test]
    async fn test_panicked_worker_is_reported() {
        let gauge = Arc::new(ConcurrencyGauge::default());
        let mut documents = docs(2);
        documents.push(DocumentInput::new("bad", "PANIC\n"));
        let report = processor(gauge, 2).run(documents).await;

        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].document, "bad");
        assert!(report.failures[0].error.contains("validator blew up"));
        assert!(!report.all_succeeded());
    }

    #[tokio::test]
    async fn test_memories_are_cached_per_document() {
        let gauge = Arc::new(ConcurrencyGauge::default());
        let processor = processor(gauge, 2);
        let documents = vec![DocumentInput::new(
            "doc",
            "---\ntitle: BROKEN\n---\nbody text\n",
        )];
        let report = processor.run(documents).await;
        assert!(report.all_succeeded());

        let memory = processor.cache().take("doc").expect("memory cached");
        let entry = memory.get("title").expect("title remembered");
        assert_eq!(entry.value, serde_yaml::Value::String("fine".into()));
        assert_eq!(entry.iteration, 0);
    }

    #[tokio::test]
    async fn test_events_are_emitted() {
        let gauge = Arc::new(ConcurrencyGauge::default());
        let (tx, mut rx) = mpsc::channel(64);
        let processor = processor(gauge, 1).with_event_channel(tx);
        processor.run(docs(2)).await;
        drop(processor);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        let started = events
            .iter()
            .filter(|e| matches!(e, BatchEvent::Started { .. }))
            .count();
        assert_eq!(started, 2);
        assert!(matches!(events.last(), Some(BatchEvent::BatchCompleted { .. })));
    }

    #[tokio::test]
    async fn test_cancelled_batch_reports_errors() {
        let gauge = Arc::new(ConcurrencyGauge::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = processor(gauge, 2)
            .with_cancellation(cancel)
            .run(docs(3))
            .await;
        assert_eq!(report.summary.errored, 3);
        assert!(
            report
                .outcomes
                .iter()
                .all(|o| o.error.as_deref() == Some("cancelled"))
        );
    }

    #[test]
    fn test_read_missing_file() {
        let err = DocumentInput::read("/definitely/not/here.md").unwrap_err();
        assert!(matches!(err, BatchError::ReadFailed { .. }));
    }
}
