use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::aggregator;
use crate::context::AnalysisContext;
use crate::db::ScanStore;
use crate::error::ScanError;
use crate::extract::SubtitleExtractor;
use crate::inference::Classifier;
use crate::models::{FileStatus, ScanJob, ScanResult, Segment, TimedTrigger};
use crate::queue::JobQueue;
use crate::risk;
use crate::segmenter;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub poll_timeout: Duration,
    pub queue_backoff: Duration,
    pub segment_concurrency: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(5),
            queue_backoff: Duration::from_secs(1),
            segment_concurrency: 4,
        }
    }
}

#[derive(Debug)]
pub enum JobOutcome {
    Completed(ScanResult),
    Failed(ScanError),
}

pub struct Worker {
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn ScanStore>,
    classifier: Arc<dyn Classifier>,
    extractor: Arc<dyn SubtitleExtractor>,
    context: AnalysisContext,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn ScanStore>,
        classifier: Arc<dyn Classifier>,
        extractor: Arc<dyn SubtitleExtractor>,
        context: AnalysisContext,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            queue,
            store,
            classifier,
            extractor,
            context,
            settings,
        }
    }

    /// Consume jobs until `cancel` fires. A job that has been popped always
    /// runs to completion; cancellation is only observed between polls.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(models = self.context.models().len(), "worker started");

        while !cancel.is_cancelled() {
            match self.queue.pop(self.settings.poll_timeout).await {
                Ok(Some(job)) => {
                    info!(job_id = %job.id, "processing job");
                    if let JobOutcome::Failed(err) = self.process_job(&job).await {
                        if err.is_persistence() {
                            warn!(job_id = %job.id, "store rejected results; resubmit once it recovers");
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %err, "queue poll failed, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(self.settings.queue_backoff) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
            }
        }

        self.context.dispose();
        self.store.close().await;
        info!("worker stopped");
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, file_path = %job.file_path))]
    pub async fn process_job(&self, job: &ScanJob) -> JobOutcome {
        let started = Instant::now();

        if let Err(err) = self
            .store
            .set_file_status(&job.file_path, FileStatus::Processing)
            .await
        {
            warn!(error = %err, "could not mark file as processing");
        }

        match self.run_pipeline(job, started).await {
            Ok(result) => {
                info!(
                    triggers = result.total_triggers,
                    overall_risk = result.overall_risk_score,
                    highest_severity = %result.highest_severity,
                    "completed scan"
                );
                JobOutcome::Completed(result)
            }
            Err(err) => {
                error!(error = %err, "scan failed");
                if let Err(status_err) = self
                    .store
                    .set_file_status(&job.file_path, FileStatus::Error)
                    .await
                {
                    error!(error = %status_err, "could not mark file as errored");
                }
                JobOutcome::Failed(err)
            }
        }
    }

    async fn run_pipeline(
        &self,
        job: &ScanJob,
        started: Instant,
    ) -> Result<ScanResult, ScanError> {
        let path = Path::new(&job.file_path);
        let segments = segmenter::segment_file(path, self.extractor.as_ref()).await;

        // Unregistered files fail the same way with or without content.
        let file_id = self
            .store
            .file_id(&job.file_path)
            .await?
            .ok_or_else(|| {
                ScanError::Persistence(format!("file {} is not registered", job.file_path))
            })?;

        if segments.is_empty() {
            warn!("no subtitle content found");
            self.store
                .set_file_status(&job.file_path, FileStatus::Completed)
                .await?;
            return Ok(risk::summarize(Some(file_id), elapsed_ms(started), Vec::new()));
        }

        let triggers = analyze_segments(
            &self.context,
            self.classifier.as_ref(),
            &segments,
            self.settings.segment_concurrency,
        )
        .await;

        let result = risk::summarize(Some(file_id), elapsed_ms(started), triggers);
        let metadata = serde_json::json!({
            "processed_at": Utc::now(),
            "job_id": job.id,
            "segments": segments.len(),
            "models": self.context.model_names(),
        });

        self.store.store_scan_result(&result, metadata).await?;
        self.store
            .set_file_status(&job.file_path, FileStatus::Completed)
            .await?;

        Ok(result)
    }
}

/// Analyze every segment with its neighbours as context. Segments run
/// concurrently; results come back in segment order.
pub async fn analyze_segments(
    ctx: &AnalysisContext,
    classifier: &dyn Classifier,
    segments: &[Segment],
    concurrency: usize,
) -> Vec<TimedTrigger> {
    let per_segment: Vec<Vec<TimedTrigger>> = stream::iter(segments.iter().enumerate())
        .map(|(i, segment)| {
            let before = if i > 0 { segments[i - 1].text.as_str() } else { "" };
            let after = segments.get(i + 1).map(|s| s.text.as_str()).unwrap_or("");

            async move {
                aggregator::analyze(ctx, classifier, segment, before, after)
                    .await
                    .into_iter()
                    .map(|trigger| TimedTrigger {
                        trigger,
                        start_time: segment.start.clone(),
                        end_time: segment.end.clone(),
                        subtitle_text: segment.text.clone(),
                        context_before: before.to_string(),
                        context_after: after.to_string(),
                    })
                    .collect::<Vec<_>>()
            }
        })
        .buffered(concurrency.max(1))
        .collect()
        .await;

    per_segment.into_iter().flatten().collect()
}

pub fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::Extraction;
    use crate::models::{
        CategoryConfig, LabelScore, ModelConfig, ModelDescriptor, Severity, SeverityBands,
    };
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::io::Write;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedQueue {
        jobs: Mutex<VecDeque<ScanJob>>,
        failures: AtomicUsize,
        pops: AtomicUsize,
        drained: CancellationToken,
    }

    impl ScriptedQueue {
        fn new(jobs: Vec<ScanJob>, failures: usize, drained: CancellationToken) -> Self {
            Self {
                jobs: Mutex::new(jobs.into()),
                failures: AtomicUsize::new(failures),
                pops: AtomicUsize::new(0),
                drained,
            }
        }
    }

    #[async_trait]
    impl JobQueue for ScriptedQueue {
        async fn pop(&self, _timeout: Duration) -> Result<Option<ScanJob>, ScanError> {
            self.pops.fetch_add(1, Ordering::SeqCst);
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(ScanError::Queue("connection reset".to_string()));
            }
            let next = self.jobs.lock().unwrap().pop_front();
            if next.is_none() {
                self.drained.cancel();
            }
            Ok(next)
        }

        async fn push(&self, job: &ScanJob) -> Result<(), ScanError> {
            self.jobs.lock().unwrap().push_back(job.clone());
            Ok(())
        }

        async fn pending_jobs(&self) -> Result<u64, ScanError> {
            Ok(self.jobs.lock().unwrap().len() as u64)
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        file_id: Option<i64>,
        fail_writes: bool,
        statuses: Mutex<Vec<(String, FileStatus)>>,
        results: Mutex<Vec<ScanResult>>,
        closed: AtomicBool,
    }

    impl MemoryStore {
        fn registered() -> Self {
            Self {
                file_id: Some(42),
                ..Self::default()
            }
        }

        fn statuses(&self) -> Vec<FileStatus> {
            self.statuses
                .lock()
                .unwrap()
                .iter()
                .map(|(_, status)| *status)
                .collect()
        }
    }

    #[async_trait]
    impl ScanStore for MemoryStore {
        async fn set_file_status(
            &self,
            file_path: &str,
            status: FileStatus,
        ) -> Result<(), ScanError> {
            self.statuses
                .lock()
                .unwrap()
                .push((file_path.to_string(), status));
            Ok(())
        }

        async fn file_id(&self, _file_path: &str) -> Result<Option<i64>, ScanError> {
            Ok(self.file_id)
        }

        async fn store_scan_result(
            &self,
            result: &ScanResult,
            _metadata: serde_json::Value,
        ) -> Result<i64, ScanError> {
            if self.fail_writes {
                return Err(ScanError::Persistence("insert rejected".to_string()));
            }
            let mut results = self.results.lock().unwrap();
            results.push(result.clone());
            Ok(results.len() as i64)
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Flags any input that mentions killing.
    struct KeywordClassifier;

    #[async_trait]
    impl Classifier for KeywordClassifier {
        async fn classify(
            &self,
            _model: &ModelDescriptor,
            text: &str,
        ) -> Result<Vec<LabelScore>, ScanError> {
            let (label, score) = if text.contains("kill") {
                ("THREAT", 0.9)
            } else {
                ("POSITIVE", 0.99)
            };
            Ok(vec![LabelScore {
                label: label.to_string(),
                score,
            }])
        }
    }

    struct NoExtractor;

    #[async_trait]
    impl SubtitleExtractor for NoExtractor {
        async fn extract(&self, _video: &Path) -> Result<Extraction, ScanError> {
            Ok(Extraction::NoTrack)
        }
    }

    fn context() -> AnalysisContext {
        AnalysisContext::with_parts(
            vec![CategoryConfig {
                name: "violence".to_string(),
                threshold: 0.5,
                bands: SeverityBands {
                    mild: 0.3,
                    moderate: 0.6,
                    severe: 0.8,
                },
            }],
            vec![ModelDescriptor {
                id: 1,
                name: "threat-detector".to_string(),
                huggingface_id: "org/threat".to_string(),
                task_type: "text-classification".to_string(),
                categories: vec!["violence".to_string()],
                weight: 1.0,
                config: ModelConfig::default(),
            }],
        )
    }

    fn worker(queue: Arc<dyn JobQueue>, store: Arc<MemoryStore>) -> Worker {
        Worker::new(
            queue,
            store,
            Arc::new(KeywordClassifier),
            Arc::new(NoExtractor),
            context(),
            WorkerSettings {
                poll_timeout: Duration::from_millis(10),
                queue_backoff: Duration::from_millis(1),
                segment_concurrency: 2,
            },
        )
    }

    fn idle_queue() -> Arc<dyn JobQueue> {
        Arc::new(ScriptedQueue::new(Vec::new(), 0, CancellationToken::new()))
    }

    fn subtitle_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".srt").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    const DIALOGUE: &str = "1\n00:00:01,000 --> 00:00:02,000\nGood morning\n\n\
                            2\n00:00:03,000 --> 00:00:04,000\nLovely day\n\n\
                            3\n00:00:05,000 --> 00:00:06,000\nI will kill you\n\n\
                            4\n00:00:07,000 --> 00:00:08,000\nRun\n";

    #[tokio::test]
    async fn empty_file_completes_without_triggers() {
        let file = subtitle_file("");
        let store = Arc::new(MemoryStore::registered());
        let worker = worker(idle_queue(), store.clone());

        let job = ScanJob::new(file.path().to_string_lossy());
        let outcome = worker.process_job(&job).await;

        let JobOutcome::Completed(result) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(result.overall_risk_score, 0.0);
        assert_eq!(result.highest_severity, Severity::None);
        assert_eq!(result.total_triggers, 0);
        assert_eq!(store.statuses(), vec![FileStatus::Processing, FileStatus::Completed]);
        assert!(store.results.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn triggers_carry_segment_context_and_are_persisted() {
        let file = subtitle_file(DIALOGUE);
        let store = Arc::new(MemoryStore::registered());
        let worker = worker(idle_queue(), store.clone());

        let job = ScanJob::new(file.path().to_string_lossy());
        let JobOutcome::Completed(result) = worker.process_job(&job).await else {
            panic!("expected completion");
        };

        // the threat is visible from its neighbours' context windows too
        assert_eq!(result.total_triggers, 3);
        assert_eq!(result.file_id, Some(42));
        assert_eq!(result.highest_severity, Severity::Severe);
        assert!((result.overall_risk_score - 0.9).abs() < 1e-9);

        let starts: Vec<&str> = result.triggers.iter().map(|t| t.start_time.as_str()).collect();
        assert_eq!(starts, vec!["00:00:03.000", "00:00:05.000", "00:00:07.000"]);

        let threat = &result.triggers[1];
        assert_eq!(threat.subtitle_text, "I will kill you");
        assert_eq!(threat.context_before, "Lovely day");
        assert_eq!(threat.context_after, "Run");
        assert_eq!(threat.trigger.segment, 3);
        assert_eq!(result.triggers[2].context_after, "");

        assert_eq!(store.results.lock().unwrap().len(), 1);
        assert_eq!(store.statuses(), vec![FileStatus::Processing, FileStatus::Completed]);
    }

    #[tokio::test]
    async fn persistence_failure_marks_file_errored() {
        let file = subtitle_file(DIALOGUE);
        let store = Arc::new(MemoryStore {
            file_id: Some(7),
            fail_writes: true,
            ..MemoryStore::default()
        });
        let worker = worker(idle_queue(), store.clone());

        let outcome = worker.process_job(&ScanJob::new(file.path().to_string_lossy())).await;

        assert!(matches!(outcome, JobOutcome::Failed(ref err) if err.is_persistence()));
        assert_eq!(store.statuses(), vec![FileStatus::Processing, FileStatus::Error]);
    }

    #[tokio::test]
    async fn unregistered_file_is_a_persistence_failure() {
        let file = subtitle_file(DIALOGUE);
        let store = Arc::new(MemoryStore::default());
        let worker = worker(idle_queue(), store.clone());

        let outcome = worker.process_job(&ScanJob::new(file.path().to_string_lossy())).await;

        assert!(matches!(outcome, JobOutcome::Failed(ScanError::Persistence(_))));
        assert_eq!(store.statuses().last(), Some(&FileStatus::Error));
    }

    #[tokio::test]
    async fn empty_unregistered_file_is_a_persistence_failure() {
        let file = subtitle_file("");
        let store = Arc::new(MemoryStore::default());
        let worker = worker(idle_queue(), store.clone());

        let outcome = worker.process_job(&ScanJob::new(file.path().to_string_lossy())).await;

        assert!(matches!(outcome, JobOutcome::Failed(ScanError::Persistence(_))));
        assert_eq!(store.statuses(), vec![FileStatus::Processing, FileStatus::Error]);
    }

    /// Requests shutdown the first time it is asked to classify anything.
    struct CancellingClassifier {
        cancel: CancellationToken,
    }

    #[async_trait]
    impl Classifier for CancellingClassifier {
        async fn classify(
            &self,
            model: &ModelDescriptor,
            text: &str,
        ) -> Result<Vec<LabelScore>, ScanError> {
            self.cancel.cancel();
            KeywordClassifier.classify(model, text).await
        }
    }

    #[tokio::test]
    async fn cancellation_mid_job_lets_the_job_finish() {
        let file = subtitle_file(DIALOGUE);
        let cancel = CancellationToken::new();
        let queue = Arc::new(ScriptedQueue::new(
            vec![
                ScanJob::new(file.path().to_string_lossy()),
                ScanJob::new("/media/next.srt"),
            ],
            0,
            CancellationToken::new(),
        ));
        let store = Arc::new(MemoryStore::registered());

        Worker::new(
            queue.clone(),
            store.clone(),
            Arc::new(CancellingClassifier {
                cancel: cancel.clone(),
            }),
            Arc::new(NoExtractor),
            context(),
            WorkerSettings {
                poll_timeout: Duration::from_millis(10),
                queue_backoff: Duration::from_millis(1),
                segment_concurrency: 2,
            },
        )
        .run(cancel.clone())
        .await;

        assert!(cancel.is_cancelled());
        assert_eq!(queue.pops.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending_jobs().await.unwrap(), 1);

        let results = store.results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].total_triggers, 3);
        drop(results);

        assert_eq!(store.statuses(), vec![FileStatus::Processing, FileStatus::Completed]);
        assert!(store.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn loop_survives_queue_errors_and_releases_resources() {
        let file = subtitle_file(DIALOGUE);
        let cancel = CancellationToken::new();
        let queue = Arc::new(ScriptedQueue::new(
            vec![
                ScanJob::new(file.path().to_string_lossy()),
                ScanJob::new("/media/missing.srt"),
            ],
            2,
            cancel.clone(),
        ));
        let store = Arc::new(MemoryStore::registered());

        worker(queue.clone(), store.clone()).run(cancel.clone()).await;

        assert!(cancel.is_cancelled());
        assert_eq!(queue.pops.load(Ordering::SeqCst), 5);
        assert_eq!(store.results.lock().unwrap().len(), 1);
        assert_eq!(
            store.statuses(),
            vec![
                FileStatus::Processing,
                FileStatus::Completed,
                FileStatus::Processing,
                FileStatus::Completed,
            ]
        );
        assert!(store.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancelled_loop_exits_without_polling() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let queue = Arc::new(ScriptedQueue::new(
            vec![ScanJob::new("/media/a.srt")],
            0,
            CancellationToken::new(),
        ));
        let store = Arc::new(MemoryStore::registered());

        worker(queue.clone(), store.clone()).run(cancel).await;

        assert_eq!(queue.pops.load(Ordering::SeqCst), 0);
        assert_eq!(queue.pending_jobs().await.unwrap(), 1);
        assert!(store.closed.load(Ordering::SeqCst));
    }
}
