//! The queue consumer loop.
//!
//! One job is handled at a time: dequeue, translate, notify. Jobs that fail
//! after being dequeued are logged and dropped. Only queue errors slow the
//! loop down, through an exponential backoff that resets on the next
//! successful dequeue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::callback::{CallbackPayload, Notifier};
use crate::config::WorkerSettings;
use crate::error::{JobFailure, TranslateError, WorkerError};
use crate::job::JobMessage;
use crate::translator::Translator;

use super::queue::JobSource;

const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(5);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Counters describing what the worker has done so far.
#[derive(Debug, Default)]
pub struct WorkerStats {
    completed: AtomicU64,
    failed: AtomicU64,
    malformed: AtomicU64,
    queue_errors: AtomicU64,
}

/// Point-in-time copy of [`WorkerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStatsSnapshot {
    pub completed: u64,
    pub failed: u64,
    pub malformed: u64,
    pub queue_errors: u64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            malformed: self.malformed.load(Ordering::SeqCst),
            queue_errors: self.queue_errors.load(Ordering::SeqCst),
        }
    }

    fn record(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

/// Consumes jobs from a [`JobSource`] until shut down.
pub struct Worker {
    queue: Arc<dyn JobSource>,
    translator: Arc<dyn Translator>,
    notifier: Arc<dyn Notifier>,
    poll_timeout: Duration,
    initial_backoff: Duration,
    max_backoff: Duration,
    stats: Arc<WorkerStats>,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn JobSource>,
        translator: Arc<dyn Translator>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            queue,
            translator,
            notifier,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
            stats: Arc::new(WorkerStats::default()),
        }
    }

    /// Sets how long one dequeue waits for a job.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Sets the backoff applied after queue errors.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    /// Applies the `worker` config section.
    pub fn with_settings(self, settings: &WorkerSettings) -> Self {
        self.with_poll_timeout(Duration::from_secs(settings.poll_timeout_secs))
            .with_backoff(
                Duration::from_millis(settings.initial_backoff_ms),
                Duration::from_secs(settings.max_backoff_secs),
            )
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    /// Runs until `shutdown` fires or its sender is dropped.
    ///
    /// Always ends with `Err(WorkerError::Cancelled)`. A translation that is
    /// already running when the signal arrives is allowed to finish.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), WorkerError> {
        info!(poll_timeout_secs = self.poll_timeout.as_secs(), "Worker started");
        let mut backoff = self.initial_backoff;

        let result = loop {
            match self.process_next(&mut shutdown).await {
                Ok(()) => backoff = self.initial_backoff,
                Err(WorkerError::Cancelled) => break WorkerError::Cancelled,
                Err(e) => {
                    error!(error = %e, backoff_ms = backoff.as_millis() as u64, "Worker iteration failed");
                    tokio::select! {
                        _ = shutdown.recv() => break WorkerError::Cancelled,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.max_backoff);
                }
            }
        };

        let stats = self.stats.snapshot();
        info!(
            completed = stats.completed,
            failed = stats.failed,
            malformed = stats.malformed,
            queue_errors = stats.queue_errors,
            "Worker stopped"
        );
        Err(result)
    }

    /// Waits for one job and handles it.
    ///
    /// Returns `Ok(())` when the wait times out, when the payload is
    /// malformed, and when the job fails; only queue errors and shutdown are
    /// reported as errors.
    pub async fn process_next(&self, shutdown: &mut broadcast::Receiver<()>) -> Result<(), WorkerError> {
        let popped = tokio::select! {
            _ = shutdown.recv() => return Err(WorkerError::Cancelled),
            popped = self.queue.pop(self.poll_timeout) => popped,
        };

        let payload = match popped {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                debug!("No jobs available");
                return Ok(());
            }
            Err(e) => {
                WorkerStats::record(&self.stats.queue_errors);
                return Err(e.into());
            }
        };

        let job: JobMessage = match serde_json::from_str(&payload) {
            Ok(job) => job,
            Err(e) => {
                WorkerStats::record(&self.stats.malformed);
                warn!(error = %e, payload = %payload, "Dropping malformed job");
                return Ok(());
            }
        };

        let span = info_span!("job", job_id = %Uuid::new_v4(), path = %job.path);
        let _ = self.process_job(job).instrument(span).await;
        Ok(())
    }

    /// Translates one job and notifies the downstream service.
    ///
    /// Failures are logged and counted here; the caller only needs the result
    /// for inspection.
    pub async fn process_job(&self, job: JobMessage) -> Result<CallbackPayload, JobFailure> {
        let start = Instant::now();
        info!(name = %job.display_name(), "Processing job");

        let result = self.translate_and_notify(&job).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(payload) => {
                WorkerStats::record(&self.stats.completed);
                info!(output = %payload.chs_subtitle_path, duration_ms, "Job completed");
            }
            Err(e) => {
                WorkerStats::record(&self.stats.failed);
                error!(error = %e, duration_ms, "Job failed, dropping");
            }
        }

        result
    }

    async fn translate_and_notify(&self, job: &JobMessage) -> Result<CallbackPayload, JobFailure> {
        job.validate().map_err(TranslateError::from)?;

        let output_path = self.translator.translate(job).await?;

        let payload = CallbackPayload {
            chs_subtitle_path: output_path,
            eng_subtitle_path: job.path.clone(),
            video_path: job.video_path.clone(),
        };
        self.notifier.notify(&payload).await?;

        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CallbackError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct OneShotQueue(Mutex<Vec<String>>);

    #[async_trait]
    impl JobSource for OneShotQueue {
        async fn pop(&self, _timeout: Duration) -> Result<Option<String>, crate::error::QueueError> {
            Ok(self.0.lock().expect("lock").pop())
        }
    }

    struct EchoTranslator;

    #[async_trait]
    impl Translator for EchoTranslator {
        async fn translate(&self, job: &JobMessage) -> Result<String, TranslateError> {
            Ok(job.output_path("chs"))
        }
    }

    #[derive(Default)]
    struct RecordingNotifier(Mutex<Vec<CallbackPayload>>);

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, payload: &CallbackPayload) -> Result<(), CallbackError> {
            self.0.lock().expect("lock").push(payload.clone());
            Ok(())
        }
    }

    fn worker(payloads: Vec<&str>, notifier: Arc<RecordingNotifier>) -> Worker {
        let queue = OneShotQueue(Mutex::new(payloads.into_iter().map(String::from).collect()));
        Worker::new(Arc::new(queue), Arc::new(EchoTranslator), notifier)
    }

    #[tokio::test]
    async fn test_process_job_builds_payload() {
        let notifier = Arc::new(RecordingNotifier::default());
        let worker = worker(vec![], Arc::clone(&notifier));
        let job = JobMessage::new("/m/show.eng.srt").with_video_path("/m/show.mkv");

        let payload = worker.process_job(job).await.expect("job succeeds");

        assert_eq!(
            payload,
            CallbackPayload {
                chs_subtitle_path: "/m/show.chs.srt".to_string(),
                eng_subtitle_path: "/m/show.eng.srt".to_string(),
                video_path: "/m/show.mkv".to_string(),
            }
        );
        assert_eq!(notifier.0.lock().expect("lock").len(), 1);
        assert_eq!(worker.stats().snapshot().completed, 1);
    }

    #[tokio::test]
    async fn test_process_job_rejects_missing_path() {
        let notifier = Arc::new(RecordingNotifier::default());
        let worker = worker(vec![], Arc::clone(&notifier));

        let result = worker.process_job(JobMessage::default()).await;

        assert!(matches!(
            result,
            Err(JobFailure::Translate(TranslateError::InvalidJob(_)))
        ));
        assert!(notifier.0.lock().expect("lock").is_empty());
        assert_eq!(worker.stats().snapshot().failed, 1);
    }

    #[tokio::test]
    async fn test_process_next_drops_malformed_payload() {
        let notifier = Arc::new(RecordingNotifier::default());
        let worker = worker(vec!["{not json"], Arc::clone(&notifier));
        let (_tx, mut rx) = broadcast::channel(1);

        worker.process_next(&mut rx).await.expect("malformed is not an error");

        assert_eq!(worker.stats().snapshot().malformed, 1);
        assert!(notifier.0.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn test_process_next_empty_queue() {
        let notifier = Arc::new(RecordingNotifier::default());
        let worker = worker(vec![], notifier);
        let (_tx, mut rx) = broadcast::channel(1);

        worker.process_next(&mut rx).await.expect("timeout is not an error");
        assert_eq!(worker.stats().snapshot(), WorkerStatsSnapshot::default());
    }

    #[test]
    fn test_with_settings() {
        let settings = WorkerSettings {
            poll_timeout_secs: 2,
            initial_backoff_ms: 250,
            max_backoff_secs: 10,
        };
        let worker = worker(vec![], Arc::new(RecordingNotifier::default())).with_settings(&settings);

        assert_eq!(worker.poll_timeout, Duration::from_secs(2));
        assert_eq!(worker.initial_backoff, Duration::from_millis(250));
        assert_eq!(worker.max_backoff, Duration::from_secs(10));
    }
}
