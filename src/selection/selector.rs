//! Scheduled model selection.
//!
//! The selector owns the active model id for the retargetable translator.
//! It evaluates once at startup and then once a day at a configured local
//! hour. Reads never wait on an evaluation: the write lock is only taken for
//! the short state update after the network calls complete.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Local, Timelike};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::SelectionError;
use crate::llm::ModelCatalog;

use super::evaluator::Evaluator;

/// Hour used when the configured one is not a valid hour of day.
pub const DEFAULT_SCHEDULE_HOUR: u32 = 3;

/// How often the scheduler checks the clock.
const CHECK_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Minimum spacing between scheduled evaluations.
const MIN_EVALUATION_SPACING_HOURS: i64 = 23;

/// Callback invoked with the new model id when the selection changes.
pub type ModelUpdateCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Selector settings.
#[derive(Debug, Clone)]
pub struct SelectorConfig {
    /// Model used when no evaluation has ever succeeded.
    pub fallback_model: String,
    /// Local hour of day (0-23) for the daily evaluation.
    pub schedule_hour: u32,
    /// How often the scheduler wakes up to check the clock.
    pub check_interval: Duration,
}

impl SelectorConfig {
    pub fn new(fallback_model: impl Into<String>) -> Self {
        Self {
            fallback_model: fallback_model.into(),
            schedule_hour: DEFAULT_SCHEDULE_HOUR,
            check_interval: CHECK_INTERVAL,
        }
    }

    pub fn with_schedule_hour(mut self, hour: u32) -> Self {
        self.schedule_hour = hour;
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Builds selector settings from the `openrouter` config section.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.openrouter.fallback_model.clone())
            .with_schedule_hour(config.openrouter.evaluator.schedule_hour)
    }
}

#[derive(Default)]
struct SelectorState {
    selected: String,
    last_known_good: String,
    last_evaluation: Option<DateTime<Local>>,
    callbacks: Vec<ModelUpdateCallback>,
}

struct Inner {
    catalog: Arc<dyn ModelCatalog>,
    evaluator: Arc<dyn Evaluator>,
    fallback_model: String,
    schedule_hour: u32,
    check_interval: Duration,
    state: RwLock<SelectorState>,
}

impl Inner {
    fn current_model(&self) -> String {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        if !state.selected.is_empty() {
            state.selected.clone()
        } else if !state.last_known_good.is_empty() {
            state.last_known_good.clone()
        } else {
            self.fallback_model.clone()
        }
    }

    async fn evaluate(&self, started: DateTime<Local>) -> Result<String, SelectionError> {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .last_evaluation = Some(started);

        info!("Fetching free models from catalog");
        let models = self.catalog.free_models().await?;
        if models.is_empty() {
            return Err(SelectionError::NoFreeModels);
        }
        info!(count = models.len(), "Found free models");

        let selected = self.evaluator.select_best_model(&models).await?;

        let (previous, callbacks) = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let previous = std::mem::replace(&mut state.selected, selected.clone());
            state.last_known_good = selected.clone();
            (previous, state.callbacks.clone())
        };

        if previous.is_empty() {
            info!(model = %selected, "Initial model selected");
        } else if previous != selected {
            info!(from = %previous, to = %selected, "Model changed");
            for callback in &callbacks {
                callback(&selected);
            }
        }

        Ok(selected)
    }

    fn seed_fallback(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.selected = self.fallback_model.clone();
        state.last_known_good = self.fallback_model.clone();
    }

    fn last_evaluation(&self) -> Option<DateTime<Local>> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last_evaluation
    }

    async fn run_scheduler(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let start = tokio::time::Instant::now() + self.check_interval;
        let mut ticker = tokio::time::interval_at(start, self.check_interval);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Model selector scheduler stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.scheduled_check(Local::now()).await;
                }
            }
        }
    }

    /// One scheduler tick. Returns whether an evaluation was attempted.
    async fn scheduled_check(&self, now: DateTime<Local>) -> bool {
        if !should_evaluate(now, self.schedule_hour, self.last_evaluation()) {
            return false;
        }

        info!("Daily model evaluation triggered");
        if let Err(e) = self.evaluate(now).await {
            error!(error = %e, "Scheduled model evaluation failed");
            warn!(model = %self.current_model(), "Continuing with last known good model");
        }
        true
    }
}

/// Whether a scheduled check at `now` should run an evaluation.
///
/// True when the local hour matches and the previous attempt (if any) was at
/// least 23 hours ago.
pub fn should_evaluate(
    now: DateTime<Local>,
    schedule_hour: u32,
    last_evaluation: Option<DateTime<Local>>,
) -> bool {
    if now.hour() != schedule_hour {
        return false;
    }
    match last_evaluation {
        None => true,
        Some(last) => now.signed_duration_since(last) >= chrono::Duration::hours(MIN_EVALUATION_SPACING_HOURS),
    }
}

/// Picks and periodically re-picks the translation model.
pub struct ModelSelector {
    inner: Arc<Inner>,
    scheduler: Mutex<Option<(broadcast::Sender<()>, JoinHandle<()>)>>,
}

impl ModelSelector {
    /// Creates a selector. An out-of-range schedule hour becomes 3.
    ///
    /// # Errors
    ///
    /// Returns `SelectionError::MissingFallback` if no fallback model is set.
    pub fn new(
        config: SelectorConfig,
        catalog: Arc<dyn ModelCatalog>,
        evaluator: Arc<dyn Evaluator>,
    ) -> Result<Self, SelectionError> {
        if config.fallback_model.trim().is_empty() {
            return Err(SelectionError::MissingFallback);
        }

        let schedule_hour = if config.schedule_hour > 23 {
            warn!(
                configured = config.schedule_hour,
                using = DEFAULT_SCHEDULE_HOUR,
                "Invalid evaluation hour, using default"
            );
            DEFAULT_SCHEDULE_HOUR
        } else {
            config.schedule_hour
        };

        Ok(Self {
            inner: Arc::new(Inner {
                catalog,
                evaluator,
                fallback_model: config.fallback_model,
                schedule_hour,
                check_interval: config.check_interval,
                state: RwLock::new(SelectorState::default()),
            }),
            scheduler: Mutex::new(None),
        })
    }

    /// Runs the initial evaluation, then starts the daily scheduler.
    ///
    /// A failed initial evaluation is not an error: the fallback model is
    /// installed as the selection instead.
    pub async fn start(&self) -> Result<(), SelectionError> {
        if self.is_running() {
            return Err(SelectionError::AlreadyRunning);
        }

        let now = Local::now();
        let offset_hours = now.offset().local_minus_utc() / 3600;
        info!(
            offset = %now.offset(),
            utc_offset_hours = offset_hours,
            schedule_hour = self.inner.schedule_hour,
            "Starting model selector (daily evaluation at {:02}:00 local time)",
            self.inner.schedule_hour
        );

        if let Err(e) = self.inner.evaluate(now).await {
            error!(error = %e, "Initial model evaluation failed");
            warn!(model = %self.inner.fallback_model, "Using fallback model");
            self.inner.seed_fallback();
        }

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(Arc::clone(&self.inner).run_scheduler(shutdown_rx));
        *self.scheduler.lock().unwrap_or_else(PoisonError::into_inner) = Some((shutdown_tx, handle));

        Ok(())
    }

    /// Stops the scheduler and waits for it to exit. No-op if not running.
    pub async fn stop(&self) {
        let scheduler = self
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some((shutdown_tx, handle)) = scheduler {
            let _ = shutdown_tx.send(());
            if let Err(e) = handle.await {
                error!(error = %e, "Model selector scheduler panicked");
            }
        }
    }

    /// Whether the background scheduler is active.
    pub fn is_running(&self) -> bool {
        self.scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Model to use now: selected, else last known good, else the fallback.
    pub fn current_model(&self) -> String {
        self.inner.current_model()
    }

    /// Registers a callback run whenever the selection changes.
    pub fn on_model_update<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .callbacks
            .push(Arc::new(callback));
    }

    /// Runs one evaluation cycle immediately.
    pub async fn evaluate_now(&self) -> Result<String, SelectionError> {
        self.inner.evaluate(Local::now()).await
    }

    /// Runs the scheduler's check as if the clock read `now`.
    ///
    /// Evaluates when `now` falls in the scheduled hour and the previous
    /// attempt is at least 23 hours old. Returns whether it evaluated.
    pub async fn run_scheduled_check(&self, now: DateTime<Local>) -> bool {
        self.inner.scheduled_check(now).await
    }

    /// Time of the last attempted evaluation.
    pub fn last_evaluation(&self) -> Option<DateTime<Local>> {
        self.inner.last_evaluation()
    }

    pub fn schedule_hour(&self) -> u32 {
        self.inner.schedule_hour
    }
}
