//! Background scheduler for pending AI replies.
//!
//! `start` spawns a timer task that waits the start delay and then runs a
//! pass every interval. Passes are single-flight: a manual `trigger` while a
//! pass is running reports busy instead of queueing. `stop` cancels the
//! timer but lets a pass that is already running finish.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use campus_sdk::models::{ProcessReport, SchedulerStatus};

use crate::chat_service;
use crate::error::ApiResult;
use crate::server::SharedState;

#[derive(Debug, Default)]
struct RunStats {
    last_run_at: Option<DateTime<Utc>>,
    last_report: Option<ProcessReport>,
    total_runs: u64,
}

pub struct AiScheduler {
    interval: Duration,
    start_delay: Duration,
    timer: Mutex<Option<JoinHandle<()>>>,
    /// Held for the duration of a pass.
    pass_lock: tokio::sync::Mutex<()>,
    stats: Mutex<RunStats>,
}

/// Result of a manual trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Ran(ProcessReport),
    Busy,
}

impl AiScheduler {
    pub fn new(interval: Duration, start_delay: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_secs(1)),
            start_delay,
            timer: Mutex::new(None),
            pass_lock: tokio::sync::Mutex::new(()),
            stats: Mutex::new(RunStats::default()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.timer.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn is_processing(&self) -> bool {
        self.pass_lock.try_lock().is_err()
    }

    /// Start the timer. Returns false if it was already running.
    pub fn start(&self, state: Arc<SharedState>) -> bool {
        let mut timer = self.timer.lock();
        if timer.as_ref().is_some_and(|h| !h.is_finished()) {
            return false;
        }
        let interval = self.interval;
        let start_delay = self.start_delay;
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(start_delay).await;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                // The pass runs in its own task so stopping the timer never
                // cancels it halfway through a batch.
                let pass_state = Arc::clone(&state);
                let pass = tokio::spawn(async move {
                    match pass_state.scheduler.trigger(&pass_state).await {
                        Ok(TriggerOutcome::Busy) => tracing::debug!("Scheduled AI pass skipped: busy"),
                        Ok(TriggerOutcome::Ran(_)) => {}
                        Err(e) => tracing::error!("Scheduled AI pass failed: {e}"),
                    }
                });
                let _ = pass.await;
            }
        }));
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            start_delay_secs = self.start_delay.as_secs(),
            "AI scheduler started"
        );
        true
    }

    /// Stop the timer. Returns false if it was not running.
    pub fn stop(&self) -> bool {
        match self.timer.lock().take() {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                tracing::info!("AI scheduler stopped");
                true
            }
            _ => false,
        }
    }

    /// Run one pass now, unless one is already in progress.
    pub async fn trigger(&self, state: &SharedState) -> ApiResult<TriggerOutcome> {
        let Ok(_guard) = self.pass_lock.try_lock() else {
            return Ok(TriggerOutcome::Busy);
        };
        let result = chat_service::process_pending(state).await;

        let mut stats = self.stats.lock();
        stats.last_run_at = Some(Utc::now());
        stats.total_runs += 1;
        if let Ok(report) = &result {
            stats.last_report = Some(*report);
        }
        result.map(TriggerOutcome::Ran)
    }

    pub fn status(&self, pending_tasks: i64) -> SchedulerStatus {
        let stats = self.stats.lock();
        SchedulerStatus {
            running: self.is_running(),
            processing: self.is_processing(),
            interval_secs: self.interval.as_secs(),
            start_delay_secs: self.start_delay.as_secs(),
            last_run_at: stats.last_run_at,
            last_report: stats.last_report,
            total_runs: stats.total_runs,
            pending_tasks,
        }
    }
}
