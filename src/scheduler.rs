//! Periodic plan scheduler.
//!
//! One driver task owns the wall-clock: every tick it claims due plans,
//! fans them out in bounded parallel batches, and feeds per-plan results
//! into process-local metrics. A crash in one plan never touches another;
//! a failure in the tick itself is logged and the ticker keeps going.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::EngineError;
use crate::pipeline::PlanRunner;
use crate::store::PlanStore;
use crate::types::{Plan, PlanStatus};

/// Pause between consecutive batches within one tick.
const BATCH_COOLDOWN: Duration = Duration::from_secs(1);

/// Scheduler tuning knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Tick period.
    pub interval: Duration,
    /// Plans executed in parallel within one batch.
    pub max_concurrent_executions: usize,
    /// Attempts per plan per tick.
    pub retry_attempts: u32,
    /// Fixed delay between attempts.
    pub retry_delay: Duration,
    /// Row lease stamped on claimed plans.
    pub lease: chrono::Duration,
    /// Log a metrics snapshot after each tick.
    pub log_metrics: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            interval: Duration::from_secs(60),
            max_concurrent_executions: 50,
            retry_attempts: 3,
            retry_delay: Duration::from_secs(5),
            lease: chrono::Duration::minutes(10),
            log_metrics: true,
        }
    }
}

#[derive(Debug, Default)]
struct TimingStats {
    last_execution_time: Option<DateTime<Utc>>,
    total_ms: u64,
    samples: u64,
}

/// Process-local counters, updated only by the ticker's worker tasks.
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    total_executions: AtomicU64,
    successful_executions: AtomicU64,
    failed_executions: AtomicU64,
    active_plans_count: AtomicI64,
    timing: std::sync::Mutex<TimingStats>,
}

impl SchedulerMetrics {
    fn record_success(&self, elapsed: Duration) {
        self.total_executions.fetch_add(1, Ordering::Relaxed);
        self.successful_executions.fetch_add(1, Ordering::Relaxed);
        self.record_timing(elapsed);
    }

    fn record_failure(&self, elapsed: Duration) {
        self.total_executions.fetch_add(1, Ordering::Relaxed);
        self.failed_executions.fetch_add(1, Ordering::Relaxed);
        self.record_timing(elapsed);
    }

    fn record_timing(&self, elapsed: Duration) {
        let mut timing = self.timing.lock().expect("timing lock poisoned");
        timing.last_execution_time = Some(Utc::now());
        timing.total_ms += elapsed.as_millis() as u64;
        timing.samples += 1;
    }
}

/// Read-only status surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub is_running: bool,
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub last_execution_time: Option<DateTime<Utc>>,
    pub average_execution_time_ms: u64,
    pub active_plans_count: i64,
    pub interval_seconds: u64,
    pub max_concurrent_executions: usize,
}

/// The periodic driver that turns due plans into pipeline invocations.
pub struct PlanScheduler {
    store: Arc<dyn PlanStore>,
    runner: Arc<dyn PlanRunner>,
    config: SchedulerConfig,
    metrics: Arc<SchedulerMetrics>,
    running: AtomicBool,
    cancel: std::sync::Mutex<Option<CancellationToken>>,
}

impl PlanScheduler {
    pub fn new(
        store: Arc<dyn PlanStore>,
        runner: Arc<dyn PlanRunner>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            runner,
            config,
            metrics: Arc::new(SchedulerMetrics::default()),
            running: AtomicBool::new(false),
            cancel: std::sync::Mutex::new(None),
        }
    }

    /// Begin ticking: an immediate tick, then one every `config.interval`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Internal`] when already running.
    pub fn start(self: &Arc<Self>) -> Result<(), EngineError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::Internal(
                "scheduler is already running".to_string(),
            ));
        }
        let token = CancellationToken::new();
        *self.cancel.lock().expect("cancel lock poisoned") = Some(token.clone());
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                interval_secs = scheduler.config.interval.as_secs(),
                max_concurrent = scheduler.config.max_concurrent_executions,
                "scheduler started"
            );
            loop {
                scheduler.tick().await;
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(scheduler.config.interval) => {}
                }
            }
            scheduler.running.store(false, Ordering::SeqCst);
            info!("scheduler stopped");
        });
        Ok(())
    }

    /// Stop the ticker. In-flight executions run to completion; no new tick
    /// begins.
    pub fn stop(&self) {
        if let Some(token) = self.cancel.lock().expect("cancel lock poisoned").take() {
            token.cancel();
        }
    }

    pub fn status(&self) -> SchedulerStatus {
        let timing = self.metrics.timing.lock().expect("timing lock poisoned");
        let average_execution_time_ms = if timing.samples > 0 {
            timing.total_ms / timing.samples
        } else {
            0
        };
        SchedulerStatus {
            is_running: self.running.load(Ordering::SeqCst),
            total_executions: self.metrics.total_executions.load(Ordering::Relaxed),
            successful_executions: self.metrics.successful_executions.load(Ordering::Relaxed),
            failed_executions: self.metrics.failed_executions.load(Ordering::Relaxed),
            last_execution_time: timing.last_execution_time,
            average_execution_time_ms,
            active_plans_count: self.metrics.active_plans_count.load(Ordering::Relaxed),
            interval_seconds: self.config.interval.as_secs(),
            max_concurrent_executions: self.config.max_concurrent_executions,
        }
    }

    async fn tick(&self) {
        let started = Instant::now();
        match self.run_tick().await {
            Ok(executed) => {
                debug!(
                    executed,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "tick complete"
                );
                if self.config.log_metrics && executed > 0 {
                    let status = self.status();
                    info!(
                        total = status.total_executions,
                        ok = status.successful_executions,
                        failed = status.failed_executions,
                        active_plans = status.active_plans_count,
                        "scheduler metrics"
                    );
                }
            }
            Err(e) => error!(error = %e, "tick failed"),
        }
    }

    /// One pass: claim, batch, execute, refresh the active-plan gauge.
    pub(crate) async fn run_tick(&self) -> Result<usize, EngineError> {
        let now = Utc::now();
        let due = self.store.claim_due_plans(now, self.config.lease).await?;
        if !due.is_empty() {
            info!(due = due.len(), "due plans claimed");
            let batch_count = due.len().div_ceil(self.config.max_concurrent_executions);
            for (index, batch) in due.chunks(self.config.max_concurrent_executions).enumerate() {
                let mut workers = JoinSet::new();
                for plan in batch {
                    workers.spawn(execute_plan(
                        Arc::clone(&self.store),
                        Arc::clone(&self.runner),
                        Arc::clone(&self.metrics),
                        self.config.retry_attempts,
                        self.config.retry_delay,
                        plan.clone(),
                    ));
                }
                while let Some(joined) = workers.join_next().await {
                    if let Err(join_error) = joined {
                        self.metrics.record_failure(Duration::ZERO);
                        error!(error = %join_error, "plan execution task panicked");
                    }
                }
                if index + 1 < batch_count {
                    tokio::time::sleep(BATCH_COOLDOWN).await;
                }
            }
        }
        let active = self.store.count_active_plans().await?;
        self.metrics
            .active_plans_count
            .store(active, Ordering::Relaxed);
        Ok(due.len())
    }
}

/// Execute one claimed plan with re-check, per-plan retry, and isolation.
async fn execute_plan(
    store: Arc<dyn PlanStore>,
    runner: Arc<dyn PlanRunner>,
    metrics: Arc<SchedulerMetrics>,
    retry_attempts: u32,
    retry_delay: Duration,
    plan: Plan,
) {
    let started = Instant::now();

    // Re-read the row: an external writer may have paused or cancelled the
    // plan between selection and execution.
    let current = match store.plan_by_id(&plan.id).await {
        Ok(Some(current)) => current,
        Ok(None) => {
            warn!(plan = %plan.id, "plan disappeared between selection and execution");
            return;
        }
        Err(e) => {
            error!(plan = %plan.id, error = %e, "plan re-read failed");
            metrics.record_failure(started.elapsed());
            return;
        }
    };
    if current.status != PlanStatus::Active {
        info!(plan = %plan.id, status = %current.status, "skipping plan no longer active");
        if let Err(e) = store.release_lease(&plan.id).await {
            warn!(plan = %plan.id, error = %e, "lease release failed");
        }
        return;
    }

    let mut attempt: u32 = 1;
    loop {
        match runner.run_plan(&current).await {
            Ok(execution) => {
                info!(plan = %plan.id, execution = %execution.id, attempt, "plan executed");
                metrics.record_success(started.elapsed());
                return;
            }
            Err(error) if attempt < retry_attempts => {
                warn!(plan = %plan.id, attempt, error = %error, "execution failed, retrying");
                attempt += 1;
                tokio::time::sleep(retry_delay).await;
            }
            Err(error) => {
                error!(plan = %plan.id, attempt, error = %error, "plan execution failed");
                metrics.record_failure(started.elapsed());
                if let Err(e) = store.release_lease(&plan.id).await {
                    warn!(plan = %plan.id, error = %e, "lease release failed");
                }
                return;
            }
        }
    }
}
