//! Cron and interval scheduling engine.
//!
//! `Scheduler` keeps an in-memory table of scheduled tasks and runs a single
//! background tick loop that hands due tasks to the [`TaskManager`]. It uses
//! the same `Notify`-based shutdown pattern as the task manager's idle wait.
//!
//! Firings of the same task never overlap: a tick that finds a task still
//! running skips it and leaves its `next_run` untouched.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::cron_expr;
use super::cron_types::*;
use super::task_manager::{TaskManager, TaskOptions};
use crate::config::SchedulerConfig;
use crate::events::{EventBus, RuntimeEvent};
use crate::operations::WorkFn;
use crate::types::{ScheduledTaskId, SchedulerError};

/// Live counters for the scheduler.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerMetrics {
    pub tasks_total: usize,
    pub tasks_enabled: usize,
    pub runs_total: u64,
    pub runs_succeeded: u64,
    pub runs_failed: u64,
    pub runs_skipped_overlap: u64,
}

struct Entry {
    task: ScheduledTask,
    schedule: Option<Schedule>,
    job: WorkFn,
    timeout: Option<Duration>,
    in_flight: bool,
}

struct Due {
    id: ScheduledTaskId,
    name: String,
    job: WorkFn,
    options: TaskOptions,
}

struct SchedulerInner {
    tasks: Mutex<HashMap<ScheduledTaskId, Entry>>,
    task_manager: TaskManager,
    events: EventBus,
    timezone: Tz,
    tick_interval: Duration,
    is_running: RwLock<bool>,
    shutdown_notify: Notify,
    tick_handle: Mutex<Option<JoinHandle<()>>>,
    metrics: Mutex<SchedulerMetrics>,
}

/// Cron/interval scheduler driven by one tick loop.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(
        config: &SchedulerConfig,
        task_manager: TaskManager,
        events: EventBus,
    ) -> Result<Self, SchedulerError> {
        let timezone = cron_expr::parse_timezone(&config.timezone)?;
        Ok(Self {
            inner: Arc::new(SchedulerInner {
                tasks: Mutex::new(HashMap::new()),
                task_manager,
                events,
                timezone,
                tick_interval: config.tick_interval,
                is_running: RwLock::new(false),
                shutdown_notify: Notify::new(),
                tick_handle: Mutex::new(None),
                metrics: Mutex::new(SchedulerMetrics::default()),
            }),
        })
    }

    /// Register a recurring (or run-once) task.
    pub fn schedule(
        &self,
        job: WorkFn,
        options: ScheduleOptions,
    ) -> Result<ScheduledTaskId, SchedulerError> {
        let schedule = match &options.trigger {
            Trigger::Cron(expression) => Some(cron_expr::parse(expression)?),
            Trigger::Interval(period) if period.is_zero() => {
                return Err(SchedulerError::InvalidTrigger(
                    "interval must be greater than zero".to_string(),
                ))
            }
            Trigger::Interval(_) => None,
        };

        let now = Utc::now();
        let next_run = if options.immediate {
            Some(now)
        } else {
            self.next_run(&options.trigger, schedule.as_ref(), now)
        };

        let task = ScheduledTask::from_options(&options, next_run);
        let id = task.id;
        tracing::info!(
            "Scheduled task {} ({}) {} next run: {:?}",
            id,
            task.name,
            task.trigger,
            task.next_run
        );

        self.inner.tasks.lock().insert(
            id,
            Entry {
                task,
                schedule,
                job,
                timeout: options.timeout,
                in_flight: false,
            },
        );
        Ok(id)
    }

    pub fn get(&self, id: ScheduledTaskId) -> Option<ScheduledTask> {
        self.inner.tasks.lock().get(&id).map(|e| e.task.clone())
    }

    /// All tasks, oldest first.
    pub fn list(&self) -> Vec<ScheduledTask> {
        let mut tasks: Vec<ScheduledTask> = self
            .inner
            .tasks
            .lock()
            .values()
            .map(|e| e.task.clone())
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Re-enable a task and recompute its next run from now.
    pub fn enable(&self, id: ScheduledTaskId) -> bool {
        let mut tasks = self.inner.tasks.lock();
        let Some(entry) = tasks.get_mut(&id) else {
            return false;
        };
        self.set_enabled(id, entry, true);
        true
    }

    pub fn disable(&self, id: ScheduledTaskId) -> bool {
        let mut tasks = self.inner.tasks.lock();
        let Some(entry) = tasks.get_mut(&id) else {
            return false;
        };
        self.set_enabled(id, entry, false);
        true
    }

    /// Flip a task between enabled and disabled. Returns the new state.
    pub fn toggle(&self, id: ScheduledTaskId) -> Option<bool> {
        let mut tasks = self.inner.tasks.lock();
        let entry = tasks.get_mut(&id)?;
        let enabled = !entry.task.enabled;
        self.set_enabled(id, entry, enabled);
        Some(enabled)
    }

    /// Caller holds the tasks lock.
    fn set_enabled(&self, id: ScheduledTaskId, entry: &mut Entry, enabled: bool) {
        entry.task.enabled = enabled;
        if enabled {
            entry.task.next_run =
                self.next_run(&entry.task.trigger, entry.schedule.as_ref(), Utc::now());
            tracing::info!("Enabled scheduled task {} next run: {:?}", id, entry.task.next_run);
        } else {
            tracing::info!("Disabled scheduled task {}", id);
        }
    }

    pub fn remove(&self, id: ScheduledTaskId) -> bool {
        let removed = self.inner.tasks.lock().remove(&id).is_some();
        if removed {
            tracing::info!("Removed scheduled task {}", id);
        }
        removed
    }

    /// Fire a task now, outside its schedule. Returns `false` when the task
    /// is still running from an earlier firing.
    pub fn trigger_now(&self, id: ScheduledTaskId) -> Result<bool, SchedulerError> {
        let now = Utc::now();
        let due = {
            let mut tasks = self.inner.tasks.lock();
            let entry = tasks.get_mut(&id).ok_or(SchedulerError::NotFound(id))?;
            if entry.in_flight {
                return Ok(false);
            }
            entry.in_flight = true;
            entry.task.last_run = Some(now);
            self.due(entry)
        };

        tracing::info!("Force-triggering scheduled task {} ({})", id, due.name);
        self.dispatch(due);
        Ok(true)
    }

    /// Run one tick at `now`: fire every enabled task whose `next_run` has
    /// arrived. Returns how many tasks were fired.
    pub fn tick_at(&self, now: DateTime<Utc>) -> usize {
        let mut skipped = 0;
        let due: Vec<Due> = {
            let mut tasks = self.inner.tasks.lock();
            let mut due = Vec::new();
            for entry in tasks.values_mut() {
                if !entry.task.enabled {
                    continue;
                }
                match entry.task.next_run {
                    Some(next) if next <= now => {}
                    _ => continue,
                }
                if entry.in_flight {
                    skipped += 1;
                    continue;
                }

                entry.in_flight = true;
                entry.task.last_run = Some(now);
                if entry.task.run_once {
                    entry.task.enabled = false;
                    entry.task.next_run = None;
                } else {
                    entry.task.next_run =
                        self.next_run(&entry.task.trigger, entry.schedule.as_ref(), now);
                }
                due.push(self.due(entry));
            }
            due
        };

        if skipped > 0 {
            tracing::debug!("Scheduler: {} tasks still running, skipped", skipped);
            self.inner.metrics.lock().runs_skipped_overlap += skipped;
        }

        let fired = due.len();
        for job in due {
            self.dispatch(job);
        }
        fired
    }

    /// Start the background tick loop. No-op when already running.
    pub fn start(&self) {
        {
            let mut is_running = self.inner.is_running.write();
            if *is_running {
                return;
            }
            *is_running = true;
        }

        let scheduler = self.clone();
        let tick = self.inner.tick_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !*scheduler.inner.is_running.read() {
                            break;
                        }
                        scheduler.tick_at(Utc::now());
                    }
                    _ = scheduler.inner.shutdown_notify.notified() => {
                        tracing::info!("Scheduler tick loop shutting down");
                        break;
                    }
                }
            }
        });

        *self.inner.tick_handle.lock() = Some(handle);
        tracing::info!("Scheduler started (tick every {:?})", tick);
    }

    /// Stop the tick loop and wait for it to exit. Tasks already handed to
    /// the task manager keep running.
    pub async fn stop(&self) {
        {
            let mut is_running = self.inner.is_running.write();
            if !*is_running {
                return;
            }
            *is_running = false;
        }
        self.inner.shutdown_notify.notify_waiters();

        let handle = self.inner.tick_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        tracing::info!("Scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        *self.inner.is_running.read()
    }

    /// Upcoming fire times for an expression in the scheduler's timezone.
    pub fn next_runs(
        &self,
        expression: &str,
        count: usize,
    ) -> Result<Vec<DateTime<Utc>>, SchedulerError> {
        cron_expr::next_fire_times(Utc::now(), expression, self.inner.timezone, count)
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        let (total, enabled) = {
            let tasks = self.inner.tasks.lock();
            (tasks.len(), tasks.values().filter(|e| e.task.enabled).count())
        };
        let mut metrics = self.inner.metrics.lock().clone();
        metrics.tasks_total = total;
        metrics.tasks_enabled = enabled;
        metrics
    }

    // ── Internals ─────────────────────────────────────────────────────

    fn next_run(
        &self,
        trigger: &Trigger,
        schedule: Option<&Schedule>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match (trigger, schedule) {
            (Trigger::Interval(period), _) => chrono::Duration::from_std(*period)
                .ok()
                .map(|period| now + period),
            (Trigger::Cron(_), Some(schedule)) => {
                cron_expr::next_after(schedule, now, self.inner.timezone)
            }
            (Trigger::Cron(expression), None) => {
                cron_expr::next_fire_time(now, expression, self.inner.timezone)
            }
        }
    }

    fn due(&self, entry: &Entry) -> Due {
        let task = &entry.task;
        let mut options = TaskOptions::named(task.name.clone()).with_priority(task.priority);
        options.timeout = entry.timeout;
        Due {
            id: task.id,
            name: task.name.clone(),
            job: entry.job.clone(),
            options,
        }
    }

    fn dispatch(&self, due: Due) {
        let Due {
            id,
            name,
            job,
            options,
        } = due;

        let on_success = Arc::downgrade(&self.inner);
        let on_error = Arc::downgrade(&self.inner);
        let on_finally = Arc::downgrade(&self.inner);

        let options = options
            .on_success(move |_| {
                record_outcome(&on_success, id, true);
            })
            .on_error(move |error| {
                tracing::warn!("Scheduled task {} failed: {}", id, error);
                record_outcome(&on_error, id, false);
            })
            .on_finally(move || {
                if let Some(inner) = on_finally.upgrade() {
                    if let Some(entry) = inner.tasks.lock().get_mut(&id) {
                        entry.in_flight = false;
                    }
                }
            });

        self.inner.metrics.lock().runs_total += 1;
        self.inner.events.publish(RuntimeEvent::TaskFired {
            task_id: id,
            name: name.clone(),
        });
        tracing::debug!("Firing scheduled task {} ({})", id, name);

        // The scheduler observes the result through the callbacks.
        drop(self.inner.task_manager.submit(job, options));
    }
}

fn record_outcome(inner: &Weak<SchedulerInner>, id: ScheduledTaskId, success: bool) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    if let Some(entry) = inner.tasks.lock().get_mut(&id) {
        if success {
            entry.task.run_count += 1;
        } else {
            entry.task.error_count += 1;
        }
    }
    let mut metrics = inner.metrics.lock();
    if success {
        metrics.runs_succeeded += 1;
    } else {
        metrics.runs_failed += 1;
    }
}
