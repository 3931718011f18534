//! Task execution and scheduling
//!
//! - [`TaskManager`]: bounded-concurrency queue with priority admission
//! - [`Scheduler`]: cron and interval triggers feeding the task manager

pub mod cron_expr;
pub mod cron_scheduler;
pub mod cron_types;
pub mod priority_queue;
pub mod task_manager;

pub use cron_expr::{next_fire_time, PRESETS};
pub use cron_scheduler::{Scheduler, SchedulerMetrics};
pub use cron_types::{ScheduleOptions, ScheduleRequest, ScheduledTask, Trigger};
pub use task_manager::{TaskHandle, TaskInfo, TaskManager, TaskOptions, TaskStats, TaskStatus};
