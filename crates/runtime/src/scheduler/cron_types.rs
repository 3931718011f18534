//! Types for scheduled (cron and interval) tasks.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Payload, Priority, ScheduledTaskId, SchedulerError};

/// How a scheduled task fires. Exactly one mode per task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    /// Five-field cron expression or preset such as `@hourly`
    Cron(String),
    /// Fixed period between firings
    Interval(#[serde(with = "humantime_serde")] Duration),
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::Cron(expr) => write!(f, "cron({expr})"),
            Trigger::Interval(period) => write!(f, "every {period:?}"),
        }
    }
}

/// Settings for a new scheduled task.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleOptions {
    pub name: String,
    pub trigger: Trigger,
    /// Qualified action this task invokes, when it targets one
    pub action: Option<String>,
    pub action_input: Payload,
    /// Disable after the first firing
    pub run_once: bool,
    /// Fire on the next tick instead of waiting a full period
    pub immediate: bool,
    pub priority: Priority,
    pub timeout: Option<Duration>,
}

impl ScheduleOptions {
    pub fn new(name: impl Into<String>, trigger: Trigger) -> Self {
        Self {
            name: name.into(),
            trigger,
            action: None,
            action_input: Payload::Null,
            run_once: false,
            immediate: false,
            priority: Priority::Normal,
            timeout: None,
        }
    }

    pub fn cron(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self::new(name, Trigger::Cron(expression.into()))
    }

    pub fn interval(name: impl Into<String>, period: Duration) -> Self {
        Self::new(name, Trigger::Interval(period))
    }

    pub fn for_action(mut self, action: impl Into<String>, input: Payload) -> Self {
        self.action = Some(action.into());
        self.action_input = input;
        self
    }

    pub fn run_once(mut self) -> Self {
        self.run_once = true;
        self
    }

    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A scheduled task as seen from outside the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    pub id: ScheduledTaskId,
    pub name: String,
    pub trigger: Trigger,
    pub action: Option<String>,
    pub action_input: Payload,
    pub run_once: bool,
    pub immediate: bool,
    pub enabled: bool,
    pub priority: Priority,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub error_count: u64,
    pub created_at: DateTime<Utc>,
}

impl ScheduledTask {
    pub(crate) fn from_options(options: &ScheduleOptions, next_run: Option<DateTime<Utc>>) -> Self {
        Self {
            id: ScheduledTaskId::new(),
            name: options.name.clone(),
            trigger: options.trigger.clone(),
            action: options.action.clone(),
            action_input: options.action_input.clone(),
            run_once: options.run_once,
            immediate: options.immediate,
            enabled: true,
            priority: options.priority,
            last_run: None,
            next_run,
            run_count: 0,
            error_count: 0,
            created_at: Utc::now(),
        }
    }
}

/// Scheduling request as received from an external front-end.
///
/// Exactly one of `cron` and `interval` (milliseconds) must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRequest {
    pub name: String,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub interval: Option<u64>,
    pub action: String,
    #[serde(default)]
    pub action_input: Option<Payload>,
    #[serde(default)]
    pub run_once: Option<bool>,
    #[serde(default)]
    pub immediate: Option<bool>,
}

impl TryFrom<ScheduleRequest> for ScheduleOptions {
    type Error = SchedulerError;

    fn try_from(request: ScheduleRequest) -> Result<Self, Self::Error> {
        let trigger = match (request.cron, request.interval) {
            (Some(expression), None) => Trigger::Cron(expression),
            (None, Some(0)) => {
                return Err(SchedulerError::InvalidTrigger(
                    "interval must be greater than zero".to_string(),
                ))
            }
            (None, Some(ms)) => Trigger::Interval(Duration::from_millis(ms)),
            (Some(_), Some(_)) => {
                return Err(SchedulerError::InvalidTrigger(
                    "set either cron or interval, not both".to_string(),
                ))
            }
            (None, None) => {
                return Err(SchedulerError::InvalidTrigger(
                    "one of cron or interval is required".to_string(),
                ))
            }
        };

        let mut options = ScheduleOptions::new(request.name, trigger)
            .for_action(request.action, request.action_input.unwrap_or(Payload::Null));
        options.run_once = request.run_once.unwrap_or(false);
        options.immediate = request.immediate.unwrap_or(false);
        Ok(options)
    }
}
