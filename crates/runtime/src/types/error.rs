//! Error types for the runtime and its subsystems

use std::time::Duration;
use thiserror::Error;

use super::{LogicPointId, ScheduledTaskId, TaskId};
use crate::lifecycle::RuntimeState;

/// Main runtime error type
#[derive(Error, Debug, Clone)]
pub enum RuntimeError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Operation error: {0}")]
    Operation(#[from] OperationError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("Flow error: {0}")]
    Flow(#[from] FlowError),

    /// Failure reported by user-supplied work (task bodies, logic point handlers)
    #[error("{0}")]
    Handler(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// Build a handler failure from any displayable message.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }

    /// Strip retry wrapping and return the error that actually occurred.
    pub fn root_cause(&self) -> &RuntimeError {
        match self {
            RuntimeError::Operation(OperationError::RetryExhausted { last, .. }) => {
                last.root_cause()
            }
            other => other,
        }
    }

    /// Consuming form of [`RuntimeError::root_cause`].
    pub fn into_root_cause(self) -> RuntimeError {
        match self {
            RuntimeError::Operation(OperationError::RetryExhausted { last, .. }) => {
                last.into_root_cause()
            }
            other => other,
        }
    }

    /// Whether another attempt could change the outcome.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.root_cause(),
            RuntimeError::Registry(RegistryError::NotFound { .. })
                | RuntimeError::Registry(RegistryError::Validation { .. })
                | RuntimeError::Operation(OperationError::NotFound { .. })
                | RuntimeError::Task(TaskError::Cancelled { .. })
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self.root_cause(),
            RuntimeError::Registry(RegistryError::NotFound { .. })
                | RuntimeError::Operation(OperationError::NotFound { .. })
                | RuntimeError::Flow(FlowError::NotFound { .. })
                | RuntimeError::Scheduler(SchedulerError::NotFound(_))
                | RuntimeError::Plugin(PluginError::NotFound { .. })
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self.root_cause(),
            RuntimeError::Operation(OperationError::Timeout { .. })
        )
    }
}

/// Configuration-related errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("IO error reading config file: {message}")]
    IoError { message: String },

    #[error("Configuration parsing error: {message}")]
    ParseError { message: String },

    #[error("Failed to install tracing subscriber: {message}")]
    Logging { message: String },
}

/// Lifecycle state errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: RuntimeState, to: RuntimeState },

    #[error("Operation requires state {expected}, runtime is {actual}")]
    NotInState {
        expected: RuntimeState,
        actual: RuntimeState,
    },
}

/// Errors produced while running async operations
#[derive(Error, Debug, Clone)]
pub enum OperationError {
    #[error("Operation '{name}' timed out after {after:?}")]
    Timeout { name: String, after: Duration },

    #[error("Operation '{name}' failed after {attempts} attempts: {last}")]
    RetryExhausted {
        name: String,
        attempts: u32,
        last: Box<RuntimeError>,
    },

    #[error("Operation not found: {id}")]
    NotFound { id: String },

    #[error("Operation '{name}' panicked: {message}")]
    Panicked { name: String, message: String },
}

/// Task queue errors
#[derive(Error, Debug, Clone)]
pub enum TaskError {
    #[error("Task {id} was cancelled before it started")]
    Cancelled { id: TaskId },

    #[error("Task {id} was dropped before reporting a result")]
    Dropped { id: TaskId },
}

/// Errors produced by the scheduler
#[derive(Error, Debug, Clone)]
pub enum SchedulerError {
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("invalid trigger: {0}")]
    InvalidTrigger(String),

    #[error("scheduled task not found: {0}")]
    NotFound(ScheduledTaskId),
}

/// Capability registry and dispatch errors
#[derive(Error, Debug, Clone)]
pub enum RegistryError {
    #[error("Capability not found: {name}")]
    NotFound { name: String },

    #[error("Capability already registered: {name}")]
    DuplicateRegistration { name: String },

    #[error("Invalid input for {name}: {reason}")]
    Validation { name: String, reason: String },

    #[error("Capability {name} failed: {error}")]
    CapabilityFailed { name: String, error: String },
}

/// Plugin lifecycle errors
#[derive(Error, Debug, Clone)]
pub enum PluginError {
    #[error("Plugin '{name}' failed to initialize: {reason}")]
    InitFailed { name: String, reason: String },

    #[error("Plugin '{name}' failed to shut down: {reason}")]
    DestroyFailed { name: String, reason: String },

    #[error("Plugin not found: {name}")]
    NotFound { name: String },

    #[error("Plugin already loaded: {name}")]
    AlreadyLoaded { name: String },

    #[error("Plugin '{plugin}' requires '{dependency}' which is not initialized")]
    MissingDependency { plugin: String, dependency: String },

    #[error("Failed to load plugin '{name}': {reason}")]
    LoadFailed { name: String, reason: String },

    #[error("No plugin loader configured, cannot resolve '{name}'")]
    LoaderUnavailable { name: String },

    #[error("Plugin core has not been set")]
    CoreNotSet,
}

/// Logic point / flow engine errors
#[derive(Error, Debug, Clone)]
pub enum FlowError {
    #[error("Logic point not found: {id}")]
    NotFound { id: String },

    #[error("Logic point name already in use: {name}")]
    DuplicateName { name: String },

    #[error("No branch found for decision output '{output}'")]
    NoBranchFound { output: String },

    #[error("Logic point {id} is a {actual} node, expected {expected}")]
    WrongType {
        id: LogicPointId,
        expected: String,
        actual: String,
    },
}
