//! Core types shared by every runtime subsystem

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod error;

pub use error::*;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for agents created through the runtime
    AgentId
);
uuid_id!(
    /// Unique identifier for capability requests
    RequestId
);
uuid_id!(
    /// Unique identifier for queued tasks
    TaskId
);
uuid_id!(
    /// Unique identifier for scheduled (cron or interval) tasks
    ScheduledTaskId
);
uuid_id!(
    /// Unique identifier for logic points
    LogicPointId
);
uuid_id!(
    /// Unique identifier for asynchronously executing logic points
    AsyncNodeId
);

/// Priority levels for task admission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        f.write_str(label)
    }
}

/// Dynamic payload passed between capabilities, tasks and logic points
pub type Payload = serde_json::Value;
