//! Tracing setup and event-bus telemetry

use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};
use crate::events::{EventBus, RuntimeEvent};
use crate::types::ConfigError;

/// Install the global tracing subscriber. `RUST_LOG` takes precedence over
/// the configured level. Fails if a subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), ConfigError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(config.ansi);

    let result = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };

    result.map_err(|e| ConfigError::Logging {
        message: e.to_string(),
    })
}

/// Forward every bus event into `tracing` until the bus is dropped.
pub fn spawn_event_logger(events: &EventBus) -> JoinHandle<()> {
    let mut receiver = events.subscribe();
    tokio::spawn(async move {
        while let Some(envelope) = receiver.recv().await {
            let topic = envelope.topic();
            match &envelope.event {
                RuntimeEvent::PluginError { name, error } => {
                    tracing::warn!(topic, plugin = %name, "{}", error)
                }
                RuntimeEvent::ActionFailed { name, error } => {
                    tracing::warn!(topic, action = %name, "{}", error)
                }
                RuntimeEvent::FlowFailed { name, error, .. } => {
                    tracing::warn!(topic, logic_point = %name, "{}", error)
                }
                RuntimeEvent::ChainFailed { executed, error } => {
                    tracing::warn!(topic, executed, "{}", error)
                }
                RuntimeEvent::SystemInit
                | RuntimeEvent::SystemReady { .. }
                | RuntimeEvent::SystemShutdown
                | RuntimeEvent::StateChanged { .. } => {
                    tracing::info!(topic, "{:?}", envelope.event)
                }
                other => tracing::debug!(topic, "{:?}", other),
            }
        }
        tracing::debug!("Event logger stopped");
    })
}
