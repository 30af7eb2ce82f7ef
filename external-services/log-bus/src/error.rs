use thiserror::Error;

use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum LogBusError {
    #[error("Broker configuration missing: {0}")]
    ConfigurationError(String),

    #[error("Failed to connect to broker: {0}")]
    ConnectionError(#[source] TransportError),

    #[error("Failed to open a channel: {0}")]
    ChannelError(#[source] TransportError),

    #[error("Failed to declare queue {queue}: {source}")]
    QueueDeclarationError {
        queue: String,
        #[source]
        source: TransportError,
    },

    #[error("Log client for {topic} is not initialized")]
    NotInitializedError { topic: String },

    #[error("Failed to marshal {kind} log: {source}")]
    SerializationError {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to publish {kind} message: {source}")]
    PublishError {
        kind: &'static str,
        #[source]
        source: TransportError,
    },

    #[error("Failed to register {kind} consumer {consumer}: {source}")]
    SubscriptionError {
        kind: &'static str,
        consumer: String,
        #[source]
        source: TransportError,
    },

    #[error("Failed to set QoS prefetch {prefetch_count}: {source}")]
    QoSConfigurationError {
        prefetch_count: u16,
        #[source]
        source: TransportError,
    },
}

pub type Result<T> = std::result::Result<T, LogBusError>;
