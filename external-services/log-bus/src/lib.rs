//! Audit and activity log shipping over RabbitMQ
//!
//! Producers publish typed log records to a durable queue; consumers receive
//! them with manual acknowledgement and store them wherever they like.
//!
//! - **Connection handle**: [`LogClient`] owns one connection and one channel
//!   and declares its queue (durable, shared, never auto-deleted) on setup.
//! - **Publishing**: records are stamped with the publish time, encoded as JSON
//!   and sent through the default exchange with the queue name as routing key.
//! - **Consuming**: a prefetch-bounded, manual-ack consumer runs on its own
//!   task and hands each record to a handler together with a single-use
//!   [`Acknowledgement`].
//! - **Transports**: [`AmqpTransport`] (lapin) for real brokers,
//!   [`InMemoryBroker`] for tests and local runs.
//!
//! # Queues
//!
//! - `audit_logs`: [`AuditLog`]
//! - `activity_logs`: [`ActivityLog`]
//!
//! # Example
//!
//! ```rust,no_run
//! use log_bus::{Acknowledgement, AuditLog, ConsumeOptions, LogClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = LogClient::initialize_audit_client().await?;
//!
//!     client
//!         .publish_audit_log(
//!             AuditLog::new("patients", "update", "P-1001")
//!                 .with_snapshots(r#"{"status":"new"}"#, r#"{"status":"admitted"}"#)
//!                 .with_action_by("dr.smith"),
//!         )
//!         .await?;
//!
//!     let consumer = client
//!         .consume_audit_logs(
//!             ConsumeOptions::default().with_prefetch_count(10),
//!             |log: AuditLog, ack: Acknowledgement| async move {
//!                 println!("{} {} by {}", log.module, log.action_type, log.action_by);
//!                 ack.settle(true).await;
//!             },
//!         )
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     client.close().await;
//!     consumer.closed().await;
//!     Ok(())
//! }
//! ```

pub mod amqp;
pub mod client;
pub mod config;
pub mod consumer;
pub mod error;
pub mod memory;
pub mod record;
pub mod transport;

pub use amqp::AmqpTransport;
pub use client::LogClient;
pub use config::{BrokerConfig, ConsumeOptions, DecodeFailurePolicy, DEFAULT_PREFETCH_COUNT};
pub use consumer::{Acknowledgement, ConsumerHandle, LogHandler};
pub use error::*;
pub use memory::{Fault, InMemoryBroker};
pub use record::*;
pub use transport::{QueueOptions, TransportError};
