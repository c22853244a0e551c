//! # Dispatch Service
//!
//! Multi-channel notification dispatch engine providing:
//! - Priority work queue with delayed visibility and bounded capacity
//! - Retry with exponential backoff and a dead-letter queue
//! - Auto-scaling worker pool draining the queue
//! - Concurrent per-platform fan-out with health tracking
//! - Delivery receipts with partial-failure status and failure analytics
//!
//! ## Features
//!
//! - **Queue backends**: in-memory (default) or Redis, behind one [`Queue`] trait
//! - **Retry decorator**: [`RetryQueue`] reschedules failed items with backoff and
//!   dead-letters them once the retry budget is spent
//! - **Worker pool**: [`WorkerPool`] scales between configured bounds by queue depth
//! - **Dispatcher**: [`Dispatcher`] builds platform senders lazily from an
//!   instance-scoped registry and sends to every platform at once
//! - **Receipts**: [`ReceiptAggregator`] computes overall status, stores receipts
//!   with a persistence fallback and analyzes failure patterns
//! - **Metrics**: Prometheus counters, gauges and latency histograms
//!
//! ## Usage
//!
//! ```rust,no_run
//! use dispatch_service::{DispatchConfig, DispatchService, Message, Target};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DispatchConfig::from_env()?;
//!     let service = DispatchService::new(config).await?;
//!
//!     let message = Message::new("Deploy finished", "Build 42 is live")
//!         .with_target(Target::new("channel", "ops", "slack"))
//!         .with_target(Target::new("email", "oncall@example.com", "email"));
//!
//!     // Synchronous path
//!     let outcome = service.send(&message).await;
//!     println!("Receipt status: {}", outcome.receipt.status);
//!
//!     // Asynchronous path
//!     service.start().await?;
//!     service.enqueue(message).await?;
//!     service.stop().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod models;
pub mod platform;
pub mod queue;
pub mod receipt;
pub mod service;
pub mod worker;

pub use config::{DispatchConfig, PlatformConfig};
pub use dispatcher::{DispatchOutcome, Dispatcher, PlatformHealth};
pub use error::{DispatchError, Result};
pub use metrics::DispatchMetrics;
pub use models::{Capabilities, Message, MessageFormat, Priority, SendResult, Target};
pub use platform::{creator, Sender, SenderCreator, WebhookSender};
pub use queue::{MemoryQueue, Queue, RedisQueue, RetryQueue, WorkItem};
pub use receipt::{
    calculate_status, check_required_platforms, FailureAnalysis, PlatformResult, Receipt,
    ReceiptAggregator, ReceiptFilter, ReceiptStatus,
};
pub use service::{DispatchHandler, DispatchService, ServiceHealth};
pub use worker::{ItemHandler, PoolHealth, PoolHealthStatus, PoolStats, WorkerPool};

/// Service version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Service name
pub const SERVICE_NAME: &str = "dispatch-service";
