//! Platform sender abstraction
//!
//! Each delivery platform (chat webhook, email gateway, SMS provider) sits
//! behind the [`Sender`] trait. The dispatcher never looks past it.

pub mod webhook;

pub use webhook::WebhookSender;

use crate::config::PlatformConfig;
use crate::error::Result;
use crate::models::{Capabilities, Message, SendResult, Target};
use async_trait::async_trait;
use std::sync::Arc;

/// Delivery contract implemented by every platform
///
/// Implementations must tolerate concurrent `send` calls, since several
/// dispatches may target the same platform at once.
#[async_trait]
pub trait Sender: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver `message` to `targets`, returning one result per target
    ///
    /// An `Err` means the platform failed outright; per-target failures are
    /// reported through unsuccessful [`SendResult`]s instead.
    async fn send(&self, message: &Message, targets: &[Target]) -> Result<Vec<SendResult>>;

    fn validate_target(&self, target: &Target) -> Result<()>;

    fn capabilities(&self) -> Capabilities;

    async fn is_healthy(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Factory turning a platform name and its configuration into a live sender
pub type SenderCreator =
    Arc<dyn Fn(&str, &PlatformConfig) -> Result<Arc<dyn Sender>> + Send + Sync>;

/// Wrap a closure as a [`SenderCreator`]
pub fn creator<F>(f: F) -> SenderCreator
where
    F: Fn(&str, &PlatformConfig) -> Result<Arc<dyn Sender>> + Send + Sync + 'static,
{
    Arc::new(f)
}
