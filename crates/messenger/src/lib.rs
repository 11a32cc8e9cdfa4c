//! Messaging platform client abstraction
//!
//! Defines the `MessengerClient` trait that decouples the fleet from the
//! remote bot platform. `TelegramClient` speaks the Bot HTTP API; tests plug
//! in in-process fakes through the same trait.
//!
//! Every failure is classified as either `Unauthorized` (the credential was
//! rejected by the platform, the sole failover trigger) or `Transient`
//! (anything else: network errors, timeouts, 5xx, per-chat rejections).

pub mod classify;
pub mod telegram;
pub mod types;

pub use classify::{ErrorKind, classify_status};
pub use telegram::{TelegramClient, TelegramFactory};
pub use types::{Chat, Identity, InboundMessage, Sender, Update};

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Boxed future used by the dyn-compatible client traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors from platform calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// The platform rejected the credential itself.
    #[error("credential rejected: {0}")]
    Unauthorized(String),

    /// Anything that may succeed on a later attempt.
    #[error("transient platform error: {0}")]
    Transient(String),
}

impl ClientError {
    /// True when the credential itself was rejected.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ClientError::Unauthorized(_))
    }
}

/// Result alias for platform calls.
pub type Result<T> = std::result::Result<T, ClientError>;

/// One connection to the platform, bound to a single credential.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn MessengerClient>`).
pub trait MessengerClient: Send + Sync {
    /// Lightweight identity call; also serves as the credential probe.
    fn get_self_identity(&self) -> BoxFuture<'_, Result<Identity>>;

    /// Long-poll for inbound updates with ids `>= offset`.
    fn get_updates(&self, offset: i64, timeout: Duration) -> BoxFuture<'_, Result<Vec<Update>>>;

    /// Send a text message, returning the platform message id.
    fn send_message<'a>(&'a self, chat_id: i64, text: &'a str) -> BoxFuture<'a, Result<i64>>;

    /// Send a photo from a local file with a caption, returning the message id.
    fn send_photo<'a>(
        &'a self,
        chat_id: i64,
        photo: &'a Path,
        caption: &'a str,
    ) -> BoxFuture<'a, Result<i64>>;

    fn edit_message_caption<'a>(
        &'a self,
        chat_id: i64,
        message_id: i64,
        caption: &'a str,
    ) -> BoxFuture<'a, Result<()>>;

    fn edit_message_text<'a>(
        &'a self,
        chat_id: i64,
        message_id: i64,
        text: &'a str,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Builds a client for a credential secret.
///
/// Construction never touches the network; the first call on the returned
/// client is where an invalid credential surfaces.
pub trait ClientFactory: Send + Sync {
    fn connect(&self, secret: &str) -> Arc<dyn MessengerClient>;
}
