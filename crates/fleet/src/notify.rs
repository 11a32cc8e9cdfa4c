//! Administrative notification channel
//!
//! Failover progress (bans, dead candidates, rebinds, exhaustion) is
//! reported to a fixed set of admin chats. Delivery is best effort: a failed
//! send is logged and never fails the operation that triggered it.

use std::sync::Arc;

use messenger::{BoxFuture, MessengerClient};
use tracing::{error, info, warn};

pub trait AdminNotifier: Send + Sync {
    fn notify<'a>(&'a self, text: &'a str) -> BoxFuture<'a, ()>;
}

/// Sends notices through a dedicated bot to each admin chat.
pub struct MessengerAdminNotifier {
    client: Arc<dyn MessengerClient>,
    admin_ids: Vec<i64>,
}

impl MessengerAdminNotifier {
    pub fn new(client: Arc<dyn MessengerClient>, admin_ids: Vec<i64>) -> Self {
        Self { client, admin_ids }
    }
}

impl AdminNotifier for MessengerAdminNotifier {
    fn notify<'a>(&'a self, text: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            for &admin_id in &self.admin_ids {
                match self.client.send_message(admin_id, text).await {
                    Ok(_) => {}
                    // Every other recipient would be refused the same way
                    Err(e) if e.is_unauthorized() => {
                        error!(error = %e, "notifier credential rejected, notice dropped");
                        return;
                    }
                    Err(e) => warn!(admin_id, error = %e, "failed to notify admin"),
                }
            }
        })
    }
}

/// Writes notices to the log only. Used when no notifier bot is configured.
pub struct LogNotifier;

impl AdminNotifier for LogNotifier {
    fn notify<'a>(&'a self, text: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            info!(notice = text, "admin notice");
        })
    }
}
