//! Fan-out to the known users of every live worker
//!
//! Each recipient is an independent send: a failure is counted and the
//! broadcast moves on, with no retry. Migration notices go out without any
//! pacing so users learn the new link as soon as possible; general
//! broadcasts sleep `send_delay` between sends.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fleet_store::{BroadcastKind, BroadcastLog, FleetStore, GREETING_KIND, now_millis};
use messenger::MessengerClient;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::registry::FleetRegistry;
use crate::worker::Greeting;

const LINK_PLACEHOLDER: &str = "*link*";

/// Delivery counts. `ok + fail == total`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub total: u64,
    pub ok: u64,
    pub fail: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EditReport {
    pub edited: u64,
    pub failed: u64,
}

/// Replace every `*link*` (any letter case) in `template` with `link`.
pub fn render_link_placeholder(template: &str, link: &str) -> String {
    // ASCII lowercasing keeps byte offsets aligned with the original
    let lower = template.to_ascii_lowercase();
    let mut out = String::with_capacity(template.len() + link.len());
    let mut pos = 0;
    while let Some(found) = lower[pos..].find(LINK_PLACEHOLDER) {
        let start = pos + found;
        out.push_str(&template[pos..start]);
        out.push_str(link);
        pos = start + LINK_PLACEHOLDER.len();
    }
    out.push_str(&template[pos..]);
    out
}

fn kind_label(kind: BroadcastKind) -> &'static str {
    match kind {
        BroadcastKind::General => "general",
        BroadcastKind::Migration => "migration",
    }
}

pub struct BroadcastNotifier {
    store: Arc<FleetStore>,
    registry: Arc<FleetRegistry>,
    greeting: Arc<RwLock<Greeting>>,
    migration_template: String,
    send_delay: Duration,
}

impl BroadcastNotifier {
    pub fn new(
        store: Arc<FleetStore>,
        registry: Arc<FleetRegistry>,
        greeting: Arc<RwLock<Greeting>>,
        migration_template: String,
        send_delay: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            greeting,
            migration_template,
            send_delay,
        }
    }

    /// Tell every known user of every live worker about `link`.
    pub async fn broadcast_migration(&self, link: &str) -> BroadcastReport {
        let text = render_link_placeholder(&self.migration_template, link);
        let report = self
            .deliver(BroadcastKind::Migration, &text, None, Duration::ZERO)
            .await;
        info!(
            link,
            total = report.total,
            ok = report.ok,
            fail = report.fail,
            "migration broadcast finished"
        );
        report
    }

    /// Operator broadcast, optionally with a photo, logged to the store.
    pub async fn broadcast_general(
        &self,
        text: &str,
        photo: Option<&Path>,
    ) -> Result<BroadcastReport> {
        let photo = match photo {
            Some(path) if tokio::fs::try_exists(path).await.unwrap_or(false) => Some(path),
            Some(path) => {
                warn!(photo = %path.display(), "broadcast photo missing, sending text only");
                None
            }
            None => None,
        };

        let report = self
            .deliver(BroadcastKind::General, text, photo, self.send_delay)
            .await;

        self.store
            .record_broadcast(BroadcastLog {
                id: Uuid::new_v4(),
                kind: BroadcastKind::General,
                text: text.to_string(),
                photo_path: photo.map(|p| p.display().to_string()),
                total: report.total,
                ok: report.ok,
                fail: report.fail,
                created_at: now_millis(),
            })
            .await?;

        info!(
            total = report.total,
            ok = report.ok,
            fail = report.fail,
            "broadcast finished"
        );
        Ok(report)
    }

    /// Rewrite every greeting live workers have sent, and use `new_text` for
    /// future greetings.
    ///
    /// Photo greetings carry the text as a caption, so the caption edit is
    /// tried first and the text edit is the fallback.
    pub async fn edit_greetings(&self, new_text: &str) -> EditReport {
        self.greeting.write().await.text = new_text.to_string();

        let mut report = EditReport::default();
        for (worker_id, client) in self.registry.live_clients().await {
            for sent in self.store.sent_messages(worker_id, GREETING_KIND).await {
                let edited = match client
                    .edit_message_caption(sent.chat_id, sent.message_id, new_text)
                    .await
                {
                    Ok(()) => true,
                    Err(_) => client
                        .edit_message_text(sent.chat_id, sent.message_id, new_text)
                        .await
                        .is_ok(),
                };
                if edited {
                    report.edited += 1;
                } else {
                    report.failed += 1;
                    debug!(
                        worker_id,
                        chat_id = sent.chat_id,
                        message_id = sent.message_id,
                        "greeting edit failed"
                    );
                }
            }
        }

        info!(edited = report.edited, failed = report.failed, "greetings edited");
        report
    }

    async fn deliver(
        &self,
        kind: BroadcastKind,
        text: &str,
        photo: Option<&Path>,
        delay: Duration,
    ) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        for (worker_id, client) in self.registry.live_clients().await {
            for user in self.store.load_known_users(worker_id).await {
                report.total += 1;
                let result = send(client.as_ref(), user.user_id, text, photo).await;
                let outcome = match result {
                    Ok(()) => {
                        report.ok += 1;
                        "ok"
                    }
                    Err(e) => {
                        report.fail += 1;
                        debug!(worker_id, user_id = user.user_id, error = %e, "broadcast send failed");
                        "fail"
                    }
                };
                metrics::counter!(
                    "fleet_broadcast_sends_total",
                    "kind" => kind_label(kind),
                    "result" => outcome
                )
                .increment(1);

                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        report
    }
}

async fn send(
    client: &dyn MessengerClient,
    chat_id: i64,
    text: &str,
    photo: Option<&Path>,
) -> messenger::Result<()> {
    match photo {
        Some(photo) => client.send_photo(chat_id, photo, text).await.map(|_| ()),
        None => client.send_message(chat_id, text).await.map(|_| ()),
    }
}
