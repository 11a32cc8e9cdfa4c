//! Per-worker event loop
//!
//! Long-polls the platform for updates, remembers every sender as a known
//! user, and answers `/start` with the greeting. A rejected credential ends
//! the loop and is reported to the supervisor; any other poll failure backs
//! off and retries.

use std::sync::Arc;
use std::time::Duration;

use fleet_store::GREETING_KIND;
use messenger::{ClientError, InboundMessage, MessengerClient};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::worker::{FleetEvent, WorkerContext};

const ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub(crate) async fn run(
    ctx: WorkerContext,
    worker_id: u64,
    credential_id: u64,
    client: Arc<dyn MessengerClient>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut offset = 0i64;

    loop {
        let polled = tokio::select! {
            _ = &mut shutdown => break,
            polled = client.get_updates(offset, ctx.poll_timeout) => polled,
        };

        match polled {
            Ok(updates) => {
                for update in updates {
                    offset = offset.max(update.update_id + 1);
                    if let Some(message) = update.message {
                        handle_message(&ctx, worker_id, client.as_ref(), &message).await;
                    }
                }
            }
            Err(ClientError::Unauthorized(description)) => {
                warn!(worker_id, credential_id, %description, "credential revoked by platform");
                let event = FleetEvent::CredentialRevoked {
                    worker_id,
                    credential_id,
                };
                if ctx.events.send(event).await.is_err() {
                    warn!(worker_id, "supervisor gone, revocation not delivered");
                }
                break;
            }
            Err(e) => {
                debug!(worker_id, error = %e, "poll failed, backing off");
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                }
            }
        }
    }

    debug!(worker_id, "dispatch loop exited");
}

async fn handle_message(
    ctx: &WorkerContext,
    worker_id: u64,
    client: &dyn MessengerClient,
    message: &InboundMessage,
) {
    if let Some(from) = &message.from
        && let Err(e) = ctx
            .store
            .upsert_known_user(worker_id, from.id, from.username.clone())
            .await
    {
        warn!(worker_id, user_id = from.id, error = %e, "failed to record user");
    }

    if message.command() == Some("start") {
        send_greeting(ctx, worker_id, client, message.chat.id).await;
    }
}

/// Photo with caption when possible, plain text otherwise.
async fn send_greeting(
    ctx: &WorkerContext,
    worker_id: u64,
    client: &dyn MessengerClient,
    chat_id: i64,
) {
    let greeting = ctx.greeting.read().await.clone();
    let mut sent = None;

    if let Some(photo) = &greeting.photo {
        if tokio::fs::try_exists(photo).await.unwrap_or(false) {
            match client.send_photo(chat_id, photo, &greeting.text).await {
                Ok(message_id) => sent = Some(message_id),
                Err(e) => debug!(worker_id, chat_id, error = %e, "greeting photo failed, sending text"),
            }
        } else {
            debug!(worker_id, photo = %photo.display(), "greeting photo missing, sending text");
        }
    }

    if sent.is_none() {
        match client.send_message(chat_id, &greeting.text).await {
            Ok(message_id) => sent = Some(message_id),
            Err(e) => warn!(worker_id, chat_id, error = %e, "failed to send greeting"),
        }
    }

    if let Some(message_id) = sent
        && let Err(e) = ctx
            .store
            .record_sent_message(worker_id, chat_id, message_id, GREETING_KIND)
            .await
    {
        warn!(worker_id, chat_id, error = %e, "failed to record greeting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakePlatform, context, eventually, start_update, text_update, token};
    use crate::worker::Greeting;

    #[tokio::test]
    async fn records_senders_and_answers_start() {
        let dir = tempfile::tempdir().unwrap();
        let platform = FakePlatform::new();
        platform.set_identity(&token(1), "alpha_bot");
        platform.push_updates(&token(1), vec![text_update(1, 500, "hello"), start_update(2, 501)]);
        let (ctx, _rx) = context(&dir).await;
        *ctx.greeting.write().await = Greeting {
            text: "welcome".into(),
            photo: Some(dir.path().join("missing.jpg")),
        };

        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(run(ctx.clone(), 1, 1, platform.connect(&token(1)), rx));

        let store = ctx.store.clone();
        eventually(|| {
            let store = store.clone();
            async move { !store.sent_messages(1, GREETING_KIND).await.is_empty() }
        })
        .await;

        let _ = tx.send(());
        task.await.unwrap();

        assert_eq!(ctx.store.load_known_users(1).await.len(), 2);
        let texts = platform.texts_to(501);
        assert_eq!(texts, vec!["welcome".to_string()]);
        assert!(platform.photos_to(501).is_empty());
    }

    #[tokio::test]
    async fn greeting_uses_photo_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let photo = dir.path().join("greeting.jpg");
        std::fs::write(&photo, b"jpeg").unwrap();

        let platform = FakePlatform::new();
        platform.set_identity(&token(1), "alpha_bot");
        platform.push_updates(&token(1), vec![start_update(1, 700)]);
        let (ctx, _rx) = context(&dir).await;
        *ctx.greeting.write().await = Greeting {
            text: "caption".into(),
            photo: Some(photo),
        };

        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(run(ctx.clone(), 1, 1, platform.connect(&token(1)), rx));

        let store = ctx.store.clone();
        eventually(|| {
            let store = store.clone();
            async move { !store.sent_messages(1, GREETING_KIND).await.is_empty() }
        })
        .await;
        let _ = tx.send(());
        task.await.unwrap();

        assert_eq!(platform.photos_to(700), vec!["caption".to_string()]);
        assert!(platform.texts_to(700).is_empty());
    }

    #[tokio::test]
    async fn revocation_ends_loop_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let platform = FakePlatform::new();
        platform.revoke(&token(1));
        let (ctx, mut rx) = context(&dir).await;

        let (_tx, shutdown) = oneshot::channel();
        run(ctx, 4, 9, platform.connect(&token(1)), shutdown).await;

        assert_eq!(
            rx.recv().await,
            Some(FleetEvent::CredentialRevoked {
                worker_id: 4,
                credential_id: 9
            })
        );
    }

    #[tokio::test]
    async fn shutdown_interrupts_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let platform = FakePlatform::new();
        platform.set_transient(&token(1));
        let (ctx, mut rx) = context(&dir).await;

        let (tx, shutdown) = oneshot::channel();
        let task = tokio::spawn(run(ctx, 1, 1, platform.connect(&token(1)), shutdown));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = tx.send(());

        tokio::time::timeout(Duration::from_millis(500), task)
            .await
            .expect("loop must exit promptly")
            .unwrap();
        assert!(rx.try_recv().is_err());
    }
}
