//! In-process platform fake and fixtures for unit tests

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleet_store::{CredentialStatus, FleetStore};
use messenger::{
    BoxFuture, Chat, ClientError, ClientFactory, Identity, InboundMessage, MessengerClient,
    Sender, Update,
};
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;

use crate::manager::{FleetManager, FleetSettings};
use crate::notify::AdminNotifier;
use crate::worker::{FleetEvent, Greeting, WorkerContext};

/// A well-formed, unique bot token.
pub(crate) fn token(n: usize) -> String {
    format!("{}:{}", 100_000 + n, "A".repeat(34))
}

pub(crate) fn text_update(update_id: i64, user_id: i64, text: &str) -> Update {
    Update {
        update_id,
        message: Some(InboundMessage {
            message_id: update_id,
            chat: Chat { id: user_id },
            from: Some(Sender {
                id: user_id,
                username: None,
            }),
            text: Some(text.to_string()),
        }),
    }
}

pub(crate) fn start_update(update_id: i64, user_id: i64) -> Update {
    text_update(update_id, user_id, "/start")
}

/// Poll `check` until it holds, failing the test after two seconds.
pub(crate) async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

/// Worker context over a fresh store in `dir`.
pub(crate) async fn context(dir: &tempfile::TempDir) -> (WorkerContext, mpsc::Receiver<FleetEvent>) {
    let store = FleetStore::load(dir.path().join("state.json")).await.unwrap();
    let (events, rx) = mpsc::channel(16);
    let ctx = WorkerContext {
        store: Arc::new(store),
        greeting: Arc::new(RwLock::new(Greeting {
            text: "hi".into(),
            photo: None,
        })),
        events,
        poll_timeout: Duration::from_secs(1),
    };
    (ctx, rx)
}

/// Credential ids that violate "InUse iff exactly one worker binds it".
pub(crate) async fn binding_violations(store: &FleetStore) -> Vec<u64> {
    let workers = store.list_workers().await;
    store
        .load_credentials()
        .await
        .into_iter()
        .filter(|c| {
            let bound = workers
                .iter()
                .filter(|w| w.credential_id == Some(c.id))
                .count();
            (c.status == CredentialStatus::InUse) != (bound == 1) || bound > 1
        })
        .map(|c| c.id)
        .collect()
}

#[derive(Clone)]
enum Behavior {
    Identity(String),
    Revoked,
    Transient,
}

#[derive(Default)]
struct PlatformState {
    behaviors: HashMap<String, Behavior>,
    identity_calls: HashMap<String, usize>,
    updates: HashMap<String, VecDeque<Vec<Update>>>,
    failing_chats: HashSet<i64>,
    texts: Vec<(i64, String)>,
    photos: Vec<(i64, String)>,
    reject_captions: bool,
    text_edits: usize,
    send_attempts: usize,
    next_message_id: i64,
}

impl PlatformState {
    fn behavior(&self, secret: &str) -> Behavior {
        self.behaviors
            .get(secret)
            .cloned()
            .unwrap_or(Behavior::Revoked)
    }

    fn deliver(&mut self, chat_id: i64) -> messenger::Result<i64> {
        if self.failing_chats.contains(&chat_id) {
            return Err(ClientError::Transient("Bad Request: chat not found".into()));
        }
        self.next_message_id += 1;
        Ok(self.next_message_id)
    }
}

/// Shared fake of the remote platform. Unknown secrets are rejected.
#[derive(Clone, Default)]
pub(crate) struct FakePlatform {
    state: Arc<Mutex<PlatformState>>,
}

impl FakePlatform {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut PlatformState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    /// Accept `secret` as the bot `username`. An empty username yields an
    /// identity with no public link.
    pub(crate) fn set_identity(&self, secret: &str, username: &str) {
        self.with(|s| {
            s.behaviors
                .insert(secret.to_string(), Behavior::Identity(username.to_string()))
        });
    }

    pub(crate) fn revoke(&self, secret: &str) {
        self.with(|s| s.behaviors.insert(secret.to_string(), Behavior::Revoked));
    }

    pub(crate) fn set_transient(&self, secret: &str) {
        self.with(|s| s.behaviors.insert(secret.to_string(), Behavior::Transient));
    }

    pub(crate) fn fail_chat(&self, chat_id: i64) {
        self.with(|s| s.failing_chats.insert(chat_id));
    }

    pub(crate) fn reject_caption_edits(&self) {
        self.with(|s| s.reject_captions = true);
    }

    pub(crate) fn push_updates(&self, secret: &str, updates: Vec<Update>) {
        self.with(|s| {
            s.updates
                .entry(secret.to_string())
                .or_default()
                .push_back(updates)
        });
    }

    pub(crate) fn identity_calls(&self, secret: &str) -> usize {
        self.with(|s| s.identity_calls.get(secret).copied().unwrap_or(0))
    }

    pub(crate) fn texts_to(&self, chat_id: i64) -> Vec<String> {
        self.with(|s| {
            s.texts
                .iter()
                .filter(|(chat, _)| *chat == chat_id)
                .map(|(_, text)| text.clone())
                .collect()
        })
    }

    pub(crate) fn photos_to(&self, chat_id: i64) -> Vec<String> {
        self.with(|s| {
            s.photos
                .iter()
                .filter(|(chat, _)| *chat == chat_id)
                .map(|(_, caption)| caption.clone())
                .collect()
        })
    }

    pub(crate) fn text_edits(&self) -> usize {
        self.with(|s| s.text_edits)
    }

    pub(crate) fn send_attempts(&self) -> usize {
        self.with(|s| s.send_attempts)
    }

    pub(crate) fn connect(&self, secret: &str) -> Arc<dyn MessengerClient> {
        Arc::new(FakeClient {
            secret: secret.to_string(),
            platform: self.clone(),
        })
    }

    pub(crate) fn factory(&self) -> Arc<dyn ClientFactory> {
        Arc::new(self.clone())
    }
}

impl ClientFactory for FakePlatform {
    fn connect(&self, secret: &str) -> Arc<dyn MessengerClient> {
        FakePlatform::connect(self, secret)
    }
}

struct FakeClient {
    secret: String,
    platform: FakePlatform,
}

impl MessengerClient for FakeClient {
    fn get_self_identity(&self) -> BoxFuture<'_, messenger::Result<Identity>> {
        Box::pin(async move {
            self.platform.with(|s| {
                *s.identity_calls.entry(self.secret.clone()).or_default() += 1;
                match s.behavior(&self.secret) {
                    Behavior::Identity(username) => Ok(Identity {
                        id: 1,
                        first_name: username.clone(),
                        username: (!username.is_empty()).then_some(username),
                    }),
                    Behavior::Revoked => Err(ClientError::Unauthorized("Unauthorized".into())),
                    Behavior::Transient => Err(ClientError::Transient("timed out".into())),
                }
            })
        })
    }

    fn get_updates(
        &self,
        _offset: i64,
        _timeout: Duration,
    ) -> BoxFuture<'_, messenger::Result<Vec<Update>>> {
        Box::pin(async move {
            let polled = self.platform.with(|s| match s.behavior(&self.secret) {
                Behavior::Revoked => Some(Err(ClientError::Unauthorized("Unauthorized".into()))),
                Behavior::Transient => Some(Err(ClientError::Transient("timed out".into()))),
                Behavior::Identity(_) => s
                    .updates
                    .get_mut(&self.secret)
                    .and_then(|queue| queue.pop_front())
                    .map(Ok),
            });
            match polled {
                Some(result) => result,
                None => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(Vec::new())
                }
            }
        })
    }

    fn send_message<'a>(&'a self, chat_id: i64, text: &'a str) -> BoxFuture<'a, messenger::Result<i64>> {
        Box::pin(async move {
            self.platform.with(|s| {
                s.send_attempts += 1;
                if matches!(s.behaviors.get(&self.secret), Some(Behavior::Revoked)) {
                    return Err(ClientError::Unauthorized("Unauthorized".into()));
                }
                let id = s.deliver(chat_id)?;
                s.texts.push((chat_id, text.to_string()));
                Ok(id)
            })
        })
    }

    fn send_photo<'a>(
        &'a self,
        chat_id: i64,
        _photo: &'a Path,
        caption: &'a str,
    ) -> BoxFuture<'a, messenger::Result<i64>> {
        Box::pin(async move {
            self.platform.with(|s| {
                let id = s.deliver(chat_id)?;
                s.photos.push((chat_id, caption.to_string()));
                Ok(id)
            })
        })
    }

    fn edit_message_caption<'a>(
        &'a self,
        chat_id: i64,
        _message_id: i64,
        _caption: &'a str,
    ) -> BoxFuture<'a, messenger::Result<()>> {
        Box::pin(async move {
            self.platform.with(|s| {
                if s.reject_captions {
                    return Err(ClientError::Transient(
                        "Bad Request: there is no caption in the message to edit".into(),
                    ));
                }
                s.deliver(chat_id).map(|_| ())
            })
        })
    }

    fn edit_message_text<'a>(
        &'a self,
        chat_id: i64,
        _message_id: i64,
        _text: &'a str,
    ) -> BoxFuture<'a, messenger::Result<()>> {
        Box::pin(async move {
            self.platform.with(|s| {
                s.deliver(chat_id)?;
                s.text_edits += 1;
                Ok(())
            })
        })
    }
}

/// Admin notifier that keeps every notice.
#[derive(Default)]
pub(crate) struct RecordingNotifier {
    notices: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub(crate) fn notices(&self) -> Vec<String> {
        self.notices.lock().unwrap().clone()
    }
}

impl AdminNotifier for RecordingNotifier {
    fn notify<'a>(&'a self, text: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.notices.lock().unwrap().push(text.to_string());
        })
    }
}

/// A manager over `n` credentials whose bots are named `bot_1..bot_n`.
pub(crate) struct Harness {
    pub(crate) _dir: tempfile::TempDir,
    pub(crate) store: Arc<FleetStore>,
    pub(crate) platform: FakePlatform,
    pub(crate) notifier: Arc<RecordingNotifier>,
    pub(crate) manager: Arc<FleetManager>,
    events: Mutex<Option<mpsc::Receiver<FleetEvent>>>,
}

impl Harness {
    pub(crate) async fn new(credentials: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            FleetStore::load(dir.path().join("state.json"))
                .await
                .unwrap(),
        );
        let platform = FakePlatform::new();
        let secrets: Vec<String> = (1..=credentials).map(token).collect();
        for (n, secret) in secrets.iter().enumerate() {
            platform.set_identity(secret, &format!("bot_{}", n + 1));
        }
        store.insert_credentials(secrets).await.unwrap();

        let notifier = Arc::new(RecordingNotifier::default());
        let (manager, events) = FleetManager::new(
            store.clone(),
            platform.factory(),
            notifier.clone(),
            settings(true),
        );
        Self {
            _dir: dir,
            store,
            platform,
            notifier,
            manager,
            events: Mutex::new(Some(events)),
        }
    }

    pub(crate) fn spawn_supervisor(&self) -> JoinHandle<()> {
        let events = self.events.lock().unwrap().take().unwrap();
        self.manager.spawn_supervisor(events)
    }

    /// A second manager over the same store and platform, as after a
    /// process restart.
    pub(crate) fn restart(&self, resume_on_start: bool) -> (Arc<FleetManager>, mpsc::Receiver<FleetEvent>) {
        FleetManager::new(
            self.store.clone(),
            self.platform.factory(),
            self.notifier.clone(),
            settings(resume_on_start),
        )
    }
}

fn settings(resume_on_start: bool) -> FleetSettings {
    FleetSettings {
        greeting: Greeting {
            text: "hi".into(),
            photo: None,
        },
        poll_timeout: Duration::from_secs(1),
        send_delay: Duration::ZERO,
        migration_template: "moved: *link*".into(),
        resume_on_start,
    }
}
