//! Telegram Bot API client
//!
//! Every method is a POST to `{api_url}/bot{token}/{method}`. Responses use
//! the `{"ok": bool, "result": ..., "error_code": ..., "description": ...}`
//! envelope; failures are classified by `error_code` (falling back to the
//! HTTP status) via `classify_status`.
//!
//! reqwest errors carry the request URL, which embeds the token, so every
//! transport error is stripped with `without_url()` before it is formatted.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::Secret;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::classify::{ErrorKind, classify_status};
use crate::types::{Identity, Update};
use crate::{BoxFuture, ClientError, ClientFactory, MessengerClient, Result};

/// Extra time granted on top of the long-poll timeout before the HTTP
/// request itself is abandoned.
const POLL_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    error_code: Option<u16>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

/// Client bound to one bot token.
pub struct TelegramClient {
    http: reqwest::Client,
    api_url: String,
    token: Secret<String>,
}

impl TelegramClient {
    pub fn new(http: reqwest::Client, api_url: impl Into<String>, token: Secret<String>) -> Self {
        Self {
            http,
            api_url: api_url.into(),
            token,
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.api_url.trim_end_matches('/'),
            self.token.expose(),
            method
        )
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<T> {
        let mut request = self.http.post(self.method_url(method)).json(&body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request.send().await.map_err(transport_error)?;
        decode(method, response).await
    }
}

/// Map a reqwest transport failure to a transient error without leaking the URL.
fn transport_error(e: reqwest::Error) -> ClientError {
    ClientError::Transient(e.without_url().to_string())
}

async fn decode<T: DeserializeOwned>(method: &str, response: reqwest::Response) -> Result<T> {
    let status = response.status().as_u16();
    let body = response.text().await.map_err(transport_error)?;

    let parsed: ApiResponse<T> = match serde_json::from_str(&body) {
        Ok(p) => p,
        Err(e) => {
            // Non-JSON bodies come from proxies and load balancers; classify by status
            let message = format!("{method}: HTTP {status}: unparseable body: {e}");
            return Err(match classify_status(status) {
                ErrorKind::Unauthorized => ClientError::Unauthorized(message),
                ErrorKind::Transient => ClientError::Transient(message),
            });
        }
    };

    if parsed.ok {
        return parsed
            .result
            .ok_or_else(|| ClientError::Transient(format!("{method}: ok response without result")));
    }

    let code = parsed.error_code.unwrap_or(status);
    let description = parsed
        .description
        .unwrap_or_else(|| format!("HTTP {status}"));
    debug!(method, code, description = %description, "platform call failed");
    let message = format!("{method}: {code} {description}");
    Err(match classify_status(code) {
        ErrorKind::Unauthorized => ClientError::Unauthorized(message),
        ErrorKind::Transient => ClientError::Transient(message),
    })
}

impl MessengerClient for TelegramClient {
    fn get_self_identity(&self) -> BoxFuture<'_, Result<Identity>> {
        Box::pin(async move { self.call("getMe", serde_json::json!({}), None).await })
    }

    fn get_updates(&self, offset: i64, timeout: Duration) -> BoxFuture<'_, Result<Vec<Update>>> {
        Box::pin(async move {
            self.call(
                "getUpdates",
                serde_json::json!({
                    "offset": offset,
                    "timeout": timeout.as_secs(),
                    "allowed_updates": ["message"],
                }),
                Some(timeout + POLL_GRACE),
            )
            .await
        })
    }

    fn send_message<'a>(&'a self, chat_id: i64, text: &'a str) -> BoxFuture<'a, Result<i64>> {
        Box::pin(async move {
            let sent: SentMessage = self
                .call(
                    "sendMessage",
                    serde_json::json!({
                        "chat_id": chat_id,
                        "text": text,
                        "parse_mode": "HTML",
                    }),
                    None,
                )
                .await?;
            Ok(sent.message_id)
        })
    }

    fn send_photo<'a>(
        &'a self,
        chat_id: i64,
        photo: &'a Path,
        caption: &'a str,
    ) -> BoxFuture<'a, Result<i64>> {
        Box::pin(async move {
            let bytes = tokio::fs::read(photo).await.map_err(|e| {
                ClientError::Transient(format!("reading photo {}: {e}", photo.display()))
            })?;
            let file_name = photo
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "photo.jpg".to_string());

            let form = Form::new()
                .text("chat_id", chat_id.to_string())
                .text("caption", caption.to_string())
                .text("parse_mode", "HTML")
                .part("photo", Part::bytes(bytes).file_name(file_name));

            let response = self
                .http
                .post(self.method_url("sendPhoto"))
                .multipart(form)
                .send()
                .await
                .map_err(transport_error)?;
            let sent: SentMessage = decode("sendPhoto", response).await?;
            Ok(sent.message_id)
        })
    }

    fn edit_message_caption<'a>(
        &'a self,
        chat_id: i64,
        message_id: i64,
        caption: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let _: serde_json::Value = self
                .call(
                    "editMessageCaption",
                    serde_json::json!({
                        "chat_id": chat_id,
                        "message_id": message_id,
                        "caption": caption,
                        "parse_mode": "HTML",
                    }),
                    None,
                )
                .await?;
            Ok(())
        })
    }

    fn edit_message_text<'a>(
        &'a self,
        chat_id: i64,
        message_id: i64,
        text: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let _: serde_json::Value = self
                .call(
                    "editMessageText",
                    serde_json::json!({
                        "chat_id": chat_id,
                        "message_id": message_id,
                        "text": text,
                        "parse_mode": "HTML",
                    }),
                    None,
                )
                .await?;
            Ok(())
        })
    }
}

/// Factory sharing one HTTP connection pool across all bot tokens.
#[derive(Clone)]
pub struct TelegramFactory {
    http: reqwest::Client,
    api_url: String,
}

impl TelegramFactory {
    pub fn new(http: reqwest::Client, api_url: impl Into<String>) -> Self {
        Self {
            http,
            api_url: api_url.into(),
        }
    }
}

impl ClientFactory for TelegramFactory {
    fn connect(&self, secret: &str) -> Arc<dyn MessengerClient> {
        Arc::new(TelegramClient::new(
            self.http.clone(),
            self.api_url.clone(),
            Secret::new(secret.to_string()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::Path as AxumPath;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use tokio::net::TcpListener;

    const GOOD: &str = "123456:good-token";
    const REVOKED: &str = "123456:revoked-token";

    /// Mock Bot API: `GOOD` answers every method, `REVOKED` gets 401.
    async fn start_mock_api() -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let app = Router::new().route(
                "/{token}/{method}",
                axum::routing::post(
                    |AxumPath((token, method)): AxumPath<(String, String)>| async move {
                        let token = token.trim_start_matches("bot").to_string();
                        if token == REVOKED {
                            return (
                                StatusCode::UNAUTHORIZED,
                                serde_json::json!({
                                    "ok": false,
                                    "error_code": 401,
                                    "description": "Unauthorized"
                                })
                                .to_string(),
                            )
                                .into_response();
                        }
                        let result = match method.as_str() {
                            "getMe" => serde_json::json!({
                                "id": 42, "is_bot": true,
                                "first_name": "Mirror", "username": "mirror_bot"
                            }),
                            "getUpdates" => serde_json::json!([{
                                "update_id": 5,
                                "message": {
                                    "message_id": 9,
                                    "chat": {"id": 100},
                                    "from": {"id": 100, "username": "alice"},
                                    "text": "/start"
                                }
                            }]),
                            "sendMessage" | "sendPhoto" => serde_json::json!({"message_id": 77}),
                            "editMessageCaption" => {
                                return (
                                    StatusCode::BAD_REQUEST,
                                    serde_json::json!({
                                        "ok": false,
                                        "error_code": 400,
                                        "description": "Bad Request: there is no caption in the message to edit"
                                    })
                                    .to_string(),
                                )
                                    .into_response();
                            }
                            _ => serde_json::json!(true),
                        };
                        (
                            StatusCode::OK,
                            serde_json::json!({"ok": true, "result": result}).to_string(),
                        )
                            .into_response()
                    },
                ),
            );
            axum::serve(listener, app).await.unwrap();
        });

        (url, handle)
    }

    fn client(url: &str, token: &str) -> TelegramClient {
        TelegramClient::new(reqwest::Client::new(), url, Secret::new(token.to_string()))
    }

    #[tokio::test]
    async fn get_me_returns_identity() {
        let (url, _server) = start_mock_api().await;
        let identity = client(&url, GOOD).get_self_identity().await.unwrap();
        assert_eq!(identity.id, 42);
        assert_eq!(identity.username.as_deref(), Some("mirror_bot"));
    }

    #[tokio::test]
    async fn revoked_token_is_unauthorized() {
        let (url, _server) = start_mock_api().await;
        let err = client(&url, REVOKED).get_self_identity().await.unwrap_err();
        assert!(err.is_unauthorized(), "got: {err}");
    }

    #[tokio::test]
    async fn unreachable_api_is_transient() {
        // Port 9 (discard) is not listening on loopback in test environments
        let err = client("http://127.0.0.1:9", GOOD)
            .get_self_identity()
            .await
            .unwrap_err();
        assert!(!err.is_unauthorized());
        assert!(
            !err.to_string().contains("good-token"),
            "transport errors must not leak the token: {err}"
        );
    }

    #[tokio::test]
    async fn get_updates_parses_messages() {
        let (url, _server) = start_mock_api().await;
        let updates = client(&url, GOOD)
            .get_updates(0, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(updates.len(), 1);
        let message = updates[0].message.as_ref().unwrap();
        assert_eq!(message.chat.id, 100);
        assert_eq!(message.command(), Some("start"));
    }

    #[tokio::test]
    async fn send_message_returns_message_id() {
        let (url, _server) = start_mock_api().await;
        let id = client(&url, GOOD).send_message(100, "hi").await.unwrap();
        assert_eq!(id, 77);
    }

    #[tokio::test]
    async fn send_photo_uploads_file() {
        let (url, _server) = start_mock_api().await;
        let dir = tempfile::tempdir().unwrap();
        let photo = dir.path().join("greeting.jpg");
        tokio::fs::write(&photo, b"\xFF\xD8\xFF").await.unwrap();

        let id = client(&url, GOOD)
            .send_photo(100, &photo, "caption")
            .await
            .unwrap();
        assert_eq!(id, 77);
    }

    #[tokio::test]
    async fn send_photo_missing_file_is_transient() {
        let (url, _server) = start_mock_api().await;
        let err = client(&url, GOOD)
            .send_photo(100, Path::new("/nonexistent/photo.jpg"), "caption")
            .await
            .unwrap_err();
        assert!(!err.is_unauthorized());
    }

    #[tokio::test]
    async fn rejected_edit_is_transient() {
        let (url, _server) = start_mock_api().await;
        let c = client(&url, GOOD);
        let err = c.edit_message_caption(100, 9, "new").await.unwrap_err();
        assert!(!err.is_unauthorized());
        c.edit_message_text(100, 9, "new").await.unwrap();
    }

    #[tokio::test]
    async fn factory_binds_token_per_client() {
        let (url, _server) = start_mock_api().await;
        let factory = TelegramFactory::new(reqwest::Client::new(), url);
        assert!(factory.connect(GOOD).get_self_identity().await.is_ok());
        assert!(
            factory
                .connect(REVOKED)
                .get_self_identity()
                .await
                .unwrap_err()
                .is_unauthorized()
        );
    }
}
