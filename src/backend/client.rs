//!
//! REST and realtime client for the row-oriented sync backend.
//!
//! This module provides an async client that maps the `RemoteStore` contract onto one backend
//! table per entity type: row CRUD over HTTP and a Phoenix-style WebSocket channel delivering
//! row-level change events for the authenticated user. All methods are async and designed for
//! use with Tokio.

use super::types::*;
use crate::config::BackendConfig;
use crate::sync::entity::OWNER_FIELD;
use crate::sync::{AuthSession, SyncEntity};

use futures_util::{SinkExt, StreamExt};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::json;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Message, client::IntoClientRequest},
};
use tracing::{debug, error, info, warn};

/// Interval between Phoenix heartbeats on the realtime socket.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// Backend client bound to the table of one entity type
pub struct RestBackend<E> {
    /// The underlying HTTP client for row requests.
    http_client: Client,
    /// Endpoints and API key.
    config: BackendConfig,
    /// Bearer token of the current session, if any.
    access_token: Arc<RwLock<Option<String>>>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: SyncEntity> RestBackend<E> {
    /// Create a new backend client.
    ///
    /// # Arguments
    /// * `config` - REST and realtime endpoints plus the project API key.
    ///
    /// # Errors
    /// Returns `BackendError::HttpError` if the HTTP client cannot be built.
    pub fn new(config: BackendConfig) -> Result<Self, BackendError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            http_client,
            config,
            access_token: Arc::new(RwLock::new(None)),
            _entity: PhantomData,
        })
    }

    fn table(&self) -> &'static str {
        E::KIND.table_name()
    }

    fn table_url(&self) -> String {
        format!("{}/{}", self.config.rest_url.trim_end_matches('/'), self.table())
    }

    /// Attach API key and bearer token headers.
    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let token = self
            .access_token
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_else(|| self.config.api_key.clone());

        request
            .header("apikey", &self.config.api_key)
            .bearer_auth(token)
    }

    /// Send a row request and decode the returned representation.
    ///
    /// # Returns
    /// The rows returned by the backend, or the matching `BackendError` for the HTTP status.
    async fn execute(&self, request: RequestBuilder) -> Result<Vec<E>, BackendError> {
        let response = self.authorized(request).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&text)?)
    }

    fn id_filter(id: &str) -> [(&'static str, String); 1] {
        [("id", format!("eq.{}", id))]
    }

    /// Realtime topic of this table.
    fn topic(&self) -> String {
        format!("realtime:public:{}", self.table())
    }

    /// Channel join for the row changes owned by the session's user.
    fn join_message(&self, session: &AuthSession) -> serde_json::Value {
        json!({
            "topic": self.topic(),
            "event": "phx_join",
            "payload": {
                "config": {
                    "postgres_changes": [{
                        "event": "*",
                        "schema": "public",
                        "table": self.table(),
                        "filter": format!("{}=eq.{}", OWNER_FIELD, session.user_id),
                    }]
                },
                "access_token": session.access_token,
            },
            "ref": "1"
        })
    }
}

/// Interpret a frame received while waiting for the channel join.
///
/// Returns `None` for frames other than the join reply. A refused join is final: auth failures
/// map to `Unauthorized`, anything else to `Rejected`.
fn join_reply(parsed: &serde_json::Value) -> Option<Result<(), BackendError>> {
    if parsed.get("event").and_then(|e| e.as_str()) != Some("phx_reply") {
        return None;
    }
    let payload = parsed.get("payload");
    let status = payload
        .and_then(|p| p.get("status"))
        .and_then(|s| s.as_str())
        .unwrap_or("error");
    if status == "ok" {
        return Some(Ok(()));
    }

    let reason = payload
        .and_then(|p| p.get("response"))
        .map(|r| r.to_string())
        .unwrap_or_default();
    if reason.contains("token") || reason.contains("auth") {
        return Some(Err(BackendError::Unauthorized(reason)));
    }
    Some(Err(BackendError::Rejected(format!(
        "Channel join refused: {}",
        reason
    ))))
}

/// Map a non-success HTTP status onto the backend failure taxonomy.
fn classify_status(status: StatusCode, body: String) -> BackendError {
    let detail = format!("{}: {}", status, body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BackendError::Unauthorized(detail),
        StatusCode::NOT_FOUND => BackendError::NotFound(detail),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            BackendError::Unavailable(detail)
        }
        s if s.is_server_error() => BackendError::Unavailable(detail),
        _ => BackendError::Rejected(detail),
    }
}

#[async_trait::async_trait]
impl<E: SyncEntity> RemoteStore<E> for RestBackend<E> {
    async fn fetch_one(&self, id: &str) -> Result<Option<E>, BackendError> {
        let request = self
            .http_client
            .get(self.table_url())
            .query(&Self::id_filter(id))
            .query(&[("select", "*")]);

        let mut rows = self.execute(request).await?;
        Ok(if rows.is_empty() {
            None
        } else {
            Some(rows.swap_remove(0))
        })
    }

    async fn create(&self, entity: &E) -> Result<E, BackendError> {
        debug!("Creating {} row {}", self.table(), entity.id());
        let request = self
            .http_client
            .post(self.table_url())
            .header("Prefer", "return=representation,resolution=merge-duplicates")
            .json(entity);

        let mut rows = self.execute(request).await?;
        if rows.is_empty() {
            // Upserts that changed nothing may come back without a representation.
            return Ok(entity.clone());
        }
        Ok(rows.swap_remove(0))
    }

    async fn update(&self, id: &str, delta: &serde_json::Value) -> Result<E, BackendError> {
        debug!("Updating {} row {}", self.table(), id);
        let request = self
            .http_client
            .patch(self.table_url())
            .query(&Self::id_filter(id))
            .header("Prefer", "return=representation")
            .json(delta);

        let mut rows = self.execute(request).await?;
        if rows.is_empty() {
            return Err(BackendError::NotFound(format!("{} {}", self.table(), id)));
        }
        Ok(rows.swap_remove(0))
    }

    async fn delete(&self, id: &str) -> Result<(), BackendError> {
        debug!("Deleting {} row {}", self.table(), id);
        let request = self
            .http_client
            .delete(self.table_url())
            .query(&Self::id_filter(id))
            .header("Prefer", "return=representation");

        let rows = self.execute(request).await?;
        if rows.is_empty() {
            return Err(BackendError::NotFound(format!("{} {}", self.table(), id)));
        }
        Ok(())
    }

    /// Subscribe to row changes of this table for the session's user.
    ///
    /// # Returns
    /// A pinned async stream of typed realtime events. Dropping the stream closes the socket.
    ///
    /// # Errors
    /// Returns `BackendError` if the WebSocket connection or channel join fails.
    async fn subscribe(&self, session: &AuthSession) -> Result<RealtimeStream<E>, BackendError> {
        let url = format!(
            "{}?apikey={}&vsn=1.0.0",
            self.config.realtime_url, self.config.api_key
        );
        debug!("Attempting WebSocket connection to: {}", self.config.realtime_url);

        let request = url.into_client_request()?;
        let (ws_stream, response) = connect_async(request).await?;
        debug!(
            "WebSocket connection established, response status: {}",
            response.status()
        );
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let topic = self.topic();
        let join_message = self.join_message(session);
        ws_sender
            .send(Message::Text(join_message.to_string()))
            .await?;

        // Wait for join reply
        loop {
            let Some(msg) = ws_receiver.next().await else {
                return Err(BackendError::Protocol(
                    "Socket closed before channel join".to_string(),
                ));
            };
            match msg? {
                Message::Text(text) => {
                    let parsed: serde_json::Value = serde_json::from_str(&text)?;
                    match join_reply(&parsed) {
                        None => continue,
                        Some(Ok(())) => break,
                        Some(Err(e)) => return Err(e),
                    }
                }
                Message::Ping(_) | Message::Pong(_) => continue,
                _ => {
                    return Err(BackendError::Protocol(
                        "Unexpected message type during join".to_string(),
                    ));
                }
            }
        }

        info!("Joined realtime channel {} for user {}", topic, session.user_id);

        let (tx, rx) = mpsc::unbounded_channel::<Result<RealtimeEvent<E>, BackendError>>();

        // Socket task: forwards decoded events and keeps the channel alive.
        tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
            heartbeat.tick().await;
            let mut heartbeat_ref = 1u64;

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        let Some(msg) = msg else {
                            debug!("Realtime socket closed by backend");
                            break;
                        };
                        let item = match msg {
                            Ok(Message::Text(text)) => decode_message::<E>(&text),
                            Ok(Message::Close(_)) => break,
                            Ok(_) => None,
                            Err(e) => Some(Err(BackendError::WebSocketError(e))),
                        };
                        if let Some(item) = item {
                            if tx.send(item).is_err() {
                                break;
                            }
                        }
                    }
                    _ = heartbeat.tick() => {
                        if tx.is_closed() {
                            break;
                        }
                        heartbeat_ref += 1;
                        let beat = json!({
                            "topic": "phoenix",
                            "event": "heartbeat",
                            "payload": {},
                            "ref": heartbeat_ref.to_string(),
                        });
                        if let Err(e) = ws_sender.send(Message::Text(beat.to_string())).await {
                            warn!("Realtime heartbeat failed: {}", e);
                            let _ = tx.send(Err(BackendError::WebSocketError(e)));
                            break;
                        }
                    }
                }
            }
            let _ = ws_sender.close().await;
        });

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });

        Ok(Box::pin(stream))
    }

    fn authorize(&self, session: Option<&AuthSession>) {
        let mut token = self
            .access_token
            .write()
            .unwrap_or_else(|e| e.into_inner());
        *token = session.map(|s| s.access_token.clone());
    }
}

/// Decode one realtime socket frame.
///
/// Returns `None` for frames that carry no row change (replies, presence, system messages).
fn decode_message<E: SyncEntity>(text: &str) -> Option<Result<RealtimeEvent<E>, BackendError>> {
    let parsed: serde_json::Value = match serde_json::from_str(text) {
        Ok(parsed) => parsed,
        Err(e) => return Some(Err(BackendError::JsonError(e))),
    };

    match parsed.get("event").and_then(|e| e.as_str()) {
        Some("postgres_changes") => {
            let Some(payload) = parsed.get("payload").cloned() else {
                return Some(Err(BackendError::Protocol(
                    "Change event missing payload".to_string(),
                )));
            };
            // Some servers nest the change under `data`.
            let payload = payload.get("data").cloned().unwrap_or(payload);
            match serde_json::from_value::<ChangePayload>(payload) {
                Ok(change) => Some(change.decode()),
                Err(e) => {
                    error!("Failed to deserialize change payload: {}", e);
                    Some(Err(BackendError::JsonError(e)))
                }
            }
        }
        Some("phx_error") => Some(Err(BackendError::Protocol(
            "Realtime channel error".to_string(),
        ))),
        Some(other) => {
            debug!("Ignoring message type: {}", other);
            None
        }
        None => Some(Err(BackendError::Protocol(
            "Message missing event field".to_string(),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Platform, StreamEntity};

    #[test]
    fn decodes_nested_change_messages() {
        let text = json!({
            "topic": "realtime:public:streams",
            "event": "postgres_changes",
            "payload": {
                "data": {
                    "eventType": "INSERT",
                    "record": {
                        "id": "s1",
                        "ownerId": "u1",
                        "updatedAt": 7,
                        "platform": "kick",
                        "channel": "bar",
                        "title": "hello"
                    }
                }
            },
            "ref": null
        })
        .to_string();

        let event = decode_message::<StreamEntity>(&text).unwrap().unwrap();
        assert!(matches!(event, RealtimeEvent::Insert(ref s) if s.channel == "bar"));
    }

    #[test]
    fn join_filters_on_the_serialized_owner_column() {
        let backend = RestBackend::<StreamEntity>::new(BackendConfig::default()).unwrap();
        let join = backend.join_message(&AuthSession::new("u1", "token"));

        assert_eq!(join["topic"], json!("realtime:public:streams"));
        let change = &join["payload"]["config"]["postgres_changes"][0];
        assert_eq!(change["table"], json!("streams"));
        assert_eq!(change["filter"], json!("ownerId=eq.u1"));
        assert_eq!(join["payload"]["access_token"], json!("token"));

        // The filter column is the one rows are written with.
        let row = serde_json::to_value(StreamEntity::new("u1", Platform::Twitch, "x")).unwrap();
        assert_eq!(row[OWNER_FIELD], json!("u1"));
    }

    #[test]
    fn refused_join_is_not_retried() {
        let ok = json!({"event": "phx_reply", "payload": {"status": "ok", "response": {}}});
        assert!(matches!(join_reply(&ok), Some(Ok(()))));

        let other = json!({"event": "presence_state", "payload": {}});
        assert!(join_reply(&other).is_none());

        let expired = json!({
            "event": "phx_reply",
            "payload": {"status": "error", "response": {"reason": "invalid token"}}
        });
        assert!(join_reply(&expired).unwrap().unwrap_err().is_unauthorized());

        let unknown_table = json!({
            "event": "phx_reply",
            "payload": {"status": "error", "response": {"reason": "unknown table"}}
        });
        let err = join_reply(&unknown_table).unwrap().unwrap_err();
        assert!(!err.is_retryable());
        assert!(!err.is_unauthorized());
    }

    #[test]
    fn ignores_replies_and_presence() {
        let text = json!({"topic": "phoenix", "event": "phx_reply", "payload": {"status": "ok"}})
            .to_string();
        assert!(decode_message::<StreamEntity>(&text).is_none());
    }

    #[test]
    fn maps_http_statuses_onto_failure_taxonomy() {
        assert!(classify_status(StatusCode::UNAUTHORIZED, String::new()).is_unauthorized());
        assert!(classify_status(StatusCode::NOT_FOUND, String::new()).is_not_found());
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, String::new()).is_retryable());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, String::new()).is_retryable());
        assert!(!classify_status(StatusCode::UNPROCESSABLE_ENTITY, String::new()).is_retryable());
    }
}
