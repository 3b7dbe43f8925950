//! HTTP client for the session REST endpoints.
//!
//! Four endpoints: session list, history snapshot, send, and a liveness
//! probe. History payloads are normalized at this boundary; one malformed
//! entry is dropped rather than failing the snapshot.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use skein_protocol::{Attachment, CanonMessage, HistoryResponse, SendAttachment, SendRequest,
    SessionSummary};

use crate::canon;
use crate::error::EngineError;
use crate::settings::EngineConfig;
use crate::snapshot::SnapshotFetcher;
use crate::store::SessionStore;

/// Overall request timeout for non-probe calls.
const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    probe_timeout: Duration,
    history_limit: usize,
}

impl ApiClient {
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            probe_timeout: Duration::from_secs(config.probe_timeout_secs),
            history_limit: config.history_limit,
        })
    }

    /// `GET /api/sessions`. Accepts a bare array or a `{"sessions": [...]}`
    /// wrapper; entries that fail to parse are skipped.
    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>, EngineError> {
        let url = format!("{}/api/sessions", self.base_url);
        let response = self.http.get(&url).send().await?;
        let body: Value = check_status(response).await?.json().await?;

        let entries = body
            .as_array()
            .or_else(|| body.get("sessions").and_then(Value::as_array))
            .cloned()
            .unwrap_or_default();

        Ok(entries
            .into_iter()
            .filter_map(|entry| serde_json::from_value(entry).ok())
            .collect())
    }

    /// Resolve a session reference (storage key or friendly id) against the
    /// session list.
    pub async fn resolve_session(&self, reference: &str) -> Result<SessionSummary, EngineError> {
        let sessions = self.list_sessions().await?;
        sessions
            .into_iter()
            .find(|s| s.key == reference || s.friendly_id.as_deref() == Some(reference))
            .ok_or_else(|| EngineError::UnknownSession(reference.to_string()))
    }

    /// `GET /api/history`. Raw entries are normalized into canonical
    /// messages here.
    pub async fn history(
        &self,
        session_key: &str,
        friendly_id: Option<&str>,
    ) -> Result<Vec<CanonMessage>, EngineError> {
        let mut url = format!(
            "{}/api/history?sessionKey={}&limit={}",
            self.base_url,
            urlencoding::encode(session_key),
            self.history_limit
        );
        if let Some(friendly) = friendly_id {
            url.push_str(&format!("&friendlyId={}", urlencoding::encode(friendly)));
        }

        let response = self.http.get(&url).send().await?;
        let body: HistoryResponse = check_status(response).await?.json().await?;

        let total = body.messages.len();
        let messages: Vec<CanonMessage> = body
            .messages
            .iter()
            .filter_map(canon::from_wire)
            .collect();
        if messages.len() < total {
            debug!(
                session = %session_key,
                dropped = total - messages.len(),
                "dropped unparseable history entries"
            );
        }
        Ok(messages)
    }

    /// `POST /api/send`.
    pub async fn send(&self, request: &SendRequest) -> Result<(), EngineError> {
        let url = format!("{}/api/send", self.base_url);
        let response = self.http.post(&url).json(request).send().await?;
        check_status(response).await?;
        Ok(())
    }

    /// Send a user message, inserting the optimistic transcript entry before
    /// the POST resolves. The optimistic entry stays even when the POST
    /// fails; the caller decides whether to retract it.
    pub async fn send_user_message(
        &self,
        store: &SessionStore,
        session_key: &str,
        friendly_id: Option<&str>,
        text: &str,
        attachments: Vec<SendAttachment>,
    ) -> Result<CanonMessage, EngineError> {
        let meta: Vec<Attachment> = attachments.iter().map(attachment_meta).collect();
        let optimistic = store.push_optimistic(session_key, text, meta);

        let request = SendRequest {
            session_key: Some(session_key.to_string()),
            friendly_id: friendly_id.map(str::to_string),
            message: text.to_string(),
            attachments,
        };
        if let Err(e) = self.send(&request).await {
            warn!(session = %session_key, error = %e, "send failed, optimistic entry retained");
            return Err(e);
        }
        Ok(optimistic)
    }

    /// `GET /api/ping` with a hard client-side deadline. A timed-out probe is
    /// a distinct error from a refused connection.
    pub async fn ping(&self) -> Result<(), EngineError> {
        let url = format!("{}/api/ping", self.base_url);
        let request = self.http.get(&url).send();

        match tokio::time::timeout(self.probe_timeout, request).await {
            Err(_) => Err(EngineError::ProbeTimeout),
            Ok(Err(e)) => Err(EngineError::Http(e)),
            Ok(Ok(response)) => {
                check_status(response).await?;
                Ok(())
            }
        }
    }
}

/// Size and name metadata for optimistic identity. The data URL base64 body
/// approximates the byte size; content bytes never join identity.
fn attachment_meta(attachment: &SendAttachment) -> Attachment {
    let payload_len = attachment
        .data_url
        .split_once(',')
        .map(|(_, body)| body.len())
        .unwrap_or(0);
    Attachment {
        name: attachment.name.clone(),
        size: (payload_len as u64 * 3) / 4,
        content_type: Some(attachment.content_type.clone()),
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, EngineError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(EngineError::Server {
        status: status.as_u16(),
        body,
    })
}

/// [`SnapshotFetcher`] backed by the history endpoint.
pub struct RestSnapshotFetcher {
    client: ApiClient,
}

impl RestSnapshotFetcher {
    pub fn new(client: ApiClient) -> Arc<Self> {
        Arc::new(Self { client })
    }
}

#[async_trait]
impl SnapshotFetcher for RestSnapshotFetcher {
    async fn fetch(
        &self,
        session_key: &str,
        friendly_id: Option<&str>,
    ) -> Result<Vec<CanonMessage>, EngineError> {
        self.client
            .history(session_key, friendly_id)
            .await
            .map_err(|e| EngineError::SnapshotFetch(e.to_string()))
    }
}
