//! Ledger client capability and its HTTP gateway adapter.
//!
//! The pipeline only ever talks to [`LedgerClient`]; network specifics stay
//! inside the adapter. [`HttpLedgerClient`] speaks a small JSON protocol:
//!
//! - `POST {base}/messages` with an [`AnchorPayload`], answered by
//!   `{"message_id": "..."}`
//! - `GET {base}/messages/{id}`, answered by
//!   `{"status": "confirmed" | "pending" | "conflicting"}` or 404

use std::time::Duration;

use anchorage_core::{AggregationMethod, Anchor, Digest, LedgerMessageId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, warn, Instrument};

use crate::error::{LedgerError, Result};

/// Payload `type` discriminator.
pub const PAYLOAD_TYPE: &str = "anchorage.merkle_root";

/// Payload format version.
pub const PAYLOAD_VERSION: u8 = 1;

/// Longest response body kept in error messages.
const MAX_ERROR_BODY: usize = 512;

/// Finality of a posted message as reported by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmationStatus {
    /// The message is final.
    Confirmed,
    /// The message is known but not yet final.
    Pending,
    /// The endpoint does not know the message.
    Unknown,
}

/// Document written to the ledger for one anchor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorPayload {
    /// Format version.
    pub v: u8,
    /// Always [`PAYLOAD_TYPE`].
    #[serde(rename = "type")]
    pub kind: String,
    /// Deployment tag used to index messages on the ledger.
    pub tag: String,
    /// Root digest, lowercase hex.
    pub digest: Digest,
    /// Aggregation method.
    pub algorithm: AggregationMethod,
    /// Number of leaves.
    pub count: u32,
    /// Window start.
    pub start: DateTime<Utc>,
    /// Window end.
    pub end: DateTime<Utc>,
    /// Idempotency key, so gateways can drop re-publishes.
    pub key: String,
    /// Time the payload was built.
    pub ts: DateTime<Utc>,
}

impl AnchorPayload {
    /// Builds the payload for `anchor`.
    pub fn for_anchor(anchor: &Anchor, tag: impl Into<String>, ts: DateTime<Utc>) -> Self {
        Self {
            v: PAYLOAD_VERSION,
            kind: PAYLOAD_TYPE.to_string(),
            tag: tag.into(),
            digest: anchor.digest,
            algorithm: anchor.method,
            count: anchor.leaf_count,
            start: anchor.window.start(),
            end: anchor.window.end(),
            key: anchor.idempotency_key.to_string(),
            ts,
        }
    }
}

/// Capability to publish digests to one ledger endpoint.
#[async_trait]
pub trait LedgerClient: Send + Sync + std::fmt::Debug {
    /// Endpoint identifier recorded on published anchors.
    fn endpoint(&self) -> &str;

    /// Publishes `payload`, returning the ledger-issued message id.
    async fn post(&self, payload: &AnchorPayload) -> Result<LedgerMessageId>;

    /// Reports the finality of a previously posted message.
    async fn get_confirmation(&self, message_id: &LedgerMessageId) -> Result<ConfirmationStatus>;
}

/// Configuration for the HTTP ledger client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Request timeout enforced by the HTTP client.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Optional block explorer base for operator links.
    pub explorer_url: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(crate::DEFAULT_CALL_TIMEOUT_SECONDS),
            user_agent: format!("anchorage/{}", env!("CARGO_PKG_VERSION")),
            explorer_url: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PostResponse {
    message_id: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
}

/// Ledger client for a JSON gateway over HTTP.
#[derive(Debug, Clone)]
pub struct HttpLedgerClient {
    client: reqwest::Client,
    base_url: String,
    config: ClientConfig,
}

impl HttpLedgerClient {
    /// Creates a client for the gateway at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Configuration` if the URL is empty or the HTTP
    /// client cannot be built.
    pub fn new(base_url: impl Into<String>, config: ClientConfig) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(LedgerError::configuration("ledger base URL must not be empty"));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| LedgerError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, base_url, config })
    }

    /// Explorer link for a message, when an explorer is configured.
    pub fn explorer_url(&self, message_id: &LedgerMessageId) -> Option<String> {
        self.config
            .explorer_url
            .as_deref()
            .map(|base| format!("{}/block/{}", base.trim_end_matches('/'), message_id))
    }

    fn classify_send_error(&self, error: &reqwest::Error) -> LedgerError {
        if error.is_timeout() {
            return LedgerError::timeout(&self.base_url, self.config.timeout);
        }
        if error.is_connect() {
            return LedgerError::transient(&self.base_url, format!("connection failed: {error}"));
        }
        LedgerError::transient(&self.base_url, error.to_string())
    }

    async fn classify_error_status(&self, response: Response) -> LedgerError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let body: String = body.chars().take(MAX_ERROR_BODY).collect();

        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            warn!(status = status.as_u16(), "ledger returned retryable status");
            LedgerError::transient(&self.base_url, format!("HTTP {status}: {body}"))
        } else {
            warn!(status = status.as_u16(), "ledger rejected request");
            LedgerError::rejected(&self.base_url, format!("HTTP {status}: {body}"))
        }
    }
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    fn endpoint(&self) -> &str {
        &self.base_url
    }

    async fn post(&self, payload: &AnchorPayload) -> Result<LedgerMessageId> {
        let span = info_span!(
            "ledger_post",
            endpoint = %self.base_url,
            digest = %payload.digest,
            key = %payload.key,
        );

        async move {
            let response = self
                .client
                .post(format!("{}/messages", self.base_url))
                .json(payload)
                .send()
                .await
                .map_err(|e| self.classify_send_error(&e))?;

            if !response.status().is_success() {
                return Err(self.classify_error_status(response).await);
            }

            let body: PostResponse = response.json().await.map_err(|e| {
                LedgerError::rejected(&self.base_url, format!("malformed post response: {e}"))
            })?;
            if body.message_id.is_empty() {
                return Err(LedgerError::rejected(&self.base_url, "empty message id"));
            }

            debug!(message_id = %body.message_id, "ledger accepted message");
            Ok(LedgerMessageId::new(body.message_id))
        }
        .instrument(span)
        .await
    }

    async fn get_confirmation(&self, message_id: &LedgerMessageId) -> Result<ConfirmationStatus> {
        let span = info_span!(
            "ledger_confirmation",
            endpoint = %self.base_url,
            message_id = %message_id,
        );

        async move {
            let response = self
                .client
                .get(format!("{}/messages/{}", self.base_url, message_id))
                .send()
                .await
                .map_err(|e| self.classify_send_error(&e))?;

            if response.status() == StatusCode::NOT_FOUND {
                return Ok(ConfirmationStatus::Unknown);
            }
            if !response.status().is_success() {
                return Err(self.classify_error_status(response).await);
            }

            let body: StatusResponse = response.json().await.map_err(|e| {
                LedgerError::rejected(&self.base_url, format!("malformed status response: {e}"))
            })?;

            match body.status.as_str() {
                "confirmed" => Ok(ConfirmationStatus::Confirmed),
                "pending" => Ok(ConfirmationStatus::Pending),
                "conflicting" => Err(LedgerError::rejected(
                    &self.base_url,
                    format!("message {message_id} is conflicting"),
                )),
                other => Err(LedgerError::rejected(
                    &self.base_url,
                    format!("unrecognized message status: {other}"),
                )),
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use anchorage_core::{AnchorId, EventId, IdempotencyKey, NewAnchor, NewAnchorItem, Window};
    use chrono::TimeZone;

    use super::*;

    fn anchor() -> Anchor {
        let window = Window::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap(),
        )
        .unwrap();
        let new = NewAnchor {
            idempotency_key: IdempotencyKey::derive(AggregationMethod::MerkleSha256, &window),
            digest: Digest::new([0xab; 32]),
            method: AggregationMethod::MerkleSha256,
            window,
            items: vec![NewAnchorItem {
                event_id: EventId::new(),
                event_hash: Digest::new([0xab; 32]),
                leaf_index: 0,
                proof: Vec::new(),
            }],
            created_at: Utc.with_ymd_and_hms(2024, 3, 2, 0, 5, 0).unwrap(),
        };
        Anchor::from_new(AnchorId::new(), &new)
    }

    #[test]
    fn payload_serializes_with_wire_field_names() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 2, 0, 6, 0).unwrap();
        let payload = AnchorPayload::for_anchor(&anchor(), "TAG", ts);
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["v"], 1);
        assert_eq!(json["type"], PAYLOAD_TYPE);
        assert_eq!(json["tag"], "TAG");
        assert_eq!(json["digest"], "ab".repeat(32));
        assert_eq!(json["algorithm"], "merkle-sha256");
        assert_eq!(json["count"], 1);
        assert_eq!(
            json["key"],
            "merkle-sha256:2024-03-01T00:00:00.000Z:2024-03-02T00:00:00.000Z"
        );
    }

    #[test]
    fn explorer_url_uses_block_path() {
        let config = ClientConfig {
            explorer_url: Some("https://explorer.example/".to_string()),
            ..ClientConfig::default()
        };
        let client = HttpLedgerClient::new("https://gateway.example", config).unwrap();

        assert_eq!(
            client.explorer_url(&LedgerMessageId::new("0xabc")),
            Some("https://explorer.example/block/0xabc".to_string())
        );
    }

    #[test]
    fn explorer_url_absent_without_configuration() {
        let client =
            HttpLedgerClient::new("https://gateway.example", ClientConfig::default()).unwrap();
        assert_eq!(client.explorer_url(&LedgerMessageId::new("0xabc")), None);
    }

    #[test]
    fn empty_base_url_is_rejected() {
        let error = HttpLedgerClient::new("", ClientConfig::default()).unwrap_err();
        assert!(matches!(error, LedgerError::Configuration { .. }));
    }

    #[test]
    fn endpoint_drops_trailing_slash() {
        let client =
            HttpLedgerClient::new("https://gateway.example/", ClientConfig::default()).unwrap();
        assert_eq!(client.endpoint(), "https://gateway.example");
    }
}
