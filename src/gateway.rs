//! Remote service gateway.
//!
//! [`ApiGateway`] is the transport seam between the sync driver and the
//! recommendation service. [`HttpGateway`] talks JSON over HTTPS with an API
//! key header; every call is bounded by the configured timeout and is never
//! retried. Any failure becomes a [`RemoteError`].
//!
//! # Endpoints
//!
//! | Call | Request |
//! |------|---------|
//! | [`ApiGateway::bulk_sync`] | `POST {base}/sync/products` `{"products": [...]}` |
//! | [`ApiGateway::sync_one`] | `POST {base}/sync/product` `<record>` |
//! | [`ApiGateway::delete`] | `POST {base}/sync/products/delete` `{"externalIds": [...]}` |

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::RemoteConfig;
use crate::error::{RemoteError, SyncError};
use crate::models::MappedRecord;

/// Successful response from the remote service.
#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    pub status: u16,
    pub body: Value,
}

#[async_trait]
pub trait ApiGateway: Send + Sync {
    async fn bulk_sync(&self, records: &[MappedRecord]) -> Result<Ack, RemoteError>;

    async fn sync_one(&self, record: &MappedRecord) -> Result<Ack, RemoteError>;

    async fn delete(&self, external_ids: &[String]) -> Result<Ack, RemoteError>;
}

pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpGateway {
    /// Build a client from `[remote]`. Fails when the endpoint or the
    /// credential is missing.
    pub fn new(config: &RemoteConfig) -> Result<Self, SyncError> {
        let base_url = config
            .api_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| SyncError::configuration("remote.api_url is not set"))?
            .trim_end_matches('/')
            .to_string();
        let api_key = config.resolved_api_key().ok_or_else(|| {
            SyncError::configuration(format!(
                "remote.api_key is not set and {} is empty",
                crate::config::API_KEY_ENV
            ))
        })?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let key = HeaderValue::from_str(&api_key)
            .map_err(|_| SyncError::configuration("remote.api_key contains invalid characters"))?;
        headers.insert("X-API-Key", key);

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .default_headers(headers)
            .build()
            .map_err(|e| SyncError::Storage(e.into()))?;

        Ok(Self { client, base_url })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Ack, RemoteError> {
        let url = self.url(path);
        debug!(%url, "remote request");

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| RemoteError::transport(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| RemoteError::transport(e.to_string()))?;
        let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);

        if status.is_success() {
            Ok(Ack {
                status: status.as_u16(),
                body,
            })
        } else {
            Err(RemoteError::http(status.as_u16(), error_message(&body)))
        }
    }
}

#[async_trait]
impl ApiGateway for HttpGateway {
    async fn bulk_sync(&self, records: &[MappedRecord]) -> Result<Ack, RemoteError> {
        self.post("sync/products", &json!({ "products": records }))
            .await
    }

    async fn sync_one(&self, record: &MappedRecord) -> Result<Ack, RemoteError> {
        let body = serde_json::to_value(record).map_err(|e| RemoteError::transport(e.to_string()))?;
        self.post("sync/product", &body).await
    }

    async fn delete(&self, external_ids: &[String]) -> Result<Ack, RemoteError> {
        self.post("sync/products/delete", &json!({ "externalIds": external_ids }))
            .await
    }
}

/// Best-effort message from an error body: `message`, then `error`.
pub fn error_message(body: &Value) -> String {
    ["message", "error"]
        .iter()
        .filter_map(|key| body.get(*key))
        .find_map(|v| match v {
            Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
            Value::Object(obj) => obj
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        })
        .unwrap_or_else(|| "API request failed".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(url: Option<&str>, key: Option<&str>) -> RemoteConfig {
        RemoteConfig {
            api_url: url.map(str::to_string),
            api_key: key.map(str::to_string),
            timeout_secs: 5,
        }
    }

    #[test]
    fn error_message_prefers_message_then_error() {
        assert_eq!(
            error_message(&json!({"message": "Invalid API key", "error": "x"})),
            "Invalid API key"
        );
        assert_eq!(error_message(&json!({"error": "Quota exceeded"})), "Quota exceeded");
        assert_eq!(
            error_message(&json!({"error": {"message": "nested"}})),
            "nested"
        );
        assert_eq!(error_message(&Value::Null), "API request failed");
        assert_eq!(error_message(&json!({"message": ""})), "API request failed");
    }

    #[test]
    fn missing_endpoint_is_a_configuration_error() {
        let err = HttpGateway::new(&remote(None, Some("k"))).err().unwrap();
        assert!(matches!(err, SyncError::Configuration(_)));
        let err = HttpGateway::new(&remote(Some("  "), Some("k"))).err().unwrap();
        assert!(matches!(err, SyncError::Configuration(_)));
    }

    #[test]
    fn urls_join_without_double_slash() {
        let gateway = HttpGateway::new(&remote(Some("https://api.example.com/v1/"), Some("k")))
            .unwrap();
        assert_eq!(
            gateway.url("sync/products"),
            "https://api.example.com/v1/sync/products"
        );
    }
}
