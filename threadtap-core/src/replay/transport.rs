//! Transport seam for replayed requests.

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;
use tracing::debug;

use crate::error::TransportError;

/// Sends one replayed request. Production goes over HTTP; tests script the
/// responses.
#[async_trait]
pub trait ReplayTransport: Send + Sync {
    /// POSTs a JSON payload with the given header set and decodes the JSON
    /// response.
    async fn post_json(
        &self,
        url: &str,
        headers: &IndexMap<String, String>,
        payload: &Value,
    ) -> Result<Value, TransportError>;
}

/// reqwest-backed transport.
///
/// The cookie store is enabled so session cookies picked up along the way
/// ride on every replay without a hand-built cookie header; templates never
/// store one.
pub struct HttpReplayTransport {
    client: reqwest::Client,
}

impl HttpReplayTransport {
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .build()
            .map_err(|err| TransportError::Network(err.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ReplayTransport for HttpReplayTransport {
    async fn post_json(
        &self,
        url: &str,
        headers: &IndexMap<String, String>,
        payload: &Value,
    ) -> Result<Value, TransportError> {
        let mut request = self.client.post(url).json(payload);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        debug!(url, header_count = headers.len(), "replaying request");
        let response = request
            .send()
            .await
            .map_err(|err| TransportError::Network(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
            });
        }
        response
            .json::<Value>()
            .await
            .map_err(|err| TransportError::Decode(err.to_string()))
    }
}
