// Plain HTTP JSON-RPC passthrough to the provider, using reqwest

use crate::error::RelayError;
use log::debug;
use reqwest::Client;

/// Response relayed back verbatim to the caller.
#[derive(Debug, Clone)]
pub struct ForwardedResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// Forwards JSON-RPC bodies to the provider's HTTP endpoint.
pub struct HttpRpcForwarder {
    client: Client,
    url: String,
}

impl HttpRpcForwarder {
    pub fn new(url: String) -> Self {
        Self {
            client: Client::new(),
            url,
        }
    }

    pub async fn forward(&self, body: Vec<u8>) -> Result<ForwardedResponse, RelayError> {
        debug!("Forwarding {}-byte JSON-RPC body over HTTP", body.len());

        let response = self
            .client
            .post(&self.url)
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| RelayError::Http(format!("HTTP request failed: {}", e)))?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?.to_vec();

        Ok(ForwardedResponse {
            status,
            content_type,
            body,
        })
    }
}
