use crate::error::RelayError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

const REDACTED: &str = "***";

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Streaming endpoint of the RPC provider (ws:// or wss://).
    pub upstream_ws_url: String,
    /// HTTP JSON-RPC endpoint used by `/rpc`. Derived from the ws url when unset.
    #[serde(default)]
    pub upstream_http_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_api_key_param")]
    pub api_key_param: String,
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_upstream_ping_interval_secs")]
    pub upstream_ping_interval_secs: u64,
    #[serde(default = "default_connect_on_start")]
    pub connect_on_start: bool,
}

impl Settings {
    /// Load settings from an optional TOML file, overlaid with `SOL_RELAY_*`
    /// environment variables.
    pub fn from_file(path: &str) -> Result<Self, RelayError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("SOL_RELAY").try_parsing(true));
        let cfg = builder.build()?;
        Ok(cfg.try_deserialize()?)
    }

    pub fn to_toml(&self) -> Result<String, RelayError> {
        Ok(toml::to_string(self)?)
    }

    /// Copy safe to print or serve: the api key is masked.
    pub fn redacted(&self) -> Settings {
        let mut copy = self.clone();
        if copy.api_key.is_some() {
            copy.api_key = Some(REDACTED.to_string());
        }
        copy
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        let ws = Url::parse(&self.upstream_ws_url)?;
        if ws.scheme() != "ws" && ws.scheme() != "wss" {
            return Err(RelayError::Validation(format!(
                "upstream_ws_url must use ws:// or wss://, got {}",
                ws.scheme()
            )));
        }
        if let Some(http) = &self.upstream_http_url {
            let http = Url::parse(http)?;
            if http.scheme() != "http" && http.scheme() != "https" {
                return Err(RelayError::Validation(format!(
                    "upstream_http_url must use http:// or https://, got {}",
                    http.scheme()
                )));
            }
        }
        if self.api_key_param.trim().is_empty() {
            return Err(RelayError::Validation("api_key_param must not be empty".to_string()));
        }
        if self.reconnect_base_delay_ms == 0 {
            return Err(RelayError::Validation("reconnect_base_delay_ms must be > 0".to_string()));
        }
        if self.max_reconnect_attempts == 0 {
            return Err(RelayError::Validation("max_reconnect_attempts must be > 0".to_string()));
        }
        if self.upstream_ping_interval_secs == 0 {
            return Err(RelayError::Validation("upstream_ping_interval_secs must be > 0".to_string()));
        }
        Ok(())
    }

    /// Upstream streaming URL with the api key attached as a query parameter.
    pub fn upstream_ws_endpoint(&self) -> Result<Url, RelayError> {
        let url = Url::parse(&self.upstream_ws_url)?;
        Ok(self.with_api_key(url))
    }

    /// Upstream HTTP URL with the api key attached. Falls back to the
    /// streaming URL with its scheme swapped (wss -> https, ws -> http).
    pub fn upstream_http_endpoint(&self) -> Result<Url, RelayError> {
        let raw = match &self.upstream_http_url {
            Some(url) => url.clone(),
            None => self
                .upstream_ws_url
                .replacen("wss://", "https://", 1)
                .replacen("ws://", "http://", 1),
        };
        let url = Url::parse(&raw)?;
        Ok(self.with_api_key(url))
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn upstream_ping_interval(&self) -> Duration {
        Duration::from_secs(self.upstream_ping_interval_secs)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }

    fn with_api_key(&self, mut url: Url) -> Url {
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty()) {
            let kept: Vec<(String, String)> = url
                .query_pairs()
                .filter(|(name, _)| name != self.api_key_param.as_str())
                .map(|(name, value)| (name.into_owned(), value.into_owned()))
                .collect();
            {
                let mut pairs = url.query_pairs_mut();
                pairs.clear();
                for (name, value) in &kept {
                    pairs.append_pair(name, value);
                }
                pairs.append_pair(&self.api_key_param, key);
            }
        }
        url
    }
}

/// Render a URL for logs with every query value masked.
pub fn redact_url(url: &Url) -> String {
    if url.query().is_none() {
        return url.to_string();
    }
    let mut masked = url.clone();
    let names: Vec<String> = url.query_pairs().map(|(name, _)| name.into_owned()).collect();
    {
        let mut pairs = masked.query_pairs_mut();
        pairs.clear();
        for name in &names {
            pairs.append_pair(name, REDACTED);
        }
    }
    masked.to_string()
}

fn default_api_key_param() -> String {
    "api-key".to_string()
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_reconnect_base_delay_ms() -> u64 {
    1000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_upstream_ping_interval_secs() -> u64 {
    30
}

fn default_connect_on_start() -> bool {
    true
}
