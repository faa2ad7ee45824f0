// Narrow seam between the relay and the provider's streaming endpoint.
// The relay never touches a socket directly; it only sees an `UpstreamLink`.

use crate::error::RelayError;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Event produced by an open upstream connection.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamFrame {
    Text(String),
    /// Connection closed, with the close reason if the peer sent one.
    Closed(Option<String>),
    Error(String),
}

/// An open upstream connection.
///
/// Dropping `outbound` asks the transport to close the socket. After a
/// `Closed` or `Error` frame nothing more is delivered on `inbound`.
pub struct UpstreamLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<UpstreamFrame>,
}

#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<UpstreamLink, RelayError>;
}
