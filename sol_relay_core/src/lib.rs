// Sol Relay Core Library
// Shared upstream connection, subscription registry and client handling

pub mod error;
pub mod settings;
pub mod protocol;
pub mod registry;
pub mod backoff;
pub mod upstream;
pub mod relay;
pub mod client;

pub mod native;

// Re-exports
pub use error::RelayError;
pub use settings::Settings;
pub use registry::{ClientId, Subscription, SubscriptionId, SubscriptionRegistry};
pub use relay::{ClientSession, Relay, RelayHandle, RelayStatus, UpstreamState};
pub use upstream::{UpstreamConnector, UpstreamFrame, UpstreamLink};
pub use client::handle_client_connection;
