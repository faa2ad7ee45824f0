// Native transports: WebSocket upstream connector and HTTP passthrough

pub mod http;
pub mod ws;

pub use http::{ForwardedResponse, HttpRpcForwarder};
pub use ws::TungsteniteConnector;
