// tokio-tungstenite implementation of the upstream connector

use crate::error::RelayError;
use crate::upstream::{UpstreamConnector, UpstreamFrame, UpstreamLink};
use async_trait::async_trait;
use futures_util::{stream::StreamExt, SinkExt};
use log::{debug, error, warn};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Opens real WebSocket connections and pumps frames between the socket and
/// the link channels. Answers upstream pings and sends its own keepalive.
pub struct TungsteniteConnector {
    ping_interval: Duration,
}

impl TungsteniteConnector {
    pub fn new(ping_interval: Duration) -> Self {
        Self { ping_interval }
    }
}

#[async_trait]
impl UpstreamConnector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<UpstreamLink, RelayError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| RelayError::WebSocket(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<UpstreamFrame>();
        let ping_interval = self.ping_interval;

        tokio::spawn(async move {
            let mut ping = tokio::time::interval(ping_interval);
            // the first tick completes immediately
            ping.tick().await;

            loop {
                tokio::select! {
                    // ---------- relay -> upstream ----------
                    outgoing = outbound_rx.recv() => {
                        match outgoing {
                            Some(text) => {
                                if let Err(e) = write.send(Message::Text(text)).await {
                                    error!("Upstream write error: {}", e);
                                    let _ = inbound_tx.send(UpstreamFrame::Error(e.to_string()));
                                    break;
                                }
                            }
                            None => {
                                debug!("Upstream link dropped by relay; closing socket");
                                let _ = write.send(Message::Close(None)).await;
                                break;
                            }
                        }
                    }

                    // ---------- upstream -> relay ----------
                    incoming = read.next() => {
                        match incoming {
                            Some(Ok(Message::Text(text))) => {
                                if inbound_tx.send(UpstreamFrame::Text(text)).is_err() {
                                    break;
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                if let Err(e) = write.send(Message::Pong(data)).await {
                                    warn!("Failed to send pong upstream: {}", e);
                                }
                            }
                            Some(Ok(Message::Close(frame))) => {
                                let reason = frame.map(|f| f.reason.to_string());
                                let _ = inbound_tx.send(UpstreamFrame::Closed(reason));
                                break;
                            }
                            Some(Ok(Message::Binary(data))) => {
                                debug!("Ignoring {}-byte binary frame from upstream", data.len());
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                let _ = inbound_tx.send(UpstreamFrame::Error(e.to_string()));
                                break;
                            }
                            None => {
                                let _ = inbound_tx.send(UpstreamFrame::Closed(None));
                                break;
                            }
                        }
                    }

                    // ---------- keepalive ----------
                    _ = ping.tick() => {
                        if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                            error!("Upstream ping failed: {}", e);
                            let _ = inbound_tx.send(UpstreamFrame::Error(e.to_string()));
                            break;
                        }
                    }
                }
            }
        });

        Ok(UpstreamLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
