// Per-client WebSocket handling for the local listener

use crate::relay::RelayHandle;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{stream::StreamExt, SinkExt};
use log::{debug, info, warn};

/// Serve one upgraded client socket until either side closes it.
///
/// Text frames go to the relay; frames the relay addresses to this client are
/// written back. Whatever ends the connection, the relay is told the client
/// is gone so its subscriptions are released.
pub async fn handle_client_connection(socket: WebSocket, relay: RelayHandle) {
    let session = match relay.connect_client() {
        Ok(s) => s,
        Err(e) => {
            warn!("Relay unavailable, dropping client socket: {}", e);
            return;
        }
    };
    let client = session.id;
    let mut outbound = session.outbound;
    info!("Client {} connected", client);

    let (mut sender, mut receiver) = socket.split();

    // ---------- relay -> client ----------
    let mut writer = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if let Err(e) = sender.send(Message::Text(text)).await {
                debug!("Client {} write failed: {}", client, e);
                return;
            }
        }
        // relay shut down
        let _ = sender.send(Message::Close(None)).await;
    });

    // ---------- client -> relay ----------
    loop {
        tokio::select! {
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if relay.send_from_client(client, text).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        debug!("Client {} sent {}-byte binary frame; ignored", client, data.len());
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Client {} socket error: {}", client, e);
                        break;
                    }
                }
            }
            _ = &mut writer => break,
        }
    }

    writer.abort();
    let _ = relay.disconnect_client(client);
    debug!("Client {} socket closed", client);
}
