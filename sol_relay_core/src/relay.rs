//! Upstream relay: one provider connection shared by every local client.
//!
//! All relay state lives in [`Relay`], owned by a single tokio task. Socket
//! readers, connection attempts and backoff timers run as separate tasks and
//! only talk to the relay by sending [`RelayEvent`]s, so state transitions
//! never interleave and the "is upstream open?" check is always acted on in
//! the same step that made it.
//!
//! Callers use the cloneable [`RelayHandle`].

use crate::backoff::Backoff;
use crate::error::RelayError;
use crate::protocol::{self, ClientRequest, ErrorReply, UpstreamMessage};
use crate::registry::{ClientId, SubscriptionRegistry};
use crate::settings::{redact_url, Settings};
use crate::upstream::{UpstreamConnector, UpstreamFrame, UpstreamLink};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpstreamState {
    Absent,
    Connecting,
    Open,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    pub state: UpstreamState,
    pub reconnect_attempts: u32,
    pub max_reconnect_attempts: u32,
    pub retries_exhausted: bool,
    pub subscriptions: usize,
    pub clients: usize,
    pub connected_since: Option<String>,
}

/// Local end of a client connection registered with the relay.
pub struct ClientSession {
    pub id: ClientId,
    /// Frames the relay wants delivered to this client.
    pub outbound: mpsc::UnboundedReceiver<String>,
}

enum RelayEvent {
    ClientConnected {
        client: ClientId,
        outbound: mpsc::UnboundedSender<String>,
    },
    ClientMessage {
        client: ClientId,
        text: String,
    },
    ClientClosed {
        client: ClientId,
    },
    Connect,
    ForceReconnect,
    ReconnectDue {
        timer: u64,
    },
    ConnectResult {
        generation: u64,
        result: Result<UpstreamLink, RelayError>,
    },
    Upstream {
        generation: u64,
        frame: UpstreamFrame,
    },
    Status {
        resp: oneshot::Sender<RelayStatus>,
    },
    Stop,
}

#[derive(Clone)]
pub struct RelayHandle {
    events: mpsc::UnboundedSender<RelayEvent>,
    next_client: Arc<AtomicU64>,
}

impl RelayHandle {
    /// Register a new local client. Frames for it arrive on the returned session.
    pub fn connect_client(&self) -> Result<ClientSession, RelayError> {
        let id = self.next_client.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.send(RelayEvent::ClientConnected {
            client: id,
            outbound: tx,
        })?;
        Ok(ClientSession { id, outbound: rx })
    }

    pub fn send_from_client(&self, client: ClientId, text: String) -> Result<(), RelayError> {
        self.send(RelayEvent::ClientMessage { client, text })
    }

    pub fn disconnect_client(&self, client: ClientId) -> Result<(), RelayError> {
        self.send(RelayEvent::ClientClosed { client })
    }

    /// Start a connection attempt unless one is open or in flight.
    pub fn connect(&self) -> Result<(), RelayError> {
        self.send(RelayEvent::Connect)
    }

    /// Manual recovery: reset the attempt counter and connect now.
    pub fn force_reconnect(&self) -> Result<(), RelayError> {
        self.send(RelayEvent::ForceReconnect)
    }

    pub async fn status(&self) -> Result<RelayStatus, RelayError> {
        let (resp, rx) = oneshot::channel();
        self.send(RelayEvent::Status { resp })?;
        rx.await.map_err(|_| RelayError::ChannelClosed)
    }

    pub fn stop(&self) {
        let _ = self.send(RelayEvent::Stop);
    }

    fn send(&self, event: RelayEvent) -> Result<(), RelayError> {
        self.events.send(event).map_err(|_| RelayError::ChannelClosed)
    }
}

pub struct Relay {
    upstream_url: String,
    backoff: Backoff,
    connector: Arc<dyn UpstreamConnector>,
    events: mpsc::UnboundedSender<RelayEvent>,

    state: UpstreamState,
    upstream: Option<mpsc::UnboundedSender<String>>,
    generation: u64,
    reader: Option<JoinHandle<()>>,
    connected_since: Option<DateTime<Utc>>,

    reconnect_attempts: u32,
    retries_exhausted: bool,
    reconnect_timer: Option<JoinHandle<()>>,
    timer_seq: u64,

    registry: SubscriptionRegistry,
    clients: HashMap<ClientId, mpsc::UnboundedSender<String>>,
    // raw JSON id of a forwarded request -> client waiting for its reply
    passthrough: HashMap<String, ClientId>,
}

impl Relay {
    /// Spawn the relay task. Must be called inside a tokio runtime.
    pub fn start(
        settings: &Settings,
        connector: Arc<dyn UpstreamConnector>,
    ) -> Result<(RelayHandle, JoinHandle<()>), RelayError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let relay = Relay::new(settings, connector, events_tx.clone())?;

        let handle = RelayHandle {
            events: events_tx,
            next_client: Arc::new(AtomicU64::new(0)),
        };
        if settings.connect_on_start {
            handle.connect()?;
        }
        let task = tokio::spawn(relay.run(events_rx));
        Ok((handle, task))
    }

    fn new(
        settings: &Settings,
        connector: Arc<dyn UpstreamConnector>,
        events: mpsc::UnboundedSender<RelayEvent>,
    ) -> Result<Self, RelayError> {
        let url = settings.upstream_ws_endpoint()?;
        info!("Relay upstream: {}", redact_url(&url));

        Ok(Relay {
            upstream_url: url.to_string(),
            backoff: Backoff::new(settings.reconnect_base_delay(), settings.max_reconnect_attempts),
            connector,
            events,
            state: UpstreamState::Absent,
            upstream: None,
            generation: 0,
            reader: None,
            connected_since: None,
            reconnect_attempts: 0,
            retries_exhausted: false,
            reconnect_timer: None,
            timer_seq: 0,
            registry: SubscriptionRegistry::new(),
            clients: HashMap::new(),
            passthrough: HashMap::new(),
        })
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<RelayEvent>) {
        while let Some(event) = events.recv().await {
            if !self.handle(event) {
                break;
            }
        }
        info!("Relay stopped");
    }

    /// Apply one event. Returns false once the relay should stop.
    fn handle(&mut self, event: RelayEvent) -> bool {
        match event {
            // ---------- local clients ----------
            RelayEvent::ClientConnected { client, outbound } => {
                debug!("Client {} connected", client);
                self.clients.insert(client, outbound);
            }
            RelayEvent::ClientMessage { client, text } => self.on_client_message(client, &text),
            RelayEvent::ClientClosed { client } => self.on_client_closed(client),

            // ---------- upstream lifecycle ----------
            RelayEvent::Connect => self.connect(),
            RelayEvent::ForceReconnect => {
                info!("Manual reconnect requested; resetting attempt counter");
                self.cancel_reconnect_timer();
                self.reconnect_attempts = 0;
                self.retries_exhausted = false;
                self.connect();
            }
            RelayEvent::ReconnectDue { timer } => {
                if self.reconnect_timer.is_none() || timer != self.timer_seq {
                    debug!("Ignoring cancelled reconnect timer {}", timer);
                    return true;
                }
                self.reconnect_timer = None;
                self.connect();
            }
            RelayEvent::ConnectResult { generation, result } => self.on_connect_result(generation, result),
            RelayEvent::Upstream { generation, frame } => self.on_upstream_frame(generation, frame),

            // ---------- control ----------
            RelayEvent::Status { resp } => {
                let _ = resp.send(self.status());
            }
            RelayEvent::Stop => {
                self.shutdown();
                return false;
            }
        }
        true
    }

    fn status(&self) -> RelayStatus {
        RelayStatus {
            state: self.state,
            reconnect_attempts: self.reconnect_attempts,
            max_reconnect_attempts: self.backoff.max_attempts(),
            retries_exhausted: self.retries_exhausted,
            subscriptions: self.registry.len(),
            clients: self.clients.len(),
            connected_since: self.connected_since.map(|t| t.to_rfc3339()),
        }
    }

    fn connect(&mut self) {
        if self.state != UpstreamState::Absent {
            debug!("Upstream connect skipped (state={:?})", self.state);
            return;
        }
        self.generation += 1;
        self.state = UpstreamState::Connecting;

        let generation = self.generation;
        let connector = self.connector.clone();
        let url = self.upstream_url.clone();
        let events = self.events.clone();
        info!("Connecting to upstream (generation {})", generation);
        tokio::spawn(async move {
            let result = connector.connect(&url).await;
            let _ = events.send(RelayEvent::ConnectResult { generation, result });
        });
    }

    fn on_connect_result(&mut self, generation: u64, result: Result<UpstreamLink, RelayError>) {
        if generation != self.generation || self.state != UpstreamState::Connecting {
            // Dropping a stale link closes it.
            debug!("Ignoring stale connect result (generation {})", generation);
            return;
        }
        match result {
            Ok(link) => self.on_open(link),
            Err(e) => {
                warn!("Upstream connect failed: {}", e);
                self.state = UpstreamState::Absent;
                self.schedule_reconnect();
            }
        }
    }

    fn on_open(&mut self, link: UpstreamLink) {
        let UpstreamLink { outbound, mut inbound } = link;
        self.state = UpstreamState::Open;
        self.upstream = Some(outbound);
        self.connected_since = Some(Utc::now());
        self.reconnect_attempts = 0;
        self.retries_exhausted = false;
        self.cancel_reconnect_timer();

        let generation = self.generation;
        let events = self.events.clone();
        self.reader = Some(tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                let terminal = matches!(frame, UpstreamFrame::Closed(_) | UpstreamFrame::Error(_));
                if events.send(RelayEvent::Upstream { generation, frame }).is_err() || terminal {
                    return;
                }
            }
            // transport vanished without a terminal frame
            let _ = events.send(RelayEvent::Upstream {
                generation,
                frame: UpstreamFrame::Closed(None),
            });
        }));

        info!(
            "Upstream connected; replaying {} subscription(s)",
            self.registry.len()
        );
        self.registry.await_replies();
        let replay: Vec<String> = self
            .registry
            .iter()
            .map(|sub| protocol::subscribe_request(sub.id, &sub.method, &sub.params))
            .collect();
        for request in replay {
            self.send_upstream(request);
        }
    }

    fn on_upstream_frame(&mut self, generation: u64, frame: UpstreamFrame) {
        if generation != self.generation || self.state != UpstreamState::Open {
            debug!("Ignoring frame from stale upstream (generation {})", generation);
            return;
        }
        match frame {
            UpstreamFrame::Text(text) => self.route_upstream_message(text),
            UpstreamFrame::Closed(reason) => {
                warn!(
                    "Upstream connection closed ({})",
                    reason.as_deref().unwrap_or("no reason")
                );
                self.on_upstream_down();
            }
            UpstreamFrame::Error(e) => {
                error!("Upstream connection error: {}", e);
                self.on_upstream_down();
            }
        }
    }

    fn on_upstream_down(&mut self) {
        self.state = UpstreamState::Absent;
        self.upstream = None;
        self.connected_since = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.registry.clear_upstream_ids();
        self.passthrough.clear();
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if self.reconnect_timer.is_some() {
            return;
        }
        if self.backoff.is_exhausted(self.reconnect_attempts) {
            if !self.retries_exhausted {
                error!(
                    "Upstream reconnect gave up after {} attempts; {} subscription(s) will not be restored until a manual reconnect",
                    self.reconnect_attempts,
                    self.registry.len()
                );
                self.retries_exhausted = true;
            }
            return;
        }
        let delay = self.backoff.delay(self.reconnect_attempts);
        self.reconnect_attempts += 1;
        warn!(
            "Upstream reconnect attempt {}/{} in {} ms",
            self.reconnect_attempts,
            self.backoff.max_attempts(),
            delay.as_millis()
        );
        self.timer_seq += 1;
        let timer = self.timer_seq;
        let events = self.events.clone();
        self.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(RelayEvent::ReconnectDue { timer });
        }));
    }

    fn cancel_reconnect_timer(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }

    fn route_upstream_message(&mut self, text: String) {
        let mut value: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                debug!("Dropping unparseable upstream frame: {}", e);
                return;
            }
        };

        let (id, upstream_id, is_error) = match protocol::classify(&value) {
            UpstreamMessage::Notification => {
                for client in self.registry.clients() {
                    self.send_to_client(client, text.clone());
                }
                return;
            }
            UpstreamMessage::Reply { id, result, is_error } => {
                (id.clone(), result.and_then(Value::as_u64), is_error)
            }
            UpstreamMessage::Unrecognized => {
                debug!("Dropping unrecognised upstream frame");
                return;
            }
        };

        // Only an outstanding subscribe request claims a reply by registry id;
        // any other reply with that id belongs to a forwarded request.
        if let Some(sub_id) = id.as_u64() {
            if let Some((client, request_id)) = self.registry.settle_reply(sub_id) {
                if is_error {
                    warn!("Upstream rejected subscription {}; removing it", sub_id);
                    self.registry.remove(sub_id);
                } else if let Some(upstream_id) = upstream_id {
                    self.registry.set_upstream_id(sub_id, upstream_id);
                    debug!("Subscription {} -> upstream {}", sub_id, upstream_id);
                }
                value["id"] = request_id;
                self.send_to_client(client, value.to_string());
                return;
            }
        }

        if let Some(client) = self.passthrough.remove(&id.to_string()) {
            self.send_to_client(client, text);
        } else if let Some(sub) = id.as_u64().and_then(|n| self.registry.lookup(n)) {
            self.send_to_client(sub.client, text);
        } else {
            debug!("Dropping reply with unmatched id {}", id);
        }
    }

    fn on_client_message(&mut self, client: ClientId, text: &str) {
        let request = match ClientRequest::parse(text) {
            Ok(r) => r,
            Err(reply) => {
                debug!("Client {} sent malformed frame: {}", client, reply.error.message);
                self.send_to_client(client, reply.to_text());
                return;
            }
        };

        if self.state != UpstreamState::Open || self.upstream.is_none() {
            warn!(
                "Rejecting {} from client {}: upstream {:?}",
                request.method, client, self.state
            );
            self.send_to_client(client, ErrorReply::upstream_unavailable(request.id.clone()).to_text());
            self.connect();
            return;
        }

        if request.is_subscribe() {
            let params = match request.subscription_params() {
                Ok(p) => p,
                Err(reply) => {
                    self.send_to_client(client, reply.to_text());
                    return;
                }
            };
            let id = self
                .registry
                .register_request(request.method.clone(), params, client, request.id.clone());
            debug!("Client {} {} registered as {}", client, request.method, id);
            self.send_upstream(request.with_id(id));
            return;
        }

        if request.is_unsubscribe() {
            if let Some(id) = request
                .first_param_u64()
                .and_then(|n| self.registry.find_by_upstream_id(client, n))
            {
                self.registry.remove(id);
                debug!("Client {} unsubscribed {}", client, id);
            }
        }
        if !request.id.is_null() {
            self.passthrough.insert(request.id.to_string(), client);
        }
        self.send_upstream(text.to_string());
    }

    fn on_client_closed(&mut self, client: ClientId) {
        self.clients.remove(&client);
        self.passthrough.retain(|_, owner| *owner != client);
        let removed = self.registry.remove_all_for(client);
        info!(
            "Client {} disconnected; dropped {} subscription(s)",
            client,
            removed.len()
        );

        if self.state != UpstreamState::Open {
            return;
        }
        for sub in removed {
            if let Some(request) = sub
                .upstream_id
                .and_then(|upstream_id| protocol::unsubscribe_request(sub.id, &sub.method, upstream_id))
            {
                self.send_upstream(request);
            }
        }
    }

    fn send_upstream(&self, text: String) {
        match &self.upstream {
            Some(tx) => {
                if tx.send(text).is_err() {
                    // The transport reports the failure as a Closed/Error frame.
                    warn!("Upstream writer gone; frame dropped");
                }
            }
            None => debug!("No upstream connection; frame dropped"),
        }
    }

    fn send_to_client(&self, client: ClientId, text: String) {
        match self.clients.get(&client) {
            Some(tx) if !tx.is_closed() => {
                let _ = tx.send(text);
            }
            _ => debug!("Client {} is gone; frame dropped", client),
        }
    }

    fn shutdown(&mut self) {
        info!("Stopping relay ({} client(s) connected)", self.clients.len());
        self.cancel_reconnect_timer();
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.upstream = None;
        self.state = UpstreamState::Absent;
        self.clients.clear();
    }
}

impl RelayStatus {
    pub fn is_open(&self) -> bool {
        self.state == UpstreamState::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PARSE_ERROR, UPSTREAM_UNAVAILABLE};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::{timeout, Instant};

    struct Attempt {
        url: String,
        reply: oneshot::Sender<Result<UpstreamLink, RelayError>>,
    }

    /// Connector that hands every attempt to the test, which accepts or refuses it.
    struct FakeConnector {
        attempts: mpsc::UnboundedSender<Attempt>,
    }

    #[async_trait]
    impl UpstreamConnector for FakeConnector {
        async fn connect(&self, url: &str) -> Result<UpstreamLink, RelayError> {
            let (reply, rx) = oneshot::channel();
            self.attempts
                .send(Attempt {
                    url: url.to_string(),
                    reply,
                })
                .map_err(|_| RelayError::ChannelClosed)?;
            rx.await
                .map_err(|_| RelayError::WebSocket("attempt abandoned".to_string()))?
        }
    }

    struct FakeUpstream {
        sent: mpsc::UnboundedReceiver<String>,
        frames: mpsc::UnboundedSender<UpstreamFrame>,
    }

    impl FakeUpstream {
        async fn next_sent(&mut self) -> Value {
            let text = timeout(Duration::from_secs(5), self.sent.recv())
                .await
                .expect("nothing sent upstream")
                .expect("upstream link closed");
            serde_json::from_str(&text).unwrap()
        }

        async fn nothing_sent(&mut self) -> bool {
            match timeout(Duration::from_millis(50), self.sent.recv()).await {
                Err(_) => true,
                Ok(None) => true,
                Ok(Some(_)) => false,
            }
        }

        fn push(&self, value: &Value) {
            self.frames.send(UpstreamFrame::Text(value.to_string())).unwrap();
        }

        fn close(&self) {
            self.frames.send(UpstreamFrame::Closed(Some("going away".to_string()))).unwrap();
        }
    }

    fn accept(attempt: Attempt) -> FakeUpstream {
        let (outbound, sent) = mpsc::unbounded_channel();
        let (frames, inbound) = mpsc::unbounded_channel();
        assert!(attempt.reply.send(Ok(UpstreamLink { outbound, inbound })).is_ok());
        FakeUpstream { sent, frames }
    }

    fn refuse(attempt: Attempt) {
        let _ = attempt
            .reply
            .send(Err(RelayError::WebSocket("connection refused".to_string())));
    }

    struct Harness {
        relay: RelayHandle,
        task: JoinHandle<()>,
        attempts: mpsc::UnboundedReceiver<Attempt>,
    }

    fn test_settings(base_delay_ms: u64, max_attempts: u32) -> Settings {
        Settings {
            upstream_ws_url: "wss://rpc.example.com/".to_string(),
            upstream_http_url: None,
            api_key: Some("test-key".to_string()),
            api_key_param: "api-key".to_string(),
            bind_host: "127.0.0.1".to_string(),
            port: 0,
            reconnect_base_delay_ms: base_delay_ms,
            max_reconnect_attempts: max_attempts,
            upstream_ping_interval_secs: 30,
            connect_on_start: false,
        }
    }

    impl Harness {
        fn start(base_delay_ms: u64, max_attempts: u32) -> Self {
            let (tx, attempts) = mpsc::unbounded_channel();
            let connector = Arc::new(FakeConnector { attempts: tx });
            let (relay, task) = Relay::start(&test_settings(base_delay_ms, max_attempts), connector).unwrap();
            Self {
                relay,
                task,
                attempts,
            }
        }

        async fn next_attempt(&mut self) -> Attempt {
            timeout(Duration::from_secs(3600), self.attempts.recv())
                .await
                .expect("no connection attempt")
                .expect("connector dropped")
        }

        async fn no_attempt_within(&mut self, wait: Duration) -> bool {
            timeout(wait, self.attempts.recv()).await.is_err()
        }

        async fn open(&mut self) -> FakeUpstream {
            self.relay.connect().unwrap();
            let upstream = accept(self.next_attempt().await);
            self.wait_for(UpstreamState::Open).await;
            upstream
        }

        async fn wait_for(&self, state: UpstreamState) {
            for _ in 0..1000 {
                if self.relay.status().await.unwrap().state == state {
                    return;
                }
                tokio::task::yield_now().await;
            }
            panic!("relay never reached {:?}", state);
        }

        fn client(&self) -> ClientSession {
            self.relay.connect_client().unwrap()
        }

        fn send(&self, client: &ClientSession, value: Value) {
            self.relay.send_from_client(client.id, value.to_string()).unwrap();
        }
    }

    async fn recv_text(session: &mut ClientSession) -> String {
        timeout(Duration::from_secs(5), session.outbound.recv())
            .await
            .expect("client received nothing")
            .expect("client channel closed")
    }

    async fn recv_json(session: &mut ClientSession) -> Value {
        serde_json::from_str(&recv_text(session).await).unwrap()
    }

    /// Timer wheel resolution is one millisecond.
    fn assert_waited(since: Instant, expected_ms: u64) {
        let waited = since.elapsed();
        let expected = Duration::from_millis(expected_ms);
        assert!(
            waited >= expected && waited <= expected + Duration::from_millis(2),
            "waited {:?}, expected {:?}",
            waited,
            expected
        );
    }

    fn subscribe(method: &str, params: Value, id: Value) -> Value {
        json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
    }

    #[tokio::test(start_paused = true)]
    async fn connects_with_api_key_in_url() {
        let mut h = Harness::start(1000, 5);
        h.relay.connect().unwrap();
        let attempt = h.next_attempt().await;
        assert_eq!(attempt.url, "wss://rpc.example.com/?api-key=test-key");
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_gets_local_id_and_notifications_reach_every_subscriber() {
        let mut h = Harness::start(1000, 5);
        let mut up = h.open().await;
        let mut a = h.client();
        let mut b = h.client();
        let mut idle = h.client();

        h.send(&a, subscribe("accountSubscribe", json!(["Acc111", {"encoding": "base64"}]), json!("a-1")));
        let sent = up.next_sent().await;
        assert_eq!(sent["id"], 1);
        assert_eq!(sent["method"], "accountSubscribe");
        assert_eq!(sent["params"], json!(["Acc111", {"encoding": "base64"}]));

        up.push(&json!({"jsonrpc": "2.0", "id": 1, "result": 555}));
        let reply = recv_json(&mut a).await;
        assert_eq!(reply["result"], 555);
        assert_eq!(reply["id"], "a-1");

        h.send(&b, subscribe("slotSubscribe", json!([]), json!(9)));
        assert_eq!(up.next_sent().await["id"], 2);

        let note = json!({
            "jsonrpc": "2.0",
            "method": "accountNotification",
            "params": {"subscription": 555, "result": {"value": {"lamports": 42}}}
        });
        up.push(&note);
        assert_eq!(recv_text(&mut a).await, note.to_string());
        assert_eq!(recv_text(&mut b).await, note.to_string());
        assert!(idle.outbound.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn replays_every_subscription_once_after_reconnect() {
        let mut h = Harness::start(1000, 5);
        let mut up = h.open().await;
        let a = h.client();
        let b = h.client();

        h.send(&a, subscribe("accountSubscribe", json!(["Acc1"]), json!(1)));
        h.send(&b, subscribe("logsSubscribe", json!([{"mentions": ["Prog1"]}]), json!(1)));
        h.send(&a, subscribe("slotSubscribe", json!([]), json!(2)));
        let mut original = Vec::new();
        for _ in 0..3 {
            original.push(up.next_sent().await);
        }

        up.close();
        h.wait_for(UpstreamState::Absent).await;
        let closed_at = Instant::now();

        let attempt = h.next_attempt().await;
        assert_waited(closed_at, 1000);
        let mut up2 = accept(attempt);

        let mut replayed = Vec::new();
        for _ in 0..3 {
            replayed.push(up2.next_sent().await);
        }
        assert!(up2.nothing_sent().await);
        assert_eq!(
            replayed.iter().map(|r| r["id"].as_u64().unwrap()).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        for (before, after) in original.iter().zip(&replayed) {
            assert_eq!(before["method"], after["method"]);
            assert_eq!(before["params"], after["params"]);
        }

        let status = h.relay.status().await.unwrap();
        assert!(status.is_open());
        assert_eq!(status.reconnect_attempts, 0);
        assert_eq!(status.subscriptions, 3);
        // old link was released
        assert!(up.sent.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn closing_a_client_removes_only_its_subscriptions() {
        let mut h = Harness::start(1000, 5);
        let mut up = h.open().await;
        let mut a = h.client();
        let mut b = h.client();

        h.send(&a, subscribe("accountSubscribe", json!(["Acc1"]), json!(1)));
        h.send(&a, subscribe("logsSubscribe", json!(["all"]), json!(2)));
        h.send(&b, subscribe("accountSubscribe", json!(["Acc1"]), json!(1)));
        for _ in 0..3 {
            up.next_sent().await;
        }
        for (id, upstream_id) in [(1, 100), (2, 101), (3, 102)] {
            up.push(&json!({"jsonrpc": "2.0", "id": id, "result": upstream_id}));
        }
        recv_json(&mut a).await;
        recv_json(&mut a).await;
        recv_json(&mut b).await;

        h.relay.disconnect_client(a.id).unwrap();
        let unsub1 = up.next_sent().await;
        let unsub2 = up.next_sent().await;
        assert_eq!(unsub1, json!({"jsonrpc": "2.0", "id": 1, "method": "accountUnsubscribe", "params": [100]}));
        assert_eq!(unsub2, json!({"jsonrpc": "2.0", "id": 2, "method": "logsUnsubscribe", "params": [101]}));

        let status = h.relay.status().await.unwrap();
        assert_eq!(status.subscriptions, 1);
        assert_eq!(status.clients, 1);

        let note = json!({"jsonrpc": "2.0", "method": "accountNotification", "params": {"subscription": 102}});
        up.push(&note);
        assert_eq!(recv_text(&mut b).await, note.to_string());
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_while_down_is_rejected_and_triggers_connect() {
        let mut h = Harness::start(1000, 5);
        let mut a = h.client();

        h.send(&a, subscribe("accountSubscribe", json!(["Acc1"]), json!("req-7")));
        let reply = recv_json(&mut a).await;
        assert_eq!(reply["jsonrpc"], "2.0");
        assert_eq!(reply["error"]["code"], UPSTREAM_UNAVAILABLE);
        assert_eq!(reply["id"], "req-7");
        assert_eq!(h.relay.status().await.unwrap().subscriptions, 0);

        // out-of-band attempt, no backoff wait
        let started = Instant::now();
        let mut up = accept(h.next_attempt().await);
        assert_waited(started, 0);
        h.wait_for(UpstreamState::Open).await;
        assert!(up.nothing_sent().await);
    }

    #[tokio::test(start_paused = true)]
    async fn request_mid_backoff_is_rejected_then_subscriptions_restored() {
        let mut h = Harness::start(1000, 5);
        let mut up = h.open().await;
        let mut a = h.client();
        let b = h.client();

        h.send(&a, subscribe("accountSubscribe", json!(["Acc1"]), json!(1)));
        h.send(&b, subscribe("slotSubscribe", json!([]), json!(1)));
        up.next_sent().await;
        up.next_sent().await;

        up.close();
        h.wait_for(UpstreamState::Absent).await;

        h.send(&a, json!({"jsonrpc": "2.0", "id": 11, "method": "getSlot"}));
        let reply = recv_json(&mut a).await;
        assert_eq!(reply["error"]["code"], UPSTREAM_UNAVAILABLE);
        assert_eq!(reply["id"], 11);

        let mut up2 = accept(h.next_attempt().await);
        let first = up2.next_sent().await;
        let second = up2.next_sent().await;
        assert_eq!((first["id"].as_u64(), second["id"].as_u64()), (Some(1), Some(2)));
        assert!(up2.nothing_sent().await);

        // the pending backoff timer was cancelled by the successful open
        assert!(h.no_attempt_within(Duration::from_secs(3600)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_and_stops_at_the_ceiling() {
        let mut h = Harness::start(1000, 3);
        h.relay.connect().unwrap();
        refuse(h.next_attempt().await);

        for expected_ms in [1000u64, 2000, 4000] {
            let failed_at = Instant::now();
            let attempt = h.next_attempt().await;
            assert_waited(failed_at, expected_ms);
            refuse(attempt);
        }

        assert!(h.no_attempt_within(Duration::from_secs(3600)).await);
        let status = h.relay.status().await.unwrap();
        assert_eq!(status.state, UpstreamState::Absent);
        assert_eq!(status.reconnect_attempts, 3);
        assert!(status.retries_exhausted);

        h.relay.force_reconnect().unwrap();
        let _up = accept(h.next_attempt().await);
        h.wait_for(UpstreamState::Open).await;
        let status = h.relay.status().await.unwrap();
        assert_eq!(status.reconnect_attempts, 0);
        assert!(!status.retries_exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_counter_resets_after_successful_open() {
        let mut h = Harness::start(500, 5);
        h.relay.connect().unwrap();
        refuse(h.next_attempt().await);
        refuse(h.next_attempt().await);
        let up = accept(h.next_attempt().await);
        h.wait_for(UpstreamState::Open).await;
        assert_eq!(h.relay.status().await.unwrap().reconnect_attempts, 0);

        up.close();
        h.wait_for(UpstreamState::Absent).await;
        let closed_at = Instant::now();
        let _attempt = h.next_attempt().await;
        assert_waited(closed_at, 500);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_connect_requests_make_one_attempt() {
        let mut h = Harness::start(1000, 5);
        h.relay.connect().unwrap();
        h.relay.connect().unwrap();
        let attempt = h.next_attempt().await;
        h.relay.connect().unwrap();
        assert!(h.no_attempt_within(Duration::from_millis(100)).await);
        let _up = accept(attempt);
        h.wait_for(UpstreamState::Open).await;
        h.relay.connect().unwrap();
        assert!(h.no_attempt_within(Duration::from_millis(100)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn plain_requests_pass_through_and_replies_find_their_sender() {
        let mut h = Harness::start(1000, 5);
        let mut up = h.open().await;
        let mut a = h.client();
        let mut b = h.client();

        let request = json!({"jsonrpc": "2.0", "id": "q1", "method": "getBalance", "params": ["Wallet1"]});
        h.send(&a, request.clone());
        assert_eq!(up.next_sent().await, request);
        assert_eq!(h.relay.status().await.unwrap().subscriptions, 0);

        up.push(&json!({"jsonrpc": "2.0", "id": "q1", "result": {"value": 10}}));
        assert_eq!(recv_json(&mut a).await["result"]["value"], 10);
        assert!(b.outbound.try_recv().is_err());

        // a second reply for the same id has no owner any more
        h.send(&a, subscribe("slotSubscribe", json!([]), json!(1)));
        up.next_sent().await;
        up.push(&json!({"jsonrpc": "2.0", "id": "q1", "result": {"value": 11}}));
        let note = json!({"jsonrpc": "2.0", "method": "slotNotification", "params": {"result": {"slot": 1}}});
        up.push(&note);
        assert_eq!(recv_text(&mut a).await, note.to_string());
    }

    #[tokio::test(start_paused = true)]
    async fn colliding_request_id_leaves_other_clients_subscription_alone() {
        let mut h = Harness::start(1000, 5);
        let mut up = h.open().await;
        let mut a = h.client();
        let mut b = h.client();

        h.send(&a, subscribe("accountSubscribe", json!(["Acc1"]), json!(1)));
        assert_eq!(up.next_sent().await["id"], 1);
        up.push(&json!({"jsonrpc": "2.0", "id": 1, "result": 555}));
        assert_eq!(recv_json(&mut a).await["result"], 555);

        // b reuses id 1 for a plain request that fails upstream
        let balance = json!({"jsonrpc": "2.0", "id": 1, "method": "getBalance", "params": ["bad"]});
        h.send(&b, balance.clone());
        assert_eq!(up.next_sent().await, balance);
        up.push(&json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32602, "message": "Invalid param"}}));
        assert_eq!(recv_json(&mut b).await["error"]["code"], -32602);
        assert!(a.outbound.try_recv().is_err());
        assert_eq!(h.relay.status().await.unwrap().subscriptions, 1);

        // an integer result for b must not rebind a's upstream id
        let slot = json!({"jsonrpc": "2.0", "id": 1, "method": "getSlot"});
        h.send(&b, slot.clone());
        assert_eq!(up.next_sent().await, slot);
        up.push(&json!({"jsonrpc": "2.0", "id": 1, "result": 999}));
        assert_eq!(recv_json(&mut b).await["result"], 999);
        assert!(a.outbound.try_recv().is_err());

        let unsub = json!({"jsonrpc": "2.0", "id": 2, "method": "accountUnsubscribe", "params": [555]});
        h.send(&a, unsub.clone());
        assert_eq!(up.next_sent().await, unsub);
        assert_eq!(h.relay.status().await.unwrap().subscriptions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn replayed_subscribe_reply_carries_the_clients_request_id() {
        let mut h = Harness::start(1000, 5);
        let mut up = h.open().await;
        let mut a = h.client();

        h.send(&a, subscribe("slotSubscribe", json!([]), json!("slot-sub")));
        up.next_sent().await;
        up.push(&json!({"jsonrpc": "2.0", "id": 1, "result": 10}));
        assert_eq!(recv_json(&mut a).await["id"], "slot-sub");

        up.close();
        h.wait_for(UpstreamState::Absent).await;
        let mut up2 = accept(h.next_attempt().await);
        assert_eq!(up2.next_sent().await["id"], 1);
        up2.push(&json!({"jsonrpc": "2.0", "id": 1, "result": 11}));
        let reply = recv_json(&mut a).await;
        assert_eq!(reply["id"], "slot-sub");
        assert_eq!(reply["result"], 11);

        // the provider's new number is the one unsubscribe matches
        h.send(&a, json!({"jsonrpc": "2.0", "id": 3, "method": "slotUnsubscribe", "params": [11]}));
        up2.next_sent().await;
        assert_eq!(h.relay.status().await.unwrap().subscriptions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_removes_the_matching_entry() {
        let mut h = Harness::start(1000, 5);
        let mut up = h.open().await;
        let mut a = h.client();

        h.send(&a, subscribe("accountSubscribe", json!(["Acc1"]), json!(1)));
        up.next_sent().await;
        up.push(&json!({"jsonrpc": "2.0", "id": 1, "result": 900}));
        recv_json(&mut a).await;

        let unsub = json!({"jsonrpc": "2.0", "id": 5, "method": "accountUnsubscribe", "params": [900]});
        h.send(&a, unsub.clone());
        assert_eq!(up.next_sent().await, unsub);
        assert_eq!(h.relay.status().await.unwrap().subscriptions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_subscription_is_dropped_from_the_registry() {
        let mut h = Harness::start(1000, 5);
        let mut up = h.open().await;
        let mut a = h.client();

        h.send(&a, subscribe("accountSubscribe", json!(["not-a-key"]), json!(1)));
        up.next_sent().await;
        up.push(&json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32602, "message": "Invalid param"}}));
        assert_eq!(recv_json(&mut a).await["error"]["code"], -32602);
        assert_eq!(h.relay.status().await.unwrap().subscriptions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frames_are_answered_to_the_sender_only() {
        let mut h = Harness::start(1000, 5);
        let mut up = h.open().await;
        let mut a = h.client();
        let mut b = h.client();

        h.relay.send_from_client(a.id, "{oops".to_string()).unwrap();
        let reply = recv_json(&mut a).await;
        assert_eq!(reply["error"]["code"], PARSE_ERROR);
        assert_eq!(reply["id"], Value::Null);
        assert!(b.outbound.try_recv().is_err());
        assert!(up.nothing_sent().await);
        assert!(h.relay.status().await.unwrap().is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_closes_clients_and_ends_the_task() {
        let mut h = Harness::start(1000, 5);
        let mut up = h.open().await;
        let mut a = h.client();
        h.relay.stop();

        assert!(a.outbound.recv().await.is_none());
        assert!(up.sent.recv().await.is_none());
        (&mut h.task).await.unwrap();
        assert!(matches!(h.relay.status().await, Err(RelayError::ChannelClosed)));
    }

    #[tokio::test]
    async fn events_from_a_superseded_connection_are_ignored() {
        let (events, _queued) = mpsc::unbounded_channel();
        let (attempts, _attempt_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(FakeConnector { attempts });
        let mut relay = Relay::new(&test_settings(1000, 5), connector, events).unwrap();

        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        relay.handle(RelayEvent::ClientConnected {
            client: 1,
            outbound: client_tx,
        });
        relay.registry.register("slotSubscribe".to_string(), Vec::new(), 1);

        // generation 1 failed earlier; generation 2 is the live attempt
        relay.generation = 2;
        relay.state = UpstreamState::Connecting;
        let (outbound, mut sent) = mpsc::unbounded_channel();
        let (_frames, inbound) = mpsc::unbounded_channel();
        relay.handle(RelayEvent::ConnectResult {
            generation: 2,
            result: Ok(UpstreamLink { outbound, inbound }),
        });
        assert_eq!(relay.state, UpstreamState::Open);
        assert!(sent.try_recv().is_ok());

        let note = json!({"jsonrpc": "2.0", "method": "slotNotification", "params": {"result": {"slot": 7}}}).to_string();
        relay.handle(RelayEvent::Upstream {
            generation: 1,
            frame: UpstreamFrame::Closed(None),
        });
        relay.handle(RelayEvent::Upstream {
            generation: 1,
            frame: UpstreamFrame::Text(note.clone()),
        });
        assert_eq!(relay.state, UpstreamState::Open);
        assert!(client_rx.try_recv().is_err());

        let (late_outbound, mut late_sent) = mpsc::unbounded_channel();
        let (_late_frames, late_inbound) = mpsc::unbounded_channel();
        relay.handle(RelayEvent::ConnectResult {
            generation: 1,
            result: Ok(UpstreamLink {
                outbound: late_outbound,
                inbound: late_inbound,
            }),
        });
        // the late link was dropped without being used
        assert!(matches!(
            late_sent.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));

        relay.handle(RelayEvent::Upstream {
            generation: 2,
            frame: UpstreamFrame::Text(note.clone()),
        });
        assert_eq!(client_rx.try_recv().unwrap(), note);
    }
}
