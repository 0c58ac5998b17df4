//! The orchestrator link.
//!
//! A single owned WebSocket channel with a four-state machine:
//! `disconnected → connecting → connected → registered`. Registration is
//! always the first message on a fresh channel. Transport loss drops the
//! link back to `disconnected` and schedules a jittered exponential
//! reconnect unless reconnection has been disabled (explicit `disconnect`,
//! or a registration rejection).

use crate::constants::{
    HEARTBEAT_INTERVAL_SECS, RECONNECT_BASE_DELAY_MS, RECONNECT_JITTER_HIGH, RECONNECT_JITTER_LOW,
    RECONNECT_MAX_DELAY_MS,
};
use crate::models::HostCapabilities;
use crate::protocol::{GatewayMessage, ServerMessage};
use crate::{GatewayError, Result};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Link lifecycle state. `Registered` implies an open transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Registered,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Registered => "registered",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub url: String,
    pub host_id: String,
    pub token: String,
    pub capabilities: HostCapabilities,
    /// Automatic reconnection after transport loss.
    pub reconnect: bool,
}

struct LinkShared {
    config: ConnectionConfig,
    state_tx: watch::Sender<LinkState>,
    outbound_rx: Mutex<mpsc::UnboundedReceiver<GatewayMessage>>,
    inbound_tx: mpsc::UnboundedSender<ServerMessage>,
    reconnect_enabled: AtomicBool,
    attempt: AtomicU32,
    last_error: std::sync::Mutex<Option<String>>,
}

impl LinkShared {
    fn set_state(&self, state: LinkState) {
        self.state_tx.send_replace(state);
    }

    fn record_error(&self, message: String) {
        warn!("link error: {message}");
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(message);
    }
}

enum Flow {
    Continue,
    Stop,
}

/// The gateway's owned channel to the orchestrator.
pub struct Connection {
    shared: Arc<LinkShared>,
    outbound_tx: mpsc::UnboundedSender<GatewayMessage>,
    shutdown: std::sync::Mutex<CancellationToken>,
    supervisor: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Builds the link. The returned receiver carries inbound server
    /// messages for the entry loop.
    pub fn new(config: ConnectionConfig) -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let (state_tx, _) = watch::channel(LinkState::Disconnected);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let connection = Self {
            shared: Arc::new(LinkShared {
                config,
                state_tx,
                outbound_rx: Mutex::new(outbound_rx),
                inbound_tx,
                reconnect_enabled: AtomicBool::new(false),
                attempt: AtomicU32::new(0),
                last_error: std::sync::Mutex::new(None),
            }),
            outbound_tx,
            shutdown: std::sync::Mutex::new(CancellationToken::new()),
            supervisor: std::sync::Mutex::new(None),
        };
        (connection, inbound_rx)
    }

    pub fn state(&self) -> LinkState {
        *self.shared.state_tx.borrow()
    }

    /// Observers get every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.shared.state_tx.subscribe()
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.shared.attempt.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared
            .last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Queues an outbound message. Delivery happens once registered; the
    /// session task always sends `register` first on a fresh channel.
    pub fn send(&self, message: GatewayMessage) -> Result<()> {
        self.outbound_tx
            .send(message)
            .map_err(|_| GatewayError::Connection {
                message: "link is shut down".to_string(),
            })
    }

    /// Starts the supervisor. Only valid from `disconnected`.
    pub fn connect(&self) -> Result<()> {
        if self.state() != LinkState::Disconnected {
            return Err(GatewayError::Connection {
                message: format!("Cannot connect from state {}", self.state()),
            });
        }
        self.shared
            .reconnect_enabled
            .store(self.shared.config.reconnect, Ordering::SeqCst);
        let token = CancellationToken::new();
        *self.shutdown.lock().unwrap_or_else(|e| e.into_inner()) = token.clone();

        self.shared.set_state(LinkState::Connecting);
        let shared = self.shared.clone();
        let handle = tokio::spawn(supervise(shared, token));
        *self.supervisor.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    /// Disables reconnection, cancels timers, closes the transport.
    pub async fn disconnect(&self) {
        self.shared.reconnect_enabled.store(false, Ordering::SeqCst);
        self.shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();
        let handle = self
            .supervisor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.shared.set_state(LinkState::Disconnected);
    }
}

/// Delay before retry `attempt`: `min(1000·2^attempt, 60000)` ms times a
/// uniform jitter in `[0.75, 1.25]`.
fn backoff_delay(attempt: u32) -> Duration {
    let base = RECONNECT_BASE_DELAY_MS << attempt.min(16);
    let capped = base.min(RECONNECT_MAX_DELAY_MS);
    let jitter = rand::thread_rng().gen_range(RECONNECT_JITTER_LOW..=RECONNECT_JITTER_HIGH);
    Duration::from_millis((capped as f64 * jitter) as u64)
}

async fn supervise(shared: Arc<LinkShared>, shutdown: CancellationToken) {
    loop {
        shared.set_state(LinkState::Connecting);
        let connected = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = connect_async(&shared.config.url) => result,
        };
        match connected {
            Ok((socket, _)) => {
                info!("link transport open to {}", shared.config.url);
                shared.set_state(LinkState::Connected);
                run_session(&shared, &shutdown, socket).await;
            }
            Err(e) => shared.record_error(format!("connect failed: {e}")),
        }
        shared.set_state(LinkState::Disconnected);

        if shutdown.is_cancelled() || !shared.reconnect_enabled.load(Ordering::SeqCst) {
            break;
        }
        let attempt = shared.attempt.fetch_add(1, Ordering::SeqCst);
        let delay = backoff_delay(attempt);
        debug!("scheduling reconnect attempt {} in {:?}", attempt + 1, delay);
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    shared.set_state(LinkState::Disconnected);
}

async fn run_session(
    shared: &Arc<LinkShared>,
    shutdown: &CancellationToken,
    socket: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) {
    let (mut write, mut read) = socket.split();

    // Registration precedes any other traffic on a fresh channel.
    let register = GatewayMessage::Register {
        host_id: shared.config.host_id.clone(),
        token: shared.config.token.clone(),
        capabilities: shared.config.capabilities.clone(),
    };
    if send_message(&mut write, &register).await.is_err() {
        return;
    }

    let mut heartbeat = tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    heartbeat.tick().await; // the first tick fires immediately

    let mut outbound = shared.outbound_rx.lock().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return;
            }
            inbound = read.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match handle_inbound(shared, &mut write, &text).await {
                            Flow::Continue => {}
                            Flow::Stop => return,
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("link transport closed by peer");
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        shared.record_error(format!("transport error: {e}"));
                        return;
                    }
                }
            }
            queued = outbound.recv() => {
                match queued {
                    Some(message) => {
                        if send_message(&mut write, &message).await.is_err() {
                            return;
                        }
                    }
                    None => return,
                }
            }
            _ = heartbeat.tick() => {
                let beat = GatewayMessage::Heartbeat {
                    timestamp: chrono::Utc::now().timestamp_millis(),
                };
                if send_message(&mut write, &beat).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn handle_inbound<S>(shared: &Arc<LinkShared>, write: &mut S, text: &str) -> Flow
where
    S: SinkExt<Message> + Unpin,
{
    let message: ServerMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            // Malformed inbound JSON is dropped, never fatal.
            warn!("dropping malformed inbound message: {e}");
            return Flow::Continue;
        }
    };
    match message {
        ServerMessage::Registered { ok: true, .. } => {
            info!("registered with orchestrator as {}", shared.config.host_id);
            shared.attempt.store(0, Ordering::SeqCst);
            shared.set_state(LinkState::Registered);
            Flow::Continue
        }
        ServerMessage::Registered { ok: false, error } => {
            // Bad credentials: terminal for this link, no retry.
            shared.record_error(format!(
                "registration rejected: {}",
                error.unwrap_or_else(|| "unknown reason".to_string())
            ));
            shared.reconnect_enabled.store(false, Ordering::SeqCst);
            let _ = write.send(Message::Close(None)).await;
            Flow::Stop
        }
        ServerMessage::Ping {} => {
            // Answered before the next inbound message is processed.
            let beat = GatewayMessage::Heartbeat {
                timestamp: chrono::Utc::now().timestamp_millis(),
            };
            if send_message(write, &beat).await.is_err() {
                return Flow::Stop;
            }
            Flow::Continue
        }
        other => {
            let _ = shared.inbound_tx.send(other);
            Flow::Continue
        }
    }
}

async fn send_message<S>(write: &mut S, message: &GatewayMessage) -> std::result::Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    let json = match serde_json::to_string(message) {
        Ok(json) => json,
        Err(e) => {
            warn!("failed to serialize outbound message: {e}");
            return Ok(());
        }
    };
    write.send(Message::Text(json)).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AgentKind;
    use serde_json::{json, Value};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::{accept_async, WebSocketStream};

    fn config(url: String, reconnect: bool) -> ConnectionConfig {
        ConnectionConfig {
            url,
            host_id: "host-test".to_string(),
            token: "dev-token".to_string(),
            capabilities: HostCapabilities {
                host_name: "test".to_string(),
                agents: vec![AgentKind::Opencode],
                max_concurrent: 2,
                cwd: std::env::temp_dir(),
                labels: vec![],
            },
            reconnect,
        }
    }

    async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
        let (stream, _) = listener.accept().await.unwrap();
        accept_async(stream).await.unwrap()
    }

    async fn next_json(ws: &mut WebSocketStream<TcpStream>) -> Value {
        loop {
            let message = ws.next().await.unwrap().unwrap();
            if message.is_text() {
                return serde_json::from_str(message.to_text().unwrap()).unwrap();
            }
        }
    }

    async fn send_json(ws: &mut WebSocketStream<TcpStream>, value: Value) {
        ws.send(Message::Text(value.to_string())).await.unwrap();
    }

    async fn wait_for_state(
        rx: &mut watch::Receiver<LinkState>,
        wanted: LinkState,
    ) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if *rx.borrow() == wanted {
                    return;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap_or_else(|_| panic!("never reached state {wanted}"));
    }

    #[test]
    fn backoff_delay_respects_bounds() {
        for attempt in 0..10u32 {
            let expected = (1000u64 << attempt.min(16)).min(60_000) as f64;
            for _ in 0..20 {
                let delay = backoff_delay(attempt).as_millis() as f64;
                assert!(delay >= expected * 0.75 - 1.0, "attempt {attempt}: {delay}");
                assert!(delay <= expected * 1.25 + 1.0, "attempt {attempt}: {delay}");
            }
        }
    }

    #[tokio::test]
    async fn register_is_the_first_message_and_gates_registered_state() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (connection, _inbound) = Connection::new(config(url, false));
        let mut states = connection.subscribe_state();

        connection.connect().unwrap();
        let mut ws = accept(&listener).await;

        let register = next_json(&mut ws).await;
        assert_eq!(register["type"], "register");
        assert_eq!(register["hostId"], "host-test");
        assert_eq!(register["token"], "dev-token");
        assert_eq!(register["capabilities"]["maxConcurrent"], 2);

        // Not registered until the server confirms.
        assert_ne!(connection.state(), LinkState::Registered);
        send_json(&mut ws, json!({"type": "registered", "ok": true})).await;
        wait_for_state(&mut states, LinkState::Registered).await;
        assert_eq!(connection.reconnect_attempt(), 0);

        connection.disconnect().await;
        assert_eq!(connection.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn connect_is_rejected_outside_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (connection, _inbound) = Connection::new(config(url, false));

        connection.connect().unwrap();
        let err = connection.connect().unwrap_err();
        assert!(err.to_string().contains("Cannot connect"));
        connection.disconnect().await;

        // Back to disconnected: connecting again is allowed.
        connection.connect().unwrap();
        connection.disconnect().await;
    }

    #[tokio::test]
    async fn ping_is_answered_with_a_heartbeat() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (connection, _inbound) = Connection::new(config(url, false));
        let mut states = connection.subscribe_state();

        connection.connect().unwrap();
        let mut ws = accept(&listener).await;
        let _register = next_json(&mut ws).await;
        send_json(&mut ws, json!({"type": "registered", "ok": true})).await;
        wait_for_state(&mut states, LinkState::Registered).await;

        let before = chrono::Utc::now().timestamp_millis();
        send_json(&mut ws, json!({"type": "ping"})).await;
        let beat = next_json(&mut ws).await;
        assert_eq!(beat["type"], "heartbeat");
        assert!(beat["timestamp"].as_i64().unwrap() >= before - 1000);

        connection.disconnect().await;
    }

    #[tokio::test]
    async fn malformed_json_is_dropped_and_the_link_survives() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (connection, mut inbound) = Connection::new(config(url, false));
        let mut states = connection.subscribe_state();

        connection.connect().unwrap();
        let mut ws = accept(&listener).await;
        let _register = next_json(&mut ws).await;
        send_json(&mut ws, json!({"type": "registered", "ok": true})).await;
        wait_for_state(&mut states, LinkState::Registered).await;

        ws.send(Message::Text("{not json at all".to_string()))
            .await
            .unwrap();
        send_json(
            &mut ws,
            json!({"type": "task:abort", "taskId": "t1"}),
        )
        .await;

        let routed = tokio::time::timeout(Duration::from_secs(2), inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(routed, ServerMessage::TaskAbort { task_id } if task_id == "t1"));

        connection.disconnect().await;
    }

    #[tokio::test]
    async fn rejected_registration_is_terminal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (connection, _inbound) = Connection::new(config(url, true));
        let mut states = connection.subscribe_state();

        connection.connect().unwrap();
        let mut ws = accept(&listener).await;
        let _register = next_json(&mut ws).await;
        send_json(
            &mut ws,
            json!({"type": "registered", "ok": false, "error": "bad token"}),
        )
        .await;
        wait_for_state(&mut states, LinkState::Disconnected).await;

        // No reconnect is scheduled after a rejection.
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(connection.state(), LinkState::Disconnected);
        assert_eq!(connection.reconnect_attempt(), 0);
        assert!(connection.last_error().unwrap().contains("bad token"));

        connection.disconnect().await;
    }

    #[tokio::test]
    async fn transport_loss_triggers_reconnect_and_fresh_register() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (connection, _inbound) = Connection::new(config(url, true));
        let mut states = connection.subscribe_state();

        connection.connect().unwrap();
        let mut ws = accept(&listener).await;
        let _register = next_json(&mut ws).await;
        send_json(&mut ws, json!({"type": "registered", "ok": true})).await;
        wait_for_state(&mut states, LinkState::Registered).await;

        // Kill the server side of the socket.
        drop(ws);
        wait_for_state(&mut states, LinkState::Disconnected).await;

        // A fresh register arrives on the next accepted connection, and the
        // attempt counter resets once registration succeeds again.
        let started = std::time::Instant::now();
        let mut ws = accept(&listener).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        let register = next_json(&mut ws).await;
        assert_eq!(register["type"], "register");
        assert_eq!(connection.reconnect_attempt(), 1);

        send_json(&mut ws, json!({"type": "registered", "ok": true})).await;
        wait_for_state(&mut states, LinkState::Registered).await;
        assert_eq!(connection.reconnect_attempt(), 0);

        connection.disconnect().await;
    }

    #[tokio::test]
    async fn queued_outbound_messages_are_delivered() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (connection, _inbound) = Connection::new(config(url, false));
        let mut states = connection.subscribe_state();

        connection.connect().unwrap();
        let mut ws = accept(&listener).await;
        let _register = next_json(&mut ws).await;
        send_json(&mut ws, json!({"type": "registered", "ok": true})).await;
        wait_for_state(&mut states, LinkState::Registered).await;

        connection
            .send(GatewayMessage::TaskStarted {
                task_id: "t1".to_string(),
            })
            .unwrap();
        let started = next_json(&mut ws).await;
        assert_eq!(started["type"], "task:started");
        assert_eq!(started["taskId"], "t1");

        connection.disconnect().await;
    }
}
