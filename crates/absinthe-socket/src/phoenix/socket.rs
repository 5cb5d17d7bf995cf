//! Phoenix socket over tokio-tungstenite.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::{Map, Value};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use url::Url;

use super::message::{Message, PHOENIX_TOPIC};
use super::transport::{SocketEvent, SocketTransport};
use crate::error::{AbsintheError, Result};
use crate::logging::targets;

/// Protocol version sent as the `vsn` query parameter.
pub const PROTOCOL_VERSION: &str = "2.0.0";

/// Produces the connection params for a connection attempt.
pub type ParamsProvider = Arc<dyn Fn() -> Map<String, Value> + Send + Sync>;

/// Current state of the socket connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SocketState {
    /// Not connected to any server.
    #[default]
    Disconnected,
    /// Currently attempting to connect.
    Connecting,
    /// Connected and ready to send/receive frames.
    Connected,
    /// Connection lost, waiting to reconnect.
    Reconnecting,
}

/// Configuration for a Phoenix socket.
#[derive(Clone)]
pub struct SocketConfig {
    /// The socket endpoint (ws://, wss://, http:// or https://).
    pub endpoint: String,
    /// Connection params, evaluated before every connection attempt.
    pub params: ParamsProvider,
    /// Custom headers to send during the handshake.
    pub headers: HashMap<String, String>,
    /// Interval between heartbeats. `None` disables heartbeats.
    pub heartbeat_interval: Option<Duration>,
    /// Auto-reconnect configuration. If `None`, auto-reconnect is disabled.
    pub reconnect: Option<ReconnectConfig>,
}

impl SocketConfig {
    /// Create a configuration for the given endpoint with default settings.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            params: Arc::new(Map::new),
            headers: HashMap::new(),
            heartbeat_interval: Some(Duration::from_secs(30)),
            reconnect: Some(ReconnectConfig::default()),
        }
    }

    /// Use a fixed set of connection params.
    pub fn params(mut self, params: Map<String, Value>) -> Self {
        self.params = Arc::new(move || params.clone());
        self
    }

    /// Compute connection params before every connection attempt.
    ///
    /// Use this to refresh credentials between reconnects.
    pub fn params_with(
        mut self,
        provider: impl Fn() -> Map<String, Value> + Send + Sync + 'static,
    ) -> Self {
        self.params = Arc::new(provider);
        self
    }

    /// Add a custom header for the handshake.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set the heartbeat interval. `None` disables heartbeats.
    pub fn heartbeat_interval(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the reconnect configuration. `None` disables reconnecting.
    pub fn reconnect(mut self, config: Option<ReconnectConfig>) -> Self {
        self.reconnect = config;
        self
    }

    /// Build the connection URL: endpoint plus params plus `vsn`.
    pub fn connection_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.endpoint)?;
        let scheme = match url.scheme() {
            "http" => Some("ws"),
            "https" => Some("wss"),
            "ws" | "wss" => None,
            other => {
                return Err(AbsintheError::InvalidUrl(format!(
                    "unsupported scheme '{other}'"
                )));
            }
        };
        if let Some(scheme) = scheme {
            url.set_scheme(scheme)
                .map_err(|_| AbsintheError::InvalidUrl(self.endpoint.clone()))?;
        }

        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in (self.params)() {
                match value {
                    Value::String(s) => pairs.append_pair(&key, &s),
                    other => pairs.append_pair(&key, &other.to_string()),
                };
            }
            pairs.append_pair("vsn", PROTOCOL_VERSION);
        }
        Ok(url)
    }
}

impl std::fmt::Debug for SocketConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketConfig")
            .field("endpoint", &self.endpoint)
            .field("headers", &self.headers)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("reconnect", &self.reconnect)
            .finish_non_exhaustive()
    }
}

/// Configuration for automatic reconnection.
#[derive(Clone, Debug)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts. `None` means infinite retries.
    pub max_attempts: Option<u32>,
    /// Initial delay between reconnection attempts.
    pub initial_delay: Duration,
    /// Maximum delay between reconnection attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl ReconnectConfig {
    /// Create a new reconnect configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of reconnection attempts.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Set the initial delay between reconnection attempts.
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the maximum delay between reconnection attempts.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the backoff multiplier for exponential backoff.
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Delay before the given attempt (0-indexed), capped and with ±10% jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_delay_ms * self.backoff_multiplier.powi(attempt as i32);
        let delay_ms = delay_ms.min(self.max_delay.as_millis() as f64) as i64;

        let jitter_range = delay_ms / 10;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0
        };

        Duration::from_millis((delay_ms + jitter).max(0) as u64)
    }
}

/// Command sent to the socket task.
enum Command {
    Send(String),
    Close,
}

/// State shared between a [`PhoenixSocket`] and its connection task.
#[derive(Default)]
struct Shared {
    state: SocketState,
    command_tx: Option<mpsc::UnboundedSender<Command>>,
    /// Id of the run allowed to touch this state, if any.
    active_run: Option<u64>,
    next_run: u64,
}

/// A connection task's handle on the shared state.
///
/// Every `connect` starts a new run. Once `disconnect` retires a run, its
/// task can no longer change the state or emit events.
struct Run {
    id: u64,
    shared: Arc<Mutex<Shared>>,
    events: mpsc::UnboundedSender<SocketEvent>,
}

impl Run {
    fn is_current(&self) -> bool {
        self.shared.lock().active_run == Some(self.id)
    }

    /// Apply `update` and emit `event` if this run is still active.
    fn publish(&self, update: impl FnOnce(&mut Shared), event: Option<SocketEvent>) -> bool {
        let mut shared = self.shared.lock();
        if shared.active_run != Some(self.id) {
            return false;
        }
        update(&mut shared);
        if let Some(event) = event {
            let _ = self.events.send(event);
        }
        true
    }

    fn set_state(&self, state: SocketState) -> bool {
        self.publish(|shared: &mut Shared| shared.state = state, None)
    }

    fn emit(&self, event: SocketEvent) -> bool {
        self.publish(|_: &mut Shared| {}, Some(event))
    }

    /// Release the active slot when the task stops for good.
    fn finish(&self) {
        self.publish(
            |shared: &mut Shared| {
                shared.state = SocketState::Disconnected;
                shared.command_tx = None;
                shared.active_run = None;
            },
            None,
        );
    }
}

/// A Phoenix channels socket.
///
/// The socket owns one WebSocket connection, keeps it alive with heartbeats
/// on the `phoenix` topic and reconnects with backoff when it drops.
/// Everything it observes is reported as a [`SocketEvent`] on the channel
/// returned by [`take_events`](Self::take_events).
pub struct PhoenixSocket {
    config: SocketConfig,
    shared: Arc<Mutex<Shared>>,
    ref_counter: Arc<AtomicU64>,
    events_tx: mpsc::UnboundedSender<SocketEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SocketEvent>>>,
    runtime: Option<Handle>,
}

impl PhoenixSocket {
    /// Create a new socket. Nothing happens until [`connect`](SocketTransport::connect).
    ///
    /// The socket task runs on the tokio runtime current at creation, or at
    /// `connect` time if the socket was created outside a runtime.
    pub fn new(config: SocketConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            shared: Arc::new(Mutex::new(Shared::default())),
            ref_counter: Arc::new(AtomicU64::new(0)),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            runtime: Handle::try_current().ok(),
        }
    }

    /// Take the event receiver. Returns `None` after the first call.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SocketEvent>> {
        self.events_rx.lock().take()
    }

    /// Get the current connection state.
    pub fn state(&self) -> SocketState {
        self.shared.lock().state
    }

    /// Get the endpoint this socket connects to.
    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    fn build_request(config: &SocketConfig) -> Result<Request> {
        let url = config.connection_url()?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| AbsintheError::Network(e.to_string()))?;

        let headers = request.headers_mut();
        for (name, value) in &config.headers {
            let header_name = http::header::HeaderName::try_from(name.as_str())
                .map_err(|e| AbsintheError::InvalidHeader(e.to_string()))?;
            let header_value = http::header::HeaderValue::try_from(value.as_str())
                .map_err(|e| AbsintheError::InvalidHeader(e.to_string()))?;
            headers.insert(header_name, header_value);
        }

        Ok(request)
    }

    fn next_ref(counter: &AtomicU64) -> String {
        (counter.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    async fn tick(heartbeat: &mut Option<Interval>) {
        match heartbeat {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }

    async fn run(config: SocketConfig, run: Run, ref_counter: Arc<AtomicU64>) {
        let mut reconnect_attempt: u32 = 0;

        loop {
            let phase = if reconnect_attempt > 0 {
                SocketState::Reconnecting
            } else {
                SocketState::Connecting
            };
            if !run.set_state(phase) {
                return;
            }

            let request = match Self::build_request(&config) {
                Ok(req) => req,
                Err(e) => {
                    tracing::error!(target: targets::SOCKET, "Invalid socket request: {}", e);
                    run.emit(SocketEvent::Error(e.to_string()));
                    run.finish();
                    return;
                }
            };

            match tokio_tungstenite::connect_async(request).await {
                Ok((ws_stream, _response)) => {
                    let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
                    let opened = run.publish(
                        |shared: &mut Shared| {
                            shared.command_tx = Some(tx);
                            shared.state = SocketState::Connected;
                        },
                        Some(SocketEvent::Open),
                    );
                    if !opened {
                        // disconnect() raced the handshake
                        return;
                    }

                    reconnect_attempt = 0;
                    tracing::debug!(
                        target: targets::SOCKET,
                        "Socket connected to {}",
                        config.endpoint
                    );

                    let (mut write, mut read) = ws_stream.split();
                    let mut heartbeat = config
                        .heartbeat_interval
                        .map(|period| tokio::time::interval_at(Instant::now() + period, period));
                    let mut pending_heartbeat: Option<String> = None;

                    let mut closed_normally = false;
                    loop {
                        tokio::select! {
                            cmd = rx.recv() => {
                                match cmd {
                                    Some(Command::Send(text)) => {
                                        let frame = WsMessage::Text(text.into());
                                        if let Err(e) = write.send(frame).await {
                                            run.emit(SocketEvent::Error(e.to_string()));
                                            break;
                                        }
                                    }
                                    Some(Command::Close) | None => {
                                        let _ = write.send(WsMessage::Close(None)).await;
                                        closed_normally = true;
                                        break;
                                    }
                                }
                            }

                            msg = read.next() => {
                                match msg {
                                    Some(Ok(WsMessage::Text(text))) => {
                                        match Message::decode(text.as_str()) {
                                            Ok(message) => {
                                                tracing::trace!(
                                                    target: targets::SOCKET,
                                                    "Received {} on {}",
                                                    message.event,
                                                    message.topic
                                                );
                                                if message.topic == PHOENIX_TOPIC {
                                                    if message.msg_ref.is_some()
                                                        && message.msg_ref == pending_heartbeat
                                                    {
                                                        pending_heartbeat = None;
                                                    }
                                                } else {
                                                    run.emit(SocketEvent::Message(message));
                                                }
                                            }
                                            Err(e) => {
                                                tracing::warn!(
                                                    target: targets::SOCKET,
                                                    "Dropping malformed frame: {}",
                                                    e
                                                );
                                            }
                                        }
                                    }
                                    Some(Ok(WsMessage::Close(_))) | None => break,
                                    Some(Ok(_)) => {
                                        // Binary, ping, pong and raw frames carry nothing for us
                                    }
                                    Some(Err(e)) => {
                                        run.emit(SocketEvent::Error(e.to_string()));
                                        break;
                                    }
                                }
                            }

                            _ = Self::tick(&mut heartbeat) => {
                                if pending_heartbeat.is_some() {
                                    tracing::warn!(
                                        target: targets::SOCKET,
                                        "Heartbeat timeout, closing connection"
                                    );
                                    break;
                                }
                                let heartbeat_ref = Self::next_ref(&ref_counter);
                                match Message::heartbeat(heartbeat_ref.clone()).encode() {
                                    Ok(text) => {
                                        if write.send(WsMessage::Text(text.into())).await.is_err() {
                                            break;
                                        }
                                        pending_heartbeat = Some(heartbeat_ref);
                                    }
                                    Err(e) => {
                                        tracing::error!(
                                            target: targets::SOCKET,
                                            "Failed to encode heartbeat: {}",
                                            e
                                        );
                                    }
                                }
                            }
                        }
                    }

                    tracing::debug!(target: targets::SOCKET, "Socket closed");
                    let still_active = run.publish(
                        |shared: &mut Shared| {
                            shared.command_tx = None;
                            shared.state = SocketState::Disconnected;
                        },
                        Some(SocketEvent::Close),
                    );
                    if closed_normally || !still_active {
                        run.finish();
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(target: targets::SOCKET, "Socket connection failed: {}", e);
                    run.emit(SocketEvent::Error(e.to_string()));
                }
            }

            let reconnect_config = match &config.reconnect {
                Some(cfg) if run.is_current() => cfg,
                _ => {
                    run.finish();
                    return;
                }
            };

            if let Some(max) = reconnect_config.max_attempts
                && reconnect_attempt >= max
            {
                tracing::error!(
                    target: targets::SOCKET,
                    "Max reconnection attempts ({}) reached",
                    max
                );
                run.emit(SocketEvent::Error(format!(
                    "Max reconnection attempts ({max}) reached"
                )));
                run.finish();
                return;
            }

            let delay = reconnect_config.delay_for_attempt(reconnect_attempt);
            if !run.set_state(SocketState::Reconnecting) {
                return;
            }
            tracing::debug!(target: targets::SOCKET, "Reconnecting in {:?}", delay);
            tokio::time::sleep(delay).await;

            if !run.is_current() {
                return;
            }

            reconnect_attempt += 1;
        }
    }
}

impl SocketTransport for PhoenixSocket {
    fn connect(&self) {
        let Some(runtime) = self.runtime.clone().or_else(|| Handle::try_current().ok()) else {
            tracing::error!(target: targets::SOCKET, "connect() called outside a tokio runtime");
            let _ = self
                .events_tx
                .send(SocketEvent::Error("no tokio runtime available".into()));
            return;
        };

        let id = {
            let mut shared = self.shared.lock();
            if shared.active_run.is_some() {
                return;
            }
            shared.next_run += 1;
            shared.active_run = Some(shared.next_run);
            shared.state = SocketState::Connecting;
            shared.next_run
        };

        let run = Run {
            id,
            shared: self.shared.clone(),
            events: self.events_tx.clone(),
        };
        runtime.spawn(Self::run(self.config.clone(), run, self.ref_counter.clone()));
    }

    /// Retire the current run. A live connection is closed and reported
    /// as [`SocketEvent::Close`] right away; the old task then winds down
    /// on its own without touching the socket again.
    fn disconnect(&self) {
        let mut shared = self.shared.lock();
        if shared.active_run.take().is_none() {
            return;
        }
        if let Some(tx) = shared.command_tx.take() {
            let _ = tx.send(Command::Close);
        }
        let was_connected = shared.state == SocketState::Connected;
        shared.state = SocketState::Disconnected;
        if was_connected {
            let _ = self.events_tx.send(SocketEvent::Close);
        }
    }

    fn make_ref(&self) -> String {
        Self::next_ref(&self.ref_counter)
    }

    fn push(&self, message: Message) -> Result<()> {
        let text = message.encode()?;
        let shared = self.shared.lock();
        match shared.command_tx.as_ref() {
            Some(tx) => tx
                .send(Command::Send(text))
                .map_err(|_| AbsintheError::Network("Not connected".into())),
            None => Err(AbsintheError::Network("Not connected".into())),
        }
    }

    fn is_connected(&self) -> bool {
        self.shared.lock().state == SocketState::Connected
    }
}

impl Drop for PhoenixSocket {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for PhoenixSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhoenixSocket")
            .field("endpoint", &self.config.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_connection_url_appends_params_and_version() {
        let mut params = Map::new();
        params.insert("token".into(), json!("abc"));
        params.insert("user_id".into(), json!(42));

        let url = SocketConfig::new("ws://localhost:4000/socket/websocket")
            .params(params)
            .connection_url()
            .unwrap();

        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.path(), "/socket/websocket");
        let pairs: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs.get("token").map(String::as_str), Some("abc"));
        assert_eq!(pairs.get("user_id").map(String::as_str), Some("42"));
        assert_eq!(pairs.get("vsn").map(String::as_str), Some(PROTOCOL_VERSION));
    }

    #[test]
    fn test_connection_url_maps_http_schemes() {
        let url = SocketConfig::new("https://example.com/socket/websocket")
            .connection_url()
            .unwrap();
        assert_eq!(url.scheme(), "wss");

        let url = SocketConfig::new("http://example.com/socket/websocket")
            .connection_url()
            .unwrap();
        assert_eq!(url.scheme(), "ws");
    }

    #[test]
    fn test_connection_url_rejects_bad_endpoints() {
        assert!(SocketConfig::new("not a url").connection_url().is_err());
        assert!(SocketConfig::new("ftp://example.com").connection_url().is_err());
    }

    #[test]
    fn test_params_provider_evaluated_per_attempt() {
        let counter = Arc::new(AtomicU64::new(0));
        let seen = counter.clone();
        let config = SocketConfig::new("ws://localhost:4000/socket").params_with(move || {
            let n = seen.fetch_add(1, Ordering::SeqCst);
            let mut params = Map::new();
            params.insert("attempt".into(), json!(n));
            params
        });

        let first = config.connection_url().unwrap();
        let second = config.connection_url().unwrap();
        assert!(first.as_str().contains("attempt=0"));
        assert!(second.as_str().contains("attempt=1"));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_reconnect_delay_grows_and_caps() {
        let config = ReconnectConfig::new()
            .initial_delay(Duration::from_millis(1000))
            .max_delay(Duration::from_secs(5))
            .backoff_multiplier(2.0);

        let first = config.delay_for_attempt(0);
        assert!(first >= Duration::from_millis(900) && first <= Duration::from_millis(1100));

        let capped = config.delay_for_attempt(10);
        assert!(capped >= Duration::from_millis(4500) && capped <= Duration::from_millis(5500));
    }

    #[test]
    fn test_refs_are_unique() {
        let socket = PhoenixSocket::new(SocketConfig::new("ws://localhost:4000/socket"));
        let a = socket.make_ref();
        let b = socket.make_ref();
        assert_ne!(a, b);
        assert_eq!(a, "1");
        assert_eq!(b, "2");
    }

    #[test]
    fn test_push_before_connect_fails() {
        let socket = PhoenixSocket::new(SocketConfig::new("ws://localhost:4000/socket"));
        assert_eq!(socket.state(), SocketState::Disconnected);
        assert!(!socket.is_connected());

        let result = socket.push(Message::heartbeat("1".into()));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_retires_run() {
        let socket = PhoenixSocket::new(SocketConfig::new("ws://127.0.0.1:9/socket"));
        socket.disconnect();
        assert_eq!(socket.state(), SocketState::Disconnected);

        socket.connect();
        assert_eq!(socket.state(), SocketState::Connecting);
        let first = socket.shared.lock().active_run;
        socket.connect();
        assert_eq!(socket.shared.lock().active_run, first);

        socket.disconnect();
        assert_eq!(socket.state(), SocketState::Disconnected);
        assert!(socket.shared.lock().active_run.is_none());

        socket.connect();
        let second = socket.shared.lock().active_run;
        assert!(second.is_some());
        assert_ne!(second, first);
        socket.disconnect();
    }

    #[test]
    fn test_events_taken_once() {
        let socket = PhoenixSocket::new(SocketConfig::new("ws://localhost:4000/socket"));
        assert!(socket.take_events().is_some());
        assert!(socket.take_events().is_none());
    }
}
