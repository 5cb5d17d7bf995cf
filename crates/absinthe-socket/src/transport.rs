//! The Absinthe transport.
//!
//! [`AbsintheTransport`] is the public face of the crate. It owns a
//! [`SocketTransport`], joins the Absinthe control channel whenever the
//! socket opens, queues operations until that join is acknowledged and
//! routes replies and subscription pushes back to the caller's callback.
//!
//! Completion callbacks never run on the receive path; they are posted to a
//! serial queue on the configured callback runtime.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::stream::Stream;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

use crate::callback::CallbackQueue;
use crate::channel::{ControlChannel, PushReply, ReplyHandler};
use crate::codec::{self, CONTROL_TOPIC, OutgoingPayload};
use crate::connection::{ConnectionState, ConnectionStateMachine};
use crate::error::{AbsintheError, Result};
use crate::graphql::{
    GraphQLOperation, GraphQLRequest, GraphQLResponse, INTROSPECTION_QUERY, OperationType,
};
use crate::logging::targets;
use crate::phoenix::{
    Message, PhoenixSocket, ReconnectConfig, SocketConfig, SocketEvent, SocketTransport, events,
};
use crate::registry::{Activation, PushHandler, SubscriptionRegistry};

/// Settings for the transport itself. Socket settings live in [`SocketConfig`].
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Connect the socket as soon as the transport is created.
    pub connect_on_init: bool,
    /// How long to wait for the control channel join reply.
    pub join_timeout: Duration,
    /// Backoff between failed join attempts on the same connection.
    pub rejoin: ReconnectConfig,
    /// How long to wait for the reply to a document. `None` waits until the
    /// connection goes away.
    pub request_timeout: Option<Duration>,
    /// Runtime that completion callbacks run on. Defaults to the runtime the
    /// transport was created on.
    pub callback_runtime: Option<Handle>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_on_init: true,
            join_timeout: Duration::from_secs(10),
            rejoin: ReconnectConfig::new()
                .initial_delay(Duration::from_secs(1))
                .max_delay(Duration::from_secs(10)),
            request_timeout: None,
            callback_runtime: None,
        }
    }
}

/// Builder for [`AbsintheTransport`].
#[derive(Debug)]
pub struct AbsintheTransportBuilder {
    socket: SocketConfig,
    config: TransportConfig,
}

impl AbsintheTransportBuilder {
    /// Create a builder for the given socket endpoint.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            socket: SocketConfig::new(endpoint),
            config: TransportConfig::default(),
        }
    }

    /// Use a fixed set of connection params.
    pub fn params(mut self, params: Map<String, Value>) -> Self {
        self.socket = self.socket.params(params);
        self
    }

    /// Compute connection params before every connection attempt.
    pub fn params_with(
        mut self,
        provider: impl Fn() -> Map<String, Value> + Send + Sync + 'static,
    ) -> Self {
        self.socket = self.socket.params_with(provider);
        self
    }

    /// Add a custom header for the WebSocket handshake.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.socket = self.socket.header(name, value);
        self
    }

    /// Set the heartbeat interval. `None` disables heartbeats.
    pub fn heartbeat_interval(mut self, interval: Option<Duration>) -> Self {
        self.socket = self.socket.heartbeat_interval(interval);
        self
    }

    /// Set the socket reconnect configuration. `None` disables reconnecting.
    pub fn reconnect(mut self, config: Option<ReconnectConfig>) -> Self {
        self.socket = self.socket.reconnect(config);
        self
    }

    /// Whether to connect as soon as the transport is built. Defaults to `true`.
    pub fn connect_on_init(mut self, connect: bool) -> Self {
        self.config.connect_on_init = connect;
        self
    }

    /// Set the control channel join timeout.
    pub fn join_timeout(mut self, timeout: Duration) -> Self {
        self.config.join_timeout = timeout;
        self
    }

    /// Set the backoff between failed join attempts.
    pub fn rejoin(mut self, config: ReconnectConfig) -> Self {
        self.config.rejoin = config;
        self
    }

    /// Fail documents whose reply does not arrive within `timeout`.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = Some(timeout);
        self
    }

    /// Run completion callbacks on `runtime`.
    pub fn callback_runtime(mut self, runtime: Handle) -> Self {
        self.config.callback_runtime = Some(runtime);
        self
    }

    /// Build the transport. Must be called inside a tokio runtime.
    pub fn build(self) -> Result<AbsintheTransport> {
        self.socket.connection_url()?;
        let socket = Arc::new(PhoenixSocket::new(self.socket));
        let events = socket
            .take_events()
            .ok_or_else(|| AbsintheError::Network("socket events already taken".into()))?;
        AbsintheTransport::with_socket(socket, events, self.config)
    }
}

/// Handle returned by [`AbsintheTransport::send`].
///
/// For subscriptions, [`cancel`](Self::cancel) unsubscribes; for queries and
/// mutations it does nothing. Cancelling is idempotent and does not keep the
/// transport alive.
#[derive(Clone, Debug)]
pub struct Cancellable {
    kind: CancelKind,
}

#[derive(Clone, Debug)]
enum CancelKind {
    Noop,
    Subscription {
        client_ref: String,
        transport: Weak<Inner>,
    },
}

impl Cancellable {
    fn noop() -> Self {
        Self {
            kind: CancelKind::Noop,
        }
    }

    /// Cancel the operation.
    pub fn cancel(&self) {
        if let CancelKind::Subscription {
            client_ref,
            transport,
        } = &self.kind
            && let Some(inner) = transport.upgrade()
        {
            inner.unsubscribe(client_ref);
        }
    }

    /// The client reference of a subscription, `None` for queries and mutations.
    pub fn client_ref(&self) -> Option<&str> {
        match &self.kind {
            CancelKind::Noop => None,
            CancelKind::Subscription { client_ref, .. } => Some(client_ref),
        }
    }

    /// Whether cancelling does nothing.
    pub fn is_noop(&self) -> bool {
        matches!(self.kind, CancelKind::Noop)
    }
}

/// A stream of subscription results.
///
/// Ends once the subscription can no longer produce results: after it is
/// stopped, after a failed start, or when the connection is torn down.
/// Dropping the stream unsubscribes.
pub struct SubscriptionStream<T = Value> {
    receiver: mpsc::UnboundedReceiver<Result<GraphQLResponse<T>>>,
    handle: Option<Cancellable>,
    client_ref: String,
}

impl<T> SubscriptionStream<T> {
    /// Wait for the next result.
    pub async fn next(&mut self) -> Option<Result<GraphQLResponse<T>>> {
        self.receiver.recv().await
    }

    /// Unsubscribe. Results already delivered can still be read.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.cancel();
        }
    }

    /// The client reference of this subscription.
    pub fn client_ref(&self) -> &str {
        &self.client_ref
    }
}

impl<T> Stream for SubscriptionStream<T> {
    type Item = Result<GraphQLResponse<T>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

impl<T> Drop for SubscriptionStream<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<T> std::fmt::Debug for SubscriptionStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionStream")
            .field("client_ref", &self.client_ref)
            .field("active", &self.handle.is_some())
            .finish()
    }
}

/// Deferred work that needs the joined control channel.
type OutgoingAction = Box<dyn FnOnce(&Inner, &mut ControlChannel) + Send>;

/// Delivers one result to the caller's callback through the callback queue.
type Completion<T> = Arc<dyn Fn(Result<GraphQLResponse<T>>) + Send + Sync>;

struct TransportState {
    connection: ConnectionStateMachine<OutgoingAction>,
    channel: ControlChannel,
    /// Bumped on every teardown; timers from an older connection are ignored.
    epoch: u64,
    join_attempt: u32,
}

struct Inner {
    me: Weak<Inner>,
    socket: Arc<dyn SocketTransport>,
    config: TransportConfig,
    runtime: Handle,
    callbacks: CallbackQueue,
    registry: SubscriptionRegistry,
    state: Mutex<TransportState>,
    debug: AtomicBool,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Inner")
            .field("connection", &state.connection.state())
            .field("queued", &state.connection.queued())
            .field("channel", &state.channel)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn handle_event(&self, event: SocketEvent) {
        match event {
            SocketEvent::Open => {
                tracing::debug!(
                    target: targets::TRANSPORT,
                    "Socket open, joining {}",
                    CONTROL_TOPIC
                );
                let mut state = self.state.lock();
                if state.connection.begin_join() {
                    self.issue_join(&mut state);
                }
            }
            SocketEvent::Close => self.reset("socket closed"),
            SocketEvent::Error(error) => {
                tracing::warn!(target: targets::TRANSPORT, "Socket error: {}", error);
            }
            SocketEvent::Message(message) => self.handle_message(message),
        }
    }

    fn handle_message(&self, message: Message) {
        if self.debug.load(Ordering::Relaxed) {
            tracing::debug!(
                target: targets::TRANSPORT,
                topic = %message.topic,
                event = %message.event,
                msg_ref = ?message.msg_ref,
                status = ?message.status(),
                payload = %message.payload,
                "Incoming message"
            );
        }

        if message.is_reply() {
            let handler = self.state.lock().channel.take_reply(&message);
            match handler {
                Some(handler) => handler(PushReply::Received(message.payload)),
                None => tracing::debug!(
                    target: targets::TRANSPORT,
                    "Dropping reply for unknown ref {:?} on {}",
                    message.msg_ref,
                    message.topic
                ),
            }
            return;
        }

        if message.event == codec::events::SUBSCRIPTION_DATA {
            self.registry.dispatch(&message.topic, &message.payload);
            return;
        }

        if message.topic == CONTROL_TOPIC
            && (message.event == events::ERROR || message.event == events::CLOSE)
        {
            tracing::warn!(
                target: targets::CHANNEL,
                "Control channel reported {}: {}",
                message.event,
                message.payload
            );
            return;
        }

        tracing::debug!(
            target: targets::TRANSPORT,
            "Ignoring {} on {}",
            message.event,
            message.topic
        );
    }

    /// Push a join frame. Called with the state lock held.
    fn issue_join(&self, state: &mut TransportState) {
        let msg_ref = self.socket.make_ref();
        let me = self.me.clone();
        let epoch = state.epoch;
        let message = state.channel.join(
            msg_ref.clone(),
            Box::new(move |reply: PushReply| {
                if let Some(inner) = me.upgrade() {
                    inner.handle_join_reply(epoch, reply);
                }
            }),
        );
        self.send_frame(message);
        self.schedule_timeout(msg_ref, self.config.join_timeout);
    }

    fn handle_join_reply(&self, epoch: u64, reply: PushReply) {
        if reply.status() == Some("ok") {
            let mut state = self.state.lock();
            if state.epoch != epoch {
                return;
            }
            state.join_attempt = 0;
            let actions = state.connection.join_acknowledged();
            tracing::debug!(
                target: targets::CHANNEL,
                "Joined {}, sending {} queued operations",
                CONTROL_TOPIC,
                actions.len()
            );
            let channel = &mut state.channel;
            for action in actions {
                action(self, channel);
            }
            return;
        }

        match &reply {
            PushReply::Received(payload) => tracing::warn!(
                target: targets::CHANNEL,
                "Error while joining {}: {}",
                CONTROL_TOPIC,
                payload
            ),
            PushReply::TimedOut => tracing::warn!(
                target: targets::CHANNEL,
                "Timed out joining {}",
                CONTROL_TOPIC
            ),
        }
        self.schedule_rejoin(epoch);
    }

    fn schedule_rejoin(&self, epoch: u64) {
        let delay = {
            let mut state = self.state.lock();
            if state.epoch != epoch {
                return;
            }
            let delay = self.config.rejoin.delay_for_attempt(state.join_attempt);
            state.join_attempt = state.join_attempt.saturating_add(1);
            delay
        };

        tracing::debug!(target: targets::CHANNEL, "Rejoining in {:?}", delay);
        let me = self.me.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = me.upgrade() else {
                return;
            };
            let mut state = inner.state.lock();
            if state.epoch == epoch && state.connection.can_rejoin() && inner.socket.is_connected()
            {
                inner.issue_join(&mut state);
            }
        });
    }

    /// Push `payload` on the control topic. Called with the state lock held.
    fn push_frame(
        &self,
        channel: &mut ControlChannel,
        msg_ref: String,
        payload: OutgoingPayload,
        timeout: Option<Duration>,
        handler: ReplyHandler,
    ) {
        let event = payload.event();
        let message = channel.push(msg_ref.clone(), event, payload.into_value(), handler);
        self.send_frame(message);
        if let Some(timeout) = timeout {
            self.schedule_timeout(msg_ref, timeout);
        }
    }

    fn send_frame(&self, message: Message) {
        if self.debug.load(Ordering::Relaxed) {
            tracing::debug!(
                target: targets::TRANSPORT,
                topic = %message.topic,
                event = %message.event,
                msg_ref = ?message.msg_ref,
                payload = %message.payload,
                "Outgoing message"
            );
        }
        if let Err(e) = self.socket.push(message) {
            tracing::warn!(target: targets::TRANSPORT, "Failed to push frame: {}", e);
        }
    }

    fn schedule_timeout(&self, msg_ref: String, timeout: Duration) {
        let me = self.me.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = me.upgrade() else {
                return;
            };
            let handler = inner.state.lock().channel.take_expired(&msg_ref);
            if let Some(handler) = handler {
                handler(PushReply::TimedOut);
            }
        });
    }

    fn enqueue_or_send(&self, action: OutgoingAction) {
        let mut state = self.state.lock();
        if let Some(action) = state.connection.enqueue_or_send(action) {
            action(self, &mut state.channel);
        }
    }

    fn handle_subscription_reply<O: GraphQLOperation>(
        &self,
        msg_ref: &str,
        client_ref: &str,
        operation: &Arc<O>,
        complete: &Completion<O::Data>,
        reply: PushReply,
    ) {
        let payload = match reply {
            PushReply::Received(payload) => payload,
            PushReply::TimedOut => {
                self.registry.forget(client_ref);
                self.unsubscribe_late_confirmation(msg_ref);
                complete(Err(AbsintheError::Network(
                    "timed out waiting for subscription reply".into(),
                )));
                return;
            }
        };

        if payload.get("status").and_then(Value::as_str) != Some("ok") {
            self.registry.forget(client_ref);
            complete(codec::decode_result(operation.as_ref(), &payload));
            return;
        }

        let server_id = match codec::decode_subscription_start(&payload) {
            Ok(server_id) => server_id,
            Err(e) => {
                self.registry.forget(client_ref);
                complete(Err(e));
                return;
            }
        };

        let handler: PushHandler = {
            let operation = operation.clone();
            let complete = complete.clone();
            Arc::new(move |push: &Value| {
                complete(codec::decode_subscription_push(operation.as_ref(), push))
            })
        };

        match self.registry.activate(client_ref, &server_id, handler) {
            Activation::Active => tracing::debug!(
                target: targets::TRANSPORT,
                "Subscription {} active as {}",
                client_ref,
                server_id
            ),
            Activation::Cancelled => self.send_unsubscribe(server_id),
        }
    }

    /// Watch for a confirmation that arrives after the subscription request
    /// timed out and unsubscribe it right away.
    ///
    /// The watch lasts until the reply arrives or the connection is reset.
    fn unsubscribe_late_confirmation(&self, msg_ref: &str) {
        let me = self.me.clone();
        let handler: ReplyHandler = Box::new(move |reply: PushReply| {
            let Some(inner) = me.upgrade() else {
                return;
            };
            let PushReply::Received(payload) = reply else {
                return;
            };
            if payload.get("status").and_then(Value::as_str) != Some("ok") {
                return;
            }
            match codec::decode_subscription_start(&payload) {
                Ok(server_id) => {
                    tracing::debug!(
                        target: targets::TRANSPORT,
                        "Subscription {} confirmed after timeout",
                        server_id
                    );
                    inner.send_unsubscribe(server_id);
                }
                Err(e) => tracing::debug!(
                    target: targets::TRANSPORT,
                    "Ignoring late subscription reply: {}",
                    e
                ),
            }
        });
        self.state.lock().channel.watch(msg_ref.to_string(), handler);
    }

    fn unsubscribe(&self, client_ref: &str) {
        if let Some(server_id) = self.registry.mark_cancelled(client_ref) {
            self.send_unsubscribe(server_id);
        }
    }

    fn send_unsubscribe(&self, server_id: String) {
        tracing::debug!(target: targets::TRANSPORT, "Unsubscribing {}", server_id);
        self.enqueue_or_send(Box::new(
            move |inner: &Inner, channel: &mut ControlChannel| {
                let payload = codec::encode_unsubscribe(&server_id);
                inner.push_frame(
                    channel,
                    inner.socket.make_ref(),
                    payload,
                    inner.config.request_timeout,
                    Box::new(move |reply: PushReply| {
                        if reply.status() != Some("ok") {
                            tracing::warn!(
                                target: targets::TRANSPORT,
                                "Unsubscribe from {} failed: {:?}",
                                server_id,
                                reply
                            );
                        }
                    }),
                );
            },
        ));
    }

    /// Tear down per-connection state. Abandoned callbacks are never invoked.
    fn reset(&self, reason: &str) {
        let dropped = {
            let mut state = self.state.lock();
            state.epoch = state.epoch.wrapping_add(1);
            state.join_attempt = 0;
            state.channel.reset();
            state.connection.reset()
        };
        self.registry.clear();
        tracing::debug!(
            target: targets::TRANSPORT,
            "Transport reset ({}), dropped {} queued operations",
            reason,
            dropped
        );
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.socket.disconnect();
    }
}

/// GraphQL over an Absinthe Phoenix channel.
///
/// Cloning is cheap; all clones share one connection. The connection is
/// closed when the last clone is dropped.
///
/// # Example
///
/// ```ignore
/// use absinthe_socket::{AbsintheTransport, GraphQLRequest};
///
/// let transport = AbsintheTransport::builder("wss://example.com/socket/websocket")
///     .build()?;
///
/// let response = transport
///     .execute(GraphQLRequest::query("{ posts { id title } }"))
///     .await?;
///
/// let mut comments = transport.subscribe(
///     GraphQLRequest::subscription("subscription { commentAdded { id body } }"),
/// )?;
/// while let Some(result) = comments.next().await {
///     println!("{:?}", result?.data);
/// }
/// ```
#[derive(Clone)]
pub struct AbsintheTransport {
    inner: Arc<Inner>,
}

impl AbsintheTransport {
    /// Create a transport with default settings. Connects immediately.
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        Self::builder(endpoint).build()
    }

    /// Create a transport with fixed connection params. Connects immediately.
    pub fn with_params(endpoint: impl Into<String>, params: Map<String, Value>) -> Result<Self> {
        Self::builder(endpoint).params(params).build()
    }

    /// Create a builder for the given socket endpoint.
    pub fn builder(endpoint: impl Into<String>) -> AbsintheTransportBuilder {
        AbsintheTransportBuilder::new(endpoint)
    }

    /// Create a transport over any socket implementation.
    ///
    /// `events` must be the receiver the socket reports its events on.
    /// Must be called inside a tokio runtime.
    pub fn with_socket(
        socket: Arc<dyn SocketTransport>,
        events: mpsc::UnboundedReceiver<SocketEvent>,
        config: TransportConfig,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| {
            AbsintheError::Network(
                "AbsintheTransport must be created inside a tokio runtime".into(),
            )
        })?;
        let callbacks = CallbackQueue::new(config.callback_runtime.as_ref().unwrap_or(&runtime));
        let connect = config.connect_on_init;

        let inner = Arc::new_cyclic(|me| Inner {
            me: me.clone(),
            socket,
            config,
            runtime: runtime.clone(),
            callbacks,
            registry: SubscriptionRegistry::new(),
            state: Mutex::new(TransportState {
                connection: ConnectionStateMachine::new(),
                channel: ControlChannel::new(),
                epoch: 0,
                join_attempt: 0,
            }),
            debug: AtomicBool::new(false),
        });

        Self::spawn_receive_loop(&runtime, Arc::downgrade(&inner), events);
        if connect {
            inner.socket.connect();
        }
        Ok(Self { inner })
    }

    fn spawn_receive_loop(
        runtime: &Handle,
        inner: Weak<Inner>,
        mut events: mpsc::UnboundedReceiver<SocketEvent>,
    ) {
        runtime.spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.handle_event(event);
            }
            tracing::debug!(target: targets::TRANSPORT, "Receive loop finished");
        });
    }

    /// Start connecting the socket. Joining follows automatically.
    pub fn connect(&self) {
        self.inner.socket.connect();
    }

    /// Close the socket and abandon everything in flight.
    ///
    /// Pending callbacks are dropped without being invoked.
    pub fn disconnect(&self) {
        self.inner.socket.disconnect();
        self.inner.reset("disconnect requested");
    }

    /// Log every incoming and outgoing frame at debug level.
    pub fn enable_debug(&self) {
        self.inner.debug.store(true, Ordering::Relaxed);
    }

    /// Send an operation. `callback` receives the result.
    ///
    /// Queries and mutations invoke `callback` exactly once and return a
    /// no-op [`Cancellable`]. Subscriptions invoke it once per push, or once
    /// with an error if the subscription could not start; cancelling stops
    /// further invocations. If the connection goes away first, `callback` is
    /// never invoked.
    pub fn send<O, F>(&self, operation: O, callback: F) -> Cancellable
    where
        O: GraphQLOperation,
        F: FnMut(Result<GraphQLResponse<O::Data>>) + Send + 'static,
    {
        let operation = Arc::new(operation);
        let complete = self.completion(callback);

        match operation.operation_type() {
            OperationType::Query | OperationType::Mutation => {
                self.inner.enqueue_or_send(Box::new(
                    move |inner: &Inner, channel: &mut ControlChannel| {
                        let payload = codec::encode(operation.as_ref());
                        inner.push_frame(
                            channel,
                            inner.socket.make_ref(),
                            payload,
                            inner.config.request_timeout,
                            Box::new(move |reply: PushReply| match reply {
                                PushReply::Received(payload) => {
                                    complete(codec::decode_result(operation.as_ref(), &payload))
                                }
                                PushReply::TimedOut => complete(Err(AbsintheError::Network(
                                    "timed out waiting for reply".into(),
                                ))),
                            }),
                        );
                    },
                ));
                Cancellable::noop()
            }
            OperationType::Subscription => {
                let client_ref = self.inner.socket.make_ref();
                self.inner.registry.reserve(&client_ref);

                let reply_ref = client_ref.clone();
                self.inner.enqueue_or_send(Box::new(
                    move |inner: &Inner, channel: &mut ControlChannel| {
                        let payload = codec::encode(operation.as_ref());
                        let msg_ref = inner.socket.make_ref();
                        let me = inner.me.clone();
                        let handler_ref = msg_ref.clone();
                        inner.push_frame(
                            channel,
                            msg_ref,
                            payload,
                            inner.config.request_timeout,
                            Box::new(move |reply: PushReply| {
                                if let Some(inner) = me.upgrade() {
                                    inner.handle_subscription_reply(
                                        &handler_ref,
                                        &reply_ref,
                                        &operation,
                                        &complete,
                                        reply,
                                    );
                                }
                            }),
                        );
                    },
                ));

                Cancellable {
                    kind: CancelKind::Subscription {
                        client_ref,
                        transport: Arc::downgrade(&self.inner),
                    },
                }
            }
        }
    }

    fn completion<T, F>(&self, callback: F) -> Completion<T>
    where
        T: Send + 'static,
        F: FnMut(Result<GraphQLResponse<T>>) + Send + 'static,
    {
        let callbacks = self.inner.callbacks.clone();
        let callback = Arc::new(Mutex::new(callback));
        Arc::new(move |result: Result<GraphQLResponse<T>>| {
            let callback = callback.clone();
            callbacks.post(move || {
                let mut callback = callback.lock();
                (*callback)(result);
            });
        })
    }

    /// Cancel the operation behind `handle`.
    pub fn cancel(&self, handle: &Cancellable) {
        if let Some(client_ref) = handle.client_ref() {
            self.unsubscribe(client_ref);
        }
    }

    /// Unsubscribe by client reference.
    ///
    /// An active subscription is unsubscribed on the server. A subscription
    /// still awaiting its reply is unsubscribed as soon as the reply arrives.
    /// Unknown references are ignored.
    pub fn unsubscribe(&self, client_ref: &str) {
        self.inner.unsubscribe(client_ref);
    }

    /// Run a query or mutation and wait for its result.
    ///
    /// Fails with a network error if the connection goes away before the
    /// reply arrives.
    pub async fn execute<O: GraphQLOperation>(
        &self,
        operation: O,
    ) -> Result<GraphQLResponse<O::Data>> {
        if operation.operation_type() == OperationType::Subscription {
            return Err(AbsintheError::InvalidOperation(
                "use subscribe() for subscription operations".into(),
            ));
        }

        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        self.send(operation, move |result| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(result);
            }
        });

        rx.await.map_err(|_| {
            AbsintheError::Network("connection closed before the reply arrived".into())
        })?
    }

    /// Start a subscription and receive its results as a stream.
    pub fn subscribe<O: GraphQLOperation>(
        &self,
        operation: O,
    ) -> Result<SubscriptionStream<O::Data>> {
        if operation.operation_type() != OperationType::Subscription {
            return Err(AbsintheError::InvalidOperation(
                "use execute() for queries and mutations".into(),
            ));
        }

        let (tx, receiver) = mpsc::unbounded_channel();
        let handle = self.send(operation, move |result| {
            let _ = tx.send(result);
        });
        let client_ref = handle.client_ref().unwrap_or_default().to_string();

        Ok(SubscriptionStream {
            receiver,
            handle: Some(handle),
            client_ref,
        })
    }

    /// Fetch the schema using introspection.
    pub async fn introspect(&self) -> Result<GraphQLResponse> {
        self.execute(GraphQLRequest::query(INTROSPECTION_QUERY)).await
    }

    /// Join state of the control channel.
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.lock().connection.state()
    }

    /// Whether the socket currently has an open connection.
    pub fn is_connected(&self) -> bool {
        self.inner.socket.is_connected()
    }

    /// Number of operations waiting for the control channel join.
    pub fn queued_operations(&self) -> usize {
        self.inner.state.lock().connection.queued()
    }

    /// Number of confirmed, active subscriptions.
    pub fn active_subscriptions(&self) -> usize {
        self.inner.registry.active_len()
    }
}

impl std::fmt::Debug for AbsintheTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbsintheTransport")
            .field("connection", &self.connection_state())
            .field("queued", &self.queued_operations())
            .field("active_subscriptions", &self.active_subscriptions())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, AtomicUsize};

    #[derive(Default)]
    struct MockSocket {
        sent: Mutex<Vec<Message>>,
        refs: AtomicU64,
        connected: AtomicBool,
        connects: AtomicUsize,
    }

    impl SocketTransport for MockSocket {
        fn connect(&self) {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.connected.store(true, Ordering::SeqCst);
        }

        fn disconnect(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }

        fn make_ref(&self) -> String {
            (self.refs.fetch_add(1, Ordering::SeqCst) + 1).to_string()
        }

        fn push(&self, message: Message) -> Result<()> {
            self.sent.lock().push(message);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    impl MockSocket {
        fn sent_events(&self) -> Vec<String> {
            self.sent.lock().iter().map(|m| m.event.clone()).collect()
        }

        fn last(&self, event: &str) -> Message {
            self.sent
                .lock()
                .iter()
                .rev()
                .find(|m| m.event == event)
                .cloned()
                .unwrap()
        }
    }

    struct Harness {
        transport: AbsintheTransport,
        socket: Arc<MockSocket>,
        _events: mpsc::UnboundedSender<SocketEvent>,
    }

    impl Harness {
        fn new(config: TransportConfig) -> Self {
            let socket = Arc::new(MockSocket::default());
            let (events, rx) = mpsc::unbounded_channel();
            let transport = AbsintheTransport::with_socket(socket.clone(), rx, config).unwrap();
            Self {
                transport,
                socket,
                _events: events,
            }
        }

        fn unconnected() -> Self {
            Self::new(TransportConfig {
                connect_on_init: false,
                ..TransportConfig::default()
            })
        }

        fn event(&self, event: SocketEvent) {
            self.transport.inner.handle_event(event);
        }

        fn reply(&self, to: &Message, status: &str, response: Value) {
            self.event(SocketEvent::Message(Message::new(
                CONTROL_TOPIC,
                events::REPLY,
                json!({"status": status, "response": response}),
                to.msg_ref.clone(),
                to.join_ref.clone(),
            )));
        }

        fn push(&self, server_id: &str, payload: Value) {
            self.event(SocketEvent::Message(Message::new(
                server_id,
                codec::events::SUBSCRIPTION_DATA,
                payload,
                None,
                None,
            )));
        }

        /// Open the socket and acknowledge the join.
        fn join(&self) {
            self.socket.connected.store(true, Ordering::SeqCst);
            self.event(SocketEvent::Open);
            let join = self.socket.last(events::JOIN);
            self.reply(&join, "ok", json!({}));
        }
    }

    type Results = mpsc::UnboundedReceiver<Result<GraphQLResponse>>;

    fn collector() -> (
        impl FnMut(Result<GraphQLResponse>) + Send + 'static,
        Results,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            move |result| {
                let _ = tx.send(result);
            },
            rx,
        )
    }

    async fn next(results: &mut Results) -> Option<Result<GraphQLResponse>> {
        tokio::time::timeout(Duration::from_secs(1), results.recv())
            .await
            .unwrap()
    }

    const COMMENT_ADDED: &str = "subscription { commentAdded { id } }";

    #[tokio::test]
    async fn test_connect_on_init() {
        let harness = Harness::new(TransportConfig::default());
        assert_eq!(harness.socket.connects.load(Ordering::SeqCst), 1);

        let harness = Harness::unconnected();
        assert_eq!(harness.socket.connects.load(Ordering::SeqCst), 0);
        harness.transport.connect();
        assert_eq!(harness.socket.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_join_on_open() {
        let harness = Harness::unconnected();
        harness.event(SocketEvent::Open);

        let join = harness.socket.last(events::JOIN);
        assert_eq!(join.topic, CONTROL_TOPIC);
        assert_eq!(join.msg_ref, join.join_ref);
        assert_eq!(harness.transport.connection_state(), ConnectionState::Joining);

        harness.reply(&join, "ok", json!({}));
        assert_eq!(harness.transport.connection_state(), ConnectionState::Joined);
    }

    #[tokio::test]
    async fn test_subscription_lifecycle() {
        let harness = Harness::unconnected();
        let (callback, mut results) = collector();

        let handle = harness
            .transport
            .send(GraphQLRequest::subscription(COMMENT_ADDED), callback);
        assert!(!handle.is_noop());
        assert_eq!(harness.transport.queued_operations(), 1);
        assert!(harness.socket.sent.lock().is_empty());

        harness.join();
        assert_eq!(harness.transport.queued_operations(), 0);
        let doc = harness.socket.last(codec::events::DOC);
        assert_eq!(doc.payload, json!({"query": COMMENT_ADDED}));

        harness.reply(&doc, "ok", json!({"subscriptionId": "s1"}));
        assert_eq!(harness.transport.active_subscriptions(), 1);

        harness.push("s1", json!({"result": {"data": {"commentAdded": {"id": "c1"}}}}));
        let response = next(&mut results).await.unwrap().unwrap();
        assert_eq!(response.data.unwrap()["commentAdded"]["id"], "c1");

        handle.cancel();
        let unsubscribe = harness.socket.last(codec::events::UNSUBSCRIBE);
        assert_eq!(unsubscribe.payload, json!({"subscriptionId": "s1"}));
        assert!(harness.transport.inner.registry.is_empty());

        // late pushes are dropped and the callback goes away
        harness.push("s1", json!({"result": {"data": {}}}));
        assert!(next(&mut results).await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_before_reply_unsubscribes_once() {
        let harness = Harness::unconnected();
        harness.join();
        let (callback, mut results) = collector();

        let handle = harness
            .transport
            .send(GraphQLRequest::subscription(COMMENT_ADDED), callback);
        let doc = harness.socket.last(codec::events::DOC);

        handle.cancel();
        handle.cancel();
        assert!(!harness.socket.sent_events().contains(&"unsubscribe".to_string()));

        harness.reply(&doc, "ok", json!({"subscriptionId": "s2"}));
        let unsubscribe = harness.socket.last(codec::events::UNSUBSCRIBE);
        assert_eq!(unsubscribe.payload, json!({"subscriptionId": "s2"}));
        let unsubscribes = harness
            .socket
            .sent_events()
            .iter()
            .filter(|e| *e == "unsubscribe")
            .count();
        assert_eq!(unsubscribes, 1);

        assert_eq!(harness.transport.active_subscriptions(), 0);
        assert!(harness.transport.inner.registry.is_empty());
        assert!(next(&mut results).await.is_none());
    }

    #[tokio::test]
    async fn test_subscription_error_reply() {
        let harness = Harness::unconnected();
        harness.join();
        let (callback, mut results) = collector();

        let handle = harness
            .transport
            .send(GraphQLRequest::subscription(COMMENT_ADDED), callback);
        let doc = harness.socket.last(codec::events::DOC);
        harness.reply(
            &doc,
            "error",
            json!({"errors": [{"message": "unknown field"}]}),
        );

        let err = next(&mut results).await.unwrap().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Query);
        assert_eq!(err.graphql_errors()[0].message, "unknown field");
        assert!(next(&mut results).await.is_none());
        assert!(harness.transport.inner.registry.is_untracked(handle.client_ref().unwrap()));
    }

    #[tokio::test]
    async fn test_subscription_reply_without_id() {
        let harness = Harness::unconnected();
        harness.join();
        let (callback, mut results) = collector();

        harness
            .transport
            .send(GraphQLRequest::subscription(COMMENT_ADDED), callback);
        let doc = harness.socket.last(codec::events::DOC);
        harness.reply(&doc, "ok", json!({}));

        let err = next(&mut results).await.unwrap().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Parse);
        assert!(harness.transport.inner.registry.is_empty());
    }

    #[tokio::test]
    async fn test_query_reply() {
        let harness = Harness::unconnected();
        harness.join();
        let (callback, mut results) = collector();

        let handle = harness
            .transport
            .send(GraphQLRequest::query("{ posts { id } }"), callback);
        assert!(handle.is_noop());
        handle.cancel();

        let doc = harness.socket.last(codec::events::DOC);
        harness.reply(&doc, "ok", json!({"data": {"posts": [{"id": "p1"}]}}));

        let response = next(&mut results).await.unwrap().unwrap();
        assert_eq!(response.data.unwrap()["posts"][0]["id"], "p1");
        // exactly once
        assert!(next(&mut results).await.is_none());
    }

    #[tokio::test]
    async fn test_query_error_reply() {
        let harness = Harness::unconnected();
        harness.join();
        let (callback, mut results) = collector();

        harness
            .transport
            .send(GraphQLRequest::mutation("mutation { boom }"), callback);
        let doc = harness.socket.last(codec::events::DOC);
        harness.reply(&doc, "error", json!({"errors": [{"message": "denied"}]}));

        let err = next(&mut results).await.unwrap().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Query);
    }

    #[tokio::test]
    async fn test_queue_flushes_in_order() {
        let harness = Harness::unconnected();
        for i in 0..3 {
            harness
                .transport
                .send(GraphQLRequest::query(format!("{{ item{i} }}")), |_| {});
        }
        assert_eq!(harness.transport.queued_operations(), 3);

        harness.join();
        let queries: Vec<Value> = harness
            .socket
            .sent
            .lock()
            .iter()
            .filter(|m| m.event == codec::events::DOC)
            .map(|m| m.payload["query"].clone())
            .collect();
        assert_eq!(queries, vec![json!("{ item0 }"), json!("{ item1 }"), json!("{ item2 }")]);
    }

    #[tokio::test]
    async fn test_disconnect_abandons_callbacks() {
        let harness = Harness::unconnected();
        let (queued, mut queued_results) = collector();
        harness
            .transport
            .send(GraphQLRequest::query("{ queued }"), queued);

        harness.join();
        let (sub, mut sub_results) = collector();
        harness
            .transport
            .send(GraphQLRequest::subscription(COMMENT_ADDED), sub);
        let doc = harness.socket.last(codec::events::DOC);
        harness.reply(&doc, "ok", json!({"subscriptionId": "s1"}));

        harness.transport.disconnect();
        assert_eq!(harness.transport.connection_state(), ConnectionState::Unjoined);
        assert!(harness.transport.inner.registry.is_empty());
        assert_eq!(harness.transport.inner.state.lock().channel.pending_len(), 0);

        // callbacks are dropped, never invoked
        assert!(next(&mut queued_results).await.is_none());
        assert!(next(&mut sub_results).await.is_none());
    }

    #[tokio::test]
    async fn test_close_then_reopen_rejoins() {
        let harness = Harness::unconnected();
        harness.join();
        harness.event(SocketEvent::Close);
        assert_eq!(harness.transport.connection_state(), ConnectionState::Unjoined);

        harness
            .transport
            .send(GraphQLRequest::query("{ again }"), |_| {});
        assert_eq!(harness.transport.queued_operations(), 1);

        harness.join();
        let joins = harness
            .socket
            .sent_events()
            .iter()
            .filter(|e| *e == events::JOIN)
            .count();
        assert_eq!(joins, 2);
        assert_eq!(harness.transport.queued_operations(), 0);
    }

    #[tokio::test]
    async fn test_join_error_schedules_rejoin() {
        let harness = Harness::new(TransportConfig {
            connect_on_init: false,
            rejoin: ReconnectConfig::new()
                .initial_delay(Duration::from_millis(10))
                .max_delay(Duration::from_millis(20)),
            ..TransportConfig::default()
        });
        harness.socket.connected.store(true, Ordering::SeqCst);
        harness
            .transport
            .send(GraphQLRequest::query("{ waiting }"), |_| {});

        harness.event(SocketEvent::Open);
        let join = harness.socket.last(events::JOIN);
        harness.reply(&join, "error", json!({"reason": "unauthorized"}));
        assert_eq!(harness.transport.connection_state(), ConnectionState::Joining);
        assert_eq!(harness.transport.queued_operations(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let rejoin = harness.socket.last(events::JOIN);
        assert_ne!(rejoin.msg_ref, join.msg_ref);

        harness.reply(&rejoin, "ok", json!({}));
        assert_eq!(harness.transport.connection_state(), ConnectionState::Joined);
        assert_eq!(harness.transport.queued_operations(), 0);
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let harness = Harness::new(TransportConfig {
            connect_on_init: false,
            request_timeout: Some(Duration::from_millis(20)),
            ..TransportConfig::default()
        });
        harness.join();
        let (callback, mut results) = collector();
        harness
            .transport
            .send(GraphQLRequest::query("{ slow }"), callback);

        let err = next(&mut results).await.unwrap().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Network);

        // a late reply finds no handler
        let doc = harness.socket.last(codec::events::DOC);
        harness.reply(&doc, "ok", json!({"data": {}}));
        assert!(next(&mut results).await.is_none());
    }

    #[tokio::test]
    async fn test_subscription_confirmed_after_timeout_is_unsubscribed() {
        let harness = Harness::new(TransportConfig {
            connect_on_init: false,
            request_timeout: Some(Duration::from_millis(20)),
            ..TransportConfig::default()
        });
        harness.join();
        let (callback, mut results) = collector();
        let handle = harness
            .transport
            .send(GraphQLRequest::subscription(COMMENT_ADDED), callback);

        let err = next(&mut results).await.unwrap().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Network);
        assert!(harness.transport.inner.registry.is_untracked(handle.client_ref().unwrap()));

        let doc = harness.socket.last(codec::events::DOC);
        harness.reply(&doc, "ok", json!({"subscriptionId": "s9"}));
        let unsubscribe = harness.socket.last(codec::events::UNSUBSCRIBE);
        assert_eq!(unsubscribe.payload, json!({"subscriptionId": "s9"}));
        assert_eq!(harness.transport.active_subscriptions(), 0);

        harness.push("s9", json!({"result": {"data": {}}}));
        assert!(next(&mut results).await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_while_queued_unsubscribes_after_join() {
        let harness = Harness::unconnected();
        let (callback, mut results) = collector();
        let handle = harness
            .transport
            .send(GraphQLRequest::subscription(COMMENT_ADDED), callback);
        assert_eq!(harness.transport.queued_operations(), 1);

        handle.cancel();
        assert!(harness.socket.sent.lock().is_empty());

        harness.join();
        let doc = harness.socket.last(codec::events::DOC);
        harness.reply(&doc, "ok", json!({"subscriptionId": "s3"}));

        let unsubscribes: Vec<Message> = harness
            .socket
            .sent
            .lock()
            .iter()
            .filter(|m| m.event == codec::events::UNSUBSCRIBE)
            .cloned()
            .collect();
        assert_eq!(unsubscribes.len(), 1);
        assert_eq!(unsubscribes[0].payload, json!({"subscriptionId": "s3"}));
        assert_eq!(harness.transport.active_subscriptions(), 0);
        assert!(harness.transport.inner.registry.is_empty());
        assert!(next(&mut results).await.is_none());
    }

    #[tokio::test]
    async fn test_execute_and_subscribe_check_operation_type() {
        let harness = Harness::unconnected();
        let err = harness
            .transport
            .execute(GraphQLRequest::subscription(COMMENT_ADDED))
            .await
            .unwrap_err();
        assert!(matches!(err, AbsintheError::InvalidOperation(_)));

        let err = harness
            .transport
            .subscribe(GraphQLRequest::query("{ posts }"))
            .unwrap_err();
        assert!(matches!(err, AbsintheError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn test_execute_fails_on_disconnect() {
        let harness = Harness::unconnected();
        let transport = harness.transport.clone();
        let pending = tokio::spawn(async move {
            transport.execute(GraphQLRequest::query("{ posts }")).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        harness.transport.disconnect();

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Network);
    }

    #[tokio::test]
    async fn test_subscription_stream_stop() {
        let harness = Harness::unconnected();
        harness.join();

        let mut stream = harness
            .transport
            .subscribe(GraphQLRequest::subscription(COMMENT_ADDED))
            .unwrap();
        let doc = harness.socket.last(codec::events::DOC);
        harness.reply(&doc, "ok", json!({"subscriptionId": "s7"}));

        harness.push("s7", json!({"result": {"data": {"n": 1}}}));
        let first = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(first.data.unwrap()["n"], 1);

        stream.stop();
        let unsubscribe = harness.socket.last(codec::events::UNSUBSCRIBE);
        assert_eq!(unsubscribe.payload, json!({"subscriptionId": "s7"}));
        let end = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn test_dropping_transport_disconnects_socket() {
        let harness = Harness::new(TransportConfig::default());
        assert!(harness.socket.is_connected());

        let Harness {
            transport, socket, ..
        } = harness;
        drop(transport);
        assert!(!socket.is_connected());
    }
}
