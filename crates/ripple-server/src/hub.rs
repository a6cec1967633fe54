//! The hub: Ripple's message switch.
//!
//! Owns the connection table and channel registry, runs the periodic
//! sweepers, fans broadcasts out to local subscribers, and exchanges
//! envelopes with the rest of the fleet through the relay adapter.
//! Every other component only ever sees socket-ids and channel names.

use crate::config::Config;
use crate::metrics;
use crate::webhook::{events, WebhookEmitter};
use ripple_core::connection::CLOSE_GOING_AWAY;
use ripple_core::{
    Authorizer, ChannelRegistry, ChannelType, ConnectionHandle, ConnectionTable, DeliveryStatus,
    HeartbeatTracker, HookBus, HookKind, MessageHistory,
};
use ripple_guard::{
    AckHandle, AckManager, AckRetry, BreakerManager, Deduplicator, LoadError, LoadManager,
    RateDecision, RateLimiter,
};
use ripple_protocol::{codec, ErrorKind, FrameValidator, PresenceSnapshot, ServerFrame};
use ripple_relay::{RelayAdapter, RelayEnvelope, RelayError};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Interval for the rate-limit, dedup, and history sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A refused subscription, rendered as `subscription_error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRefusal {
    pub kind: ErrorKind,
    pub error: String,
    pub status: u16,
}

impl SubscribeRefusal {
    fn capacity(error: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::CapacityError,
            error: error.into(),
            status: 429,
        }
    }
}

/// Outcome of a client-event submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEventOutcome {
    /// Fanned out to this many local subscribers.
    Delivered(usize),
    /// Client events are not meaningful on public channels.
    DroppedPublic,
    /// Suppressed by the deduplicator.
    DroppedDuplicate,
}

/// The server orchestrator.
pub struct Hub {
    node_id: String,
    config: Config,
    hooks: Arc<HookBus>,
    registry: ChannelRegistry,
    connections: ConnectionTable,
    authorizer: Arc<Authorizer>,
    validator: FrameValidator,
    limiter: RateLimiter,
    load: LoadManager,
    acks: AckManager,
    dedup: Deduplicator,
    breakers: BreakerManager,
    heartbeats: HeartbeatTracker,
    history: Option<MessageHistory>,
    relay: Option<Arc<dyn RelayAdapter>>,
    webhooks: Arc<WebhookEmitter>,
    started_at: Instant,
    started: AtomicBool,
    cancel: CancellationToken,
    relay_rx: Mutex<Option<mpsc::UnboundedReceiver<RelayEnvelope>>>,
    ack_retry_rx: Mutex<Option<mpsc::UnboundedReceiver<AckRetry>>>,
}

impl Hub {
    /// Build a hub from configuration and an optional relay.
    #[must_use]
    pub fn new(
        config: Config,
        relay: Option<(
            Arc<dyn RelayAdapter>,
            mpsc::UnboundedReceiver<RelayEnvelope>,
        )>,
    ) -> Arc<Self> {
        let hooks = Arc::new(HookBus::new());
        let webhooks = Arc::new(WebhookEmitter::new(config.webhooks.clone()));

        // Channel lifecycle webhooks ride the hook bus rather than
        // calling back into the hub.
        if webhooks.wants(events::CHANNEL_OCCUPIED) || webhooks.wants(events::CHANNEL_VACATED) {
            let emitter = Arc::clone(&webhooks);
            hooks.on(
                HookKind::All,
                Arc::new(move |event| {
                    let emitter = Arc::clone(&emitter);
                    Box::pin(async move {
                        match &event {
                            ripple_core::ChannelEvent::Created { channel } => emitter
                                .dispatch(events::CHANNEL_OCCUPIED, json!({ "channel": channel })),
                            ripple_core::ChannelEvent::Destroyed { channel } => emitter
                                .dispatch(events::CHANNEL_VACATED, json!({ "channel": channel })),
                            _ => {}
                        }
                        Ok(())
                    })
                }),
            );
        }

        let history = config
            .persistence
            .enabled
            .then(|| MessageHistory::new(config.persistence.to_core()));

        let (acks, ack_retry_rx) = AckManager::new(config.acknowledgments.to_guard());
        let (relay_adapter, relay_rx) = match relay {
            Some((adapter, rx)) => (Some(adapter), Some(rx)),
            None => (None, None),
        };

        Arc::new(Self {
            node_id: Uuid::new_v4().to_string(),
            registry: ChannelRegistry::new(Arc::clone(&hooks)),
            connections: ConnectionTable::new(),
            authorizer: Arc::new(Authorizer::new()),
            validator: FrameValidator::new(),
            limiter: RateLimiter::new(config.rate_limit.to_guard()),
            load: LoadManager::new(config.load.to_guard()),
            acks,
            dedup: Deduplicator::new(config.deduplication.to_guard()),
            breakers: BreakerManager::new(config.circuit_breaker.to_guard()),
            heartbeats: HeartbeatTracker::new(),
            history,
            relay: relay_adapter,
            webhooks,
            hooks,
            started_at: Instant::now(),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            relay_rx: Mutex::new(relay_rx),
            ack_retry_rx: Mutex::new(Some(ack_retry_rx)),
            config,
        })
    }

    /// This node's id, carried in relay envelopes.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Server configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The subscription authorizer, for rule registration.
    #[must_use]
    pub fn authorizer(&self) -> &Arc<Authorizer> {
        &self.authorizer
    }

    /// The lifecycle hook bus.
    #[must_use]
    pub fn hooks(&self) -> &Arc<HookBus> {
        &self.hooks
    }

    /// The connection table.
    #[must_use]
    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    /// The channel registry.
    #[must_use]
    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// The frame validator applied before dispatch.
    #[must_use]
    pub fn validator(&self) -> &FrameValidator {
        &self.validator
    }

    /// The acknowledgment table size (tests and stats).
    #[must_use]
    pub fn pending_acks(&self) -> usize {
        self.acks.pending_count()
    }

    /// Per-socket buffered-byte level at which non-critical delivery
    /// is shed.
    #[must_use]
    pub fn backpressure_threshold(&self) -> usize {
        self.load.backpressure_threshold()
    }

    /// Start the background tasks. Re-entry is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(node = %self.node_id, "Hub starting");

        {
            let hub = Arc::clone(self);
            let cancel = self.cancel.clone();
            tokio::spawn(async move { hub.acks.run_sweeper(cancel).await });
        }

        if let Some(rx) = self.ack_retry_rx.lock().expect("hub lock poisoned").take() {
            let hub = Arc::clone(self);
            tokio::spawn(async move { hub.run_ack_retries(rx).await });
        }

        if let Some(rx) = self.relay_rx.lock().expect("hub lock poisoned").take() {
            let hub = Arc::clone(self);
            tokio::spawn(async move { hub.run_relay_listener(rx).await });
        }

        {
            let hub = Arc::clone(self);
            tokio::spawn(async move { hub.run_periodic_sweeps().await });
        }

        if self.config.heartbeat.enabled {
            let hub = Arc::clone(self);
            tokio::spawn(async move { hub.run_heartbeat_sweeper().await });
        }
    }

    /// Stop: halt sweepers, fail pending acks, close every socket
    /// with 1001, clear the tables. Idempotent.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(node = %self.node_id, "Hub stopping");

        self.cancel.cancel();
        self.acks.clear();

        let sockets = self.connections.socket_ids();
        self.connections
            .close_all(CLOSE_GOING_AWAY, "Server shutting down");
        for socket_id in sockets {
            let outcomes = self.registry.unsubscribe_all(&socket_id).await;
            self.load.subscriptions_removed(outcomes.len());
            self.load.connection_closed();
            if let Some(relay) = &self.relay {
                let _ = relay.remove_connection(&socket_id).await;
            }
        }
        metrics::set_active_channels(self.registry.channel_count());
    }

    /// Whether a new connection may be admitted right now.
    ///
    /// # Errors
    ///
    /// [`LoadError::AtCapacity`] when the node is shedding load.
    pub fn admit_connection(&self) -> Result<(), LoadError> {
        self.load.admit_connection(self.registry.channel_count())
    }

    /// Register an accepted connection.
    pub async fn register_connection(&self, handle: Arc<ConnectionHandle>) {
        let socket_id = handle.socket_id().to_string();
        let snapshot = handle.snapshot();
        self.connections.insert(handle);
        self.load.connection_opened();

        if let Some(relay) = &self.relay {
            self.guarded_relay("store_connection", relay.store_connection(&socket_id, &snapshot))
                .await;
        }
    }

    /// Count a message against the socket's rate bucket.
    ///
    /// Returns the epoch-milliseconds instant after which the client
    /// may retry, when blocked.
    pub fn rate_gate(
        &self,
        socket_id: &str,
        user_id: Option<&str>,
        channel: Option<&str>,
    ) -> Option<u64> {
        let key = self.limiter.key(socket_id, user_id, channel);
        match self.limiter.check(&key) {
            RateDecision::Admitted => None,
            RateDecision::Blocked { retry_in } => {
                metrics::record_error("rate_limit");
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis() as u64;
                Some(now + retry_in.as_millis() as u64)
            }
        }
    }

    /// Subscribe a socket to a channel.
    ///
    /// When `reply` is set, `subscription_succeeded` is queued on the
    /// socket before any `member_added` the rest of the channel sees,
    /// which is what keeps the join sequence observable in order.
    ///
    /// # Errors
    ///
    /// Returns the refusal to render as `subscription_error`.
    pub async fn subscribe_channel(
        &self,
        socket_id: &str,
        channel: &str,
        channel_data: Option<&Value>,
        auth: Option<&str>,
        reply: bool,
    ) -> Result<Option<PresenceSnapshot>, SubscribeRefusal> {
        if let Err(e) = self.load.admit_subscription(
            self.registry.channel_count(),
            self.registry.socket_subscription_count(socket_id),
        ) {
            metrics::record_error("capacity");
            return Err(SubscribeRefusal::capacity(e.to_string()));
        }

        let user_id = self
            .connections
            .get(socket_id)
            .and_then(|h| h.user_id().map(str::to_string));

        let granted = self
            .authorizer
            .authorize(socket_id, user_id.as_deref(), channel, channel_data, auth)
            .await
            .map_err(|e| {
                metrics::record_error("auth");
                SubscribeRefusal {
                    kind: if e.status() == 500 {
                        ErrorKind::ServerError
                    } else {
                        ErrorKind::AuthError
                    },
                    error: e.to_string(),
                    status: e.status(),
                }
            })?;

        let channel_type = ChannelType::of(channel);
        let member = channel_type.is_presence().then(|| {
            granted
                .or_else(|| channel_data.cloned())
                .unwrap_or_else(|| json!({ "id": socket_id }))
        });

        let outcome = match self
            .registry
            .subscribe(socket_id, channel, member.clone())
            .await
        {
            Ok(outcome) => outcome,
            Err(ripple_core::RegistryError::AlreadySubscribed(_)) => {
                // Re-subscribing is answered with the current state.
                let snapshot = self.presence_snapshot(channel, channel_type);
                if reply {
                    self.send_to_socket(
                        socket_id,
                        &ServerFrame::SubscriptionSucceeded {
                            channel: channel.to_string(),
                            presence: snapshot.clone(),
                        },
                    );
                }
                return Ok(snapshot);
            }
            Err(e) => {
                return Err(SubscribeRefusal {
                    kind: ErrorKind::NotSupported,
                    error: e.to_string(),
                    status: 400,
                })
            }
        };

        self.load.subscription_added();
        metrics::record_subscription();
        metrics::set_active_channels(self.registry.channel_count());

        let snapshot = self.presence_snapshot(channel, channel_type);
        if reply {
            self.send_to_socket(
                socket_id,
                &ServerFrame::SubscriptionSucceeded {
                    channel: channel.to_string(),
                    presence: snapshot.clone(),
                },
            );
        }

        if let Some(relay) = &self.relay {
            self.guarded_relay("store_channel", relay.store_channel(channel, socket_id))
                .await;
        }

        if let Some(member) = outcome.member.or(member) {
            self.heartbeats.track(channel, socket_id, member.clone());

            if let Some(relay) = &self.relay {
                self.guarded_relay(
                    "store_presence_member",
                    relay.store_presence_member(channel, socket_id, &member),
                )
                .await;
            }

            // The joining socket never sees its own member_added.
            self.broadcast(channel, "member_added", member.clone(), Some(socket_id))
                .await;
            self.webhooks.dispatch(
                events::MEMBER_ADDED,
                json!({ "channel": channel, "member": member, "socket_id": socket_id }),
            );
        }

        Ok(snapshot)
    }

    /// Unsubscribe a socket from a channel. Returns `false` when it
    /// was not subscribed.
    pub async fn unsubscribe_channel(&self, socket_id: &str, channel: &str) -> bool {
        let Ok(outcome) = self.registry.unsubscribe(socket_id, channel).await else {
            return false;
        };

        self.load.subscriptions_removed(1);
        self.heartbeats.forget(channel, socket_id);
        metrics::set_active_channels(self.registry.channel_count());

        if let Some(relay) = &self.relay {
            self.guarded_relay("remove_channel", relay.remove_channel(channel, socket_id))
                .await;
        }

        if let Some(member) = outcome.member {
            if let Some(relay) = &self.relay {
                self.guarded_relay(
                    "remove_presence_member",
                    relay.remove_presence_member(channel, socket_id),
                )
                .await;
            }
            self.broadcast(channel, "member_removed", member.clone(), Some(socket_id))
                .await;
            self.webhooks.dispatch(
                events::MEMBER_REMOVED,
                json!({ "channel": channel, "member": member, "socket_id": socket_id }),
            );
        }

        true
    }

    /// Tear down all state for a closed socket.
    pub async fn disconnect(&self, socket_id: &str) {
        if self.connections.remove(socket_id).is_none() {
            return;
        }
        debug!(socket = %socket_id, "Disconnecting");

        self.load.connection_closed();
        self.limiter.forget_socket(socket_id);
        self.heartbeats.forget_socket(socket_id);

        let outcomes = self.registry.unsubscribe_all(socket_id).await;
        self.load.subscriptions_removed(outcomes.len());
        metrics::set_active_channels(self.registry.channel_count());

        for (channel, outcome) in outcomes {
            if let Some(relay) = &self.relay {
                self.guarded_relay("remove_channel", relay.remove_channel(&channel, socket_id))
                    .await;
            }
            if let Some(member) = outcome.member {
                if let Some(relay) = &self.relay {
                    self.guarded_relay(
                        "remove_presence_member",
                        relay.remove_presence_member(&channel, socket_id),
                    )
                    .await;
                }
                self.broadcast(&channel, "member_removed", member.clone(), Some(socket_id))
                    .await;
                self.webhooks.dispatch(
                    events::MEMBER_REMOVED,
                    json!({ "channel": channel, "member": member, "socket_id": socket_id }),
                );
            }
        }

        if let Some(relay) = &self.relay {
            self.guarded_relay("remove_connection", relay.remove_connection(socket_id))
                .await;
        }
    }

    /// Broadcast an event: local fan-out minus the excluded socket,
    /// then the relay, tagged with this node's id.
    pub async fn broadcast(
        &self,
        channel: &str,
        event: &str,
        data: Value,
        exclude: Option<&str>,
    ) -> usize {
        let delivered = self.fan_out(channel, event, &data, exclude);

        if let Some(relay) = &self.relay {
            let envelope = RelayEnvelope::broadcast(
                channel,
                event,
                data.clone(),
                exclude.map(str::to_string),
                &self.node_id,
            );
            metrics::record_relay("outbound");
            // A relay failure never fails the local fan-out.
            self.guarded_relay("publish", relay.publish(&envelope)).await;
        }

        self.store_history(channel, event, data, exclude).await;
        delivered
    }

    /// Send an event to one socket and track its acknowledgment.
    #[must_use]
    pub fn send_with_ack(
        &self,
        socket_id: &str,
        channel: &str,
        event: &str,
        data: Value,
    ) -> AckHandle {
        let message_id = Uuid::new_v4().to_string();
        let frame = ServerFrame::Event {
            event: event.to_string(),
            channel: channel.to_string(),
            data,
            message_id: Some(message_id.clone()),
        };
        let text = codec::encode(&frame);

        let handle = self.acks.register(&message_id, socket_id, &text);
        if let Some(connection) = self.connections.get(socket_id) {
            self.record_delivery(connection.send(text, false));
        }
        handle
    }

    /// Resolve a pending acknowledgment.
    pub fn acknowledge(&self, message_id: &str) -> bool {
        self.acks.acknowledge(message_id)
    }

    /// Handle a `client-*` event from a subscriber.
    ///
    /// # Errors
    ///
    /// Returns the error frame to send back to the sender.
    pub async fn client_event(
        &self,
        socket_id: &str,
        event: &str,
        channel: &str,
        mut data: Value,
        message_id: Option<&str>,
    ) -> Result<ClientEventOutcome, ServerFrame> {
        // Client events are only meaningful on non-public channels;
        // on public ones they are dropped silently, no error frame.
        if !ChannelType::of(channel).requires_auth() {
            debug!(socket = %socket_id, channel = %channel, "Dropping client event on public channel");
            return Ok(ClientEventOutcome::DroppedPublic);
        }

        if !self.registry.is_subscribed(socket_id, channel) {
            metrics::record_error("client_event_unsubscribed");
            return Err(ServerFrame::error(
                ErrorKind::AuthError,
                format!("Not subscribed to channel: {channel}"),
            ));
        }

        if self.config.security.sanitize_messages {
            ripple_protocol::sanitize::sanitize_value(&mut data);
        }

        if self.is_duplicate(channel, event, &data, message_id).await {
            metrics::record_duplicate();
            return Ok(ClientEventOutcome::DroppedDuplicate);
        }

        let delivered = self.broadcast(channel, event, data.clone(), Some(socket_id)).await;

        self.webhooks.dispatch(
            events::CLIENT_EVENT,
            json!({
                "channel": channel,
                "event": event,
                "data": data,
                "socket_id": socket_id,
            }),
        );

        Ok(ClientEventOutcome::Delivered(delivered))
    }

    /// Refresh heartbeat state for a socket.
    pub fn heartbeat(&self, socket_id: &str, channel: Option<&str>) {
        match channel {
            Some(channel) => {
                self.heartbeats.touch(channel, socket_id);
            }
            None => self.heartbeats.touch_socket(socket_id),
        }
    }

    /// Stored messages for a channel, oldest first.
    pub async fn history(
        &self,
        channel: &str,
        since: Option<u64>,
        limit: Option<usize>,
    ) -> Vec<Value> {
        if !self.config.persistence.enabled {
            return Vec::new();
        }

        if let Some(relay) = &self.relay {
            match relay
                .fetch_history(channel, since.unwrap_or(0), limit.unwrap_or(100))
                .await
            {
                Ok(entries) => return entries,
                Err(e) => {
                    warn!(error = %e, "Relay history fetch failed");
                    return Vec::new();
                }
            }
        }

        self.history
            .as_ref()
            .map(|h| {
                h.get_history(channel, since, limit)
                    .into_iter()
                    .filter_map(|m| serde_json::to_value(m).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Aggregate stats for the HTTP surface.
    #[must_use]
    pub fn stats(&self) -> Value {
        json!({
            "connections": self.connections.len(),
            "channels": self.registry.channel_count(),
            "subscriptions": self.registry.subscription_count(),
            "pending_acks": self.acks.pending_count(),
            "uptime": self.started_at.elapsed().as_secs(),
            "node_id": self.node_id,
            "relay": self.relay.is_some(),
        })
    }

    /// Relay connectivity: `None` when no relay is configured.
    pub async fn relay_healthy(&self) -> Option<bool> {
        let relay = self.relay.as_ref()?;
        Some(relay.health_check().await.is_ok())
    }

    // ---- internals ----

    fn presence_snapshot(
        &self,
        channel: &str,
        channel_type: ChannelType,
    ) -> Option<PresenceSnapshot> {
        if !channel_type.is_presence() {
            return None;
        }
        let members = self.registry.members(channel);
        let hash: BTreeMap<String, Value> = members.into_iter().collect();
        Some(PresenceSnapshot {
            ids: hash.keys().cloned().collect(),
            count: hash.len(),
            hash,
        })
    }

    /// Render once, queue on every local subscriber except `exclude`.
    fn fan_out(&self, channel: &str, event: &str, data: &Value, exclude: Option<&str>) -> usize {
        let frame = match event {
            "member_added" => ServerFrame::MemberAdded {
                channel: channel.to_string(),
                member: data.clone(),
            },
            "member_removed" => ServerFrame::MemberRemoved {
                channel: channel.to_string(),
                member: data.clone(),
            },
            _ => ServerFrame::Event {
                event: event.to_string(),
                channel: channel.to_string(),
                data: data.clone(),
                message_id: None,
            },
        };
        let critical = frame.is_critical();
        let text = codec::encode(&frame);

        let mut delivered = 0;
        for subscriber in self.registry.subscribers(channel) {
            if exclude == Some(subscriber.as_str()) {
                continue;
            }
            let Some(connection) = self.connections.get(&subscriber) else {
                continue;
            };
            if connection.send(text.clone(), critical) == DeliveryStatus::Queued {
                metrics::record_message(text.len(), "outbound");
                delivered += 1;
            } else {
                self.record_delivery(DeliveryStatus::Shed);
            }
        }
        delivered
    }

    /// Queue a control frame on one socket.
    pub(crate) fn send_to_socket(&self, socket_id: &str, frame: &ServerFrame) {
        if let Some(connection) = self.connections.get(socket_id) {
            let text = codec::encode(frame);
            metrics::record_message(text.len(), "outbound");
            self.record_delivery(connection.send(text, frame.is_critical()));
        }
    }

    fn record_delivery(&self, status: DeliveryStatus) {
        if status == DeliveryStatus::Shed {
            metrics::record_shed();
        }
    }

    async fn is_duplicate(
        &self,
        channel: &str,
        event: &str,
        data: &Value,
        explicit: Option<&str>,
    ) -> bool {
        if !self.config.deduplication.enabled {
            return false;
        }

        if let Some(relay) = &self.relay {
            let key = ripple_guard::dedup_key(channel, event, data, explicit);
            let ttl = Duration::from_millis(self.config.deduplication.ttl_ms);
            match relay.check_duplicate(&key, ttl).await {
                Ok(duplicate) => return duplicate,
                Err(e) => {
                    // Fail open: a broken store must not block delivery.
                    warn!(error = %e, "Dedup store unavailable, treating as fresh");
                    return false;
                }
            }
        }

        self.dedup.is_duplicate(channel, event, data, explicit)
    }

    async fn store_history(&self, channel: &str, event: &str, data: Value, origin: Option<&str>) {
        if !self.config.persistence.enabled {
            return;
        }
        if self
            .config
            .persistence
            .exclude_events
            .iter()
            .any(|e| e == event)
        {
            return;
        }

        if let Some(relay) = &self.relay {
            let timestamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64;
            let entry = json!({
                "id": Uuid::new_v4().to_string(),
                "event": event,
                "data": data,
                "timestamp": timestamp,
                "socket_id": origin,
            });
            if let Err(e) = relay
                .append_history(
                    channel,
                    &entry,
                    timestamp,
                    self.config.persistence.max_messages,
                    Duration::from_secs(self.config.persistence.ttl_secs),
                )
                .await
            {
                warn!(error = %e, "Relay history append failed");
            }
            return;
        }

        if let Some(history) = &self.history {
            history.store(channel, event, data, origin);
        }
    }

    async fn guarded_relay<F>(&self, op: &'static str, fut: F)
    where
        F: Future<Output = Result<(), RelayError>>,
    {
        let breaker = self.breakers.get("relay");
        if let Err(e) = breaker.execute(fut).await {
            warn!(op = op, error = %e, "Relay operation failed");
            metrics::record_error("relay");
        }
    }

    async fn run_ack_retries(&self, mut rx: mpsc::UnboundedReceiver<AckRetry>) {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                retry = rx.recv() => {
                    let Some(retry) = retry else { break };
                    debug!(message_id = %retry.message_id, attempt = retry.attempt, "Re-sending unacknowledged message");
                    if let Some(connection) = self.connections.get(&retry.socket_id) {
                        self.record_delivery(connection.send(retry.text, false));
                    }
                }
            }
        }
    }

    async fn run_relay_listener(&self, mut rx: mpsc::UnboundedReceiver<RelayEnvelope>) {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                envelope = rx.recv() => {
                    let Some(envelope) = envelope else {
                        error!("Relay inbound stream closed");
                        break;
                    };
                    metrics::record_relay("inbound");

                    // Loopback guard: our own envelopes are replayed
                    // nowhere unless explicitly configured otherwise.
                    if envelope.server_id == self.node_id && !self.config.server.publish_to_self {
                        metrics::record_loopback_drop();
                        continue;
                    }

                    self.fan_out(
                        &envelope.channel,
                        &envelope.event,
                        &envelope.data,
                        envelope.socket_id.as_deref(),
                    );
                }
            }
        }
    }

    async fn run_periodic_sweeps(&self) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.limiter.sweep();
                    self.dedup.sweep();
                    if let Some(history) = &self.history {
                        history.prune();
                    }
                }
            }
        }
    }

    async fn run_heartbeat_sweeper(&self) {
        let interval = Duration::from_millis(self.config.heartbeat.interval_ms.max(100));
        let timeout = Duration::from_millis(self.config.heartbeat.timeout_ms);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    for eviction in self.heartbeats.sweep(timeout) {
                        debug!(channel = %eviction.channel, socket = %eviction.socket_id, "Evicting silent presence member");
                        self.unsubscribe_channel(&eviction.socket_id, &eviction.channel).await;
                    }
                }
            }
        }
    }
}
