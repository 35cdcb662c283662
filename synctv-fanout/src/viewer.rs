//! Viewer session manager
//!
//! Keeps one inbound connection to the broadcaster alive. The event loop owns
//! the current [`ViewerConnection`] and three timers: the statistics ticker,
//! the establishment deadline and the reconnection backoff deadline. Every
//! reconnect attempt builds a brand new connection with a fresh connection id.

use crate::bandwidth::{NetworkObserver, NetworkSampler};
use crate::config::{FanoutConfig, ReconnectConfig};
use crate::error::{Error, Result};
use crate::peer::forward_events;
use crate::quality::{select_quality_tier, QualityTier};
use crate::signaling::{SignalingMessage, SignalingPayload, SignalingRelay, Subscription};
use crate::stats::{MediaDirection, StatsSample, StreamStats};
use crate::transport::{
    CandidateBuffer, IceCandidate, MediaSink, PeerTransport, SessionDescription, TransportEvent,
    TransportFactory, TransportState,
};
use crate::types::{ConnectionId, ConnectionState, StreamSession, ViewerId};
use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const STATS_CHANNEL_CAPACITY: usize = 16;

/// Exponential reconnection schedule: `base_delay * 2^(attempt-1)` for
/// `max_attempts` attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: usize,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            base_delay: config.base_delay(),
            max_attempts: config.max_attempts,
        }
    }
}

impl ReconnectPolicy {
    /// Delays of every remaining attempt; exhausted once `next()` returns `None`
    #[must_use]
    pub fn backoff(&self) -> ExponentialBackoff {
        let doublings = u32::try_from(self.max_attempts.saturating_sub(1))
            .unwrap_or(u32::MAX)
            .min(16);
        ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_factor(2.0)
            .with_max_delay(self.base_delay.saturating_mul(1 << doublings))
            .with_max_times(self.max_attempts)
            .build()
    }
}

/// Viewer-owned state of one connection attempt
struct ViewerConnection {
    connection_id: ConnectionId,
    transport: Arc<dyn PeerTransport>,
    candidates: CandidateBuffer,
    forwarder: JoinHandle<()>,
    received_track: bool,
    last_sample: Option<StatsSample>,
}

/// Viewer side of one stream
pub struct Viewer {
    session: StreamSession,
    viewer_id: ViewerId,
    config: Arc<FanoutConfig>,
    relay: Arc<dyn SignalingRelay>,
    factory: Arc<dyn TransportFactory>,
    network: Arc<dyn NetworkObserver>,
    sink: Arc<dyn MediaSink>,

    state: Arc<watch::Sender<ConnectionState>>,
    tier: Arc<watch::Sender<QualityTier>>,
    stats: broadcast::Sender<StreamStats>,

    started: AtomicBool,
    cancel_token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Viewer {
    pub fn new(
        session: StreamSession,
        viewer_id: ViewerId,
        config: Arc<FanoutConfig>,
        relay: Arc<dyn SignalingRelay>,
        factory: Arc<dyn TransportFactory>,
        network: Arc<dyn NetworkObserver>,
        sink: Arc<dyn MediaSink>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::New);
        let (tier, _) = watch::channel(crate::quality::DEFAULT_TIER);
        let (stats, _) = broadcast::channel(STATS_CHANNEL_CAPACITY);

        Self {
            session,
            viewer_id,
            config,
            relay,
            factory,
            network,
            sink,
            state: Arc::new(state),
            tier: Arc::new(tier),
            stats,
            started: AtomicBool::new(false),
            cancel_token: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn viewer_id(&self) -> &ViewerId {
        &self.viewer_id
    }

    /// Pick the initial tier, create the first connection and announce it to
    /// the broadcaster. Rejected once connected or disconnected.
    pub async fn connect(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(if self.cancel_token.is_cancelled() {
                Error::Stopped
            } else {
                Error::AlreadyStarted
            });
        }

        if let Err(e) = self.config.ensure_valid() {
            error!(viewer_id = %self.viewer_id, error = %e, "Refusing to connect viewer");
            self.state.send_replace(ConnectionState::Failed);
            return Err(e.into());
        }

        let network = self.network.sample().await;
        let tier = network.select_preset().tier;
        self.tier.send_replace(tier);
        self.state.send_replace(ConnectionState::Connecting);

        let policy = ReconnectPolicy::from(&self.config.reconnect);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut actor = ViewerLoop {
            viewer_id: self.viewer_id.clone(),
            session: self.session.clone(),
            config: Arc::clone(&self.config),
            relay: Arc::clone(&self.relay),
            factory: Arc::clone(&self.factory),
            network: NetworkSampler::spawn(
                Arc::clone(&self.network),
                network,
                self.config.timing.viewer_poll_interval(),
            ),
            sink: Arc::clone(&self.sink),
            connection: None,
            tier,
            policy,
            backoff: policy.backoff(),
            attempt: 0,
            exhausted: false,
            establishment_deadline: None,
            retry_deadline: None,
            state: Arc::clone(&self.state),
            tier_tx: Arc::clone(&self.tier),
            stats: self.stats.clone(),
            events_tx,
            events_rx,
        };

        if let Err(e) = actor.create_connection().await {
            error!(viewer_id = %self.viewer_id, error = %e, "Failed to create transport");
            self.state.send_replace(ConnectionState::Failed);
            return Err(e);
        }

        let subscription = match self.relay.subscribe(&self.session.stream_id).await {
            Ok(subscription) => subscription,
            Err(e) => {
                error!(viewer_id = %self.viewer_id, error = %e, "Failed to subscribe to signaling");
                actor.teardown_connection().await;
                self.state.send_replace(ConnectionState::Failed);
                return Err(e);
            }
        };

        if let Err(e) = actor.announce().await {
            warn!(viewer_id = %self.viewer_id, error = %e, "Failed to announce viewer");
            actor.begin_reconnect().await;
        }

        info!(
            stream_id = %self.session.stream_id,
            viewer_id = %self.viewer_id,
            tier = %tier,
            "Viewer connecting"
        );

        let actor = tokio::spawn(actor.run(subscription, self.cancel_token.clone()));
        let state = Arc::clone(&self.state);
        let viewer_id = self.viewer_id.clone();
        *self.task.lock() = Some(tokio::spawn(async move {
            if let Err(e) = actor.await {
                error!(viewer_id = %viewer_id, error = %e, "Viewer loop terminated abnormally");
                state.send_replace(ConnectionState::Failed);
            }
        }));
        Ok(())
    }

    /// Cancel timers, close the transport and leave the signaling channel.
    /// Safe to call repeatedly; the viewer cannot connect afterwards.
    pub async fn disconnect(&self) {
        self.started.store(true, Ordering::SeqCst);
        self.cancel_token.cancel();

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(viewer_id = %self.viewer_id, error = %e, "Failed to join viewer task");
            }
            info!(viewer_id = %self.viewer_id, "Viewer disconnected");
        }

        self.state.send_replace(ConnectionState::Disconnected);
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Tier currently requested from the broadcaster
    #[must_use]
    pub fn current_tier(&self) -> QualityTier {
        *self.tier.borrow()
    }

    #[must_use]
    pub fn subscribe_tier(&self) -> watch::Receiver<QualityTier> {
        self.tier.subscribe()
    }

    /// Inbound statistics, one snapshot per polling tick while connected
    #[must_use]
    pub fn subscribe_stats(&self) -> broadcast::Receiver<StreamStats> {
        self.stats.subscribe()
    }
}

impl Drop for Viewer {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Resolves when the deadline is armed and reached; pending forever otherwise
async fn deadline_reached(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

struct ViewerLoop {
    viewer_id: ViewerId,
    session: StreamSession,
    config: Arc<FanoutConfig>,
    relay: Arc<dyn SignalingRelay>,
    factory: Arc<dyn TransportFactory>,
    network: NetworkSampler,
    sink: Arc<dyn MediaSink>,

    connection: Option<ViewerConnection>,
    tier: QualityTier,

    policy: ReconnectPolicy,
    backoff: ExponentialBackoff,
    attempt: usize,
    exhausted: bool,
    establishment_deadline: Option<Pin<Box<Sleep>>>,
    retry_deadline: Option<Pin<Box<Sleep>>>,

    state: Arc<watch::Sender<ConnectionState>>,
    tier_tx: Arc<watch::Sender<QualityTier>>,
    stats: broadcast::Sender<StreamStats>,

    events_tx: mpsc::UnboundedSender<(ConnectionId, TransportEvent)>,
    events_rx: mpsc::UnboundedReceiver<(ConnectionId, TransportEvent)>,
}

impl ViewerLoop {
    async fn run(mut self, mut subscription: Subscription, cancel_token: CancellationToken) {
        let period = self.config.timing.viewer_poll_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut final_state = ConnectionState::Disconnected;
        while !self.exhausted {
            tokio::select! {
                () = cancel_token.cancelled() => break,
                message = subscription.messages.recv() => match message {
                    Some(message) => self.handle_signaling(message).await,
                    None => {
                        error!(viewer_id = %self.viewer_id, "Signaling channel closed");
                        final_state = ConnectionState::Failed;
                        break;
                    }
                },
                Some((connection_id, event)) = self.events_rx.recv() => {
                    self.handle_transport_event(connection_id, event).await;
                }
                () = deadline_reached(&mut self.establishment_deadline) => {
                    self.establishment_deadline = None;
                    warn!(viewer_id = %self.viewer_id, "Connection not established in time");
                    self.begin_reconnect().await;
                }
                () = deadline_reached(&mut self.retry_deadline) => {
                    self.retry_deadline = None;
                    self.reconnect().await;
                }
                _ = ticker.tick() => {
                    if *self.state.borrow() == ConnectionState::Connected {
                        self.poll_stats().await;
                    }
                }
            }
        }

        self.shutdown(subscription, final_state).await;
    }

    fn is_current(&self, connection_id: &ConnectionId) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|connection| &connection.connection_id == connection_id)
    }

    async fn publish(&self, payload: SignalingPayload, to_broadcaster: bool) -> Result<()> {
        let target = to_broadcaster.then(|| self.session.broadcaster_id.clone());
        let message = SignalingMessage::new(
            self.session.stream_id.clone(),
            self.viewer_id.clone(),
            target,
            payload,
        );
        self.relay.publish(&self.session.stream_id, message).await
    }

    /// Fresh transport, candidate queue and connection id
    async fn create_connection(&mut self) -> Result<()> {
        let (transport, events) = self.factory.create(&self.config.ice).await?;
        let connection_id = ConnectionId::generate();
        let forwarder = forward_events(events, connection_id.clone(), self.events_tx.clone());

        debug!(viewer_id = %self.viewer_id, connection_id = %connection_id, "Transport created");
        self.connection = Some(ViewerConnection {
            connection_id,
            transport,
            candidates: CandidateBuffer::new(),
            forwarder,
            received_track: false,
            last_sample: None,
        });
        Ok(())
    }

    /// Publish viewer-join for the current connection and arm the establishment deadline
    async fn announce(&mut self) -> Result<()> {
        let Some(connection) = &self.connection else {
            return Err(Error::Signaling("no connection to announce".to_string()));
        };
        let payload = SignalingPayload::ViewerJoin {
            connection_id: connection.connection_id.clone(),
            tier: Some(self.tier),
        };
        self.publish(payload, false).await?;

        self.establishment_deadline = Some(Box::pin(sleep(self.config.timing.establishment_timeout())));
        Ok(())
    }

    async fn teardown_connection(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        connection.forwarder.abort();
        if let Err(e) = connection.transport.close().await {
            debug!(viewer_id = %self.viewer_id, error = %e, "Failed to close transport");
        }
    }

    /// Drop the current connection and schedule the next attempt, or give up
    async fn begin_reconnect(&mut self) {
        if self.retry_deadline.is_some() || self.exhausted {
            return;
        }

        self.establishment_deadline = None;
        self.teardown_connection().await;

        match self.backoff.next() {
            Some(delay) => {
                self.attempt += 1;
                self.state.send_replace(ConnectionState::Reconnecting);
                info!(
                    viewer_id = %self.viewer_id,
                    attempt = self.attempt,
                    max_attempts = self.policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling reconnection"
                );
                self.retry_deadline = Some(Box::pin(sleep(delay)));
            }
            None => {
                error!(
                    viewer_id = %self.viewer_id,
                    attempts = self.attempt,
                    "Reconnection attempts exhausted"
                );
                self.exhausted = true;
                self.state.send_replace(ConnectionState::Failed);
            }
        }
    }

    async fn reconnect(&mut self) {
        debug!(viewer_id = %self.viewer_id, attempt = self.attempt, "Reconnecting");

        let result = match self.create_connection().await {
            Ok(()) => self.announce().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(viewer_id = %self.viewer_id, attempt = self.attempt, error = %e, "Reconnection attempt failed");
            self.begin_reconnect().await;
        }
    }

    async fn handle_signaling(&mut self, message: SignalingMessage) {
        if !message.is_relevant_to(&self.viewer_id) {
            return;
        }
        if message.sender_id != self.session.broadcaster_id {
            debug!(viewer_id = %self.viewer_id, sender_id = %message.sender_id, "Ignoring message from unexpected sender");
            return;
        }

        match message.payload {
            SignalingPayload::Offer {
                connection_id,
                description,
            } => self.on_offer(&connection_id, description).await,
            SignalingPayload::IceCandidate {
                connection_id,
                candidate,
            } => self.on_remote_candidate(&connection_id, candidate).await,
            other => {
                debug!(viewer_id = %self.viewer_id, message_type = other.message_type(), "Ignoring message");
            }
        }
    }

    async fn on_offer(&mut self, connection_id: &ConnectionId, description: SessionDescription) {
        let Some(connection) = self.connection.as_mut().filter(|c| &c.connection_id == connection_id) else {
            debug!(viewer_id = %self.viewer_id, connection_id = %connection_id, "Stale offer ignored");
            return;
        };
        if connection.candidates.has_remote_description() {
            debug!(viewer_id = %self.viewer_id, "Duplicate offer ignored");
            return;
        }

        let transport = Arc::clone(&connection.transport);
        let queued = match transport.set_remote_description(description).await {
            Ok(()) => connection.candidates.mark_remote_description_set(),
            Err(e) => {
                warn!(viewer_id = %self.viewer_id, error = %e, "Failed to apply offer");
                self.begin_reconnect().await;
                return;
            }
        };

        for candidate in queued {
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                warn!(viewer_id = %self.viewer_id, error = %e, "Failed to add queued ICE candidate");
            }
        }

        let answer = match self.answer(&transport).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(viewer_id = %self.viewer_id, error = %e, "Failed to answer offer");
                self.begin_reconnect().await;
                return;
            }
        };

        let payload = SignalingPayload::Answer {
            connection_id: connection_id.clone(),
            description: answer,
        };
        if let Err(e) = self.publish(payload, true).await {
            warn!(viewer_id = %self.viewer_id, error = %e, "Failed to publish answer");
            self.begin_reconnect().await;
            return;
        }
        debug!(viewer_id = %self.viewer_id, connection_id = %connection_id, "Answer sent");
    }

    async fn answer(&self, transport: &Arc<dyn PeerTransport>) -> Result<SessionDescription> {
        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    async fn on_remote_candidate(&mut self, connection_id: &ConnectionId, candidate: IceCandidate) {
        let Some(connection) = self.connection.as_mut().filter(|c| &c.connection_id == connection_id) else {
            debug!(viewer_id = %self.viewer_id, connection_id = %connection_id, "Stale candidate ignored");
            return;
        };

        match connection.candidates.push(candidate) {
            Some(candidate) => {
                if let Err(e) = connection.transport.add_ice_candidate(candidate).await {
                    warn!(viewer_id = %self.viewer_id, error = %e, "Failed to add ICE candidate");
                }
            }
            None => {
                debug!(
                    viewer_id = %self.viewer_id,
                    queued = connection.candidates.len(),
                    "Queued candidate until remote description is set"
                );
            }
        }
    }

    async fn handle_transport_event(&mut self, connection_id: ConnectionId, event: TransportEvent) {
        if !self.is_current(&connection_id) {
            debug!(viewer_id = %self.viewer_id, connection_id = %connection_id, "Event from stale connection ignored");
            return;
        }

        match event {
            TransportEvent::IceCandidate(candidate) => {
                let payload = SignalingPayload::IceCandidate {
                    connection_id,
                    candidate,
                };
                if let Err(e) = self.publish(payload, true).await {
                    warn!(viewer_id = %self.viewer_id, error = %e, "Failed to publish local candidate");
                }
            }
            TransportEvent::Track(track) => {
                if let Some(connection) = self.connection.as_mut() {
                    if !connection.received_track {
                        connection.received_track = true;
                        self.establishment_deadline = None;
                        info!(viewer_id = %self.viewer_id, track_id = %track.id, "First media track received");
                    }
                }
                self.sink.on_track(track);
            }
            TransportEvent::StateChange(TransportState::Connected) => {
                self.establishment_deadline = None;
                self.attempt = 0;
                self.backoff = self.policy.backoff();
                self.state.send_replace(ConnectionState::Connected);
                info!(viewer_id = %self.viewer_id, connection_id = %connection_id, "Connected to broadcaster");
            }
            TransportEvent::StateChange(state @ (TransportState::Disconnected | TransportState::Failed)) => {
                warn!(viewer_id = %self.viewer_id, state = ?state, "Connection lost");
                self.begin_reconnect().await;
            }
            TransportEvent::StateChange(state) => {
                debug!(viewer_id = %self.viewer_id, state = ?state, "Transport state changed");
            }
        }
    }

    async fn poll_stats(&mut self) {
        let Some(connection) = self.connection.as_mut() else {
            return;
        };

        let transport = Arc::clone(&connection.transport);
        let timeout = self.config.timing.stats_timeout();
        let report = match tokio::time::timeout(timeout, transport.stats())
            .await
            .unwrap_or_else(|_| Err(Error::Timeout(format!("statistics after {timeout:?}"))))
        {
            Ok(report) => report,
            Err(e) => {
                debug!(viewer_id = %self.viewer_id, error = %e, "Skipping statistics for this tick");
                return;
            }
        };

        let sample = StatsSample::now(report);
        let snapshot = StreamStats::derive(connection.last_sample.as_ref(), &sample, MediaDirection::Inbound);
        connection.last_sample = Some(sample);
        let _ = self.stats.send(snapshot.clone());

        let network = self.network.latest();
        let desired = select_quality_tier(
            network.effective_type,
            network.downlink_mbps,
            snapshot.rtt_ms.or(network.rtt_ms),
        )
        .tier;
        if desired == self.tier {
            return;
        }

        if let Err(e) = self.publish(SignalingPayload::QualityChange { tier: desired }, true).await {
            warn!(viewer_id = %self.viewer_id, tier = %desired, error = %e, "Failed to request quality change");
            return;
        }
        info!(
            viewer_id = %self.viewer_id,
            from = %self.tier,
            to = %desired,
            rtt_ms = ?snapshot.rtt_ms,
            "Requested quality change"
        );
        self.tier = desired;
        self.tier_tx.send_replace(desired);
    }

    async fn shutdown(mut self, subscription: Subscription, final_state: ConnectionState) {
        self.establishment_deadline = None;
        self.retry_deadline = None;
        self.teardown_connection().await;

        if let Err(e) = self.relay.unsubscribe(&subscription.id).await {
            warn!(viewer_id = %self.viewer_id, error = %e, "Failed to unsubscribe from signaling");
        }

        if !self.exhausted {
            self.state.send_replace(final_state);
        }
        info!(viewer_id = %self.viewer_id, "Viewer loop finished");
    }
}
