//! Broadcaster session manager
//!
//! One outbound session per viewer (fan-out). All session state lives in a
//! single event loop task that processes, one at a time:
//! - inbound signaling messages addressed to the broadcaster
//! - transport events of every session
//! - the statistics polling tick
//!
//! The [`Broadcaster`] handle only exposes observers and lifecycle control.

use crate::bandwidth::NetworkObserver;
use crate::config::FanoutConfig;
use crate::error::{Error, Result};
use crate::peer::{forward_events, PeerSession, SessionKey};
use crate::quality::{adapt_tier, AdaptationThresholds, QualityTier};
use crate::sdp::reorder_codec_preference;
use crate::signaling::{SignalingMessage, SignalingPayload, SignalingRelay, Subscription};
use crate::stats::StreamStats;
use crate::transport::{
    IceCandidate, LocalTrack, MediaSource, SessionDescription, TransportEvent, TransportFactory,
    TransportState,
};
use crate::types::{ConnectionId, ConnectionState, PeerId, StreamSession, ViewerId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const STATS_CHANNEL_CAPACITY: usize = 16;

/// Broadcaster side of one stream
pub struct Broadcaster {
    session: StreamSession,
    config: Arc<FanoutConfig>,
    relay: Arc<dyn SignalingRelay>,
    factory: Arc<dyn TransportFactory>,
    network: Arc<dyn NetworkObserver>,

    state: Arc<watch::Sender<ConnectionState>>,
    viewer_count: Arc<watch::Sender<usize>>,
    tier: Arc<watch::Sender<QualityTier>>,
    stats: broadcast::Sender<StreamStats>,

    started: AtomicBool,
    cancel_token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Broadcaster {
    pub fn new(
        session: StreamSession,
        config: Arc<FanoutConfig>,
        relay: Arc<dyn SignalingRelay>,
        factory: Arc<dyn TransportFactory>,
        network: Arc<dyn NetworkObserver>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::New);
        let (viewer_count, _) = watch::channel(0);
        let (tier, _) = watch::channel(config.quality.initial_tier);
        let (stats, _) = broadcast::channel(STATS_CHANNEL_CAPACITY);

        Self {
            session,
            config,
            relay,
            factory,
            network,
            state: Arc::new(state),
            viewer_count: Arc::new(viewer_count),
            tier: Arc::new(tier),
            stats,
            started: AtomicBool::new(false),
            cancel_token: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn session(&self) -> &StreamSession {
        &self.session
    }

    /// Bind the media source, join the stream's signaling channel and start
    /// serving viewers. A broadcaster can only be started once, and never
    /// after [`Broadcaster::stop`].
    pub async fn start(&self, media_source: Arc<dyn MediaSource>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(if self.cancel_token.is_cancelled() {
                Error::Stopped
            } else {
                Error::AlreadyStarted
            });
        }

        if let Err(e) = self.config.ensure_valid() {
            error!(stream_id = %self.session.stream_id, error = %e, "Refusing to start broadcaster");
            self.state.send_replace(ConnectionState::Failed);
            return Err(e.into());
        }

        let network = self.network.sample().await;
        let tier = if network.has_signals() {
            network.select_preset().tier
        } else {
            self.config.quality.initial_tier
        };
        self.tier.send_replace(tier);
        if let Err(e) = media_source
            .apply_constraints(tier.preset().capture_constraints())
            .await
        {
            warn!(
                stream_id = %self.session.stream_id,
                tier = %tier,
                error = %e,
                "Failed to apply capture constraints, continuing with negotiated settings"
            );
        }

        self.state.send_replace(ConnectionState::Connecting);

        let subscription = match self.relay.subscribe(&self.session.stream_id).await {
            Ok(subscription) => subscription,
            Err(e) => {
                error!(stream_id = %self.session.stream_id, error = %e, "Failed to subscribe to signaling");
                self.state.send_replace(ConnectionState::Failed);
                return Err(e);
            }
        };

        self.state.send_replace(ConnectionState::Connected);
        info!(
            stream_id = %self.session.stream_id,
            broadcaster_id = %self.session.broadcaster_id,
            tier = %tier,
            "Broadcaster started"
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let actor = BroadcasterLoop {
            local_id: self.session.broadcaster_id.clone(),
            session: self.session.clone(),
            config: Arc::clone(&self.config),
            relay: Arc::clone(&self.relay),
            factory: Arc::clone(&self.factory),
            tracks: media_source.tracks(),
            sessions: HashMap::new(),
            default_tier: tier,
            thresholds: AdaptationThresholds {
                poor_rtt_ms: self.config.quality.poor_rtt_ms,
                good_rtt_ms: self.config.quality.good_rtt_ms,
            },
            state: Arc::clone(&self.state),
            viewer_count: Arc::clone(&self.viewer_count),
            tier: Arc::clone(&self.tier),
            stats: self.stats.clone(),
            events_tx,
            events_rx,
        };

        let actor = tokio::spawn(actor.run(subscription, self.cancel_token.clone()));
        let state = Arc::clone(&self.state);
        let stream_id = self.session.stream_id.clone();
        *self.task.lock() = Some(tokio::spawn(async move {
            if let Err(e) = actor.await {
                error!(stream_id = %stream_id, error = %e, "Broadcaster loop terminated abnormally");
                state.send_replace(ConnectionState::Failed);
            }
        }));

        Ok(())
    }

    /// Close every session and leave the signaling channel. Safe to call
    /// repeatedly; the broadcaster cannot be started afterwards.
    pub async fn stop(&self) {
        self.started.store(true, Ordering::SeqCst);
        self.cancel_token.cancel();

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(stream_id = %self.session.stream_id, error = %e, "Failed to join broadcaster task");
            }
            info!(stream_id = %self.session.stream_id, "Broadcaster stopped");
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

    /// Number of live viewer sessions
    #[must_use]
    pub fn viewer_count(&self) -> usize {
        *self.viewer_count.borrow()
    }

    #[must_use]
    pub fn subscribe_viewer_count(&self) -> watch::Receiver<usize> {
        self.viewer_count.subscribe()
    }

    /// Tier applied to newly joining viewers that do not request one
    #[must_use]
    pub fn current_tier(&self) -> QualityTier {
        *self.tier.borrow()
    }

    #[must_use]
    pub fn subscribe_tier(&self) -> watch::Receiver<QualityTier> {
        self.tier.subscribe()
    }

    /// Aggregated statistics, one snapshot per polling tick
    #[must_use]
    pub fn subscribe_stats(&self) -> broadcast::Receiver<StreamStats> {
        self.stats.subscribe()
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Event loop owning every [`PeerSession`]
struct BroadcasterLoop {
    local_id: PeerId,
    session: StreamSession,
    config: Arc<FanoutConfig>,
    relay: Arc<dyn SignalingRelay>,
    factory: Arc<dyn TransportFactory>,
    tracks: Vec<LocalTrack>,

    sessions: HashMap<ViewerId, PeerSession>,
    default_tier: QualityTier,
    thresholds: AdaptationThresholds,

    state: Arc<watch::Sender<ConnectionState>>,
    viewer_count: Arc<watch::Sender<usize>>,
    tier: Arc<watch::Sender<QualityTier>>,
    stats: broadcast::Sender<StreamStats>,

    events_tx: mpsc::UnboundedSender<(SessionKey, TransportEvent)>,
    events_rx: mpsc::UnboundedReceiver<(SessionKey, TransportEvent)>,
}

impl BroadcasterLoop {
    async fn run(mut self, mut subscription: Subscription, cancel_token: CancellationToken) {
        let period = self.config.timing.broadcaster_poll_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            stream_id = %self.session.stream_id,
            interval_ms = period.as_millis() as u64,
            "Starting broadcaster loop"
        );

        let mut final_state = ConnectionState::Disconnected;
        loop {
            tokio::select! {
                () = cancel_token.cancelled() => break,
                message = subscription.messages.recv() => match message {
                    Some(message) => self.handle_signaling(message).await,
                    None => {
                        error!(stream_id = %self.session.stream_id, "Signaling channel closed");
                        final_state = ConnectionState::Failed;
                        break;
                    }
                },
                Some((key, event)) = self.events_rx.recv() => {
                    self.handle_transport_event(key, event).await;
                }
                _ = ticker.tick() => self.poll_stats().await,
            }
        }

        self.shutdown(subscription, final_state).await;
    }

    async fn handle_signaling(&mut self, message: SignalingMessage) {
        if !message.is_relevant_to(&self.local_id) {
            return;
        }

        let viewer_id = message.sender_id;
        match message.payload {
            SignalingPayload::ViewerJoin { connection_id, tier } => {
                self.on_viewer_join(viewer_id, connection_id, tier).await;
            }
            SignalingPayload::Answer {
                connection_id,
                description,
            } => self.on_answer(&viewer_id, &connection_id, description).await,
            SignalingPayload::IceCandidate {
                connection_id,
                candidate,
            } => self.on_remote_candidate(&viewer_id, &connection_id, candidate).await,
            SignalingPayload::QualityChange { tier } => self.on_quality_change(&viewer_id, tier).await,
            SignalingPayload::Offer { .. } => {
                debug!(viewer_id = %viewer_id, "Ignoring offer sent to broadcaster");
            }
        }
    }

    async fn on_viewer_join(
        &mut self,
        viewer_id: ViewerId,
        connection_id: ConnectionId,
        requested: Option<QualityTier>,
    ) {
        if let Some(existing) = self.sessions.get(&viewer_id) {
            if existing.connection_id() == &connection_id {
                debug!(viewer_id = %viewer_id, connection_id = %connection_id, "Duplicate viewer-join ignored");
                return;
            }
            info!(
                viewer_id = %viewer_id,
                old_connection_id = %existing.connection_id(),
                connection_id = %connection_id,
                "Viewer rejoined, replacing session"
            );
            self.remove_session(&viewer_id, "replaced by new connection").await;
        }

        let tier = requested.unwrap_or(self.default_tier);
        let key = SessionKey {
            viewer_id: viewer_id.clone(),
            connection_id,
        };

        if let Err(e) = self.open_session(key, tier).await {
            if e.is_session_scoped() {
                warn!(viewer_id = %viewer_id, error = %e, "Failed to set up viewer session");
            } else {
                error!(viewer_id = %viewer_id, error = %e, "Failed to set up viewer session");
            }
            self.remove_session(&viewer_id, "negotiation failed").await;
        }
    }

    async fn open_session(&mut self, key: SessionKey, tier: QualityTier) -> Result<()> {
        let (transport, events) = self.factory.create(&self.config.ice).await?;
        let forwarder = forward_events(events, key.clone(), self.events_tx.clone());
        self.insert_session(PeerSession::new(key.clone(), transport.clone(), tier, forwarder));

        for track in &self.tracks {
            transport.add_track(track).await?;
        }

        let max_bitrate = self.config.quality.max_bitrate_per_peer_kbps;
        if let Some(session) = self.sessions.get_mut(&key.viewer_id) {
            session.apply_tier(tier, max_bitrate).await?;
        }

        let negotiation_failed = |e: Error| Error::Negotiation {
            viewer_id: key.viewer_id.clone(),
            reason: e.to_string(),
        };
        let offer = transport.create_offer().await.map_err(negotiation_failed)?;
        let sdp = reorder_codec_preference(&offer.sdp, &self.config.quality.preferred_codec)?;
        let offer = SessionDescription::offer(sdp);
        transport
            .set_local_description(offer.clone())
            .await
            .map_err(negotiation_failed)?;

        self.relay
            .publish(
                &self.session.stream_id,
                SignalingMessage::new(
                    self.session.stream_id.clone(),
                    self.local_id.clone(),
                    Some(key.viewer_id.clone()),
                    SignalingPayload::Offer {
                        connection_id: key.connection_id.clone(),
                        description: offer,
                    },
                ),
            )
            .await?;

        info!(
            viewer_id = %key.viewer_id,
            connection_id = %key.connection_id,
            tier = %tier,
            "Offer sent to viewer"
        );
        Ok(())
    }

    /// Session matching both the viewer and the connection incarnation
    fn session_mut(&mut self, viewer_id: &ViewerId, connection_id: &ConnectionId) -> Option<&mut PeerSession> {
        self.sessions
            .get_mut(viewer_id)
            .filter(|session| session.connection_id() == connection_id)
    }

    async fn on_answer(
        &mut self,
        viewer_id: &ViewerId,
        connection_id: &ConnectionId,
        description: SessionDescription,
    ) {
        let Some(session) = self.session_mut(viewer_id, connection_id) else {
            debug!(viewer_id = %viewer_id, connection_id = %connection_id, "Answer for unknown session ignored");
            return;
        };
        if session.has_remote_description() {
            debug!(viewer_id = %viewer_id, "Duplicate answer ignored");
            return;
        }

        let transport = Arc::clone(&session.transport);
        if let Err(e) = transport.set_remote_description(description).await {
            warn!(viewer_id = %viewer_id, error = %e, "Failed to apply answer");
            self.remove_session(viewer_id, "invalid answer").await;
            return;
        }
        if let Some(session) = self.session_mut(viewer_id, connection_id) {
            session.drain_candidates().await;
        }

        debug!(viewer_id = %viewer_id, "Answer applied");
    }

    async fn on_remote_candidate(
        &mut self,
        viewer_id: &ViewerId,
        connection_id: &ConnectionId,
        candidate: IceCandidate,
    ) {
        match self.session_mut(viewer_id, connection_id) {
            Some(session) => session.add_remote_candidate(candidate).await,
            None => {
                debug!(viewer_id = %viewer_id, connection_id = %connection_id, "Candidate for unknown session ignored");
            }
        }
    }

    async fn on_quality_change(&mut self, viewer_id: &ViewerId, tier: QualityTier) {
        let max_bitrate = self.config.quality.max_bitrate_per_peer_kbps;
        let Some(session) = self.sessions.get_mut(viewer_id) else {
            debug!(viewer_id = %viewer_id, "Quality change for unknown session ignored");
            return;
        };

        let previous = session.tier;
        match session.apply_tier(tier, max_bitrate).await {
            Ok(()) => info!(viewer_id = %viewer_id, from = %previous, to = %tier, "Viewer quality changed"),
            Err(e) => warn!(viewer_id = %viewer_id, tier = %tier, error = %e, "Failed to change viewer quality"),
        }
    }

    async fn handle_transport_event(&mut self, key: SessionKey, event: TransportEvent) {
        let current = self
            .sessions
            .get(&key.viewer_id)
            .is_some_and(|session| session.key == key);
        if !current {
            debug!(viewer_id = %key.viewer_id, connection_id = %key.connection_id, "Event from stale session ignored");
            return;
        }

        match event {
            TransportEvent::IceCandidate(candidate) => {
                let message = SignalingMessage::new(
                    self.session.stream_id.clone(),
                    self.local_id.clone(),
                    Some(key.viewer_id.clone()),
                    SignalingPayload::IceCandidate {
                        connection_id: key.connection_id,
                        candidate,
                    },
                );
                if let Err(e) = self.relay.publish(&self.session.stream_id, message).await {
                    warn!(viewer_id = %key.viewer_id, error = %e, "Failed to publish local candidate");
                }
            }
            TransportEvent::StateChange(state) if state.is_terminal() => {
                info!(viewer_id = %key.viewer_id, state = ?state, "Viewer transport ended");
                self.remove_session(&key.viewer_id, "transport ended").await;
            }
            TransportEvent::StateChange(TransportState::Connected) => {
                info!(viewer_id = %key.viewer_id, "Viewer connected");
            }
            TransportEvent::StateChange(state) => {
                debug!(viewer_id = %key.viewer_id, state = ?state, "Viewer transport state changed");
            }
            TransportEvent::Track(track) => {
                debug!(viewer_id = %key.viewer_id, track_id = %track.id, "Ignoring inbound track on outbound session");
            }
        }
    }

    /// The only insertion path; keeps the observable count equal to the map size
    fn insert_session(&mut self, session: PeerSession) {
        let viewer_id = session.viewer_id().clone();
        self.sessions.insert(viewer_id.clone(), session);
        self.viewer_count.send_replace(self.sessions.len());
        info!(viewer_id = %viewer_id, viewer_count = self.sessions.len(), "Viewer session created");
    }

    /// The only removal path; keeps the observable count equal to the map size
    async fn remove_session(&mut self, viewer_id: &ViewerId, reason: &str) {
        let Some(session) = self.sessions.remove(viewer_id) else {
            return;
        };
        self.viewer_count.send_replace(self.sessions.len());
        info!(
            viewer_id = %viewer_id,
            reason,
            viewer_count = self.sessions.len(),
            "Viewer session removed"
        );
        session.close().await;
    }

    async fn poll_stats(&mut self) {
        if self.sessions.is_empty() {
            return;
        }

        let timeout = self.config.timing.stats_timeout();
        let polls = self.sessions.values().map(|session| {
            let viewer_id = session.viewer_id().clone();
            let transport = Arc::clone(&session.transport);
            async move {
                let report = tokio::time::timeout(timeout, transport.stats())
                    .await
                    .unwrap_or_else(|_| Err(Error::Timeout(format!("statistics after {timeout:?}"))));
                (viewer_id, report)
            }
        });
        let results = futures::future::join_all(polls).await;

        let mut snapshots = Vec::with_capacity(results.len());
        for (viewer_id, result) in results {
            let report = match result {
                Ok(report) => report,
                Err(e) => {
                    debug!(viewer_id = %viewer_id, error = %e, "Skipping statistics for this tick");
                    continue;
                }
            };
            if let Some(session) = self.sessions.get_mut(&viewer_id) {
                snapshots.push(session.record_stats(report));
            }
        }

        let Some(aggregate) = StreamStats::aggregate(&snapshots) else {
            return;
        };
        // No receivers is fine
        let _ = self.stats.send(aggregate.clone());

        let next = adapt_tier(self.default_tier, &aggregate, &self.thresholds);
        if next != self.default_tier {
            info!(
                from = %self.default_tier,
                to = %next,
                rtt_ms = ?aggregate.rtt_ms,
                packets_lost = aggregate.packets_lost,
                limitation = ?aggregate.quality_limitation_reason,
                "Default quality tier adapted"
            );
            self.default_tier = next;
            self.tier.send_replace(next);
        }
    }

    async fn shutdown(mut self, subscription: Subscription, final_state: ConnectionState) {
        let viewers: Vec<ViewerId> = self.sessions.keys().cloned().collect();
        for viewer_id in viewers {
            self.remove_session(&viewer_id, "broadcaster stopped").await;
        }

        if let Err(e) = self.relay.unsubscribe(&subscription.id).await {
            warn!(stream_id = %self.session.stream_id, error = %e, "Failed to unsubscribe from signaling");
        }

        self.state.send_replace(final_state);
        info!(stream_id = %self.session.stream_id, state = %final_state, "Broadcaster loop finished");
    }
}
