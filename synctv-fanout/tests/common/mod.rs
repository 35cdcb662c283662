//! Shared fakes for the session manager integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use std::sync::Arc;
use synctv_fanout::config::IceConfig;
use synctv_fanout::quality::{CaptureConstraints, EncodingParameters};
use synctv_fanout::signaling::{Subscription, SubscriptionId};
use synctv_fanout::stats::TransportStats;
use synctv_fanout::transport::{
    IceCandidate, LocalTrack, MediaKind, MediaSink, MediaSource, PeerTransport, RemoteTrack, SessionDescription,
    TransportEvent, TransportEvents, TransportFactory, TransportState,
};
use synctv_fanout::{Error, NetworkInfo, NetworkObserver, Result, SignalingMessage, SignalingRelay, StreamId};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// Offer produced by every fake transport; VP8 is listed before H264
pub const FAKE_OFFER: &str = "v=0\r\n\
o=- 1 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
a=rtpmap:111 opus/48000/2\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96 97 102\r\n\
a=rtpmap:96 VP8/90000\r\n\
a=rtpmap:97 rtx/90000\r\n\
a=rtpmap:102 H264/90000\r\n";

pub const FAKE_ANSWER: &str = "v=0\r\no=- 3 4 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

/// Operations recorded by [`FakeTransport`], in call order
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    CreateOffer,
    CreateAnswer,
    SetLocal(SessionDescription),
    SetRemote(SessionDescription),
    AddCandidate(IceCandidate),
    AddTrack(String),
    SetEncoding(EncodingParameters),
    Close,
}

pub struct FakeTransport {
    pub created_at: Instant,
    calls: Mutex<Vec<Call>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    stats: Mutex<Option<TransportStats>>,
    encoding: Mutex<Option<EncodingParameters>>,
    fail_set_remote: AtomicBool,
    closed: AtomicBool,
}

impl FakeTransport {
    fn new() -> (Arc<Self>, TransportEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            created_at: Instant::now(),
            calls: Mutex::new(Vec::new()),
            events,
            stats: Mutex::new(None),
            encoding: Mutex::new(None),
            fail_set_remote: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        (transport, rx)
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn emit_state(&self, state: TransportState) {
        self.emit(TransportEvent::StateChange(state));
    }

    pub fn emit_track(&self, id: &str, kind: MediaKind) {
        self.emit(TransportEvent::Track(RemoteTrack::new(id, kind, Arc::new(()))));
    }

    pub fn set_stats(&self, stats: TransportStats) {
        *self.stats.lock() = Some(stats);
    }

    pub fn fail_set_remote(&self) {
        self.fail_set_remote.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.calls().into_iter().find_map(|call| match call {
            Call::SetRemote(description) => Some(description),
            _ => None,
        })
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.calls().into_iter().find_map(|call| match call {
            Call::SetLocal(description) => Some(description),
            _ => None,
        })
    }

    pub fn added_candidates(&self) -> Vec<IceCandidate> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::AddCandidate(candidate) => Some(candidate),
                _ => None,
            })
            .collect()
    }

    pub fn added_tracks(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::AddTrack(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn current_encoding(&self) -> Option<EncodingParameters> {
        *self.encoding.lock()
    }

    pub fn encoding_updates(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::SetEncoding(_)))
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.record(Call::CreateOffer);
        Ok(SessionDescription::offer(FAKE_OFFER))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.record(Call::CreateAnswer);
        Ok(SessionDescription::answer(FAKE_ANSWER))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.record(Call::SetLocal(description));
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        if self.fail_set_remote.load(Ordering::SeqCst) {
            return Err(Error::InvalidSdp("rejected by fake transport".to_string()));
        }
        self.record(Call::SetRemote(description));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.record(Call::AddCandidate(candidate));
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        self.record(Call::AddTrack(track.id.clone()));
        Ok(())
    }

    async fn encoding_parameters(&self) -> Option<EncodingParameters> {
        *self.encoding.lock()
    }

    async fn set_encoding_parameters(&self, parameters: EncodingParameters) -> Result<()> {
        self.record(Call::SetEncoding(parameters));
        *self.encoding.lock() = Some(parameters);
        Ok(())
    }

    async fn stats(&self) -> Result<TransportStats> {
        self.stats
            .lock()
            .clone()
            .ok_or_else(|| Error::Transport("no statistics yet".to_string()))
    }

    async fn close(&self) -> Result<()> {
        self.record(Call::Close);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out [`FakeTransport`]s and keeps every one it created
pub struct FakeFactory {
    transports: Mutex<Vec<Arc<FakeTransport>>>,
    created: watch::Sender<usize>,
    fail_create: AtomicBool,
    fail_on_connect: AtomicBool,
    panic_on_create: AtomicBool,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        let (created, _) = watch::channel(0);
        Arc::new(Self {
            transports: Mutex::new(Vec::new()),
            created,
            fail_create: AtomicBool::new(false),
            fail_on_connect: AtomicBool::new(false),
            panic_on_create: AtomicBool::new(false),
        })
    }

    /// Every new transport reports `failed` right after creation
    pub fn fail_on_connect(&self, fail: bool) {
        self.fail_on_connect.store(fail, Ordering::SeqCst);
    }

    /// Crash whichever task calls `create`
    pub fn panic_on_create(&self, panic: bool) {
        self.panic_on_create.store(panic, Ordering::SeqCst);
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn transports(&self) -> Vec<Arc<FakeTransport>> {
        self.transports.lock().clone()
    }

    pub fn transport(&self, index: usize) -> Arc<FakeTransport> {
        self.transports.lock()[index].clone()
    }

    pub fn created(&self) -> usize {
        self.transports.lock().len()
    }

    /// Resolves once `count` transports exist; lets paused time auto-advance
    pub async fn wait_for_created(&self, count: usize) {
        let mut rx = self.created.subscribe();
        rx.wait_for(|created| *created >= count).await.unwrap();
    }
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn create(&self, _ice: &IceConfig) -> Result<(Arc<dyn PeerTransport>, TransportEvents)> {
        assert!(!self.panic_on_create.load(Ordering::SeqCst), "transport factory crashed");
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Error::Transport("factory unavailable".to_string()));
        }

        let (transport, events) = FakeTransport::new();
        if self.fail_on_connect.load(Ordering::SeqCst) {
            transport.emit_state(TransportState::Failed);
        }

        let count = {
            let mut transports = self.transports.lock();
            transports.push(transport.clone());
            transports.len()
        };
        self.created.send_replace(count);

        Ok((transport, events))
    }
}

/// Capture with one audio and one video track
#[derive(Default)]
pub struct FakeMediaSource {
    pub constraints: Mutex<Vec<CaptureConstraints>>,
    pub reject_constraints: bool,
}

#[async_trait]
impl MediaSource for FakeMediaSource {
    fn tracks(&self) -> Vec<LocalTrack> {
        vec![
            LocalTrack::new("audio", MediaKind::Audio, Arc::new(()) as Arc<dyn Any + Send + Sync>),
            LocalTrack::new("video", MediaKind::Video, Arc::new(()) as Arc<dyn Any + Send + Sync>),
        ]
    }

    async fn apply_constraints(&self, constraints: CaptureConstraints) -> Result<()> {
        self.constraints.lock().push(constraints);
        if self.reject_constraints {
            return Err(Error::Transport("camera busy".to_string()));
        }
        Ok(())
    }
}

/// Remembers every track handed to the viewer output
#[derive(Default)]
pub struct RecordingSink {
    tracks: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn track_ids(&self) -> Vec<String> {
        self.tracks.lock().clone()
    }
}

impl MediaSink for RecordingSink {
    fn on_track(&self, track: RemoteTrack) {
        self.tracks.lock().push(track.id);
    }
}

/// Relay whose every operation fails
pub struct FailingRelay;

#[async_trait]
impl SignalingRelay for FailingRelay {
    async fn subscribe(&self, _stream_id: &StreamId) -> Result<Subscription> {
        Err(Error::Signaling("relay unreachable".to_string()))
    }

    async fn publish(&self, _stream_id: &StreamId, _message: SignalingMessage) -> Result<()> {
        Err(Error::Signaling("relay unreachable".to_string()))
    }

    async fn unsubscribe(&self, _subscription: &SubscriptionId) -> Result<()> {
        Ok(())
    }
}

/// In-process relay that can drop every subscriber's channel at once
#[derive(Default)]
pub struct ClosableRelay {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SignalingMessage>>>,
}

impl ClosableRelay {
    /// Subscribers see their message stream end
    pub fn close_all(&self) {
        self.subscribers.lock().clear();
    }
}

#[async_trait]
impl SignalingRelay for ClosableRelay {
    async fn subscribe(&self, _stream_id: &StreamId) -> Result<Subscription> {
        let (sender, messages) = mpsc::unbounded_channel();
        self.subscribers.lock().push(sender);
        Ok(Subscription {
            id: format!("sub-{}", self.subscribers.lock().len()),
            messages,
        })
    }

    async fn publish(&self, _stream_id: &StreamId, message: SignalingMessage) -> Result<()> {
        for subscriber in self.subscribers.lock().iter() {
            let _ = subscriber.send(message.clone());
        }
        Ok(())
    }

    async fn unsubscribe(&self, _subscription: &SubscriptionId) -> Result<()> {
        Ok(())
    }
}

/// Answers the first sample at once; every later one hangs for a minute
pub struct StallingNetwork {
    info: NetworkInfo,
    samples: AtomicUsize,
}

impl StallingNetwork {
    pub fn new(info: NetworkInfo) -> Self {
        Self {
            info,
            samples: AtomicUsize::new(0),
        }
    }

    pub fn samples(&self) -> usize {
        self.samples.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NetworkObserver for StallingNetwork {
    async fn sample(&self) -> NetworkInfo {
        if self.samples.fetch_add(1, Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        self.info
    }
}

/// Let spawned tasks drain their queues without advancing the clock
pub async fn settle() {
    for _ in 0..100 {
        tokio::task::yield_now().await;
    }
}

/// Yield until `check` holds
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if check() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

/// Next message on `subscription` accepted by `filter`
pub async fn next_message(
    subscription: &mut Subscription,
    mut filter: impl FnMut(&SignalingMessage) -> bool,
) -> SignalingMessage {
    loop {
        let message = subscription.messages.recv().await.expect("relay closed");
        if filter(&message) {
            return message;
        }
    }
}
