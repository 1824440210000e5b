//! In-process peer runtime and capture devices for driving sessions without a network

#![allow(dead_code)]

use async_trait::async_trait;
use chatcast::peer::{LocalTrack, MediaConstraints, MediaDevices, PeerConnection, PeerFactory};
use chatcast::{
    CandidateJson, CastConfig, ChannelStreamState, ConnectionState, Error, MemorySignalingChannel,
    PeerEvent, PeerEventSink, RemoteTrack, Result, SessionContext, SessionDescription,
    SessionEvent, SignalingChannel, Subscription, TrackKind,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

pub const CHANNEL: &str = "general";

/// Holds peers inside answer creation (broadcaster) or answer application
/// (viewer) until released
#[derive(Default)]
pub struct Gate {
    held: AtomicBool,
    waiting: AtomicUsize,
    opened: Notify,
}

impl Gate {
    pub fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
        self.opened.notify_waiters();
    }

    /// Peers currently parked at the gate
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    async fn pass(&self) {
        if !self.held.load(Ordering::SeqCst) {
            return;
        }
        let _parked = Parked::new(&self.waiting);
        loop {
            let opened = self.opened.notified();
            if !self.held.load(Ordering::SeqCst) {
                return;
            }
            opened.await;
        }
    }
}

/// Counts a parked peer for as long as its future lives
struct Parked<'a>(&'a AtomicUsize);

impl<'a> Parked<'a> {
    fn new(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count)
    }
}

impl Drop for Parked<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One fake peer connection.
///
/// Candidates are rejected until a remote description is set, like a real
/// peer connection, so tests catch any candidate applied too early.
pub struct FakePeer {
    sink: PeerEventSink,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    applied: Mutex<Vec<CandidateJson>>,
    tracks: Mutex<Vec<String>>,
    receivers: Mutex<Vec<TrackKind>>,
    close_calls: AtomicUsize,
    fail_close: bool,
    candidates: usize,
    gate: Arc<Gate>,
}

impl FakePeer {
    pub fn link_id(&self) -> &str {
        self.sink.link_id()
    }

    pub fn is_closed(&self) -> bool {
        self.close_calls.load(Ordering::SeqCst) > 0
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().unwrap().clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().unwrap().clone()
    }

    /// Remote candidates in the order they were applied
    pub fn applied_candidates(&self) -> Vec<String> {
        self.applied
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.candidate.clone())
            .collect()
    }

    pub fn track_ids(&self) -> Vec<String> {
        self.tracks.lock().unwrap().clone()
    }

    pub fn receivers(&self) -> Vec<TrackKind> {
        self.receivers.lock().unwrap().clone()
    }

    /// Simulate the runtime reporting a state change
    pub fn report_state(&self, state: ConnectionState) {
        self.sink.emit(PeerEvent::StateChanged(state));
    }

    /// Simulate the runtime trickling one more local candidate
    pub fn gather(&self, candidate: &str) {
        self.sink
            .emit(PeerEvent::LocalCandidate(CandidateJson::new(candidate)));
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::Negotiation("peer connection is closed".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        self.check_open()?;
        self.tracks.lock().unwrap().push(track.id().to_string());
        Ok(())
    }

    async fn add_receiver(&self, kind: TrackKind) -> Result<()> {
        self.check_open()?;
        self.receivers.lock().unwrap().push(kind);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.check_open()?;
        Ok(SessionDescription::offer(format!(
            "v=0 offer from {} recv {:?}",
            self.link_id(),
            self.receivers()
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.check_open()?;
        self.gate.pass().await;
        let remote = self.remote_description().ok_or_else(|| {
            Error::Negotiation("cannot answer without a remote description".into())
        })?;
        Ok(SessionDescription::answer(format!(
            "v=0 answer from {} to [{}] send {:?}",
            self.link_id(),
            remote.sdp,
            self.track_ids()
        )))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<()> {
        self.check_open()?;
        *self.local.lock().unwrap() = Some(desc.clone());
        for n in 0..self.candidates {
            self.sink.emit(PeerEvent::LocalCandidate(CandidateJson::new(format!(
                "candidate:{n} 1 udp 2130706431 10.0.0.{n} 5000 typ host ufrag {}",
                self.link_id()
            ))));
        }
        if desc.is_answer() {
            self.sink
                .emit(PeerEvent::StateChanged(ConnectionState::Connecting));
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<()> {
        self.check_open()?;
        if !desc.sdp.starts_with("v=0") {
            return Err(Error::Negotiation(format!("malformed {}", desc.sdp_type)));
        }
        if desc.is_answer() {
            self.gate.pass().await;
        }
        *self.remote.lock().unwrap() = Some(desc.clone());
        if desc.is_answer() {
            self.sink
                .emit(PeerEvent::StateChanged(ConnectionState::Connected));
            self.sink.emit(PeerEvent::RemoteTrack(RemoteTrack::new(
                "camera",
                "cast",
                TrackKind::Video,
            )));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: CandidateJson) -> Result<()> {
        self.check_open()?;
        if self.remote_description().is_none() {
            return Err(Error::Negotiation(
                "candidate applied before the remote description".into(),
            ));
        }
        self.applied.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let previous = self.close_calls.fetch_add(1, Ordering::SeqCst);
        if previous == 0 {
            self.sink.emit(PeerEvent::StateChanged(ConnectionState::Closed));
        }
        if self.fail_close {
            return Err(Error::Transport("close blew up".into()));
        }
        Ok(())
    }
}

/// Peer factory handing out [`FakePeer`]s and remembering every one of them
#[derive(Default)]
pub struct FakeNetwork {
    peers: Mutex<Vec<Arc<FakePeer>>>,
    fail_create: AtomicBool,
    fail_close: AtomicBool,
    candidates: AtomicUsize,
    gate: Arc<Gate>,
}

impl FakeNetwork {
    pub fn new() -> Arc<Self> {
        let network = Self::default();
        network.candidates.store(1, Ordering::SeqCst);
        Arc::new(network)
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    /// Local candidates each new peer gathers after `set_local_description`
    pub fn set_candidates_per_peer(&self, n: usize) {
        self.candidates.store(n, Ordering::SeqCst);
    }

    /// Shared by every peer this network creates
    pub fn gate(&self) -> &Gate {
        &self.gate
    }

    pub fn peers(&self) -> Vec<Arc<FakePeer>> {
        self.peers.lock().unwrap().clone()
    }

    pub fn created(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn open_peers(&self) -> usize {
        self.peers().iter().filter(|p| !p.is_closed()).count()
    }

    pub fn last(&self) -> Arc<FakePeer> {
        self.peers().last().cloned().expect("no peer created yet")
    }
}

#[async_trait]
impl PeerFactory for FakeNetwork {
    async fn create_peer(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Error::Negotiation("peer runtime unavailable".into()));
        }
        let peer = Arc::new(FakePeer {
            sink: events,
            local: Mutex::new(None),
            remote: Mutex::new(None),
            applied: Mutex::new(Vec::new()),
            tracks: Mutex::new(Vec::new()),
            receivers: Mutex::new(Vec::new()),
            close_calls: AtomicUsize::new(0),
            fail_close: self.fail_close.load(Ordering::SeqCst),
            candidates: self.candidates.load(Ordering::SeqCst),
            gate: self.gate.clone(),
        });
        self.peers.lock().unwrap().push(peer.clone());
        Ok(peer)
    }
}

/// Capture devices that can be switched off, remembering every track issued
#[derive(Default)]
pub struct FakeCamera {
    denied: AtomicBool,
    issued: Mutex<Vec<LocalTrack>>,
}

impl FakeCamera {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn deny(&self) {
        self.denied.store(true, Ordering::SeqCst);
    }

    pub fn issued(&self) -> Vec<LocalTrack> {
        self.issued.lock().unwrap().clone()
    }

    pub fn live_tracks(&self) -> usize {
        self.issued().iter().filter(|t| t.is_live()).count()
    }
}

#[async_trait]
impl MediaDevices for FakeCamera {
    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<Vec<LocalTrack>> {
        if self.denied.load(Ordering::SeqCst) {
            return Err(Error::MediaAccess("permission denied".into()));
        }
        let n = self.issued.lock().unwrap().len();
        let mut tracks = vec![LocalTrack::new(
            TrackKind::Video,
            format!("camera-{n}"),
            "cast",
        )];
        if constraints.audio {
            tracks.push(LocalTrack::new(TrackKind::Audio, format!("mic-{n}"), "cast"));
        }
        self.issued.lock().unwrap().extend(tracks.iter().cloned());
        Ok(tracks)
    }
}

/// One participant: its own peer runtime and camera over the shared store
pub struct Participant {
    pub ctx: SessionContext,
    pub network: Arc<FakeNetwork>,
    pub camera: Arc<FakeCamera>,
}

pub fn participant(store: &Arc<MemorySignalingChannel>) -> Participant {
    let network = FakeNetwork::new();
    let camera = FakeCamera::new();
    let ctx = SessionContext::new(
        store.clone(),
        network.clone(),
        camera.clone(),
        CastConfig {
            ice_servers: vec![],
            audio: false,
        },
    );
    Participant {
        ctx,
        network,
        camera,
    }
}

pub fn store() -> Arc<MemorySignalingChannel> {
    chatcast::logger::init();
    Arc::new(MemorySignalingChannel::new())
}

/// Poll `check` until it holds, failing the test after two seconds
pub async fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Let spawned tasks run without expecting any particular outcome
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

pub async fn snapshot(store: &MemorySignalingChannel) -> ChannelStreamState {
    store.read_state(CHANNEL).await.unwrap()
}

/// Poll the document until `check` holds
pub async fn eventually_doc<F>(store: &MemorySignalingChannel, what: &str, mut check: F)
where
    F: FnMut(&ChannelStreamState) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check(&snapshot(store).await) {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Skip events until one matches
pub async fn wait_event<F>(
    rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
    what: &str,
    mut matches: F,
) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    let wait = async {
        while let Some(event) = rx.recv().await {
            if matches(&event) {
                return Some(event);
            }
        }
        None
    };
    match tokio::time::timeout(Duration::from_secs(2), wait).await {
        Ok(Some(event)) => event,
        Ok(None) => panic!("event stream closed before {what}"),
        Err(_) => panic!("timed out waiting for {what}"),
    }
}

/// Events already queued, without waiting
pub fn drain_events(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Snapshots already delivered to `sub`, stopping once it goes quiet
pub async fn drain_snapshots(sub: &mut Subscription) -> Vec<ChannelStreamState> {
    let mut seen = Vec::new();
    while let Ok(Some(state)) = tokio::time::timeout(Duration::from_millis(20), sub.next()).await {
        seen.push(state);
    }
    seen
}
