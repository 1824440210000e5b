//! Broadcaster side: local capture plus one answering peer connection per viewer

use crate::error::{Error, Result};
use crate::peer::{
    apply_candidates, CandidateQueue, LocalTrack, MediaConstraints, PeerConnection, PeerEvent,
    PeerEventSink,
};
use crate::session::{close_quietly, notify, EventTx, SessionContext, SessionEvent};
use crate::signaling::{
    CandidateOrigin, ChannelStreamState, PeerRecord, SessionDescription, StateUpdate,
    Subscription, ViewerId,
};
use crate::utils::random_id;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct ViewerLink {
    link_id: String,
    peer: Arc<dyn PeerConnection>,
    queue: CandidateQueue,
    /// High-water mark into the record's `viewerCandidates`
    seen_candidates: usize,
    answered: bool,
}

#[derive(Default)]
struct BroadcastState {
    closed: bool,
    /// The latest snapshot names us as the streamer
    confirmed: bool,
    tracks: Vec<LocalTrack>,
    links: HashMap<ViewerId, ViewerLink>,
    /// Viewers whose current offer failed negotiation, keyed to that offer's SDP
    rejected: HashMap<ViewerId, String>,
    last_snapshot: Option<ChannelStreamState>,
}

/// The live link for `viewer`, unless the session closed, lost its claim or
/// replaced the link
fn live_link<'a>(
    st: &'a mut BroadcastState,
    viewer: &str,
    link_id: &str,
) -> Option<&'a mut ViewerLink> {
    if st.closed || !st.confirmed {
        return None;
    }
    st.links.get_mut(viewer).filter(|l| l.link_id == link_id)
}

struct Shared {
    channel_id: String,
    user_id: String,
    started_at: DateTime<Utc>,
    ctx: SessionContext,
    state: Mutex<BroadcastState>,
    peer_tx: mpsc::UnboundedSender<(String, PeerEvent)>,
    events: EventTx,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BroadcastState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn on_snapshot(&self, snapshot: ChannelStreamState) {
        let holds_claim = snapshot.current_streamer.as_deref() == Some(self.user_id.as_str());
        let lost = {
            let mut st = self.lock();
            if st.closed {
                return;
            }
            if holds_claim {
                st.confirmed = true;
                st.last_snapshot = Some(snapshot.clone());
                None
            } else if st.confirmed {
                warn!(
                    "Channel {} now shows streamer {:?}; closing {} viewer link(s)",
                    self.channel_id,
                    snapshot.current_streamer,
                    st.links.len()
                );
                st.confirmed = false;
                st.last_snapshot = None;
                st.rejected.clear();
                Some(st.links.drain().collect::<Vec<_>>())
            } else {
                return;
            }
        };
        match lost {
            // the new owner's records are not ours to write into
            Some(links) => {
                for (viewer, link) in links {
                    close_quietly(&viewer, link.peer).await;
                }
            }
            None => self.reconcile(&snapshot).await,
        }
    }

    async fn reconcile(&self, snapshot: &ChannelStreamState) {
        let vanished: Vec<(ViewerId, ViewerLink)> = {
            let mut st = self.lock();
            st.rejected
                .retain(|viewer, _| snapshot.connections.contains_key(viewer));
            let gone: Vec<ViewerId> = st
                .links
                .keys()
                .filter(|viewer| !snapshot.connections.contains_key(*viewer))
                .cloned()
                .collect();
            gone.into_iter()
                .filter_map(|viewer| st.links.remove(&viewer).map(|link| (viewer, link)))
                .collect()
        };
        for (viewer, link) in vanished {
            info!("Viewer {} left channel {}", viewer, self.channel_id);
            close_quietly(&viewer, link.peer).await;
        }

        for (viewer, record) in &snapshot.connections {
            let known = self.lock().links.contains_key(viewer);
            if known {
                self.feed_viewer_candidates(viewer, record).await;
            } else if record.awaiting_answer() && !self.is_rejected(viewer, record) {
                self.answer_viewer(viewer, record).await;
            }
        }
    }

    fn is_rejected(&self, viewer: &str, record: &PeerRecord) -> bool {
        let st = self.lock();
        match (st.rejected.get(viewer), record.offer.as_ref()) {
            (Some(sdp), Some(offer)) => *sdp == offer.sdp,
            _ => false,
        }
    }

    async fn answer_viewer(&self, viewer: &str, record: &PeerRecord) {
        let Some(offer) = record.offer.clone() else {
            return;
        };
        if !offer.is_offer() {
            let err = Error::Negotiation(format!(
                "viewer {viewer} published a {:?} where an offer was expected",
                offer.sdp_type
            ));
            self.reject(viewer, &offer, None, err).await;
            return;
        }

        info!("Answering viewer {} on channel {}", viewer, self.channel_id);
        let link_id = random_id();
        let sink = PeerEventSink::new(link_id.clone(), self.peer_tx.clone());
        let peer = match self.ctx.peers.create_peer(sink).await {
            Ok(peer) => peer,
            Err(e) => {
                self.reject(viewer, &offer, None, e).await;
                return;
            }
        };

        // register before the next await so a concurrent stop() closes it
        let tracks = {
            let mut st = self.lock();
            if st.closed || !st.confirmed {
                None
            } else {
                let mut queue = CandidateQueue::new();
                for candidate in &record.viewer_candidates {
                    let _ = queue.enqueue(candidate.clone());
                }
                st.links.insert(
                    viewer.to_string(),
                    ViewerLink {
                        link_id: link_id.clone(),
                        peer: peer.clone(),
                        queue,
                        seen_candidates: record.viewer_candidates.len(),
                        answered: false,
                    },
                );
                Some(st.tracks.clone())
            }
        };
        let Some(tracks) = tracks else {
            close_quietly(viewer, peer).await;
            return;
        };

        match self
            .negotiate(viewer, &link_id, peer.as_ref(), &tracks, &offer)
            .await
        {
            Ok(true) => info!("Answer for viewer {} published", viewer),
            Ok(false) => debug!("Viewer {}: session moved on, negotiation discarded", viewer),
            Err(e) => self.reject(viewer, &offer, Some(&link_id), e).await,
        }
    }

    /// `Ok(false)` when the session closed or the link was replaced mid-flight
    async fn negotiate(
        &self,
        viewer: &str,
        link_id: &str,
        peer: &dyn PeerConnection,
        tracks: &[LocalTrack],
        offer: &SessionDescription,
    ) -> Result<bool> {
        for track in tracks {
            peer.add_track(track).await?;
        }
        peer.set_remote_description(offer).await?;

        let buffered = {
            let mut st = self.lock();
            match live_link(&mut st, viewer, link_id) {
                Some(link) => link.queue.on_remote_description_set(),
                None => return Ok(false),
            }
        };
        apply_candidates(peer, viewer, buffered).await;

        let answer = peer.create_answer().await?;
        peer.set_local_description(&answer).await?;
        if live_link(&mut self.lock(), viewer, link_id).is_none() {
            return Ok(false);
        }

        self.ctx
            .signaling
            .update_state(
                &self.channel_id,
                StateUpdate::PutAnswer {
                    viewer: viewer.to_string(),
                    answer,
                },
            )
            .await?;

        let mut st = self.lock();
        match live_link(&mut st, viewer, link_id) {
            Some(link) => {
                link.answered = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn reject(
        &self,
        viewer: &str,
        offer: &SessionDescription,
        link_id: Option<&str>,
        error: Error,
    ) {
        warn!("Negotiation with viewer {} failed: {}", viewer, error);
        let link = {
            let mut st = self.lock();
            st.rejected.insert(viewer.to_string(), offer.sdp.clone());
            let owned = link_id.is_some_and(|id| {
                st.links
                    .get(viewer)
                    .is_some_and(|link| link.link_id == id)
            });
            if owned {
                st.links.remove(viewer)
            } else {
                None
            }
        };
        if let Some(link) = link {
            close_quietly(viewer, link.peer).await;
        }
        notify(
            &self.events,
            SessionEvent::ViewerDropped {
                viewer: viewer.to_string(),
                error,
            },
        );
    }

    async fn feed_viewer_candidates(&self, viewer: &str, record: &PeerRecord) {
        let (peer, ready) = {
            let mut st = self.lock();
            let Some(link) = st.links.get_mut(viewer) else {
                return;
            };
            if record.viewer_candidates.len() <= link.seen_candidates {
                return;
            }
            let fresh = record.viewer_candidates[link.seen_candidates..].to_vec();
            link.seen_candidates = record.viewer_candidates.len();
            let ready: Vec<_> = fresh
                .into_iter()
                .filter_map(|c| link.queue.enqueue(c))
                .collect();
            (link.peer.clone(), ready)
        };
        apply_candidates(peer.as_ref(), viewer, ready).await;
    }

    async fn on_peer_event(&self, link_id: &str, event: PeerEvent) {
        let viewer = {
            let st = self.lock();
            if st.closed {
                return;
            }
            st.links
                .iter()
                .find(|(_, link)| link.link_id == link_id)
                .map(|(viewer, _)| viewer.clone())
        };
        let Some(viewer) = viewer else {
            debug!("Dropping event from retired link {}", link_id);
            return;
        };

        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let update = StateUpdate::AppendCandidate {
                    viewer: viewer.clone(),
                    origin: CandidateOrigin::Streamer,
                    candidate,
                };
                if let Err(e) = self
                    .ctx
                    .signaling
                    .update_state(&self.channel_id, update)
                    .await
                {
                    warn!("Failed to publish candidate for viewer {}: {}", viewer, e);
                }
            }
            PeerEvent::StateChanged(state) => {
                info!("Viewer {} connection state: {:?}", viewer, state);
                if state.is_terminal() {
                    self.forget_link(&viewer, link_id).await;
                }
            }
            PeerEvent::RemoteTrack(track) => {
                debug!("Ignoring {:?} track {} sent by viewer {}", track.kind(), track.id(), viewer);
            }
        }
    }

    /// Drop a dead link and look at the last snapshot again, so a fresh
    /// offer from the same viewer gets answered
    async fn forget_link(&self, viewer: &str, link_id: &str) {
        let (link, snapshot) = {
            let mut st = self.lock();
            let owned = st
                .links
                .get(viewer)
                .is_some_and(|link| link.link_id == link_id);
            let link = if owned { st.links.remove(viewer) } else { None };
            (link, st.last_snapshot.clone())
        };
        let Some(link) = link else {
            return;
        };
        info!(
            "Viewer {} link closed (answered: {}), releasing it",
            viewer, link.answered
        );
        close_quietly(viewer, link.peer).await;
        if let Some(snapshot) = snapshot {
            self.reconcile(&snapshot).await;
        }
    }

    async fn teardown(&self) {
        let (links, tracks) = {
            let mut st = self.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            (
                st.links.drain().collect::<Vec<_>>(),
                std::mem::take(&mut st.tracks),
            )
        };
        info!(
            "Stopping broadcast on channel {} ({} viewer(s))",
            self.channel_id,
            links.len()
        );

        let pump = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pump) = pump {
            pump.abort();
            let _ = pump.await;
        }

        for (viewer, link) in links {
            close_quietly(&viewer, link.peer).await;
        }
        let stopped = tracks.iter().filter(|track| track.stop()).count();
        debug!("Stopped {} local track(s)", stopped);

        match self
            .ctx
            .signaling
            .compare_and_set_streamer(&self.channel_id, Some(&self.user_id), None)
            .await
        {
            Ok(true) => info!("Released channel {}", self.channel_id),
            Ok(false) => debug!("Channel {} was already released", self.channel_id),
            Err(e) => warn!("Failed to release channel {}: {}", self.channel_id, e),
        }
    }

    /// Best effort when no runtime is left to await on
    fn teardown_detached(&self) {
        let tracks = {
            let mut st = self.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            st.links.clear();
            std::mem::take(&mut st.tracks)
        };
        for track in &tracks {
            track.stop();
        }
        if let Some(pump) = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pump.abort();
        }
        warn!(
            "Broadcast on channel {} dropped outside a runtime; channel claim left in place",
            self.channel_id
        );
    }
}

async fn pump(
    shared: Arc<Shared>,
    mut sub: Subscription,
    mut peer_rx: mpsc::UnboundedReceiver<(String, PeerEvent)>,
) {
    let mut subscribed = true;
    loop {
        tokio::select! {
            snapshot = sub.next(), if subscribed => match snapshot {
                Some(snapshot) => shared.on_snapshot(snapshot).await,
                None => {
                    warn!("Signaling subscription for channel {} ended", shared.channel_id);
                    subscribed = false;
                }
            },
            Some((link_id, event)) = peer_rx.recv() => shared.on_peer_event(&link_id, event).await,
            else => break,
        }
    }
}

/// The local user streaming their camera to the channel.
///
/// Dropping the session without calling [`stop`](Self::stop) schedules the
/// same teardown on the current runtime.
pub struct BroadcastSession {
    shared: Arc<Shared>,
}

impl BroadcastSession {
    /// Capture local media, claim the channel and start answering viewers
    pub async fn start(
        ctx: &SessionContext,
        channel_id: &str,
        user_id: &str,
        events: EventTx,
    ) -> Result<Self> {
        let constraints = MediaConstraints {
            video: true,
            audio: ctx.config.audio,
        };
        let tracks = ctx.media.get_user_media(constraints).await?;
        info!(
            "Captured {} local track(s) for channel {}",
            tracks.len(),
            channel_id
        );

        if let Err(e) = claim(ctx, channel_id, user_id).await {
            for track in &tracks {
                track.stop();
            }
            return Err(e);
        }

        let sub = match ctx.signaling.subscribe(channel_id).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!("Subscribe failed after claiming {}, rolling back", channel_id);
                for track in &tracks {
                    track.stop();
                }
                if let Err(release_err) = ctx
                    .signaling
                    .compare_and_set_streamer(channel_id, Some(user_id), None)
                    .await
                {
                    warn!("Rollback of claim on {} failed: {}", channel_id, release_err);
                }
                return Err(e);
            }
        };

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            channel_id: channel_id.to_string(),
            user_id: user_id.to_string(),
            started_at: Utc::now(),
            ctx: ctx.clone(),
            state: Mutex::new(BroadcastState {
                tracks,
                ..Default::default()
            }),
            peer_tx,
            events,
            pump: Mutex::new(None),
        });
        let handle = tokio::spawn(pump(shared.clone(), sub, peer_rx));
        *shared.pump.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        info!("{} is broadcasting on channel {}", user_id, channel_id);
        Ok(Self { shared })
    }

    /// Close every viewer connection, stop capture and clear the channel.
    /// Never fails; repeated calls do nothing.
    pub async fn stop(&self) {
        self.shared.teardown().await;
    }

    pub fn channel_id(&self) -> &str {
        &self.shared.channel_id
    }

    pub fn user_id(&self) -> &str {
        &self.shared.user_id
    }

    /// When the claim was taken
    pub fn started_at(&self) -> DateTime<Utc> {
        self.shared.started_at
    }

    /// Captured tracks, for local preview and for feeding encoded frames
    pub fn local_tracks(&self) -> Vec<LocalTrack> {
        self.shared.lock().tracks.clone()
    }

    pub fn active_track_count(&self) -> usize {
        self.shared
            .lock()
            .tracks
            .iter()
            .filter(|track| track.is_live())
            .count()
    }

    pub fn viewer_count(&self) -> usize {
        self.shared.lock().links.len()
    }

    pub fn viewers(&self) -> Vec<ViewerId> {
        let mut viewers: Vec<_> = self.shared.lock().links.keys().cloned().collect();
        viewers.sort();
        viewers
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.lock().closed
    }
}

impl Drop for BroadcastSession {
    fn drop(&mut self) {
        if self.shared.lock().closed {
            return;
        }
        let shared = self.shared.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { shared.teardown().await });
            }
            Err(_) => shared.teardown_detached(),
        }
    }
}

/// Compare-and-set `null -> user`. A leftover claim by the same user
/// (crashed client) is taken over; anyone else makes the channel busy.
async fn claim(ctx: &SessionContext, channel_id: &str, user_id: &str) -> Result<()> {
    if ctx
        .signaling
        .compare_and_set_streamer(channel_id, None, Some(user_id))
        .await?
    {
        return Ok(());
    }

    let current = ctx.signaling.read_state(channel_id).await?.current_streamer;
    match current {
        Some(streamer) if streamer == user_id => {
            info!("Taking over stale claim on channel {}", channel_id);
            if ctx
                .signaling
                .compare_and_set_streamer(channel_id, Some(user_id), Some(user_id))
                .await?
            {
                Ok(())
            } else {
                Err(busy(ctx, channel_id).await)
            }
        }
        Some(streamer) => Err(Error::StreamBusy {
            channel_id: channel_id.to_string(),
            streamer,
        }),
        // released between our attempt and the read; one more try
        None => {
            if ctx
                .signaling
                .compare_and_set_streamer(channel_id, None, Some(user_id))
                .await?
            {
                Ok(())
            } else {
                Err(busy(ctx, channel_id).await)
            }
        }
    }
}

async fn busy(ctx: &SessionContext, channel_id: &str) -> Error {
    let streamer = match ctx.signaling.read_state(channel_id).await {
        Ok(state) => state.current_streamer,
        Err(_) => None,
    };
    Error::StreamBusy {
        channel_id: channel_id.to_string(),
        streamer: streamer.unwrap_or_else(|| "another user".into()),
    }
}
