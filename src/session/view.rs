//! Viewer side: one receive-only peer connection to the channel's broadcaster

use crate::error::{Error, Result};
use crate::peer::{
    apply_candidates, CandidateQueue, ConnectionState, PeerConnection, PeerEvent, PeerEventSink,
    RemoteTrack, TrackKind,
};
use crate::session::{close_quietly, notify, EventTx, SessionContext, SessionEvent};
use crate::signaling::{
    CandidateOrigin, ChannelStreamState, SessionDescription, StateUpdate, Subscription, UserId,
    ViewerId,
};
use crate::utils::random_id;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Default)]
struct ViewState {
    closed: bool,
    failed: bool,
    queue: CandidateQueue,
    /// An answer has been picked up; later snapshots never re-apply one
    answering: bool,
    /// High-water mark into the record's `streamerCandidates`
    seen_candidates: usize,
    remote_tracks: Vec<RemoteTrack>,
}

struct Shared {
    channel_id: String,
    viewer_id: ViewerId,
    streamer_id: UserId,
    link_id: String,
    joined_at: DateTime<Utc>,
    offer_sdp: String,
    peer: Arc<dyn PeerConnection>,
    ctx: SessionContext,
    state: Mutex<ViewState>,
    conn_state: watch::Sender<ConnectionState>,
    events: EventTx,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ViewState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_connection_state(&self, state: ConnectionState) {
        let previous = self.conn_state.send_replace(state);
        if previous != state {
            notify(&self.events, SessionEvent::ConnectionState(state));
        }
    }

    /// Give up on this connection and close the peer; the owner decides
    /// whether to rejoin
    async fn fail(&self, error: Error) {
        {
            let mut st = self.lock();
            if st.closed || st.failed {
                return;
            }
            st.failed = true;
        }
        warn!(
            "Viewer {} lost the stream from {}: {}",
            self.viewer_id, self.streamer_id, error
        );
        self.set_connection_state(ConnectionState::Failed);
        notify(&self.events, SessionEvent::Error(error));
        close_quietly(&self.link_id, self.peer.clone()).await;
    }

    async fn on_snapshot(&self, snapshot: ChannelStreamState) {
        let step = {
            let mut st = self.lock();
            if st.closed || st.failed {
                return;
            }
            // subscribed after our offer was written, so every snapshot should carry it
            match snapshot.record(&self.viewer_id) {
                None => Err("viewer record was removed"),
                Some(record)
                    if record.offer.as_ref().map(|o| o.sdp.as_str())
                        != Some(self.offer_sdp.as_str()) =>
                {
                    Err("viewer record was replaced")
                }
                Some(record) => {
                    // candidates go into the queue before the answer is applied
                    let ready: Vec<_> = if record.streamer_candidates.len() > st.seen_candidates
                    {
                        let fresh = record.streamer_candidates[st.seen_candidates..].to_vec();
                        st.seen_candidates = record.streamer_candidates.len();
                        fresh
                            .into_iter()
                            .filter_map(|c| st.queue.enqueue(c))
                            .collect()
                    } else {
                        Vec::new()
                    };

                    let answer = match &record.answer {
                        Some(answer) if !st.answering => {
                            st.answering = true;
                            Some(answer.clone())
                        }
                        _ => None,
                    };
                    Ok((ready, answer))
                }
            }
        };

        let (ready, answer) = match step {
            Ok(step) => step,
            Err(reason) => {
                self.fail(Error::Negotiation(format!(
                    "{reason} on channel {}",
                    self.channel_id
                )))
                .await;
                return;
            }
        };

        apply_candidates(self.peer.as_ref(), &self.link_id, ready).await;
        if let Some(answer) = answer {
            if let Err(e) = self.apply_answer(&answer).await {
                self.fail(e).await;
            }
        }
    }

    async fn apply_answer(&self, answer: &SessionDescription) -> Result<()> {
        if !answer.is_answer() {
            return Err(Error::Negotiation(format!(
                "broadcaster published a {:?} where an answer was expected",
                answer.sdp_type
            )));
        }
        self.peer.set_remote_description(answer).await?;
        info!("Viewer {} applied answer from {}", self.viewer_id, self.streamer_id);

        let buffered = {
            let mut st = self.lock();
            if st.closed {
                return Ok(());
            }
            st.queue.on_remote_description_set()
        };
        apply_candidates(self.peer.as_ref(), &self.link_id, buffered).await;
        Ok(())
    }

    async fn on_peer_event(&self, link_id: &str, event: PeerEvent) {
        if link_id != self.link_id || self.lock().closed {
            return;
        }
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if self.lock().failed {
                    debug!("Viewer {} dropping candidate after failure", self.viewer_id);
                    return;
                }
                let update = StateUpdate::AppendCandidate {
                    viewer: self.viewer_id.clone(),
                    origin: CandidateOrigin::Viewer,
                    candidate,
                };
                if let Err(e) = self
                    .ctx
                    .signaling
                    .update_state(&self.channel_id, update)
                    .await
                {
                    warn!("Viewer {} failed to publish candidate: {}", self.viewer_id, e);
                }
            }
            PeerEvent::RemoteTrack(track) => {
                info!(
                    "Viewer {} receiving {:?} track {}",
                    self.viewer_id,
                    track.kind(),
                    track.id()
                );
                self.lock().remote_tracks.push(track.clone());
                notify(&self.events, SessionEvent::RemoteTrack(track));
            }
            PeerEvent::StateChanged(state) => {
                debug!("Viewer {} connection state: {:?}", self.viewer_id, state);
                if state == ConnectionState::Failed {
                    self.fail(Error::Transport(format!(
                        "connection to {} failed",
                        self.streamer_id
                    )))
                    .await;
                } else if !self.lock().failed {
                    self.set_connection_state(state);
                }
            }
        }
    }

    async fn teardown(&self) {
        let tracks = {
            let mut st = self.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            std::mem::take(&mut st.remote_tracks)
        };
        info!("Viewer {} leaving channel {}", self.viewer_id, self.channel_id);

        // the subscription lives in the pump; aborting it unsubscribes
        let pump = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pump) = pump {
            pump.abort();
            let _ = pump.await;
        }

        close_quietly(&self.link_id, self.peer.clone()).await;
        for track in &tracks {
            track.stop();
        }
        self.conn_state.send_replace(ConnectionState::Closed);
    }

    fn teardown_detached(&self) {
        let tracks = {
            let mut st = self.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            std::mem::take(&mut st.remote_tracks)
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
        self.conn_state.send_replace(ConnectionState::Closed);
        warn!(
            "Viewer {} dropped outside a runtime; peer connection not closed",
            self.viewer_id
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
                    warn!("Signaling subscription for viewer {} ended", shared.viewer_id);
                    subscribed = false;
                }
            },
            Some((link_id, event)) = peer_rx.recv() => shared.on_peer_event(&link_id, event).await,
            else => break,
        }
    }
}

/// A viewer's connection to the current broadcaster.
///
/// Dropping the session without calling [`leave`](Self::leave) schedules the
/// same teardown on the current runtime.
pub struct ViewSession {
    shared: Arc<Shared>,
}

impl ViewSession {
    /// Publish a receive-only offer for `streamer_id` and wait for its answer
    /// in the background
    pub async fn join(
        ctx: &SessionContext,
        channel_id: &str,
        viewer_id: &str,
        streamer_id: &str,
        events: EventTx,
    ) -> Result<Self> {
        let link_id = format!("{viewer_id}-{}", random_id());
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let peer = ctx
            .peers
            .create_peer(PeerEventSink::new(link_id.clone(), peer_tx))
            .await?;

        let prepared = Self::publish_offer(ctx, peer.as_ref(), channel_id, viewer_id).await;
        let (offer, sub) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!("Viewer {} failed to join {}: {}", viewer_id, channel_id, e);
                close_quietly(&link_id, peer).await;
                return Err(e);
            }
        };

        let (conn_state, _) = watch::channel(ConnectionState::New);
        let shared = Arc::new(Shared {
            channel_id: channel_id.to_string(),
            viewer_id: viewer_id.to_string(),
            streamer_id: streamer_id.to_string(),
            link_id,
            joined_at: Utc::now(),
            offer_sdp: offer.sdp,
            peer,
            ctx: ctx.clone(),
            state: Mutex::new(ViewState::default()),
            conn_state,
            events,
            pump: Mutex::new(None),
        });
        let handle = tokio::spawn(pump(shared.clone(), sub, peer_rx));
        *shared.pump.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        info!(
            "Viewer {} joined channel {} watching {}",
            viewer_id, channel_id, streamer_id
        );
        Ok(Self { shared })
    }

    async fn publish_offer(
        ctx: &SessionContext,
        peer: &dyn PeerConnection,
        channel_id: &str,
        viewer_id: &str,
    ) -> Result<(SessionDescription, Subscription)> {
        peer.add_receiver(TrackKind::Video).await?;
        if ctx.config.audio {
            peer.add_receiver(TrackKind::Audio).await?;
        }
        let offer = peer.create_offer().await?;
        peer.set_local_description(&offer).await?;
        ctx.signaling
            .update_state(
                channel_id,
                StateUpdate::PutOffer {
                    viewer: viewer_id.to_string(),
                    offer: offer.clone(),
                },
            )
            .await?;
        let sub = ctx.signaling.subscribe(channel_id).await?;
        Ok((offer, sub))
    }

    /// Close the connection and stop receiving. The viewer's record stays in
    /// the document. Never fails; repeated calls do nothing.
    pub async fn leave(&self) {
        self.shared.teardown().await;
    }

    pub fn channel_id(&self) -> &str {
        &self.shared.channel_id
    }

    pub fn viewer_id(&self) -> &str {
        &self.shared.viewer_id
    }

    pub fn streamer_id(&self) -> &str {
        &self.shared.streamer_id
    }

    pub fn joined_at(&self) -> DateTime<Utc> {
        self.shared.joined_at
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.conn_state.borrow()
    }

    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.conn_state.subscribe()
    }

    /// Tracks received so far
    pub fn remote_tracks(&self) -> Vec<RemoteTrack> {
        self.shared.lock().remote_tracks.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

impl Drop for ViewSession {
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
