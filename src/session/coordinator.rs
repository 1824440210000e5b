//! Per-channel state machine deciding whether the local user broadcasts,
//! watches someone else, or does nothing

use crate::error::{Error, Result};
use crate::session::{BroadcastSession, SessionContext, SessionEvent, ViewSession};
use crate::signaling::{ChannelStreamState, Subscription, UserId};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Broadcasting,
    Viewing(UserId),
}

enum Slot {
    Idle,
    Broadcasting {
        session: BroadcastSession,
        /// A snapshot naming us has been seen since the claim
        confirmed: bool,
    },
    Viewing(ViewSession),
}

struct Inner {
    slot: Slot,
    /// Streamer whose join failed; not retried until `rejoin()` or a new streamer
    failed_join: Option<UserId>,
    closed: bool,
}

struct Shared {
    ctx: SessionContext,
    channel_id: String,
    user_id: UserId,
    inner: Mutex<Inner>,
    state: watch::Sender<CoordinatorState>,
    /// `currentStreamer` from the latest snapshot
    streamer: watch::Sender<Option<UserId>>,
    ui: mpsc::UnboundedSender<SessionEvent>,
}

impl Shared {
    fn set_state(&self, next: CoordinatorState) {
        let previous = self.state.send_replace(next.clone());
        if previous != next {
            info!(
                "Channel {} coordinator: {:?} -> {:?}",
                self.channel_id, previous, next
            );
            self.emit(SessionEvent::StateChanged(next));
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.ui.send(event);
    }

    async fn on_snapshot(&self, snapshot: ChannelStreamState) {
        self.streamer.send_replace(snapshot.current_streamer.clone());
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return;
        }
        self.follow(&mut inner, snapshot.current_streamer.as_deref()).await;
    }

    /// Move the slot to wherever `streamer` says it should be
    async fn follow(&self, inner: &mut Inner, streamer: Option<&str>) {
        match &mut inner.slot {
            Slot::Idle => {}
            Slot::Broadcasting { confirmed, .. } => {
                if streamer == Some(self.user_id.as_str()) {
                    *confirmed = true;
                    return;
                }
                // snapshots queued from before our claim
                if !*confirmed {
                    return;
                }
                warn!(
                    "Lost the claim on channel {}, now held by {:?}",
                    self.channel_id, streamer
                );
                if let Slot::Broadcasting { session, .. } =
                    std::mem::replace(&mut inner.slot, Slot::Idle)
                {
                    session.stop().await;
                }
                if let Some(other) = streamer {
                    self.emit(SessionEvent::Error(Error::StreamBusy {
                        channel_id: self.channel_id.clone(),
                        streamer: other.to_string(),
                    }));
                }
                self.set_state(CoordinatorState::Idle);
            }
            Slot::Viewing(view) => {
                if streamer == Some(view.streamer_id()) {
                    return;
                }
                debug!(
                    "Streamer on {} changed from {} to {:?}",
                    self.channel_id,
                    view.streamer_id(),
                    streamer
                );
                if let Slot::Viewing(view) = std::mem::replace(&mut inner.slot, Slot::Idle) {
                    view.leave().await;
                }
                self.set_state(CoordinatorState::Idle);
            }
        }

        match streamer {
            None => {
                inner.failed_join = None;
            }
            Some(me) if me == self.user_id => {
                // stale claim left behind by an earlier run; start_sharing takes it over
                debug!("Channel {} claimed by ourselves while idle", self.channel_id);
            }
            Some(other) => {
                if inner.failed_join.as_deref() == Some(other) {
                    return;
                }
                inner.failed_join = None;
                self.join(inner, other).await;
            }
        }
    }

    async fn join(&self, inner: &mut Inner, streamer: &str) {
        match ViewSession::join(
            &self.ctx,
            &self.channel_id,
            &self.user_id,
            streamer,
            Some(self.ui.clone()),
        )
        .await
        {
            Ok(view) => {
                inner.slot = Slot::Viewing(view);
                self.set_state(CoordinatorState::Viewing(streamer.to_string()));
            }
            Err(e) => {
                warn!("Could not join {}'s stream: {}", streamer, e);
                inner.failed_join = Some(streamer.to_string());
                self.emit(SessionEvent::Error(e));
            }
        }
    }

    async fn release(&self, inner: &mut Inner) {
        match std::mem::replace(&mut inner.slot, Slot::Idle) {
            Slot::Idle => {}
            Slot::Broadcasting { session, .. } => session.stop().await,
            Slot::Viewing(view) => view.leave().await,
        }
        self.set_state(CoordinatorState::Idle);
    }
}

async fn pump(shared: Arc<Shared>, mut sub: Subscription) {
    while let Some(snapshot) = sub.next().await {
        shared.on_snapshot(snapshot).await;
    }
    warn!("Signaling subscription for channel {} ended", shared.channel_id);
}

/// Follows one channel's document for the local user
pub struct SessionCoordinator {
    shared: Arc<Shared>,
    events: StdMutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    pump: StdMutex<Option<JoinHandle<()>>>,
}

impl SessionCoordinator {
    pub async fn new(ctx: SessionContext, channel_id: &str, user_id: &str) -> Result<Self> {
        let sub = ctx.signaling.subscribe(channel_id).await?;
        let (ui, events) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(CoordinatorState::Idle);
        let (streamer, _) = watch::channel(None);

        let shared = Arc::new(Shared {
            ctx,
            channel_id: channel_id.to_string(),
            user_id: user_id.to_string(),
            inner: Mutex::new(Inner {
                slot: Slot::Idle,
                failed_join: None,
                closed: false,
            }),
            state,
            streamer,
            ui,
        });
        let handle = tokio::spawn(pump(shared.clone(), sub));
        info!("{} following channel {}", user_id, channel_id);

        Ok(Self {
            shared,
            events: StdMutex::new(Some(events)),
            pump: StdMutex::new(Some(handle)),
        })
    }

    /// The UI event stream. Only the first call gets it.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn state(&self) -> CoordinatorState {
        self.shared.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<CoordinatorState> {
        self.shared.state.subscribe()
    }

    pub fn channel_id(&self) -> &str {
        &self.shared.channel_id
    }

    pub fn user_id(&self) -> &str {
        &self.shared.user_id
    }

    /// Nobody (other than a stale claim of ours) is streaming
    pub fn can_start_sharing(&self) -> bool {
        let streamer = self.shared.streamer.borrow();
        match streamer.as_deref() {
            None => self.state() == CoordinatorState::Idle,
            Some(me) => me == self.shared.user_id && !self.is_sharing(),
        }
    }

    pub fn is_sharing(&self) -> bool {
        self.state() == CoordinatorState::Broadcasting
    }

    /// Claim the channel and start broadcasting.
    ///
    /// Fails with `StreamBusy` while someone else is streaming; the
    /// coordinator state is left untouched on any error.
    pub async fn start_sharing(&self) -> Result<()> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().await;
        if inner.closed {
            return Err(Error::Transport(format!(
                "coordinator for {} is shut down",
                shared.channel_id
            )));
        }
        if matches!(inner.slot, Slot::Broadcasting { .. }) {
            return Ok(());
        }

        let current = shared
            .ctx
            .signaling
            .read_state(&shared.channel_id)
            .await?
            .current_streamer;
        if let Some(streamer) = current.filter(|s| *s != shared.user_id) {
            return Err(Error::StreamBusy {
                channel_id: shared.channel_id.clone(),
                streamer,
            });
        }

        // a view of a broadcast that already ended
        if let Slot::Viewing(view) = std::mem::replace(&mut inner.slot, Slot::Idle) {
            view.leave().await;
            shared.set_state(CoordinatorState::Idle);
        }

        let session = BroadcastSession::start(
            &shared.ctx,
            &shared.channel_id,
            &shared.user_id,
            Some(shared.ui.clone()),
        )
        .await?;
        inner.slot = Slot::Broadcasting {
            session,
            confirmed: false,
        };
        inner.failed_join = None;
        shared.set_state(CoordinatorState::Broadcasting);
        Ok(())
    }

    /// Stop broadcasting and release the channel. A no-op unless broadcasting.
    pub async fn stop_sharing(&self) {
        let mut inner = self.shared.inner.lock().await;
        if matches!(inner.slot, Slot::Broadcasting { .. }) {
            self.shared.release(&mut inner).await;
        }
    }

    /// Drop the current view and join the current streamer again, e.g. after
    /// the connection reported `Failed`
    pub async fn rejoin(&self) -> Result<()> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().await;
        if inner.closed || matches!(inner.slot, Slot::Broadcasting { .. }) {
            return Ok(());
        }
        let state = shared.ctx.signaling.read_state(&shared.channel_id).await?;
        shared.streamer.send_replace(state.current_streamer.clone());

        if matches!(inner.slot, Slot::Viewing(_)) {
            shared.release(&mut inner).await;
        }
        inner.failed_join = None;
        shared
            .follow(&mut inner, state.current_streamer.as_deref())
            .await;
        Ok(())
    }

    /// Leave the channel: tear down whichever session is active and stop
    /// following the document. Safe to call more than once.
    pub async fn shutdown(&self) {
        shutdown(&self.shared, self.take_pump()).await;
    }

    fn take_pump(&self) -> Option<JoinHandle<()>> {
        self.pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

async fn shutdown(shared: &Shared, pump: Option<JoinHandle<()>>) {
    if let Some(pump) = pump {
        pump.abort();
        let _ = pump.await;
    }
    let mut inner = shared.inner.lock().await;
    if inner.closed {
        return;
    }
    inner.closed = true;
    shared.release(&mut inner).await;
    info!("{} stopped following channel {}", shared.user_id, shared.channel_id);
}

impl Drop for SessionCoordinator {
    fn drop(&mut self) {
        let pump = self.take_pump();
        let Some(pump) = pump else {
            return;
        };
        pump.abort();
        // sessions left in the slot schedule their own teardown when dropped
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let shared = self.shared.clone();
            handle.spawn(async move { shutdown(&shared, None).await });
        }
    }
}
