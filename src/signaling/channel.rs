use crate::error::Result;
use crate::signaling::types::{ChannelStreamState, StateUpdate};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Document store the sessions signal through.
///
/// Every write (including the subscriber's own) produces one full snapshot
/// for each live subscription. Snapshots from a single writer arrive in
/// write order; there is no ordering across writers.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn read_state(&self, channel_id: &str) -> Result<ChannelStreamState>;

    /// Merge a field-level update into the channel document
    async fn update_state(&self, channel_id: &str, update: StateUpdate) -> Result<()>;

    /// Atomically set `currentStreamer` to `next` (and clear `connections`)
    /// only if it currently equals `expected`. Returns whether the swap happened.
    async fn compare_and_set_streamer(
        &self,
        channel_id: &str,
        expected: Option<&str>,
        next: Option<&str>,
    ) -> Result<bool>;

    /// Start receiving snapshots; the current state is delivered first
    async fn subscribe(&self, channel_id: &str) -> Result<Subscription>;
}

/// Handle for a snapshot subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<ChannelStreamState>,
}

impl Subscription {
    pub fn new(rx: mpsc::UnboundedReceiver<ChannelStreamState>) -> Self {
        Self { rx }
    }

    /// Next snapshot, or `None` once the store stops delivering
    pub async fn next(&mut self) -> Option<ChannelStreamState> {
        self.rx.recv().await
    }

    pub fn unsubscribe(mut self) {
        self.rx.close();
    }
}
