//! In-process signaling document store

use crate::error::{Error, Result};
use crate::signaling::channel::{SignalingChannel, Subscription};
use crate::signaling::types::{ChannelStreamState, StateUpdate};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

#[derive(Default)]
struct ChannelDoc {
    state: ChannelStreamState,
    revision: u64,
    subscribers: Vec<mpsc::UnboundedSender<ChannelStreamState>>,
}

impl ChannelDoc {
    fn publish(&mut self) {
        self.revision += 1;
        let snapshot = self.state.clone();
        self.subscribers.retain(|tx| tx.send(snapshot.clone()).is_ok());
    }
}

/// Shared document store held in memory.
///
/// All mutations and fan-out happen under one lock, so every subscriber sees
/// snapshots in revision order.
#[derive(Default)]
pub struct MemorySignalingChannel {
    docs: Mutex<HashMap<String, ChannelDoc>>,
    offline: AtomicBool,
}

impl MemorySignalingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store being unreachable: every call fails with `Transport`
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of writes applied to the channel so far
    pub fn revision(&self, channel_id: &str) -> u64 {
        self.lock_docs()
            .map(|docs| docs.get(channel_id).map_or(0, |d| d.revision))
            .unwrap_or(0)
    }

    pub fn subscriber_count(&self, channel_id: &str) -> usize {
        self.lock_docs()
            .map(|mut docs| {
                docs.get_mut(channel_id).map_or(0, |d| {
                    d.subscribers.retain(|tx| !tx.is_closed());
                    d.subscribers.len()
                })
            })
            .unwrap_or(0)
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(Error::Transport("signaling store unreachable".into()))
        } else {
            Ok(())
        }
    }

    fn lock_docs(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, ChannelDoc>>> {
        self.docs
            .lock()
            .map_err(|_| Error::Transport("signaling store poisoned".into()))
    }
}

#[async_trait]
impl SignalingChannel for MemorySignalingChannel {
    async fn read_state(&self, channel_id: &str) -> Result<ChannelStreamState> {
        self.check_online()?;
        let docs = self.lock_docs()?;
        Ok(docs
            .get(channel_id)
            .map(|d| d.state.clone())
            .unwrap_or_default())
    }

    async fn update_state(&self, channel_id: &str, update: StateUpdate) -> Result<()> {
        self.check_online()?;
        let mut docs = self.lock_docs()?;
        let doc = docs.entry(channel_id.to_string()).or_default();
        trace!("channel {} update: {:?}", channel_id, update);
        if doc.state.apply(&update) {
            doc.publish();
        } else {
            debug!("channel {} has no record for {:?}, write dropped", channel_id, update);
        }
        Ok(())
    }

    async fn compare_and_set_streamer(
        &self,
        channel_id: &str,
        expected: Option<&str>,
        next: Option<&str>,
    ) -> Result<bool> {
        self.check_online()?;
        let mut docs = self.lock_docs()?;
        let doc = docs.entry(channel_id.to_string()).or_default();
        if doc.state.current_streamer.as_deref() != expected {
            debug!(
                "channel {} streamer swap rejected: expected {:?}, found {:?}",
                channel_id, expected, doc.state.current_streamer
            );
            return Ok(false);
        }
        doc.state.reset(next.map(str::to_string));
        doc.publish();
        Ok(true)
    }

    async fn subscribe(&self, channel_id: &str) -> Result<Subscription> {
        self.check_online()?;
        let mut docs = self.lock_docs()?;
        let doc = docs.entry(channel_id.to_string()).or_default();
        let (tx, rx) = mpsc::unbounded_channel();
        // the receiver is still held locally, so this send cannot fail
        let _ = tx.send(doc.state.clone());
        doc.subscribers.push(tx);
        Ok(Subscription::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::types::{CandidateJson, CandidateOrigin, SessionDescription};

    #[tokio::test]
    async fn test_missing_channel_reads_empty() {
        let store = MemorySignalingChannel::new();
        let state = store.read_state("nowhere").await.unwrap();
        assert_eq!(state, ChannelStreamState::default());
    }

    #[tokio::test]
    async fn test_subscribe_delivers_current_then_every_write() {
        let store = MemorySignalingChannel::new();
        assert!(store
            .compare_and_set_streamer("general", None, Some("bob"))
            .await
            .unwrap());

        let mut sub = store.subscribe("general").await.unwrap();
        let first = sub.next().await.unwrap();
        assert_eq!(first.current_streamer.as_deref(), Some("bob"));

        store
            .update_state(
                "general",
                StateUpdate::PutOffer {
                    viewer: "alice".into(),
                    offer: SessionDescription::offer("v=0"),
                },
            )
            .await
            .unwrap();
        store
            .update_state(
                "general",
                StateUpdate::AppendCandidate {
                    viewer: "alice".into(),
                    origin: CandidateOrigin::Viewer,
                    candidate: CandidateJson::new("candidate:1"),
                },
            )
            .await
            .unwrap();

        let second = sub.next().await.unwrap();
        assert!(second.record("alice").unwrap().viewer_candidates.is_empty());
        let third = sub.next().await.unwrap();
        assert_eq!(third.record("alice").unwrap().viewer_candidates.len(), 1);
        assert_eq!(store.revision("general"), 3);
    }

    #[tokio::test]
    async fn test_compare_and_set_rejects_second_claim() {
        let store = MemorySignalingChannel::new();
        assert!(store
            .compare_and_set_streamer("general", None, Some("bob"))
            .await
            .unwrap());
        assert!(!store
            .compare_and_set_streamer("general", None, Some("carol"))
            .await
            .unwrap());
        assert!(!store
            .compare_and_set_streamer("general", Some("carol"), None)
            .await
            .unwrap());

        let state = store.read_state("general").await.unwrap();
        assert_eq!(state.current_streamer.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn test_release_clears_connections() {
        let store = MemorySignalingChannel::new();
        store
            .compare_and_set_streamer("general", None, Some("bob"))
            .await
            .unwrap();
        store
            .update_state(
                "general",
                StateUpdate::PutOffer {
                    viewer: "alice".into(),
                    offer: SessionDescription::offer("v=0"),
                },
            )
            .await
            .unwrap();
        assert!(store
            .compare_and_set_streamer("general", Some("bob"), None)
            .await
            .unwrap());
        assert_eq!(
            store.read_state("general").await.unwrap(),
            ChannelStreamState::default()
        );
    }

    #[tokio::test]
    async fn test_late_candidate_after_release_is_dropped() {
        let store = MemorySignalingChannel::new();
        store
            .compare_and_set_streamer("general", None, Some("bob"))
            .await
            .unwrap();
        store
            .update_state(
                "general",
                StateUpdate::PutOffer {
                    viewer: "alice".into(),
                    offer: SessionDescription::offer("v=0"),
                },
            )
            .await
            .unwrap();
        store
            .compare_and_set_streamer("general", Some("bob"), None)
            .await
            .unwrap();
        let revision = store.revision("general");

        store
            .update_state(
                "general",
                StateUpdate::AppendCandidate {
                    viewer: "alice".into(),
                    origin: CandidateOrigin::Viewer,
                    candidate: CandidateJson::new("candidate:9 1 udp 1 192.0.2.9 6000 typ srflx"),
                },
            )
            .await
            .unwrap();
        assert_eq!(store.revision("general"), revision);
        assert_eq!(
            store.read_state("general").await.unwrap(),
            ChannelStreamState::default()
        );
    }

    #[tokio::test]
    async fn test_offline_store_reports_transport_error() {
        let store = MemorySignalingChannel::new();
        store.set_offline(true);
        let err = store.read_state("general").await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert!(store.subscribe("general").await.is_err());

        store.set_offline(false);
        assert!(store.read_state("general").await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let store = MemorySignalingChannel::new();
        let sub = store.subscribe("general").await.unwrap();
        assert_eq!(store.subscriber_count("general"), 1);
        sub.unsubscribe();
        assert_eq!(store.subscriber_count("general"), 0);
    }
}
