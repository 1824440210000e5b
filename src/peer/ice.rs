use crate::logger::dump_candidate;
use crate::peer::runtime::PeerConnection;
use crate::signaling::types::CandidateJson;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Holds remote candidates until the matching remote description is set.
///
/// The queue never touches the peer connection itself: `enqueue` hands a
/// candidate back when it may be applied right away, and
/// `on_remote_description_set` hands back the buffered ones in arrival order.
/// Ownership of the returned values is what guarantees each candidate is
/// applied at most once.
#[derive(Debug)]
pub struct CandidateQueue<T = CandidateJson> {
    pending: VecDeque<T>,
    remote_set: bool,
}

impl<T> Default for CandidateQueue<T> {
    fn default() -> Self {
        Self {
            pending: VecDeque::new(),
            remote_set: false,
        }
    }
}

impl<T> CandidateQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Some(candidate)` means "apply now"; `None` means it was buffered
    #[must_use]
    pub fn enqueue(&mut self, candidate: T) -> Option<T> {
        if self.remote_set {
            Some(candidate)
        } else {
            self.pending.push_back(candidate);
            None
        }
    }

    /// Drains the buffer (FIFO) and switches to immediate mode for good.
    /// Later calls return nothing.
    #[must_use]
    pub fn on_remote_description_set(&mut self) -> Vec<T> {
        self.remote_set = true;
        self.pending.drain(..).collect()
    }

    pub fn is_remote_set(&self) -> bool {
        self.remote_set
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Applies candidates in order. A rejected candidate is logged and skipped;
/// it does not stop the rest of the batch. Returns how many were accepted.
pub async fn apply_candidates<I>(peer: &dyn PeerConnection, label: &str, candidates: I) -> usize
where
    I: IntoIterator<Item = CandidateJson>,
{
    let mut applied = 0;
    for candidate in candidates {
        dump_candidate(label, &candidate);
        match peer.add_ice_candidate(candidate).await {
            Ok(()) => applied += 1,
            Err(e) => warn!("{}: failed to apply remote candidate: {}", label, e),
        }
    }
    if applied > 0 {
        debug!("{}: applied {} remote candidate(s)", label, applied);
    }
    applied
}
