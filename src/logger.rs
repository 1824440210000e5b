use crate::signaling::types::CandidateJson;
use tracing::debug;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

// Debug builds log signaling chatter; release builds only warnings
#[cfg(debug_assertions)]
const DEFAULT_DIRECTIVE: &str = "chatcast=debug,webrtc=warn";

#[cfg(not(debug_assertions))]
const DEFAULT_DIRECTIVE: &str = "warn";

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
/// Safe to call more than once; only the first call takes effect.
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
        .with_target(false)
        .try_init();
}

/// Trace a trickled candidate
pub fn dump_candidate(label: &str, cand: &CandidateJson) {
    debug!(
        "Trickle {label}: kind={} candidate={} sdp_mid={:?} sdp_mline_index={:?} username_fragment={:?}",
        cand.kind().unwrap_or("unknown"),
        cand.candidate,
        cand.sdp_mid,
        cand.sdp_mline_index,
        cand.username_fragment
    );
}
