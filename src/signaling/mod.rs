pub mod channel;
pub mod memory;
pub mod types;

pub use channel::{SignalingChannel, Subscription};
pub use memory::MemorySignalingChannel;
pub use types::{
    CandidateJson, CandidateOrigin, ChannelStreamState, PeerRecord, SessionDescription,
    StateUpdate, UserId, ViewerId,
};
