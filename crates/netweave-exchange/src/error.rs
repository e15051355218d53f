//! Error types for collective operations

/// Result type for collective operations
pub type Result<T> = std::result::Result<T, ExchangeError>;

/// Errors raised by a parallel context
#[derive(thiserror::Error, Debug)]
pub enum ExchangeError {
    /// An all-to-all call supplied the wrong number of outgoing payloads
    #[error("All-to-all payload count {got} does not match rank count {nhosts}")]
    PayloadCount {
        /// Payloads supplied
        got: usize,
        /// Ranks in the group
        nhosts: usize,
    },

    /// A peer rank exited while a collective call was in flight
    #[error("Rank {peer} disconnected during a collective call")]
    RankDisconnected {
        /// The rank whose channel closed
        peer: usize,
    },

    /// A gid was registered on two different ranks
    #[error("Gid {gid} already registered on rank {owner}, re-registered on rank {rank}")]
    GidConflict {
        /// The doubly-registered gid
        gid: u64,
        /// Rank that registered it first
        owner: usize,
        /// Rank attempting the second registration
        rank: usize,
    },

    /// A payload failed to serialize or deserialize at a rank boundary
    #[error("Payload codec error: {0}")]
    Codec(#[from] bincode::Error),
}
