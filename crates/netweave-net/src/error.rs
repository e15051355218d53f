//! Error types for network instantiation and simulation

use netweave_specs::FormulaError;

/// Result type for instantiation and simulation operations
pub type Result<T> = std::result::Result<T, NetError>;

/// Errors raised while instantiating or running a network
#[derive(thiserror::Error, Debug)]
pub enum NetError {
    /// Invalid network description
    #[error("Specification error: {0}")]
    Spec(#[from] netweave_specs::SpecError),

    /// A collective operation failed
    #[error("Exchange error: {0}")]
    Exchange(#[from] netweave_exchange::ExchangeError),

    /// No cell rule matches a cell's tags; the population cannot be built
    #[error("No cell rule matches cell {gid} of population {pop}")]
    NoMatchingCellRule {
        /// Owning population label
        pop: String,
        /// The unmatched cell
        gid: u64,
    },

    /// Cell creation failed on another rank; the whole run aborts
    #[error("Cell creation failed on rank {rank}: {msg}")]
    PeerFailure {
        /// The failing rank
        rank: usize,
        /// The peer's reported error
        msg: String,
    },

    /// The global identifier space is exhausted
    #[error("Gid space exhausted allocating {count} identifiers")]
    GidExhausted {
        /// Size of the failed block request
        count: u64,
    },

    /// A connection references a gid no rank has registered
    #[error("Connection references unregistered gid {gid}")]
    UnregisteredGid {
        /// The unresolved gid
        gid: u64,
    },

    /// The simulation engine rejected a cell's structural description
    #[error("Engine failed to build cell {gid} from rule {rule}: {reason}")]
    EngineBuild {
        /// The cell being built
        gid: u64,
        /// The cell rule that matched
        rule: String,
        /// Engine-reported reason
        reason: String,
    },

    /// A population's density formula referenced an undefined variable
    #[error("Population {pop} density formula failed: {source}")]
    DensityFormula {
        /// The population whose rule failed
        pop: String,
        /// The underlying evaluation error
        source: FormulaError,
    },

    /// A connection rule's formula referenced an undefined variable
    #[error("Connection rule {rule} formula failed: {source}")]
    ConnFormula {
        /// The abandoned rule
        rule: String,
        /// The underlying evaluation error
        source: FormulaError,
    },

    /// Snapshot file I/O failed
    #[error("Snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot JSON encoding or decoding failed
    #[error("Snapshot JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Snapshot binary encoding or decoding failed
    #[error("Snapshot codec error: {0}")]
    Codec(#[from] bincode::Error),
}
