//! Network instantiation and distributed connectivity engine
//!
//! Takes a declarative network description (`netweave-specs`) and
//! materializes it across SPMD ranks (`netweave-exchange`): populations
//! resolve into gid-partitioned cells, cell rules build engine model
//! objects, connection rules resolve against the globally-exchanged tag map,
//! and a fixed-step coordinator advances the engine with per-step spike
//! exchange. Results gather to rank 0, and the whole network round-trips
//! through snapshots.
//!
//! Everything stochastic draws from seeds derived per entity (rule label and
//! gid) rather than a shared stream, so a network is a pure function of its
//! description and seeds: repeating a run, or changing the rank count,
//! produces the identical network and spike train.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cell;
pub mod conn;
pub mod engine;
pub mod error;
pub mod geometry;
pub mod ids;
pub mod network;
pub mod pop;
pub mod run;
pub mod snapshot;

pub use cell::{match_cell_rule, Cell, Conn, StimRecord};
pub use engine::{PointEngine, SimEngine};
pub use error::{NetError, Result};
pub use ids::{derive_seed, seed_from_label, Gid, GidAllocator};
pub use network::Network;
pub use pop::{resolve_pop, Population, ResolvedCell};
pub use run::{gather, run, AggregateResult, RankData, RunSummary};
pub use snapshot::{CompactConn, ConnList, Snapshot};
