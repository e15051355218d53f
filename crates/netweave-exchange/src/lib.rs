//! SPMD rank abstraction for netweave
//!
//! Network instantiation runs the same program on every rank, with cells
//! partitioned by gid and a handful of collective points (barriers, tag
//! exchange, spike exchange) keeping the ranks aligned. This crate defines
//! that contract as the [`ParallelContext`] trait and ships two in-process
//! implementations:
//!
//! - [`SerialContext`]: the single-rank case, where every collective is a
//!   no-op or self-delivery
//! - [`ThreadGroup`] / [`ThreadRank`]: N cooperating ranks on OS threads,
//!   used to exercise multi-rank behavior inside one process
//!
//! Payloads cross rank boundaries only by value, bincode-encoded; ranks
//! share no instantiation state other than the gid-to-rank registry.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod context;
pub mod error;
pub mod local;

pub use context::{exchange_all, exchange_each, ParallelContext};
pub use error::{ExchangeError, Result};
pub use local::{SerialContext, ThreadGroup, ThreadRank};
