//! The rank-facing collective interface
//!
//! `ParallelContext` is the contract every rank programs against: how many
//! peers exist, which one am I, synchronize, exchange payloads, and map gids
//! to owning ranks. All collective calls must be reached by every rank of the
//! group in the same order; the implementations do not detect a mismatched
//! schedule.

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Collective operations available to one rank of an SPMD group
pub trait ParallelContext {
    /// Number of ranks in the group
    fn nhosts(&self) -> usize;

    /// This rank's index in `0..nhosts`
    fn rank(&self) -> usize;

    /// Block until every rank of the group has reached this call
    fn barrier(&self);

    /// Exchange one byte payload with every rank (self included)
    ///
    /// `outgoing[r]` is delivered to rank `r`; the returned vector holds the
    /// payload each rank sent to this one, indexed by source rank.
    fn alltoall(&self, outgoing: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>>;

    /// Record this rank as the owner of `gid`
    ///
    /// Registration is visible to every rank after the next barrier. A gid
    /// may only ever be registered on one rank.
    fn register_gid(&self, gid: u64) -> Result<()>;

    /// Owning rank of a registered gid
    fn gid_rank(&self, gid: u64) -> Option<usize>;
}

/// Broadcast `value` to every rank and collect each rank's value in return
///
/// Convenience layered over `alltoall`: every rank contributes one typed
/// value and receives the full per-rank vector, bincode-encoded across the
/// rank boundary. This is the shape of the tag-exchange collective.
pub fn exchange_all<T, C>(ctx: &C, value: &T) -> Result<Vec<T>>
where
    T: Serialize + DeserializeOwned,
    C: ParallelContext + ?Sized,
{
    let encoded = bincode::serialize(value)?;
    let outgoing = vec![encoded; ctx.nhosts()];
    let incoming = ctx.alltoall(outgoing)?;
    incoming
        .iter()
        .map(|bytes| Ok(bincode::deserialize(bytes)?))
        .collect()
}

/// Send a distinct typed value to each rank and collect one from each
pub fn exchange_each<T, C>(ctx: &C, values: &[T]) -> Result<Vec<T>>
where
    T: Serialize + DeserializeOwned,
    C: ParallelContext + ?Sized,
{
    let outgoing = values
        .iter()
        .map(|v| Ok(bincode::serialize(v)?))
        .collect::<Result<Vec<_>>>()?;
    let incoming = ctx.alltoall(outgoing)?;
    incoming
        .iter()
        .map(|bytes| Ok(bincode::deserialize(bytes)?))
        .collect()
}
