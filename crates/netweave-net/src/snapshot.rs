//! Snapshot save/load
//!
//! A snapshot holds the full network description, every cell with its
//! resolved inputs, and optionally the recorded output of a run. It
//! round-trips through JSON and through the binary codec, and a loaded
//! snapshot re-instantiates an equivalent network (same gids, tags and
//! connection multiset) under any rank count.
//!
//! Connection lists can be stored long (one record per field) or compact
//! (fixed-order tuples keyed by the owning cell), selected by
//! `SimConfig::compact_conn_format`.

use crate::cell::{Cell, Conn, StimRecord};
use crate::engine::SimEngine;
use crate::error::{NetError, Result};
use crate::ids::{derive_seed, Gid};
use crate::network::Network;
use crate::pop::{Population, ResolvedCell};
use crate::run::{AggregateResult, TraceData};
use netweave_exchange::{exchange_all, ParallelContext};
use netweave_specs::{NetParams, SimConfig, Tags};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Fixed-field-order connection record: (pre, weight, delay, syn_mech, sec,
/// loc, electrical); the post gid is the owning cell's
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactConn(pub u64, pub f64, pub f64, pub String, pub String, pub f64, pub bool);

/// A cell's incoming connections in either storage format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConnList {
    /// One full record per connection
    Long(Vec<Conn>),
    /// Fixed-order tuples, post gid implied by the owning cell
    Compact(Vec<CompactConn>),
}

impl ConnList {
    /// Expand to full records for the given owning cell
    pub fn to_long(&self, post: Gid) -> Vec<Conn> {
        match self {
            ConnList::Long(conns) => conns.clone(),
            ConnList::Compact(compact) => compact
                .iter()
                .map(|c| Conn {
                    pre: Gid::new(c.0),
                    post,
                    weight: c.1,
                    delay: c.2,
                    syn_mech: c.3.clone(),
                    sec: c.4.clone(),
                    loc: c.5,
                    electrical: c.6,
                })
                .collect(),
        }
    }

    fn from_conns(conns: &[Conn], compact: bool) -> Self {
        if compact {
            ConnList::Compact(
                conns
                    .iter()
                    .map(|c| {
                        CompactConn(
                            c.pre.raw(),
                            c.weight,
                            c.delay,
                            c.syn_mech.clone(),
                            c.sec.clone(),
                            c.loc,
                            c.electrical,
                        )
                    })
                    .collect(),
            )
        } else {
            ConnList::Long(conns.to_vec())
        }
    }
}

/// One population's identity in a snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopSnapshot {
    /// Population label
    pub label: String,
    /// Gids belonging to this population, ascending
    pub gids: Vec<u64>,
}

/// One cell with its resolved inputs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellSnapshot {
    /// Global identifier
    pub gid: u64,
    /// Owning population label
    pub pop: String,
    /// Full tag set
    pub tags: Tags,
    /// Incoming connections
    pub conns: ConnList,
    /// Incoming stimulation inputs
    pub stims: Vec<StimRecord>,
}

/// Recorded output of a completed run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimData {
    /// (time ms, gid) per spike, time-ordered
    pub spikes: Vec<(f64, u64)>,
    /// Recorded state traces
    pub traces: TraceData,
}

/// Complete serialized network state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Network description
    pub net_params: NetParams,
    /// Run configuration
    pub sim_config: SimConfig,
    /// Populations with their gid sets
    pub pops: Vec<PopSnapshot>,
    /// Every cell of the network
    pub cells: Vec<CellSnapshot>,
    /// Run output, when a run was gathered
    pub sim_data: Option<SimData>,
}

impl Snapshot {
    /// Collect every rank's cells and build the snapshot on rank 0
    ///
    /// Collective: all ranks must call it. Returns `None` on non-zero ranks.
    pub fn capture<C: ParallelContext + ?Sized>(
        net: &Network<'_, C>,
        result: Option<&AggregateResult>,
    ) -> Result<Option<Snapshot>> {
        let compact = net.cfg().compact_conn_format;
        let local: Vec<CellSnapshot> = net
            .cells()
            .iter()
            .map(|c| CellSnapshot {
                gid: c.gid.raw(),
                pop: c.pop.clone(),
                tags: c.tags.clone(),
                conns: ConnList::from_conns(&c.conns, compact),
                stims: c.stims.clone(),
            })
            .collect();

        let ctx = net.ctx();
        let mut cells: Vec<CellSnapshot> = if ctx.nhosts() == 1 {
            local
        } else {
            exchange_all(ctx, &local)?.into_iter().flatten().collect()
        };
        if ctx.rank() != 0 {
            return Ok(None);
        }
        cells.sort_by_key(|c| c.gid);

        let pops = net
            .pops()
            .iter()
            .map(|p| PopSnapshot {
                label: p.label.clone(),
                gids: p.cells.iter().map(|c| c.gid.raw()).collect(),
            })
            .collect();

        Ok(Some(Snapshot {
            net_params: net.params().clone(),
            sim_config: net.cfg().clone(),
            pops,
            cells,
            sim_data: result.map(|r| SimData {
                spikes: r.spikes.clone(),
                traces: r.traces.clone(),
            }),
        }))
    }

    /// Write as JSON
    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = BufWriter::new(File::create(path.as_ref())?);
        serde_json::to_writer(file, self)?;
        log::info!("Saved snapshot to {}", path.as_ref().display());
        Ok(())
    }

    /// Read from JSON
    pub fn load_json(path: impl AsRef<Path>) -> Result<Snapshot> {
        let file = BufReader::new(File::open(path.as_ref())?);
        Ok(serde_json::from_reader(file)?)
    }

    /// Write in the binary codec
    pub fn save_bin(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = BufWriter::new(File::create(path.as_ref())?);
        bincode::serialize_into(file, self)?;
        log::info!("Saved snapshot to {}", path.as_ref().display());
        Ok(())
    }

    /// Read from the binary codec
    pub fn load_bin(path: impl AsRef<Path>) -> Result<Snapshot> {
        let file = BufReader::new(File::open(path.as_ref())?);
        Ok(bincode::deserialize_from(file)?)
    }

    /// Rebuild a runnable per-rank network from this snapshot
    ///
    /// Each rank materializes the cells it owns under the round-robin
    /// partition, registers their gids, and rebuilds engine objects from the
    /// stored rules and records. Collective.
    pub fn instantiate<'a, C: ParallelContext + ?Sized>(
        &self,
        ctx: &'a C,
        engine: &mut dyn SimEngine,
    ) -> Result<Network<'a, C>> {
        let rank = ctx.rank();
        let nhosts = ctx.nhosts();
        let cell_rules = self.net_params.cell_rules().to_vec();

        let mut cells = Vec::new();
        for snap in &self.cells {
            let gid = Gid::new(snap.gid);
            if gid.owner(nhosts) != rank {
                continue;
            }
            let rule = crate::cell::match_cell_rule(&cell_rules, &snap.tags).ok_or(
                NetError::NoMatchingCellRule {
                    pop: snap.pop.clone(),
                    gid: snap.gid,
                },
            )?;
            engine.build_cell(gid, rule, &snap.tags)?;
            ctx.register_gid(snap.gid)?;

            let mut cell = Cell::new(gid, snap.pop.clone(), snap.tags.clone());
            cell.conns = snap.conns.to_long(gid);
            cell.stims = snap.stims.clone();
            cells.push(cell);
        }
        ctx.barrier();

        let stim_seed = self.sim_config.seeds.stim;
        for cell in &cells {
            for conn in &cell.conns {
                let mech = self.net_params.syn_mech(&conn.syn_mech);
                engine.add_synapse(conn, mech)?;
            }
            for stim in &cell.stims {
                let seed = derive_seed(
                    stim_seed,
                    &format!("{}:spikes", stim.label),
                    cell.gid.raw(),
                );
                engine.add_stim(cell.gid, stim, seed)?;
            }
        }
        ctx.barrier();

        let tag_of: std::collections::HashMap<u64, &Tags> =
            self.cells.iter().map(|c| (c.gid, &c.tags)).collect();
        let pops = self
            .pops
            .iter()
            .map(|p| {
                let rule = self
                    .net_params
                    .pops()
                    .iter()
                    .find(|r| r.label == p.label)
                    .cloned()
                    .ok_or_else(|| {
                        NetError::Spec(netweave_specs::SpecError::invalid_parameter(
                            "pops",
                            p.label.clone(),
                            "a population present in net_params",
                        ))
                    })?;
                let start = p.gids.first().copied().unwrap_or(0);
                let end = p.gids.last().map(|g| g + 1).unwrap_or(start);
                let cells = p
                    .gids
                    .iter()
                    .filter_map(|g| {
                        tag_of.get(g).map(|t| ResolvedCell {
                            gid: Gid::new(*g),
                            tags: (*t).clone(),
                        })
                    })
                    .collect();
                Ok(Population {
                    label: p.label.clone(),
                    rule,
                    gid_range: start..end,
                    cells,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        log::info!("Rank {}: restored {} cells from snapshot", rank, cells.len());
        Ok(Network::restore(
            ctx,
            self.net_params.clone(),
            self.sim_config.clone(),
            pops,
            cells,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_expansion_preserves_fields() {
        let conns = vec![Conn {
            pre: Gid::new(3),
            post: Gid::new(7),
            weight: 0.5,
            delay: 2.5,
            syn_mech: "AMPA".into(),
            sec: "soma".into(),
            loc: 0.5,
            electrical: false,
        }];
        let compact = ConnList::from_conns(&conns, true);
        assert!(matches!(compact, ConnList::Compact(_)));
        assert_eq!(compact.to_long(Gid::new(7)), conns);

        let long = ConnList::from_conns(&conns, false);
        assert_eq!(long.to_long(Gid::new(7)), conns);
    }
}
