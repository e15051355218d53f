//! Network instantiation orchestration
//!
//! `Network` owns the per-rank instantiation state and drives the phases in
//! order: resolve populations, build owned cells, exchange tags, resolve
//! connections, attach stimulation. Every phase ends on a barrier; all ranks
//! must call the phases in the same order.

use crate::cell::{match_cell_rule, Cell, StimRecord};
use crate::conn::resolve_rule;
use crate::engine::SimEngine;
use crate::error::{NetError, Result};
use crate::ids::{derive_seed, Gid, GidAllocator};
use crate::pop::{resolve_pop, Population};
use netweave_exchange::{exchange_all, ParallelContext};
use netweave_specs::{EvalScope, NetParams, SimConfig, SpecError, Tags};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

/// Per-rank network instantiation state
#[derive(Debug)]
pub struct Network<'a, C: ParallelContext + ?Sized> {
    ctx: &'a C,
    params: NetParams,
    cfg: SimConfig,
    pops: Vec<Population>,
    cells: Vec<Cell>,
    by_gid: HashMap<Gid, usize>,
    global_tags: Vec<(Gid, Tags)>,
    defect_count: u64,
    failed_rules: Vec<String>,
}

impl<'a, C: ParallelContext + ?Sized> Network<'a, C> {
    /// Create an empty network over a validated description
    pub fn new(ctx: &'a C, params: NetParams, cfg: SimConfig) -> Result<Self> {
        params.validate()?;
        cfg.validate()?;
        // Delays are clamped to min_delay, so every delivery must span at
        // least one collective step
        if params.min_delay < cfg.dt_ms {
            return Err(NetError::Spec(SpecError::invalid_parameter(
                "min_delay",
                format!("{} (with dt_ms={})", params.min_delay, cfg.dt_ms),
                ">= dt_ms",
            )));
        }
        Ok(Self {
            ctx,
            params,
            cfg,
            pops: Vec::new(),
            cells: Vec::new(),
            by_gid: HashMap::new(),
            global_tags: Vec::new(),
            defect_count: 0,
            failed_rules: Vec::new(),
        })
    }

    /// Run all instantiation phases in order
    pub fn instantiate(&mut self, engine: &mut dyn SimEngine) -> Result<()> {
        self.create_pops()?;
        self.create_cells(engine)?;
        self.gather_all_cell_tags()?;
        self.connect_cells(engine)?;
        self.add_stims(engine)?;
        Ok(())
    }

    /// Resolve every population rule into its logical cell set
    pub fn create_pops(&mut self) -> Result<()> {
        if self.ctx.rank() == 0 {
            log::info!("Creating populations...");
        }
        let mut alloc = GidAllocator::new();
        let loc_seed = self.cfg.seeds.loc;
        for rule in self.params.pops().to_vec() {
            let pop = resolve_pop(&rule, &self.params, &mut alloc, loc_seed)?;
            self.pops.push(pop);
        }
        self.ctx.barrier();
        Ok(())
    }

    /// Materialize owned cells through the engine and register their gids
    pub fn create_cells(&mut self, engine: &mut dyn SimEngine) -> Result<()> {
        if self.ctx.rank() == 0 {
            log::info!("Creating cells...");
        }
        let rank = self.ctx.rank();
        let nhosts = self.ctx.nhosts();
        let cell_rules = self.params.cell_rules().to_vec();

        let mut failure: Option<NetError> = None;
        'pops: for pop in &self.pops {
            for resolved in pop.owned(rank, nhosts) {
                let Some(rule) = match_cell_rule(&cell_rules, &resolved.tags) else {
                    failure = Some(NetError::NoMatchingCellRule {
                        pop: pop.label.clone(),
                        gid: resolved.gid.raw(),
                    });
                    break 'pops;
                };
                if let Err(e) = engine.build_cell(resolved.gid, rule, &resolved.tags) {
                    log::error!(
                        "Skipping cell {} of pop {} (rule {}): {}",
                        resolved.gid,
                        pop.label,
                        rule.label,
                        e
                    );
                    self.defect_count += 1;
                    continue;
                }
                if let Err(e) = self.ctx.register_gid(resolved.gid.raw()) {
                    failure = Some(e.into());
                    break 'pops;
                }
                self.by_gid.insert(resolved.gid, self.cells.len());
                self.cells
                    .push(Cell::new(resolved.gid, pop.label.clone(), resolved.tags.clone()));
                if self.cfg.verbose {
                    log::debug!(
                        "Cell {} of pop {} on rank {}",
                        resolved.gid,
                        pop.label,
                        rank
                    );
                }
            }
        }

        // A rule mismatch depends on per-cell tags and may hit only some
        // ranks; every rank must learn of it before the barrier, or the
        // clean ranks wait there forever.
        if nhosts > 1 {
            let local = failure.as_ref().map(|e| e.to_string());
            let peers = exchange_all(self.ctx, &local).map_err(NetError::from)?;
            if let Some(e) = failure {
                return Err(e);
            }
            for (peer, msg) in peers.into_iter().enumerate() {
                if let Some(msg) = msg {
                    return Err(NetError::PeerFailure { rank: peer, msg });
                }
            }
        } else if let Some(e) = failure {
            return Err(e);
        }
        log::info!("Rank {}: {} cells created", rank, self.cells.len());
        self.ctx.barrier();
        Ok(())
    }

    /// Exchange local (gid, tags) lists so every rank holds the global map
    pub fn gather_all_cell_tags(&mut self) -> Result<()> {
        let local: Vec<(Gid, Tags)> = self
            .cells
            .iter()
            .map(|c| (c.gid, c.tags.clone()))
            .collect();

        if self.ctx.nhosts() == 1 {
            self.global_tags = local;
            return Ok(());
        }

        let per_rank = exchange_all(self.ctx, &local).map_err(NetError::from)?;
        let mut global: Vec<(Gid, Tags)> = per_rank.into_iter().flatten().collect();
        global.sort_by_key(|(gid, _)| *gid);
        self.global_tags = global;
        self.ctx.barrier();
        Ok(())
    }

    /// Resolve every connection rule against the global tag map
    ///
    /// A rule whose formula fails is abandoned and recorded; the remaining
    /// rules still resolve.
    pub fn connect_cells(&mut self, engine: &mut dyn SimEngine) -> Result<()> {
        if self.ctx.rank() == 0 {
            log::info!("Making connections...");
        }
        let rank = self.ctx.rank();
        let nhosts = self.ctx.nhosts();
        let conn_seed = self.cfg.seeds.conn;

        for rule in self.params.conn_rules().to_vec() {
            let conns = match resolve_rule(
                &rule,
                &self.global_tags,
                rank,
                nhosts,
                &self.params,
                conn_seed,
            ) {
                Ok(conns) => conns,
                Err(e @ NetError::ConnFormula { .. }) => {
                    log::error!("{}", e);
                    self.failed_rules.push(rule.label.clone());
                    continue;
                }
                Err(e) => return Err(e),
            };
            let mech = self.params.syn_mech(&rule.syn_mech).cloned();
            for conn in conns {
                if self.ctx.gid_rank(conn.pre.raw()).is_none() {
                    return Err(NetError::UnregisteredGid {
                        gid: conn.pre.raw(),
                    });
                }
                engine.add_synapse(&conn, mech.as_ref())?;
                let idx = self.by_gid[&conn.post];
                self.cells[idx].conns.push(conn);
            }
        }
        log::info!("Rank {}: {} connections", rank, self.num_conns());
        self.ctx.barrier();
        Ok(())
    }

    /// Attach stimulation sources to matching owned cells
    pub fn add_stims(&mut self, engine: &mut dyn SimEngine) -> Result<()> {
        if self.ctx.rank() == 0 {
            log::info!("Adding stimulation...");
        }
        let stim_seed = self.cfg.seeds.stim;
        let min_delay = self.params.min_delay;

        'rules: for rule in self.params.stim_rules().to_vec() {
            let mut added = Vec::new();
            for (idx, cell) in self.cells.iter().enumerate() {
                if !rule.targets.matches(&cell.tags) {
                    continue;
                }
                let mut rng =
                    StdRng::seed_from_u64(derive_seed(stim_seed, &rule.label, cell.gid.raw()));
                if rng.gen::<f64>() >= rule.fraction {
                    continue;
                }
                let scope = EvalScope::target(&cell.tags);
                let values = rule
                    .weight
                    .eval(&scope, &mut rng)
                    .and_then(|w| rule.delay.eval(&scope, &mut rng).map(|d| (w, d)));
                let (weight, delay) = match values {
                    Ok((w, d)) => (w, d.max(min_delay)),
                    Err(e) => {
                        log::error!("Stimulation rule {} formula failed: {}", rule.label, e);
                        self.failed_rules.push(rule.label.clone());
                        continue 'rules;
                    }
                };
                added.push((
                    idx,
                    StimRecord {
                        label: rule.label.clone(),
                        source: rule.source.clone(),
                        weight,
                        delay,
                        syn_mech: rule.syn_mech.clone(),
                        sec: rule.sec.clone(),
                        loc: rule.loc,
                    },
                ));
            }
            for (idx, stim) in added {
                let gid = self.cells[idx].gid;
                let seed = derive_seed(stim_seed, &format!("{}:spikes", rule.label), gid.raw());
                engine.add_stim(gid, &stim, seed)?;
                self.cells[idx].stims.push(stim);
            }
        }
        self.ctx.barrier();
        Ok(())
    }

    /// The parallel context this network runs over
    pub fn ctx(&self) -> &C {
        self.ctx
    }

    /// Network description
    pub fn params(&self) -> &NetParams {
        &self.params
    }

    /// Run configuration
    pub fn cfg(&self) -> &SimConfig {
        &self.cfg
    }

    /// Resolved populations
    pub fn pops(&self) -> &[Population] {
        &self.pops
    }

    /// Locally-owned cells
    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    /// Look up an owned cell by gid
    pub fn cell(&self, gid: Gid) -> Option<&Cell> {
        self.by_gid.get(&gid).map(|&i| &self.cells[i])
    }

    /// Global (gid, tags) map, available after the tag exchange
    pub fn global_tags(&self) -> &[(Gid, Tags)] {
        &self.global_tags
    }

    /// Local connection count
    pub fn num_conns(&self) -> usize {
        self.cells.iter().map(|c| c.conns.len()).sum()
    }

    /// Local stimulation count
    pub fn num_stims(&self) -> usize {
        self.cells.iter().map(|c| c.stims.len()).sum()
    }

    /// Cells skipped because the engine rejected them
    pub fn defect_count(&self) -> u64 {
        self.defect_count
    }

    /// Labels of rules abandoned by formula errors
    pub fn failed_rules(&self) -> &[String] {
        &self.failed_rules
    }

    /// Restore instantiation state from snapshot data (cells with their
    /// connections and stims already resolved)
    pub(crate) fn restore(
        ctx: &'a C,
        params: NetParams,
        cfg: SimConfig,
        pops: Vec<Population>,
        cells: Vec<Cell>,
    ) -> Self {
        let by_gid = cells
            .iter()
            .enumerate()
            .map(|(i, c)| (c.gid, i))
            .collect();
        let global_tags = pops
            .iter()
            .flat_map(|p| p.cells.iter().map(|c| (c.gid, c.tags.clone())))
            .collect();
        Self {
            ctx,
            params,
            cfg,
            pops,
            cells,
            by_gid,
            global_tags,
            defect_count: 0,
            failed_rules: Vec::new(),
        }
    }
}
