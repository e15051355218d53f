//! Collective run loop and result gathering
//!
//! The coordinator advances the engine one dt at a time; after every step
//! the ranks exchange the gids that spiked and each rank delivers the
//! weighted events its own cells receive. Delays are clamped to the network
//! minimum, which exceeds one step, so a spike's deliveries always land in a
//! later step than its exchange.

use crate::engine::SimEngine;
use crate::error::Result;
use crate::ids::Gid;
use crate::network::Network;
use netweave_exchange::{exchange_all, ParallelContext};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Recorded traces: trace label, then gid, then samples in record order
pub type TraceData = HashMap<String, HashMap<u64, Vec<f64>>>;

/// One rank's recorded output and counts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankData {
    /// Producing rank
    pub rank: usize,
    /// (time ms, gid) per local spike, in step order
    pub spikes: Vec<(f64, u64)>,
    /// Recorded state traces for local cells
    pub traces: TraceData,
    /// Local cell count
    pub num_cells: usize,
    /// Local connection count
    pub num_conns: usize,
    /// Local stimulation count
    pub num_stims: usize,
    /// Cells skipped by engine build failures
    pub defect_count: u64,
    /// Rules abandoned by formula errors
    pub failed_rules: Vec<String>,
}

/// Whole-network totals derived on the gathering rank
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Cells across all ranks
    pub total_cells: usize,
    /// Connections across all ranks
    pub total_conns: usize,
    /// Stimulation inputs across all ranks
    pub total_stims: usize,
    /// Spikes across all ranks
    pub total_spikes: usize,
    /// Cells skipped by engine build failures, all ranks
    pub defect_count: u64,
    /// Rules abandoned by formula errors (deduplicated)
    pub failed_rules: Vec<String>,
    /// Simulated duration (ms)
    pub duration_ms: f64,
}

/// Merged whole-network result, present on rank 0 only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateResult {
    /// All spikes, sorted by time then gid
    pub spikes: Vec<(f64, u64)>,
    /// All recorded traces
    pub traces: TraceData,
    /// Derived totals
    pub summary: RunSummary,
}

/// Advance the instantiated network over the configured duration
pub fn run<C: ParallelContext + ?Sized>(
    net: &Network<'_, C>,
    engine: &mut dyn SimEngine,
) -> Result<RankData> {
    let ctx = net.ctx();
    let cfg = net.cfg();
    let dt = cfg.dt_ms;
    let num_steps = cfg.num_steps();
    let record_every = (cfg.record_step_ms / dt).round().max(1.0) as usize;

    // Incoming-edge index: presynaptic gid to local (target, weight, delay)
    let mut targets: HashMap<u64, Vec<(Gid, f64, f64)>> = HashMap::new();
    for cell in net.cells() {
        for conn in &cell.conns {
            targets
                .entry(conn.pre.raw())
                .or_default()
                .push((conn.post, conn.weight, conn.delay));
        }
    }

    // Which local cells each trace records
    let recorded: Vec<(String, String, String, Vec<Gid>)> = cfg
        .record_traces
        .iter()
        .map(|spec| {
            let gids = net
                .cells()
                .iter()
                .map(|c| c.gid)
                .filter(|g| cfg.record.includes(g.raw()))
                .collect();
            (spec.label.clone(), spec.sec.clone(), spec.var.clone(), gids)
        })
        .collect();

    if ctx.rank() == 0 {
        log::info!(
            "Running simulation: {} ms, dt {} ms, {} ranks",
            cfg.duration_ms,
            dt,
            ctx.nhosts()
        );
    }

    let mut spikes: Vec<(f64, u64)> = Vec::new();
    let mut traces: TraceData = HashMap::new();

    for step in 0..num_steps {
        let t = step as f64 * dt;

        if step % record_every == 0 {
            for (label, sec, var, gids) in &recorded {
                let series = traces.entry(label.clone()).or_default();
                for gid in gids {
                    if let Some(v) = engine.read_state(*gid, sec, var) {
                        series.entry(gid.raw()).or_default().push(v);
                    }
                }
            }
        }

        let local: Vec<u64> = engine.advance(t, dt).iter().map(Gid::raw).collect();
        spikes.extend(local.iter().map(|&g| (t, g)));

        let mut fired: Vec<u64> = if ctx.nhosts() == 1 {
            local
        } else {
            exchange_all(ctx, &local)?.into_iter().flatten().collect()
        };
        // Deliver in gid order so accumulation order (and therefore float
        // state) does not depend on the rank count
        fired.sort_unstable();
        for gid in fired {
            if let Some(edges) = targets.get(&gid) {
                for &(post, weight, delay) in edges {
                    engine.deliver(post, t + delay, weight);
                }
            }
        }
    }
    ctx.barrier();

    Ok(RankData {
        rank: ctx.rank(),
        spikes,
        traces,
        num_cells: net.cells().len(),
        num_conns: net.num_conns(),
        num_stims: net.num_stims(),
        defect_count: net.defect_count(),
        failed_rules: net.failed_rules().to_vec(),
    })
}

/// Collect every rank's data and merge on rank 0
///
/// Collective: all ranks must call it. Returns `None` on non-zero ranks.
pub fn gather<C: ParallelContext + ?Sized>(
    ctx: &C,
    local: &RankData,
    duration_ms: f64,
) -> Result<Option<AggregateResult>> {
    let all = if ctx.nhosts() == 1 {
        vec![local.clone()]
    } else {
        exchange_all(ctx, local)?
    };
    if ctx.rank() != 0 {
        return Ok(None);
    }

    let mut spikes = Vec::new();
    let mut traces: TraceData = HashMap::new();
    let mut summary = RunSummary {
        total_cells: 0,
        total_conns: 0,
        total_stims: 0,
        total_spikes: 0,
        defect_count: 0,
        failed_rules: Vec::new(),
        duration_ms,
    };

    for data in all {
        spikes.extend(data.spikes);
        for (label, series) in data.traces {
            traces.entry(label).or_default().extend(series);
        }
        summary.total_cells += data.num_cells;
        summary.total_conns += data.num_conns;
        summary.total_stims += data.num_stims;
        summary.defect_count += data.defect_count;
        for rule in data.failed_rules {
            if !summary.failed_rules.contains(&rule) {
                summary.failed_rules.push(rule);
            }
        }
    }
    spikes.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    summary.total_spikes = spikes.len();

    log::info!(
        "Gathered: {} cells, {} connections, {} spikes, {} defects",
        summary.total_cells,
        summary.total_conns,
        summary.total_spikes,
        summary.defect_count
    );

    Ok(Some(AggregateResult {
        spikes,
        traces,
        summary,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PointEngine;
    use netweave_exchange::SerialContext;
    use netweave_specs::{
        CellRule, Conds, ConnRule, NetParams, PopRule, RecordSelect, SimConfig, StimRule,
        StimSource, TraceSpec, ValueSpec,
    };

    fn driven_net() -> (NetParams, SimConfig) {
        let mut params = NetParams::new();
        params.add_pop(PopRule::fixed("E", "lif", 10)).unwrap();
        params
            .add_cell_rule(CellRule::new("lif", Conds::any()))
            .unwrap();
        params
            .add_conn_rule(
                ConnRule::new("E->E", Conds::pop("E"), Conds::pop("E"))
                    .with_topology(netweave_specs::Topology::Probability(ValueSpec::Const(0.3)))
                    .with_weight(ValueSpec::Const(2.0)),
            )
            .unwrap();
        params
            .add_stim_rule(
                StimRule::new("bg", Conds::pop("E"), StimSource::poisson(50.0))
                    .with_weight(ValueSpec::Const(30.0)),
            )
            .unwrap();
        let cfg = SimConfig::new(200.0, 0.1).unwrap().with_trace(
            TraceSpec {
                label: "Vsoma".into(),
                sec: "soma".into(),
                var: "v".into(),
            },
            RecordSelect::Cells(vec![0, 1]),
        );
        (params, cfg)
    }

    #[test]
    fn test_serial_run_and_gather() {
        let ctx = SerialContext::new();
        let (params, cfg) = driven_net();
        let mut net = Network::new(&ctx, params, cfg).unwrap();
        let mut engine = PointEngine::new();
        net.instantiate(&mut engine).unwrap();

        let data = run(&net, &mut engine).unwrap();
        assert_eq!(data.num_cells, 10);
        assert!(!data.spikes.is_empty(), "background drive should spike cells");

        let agg = gather(&ctx, &data, 200.0).unwrap().unwrap();
        assert_eq!(agg.summary.total_cells, 10);
        assert_eq!(agg.summary.total_spikes, agg.spikes.len());
        assert_eq!(agg.summary.defect_count, 0);
        assert!(agg.summary.failed_rules.is_empty());

        // Spikes come back time-ordered
        for pair in agg.spikes.windows(2) {
            assert!(pair[0].0 <= pair[1].0);
        }

        // Both recorded cells produced a full trace
        let vsoma = &agg.traces["Vsoma"];
        assert_eq!(vsoma.len(), 2);
        for samples in vsoma.values() {
            assert_eq!(samples.len(), 2000);
        }
    }

    #[test]
    fn test_repeated_runs_are_identical() {
        let make = || {
            let ctx = SerialContext::new();
            let (params, cfg) = driven_net();
            let mut net = Network::new(&ctx, params, cfg).unwrap();
            let mut engine = PointEngine::new();
            net.instantiate(&mut engine).unwrap();
            run(&net, &mut engine).unwrap().spikes
        };
        assert_eq!(make(), make());
    }
}
