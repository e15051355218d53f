//! Rank-count invariance: the same description resolved under 1, 2 and 4
//! ranks must yield the identical global network and spike train.

use netweave_exchange::{ParallelContext, SerialContext, ThreadGroup};
use netweave_net::{run, Conn, Network, PointEngine};
use netweave_specs::{
    CellRule, Conds, ConnRule, DensityFn, NetParams, PopRule, SimConfig, StimRule, StimSource,
    Topology, ValueSpec,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn description() -> (NetParams, SimConfig) {
    let mut params = NetParams::new();
    params.add_pop(PopRule::fixed("E", "lif", 40)).unwrap();
    params.add_pop(PopRule::fixed("I", "lif", 10)).unwrap();
    params
        .add_pop(PopRule::density(
            "L5",
            "lif",
            (0.4, 0.7),
            DensityFn::Const(80.0),
        ))
        .unwrap();
    params
        .add_cell_rule(CellRule::new("lif", Conds::any()))
        .unwrap();
    params
        .add_conn_rule(
            ConnRule::new("E->I", Conds::pop("E"), Conds::pop("I"))
                .with_topology(Topology::Probability(ValueSpec::prob_falloff(0.8)))
                .with_delay(ValueSpec::delay_from_distance(2.0)),
        )
        .unwrap();
    params
        .add_conn_rule(
            ConnRule::new("I->E", Conds::pop("I"), Conds::pop("E"))
                .with_topology(Topology::Convergence(3))
                .with_weight(ValueSpec::Const(-1.0)),
        )
        .unwrap();
    params
        .add_conn_rule(
            ConnRule::new("E->L5", Conds::pop("E"), Conds::pop("L5"))
                .with_topology(Topology::Divergence(2)),
        )
        .unwrap();
    params
        .add_stim_rule(
            StimRule::new("bg", Conds::pop("E"), StimSource::poisson(40.0))
                .with_weight(ValueSpec::Const(25.0))
                .with_fraction(0.8),
        )
        .unwrap();
    let cfg = SimConfig::new(100.0, 0.1).unwrap();
    (params, cfg)
}

/// Instantiate under the given rank count; per rank, return the owned gids,
/// connections and run spikes
fn build_and_run(nhosts: usize) -> Vec<(Vec<u64>, Vec<Conn>, Vec<(f64, u64)>)> {
    let per_rank = |ctx: &dyn ParallelContext| {
        let (params, cfg) = description();
        let mut net = Network::new(ctx, params, cfg).unwrap();
        let mut engine = PointEngine::new();
        net.instantiate(&mut engine).unwrap();
        let gids: Vec<u64> = net.cells().iter().map(|c| c.gid.raw()).collect();
        let conns: Vec<Conn> = net
            .cells()
            .iter()
            .flat_map(|c| c.conns.iter().cloned())
            .collect();
        let data = run(&net, &mut engine).unwrap();
        (gids, conns, data.spikes)
    };
    if nhosts == 1 {
        let ctx = SerialContext::new();
        vec![per_rank(&ctx)]
    } else {
        ThreadGroup::run(nhosts, |ctx| per_rank(&ctx))
    }
}

fn merged(
    results: Vec<(Vec<u64>, Vec<Conn>, Vec<(f64, u64)>)>,
) -> (Vec<u64>, Vec<Conn>, Vec<(f64, u64)>) {
    let mut gids = Vec::new();
    let mut conns = Vec::new();
    let mut spikes = Vec::new();
    for (g, c, s) in results {
        gids.extend(g);
        conns.extend(c);
        spikes.extend(s);
    }
    gids.sort_unstable();
    conns.sort_by_key(|c| (c.post, c.pre));
    spikes.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    (gids, conns, spikes)
}

#[test]
fn global_network_is_invariant_under_rank_count() {
    init_logging();
    let one = merged(build_and_run(1));
    let two = merged(build_and_run(2));
    let four = merged(build_and_run(4));

    assert_eq!(one.0, two.0, "gid sets differ between 1 and 2 ranks");
    assert_eq!(one.0, four.0, "gid sets differ between 1 and 4 ranks");
    assert_eq!(one.1, two.1, "connection sets differ between 1 and 2 ranks");
    assert_eq!(one.1, four.1, "connection sets differ between 1 and 4 ranks");
    assert_eq!(one.2, two.2, "spike trains differ between 1 and 2 ranks");
    assert_eq!(one.2, four.2, "spike trains differ between 1 and 4 ranks");
    assert!(!one.1.is_empty());
}

#[test]
fn partition_is_complete_and_disjoint() {
    init_logging();
    let results = build_and_run(4);
    let mut all_gids = Vec::new();
    for (rank, (gids, _, _)) in results.iter().enumerate() {
        for gid in gids {
            assert_eq!(*gid as usize % 4, rank, "gid {} on wrong rank", gid);
        }
        all_gids.extend(gids.iter().copied());
    }
    all_gids.sort_unstable();
    all_gids.dedup();
    let serial = merged(build_and_run(1));
    assert_eq!(all_gids, serial.0);
}

#[test]
fn repeated_builds_are_identical() {
    init_logging();
    let a = merged(build_and_run(2));
    let b = merged(build_and_run(2));
    assert_eq!(a.1, b.1);
    assert_eq!(a.2, b.2);
}
