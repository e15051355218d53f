//! End-to-end instantiation scenarios and error-policy checks.

use netweave_exchange::{SerialContext, ThreadGroup};
use netweave_net::{Gid, NetError, Network, PointEngine, Result, SimEngine};
use netweave_specs::{
    expr, tag, CellRule, CellSpec, Conds, ConnRule, DensityFn, NetParams, PopRule, SectionSpec,
    SimConfig, Topology, ValueSpec, Var,
};

/// Engine wrapper counting build attempts
struct CountingEngine {
    inner: PointEngine,
    builds: usize,
}

impl CountingEngine {
    fn new() -> Self {
        Self {
            inner: PointEngine::new(),
            builds: 0,
        }
    }
}

impl SimEngine for CountingEngine {
    fn build_cell(
        &mut self,
        gid: Gid,
        rule: &CellRule,
        tags: &netweave_specs::Tags,
    ) -> Result<()> {
        self.builds += 1;
        self.inner.build_cell(gid, rule, tags)
    }
    fn add_synapse(
        &mut self,
        conn: &netweave_net::Conn,
        mech: Option<&netweave_specs::SynMechRule>,
    ) -> Result<()> {
        self.inner.add_synapse(conn, mech)
    }
    fn add_stim(&mut self, post: Gid, stim: &netweave_net::StimRecord, seed: u64) -> Result<()> {
        self.inner.add_stim(post, stim, seed)
    }
    fn deliver(&mut self, post: Gid, time_ms: f64, weight: f64) {
        self.inner.deliver(post, time_ms, weight)
    }
    fn advance(&mut self, t_ms: f64, dt_ms: f64) -> Vec<Gid> {
        self.inner.advance(t_ms, dt_ms)
    }
    fn read_state(&self, gid: Gid, sec: &str, var: &str) -> Option<f64> {
        self.inner.read_state(gid, sec, var)
    }
    fn num_cells(&self) -> usize {
        self.inner.num_cells()
    }
}

fn base_params() -> NetParams {
    let mut params = NetParams::new();
    params
        .add_cell_rule(CellRule::new("lif", Conds::any()))
        .unwrap();
    params
}

#[test]
fn full_probability_connects_all_pairs_once() {
    let mut params = base_params();
    params.add_pop(PopRule::fixed("E", "lif", 20)).unwrap();
    params.add_pop(PopRule::fixed("I", "lif", 5)).unwrap();
    params
        .add_conn_rule(
            ConnRule::new("E->I", Conds::pop("E"), Conds::pop("I"))
                .with_topology(Topology::Probability(ValueSpec::Const(1.0))),
        )
        .unwrap();

    let ctx = SerialContext::new();
    let mut net = Network::new(&ctx, params, SimConfig::default()).unwrap();
    let mut engine = PointEngine::new();
    net.instantiate(&mut engine).unwrap();

    assert_eq!(net.num_conns(), 100);
    for cell in net.cells() {
        for conn in &cell.conns {
            assert_ne!(conn.pre, conn.post);
        }
    }
}

#[test]
fn zero_density_population_creates_no_cells() {
    let mut params = base_params();
    params
        .add_pop(PopRule::density(
            "ghost",
            "lif",
            (0.2, 0.5),
            DensityFn::Const(0.0),
        ))
        .unwrap();

    let ctx = SerialContext::new();
    let mut net = Network::new(&ctx, params, SimConfig::default()).unwrap();
    let mut engine = CountingEngine::new();
    net.instantiate(&mut engine).unwrap();

    assert!(net.cells().is_empty());
    assert_eq!(engine.builds, 0, "cell factory ran for an empty population");
    assert_eq!(net.defect_count(), 0);
}

#[test]
fn formula_error_abandons_only_the_offending_rule() {
    let mut params = base_params();
    params.add_pop(PopRule::fixed("E", "lif", 10)).unwrap();
    params
        .add_conn_rule(
            ConnRule::new("bad", Conds::pop("E"), Conds::pop("E")).with_topology(
                Topology::Probability(ValueSpec::Formula(expr::var(Var::PostTag(
                    "nonexistent".into(),
                )))),
            ),
        )
        .unwrap();
    params
        .add_conn_rule(
            ConnRule::new("good", Conds::pop("E"), Conds::pop("E"))
                .with_topology(Topology::Convergence(2)),
        )
        .unwrap();

    let ctx = SerialContext::new();
    let mut net = Network::new(&ctx, params, SimConfig::default()).unwrap();
    let mut engine = PointEngine::new();
    net.instantiate(&mut engine).unwrap();

    assert_eq!(net.failed_rules(), ["bad"]);
    assert_eq!(net.num_conns(), 20, "surviving rule should still resolve");
}

#[test]
fn unmatched_population_is_fatal() {
    let mut params = NetParams::new();
    params.add_pop(PopRule::fixed("E", "lif", 5)).unwrap();
    params
        .add_cell_rule(CellRule::new(
            "only-inh",
            Conds::any().eq(netweave_specs::tag::EI, "I"),
        ))
        .unwrap();

    let ctx = SerialContext::new();
    let mut net = Network::new(&ctx, params, SimConfig::default()).unwrap();
    let mut engine = PointEngine::new();
    let err = net.instantiate(&mut engine).unwrap_err();
    assert!(matches!(err, NetError::NoMatchingCellRule { .. }));
}

#[test]
fn unmatched_cells_on_one_rank_fail_every_rank() {
    // gid 1 lands on rank 1 and matches no rule; rank 0's cell is fine. The
    // run must fail on both ranks rather than leave rank 0 at the barrier.
    let results = ThreadGroup::run(2, |ctx| {
        let mut params = NetParams::new();
        let cells = vec![
            CellSpec {
                x: 100.0,
                y: 348.0,
                z: 100.0,
                ynorm: 0.2,
                ..Default::default()
            },
            CellSpec {
                x: 300.0,
                y: 1566.0,
                z: 300.0,
                ynorm: 0.9,
                ..Default::default()
            },
        ];
        params
            .add_pop(PopRule::cell_list("L", "lif", cells))
            .unwrap();
        params
            .add_cell_rule(CellRule::new(
                "upper",
                Conds::any().range(tag::YNORM, 0.0, 0.5),
            ))
            .unwrap();
        let mut net = Network::new(&ctx, params, SimConfig::default()).unwrap();
        let mut engine = PointEngine::new();
        net.instantiate(&mut engine).err()
    });

    assert!(matches!(
        results[0],
        Some(NetError::PeerFailure { rank: 1, .. })
    ));
    assert!(matches!(
        results[1],
        Some(NetError::NoMatchingCellRule { .. })
    ));
}

#[test]
fn min_delay_below_timestep_is_rejected() {
    let mut params = base_params();
    params.add_pop(PopRule::fixed("E", "lif", 4)).unwrap();
    params.min_delay = 0.05;

    let ctx = SerialContext::new();
    let cfg = SimConfig::new(10.0, 0.1).unwrap();
    let err = Network::new(&ctx, params, cfg).unwrap_err();
    assert!(matches!(err, NetError::Spec(_)));
}

#[test]
fn engine_rejection_skips_cells_and_counts_defects() {
    let mut params = NetParams::new();
    params.add_pop(PopRule::fixed("E", "lif", 6)).unwrap();
    let mut sec = SectionSpec::default();
    sec.pointps
        .insert("lif".into(), [("tau".to_string(), -1.0)].into());
    params
        .add_cell_rule(CellRule::new("broken", Conds::any()).with_sec("soma", sec))
        .unwrap();

    let ctx = SerialContext::new();
    let mut net = Network::new(&ctx, params, SimConfig::default()).unwrap();
    let mut engine = PointEngine::new();
    net.instantiate(&mut engine).unwrap();

    assert_eq!(net.defect_count(), 6);
    assert!(net.cells().is_empty());
}

#[test]
fn gap_junction_rule_creates_mirrored_edges() {
    let mut params = base_params();
    params.add_pop(PopRule::fixed("I", "lif", 8)).unwrap();
    params
        .add_conn_rule(
            ConnRule::new("gap", Conds::pop("I"), Conds::pop("I"))
                .with_topology(Topology::Probability(ValueSpec::Const(0.5)))
                .electrical(),
        )
        .unwrap();

    let ctx = SerialContext::new();
    let mut net = Network::new(&ctx, params, SimConfig::default()).unwrap();
    let mut engine = PointEngine::new();
    net.instantiate(&mut engine).unwrap();

    let conns: Vec<_> = net
        .cells()
        .iter()
        .flat_map(|c| c.conns.iter())
        .collect();
    assert!(!conns.is_empty());
    for conn in &conns {
        assert!(conn.electrical);
        assert!(
            conns
                .iter()
                .any(|m| m.pre == conn.post && m.post == conn.pre),
            "unpaired gap junction {} -> {}",
            conn.pre,
            conn.post
        );
    }
}
