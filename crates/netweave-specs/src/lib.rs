//! Typed declarative rule surface for netweave network models
//!
//! This crate defines the configuration objects consumed by the network
//! instantiation engine: `NetParams` (population, cell, synaptic mechanism,
//! connection and stimulation rules plus global network geometry) and
//! `SimConfig` (run parameters, seeds, recording and output options).
//!
//! Everything here is plain data: rules are closed enums and eagerly
//! validated structs, weight/delay/probability formulas are a small
//! expression AST rather than evaluated strings, and the whole surface is
//! serde-serializable so a network description can round-trip through a
//! snapshot file.

#![warn(missing_docs)]
#![warn(clippy::all)]

use serde::{Deserialize, Serialize};

pub mod rules;
pub mod tags;
pub mod value;

pub use rules::{
    CellRule, CellSpec, Cond, Conds, ConnRule, DensityFn, Geom, PopPolicy, PopRule, SectionSpec,
    StimRule, StimSource, SynMechRule, Topology,
};
pub use tags::{tag, TagValue, Tags};
pub use value::{expr, EvalScope, Expr, FormulaError, ValueSpec, Var};

/// Result type for spec construction and validation
pub type Result<T> = std::result::Result<T, SpecError>;

/// Errors raised while building or validating a network description
#[derive(thiserror::Error, Debug)]
pub enum SpecError {
    /// A rule label was used twice within the same rule kind
    #[error("Duplicate {kind} rule label: {label}")]
    DuplicateLabel {
        /// Rule kind ("pop", "cell", "conn", ...)
        kind: &'static str,
        /// The offending label
        label: String,
    },

    /// A parameter value violates its constraint
    #[error("Invalid parameter {parameter}: {value} (expected {constraint})")]
    InvalidParameter {
        /// Parameter name
        parameter: String,
        /// Invalid value
        value: String,
        /// Constraint description
        constraint: String,
    },

    /// A connection or stimulation rule references an undefined synaptic mechanism
    #[error("Rule {rule} references unknown synaptic mechanism: {mech}")]
    UnknownSynMech {
        /// Referencing rule label
        rule: String,
        /// Unknown mechanism label
        mech: String,
    },
}

impl SpecError {
    /// Create an invalid parameter error
    pub fn invalid_parameter(
        parameter: impl Into<String>,
        value: impl Into<String>,
        constraint: impl Into<String>,
    ) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            value: value.into(),
            constraint: constraint.into(),
        }
    }
}

/// Process-wide network description: ordered rule collections plus global
/// geometry scalars.
///
/// Rule collections preserve insertion order (gids are assigned in the order
/// populations were added) and labels are unique per rule kind. Built once
/// before instantiation; immutable during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetParams {
    /// Network spatial extent in um: [x, depth (y), z]
    pub size: [f64; 3],
    /// Spike propagation velocity (um/ms), available to delay formulas
    pub prop_velocity: f64,
    /// Default exponential length constant for distance-dependent probability (um)
    pub length_const: f64,
    /// Minimum connection delay (ms); resolved delays are clamped to this
    pub min_delay: f64,
    /// Global multiplier applied to every resolved connection weight
    pub scale_conn_weight: f64,
    pops: Vec<PopRule>,
    cells: Vec<CellRule>,
    syn_mechs: Vec<SynMechRule>,
    conns: Vec<ConnRule>,
    stims: Vec<StimRule>,
}

impl Default for NetParams {
    fn default() -> Self {
        Self {
            size: [1000.0, 1740.0, 1000.0],
            prop_velocity: 100.0,
            length_const: 200.0,
            min_delay: 2.0,
            scale_conn_weight: 1.0,
            pops: Vec::new(),
            cells: Vec::new(),
            syn_mechs: Vec::new(),
            conns: Vec::new(),
            stims: Vec::new(),
        }
    }
}

impl NetParams {
    /// Create an empty network description with default geometry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a population rule; fails on duplicate label or invalid policy
    pub fn add_pop(&mut self, rule: PopRule) -> Result<()> {
        if self.pops.iter().any(|p| p.label == rule.label) {
            return Err(SpecError::DuplicateLabel {
                kind: "pop",
                label: rule.label,
            });
        }
        rule.validate()?;
        self.pops.push(rule);
        Ok(())
    }

    /// Add a cell rule; fails on duplicate label
    pub fn add_cell_rule(&mut self, rule: CellRule) -> Result<()> {
        if self.cells.iter().any(|c| c.label == rule.label) {
            return Err(SpecError::DuplicateLabel {
                kind: "cell",
                label: rule.label,
            });
        }
        self.cells.push(rule);
        Ok(())
    }

    /// Add a synaptic mechanism rule; fails on duplicate label
    pub fn add_syn_mech(&mut self, rule: SynMechRule) -> Result<()> {
        if self.syn_mechs.iter().any(|s| s.label == rule.label) {
            return Err(SpecError::DuplicateLabel {
                kind: "synMech",
                label: rule.label,
            });
        }
        self.syn_mechs.push(rule);
        Ok(())
    }

    /// Add a connection rule; fails on duplicate label, invalid location, or
    /// reference to an undefined synaptic mechanism
    pub fn add_conn_rule(&mut self, rule: ConnRule) -> Result<()> {
        if self.conns.iter().any(|c| c.label == rule.label) {
            return Err(SpecError::DuplicateLabel {
                kind: "conn",
                label: rule.label,
            });
        }
        rule.validate()?;
        if !rule.syn_mech.is_empty() && self.syn_mech(&rule.syn_mech).is_none() {
            return Err(SpecError::UnknownSynMech {
                rule: rule.label,
                mech: rule.syn_mech,
            });
        }
        self.conns.push(rule);
        Ok(())
    }

    /// Add a stimulation rule; fails on duplicate label or invalid fraction
    pub fn add_stim_rule(&mut self, rule: StimRule) -> Result<()> {
        if self.stims.iter().any(|s| s.label == rule.label) {
            return Err(SpecError::DuplicateLabel {
                kind: "stim",
                label: rule.label,
            });
        }
        rule.validate()?;
        self.stims.push(rule);
        Ok(())
    }

    /// Population rules, in insertion order
    pub fn pops(&self) -> &[PopRule] {
        &self.pops
    }

    /// Cell rules, in insertion order
    pub fn cell_rules(&self) -> &[CellRule] {
        &self.cells
    }

    /// Synaptic mechanism rules
    pub fn syn_mechs(&self) -> &[SynMechRule] {
        &self.syn_mechs
    }

    /// Connection rules, in insertion order
    pub fn conn_rules(&self) -> &[ConnRule] {
        &self.conns
    }

    /// Stimulation rules, in insertion order
    pub fn stim_rules(&self) -> &[StimRule] {
        &self.stims
    }

    /// Look up a synaptic mechanism by label
    pub fn syn_mech(&self, label: &str) -> Option<&SynMechRule> {
        self.syn_mechs.iter().find(|s| s.label == label)
    }

    /// Validate global scalars and every stored rule
    pub fn validate(&self) -> Result<()> {
        for (name, v) in [
            ("size.x", self.size[0]),
            ("size.y", self.size[1]),
            ("size.z", self.size[2]),
        ] {
            if v <= 0.0 {
                return Err(SpecError::invalid_parameter(name, v.to_string(), "> 0"));
            }
        }
        if self.prop_velocity <= 0.0 {
            return Err(SpecError::invalid_parameter(
                "prop_velocity",
                self.prop_velocity.to_string(),
                "> 0",
            ));
        }
        if self.length_const <= 0.0 {
            return Err(SpecError::invalid_parameter(
                "length_const",
                self.length_const.to_string(),
                "> 0",
            ));
        }
        for rule in &self.pops {
            rule.validate()?;
        }
        for rule in &self.conns {
            rule.validate()?;
        }
        for rule in &self.stims {
            rule.validate()?;
        }
        Ok(())
    }
}

/// Seeds for the three independent stochastic stages: connectivity,
/// stimulation, and cell locations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seeds {
    /// Connectivity seed
    pub conn: u64,
    /// Stimulation seed
    pub stim: u64,
    /// Cell location seed
    pub loc: u64,
}

impl Default for Seeds {
    fn default() -> Self {
        Self {
            conn: 1,
            stim: 1,
            loc: 1,
        }
    }
}

/// Which cells a trace recording applies to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordSelect {
    /// Record from every cell
    All,
    /// Record only the listed gids
    Cells(Vec<u64>),
}

impl RecordSelect {
    /// Whether the given gid is selected for recording
    pub fn includes(&self, gid: u64) -> bool {
        match self {
            RecordSelect::All => true,
            RecordSelect::Cells(gids) => gids.contains(&gid),
        }
    }
}

/// A named state-variable trace to record (e.g. somatic voltage)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceSpec {
    /// Trace label used to key recorded data (e.g. "Vsoma")
    pub label: String,
    /// Section to read from
    pub sec: String,
    /// State variable name (e.g. "v")
    pub var: String,
}

/// Process-wide run configuration: duration, timestep, seeds, recording and
/// output options. Built once; immutable during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    /// Simulation duration (ms)
    pub duration_ms: f64,
    /// Integration/collective step (ms)
    pub dt_ms: f64,
    /// Seeds for the independent randomizer stages
    pub seeds: Seeds,
    /// Cells to record traces from
    pub record: RecordSelect,
    /// Traces to record
    pub record_traces: Vec<TraceSpec>,
    /// Interval between trace samples (ms)
    pub record_step_ms: f64,
    /// Emit per-cell diagnostics during instantiation
    pub verbose: bool,
    /// Serialize connection lists in the compact (field-array) snapshot format
    pub compact_conn_format: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            duration_ms: 1000.0,
            dt_ms: 0.1,
            seeds: Seeds::default(),
            record: RecordSelect::Cells(Vec::new()),
            record_traces: Vec::new(),
            record_step_ms: 0.1,
            verbose: false,
            compact_conn_format: false,
        }
    }
}

impl SimConfig {
    /// Create a run configuration with validation
    pub fn new(duration_ms: f64, dt_ms: f64) -> Result<Self> {
        let cfg = Self {
            duration_ms,
            dt_ms,
            ..Default::default()
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Set the randomizer seeds
    pub fn with_seeds(mut self, seeds: Seeds) -> Self {
        self.seeds = seeds;
        self
    }

    /// Record the given trace from the selected cells
    pub fn with_trace(mut self, spec: TraceSpec, select: RecordSelect) -> Self {
        self.record_traces.push(spec);
        self.record = select;
        self
    }

    /// Number of collective steps in a run
    pub fn num_steps(&self) -> usize {
        (self.duration_ms / self.dt_ms).round() as usize
    }

    /// Validate run parameters
    pub fn validate(&self) -> Result<()> {
        if self.dt_ms <= 0.0 {
            return Err(SpecError::invalid_parameter(
                "dt_ms",
                self.dt_ms.to_string(),
                "> 0",
            ));
        }
        if self.duration_ms < self.dt_ms {
            return Err(SpecError::invalid_parameter(
                "duration_ms",
                format!("{} (with dt_ms={})", self.duration_ms, self.dt_ms),
                ">= dt_ms",
            ));
        }
        if self.record_step_ms < self.dt_ms {
            return Err(SpecError::invalid_parameter(
                "record_step_ms",
                self.record_step_ms.to_string(),
                ">= dt_ms",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_pop_label_rejected() {
        let mut params = NetParams::new();
        params
            .add_pop(PopRule::fixed("E", "lif", 10))
            .unwrap();
        let err = params.add_pop(PopRule::fixed("E", "lif", 5)).unwrap_err();
        assert!(matches!(err, SpecError::DuplicateLabel { kind: "pop", .. }));
    }

    #[test]
    fn test_conn_rule_requires_known_syn_mech() {
        let mut params = NetParams::new();
        let rule = ConnRule::new("E->E", Conds::pop("E"), Conds::pop("E"))
            .with_syn_mech("AMPA");
        let err = params.add_conn_rule(rule).unwrap_err();
        assert!(matches!(err, SpecError::UnknownSynMech { .. }));

        params
            .add_syn_mech(SynMechRule::new("AMPA", "exp2syn"))
            .unwrap();
        let rule = ConnRule::new("E->E", Conds::pop("E"), Conds::pop("E"))
            .with_syn_mech("AMPA");
        assert!(params.add_conn_rule(rule).is_ok());
    }

    #[test]
    fn test_sim_config_validation() {
        assert!(SimConfig::new(1000.0, 0.0).is_err());
        assert!(SimConfig::new(0.05, 0.1).is_err());
        let cfg = SimConfig::new(1000.0, 0.1).unwrap();
        assert_eq!(cfg.num_steps(), 10000);
    }

    #[test]
    fn test_net_params_validation() {
        let mut params = NetParams::new();
        assert!(params.validate().is_ok());
        params.size[1] = 0.0;
        assert!(params.validate().is_err());
    }
}
