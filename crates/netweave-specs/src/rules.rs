//! Declarative rule types: populations, cells, synaptic mechanisms,
//! connections and stimulation
//!
//! Each rule kind is a typed struct with an explicit, closed set of options.
//! Topology modes are a tagged enum dispatched by `match`, not a string
//! naming a method.

use crate::tags::{tag, TagValue, Tags};
use crate::value::{Expr, EvalScope, FormulaError, ValueSpec};
use crate::{Result, SpecError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single condition over one tag field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Cond {
    /// Field equals the given value
    Eq {
        /// Tag field name
        field: String,
        /// Required value
        value: TagValue,
    },
    /// Field is one of the given values
    OneOf {
        /// Tag field name
        field: String,
        /// Accepted values
        values: Vec<TagValue>,
    },
    /// Numeric field lies in [low, high]
    Range {
        /// Tag field name
        field: String,
        /// Lower bound (inclusive)
        low: f64,
        /// Upper bound (inclusive)
        high: f64,
    },
}

impl Cond {
    /// Whether the given tags satisfy this condition
    pub fn matches(&self, tags: &Tags) -> bool {
        match self {
            Cond::Eq { field, value } => tags.get(field) == Some(value),
            Cond::OneOf { field, values } => match tags.get(field) {
                Some(v) => values.contains(v),
                None => false,
            },
            Cond::Range { field, low, high } => match tags.num(field) {
                Some(v) => v >= *low && v <= *high,
                None => false,
            },
        }
    }
}

/// A conjunction of conditions over a cell's tags
///
/// An empty predicate matches every cell. Specificity (the number of
/// conditions) breaks ties when several cell rules match the same tags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conds(pub Vec<Cond>);

impl Conds {
    /// Empty predicate (matches everything)
    pub fn any() -> Self {
        Self::default()
    }

    /// Predicate matching a single population label
    pub fn pop(label: impl Into<String>) -> Self {
        Self::any().eq(tag::POP, label.into())
    }

    /// Add an equality condition
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<TagValue>) -> Self {
        self.0.push(Cond::Eq {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    /// Add a set-membership condition
    pub fn one_of(
        mut self,
        field: impl Into<String>,
        values: impl IntoIterator<Item = impl Into<TagValue>>,
    ) -> Self {
        self.0.push(Cond::OneOf {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Add a numeric range condition (inclusive bounds)
    pub fn range(mut self, field: impl Into<String>, low: f64, high: f64) -> Self {
        self.0.push(Cond::Range {
            field: field.into(),
            low,
            high,
        });
        self
    }

    /// Whether the given tags satisfy every condition
    pub fn matches(&self, tags: &Tags) -> bool {
        self.0.iter().all(|c| c.matches(tags))
    }

    /// Number of conditions (used for most-specific-rule selection)
    pub fn specificity(&self) -> usize {
        self.0.len()
    }
}

/// Depth-dependent cell density (cells per mm^3)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DensityFn {
    /// Constant density over the whole depth range
    Const(f64),
    /// Density as a formula over the `Ynorm` variable
    Formula(Expr),
}

impl DensityFn {
    /// Evaluate at a normalized depth
    pub fn eval(&self, ynorm: f64) -> std::result::Result<f64, FormulaError> {
        match self {
            DensityFn::Const(v) => Ok(*v),
            DensityFn::Formula(e) => e.eval(&EvalScope::depth(ynorm)),
        }
    }
}

/// Explicit per-cell attributes for list-based populations, consumed verbatim
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CellSpec {
    /// x location (um)
    pub x: f64,
    /// y location (um)
    pub y: f64,
    /// z location (um)
    pub z: f64,
    /// Normalized depth
    pub ynorm: f64,
    /// Extra per-cell tags
    pub tags: Tags,
}

/// How a population resolves into concrete cells
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PopPolicy {
    /// Exactly `num_cells` cells, uniformly placed
    Fixed {
        /// Number of cells
        num_cells: u32,
    },
    /// Rejection-sampled from a density function over a normalized-depth range
    Density {
        /// Depth range [low, high], both in [0, 1]
        ynorm_range: (f64, f64),
        /// Density function (cells per mm^3)
        density: DensityFn,
    },
    /// Explicit per-cell list
    CellList {
        /// Cells, in order; gids are assigned in list order
        cells: Vec<CellSpec>,
    },
}

/// Population rule: a named group of cells sharing baseline tags and a
/// resolution policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopRule {
    /// Population label (unique)
    pub label: String,
    /// Baseline tags applied to every cell of this population
    /// (cell model, cell type, E/I flag, ...)
    pub tags: Tags,
    /// Resolution policy
    pub policy: PopPolicy,
}

impl PopRule {
    /// Fixed-count population with a cell-model tag
    pub fn fixed(label: impl Into<String>, cell_model: impl Into<String>, num_cells: u32) -> Self {
        Self {
            label: label.into(),
            tags: Tags::new().with_text(tag::CELL_MODEL, cell_model),
            policy: PopPolicy::Fixed { num_cells },
        }
    }

    /// Density-based population over a normalized-depth range
    pub fn density(
        label: impl Into<String>,
        cell_model: impl Into<String>,
        ynorm_range: (f64, f64),
        density: DensityFn,
    ) -> Self {
        Self {
            label: label.into(),
            tags: Tags::new().with_text(tag::CELL_MODEL, cell_model),
            policy: PopPolicy::Density {
                ynorm_range,
                density,
            },
        }
    }

    /// Explicit cell-list population
    pub fn cell_list(
        label: impl Into<String>,
        cell_model: impl Into<String>,
        cells: Vec<CellSpec>,
    ) -> Self {
        Self {
            label: label.into(),
            tags: Tags::new().with_text(tag::CELL_MODEL, cell_model),
            policy: PopPolicy::CellList { cells },
        }
    }

    /// Add a baseline tag
    pub fn with_tag(mut self, field: impl Into<String>, value: impl Into<TagValue>) -> Self {
        match value.into() {
            TagValue::Num(v) => self.tags.set_num(field, v),
            TagValue::Text(s) => self.tags.set_text(field, s),
        }
        self
    }

    /// Validate policy parameters
    pub fn validate(&self) -> Result<()> {
        if let PopPolicy::Density { ynorm_range, .. } = &self.policy {
            let (lo, hi) = *ynorm_range;
            if !(0.0..=1.0).contains(&lo) || !(0.0..=1.0).contains(&hi) || lo > hi {
                return Err(SpecError::invalid_parameter(
                    format!("pop[{}].ynorm_range", self.label),
                    format!("({}, {})", lo, hi),
                    "0 <= low <= high <= 1",
                ));
            }
        }
        Ok(())
    }
}

/// Section geometry (um / ohm-cm)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geom {
    /// Diameter (um)
    pub diam: f64,
    /// Length (um)
    pub len: f64,
    /// Axial resistivity (ohm-cm)
    pub ra: f64,
}

impl Default for Geom {
    fn default() -> Self {
        Self {
            diam: 18.8,
            len: 18.8,
            ra: 123.0,
        }
    }
}

/// Named parameter set for an inserted mechanism or point process
pub type MechParams = BTreeMap<String, f64>;

/// Structural description of one section of a cell model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SectionSpec {
    /// Geometry; engine defaults apply when absent
    pub geom: Option<Geom>,
    /// Distributed mechanisms inserted into the section, by name
    pub mechs: BTreeMap<String, MechParams>,
    /// Point processes attached to the section, by name
    pub pointps: BTreeMap<String, MechParams>,
}

/// Cell rule: a condition predicate plus the structural/mechanism
/// description handed to the simulation engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellRule {
    /// Rule label (unique)
    pub label: String,
    /// Predicate over population/cell tags; the most specific matching rule
    /// builds the cell
    pub conds: Conds,
    /// Sections by name ("soma", "dend", ...)
    pub secs: BTreeMap<String, SectionSpec>,
}

impl CellRule {
    /// Create a cell rule with an empty structural description
    pub fn new(label: impl Into<String>, conds: Conds) -> Self {
        Self {
            label: label.into(),
            conds,
            secs: BTreeMap::new(),
        }
    }

    /// Add a section
    pub fn with_sec(mut self, name: impl Into<String>, sec: SectionSpec) -> Self {
        self.secs.insert(name.into(), sec);
        self
    }

    /// Single-soma rule with one distributed mechanism
    pub fn soma_mech(
        label: impl Into<String>,
        conds: Conds,
        mech: impl Into<String>,
        params: MechParams,
    ) -> Self {
        let mut sec = SectionSpec {
            geom: Some(Geom::default()),
            ..Default::default()
        };
        sec.mechs.insert(mech.into(), params);
        Self::new(label, conds).with_sec("soma", sec)
    }
}

/// Synaptic mechanism rule: label plus kinetic parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynMechRule {
    /// Mechanism label (unique)
    pub label: String,
    /// Engine mechanism kind (e.g. "exp2syn", "electsyn")
    pub kind: String,
    /// Kinetic parameters
    pub params: MechParams,
}

impl SynMechRule {
    /// Create a mechanism rule with no parameters
    pub fn new(label: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            kind: kind.into(),
            params: MechParams::new(),
        }
    }

    /// Add a kinetic parameter
    pub fn with_param(mut self, name: impl Into<String>, value: f64) -> Self {
        self.params.insert(name.into(), value);
        self
    }
}

/// Connection topology mode: the closed set of ways a rule selects pairs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Topology {
    /// Every candidate pair connected
    Full,
    /// Independent Bernoulli trial per candidate pair; the probability may be
    /// a formula over pair distance and tags
    Probability(ValueSpec),
    /// Exactly k presynaptic sources per postsynaptic cell, drawn without
    /// replacement
    Convergence(u32),
    /// Each presynaptic cell targets exactly k postsynaptic cells, drawn
    /// without replacement
    Divergence(u32),
}

/// Connection rule: pre/post predicates, topology, and per-edge value specs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnRule {
    /// Rule label (unique)
    pub label: String,
    /// Presynaptic candidate predicate (evaluated against the global tag map)
    pub pre: Conds,
    /// Postsynaptic target predicate
    pub post: Conds,
    /// Pair selection mode
    pub topology: Topology,
    /// Weight per accepted edge
    pub weight: ValueSpec,
    /// Delay per accepted edge (ms); clamped to the network minimum delay
    pub delay: ValueSpec,
    /// Target synaptic mechanism label (empty: engine default)
    pub syn_mech: String,
    /// Target section
    pub sec: String,
    /// Location along the target section in [0, 1]
    pub loc: f64,
    /// Electrical (gap-junction) coupling: bidirectional and co-located
    pub electrical: bool,
    /// Wrap pairwise distances around the network boundary
    pub toroidal: bool,
}

impl ConnRule {
    /// Create a full-connectivity rule with unit weight and minimum delay
    pub fn new(label: impl Into<String>, pre: Conds, post: Conds) -> Self {
        Self {
            label: label.into(),
            pre,
            post,
            topology: Topology::Full,
            weight: ValueSpec::Const(1.0),
            delay: ValueSpec::Const(0.0),
            syn_mech: String::new(),
            sec: "soma".to_string(),
            loc: 0.5,
            electrical: false,
            toroidal: false,
        }
    }

    /// Set the topology mode
    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    /// Set the weight spec
    pub fn with_weight(mut self, weight: ValueSpec) -> Self {
        self.weight = weight;
        self
    }

    /// Set the delay spec
    pub fn with_delay(mut self, delay: ValueSpec) -> Self {
        self.delay = delay;
        self
    }

    /// Set the target synaptic mechanism
    pub fn with_syn_mech(mut self, mech: impl Into<String>) -> Self {
        self.syn_mech = mech.into();
        self
    }

    /// Set the target section and location
    pub fn with_target(mut self, sec: impl Into<String>, loc: f64) -> Self {
        self.sec = sec.into();
        self.loc = loc;
        self
    }

    /// Mark the rule as electrical (gap-junction) coupling
    pub fn electrical(mut self) -> Self {
        self.electrical = true;
        self
    }

    /// Enable toroidal distance wrap-around for this rule
    pub fn toroidal(mut self) -> Self {
        self.toroidal = true;
        self
    }

    /// Validate rule parameters
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.loc) {
            return Err(SpecError::invalid_parameter(
                format!("conn[{}].loc", self.label),
                self.loc.to_string(),
                "in [0, 1]",
            ));
        }
        if let Topology::Probability(ref prob) = self.topology {
            prob.validate(&format!("conn[{}].probability", self.label))?;
        }
        self.weight
            .validate(&format!("conn[{}].weight", self.label))?;
        self.delay.validate(&format!("conn[{}].delay", self.label))?;
        Ok(())
    }
}

/// Independent spike-source parameters for a stimulation rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StimSource {
    /// Mean firing rate (Hz)
    pub rate_hz: f64,
    /// Fractional timing noise in [0, 1]: 0 regular, 1 fully Poisson
    pub noise: f64,
    /// Onset time (ms)
    pub start_ms: f64,
}

impl StimSource {
    /// Fully-Poisson source starting at t=0
    pub fn poisson(rate_hz: f64) -> Self {
        Self {
            rate_hz,
            noise: 1.0,
            start_ms: 0.0,
        }
    }
}

/// Stimulation rule: an independent source wired onto every matching cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StimRule {
    /// Rule label (unique)
    pub label: String,
    /// Target cell predicate
    pub targets: Conds,
    /// Source parameters
    pub source: StimSource,
    /// Fraction of matching cells that receive the source (Bernoulli per cell)
    pub fraction: f64,
    /// Weight per created stimulus
    pub weight: ValueSpec,
    /// Delay per created stimulus (ms)
    pub delay: ValueSpec,
    /// Target synaptic mechanism label
    pub syn_mech: String,
    /// Target section
    pub sec: String,
    /// Location along the target section
    pub loc: f64,
}

impl StimRule {
    /// Create a stimulation rule wiring `source` onto all matching cells
    pub fn new(label: impl Into<String>, targets: Conds, source: StimSource) -> Self {
        Self {
            label: label.into(),
            targets,
            source,
            fraction: 1.0,
            weight: ValueSpec::Const(1.0),
            delay: ValueSpec::Const(0.0),
            syn_mech: String::new(),
            sec: "soma".to_string(),
            loc: 0.5,
        }
    }

    /// Set the receiving fraction
    pub fn with_fraction(mut self, fraction: f64) -> Self {
        self.fraction = fraction;
        self
    }

    /// Set the weight spec
    pub fn with_weight(mut self, weight: ValueSpec) -> Self {
        self.weight = weight;
        self
    }

    /// Set the delay spec
    pub fn with_delay(mut self, delay: ValueSpec) -> Self {
        self.delay = delay;
        self
    }

    /// Set the target synaptic mechanism
    pub fn with_syn_mech(mut self, mech: impl Into<String>) -> Self {
        self.syn_mech = mech.into();
        self
    }

    /// Validate rule parameters
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.fraction) {
            return Err(SpecError::invalid_parameter(
                format!("stim[{}].fraction", self.label),
                self.fraction.to_string(),
                "in [0, 1]",
            ));
        }
        if self.source.rate_hz <= 0.0 {
            return Err(SpecError::invalid_parameter(
                format!("stim[{}].rate_hz", self.label),
                self.source.rate_hz.to_string(),
                "> 0",
            ));
        }
        self.weight
            .validate(&format!("stim[{}].weight", self.label))?;
        self.delay.validate(&format!("stim[{}].delay", self.label))?;
        Ok(())
    }
}
