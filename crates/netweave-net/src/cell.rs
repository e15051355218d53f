//! Materialized cells and their incoming connections
//!
//! A `Cell` exists on exactly one rank (its gid's owner) and accumulates the
//! incoming connection and stimulation records resolved for it. The engine's
//! model object lives in the engine, keyed by gid; this side holds only the
//! declarative record.

use crate::ids::Gid;
use netweave_specs::{CellRule, StimSource, Tags};
use serde::{Deserialize, Serialize};

/// One resolved synaptic connection, immutable once created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conn {
    /// Presynaptic gid (may live on any rank)
    pub pre: Gid,
    /// Postsynaptic gid (owned by the rank holding this record)
    pub post: Gid,
    /// Synaptic weight, scale factors applied
    pub weight: f64,
    /// Transmission delay (ms), clamped to the network minimum
    pub delay: f64,
    /// Target synaptic mechanism label
    pub syn_mech: String,
    /// Target section
    pub sec: String,
    /// Location along the target section
    pub loc: f64,
    /// Gap-junction coupling (the mirrored edge exists on the peer's owner)
    pub electrical: bool,
}

/// One resolved stimulation input: an independent source, no presynaptic cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StimRecord {
    /// Originating stimulation rule label
    pub label: String,
    /// Source parameters
    pub source: StimSource,
    /// Stimulus weight
    pub weight: f64,
    /// Delivery delay (ms)
    pub delay: f64,
    /// Target synaptic mechanism label
    pub syn_mech: String,
    /// Target section
    pub sec: String,
    /// Location along the target section
    pub loc: f64,
}

/// A materialized cell on its owning rank
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cell {
    /// Global identifier
    pub gid: Gid,
    /// Owning population label
    pub pop: String,
    /// Full tag set
    pub tags: Tags,
    /// Incoming synaptic connections
    pub conns: Vec<Conn>,
    /// Incoming stimulation inputs
    pub stims: Vec<StimRecord>,
}

impl Cell {
    /// Create a cell with no inputs yet
    pub fn new(gid: Gid, pop: impl Into<String>, tags: Tags) -> Self {
        Self {
            gid,
            pop: pop.into(),
            tags,
            conns: Vec::new(),
            stims: Vec::new(),
        }
    }
}

/// Select the cell rule building a cell with the given tags
///
/// The most specific matching rule wins (most conditions); ties break to the
/// earliest rule in declaration order. `None` means the cell cannot be built.
pub fn match_cell_rule<'a>(rules: &'a [CellRule], tags: &Tags) -> Option<&'a CellRule> {
    rules
        .iter()
        .filter(|r| r.conds.matches(tags))
        .max_by(|a, b| {
            a.conds
                .specificity()
                .cmp(&b.conds.specificity())
                // max_by keeps the later element on Equal; invert so the
                // earlier rule wins ties
                .then(std::cmp::Ordering::Greater)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use netweave_specs::{tag, Conds};

    fn rules() -> Vec<CellRule> {
        vec![
            CellRule::new("any", Conds::any()),
            CellRule::new("exc", Conds::any().eq(tag::EI, "E")),
            CellRule::new(
                "exc-deep",
                Conds::any().eq(tag::EI, "E").range(tag::YNORM, 0.5, 1.0),
            ),
        ]
    }

    #[test]
    fn test_most_specific_rule_wins() {
        let tags = Tags::new().with_text(tag::EI, "E").with_num(tag::YNORM, 0.7);
        assert_eq!(match_cell_rule(&rules(), &tags).unwrap().label, "exc-deep");

        let tags = Tags::new().with_text(tag::EI, "E").with_num(tag::YNORM, 0.2);
        assert_eq!(match_cell_rule(&rules(), &tags).unwrap().label, "exc");

        let tags = Tags::new().with_text(tag::EI, "I");
        assert_eq!(match_cell_rule(&rules(), &tags).unwrap().label, "any");
    }

    #[test]
    fn test_specificity_ties_break_to_declaration_order() {
        let rules = vec![
            CellRule::new("first", Conds::any().eq(tag::EI, "E")),
            CellRule::new("second", Conds::any().eq(tag::CELL_TYPE, "IT")),
        ];
        let tags = Tags::new()
            .with_text(tag::EI, "E")
            .with_text(tag::CELL_TYPE, "IT");
        assert_eq!(match_cell_rule(&rules, &tags).unwrap().label, "first");
    }

    #[test]
    fn test_no_match_is_none() {
        let rules = vec![CellRule::new("exc", Conds::any().eq(tag::EI, "E"))];
        let tags = Tags::new().with_text(tag::EI, "I");
        assert!(match_cell_rule(&rules, &tags).is_none());
    }
}
