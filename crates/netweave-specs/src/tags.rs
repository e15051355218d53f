//! Per-cell tag dictionaries
//!
//! A tag is a named scalar or categorical attribute of a cell (location,
//! normalized depth, cell type, E/I polarity, rule-derived scalars). Tags are
//! assigned once at population resolution, are immutable afterwards, and are
//! the only cell data exchanged across ranks: connection-rule predicates and
//! formulas read nothing else.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Well-known tag field names
pub mod tag {
    /// Population label
    pub const POP: &str = "pop";
    /// Cell model label (selects the cell rule family)
    pub const CELL_MODEL: &str = "cellModel";
    /// Cell type classification
    pub const CELL_TYPE: &str = "cellType";
    /// Excitatory/inhibitory flag ("E" or "I")
    pub const EI: &str = "ei";
    /// x location (um)
    pub const X: &str = "x";
    /// y location, depth axis (um)
    pub const Y: &str = "y";
    /// z location (um)
    pub const Z: &str = "z";
    /// Normalized depth in [0, 1]
    pub const YNORM: &str = "ynorm";
}

/// A single tag value: numeric scalar or categorical text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TagValue {
    /// Numeric scalar
    Num(f64),
    /// Categorical text
    Text(String),
}

impl From<f64> for TagValue {
    fn from(v: f64) -> Self {
        TagValue::Num(v)
    }
}

impl From<&str> for TagValue {
    fn from(v: &str) -> Self {
        TagValue::Text(v.to_string())
    }
}

impl From<String> for TagValue {
    fn from(v: String) -> Self {
        TagValue::Text(v)
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::Num(v) => write!(f, "{}", v),
            TagValue::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Ordered tag dictionary for one cell
///
/// Backed by a `BTreeMap` so iteration (and therefore serialization) order is
/// deterministic regardless of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tags {
    fields: BTreeMap<String, TagValue>,
}

impl Tags {
    /// Create an empty tag dictionary
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a numeric tag
    pub fn set_num(&mut self, field: impl Into<String>, value: f64) {
        self.fields.insert(field.into(), TagValue::Num(value));
    }

    /// Set a text tag
    pub fn set_text(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.fields
            .insert(field.into(), TagValue::Text(value.into()));
    }

    /// Builder-style numeric tag
    pub fn with_num(mut self, field: impl Into<String>, value: f64) -> Self {
        self.set_num(field, value);
        self
    }

    /// Builder-style text tag
    pub fn with_text(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_text(field, value);
        self
    }

    /// Look up a tag value
    pub fn get(&self, field: &str) -> Option<&TagValue> {
        self.fields.get(field)
    }

    /// Numeric tag value, if present and numeric
    pub fn num(&self, field: &str) -> Option<f64> {
        match self.fields.get(field) {
            Some(TagValue::Num(v)) => Some(*v),
            _ => None,
        }
    }

    /// Text tag value, if present and textual
    pub fn text(&self, field: &str) -> Option<&str> {
        match self.fields.get(field) {
            Some(TagValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Spatial position [x, y, z] in um; missing axes read as 0
    pub fn position(&self) -> [f64; 3] {
        [
            self.num(tag::X).unwrap_or(0.0),
            self.num(tag::Y).unwrap_or(0.0),
            self.num(tag::Z).unwrap_or(0.0),
        ]
    }

    /// Normalized depth; 0 if unset
    pub fn ynorm(&self) -> f64 {
        self.num(tag::YNORM).unwrap_or(0.0)
    }

    /// Merge another tag dictionary into this one (other wins on conflict)
    pub fn merge(&mut self, other: &Tags) {
        for (k, v) in &other.fields {
            self.fields.insert(k.clone(), v.clone());
        }
    }

    /// Iterate fields in deterministic (sorted) order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &TagValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of tag fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the dictionary is empty
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_accessors() {
        let tags = Tags::new()
            .with_text(tag::POP, "E")
            .with_num(tag::X, 100.0)
            .with_num(tag::YNORM, 0.3);

        assert_eq!(tags.text(tag::POP), Some("E"));
        assert_eq!(tags.num(tag::X), Some(100.0));
        assert_eq!(tags.ynorm(), 0.3);
        assert_eq!(tags.position(), [100.0, 0.0, 0.0]);
        // Type mismatch reads as absent
        assert_eq!(tags.num(tag::POP), None);
        assert_eq!(tags.text(tag::X), None);
    }

    #[test]
    fn test_merge_overwrites() {
        let mut base = Tags::new().with_text(tag::EI, "E").with_num(tag::X, 1.0);
        let over = Tags::new().with_num(tag::X, 2.0);
        base.merge(&over);
        assert_eq!(base.num(tag::X), Some(2.0));
        assert_eq!(base.text(tag::EI), Some("E"));
    }
}
