//! Population resolution: from declarative rules to the logical cell set
//!
//! Every rank resolves every population identically, producing the full
//! logical list of (gid, tags) for the network; only gids satisfying the
//! ownership partition are later materialized as cells. Resolution draws all
//! randomness from per-candidate derived seeds, so the outcome is a pure
//! function of the rule and the location seed, independent of rank count.

use crate::error::{NetError, Result};
use crate::ids::{derive_seed, Gid, GidAllocator};
use netweave_specs::{tag, NetParams, PopPolicy, PopRule, Tags};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::ops::Range;

/// One logical cell of a resolved population
#[derive(Debug, Clone)]
pub struct ResolvedCell {
    /// Global identifier
    pub gid: Gid,
    /// Full tag set: population baseline plus location and per-cell values
    pub tags: Tags,
}

/// A resolved population: its gid block and full logical cell list
#[derive(Debug, Clone)]
pub struct Population {
    /// Population label
    pub label: String,
    /// The rule this population was resolved from
    pub rule: PopRule,
    /// Contiguous gid block claimed by this population
    pub gid_range: Range<u64>,
    /// All logical cells, identical on every rank
    pub cells: Vec<ResolvedCell>,
}

impl Population {
    /// Number of logical cells
    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    /// Cells owned by the given rank under the round-robin partition
    pub fn owned(&self, rank: usize, nhosts: usize) -> impl Iterator<Item = &ResolvedCell> {
        self.cells
            .iter()
            .filter(move |c| c.gid.owner(nhosts) == rank)
    }
}

/// Grid step used to scan a density function for its maximum
const DENSITY_GRID_STEP: f64 = 0.001;

/// Resolve one population rule into its logical cell list
///
/// Claims the next gid block from `alloc`. Must be called in rule order with
/// the same allocator state on every rank.
pub fn resolve_pop(
    rule: &PopRule,
    params: &NetParams,
    alloc: &mut GidAllocator,
    loc_seed: u64,
) -> Result<Population> {
    let placements = match &rule.policy {
        PopPolicy::Fixed { num_cells } => fixed_placements(rule, params, *num_cells, loc_seed),
        PopPolicy::Density {
            ynorm_range,
            density,
        } => density_placements(rule, params, *ynorm_range, density, loc_seed)?,
        PopPolicy::CellList { cells } => cells
            .iter()
            .map(|c| {
                let mut tags = c.tags.clone();
                tags.set_num(tag::X, c.x);
                tags.set_num(tag::Y, c.y);
                tags.set_num(tag::Z, c.z);
                tags.set_num(tag::YNORM, c.ynorm);
                tags
            })
            .collect(),
    };

    let gid_range = alloc.next_block(placements.len() as u64)?;
    let cells = gid_range
        .clone()
        .zip(placements)
        .map(|(raw, placement)| {
            let mut tags = rule.tags.clone();
            tags.set_text(tag::POP, rule.label.clone());
            tags.merge(&placement);
            ResolvedCell {
                gid: Gid::new(raw),
                tags,
            }
        })
        .collect::<Vec<_>>();

    log::info!(
        "Resolved population {}: {} cells, gids {}..{}",
        rule.label,
        cells.len(),
        gid_range.start,
        gid_range.end
    );

    Ok(Population {
        label: rule.label.clone(),
        rule: rule.clone(),
        gid_range,
        cells,
    })
}

/// Uniform placement of a fixed number of cells over the full volume
fn fixed_placements(rule: &PopRule, params: &NetParams, num_cells: u32, loc_seed: u64) -> Vec<Tags> {
    (0..num_cells as u64)
        .map(|i| {
            let mut rng = StdRng::seed_from_u64(derive_seed(loc_seed, &rule.label, i));
            let x = rng.gen::<f64>() * params.size[0];
            let y = rng.gen::<f64>() * params.size[1];
            let z = rng.gen::<f64>() * params.size[2];
            placement_tags(x, y, z, y / params.size[1])
        })
        .collect()
}

/// Rejection-sampled placement from a density function over normalized depth
///
/// The candidate count is the volume of the depth slab times the maximum
/// density over the range (scanned on a fixed grid); each candidate draws a
/// depth uniformly over the range and survives with probability
/// density/max. A zero or empty maximum yields zero cells silently.
fn density_placements(
    rule: &PopRule,
    params: &NetParams,
    ynorm_range: (f64, f64),
    density: &netweave_specs::DensityFn,
    loc_seed: u64,
) -> Result<Vec<Tags>> {
    let (lo, hi) = ynorm_range;
    let mut max_density = 0.0f64;
    let mut ynorm = lo;
    while ynorm < hi {
        let d = density
            .eval(ynorm)
            .map_err(|source| NetError::DensityFormula {
                pop: rule.label.clone(),
                source,
            })?;
        max_density = max_density.max(d);
        ynorm += DENSITY_GRID_STEP;
    }
    if max_density <= 0.0 {
        log::warn!(
            "Population {} has zero max density over [{}, {}]; no cells created",
            rule.label,
            lo,
            hi
        );
        return Ok(Vec::new());
    }

    // Slab volume in mm^3; density is cells per mm^3
    let volume =
        (params.size[0] / 1e3) * (params.size[2] / 1e3) * ((hi - lo) * params.size[1] / 1e3);
    let max_cells = (volume * max_density) as u64;

    let mut placements = Vec::new();
    for i in 0..max_cells {
        let mut rng = StdRng::seed_from_u64(derive_seed(loc_seed, &rule.label, i));
        let ynorm = lo + (hi - lo) * rng.gen::<f64>();
        let d = density
            .eval(ynorm)
            .map_err(|source| NetError::DensityFormula {
                pop: rule.label.clone(),
                source,
            })?;
        if d / max_density > rng.gen::<f64>() {
            let x = rng.gen::<f64>() * params.size[0];
            let z = rng.gen::<f64>() * params.size[2];
            let y = ynorm * params.size[1];
            placements.push(placement_tags(x, y, z, ynorm));
        }
    }
    Ok(placements)
}

fn placement_tags(x: f64, y: f64, z: f64, ynorm: f64) -> Tags {
    let mut tags = Tags::new();
    tags.set_num(tag::X, x);
    tags.set_num(tag::Y, y);
    tags.set_num(tag::Z, z);
    tags.set_num(tag::YNORM, ynorm);
    tags
}

#[cfg(test)]
mod tests {
    use super::*;
    use netweave_specs::{CellSpec, DensityFn};

    fn params() -> NetParams {
        NetParams::new()
    }

    #[test]
    fn test_fixed_pop_count_and_bounds() {
        let rule = PopRule::fixed("E", "lif", 50);
        let mut alloc = GidAllocator::new();
        let pop = resolve_pop(&rule, &params(), &mut alloc, 1).unwrap();
        assert_eq!(pop.num_cells(), 50);
        assert_eq!(pop.gid_range, 0..50);
        for cell in &pop.cells {
            let [x, y, z] = cell.tags.position();
            assert!((0.0..=1000.0).contains(&x));
            assert!((0.0..=1740.0).contains(&y));
            assert!((0.0..=1000.0).contains(&z));
            let ynorm = cell.tags.ynorm();
            assert!((ynorm - y / 1740.0).abs() < 1e-12);
            assert_eq!(cell.tags.text(tag::POP), Some("E"));
        }
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let rule = PopRule::density("L23", "lif", (0.1, 0.3), DensityFn::Const(20000.0));
        let a = resolve_pop(&rule, &params(), &mut GidAllocator::new(), 7).unwrap();
        let b = resolve_pop(&rule, &params(), &mut GidAllocator::new(), 7).unwrap();
        assert_eq!(a.num_cells(), b.num_cells());
        for (ca, cb) in a.cells.iter().zip(&b.cells) {
            assert_eq!(ca.gid, cb.gid);
            assert_eq!(ca.tags, cb.tags);
        }
    }

    #[test]
    fn test_density_pop_respects_depth_range() {
        let rule = PopRule::density("L5", "lif", (0.4, 0.6), DensityFn::Const(30000.0));
        let pop = resolve_pop(&rule, &params(), &mut GidAllocator::new(), 1).unwrap();
        assert!(pop.num_cells() > 0);
        for cell in &pop.cells {
            let ynorm = cell.tags.ynorm();
            assert!((0.4..0.6).contains(&ynorm));
        }
    }

    #[test]
    fn test_zero_density_yields_zero_cells() {
        let rule = PopRule::density("empty", "lif", (0.2, 0.4), DensityFn::Const(0.0));
        let mut alloc = GidAllocator::new();
        let pop = resolve_pop(&rule, &params(), &mut alloc, 1).unwrap();
        assert_eq!(pop.num_cells(), 0);
        assert_eq!(alloc.allocated(), 0);
    }

    #[test]
    fn test_cell_list_pop_is_verbatim() {
        let rule = PopRule::cell_list(
            "listed",
            "lif",
            vec![
                CellSpec {
                    x: 10.0,
                    y: 870.0,
                    z: 20.0,
                    ynorm: 0.5,
                    tags: Tags::new(),
                },
                CellSpec {
                    x: 30.0,
                    y: 174.0,
                    z: 40.0,
                    ynorm: 0.1,
                    tags: Tags::new(),
                },
            ],
        );
        let pop = resolve_pop(&rule, &params(), &mut GidAllocator::new(), 1).unwrap();
        assert_eq!(pop.num_cells(), 2);
        assert_eq!(pop.cells[0].tags.position(), [10.0, 870.0, 20.0]);
        assert_eq!(pop.cells[1].tags.ynorm(), 0.1);
    }

    #[test]
    fn test_owned_partition_covers_all_cells() {
        let rule = PopRule::fixed("E", "lif", 23);
        let pop = resolve_pop(&rule, &params(), &mut GidAllocator::new(), 1).unwrap();
        let nhosts = 4;
        let total: usize = (0..nhosts).map(|r| pop.owned(r, nhosts).count()).sum();
        assert_eq!(total, 23);
    }
}
