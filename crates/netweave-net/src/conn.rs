//! Connectivity resolution
//!
//! Each rule is resolved against the global tag map, producing the incoming
//! connections for locally-owned cells. Acceptance and per-edge values are
//! drawn from generators seeded per target cell (per source cell for
//! divergence rules), so the resolved connection set is a pure function of
//! the rule, the tags and the connectivity seed: repeating a run, or
//! changing the rank count, yields the identical global set.
//!
//! Electrical (gap-junction) rules materialize both directions of each
//! accepted pair. The rank owning the postsynaptic cell emits the forward
//! edge and the rank owning the presynaptic cell recomputes the same
//! acceptance from the same seed and emits the mirrored edge, so no extra
//! exchange is needed.

use crate::cell::Conn;
use crate::error::{NetError, Result};
use crate::geometry::{dist_2d, dist_3d};
use crate::ids::{derive_seed, Gid};
use netweave_specs::{ConnRule, EvalScope, FormulaError, NetParams, Tags, Topology};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Resolve one connection rule into the locally-owned connections
///
/// `global` is the gathered (gid, tags) list, sorted by gid and identical on
/// every rank. A formula error abandons the whole rule.
pub fn resolve_rule(
    rule: &ConnRule,
    global: &[(Gid, Tags)],
    rank: usize,
    nhosts: usize,
    params: &NetParams,
    conn_seed: u64,
) -> Result<Vec<Conn>> {
    let pres: Vec<&(Gid, Tags)> = global.iter().filter(|(_, t)| rule.pre.matches(t)).collect();
    let posts: Vec<&(Gid, Tags)> = global
        .iter()
        .filter(|(_, t)| rule.post.matches(t))
        .collect();

    let mut conns = match rule.topology {
        Topology::Divergence(k) => {
            resolve_divergent(rule, &pres, &posts, rank, nhosts, params, conn_seed, k)
        }
        _ => resolve_per_post(rule, &pres, &posts, rank, nhosts, params, conn_seed),
    }
    .map_err(|source| NetError::ConnFormula {
        rule: rule.label.clone(),
        source,
    })?;

    // Stable output order regardless of candidate iteration details
    conns.sort_by_key(|c| (c.post, c.pre));
    log::debug!(
        "Rule {}: {} connections on rank {}",
        rule.label,
        conns.len(),
        rank
    );
    Ok(conns)
}

/// Full, probability and convergence modes: one seeded pass per target cell
#[allow(clippy::too_many_arguments)]
fn resolve_per_post(
    rule: &ConnRule,
    pres: &[&(Gid, Tags)],
    posts: &[&(Gid, Tags)],
    rank: usize,
    nhosts: usize,
    params: &NetParams,
    conn_seed: u64,
) -> std::result::Result<Vec<Conn>, FormulaError> {
    let mut conns = Vec::new();
    for &(post_gid, post_tags) in posts {
        let post_owned = post_gid.owner(nhosts) == rank;
        // Chemical rules only produce edges on the post owner; electrical
        // rules must be evaluated everywhere a mirrored edge could land.
        if !post_owned && !rule.electrical {
            continue;
        }
        let mut rng = StdRng::seed_from_u64(derive_seed(conn_seed, &rule.label, post_gid.raw()));
        match rule.topology {
            Topology::Full => {
                for &(pre_gid, pre_tags) in pres {
                    if *pre_gid == *post_gid {
                        continue;
                    }
                    emit(
                        rule, *pre_gid, pre_tags, *post_gid, post_tags, post_owned, rank, nhosts,
                        params, &mut rng, &mut conns,
                    )?;
                }
            }
            Topology::Probability(ref prob) => {
                for &(pre_gid, pre_tags) in pres {
                    if *pre_gid == *post_gid {
                        continue;
                    }
                    let scope = pair_scope(rule, pre_tags, post_tags, params);
                    let p = prob.eval(&scope, &mut rng)?;
                    if rng.gen::<f64>() < p {
                        emit(
                            rule, *pre_gid, pre_tags, *post_gid, post_tags, post_owned, rank,
                            nhosts, params, &mut rng, &mut conns,
                        )?;
                    }
                }
            }
            Topology::Convergence(k) => {
                let candidates: Vec<usize> = (0..pres.len())
                    .filter(|&i| pres[i].0 != *post_gid)
                    .collect();
                let take = (k as usize).min(candidates.len());
                let picks = rand::seq::index::sample(&mut rng, candidates.len(), take);
                // Sort so per-edge draws happen in gid order
                let mut picked: Vec<usize> = picks.iter().map(|i| candidates[i]).collect();
                picked.sort_unstable();
                for i in picked {
                    let (pre_gid, pre_tags) = pres[i];
                    emit(
                        rule, *pre_gid, pre_tags, *post_gid, post_tags, post_owned, rank, nhosts,
                        params, &mut rng, &mut conns,
                    )?;
                }
            }
            Topology::Divergence(_) => unreachable!("handled by resolve_divergent"),
        }
    }
    Ok(conns)
}

/// Divergence mode: one seeded pass per source cell over the global target
/// list, so every rank computes identical selections
#[allow(clippy::too_many_arguments)]
fn resolve_divergent(
    rule: &ConnRule,
    pres: &[&(Gid, Tags)],
    posts: &[&(Gid, Tags)],
    rank: usize,
    nhosts: usize,
    params: &NetParams,
    conn_seed: u64,
    k: u32,
) -> std::result::Result<Vec<Conn>, FormulaError> {
    let mut conns = Vec::new();
    for &(pre_gid, pre_tags) in pres {
        let mut rng = StdRng::seed_from_u64(derive_seed(conn_seed, &rule.label, pre_gid.raw()));
        let candidates: Vec<usize> = (0..posts.len())
            .filter(|&i| posts[i].0 != *pre_gid)
            .collect();
        let take = (k as usize).min(candidates.len());
        let picks = rand::seq::index::sample(&mut rng, candidates.len(), take);
        let mut picked: Vec<usize> = picks.iter().map(|i| candidates[i]).collect();
        picked.sort_unstable();
        for i in picked {
            let (post_gid, post_tags) = posts[i];
            let post_owned = post_gid.owner(nhosts) == rank;
            emit(
                rule, *pre_gid, pre_tags, *post_gid, post_tags, post_owned, rank, nhosts, params,
                &mut rng, &mut conns,
            )?;
        }
    }
    Ok(conns)
}

/// Evaluate per-edge values for an accepted pair and append the edge(s)
/// this rank owns
#[allow(clippy::too_many_arguments)]
fn emit(
    rule: &ConnRule,
    pre_gid: Gid,
    pre_tags: &Tags,
    post_gid: Gid,
    post_tags: &Tags,
    post_owned: bool,
    rank: usize,
    nhosts: usize,
    params: &NetParams,
    rng: &mut StdRng,
    conns: &mut Vec<Conn>,
) -> std::result::Result<(), FormulaError> {
    let scope = pair_scope(rule, pre_tags, post_tags, params);
    let weight = rule.weight.eval(&scope, rng)? * params.scale_conn_weight;
    let delay = rule.delay.eval(&scope, rng)?.max(params.min_delay);

    if post_owned {
        conns.push(Conn {
            pre: pre_gid,
            post: post_gid,
            weight,
            delay,
            syn_mech: rule.syn_mech.clone(),
            sec: rule.sec.clone(),
            loc: rule.loc,
            electrical: rule.electrical,
        });
    }
    if rule.electrical && pre_gid.owner(nhosts) == rank {
        // Mirrored gap-junction edge on the peer's owner, same values
        conns.push(Conn {
            pre: post_gid,
            post: pre_gid,
            weight,
            delay,
            syn_mech: rule.syn_mech.clone(),
            sec: rule.sec.clone(),
            loc: rule.loc,
            electrical: true,
        });
    }
    Ok(())
}

fn pair_scope<'a>(
    rule: &ConnRule,
    pre_tags: &'a Tags,
    post_tags: &'a Tags,
    params: &NetParams,
) -> EvalScope<'a> {
    let p = pre_tags.position();
    let q = post_tags.position();
    let mut scope = EvalScope::pair(pre_tags, post_tags, params.prop_velocity, params.length_const);
    scope.dist3d = dist_3d(p, q, params.size, rule.toroidal);
    scope.dist2d = dist_2d(p, q, params.size, rule.toroidal);
    scope.delta_ynorm = (pre_tags.ynorm() - post_tags.ynorm()).abs();
    scope
}
