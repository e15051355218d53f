//! Closed value-expression AST for probability, weight and delay formulas
//!
//! A `ValueSpec` is a constant, a distribution draw, or an `Expr` over a
//! fixed set of geometric variables and per-cell numeric tags. Keeping the
//! expression language a closed AST (rather than evaluated strings) makes
//! rules serializable and failures typed. Referencing an undefined tag is a
//! `FormulaError`, surfaced by the connectivity resolver as a per-rule
//! failure rather than a panic or silent skip.

use crate::tags::Tags;
use crate::SpecError;
use rand::Rng;
use rand_distr::Normal;
use serde::{Deserialize, Serialize};

/// Error raised when a formula references a variable that cannot be resolved
/// in the current evaluation scope
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("formula references undefined variable: {var}")]
pub struct FormulaError {
    /// The unresolved variable name
    pub var: String,
}

impl FormulaError {
    /// Create a formula error for the given variable
    pub fn undefined(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

/// Variables available to formulas
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Var {
    /// Euclidean 3-D distance between pre and post cell (um)
    Dist3D,
    /// Horizontal-plane (x, z) distance between pre and post cell (um)
    Dist2D,
    /// Absolute normalized-depth difference between pre and post cell
    DeltaYnorm,
    /// Presynaptic normalized depth
    PreYnorm,
    /// Postsynaptic normalized depth
    PostYnorm,
    /// Propagation velocity (um/ms) from the network globals
    Velocity,
    /// Probability length constant (um) from the network globals
    LengthConst,
    /// Normalized depth of the cell being placed (density formulas only)
    Ynorm,
    /// Numeric tag of the presynaptic cell
    PreTag(String),
    /// Numeric tag of the postsynaptic cell
    PostTag(String),
}

/// A closed arithmetic expression over formula variables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Numeric literal
    Num(f64),
    /// Variable reference
    Var(Var),
    /// Negation
    Neg(Box<Expr>),
    /// Natural exponential
    Exp(Box<Expr>),
    /// Sum
    Add(Box<Expr>, Box<Expr>),
    /// Difference
    Sub(Box<Expr>, Box<Expr>),
    /// Product
    Mul(Box<Expr>, Box<Expr>),
    /// Quotient
    Div(Box<Expr>, Box<Expr>),
}

/// Evaluation scope: the fixed-shape context a formula may read
///
/// Distances are filled in by the connectivity resolver per candidate pair;
/// `pre`/`post` are absent in contexts without a pair (e.g. stimulation
/// weights have a post cell only, density formulas have neither).
#[derive(Debug, Clone, Copy, Default)]
pub struct EvalScope<'a> {
    /// 3-D pair distance (um)
    pub dist3d: f64,
    /// Horizontal-plane pair distance (um)
    pub dist2d: f64,
    /// Absolute normalized-depth difference
    pub delta_ynorm: f64,
    /// Presynaptic tags, when a pair is in scope
    pub pre: Option<&'a Tags>,
    /// Postsynaptic tags, when a target cell is in scope
    pub post: Option<&'a Tags>,
    /// Propagation velocity (um/ms)
    pub velocity: f64,
    /// Probability length constant (um)
    pub length_const: f64,
    /// Normalized depth for density evaluation
    pub ynorm: f64,
}

impl<'a> EvalScope<'a> {
    /// Scope for a pre/post candidate pair
    pub fn pair(pre: &'a Tags, post: &'a Tags, velocity: f64, length_const: f64) -> Self {
        Self {
            pre: Some(pre),
            post: Some(post),
            velocity,
            length_const,
            ..Default::default()
        }
    }

    /// Scope with only a target (post) cell, used by stimulation rules
    pub fn target(post: &'a Tags) -> Self {
        Self {
            post: Some(post),
            ..Default::default()
        }
    }

    /// Scope for density evaluation at a normalized depth
    pub fn depth(ynorm: f64) -> Self {
        Self {
            ynorm,
            ..Default::default()
        }
    }

    fn resolve(&self, var: &Var) -> Result<f64, FormulaError> {
        match var {
            Var::Dist3D => Ok(self.dist3d),
            Var::Dist2D => Ok(self.dist2d),
            Var::DeltaYnorm => Ok(self.delta_ynorm),
            Var::PreYnorm => self
                .pre
                .map(|t| t.ynorm())
                .ok_or_else(|| FormulaError::undefined("pre_ynorm")),
            Var::PostYnorm => self
                .post
                .map(|t| t.ynorm())
                .ok_or_else(|| FormulaError::undefined("post_ynorm")),
            Var::Velocity => Ok(self.velocity),
            Var::LengthConst => Ok(self.length_const),
            Var::Ynorm => Ok(self.ynorm),
            Var::PreTag(name) => self
                .pre
                .and_then(|t| t.num(name))
                .ok_or_else(|| FormulaError::undefined(format!("pre.{}", name))),
            Var::PostTag(name) => self
                .post
                .and_then(|t| t.num(name))
                .ok_or_else(|| FormulaError::undefined(format!("post.{}", name))),
        }
    }
}

impl Expr {
    /// Evaluate against a scope; fails if any referenced variable is undefined
    pub fn eval(&self, scope: &EvalScope<'_>) -> Result<f64, FormulaError> {
        match self {
            Expr::Num(v) => Ok(*v),
            Expr::Var(var) => scope.resolve(var),
            Expr::Neg(e) => Ok(-e.eval(scope)?),
            Expr::Exp(e) => Ok(e.eval(scope)?.exp()),
            Expr::Add(a, b) => Ok(a.eval(scope)? + b.eval(scope)?),
            Expr::Sub(a, b) => Ok(a.eval(scope)? - b.eval(scope)?),
            Expr::Mul(a, b) => Ok(a.eval(scope)? * b.eval(scope)?),
            Expr::Div(a, b) => Ok(a.eval(scope)? / b.eval(scope)?),
        }
    }
}

/// Expression construction helpers
pub mod expr {
    use super::{Expr, Var};

    /// Numeric literal
    pub fn num(v: f64) -> Expr {
        Expr::Num(v)
    }

    /// Variable reference
    pub fn var(v: Var) -> Expr {
        Expr::Var(v)
    }

    /// Numeric tag of the presynaptic cell
    pub fn pre_tag(name: &str) -> Expr {
        Expr::Var(Var::PreTag(name.to_string()))
    }

    /// Numeric tag of the postsynaptic cell
    pub fn post_tag(name: &str) -> Expr {
        Expr::Var(Var::PostTag(name.to_string()))
    }

    /// Sum
    pub fn add(a: Expr, b: Expr) -> Expr {
        Expr::Add(Box::new(a), Box::new(b))
    }

    /// Difference
    pub fn sub(a: Expr, b: Expr) -> Expr {
        Expr::Sub(Box::new(a), Box::new(b))
    }

    /// Product
    pub fn mul(a: Expr, b: Expr) -> Expr {
        Expr::Mul(Box::new(a), Box::new(b))
    }

    /// Quotient
    pub fn div(a: Expr, b: Expr) -> Expr {
        Expr::Div(Box::new(a), Box::new(b))
    }

    /// Natural exponential
    pub fn exp(e: Expr) -> Expr {
        Expr::Exp(Box::new(e))
    }

    /// Negation
    pub fn neg(e: Expr) -> Expr {
        Expr::Neg(Box::new(e))
    }
}

/// A value specification: how a scalar (probability, weight, delay) is
/// produced for each accepted entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValueSpec {
    /// Fixed constant
    Const(f64),
    /// Uniform draw in [low, high)
    Uniform {
        /// Lower bound (inclusive)
        low: f64,
        /// Upper bound (exclusive)
        high: f64,
    },
    /// Gaussian draw
    Normal {
        /// Mean
        mean: f64,
        /// Standard deviation
        std: f64,
    },
    /// Formula over the evaluation scope
    Formula(Expr),
}

impl ValueSpec {
    /// `pmax * exp(-dist_3D / length_const)`: the standard exponential
    /// distance falloff used by distance-dependent probability rules
    pub fn prob_falloff(pmax: f64) -> Self {
        ValueSpec::Formula(expr::mul(
            expr::num(pmax),
            expr::exp(expr::neg(expr::div(
                expr::var(Var::Dist3D),
                expr::var(Var::LengthConst),
            ))),
        ))
    }

    /// `min_delay + dist_3D / velocity`: conduction delay from pair distance
    pub fn delay_from_distance(min_delay: f64) -> Self {
        ValueSpec::Formula(expr::add(
            expr::num(min_delay),
            expr::div(expr::var(Var::Dist3D), expr::var(Var::Velocity)),
        ))
    }

    /// Check distribution parameters; run when a rule carrying this spec is
    /// added to the description
    pub fn validate(&self, parameter: &str) -> crate::Result<()> {
        match self {
            ValueSpec::Normal { std, .. } if *std < 0.0 || std.is_nan() => {
                Err(SpecError::invalid_parameter(
                    parameter,
                    std.to_string(),
                    "std >= 0",
                ))
            }
            ValueSpec::Uniform { low, high } if high < low => {
                Err(SpecError::invalid_parameter(
                    parameter,
                    format!("[{}, {})", low, high),
                    "low <= high",
                ))
            }
            _ => Ok(()),
        }
    }

    /// Evaluate; distribution variants consume draws from `rng`
    pub fn eval<R: Rng + ?Sized>(
        &self,
        scope: &EvalScope<'_>,
        rng: &mut R,
    ) -> Result<f64, FormulaError> {
        match self {
            ValueSpec::Const(v) => Ok(*v),
            ValueSpec::Uniform { low, high } => {
                let u: f64 = rng.gen();
                Ok(low + (high - low) * u)
            }
            ValueSpec::Normal { mean, std } => {
                // Negative std is caught by validate(); this is the backstop
                let dist = Normal::new(*mean, *std)
                    .map_err(|_| FormulaError::undefined("normal.std"))?;
                Ok(rng.sample(dist))
            }
            ValueSpec::Formula(e) => e.eval(scope),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::{tag, Tags};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_const_and_arith() {
        let mut rng = StdRng::seed_from_u64(0);
        let scope = EvalScope::default();
        assert_eq!(
            ValueSpec::Const(3.5).eval(&scope, &mut rng).unwrap(),
            3.5
        );
        let e = expr::add(expr::num(2.0), expr::mul(expr::num(3.0), expr::num(4.0)));
        assert_eq!(e.eval(&scope).unwrap(), 14.0);
    }

    #[test]
    fn test_falloff_decreases_with_distance() {
        let mut rng = StdRng::seed_from_u64(0);
        let spec = ValueSpec::prob_falloff(0.8);
        let mut near = EvalScope {
            length_const: 100.0,
            ..Default::default()
        };
        near.dist3d = 10.0;
        let mut far = near;
        far.dist3d = 500.0;
        let p_near = spec.eval(&near, &mut rng).unwrap();
        let p_far = spec.eval(&far, &mut rng).unwrap();
        assert!(p_near > p_far);
        assert!(p_near <= 0.8);
    }

    #[test]
    fn test_undefined_tag_is_formula_error() {
        let mut rng = StdRng::seed_from_u64(0);
        let tags = Tags::new().with_num(tag::YNORM, 0.4);
        let scope = EvalScope::target(&tags);
        let spec = ValueSpec::Formula(expr::post_tag("no_such_tag"));
        let err = spec.eval(&scope, &mut rng).unwrap_err();
        assert_eq!(err.var, "post.no_such_tag");
    }

    #[test]
    fn test_uniform_draw_reproducible() {
        let spec = ValueSpec::Uniform { low: 1.0, high: 5.0 };
        let scope = EvalScope::default();
        let a = spec
            .eval(&scope, &mut StdRng::seed_from_u64(42))
            .unwrap();
        let b = spec
            .eval(&scope, &mut StdRng::seed_from_u64(42))
            .unwrap();
        assert_eq!(a, b);
        assert!((1.0..5.0).contains(&a));
    }

    #[test]
    fn test_normal_draw_reproducible() {
        let spec = ValueSpec::Normal {
            mean: 10.0,
            std: 2.0,
        };
        let scope = EvalScope::default();
        let a = spec
            .eval(&scope, &mut StdRng::seed_from_u64(7))
            .unwrap();
        let b = spec
            .eval(&scope, &mut StdRng::seed_from_u64(7))
            .unwrap();
        assert_eq!(a, b);
        assert!(a.is_finite());
    }

    #[test]
    fn test_distribution_parameter_validation() {
        assert!(ValueSpec::Normal { mean: 0.0, std: 2.0 }
            .validate("w")
            .is_ok());
        assert!(ValueSpec::Normal { mean: 0.0, std: -1.0 }
            .validate("w")
            .is_err());
        assert!(ValueSpec::Uniform { low: 5.0, high: 1.0 }
            .validate("w")
            .is_err());
    }

    #[test]
    fn test_delay_from_distance() {
        let mut rng = StdRng::seed_from_u64(0);
        let spec = ValueSpec::delay_from_distance(2.0);
        let scope = EvalScope {
            dist3d: 300.0,
            velocity: 100.0,
            ..Default::default()
        };
        assert_eq!(spec.eval(&scope, &mut rng).unwrap(), 5.0);
    }
}
