//! Curvature tracking.
//!
//! This module implements the composition rules that decide whether an
//! expression is convex, concave, linear, or unknown over the current variable
//! domains, and the inverse rules: which curvature each child must have for a
//! node to have a desired curvature.

use crate::dcp::sign::Sign;
use crate::expr::{ExprGraph, ExprId, Op};
use crate::interval::Interval;
use crate::problem::VarBounds;

/// Curvature of an expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Curvature {
    /// Unknown curvature. As a requirement: no requirement.
    #[default]
    Unknown,
    /// Linear function (both convex and concave).
    Linear,
    /// Convex function.
    Convex,
    /// Concave function.
    Concave,
}

impl Curvature {
    /// Check if the curvature is convex (linear or convex).
    pub fn is_convex(self) -> bool {
        matches!(self, Curvature::Linear | Curvature::Convex)
    }

    /// Check if the curvature is concave (linear or concave).
    pub fn is_concave(self) -> bool {
        matches!(self, Curvature::Linear | Curvature::Concave)
    }

    /// Negate the curvature (convex <-> concave).
    pub fn negate(self) -> Self {
        match self {
            Curvature::Convex => Curvature::Concave,
            Curvature::Concave => Curvature::Convex,
            other => other,
        }
    }

    /// Check if a function of this curvature meets a required curvature.
    pub fn satisfies(self, required: Curvature) -> bool {
        match required {
            Curvature::Unknown => true,
            Curvature::Linear => self == Curvature::Linear,
            Curvature::Convex => self.is_convex(),
            Curvature::Concave => self.is_concave(),
        }
    }
}

/// Monotonicity of a univariate function over a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Monotonicity {
    Increasing,
    Decreasing,
    Unknown,
}

/// Curvature of a sum of two terms.
pub fn add_curvature(a: Curvature, b: Curvature) -> Curvature {
    use Curvature::*;
    match (a, b) {
        (Linear, x) | (x, Linear) => x,
        (Convex, Convex) => Convex,
        (Concave, Concave) => Concave,
        _ => Unknown,
    }
}

/// Curvature of `scalar * f` for `f` of curvature `curv`.
pub fn scalar_mul_curvature(scalar: f64, curv: Curvature) -> Curvature {
    match scalar.partial_cmp(&0.0) {
        Some(std::cmp::Ordering::Greater) => curv,
        Some(std::cmp::Ordering::Less) => curv.negate(),
        _ => Curvature::Linear,
    }
}

/// Curvature of `f(g(x))` given the curvature and monotonicity of `f` and the
/// curvature of `g`.
pub fn compose(outer: Curvature, mono: Monotonicity, inner: Curvature) -> Curvature {
    use Curvature::*;
    if inner == Linear {
        return outer;
    }
    let inner_for_increasing = match mono {
        Monotonicity::Increasing => inner,
        Monotonicity::Decreasing => inner.negate(),
        Monotonicity::Unknown => return Unknown,
    };
    match (outer, inner_for_increasing) {
        (Linear, c) => c,
        (Convex, Convex) => Convex,
        (Concave, Concave) => Concave,
        _ => Unknown,
    }
}

/// Curvature the argument `g` must have so that `f(g(x))` has curvature
/// `desired`. `None` if no argument curvature achieves it.
pub fn compose_inverse(
    outer: Curvature,
    mono: Monotonicity,
    desired: Curvature,
) -> Option<Curvature> {
    use Curvature::*;
    let fits = match desired {
        Unknown => return Some(Unknown),
        Linear => outer == Linear,
        Convex => outer.is_convex(),
        Concave => outer.is_concave(),
    };
    if !fits {
        return None;
    }
    Some(match (mono, desired) {
        (_, Linear) | (Monotonicity::Unknown, _) => Linear,
        (Monotonicity::Increasing, d) => d,
        (Monotonicity::Decreasing, d) => d.negate(),
    })
}

/// Curvature and monotonicity of `x^p` for `x` in `arg`.
pub fn pow_shape(p: f64, arg: Interval) -> Option<(Curvature, Monotonicity)> {
    use Curvature::*;
    use Monotonicity::*;
    let sign = Sign::of_interval(arg);
    if p == 0.0 {
        return Some((Linear, Increasing));
    }
    if p == 1.0 {
        return Some((Linear, Increasing));
    }
    let integral = p.fract() == 0.0;
    if !integral {
        // only defined for x >= 0
        return Some(if p > 1.0 {
            (Convex, Increasing)
        } else if p > 0.0 {
            (Concave, Increasing)
        } else {
            (Convex, Decreasing)
        });
    }
    let even = (p as i64) % 2 == 0;
    let shape = match (p > 0.0, even, sign) {
        (true, true, Sign::Nonnegative | Sign::Zero) => (Convex, Increasing),
        (true, true, Sign::Nonpositive) => (Convex, Decreasing),
        (true, true, Sign::Unknown) => (Convex, Monotonicity::Unknown),
        (true, false, Sign::Nonnegative | Sign::Zero) => (Convex, Increasing),
        (true, false, Sign::Nonpositive) => (Concave, Increasing),
        (true, false, Sign::Unknown) => (Curvature::Unknown, Increasing),
        (false, _, Sign::Nonnegative) => (Convex, Decreasing),
        (false, true, Sign::Nonpositive) => (Convex, Increasing),
        (false, false, Sign::Nonpositive) => (Concave, Decreasing),
        (false, _, _) => return None,
    };
    Some(shape)
}

/// Inverse rule for monomials `Π x_i^{p_i}` with at least two factors.
///
/// Given the desired curvature of the monomial (coefficient sign already
/// applied), returns the curvature each factor must have. Every factor must be
/// sign-definite over its bounds; nonpositive factors need integral exponents
/// and are handled through `x_i = -y_i`.
pub fn monomial_inverse(
    desired: Curvature,
    exponents: &[f64],
    bounds: &[Interval],
) -> Option<Vec<Curvature>> {
    use Curvature::*;
    let n = exponents.len();
    debug_assert_eq!(n, bounds.len());
    if n == 1 {
        let (outer, mono) = pow_shape(exponents[0], bounds[0])?;
        return compose_inverse(outer, mono, desired).map(|c| vec![c]);
    }
    match desired {
        Unknown => return Some(vec![Unknown; n]),
        // a monomial of at least two factors is not linear
        Linear => return None,
        _ => {}
    }

    let mut desired = desired;
    let mut negated = vec![false; n];
    for i in 0..n {
        match Sign::of_interval(bounds[i]) {
            Sign::Nonnegative | Sign::Zero => {}
            Sign::Nonpositive => {
                if exponents[i].fract() != 0.0 {
                    return None;
                }
                negated[i] = true;
                if (exponents[i] as i64) % 2 != 0 {
                    desired = desired.negate();
                }
            }
            Sign::Unknown => return None,
        }
    }

    let mut npos = 0;
    let mut nneg = 0;
    let mut sum = 0.0;
    for &p in exponents {
        if p > 0.0 {
            npos += 1;
        } else if p < 0.0 {
            nneg += 1;
        }
        sum += p;
    }

    let mut required: Vec<Curvature> = match desired {
        Convex if npos == 0 => vec![Concave; n],
        Convex if npos == 1 && sum >= 1.0 => exponents
            .iter()
            .map(|&p| if p > 0.0 { Convex } else { Concave })
            .collect(),
        Concave if nneg == 0 && sum <= 1.0 => vec![Concave; n],
        _ => return None,
    };
    for i in 0..n {
        if exponents[i] == 0.0 {
            required[i] = Unknown;
        } else if negated[i] {
            required[i] = required[i].negate();
        }
    }
    Some(required)
}

impl Op {
    /// Curvature and monotonicity of a univariate operator over `arg`.
    pub fn univariate_shape(&self, arg: Interval) -> Option<(Curvature, Monotonicity)> {
        use Curvature::*;
        use Monotonicity::*;
        match self {
            Op::Pow { exponent } => pow_shape(*exponent, arg),
            Op::Exp => Some((Convex, Increasing)),
            Op::Log => Some((Concave, Increasing)),
            Op::Abs => Some(match Sign::of_interval(arg) {
                Sign::Nonnegative | Sign::Zero => (Linear, Increasing),
                Sign::Nonpositive => (Linear, Decreasing),
                Sign::Unknown => (Convex, Monotonicity::Unknown),
            }),
            Op::Entropy => {
                let peak = (-1.0f64).exp();
                let mono = if arg.hi <= peak {
                    Increasing
                } else if arg.lo >= peak {
                    Decreasing
                } else {
                    Monotonicity::Unknown
                };
                Some((Concave, mono))
            }
            _ => None,
        }
    }
}

/// Factors of a product seen as a monomial: `(base, exponent)` per child, where
/// children `pow(b, p)` contribute `(b, p)` and others `(child, 1)`.
pub(crate) fn monomial_factors(graph: &ExprGraph, product: ExprId) -> Vec<(ExprId, f64)> {
    graph
        .children(product)
        .iter()
        .map(|&c| match graph.op(c) {
            Op::Pow { exponent } => (graph.children(c)[0], *exponent),
            _ => (c, 1.0),
        })
        .collect()
}

impl ExprGraph {
    /// Curvature of an expression over the domains given by `bounds`.
    ///
    /// Computes activities first, then propagates curvature bottom-up and stores
    /// it on every node.
    pub fn curvature(&mut self, root: ExprId, bounds: &impl VarBounds) -> Curvature {
        self.evaluate_interval(root, bounds, 0, 0.0);
        let order = self.post_order(root);
        for id in order {
            let curv = self.forward_curvature(id);
            self.set_curvature(id, curv);
        }
        self.node(root).curvature()
    }

    /// Curvature of a node from the curvatures and activities stored on its children.
    fn forward_curvature(&self, id: ExprId) -> Curvature {
        let node = self.node(id);
        let child_curv = |c: &ExprId| self.node(*c).curvature();
        match node.op() {
            Op::Var(_) | Op::Value(_) => Curvature::Linear,
            Op::Sum { coefs, .. } => coefs
                .iter()
                .zip(node.children())
                .fold(Curvature::Linear, |acc, (coef, c)| {
                    add_curvature(acc, scalar_mul_curvature(*coef, child_curv(c)))
                }),
            Op::Product { coef } => {
                let nonconst: Vec<ExprId> = node
                    .children()
                    .iter()
                    .copied()
                    .filter(|c| self.as_value(*c).is_none())
                    .collect();
                let factor: f64 = node
                    .children()
                    .iter()
                    .filter_map(|c| self.as_value(*c))
                    .fold(*coef, |acc, v| acc * v);
                match nonconst.len() {
                    0 => Curvature::Linear,
                    1 => scalar_mul_curvature(factor, child_curv(&nonconst[0])),
                    _ => self.monomial_curvature(id, *coef),
                }
            }
            op => {
                let child = node.children()[0];
                match op.univariate_shape(self.activity(child)) {
                    Some((outer, mono)) => compose(outer, mono, child_curv(&child)),
                    None => Curvature::Unknown,
                }
            }
        }
    }

    /// Curvature of a product through the signomial rule, if it gives one.
    fn monomial_curvature(&self, product: ExprId, coef: f64) -> Curvature {
        let factors = monomial_factors(self, product);
        let exponents: Vec<f64> = factors.iter().map(|(_, p)| *p).collect();
        let bounds: Vec<Interval> = factors.iter().map(|(b, _)| self.activity(*b)).collect();
        for target in [Curvature::Convex, Curvature::Concave] {
            let Some(required) =
                monomial_inverse(scalar_mul_curvature(coef, target), &exponents, &bounds)
            else {
                continue;
            };
            let ok = factors
                .iter()
                .zip(&required)
                .all(|((b, _), req)| self.node(*b).curvature().satisfies(*req));
            if ok {
                return target;
            }
        }
        Curvature::Unknown
    }

    /// Curvature each child of `expr` must have so that `expr` has curvature
    /// `desired`, based on the activities stored on the children.
    ///
    /// `None` if the operator cannot achieve `desired` this way (products of
    /// several factors are left to the signomial rule).
    pub fn required_child_curvature(
        &self,
        expr: ExprId,
        desired: Curvature,
    ) -> Option<Vec<Curvature>> {
        let node = self.node(expr);
        match node.op() {
            Op::Var(_) | Op::Value(_) => Some(Vec::new()),
            Op::Sum { coefs, .. } => Some(
                coefs
                    .iter()
                    .map(|&c| {
                        if c == 0.0 {
                            Curvature::Unknown
                        } else {
                            scalar_mul_curvature(c, desired)
                        }
                    })
                    .collect(),
            ),
            Op::Product { coef } => {
                let nonconst: Vec<usize> = node
                    .children()
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| self.as_value(**c).is_none())
                    .map(|(i, _)| i)
                    .collect();
                if nonconst.len() != 1 {
                    return None;
                }
                let factor: f64 = node
                    .children()
                    .iter()
                    .filter_map(|c| self.as_value(*c))
                    .fold(*coef, |acc, v| acc * v);
                let mut required = vec![Curvature::Unknown; node.children().len()];
                if factor != 0.0 {
                    required[nonconst[0]] = scalar_mul_curvature(factor, desired);
                }
                Some(required)
            }
            op => {
                let child = node.children()[0];
                let (outer, mono) = op.univariate_shape(self.activity(child))?;
                compose_inverse(outer, mono, desired).map(|c| vec![c])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problem::{Problem, VarKind};

    #[test]
    fn test_curvature_basics() {
        assert!(Curvature::Linear.is_convex());
        assert!(Curvature::Linear.is_concave());
        assert!(Curvature::Convex.is_convex());
        assert!(!Curvature::Convex.is_concave());
        assert!(!Curvature::Unknown.is_convex());
    }

    #[test]
    fn test_negate_curvature() {
        assert_eq!(Curvature::Convex.negate(), Curvature::Concave);
        assert_eq!(Curvature::Concave.negate(), Curvature::Convex);
        assert_eq!(Curvature::Linear.negate(), Curvature::Linear);
    }

    #[test]
    fn test_add_curvature() {
        use Curvature::*;
        assert_eq!(add_curvature(Linear, Convex), Convex);
        assert_eq!(add_curvature(Convex, Convex), Convex);
        assert_eq!(add_curvature(Convex, Concave), Unknown);
    }

    #[test]
    fn test_satisfies() {
        use Curvature::*;
        assert!(Linear.satisfies(Convex));
        assert!(Convex.satisfies(Unknown));
        assert!(!Convex.satisfies(Linear));
        assert!(!Concave.satisfies(Convex));
    }

    #[test]
    fn test_compose_inverse() {
        use Curvature::*;
        // exp(g) convex needs g convex
        assert_eq!(compose_inverse(Convex, Monotonicity::Increasing, Convex), Some(Convex));
        // exp(g) cannot be concave
        assert_eq!(compose_inverse(Convex, Monotonicity::Increasing, Concave), None);
        // x^2 over a domain containing 0 needs a linear argument
        assert_eq!(compose_inverse(Convex, Monotonicity::Unknown, Convex), Some(Linear));
        // 1/x on x > 0 convex needs concave argument
        assert_eq!(compose_inverse(Convex, Monotonicity::Decreasing, Convex), Some(Concave));
    }

    #[test]
    fn test_monomial_inverse() {
        use Curvature::*;
        let pos = Interval::new(0.0, 10.0);
        // sqrt(x)*sqrt(y) is concave for concave x, y >= 0
        assert_eq!(
            monomial_inverse(Concave, &[0.5, 0.5], &[pos, pos]),
            Some(vec![Concave, Concave])
        );
        // x^2 / y is convex
        assert_eq!(
            monomial_inverse(Convex, &[2.0, -1.0], &[pos, Interval::new(1.0, 2.0)]),
            Some(vec![Convex, Concave])
        );
        // x*y is neither
        assert_eq!(monomial_inverse(Convex, &[1.0, 1.0], &[pos, pos]), None);
        assert_eq!(monomial_inverse(Concave, &[1.0, 1.0], &[pos, pos]), None);
        // sign-indefinite factor
        assert_eq!(
            monomial_inverse(Concave, &[0.5, 0.5], &[pos, Interval::new(-1.0, 1.0)]),
            None
        );
    }

    #[test]
    fn test_monomial_inverse_nonpositive_factor() {
        use Curvature::*;
        // x^2 * y^-1 with x <= 0: (-x)^2 / y, so x must be concave
        let neg = Interval::new(-10.0, 0.0);
        let pos = Interval::new(1.0, 2.0);
        assert_eq!(
            monomial_inverse(Convex, &[2.0, -1.0], &[neg, pos]),
            Some(vec![Concave, Concave])
        );
        // fractional exponent on a nonpositive factor is rejected
        assert_eq!(monomial_inverse(Concave, &[0.5, 0.5], &[neg, pos]), None);
    }

    #[test]
    fn test_expression_curvature() {
        let mut p = Problem::new();
        let xv = p.add_var("x", -1.0, 1.0, VarKind::Continuous);
        let yv = p.add_var("y", 1.0, 2.0, VarKind::Continuous);
        let mut g = ExprGraph::new();
        let x = g.var(xv);
        let y = g.var(yv);

        let sq = g.square(x).unwrap();
        let e = g.exp(x).unwrap();
        let convex = g.sum(&[1.0, 2.0], &[sq, e], 0.0).unwrap();
        assert_eq!(g.curvature(convex, &p), Curvature::Convex);

        let neg = g.sum(&[-1.0], &[convex], 0.0).unwrap();
        assert_eq!(g.curvature(neg, &p), Curvature::Concave);

        let l = g.log(y).unwrap();
        let mixed = g.sum(&[1.0, 1.0], &[sq, l], 0.0).unwrap();
        assert_eq!(g.curvature(mixed, &p), Curvature::Unknown);

        // x^3 on [-1, 1] is neither
        let cube = g.pow(x, 3.0).unwrap();
        assert_eq!(g.curvature(cube, &p), Curvature::Unknown);

        // z^2 / y with z >= 0, y > 0 is convex through the signomial rule
        let zv = p.add_var("z", 0.0, 3.0, VarKind::Continuous);
        let z = g.var(zv);
        let zsq = g.square(z).unwrap();
        let inv = g.pow(y, -1.0).unwrap();
        let q = g.product(1.0, &[zsq, inv]).unwrap();
        assert_eq!(g.curvature(q, &p), Curvature::Convex);

        // with a sign-indefinite base the rule does not apply
        let q2 = g.product(1.0, &[sq, inv]).unwrap();
        assert_eq!(g.curvature(q2, &p), Curvature::Unknown);
    }

    #[test]
    fn test_required_child_curvature() {
        let mut p = Problem::new();
        let xv = p.add_var("x", 1.0, 2.0, VarKind::Continuous);
        let mut g = ExprGraph::new();
        let x = g.var(xv);
        let l = g.log(x).unwrap();
        let s = g.sum(&[-1.0, 3.0], &[l, x], 0.0).unwrap();
        g.evaluate_interval(s, &p, 0, 0.0);

        assert_eq!(
            g.required_child_curvature(s, Curvature::Convex),
            Some(vec![Curvature::Concave, Curvature::Convex])
        );
        assert_eq!(
            g.required_child_curvature(l, Curvature::Concave),
            Some(vec![Curvature::Concave])
        );
        assert_eq!(g.required_child_curvature(l, Curvature::Convex), None);
    }
}
