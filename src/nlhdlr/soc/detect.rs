//! Recognizing second-order cones.
//!
//! Three matchers are tried in order:
//!
//! 1. norm: `sqrt(Σ c_i·(affine_i)² + Σ d_j·binary_j + γ)` with positive
//!    coefficients, possibly scaled inside a sum with linear terms;
//! 2. simple quadratic: positive squares and binaries with exactly one negative
//!    square, a negative constant, or one bilinear term on the other side;
//! 3. general quadratic: a quadratic whose coefficient matrix has exactly one
//!    negative eigenvalue.
//!
//! The quadratic matchers work on `g(x) <= 0`, obtained from a finite side of
//! the constraint. Cones are expressed over [`Leaf`]s until they are accepted.

use log::trace;
use nalgebra::{DVector, SymmetricEigen};

use crate::expr::{ExprGraph, ExprId, Op};
use crate::interval::Interval;
use crate::nlhdlr::{DetectRequest, Sides};
use crate::problem::{Problem, VarBounds, VarKind};
use crate::quad::{LinExpr, Leaf, QuadExpr, SumTerms};
use crate::settings::Settings;

/// `sqrt(gamma + Σ lhs_i²) <= rhs`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Cone<K> {
    pub lhs: Vec<LinExpr<K>>,
    pub gamma: f64,
    pub rhs: LinExpr<K>,
    /// How the value of the matched expression follows from its leaves.
    pub value: ValueShape<K>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ValueShape<K> {
    /// The expression is `sqrt(gamma + Σ lhs_i²)`.
    Norm,
    /// The expression is `scale * sqrt(gamma + Σ lhs_i²) + rest`.
    ScaledNorm { scale: f64, rest: LinExpr<K> },
    /// The expression is this quadratic.
    Quadratic(QuadExpr<K>),
}

impl<K: Copy + PartialEq> Cone<K> {
    pub fn try_map_keys<J: Copy + PartialEq>(
        &self,
        mut f: impl FnMut(K) -> Option<J>,
    ) -> Option<Cone<J>> {
        let lhs = self
            .lhs
            .iter()
            .map(|t| t.try_map_keys(&mut f))
            .collect::<Option<Vec<_>>>()?;
        let rhs = self.rhs.try_map_keys(&mut f)?;
        let value = match &self.value {
            ValueShape::Norm => ValueShape::Norm,
            ValueShape::ScaledNorm { scale, rest } => ValueShape::ScaledNorm {
                scale: *scale,
                rest: rest.try_map_keys(&mut f)?,
            },
            ValueShape::Quadratic(q) => ValueShape::Quadratic(q.try_map_keys(&mut f)?),
        };
        Some(Cone {
            lhs,
            gamma: self.gamma,
            rhs,
            value,
        })
    }
}

/// Where the right-hand side of a norm comes from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum NormRhs {
    /// The auxiliary variable of the matched expression.
    AuxVar,
    /// A constraint side.
    Constant(f64),
}

/// Read access to what the matchers look at.
pub(crate) struct Matcher<'a> {
    pub graph: &'a ExprGraph,
    pub problem: &'a Problem,
    pub settings: &'a Settings,
}

impl Matcher<'_> {
    /// Domain of a leaf: variable bounds, or the last computed activity.
    fn bounds(&self, leaf: Leaf) -> Interval {
        match leaf {
            Leaf::Var(v) => self.problem.bounds(v),
            Leaf::Expr(e) => self.graph.activity(e),
        }
    }

    fn is_binary(&self, leaf: Leaf) -> bool {
        match leaf {
            Leaf::Var(v) => matches!(self.problem.var(v), Ok(d) if d.kind == VarKind::Binary),
            Leaf::Expr(_) => false,
        }
    }

    /// `lin` itself if it is nonnegative over the bounds, `-lin` if it is
    /// nonpositive, `None` otherwise.
    fn nonneg_orientation(&self, lin: LinExpr<Leaf>) -> Option<LinExpr<Leaf>> {
        let range = lin.activity(|l| self.bounds(l));
        let eps = self.settings.epsilon;
        if range.lo >= -eps {
            Some(lin)
        } else if range.hi <= eps {
            Some(lin.neg())
        } else {
            trace!("right-hand side ranges over [{}, {}]", range.lo, range.hi);
            None
        }
    }

    /// Cone claimed by the handler on `expr`, with the sides it enforces.
    pub fn find(&self, expr: ExprId, request: DetectRequest) -> Option<(Cone<Leaf>, Sides)> {
        if request.need.under {
            let norm = self
                .match_norm(expr, NormRhs::AuxVar)
                .or_else(|| self.match_norm_sum(expr, NormRhs::AuxVar));
            if let Some(cone) = norm {
                return Some((cone, Sides::UNDER));
            }
        }
        let (lhs, rhs) = request.constraint_sides?;
        if request.need.under && !self.settings.is_infinity(rhs) {
            if let Some(cone) = self.match_quadratic(expr, rhs, false) {
                return Some((cone, Sides::UNDER));
            }
        }
        if request.need.over && !self.settings.is_infinity(lhs) {
            if let Some(cone) = self.match_quadratic(expr, lhs, true) {
                return Some((cone, Sides::OVER));
            }
        }
        None
    }

    /// Cone equivalent to `lhs <= root <= rhs`, with constant sides only.
    pub fn find_in_constraint(&self, root: ExprId, lhs: f64, rhs: f64) -> Option<Cone<Leaf>> {
        if !self.settings.is_infinity(rhs) {
            let cone = self
                .match_norm(root, NormRhs::Constant(rhs))
                .or_else(|| self.match_norm_sum(root, NormRhs::Constant(rhs)))
                .or_else(|| self.match_quadratic(root, rhs, false));
            if cone.is_some() {
                return cone;
            }
        }
        if !self.settings.is_infinity(lhs) {
            return self.match_quadratic(root, lhs, true);
        }
        None
    }

    /// Terms of `Σ c_i·(affine_i)² + Σ d_j·binary_j + γ` with all coefficients
    /// positive, as `(lhs terms, γ)`.
    fn norm_terms(&self, sum: ExprId) -> Option<(Vec<LinExpr<Leaf>>, f64)> {
        if !matches!(self.graph.op(sum), Op::Sum { .. }) {
            return None;
        }
        let terms = self.graph.sum_terms(sum);
        if !terms.bilinear.is_empty() {
            return None;
        }
        let mut lhs = Vec::with_capacity(terms.squares.len() + terms.linear.terms.len());
        for (c, base) in &terms.squares {
            if *c <= 0.0 {
                return None;
            }
            lhs.push(base.scale(c.sqrt()));
        }
        for &(leaf, c) in &terms.linear.terms {
            // b = b^2 for binaries
            if c <= 0.0 || !self.is_binary(leaf) {
                return None;
            }
            lhs.push(LinExpr::variable(leaf).scale(c.sqrt()));
        }
        if lhs.is_empty() || terms.linear.constant < 0.0 {
            return None;
        }
        Some((lhs, terms.linear.constant))
    }

    /// `sqrt(sum)` with `sum` as in [`norm_terms`](Self::norm_terms).
    pub fn match_norm(&self, expr: ExprId, rhs: NormRhs) -> Option<Cone<Leaf>> {
        if !matches!(self.graph.op(expr), Op::Pow { exponent } if *exponent == 0.5) {
            return None;
        }
        let (lhs, gamma) = self.norm_terms(self.graph.children(expr)[0])?;
        let rhs = match rhs {
            NormRhs::AuxVar => LinExpr::variable(Leaf::Expr(expr)),
            NormRhs::Constant(c) => LinExpr::constant(c),
        };
        trace!("{:?} is a norm with {} terms", expr, lhs.len());
        Some(Cone {
            lhs,
            gamma,
            rhs,
            value: ValueShape::Norm,
        })
    }

    /// `c·sqrt(sum) + linear` with `c > 0`: the cone `sqrt(sum) <= (w - linear) / c`.
    pub fn match_norm_sum(&self, expr: ExprId, rhs: NormRhs) -> Option<Cone<Leaf>> {
        let Op::Sum { coefs, constant } = self.graph.op(expr) else {
            return None;
        };
        let mut norm = None;
        let mut rest = LinExpr::constant(*constant);
        for (&c, &child) in coefs.iter().zip(self.graph.children(expr)) {
            if matches!(self.graph.op(child), Op::Pow { exponent } if *exponent == 0.5) {
                if norm.is_some() || c <= 0.0 {
                    return None;
                }
                norm = Some((c, child));
                continue;
            }
            let lin = self.graph.linear_form(child)?;
            rest = rest.add(&lin.map_keys(Leaf::Var).scale(c));
        }
        let (scale, child) = norm?;
        let (lhs, gamma) = self.norm_terms(self.graph.children(child)[0])?;
        let side = match rhs {
            NormRhs::AuxVar => LinExpr::variable(Leaf::Expr(expr)),
            NormRhs::Constant(c) => LinExpr::constant(c),
        };
        let rhs = side.add(&rest.neg()).scale(1.0 / scale);
        trace!("{:?} is a scaled norm with {} terms", expr, lhs.len());
        Some(Cone {
            lhs,
            gamma,
            rhs,
            value: ValueShape::ScaledNorm { scale, rest },
        })
    }

    /// `expr <= side` (or `expr >= side` if `flip`) as a cone.
    pub fn match_quadratic(&self, expr: ExprId, side: f64, flip: bool) -> Option<Cone<Leaf>> {
        let terms = self.graph.sum_terms(expr);
        if terms.squares.is_empty() && terms.bilinear.is_empty() {
            return None;
        }
        let value = ValueShape::Quadratic(terms.to_quad());
        // g(x) <= 0
        let mut g = if flip { terms.neg() } else { terms };
        g.linear.constant += if flip { side } else { -side };

        let found = match self.simple_quadratic(&g) {
            Some(c) => Some(c),
            None if self.settings.soc.comp_eigenvalues => self.general_quadratic(&g),
            None => None,
        };
        let (lhs, gamma, rhs) = found?;
        trace!(
            "{:?} {} {} is a cone with {} terms",
            expr,
            if flip { ">=" } else { "<=" },
            side,
            lhs.len()
        );
        Some(Cone {
            lhs,
            gamma,
            rhs,
            value,
        })
    }

    /// Positive squares and binaries against one negative square, a negative
    /// constant, or one bilinear term.
    fn simple_quadratic(&self, g: &SumTerms) -> Option<(Vec<LinExpr<Leaf>>, f64, LinExpr<Leaf>)> {
        if g.bilinear.len() > 1 {
            return None;
        }
        let mut pos: Vec<LinExpr<Leaf>> = Vec::new();
        let mut neg: Option<(f64, LinExpr<Leaf>)> = None;
        let squares = g.squares.iter().map(|(c, b)| (*c, b.clone()));
        let binaries = g.linear.terms.iter().map(|&(l, c)| (c, LinExpr::variable(l)));
        for (c, base) in squares.chain(binaries) {
            if c > 0.0 {
                pos.push(base.scale(c.sqrt()));
            } else if neg.is_none() {
                neg = Some((-c, base));
            } else {
                return None;
            }
        }
        if g.linear.terms.iter().any(|&(l, _)| !self.is_binary(l)) {
            return None;
        }
        let k = g.linear.constant;

        if let Some((c, a, b)) = g.bilinear.first() {
            // Σ pos² + k <= -c·a·b, rotated
            if *c >= 0.0 || neg.is_some() || k < 0.0 {
                return None;
            }
            let c = -c;
            let (a, b) = self.same_sign(a.clone(), b.clone())?;
            let mut lhs: Vec<LinExpr<Leaf>> =
                pos.iter().map(|t| t.scale(2.0 / c.sqrt())).collect();
            lhs.push(a.add(&b.neg()));
            return Some((lhs, 4.0 * k / c, a.add(&b)));
        }
        if pos.is_empty() {
            return None;
        }
        match neg {
            Some((c, base)) if k >= 0.0 => {
                let rhs = self.nonneg_orientation(base.scale(c.sqrt()))?;
                Some((pos, k, rhs))
            }
            Some(_) => None,
            None if k < 0.0 => Some((pos, 0.0, LinExpr::constant((-k).sqrt()))),
            None => None,
        }
    }

    /// `(a, b)` if both are nonnegative, `(-a, -b)` if both are nonpositive.
    fn same_sign(&self, a: LinExpr<Leaf>, b: LinExpr<Leaf>) -> Option<(LinExpr<Leaf>, LinExpr<Leaf>)> {
        let ra = a.activity(|l| self.bounds(l));
        let rb = b.activity(|l| self.bounds(l));
        let eps = self.settings.epsilon;
        if ra.lo >= -eps && rb.lo >= -eps {
            Some((a, b))
        } else if ra.hi <= eps && rb.hi <= eps {
            Some((a.neg(), b.neg()))
        } else {
            None
        }
    }

    /// `x'Ax + b'x + c <= 0` with exactly one negative eigenvalue of `A`.
    fn general_quadratic(&self, g: &SumTerms) -> Option<(Vec<LinExpr<Leaf>>, f64, LinExpr<Leaf>)> {
        let q = g.to_quad();
        let keys = q.keys();
        let (a, b, c) = q.to_dense(&keys);
        if a.iter().chain(b.iter()).any(|v| !v.is_finite()) {
            return None;
        }
        let Some(eig) = SymmetricEigen::try_new(a, f64::EPSILON, 1000) else {
            trace!("eigen-decomposition did not converge");
            return None;
        };

        let eps = self.settings.epsilon;
        let tol = eps * eig.eigenvalues.amax().max(1.0);
        let mut neg = None;
        let mut pos = Vec::new();
        for (i, &lambda) in eig.eigenvalues.iter().enumerate() {
            let dir = eig.eigenvectors.column(i).clone_owned();
            let beta = dir.dot(&b);
            if lambda < -tol {
                if neg.is_some() {
                    return None;
                }
                neg = Some((-lambda, dir, beta));
            } else if lambda > tol {
                pos.push((lambda, dir, beta));
            } else if beta.abs() > tol {
                // linear along a flat direction
                return None;
            }
        }
        let (mu, ndir, nbeta) = neg?;
        if pos.is_empty() {
            return None;
        }

        let mut gamma = c + nbeta * nbeta / (4.0 * mu);
        let mut lhs = Vec::with_capacity(pos.len());
        for (lambda, dir, beta) in &pos {
            gamma -= beta * beta / (4.0 * lambda);
            let s = lambda.sqrt();
            let mut term = along(&keys, &dir, s, eps);
            term.constant = beta / (2.0 * s);
            lhs.push(term);
        }
        if gamma < -self.settings.feastol {
            trace!("cone constant {} is negative", gamma);
            return None;
        }
        let s = mu.sqrt();
        let mut rhs = along(&keys, &ndir, s, eps);
        rhs.constant = -nbeta / (2.0 * s);
        let rhs = self.nonneg_orientation(rhs)?;
        Some((lhs, gamma.max(0.0), rhs))
    }
}

/// `scale * dir' x` over `keys`, dropping tiny coefficients.
fn along(keys: &[Leaf], dir: &DVector<f64>, scale: f64, eps: f64) -> LinExpr<Leaf> {
    let mut lin = LinExpr::zeros();
    for (k, d) in keys.iter().zip(dir.iter()) {
        if d.abs() > eps {
            lin.add_term(*k, scale * d);
        }
    }
    lin
}
