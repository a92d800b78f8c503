//! Linear and quadratic forms extracted from expressions.
//!
//! Forms are keyed generically: during structure detection the keys are
//! [`Leaf`]s, i.e. either variables or subexpressions that will be represented
//! by an auxiliary variable once the structure is accepted; afterwards keys are
//! mapped to [`VarId`]s.
//!
//! - Linear: `Σ coef_i * key_i + constant`
//! - Quadratic: `Σ coef_ij * key_i * key_j + linear`

use nalgebra::{DMatrix, DVector};

use crate::expr::{ExprGraph, ExprId, Op};
use crate::interval::Interval;
use crate::problem::{Solution, VarId};

/// A variable, or a subexpression standing in for one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Leaf {
    Var(VarId),
    Expr(ExprId),
}

impl Leaf {
    /// The variable, if this is one.
    pub fn var(self) -> Option<VarId> {
        match self {
            Leaf::Var(v) => Some(v),
            Leaf::Expr(_) => None,
        }
    }
}

/// A linear expression: `Σ coef_i * key_i + constant`.
///
/// Keys appear at most once, in order of first insertion; zero coefficients
/// are not stored.
#[derive(Debug, Clone, PartialEq)]
pub struct LinExpr<K = VarId> {
    pub terms: Vec<(K, f64)>,
    pub constant: f64,
}

impl<K: Copy + PartialEq> LinExpr<K> {
    /// Create a zero linear expression.
    pub fn zeros() -> Self {
        LinExpr {
            terms: Vec::new(),
            constant: 0.0,
        }
    }

    /// Create a constant linear expression.
    pub fn constant(value: f64) -> Self {
        LinExpr {
            terms: Vec::new(),
            constant: value,
        }
    }

    /// Create a linear expression for a single key with coefficient 1.
    pub fn variable(key: K) -> Self {
        LinExpr {
            terms: vec![(key, 1.0)],
            constant: 0.0,
        }
    }

    /// Check if this is a constant (no keys).
    pub fn is_constant(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn coef(&self, key: K) -> f64 {
        self.terms
            .iter()
            .find(|(k, _)| *k == key)
            .map_or(0.0, |(_, c)| *c)
    }

    /// Add `coef * key`, merging with an existing term of the same key.
    pub fn add_term(&mut self, key: K, coef: f64) {
        if coef == 0.0 {
            return;
        }
        match self.terms.iter().position(|(k, _)| *k == key) {
            Some(i) => {
                self.terms[i].1 += coef;
                if self.terms[i].1 == 0.0 {
                    self.terms.remove(i);
                }
            }
            None => self.terms.push((key, coef)),
        }
    }

    /// Add two linear expressions.
    pub fn add(&self, other: &LinExpr<K>) -> LinExpr<K> {
        let mut sum = self.clone();
        for &(k, c) in &other.terms {
            sum.add_term(k, c);
        }
        sum.constant += other.constant;
        sum
    }

    /// Negate a linear expression.
    pub fn neg(&self) -> LinExpr<K> {
        self.scale(-1.0)
    }

    /// Scale by a scalar.
    pub fn scale(&self, scalar: f64) -> LinExpr<K> {
        if scalar == 0.0 {
            return LinExpr::constant(0.0);
        }
        LinExpr {
            terms: self.terms.iter().map(|&(k, c)| (k, c * scalar)).collect(),
            constant: self.constant * scalar,
        }
    }

    /// Keys in order of first insertion.
    pub fn keys(&self) -> impl Iterator<Item = K> + '_ {
        self.terms.iter().map(|(k, _)| *k)
    }

    pub fn map_keys<J: Copy + PartialEq>(&self, mut f: impl FnMut(K) -> J) -> LinExpr<J> {
        let mut mapped = LinExpr::constant(self.constant);
        for &(k, c) in &self.terms {
            mapped.add_term(f(k), c);
        }
        mapped
    }

    /// Like [`map_keys`](Self::map_keys), failing if any key fails to map.
    pub fn try_map_keys<J: Copy + PartialEq>(
        &self,
        mut f: impl FnMut(K) -> Option<J>,
    ) -> Option<LinExpr<J>> {
        let mut mapped = LinExpr::constant(self.constant);
        for &(k, c) in &self.terms {
            mapped.add_term(f(k)?, c);
        }
        Some(mapped)
    }

    /// Range of the expression when every key ranges over `bounds(key)`.
    pub fn activity(&self, bounds: impl Fn(K) -> Interval) -> Interval {
        self.terms
            .iter()
            .fold(Interval::point(self.constant), |acc, &(k, c)| {
                acc.add(bounds(k).scale(c))
            })
    }
}

impl LinExpr<VarId> {
    pub fn evaluate(&self, sol: &Solution) -> f64 {
        self.terms
            .iter()
            .fold(self.constant, |acc, &(v, c)| acc + c * sol.get(v))
    }
}

/// A quadratic expression: `Σ coef * a * b + linear`.
#[derive(Debug, Clone, PartialEq)]
pub struct QuadExpr<K = VarId> {
    /// Quadratic terms `(a, b, coef)`, each unordered pair at most once.
    pub quad: Vec<(K, K, f64)>,
    /// Linear part, including the constant.
    pub linear: LinExpr<K>,
}

impl<K: Copy + PartialEq> QuadExpr<K> {
    /// Create a quadratic expression from a linear expression.
    pub fn from_linear(linear: LinExpr<K>) -> Self {
        QuadExpr {
            quad: Vec::new(),
            linear,
        }
    }

    /// Add `coef * a * b`.
    pub fn add_quad_term(&mut self, a: K, b: K, coef: f64) {
        if coef == 0.0 {
            return;
        }
        let pos = self
            .quad
            .iter()
            .position(|&(x, y, _)| (x == a && y == b) || (x == b && y == a));
        match pos {
            Some(i) => {
                self.quad[i].2 += coef;
                if self.quad[i].2 == 0.0 {
                    self.quad.remove(i);
                }
            }
            None => self.quad.push((a, b, coef)),
        }
    }

    /// Add `coef * l1 * l2`, expanded.
    pub fn add_product(&mut self, coef: f64, l1: &LinExpr<K>, l2: &LinExpr<K>) {
        for &(a, ca) in &l1.terms {
            for &(b, cb) in &l2.terms {
                self.add_quad_term(a, b, coef * ca * cb);
            }
        }
        for &(a, ca) in &l1.terms {
            self.linear.add_term(a, coef * ca * l2.constant);
        }
        for &(b, cb) in &l2.terms {
            self.linear.add_term(b, coef * cb * l1.constant);
        }
        self.linear.constant += coef * l1.constant * l2.constant;
    }

    /// Scale by a scalar.
    pub fn scale(&self, scalar: f64) -> QuadExpr<K> {
        QuadExpr {
            quad: self
                .quad
                .iter()
                .filter(|_| scalar != 0.0)
                .map(|&(a, b, c)| (a, b, c * scalar))
                .collect(),
            linear: self.linear.scale(scalar),
        }
    }

    /// All keys, in order of first occurrence (quadratic terms first).
    pub fn keys(&self) -> Vec<K> {
        let mut keys: Vec<K> = Vec::new();
        let candidates = self
            .quad
            .iter()
            .flat_map(|&(a, b, _)| [a, b])
            .chain(self.linear.keys());
        for k in candidates {
            if !keys.contains(&k) {
                keys.push(k);
            }
        }
        keys
    }

    pub fn map_keys<J: Copy + PartialEq>(&self, mut f: impl FnMut(K) -> J) -> QuadExpr<J> {
        let mut mapped = QuadExpr::from_linear(self.linear.map_keys(&mut f));
        for &(a, b, c) in &self.quad {
            mapped.add_quad_term(f(a), f(b), c);
        }
        mapped
    }

    pub fn try_map_keys<J: Copy + PartialEq>(
        &self,
        mut f: impl FnMut(K) -> Option<J>,
    ) -> Option<QuadExpr<J>> {
        let mut mapped = QuadExpr::from_linear(self.linear.try_map_keys(&mut f)?);
        for &(a, b, c) in &self.quad {
            mapped.add_quad_term(f(a)?, f(b)?, c);
        }
        Some(mapped)
    }

    /// Dense data `(A, b, c)` with `x'Ax + b'x + c` equal to this expression,
    /// `A` symmetric, for the keys in the given order.
    pub fn to_dense(&self, keys: &[K]) -> (DMatrix<f64>, DVector<f64>, f64) {
        let n = keys.len();
        let index = |k: K| keys.iter().position(|x| *x == k);
        let mut a = DMatrix::zeros(n, n);
        let mut b = DVector::zeros(n);
        for &(x, y, c) in &self.quad {
            let (Some(i), Some(j)) = (index(x), index(y)) else {
                continue;
            };
            if i == j {
                a[(i, i)] += c;
            } else {
                a[(i, j)] += 0.5 * c;
                a[(j, i)] += 0.5 * c;
            }
        }
        for &(x, c) in &self.linear.terms {
            if let Some(i) = index(x) {
                b[i] += c;
            }
        }
        (a, b, self.linear.constant)
    }
}

impl QuadExpr<VarId> {
    pub fn evaluate(&self, sol: &Solution) -> f64 {
        self.quad
            .iter()
            .fold(self.linear.evaluate(sol), |acc, &(a, b, c)| {
                acc + c * sol.get(a) * sol.get(b)
            })
    }
}

/// The children of a sum, sorted into squares, bilinear products and the rest.
#[derive(Debug, Clone, PartialEq)]
pub struct SumTerms {
    /// `coef * base^2`.
    pub squares: Vec<(f64, LinExpr<Leaf>)>,
    /// `coef * a * b`.
    pub bilinear: Vec<(f64, LinExpr<Leaf>, LinExpr<Leaf>)>,
    /// Everything else, including the constant.
    pub linear: LinExpr<Leaf>,
}

impl SumTerms {
    /// `-self`.
    pub fn neg(&self) -> SumTerms {
        SumTerms {
            squares: self.squares.iter().map(|(c, b)| (-c, b.clone())).collect(),
            bilinear: self
                .bilinear
                .iter()
                .map(|(c, a, b)| (-c, a.clone(), b.clone()))
                .collect(),
            linear: self.linear.neg(),
        }
    }

    /// Expanded quadratic expression.
    pub fn to_quad(&self) -> QuadExpr<Leaf> {
        let mut q = QuadExpr::from_linear(self.linear.clone());
        for (c, base) in &self.squares {
            q.add_product(*c, base, base);
        }
        for (c, a, b) in &self.bilinear {
            q.add_product(*c, a, b);
        }
        q
    }
}

impl ExprGraph {
    /// Linear form of an expression, with every node that is not linear in its
    /// children (or a scaled product) kept as an [`Leaf::Expr`].
    pub fn leaf_linear_form(&self, id: ExprId) -> LinExpr<Leaf> {
        let mut form = LinExpr::zeros();
        let mut stack = vec![(id, 1.0)];
        while let Some((e, m)) = stack.pop() {
            match self.op(e) {
                Op::Var(v) => form.add_term(Leaf::Var(*v), m),
                Op::Value(c) => form.constant += m * c,
                Op::Sum { coefs, constant } => {
                    form.constant += m * constant;
                    for (&c, &child) in coefs.iter().zip(self.children(e)).rev() {
                        stack.push((child, m * c));
                    }
                }
                Op::Product { coef } => match self.scaled_factor(e, *coef) {
                    Some((factor, child)) => stack.push((child, m * factor)),
                    None => form.add_term(Leaf::Expr(e), m),
                },
                _ => form.add_term(Leaf::Expr(e), m),
            }
        }
        form
    }

    /// `(factor, child)` if the product is `factor * child` with constants
    /// folded into `factor`.
    fn scaled_factor(&self, product: ExprId, coef: f64) -> Option<(f64, ExprId)> {
        let mut factor = coef;
        let mut rest = None;
        for &c in self.children(product) {
            match self.as_value(c) {
                Some(v) => factor *= v,
                None if rest.is_none() => rest = Some(c),
                None => return None,
            }
        }
        rest.map(|r| (factor, r))
    }

    /// Linear form in variables, if the expression is linear.
    pub fn linear_form(&self, id: ExprId) -> Option<LinExpr<VarId>> {
        self.leaf_linear_form(id).try_map_keys(Leaf::var)
    }

    /// Children of `root` seen as a sum. A root that is not a sum is a sum with
    /// one child.
    pub fn sum_terms(&self, root: ExprId) -> SumTerms {
        let (coefs, children, constant) = match self.op(root) {
            Op::Sum { coefs, constant } => (coefs.clone(), self.children(root).to_vec(), *constant),
            _ => (vec![1.0], vec![root], 0.0),
        };
        let mut terms = SumTerms {
            squares: Vec::new(),
            bilinear: Vec::new(),
            linear: LinExpr::constant(constant),
        };
        for (c, child) in coefs.into_iter().zip(children) {
            match self.op(child) {
                Op::Pow { exponent } if *exponent == 2.0 => {
                    let base = self.children(child)[0];
                    terms.squares.push((c, self.leaf_linear_form(base)));
                }
                Op::Product { coef } => match self.bilinear_factors(child, *coef) {
                    Some((k, a, b)) if a == b => {
                        terms.squares.push((c * k, self.leaf_linear_form(a)));
                    }
                    Some((k, a, b)) => terms.bilinear.push((
                        c * k,
                        self.leaf_linear_form(a),
                        self.leaf_linear_form(b),
                    )),
                    None => terms.linear = terms.linear.add(&self.leaf_linear_form(child).scale(c)),
                },
                _ => terms.linear = terms.linear.add(&self.leaf_linear_form(child).scale(c)),
            }
        }
        terms
    }

    /// `(factor, a, b)` if the product is `factor * a * b` with constants
    /// folded into `factor`.
    fn bilinear_factors(&self, product: ExprId, coef: f64) -> Option<(f64, ExprId, ExprId)> {
        let mut factor = coef;
        let mut rest = Vec::with_capacity(2);
        for &c in self.children(product) {
            match self.as_value(c) {
                Some(v) => factor *= v,
                None => rest.push(c),
            }
        }
        match rest.as_slice() {
            [a, b] => Some((factor, *a, *b)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problem::{Problem, VarKind};

    const TOL: f64 = 1e-12;

    #[test]
    fn test_lin_expr_zeros() {
        let e: LinExpr = LinExpr::zeros();
        assert!(e.is_constant());
        assert_eq!(e.constant, 0.0);
    }

    #[test]
    fn test_lin_expr_add_merges() {
        let mut p = Problem::new();
        let x = p.add_var("x", 0.0, 1.0, VarKind::Continuous);
        let y = p.add_var("y", 0.0, 1.0, VarKind::Continuous);
        let e1 = LinExpr::variable(x).add(&LinExpr::variable(y));
        let e2 = LinExpr::variable(x).scale(-1.0);
        let sum = e1.add(&e2);
        assert_eq!(sum.terms, vec![(y, 1.0)]);
    }

    #[test]
    fn test_leaf_linear_form() {
        let mut p = Problem::new();
        let xv = p.add_var("x", 0.0, 1.0, VarKind::Continuous);
        let yv = p.add_var("y", 0.0, 1.0, VarKind::Continuous);
        let mut g = ExprGraph::new();
        let x = g.var(xv);
        let y = g.var(yv);
        let ex = g.exp(x).unwrap();
        let two = g.value(2.0);
        let scaled = g.product(1.5, &[two, y]).unwrap();
        // 3x - 4(3y + exp(x)) + 2
        let inner = g.sum(&[1.0, 1.0], &[scaled, ex], 0.0).unwrap();
        let e = g.sum(&[3.0, -4.0], &[x, inner], 2.0).unwrap();

        let form = g.leaf_linear_form(e);
        assert_eq!(
            form.terms,
            vec![(Leaf::Var(xv), 3.0), (Leaf::Var(yv), -12.0), (Leaf::Expr(ex), -4.0)]
        );
        assert_eq!(form.constant, 2.0);
        assert!(g.linear_form(e).is_none());
        assert!(g.linear_form(scaled).is_some());
    }

    #[test]
    fn test_sum_terms_and_dense() {
        let mut p = Problem::new();
        let xv = p.add_var("x", 0.0, 1.0, VarKind::Continuous);
        let yv = p.add_var("y", 0.0, 1.0, VarKind::Continuous);
        let mut g = ExprGraph::new();
        let x = g.var(xv);
        let y = g.var(yv);
        let lin = g.sum(&[1.0, 1.0], &[x, y], 1.0).unwrap();
        let sq = g.square(lin).unwrap();
        let xy = g.product(1.0, &[x, y]).unwrap();
        // (x + y + 1)^2 - 3xy + 2x
        let e = g.sum(&[1.0, -3.0, 2.0], &[sq, xy, x], 0.0).unwrap();

        let terms = g.sum_terms(e);
        assert_eq!(terms.squares.len(), 1);
        assert_eq!(terms.bilinear.len(), 1);

        let q = terms.to_quad();
        let keys = q.keys();
        assert_eq!(keys, vec![Leaf::Var(xv), Leaf::Var(yv)]);
        let (a, b, c) = q.to_dense(&keys);
        // x^2 + y^2 - xy + 4x + 2y + 1
        assert!((a[(0, 0)] - 1.0).abs() < TOL);
        assert!((a[(1, 1)] - 1.0).abs() < TOL);
        assert!((a[(0, 1)] + 0.5).abs() < TOL);
        assert!((a[(1, 0)] + 0.5).abs() < TOL);
        assert!((b[0] - 4.0).abs() < TOL);
        assert!((b[1] - 2.0).abs() < TOL);
        assert!((c - 1.0).abs() < TOL);

        let qv = q.try_map_keys(Leaf::var).unwrap();
        let sol = Solution::from_pairs([(xv, 0.3), (yv, -0.2)]);
        let direct = g.evaluate(e, &sol, 0).unwrap();
        assert!((qv.evaluate(&sol) - direct).abs() < 1e-10);
    }
}
