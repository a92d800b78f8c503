//! Point evaluation, interval evaluation and reverse-mode differentiation.
//!
//! Results are memoized on the nodes together with the tag of the call that
//! computed them. A call with a nonzero tag reuses every node whose stored tag
//! matches; tag 0 always recomputes. Evaluation errors (log of a nonpositive
//! number, division by zero, overflow) yield `None`, which propagates upwards.

use log::trace;

use super::graph::ExprGraph;
use super::node::{ExprId, Op};
use super::walk::{walk, ExprVisitor, WalkContext, WalkControl, WalkOptions};
use crate::interval::Interval;
use crate::problem::{Solution, VarBounds};

/// Counters of operator callback invocations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvalStats {
    /// Point evaluations.
    pub evals: u64,
    /// Interval evaluations.
    pub interval_evals: u64,
    /// Backward-derivative evaluations.
    pub backward_evals: u64,
}

fn finite(v: f64) -> Option<f64> {
    if v.is_finite() {
        Some(v)
    } else {
        None
    }
}

impl Op {
    /// Value of the operator given the values of its children.
    /// Variables read their value from `point`.
    pub(crate) fn eval(&self, children: &[f64], point: &Solution) -> Option<f64> {
        match self {
            Op::Var(v) => finite(point.get(*v)),
            Op::Value(c) => Some(*c),
            Op::Sum { coefs, constant } => finite(
                constant
                    + coefs
                        .iter()
                        .zip(children)
                        .map(|(c, x)| c * x)
                        .sum::<f64>(),
            ),
            Op::Product { coef } => finite(children.iter().fold(*coef, |acc, x| acc * x)),
            Op::Pow { exponent } => {
                let x = children[0];
                let p = *exponent;
                if p.fract() != 0.0 && x < 0.0 {
                    return None;
                }
                if x == 0.0 && p < 0.0 {
                    return None;
                }
                if p == 2.0 {
                    finite(x * x)
                } else if p.fract() == 0.0 && p.abs() < i32::MAX as f64 {
                    finite(x.powi(p as i32))
                } else {
                    finite(x.powf(p))
                }
            }
            Op::Exp => finite(children[0].exp()),
            Op::Log => {
                let x = children[0];
                if x <= 0.0 {
                    None
                } else {
                    finite(x.ln())
                }
            }
            Op::Abs => Some(children[0].abs()),
            Op::Entropy => {
                let x = children[0];
                if x < 0.0 {
                    None
                } else if x == 0.0 {
                    Some(0.0)
                } else {
                    finite(-x * x.ln())
                }
            }
        }
    }

    /// Partial derivative with respect to child `i`, given the child values and
    /// the value of the node itself.
    pub(crate) fn backward(&self, children: &[f64], value: f64, i: usize) -> Option<f64> {
        match self {
            Op::Var(_) | Op::Value(_) => None,
            Op::Sum { coefs, .. } => Some(coefs[i]),
            Op::Product { coef } => {
                let partial = children
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .fold(*coef, |acc, (_, x)| acc * x);
                finite(partial)
            }
            Op::Pow { exponent } => {
                let x = children[0];
                let p = *exponent;
                if p == 1.0 {
                    Some(1.0)
                } else if p == 2.0 {
                    Some(2.0 * x)
                } else if x == 0.0 {
                    // not differentiable for p < 1
                    if p > 1.0 {
                        Some(0.0)
                    } else {
                        None
                    }
                } else if p.fract() == 0.0 && p.abs() < i32::MAX as f64 {
                    finite(p * x.powi(p as i32 - 1))
                } else if x < 0.0 {
                    None
                } else {
                    finite(p * x.powf(p - 1.0))
                }
            }
            Op::Exp => Some(value),
            Op::Log => {
                let x = children[0];
                if x == 0.0 {
                    None
                } else {
                    Some(1.0 / x)
                }
            }
            Op::Abs => {
                let x = children[0];
                Some(if x > 0.0 {
                    1.0
                } else if x < 0.0 {
                    -1.0
                } else {
                    0.0
                })
            }
            Op::Entropy => {
                let x = children[0];
                if x <= 0.0 {
                    None
                } else {
                    Some(-x.ln() - 1.0)
                }
            }
        }
    }

    /// Enclosure of the operator over the enclosures of its children.
    /// Variables are handled by the caller.
    pub(crate) fn eval_interval(&self, children: &[Interval]) -> Interval {
        match self {
            Op::Var(_) => Interval::entire(),
            Op::Value(c) => Interval::point(*c),
            Op::Sum { coefs, constant } => coefs
                .iter()
                .zip(children)
                .fold(Interval::point(*constant), |acc, (c, x)| acc.add(x.scale(*c))),
            Op::Product { coef } => children
                .iter()
                .fold(Interval::point(*coef), |acc, x| acc.mul(*x)),
            Op::Pow { exponent } => children[0].pow(*exponent),
            Op::Exp => children[0].exp(),
            Op::Log => children[0].log(),
            Op::Abs => children[0].abs(),
            Op::Entropy => children[0].entropy(),
        }
    }
}

/// Variable domain relaxed by `eps` (relative for large bounds). A bound never
/// changes sign through relaxation; it stops at 0 instead.
pub(crate) fn relax_bounds(dom: Interval, eps: f64) -> Interval {
    if eps <= 0.0 || dom.is_empty() {
        return dom;
    }
    let mut lo = dom.lo;
    if lo.is_finite() {
        let relaxed = lo - eps * lo.abs().max(1.0);
        lo = if lo >= 0.0 && relaxed < 0.0 { 0.0 } else { relaxed };
    }
    let mut hi = dom.hi;
    if hi.is_finite() {
        let relaxed = hi + eps * hi.abs().max(1.0);
        hi = if hi <= 0.0 && relaxed > 0.0 { 0.0 } else { relaxed };
    }
    Interval::new(lo, hi)
}

struct PointEval<'a> {
    point: &'a Solution,
    tag: u64,
}

impl ExprVisitor for PointEval<'_> {
    fn visiting_child(
        &mut self,
        graph: &mut ExprGraph,
        _expr: ExprId,
        child: ExprId,
        _ctx: &WalkContext,
    ) -> WalkControl {
        if self.tag != 0 && graph.node(child).eval_tag == self.tag {
            WalkControl::Skip
        } else {
            WalkControl::Continue
        }
    }

    fn leave(&mut self, graph: &mut ExprGraph, expr: ExprId, _ctx: &WalkContext) -> WalkControl {
        let node = graph.node(expr);
        let values: Option<Vec<f64>> = node.children.iter().map(|c| graph.node(*c).value).collect();
        let value = values.and_then(|vals| node.op.eval(&vals, self.point));
        graph.stats.evals += 1;
        let node = graph.node_mut(expr);
        node.value = value;
        node.eval_tag = self.tag;
        WalkControl::Continue
    }
}

struct IntervalEval<'a, B: VarBounds> {
    bounds: &'a B,
    tag: u64,
    relax_eps: f64,
}

impl<B: VarBounds> ExprVisitor for IntervalEval<'_, B> {
    fn visiting_child(
        &mut self,
        graph: &mut ExprGraph,
        _expr: ExprId,
        child: ExprId,
        _ctx: &WalkContext,
    ) -> WalkControl {
        if self.tag != 0 && graph.node(child).activity_tag == self.tag {
            WalkControl::Skip
        } else {
            WalkControl::Continue
        }
    }

    fn leave(&mut self, graph: &mut ExprGraph, expr: ExprId, _ctx: &WalkContext) -> WalkControl {
        let node = graph.node(expr);
        let activity = match node.op {
            Op::Var(v) => relax_bounds(self.bounds.bounds(v), self.relax_eps),
            ref op => {
                let children: Vec<Interval> =
                    node.children.iter().map(|c| graph.node(*c).activity).collect();
                op.eval_interval(&children)
            }
        };
        graph.stats.interval_evals += 1;
        let node = graph.node_mut(expr);
        node.activity = activity;
        node.activity_tag = self.tag;
        WalkControl::Continue
    }
}

impl ExprGraph {
    /// Evaluate an expression at a point.
    pub fn evaluate(&mut self, root: ExprId, point: &Solution, tag: u64) -> Option<f64> {
        if tag != 0 && self.node(root).eval_tag == tag {
            return self.node(root).value;
        }
        let mut visitor = PointEval { point, tag };
        walk(self, root, &mut visitor, WalkOptions::default());
        self.node(root).value
    }

    /// Evaluate an expression over variable domains.
    ///
    /// Variable domains are relaxed by `relax_eps` (pass 0 for exact bounds).
    pub fn evaluate_interval(
        &mut self,
        root: ExprId,
        bounds: &impl VarBounds,
        tag: u64,
        relax_eps: f64,
    ) -> Interval {
        if tag != 0 && self.node(root).activity_tag == tag {
            return self.node(root).activity;
        }
        let mut visitor = IntervalEval {
            bounds,
            tag,
            relax_eps,
        };
        walk(self, root, &mut visitor, WalkOptions::default());
        self.node(root).activity
    }

    /// Evaluate at `point` and compute the derivative of `root` with respect to
    /// every node below it.
    ///
    /// The backward sweep runs in reverse topological order, so each node's
    /// derivative is complete before it is pushed to its children. Returns the
    /// value of `root`, or `None` if evaluation or differentiation failed (all
    /// derivatives are then `None`).
    pub fn compute_gradient(&mut self, root: ExprId, point: &Solution, tag: u64) -> Option<f64> {
        let value = self.evaluate(root, point, tag);
        let order = self.post_order(root);
        let diff_tag = self.new_tag();
        for &id in &order {
            let node = self.node_mut(id);
            node.diff_tag = diff_tag;
            node.derivative = value.map(|_| 0.0);
        }
        let value = value?;
        self.node_mut(root).derivative = Some(1.0);

        for &id in order.iter().rev() {
            let node = self.node(id);
            if node.children.is_empty() {
                continue;
            }
            let (Some(d), Some(v)) = (node.derivative, node.value) else {
                return self.invalidate_gradient(&order);
            };
            let children = node.children.clone();
            let vals: Option<Vec<f64>> = children.iter().map(|c| self.node(*c).value).collect();
            let Some(vals) = vals else {
                return self.invalidate_gradient(&order);
            };
            for (i, &c) in children.iter().enumerate() {
                self.stats.backward_evals += 1;
                let Some(partial) = self.node(id).op.backward(&vals, v, i) else {
                    trace!("no derivative of {} at child {}", self.node(id).op.name(), i);
                    return self.invalidate_gradient(&order);
                };
                let child = self.node_mut(c);
                child.derivative = child.derivative.map(|cd| cd + d * partial);
            }
        }

        if order.iter().any(|id| {
            self.node(*id)
                .derivative
                .map_or(true, |d| !d.is_finite())
        }) {
            return self.invalidate_gradient(&order);
        }
        Some(value)
    }

    fn invalidate_gradient(&mut self, order: &[ExprId]) -> Option<f64> {
        for &id in order {
            self.node_mut(id).derivative = None;
        }
        None
    }

    /// Last computed activity of a node.
    pub fn activity(&self, id: ExprId) -> Interval {
        self.node(id).activity
    }

    /// Derivative of the last gradient root with respect to this node.
    pub fn derivative(&self, id: ExprId) -> Option<f64> {
        self.node(id).derivative
    }

    /// Partial derivative of `root` with respect to a variable, after
    /// [`compute_gradient`](Self::compute_gradient) on `root`. Variables not
    /// occurring in `root` have derivative 0.
    pub fn partial_diff(&self, root: ExprId, var: crate::problem::VarId) -> Option<f64> {
        let root_tag = self.node(root).diff_tag;
        if root_tag == 0 || self.node(root).derivative.is_none() {
            return None;
        }
        match self.var_node(var) {
            Some(id) if self.node(id).diff_tag == root_tag => self.node(id).derivative,
            _ => Some(0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problem::{Problem, VarKind};

    const TOL: f64 = 1e-10;

    #[test]
    fn test_evaluate_and_memoize() {
        let mut p = Problem::new();
        let xv = p.add_var("x", -1.0, 1.0, VarKind::Continuous);
        let mut g = ExprGraph::new();
        let x = g.var(xv);
        let e = g.exp(x).unwrap();
        let s = g.sum(&[2.0, 1.0], &[e, x], 1.0).unwrap();

        let sol = Solution::from_pairs([(xv, 0.0)]);
        let tag = g.new_tag();
        assert_eq!(g.evaluate(s, &sol, tag), Some(3.0));
        let calls = g.stats().evals;
        assert_eq!(calls, 3);

        // memoized
        assert_eq!(g.evaluate(s, &sol, tag), Some(3.0));
        assert_eq!(g.stats().evals, calls);

        // tag 0 always recomputes
        g.evaluate(s, &sol, 0);
        assert_eq!(g.stats().evals, calls + 3);
    }

    #[test]
    fn test_evaluation_error_propagates() {
        let mut p = Problem::new();
        let xv = p.add_var("x", -1.0, 1.0, VarKind::Continuous);
        let mut g = ExprGraph::new();
        let x = g.var(xv);
        let l = g.log(x).unwrap();
        let s = g.sum(&[1.0], &[l], 1.0).unwrap();
        let sol = Solution::from_pairs([(xv, -1.0)]);
        assert_eq!(g.evaluate(s, &sol, 0), None);
        let inv = g.pow(x, -1.0).unwrap();
        assert_eq!(g.evaluate(inv, &Solution::new(), 0), None);
    }

    #[test]
    fn test_interval_relaxation_keeps_sign() {
        let mut p = Problem::new();
        let xv = p.add_var("x", 0.0, 2.0, VarKind::Continuous);
        let yv = p.add_var("y", -3.0, 0.0, VarKind::Continuous);
        let mut g = ExprGraph::new();
        let x = g.var(xv);
        let y = g.var(yv);
        let xa = g.evaluate_interval(x, &p, 0, 0.1);
        assert_eq!(xa.lo, 0.0);
        assert!((xa.hi - 2.2).abs() < TOL);
        assert_eq!(g.evaluate_interval(y, &p, 0, 0.1).hi, 0.0);
        assert!((g.evaluate_interval(y, &p, 0, 0.1).lo + 3.3).abs() < TOL);

        let sq = g.square(x).unwrap();
        let s = g.sum(&[1.0, -1.0], &[sq, y], 0.0).unwrap();
        assert_eq!(g.evaluate_interval(s, &p, 0, 0.0), Interval::new(0.0, 7.0));
    }

    #[test]
    fn test_gradient_shared_node() {
        // f = exp(x) + exp(x) * y with the exp node shared
        let mut p = Problem::new();
        let xv = p.add_var("x", -1.0, 1.0, VarKind::Continuous);
        let yv = p.add_var("y", -1.0, 1.0, VarKind::Continuous);
        let mut g = ExprGraph::new();
        let x = g.var(xv);
        let y = g.var(yv);
        let e = g.exp(x).unwrap();
        let prod = g.product(1.0, &[e, y]).unwrap();
        let f = g.sum(&[1.0, 1.0], &[e, prod], 0.0).unwrap();

        let sol = Solution::from_pairs([(xv, 0.5), (yv, 2.0)]);
        let v = g.compute_gradient(f, &sol, 0).unwrap();
        let ex = 0.5f64.exp();
        assert!((v - 3.0 * ex).abs() < TOL);
        assert!((g.partial_diff(f, xv).unwrap() - 3.0 * ex).abs() < TOL);
        assert!((g.partial_diff(f, yv).unwrap() - ex).abs() < TOL);
    }

    #[test]
    fn test_gradient_repeated_child() {
        // x * x
        let mut p = Problem::new();
        let xv = p.add_var("x", -1.0, 1.0, VarKind::Continuous);
        let zv = p.add_var("z", -1.0, 1.0, VarKind::Continuous);
        let mut g = ExprGraph::new();
        let x = g.var(xv);
        let f = g.product(1.0, &[x, x]).unwrap();
        let sol = Solution::from_pairs([(xv, 3.0)]);
        g.compute_gradient(f, &sol, 0).unwrap();
        assert!((g.partial_diff(f, xv).unwrap() - 6.0).abs() < TOL);
        assert_eq!(g.partial_diff(f, zv), Some(0.0));
    }

    #[test]
    fn test_gradient_invalid_at_kink() {
        let mut p = Problem::new();
        let xv = p.add_var("x", 0.0, 1.0, VarKind::Continuous);
        let mut g = ExprGraph::new();
        let x = g.var(xv);
        let f = g.sqrt(x).unwrap();
        assert_eq!(g.compute_gradient(f, &Solution::new(), 0), None);
        assert_eq!(g.derivative(x), None);
    }
}
