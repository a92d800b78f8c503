//! Convex and concave subexpressions.
//!
//! Detection grows a copy of the expression from the root downwards, as far as
//! the copied part can be shown to have the desired curvature (convex for the
//! under side, concave for the over side). Every node reached gets a required
//! curvature; nodes that cannot achieve theirs become leaves of the copy and
//! are replaced by their auxiliary variables. The copy is then a convex
//! (concave) function of its leaf variables, and its tangent at a point is a
//! valid under- (over-)estimator.

use std::any::Any;
use std::collections::{HashMap, HashSet};

use log::{debug, trace};

use super::{
    DetectRequest, EstimateFailure, Estimation, HandlerEnv, NlHandler, SearchNode, Sides,
};
use crate::dcp::{monomial_inverse, scalar_mul_curvature, Curvature};
use crate::error::{NlError, Result};
use crate::expr::{walk, ExprGraph, ExprId, ExprVisitor, Op, WalkContext, WalkControl, WalkOptions};
use crate::interval::Interval;
use crate::problem::{Problem, Solution, VarId};
use crate::rowprep::{RowPrep, RowSide};
use crate::settings::ConvexSettings;

pub const NAME: &str = "convex";

/// Data kept per detected expression.
#[derive(Debug)]
struct ConvexExprData {
    /// Root of the carved copy (owned).
    carved: ExprId,
    /// `Convex` or `Concave`.
    curvature: Curvature,
    /// Variables at the leaves of the copy, original or auxiliary, in order of
    /// first occurrence.
    leaves: Vec<VarId>,
    /// Node of the copy -> node of the original expression it stands for.
    origins: HashMap<ExprId, ExprId>,
}

/// Read-only view of a carved expression.
#[derive(Debug, Clone, Copy)]
pub struct Carved<'a> {
    pub root: ExprId,
    pub curvature: Curvature,
    pub leaves: &'a [VarId],
}

/// Handler for expressions with a convex or concave part.
#[derive(Debug, Default)]
pub struct ConvexHandler {
    priority: i32,
    data: HashMap<ExprId, ConvexExprData>,
}

impl ConvexHandler {
    pub fn new(priority: i32) -> Self {
        ConvexHandler {
            priority,
            data: HashMap::new(),
        }
    }

    /// The carved expression detected for `expr`, if any.
    pub fn carved(&self, expr: ExprId) -> Option<Carved<'_>> {
        self.data.get(&expr).map(|d| Carved {
            root: d.carved,
            curvature: d.curvature,
            leaves: &d.leaves,
        })
    }

    /// Original node that a node of the carved copy of `expr` stands for.
    pub fn origin(&self, expr: ExprId, copy: ExprId) -> Option<ExprId> {
        self.data.get(&expr)?.origins.get(&copy).copied()
    }

    /// Tangent of the carved expression of `expr` at `sol`: a linear function of
    /// the leaf variables that underestimates (convex) or overestimates
    /// (concave) it. `None` on evaluation errors.
    pub fn estimator_for(
        &self,
        graph: &mut ExprGraph,
        expr: ExprId,
        sol: &Solution,
    ) -> Option<RowPrep> {
        let data = self.data.get(&expr)?;
        tangent(graph, data, sol).ok()
    }
}

/// Carve a copy of `root` that has curvature `desired`.
///
/// Activities of the original nodes must be up to date.
fn carve(
    graph: &mut ExprGraph,
    cfg: &ConvexSettings,
    root: ExprId,
    desired: Curvature,
    origins: &mut HashMap<ExprId, ExprId>,
) -> Result<Option<ExprId>> {
    debug_assert!(desired == Curvature::Convex || desired == Curvature::Concave);

    let root_copy = graph.duplicate_shallow(root);
    graph.set_curvature(root_copy, desired);
    origins.insert(root_copy, root);

    // frontier: copies without children yet
    let mut stack = vec![root_copy];
    while let Some(copy) = stack.pop() {
        let orig = origins[&copy];
        if graph.n_children(orig) == 0 {
            continue;
        }
        let required = graph.node(copy).curvature();
        if required == Curvature::Unknown {
            // no requirement: continue only to reach the leaves
            let unknown = vec![Curvature::Unknown; graph.n_children(orig)];
            let kids = grow_children(graph, origins, copy, &unknown)?;
            stack.extend(kids);
            continue;
        }
        if cfg.cvx_signomial && signomial_rule(graph, cfg, origins, copy, &mut stack)? {
            continue;
        }
        if let Some(curvs) = graph.required_child_curvature(orig, required) {
            let kids = grow_children(graph, origins, copy, &curvs)?;
            if kids.len() > 1 && cfg.prefer_extended {
                for &k in &kids {
                    require(graph, k, Curvature::Linear);
                }
            }
            stack.extend(kids);
        }
        // otherwise the copy stays a leaf
    }

    let trivial = if !cfg.handle_trivial || matches!(graph.op(root_copy), Op::Sum { .. }) {
        graph
            .children(root_copy)
            .iter()
            .all(|c| graph.n_children(*c) == 0)
    } else {
        graph.n_children(root_copy) == 0
    };
    if trivial {
        trace!("carving of {:?} as {:?} is trivial", root, desired);
        graph.release(root_copy);
        origins.clear();
        return Ok(None);
    }
    Ok(Some(root_copy))
}

/// Append shallow copies of the children of the original of `copy`, with the
/// given required curvatures. Returns the new child copies.
fn grow_children(
    graph: &mut ExprGraph,
    origins: &mut HashMap<ExprId, ExprId>,
    copy: ExprId,
    curvs: &[Curvature],
) -> Result<Vec<ExprId>> {
    let orig = origins[&copy];
    let children = graph.children(orig).to_vec();
    debug_assert_eq!(children.len(), curvs.len());
    let mut kids = Vec::with_capacity(children.len());
    for (&child, &curv) in children.iter().zip(curvs) {
        let kid = graph.duplicate_shallow(child);
        require(graph, kid, curv);
        origins.insert(kid, child);
        graph.append_child(copy, kid)?;
        // now held by the parent only
        graph.release(kid);
        kids.push(kid);
    }
    Ok(kids)
}

fn require(graph: &mut ExprGraph, copy: ExprId, curv: Curvature) {
    // variable nodes are shared with the original expression
    if !matches!(graph.op(copy), Op::Var(_)) {
        graph.set_curvature(copy, curv);
    }
}

/// Signomial rule for `c * Π f_i^{p_i}` with at least two factors.
///
/// Returns whether the rule applied; in that case the bases of the factors are
/// on the stack.
fn signomial_rule(
    graph: &mut ExprGraph,
    cfg: &ConvexSettings,
    origins: &mut HashMap<ExprId, ExprId>,
    copy: ExprId,
    stack: &mut Vec<ExprId>,
) -> Result<bool> {
    let orig = origins[&copy];
    let Op::Product { coef } = *graph.op(orig) else {
        return Ok(false);
    };
    let nfactors = graph.n_children(orig);
    if nfactors <= 1 {
        return Ok(false);
    }

    let factors = crate::dcp::monomial_factors(graph, orig);
    let exponents: Vec<f64> = factors.iter().map(|(_, p)| *p).collect();
    let bounds: Vec<Interval> = factors.iter().map(|(b, _)| graph.activity(*b)).collect();
    let desired = scalar_mul_curvature(coef, graph.node(copy).curvature());
    let Some(curvs) = monomial_inverse(desired, &exponents, &bounds) else {
        return Ok(false);
    };

    let kids = grow_children(graph, origins, copy, &curvs)?;
    for (i, mut kid) in kids.into_iter().enumerate() {
        if matches!(graph.op(kid), Op::Pow { .. }) {
            let bases = grow_children(graph, origins, kid, &curvs[i..=i])?;
            kid = bases[0];
        }
        if cfg.prefer_extended {
            require(graph, kid, Curvature::Linear);
        }
        stack.push(kid);
    }
    Ok(true)
}

/// Replaces leaves of the copy that stand for non-leaf originals by their
/// auxiliary variables, and collects the leaf variables.
struct LeafCollector<'a> {
    problem: &'a mut Problem,
    origins: &'a mut HashMap<ExprId, ExprId>,
    leaves: Vec<VarId>,
    seen: HashSet<VarId>,
    error: Option<NlError>,
}

impl LeafCollector<'_> {
    fn push(&mut self, v: VarId) {
        if self.seen.insert(v) {
            self.leaves.push(v);
        }
    }
}

impl ExprVisitor for LeafCollector<'_> {
    fn visiting_child(
        &mut self,
        graph: &mut ExprGraph,
        expr: ExprId,
        child: ExprId,
        ctx: &WalkContext,
    ) -> WalkControl {
        if graph.n_children(child) > 0 {
            return WalkControl::Continue;
        }
        let orig = self.origins.get(&child).copied().unwrap_or(child);
        if graph.n_children(orig) > 0 {
            let aux = graph.get_or_create_aux_var(orig, self.problem);
            let node = graph.var(aux);
            let replaced = graph.replace_child(expr, ctx.child_index(), node);
            graph.release(node);
            if let Err(e) = replaced {
                self.error = Some(e);
                return WalkControl::Abort;
            }
            self.origins.remove(&child);
            self.origins.insert(node, orig);
            self.push(aux);
        } else if let Op::Var(v) = graph.op(child) {
            let v = *v;
            self.push(v);
        }
        WalkControl::Skip
    }
}

fn collect_leaves(
    graph: &mut ExprGraph,
    problem: &mut Problem,
    carved: ExprId,
    origins: &mut HashMap<ExprId, ExprId>,
) -> Result<Vec<VarId>> {
    let mut collector = LeafCollector {
        problem,
        origins,
        leaves: Vec::new(),
        seen: HashSet::new(),
        error: None,
    };
    walk(graph, carved, &mut collector, WalkOptions::default());
    match collector.error {
        Some(e) => Err(e),
        None => Ok(collector.leaves),
    }
}

/// `f(x*) + Σ ∂f/∂x_i(x*) (x_i - x*_i)` over the leaves of the copy.
fn tangent(
    graph: &mut ExprGraph,
    data: &ConvexExprData,
    sol: &Solution,
) -> std::result::Result<RowPrep, EstimateFailure> {
    let Some(value) = graph.compute_gradient(data.carved, sol, 0) else {
        return Err(EstimateFailure::EvaluationError);
    };
    if !value.is_finite() {
        return Err(EstimateFailure::EvaluationError);
    }
    let side = if data.curvature == Curvature::Convex {
        RowSide::Right
    } else {
        RowSide::Left
    };
    let mut row = RowPrep::new(side);
    for &v in &data.leaves {
        let Some(d) = graph.partial_diff(data.carved, v) else {
            return Err(EstimateFailure::EvaluationError);
        };
        let x = sol.get(v);
        row.add_term(v, d);
        row.add_constant(-d * x);
    }
    row.add_constant(value);
    Ok(row)
}

impl NlHandler for ConvexHandler {
    fn name(&self) -> &'static str {
        NAME
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn detect(
        &mut self,
        env: &mut HandlerEnv,
        expr: ExprId,
        request: DetectRequest,
    ) -> Result<Option<Sides>> {
        let cfg = &env.settings.convex;
        let graph = &mut *env.graph;

        // 1 + f(x) with f trivial is accepted here
        if !cfg.detect_sum && matches!(graph.op(expr), Op::Sum { .. }) && graph.n_children(expr) > 1 {
            return Ok(None);
        }
        if graph.n_children(expr) == 0 {
            return Ok(None);
        }

        // curvature rules read the activities of the original nodes
        graph.evaluate_interval(expr, &*env.problem, 0, 0.0);

        let mut origins = HashMap::new();
        let mut found = None;
        if request.need.under {
            if let Some(c) = carve(graph, cfg, expr, Curvature::Convex, &mut origins)? {
                found = Some((c, Curvature::Convex));
            }
        }
        if found.is_none() && request.need.over {
            if let Some(c) = carve(graph, cfg, expr, Curvature::Concave, &mut origins)? {
                found = Some((c, Curvature::Concave));
            }
        }
        let Some((carved, curvature)) = found else {
            return Ok(None);
        };

        let leaves = collect_leaves(graph, env.problem, carved, &mut origins)?;
        debug!(
            "{:?} is {:?} in {} leaves: {}",
            expr,
            curvature,
            leaves.len(),
            graph.display(carved)
        );
        self.data.insert(
            expr,
            ConvexExprData {
                carved,
                curvature,
                leaves,
                origins,
            },
        );
        Ok(Some(if curvature == Curvature::Convex {
            Sides::UNDER
        } else {
            Sides::OVER
        }))
    }

    fn eval_aux(&mut self, env: &mut HandlerEnv, expr: ExprId, sol: &Solution) -> Option<f64> {
        let data = self.data.get(&expr)?;
        env.graph.evaluate(data.carved, sol, 0)
    }

    fn estimate(
        &mut self,
        env: &mut HandlerEnv,
        expr: ExprId,
        sol: &Solution,
        overestimate: bool,
        _node: SearchNode,
    ) -> Estimation {
        let Some(data) = self.data.get(&expr) else {
            return Estimation::Failed(EstimateFailure::WrongSide);
        };
        if (overestimate && data.curvature == Curvature::Convex)
            || (!overestimate && data.curvature == Curvature::Concave)
        {
            return Estimation::Failed(EstimateFailure::WrongSide);
        }
        match tangent(env.graph, data, sol) {
            Ok(row) if env.settings.is_infinity(row.constant.abs()) => {
                debug!("too large constant in estimator for {:?}", expr);
                Estimation::Failed(EstimateFailure::EvaluationError)
            }
            Ok(row) => Estimation::Estimator(row.named(format!(
                "{}estimate_convex_{}",
                if overestimate { "over" } else { "under" },
                expr.raw()
            ))),
            Err(e) => {
                debug!("no estimator for {:?}: {:?}", expr, e);
                Estimation::Failed(e)
            }
        }
    }

    fn branch_score(
        &mut self,
        env: &mut HandlerEnv,
        expr: ExprId,
        sol: &Solution,
    ) -> Vec<(VarId, f64)> {
        let Some(data) = self.data.get(&expr) else {
            return Vec::new();
        };
        let Some(w) = env.graph.node(expr).aux_var() else {
            return Vec::new();
        };
        let violation = match env.graph.evaluate(data.carved, sol, 0) {
            None => env.settings.infinity,
            Some(v) if data.curvature == Curvature::Convex => v - sol.get(w),
            Some(v) => sol.get(w) - v,
        };
        if violation <= 0.0 {
            return Vec::new();
        }
        data.leaves.iter().map(|&v| (v, violation)).collect()
    }

    fn free_expr_data(&mut self, env: &mut HandlerEnv, expr: ExprId) -> Result<()> {
        if let Some(data) = self.data.remove(&expr) {
            env.graph.release(data.carved);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problem::VarKind;
    use crate::settings::Settings;

    const TOL: f64 = 1e-9;

    fn detect(
        graph: &mut ExprGraph,
        problem: &mut Problem,
        settings: &Settings,
        handler: &mut ConvexHandler,
        expr: ExprId,
    ) -> Option<Sides> {
        let mut env = HandlerEnv {
            graph,
            problem,
            settings,
        };
        handler.detect(&mut env, expr, DetectRequest {
            need: Sides::BOTH,
            constraint_sides: None,
        })
        .unwrap()
    }

    #[test]
    fn test_exp_of_linear_is_convex() {
        let mut p = Problem::new();
        let xv = p.add_var("x", -1.0, 1.0, VarKind::Continuous);
        let yv = p.add_var("y", -1.0, 1.0, VarKind::Continuous);
        let mut g = ExprGraph::new();
        let x = g.var(xv);
        let y = g.var(yv);
        let lin = g.sum(&[2.0, 1.0], &[x, y], 0.0).unwrap();
        let e = g.exp(lin).unwrap();

        let settings = Settings::default();
        let mut h = ConvexHandler::new(50);
        let sides = detect(&mut g, &mut p, &settings, &mut h, e);
        assert_eq!(sides, Some(Sides::UNDER));
        let carved = h.carved(e).unwrap();
        assert_eq!(carved.curvature, Curvature::Convex);
        assert_eq!(carved.leaves, &[xv, yv]);
        assert_eq!(h.origin(e, carved.root), Some(e));
    }

    #[test]
    fn test_log_is_concave_on_over_side() {
        let mut p = Problem::new();
        let xv = p.add_var("x", 1.0, 2.0, VarKind::Continuous);
        let mut g = ExprGraph::new();
        let x = g.var(xv);
        let e = g.log(x).unwrap();

        let settings = Settings::default();
        let mut h = ConvexHandler::new(50);
        // log(x) has a variable child: trivial unless handletrivial
        assert_eq!(detect(&mut g, &mut p, &settings, &mut h, e), None);

        let mut settings = Settings::default();
        settings.convex.handle_trivial = true;
        assert_eq!(detect(&mut g, &mut p, &settings, &mut h, e), Some(Sides::OVER));
    }

    #[test]
    fn test_nonconvex_part_becomes_aux_leaf() {
        let mut p = Problem::new();
        let xv = p.add_var("x", -1.0, 1.0, VarKind::Continuous);
        let mut g = ExprGraph::new();
        let x = g.var(xv);
        // exp(x^3 + x) with x^3 indefinite on [-1, 1]
        let cube = g.pow(x, 3.0).unwrap();
        let inner = g.sum(&[1.0, 1.0], &[cube, x], 0.0).unwrap();
        let e = g.exp(inner).unwrap();

        let settings = Settings::default();
        let mut h = ConvexHandler::new(50);
        assert_eq!(detect(&mut g, &mut p, &settings, &mut h, e), Some(Sides::UNDER));
        let leaves = h.carved(e).unwrap().leaves.to_vec();
        assert_eq!(leaves.len(), 2);
        let aux = g.node(cube).aux_var().unwrap();
        assert_eq!(leaves, vec![aux, xv]);
        assert_eq!(p.var(aux).unwrap().lb, -1.0);
        assert_eq!(p.var(aux).unwrap().ub, 1.0);
    }

    #[test]
    fn test_tangent_of_signomial() {
        let mut p = Problem::new();
        let xv = p.add_var("x", 0.5, 2.0, VarKind::Continuous);
        let yv = p.add_var("y", 1.0, 3.0, VarKind::Continuous);
        let mut g = ExprGraph::new();
        let x = g.var(xv);
        let y = g.var(yv);
        // x^2 / y
        let sq = g.pow(x, 2.0).unwrap();
        let inv = g.pow(y, -1.0).unwrap();
        let e = g.product(1.0, &[sq, inv]).unwrap();

        let settings = Settings::default();
        let mut h = ConvexHandler::new(50);
        assert_eq!(detect(&mut g, &mut p, &settings, &mut h, e), Some(Sides::UNDER));

        let sol = Solution::from_pairs([(xv, 1.0), (yv, 2.0)]);
        let row = h.estimator_for(&mut g, e, &sol).unwrap();
        // f = 0.5, df/dx = 1, df/dy = -0.25
        assert!((row.coef(xv) - 1.0).abs() < TOL);
        assert!((row.coef(yv) + 0.25).abs() < TOL);
        assert!((row.evaluate(&sol) - 0.5).abs() < TOL);
    }

    #[test]
    fn test_sum_root_skipped_without_detectsum() {
        let mut p = Problem::new();
        let xv = p.add_var("x", -1.0, 1.0, VarKind::Continuous);
        let mut g = ExprGraph::new();
        let x = g.var(xv);
        let e1 = g.exp(x).unwrap();
        let sq = g.square(x).unwrap();
        let e2 = g.exp(sq).unwrap();
        let s = g.sum(&[1.0, 1.0], &[e1, e2], 0.0).unwrap();

        let mut settings = Settings::default();
        let mut h = ConvexHandler::new(50);
        assert_eq!(detect(&mut g, &mut p, &settings, &mut h, s), None);

        settings.convex.detect_sum = true;
        settings.convex.prefer_extended = false;
        assert_eq!(detect(&mut g, &mut p, &settings, &mut h, s), Some(Sides::UNDER));
    }

    #[test]
    fn test_free_releases_copy() {
        let mut p = Problem::new();
        let xv = p.add_var("x", -1.0, 1.0, VarKind::Continuous);
        let mut g = ExprGraph::new();
        let x = g.var(xv);
        let sq = g.square(x).unwrap();
        let e = g.exp(sq).unwrap();
        let before = g.n_nodes();

        let settings = Settings::default();
        let mut h = ConvexHandler::new(50);
        detect(&mut g, &mut p, &settings, &mut h, e).unwrap();
        assert!(g.n_nodes() > before);
        let mut env = HandlerEnv {
            graph: &mut g,
            problem: &mut p,
            settings: &settings,
        };
        h.free_expr_data(&mut env, e).unwrap();
        assert_eq!(g.n_nodes(), before);
        assert!(h.carved(e).is_none());
    }
}
