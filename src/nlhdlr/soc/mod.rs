//! Second-order cones.
//!
//! Detects expressions, or constraints on them, that describe a second-order
//! cone, brings them into the canonical form of [`SocForm`] and separates them,
//! by default after disaggregating the cone into rotated three-dimensional
//! cones.

mod detect;
mod form;
mod sepa;

use std::any::Any;
use std::collections::HashMap;

use log::{debug, trace};

use super::{DetectRequest, EstimateFailure, Estimation, HandlerEnv, NlHandler, SearchNode, Sides};
use crate::error::Result;
use crate::expr::{ExprGraph, ExprId};
use crate::problem::{Problem, RowId, Solution, VarId};
use crate::quad::Leaf;
use crate::settings::Settings;

use detect::{Cone, Matcher, ValueShape};
use form::SocFormBuilder;
use sepa::{RoundCounter, SmallLhs};

pub use form::SocForm;

pub const NAME: &str = "soc";

/// Data kept per detected expression.
#[derive(Debug)]
struct SocExprData {
    form: SocForm,
    value: ValueShape<VarId>,
    sides: Sides,
    /// Disaggregation variables, one per left-hand side term and one for `γ > 0`.
    disagg: Vec<VarId>,
    linking_row: Option<RowId>,
    rounds: RoundCounter,
}

/// Handler for second-order cones.
#[derive(Debug, Default)]
pub struct SocHandler {
    priority: i32,
    data: HashMap<ExprId, SocExprData>,
}

impl SocHandler {
    pub fn new(priority: i32) -> Self {
        SocHandler {
            priority,
            data: HashMap::new(),
        }
    }

    /// The cone detected for `expr`, if any.
    pub fn form(&self, expr: ExprId) -> Option<&SocForm> {
        self.data.get(&expr).map(|d| &d.form)
    }

    /// Disaggregation variables and linking row of `expr`.
    pub fn disaggregation(&self, expr: ExprId) -> Option<(&[VarId], Option<RowId>)> {
        self.data
            .get(&expr)
            .map(|d| (d.disagg.as_slice(), d.linking_row))
    }
}

fn build_form(cone: &Cone<VarId>, settings: &Settings) -> Result<SocForm> {
    let mut builder = SocFormBuilder::new();
    for term in &cone.lhs {
        builder.push_term(term, 1.0);
    }
    builder.push_term(&cone.rhs, 1.0);
    builder.set_constant(cone.gamma);
    builder.build(settings.epsilon)
}

/// The cone described by the constraint `lhs <= root <= rhs` in the variables
/// of `root`, or `None` if the constraint is not a second-order cone or needs
/// auxiliary variables to be one.
///
/// The constraint side takes the place of the right-hand side of the cone.
pub fn soc_form_of_constraint(
    graph: &mut ExprGraph,
    problem: &Problem,
    root: ExprId,
    lhs: f64,
    rhs: f64,
    settings: &Settings,
) -> Result<Option<SocForm>> {
    graph.evaluate_interval(root, problem, 0, 0.0);
    let matcher = Matcher {
        graph,
        problem,
        settings,
    };
    let Some(cone) = matcher.find_in_constraint(root, lhs, rhs) else {
        return Ok(None);
    };
    let Some(cone) = cone.try_map_keys(Leaf::var) else {
        trace!("cone in {:?} has nonlinear leaves", root);
        return Ok(None);
    };
    build_form(&cone, settings).map(Some)
}

impl SocExprData {
    fn eval(&self, sol: &Solution) -> f64 {
        match &self.value {
            ValueShape::Norm => self.form.lhs_value(&self.form.point(sol)),
            ValueShape::ScaledNorm { scale, rest } => {
                scale * self.form.lhs_value(&self.form.point(sol)) + rest.evaluate(sol)
            }
            ValueShape::Quadratic(q) => q.evaluate(sol),
        }
    }

    fn separate(&self, sol: &Solution, settings: &Settings) -> Estimation {
        let point = self.form.point(sol);
        if self.disagg.is_empty() {
            return match sepa::gradient_cut(&self.form, &point, settings) {
                Ok(row) => Estimation::Cuts(vec![row]),
                Err(e) => Estimation::Failed(e),
            };
        }

        let n = self.form.nterms() - 1;
        let mut cuts = Vec::new();
        let mut failure = EstimateFailure::NotViolated;
        for (k, &y) in self.disagg.iter().enumerate() {
            let lhs = if k < n {
                SmallLhs::Term(k)
            } else {
                SmallLhs::Constant
            };
            match sepa::small_cone_cut(&self.form, &point, lhs, y, sol.get(y), settings) {
                Ok(row) => cuts.push(row),
                Err(EstimateFailure::NotViolated) => {}
                Err(e) => {
                    trace!("no cut for small cone {}: {:?}", k, e);
                    failure = e;
                }
            }
        }
        if cuts.is_empty() {
            Estimation::Failed(failure)
        } else {
            Estimation::Cuts(cuts)
        }
    }
}

impl NlHandler for SocHandler {
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
        if env.graph.n_children(expr) == 0 {
            return Ok(None);
        }
        env.graph.evaluate_interval(expr, &*env.problem, 0, 0.0);

        let matcher = Matcher {
            graph: env.graph,
            problem: env.problem,
            settings: env.settings,
        };
        let Some((cone, sides)) = matcher.find(expr, request) else {
            return Ok(None);
        };

        let graph = &mut *env.graph;
        let problem = &mut *env.problem;
        let Some(cone) = cone.try_map_keys(|leaf| {
            Some(match leaf {
                Leaf::Var(v) => v,
                Leaf::Expr(e) => graph.get_or_create_aux_var(e, problem),
            })
        }) else {
            return Ok(None);
        };
        let form = build_form(&cone, env.settings)?;

        let (disagg, linking_row) = if env.settings.soc.disaggregate {
            let (d, row) = sepa::disaggregate(env.problem, &form, expr)?;
            (d, Some(row))
        } else {
            (Vec::new(), None)
        };
        debug!(
            "{:?} is a cone with {} terms in {} variables ({} disaggregation variables): {}",
            expr,
            form.nterms(),
            form.nvars(),
            disagg.len(),
            env.graph.display(expr)
        );

        self.data.insert(
            expr,
            SocExprData {
                form,
                value: cone.value,
                sides,
                disagg,
                linking_row,
                rounds: RoundCounter::default(),
            },
        );
        Ok(Some(sides))
    }

    fn eval_aux(&mut self, _env: &mut HandlerEnv, expr: ExprId, sol: &Solution) -> Option<f64> {
        let value = self.data.get(&expr)?.eval(sol);
        value.is_finite().then_some(value)
    }

    fn estimate(
        &mut self,
        env: &mut HandlerEnv,
        expr: ExprId,
        sol: &Solution,
        overestimate: bool,
        node: SearchNode,
    ) -> Estimation {
        let Some(data) = self.data.get_mut(&expr) else {
            return Estimation::Failed(EstimateFailure::WrongSide);
        };
        if (overestimate && !data.sides.over) || (!overestimate && !data.sides.under) {
            return Estimation::Failed(EstimateFailure::WrongSide);
        }
        if !data.rounds.admit(node, &env.settings.soc) {
            trace!("round limit for {:?} at node {}", expr, node.number);
            return Estimation::Failed(EstimateFailure::RoundLimit);
        }

        let min_efficacy = env.settings.soc.min_efficacy;
        match data.separate(sol, env.settings) {
            Estimation::Cuts(rows) => {
                let mut cuts = Vec::with_capacity(rows.len());
                for (k, mut row) in rows.into_iter().enumerate() {
                    if !row.cleanup(&*env.problem, env.settings) {
                        trace!("cut {} for {:?} dropped in cleanup", k, expr);
                        continue;
                    }
                    let efficacy = row.efficacy(sol);
                    if efficacy < min_efficacy {
                        trace!("cut {} for {:?} has efficacy {:e}", k, expr, efficacy);
                        continue;
                    }
                    cuts.push(row.named(format!("soc_{}_{}", expr.raw(), k)));
                }
                if cuts.is_empty() {
                    Estimation::Failed(EstimateFailure::NotViolated)
                } else {
                    Estimation::Cuts(cuts)
                }
            }
            other => other,
        }
    }

    fn branch_score(
        &mut self,
        _env: &mut HandlerEnv,
        expr: ExprId,
        sol: &Solution,
    ) -> Vec<(VarId, f64)> {
        let Some(data) = self.data.get(&expr) else {
            return Vec::new();
        };
        let violation = data.form.violation(sol);
        if violation <= 0.0 {
            return Vec::new();
        }
        data.form.vars().iter().map(|&v| (v, violation)).collect()
    }

    fn free_expr_data(&mut self, env: &mut HandlerEnv, expr: ExprId) -> Result<()> {
        if let Some(data) = self.data.remove(&expr) {
            if let Some(row) = data.linking_row {
                sepa::release_disaggregation(env.problem, &data.disagg, row)?;
            }
        }
        Ok(())
    }
}
