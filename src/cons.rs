//! Constraint enforcement.
//!
//! A [`Model`] owns the expression graph, the variables and rows, the handler
//! registry and a list of constraints `lhs <= f(x) <= rhs`. It drives the
//! handlers: [`Model::detect`] asks them for structure in every constraint
//! function and in every subexpression that got an auxiliary variable along
//! the way, [`Model::enforce`] separates a point.
//!
//! ```ignore
//! use nlrelax::prelude::*;
//!
//! let mut model = Model::new(Settings::default());
//! let x = model.problem.add_var("x", -2.0, 2.0, VarKind::Continuous);
//! let y = model.problem.add_var("y", -2.0, 2.0, VarKind::Continuous);
//! let xn = model.graph.var(x);
//! let yn = model.graph.var(y);
//! let sx = model.graph.square(xn)?;
//! let sy = model.graph.square(yn)?;
//! let disk = model.graph.sum(&[1.0, 1.0], &[sx, sy], 0.0)?;
//! model.add_constraint("disk", disk, f64::NEG_INFINITY, 1.0)?;
//! model.detect()?;
//!
//! let result = model.enforce(&Solution::from_pairs([(x, 2.0), (y, 0.0)]), SearchNode::ROOT)?;
//! ```

use std::collections::{HashMap, HashSet};

use log::{debug, info, trace, warn};

use crate::error::{NlError, Result};
use crate::expr::{ExprGraph, ExprId};
use crate::nlhdlr::{Estimation, HandlerEnv, HandlerRegistry, SearchNode, Sides};
use crate::problem::{Problem, RowId, Solution, VarBounds, VarId};
use crate::rowprep::RowPrep;
use crate::settings::Settings;

/// A constraint `lhs <= f(x) <= rhs`.
#[derive(Debug, Clone)]
pub struct Constraint {
    pub name: String,
    pub root: ExprId,
    pub lhs: f64,
    pub rhs: f64,
}

/// Outcome of [`Model::enforce`].
#[derive(Debug, Clone, Default)]
pub struct EnforceResult {
    /// Installed cuts.
    pub cuts: Vec<RowId>,
    /// Accumulated branching scores, by variable.
    pub branch_scores: Vec<(VarId, f64)>,
    /// Some expression was found violated.
    pub violated: bool,
}

/// Stage of a [`Model`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Building,
    Detected,
    Exited,
}

/// Expressions, variables, handlers and constraints.
pub struct Model {
    pub graph: ExprGraph,
    pub problem: Problem,
    pub registry: HandlerRegistry,
    pub settings: Settings,
    constraints: Vec<Constraint>,
    /// Expressions that went through detection, in that order.
    detected: Vec<ExprId>,
    stage: Stage,
}

impl Model {
    /// Model with the built-in handlers enabled in `settings`.
    pub fn new(settings: Settings) -> Self {
        let registry = HandlerRegistry::with_defaults(&settings);
        Self::with_registry(settings, registry)
    }

    pub fn with_registry(settings: Settings, registry: HandlerRegistry) -> Self {
        Model {
            graph: ExprGraph::new(),
            problem: Problem::new(),
            registry,
            settings,
            constraints: Vec::new(),
            detected: Vec::new(),
            stage: Stage::Building,
        }
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    /// Expressions that went through detection.
    pub fn detected(&self) -> &[ExprId] {
        &self.detected
    }

    /// Add `lhs <= root <= rhs`. The model captures `root`.
    ///
    /// The root gets an auxiliary variable bounded by the sides.
    pub fn add_constraint(
        &mut self,
        name: impl Into<String>,
        root: ExprId,
        lhs: f64,
        rhs: f64,
    ) -> Result<usize> {
        if self.stage != Stage::Building {
            return Err(NlError::InvalidStage(
                "constraints must be added before detection".into(),
            ));
        }
        if lhs > rhs {
            return Err(NlError::InvalidExpression(format!(
                "constraint sides {} > {}",
                lhs, rhs
            )));
        }
        let name = name.into();
        self.graph.capture(root);
        let activity = self.graph.evaluate_interval(root, &self.problem, 0, 0.0);
        let w = self.graph.get_or_create_aux_var(root, &mut self.problem);
        let lb = activity.lo.max(lhs);
        let ub = activity.hi.min(rhs);
        self.problem.set_bounds(w, lb, ub)?;
        debug!(
            "constraint {}: {} <= {} <= {}",
            name,
            lhs,
            self.graph.display_with(root, &self.problem),
            rhs
        );
        self.constraints.push(Constraint {
            name,
            root,
            lhs,
            rhs,
        });
        Ok(self.constraints.len() - 1)
    }

    fn env(&mut self) -> (HandlerEnv<'_>, &mut HandlerRegistry) {
        (
            HandlerEnv {
                graph: &mut self.graph,
                problem: &mut self.problem,
                settings: &self.settings,
            },
            &mut self.registry,
        )
    }

    /// Run detection on all constraint functions, then on every subexpression
    /// that has an auxiliary variable, until no new ones appear.
    pub fn detect(&mut self) -> Result<()> {
        if self.stage != Stage::Building {
            return Err(NlError::InvalidStage("detection already ran".into()));
        }
        let mut done: HashSet<ExprId> = HashSet::new();

        let roots: Vec<(ExprId, f64, f64)> = self
            .constraints
            .iter()
            .map(|c| (c.root, c.lhs, c.rhs))
            .collect();
        for (root, lhs, rhs) in roots {
            if !done.insert(root) {
                continue;
            }
            let need = Sides {
                under: !self.settings.is_infinity(rhs),
                over: !self.settings.is_infinity(lhs),
            };
            self.detect_expr(root, need, Some((lhs, rhs)))?;
        }

        loop {
            let pending: Vec<ExprId> = self
                .graph
                .live_nodes()
                .into_iter()
                .filter(|&e| {
                    self.graph.node(e).aux_var().is_some()
                        && self.graph.n_children(e) > 0
                        && !done.contains(&e)
                })
                .collect();
            if pending.is_empty() {
                break;
            }
            for e in pending {
                done.insert(e);
                self.detect_expr(e, Sides::BOTH, None)?;
            }
        }
        self.stage = Stage::Detected;
        info!(
            "detection done: {} expressions, {} associations",
            self.detected.len(),
            self.registry.all_associations().len()
        );
        Ok(())
    }

    fn detect_expr(&mut self, expr: ExprId, need: Sides, sides: Option<(f64, f64)>) -> Result<()> {
        let (mut env, registry) = self.env();
        let claimed = registry.detect(&mut env, expr, need, sides)?;
        if claimed != need {
            debug!(
                "{:?}: no handler for (under: {}, over: {})",
                expr,
                need.under && !claimed.under,
                need.over && !claimed.over
            );
        }
        self.detected.push(expr);
        Ok(())
    }

    /// Extend `sol` by the values of the auxiliary variables of detected
    /// expressions, evaluated at `sol` and projected onto their bounds.
    pub fn extend_solution(&mut self, sol: &Solution) -> Solution {
        let mut out = sol.clone();
        for &e in &self.detected {
            let Some(w) = self.graph.node(e).aux_var() else {
                continue;
            };
            if let Some(v) = self.graph.evaluate(e, sol, 0) {
                let dom = self.problem.bounds(w);
                out.set(w, v.max(dom.lo).min(dom.hi));
            }
        }
        out
    }

    /// Separate `sol`: for every detected expression and every side claimed on
    /// it that `sol` violates, ask the handler for cuts, and collect branching
    /// scores. Cuts are cleaned up, filtered by efficacy and installed.
    pub fn enforce(&mut self, sol: &Solution, node: SearchNode) -> Result<EnforceResult> {
        if self.stage != Stage::Detected {
            return Err(NlError::InvalidStage("enforcement needs detection".into()));
        }
        let mut result = EnforceResult::default();
        let mut scores: HashMap<VarId, f64> = HashMap::new();
        let tag = self.graph.new_tag();
        let feastol = self.settings.feastol;

        for e in self.detected.clone() {
            let Some(w) = self.graph.node(e).aux_var() else {
                continue;
            };
            let wval = sol.get(w);
            let direct = self.graph.evaluate(e, sol, tag);

            for assoc in self.registry.associations(e) {
                let (mut env, registry) = self.env();
                let handler = registry.handler_mut(assoc.handler);
                let Some(value) = handler.eval_aux(&mut env, e, sol) else {
                    trace!("{} cannot evaluate {:?}", handler.name(), e);
                    continue;
                };
                if let Some(d) = direct {
                    if (d - value).abs() > feastol * d.abs().max(1.0) {
                        trace!(
                            "{} evaluates {:?} to {} instead of {} at this point",
                            handler.name(),
                            e,
                            value,
                            d
                        );
                    }
                }

                for overestimate in [false, true] {
                    let claimed = if overestimate {
                        assoc.sides.over
                    } else {
                        assoc.sides.under
                    };
                    let violation = if overestimate {
                        wval - value
                    } else {
                        value - wval
                    };
                    if !claimed || violation <= feastol {
                        continue;
                    }
                    result.violated = true;
                    trace!(
                        "{:?} violated by {} ({})",
                        e,
                        violation,
                        if overestimate { "over" } else { "under" }
                    );

                    let rows = match handler.estimate(&mut env, e, sol, overestimate, node) {
                        Estimation::Estimator(mut row) => {
                            // est(x) <= w or est(x) >= w
                            row.add_term(w, -1.0);
                            vec![row]
                        }
                        Estimation::Cuts(rows) => rows,
                        Estimation::Failed(reason) => {
                            trace!("{} gave no cut for {:?}: {:?}", handler.name(), e, reason);
                            Vec::new()
                        }
                    };
                    for row in rows {
                        if let Some(id) = install(env.problem, env.settings, row, sol) {
                            result.cuts.push(id);
                        }
                    }
                }

                for (v, s) in handler.branch_score(&mut env, e, sol) {
                    *scores.entry(v).or_insert(0.0) += s;
                }
            }
        }

        let mut branch_scores: Vec<(VarId, f64)> = scores.into_iter().collect();
        branch_scores.sort_by_key(|(v, _)| *v);
        result.branch_scores = branch_scores;
        debug!(
            "enforcement at node {}: {} cuts, violated: {}",
            node.number,
            result.cuts.len(),
            result.violated
        );
        Ok(result)
    }

    /// Check every constraint at `sol` by evaluating its function. Does not
    /// depend on detection or cuts.
    pub fn is_feasible(&mut self, sol: &Solution) -> bool {
        let feastol = self.settings.feastol;
        let roots: Vec<(ExprId, f64, f64)> = self
            .constraints
            .iter()
            .map(|c| (c.root, c.lhs, c.rhs))
            .collect();
        roots.into_iter().all(|(root, lhs, rhs)| {
            match self.graph.evaluate(root, sol, 0) {
                Some(v) => v >= lhs - feastol && v <= rhs + feastol,
                None => false,
            }
        })
    }

    /// Free all handler data, auxiliary variables and constraint roots.
    pub fn exit(&mut self) -> Result<()> {
        if self.stage == Stage::Exited {
            return Ok(());
        }
        let (mut env, registry) = self.env();
        registry.exit(&mut env)?;
        self.graph.release_aux_vars(&mut self.problem);
        for c in std::mem::take(&mut self.constraints) {
            self.graph.release(c.root);
        }
        self.detected.clear();
        self.stage = Stage::Exited;
        Ok(())
    }
}

/// Clean up `row`, check that it cuts off `sol`, and install it.
fn install(problem: &mut Problem, settings: &Settings, mut row: RowPrep, sol: &Solution) -> Option<RowId> {
    if !row.cleanup(&*problem, settings) {
        debug!("cut {} dropped in cleanup", row.name);
        return None;
    }
    let efficacy = row.efficacy(sol);
    if efficacy <= settings.feastol {
        trace!("cut {} has efficacy {:e}", row.name, efficacy);
        return None;
    }
    if row.terms.is_empty() {
        warn!("cut {} has no variables but is violated", row.name);
        return None;
    }
    Some(problem.add_row(row))
}
