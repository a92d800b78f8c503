//! Cuts for second-order cones.
//!
//! With disaggregation, `sqrt(γ + Σ t_i²) <= t_n` is replaced by the rotated
//! cones `t_i² <= y_i·t_n` (and `γ <= y_γ·t_n`) together with the linking row
//! `Σ y_i <= t_n`. Each small cone is written as
//! `f = sqrt(4·lhs² + (rhs - y)²) - rhs - y <= 0` and linearized separately.
//! `f` is positively homogeneous in `(lhs, rhs, y)`, so its linearization at
//! any point has no constant part of its own.

use log::trace;

use crate::error::Result;
use crate::expr::ExprId;
use crate::nlhdlr::{EstimateFailure, SearchNode};
use crate::problem::{Problem, RowId, VarId};
use crate::rowprep::{RowPrep, RowSide};
use crate::settings::{Settings, SocSettings};

use super::form::SocForm;

/// Left-hand side of a small cone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SmallLhs {
    /// Term `i` of the form.
    Term(usize),
    /// `sqrt(γ)`.
    Constant,
}

/// Add `coef * term_i(x)` to `row`.
fn add_form_term(row: &mut RowPrep, form: &SocForm, i: usize, coef: f64) {
    let (terms, offset) = form.term(i);
    for (v, c) in terms {
        row.add_term(v, coef * c);
    }
    row.add_constant(coef * offset);
}

/// Create the disaggregation variables and the linking row.
pub(crate) fn disaggregate(
    problem: &mut Problem,
    form: &SocForm,
    expr: ExprId,
) -> Result<(Vec<VarId>, RowId)> {
    let n = form.nterms() - 1;
    let count = if form.constant() > 0.0 { n + 1 } else { n };
    let disagg: Vec<VarId> = (0..count)
        .map(|i| problem.create_aux_var(format!("soc_y_{}_{}", expr.raw(), i), 0.0, f64::INFINITY))
        .collect();

    // Σ y_i - t_n <= 0
    let mut link = RowPrep::new(RowSide::Right).named(format!("soc_link_{}", expr.raw()));
    for &y in &disagg {
        link.add_term(y, 1.0);
    }
    add_form_term(&mut link, form, n, -1.0);
    link.merge();
    let row = problem.add_row(link);
    for &y in &disagg {
        // only the linking row restricts y from above
        problem.add_locks(y, 0, 1)?;
    }
    Ok((disagg, row))
}

/// Undo [`disaggregate`].
pub(crate) fn release_disaggregation(problem: &mut Problem, disagg: &[VarId], row: RowId) -> Result<()> {
    problem.remove_row(row)?;
    for &y in disagg {
        problem.release_var(y)?;
    }
    Ok(())
}

/// Linearization of the small cone with left-hand side `lhs` and
/// disaggregation variable `y` at `point` (values of the form variables).
pub(crate) fn small_cone_cut(
    form: &SocForm,
    point: &[f64],
    lhs: SmallLhs,
    y: VarId,
    yval: f64,
    settings: &Settings,
) -> std::result::Result<RowPrep, EstimateFailure> {
    let n = form.nterms() - 1;
    let lhsval = match lhs {
        SmallLhs::Term(i) => form.term_value(i, point),
        SmallLhs::Constant => form.constant().sqrt(),
    };
    let rhsval = form.rhs_value(point);

    let denom = (4.0 * lhsval * lhsval + (rhsval - yval).powi(2)).sqrt();
    let f = denom - rhsval - yval;
    if f <= 0.0 {
        return Err(EstimateFailure::NotViolated);
    }
    if denom <= settings.epsilon {
        return Err(EstimateFailure::Numerics(format!(
            "denominator {:e} of small cone cut",
            denom
        )));
    }

    let dlhs = 4.0 * lhsval / denom;
    let drhs = (rhsval - yval) / denom - 1.0;
    let dy = -(rhsval - yval) / denom - 1.0;

    let mut row = RowPrep::new(RowSide::Right);
    match lhs {
        SmallLhs::Term(i) => add_form_term(&mut row, form, i, dlhs),
        SmallLhs::Constant => row.add_constant(dlhs * lhsval),
    }
    add_form_term(&mut row, form, n, drhs);
    row.add_term(y, dy);
    trace!("small cone violated by {}", f);
    Ok(row)
}

/// Gradient cut of `sqrt(γ + Σ t_i²) - t_n <= 0` at `point`.
pub(crate) fn gradient_cut(
    form: &SocForm,
    point: &[f64],
    settings: &Settings,
) -> std::result::Result<RowPrep, EstimateFailure> {
    let n = form.nterms() - 1;
    let norm = form.lhs_value(point);
    let f = norm - form.rhs_value(point);
    if f <= 0.0 {
        return Err(EstimateFailure::NotViolated);
    }
    if norm <= settings.epsilon {
        return Err(EstimateFailure::Numerics(format!("norm {:e} at cut point", norm)));
    }

    // Σ (t_i*/N)·t_i(x) - t_n(x) + γ/N <= 0
    let mut row = RowPrep::new(RowSide::Right);
    for i in 0..n {
        add_form_term(&mut row, form, i, form.term_value(i, point) / norm);
    }
    add_form_term(&mut row, form, n, -1.0);
    row.add_constant(form.constant() / norm);
    Ok(row)
}

/// Separation rounds done for an expression at the current node.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RoundCounter {
    node: Option<u64>,
    count: i32,
}

impl RoundCounter {
    /// Count a round at `node` if the limits allow it.
    pub(crate) fn admit(&mut self, node: SearchNode, cfg: &SocSettings) -> bool {
        let at_depth = match cfg.freq {
            f if f < 0 => false,
            0 => node.depth == 0,
            f => node.depth % f as u32 == 0,
        };
        if !at_depth {
            return false;
        }
        if self.node != Some(node.number) {
            self.node = Some(node.number);
            self.count = 0;
        }
        let limit = if node.depth == 0 {
            cfg.max_rounds_root
        } else {
            cfg.max_rounds
        };
        if limit >= 0 && self.count >= limit {
            return false;
        }
        self.count += 1;
        true
    }
}
