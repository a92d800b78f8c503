//! Canonical second-order cone.
//!
//! `sqrt(γ + Σ_{i<n} (v_i·x + β_i)²) <= v_n·x + β_n`, where `n = nterms - 1`.
//! The vectors `v_i` are the rows of a sparse transformation matrix over
//! [`SocForm::vars`].

use std::collections::HashMap;

use nalgebra_sparse::CsrMatrix;

use crate::error::Result;
use crate::problem::{Solution, VarId};
use crate::quad::LinExpr;
use crate::sparse::{csr_from_rows, csr_row_dot};

/// A second-order cone in canonical form.
#[derive(Debug, Clone)]
pub struct SocForm {
    vars: Vec<VarId>,
    offsets: Vec<f64>,
    transform: CsrMatrix<f64>,
    constant: f64,
}

impl SocForm {
    /// Number of terms, the right-hand side included.
    pub fn nterms(&self) -> usize {
        self.offsets.len()
    }

    pub fn nvars(&self) -> usize {
        self.vars.len()
    }

    /// Variables in order of first occurrence.
    pub fn vars(&self) -> &[VarId] {
        &self.vars
    }

    /// `β_i`, one per term.
    pub fn offsets(&self) -> &[f64] {
        &self.offsets
    }

    /// `γ`.
    pub fn constant(&self) -> f64 {
        self.constant
    }

    /// The `nterms × nvars` transformation.
    pub fn transform(&self) -> &CsrMatrix<f64> {
        &self.transform
    }

    /// Position of the first coefficient of each term in [`transcoefs`](Self::transcoefs).
    pub fn termbegins(&self) -> &[usize] {
        &self.transform.row_offsets()[..self.nterms()]
    }

    /// Nonzero coefficients of all terms, term by term.
    pub fn transcoefs(&self) -> &[f64] {
        self.transform.values()
    }

    /// Variable index (into [`vars`](Self::vars)) of each coefficient.
    pub fn transcoefsidx(&self) -> &[usize] {
        self.transform.col_indices()
    }

    /// Number of nonzero coefficients of each term.
    pub fn nnonzeroes(&self) -> Vec<usize> {
        self.transform
            .row_offsets()
            .windows(2)
            .map(|w| w[1] - w[0])
            .collect()
    }

    /// Term `i` as `(Σ coef·var, β_i)`.
    pub fn term(&self, i: usize) -> (Vec<(VarId, f64)>, f64) {
        let row = self.transform.row(i);
        let coefs = row
            .col_indices()
            .iter()
            .zip(row.values())
            .map(|(&c, &v)| (self.vars[c], v))
            .collect();
        (coefs, self.offsets[i])
    }

    /// Values of the form variables at `sol`.
    pub fn point(&self, sol: &Solution) -> Vec<f64> {
        self.vars.iter().map(|&v| sol.get(v)).collect()
    }

    /// `v_i·x + β_i` for a point from [`point`](Self::point).
    pub fn term_value(&self, i: usize, point: &[f64]) -> f64 {
        csr_row_dot(&self.transform, i, point) + self.offsets[i]
    }

    /// `sqrt(γ + Σ_{i<n} (v_i·x + β_i)²)`.
    pub fn lhs_value(&self, point: &[f64]) -> f64 {
        let squares: f64 = (0..self.nterms() - 1)
            .map(|i| self.term_value(i, point).powi(2))
            .sum();
        (self.constant + squares).sqrt()
    }

    pub fn rhs_value(&self, point: &[f64]) -> f64 {
        self.term_value(self.nterms() - 1, point)
    }

    /// `lhs - rhs` at `sol`; positive iff the point is outside the cone.
    pub fn violation(&self, sol: &Solution) -> f64 {
        let point = self.point(sol);
        self.lhs_value(&point) - self.rhs_value(&point)
    }
}

/// Collects the terms of a cone, left-hand side first.
#[derive(Debug, Default)]
pub(crate) struct SocFormBuilder {
    vars: Vec<VarId>,
    index: HashMap<VarId, usize>,
    rows: Vec<Vec<(usize, f64)>>,
    offsets: Vec<f64>,
    constant: f64,
}

impl SocFormBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append the term `scale * term`.
    pub(crate) fn push_term(&mut self, term: &LinExpr<VarId>, scale: f64) {
        let mut row = Vec::with_capacity(term.terms.len());
        for &(v, c) in &term.terms {
            let next = self.vars.len();
            let col = *self.index.entry(v).or_insert(next);
            if col == next {
                self.vars.push(v);
            }
            row.push((col, scale * c));
        }
        self.rows.push(row);
        self.offsets.push(scale * term.constant);
    }

    pub(crate) fn set_constant(&mut self, gamma: f64) {
        debug_assert!(gamma >= 0.0, "cone constant must be nonnegative");
        self.constant = gamma.max(0.0);
    }

    /// Finish the form. The last pushed term is the right-hand side.
    pub(crate) fn build(self, zero_tol: f64) -> Result<SocForm> {
        debug_assert!(self.rows.len() >= 2, "a cone needs a left and a right side");
        let transform = csr_from_rows(self.vars.len(), &self.rows, zero_tol)?;
        Ok(SocForm {
            vars: self.vars,
            offsets: self.offsets,
            transform,
            constant: self.constant,
        })
    }
}
