//! Cut accumulator.
//!
//! A [`RowPrep`] collects `(variable, coefficient)` pairs and a constant for a
//! linear inequality `Σ coef·var + constant <= 0` (side [`RowSide::Right`]) or
//! `>= 0` (side [`RowSide::Left`]). Handlers build one, [`RowPrep::cleanup`]
//! makes it numerically acceptable, and the problem installs it as a row.

use std::collections::BTreeMap;
use std::fmt;

use log::trace;

use crate::problem::{Solution, VarBounds, VarId};
use crate::settings::Settings;

/// Side of the inequality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowSide {
    /// `Σ coef·var + constant >= 0`.
    Left,
    /// `Σ coef·var + constant <= 0`.
    Right,
}

/// An in-progress linear inequality.
#[derive(Debug, Clone)]
pub struct RowPrep {
    pub terms: Vec<(VarId, f64)>,
    pub constant: f64,
    pub side: RowSide,
    pub name: String,
    /// Only valid in the current subtree.
    pub local: bool,
}

impl RowPrep {
    pub fn new(side: RowSide) -> Self {
        RowPrep {
            terms: Vec::new(),
            constant: 0.0,
            side,
            name: String::new(),
            local: false,
        }
    }

    /// Set the name (builder style).
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn add_term(&mut self, var: VarId, coef: f64) {
        if coef != 0.0 {
            self.terms.push((var, coef));
        }
    }

    pub fn add_constant(&mut self, constant: f64) {
        self.constant += constant;
    }

    /// Coefficient of a variable (summing duplicates).
    pub fn coef(&self, var: VarId) -> f64 {
        self.terms
            .iter()
            .filter(|(v, _)| *v == var)
            .map(|(_, c)| c)
            .sum()
    }

    /// Activity `Σ coef·var + constant` at a point.
    pub fn evaluate(&self, sol: &Solution) -> f64 {
        self.terms
            .iter()
            .map(|(v, c)| c * sol.get(*v))
            .sum::<f64>()
            + self.constant
    }

    /// Amount by which the point violates the row (0 if satisfied).
    pub fn violation(&self, sol: &Solution) -> f64 {
        let activity = self.evaluate(sol);
        match self.side {
            RowSide::Right => activity.max(0.0),
            RowSide::Left => (-activity).max(0.0),
        }
    }

    /// Violation divided by the Euclidean norm of the coefficients.
    pub fn efficacy(&self, sol: &Solution) -> f64 {
        let norm = self.terms.iter().map(|(_, c)| c * c).sum::<f64>().sqrt();
        let violation = self.violation(sol);
        if norm == 0.0 {
            violation
        } else {
            violation / norm
        }
    }

    /// Check if the point satisfies the row within `tol`.
    pub fn is_satisfied(&self, sol: &Solution, tol: f64) -> bool {
        self.violation(sol) <= tol
    }

    /// Merge duplicate variables and drop zero coefficients. Terms end up sorted by variable.
    pub fn merge(&mut self) {
        let mut merged: BTreeMap<VarId, f64> = BTreeMap::new();
        for (v, c) in self.terms.drain(..) {
            *merged.entry(v).or_insert(0.0) += c;
        }
        self.terms = merged.into_iter().filter(|(_, c)| *c != 0.0).collect();
    }

    /// Multiply the row by a positive factor.
    pub fn scale(&mut self, factor: f64) {
        debug_assert!(factor > 0.0);
        for (_, c) in &mut self.terms {
            *c *= factor;
        }
        self.constant *= factor;
    }

    /// Remove the term at `pos` by moving its worst-case contribution over the
    /// variable's domain into the constant. Fails if that bound is infinite.
    fn relax_term(&mut self, pos: usize, bounds: &impl VarBounds, settings: &Settings) -> bool {
        let (var, coef) = self.terms[pos];
        let dom = bounds.bounds(var);
        // Right side needs the smallest value of coef*var, left side the largest
        let want_lower = (self.side == RowSide::Right) == (coef > 0.0);
        let bound = if want_lower { dom.lo } else { dom.hi };
        if settings.is_infinity(bound) {
            return false;
        }
        self.constant += coef * bound;
        self.terms.remove(pos);
        true
    }

    /// Make the row numerically acceptable.
    ///
    /// Merges duplicates, removes coefficients below `epsilon` (relaxing with
    /// variable bounds), relaxes the smallest coefficients while the range exceeds
    /// `max_coef_ratio`, and finally scales by a power of two so that the largest
    /// coefficient lies in `[1, 2)`. Returns false if the row had to be given up.
    pub fn cleanup(&mut self, bounds: &impl VarBounds, settings: &Settings) -> bool {
        self.merge();

        if self.constant.is_nan() || self.terms.iter().any(|(_, c)| !c.is_finite()) {
            trace!("rowprep {}: non-finite coefficient", self.name);
            return false;
        }

        // tiny coefficients
        let mut i = 0;
        while i < self.terms.len() {
            if self.terms[i].1.abs() <= settings.epsilon {
                if !self.relax_term(i, bounds, settings) {
                    // cannot relax, keep as is; range check below decides
                    i += 1;
                }
            } else {
                i += 1;
            }
        }

        // coefficient range
        loop {
            let Some(max) = self.terms.iter().map(|(_, c)| c.abs()).reduce(f64::max) else {
                break;
            };
            let (min_pos, min) = self
                .terms
                .iter()
                .enumerate()
                .map(|(i, (_, c))| (i, c.abs()))
                .fold((0, f64::INFINITY), |acc, x| if x.1 < acc.1 { x } else { acc });
            if max / min <= settings.max_coef_ratio {
                break;
            }
            if !self.relax_term(min_pos, bounds, settings) {
                trace!(
                    "rowprep {}: coefficient range {:e} too large",
                    self.name,
                    max / min
                );
                return false;
            }
        }

        if settings.is_infinity(self.constant) {
            trace!("rowprep {}: infinite constant", self.name);
            return false;
        }

        if let Some(max) = self.terms.iter().map(|(_, c)| c.abs()).reduce(f64::max) {
            let exponent = max.log2().floor();
            if exponent != 0.0 && exponent.is_finite() {
                self.scale((-exponent).exp2());
            }
        }
        true
    }
}

impl fmt::Display for RowPrep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.name.is_empty() {
            write!(f, "{}: ", self.name)?;
        }
        for (i, (v, c)) in self.terms.iter().enumerate() {
            if i > 0 {
                write!(f, " {} ", if *c < 0.0 { "-" } else { "+" })?;
                write!(f, "{}*x{}", c.abs(), v.raw())?;
            } else {
                write!(f, "{}*x{}", c, v.raw())?;
            }
        }
        let op = match self.side {
            RowSide::Right => "<=",
            RowSide::Left => ">=",
        };
        write!(f, " {} {}", op, -self.constant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problem::{Problem, VarKind};

    const TOL: f64 = 1e-12;

    #[test]
    fn test_violation_and_efficacy() {
        let mut p = Problem::new();
        let x = p.add_var("x", 0.0, 10.0, VarKind::Continuous);
        let y = p.add_var("y", 0.0, 10.0, VarKind::Continuous);

        // 3x + 4y - 5 <= 0
        let mut row = RowPrep::new(RowSide::Right);
        row.add_term(x, 3.0);
        row.add_term(y, 4.0);
        row.add_constant(-5.0);

        let sol = Solution::from_pairs([(x, 1.0), (y, 1.0)]);
        assert!((row.violation(&sol) - 2.0).abs() < TOL);
        assert!((row.efficacy(&sol) - 0.4).abs() < TOL);

        let sol = Solution::from_pairs([(x, 1.0), (y, 0.0)]);
        assert_eq!(row.violation(&sol), 0.0);
    }

    #[test]
    fn test_merge() {
        let mut p = Problem::new();
        let x = p.add_var("x", 0.0, 1.0, VarKind::Continuous);
        let y = p.add_var("y", 0.0, 1.0, VarKind::Continuous);
        let mut row = RowPrep::new(RowSide::Left);
        row.add_term(y, 1.0);
        row.add_term(x, 2.0);
        row.add_term(y, -1.0);
        row.merge();
        assert_eq!(row.terms, vec![(x, 2.0)]);
    }

    #[test]
    fn test_cleanup_relaxes_tiny_coefficient() {
        let mut p = Problem::new();
        let x = p.add_var("x", 0.0, 1.0, VarKind::Continuous);
        let y = p.add_var("y", -2.0, 3.0, VarKind::Continuous);
        let settings = Settings::default();

        // x + 1e-12 y - 0.5 <= 0  ->  x + 1e-12 * (-2) - 0.5 <= 0
        let mut row = RowPrep::new(RowSide::Right);
        row.add_term(x, 1.0);
        row.add_term(y, 1e-12);
        row.add_constant(-0.5);
        assert!(row.cleanup(&p, &settings));
        assert_eq!(row.terms.len(), 1);
        assert!((row.constant - (-0.5 - 2e-12)).abs() < TOL);
    }

    #[test]
    fn test_cleanup_rejects_bad_range_on_unbounded_var() {
        let mut p = Problem::new();
        let x = p.add_var("x", 0.0, 1.0, VarKind::Continuous);
        let y = p.add_var("y", f64::NEG_INFINITY, f64::INFINITY, VarKind::Continuous);
        let settings = Settings::default();

        let mut row = RowPrep::new(RowSide::Right);
        row.add_term(x, 1e9);
        row.add_term(y, 1.0);
        assert!(!row.cleanup(&p, &settings));
    }

    #[test]
    fn test_cleanup_scales_by_power_of_two() {
        let mut p = Problem::new();
        let x = p.add_var("x", 0.0, 1.0, VarKind::Continuous);
        let settings = Settings::default();

        let mut row = RowPrep::new(RowSide::Right);
        row.add_term(x, 12.0);
        row.add_constant(-3.0);
        assert!(row.cleanup(&p, &settings));
        assert_eq!(row.terms, vec![(x, 1.5)]);
        assert_eq!(row.constant, -0.375);
    }
}
