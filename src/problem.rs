//! Variable and row store.
//!
//! `Problem` owns the decision variables (original and auxiliary), the linear rows
//! installed by handlers, and rounding-lock bookkeeping. It is the minimal stand-in
//! for the surrounding solver that the expression layer and the handlers talk to.
//!
//! ```ignore
//! let mut problem = Problem::new();
//! let x = problem.add_var("x", -1.0, 1.0, VarKind::Continuous);
//! let w = problem.create_aux_var("w", 0.0, f64::INFINITY);
//! ```

use log::trace;

use crate::error::{NlError, Result};
use crate::interval::Interval;
use crate::rowprep::RowPrep;

/// Handle of a decision variable. Handles are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(u32);

impl VarId {
    /// Get the raw index value.
    pub fn raw(&self) -> u32 {
        self.0
    }

    pub(crate) fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Handle of an installed linear row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowId(u32);

impl RowId {
    /// Get the raw index value.
    pub fn raw(&self) -> u32 {
        self.0
    }
}

/// Variable type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VarKind {
    #[default]
    Continuous,
    Binary,
    Integer,
}

/// Data for a variable.
#[derive(Debug, Clone)]
pub struct VarData {
    /// Name for display.
    pub name: String,
    /// Lower bound (may be `-inf`).
    pub lb: f64,
    /// Upper bound (may be `inf`).
    pub ub: f64,
    /// Variable type.
    pub kind: VarKind,
    /// Created by the relaxation machinery rather than the user.
    pub is_aux: bool,
    locks_down: i32,
    locks_up: i32,
}

/// Bound queries, implemented by anything that knows variable domains.
pub trait VarBounds {
    /// Current domain of a variable.
    fn bounds(&self, var: VarId) -> Interval;
}

/// Store of variables and rows.
#[derive(Debug, Clone, Default)]
pub struct Problem {
    vars: Vec<Option<VarData>>,
    rows: Vec<Option<RowPrep>>,
}

impl Problem {
    /// Create an empty problem.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a variable.
    ///
    /// Binary variables have their bounds intersected with `[0, 1]`.
    pub fn add_var(&mut self, name: impl Into<String>, lb: f64, ub: f64, kind: VarKind) -> VarId {
        let (lb, ub) = match kind {
            VarKind::Binary => (lb.max(0.0), ub.min(1.0)),
            _ => (lb, ub),
        };
        self.push_var(VarData {
            name: name.into(),
            lb,
            ub,
            kind,
            is_aux: false,
            locks_down: 0,
            locks_up: 0,
        })
    }

    /// Create a continuous auxiliary variable.
    pub fn create_aux_var(&mut self, name: impl Into<String>, lb: f64, ub: f64) -> VarId {
        let name = name.into();
        trace!("creating auxiliary variable {} in [{}, {}]", name, lb, ub);
        self.push_var(VarData {
            name,
            lb,
            ub,
            kind: VarKind::Continuous,
            is_aux: true,
            locks_down: 0,
            locks_up: 0,
        })
    }

    fn push_var(&mut self, data: VarData) -> VarId {
        let id = VarId(self.vars.len() as u32);
        self.vars.push(Some(data));
        id
    }

    /// Release a variable. The handle stays invalid afterwards.
    pub fn release_var(&mut self, var: VarId) -> Result<()> {
        let slot = self
            .vars
            .get_mut(var.index())
            .ok_or_else(|| NlError::UnknownVariable(format!("x{}", var.raw())))?;
        match slot.take() {
            Some(data) => {
                trace!("released variable {}", data.name);
                Ok(())
            }
            None => Err(NlError::UnknownVariable(format!("x{} (released)", var.raw()))),
        }
    }

    /// Get the data of an active variable.
    pub fn var(&self, var: VarId) -> Result<&VarData> {
        self.vars
            .get(var.index())
            .and_then(|v| v.as_ref())
            .ok_or_else(|| NlError::UnknownVariable(format!("x{}", var.raw())))
    }

    fn var_mut(&mut self, var: VarId) -> Result<&mut VarData> {
        self.vars
            .get_mut(var.index())
            .and_then(|v| v.as_mut())
            .ok_or_else(|| NlError::UnknownVariable(format!("x{}", var.raw())))
    }

    /// Check if a handle refers to an active variable.
    pub fn is_active(&self, var: VarId) -> bool {
        matches!(self.vars.get(var.index()), Some(Some(_)))
    }

    /// Name of a variable, or a placeholder for released handles.
    pub fn var_name(&self, var: VarId) -> String {
        match self.var(var) {
            Ok(data) => data.name.clone(),
            Err(_) => format!("x{}", var.raw()),
        }
    }

    /// Change the bounds of a variable.
    pub fn set_bounds(&mut self, var: VarId, lb: f64, ub: f64) -> Result<()> {
        if lb.is_nan() || ub.is_nan() {
            return Err(NlError::NumericalError(format!(
                "NaN bound for variable x{}",
                var.raw()
            )));
        }
        let data = self.var_mut(var)?;
        data.lb = lb;
        data.ub = ub;
        Ok(())
    }

    /// Check if a variable is binary or integer.
    pub fn is_integral(&self, var: VarId) -> bool {
        matches!(
            self.var(var).map(|d| d.kind),
            Ok(VarKind::Binary) | Ok(VarKind::Integer)
        )
    }

    /// Number of variables that have not been released.
    pub fn n_active_vars(&self) -> usize {
        self.vars.iter().filter(|v| v.is_some()).count()
    }

    /// Iterate over active variables.
    pub fn vars(&self) -> impl Iterator<Item = (VarId, &VarData)> {
        self.vars
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.as_ref().map(|d| (VarId(i as u32), d)))
    }

    /// Add rounding locks (bookkeeping only).
    pub fn add_locks(&mut self, var: VarId, down: i32, up: i32) -> Result<()> {
        let data = self.var_mut(var)?;
        data.locks_down += down;
        data.locks_up += up;
        Ok(())
    }

    /// Current rounding locks `(down, up)`.
    pub fn locks(&self, var: VarId) -> Result<(i32, i32)> {
        self.var(var).map(|d| (d.locks_down, d.locks_up))
    }

    /// Install a row.
    pub fn add_row(&mut self, row: RowPrep) -> RowId {
        let id = RowId(self.rows.len() as u32);
        trace!("adding row {}", row.name);
        self.rows.push(Some(row));
        id
    }

    /// Remove a row, returning it.
    pub fn remove_row(&mut self, id: RowId) -> Result<RowPrep> {
        self.rows
            .get_mut(id.raw() as usize)
            .and_then(|r| r.take())
            .ok_or_else(|| NlError::InvalidExpression(format!("unknown row {}", id.raw())))
    }

    /// Get an installed row.
    pub fn row(&self, id: RowId) -> Option<&RowPrep> {
        self.rows.get(id.raw() as usize).and_then(|r| r.as_ref())
    }

    /// Iterate over installed rows.
    pub fn rows(&self) -> impl Iterator<Item = (RowId, &RowPrep)> {
        self.rows
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().map(|r| (RowId(i as u32), r)))
    }

    pub fn n_rows(&self) -> usize {
        self.rows.iter().filter(|r| r.is_some()).count()
    }
}

impl VarBounds for Problem {
    fn bounds(&self, var: VarId) -> Interval {
        match self.var(var) {
            Ok(data) => Interval::new(data.lb, data.ub),
            Err(_) => {
                debug_assert!(false, "bounds of released variable x{}", var.raw());
                Interval::entire()
            }
        }
    }
}

/// A point: values of variables by handle.
///
/// Variables without a stored value read as `0.0`.
#[derive(Debug, Clone, Default)]
pub struct Solution {
    values: Vec<f64>,
}

impl Solution {
    /// Create an empty solution (all zeros).
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a solution from `(variable, value)` pairs.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (VarId, f64)>) -> Self {
        let mut sol = Solution::new();
        for (var, value) in pairs {
            sol.set(var, value);
        }
        sol
    }

    pub fn set(&mut self, var: VarId, value: f64) {
        let i = var.index();
        if i >= self.values.len() {
            self.values.resize(i + 1, 0.0);
        }
        self.values[i] = value;
    }

    pub fn get(&self, var: VarId) -> f64 {
        self.values.get(var.index()).copied().unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_release() {
        let mut p = Problem::new();
        let x = p.add_var("x", -1.0, 2.0, VarKind::Continuous);
        let w = p.create_aux_var("w", 0.0, f64::INFINITY);
        assert_eq!(p.n_active_vars(), 2);
        assert!(p.var(w).unwrap().is_aux);
        assert!(!p.var(x).unwrap().is_aux);

        p.release_var(w).unwrap();
        assert_eq!(p.n_active_vars(), 1);
        assert!(!p.is_active(w));
        assert!(p.release_var(w).is_err());

        // handles are not reused
        let y = p.add_var("y", 0.0, 1.0, VarKind::Continuous);
        assert_ne!(y, w);
    }

    #[test]
    fn test_binary_bounds_clamped() {
        let mut p = Problem::new();
        let b = p.add_var("b", -5.0, 5.0, VarKind::Binary);
        assert_eq!(p.bounds(b), Interval::new(0.0, 1.0));
        assert!(p.is_integral(b));
    }

    #[test]
    fn test_locks() {
        let mut p = Problem::new();
        let x = p.add_var("x", 0.0, 1.0, VarKind::Continuous);
        p.add_locks(x, 1, 0).unwrap();
        p.add_locks(x, 0, 2).unwrap();
        assert_eq!(p.locks(x).unwrap(), (1, 2));
    }

    #[test]
    fn test_solution_defaults_to_zero() {
        let mut p = Problem::new();
        let x = p.add_var("x", 0.0, 1.0, VarKind::Continuous);
        let y = p.add_var("y", 0.0, 1.0, VarKind::Continuous);
        let sol = Solution::from_pairs([(y, 3.0)]);
        assert_eq!(sol.get(x), 0.0);
        assert_eq!(sol.get(y), 3.0);
    }
}
