//! Sign tracking.
//!
//! Signs are derived from intervals (activities or variable domains). They decide
//! which branch of a composition rule applies, e.g. whether `x^3` is convex.

use crate::expr::{ExprGraph, ExprId};
use crate::interval::Interval;

/// Sign of an expression over a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sign {
    Nonnegative,
    Nonpositive,
    /// Identically zero.
    Zero,
    Unknown,
}

impl Sign {
    /// Sign of every element of an interval. Empty intervals have unknown sign.
    pub fn of_interval(iv: Interval) -> Self {
        if iv.is_empty() {
            Sign::Unknown
        } else if iv.lo == 0.0 && iv.hi == 0.0 {
            Sign::Zero
        } else if iv.lo >= 0.0 {
            Sign::Nonnegative
        } else if iv.hi <= 0.0 {
            Sign::Nonpositive
        } else {
            Sign::Unknown
        }
    }
}

impl ExprGraph {
    /// Sign of an expression according to its last computed activity.
    pub fn sign(&self, expr: ExprId) -> Sign {
        Sign::of_interval(self.activity(expr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problem::{Problem, VarKind};

    #[test]
    fn test_of_interval() {
        assert_eq!(Sign::of_interval(Interval::new(0.0, 2.0)), Sign::Nonnegative);
        assert_eq!(Sign::of_interval(Interval::new(-2.0, 0.0)), Sign::Nonpositive);
        assert_eq!(Sign::of_interval(Interval::point(0.0)), Sign::Zero);
        assert_eq!(Sign::of_interval(Interval::new(-1.0, 1.0)), Sign::Unknown);
        assert_eq!(Sign::of_interval(Interval::empty()), Sign::Unknown);
    }

    #[test]
    fn test_sign_follows_activity() {
        let mut p = Problem::new();
        let xv = p.add_var("x", 1.0, 2.0, VarKind::Continuous);
        let mut g = ExprGraph::new();
        let x = g.var(xv);
        let l = g.log(x).unwrap();
        let n = g.sum(&[-1.0], &[l], 0.0).unwrap();
        g.evaluate_interval(n, &p, 0, 0.0);
        assert_eq!(g.sign(l), Sign::Nonnegative);
        assert_eq!(g.sign(n), Sign::Nonpositive);
    }
}
