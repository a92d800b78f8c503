//! Interval arithmetic.
//!
//! Intervals are closed, possibly unbounded (`±f64::INFINITY`) and possibly empty.
//! An interval is empty iff `lo > hi`. No outward rounding is performed.

use std::fmt;

/// A closed interval `[lo, hi]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interval {
    /// Lower end.
    pub lo: f64,
    /// Upper end.
    pub hi: f64,
}

/// `0 * inf = 0` for bound products, as usual in interval arithmetic.
fn mul_bound(a: f64, b: f64) -> f64 {
    if a == 0.0 || b == 0.0 {
        0.0
    } else {
        a * b
    }
}

fn entropy_at(x: f64) -> f64 {
    if x == 0.0 {
        0.0
    } else if x.is_infinite() {
        f64::NEG_INFINITY
    } else {
        -x * x.ln()
    }
}

impl Interval {
    /// Create an interval from its ends.
    pub fn new(lo: f64, hi: f64) -> Self {
        debug_assert!(!lo.is_nan() && !hi.is_nan(), "interval ends must not be NaN");
        Interval { lo, hi }
    }

    /// The degenerate interval `[v, v]`.
    pub fn point(v: f64) -> Self {
        Interval { lo: v, hi: v }
    }

    /// `(-inf, inf)`.
    pub fn entire() -> Self {
        Interval {
            lo: f64::NEG_INFINITY,
            hi: f64::INFINITY,
        }
    }

    /// The empty interval.
    pub fn empty() -> Self {
        Interval {
            lo: f64::INFINITY,
            hi: f64::NEG_INFINITY,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lo > self.hi
    }

    pub fn is_entire(&self) -> bool {
        self.lo == f64::NEG_INFINITY && self.hi == f64::INFINITY
    }

    pub fn contains(&self, v: f64) -> bool {
        self.lo <= v && v <= self.hi
    }

    /// Check if every element is `>= 0` (false for the empty interval).
    pub fn is_nonneg(&self) -> bool {
        !self.is_empty() && self.lo >= 0.0
    }

    /// Check if every element is `<= 0` (false for the empty interval).
    pub fn is_nonpos(&self) -> bool {
        !self.is_empty() && self.hi <= 0.0
    }

    pub fn neg(self) -> Self {
        if self.is_empty() {
            return self;
        }
        Interval::new(-self.hi, -self.lo)
    }

    pub fn add(self, other: Interval) -> Self {
        if self.is_empty() || other.is_empty() {
            return Interval::empty();
        }
        Interval::new(self.lo + other.lo, self.hi + other.hi)
    }

    pub fn sub(self, other: Interval) -> Self {
        self.add(other.neg())
    }

    /// Multiply by a scalar.
    pub fn scale(self, c: f64) -> Self {
        if self.is_empty() {
            return self;
        }
        if c == 0.0 {
            Interval::point(0.0)
        } else if c > 0.0 {
            Interval::new(mul_bound(c, self.lo), mul_bound(c, self.hi))
        } else {
            Interval::new(mul_bound(c, self.hi), mul_bound(c, self.lo))
        }
    }

    pub fn mul(self, other: Interval) -> Self {
        if self.is_empty() || other.is_empty() {
            return Interval::empty();
        }
        let corners = [
            mul_bound(self.lo, other.lo),
            mul_bound(self.lo, other.hi),
            mul_bound(self.hi, other.lo),
            mul_bound(self.hi, other.hi),
        ];
        let lo = corners.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = corners.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Interval::new(lo, hi)
    }

    /// Power `x^p`.
    ///
    /// Fractional exponents are only defined for `x >= 0`, so the negative part of
    /// the argument is cut off before evaluating.
    pub fn pow(self, p: f64) -> Self {
        if self.is_empty() {
            return self;
        }
        if p == 0.0 {
            return Interval::point(1.0);
        }
        if p.fract() == 0.0 && p.abs() < i32::MAX as f64 {
            return self.powi(p as i32);
        }

        // fractional exponent
        let lo = self.lo.max(0.0);
        if self.hi < 0.0 {
            return Interval::empty();
        }
        if p > 0.0 {
            Interval::new(lo.powf(p), self.hi.powf(p))
        } else if lo == 0.0 {
            Interval::new(self.hi.powf(p), f64::INFINITY)
        } else {
            Interval::new(self.hi.powf(p), lo.powf(p))
        }
    }

    fn powi(self, n: i32) -> Self {
        let even = n % 2 == 0;
        if n > 0 {
            if !even {
                return Interval::new(self.lo.powi(n), self.hi.powi(n));
            }
            if self.lo >= 0.0 {
                Interval::new(self.lo.powi(n), self.hi.powi(n))
            } else if self.hi <= 0.0 {
                Interval::new(self.hi.powi(n), self.lo.powi(n))
            } else {
                Interval::new(0.0, self.lo.powi(n).max(self.hi.powi(n)))
            }
        } else if self.lo > 0.0 || (self.lo == 0.0 && self.hi > 0.0) {
            // decreasing on the positive axis
            let hi = if self.lo == 0.0 {
                f64::INFINITY
            } else {
                self.lo.powi(n)
            };
            Interval::new(self.hi.powi(n), hi)
        } else if self.hi < 0.0 || (self.hi == 0.0 && self.lo < 0.0) {
            let at_hi = if self.hi == 0.0 {
                if even {
                    f64::INFINITY
                } else {
                    f64::NEG_INFINITY
                }
            } else {
                self.hi.powi(n)
            };
            let at_lo = self.lo.powi(n);
            if even {
                Interval::new(at_lo, at_hi)
            } else {
                Interval::new(at_hi, at_lo)
            }
        } else if self.lo == 0.0 && self.hi == 0.0 {
            Interval::empty()
        } else if even {
            Interval::new(0.0, f64::INFINITY)
        } else {
            Interval::entire()
        }
    }

    pub fn sqrt(self) -> Self {
        self.pow(0.5)
    }

    pub fn exp(self) -> Self {
        if self.is_empty() {
            return self;
        }
        Interval::new(self.lo.exp(), self.hi.exp())
    }

    pub fn log(self) -> Self {
        if self.is_empty() || self.hi <= 0.0 {
            return Interval::empty();
        }
        Interval::new(self.lo.max(0.0).ln(), self.hi.ln())
    }

    pub fn abs(self) -> Self {
        if self.is_empty() {
            return self;
        }
        if self.lo >= 0.0 {
            self
        } else if self.hi <= 0.0 {
            self.neg()
        } else {
            Interval::new(0.0, (-self.lo).max(self.hi))
        }
    }

    /// Entropy `-x ln(x)`, defined for `x >= 0`, maximal at `x = 1/e`.
    pub fn entropy(self) -> Self {
        if self.is_empty() || self.hi < 0.0 {
            return Interval::empty();
        }
        let lo = self.lo.max(0.0);
        let peak = (-1.0f64).exp();
        if self.hi <= peak {
            Interval::new(entropy_at(lo), entropy_at(self.hi))
        } else if lo >= peak {
            Interval::new(entropy_at(self.hi), entropy_at(lo))
        } else {
            Interval::new(entropy_at(lo).min(entropy_at(self.hi)), peak)
        }
    }

    /// Smallest interval containing both.
    pub fn union(self, other: Interval) -> Self {
        if self.is_empty() {
            return other;
        }
        if other.is_empty() {
            return self;
        }
        Interval::new(self.lo.min(other.lo), self.hi.max(other.hi))
    }

    pub fn intersect(self, other: Interval) -> Self {
        Interval {
            lo: self.lo.max(other.lo),
            hi: self.hi.min(other.hi),
        }
    }
}

impl Default for Interval {
    fn default() -> Self {
        Interval::entire()
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "[empty]")
        } else {
            write!(f, "[{}, {}]", self.lo, self.hi)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mul_with_infinity() {
        let a = Interval::new(0.0, f64::INFINITY);
        let b = Interval::new(0.0, 2.0);
        assert_eq!(a.mul(b), Interval::new(0.0, f64::INFINITY));
        assert_eq!(Interval::point(0.0).mul(Interval::entire()), Interval::point(0.0));
    }

    #[test]
    fn test_sub_and_sign() {
        let d = Interval::new(1.0, 3.0).sub(Interval::new(0.0, 1.0));
        assert_eq!(d, Interval::new(0.0, 3.0));
        assert!(d.is_nonneg());
        assert!(!d.is_nonpos());
        assert!(d.neg().is_nonpos());
        assert!(!Interval::empty().is_nonneg());
    }

    #[test]
    fn test_even_power_straddling_zero() {
        let x = Interval::new(-3.0, 2.0);
        assert_eq!(x.pow(2.0), Interval::new(0.0, 9.0));
        assert_eq!(x.pow(3.0), Interval::new(-27.0, 8.0));
    }

    #[test]
    fn test_negative_power() {
        assert_eq!(Interval::new(1.0, 4.0).pow(-1.0), Interval::new(0.25, 1.0));
        assert_eq!(Interval::new(0.0, 4.0).pow(-1.0), Interval::new(0.25, f64::INFINITY));
        assert!(Interval::new(-1.0, 1.0).pow(-1.0).is_entire());
        assert_eq!(Interval::new(-2.0, -1.0).pow(-2.0), Interval::new(0.25, 1.0));
    }

    #[test]
    fn test_fractional_power_cuts_domain() {
        let x = Interval::new(-4.0, 9.0);
        assert_eq!(x.sqrt(), Interval::new(0.0, 3.0));
        assert!(Interval::new(-4.0, -1.0).sqrt().is_empty());
    }

    #[test]
    fn test_log_and_exp() {
        let x = Interval::new(-1.0, 1.0);
        assert_eq!(x.log().lo, f64::NEG_INFINITY);
        assert_eq!(x.log().hi, 0.0);
        assert!(Interval::new(-2.0, -1.0).log().is_empty());
        assert_eq!(Interval::new(0.0, 0.0).exp(), Interval::point(1.0));
    }

    #[test]
    fn test_abs_and_entropy() {
        assert_eq!(Interval::new(-3.0, 2.0).abs(), Interval::new(0.0, 3.0));
        let e = Interval::new(0.0, 1.0).entropy();
        assert_eq!(e.lo, 0.0);
        assert!((e.hi - (-1.0f64).exp()).abs() < 1e-12);
    }

    #[test]
    fn test_empty_propagates() {
        let e = Interval::empty();
        assert!(e.add(Interval::point(1.0)).is_empty());
        assert!(e.mul(Interval::entire()).is_empty());
        assert_eq!(e.union(Interval::point(2.0)), Interval::point(2.0));
        assert!(Interval::new(0.0, 1.0).intersect(Interval::new(2.0, 3.0)).is_empty());
    }
}
