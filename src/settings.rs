//! Settings and the string-keyed parameter registry.
//!
//! Every tunable lives in a typed field of [`Settings`]; the registry maps
//! slash-separated keys (e.g. `nlhdlr/soc/disaggregate`) onto those fields so that
//! callers can set them by name.

use std::fmt;

use crate::error::{NlError, Result};

/// Convex handler settings.
#[derive(Debug, Clone)]
pub struct ConvexSettings {
    /// Register the handler.
    pub enabled: bool,
    /// Registry priority.
    pub priority: i32,
    /// Run detection when the root is a sum with more than one child.
    pub detect_sum: bool,
    /// Require children of multi-child nodes to be linear, so that they end up
    /// as leaves of the carved expression.
    pub prefer_extended: bool,
    /// Use the signomial rule for products of powers.
    pub cvx_signomial: bool,
    /// Also handle carvings that reproduce the root with leaf children only.
    pub handle_trivial: bool,
}

impl Default for ConvexSettings {
    fn default() -> Self {
        ConvexSettings {
            enabled: true,
            priority: 50,
            detect_sum: false,
            prefer_extended: true,
            cvx_signomial: true,
            handle_trivial: false,
        }
    }
}

/// Second-order cone handler settings.
#[derive(Debug, Clone)]
pub struct SocSettings {
    /// Register the handler.
    pub enabled: bool,
    /// Registry priority.
    pub priority: i32,
    /// Use the eigen-decomposition matcher for general quadratics.
    pub comp_eigenvalues: bool,
    /// Disaggregate the cone into rotated 3-dimensional cones.
    pub disaggregate: bool,
    /// Minimal efficacy of a cut.
    pub min_efficacy: f64,
    /// Separation rounds per node at the root (-1 = unlimited).
    pub max_rounds_root: i32,
    /// Separation rounds per node below the root (-1 = unlimited).
    pub max_rounds: i32,
    /// Separate at depths divisible by this (0 = root only, -1 = never).
    pub freq: i32,
}

impl Default for SocSettings {
    fn default() -> Self {
        SocSettings {
            enabled: true,
            priority: 100,
            comp_eigenvalues: true,
            disaggregate: true,
            min_efficacy: 1e-5,
            max_rounds_root: -1,
            max_rounds: 10,
            freq: 1,
        }
    }
}

/// All settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub convex: ConvexSettings,
    pub soc: SocSettings,
    /// Feasibility tolerance.
    pub feastol: f64,
    /// Zero tolerance.
    pub epsilon: f64,
    /// Values with absolute value at or above this are infinite.
    pub infinity: f64,
    /// Maximal ratio between largest and smallest cut coefficient.
    pub max_coef_ratio: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            convex: ConvexSettings::default(),
            soc: SocSettings::default(),
            feastol: 1e-6,
            epsilon: 1e-9,
            infinity: 1e20,
            max_coef_ratio: 1e7,
        }
    }
}

/// Value of a parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Real(f64),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{}", b),
            ParamValue::Int(i) => write!(f, "{}", i),
            ParamValue::Real(r) => write!(f, "{}", r),
        }
    }
}

/// Registered parameter keys with a short description.
const PARAMS: &[(&str, &str)] = &[
    ("nlhdlr/convex/enabled", "register the convex handler"),
    ("nlhdlr/convex/priority", "registry priority of the convex handler"),
    ("nlhdlr/convex/detectsum", "run detection when the root is a sum with more than one child"),
    ("nlhdlr/convex/preferextended", "force linear children of multi-child nodes"),
    ("nlhdlr/convex/cvxsignomial", "use the signomial rule"),
    ("nlhdlr/convex/handletrivial", "also handle trivial carvings"),
    ("nlhdlr/soc/enabled", "register the SOC handler"),
    ("nlhdlr/soc/priority", "registry priority of the SOC handler"),
    ("nlhdlr/soc/compeigenvalues", "use the eigen-decomposition matcher"),
    ("nlhdlr/soc/disaggregate", "disaggregate cones"),
    ("nlhdlr/soc/minefficacy", "minimal cut efficacy"),
    ("nlhdlr/soc/maxroundsroot", "separation rounds per node at the root (-1 = unlimited)"),
    ("nlhdlr/soc/maxrounds", "separation rounds per node below the root (-1 = unlimited)"),
    ("nlhdlr/soc/freq", "separate at depths divisible by freq (0 = root only)"),
    ("numerics/feastol", "feasibility tolerance"),
    ("numerics/epsilon", "zero tolerance"),
    ("numerics/infinity", "values at or above are infinite"),
    ("separating/maxcoefratio", "maximal cut coefficient range"),
];

fn expect_bool(key: &str, value: ParamValue) -> Result<bool> {
    match value {
        ParamValue::Bool(b) => Ok(b),
        other => Err(NlError::InvalidParameter {
            name: key.to_string(),
            reason: format!("expected bool, got {}", other),
        }),
    }
}

fn expect_int(key: &str, value: ParamValue, min: i64, max: i64) -> Result<i32> {
    match value {
        ParamValue::Int(i) if i >= min && i <= max => Ok(i as i32),
        ParamValue::Int(i) => Err(NlError::InvalidParameter {
            name: key.to_string(),
            reason: format!("{} not in [{}, {}]", i, min, max),
        }),
        other => Err(NlError::InvalidParameter {
            name: key.to_string(),
            reason: format!("expected integer, got {}", other),
        }),
    }
}

/// Integers are accepted for real parameters.
fn expect_real(key: &str, value: ParamValue, min: f64, min_inclusive: bool) -> Result<f64> {
    let r = match value {
        ParamValue::Real(r) => r,
        ParamValue::Int(i) => i as f64,
        ParamValue::Bool(_) => {
            return Err(NlError::InvalidParameter {
                name: key.to_string(),
                reason: format!("expected real, got {}", value),
            })
        }
    };
    let ok = if min_inclusive { r >= min } else { r > min };
    if !ok || r.is_nan() {
        return Err(NlError::InvalidParameter {
            name: key.to_string(),
            reason: format!("{} out of range", r),
        });
    }
    Ok(r)
}

impl Settings {
    /// Registered parameter keys and descriptions.
    pub fn params() -> &'static [(&'static str, &'static str)] {
        PARAMS
    }

    /// Get a parameter by key.
    pub fn get_param(&self, key: &str) -> Result<ParamValue> {
        use ParamValue::*;
        let value = match key {
            "nlhdlr/convex/enabled" => Bool(self.convex.enabled),
            "nlhdlr/convex/priority" => Int(self.convex.priority as i64),
            "nlhdlr/convex/detectsum" => Bool(self.convex.detect_sum),
            "nlhdlr/convex/preferextended" => Bool(self.convex.prefer_extended),
            "nlhdlr/convex/cvxsignomial" => Bool(self.convex.cvx_signomial),
            "nlhdlr/convex/handletrivial" => Bool(self.convex.handle_trivial),
            "nlhdlr/soc/enabled" => Bool(self.soc.enabled),
            "nlhdlr/soc/priority" => Int(self.soc.priority as i64),
            "nlhdlr/soc/compeigenvalues" => Bool(self.soc.comp_eigenvalues),
            "nlhdlr/soc/disaggregate" => Bool(self.soc.disaggregate),
            "nlhdlr/soc/minefficacy" => Real(self.soc.min_efficacy),
            "nlhdlr/soc/maxroundsroot" => Int(self.soc.max_rounds_root as i64),
            "nlhdlr/soc/maxrounds" => Int(self.soc.max_rounds as i64),
            "nlhdlr/soc/freq" => Int(self.soc.freq as i64),
            "numerics/feastol" => Real(self.feastol),
            "numerics/epsilon" => Real(self.epsilon),
            "numerics/infinity" => Real(self.infinity),
            "separating/maxcoefratio" => Real(self.max_coef_ratio),
            _ => return Err(NlError::UnknownParameter(key.to_string())),
        };
        Ok(value)
    }

    /// Set a parameter by key.
    pub fn set_param(&mut self, key: &str, value: ParamValue) -> Result<()> {
        let prio = (i32::MIN as i64, i32::MAX as i64);
        match key {
            "nlhdlr/convex/enabled" => self.convex.enabled = expect_bool(key, value)?,
            "nlhdlr/convex/priority" => {
                self.convex.priority = expect_int(key, value, prio.0, prio.1)?
            }
            "nlhdlr/convex/detectsum" => self.convex.detect_sum = expect_bool(key, value)?,
            "nlhdlr/convex/preferextended" => {
                self.convex.prefer_extended = expect_bool(key, value)?
            }
            "nlhdlr/convex/cvxsignomial" => self.convex.cvx_signomial = expect_bool(key, value)?,
            "nlhdlr/convex/handletrivial" => {
                self.convex.handle_trivial = expect_bool(key, value)?
            }
            "nlhdlr/soc/enabled" => self.soc.enabled = expect_bool(key, value)?,
            "nlhdlr/soc/priority" => self.soc.priority = expect_int(key, value, prio.0, prio.1)?,
            "nlhdlr/soc/compeigenvalues" => self.soc.comp_eigenvalues = expect_bool(key, value)?,
            "nlhdlr/soc/disaggregate" => self.soc.disaggregate = expect_bool(key, value)?,
            "nlhdlr/soc/minefficacy" => self.soc.min_efficacy = expect_real(key, value, 0.0, true)?,
            "nlhdlr/soc/maxroundsroot" => {
                self.soc.max_rounds_root = expect_int(key, value, -1, i32::MAX as i64)?
            }
            "nlhdlr/soc/maxrounds" => {
                self.soc.max_rounds = expect_int(key, value, -1, i32::MAX as i64)?
            }
            "nlhdlr/soc/freq" => self.soc.freq = expect_int(key, value, -1, 65534)?,
            "numerics/feastol" => self.feastol = expect_real(key, value, 0.0, false)?,
            "numerics/epsilon" => self.epsilon = expect_real(key, value, 0.0, false)?,
            "numerics/infinity" => self.infinity = expect_real(key, value, 1.0, true)?,
            "separating/maxcoefratio" => {
                self.max_coef_ratio = expect_real(key, value, 1.0, true)?
            }
            _ => return Err(NlError::UnknownParameter(key.to_string())),
        }
        Ok(())
    }

    /// Check if a value is treated as infinite.
    pub fn is_infinity(&self, value: f64) -> bool {
        value.abs() >= self.infinity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_registry() {
        let s = Settings::default();
        assert_eq!(s.get_param("nlhdlr/soc/priority").unwrap(), ParamValue::Int(100));
        assert_eq!(s.get_param("nlhdlr/convex/priority").unwrap(), ParamValue::Int(50));
        assert_eq!(
            s.get_param("nlhdlr/convex/detectsum").unwrap(),
            ParamValue::Bool(false)
        );
        for (key, _) in Settings::params() {
            assert!(s.get_param(key).is_ok(), "{} not readable", key);
        }
    }

    #[test]
    fn test_set_param() {
        let mut s = Settings::default();
        s.set_param("nlhdlr/soc/disaggregate", ParamValue::Bool(false)).unwrap();
        assert!(!s.soc.disaggregate);
        s.set_param("nlhdlr/soc/minefficacy", ParamValue::Int(1)).unwrap();
        assert_eq!(s.soc.min_efficacy, 1.0);
    }

    #[test]
    fn test_set_param_errors() {
        let mut s = Settings::default();
        assert!(matches!(
            s.set_param("nlhdlr/foo", ParamValue::Bool(true)),
            Err(NlError::UnknownParameter(_))
        ));
        assert!(matches!(
            s.set_param("nlhdlr/soc/maxrounds", ParamValue::Int(-5)),
            Err(NlError::InvalidParameter { .. })
        ));
        assert!(matches!(
            s.set_param("numerics/feastol", ParamValue::Bool(true)),
            Err(NlError::InvalidParameter { .. })
        ));
    }
}
