//! Convexity analysis.
//!
//! This module provides:
//! - Curvature tracking (convex, concave, linear) with forward and inverse
//!   composition rules, including the signomial rule for products of powers
//! - Sign tracking (non-negative, non-positive, unknown) from intervals

pub mod curvature;
pub mod sign;

pub use curvature::{
    add_curvature, compose, compose_inverse, monomial_inverse, pow_shape, scalar_mul_curvature,
    Curvature, Monotonicity,
};
pub use sign::Sign;

pub(crate) use curvature::monomial_factors;
