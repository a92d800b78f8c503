//! # nlrelax
//!
//! Expression DAGs and nonlinear handlers for cutting-plane relaxations of
//! nonlinear constraints.
//!
//! nlrelax represents constraint functions as reference-counted expression
//! DAGs, recognizes structure in them through pluggable nonlinear handlers and
//! turns that structure into linear cuts at a given point.
//!
//! ## Quick Start
//!
//! ```ignore
//! use nlrelax::prelude::*;
//!
//! let mut model = Model::new(Settings::default());
//! let x = model.problem.add_var("x", -2.0, 2.0, VarKind::Continuous);
//! let y = model.problem.add_var("y", -2.0, 2.0, VarKind::Continuous);
//!
//! // x^2 + y^2 <= 1
//! let (xn, yn) = (model.graph.var(x), model.graph.var(y));
//! let sx = model.graph.square(xn)?;
//! let sy = model.graph.square(yn)?;
//! let disk = model.graph.sum(&[1.0, 1.0], &[sx, sy], 0.0)?;
//! model.add_constraint("disk", disk, f64::NEG_INFINITY, 1.0)?;
//!
//! model.detect()?;
//! let point = model.extend_solution(&Solution::from_pairs([(x, 2.0), (y, 0.0)]));
//! let result = model.enforce(&point, SearchNode::ROOT)?;
//! println!("{} cuts", result.cuts.len());
//! ```
//!
//! ## Handlers
//!
//! - **convex**: carves the largest convex (concave) part of an expression
//!   using curvature rules, including the signomial rule for products of
//!   powers, and separates it with tangents
//! - **soc**: recognizes second-order cones in norms and quadratic constraints,
//!   disaggregates them into rotated three-dimensional cones and separates
//!   those
//!
//! ## Architecture
//!
//! - **Expression DAG** in an arena addressed by generation-checked handles
//! - **Memoized evaluation** of values, intervals and gradients, keyed by tags
//! - **Walker** with enter/visiting-child/visited-child/leave hooks
//! - **Handler registry** ordered by priority, with typed per-handler data
//! - **Cuts** collected in row preparations with numerical cleanup

pub mod cons;
pub mod dcp;
pub mod error;
pub mod expr;
pub mod interval;
pub mod nlhdlr;
pub mod problem;
pub mod quad;
pub mod rowprep;
pub mod settings;
pub mod sparse;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use nlrelax::prelude::*;
/// ```
pub mod prelude {
    // Expressions
    pub use crate::expr::{
        walk, ExprGraph, ExprId, ExprVisitor, Op, TagGenerator, WalkContext, WalkControl,
        WalkOptions,
    };
    pub use crate::interval::Interval;

    // Variables, rows, points
    pub use crate::problem::{Problem, RowId, Solution, VarBounds, VarId, VarKind};
    pub use crate::rowprep::{RowPrep, RowSide};

    // DCP
    pub use crate::dcp::{Curvature, Sign};

    // Handlers
    pub use crate::nlhdlr::soc::{soc_form_of_constraint, SocForm};
    pub use crate::nlhdlr::{
        ConvexHandler, DetectRequest, EstimateFailure, Estimation, HandlerEnv, HandlerRegistry,
        NlHandler, SearchNode, Sides, SocHandler,
    };

    // Enforcement
    pub use crate::cons::{Constraint, EnforceResult, Model};

    // Settings
    pub use crate::settings::Settings;

    // Errors
    pub use crate::error::{NlError, Result};
}

// Re-export main types at crate root
pub use cons::Model;
pub use error::{NlError, Result};
pub use settings::Settings;
