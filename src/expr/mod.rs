//! Expression DAG and traversal.
//!
//! This module provides the core expression machinery:
//! - `ExprGraph` - arena of reference-counted nodes addressed by `ExprId`
//! - `Op` - the operator catalog
//! - Memoized point and interval evaluation, reverse-mode gradients
//! - `walk` - iterative depth-first traversal with visitor hooks
//! - Comparison, hashing, simplification and printing

mod compare;
mod display;
mod eval;
mod graph;
mod node;
mod simplify;
mod variable;
pub mod walk;

pub use eval::EvalStats;
pub use graph::ExprGraph;
pub use node::{ExprId, Node, Op, TagGenerator};
pub use walk::{walk, ExprVisitor, WalkContext, WalkControl, WalkOptions};
