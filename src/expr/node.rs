//! Core node types of the expression DAG.
//!
//! The `Op` enum is the operator catalog: a closed set of operator kinds, each
//! carrying its own payload. Capabilities of operators (evaluation,
//! differentiation, interval evaluation, curvature, comparison) are implemented
//! in separate modules as `impl Op` blocks.

use crate::dcp::Curvature;
use crate::interval::Interval;
use crate::problem::VarId;

/// Handle of a node in an [`ExprGraph`](super::ExprGraph).
///
/// A handle stays valid while the node is alive; after the node is freed, its
/// slot may be reused with a new generation and the old handle becomes stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl ExprId {
    /// Get the raw slot index.
    pub fn raw(&self) -> u32 {
        self.index
    }
}

/// Operator of an expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// A decision variable (leaf).
    Var(VarId),
    /// A constant (leaf).
    Value(f64),
    /// `constant + Σ coefs[i] * child[i]`.
    Sum { coefs: Vec<f64>, constant: f64 },
    /// `coef * Π child[i]`.
    Product { coef: f64 },
    /// `child^exponent`.
    Pow { exponent: f64 },
    /// `exp(child)`.
    Exp,
    /// `ln(child)`.
    Log,
    /// `|child|`.
    Abs,
    /// `-child * ln(child)`.
    Entropy,
}

impl Op {
    /// Operator name, as used in printing and logging.
    pub fn name(&self) -> &'static str {
        match self {
            Op::Var(_) => "var",
            Op::Value(_) => "val",
            Op::Sum { .. } => "sum",
            Op::Product { .. } => "prod",
            Op::Pow { .. } => "pow",
            Op::Exp => "exp",
            Op::Log => "log",
            Op::Abs => "abs",
            Op::Entropy => "entropy",
        }
    }

    /// Check if `n` children are acceptable for this operator.
    pub(crate) fn accepts_children(&self, n: usize) -> bool {
        match self {
            Op::Var(_) | Op::Value(_) => n == 0,
            Op::Sum { coefs, .. } => coefs.len() == n,
            Op::Product { .. } => true,
            _ => n == 1,
        }
    }
}

/// A node of the expression DAG.
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) op: Op,
    pub(crate) children: Vec<ExprId>,
    pub(crate) refcount: u32,

    // point evaluation
    pub(crate) value: Option<f64>,
    pub(crate) eval_tag: u64,

    // interval evaluation
    pub(crate) activity: Interval,
    pub(crate) activity_tag: u64,

    pub(crate) curvature: Curvature,

    // reverse-mode differentiation
    pub(crate) derivative: Option<f64>,
    pub(crate) diff_tag: u64,

    pub(crate) aux_var: Option<VarId>,
}

impl Node {
    pub(crate) fn new(op: Op, children: Vec<ExprId>) -> Self {
        Node {
            op,
            children,
            refcount: 1,
            value: None,
            eval_tag: 0,
            activity: Interval::entire(),
            activity_tag: 0,
            curvature: Curvature::Unknown,
            derivative: None,
            diff_tag: 0,
            aux_var: None,
        }
    }

    pub fn op(&self) -> &Op {
        &self.op
    }

    pub fn children(&self) -> &[ExprId] {
        &self.children
    }

    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    /// Last computed value (`None` if never evaluated or evaluation failed).
    pub fn value(&self) -> Option<f64> {
        self.value
    }

    /// Last computed activity.
    pub fn activity(&self) -> Interval {
        self.activity
    }

    /// Curvature stored on the node (set by analysis or by handlers on owned copies).
    pub fn curvature(&self) -> Curvature {
        self.curvature
    }

    pub fn aux_var(&self) -> Option<VarId> {
        self.aux_var
    }
}

/// Generator of evaluation tags. Tags are never 0.
#[derive(Debug, Clone)]
pub struct TagGenerator {
    last: u64,
}

impl TagGenerator {
    pub fn new() -> Self {
        TagGenerator { last: 0 }
    }

    /// Next fresh tag.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> u64 {
        self.last += 1;
        self.last
    }
}

impl Default for TagGenerator {
    fn default() -> Self {
        Self::new()
    }
}
