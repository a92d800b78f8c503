//! Variable nodes and auxiliary variables.
//!
//! Each variable has at most one node per graph; every parent referencing the
//! variable shares it. Any other node may get an auxiliary variable standing in
//! for its value.

use log::debug;

use super::graph::ExprGraph;
use super::node::{ExprId, Node, Op};
use crate::interval::Interval;
use crate::problem::{Problem, VarId};

impl ExprGraph {
    /// The canonical node of a variable (captured for the caller).
    pub fn var(&mut self, var: VarId) -> ExprId {
        if let Some(&id) = self.var_nodes.get(&var) {
            self.capture(id);
            return id;
        }
        let id = self.alloc(Node::new(Op::Var(var), Vec::new()));
        self.var_nodes.insert(var, id);
        id
    }

    /// The canonical node of a variable, if one exists.
    pub fn var_node(&self, var: VarId) -> Option<ExprId> {
        self.var_nodes.get(&var).copied()
    }

    /// The value of a constant node.
    pub fn as_value(&self, id: ExprId) -> Option<f64> {
        match self.op(id) {
            Op::Value(v) => Some(*v),
            _ => None,
        }
    }

    /// Variables occurring in an expression, in order of first occurrence.
    pub fn variables(&self, root: ExprId) -> Vec<VarId> {
        let mut vars = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            if let Op::Var(v) = self.op(id) {
                vars.push(*v);
            }
            stack.extend(self.children(id).iter().rev());
        }
        vars
    }

    /// The variable standing for the value of `id`.
    ///
    /// For variable nodes this is the variable itself. Otherwise an auxiliary
    /// variable is created on first use, bounded by the last computed activity.
    pub fn get_or_create_aux_var(&mut self, id: ExprId, problem: &mut Problem) -> VarId {
        if let Op::Var(v) = self.op(id) {
            return *v;
        }
        if let Some(v) = self.node(id).aux_var {
            return v;
        }
        let Interval { lo, hi } = self.node(id).activity;
        let name = format!("aux_{}_{}", self.op(id).name(), id.raw());
        let v = problem.create_aux_var(name, lo, hi);
        debug!("created auxiliary variable x{} for {:?}", v.raw(), id);
        self.node_mut(id).aux_var = Some(v);
        v
    }

    /// Release all auxiliary variables of live nodes.
    pub fn release_aux_vars(&mut self, problem: &mut Problem) {
        let ids = self.live_nodes();
        for id in ids {
            if let Some(v) = self.node_mut(id).aux_var.take() {
                // may already be gone if the caller released it
                let _ = problem.release_var(v);
            }
        }
    }
}
