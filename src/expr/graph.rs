//! Arena storage of the expression DAG.
//!
//! All nodes live in one `ExprGraph` and are addressed by [`ExprId`] handles.
//! Sharing is expressed by reference counts stored in the nodes: a parent holds
//! one reference to each of its children, and callers hold references to the
//! nodes they created or captured. A node is freed when its count drops to zero,
//! which in turn releases its children.

use std::collections::HashMap;

use log::trace;

use super::eval::EvalStats;
use super::node::{ExprId, Node, Op, TagGenerator};
use crate::error::{NlError, Result};

#[derive(Debug, Clone)]
struct Slot {
    generation: u32,
    node: Option<Node>,
}

/// Arena of expression nodes.
#[derive(Debug, Clone, Default)]
pub struct ExprGraph {
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
    /// Canonical node of each variable.
    pub(crate) var_nodes: HashMap<crate::problem::VarId, ExprId>,
    tags: TagGenerator,
    pub(crate) stats: EvalStats,
}

impl ExprGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a node with reference count 1 that captures its children.
    ///
    /// Variable operators return the canonical node of that variable (captured).
    pub fn create(&mut self, op: Op, children: &[ExprId]) -> Result<ExprId> {
        if let Op::Var(v) = op {
            if !children.is_empty() {
                return Err(NlError::InvalidExpression(
                    "variable node with children".to_string(),
                ));
            }
            return Ok(self.var(v));
        }
        if !op.accepts_children(children.len()) {
            return Err(NlError::InvalidExpression(format!(
                "{} cannot take {} children",
                op.name(),
                children.len()
            )));
        }
        if let Some(stale) = children.iter().find(|c| !self.contains(**c)) {
            return Err(NlError::InvalidExpression(format!(
                "stale child handle {:?}",
                stale
            )));
        }
        for &c in children {
            self.capture(c);
        }
        Ok(self.alloc(Node::new(op, children.to_vec())))
    }

    pub(crate) fn alloc(&mut self, node: Node) -> ExprId {
        if let Some(index) = self.free_slots.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = Some(node);
            ExprId {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len();
            assert!(index < u32::MAX as usize, "Arena capacity exceeded");
            self.slots.push(Slot {
                generation: 0,
                node: Some(node),
            });
            ExprId {
                index: index as u32,
                generation: 0,
            }
        }
    }

    /// Check if a handle refers to a live node.
    pub fn contains(&self, id: ExprId) -> bool {
        matches!(
            self.slots.get(id.index as usize),
            Some(Slot { generation, node: Some(_) }) if *generation == id.generation
        )
    }

    /// Gets the node at the given handle.
    ///
    /// # Panics
    ///
    /// Panics if the handle is stale.
    pub fn node(&self, id: ExprId) -> &Node {
        match self.slots.get(id.index as usize) {
            Some(Slot {
                generation,
                node: Some(node),
            }) if *generation == id.generation => node,
            _ => panic!("stale expression handle {:?}", id),
        }
    }

    pub(crate) fn node_mut(&mut self, id: ExprId) -> &mut Node {
        match self.slots.get_mut(id.index as usize) {
            Some(Slot {
                generation,
                node: Some(node),
            }) if *generation == id.generation => node,
            _ => panic!("stale expression handle {:?}", id),
        }
    }

    pub fn op(&self, id: ExprId) -> &Op {
        &self.node(id).op
    }

    pub fn children(&self, id: ExprId) -> &[ExprId] {
        &self.node(id).children
    }

    pub fn n_children(&self, id: ExprId) -> usize {
        self.node(id).children.len()
    }

    /// Number of live nodes.
    pub fn n_nodes(&self) -> usize {
        self.slots.iter().filter(|s| s.node.is_some()).count()
    }

    /// Handles of all live nodes.
    pub fn live_nodes(&self) -> Vec<ExprId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.node.is_some())
            .map(|(i, s)| ExprId {
                index: i as u32,
                generation: s.generation,
            })
            .collect()
    }

    /// A fresh evaluation tag.
    pub fn new_tag(&mut self) -> u64 {
        self.tags.next()
    }

    /// Evaluation callback counters.
    pub fn stats(&self) -> &EvalStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = EvalStats::default();
    }

    /// Add a reference.
    pub fn capture(&mut self, id: ExprId) {
        self.node_mut(id).refcount += 1;
    }

    /// Drop a reference. Nodes reaching zero are freed together with the
    /// references they hold on their children.
    pub fn release(&mut self, id: ExprId) {
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            let node = self.node_mut(id);
            debug_assert!(node.refcount > 0);
            node.refcount -= 1;
            if node.refcount > 0 {
                continue;
            }

            let slot = &mut self.slots[id.index as usize];
            let Some(node) = slot.node.take() else {
                continue;
            };
            slot.generation = slot.generation.wrapping_add(1);
            self.free_slots.push(id.index);
            if let Op::Var(v) = node.op {
                self.var_nodes.remove(&v);
            }
            stack.extend(node.children);
        }
    }

    // === Convenience constructors ===

    /// Creates a constant.
    pub fn value(&mut self, v: f64) -> ExprId {
        self.alloc(Node::new(Op::Value(v), Vec::new()))
    }

    /// Creates `constant + Σ coefs[i] * children[i]`.
    pub fn sum(&mut self, coefs: &[f64], children: &[ExprId], constant: f64) -> Result<ExprId> {
        self.create(
            Op::Sum {
                coefs: coefs.to_vec(),
                constant,
            },
            children,
        )
    }

    /// Creates `coef * Π children`.
    pub fn product(&mut self, coef: f64, children: &[ExprId]) -> Result<ExprId> {
        self.create(Op::Product { coef }, children)
    }

    /// Creates `base^exponent`.
    pub fn pow(&mut self, base: ExprId, exponent: f64) -> Result<ExprId> {
        self.create(Op::Pow { exponent }, &[base])
    }

    pub fn sqrt(&mut self, base: ExprId) -> Result<ExprId> {
        self.pow(base, 0.5)
    }

    pub fn square(&mut self, base: ExprId) -> Result<ExprId> {
        self.pow(base, 2.0)
    }

    pub fn exp(&mut self, arg: ExprId) -> Result<ExprId> {
        self.create(Op::Exp, &[arg])
    }

    pub fn log(&mut self, arg: ExprId) -> Result<ExprId> {
        self.create(Op::Log, &[arg])
    }

    pub fn abs(&mut self, arg: ExprId) -> Result<ExprId> {
        self.create(Op::Abs, &[arg])
    }

    pub fn entropy(&mut self, arg: ExprId) -> Result<ExprId> {
        self.create(Op::Entropy, &[arg])
    }

    // === Copying and structural modification ===

    /// Deep copy of an expression. Variable nodes are shared with the original;
    /// sharing inside the expression is preserved in the copy.
    pub fn duplicate(&mut self, root: ExprId) -> ExprId {
        let mut copies: HashMap<ExprId, ExprId> = HashMap::new();
        // (node, children pushed)
        let mut stack = vec![(root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if copies.contains_key(&id) {
                continue;
            }
            if !expanded {
                stack.push((id, true));
                for &c in self.children(id).iter().rev() {
                    if !copies.contains_key(&c) {
                        stack.push((c, false));
                    }
                }
                continue;
            }
            let copy = match self.node(id).op.clone() {
                Op::Var(v) => self.var(v),
                op => {
                    let children: Vec<ExprId> =
                        self.children(id).iter().map(|c| copies[c]).collect();
                    for &c in &children {
                        self.capture(c);
                    }
                    let curvature = self.node(id).curvature;
                    let mut node = Node::new(op, children);
                    node.curvature = curvature;
                    self.alloc(node)
                }
            };
            copies.insert(id, copy);
        }

        let root_copy = copies[&root];
        for (orig, copy) in copies {
            if orig != root {
                self.release(copy);
            }
        }
        trace!("duplicated expression {:?} into {:?}", root, root_copy);
        root_copy
    }

    /// Copy of a single node without its children. Variables and values are
    /// complete as they are; sums keep their coefficients and accept children
    /// through [`append_child`](Self::append_child).
    pub fn duplicate_shallow(&mut self, id: ExprId) -> ExprId {
        match self.node(id).op.clone() {
            Op::Var(v) => self.var(v),
            op => {
                let curvature = self.node(id).curvature;
                let mut node = Node::new(op, Vec::new());
                node.curvature = curvature;
                self.alloc(node)
            }
        }
    }

    fn check_owned(&self, id: ExprId) -> Result<()> {
        if self.node(id).refcount != 1 {
            return Err(NlError::InvalidExpression(format!(
                "cannot modify shared expression {:?}",
                id
            )));
        }
        Ok(())
    }

    fn invalidate(&mut self, id: ExprId) {
        let node = self.node_mut(id);
        node.eval_tag = 0;
        node.activity_tag = 0;
        node.diff_tag = 0;
    }

    /// Append a child to a node that is only referenced by the caller.
    pub fn append_child(&mut self, parent: ExprId, child: ExprId) -> Result<()> {
        self.check_owned(parent)?;
        let node = self.node(parent);
        let room = match &node.op {
            Op::Var(_) | Op::Value(_) => false,
            Op::Sum { coefs, .. } => node.children.len() < coefs.len(),
            Op::Product { .. } => true,
            _ => node.children.is_empty(),
        };
        if !room {
            return Err(NlError::InvalidExpression(format!(
                "{} cannot take another child",
                node.op.name()
            )));
        }
        self.capture(child);
        self.node_mut(parent).children.push(child);
        self.invalidate(parent);
        Ok(())
    }

    /// Replace the child at `index` of a node that is only referenced by the caller.
    pub fn replace_child(&mut self, parent: ExprId, index: usize, child: ExprId) -> Result<()> {
        self.check_owned(parent)?;
        let Some(&old) = self.node(parent).children.get(index) else {
            return Err(NlError::InvalidExpression(format!(
                "child index {} out of range",
                index
            )));
        };
        self.capture(child);
        self.node_mut(parent).children[index] = child;
        self.release(old);
        self.invalidate(parent);
        Ok(())
    }

    /// Set the curvature stored on a node.
    pub fn set_curvature(&mut self, id: ExprId, curvature: crate::dcp::Curvature) {
        self.node_mut(id).curvature = curvature;
    }

    /// All nodes reachable from `root`, children before parents, each once.
    pub fn post_order(&self, root: ExprId) -> Vec<ExprId> {
        let mut order = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let mut stack = vec![(root, 0usize)];
        seen.insert(root);
        while let Some((id, next)) = stack.pop() {
            let children = self.children(id);
            if next < children.len() {
                let child = children[next];
                stack.push((id, next + 1));
                if seen.insert(child) {
                    stack.push((child, 0));
                }
            } else {
                order.push(id);
            }
        }
        order
    }
}
