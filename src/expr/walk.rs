//! Depth-first traversal of the expression DAG.
//!
//! The walker keeps an explicit stack, so deep expressions do not exhaust the
//! native call stack. A visitor is notified in four stages:
//!
//! - `enter` when a node is reached,
//! - `visiting_child` before descending into a child,
//! - `visited_child` after a child has been left,
//! - `leave` after all children have been handled.
//!
//! Every hook returns a [`WalkControl`]. `Skip` from `enter` omits the children
//! but still calls `leave`; from `visiting_child` it skips that child only; from
//! `visited_child` it skips the remaining children. `Abort` stops the walk.
//!
//! Hooks receive the graph mutably and may modify the node they are called for
//! (e.g. replace the child about to be visited), as long as the caller owns it.

use std::collections::HashSet;

use super::graph::ExprGraph;
use super::node::ExprId;

/// Result of a visitor hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkControl {
    Continue,
    Skip,
    Abort,
}

/// Position of the walk.
#[derive(Debug, Clone, Copy)]
pub struct WalkContext {
    parent: Option<ExprId>,
    child_index: usize,
    depth: usize,
}

impl WalkContext {
    /// Parent of the current node (`None` at the root).
    ///
    /// In `visiting_child` and `visited_child` the current node is the parent of
    /// the child being handled, so this is the grandparent of that child.
    pub fn parent(&self) -> Option<ExprId> {
        self.parent
    }

    /// In `enter`/`leave`: position of the current node in its parent's children.
    /// In `visiting_child`/`visited_child`: position of the child being handled.
    pub fn child_index(&self) -> usize {
        self.child_index
    }

    /// Depth of the current node (root = 0).
    pub fn depth(&self) -> usize {
        self.depth
    }
}

/// Options of a walk.
#[derive(Debug, Clone, Copy, Default)]
pub struct WalkOptions {
    /// Enter nodes again each time they are reached through another parent.
    /// Without this, a shared node is visited once and later edges to it are
    /// ignored entirely.
    pub revisit: bool,
}

/// Visitor hooks. All default to `Continue`.
#[allow(unused_variables)]
pub trait ExprVisitor {
    fn enter(&mut self, graph: &mut ExprGraph, expr: ExprId, ctx: &WalkContext) -> WalkControl {
        WalkControl::Continue
    }

    fn visiting_child(
        &mut self,
        graph: &mut ExprGraph,
        expr: ExprId,
        child: ExprId,
        ctx: &WalkContext,
    ) -> WalkControl {
        WalkControl::Continue
    }

    fn visited_child(
        &mut self,
        graph: &mut ExprGraph,
        expr: ExprId,
        child: ExprId,
        ctx: &WalkContext,
    ) -> WalkControl {
        WalkControl::Continue
    }

    fn leave(&mut self, graph: &mut ExprGraph, expr: ExprId, ctx: &WalkContext) -> WalkControl {
        WalkControl::Continue
    }
}

struct Frame {
    expr: ExprId,
    next_child: usize,
    index_in_parent: usize,
}

/// Walk the expression below `root`.
///
/// Returns `WalkControl::Abort` if a hook aborted, `WalkControl::Continue` otherwise.
pub fn walk<V: ExprVisitor + ?Sized>(
    graph: &mut ExprGraph,
    root: ExprId,
    visitor: &mut V,
    options: WalkOptions,
) -> WalkControl {
    let mut visited: HashSet<ExprId> = HashSet::new();
    let mut stack: Vec<Frame> = Vec::new();

    let ctx = WalkContext {
        parent: None,
        child_index: 0,
        depth: 0,
    };
    visited.insert(root);
    match visitor.enter(graph, root, &ctx) {
        WalkControl::Abort => return WalkControl::Abort,
        WalkControl::Skip => return finish(visitor.leave(graph, root, &ctx)),
        WalkControl::Continue => {}
    }
    stack.push(Frame {
        expr: root,
        next_child: 0,
        index_in_parent: 0,
    });

    while let Some(top) = stack.last() {
        let expr = top.expr;
        let next = top.next_child;
        let depth = stack.len() - 1;
        let parent = if depth > 0 {
            Some(stack[depth - 1].expr)
        } else {
            None
        };

        if next >= graph.n_children(expr) {
            // all children handled: leave and report to the parent
            let index_in_parent = top.index_in_parent;
            stack.pop();
            let ctx = WalkContext {
                parent,
                child_index: index_in_parent,
                depth,
            };
            if visitor.leave(graph, expr, &ctx) == WalkControl::Abort {
                return WalkControl::Abort;
            }
            if let Some(frame) = stack.last() {
                let grandparent = if stack.len() > 1 {
                    Some(stack[stack.len() - 2].expr)
                } else {
                    None
                };
                let pctx = WalkContext {
                    parent: grandparent,
                    child_index: index_in_parent,
                    depth: stack.len() - 1,
                };
                let pexpr = frame.expr;
                match visitor.visited_child(graph, pexpr, expr, &pctx) {
                    WalkControl::Abort => return WalkControl::Abort,
                    WalkControl::Skip => skip_rest(graph, &mut stack),
                    WalkControl::Continue => advance(&mut stack),
                }
            }
            continue;
        }

        let ctx = WalkContext {
            parent,
            child_index: next,
            depth,
        };
        let child = graph.children(expr)[next];
        if !options.revisit && visited.contains(&child) {
            advance(&mut stack);
            continue;
        }
        match visitor.visiting_child(graph, expr, child, &ctx) {
            WalkControl::Abort => return WalkControl::Abort,
            WalkControl::Skip => {
                advance(&mut stack);
                continue;
            }
            WalkControl::Continue => {}
        }

        // the hook may have replaced the child
        let child = graph.children(expr)[next];
        if !options.revisit && !visited.insert(child) {
            advance(&mut stack);
            continue;
        }
        let cctx = WalkContext {
            parent: Some(expr),
            child_index: next,
            depth: depth + 1,
        };
        match visitor.enter(graph, child, &cctx) {
            WalkControl::Abort => return WalkControl::Abort,
            WalkControl::Skip => {
                if visitor.leave(graph, child, &cctx) == WalkControl::Abort {
                    return WalkControl::Abort;
                }
                match visitor.visited_child(graph, expr, child, &ctx) {
                    WalkControl::Abort => return WalkControl::Abort,
                    WalkControl::Skip => skip_rest(graph, &mut stack),
                    WalkControl::Continue => advance(&mut stack),
                }
            }
            WalkControl::Continue => stack.push(Frame {
                expr: child,
                next_child: 0,
                index_in_parent: next,
            }),
        }
    }

    WalkControl::Continue
}

fn finish(control: WalkControl) -> WalkControl {
    match control {
        WalkControl::Abort => WalkControl::Abort,
        _ => WalkControl::Continue,
    }
}

fn advance(stack: &mut [Frame]) {
    if let Some(frame) = stack.last_mut() {
        frame.next_child += 1;
    }
}

fn skip_rest(graph: &ExprGraph, stack: &mut [Frame]) {
    if let Some(frame) = stack.last_mut() {
        frame.next_child = graph.n_children(frame.expr);
    }
}
