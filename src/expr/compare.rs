//! Total order and structural hash of expressions.
//!
//! The order is used to sort children of sums and products during
//! simplification; together with the hash it identifies common subexpressions.

use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use log::debug;

use super::graph::ExprGraph;
use super::node::{ExprId, Op};

impl Op {
    /// Position of the operator kind in the expression order.
    fn rank(&self) -> u8 {
        match self {
            Op::Value(_) => 0,
            Op::Var(_) => 1,
            Op::Sum { .. } => 2,
            Op::Product { .. } => 3,
            Op::Pow { .. } => 4,
            Op::Exp => 5,
            Op::Log => 6,
            Op::Abs => 7,
            Op::Entropy => 8,
        }
    }

    fn hash_payload<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Op::Value(v) => v.to_bits().hash(state),
            Op::Var(v) => v.hash(state),
            Op::Sum { coefs, constant } => {
                for c in coefs {
                    c.to_bits().hash(state);
                }
                constant.to_bits().hash(state);
            }
            Op::Product { coef } => coef.to_bits().hash(state),
            Op::Pow { exponent } => exponent.to_bits().hash(state),
            Op::Exp | Op::Log | Op::Abs | Op::Entropy => {}
        }
    }
}

fn cmp_f64(a: f64, b: f64) -> Ordering {
    a.total_cmp(&b)
}

impl ExprGraph {
    /// Compare two expressions.
    ///
    /// Different operator kinds are ordered values < variables < sums < products
    /// < powers < exp < log < abs < entropy. Sums and products compare their
    /// children starting from the last one, then coefficients, then the number of
    /// children, then the constant. Powers compare the base, then the exponent.
    pub fn compare(&self, a: ExprId, b: ExprId) -> Ordering {
        if a == b {
            return Ordering::Equal;
        }
        let (na, nb) = (self.node(a), self.node(b));
        let by_rank = na.op().rank().cmp(&nb.op().rank());
        if by_rank != Ordering::Equal {
            return by_rank;
        }
        match (na.op(), nb.op()) {
            (Op::Value(x), Op::Value(y)) => cmp_f64(*x, *y),
            (Op::Var(x), Op::Var(y)) => x.cmp(y),
            (
                Op::Sum {
                    coefs: ca,
                    constant: ka,
                },
                Op::Sum {
                    coefs: cb,
                    constant: kb,
                },
            ) => self
                .compare_children(a, b, ca, cb)
                .then_with(|| cmp_f64(*ka, *kb)),
            (Op::Product { coef: ca }, Op::Product { coef: cb }) => self
                .compare_children(a, b, &[], &[])
                .then_with(|| cmp_f64(*ca, *cb)),
            (Op::Pow { exponent: pa }, Op::Pow { exponent: pb }) => self
                .compare(na.children()[0], nb.children()[0])
                .then_with(|| cmp_f64(*pa, *pb)),
            _ => self.compare(na.children()[0], nb.children()[0]),
        }
    }

    /// Children from the last one backwards, then coefficients the same way,
    /// then the number of children.
    fn compare_children(&self, a: ExprId, b: ExprId, ca: &[f64], cb: &[f64]) -> Ordering {
        let (ka, kb) = (self.children(a), self.children(b));
        for (x, y) in ka.iter().rev().zip(kb.iter().rev()) {
            let ord = self.compare(*x, *y);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        for (x, y) in ca.iter().rev().zip(cb.iter().rev()) {
            let ord = cmp_f64(*x, *y);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        ka.len().cmp(&kb.len())
    }

    /// Structural hash: equal expressions (in the sense of [`compare`](Self::compare))
    /// have equal hashes.
    pub fn hash_expr(&self, root: ExprId) -> u64 {
        let mut hashes = HashMap::new();
        self.hash_into(root, &mut hashes)
    }

    fn hash_into(&self, root: ExprId, hashes: &mut HashMap<ExprId, u64>) -> u64 {
        for id in self.post_order(root) {
            if hashes.contains_key(&id) {
                continue;
            }
            let h = self.node_hash(id, hashes);
            hashes.insert(id, h);
        }
        hashes[&root]
    }

    /// Hash of a node whose children are already in `hashes`.
    fn node_hash(&self, id: ExprId, hashes: &HashMap<ExprId, u64>) -> u64 {
        let mut state = DefaultHasher::new();
        self.op(id).hash_payload(&mut state);
        for c in self.children(id) {
            hashes[c].hash(&mut state);
        }
        state.finish()
    }

    /// Replace structurally equal subexpressions below `roots` by one shared node.
    ///
    /// Roots themselves may be replaced; `roots` is updated in place (the caller's
    /// references move to the replacements). Returns the number of replacements.
    pub fn merge_common_subexpressions(&mut self, roots: &mut [ExprId]) -> usize {
        let mut order = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for &r in roots.iter() {
            for id in self.post_order(r) {
                if seen.insert(id) {
                    order.push(id);
                }
            }
        }

        // hash -> representatives (captured while in the table)
        let mut table: HashMap<u64, Vec<ExprId>> = HashMap::new();
        let mut replaced: HashMap<ExprId, ExprId> = HashMap::new();
        let mut hashes: HashMap<ExprId, u64> = HashMap::new();
        let mut count = 0;

        for id in order {
            // point children to their representatives
            let nchildren = self.n_children(id);
            for i in 0..nchildren {
                let child = self.children(id)[i];
                if let Some(&rep) = replaced.get(&child) {
                    self.capture(rep);
                    self.node_mut(id).children[i] = rep;
                    self.release(child);
                }
            }

            let h = self.node_hash(id, &hashes);
            hashes.insert(id, h);
            let candidates = table.entry(h).or_default();
            let found = candidates
                .iter()
                .copied()
                .find(|&c| c != id && self.compare(c, id) == Ordering::Equal);
            match found {
                Some(rep) => {
                    replaced.insert(id, rep);
                    count += 1;
                }
                None => {
                    table.entry(h).or_default().push(id);
                    self.capture(id);
                }
            }
        }

        for r in roots.iter_mut() {
            if let Some(&rep) = replaced.get(r) {
                self.capture(rep);
                self.release(*r);
                *r = rep;
            }
        }
        for reps in table.into_values() {
            for rep in reps {
                self.release(rep);
            }
        }
        if count > 0 {
            debug!("merged {} common subexpressions", count);
        }
        count
    }
}
