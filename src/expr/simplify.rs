//! Structural simplification.
//!
//! Produces a new expression in a normal form: nested sums and products are
//! flattened, constants folded, equal sum terms merged, equal product factors
//! collected into powers, and children of sums and products sorted by
//! [`ExprGraph::compare`]. Products never carry a coefficient other than 1 in the
//! result; a scaled product becomes a sum with one term.
//!
//! The input expression is left untouched.

use std::cmp::Ordering;
use std::collections::HashMap;

use log::trace;

use super::graph::ExprGraph;
use super::node::{ExprId, Op};
use crate::error::Result;

impl ExprGraph {
    /// Simplified copy of `root`. The caller owns the returned reference.
    pub fn simplify(&mut self, root: ExprId) -> Result<ExprId> {
        let mut done: HashMap<ExprId, ExprId> = HashMap::new();
        let order = self.post_order(root);
        for id in order {
            let children: Vec<ExprId> = self.children(id).iter().map(|c| done[c]).collect();
            let simplified = match self.op(id).clone() {
                Op::Var(v) => self.var(v),
                Op::Value(v) => self.value(v),
                Op::Sum { coefs, constant } => self.simplify_sum(&coefs, &children, constant)?,
                Op::Product { coef } => self.simplify_product(coef, &children)?,
                Op::Pow { exponent } => self.simplify_pow(children[0], exponent)?,
                op => self.simplify_univariate(op, children[0])?,
            };
            done.insert(id, simplified);
        }

        let result = done[&root];
        self.capture(result);
        for (_, s) in done {
            self.release(s);
        }
        trace!("simplified {:?} into {:?}", root, result);
        Ok(result)
    }

    fn simplify_sum(
        &mut self,
        coefs: &[f64],
        children: &[ExprId],
        mut constant: f64,
    ) -> Result<ExprId> {
        let mut terms: Vec<(f64, ExprId)> = Vec::new();
        for (&coef, &child) in coefs.iter().zip(children) {
            if coef == 0.0 {
                continue;
            }
            match self.op(child) {
                Op::Value(v) => constant += coef * v,
                Op::Sum {
                    coefs: inner,
                    constant: k,
                } => {
                    constant += coef * k;
                    for (&c, &g) in inner.iter().zip(self.children(child)) {
                        terms.push((coef * c, g));
                    }
                }
                _ => terms.push((coef, child)),
            }
        }

        terms.sort_by(|a, b| self.compare(a.1, b.1));
        let mut merged: Vec<(f64, ExprId)> = Vec::with_capacity(terms.len());
        for (coef, child) in terms {
            match merged.last_mut() {
                Some(last) if self.compare(last.1, child) == Ordering::Equal => last.0 += coef,
                _ => merged.push((coef, child)),
            }
        }
        merged.retain(|(c, _)| *c != 0.0);

        match merged.as_slice() {
            [] => Ok(self.value(constant)),
            [(c, child)] if *c == 1.0 && constant == 0.0 => {
                self.capture(*child);
                Ok(*child)
            }
            _ => {
                let (coefs, children): (Vec<f64>, Vec<ExprId>) = merged.into_iter().unzip();
                self.sum(&coefs, &children, constant)
            }
        }
    }

    fn simplify_product(&mut self, mut coef: f64, children: &[ExprId]) -> Result<ExprId> {
        // (base, exponent)
        let mut factors: Vec<(ExprId, f64)> = Vec::new();
        let mut pending: Vec<ExprId> = children.to_vec();
        while let Some(child) = pending.pop() {
            match self.op(child) {
                Op::Value(v) => coef *= v,
                Op::Product { coef: c } => {
                    coef *= c;
                    pending.extend_from_slice(self.children(child));
                }
                // c * f from an earlier simplification
                Op::Sum {
                    coefs,
                    constant,
                } if coefs.len() == 1 && *constant == 0.0 => {
                    coef *= coefs[0];
                    pending.push(self.children(child)[0]);
                }
                Op::Pow { exponent } => factors.push((self.children(child)[0], *exponent)),
                _ => factors.push((child, 1.0)),
            }
        }
        if coef == 0.0 {
            return Ok(self.value(0.0));
        }

        factors.sort_by(|a, b| self.compare(a.0, b.0).then(a.1.total_cmp(&b.1)));
        let mut merged: Vec<(ExprId, f64)> = Vec::with_capacity(factors.len());
        for (base, exponent) in factors {
            match merged.last_mut() {
                Some(last) if self.compare(last.0, base) == Ordering::Equal => last.1 += exponent,
                _ => merged.push((base, exponent)),
            }
        }
        merged.retain(|(_, e)| *e != 0.0);

        let mut built = Vec::with_capacity(merged.len());
        for (base, exponent) in merged {
            let f = if exponent == 1.0 {
                self.capture(base);
                base
            } else {
                self.simplify_pow(base, exponent)?
            };
            built.push(f);
        }
        built.sort_by(|a, b| self.compare(*a, *b));

        let result = match built.as_slice() {
            [] => self.value(coef),
            [single] => {
                if coef == 1.0 {
                    self.capture(*single);
                    *single
                } else {
                    self.sum(&[coef], &[*single], 0.0)?
                }
            }
            _ => {
                let prod = self.product(1.0, &built)?;
                if coef == 1.0 {
                    prod
                } else {
                    let scaled = self.sum(&[coef], &[prod], 0.0)?;
                    self.release(prod);
                    scaled
                }
            }
        };
        for f in built {
            self.release(f);
        }
        Ok(result)
    }

    fn simplify_pow(&mut self, base: ExprId, exponent: f64) -> Result<ExprId> {
        if exponent == 1.0 {
            self.capture(base);
            return Ok(base);
        }
        if exponent == 0.0 {
            return Ok(self.value(1.0));
        }
        match self.op(base).clone() {
            Op::Value(v) => {
                let r = v.powf(exponent);
                if r.is_finite() {
                    return Ok(self.value(r));
                }
            }
            // (x^q)^p = x^(q*p) for integral p
            Op::Pow { exponent: inner } if exponent.fract() == 0.0 => {
                let x = self.children(base)[0];
                return self.simplify_pow(x, inner * exponent);
            }
            _ => {}
        }
        self.pow(base, exponent)
    }

    fn simplify_univariate(&mut self, op: Op, child: ExprId) -> Result<ExprId> {
        if let Some(v) = self.as_value(child) {
            if let Some(r) = op.eval(&[v], &crate::problem::Solution::new()) {
                return Ok(self.value(r));
            }
        }
        if op == Op::Abs && *self.op(child) == Op::Abs {
            self.capture(child);
            return Ok(child);
        }
        self.create(op, &[child])
    }
}
