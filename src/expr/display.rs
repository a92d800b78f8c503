//! Printing of expressions.

use std::collections::HashMap;

use super::graph::ExprGraph;
use super::node::{ExprId, Op};
use crate::problem::{Problem, VarId};

fn format_coef(out: &mut String, coef: f64, first: bool) {
    if first {
        if coef == -1.0 {
            out.push('-');
        } else if coef != 1.0 {
            out.push_str(&format!("{}*", coef));
        }
    } else if coef < 0.0 {
        out.push_str(" - ");
        if coef != -1.0 {
            out.push_str(&format!("{}*", -coef));
        }
    } else {
        out.push_str(" + ");
        if coef != 1.0 {
            out.push_str(&format!("{}*", coef));
        }
    }
}

impl ExprGraph {
    /// Render an expression with variables named `<x3>` by their raw index.
    pub fn display(&self, root: ExprId) -> String {
        self.render(root, &|v: VarId| format!("x{}", v.raw()))
    }

    /// Render an expression with the variable names of `problem`.
    pub fn display_with(&self, root: ExprId, problem: &Problem) -> String {
        self.render(root, &|v: VarId| problem.var_name(v))
    }

    fn render(&self, root: ExprId, name: &dyn Fn(VarId) -> String) -> String {
        let mut text: HashMap<ExprId, String> = HashMap::new();
        for id in self.post_order(root) {
            let children: Vec<&str> = self.children(id).iter().map(|c| text[c].as_str()).collect();
            let s = match self.op(id) {
                Op::Var(v) => format!("<{}>", name(*v)),
                Op::Value(v) => format!("{}", v),
                Op::Sum { coefs, constant } => {
                    let mut s = String::from("(");
                    for (i, (c, child)) in coefs.iter().zip(&children).enumerate() {
                        format_coef(&mut s, *c, i == 0);
                        s.push_str(child);
                    }
                    if *constant != 0.0 || coefs.is_empty() {
                        if coefs.is_empty() {
                            s.push_str(&format!("{}", constant));
                        } else if *constant < 0.0 {
                            s.push_str(&format!(" - {}", -constant));
                        } else {
                            s.push_str(&format!(" + {}", constant));
                        }
                    }
                    s.push(')');
                    s
                }
                Op::Product { coef } => {
                    let mut s = String::new();
                    format_coef(&mut s, *coef, true);
                    s.push_str(&children.join(" * "));
                    s
                }
                Op::Pow { exponent } => format!("{}^{}", children[0], exponent),
                op => format!("{}({})", op.name(), children[0]),
            };
            text.insert(id, s);
        }
        text.remove(&root).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problem::VarKind;

    #[test]
    fn test_display() {
        let mut p = Problem::new();
        let xv = p.add_var("x", 0.0, 1.0, VarKind::Continuous);
        let yv = p.add_var("y", 0.0, 1.0, VarKind::Continuous);
        let mut g = ExprGraph::new();
        let x = g.var(xv);
        let y = g.var(yv);
        let sq = g.square(x).unwrap();
        let ex = g.exp(y).unwrap();
        let s = g.sum(&[1.0, -2.0], &[sq, ex], -1.0).unwrap();
        assert_eq!(g.display_with(s, &p), "(<x>^2 - 2*exp(<y>) - 1)");
        assert_eq!(g.display(s), "(<x0>^2 - 2*exp(<x1>) - 1)");
    }
}
