//! Expression DAG tests: copies, memoization, gradients and simplification.
//!
//! Expressions are defined as data and checked programmatically.

use nlrelax::prelude::*;
use proptest::prelude::*;

/// Tolerance for comparing floating point results
const TOL: f64 = 1e-9;

/// A test case definition
struct TestCase {
    name: &'static str,
    /// Builds the expression over the variables x, y, z (bounds [0.1, 3])
    build: fn(&mut ExprGraph, [ExprId; 3]) -> ExprId,
}

fn test_cases() -> Vec<TestCase> {
    vec![
        TestCase {
            name: "linear",
            build: |g, [x, y, z]| g.sum(&[2.0, -1.0, 0.5], &[x, y, z], 3.0).unwrap(),
        },
        TestCase {
            name: "exp_of_sum",
            build: |g, [x, y, _]| {
                let s = g.sum(&[1.0, -2.0], &[x, y], 0.0).unwrap();
                g.exp(s).unwrap()
            },
        },
        TestCase {
            name: "shared_subexpression",
            build: |g, [x, y, _]| {
                let p = g.product(1.0, &[x, y]).unwrap();
                let l = g.log(p).unwrap();
                g.sum(&[1.0, 3.0], &[p, l], 0.0).unwrap()
            },
        },
        TestCase {
            name: "signomial",
            build: |g, [x, y, z]| {
                let a = g.pow(x, 1.5).unwrap();
                let b = g.pow(y, -2.0).unwrap();
                g.product(0.7, &[a, b, z]).unwrap()
            },
        },
        TestCase {
            name: "norm",
            build: |g, [x, y, z]| {
                let lin = g.sum(&[3.0, -4.0], &[x, y], 2.0).unwrap();
                let a = g.square(lin).unwrap();
                let b = g.square(z).unwrap();
                let s = g.sum(&[1.0, 2.0], &[a, b], 5.0).unwrap();
                g.sqrt(s).unwrap()
            },
        },
        TestCase {
            name: "entropy_abs",
            build: |g, [x, y, _]| {
                let d = g.sum(&[1.0, -1.0], &[x, y], 0.0).unwrap();
                let a = g.abs(d).unwrap();
                let e = g.entropy(x).unwrap();
                g.sum(&[1.0, 1.0], &[a, e], 0.0).unwrap()
            },
        },
    ]
}

fn setup() -> (Problem, ExprGraph, [VarId; 3], [ExprId; 3]) {
    let mut p = Problem::new();
    let vars = [
        p.add_var("x", 0.1, 3.0, VarKind::Continuous),
        p.add_var("y", 0.1, 3.0, VarKind::Continuous),
        p.add_var("z", 0.1, 3.0, VarKind::Continuous),
    ];
    let mut g = ExprGraph::new();
    let nodes = [g.var(vars[0]), g.var(vars[1]), g.var(vars[2])];
    (p, g, vars, nodes)
}

fn point(vars: [VarId; 3], values: [f64; 3]) -> Solution {
    Solution::from_pairs(vars.into_iter().zip(values))
}

proptest! {
    #[test]
    fn prop_duplicate_evaluates_like_original(
        a in 0.1f64..3.0,
        b in 0.1f64..3.0,
        c in 0.1f64..3.0,
    ) {
        for case in test_cases() {
            let (_, mut g, vars, nodes) = setup();
            let e = (case.build)(&mut g, nodes);
            let copy = g.duplicate(e);
            let sol = point(vars, [a, b, c]);
            let original = g.evaluate(e, &sol, 0);
            let copied = g.evaluate(copy, &sol, 0);
            prop_assert_eq!(original.is_some(), copied.is_some(), "case {}", case.name);
            if let (Some(o), Some(d)) = (original, copied) {
                prop_assert!((o - d).abs() <= TOL * o.abs().max(1.0), "case {}: {} vs {}", case.name, o, d);
            }
        }
    }

    #[test]
    fn prop_interval_contains_value(
        a in 0.1f64..3.0,
        b in 0.1f64..3.0,
        c in 0.1f64..3.0,
    ) {
        for case in test_cases() {
            let (p, mut g, vars, nodes) = setup();
            let e = (case.build)(&mut g, nodes);
            let range = g.evaluate_interval(e, &p, 0, 0.0);
            if let Some(v) = g.evaluate(e, &point(vars, [a, b, c]), 0) {
                let slack = TOL * v.abs().max(1.0);
                prop_assert!(range.lo - slack <= v && v <= range.hi + slack,
                    "case {}: {} not in [{}, {}]", case.name, v, range.lo, range.hi);
            }
        }
    }
}

#[test]
fn test_memoization() {
    for case in test_cases() {
        let (_, mut g, vars, nodes) = setup();
        let e = (case.build)(&mut g, nodes);
        let sol = point(vars, [0.5, 1.5, 2.0]);

        let tag = g.new_tag();
        g.reset_stats();
        let first = g.evaluate(e, &sol, tag);
        let evals = g.stats().evals;
        assert!(evals > 0, "case {}", case.name);

        let second = g.evaluate(e, &sol, tag);
        assert_eq!(first, second);
        assert_eq!(g.stats().evals, evals, "case {}: same tag recomputed", case.name);

        g.evaluate(e, &sol, 0);
        assert_eq!(g.stats().evals, 2 * evals, "case {}: tag 0 must recompute", case.name);

        let tag = g.new_tag();
        g.evaluate(e, &sol, tag);
        assert_eq!(g.stats().evals, 3 * evals, "case {}: new tag must recompute", case.name);
    }
}

#[test]
fn test_gradient_matches_finite_differences() {
    let h = 1e-6;
    for case in test_cases() {
        let (_, mut g, vars, nodes) = setup();
        let e = (case.build)(&mut g, nodes);
        let base = [0.7, 1.3, 2.1];
        let sol = point(vars, base);
        let value = g.compute_gradient(e, &sol, 0);
        assert!(value.is_some(), "case {}", case.name);

        for (i, &v) in vars.iter().enumerate() {
            let mut plus = base;
            plus[i] += h;
            let mut minus = base;
            minus[i] -= h;
            let fp = g.evaluate(e, &point(vars, plus), 0).unwrap();
            let fm = g.evaluate(e, &point(vars, minus), 0).unwrap();
            let fd = (fp - fm) / (2.0 * h);

            // re-run the gradient: the evaluations above overwrote values
            g.compute_gradient(e, &sol, 0);
            let d = g.partial_diff(e, v).unwrap_or(0.0);
            assert!(
                (d - fd).abs() < 1e-5 * fd.abs().max(1.0),
                "case {}: d/d{} = {}, finite differences give {}",
                case.name,
                i,
                d,
                fd
            );
        }
    }
}

#[test]
fn test_evaluation_error_propagates() {
    let (_, mut g, vars, [x, y, _]) = setup();
    let d = g.sum(&[1.0, -1.0], &[x, y], 0.0).unwrap();
    let l = g.log(d).unwrap();
    let e = g.sum(&[1.0], &[l], 1.0).unwrap();
    assert!(g.evaluate(e, &point(vars, [1.0, 2.0, 0.0]), 0).is_none());
    assert!(g.compute_gradient(e, &point(vars, [1.0, 2.0, 0.0]), 0).is_none());
    assert!(g.evaluate(e, &point(vars, [2.0, 1.0, 0.0]), 0).is_some());
}

#[test]
fn test_release_frees_unreferenced_nodes() {
    let (_, mut g, _, [x, y, _]) = setup();
    let p = g.product(1.0, &[x, y]).unwrap();
    let l = g.log(p).unwrap();
    let e = g.sum(&[1.0, 3.0], &[p, l], 0.0).unwrap();
    g.release(p);
    g.release(l);
    assert_eq!(g.n_nodes(), 5);

    let copy = g.duplicate(e);
    g.release(e);
    assert!(g.contains(copy));
    assert!(!g.contains(e));
    g.release(copy);
    // only the caller's variable handles remain
    assert_eq!(g.n_nodes(), 3);
    assert!(g.contains(x) && g.contains(y));
}

#[test]
fn test_simplify_preserves_value() {
    for case in test_cases() {
        let (_, mut g, vars, nodes) = setup();
        let e = (case.build)(&mut g, nodes);
        let s = g.simplify(e).unwrap();
        let sol = point(vars, [0.4, 1.1, 2.5]);
        let a = g.evaluate(e, &sol, 0).unwrap();
        let b = g.evaluate(s, &sol, 0).unwrap();
        assert!((a - b).abs() < TOL * a.abs().max(1.0), "case {}: {} vs {}", case.name, a, b);

        let copy = g.duplicate(e);
        assert_eq!(g.compare(e, copy), std::cmp::Ordering::Equal, "case {}", case.name);
        assert_eq!(g.hash_expr(e), g.hash_expr(copy), "case {}", case.name);
    }
}

#[test]
fn test_common_subexpressions_merge() {
    let (_, mut g, vars, [x, y, _]) = setup();
    let s1 = g.sum(&[1.0, 1.0], &[x, y], 0.0).unwrap();
    let s2 = g.sum(&[1.0, 1.0], &[x, y], 0.0).unwrap();
    let e1 = g.exp(s1).unwrap();
    let e2 = g.log(s2).unwrap();
    let mut roots = [e1, e2];
    let merged = g.merge_common_subexpressions(&mut roots);
    assert_eq!(merged, 1);
    assert_eq!(g.children(roots[0])[0], g.children(roots[1])[0]);
    let sol = point(vars, [1.0, 2.0, 0.0]);
    assert!((g.evaluate(roots[0], &sol, 0).unwrap() - 3.0f64.exp()).abs() < TOL);
}
