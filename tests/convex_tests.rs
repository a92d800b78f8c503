//! Tangents of carved convex and concave expressions.
//!
//! Every case is a function of two variables on a box. A tangent taken at some
//! point of the box must touch the function there and stay below it (convex)
//! or above it (concave) everywhere else in the box.

use nlrelax::prelude::*;
use proptest::prelude::*;

/// Tolerance for comparing floating point results
const TOL: f64 = 1e-7;

/// A test case definition
struct TestCase {
    name: &'static str,
    x_bounds: (f64, f64),
    y_bounds: (f64, f64),
    build: fn(&mut ExprGraph, ExprId, ExprId) -> ExprId,
    /// Curvature the handler must find
    curvature: Curvature,
}

fn test_cases() -> Vec<TestCase> {
    vec![
        TestCase {
            name: "exp_of_linear",
            x_bounds: (-1.0, 1.0),
            y_bounds: (-1.0, 1.0),
            build: |g, x, y| {
                let s = g.sum(&[2.0, 1.0], &[x, y], 0.0).unwrap();
                g.exp(s).unwrap()
            },
            curvature: Curvature::Convex,
        },
        TestCase {
            name: "quad_over_lin",
            x_bounds: (0.1, 2.0),
            y_bounds: (0.5, 2.0),
            build: |g, x, y| {
                let num = g.square(x).unwrap();
                let den = g.pow(y, -1.0).unwrap();
                g.product(1.0, &[num, den]).unwrap()
            },
            curvature: Curvature::Convex,
        },
        TestCase {
            name: "square_of_linear",
            x_bounds: (-1.0, 1.0),
            y_bounds: (-1.0, 1.0),
            build: |g, x, y| {
                let s = g.sum(&[1.0, -3.0], &[x, y], 0.5).unwrap();
                g.square(s).unwrap()
            },
            curvature: Curvature::Convex,
        },
        TestCase {
            name: "negated_log",
            x_bounds: (0.5, 2.0),
            y_bounds: (0.5, 2.0),
            build: |g, x, y| {
                let s = g.sum(&[1.0, 1.0], &[x, y], 0.0).unwrap();
                let l = g.log(s).unwrap();
                g.sum(&[-1.0], &[l], 0.0).unwrap()
            },
            curvature: Curvature::Convex,
        },
        TestCase {
            name: "sqrt_of_linear",
            x_bounds: (0.0, 2.0),
            y_bounds: (0.0, 2.0),
            build: |g, x, y| {
                let s = g.sum(&[1.0, 2.0], &[x, y], 1.0).unwrap();
                g.sqrt(s).unwrap()
            },
            curvature: Curvature::Concave,
        },
        TestCase {
            name: "geometric_mean",
            x_bounds: (0.1, 2.0),
            y_bounds: (0.1, 2.0),
            build: |g, x, y| {
                let a = g.pow(x, 0.5).unwrap();
                let b = g.pow(y, 0.5).unwrap();
                g.product(1.0, &[a, b]).unwrap()
            },
            curvature: Curvature::Concave,
        },
    ]
}

struct Setup {
    model: Model,
    x: VarId,
    y: VarId,
    root: ExprId,
}

fn setup(case: &TestCase) -> Setup {
    let mut settings = Settings::default();
    settings.soc.enabled = false;
    let mut model = Model::new(settings);
    let x = model
        .problem
        .add_var("x", case.x_bounds.0, case.x_bounds.1, VarKind::Continuous);
    let y = model
        .problem
        .add_var("y", case.y_bounds.0, case.y_bounds.1, VarKind::Continuous);
    let xn = model.graph.var(x);
    let yn = model.graph.var(y);
    let root = (case.build)(&mut model.graph, xn, yn);
    let (lhs, rhs) = match case.curvature {
        Curvature::Convex => (f64::NEG_INFINITY, 1.0),
        _ => (1.0, f64::INFINITY),
    };
    model.add_constraint(case.name, root, lhs, rhs).unwrap();
    model.detect().unwrap();
    Setup { model, x, y, root }
}

fn lerp((lo, hi): (f64, f64), t: f64) -> f64 {
    lo + t * (hi - lo)
}

#[test]
fn test_detected_curvature() {
    for case in test_cases() {
        let s = setup(&case);
        let handler = s.model.registry.find::<ConvexHandler>().unwrap();
        let carved = handler
            .carved(s.root)
            .unwrap_or_else(|| panic!("case {}: nothing detected", case.name));
        assert_eq!(carved.curvature, case.curvature, "case {}", case.name);
        let mut leaves = carved.leaves.to_vec();
        leaves.sort();
        let mut expected = vec![s.x, s.y];
        expected.sort();
        assert_eq!(leaves, expected, "case {}", case.name);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_tangent_supports_function(tx in 0.0f64..=1.0, ty in 0.0f64..=1.0) {
        for case in test_cases() {
            let mut s = setup(&case);
            let at = Solution::from_pairs([
                (s.x, lerp(case.x_bounds, tx)),
                (s.y, lerp(case.y_bounds, ty)),
            ]);
            let handler = s.model.registry.find::<ConvexHandler>().unwrap();
            let Some(row) = handler.estimator_for(&mut s.model.graph, s.root, &at) else {
                // points on the boundary of the domain may have no derivative
                continue;
            };
            let fx = s.model.graph.evaluate(s.root, &at, 0).unwrap();
            prop_assert!((row.evaluate(&at) - fx).abs() <= TOL * fx.abs().max(1.0),
                "case {}: tangent is not tight", case.name);

            for i in 0..=4 {
                for j in 0..=4 {
                    let p = Solution::from_pairs([
                        (s.x, lerp(case.x_bounds, i as f64 / 4.0)),
                        (s.y, lerp(case.y_bounds, j as f64 / 4.0)),
                    ]);
                    let f = s.model.graph.evaluate(s.root, &p, 0).unwrap();
                    let t = row.evaluate(&p);
                    let slack = TOL * f.abs().max(1.0);
                    match case.curvature {
                        Curvature::Convex => prop_assert!(t <= f + slack,
                            "case {}: tangent {} above function {}", case.name, t, f),
                        _ => prop_assert!(t >= f - slack,
                            "case {}: tangent {} below function {}", case.name, t, f),
                    }
                }
            }
        }
    }
}

#[test]
fn test_enforce_installs_estimator_cut() {
    for case in test_cases() {
        let mut s = setup(&case);
        let w = s.model.graph.node(s.root).aux_var().unwrap();

        // a point where the function is far on the wrong side of its bound
        let (tx, ty) = match case.curvature {
            Curvature::Convex => (1.0, 1.0),
            _ => (0.0, 0.0),
        };
        let at = Solution::from_pairs([
            (s.x, lerp(case.x_bounds, tx)),
            (s.y, lerp(case.y_bounds, ty)),
        ]);
        let fx = s.model.graph.evaluate(s.root, &at, 0).unwrap();
        let sol = s.model.extend_solution(&at);
        let violated = match case.curvature {
            Curvature::Convex => fx > 1.0,
            _ => fx < 1.0,
        };
        assert_eq!(s.model.is_feasible(&sol), !violated, "case {}", case.name);

        let result = s.model.enforce(&sol, SearchNode::ROOT).unwrap();
        assert_eq!(result.violated, violated, "case {}", case.name);
        if !violated {
            assert!(result.cuts.is_empty(), "case {}", case.name);
            continue;
        }
        assert_eq!(result.cuts.len(), 1, "case {}", case.name);
        let row = s.model.problem.row(result.cuts[0]).unwrap();
        assert!(row.coef(w) != 0.0, "case {}: cut must contain the aux variable", case.name);
        assert!(row.violation(&sol) > 0.0, "case {}", case.name);
        assert!(!result.branch_scores.is_empty(), "case {}", case.name);
    }
}
