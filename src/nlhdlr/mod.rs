//! Nonlinear handlers.
//!
//! A nonlinear handler recognizes structure in an expression (convexity, a
//! second-order cone, ...) and supplies relaxations for it. Handlers are kept in
//! a [`HandlerRegistry`] ordered by priority. For every expression that needs
//! enforcement the registry asks the handlers in turn to [`detect`] structure;
//! a handler that succeeds claims one or both sides of the expression and keeps
//! private data for it. Later, [`estimate`] produces estimators or cuts at a
//! point and [`branch_score`] distributes the violation to variables.
//!
//! The sides: enforcing `f(x) <= w` needs underestimators of `f` (the "under"
//! side); enforcing `f(x) >= w` needs overestimators (the "over" side), where `w`
//! is the auxiliary variable of the expression.
//!
//! [`detect`]: NlHandler::detect
//! [`estimate`]: NlHandler::estimate
//! [`branch_score`]: NlHandler::branch_score

pub mod convex;
pub mod soc;

use std::any::Any;

use log::{debug, trace};

use crate::error::Result;
use crate::expr::{ExprGraph, ExprId};
use crate::problem::{Problem, Solution, VarId};
use crate::rowprep::RowPrep;
use crate::settings::Settings;

pub use convex::ConvexHandler;
pub use soc::SocHandler;

/// Mutable state handlers operate on.
pub struct HandlerEnv<'a> {
    pub graph: &'a mut ExprGraph,
    pub problem: &'a mut Problem,
    pub settings: &'a Settings,
}

/// A pair of side flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sides {
    /// Underestimation, i.e. enforcing `f(x) <= w`.
    pub under: bool,
    /// Overestimation, i.e. enforcing `f(x) >= w`.
    pub over: bool,
}

impl Sides {
    pub const NONE: Sides = Sides {
        under: false,
        over: false,
    };
    pub const UNDER: Sides = Sides {
        under: true,
        over: false,
    };
    pub const OVER: Sides = Sides {
        under: false,
        over: true,
    };
    pub const BOTH: Sides = Sides {
        under: true,
        over: true,
    };

    pub fn any(self) -> bool {
        self.under || self.over
    }

    /// Sides set in both.
    pub fn intersect(self, other: Sides) -> Sides {
        Sides {
            under: self.under && other.under,
            over: self.over && other.over,
        }
    }

    /// Sides set in `self` but not in `other`.
    pub fn without(self, other: Sides) -> Sides {
        Sides {
            under: self.under && !other.under,
            over: self.over && !other.over,
        }
    }
}

/// What the registry asks of a handler.
#[derive(Debug, Clone, Copy)]
pub struct DetectRequest {
    /// Sides still unclaimed. A handler may only claim these.
    pub need: Sides,
    /// `(lhs, rhs)` if the expression is the root of a constraint
    /// `lhs <= f(x) <= rhs`.
    pub constraint_sides: Option<(f64, f64)>,
}

/// Location in the search tree where enforcement happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SearchNode {
    /// Unique number of the node.
    pub number: u64,
    /// Depth, 0 at the root.
    pub depth: u32,
}

impl SearchNode {
    pub const ROOT: SearchNode = SearchNode {
        number: 0,
        depth: 0,
    };
}

/// Why no estimator or cut was produced.
#[derive(Debug, Clone, PartialEq)]
pub enum EstimateFailure {
    /// The handler does not enforce the requested side.
    WrongSide,
    /// The point already satisfies the relaxation.
    NotViolated,
    /// A value or derivative could not be evaluated or is not finite.
    EvaluationError,
    /// A denominator or coefficient is numerically unusable.
    Numerics(String),
    /// The round limit of the current node is reached.
    RoundLimit,
}

/// Outcome of [`NlHandler::estimate`].
#[derive(Debug, Clone)]
pub enum Estimation {
    /// A linear function of variables that under- (side `Right`) or
    /// overestimates (side `Left`) the expression. The caller turns it into a
    /// cut with the auxiliary variable of the expression.
    Estimator(RowPrep),
    /// Complete cuts, to be installed as they are.
    Cuts(Vec<RowPrep>),
    Failed(EstimateFailure),
}

/// A nonlinear handler.
///
/// Handler data is kept inside the handler, keyed by the expression it was
/// detected on. The registry guarantees that [`free_expr_data`](Self::free_expr_data)
/// is called exactly once for every successful detection.
pub trait NlHandler {
    fn name(&self) -> &'static str;

    fn priority(&self) -> i32;

    /// The handler as [`Any`], to get at its concrete type.
    fn as_any(&self) -> &dyn Any;

    /// Called once before the first detection.
    fn init(&mut self, _env: &mut HandlerEnv) -> Result<()> {
        Ok(())
    }

    /// Called once at the end; all expression data has been freed at this point.
    fn exit(&mut self, _env: &mut HandlerEnv) -> Result<()> {
        Ok(())
    }

    /// Look for structure in `expr`. Returns the claimed sides (a subset of
    /// `request.need`) or `None` if nothing was found.
    fn detect(
        &mut self,
        env: &mut HandlerEnv,
        expr: ExprId,
        request: DetectRequest,
    ) -> Result<Option<Sides>>;

    /// Value of `expr` as the handler sees it at `sol`. Must agree with the
    /// evaluation of the expression itself.
    fn eval_aux(&mut self, env: &mut HandlerEnv, expr: ExprId, sol: &Solution) -> Option<f64>;

    fn estimate(
        &mut self,
        env: &mut HandlerEnv,
        expr: ExprId,
        sol: &Solution,
        overestimate: bool,
        node: SearchNode,
    ) -> Estimation;

    /// Branching scores proportional to the violation at `sol`. Empty if the
    /// point is not violated on a side this handler enforces.
    fn branch_score(&mut self, env: &mut HandlerEnv, expr: ExprId, sol: &Solution)
        -> Vec<(VarId, f64)>;

    /// Drop the data stored for `expr`, releasing everything created for it.
    fn free_expr_data(&mut self, env: &mut HandlerEnv, expr: ExprId) -> Result<()>;
}

/// A successful detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Association {
    pub expr: ExprId,
    /// Index of the handler in the registry.
    pub handler: usize,
    pub sides: Sides,
}

/// Handlers in priority order and their associations with expressions.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Vec<Box<dyn NlHandler>>,
    associations: Vec<Association>,
    initialized: bool,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the enabled built-in handlers.
    pub fn with_defaults(settings: &Settings) -> Self {
        let mut registry = Self::new();
        if settings.convex.enabled {
            registry.register(Box::new(ConvexHandler::new(settings.convex.priority)));
        }
        if settings.soc.enabled {
            registry.register(Box::new(SocHandler::new(settings.soc.priority)));
        }
        registry
    }

    /// Add a handler. Handlers stay sorted by decreasing priority; handlers of
    /// equal priority keep their registration order.
    pub fn register(&mut self, handler: Box<dyn NlHandler>) {
        debug_assert!(
            self.associations.is_empty(),
            "handlers must be registered before detection"
        );
        let pos = self
            .handlers
            .iter()
            .position(|h| h.priority() < handler.priority())
            .unwrap_or(self.handlers.len());
        debug!("registering handler {} at position {}", handler.name(), pos);
        self.handlers.insert(pos, handler);
    }

    /// Handler names in the order they are tried.
    pub fn names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn handler(&self, index: usize) -> &dyn NlHandler {
        self.handlers[index].as_ref()
    }

    pub fn handler_mut(&mut self, index: usize) -> &mut dyn NlHandler {
        self.handlers[index].as_mut()
    }

    /// The first registered handler of type `H`.
    pub fn find<H: NlHandler + 'static>(&self) -> Option<&H> {
        self.handlers
            .iter()
            .find_map(|h| h.as_any().downcast_ref::<H>())
    }

    /// Initialize all handlers (once).
    pub fn init(&mut self, env: &mut HandlerEnv) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        for h in &mut self.handlers {
            h.init(env)?;
        }
        self.initialized = true;
        Ok(())
    }

    /// Run detection on `expr` until all requested sides are claimed or every
    /// handler has been asked. Returns the sides that were claimed.
    pub fn detect(
        &mut self,
        env: &mut HandlerEnv,
        expr: ExprId,
        need: Sides,
        constraint_sides: Option<(f64, f64)>,
    ) -> Result<Sides> {
        self.init(env)?;
        let mut open = need;
        for (index, handler) in self.handlers.iter_mut().enumerate() {
            if !open.any() {
                break;
            }
            let request = DetectRequest {
                need: open,
                constraint_sides,
            };
            let Some(claimed) = handler.detect(env, expr, request)? else {
                trace!("{} found nothing in {:?}", handler.name(), expr);
                continue;
            };
            debug_assert!(
                claimed.without(open) == Sides::NONE,
                "{} claimed a side it was not asked for",
                handler.name()
            );
            let claimed = claimed.intersect(open);
            if !claimed.any() {
                handler.free_expr_data(env, expr)?;
                continue;
            }
            debug!(
                "{} claims {:?} (under: {}, over: {})",
                handler.name(),
                expr,
                claimed.under,
                claimed.over
            );
            self.associations.push(Association {
                expr,
                handler: index,
                sides: claimed,
            });
            open = open.without(claimed);
        }
        Ok(need.without(open))
    }

    /// Associations of `expr`, in handler order.
    pub fn associations(&self, expr: ExprId) -> Vec<Association> {
        self.associations
            .iter()
            .filter(|a| a.expr == expr)
            .copied()
            .collect()
    }

    pub fn all_associations(&self) -> &[Association] {
        &self.associations
    }

    /// Tear down all associations of `expr`.
    pub fn free(&mut self, env: &mut HandlerEnv, expr: ExprId) -> Result<()> {
        let (gone, kept): (Vec<Association>, Vec<Association>) = self
            .associations
            .iter()
            .partition(|a| a.expr == expr);
        self.associations = kept;
        for a in gone {
            self.handlers[a.handler].free_expr_data(env, a.expr)?;
        }
        Ok(())
    }

    /// Tear down every association and call `exit` on all handlers.
    pub fn exit(&mut self, env: &mut HandlerEnv) -> Result<()> {
        for a in std::mem::take(&mut self.associations) {
            self.handlers[a.handler].free_expr_data(env, a.expr)?;
        }
        if self.initialized {
            for h in &mut self.handlers {
                h.exit(env)?;
            }
            self.initialized = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Claims a fixed set of sides and records calls.
    struct Fixed {
        name: &'static str,
        priority: i32,
        claims: Sides,
        log: Rc<RefCell<Vec<String>>>,
    }

    impl NlHandler for Fixed {
        fn name(&self) -> &'static str {
            self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn detect(
            &mut self,
            _: &mut HandlerEnv,
            _: ExprId,
            request: DetectRequest,
        ) -> Result<Option<Sides>> {
            self.log.borrow_mut().push(format!("detect {}", self.name));
            let c = self.claims.intersect(request.need);
            Ok(if c.any() { Some(c) } else { None })
        }

        fn eval_aux(&mut self, _: &mut HandlerEnv, _: ExprId, _: &Solution) -> Option<f64> {
            None
        }

        fn estimate(
            &mut self,
            _: &mut HandlerEnv,
            _: ExprId,
            _: &Solution,
            _: bool,
            _: SearchNode,
        ) -> Estimation {
            Estimation::Failed(EstimateFailure::NotViolated)
        }

        fn branch_score(&mut self, _: &mut HandlerEnv, _: ExprId, _: &Solution) -> Vec<(VarId, f64)> {
            Vec::new()
        }

        fn free_expr_data(&mut self, _: &mut HandlerEnv, _: ExprId) -> Result<()> {
            self.log.borrow_mut().push(format!("free {}", self.name));
            Ok(())
        }
    }

    fn fixed(name: &'static str, priority: i32, claims: Sides, log: &Rc<RefCell<Vec<String>>>) -> Box<Fixed> {
        Box::new(Fixed {
            name,
            priority,
            claims,
            log: Rc::clone(log),
        })
    }

    #[test]
    fn test_priority_order_is_stable() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut r = HandlerRegistry::new();
        r.register(fixed("a", 10, Sides::NONE, &log));
        r.register(fixed("b", 100, Sides::NONE, &log));
        r.register(fixed("c", 10, Sides::NONE, &log));
        r.register(fixed("d", 50, Sides::NONE, &log));
        assert_eq!(r.names(), vec!["b", "d", "a", "c"]);
        assert_eq!(r.find::<Fixed>().map(|h| h.name), Some("b"));
        assert!(r.find::<ConvexHandler>().is_none());
    }

    #[test]
    fn test_detect_loop_and_free() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut r = HandlerRegistry::new();
        r.register(fixed("high", 100, Sides::UNDER, &log));
        r.register(fixed("mid", 50, Sides::BOTH, &log));
        r.register(fixed("low", 10, Sides::BOTH, &log));

        let mut graph = ExprGraph::new();
        let mut problem = Problem::new();
        let settings = Settings::default();
        let mut env = HandlerEnv {
            graph: &mut graph,
            problem: &mut problem,
            settings: &settings,
        };
        let e = env.graph.value(1.0);
        let claimed = r.detect(&mut env, e, Sides::BOTH, None).unwrap();
        assert_eq!(claimed, Sides::BOTH);

        let assoc = r.associations(e);
        assert_eq!(assoc.len(), 2);
        assert_eq!(assoc[0].sides, Sides::UNDER);
        assert_eq!(assoc[1].sides, Sides::OVER);
        // "low" is never asked: both sides are claimed before
        assert_eq!(*log.borrow(), vec!["detect high", "detect mid"]);

        r.exit(&mut env).unwrap();
        assert!(r.all_associations().is_empty());
        let frees = log.borrow().iter().filter(|l| l.starts_with("free")).count();
        assert_eq!(frees, 2);
    }
}
