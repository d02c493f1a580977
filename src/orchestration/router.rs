//! Executor router.
//!
//! Routing is an ordered table of pure rules over a task's static metadata;
//! the first matching rule picks the executor. Nothing observed at runtime
//! feeds into it, so the same task always routes the same way.

use std::sync::Arc;

use crate::config::Config;
use crate::core::task::{ExecutorKind, Task};
use crate::orchestration::catalog::ServiceCatalog;

/// What a rule may look at.
pub struct RouteContext<'a> {
    pub task: &'a Task,
    pub catalog: &'a dyn ServiceCatalog,
}

type Predicate = fn(&RouteContext<'_>) -> Option<ExecutorKind>;

/// A named routing rule.
#[derive(Clone, Copy)]
pub struct RoutingRule {
    pub name: &'static str,
    pub decide: Predicate,
}

impl std::fmt::Debug for RoutingRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingRule").field("name", &self.name).finish()
    }
}

fn explicit_override(ctx: &RouteContext<'_>) -> Option<ExecutorKind> {
    ctx.task.executor_override
}

fn deterministic_in_catalog(ctx: &RouteContext<'_>) -> Option<ExecutorKind> {
    let routing = &ctx.task.routing;
    if !routing.deterministic {
        return None;
    }
    let capability = routing.capability.as_deref()?;
    ctx.catalog.lookup(capability).map(|_| ExecutorKind::Worker)
}

fn critical_decision(ctx: &RouteContext<'_>) -> Option<ExecutorKind> {
    ctx.task
        .routing
        .critical_decision
        .then_some(ExecutorKind::Human)
}

fn named_methodology(ctx: &RouteContext<'_>) -> Option<ExecutorKind> {
    ctx.task
        .routing
        .methodology
        .as_ref()
        .map(|_| ExecutorKind::Clone)
}

/// Rules in evaluation order.
pub const RULES: [RoutingRule; 4] = [
    RoutingRule {
        name: "override",
        decide: explicit_override,
    },
    RoutingRule {
        name: "deterministic",
        decide: deterministic_in_catalog,
    },
    RoutingRule {
        name: "critical",
        decide: critical_decision,
    },
    RoutingRule {
        name: "methodology",
        decide: named_methodology,
    },
];

/// Outcome of routing, kept for audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteDecision {
    pub kind: ExecutorKind,
    /// Name of the rule that matched, or `default`.
    pub rule: &'static str,
}

#[derive(Clone)]
pub struct Router {
    catalog: Arc<dyn ServiceCatalog>,
    fallback: ExecutorKind,
}

impl Router {
    pub fn new(catalog: Arc<dyn ServiceCatalog>, config: &Config) -> Self {
        Self {
            catalog,
            fallback: config.default_executor_kind,
        }
    }

    pub fn catalog(&self) -> &Arc<dyn ServiceCatalog> {
        &self.catalog
    }

    pub fn route(&self, task: &Task) -> ExecutorKind {
        self.explain(task).kind
    }

    /// Route and report which rule decided.
    pub fn explain(&self, task: &Task) -> RouteDecision {
        let ctx = RouteContext {
            task,
            catalog: self.catalog.as_ref(),
        };
        RULES
            .iter()
            .find_map(|rule| {
                (rule.decide)(&ctx).map(|kind| RouteDecision {
                    kind,
                    rule: rule.name,
                })
            })
            .unwrap_or(RouteDecision {
                kind: self.fallback,
                rule: "default",
            })
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("fallback", &self.fallback)
            .finish()
    }
}
