//! Orchestration layer of the engine.
//!
//! Routing, the executor adapters, error policy, caching, quality gates,
//! organizers and the engine that schedules a workflow over all of them.

pub mod adapters;
pub mod backend;
pub mod cache;
pub mod catalog;
pub mod engine;
pub mod events;
pub mod gate;
pub mod human;
pub mod metrics;
pub mod organizer;
pub mod retry;
pub mod router;

pub use adapters::{Adapters, ExecutionAdapter, ExecutionContext};
pub use backend::{CommandBackend, ReasoningBackend, ReasoningRequest, ReasoningResponse};
pub use cache::{CacheStats, ResultCache};
pub use catalog::{DeterministicImplementation, ServiceCatalog, StaticCatalog};
pub use engine::{Engine, EngineBuilder, NodeReport, RunReport};
pub use events::{write_jsonl, EngineEvent, EventSink};
pub use gate::{GateReport, QualityGateManager, QualityGateResult, Reviewer};
pub use human::ReviewQueue;
pub use metrics::{PerformanceTracker, TaskMetrics};
pub use organizer::{ItemOutcome, Organizer, WorkQueue};
pub use retry::{RetryCoordinator, TaskOutcome};
pub use router::{RouteDecision, Router};
