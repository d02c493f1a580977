//! Integration test suite for aios.
//!
//! These tests drive the engine end to end through declarations, the
//! router, error policies, fork/join scheduling, organizers and the
//! quality gates.
//!
//! # Test Categories
//!
//! - `sequential`: Data flow, input binding, caching and validation
//! - `routing`: Executor selection
//! - `joins`: Merge strategies and branch cancellation
//! - `retry`: Retry, fallback and timeouts
//! - `organizer`: Work distribution and reassignment
//! - `gates`: Quality gates and human review
//! - `reviews`: Runs paused on reviews and continued later
//!
//! # CI Compatibility
//!
//! Agent work is served by a scripted adapter, so no external reasoning
//! backend is needed.

mod fixtures;

mod gates;
mod joins;
mod organizer;
mod retry;
mod reviews;
mod routing;
mod sequential;
