//! File-based persistence for runs, artifacts and human reviews.

pub mod store;

pub use store::{
    Artifact, ArtifactId, ReviewKind, ReviewRecord, ReviewRequest, ReviewStore, RunCheckpoint, RunStore, Verdict,
};
