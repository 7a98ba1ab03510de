// Public fallible APIs in this crate share one concrete error contract (`StrideError`).
// Repeating per-function `# Errors` boilerplate obscures behavior more than it clarifies.
#![allow(
    clippy::missing_errors_doc,
    reason = "crate-wide fallible API uses one explicit error type; per-item boilerplate would duplicate contract"
)]

pub mod cache;
pub(crate) mod config;
pub mod degrade;
pub mod engine;
pub mod error;
pub mod models;
pub mod policy;
pub mod queue;
pub mod remote;
pub mod status;
pub mod store;

pub use cache::DurableCache;
pub use engine::SyncEngine;
pub use error::{Result, StrideError};
pub use models::{
    EngineDiagnostics, EntityKind, Goal, GoalChanges, Identity, Integration, IntegrationChanges,
    MutationKind, PendingMutation, PersistOutcome, SyncStatus, Task, TaskChanges,
};
pub use queue::MutationQueue;
pub use remote::{AuthCollaborator, HttpRemote, RemoteConfig, RemoteDataSource};
pub use status::SyncStatusMachine;
pub use store::{CollectionSnapshot, MutationReceipt, OptimisticStateStore, Patch};
