//! Vigil controller: mirrors one resource kind into a local cache and drives
//! a reconciler for every key that changes.
//!
//! Data flows one way: `Reflector` → delta channel → `EventHandler` →
//! `WorkQueue` → `Worker`s → `Reconciler`. Workers read objects from the cache,
//! never from the deltas.

#![forbid(unsafe_code)]

pub mod config;
pub mod controller;
pub mod decoder;
pub mod handler;
pub mod reflector;
pub mod worker;

use vigil_core::TransportError;

pub use config::ControllerConfig;
pub use controller::{Controller, ControllerHandle};
pub use decoder::{decode, key_listing, Decoded};
pub use handler::{dispatch, run_handler, EnqueueHandler, EventHandler};
pub use reflector::{Backoff, Reflector};
pub use worker::{reconciler_fn, FnReconciler, Reconciler, Worker, WorkerState};

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("list/watch failed {attempts} times in a row: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: TransportError,
    },
    #[error("controller task failed: {0}")]
    Task(String),
}
