//! Offline-first synchronization core for trip planning data.
//!
//! Local mutations go through [`operations::EntityOperations`], land in
//! in-memory state and the [`store::LocalStore`], and are pushed later by
//! the [`sync::ReconciliationEngine`]. Shared trips flow the other way
//! through [`subscription::TripSubscriptionManager`].

pub mod config;
pub mod errors;
pub mod models;
pub mod operations;
pub mod remote;
pub mod session;
pub mod state;
pub mod store;
pub mod subscription;
pub mod sync;

pub use config::SyncConfig;
pub use errors::{Error, Result};
pub use session::{SessionBackends, SessionIdentity, SyncSession};
