//! Dirty tracking and the reconciliation push path.

mod connectivity;
mod dirty_queue;
mod reconcile;
mod scheduler;
mod sync_model;

pub use connectivity::*;
pub use dirty_queue::*;
pub use reconcile::*;
pub use scheduler::*;
pub use sync_model::*;

#[cfg(test)]
mod tests;
