//! REST backend for the tripsync remote document store.
//!
//! [`DocumentClient`] speaks a Firestore-style HTTP API and implements
//! [`tripsync_core::remote::DocumentStore`], so a sync session can run
//! against a hosted database instead of the in-process store.

pub mod client;
pub mod error;
pub mod types;

pub use client::DocumentClient;
pub use error::{DocumentClientError, Result};
