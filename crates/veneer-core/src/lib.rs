//! Core of the Veneer optimistic-state overlay.
//!
//! Veneer lets an application show the assumed outcome of an in-flight,
//! externally-confirmed operation while the authoritative state keeps living
//! in a remote cache that is refreshed by change events and by polling.
//!
//! This crate holds the overlay, the reconciliation queue, the event listener
//! and the garbage collector. It is deliberately free of database
//! dependencies; durable queue backends implement [`queue::QueueStore`].

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod cache;
pub mod clock;
pub mod config;
pub mod engine;
pub mod entity;
pub mod error;
pub mod gc;
pub mod listener;
pub mod overlay;
pub mod queue;
pub mod reconcile;
pub mod suppression;

mod sync;

#[cfg(test)]
mod testing;

pub use engine::{Engine, EngineBuilder};
pub use error::{Error, Result};
