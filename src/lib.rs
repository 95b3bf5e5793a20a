//! Tollgate - Fixed-Window Admission Control
//!
//! This crate decides, for a key and a time window, whether one more unit of
//! work may proceed. Counters live in a pluggable [`store::CounterStore`]:
//! an in-process map with background reclamation, or a Redis instance shared
//! between service replicas.

pub mod advisory;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use error::{Result, TollgateError};
pub use ratelimit::{check, Decision, RateLimiter};
pub use store::{CounterStore, MemoryStore, WindowState};
