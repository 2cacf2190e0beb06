//! LazyPull shared types
//!
//! Error types and well-known constants used by the puller library, its CLI
//! and the test fixtures.

pub mod constants;
pub mod errors;

pub use errors::{LazypullError, LazypullResult};
