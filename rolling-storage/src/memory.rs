//! In-process stores for tests and single-process runs.
//!
//! These give the same atomicity guarantees as the PostgreSQL repositories
//! within one process, but nothing is shared across processes or persisted.

pub mod task;
pub mod run;

pub use task::*;
pub use run::*;
