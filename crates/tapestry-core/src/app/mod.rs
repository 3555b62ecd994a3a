//! App: the engine assembled from ports, queue and typed handlers.
//!
//! # Main pieces
//! - **EngineBuilder**: wiring and startup checks
//! - **Runtime**: schedule, resume, account operations, priority tags
//! - **worker_loop**: execute, commit, retry
//! - **TaskContext**: what an execute phase can reach

pub mod builder;
pub mod context;
pub mod runtime;
mod worker_loop;

pub use self::builder::{BuildError, EngineBuilder};
pub use self::context::TaskContext;
pub use self::runtime::{Runtime, RuntimeEvent, Submission};
