//! Typed task API.
//!
//! Task kinds are named by an associated constant on their argument type,
//! so a typo in a kind name is a compile error rather than a lost task.
//!
//! # Two layers
//! - **Typed**: `TaskArgs`, `Handler<T>`; what task authors write
//! - **Dyn**: `DynHandler`; object-safe, used by the runtime

pub mod handler;
pub mod registry;
pub mod task;

pub use self::handler::{DynHandler, Handler, TypedHandler};
pub use self::registry::{RegistryError, TaskRegistry};
pub use self::task::TaskArgs;
