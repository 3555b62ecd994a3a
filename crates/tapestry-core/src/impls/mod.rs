//! Impls: in-process implementations of the ports.
//!
//! - **MemoryStore**: the durable store kept in memory, with fault injection
//! - **DataOverlayManager**: overlay providers and invalidation announcements
//! - **Emitter**: synchronous listener lists used by both
//! - **ScriptedReceiver / ScriptedSender**: canned account halves

pub mod emitter;
pub mod memory_store;
pub mod overlay;
pub mod scripted;

pub use self::emitter::{Emitter, ListenerId};
pub use self::memory_store::MemoryStore;
pub use self::overlay::{DataOverlayManager, OverlayResolver};
pub use self::scripted::{ReceiverCalls, ScriptedReceiver, ScriptedSender};
