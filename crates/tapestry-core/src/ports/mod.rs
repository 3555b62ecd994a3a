//! Ports: the seams between the engine and its collaborators.
//!
//! Each trait hides one external concern (time, ids, the durable store,
//! overlay providers) so tests can swap in deterministic implementations.

pub mod clock;
pub mod id_generator;
pub mod overlay;
pub mod store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::overlay::OverlayProvider;
pub use self::store::{ChangeListener, ItemWatch, Store, Watch, WatchId};
