//! Domain model (ids, tasks, lifecycle, mutations, entities, errors).

pub mod entities;
pub mod errors;
pub mod ids;
pub mod mutation;
pub mod outcome;
pub mod state;
pub mod task;

pub use entities::{
    AccountDef, ConversationInfo, FolderInfo, FolderKind, MessageInfo, SyncState,
};
pub use errors::{AccountProblem, EngineError, ErrorKind, Result, TaskFailure};
pub use ids::{GroupId, Id, IdMarker, TaskId};
pub use mutation::{
    AtomicClobbers, ChangeEvent, Collection, MutationSet, OverlayKey, ReadRequest, ReadResult,
    apply_clobber,
};
pub use outcome::{ExecuteOutcome, Plan, PlanOutcome};
pub use state::TaskState;
pub use task::{PlannedTask, RawTask, TaskKind};
