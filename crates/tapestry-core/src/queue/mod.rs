//! Queue module: lock table, task records, groups, retry policy and the
//! scheduler that ties them together.

mod group;
mod lock_table;
mod record;
mod retry;
mod scheduler;

pub use group::{SettledGroup, TaskGroups};
pub use lock_table::{Acquire, ResourceLockTable};
pub use record::{Completion, Settlement, TaskRecord};
pub use retry::RetryPolicy;
pub use scheduler::{Finished, Scheduler, TaskCounts};
