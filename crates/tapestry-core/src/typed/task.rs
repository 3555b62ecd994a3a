//! TaskArgs trait: binds a task kind name to its argument type.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::{RawTask, TaskKind};

/// Argument type of one task kind.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// #[serde(rename_all = "camelCase")]
/// struct SyncFolderList {
///     account_id: String,
/// }
///
/// impl TaskArgs for SyncFolderList {
///     const KIND: &'static str = "sync_folder_list";
/// }
/// ```
///
/// The same type doubles as the persisted plan state, so everything planning
/// decides must fit in it.
pub trait TaskArgs: Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: &'static str;

    /// Bin key for at-most-once kinds: while a task of this kind with the
    /// same key is planned or in flight, new requests join it.
    fn bin_key(&self) -> Option<String> {
        None
    }

    fn kind() -> TaskKind {
        TaskKind::new(Self::KIND)
    }

    fn to_raw(&self) -> Result<RawTask, serde_json::Error> {
        RawTask::from_args(Self::KIND, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Sample {
        account_id: String,
    }

    impl TaskArgs for Sample {
        const KIND: &'static str = "sample";

        fn bin_key(&self) -> Option<String> {
            Some(self.account_id.clone())
        }
    }

    #[test]
    fn raw_task_carries_kind_and_args() {
        let sample = Sample {
            account_id: "a1".into(),
        };

        let raw = sample.to_raw().unwrap();
        assert_eq!(raw.kind, Sample::kind());
        assert_eq!(raw.args["accountId"], "a1");
        assert_eq!(sample.bin_key().as_deref(), Some("a1"));
    }
}
