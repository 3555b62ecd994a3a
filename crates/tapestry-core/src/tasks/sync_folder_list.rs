use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::app::TaskContext;
use crate::domain::{Collection, ExecuteOutcome, FolderInfo, MutationSet, Plan, Result};
use crate::typed::{Handler, TaskArgs};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFolderList {
    pub account_id: String,
}

impl TaskArgs for SyncFolderList {
    const KIND: &'static str = "sync_folder_list";
}

/// Replaces the stored folders of an account with the remote list.
pub struct SyncFolderListHandler;

#[async_trait]
impl Handler<SyncFolderList> for SyncFolderListHandler {
    fn plan(&self, args: SyncFolderList) -> Result<Plan<SyncFolderList>> {
        let resource = format!("folderInfo:{}", args.account_id);
        Ok(Plan::new(args).with_resource(resource))
    }

    async fn execute(&self, ctx: &TaskContext, state: SyncFolderList) -> Result<ExecuteOutcome> {
        let account = ctx.account(&state.account_id)?;
        let remote = account.receiver().list_folders().await?;

        let mut stale: BTreeSet<String> = ctx
            .scan(Collection::Folders)
            .await?
            .into_iter()
            .filter_map(|(_, value)| serde_json::from_value::<FolderInfo>(value).ok())
            .filter(|folder| folder.account_id == state.account_id)
            .map(|folder| folder.id)
            .collect();

        let mut mutations = MutationSet::new();
        for mut folder in remote {
            folder.account_id = state.account_id.clone();
            stale.remove(&folder.id);
            mutations.put(Collection::Folders, folder.id.clone(), serde_json::to_value(&folder)?);
        }
        for id in stale {
            mutations.delete(Collection::Folders, id);
        }

        tracing::debug!(account_id = %state.account_id, writes = mutations.len(), "folder list synced");
        Ok(ExecuteOutcome::done().with_mutations(mutations))
    }
}
