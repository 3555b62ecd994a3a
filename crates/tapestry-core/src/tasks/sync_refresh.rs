use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::SyncConversation;
use crate::app::TaskContext;
use crate::domain::{
    AccountDef, AtomicClobbers, Collection, ExecuteOutcome, MutationSet, Plan, ReadRequest, Result,
    SyncState,
};
use crate::toc::{ACCOUNT_CASCADE_TO_FOLDERS, TocItem};
use crate::typed::{Handler, TaskArgs};

/// Incremental sync of one account. At most one per account is live; a
/// second request joins the first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRefresh {
    pub account_id: String,
    /// Folder the user is looking at, if any; boosts the sync while its
    /// view is open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<String>,
}

impl SyncRefresh {
    pub fn group_name(account_id: &str) -> String {
        format!("{}:{account_id}", Self::KIND)
    }
}

impl TaskArgs for SyncRefresh {
    const KIND: &'static str = "sync_refresh";

    fn bin_key(&self) -> Option<String> {
        Some(self.account_id.clone())
    }
}

pub struct SyncRefreshHandler;

#[async_trait]
impl Handler<SyncRefresh> for SyncRefreshHandler {
    fn plan(&self, args: SyncRefresh) -> Result<Plan<SyncRefresh>> {
        let account_id = args.account_id.clone();
        let mut plan = Plan::new(args.clone())
            .with_resource("online")
            .with_resource(format!("credentials!{account_id}"))
            .with_resource(format!("happy!{account_id}"))
            .in_group(SyncRefresh::group_name(&account_id));
        if let Some(folder_id) = &args.folder_id {
            plan = plan.with_priority_tag(format!("view:folder:{folder_id}"));
        }
        Ok(plan)
    }

    async fn execute(&self, ctx: &TaskContext, state: SyncRefresh) -> Result<ExecuteOutcome> {
        let account_id = state.account_id.as_str();
        let read = ctx
            .begin_mutate(
                ReadRequest::new()
                    .with(Collection::SyncStates, account_id)
                    .with(Collection::Accounts, account_id),
            )
            .await?;
        let sync: SyncState = read
            .decode(Collection::SyncStates, account_id)?
            .unwrap_or_default();

        let account = ctx.account(account_id)?;
        // inclusive of the watermark; items sharing it are synced again
        let changes = account.receiver().fetch_changes(sync.watermark).await?;
        let watermark = changes.iter().map(|c| c.modified).max().max(sync.watermark);

        let mutations = MutationSet::new().with_put(
            Collection::SyncStates,
            account_id,
            serde_json::to_value(SyncState { watermark })?,
        );
        let mut outcome = ExecuteOutcome::done().with_mutations(mutations);
        for change in &changes {
            let offspring = SyncConversation {
                account_id: state.account_id.clone(),
                item_id: change.item_id.clone(),
            };
            outcome = outcome.spawn(offspring.to_raw()?);
        }

        if read.get(Collection::Accounts, account_id).is_some() {
            outcome = outcome.with_clobbers(AtomicClobbers::new().with_patch(
                Collection::Accounts,
                account_id,
                "syncInfo",
                json!({
                    "lastSuccessfulSyncAt": ctx.now_millis(),
                    "changes": changes.len(),
                }),
            ));
        }

        tracing::debug!(account_id, changes = changes.len(), ?watermark, "account refreshed");
        Ok(outcome
            .invalidate(AccountDef::OVERLAY_NAMESPACE, account_id)
            .invalidate(ACCOUNT_CASCADE_TO_FOLDERS, account_id))
    }

    fn overlay_namespace(&self) -> Option<&'static str> {
        Some(AccountDef::OVERLAY_NAMESPACE)
    }
}
