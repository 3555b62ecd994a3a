use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::app::TaskContext;
use crate::domain::{
    Collection, ConversationInfo, ExecuteOutcome, MutationSet, Plan, ReadRequest, Result,
};
use crate::typed::{Handler, TaskArgs};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConversation {
    pub account_id: String,
    pub item_id: String,
}

impl TaskArgs for SyncConversation {
    const KIND: &'static str = "sync_conversation";
}

/// Fetches one remote item and stores its conversation and messages.
pub struct SyncConversationHandler;

#[async_trait]
impl Handler<SyncConversation> for SyncConversationHandler {
    fn plan(&self, args: SyncConversation) -> Result<Plan<SyncConversation>> {
        let resource = format!("conversation:{}:{}", args.account_id, args.item_id);
        Ok(Plan::new(args).with_resource(resource))
    }

    async fn execute(&self, ctx: &TaskContext, state: SyncConversation) -> Result<ExecuteOutcome> {
        let read = ctx
            .begin_mutate(ReadRequest::new().with(Collection::Conversations, state.item_id.as_str()))
            .await?;
        let mut stale: BTreeSet<String> = read
            .decode::<ConversationInfo>(Collection::Conversations, &state.item_id)?
            .map(|stored| stored.message_ids.into_iter().collect())
            .unwrap_or_default();

        let account = ctx.account(&state.account_id)?;
        let item = account.receiver().fetch_item(&state.item_id).await?;
        let mut conversation = item.conversation;
        conversation.account_id = state.account_id.clone();
        conversation.message_count = u32::try_from(item.messages.len()).unwrap_or(u32::MAX);
        conversation.message_ids = item.messages.iter().map(|m| m.id.clone()).collect();

        let mut mutations = MutationSet::new();
        for mut message in item.messages {
            message.conversation_id = conversation.id.clone();
            message.account_id = state.account_id.clone();
            stale.remove(&message.id);
            mutations.put(Collection::Messages, message.id.clone(), serde_json::to_value(&message)?);
        }
        for id in stale {
            mutations.delete(Collection::Messages, id);
        }
        mutations.put(
            Collection::Conversations,
            conversation.id.clone(),
            serde_json::to_value(&conversation)?,
        );

        Ok(ExecuteOutcome::done().with_mutations(mutations))
    }
}
