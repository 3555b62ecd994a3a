//! Handler trait and its type-erased form.
//!
//! `Handler<T>` is what task authors implement; `TypedHandler<T, H>` erases
//! the argument type so the registry can keep every kind in one map of
//! `Arc<dyn DynHandler>`.

use std::marker::PhantomData;

use async_trait::async_trait;
use serde_json::Value;

use super::task::TaskArgs;
use crate::app::TaskContext;
use crate::domain::{EngineError, ExecuteOutcome, Plan, PlanOutcome, Result};

/// Plans and executes tasks of kind `T::KIND`.
///
/// ```ignore
/// struct SyncFolderListHandler;
///
/// #[async_trait]
/// impl Handler<SyncFolderList> for SyncFolderListHandler {
///     fn plan(&self, args: SyncFolderList) -> Result<Plan<SyncFolderList>> {
///         let resource = format!("folderInfo:{}", args.account_id);
///         Ok(Plan::new(args).with_resource(resource))
///     }
///
///     async fn execute(&self, ctx: &TaskContext, state: SyncFolderList) -> Result<ExecuteOutcome> {
///         // I/O, then describe the writes
///         Ok(ExecuteOutcome::done())
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<T: TaskArgs>: Send + Sync {
    /// Cheap and lock-free; runs before the task is persisted and queued.
    /// Errors here are never retried.
    fn plan(&self, args: T) -> Result<Plan<T>> {
        Ok(Plan::new(args))
    }

    async fn execute(&self, ctx: &TaskContext, state: T) -> Result<ExecuteOutcome>;

    /// Overlay namespace in which live tasks of this kind report themselves,
    /// keyed by bin key.
    fn overlay_namespace(&self) -> Option<&'static str> {
        None
    }
}

/// Object-safe view of a handler, working on JSON values.
#[async_trait]
pub trait DynHandler: Send + Sync {
    fn kind(&self) -> &'static str;

    fn bin_key(&self, args: &Value) -> Result<Option<String>>;

    fn plan_dyn(&self, args: Value) -> Result<PlanOutcome>;

    async fn execute_dyn(&self, ctx: &TaskContext, state: Value) -> Result<ExecuteOutcome>;

    fn overlay_namespace(&self) -> Option<&'static str>;
}

pub struct TypedHandler<T: TaskArgs, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: TaskArgs, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }

    fn decode(value: Value) -> Result<T> {
        serde_json::from_value(value)
            .map_err(|e| EngineError::Planning(format!("{}: invalid args: {e}", T::KIND)))
    }
}

#[async_trait]
impl<T: TaskArgs, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    fn kind(&self) -> &'static str {
        T::KIND
    }

    fn bin_key(&self, args: &Value) -> Result<Option<String>> {
        let args = Self::decode(args.clone())?;
        Ok(args.bin_key())
    }

    fn plan_dyn(&self, args: Value) -> Result<PlanOutcome> {
        let args = Self::decode(args)?;
        let plan = self.handler.plan(args)?;
        plan.erase()
            .map_err(|e| EngineError::Planning(format!("{}: plan state: {e}", T::KIND)))
    }

    async fn execute_dyn(&self, ctx: &TaskContext, state: Value) -> Result<ExecuteOutcome> {
        // a plan state that no longer decodes is not going to get better on retry
        let state: T = serde_json::from_value(state)
            .map_err(|e| EngineError::permanent(format!("{}: plan state: {e}", T::KIND)))?;
        self.handler.execute(ctx, state).await
    }

    fn overlay_namespace(&self) -> Option<&'static str> {
        self.handler.overlay_namespace()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::app::TaskContext;
    use crate::domain::{Collection, ErrorKind, MutationSet};
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(crate) struct Touch {
        pub id: String,
        #[serde(default)]
        pub resource: Option<String>,
    }

    impl TaskArgs for Touch {
        const KIND: &'static str = "touch";

        fn bin_key(&self) -> Option<String> {
            Some(self.id.clone())
        }
    }

    /// Writes `folders[id] = { touched: true }`.
    pub(crate) struct TouchHandler;

    #[async_trait]
    impl Handler<Touch> for TouchHandler {
        fn plan(&self, args: Touch) -> Result<Plan<Touch>> {
            if args.id.is_empty() {
                return Err(EngineError::Planning("empty id".into()));
            }
            let mut plan = Plan::new(args.clone());
            if let Some(resource) = args.resource {
                plan = plan.with_resource(resource);
            }
            Ok(plan)
        }

        async fn execute(&self, _ctx: &TaskContext, state: Touch) -> Result<ExecuteOutcome> {
            Ok(ExecuteOutcome::done().with_mutations(MutationSet::new().with_put(
                Collection::Folders,
                state.id,
                json!({ "touched": true }),
            )))
        }
    }

    #[test]
    fn plan_goes_through_the_typed_handler() {
        let handler = TypedHandler::<Touch, _>::new(TouchHandler);

        let plan = handler
            .plan_dyn(json!({ "id": "f1", "resource": "folderInfo:a1" }))
            .unwrap();
        assert_eq!(plan.resources, vec!["folderInfo:a1"]);
        assert_eq!(plan.state["id"], "f1");
        assert_eq!(handler.kind(), "touch");
    }

    #[test]
    fn undecodable_args_are_planning_errors() {
        let handler = TypedHandler::<Touch, _>::new(TouchHandler);

        let err = handler.plan_dyn(json!({ "nope": 1 })).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Planning);
        assert!(handler.bin_key(&json!(null)).is_err());
        assert_eq!(
            handler.bin_key(&json!({ "id": "f1" })).unwrap().as_deref(),
            Some("f1")
        );
    }

    #[tokio::test]
    async fn execute_decodes_plan_state() {
        let handler = TypedHandler::<Touch, _>::new(TouchHandler);
        let ctx = TaskContext::detached();

        let outcome = handler.execute_dyn(&ctx, json!({ "id": "f1" })).await.unwrap();
        assert_eq!(outcome.mutations.len(), 1);

        let err = handler.execute_dyn(&ctx, json!(42)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permanent);
    }
}
