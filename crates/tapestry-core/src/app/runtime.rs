//! Runtime: the engine surface used by the bridge and by offspring.
//!
//! `schedule` runs the plan phase, persists the planned record, and queues
//! it. Execution, commit and retry live in `worker_loop`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::{Map, Value, json};

use super::context::TaskContext;
use crate::account::{AccountManager, Side};
use crate::config::EngineConfig;
use crate::domain::{
    AccountDef, AccountProblem, AtomicClobbers, Collection, EngineError, ErrorKind, MutationSet,
    OverlayKey, PlannedTask, RawTask, ReadRequest, Result, TaskFailure, TaskId, TaskKind, TaskState,
};
use crate::impls::{DataOverlayManager, Emitter, ListenerId};
use crate::ports::{Clock, IdGenerator, Store, UlidGenerator};
use crate::queue::{Completion, Finished, RetryPolicy, Scheduler, TaskCounts};
use crate::toc::{ACCOUNT_CASCADE_TO_FOLDERS, TocItem, TocRegistry};
use crate::typed::TaskRegistry;

/// Something the bridge forwards to every client.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    BadLogin {
        account_id: String,
        problem: AccountProblem,
        side: Side,
    },
}

/// What `schedule` hands back.
#[derive(Debug, Clone)]
pub struct Submission {
    pub task_id: TaskId,
    /// `Queued`, or `Superseded` when the request joined a live task.
    pub state: TaskState,
    pub completion: Completion,
    /// The group the task runs in, if its plan named one.
    pub group: Option<Completion>,
}

impl Submission {
    pub async fn wait(self) -> Result<()> {
        self.completion.wait().await
    }

    /// Waits for the whole group, offspring included; falls back to the
    /// task itself when it has no group.
    pub async fn wait_group(self) -> Result<()> {
        match self.group {
            Some(group) => group.wait().await,
            None => self.completion.wait().await,
        }
    }
}

pub(crate) struct RuntimeParts {
    pub store: Arc<dyn Store>,
    pub accounts: Arc<AccountManager>,
    pub clock: Arc<dyn Clock>,
    pub registry: TaskRegistry,
    pub config: EngineConfig,
}

pub(crate) struct Shared {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) overlays: Arc<DataOverlayManager>,
    pub(crate) registry: TaskRegistry,
    pub(crate) accounts: Arc<AccountManager>,
    pub(crate) tocs: Arc<TocRegistry>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) ids: Arc<dyn IdGenerator>,
    pub(crate) retry: RetryPolicy,
    pub(crate) scheduler: Mutex<Scheduler>,
    pub(crate) events: Emitter<RuntimeEvent>,
}

/// Cheap to clone; every clone drives the same engine.
#[derive(Clone)]
pub struct Runtime {
    pub(crate) shared: Arc<Shared>,
}

impl Runtime {
    pub(crate) fn from_parts(parts: RuntimeParts) -> Self {
        let shared = Arc::new(Shared {
            overlays: Arc::new(DataOverlayManager::new()),
            tocs: Arc::new(TocRegistry::new(Arc::clone(&parts.store))),
            ids: Arc::new(UlidGenerator::new(Arc::clone(&parts.clock))),
            retry: RetryPolicy::from_config(&parts.config.retry),
            scheduler: Mutex::new(Scheduler::new(parts.config.scheduler.max_concurrent)),
            events: Emitter::new(),
            store: parts.store,
            registry: parts.registry,
            accounts: parts.accounts,
            clock: parts.clock,
        });

        for kind in shared.registry.registered_kinds() {
            let Some(handler) = shared.registry.get(&kind) else {
                continue;
            };
            if let Some(namespace) = handler.overlay_namespace() {
                let weak = Arc::downgrade(&shared);
                let provider_kind = TaskKind::new(kind.clone());
                shared.overlays.register_provider(
                    namespace,
                    kind,
                    Arc::new(move |key: &str| task_overlay(&weak, &provider_kind, key)),
                );
            }
        }

        Self { shared }
    }

    /// Plans, persists and queues a task.
    ///
    /// A request whose bin key matches a live task of the same kind joins
    /// that task instead; the returned submission is then `Superseded`.
    pub async fn schedule(&self, raw: RawTask) -> Result<Submission> {
        self.submit(raw, &[]).await
    }

    /// Like [`Self::schedule`], also tracking the task in `inherited` groups.
    pub(crate) async fn submit(&self, raw: RawTask, inherited: &[String]) -> Result<Submission> {
        let handler = self
            .shared
            .registry
            .get(raw.kind.as_str())
            .ok_or_else(|| EngineError::UnknownKind(raw.kind.to_string()))?;
        let bin_key = handler.bin_key(&raw.args)?;

        if let Some(joined) = self.join_bin(&raw.kind, bin_key.as_deref(), inherited) {
            return Ok(joined);
        }

        let id = self.shared.ids.generate_task_id();
        let plan = handler.plan_dyn(raw.args.clone()).inspect_err(|err| {
            tracing::warn!(task_id = %id, kind = %raw.kind, error = %err, "planning rejected");
        })?;
        let planned = PlannedTask {
            id,
            kind: raw.kind,
            args: raw.args,
            plan_state: plan.state,
            exclusive_resources: plan.resources,
            priority_tags: plan.priority_tags,
            bin_key,
            group: plan.group,
        };
        let persisted = serde_json::to_value(&planned)?;
        let overlay = handler
            .overlay_namespace()
            .zip(planned.bin_key.as_ref())
            .map(|(namespace, key)| OverlayKey::new(namespace, key));

        let (completion, group) = {
            let mut scheduler = self.lock_scheduler();
            // another request may have taken the bin while this one planned
            if let Some(joined) = Self::join_bin_locked(
                &mut scheduler,
                &self.shared,
                &planned.kind,
                planned.bin_key.as_deref(),
                inherited,
            ) {
                return Ok(joined);
            }
            let completion = scheduler.insert(planned.clone(), self.shared.retry.max_attempts);
            let mut group = None;
            for name in planned.group.iter().chain(inherited) {
                let signal = scheduler.track_group(name, id, || self.shared.ids.generate_group_id());
                if group.is_none() {
                    group = Some(signal);
                }
            }
            if let Some(record) = scheduler.get_mut(id) {
                record.overlay = overlay.clone();
            }
            (completion, group)
        };

        let persist = MutationSet::new().with_put(Collection::Tasks, id.to_string(), persisted);
        if let Err(err) = self.shared.store.commit(&persist, &AtomicClobbers::new()).await {
            tracing::warn!(task_id = %id, kind = %planned.kind, error = %err, "could not persist planned task");
            let failure = TaskFailure {
                task_id: id,
                kind: planned.kind.clone(),
                error_kind: ErrorKind::Commit,
                message: err.to_string(),
            };
            let finished = self.lock_scheduler().fail(id, failure);
            self.settled(finished);
            return Err(EngineError::Commit(format!("persisting {id}: {err}")));
        }

        self.lock_scheduler().enqueue(id);
        tracing::debug!(task_id = %id, kind = %planned.kind, resources = ?planned.exclusive_resources, "task queued");
        if let Some(key) = &overlay {
            self.shared.overlays.announce(key);
        }
        self.pump();

        Ok(Submission {
            task_id: id,
            state: TaskState::Queued,
            completion,
            group,
        })
    }

    fn join_bin(&self, kind: &TaskKind, bin_key: Option<&str>, inherited: &[String]) -> Option<Submission> {
        let mut scheduler = self.lock_scheduler();
        Self::join_bin_locked(&mut scheduler, &self.shared, kind, bin_key, inherited)
    }

    fn join_bin_locked(
        scheduler: &mut Scheduler,
        shared: &Shared,
        kind: &TaskKind,
        bin_key: Option<&str>,
        inherited: &[String],
    ) -> Option<Submission> {
        let holder = scheduler.bin_holder(kind, bin_key?)?;
        for name in inherited {
            scheduler.track_group(name, holder, || shared.ids.generate_group_id());
        }
        let record = scheduler.get(holder)?;
        let group = record
            .planned
            .group
            .as_deref()
            .or(record.groups.first().map(String::as_str))
            .and_then(|name| scheduler.group_completion(name));
        tracing::debug!(task_id = %holder, kind = %kind, "request joined live task");
        Some(Submission {
            task_id: holder,
            state: TaskState::Superseded,
            completion: record.completion(),
            group,
        })
    }

    /// Re-queues the planned records left in the `tasks` collection by a
    /// previous run. Returns how many were resumed.
    pub async fn resume(&self) -> Result<usize> {
        let persisted = self.shared.store.scan(Collection::Tasks).await?;
        let mut resumed = Vec::new();
        let mut stale = MutationSet::new();
        for (key, value) in persisted {
            let planned: PlannedTask = match serde_json::from_value(value) {
                Ok(planned) => planned,
                Err(err) => {
                    tracing::warn!(record = %key, error = %err, "dropping undecodable task record");
                    stale.delete(Collection::Tasks, key);
                    continue;
                }
            };
            let Some(handler) = self.shared.registry.get(planned.kind.as_str()) else {
                tracing::warn!(task_id = %planned.id, kind = %planned.kind, "dropping task of unknown kind");
                stale.delete(Collection::Tasks, key);
                continue;
            };

            let mut scheduler = self.lock_scheduler();
            if let Some(key) = planned.bin_key.as_deref()
                && scheduler.bin_holder(&planned.kind, key).is_some()
            {
                drop(scheduler);
                stale.delete(Collection::Tasks, planned.id.to_string());
                continue;
            }
            let id = planned.id;
            scheduler.insert(planned.clone(), self.shared.retry.max_attempts);
            if let Some(name) = &planned.group {
                scheduler.track_group(name, id, || self.shared.ids.generate_group_id());
            }
            let overlay = handler
                .overlay_namespace()
                .zip(planned.bin_key.as_ref())
                .map(|(namespace, key)| OverlayKey::new(namespace, key));
            if let Some(record) = scheduler.get_mut(id) {
                record.overlay = overlay.clone();
            }
            scheduler.enqueue(id);
            drop(scheduler);
            resumed.push(overlay);
        }

        if !stale.is_empty()
            && let Err(err) = self.shared.store.commit(&stale, &AtomicClobbers::new()).await
        {
            tracing::warn!(error = %err, "could not drop stale task records");
        }
        for key in resumed.iter().flatten() {
            self.shared.overlays.announce(key);
        }
        tracing::info!(count = resumed.len(), "resumed persisted tasks");
        self.pump();
        Ok(resumed.len())
    }

    /// Boosts every queued task carrying `tag`.
    pub fn set_priority_tag(&self, tag: impl Into<String>, boost: i32) {
        self.lock_scheduler().set_priority(tag, boost);
        self.pump();
    }

    pub fn clear_priority_tag(&self, tag: &str) {
        self.lock_scheduler().clear_priority(tag);
        self.pump();
    }

    pub fn priority_boost(&self, tag: &str) -> Option<i32> {
        self.lock_scheduler().boost(tag)
    }

    /// Records `problem` on the account and tells every client.
    pub async fn report_account_problem(&self, account_id: &str, problem: AccountProblem, side: Side) {
        let mut problems = match self.read_account(account_id).await {
            Ok(Some(account)) => account.problems,
            Ok(None) => Vec::new(),
            Err(err) => {
                tracing::warn!(account_id, error = %err, "could not read account");
                Vec::new()
            }
        };
        if !problems.contains(&problem) {
            problems.push(problem);
            let clobbers =
                AtomicClobbers::new().with_patch(Collection::Accounts, account_id, "problems", json!(problems));
            if let Err(err) = self.shared.store.commit(&MutationSet::new(), &clobbers).await {
                tracing::warn!(account_id, error = %err, "could not record account problem");
            }
            self.announce_account(account_id);
        }
        tracing::warn!(account_id, problem = %problem, ?side, "account problem");
        self.shared.events.emit(&RuntimeEvent::BadLogin {
            account_id: account_id.to_string(),
            problem,
            side,
        });
    }

    /// Re-checks both sides of the account and clears its recorded problems
    /// when neither reports an authentication problem.
    ///
    /// Returns whether the problems were cleared.
    pub async fn clear_account_problems(&self, account_id: &str) -> Result<bool> {
        let account = self.shared.accounts.get(account_id)?;
        let check = account.check_account().await;
        if !check.can_clear_problems() {
            for (side, problem) in [(Side::Incoming, check.incoming), (Side::Outgoing, check.outgoing)] {
                if let Some(problem) = problem.filter(|p| p.is_authentication()) {
                    self.report_account_problem(account_id, problem, side).await;
                }
            }
            return Ok(false);
        }

        let clobbers = AtomicClobbers::new().with_patch(
            Collection::Accounts,
            account_id,
            "problems",
            Value::Array(Vec::new()),
        );
        self.shared.store.commit(&MutationSet::new(), &clobbers).await?;
        self.announce_account(account_id);
        tracing::info!(account_id, "account problems cleared");
        Ok(true)
    }

    /// Overwrites top-level fields of the account record.
    pub async fn modify_account(&self, account_id: &str, mods: Map<String, Value>) -> Result<()> {
        if self.read_account(account_id).await?.is_none() {
            return Err(EngineError::UnknownAccount(account_id.to_string()));
        }
        let mut clobbers = AtomicClobbers::new();
        for (field, value) in mods {
            if field == "id" {
                return Err(EngineError::permanent("an account id cannot be modified"));
            }
            clobbers.patch(Collection::Accounts, account_id, field, value);
        }
        if clobbers.is_empty() {
            return Ok(());
        }
        self.shared.store.commit(&MutationSet::new(), &clobbers).await?;
        self.announce_account(account_id);
        Ok(())
    }

    async fn read_account(&self, account_id: &str) -> Result<Option<AccountDef>> {
        let read = self
            .shared
            .store
            .read(&ReadRequest::new().with(Collection::Accounts, account_id))
            .await?;
        Ok(read.decode(Collection::Accounts, account_id)?)
    }

    fn announce_account(&self, account_id: &str) {
        self.shared
            .overlays
            .announce(&OverlayKey::new(AccountDef::OVERLAY_NAMESPACE, account_id));
        self.shared
            .overlays
            .announce(&OverlayKey::new(ACCOUNT_CASCADE_TO_FOLDERS, account_id));
    }

    pub fn on_event(&self, listener: Arc<dyn Fn(&RuntimeEvent) + Send + Sync>) -> ListenerId {
        self.shared.events.on(listener)
    }

    pub fn off_event(&self, id: ListenerId) {
        self.shared.events.off(id);
    }

    pub fn counts(&self) -> TaskCounts {
        self.lock_scheduler().counts()
    }

    /// Task currently holding `resource`.
    pub fn resource_holder(&self, resource: &str) -> Option<TaskId> {
        self.lock_scheduler().holder(resource)
    }

    /// Signal of a live group, if it exists.
    pub fn group_completion(&self, name: &str) -> Option<Completion> {
        self.lock_scheduler().group_completion(name)
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.shared.store
    }

    pub fn overlays(&self) -> &Arc<DataOverlayManager> {
        &self.shared.overlays
    }

    pub fn tocs(&self) -> &Arc<TocRegistry> {
        &self.shared.tocs
    }

    pub fn accounts(&self) -> &Arc<AccountManager> {
        &self.shared.accounts
    }

    pub fn registered_kinds(&self) -> Vec<String> {
        self.shared.registry.registered_kinds()
    }

    pub(crate) fn context_for(&self, planned: &PlannedTask) -> TaskContext {
        TaskContext::new(
            planned.id,
            planned.kind.clone(),
            Arc::clone(&self.shared.store),
            Arc::clone(&self.shared.accounts),
            Arc::clone(&self.shared.clock),
        )
    }

    pub(crate) fn lock_scheduler(&self) -> MutexGuard<'_, Scheduler> {
        self.shared
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Bookkeeping for a task that just left the scheduler.
    pub(crate) fn settled(&self, finished: Option<Finished>) {
        let Some(Finished { record, groups }) = finished else {
            return;
        };
        if let Some(key) = &record.overlay {
            self.shared.overlays.announce(key);
        }
        for group in groups {
            match &group.result {
                Ok(()) => tracing::info!(group = %group.name, group_id = %group.id, "group completed"),
                Err(failure) => tracing::warn!(
                    group = %group.name,
                    group_id = %group.id,
                    failed_task = %failure.task_id,
                    "group failed"
                ),
            }
        }
        tracing::info!(
            task_id = %record.id(),
            kind = %record.planned.kind,
            state = record.state.as_str(),
            attempts = record.attempts,
            "task finished"
        );
        self.pump();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("kinds", &self.registered_kinds())
            .field("counts", &self.counts())
            .finish()
    }
}

/// Overlay reported by a task kind for its bin key while a task is live.
fn task_overlay(shared: &Weak<Shared>, kind: &TaskKind, bin_key: &str) -> Option<Value> {
    let shared = shared.upgrade()?;
    let scheduler = shared
        .scheduler
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    let holder = scheduler.bin_holder(kind, bin_key)?;
    let record = scheduler.get(holder)?;
    Some(json!({
        "kind": kind.as_str(),
        "status": record.state.as_str(),
    }))
}
