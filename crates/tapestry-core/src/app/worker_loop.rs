//! Task execution: pick runnable tasks, run their execute phase, commit.
//!
//! # Flow
//! 1. `pump` promotes due retries, then starts every runnable task the
//!    scheduler hands out (resources acquired, slot taken)
//! 2. the execute phase runs in its own tokio task; a panic there becomes
//!    an invariant failure instead of taking the engine down
//! 3. on success the mutations, the deletion of the persisted record and
//!    the clobbers go to the store in one commit; offspring are queued in
//!    the parent's groups before the parent settles
//! 4. on failure the task is retried with backoff or failed for good

use std::time::Instant;

use crate::account::Side;
use crate::domain::{
    AtomicClobbers, Collection, EngineError, ErrorKind, ExecuteOutcome, MutationSet, PlannedTask,
    Result, TaskFailure,
};

use super::runtime::Runtime;

impl Runtime {
    /// Starts every task that can run right now.
    pub(crate) fn pump(&self) {
        let started: Vec<(PlannedTask, u32)> = {
            let mut scheduler = self.lock_scheduler();
            scheduler.promote_due(Instant::now());
            let mut started = Vec::new();
            while let Some(id) = scheduler.next_runnable() {
                if let Some(record) = scheduler.get(id) {
                    started.push((record.planned.clone(), record.attempts));
                }
            }
            started
        };

        for (planned, attempt) in started {
            tracing::debug!(
                task_id = %planned.id,
                kind = %planned.kind,
                attempt,
                resources = ?planned.exclusive_resources,
                "executing"
            );
            self.announce_task(&planned);
            let runtime = self.clone();
            tokio::spawn(async move { runtime.run_task(planned).await });
        }
    }

    fn announce_task(&self, planned: &PlannedTask) {
        let overlay = self
            .lock_scheduler()
            .get(planned.id)
            .and_then(|record| record.overlay.clone());
        if let Some(key) = overlay {
            self.shared.overlays.announce(&key);
        }
    }

    async fn run_task(self, planned: PlannedTask) {
        let Some(handler) = self.shared.registry.get(planned.kind.as_str()) else {
            let err = EngineError::Invariant(format!("no handler for queued kind {}", planned.kind));
            self.fail_task(&planned, err).await;
            return;
        };
        let ctx = self.context_for(&planned);
        let state = planned.plan_state.clone();

        let result = match tokio::spawn(async move { handler.execute_dyn(&ctx, state).await }).await {
            Ok(result) => result,
            Err(join_err) => Err(EngineError::Invariant(format!("execute panicked: {join_err}"))),
        };

        match result {
            Ok(outcome) => self.commit_outcome(&planned, outcome).await,
            Err(err) => self.execute_failed(&planned, err).await,
        }
    }

    async fn commit_outcome(&self, planned: &PlannedTask, outcome: ExecuteOutcome) {
        let ExecuteOutcome {
            mut mutations,
            atomic_clobbers,
            new_tasks,
            invalidated_overlays,
        } = outcome;
        mutations.delete(Collection::Tasks, planned.id.to_string());

        if let Err(err) = self.shared.store.commit(&mutations, &atomic_clobbers).await {
            self.commit_failed(planned, err).await;
            return;
        }

        for key in &invalidated_overlays {
            self.shared.overlays.announce(key);
        }

        let groups = self
            .lock_scheduler()
            .get(planned.id)
            .map(|record| record.groups.clone())
            .unwrap_or_default();
        for raw in new_tasks {
            let kind = raw.kind.clone();
            if let Err(err) = self.submit(raw, &groups).await {
                tracing::warn!(parent = %planned.id, kind = %kind, error = %err, "offspring rejected");
            }
        }

        let finished = self.lock_scheduler().complete(planned.id);
        self.settled(finished);
    }

    /// A commit failed: nothing of it is visible. The task is planned again
    /// from its args and goes back in line.
    async fn commit_failed(&self, planned: &PlannedTask, err: EngineError) {
        let exhausted = self
            .lock_scheduler()
            .get(planned.id)
            .is_none_or(|record| record.attempts >= record.max_attempts);
        if exhausted {
            self.fail_task(planned, EngineError::Commit(err.to_string())).await;
            return;
        }

        let replanned = match self.replan(planned) {
            Ok(replanned) => replanned,
            Err(plan_err) => {
                self.fail_task(planned, plan_err).await;
                return;
            }
        };
        tracing::warn!(task_id = %planned.id, kind = %planned.kind, error = %err, "commit failed; task re-planned");
        self.lock_scheduler()
            .replan(planned.id, replanned.clone(), err.to_string());

        match serde_json::to_value(&replanned) {
            Ok(value) => {
                let persist = MutationSet::new().with_put(Collection::Tasks, planned.id.to_string(), value);
                if let Err(err) = self.shared.store.commit(&persist, &AtomicClobbers::new()).await {
                    tracing::warn!(task_id = %planned.id, error = %err, "could not persist re-planned task");
                }
            }
            Err(err) => tracing::warn!(task_id = %planned.id, error = %err, "could not encode re-planned task"),
        }
        self.pump();
    }

    fn replan(&self, planned: &PlannedTask) -> Result<PlannedTask> {
        let handler = self
            .shared
            .registry
            .get(planned.kind.as_str())
            .ok_or_else(|| EngineError::UnknownKind(planned.kind.to_string()))?;
        let plan = handler.plan_dyn(planned.args.clone())?;
        Ok(PlannedTask {
            plan_state: plan.state,
            exclusive_resources: plan.resources,
            priority_tags: plan.priority_tags,
            ..planned.clone()
        })
    }

    async fn execute_failed(&self, planned: &PlannedTask, err: EngineError) {
        let attempts = self
            .lock_scheduler()
            .get(planned.id)
            .map_or(0, |record| record.attempts);

        if err.is_retryable() && self.shared.retry.should_retry(attempts) {
            let delay = self.shared.retry.next_delay(attempts);
            self.lock_scheduler()
                .schedule_retry(planned.id, Instant::now() + delay, err.to_string());
            tracing::debug!(
                task_id = %planned.id,
                kind = %planned.kind,
                attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retry scheduled"
            );
            self.announce_task(planned);

            let runtime = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                runtime.pump();
            });
            self.pump();
            return;
        }

        self.fail_task(planned, err).await;
    }

    /// Fails the task for good: drops its persisted record, reports any
    /// account problem, and settles its signal and groups.
    async fn fail_task(&self, planned: &PlannedTask, err: EngineError) {
        let forget = MutationSet::new().with_delete(Collection::Tasks, planned.id.to_string());
        if let Err(commit_err) = self.shared.store.commit(&forget, &AtomicClobbers::new()).await {
            tracing::warn!(task_id = %planned.id, error = %commit_err, "could not drop persisted task");
        }

        if let Some(problem) = err.account_problem()
            && let Some(account_id) = planned.args.get("accountId").and_then(|v| v.as_str())
        {
            self.report_account_problem(account_id, problem, Side::Incoming)
                .await;
        }

        let error_kind = err.kind();
        if error_kind == ErrorKind::Invariant {
            tracing::error!(task_id = %planned.id, kind = %planned.kind, error = %err, "task failed");
        } else {
            tracing::warn!(task_id = %planned.id, kind = %planned.kind, error = %err, "task failed");
        }

        let failure = TaskFailure {
            task_id: planned.id,
            kind: planned.kind.clone(),
            error_kind,
            message: err.to_string(),
        };
        let finished = self.lock_scheduler().fail(planned.id, failure);
        self.settled(finished);
    }
}
