use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use rstest::rstest;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;

use tapestry_core::account::{AccountManager, CompositeAccount, RemoteItem};
use tapestry_core::app::{EngineBuilder, Runtime, TaskContext};
use tapestry_core::bridge::{Bridge, BridgeMessage, Command, Handle, ListChange};
use tapestry_core::config::EngineConfig;
use tapestry_core::domain::{
    AccountDef, AtomicClobbers, ChangeEvent, Collection, ConversationInfo, ExecuteOutcome,
    FolderInfo, FolderKind, MessageInfo, MutationSet, Plan, Result, TaskState,
};
use tapestry_core::impls::{MemoryStore, ScriptedReceiver, ScriptedSender};
use tapestry_core::ports::Store;
use tapestry_core::tasks::SyncRefresh;
use tapestry_core::typed::{Handler, TaskArgs};

fn conversation(id: &str, date: i64) -> ConversationInfo {
    ConversationInfo {
        id: id.into(),
        account_id: "a1".into(),
        folder_ids: vec!["inbox".into()],
        subject: format!("subject {id}"),
        date,
        message_count: 1,
        message_ids: Vec::new(),
    }
}

fn remote_item(id: &str, date: i64) -> RemoteItem {
    RemoteItem {
        conversation: conversation(id, date),
        messages: vec![MessageInfo {
            id: format!("{id}-m1"),
            conversation_id: id.into(),
            account_id: "a1".into(),
            date,
            author: "kim".into(),
            body: "hello".into(),
        }],
    }
}

struct Engine {
    runtime: Runtime,
    store: Arc<MemoryStore>,
    receiver: Arc<ScriptedReceiver>,
}

async fn engine() -> Engine {
    let store = Arc::new(MemoryStore::new());
    store
        .commit(
            &MutationSet::new().with_put(Collection::Accounts, "a1", json!({ "id": "a1", "name": "Work" })),
            &AtomicClobbers::new(),
        )
        .await
        .unwrap();
    let receiver = Arc::new(ScriptedReceiver::new());
    receiver.set_folders(vec![FolderInfo {
        id: "inbox".into(),
        account_id: "a1".into(),
        path: "INBOX".into(),
        name: "Inbox".into(),
        kind: FolderKind::Inbox,
    }]);
    let accounts = Arc::new(AccountManager::new());
    accounts.insert(CompositeAccount::new("a1", receiver.clone(), Arc::new(ScriptedSender::new())));
    let shared: Arc<dyn Store> = store.clone();
    let runtime = EngineBuilder::new()
        .with_builtin_tasks()
        .unwrap()
        .store(shared)
        .accounts(accounts)
        .build()
        .unwrap();
    Engine {
        runtime,
        store,
        receiver,
    }
}

async fn next(rx: &mut UnboundedReceiver<BridgeMessage>) -> BridgeMessage {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("bridge went quiet")
        .expect("bridge closed")
}

async fn next_for(rx: &mut UnboundedReceiver<BridgeMessage>, handle: Handle) -> BridgeMessage {
    loop {
        let message = next(rx).await;
        if message.handle() == Some(handle) {
            return message;
        }
    }
}

/// Everything received up to and including the first message for `handle`
/// that `done` accepts.
async fn collect_until(
    rx: &mut UnboundedReceiver<BridgeMessage>,
    handle: Handle,
    done: impl Fn(&BridgeMessage) -> bool,
) -> Vec<BridgeMessage> {
    let mut seen = Vec::new();
    loop {
        let message = next(rx).await;
        let finished = message.handle() == Some(handle) && done(&message);
        seen.push(message);
        if finished {
            return seen;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claim {
    resources: Vec<String>,
    delay_ms: u64,
}

impl TaskArgs for Claim {
    const KIND: &'static str = "claim";
}

#[derive(Default)]
struct ClaimHandler {
    active: Mutex<HashMap<String, usize>>,
    overlaps: Mutex<Vec<String>>,
}

#[async_trait]
impl Handler<Claim> for Arc<ClaimHandler> {
    fn plan(&self, args: Claim) -> Result<Plan<Claim>> {
        let resources = args.resources.clone();
        Ok(resources
            .into_iter()
            .fold(Plan::new(args), |plan, resource| plan.with_resource(resource)))
    }

    async fn execute(&self, _ctx: &TaskContext, state: Claim) -> Result<ExecuteOutcome> {
        {
            let mut active = self.active.lock().unwrap();
            for resource in &state.resources {
                let count = active.entry(resource.clone()).or_default();
                *count += 1;
                if *count > 1 {
                    self.overlaps.lock().unwrap().push(resource.clone());
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(state.delay_ms)).await;
        let mut active = self.active.lock().unwrap();
        for resource in &state.resources {
            *active.entry(resource.clone()).or_default() -= 1;
        }
        Ok(ExecuteOutcome::done())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn execute_phases_never_overlap_on_a_resource() {
    let claims = Arc::new(ClaimHandler::default());
    let mut config = EngineConfig::default();
    config.scheduler.max_concurrent = 8;
    let runtime = EngineBuilder::new()
        .register::<Claim, _>(Arc::clone(&claims))
        .unwrap()
        .config(config)
        .build()
        .unwrap();

    let pool = ["r0", "r1", "r2", "r3", "r4"];
    let claims_to_run: Vec<Claim> = {
        let mut rng = rand::thread_rng();
        (0..60)
            .map(|_| {
                let count = rng.gen_range(1..=3);
                let mut resources: Vec<String> = (0..count)
                    .map(|_| pool[rng.gen_range(0..pool.len())].to_string())
                    .collect();
                resources.sort();
                resources.dedup();
                Claim {
                    resources,
                    delay_ms: rng.gen_range(0..5),
                }
            })
            .collect()
    };
    let mut submissions = Vec::new();
    for claim in &claims_to_run {
        submissions.push(runtime.schedule(claim.to_raw().unwrap()).await.unwrap());
    }
    for submission in submissions {
        submission.wait().await.unwrap();
    }

    assert!(claims.overlaps.lock().unwrap().is_empty());
    assert_eq!(runtime.counts().live(), 0);
}

#[tokio::test]
async fn duplicate_refresh_joins_the_live_task() {
    let e = engine().await;
    e.receiver.set_delay(Some(Duration::from_millis(30)));
    let refresh = SyncRefresh {
        account_id: "a1".into(),
        folder_id: None,
    };

    e.receiver.put_item(100, remote_item("c1", 100));
    e.receiver.put_item(200, remote_item("c2", 200));

    let first = e.runtime.schedule(refresh.to_raw().unwrap()).await.unwrap();
    let second = e.runtime.schedule(refresh.to_raw().unwrap()).await.unwrap();

    assert_eq!(first.state, TaskState::Queued);
    assert_eq!(second.state, TaskState::Superseded);
    assert_eq!(second.task_id, first.task_id);
    assert!(first.group.is_some());
    assert!(second.group.is_some());

    // both callers see the offspring finish, not just the refresh itself
    let (first, second) = tokio::join!(first.wait_group(), second.wait_group());
    first.unwrap();
    second.unwrap();
    assert_eq!(e.store.len(Collection::Conversations), 2);
    assert_eq!(e.store.len(Collection::Messages), 2);
    assert_eq!(e.receiver.calls().fetch_changes, 1);
    assert_eq!(e.runtime.counts().live(), 0);
}

#[tokio::test]
async fn failed_commit_leaves_nothing_visible() {
    let store = MemoryStore::new();
    let seen = Arc::new(Mutex::new(Vec::<ChangeEvent>::new()));
    let sink = Arc::clone(&seen);
    store
        .watch(
            Collection::Conversations,
            Arc::new(move |event: &ChangeEvent| sink.lock().unwrap().push(event.clone())),
        )
        .unwrap();

    store.fail_after(1);
    let mutations = MutationSet::new()
        .with_put(Collection::Conversations, "x", json!({ "id": "x" }))
        .with_put(Collection::Conversations, "y", json!({ "id": "y" }));
    assert!(store.commit(&mutations, &AtomicClobbers::new()).await.is_err());

    assert_eq!(store.get(Collection::Conversations, "x"), None);
    assert_eq!(store.get(Collection::Conversations, "y"), None);
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn account_toc_orders_by_name() {
    let e = engine().await;
    e.store
        .commit(&MutationSet::new().with_delete(Collection::Accounts, "a1"), &AtomicClobbers::new())
        .await
        .unwrap();
    let toc = e.runtime.tocs().acquire::<AccountDef>("").unwrap();

    for (id, name) in [("z", "Zeta"), ("a", "Alpha"), ("m", "Mike")] {
        e.store
            .commit(
                &MutationSet::new().with_put(Collection::Accounts, id, json!({ "id": id, "name": name })),
                &AtomicClobbers::new(),
            )
            .await
            .unwrap();
    }

    let names: Vec<String> = toc.slice(0, 10).into_iter().map(|a| a.name).collect();
    assert_eq!(names, vec!["Alpha", "Mike", "Zeta"]);
}

#[tokio::test]
async fn window_seek_matches_the_toc_slice() {
    let e = engine().await;
    let mut seed = MutationSet::new();
    for n in 0..30 {
        let c = conversation(&format!("c{n:02}"), n);
        seed.put(Collection::Conversations, c.id.clone(), serde_json::to_value(&c).unwrap());
    }
    e.store.commit(&seed, &AtomicClobbers::new()).await.unwrap();
    let (bridge, mut rx) = Bridge::new(e.runtime.clone());
    let h = Handle(4);

    bridge.dispatch(Command::ViewFolderConversations {
        handle: h,
        folder_id: "inbox".into(),
    });
    bridge.dispatch(Command::SeekProxy { handle: h, offset: 0, count: 10 });
    bridge.dispatch(Command::SeekProxy { handle: h, offset: 5, count: 10 });

    let mut last = None;
    while last.is_none() {
        if let BridgeMessage::WindowUpdate { offset: 5, total, items: Some(items), .. } = next_for(&mut rx, h).await {
            assert_eq!(total, 30);
            last = Some(items);
        }
    }
    let shown: Vec<String> = last
        .unwrap()
        .iter()
        .map(|item| item["state"]["id"].as_str().unwrap().to_string())
        .collect();
    let toc = e.runtime.tocs().acquire::<ConversationInfo>("inbox").unwrap();
    let expected: Vec<String> = toc.slice(5, 10).into_iter().map(|c| c.id).collect();
    assert_eq!(shown, expected);
    // newest first
    assert_eq!(shown.first().map(String::as_str), Some("c24"));
}

#[tokio::test]
async fn oversized_window_survives_a_sync() {
    let e = engine().await;
    e.receiver.put_item(100, remote_item("c1", 100));
    let (bridge, mut rx) = Bridge::new(e.runtime.clone());
    let h = Handle(6);

    bridge.dispatch(Command::ViewFolderConversations {
        handle: h,
        folder_id: "inbox".into(),
    });
    bridge.dispatch(Command::SeekProxy {
        handle: h,
        offset: 0,
        count: usize::MAX,
    });
    bridge.dispatch(Command::Ping { handle: Some(h) });
    collect_until(&mut rx, h, |m| matches!(m, BridgeMessage::Pong { .. })).await;

    let refresh = SyncRefresh {
        account_id: "a1".into(),
        folder_id: None,
    };
    let submission = e.runtime.schedule(refresh.to_raw().unwrap()).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), submission.wait_group())
        .await
        .expect("sync hung")
        .unwrap();
    assert_eq!(e.runtime.counts().live(), 0);

    let added = collect_until(&mut rx, h, |m| {
        matches!(m, BridgeMessage::WindowUpdate { changes, .. }
            if changes.iter().any(|c| matches!(c, ListChange::Add { index: 0, .. })))
    })
    .await;
    assert!(!added.is_empty());
}

#[tokio::test]
async fn commands_on_a_handle_run_in_arrival_order() {
    let e = engine().await;
    e.receiver.set_delay(Some(Duration::from_millis(80)));
    let (bridge, mut rx) = Bridge::new(e.runtime.clone());
    let h = Handle(7);

    bridge.dispatch(Command::ViewFolders {
        handle: h,
        account_id: "a1".into(),
    });
    // c1: slow folder sync; c2: must not overtake it
    bridge.dispatch(Command::RefreshView { handle: h });
    bridge.dispatch(Command::Ping { handle: Some(h) });

    let mut order = Vec::new();
    while order.len() < 2 {
        match next_for(&mut rx, h).await {
            BridgeMessage::PromisedResult { .. } => order.push("c1"),
            BridgeMessage::Pong { .. } => order.push("c2"),
            _ => {}
        }
    }
    assert_eq!(order, vec!["c1", "c2"]);
    assert_eq!(e.receiver.calls().list_folders, 1);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Batch {
    name: String,
    child_delays_ms: Vec<u64>,
}

impl TaskArgs for Batch {
    const KIND: &'static str = "batch";
}

struct BatchHandler;

#[async_trait]
impl Handler<Batch> for BatchHandler {
    fn plan(&self, args: Batch) -> Result<Plan<Batch>> {
        let group = args.name.clone();
        Ok(Plan::new(args).in_group(group))
    }

    async fn execute(&self, _ctx: &TaskContext, state: Batch) -> Result<ExecuteOutcome> {
        let mut outcome = ExecuteOutcome::done();
        for (index, delay_ms) in state.child_delays_ms.iter().enumerate() {
            outcome = outcome.spawn(Child { index, delay_ms: *delay_ms }.to_raw()?);
        }
        Ok(outcome)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Child {
    index: usize,
    delay_ms: u64,
}

impl TaskArgs for Child {
    const KIND: &'static str = "child";
}

struct ChildHandler {
    finished: Arc<Mutex<Vec<usize>>>,
}

#[async_trait]
impl Handler<Child> for ChildHandler {
    async fn execute(&self, _ctx: &TaskContext, state: Child) -> Result<ExecuteOutcome> {
        tokio::time::sleep(Duration::from_millis(state.delay_ms)).await;
        self.finished.lock().unwrap().push(state.index);
        Ok(ExecuteOutcome::done())
    }
}

#[rstest]
#[case::first_child_slower(&[60, 5], &[1, 0])]
#[case::second_child_slower(&[5, 60], &[0, 1])]
#[tokio::test]
async fn group_settles_after_every_offspring(#[case] delays: &[u64], #[case] expected_order: &[usize]) {
    let finished = Arc::new(Mutex::new(Vec::new()));
    let runtime = EngineBuilder::new()
        .register::<Batch, _>(BatchHandler)
        .unwrap()
        .register::<Child, _>(ChildHandler {
            finished: Arc::clone(&finished),
        })
        .unwrap()
        .build()
        .unwrap();

    let batch = Batch {
        name: "batch:1".into(),
        child_delays_ms: delays.to_vec(),
    };
    let submission = runtime.schedule(batch.to_raw().unwrap()).await.unwrap();
    submission.wait_group().await.unwrap();

    assert_eq!(*finished.lock().unwrap(), expected_order);
    assert_eq!(runtime.counts().live(), 0);
}

#[tokio::test]
async fn full_sync_through_the_bridge() {
    let e = engine().await;
    e.receiver.put_item(100, remote_item("c1", 100));
    e.receiver.put_item(200, remote_item("c2", 200));
    let (bridge, mut rx) = Bridge::new(e.runtime.clone());

    bridge.dispatch(Command::ViewAccounts { handle: Handle(1) });
    assert!(matches!(next_for(&mut rx, Handle(1)).await, BridgeMessage::ListUpdate { total: 1, .. }));

    bridge.dispatch(Command::SyncFolderList {
        handle: Some(Handle(2)),
        account_id: "a1".into(),
    });
    let BridgeMessage::PromisedResult { data, .. } = next_for(&mut rx, Handle(2)).await else {
        panic!("expected the folder sync result");
    };
    assert!(data["taskId"].as_str().unwrap().starts_with("task-"));

    bridge.dispatch(Command::ViewFolderConversations {
        handle: Handle(3),
        folder_id: "inbox".into(),
    });
    bridge.dispatch(Command::RefreshView { handle: Handle(3) });
    let seen = collect_until(&mut rx, Handle(3), |m| matches!(m, BridgeMessage::PromisedResult { .. })).await;

    assert!(e.store.get(Collection::Folders, "inbox").is_some());
    assert_eq!(e.store.len(Collection::Conversations), 2);
    assert_eq!(e.store.len(Collection::Messages), 2);
    assert_eq!(e.store.len(Collection::Tasks), 0);
    let account = e.store.get(Collection::Accounts, "a1").unwrap();
    assert_eq!(account["syncInfo"]["changes"], 2);
    assert_eq!(
        e.store.get(Collection::SyncStates, "a1"),
        Some(json!({ "watermark": 200 }))
    );

    // the account list saw the sync info land
    let saw_sync_info = seen.iter().any(|message| match message {
        BridgeMessage::ListUpdate { handle: Handle(1), changes, .. } => changes.iter().any(|change| {
            matches!(change, ListChange::Change { item, .. } if item["state"]["syncInfo"]["changes"] == 2)
        }),
        _ => false,
    });
    assert!(saw_sync_info);

    bridge.dispatch(Command::SeekProxy { handle: Handle(3), offset: 0, count: 10 });
    let BridgeMessage::WindowUpdate { items: Some(items), total, .. } = next_for(&mut rx, Handle(3)).await else {
        panic!("expected the window contents");
    };
    assert_eq!(total, 2);
    assert_eq!(items[0]["state"]["id"], "c2");
}
