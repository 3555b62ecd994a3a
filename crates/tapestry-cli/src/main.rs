//! Tapestry demo: one scripted account synced through the bridge, with every
//! bridge message printed as a JSON line.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use clap::Parser;
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt as _, util::SubscriberInitExt as _};

use tapestry_core::account::{AccountManager, CompositeAccount, RemoteItem};
use tapestry_core::app::EngineBuilder;
use tapestry_core::bridge::{Bridge, BridgeMessage, Command, Handle};
use tapestry_core::config::EngineConfig;
use tapestry_core::domain::{
    AtomicClobbers, Collection, ConversationInfo, FolderInfo, FolderKind, MessageInfo, MutationSet,
};
use tapestry_core::impls::{MemoryStore, ScriptedReceiver, ScriptedSender};
use tapestry_core::ports::Store;
use tapestry_core::tasks::{SyncConversation, SyncFolderList, SyncRefresh};
use tapestry_core::typed::TaskArgs;

const ACCOUNT: &str = "a1";

#[derive(Parser)]
#[command(name = "tapestry")]
#[command(about = "Runs a scripted account through the sync engine", long_about = None)]
struct Cli {
    #[arg(short, long, help = "Engine config (TOML)")]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = 12, help = "Remote conversations in the inbox")]
    items: usize,

    #[arg(long, default_value_t = 10, help = "Conversation window size")]
    window: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.filter)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let store = Arc::new(MemoryStore::new());
    store
        .commit(
            &MutationSet::new().with_put(Collection::Accounts, ACCOUNT, json!({ "id": ACCOUNT, "name": "Demo" })),
            &AtomicClobbers::new(),
        )
        .await?;

    let accounts = Arc::new(AccountManager::new());
    accounts.insert(CompositeAccount::new(
        ACCOUNT,
        Arc::new(scripted_receiver(cli.items)),
        Arc::new(ScriptedSender::new()),
    ));

    let shared: Arc<dyn Store> = store.clone();
    let runtime = EngineBuilder::new()
        .with_builtin_tasks()?
        .expect_tasks(&[SyncFolderList::KIND, SyncRefresh::KIND, SyncConversation::KIND])
        .config(config)
        .store(shared)
        .accounts(accounts)
        .build()?;
    let resumed = runtime.resume().await?;
    tracing::info!(resumed, "engine started");

    let (bridge, mut rx) = Bridge::new(runtime.clone());

    bridge.dispatch(Command::ViewAccounts { handle: Handle(1) });
    bridge.dispatch(Command::SyncFolderList {
        handle: Some(Handle(2)),
        account_id: ACCOUNT.into(),
    });
    print_until(&mut rx, Handle(2), |m| matches!(m, BridgeMessage::PromisedResult { .. })).await?;

    bridge.dispatch(Command::ViewFolders {
        handle: Handle(3),
        account_id: ACCOUNT.into(),
    });
    bridge.dispatch(Command::ViewFolderConversations {
        handle: Handle(4),
        folder_id: "inbox".into(),
    });
    bridge.dispatch(Command::SyncRefresh {
        handle: Some(Handle(5)),
        account_id: ACCOUNT.into(),
        folder_id: Some("inbox".into()),
    });
    print_until(&mut rx, Handle(5), |m| matches!(m, BridgeMessage::PromisedResult { .. })).await?;

    bridge.dispatch(Command::SeekProxy {
        handle: Handle(4),
        offset: 0,
        count: cli.window,
    });
    bridge.dispatch(Command::Ping { handle: Some(Handle(4)) });
    print_until(&mut rx, Handle(4), |m| matches!(m, BridgeMessage::Pong { .. })).await?;

    for handle in [1, 3, 4] {
        bridge.dispatch(Command::CleanupContext { handle: Handle(handle) });
        print_until(&mut rx, Handle(handle), |m| {
            matches!(m, BridgeMessage::ContextCleanedUp { .. })
        })
        .await?;
    }

    let counts = runtime.counts();
    tracing::info!(
        live = counts.live(),
        conversations = store.len(Collection::Conversations),
        messages = store.len(Collection::Messages),
        "demo finished"
    );
    Ok(())
}

/// Prints bridge messages until `done` matches one addressed to `handle`.
async fn print_until(
    rx: &mut UnboundedReceiver<BridgeMessage>,
    handle: Handle,
    done: impl Fn(&BridgeMessage) -> bool,
) -> Result<()> {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .with_context(|| format!("no reply for handle {handle}"))?
            .context("bridge closed")?;
        println!("{}", serde_json::to_string(&message)?);
        if message.handle() != Some(handle) {
            continue;
        }
        if let BridgeMessage::Error { message, .. } = &message {
            bail!("handle {handle} failed: {message}");
        }
        if done(&message) {
            return Ok(());
        }
    }
}

fn scripted_receiver(items: usize) -> ScriptedReceiver {
    let receiver = ScriptedReceiver::new();
    receiver.set_folders(vec![
        folder("inbox", "INBOX", FolderKind::Inbox),
        folder("sent", "Sent", FolderKind::Sent),
        folder("travel", "Travel", FolderKind::Normal),
    ]);
    for n in 0..items {
        let modified = 1_700_000_000_000 + i64::try_from(n).unwrap_or(i64::MAX) * 60_000;
        let id = format!("conv-{n:03}");
        receiver.put_item(
            modified,
            RemoteItem {
                conversation: ConversationInfo {
                    id: id.clone(),
                    account_id: ACCOUNT.into(),
                    folder_ids: vec!["inbox".into()],
                    subject: format!("Thread {n}"),
                    date: modified,
                    message_count: 0,
                    message_ids: Vec::new(),
                },
                messages: vec![MessageInfo {
                    id: format!("{id}-m1"),
                    conversation_id: id,
                    account_id: ACCOUNT.into(),
                    date: modified,
                    author: "sam@example.com".into(),
                    body: format!("Message body {n}"),
                }],
            },
        );
    }
    receiver
}

fn folder(id: &str, path: &str, kind: FolderKind) -> FolderInfo {
    FolderInfo {
        id: id.into(),
        account_id: ACCOUNT.into(),
        path: path.into(),
        name: path.into(),
        kind,
    }
}
