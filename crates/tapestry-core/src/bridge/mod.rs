//! Bridge: the message boundary between UI clients and the engine.
//!
//! Clients send [`Command`]s and receive [`BridgeMessage`]s on one channel.
//! Commands carrying a handle that has a named context run one at a time in
//! arrival order; everything else runs as soon as it arrives.

mod context;
pub mod proxy;
pub mod wire;

pub use self::proxy::{EntireListProxy, ListProxy, WindowedListProxy};
pub use self::wire::{BridgeMessage, Command, Handle, ItemType, ListChange, wire_item};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use self::context::{HeldOutbox, NamedContext, Outbox, View};
use crate::app::{Runtime, RuntimeEvent};
use crate::domain::{
    AccountDef, ChangeEvent, Collection, ConversationInfo, EngineError, FolderInfo, MessageInfo,
    OverlayKey, ReadRequest, Result,
};
use crate::impls::ListenerId;
use crate::tasks::{SyncConversation, SyncFolderList, SyncRefresh};
use crate::toc::TocItem;
use crate::typed::TaskArgs;

/// Boost given to syncs of a folder while its conversation view is open.
const VIEW_PRIORITY_BOOST: i32 = 10;

pub struct Bridge {
    runtime: Runtime,
    tx: UnboundedSender<BridgeMessage>,
    contexts: Mutex<HashMap<Handle, NamedContext>>,
    event_listener: ListenerId,
}

impl Bridge {
    /// Creates a bridge over `runtime` and the receiving end of its messages.
    pub fn new(runtime: Runtime) -> (Arc<Self>, UnboundedReceiver<BridgeMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = tx.clone();
        let event_listener = runtime.on_event(Arc::new(move |event: &RuntimeEvent| match event {
            RuntimeEvent::BadLogin {
                account_id,
                problem,
                side,
            } => {
                let _ = events.send(BridgeMessage::BadLogin {
                    account_id: account_id.clone(),
                    problem: *problem,
                    which_side: *side,
                });
            }
        }));
        let bridge = Arc::new(Self {
            runtime,
            tx,
            contexts: Mutex::new(HashMap::new()),
            event_listener,
        });
        (bridge, rx)
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Sends `data` to every client under `name`.
    pub fn broadcast(&self, name: impl Into<String>, data: Value) {
        let _ = self.tx.send(BridgeMessage::Broadcast {
            name: name.into(),
            data,
        });
    }

    /// Number of open named contexts.
    pub fn live_contexts(&self) -> usize {
        self.lock_contexts().len()
    }

    /// Accepts one command. Never blocks; the command runs on a spawned task
    /// or waits behind the one currently running for its handle.
    pub fn dispatch(self: &Arc<Self>, command: Command) {
        let owns_slot = match command.handle() {
            None => false,
            Some(handle) => {
                let mut contexts = self.lock_contexts();
                match contexts.get_mut(&handle) {
                    Some(context) if context.pending => {
                        tracing::debug!(%handle, command = command.name(), queued = context.queue.len() + 1, "command deferred");
                        context.queue.push_back(command);
                        return;
                    }
                    Some(context) => {
                        context.pending = true;
                        true
                    }
                    None if command.creates_context() => {
                        let mut context = NamedContext::new(Outbox::new(self.tx.clone()));
                        context.pending = true;
                        contexts.insert(handle, context);
                        tracing::info!(%handle, command = command.name(), "context opened");
                        true
                    }
                    None => false,
                }
            }
        };

        let bridge = Arc::clone(self);
        tokio::spawn(async move { bridge.drive(command, owns_slot).await });
    }

    /// Runs `command`, then, if it held its handle's slot, everything queued
    /// behind it.
    async fn drive(self: Arc<Self>, command: Command, owns_slot: bool) {
        let handle = command.handle();
        let mut next = Some(command);
        while let Some(command) = next.take() {
            self.run_one(command).await;
            let Some(handle) = handle.filter(|_| owns_slot) else {
                break;
            };
            next = {
                let mut contexts = self.lock_contexts();
                contexts.get_mut(&handle).and_then(|context| {
                    let queued = context.queue.pop_front();
                    if queued.is_none() {
                        context.pending = false;
                    }
                    queued
                })
            };
        }
    }

    async fn run_one(self: &Arc<Self>, command: Command) {
        let handle = command.handle();
        let name = command.name();
        let replies_on_error = command.replies_on_error();
        let creates_context = command.creates_context();
        let outbox = self.outbox_for(handle);

        let bridge = Arc::clone(self);
        let reply = outbox.clone();
        let result = match tokio::spawn(async move { bridge.execute(command, reply).await }).await {
            Ok(result) => result,
            Err(join_error) => {
                tracing::error!(?handle, command = name, error = %join_error, "command handler panicked");
                Err(EngineError::Invariant(format!("{name} handler panicked")))
            }
        };

        if let Err(err) = result {
            // out of the map before the client hears about the failure
            let unused = handle
                .filter(|_| creates_context)
                .and_then(|handle| self.take_unused(handle).map(|context| (handle, context)));
            if replies_on_error {
                tracing::debug!(?handle, command = name, error = %err, "command failed");
                outbox.send(BridgeMessage::Error {
                    handle,
                    message: err.to_string(),
                });
            } else {
                tracing::warn!(?handle, command = name, error = %err, "command failed");
            }
            if let Some((handle, context)) = unused {
                let (dropped, priority_tag) = context.close(handle);
                if !dropped.is_empty() {
                    let names: Vec<&str> = dropped.iter().map(Command::name).collect();
                    tracing::warn!(%handle, ?names, "dropping commands queued behind a failed view");
                }
                if let Some(tag) = priority_tag {
                    self.runtime.clear_priority_tag(&tag);
                }
            }
        }
    }

    /// Removes a context that never got to show anything.
    fn take_unused(&self, handle: Handle) -> Option<NamedContext> {
        let mut contexts = self.lock_contexts();
        let unused = contexts
            .get(&handle)
            .is_some_and(|context| context.view.is_none() && context.proxy.is_none());
        if unused { contexts.remove(&handle) } else { None }
    }

    async fn execute(self: Arc<Self>, command: Command, outbox: Outbox) -> Result<()> {
        match command {
            Command::Ping { handle } => {
                outbox.send(BridgeMessage::Pong { handle });
            }
            Command::ViewAccounts { handle } => {
                let toc = self.runtime.tocs().acquire::<AccountDef>("")?;
                let proxy = EntireListProxy::open(handle, toc, Arc::clone(self.runtime.overlays()), outbox);
                self.attach(handle, proxy, View::Accounts);
            }
            Command::ViewFolders { handle, account_id } => {
                let toc = self.runtime.tocs().acquire::<FolderInfo>(&account_id)?;
                let proxy = EntireListProxy::open(handle, toc, Arc::clone(self.runtime.overlays()), outbox);
                self.attach(handle, proxy, View::Folders { account_id });
            }
            Command::ViewFolderConversations { handle, folder_id } => {
                let toc = self.runtime.tocs().acquire::<ConversationInfo>(&folder_id)?;
                let proxy = WindowedListProxy::open(handle, toc, Arc::clone(self.runtime.overlays()), outbox);
                self.boost_view(handle, format!("view:folder:{folder_id}"));
                self.attach(handle, proxy, View::FolderConversations { folder_id });
            }
            Command::ViewConversationMessages {
                handle,
                conversation_id,
            } => {
                let toc = self.runtime.tocs().acquire::<MessageInfo>(&conversation_id)?;
                let proxy = EntireListProxy::open(handle, toc, Arc::clone(self.runtime.overlays()), outbox);
                self.attach(handle, proxy, View::ConversationMessages { conversation_id });
            }
            Command::SeekProxy { handle, offset, count } => {
                let proxy = self
                    .lock_contexts()
                    .get(&handle)
                    .and_then(|context| context.proxy.clone())
                    .ok_or_else(|| EngineError::Bridge(format!("handle {handle} has no list view")))?;
                proxy.seek(offset, count)?;
            }
            Command::RefreshView { handle } => {
                let view = self
                    .lock_contexts()
                    .get(&handle)
                    .and_then(|context| context.view.clone())
                    .ok_or_else(|| EngineError::Bridge(format!("handle {handle} has no view")))?;
                self.refresh(view).await?;
                outbox.send(BridgeMessage::PromisedResult {
                    handle: Some(handle),
                    data: Value::Null,
                });
            }
            Command::GetItemAndTrackUpdates {
                handle,
                item_type,
                item_id,
            } => self.track_item(handle, item_type, item_id, outbox)?,
            Command::CleanupContext { handle } => self.cleanup(handle),
            Command::SyncFolderList { handle, account_id } => {
                let submission = self
                    .runtime
                    .schedule(SyncFolderList { account_id }.to_raw()?)
                    .await?;
                let task_id = submission.task_id.to_string();
                submission.wait().await?;
                outbox.send(BridgeMessage::PromisedResult {
                    handle,
                    data: json!({ "taskId": task_id }),
                });
            }
            Command::SyncRefresh {
                handle,
                account_id,
                folder_id,
            } => {
                let submission = self
                    .runtime
                    .schedule(SyncRefresh { account_id, folder_id }.to_raw()?)
                    .await?;
                let task_id = submission.task_id.to_string();
                submission.wait_group().await?;
                outbox.send(BridgeMessage::PromisedResult {
                    handle,
                    data: json!({ "taskId": task_id }),
                });
            }
            Command::ModifyAccount {
                handle,
                account_id,
                mods,
            } => {
                self.runtime.modify_account(&account_id, mods).await?;
                outbox.send(BridgeMessage::PromisedResult {
                    handle,
                    data: Value::Null,
                });
            }
            Command::ClearAccountProblems { handle, account_id } => {
                let cleared = self.runtime.clear_account_problems(&account_id).await?;
                outbox.send(BridgeMessage::PromisedResult {
                    handle,
                    data: Value::Bool(cleared),
                });
            }
        }
        Ok(())
    }

    /// Syncs whatever the view shows and waits for the sync to settle.
    async fn refresh(&self, view: View) -> Result<()> {
        match view {
            View::Accounts => {
                let mut submissions = Vec::new();
                for account_id in self.runtime.accounts().ids() {
                    let raw = SyncRefresh {
                        account_id,
                        folder_id: None,
                    }
                    .to_raw()?;
                    submissions.push(self.runtime.schedule(raw).await?);
                }
                for submission in submissions {
                    submission.wait_group().await?;
                }
                Ok(())
            }
            View::Folders { account_id } => {
                let raw = SyncFolderList { account_id }.to_raw()?;
                self.runtime.schedule(raw).await?.wait().await
            }
            View::FolderConversations { folder_id } => {
                let folder: FolderInfo = self.read_entity(Collection::Folders, &folder_id).await?;
                let raw = SyncRefresh {
                    account_id: folder.account_id,
                    folder_id: Some(folder_id),
                }
                .to_raw()?;
                self.runtime.schedule(raw).await?.wait_group().await
            }
            View::ConversationMessages { conversation_id } => {
                let conversation: ConversationInfo =
                    self.read_entity(Collection::Conversations, &conversation_id).await?;
                let raw = SyncConversation {
                    account_id: conversation.account_id,
                    item_id: conversation.id,
                }
                .to_raw()?;
                self.runtime.schedule(raw).await?.wait().await
            }
            View::Item => Err(EngineError::Bridge("item views cannot be refreshed".into())),
        }
    }

    /// Replies with the item's state and overlays, then follows both until
    /// the context is cleaned up.
    fn track_item(&self, handle: Handle, item_type: ItemType, item_id: String, outbox: Outbox) -> Result<()> {
        let (collection, namespace) = match item_type {
            ItemType::Conversation => (Collection::Conversations, ConversationInfo::OVERLAY_NAMESPACE),
            ItemType::Message => (Collection::Messages, MessageInfo::OVERLAY_NAMESPACE),
        };
        let held = Arc::new(HeldOutbox::new(outbox));
        let store = Arc::clone(self.runtime.store());
        let overlays = Arc::clone(self.runtime.overlays());
        let resolver = overlays.bound_resolver(namespace);

        let watch = {
            let held = Arc::clone(&held);
            store.watch_item(
                collection,
                &item_id,
                Arc::new(move |event: &ChangeEvent| {
                    held.send(BridgeMessage::UpdateItem {
                        handle,
                        state: Some(event.value.clone()),
                        overlays: None,
                    });
                }),
            )?
        };
        let overlay_listener = {
            let held = Arc::clone(&held);
            let item_id = item_id.clone();
            let resolver = resolver.clone();
            overlays.on_announce(Arc::new(move |key: &OverlayKey| {
                if key.namespace == resolver.namespace() && key.id == item_id {
                    held.send(BridgeMessage::UpdateItem {
                        handle,
                        state: None,
                        overlays: Some(resolver.resolve(&item_id)),
                    });
                }
            }))
        };

        let watch_id = watch.id;
        held.release_after(BridgeMessage::GotItemNowTrackingUpdates {
            handle,
            state: watch.value,
            overlays: resolver.resolve(&item_id),
        });

        let hooks: Vec<context::CleanupHook> = vec![
            Box::new(move || store.unwatch(watch_id)),
            Box::new(move || overlays.off_announce(overlay_listener)),
        ];
        let orphaned = {
            let mut contexts = self.lock_contexts();
            match contexts.get_mut(&handle) {
                Some(context) => {
                    context.cleanup.extend(hooks);
                    context.view = Some(View::Item);
                    None
                }
                None => Some(hooks),
            }
        };
        for hook in orphaned.into_iter().flatten() {
            hook();
        }
        Ok(())
    }

    fn cleanup(&self, handle: Handle) {
        let removed = self.lock_contexts().remove(&handle);
        match removed {
            Some(context) => {
                let (dropped, priority_tag) = context.close(handle);
                if !dropped.is_empty() {
                    let names: Vec<&str> = dropped.iter().map(Command::name).collect();
                    tracing::warn!(%handle, ?names, "dropping commands queued behind cleanup");
                }
                if let Some(tag) = priority_tag {
                    self.runtime.clear_priority_tag(&tag);
                }
            }
            None => tracing::debug!(%handle, "cleanup for a handle without context"),
        }
        let _ = self.tx.send(BridgeMessage::ContextCleanedUp { handle });
    }

    /// Stores the view's proxy on its context, releasing any previous one.
    fn attach(&self, handle: Handle, proxy: Arc<dyn ListProxy>, view: View) {
        let replaced = {
            let mut contexts = self.lock_contexts();
            match contexts.get_mut(&handle) {
                Some(context) => {
                    context.view = Some(view);
                    context.proxy.replace(proxy)
                }
                None => Some(proxy),
            }
        };
        if let Some(proxy) = replaced {
            proxy.release();
        }
    }

    /// Each context holds at most one boost; the runtime counts holders per
    /// tag, so two views on one folder keep it boosted until both are gone.
    fn boost_view(&self, handle: Handle, tag: String) {
        let previous = match self.lock_contexts().get_mut(&handle) {
            Some(context) => context.priority_tag.replace(tag.clone()),
            None => return,
        };
        if previous.as_deref() == Some(tag.as_str()) {
            return;
        }
        self.runtime.set_priority_tag(tag, VIEW_PRIORITY_BOOST);
        if let Some(previous) = previous {
            self.runtime.clear_priority_tag(&previous);
        }
    }

    async fn read_entity<T: DeserializeOwned>(&self, collection: Collection, id: &str) -> Result<T> {
        let read = self
            .runtime
            .store()
            .read(&ReadRequest::new().with(collection, id))
            .await?;
        read.decode(collection, id)?
            .ok_or_else(|| EngineError::Bridge(format!("no {} entity '{id}'", collection.as_str())))
    }

    fn outbox_for(&self, handle: Option<Handle>) -> Outbox {
        handle
            .and_then(|handle| {
                self.lock_contexts()
                    .get(&handle)
                    .map(|context| context.outbox.clone())
            })
            .unwrap_or_else(|| Outbox::new(self.tx.clone()))
    }

    fn lock_contexts(&self) -> MutexGuard<'_, HashMap<Handle, NamedContext>> {
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.runtime.off_event(self.event_listener);
        let contexts = std::mem::take(self.contexts.get_mut().unwrap_or_else(PoisonError::into_inner));
        for (handle, context) in contexts {
            let (_, priority_tag) = context.close(handle);
            if let Some(tag) = priority_tag {
                self.runtime.clear_priority_tag(&tag);
            }
        }
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("contexts", &self.live_contexts())
            .finish()
    }
}
