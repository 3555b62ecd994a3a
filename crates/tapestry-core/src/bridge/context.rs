//! Named contexts: per-handle state kept by the bridge.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc::UnboundedSender;

use super::proxy::ListProxy;
use super::wire::{BridgeMessage, Command, Handle};

/// Sends messages to the client for one handle until closed.
#[derive(Debug, Clone)]
pub(crate) struct Outbox {
    tx: UnboundedSender<BridgeMessage>,
    open: Arc<AtomicBool>,
}

impl Outbox {
    pub(crate) fn new(tx: UnboundedSender<BridgeMessage>) -> Self {
        Self {
            tx,
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    pub(crate) fn send(&self, message: BridgeMessage) {
        if self.open.load(Ordering::Acquire) {
            // the client side may be gone; nothing left to tell it
            let _ = self.tx.send(message);
        }
    }

    /// Stops delivery from every clone of this outbox.
    pub(crate) fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

/// Holds back messages until the reply they follow has been sent.
#[derive(Debug)]
pub(crate) struct HeldOutbox {
    outbox: Outbox,
    held: Mutex<Option<Vec<BridgeMessage>>>,
}

impl HeldOutbox {
    pub(crate) fn new(outbox: Outbox) -> Self {
        Self {
            outbox,
            held: Mutex::new(Some(Vec::new())),
        }
    }

    pub(crate) fn send(&self, message: BridgeMessage) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        match held.as_mut() {
            Some(queue) => queue.push(message),
            None => self.outbox.send(message),
        }
    }

    /// Sends `first`, then everything held, then lets messages through.
    pub(crate) fn release_after(&self, first: BridgeMessage) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        self.outbox.send(first);
        for message in held.take().unwrap_or_default() {
            self.outbox.send(message);
        }
    }
}

/// What a context is showing; `refreshView` syncs the matching data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum View {
    Accounts,
    Folders { account_id: String },
    FolderConversations { folder_id: String },
    ConversationMessages { conversation_id: String },
    Item,
}

pub(crate) type CleanupHook = Box<dyn FnOnce() + Send>;

/// State of one handle.
///
/// While `pending` is set a command for this handle is running; commands
/// arriving meanwhile wait in `queue` and run in arrival order.
pub(crate) struct NamedContext {
    pub(crate) outbox: Outbox,
    pub(crate) pending: bool,
    pub(crate) queue: VecDeque<Command>,
    pub(crate) proxy: Option<Arc<dyn ListProxy>>,
    pub(crate) cleanup: Vec<CleanupHook>,
    pub(crate) priority_tag: Option<String>,
    pub(crate) view: Option<View>,
}

impl NamedContext {
    pub(crate) fn new(outbox: Outbox) -> Self {
        Self {
            outbox,
            pending: false,
            queue: VecDeque::new(),
            proxy: None,
            cleanup: Vec::new(),
            priority_tag: None,
            view: None,
        }
    }

    /// Tears the context down. Returns the commands that never ran.
    pub(crate) fn close(self, handle: Handle) -> (Vec<Command>, Option<String>) {
        self.outbox.close();
        if let Some(proxy) = &self.proxy {
            proxy.release();
        }
        for hook in self.cleanup {
            hook();
        }
        tracing::info!(%handle, "context cleaned up");
        (self.queue.into_iter().collect(), self.priority_tag)
    }
}

impl std::fmt::Debug for NamedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedContext")
            .field("pending", &self.pending)
            .field("queued", &self.queue.len())
            .field("has_proxy", &self.proxy.is_some())
            .field("view", &self.view)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn closed_outbox_drops_messages() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outbox = Outbox::new(tx);
        let clone = outbox.clone();

        outbox.send(BridgeMessage::Pong { handle: None });
        outbox.close();
        clone.send(BridgeMessage::Pong { handle: Some(Handle(1)) });

        assert_eq!(rx.try_recv().ok(), Some(BridgeMessage::Pong { handle: None }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn held_messages_follow_the_reply() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let held = HeldOutbox::new(Outbox::new(tx));

        held.send(BridgeMessage::ContextCleanedUp { handle: Handle(2) });
        held.release_after(BridgeMessage::Pong { handle: Some(Handle(1)) });
        held.send(BridgeMessage::Pong { handle: Some(Handle(3)) });

        let order: Vec<Option<Handle>> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|m| m.handle())
            .collect();
        assert_eq!(order, vec![Some(Handle(1)), Some(Handle(2)), Some(Handle(3))]);
    }
}
