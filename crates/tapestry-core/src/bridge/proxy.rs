//! List proxies: TOC contents forwarded to one client handle.
//!
//! An entire-list proxy mirrors the whole TOC. A windowed proxy mirrors only
//! the slice the client asked for plus the total count, and keeps the same
//! items in view when things are inserted or removed before the window.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde_json::Value;

use super::context::Outbox;
use super::wire::{BridgeMessage, Handle, ListChange, wire_item};
use crate::domain::{EngineError, OverlayKey, Result};
use crate::impls::{DataOverlayManager, ListenerId, OverlayResolver};
use crate::toc::{OrderedToc, TocEvent, TocItem, TocListener, TocListenerId};

pub trait ListProxy: Send + Sync {
    /// Moves the window. Entire-list proxies reject it.
    fn seek(&self, offset: usize, count: usize) -> Result<()>;

    /// Stops following the TOC and overlays. Idempotent.
    fn release(&self);
}

fn item_json<T: TocItem>(item: &T, resolver: &OverlayResolver) -> Value {
    wire_item(item.to_wire(), resolver.resolve(item.id()))
}

fn touches<T: TocItem>(key: &OverlayKey, scope: &str, item: &T) -> bool {
    T::cascades(key, scope) || (key.namespace == T::OVERLAY_NAMESPACE && key.id == item.id())
}

#[derive(Default)]
struct Subscriptions {
    toc: Option<TocListenerId>,
    overlays: Option<ListenerId>,
}

/// Unsubscribes a proxy from its TOC and the overlay manager.
struct Links<T: TocItem> {
    toc: Arc<OrderedToc<T>>,
    overlays: Arc<DataOverlayManager>,
    subscriptions: Mutex<Subscriptions>,
}

impl<T: TocItem> Links<T> {
    fn new(toc: Arc<OrderedToc<T>>, overlays: Arc<DataOverlayManager>) -> Self {
        Self {
            toc,
            overlays,
            subscriptions: Mutex::new(Subscriptions::default()),
        }
    }

    fn set(&self, toc: TocListenerId, overlays: ListenerId) {
        *self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner) = Subscriptions {
            toc: Some(toc),
            overlays: Some(overlays),
        };
    }

    fn release(&self) {
        let taken = std::mem::take(&mut *self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner));
        if let Some(id) = taken.toc {
            self.toc.unsubscribe(id);
        }
        if let Some(id) = taken.overlays {
            self.overlays.off_announce(id);
        }
    }
}

/// Sends the full list once, then one diff per TOC event.
pub struct EntireListProxy<T: TocItem> {
    links: Links<T>,
}

impl<T: TocItem> EntireListProxy<T> {
    pub(crate) fn open(
        handle: Handle,
        toc: Arc<OrderedToc<T>>,
        overlays: Arc<DataOverlayManager>,
        outbox: Outbox,
    ) -> Arc<Self> {
        let resolver = overlays.bound_resolver(T::OVERLAY_NAMESPACE);

        let listener: TocListener<T> = {
            let resolver = resolver.clone();
            let outbox = outbox.clone();
            Arc::new(move |event: &TocEvent<T>, items: &[T]| {
                let change = match event {
                    TocEvent::Add { item, index } => ListChange::Add {
                        index: *index,
                        item: item_json(item, &resolver),
                    },
                    TocEvent::Change { item, index } => ListChange::Change {
                        index: *index,
                        item: item_json(item, &resolver),
                    },
                    TocEvent::Remove { id, index } => ListChange::Remove {
                        index: *index,
                        id: id.clone(),
                    },
                };
                outbox.send(BridgeMessage::ListUpdate {
                    handle,
                    total: items.len(),
                    changes: vec![change],
                });
            })
        };
        let (toc_listener, ()) = toc.subscribe(listener, |items| {
            let changes = items
                .iter()
                .enumerate()
                .map(|(index, item)| ListChange::Add {
                    index,
                    item: item_json(item, &resolver),
                })
                .collect();
            outbox.send(BridgeMessage::ListUpdate {
                handle,
                total: items.len(),
                changes,
            });
        });

        let weak: Weak<OrderedToc<T>> = Arc::downgrade(&toc);
        let overlay_listener = overlays.on_announce(Arc::new(move |key: &OverlayKey| {
            let Some(toc) = weak.upgrade() else {
                return;
            };
            let scope = toc.scope().to_string();
            toc.with_items(|items| {
                let changes: Vec<ListChange> = items
                    .iter()
                    .enumerate()
                    .filter(|(_, item)| touches(key, &scope, *item))
                    .map(|(index, item)| ListChange::Change {
                        index,
                        item: item_json(item, &resolver),
                    })
                    .collect();
                if !changes.is_empty() {
                    outbox.send(BridgeMessage::ListUpdate {
                        handle,
                        total: items.len(),
                        changes,
                    });
                }
            });
        }));

        let links = Links::new(toc, overlays);
        links.set(toc_listener, overlay_listener);
        Arc::new(Self { links })
    }
}

impl<T: TocItem> ListProxy for EntireListProxy<T> {
    fn seek(&self, _offset: usize, _count: usize) -> Result<()> {
        Err(EngineError::Bridge("this view shows the entire list".into()))
    }

    fn release(&self) {
        self.links.release();
    }
}

/// The slice of the TOC a windowed client sees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Window {
    offset: usize,
    count: usize,
}

impl Window {
    /// One past the last index; `count` comes off the wire unchecked.
    fn end(&self) -> usize {
        self.offset.saturating_add(self.count)
    }

    fn contains(&self, index: usize) -> bool {
        index >= self.offset && index < self.end()
    }

    /// Adjusts the window for one TOC event and returns the diffs the client
    /// needs, or `None` when the client needs nothing at all.
    ///
    /// `items` is the TOC right after the event.
    fn apply<T: TocItem>(
        &mut self,
        event: &TocEvent<T>,
        items: &[T],
        render: impl Fn(&T) -> Value,
    ) -> Option<Vec<ListChange>> {
        match event {
            TocEvent::Add { item, index } => {
                if *index < self.offset {
                    self.offset += 1;
                    return Some(Vec::new());
                }
                if !self.contains(*index) {
                    return Some(Vec::new());
                }
                let mut changes = vec![ListChange::Add {
                    index: index - self.offset,
                    item: render(item),
                }];
                // a full window pushes its last item out
                if let Some(pushed) = items.get(self.end()) {
                    changes.push(ListChange::Remove {
                        index: self.count,
                        id: pushed.id().to_string(),
                    });
                }
                Some(changes)
            }
            TocEvent::Remove { id, index } => {
                if *index < self.offset {
                    self.offset -= 1;
                    return Some(Vec::new());
                }
                if !self.contains(*index) {
                    return Some(Vec::new());
                }
                let mut changes = vec![ListChange::Remove {
                    index: index - self.offset,
                    id: id.clone(),
                }];
                // the item after the window moves in
                if let Some(pulled) = items.get(self.end() - 1) {
                    changes.push(ListChange::Add {
                        index: self.count - 1,
                        item: render(pulled),
                    });
                }
                Some(changes)
            }
            TocEvent::Change { item, index } => self.contains(*index).then(|| {
                vec![ListChange::Change {
                    index: index - self.offset,
                    item: render(item),
                }]
            }),
        }
    }
}

/// Sends only `[offset, offset + count)` plus the live total.
pub struct WindowedListProxy<T: TocItem> {
    handle: Handle,
    window: Arc<Mutex<Window>>,
    resolver: OverlayResolver,
    outbox: Outbox,
    links: Links<T>,
}

impl<T: TocItem> WindowedListProxy<T> {
    /// Opens with an empty window; the client seeks to see items.
    pub(crate) fn open(
        handle: Handle,
        toc: Arc<OrderedToc<T>>,
        overlays: Arc<DataOverlayManager>,
        outbox: Outbox,
    ) -> Arc<Self> {
        let resolver = overlays.bound_resolver(T::OVERLAY_NAMESPACE);
        let window = Arc::new(Mutex::new(Window::default()));

        let listener: TocListener<T> = {
            let resolver = resolver.clone();
            let outbox = outbox.clone();
            let window = Arc::clone(&window);
            Arc::new(move |event: &TocEvent<T>, items: &[T]| {
                let mut window = window.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(changes) = window.apply(event, items, |item| item_json(item, &resolver)) {
                    outbox.send(BridgeMessage::WindowUpdate {
                        handle,
                        offset: window.offset,
                        total: items.len(),
                        changes,
                        items: None,
                    });
                }
            })
        };
        let (toc_listener, ()) = toc.subscribe(listener, |items| {
            outbox.send(BridgeMessage::WindowUpdate {
                handle,
                offset: 0,
                total: items.len(),
                changes: Vec::new(),
                items: None,
            });
        });

        let overlay_listener = {
            let weak: Weak<OrderedToc<T>> = Arc::downgrade(&toc);
            let window = Arc::clone(&window);
            let resolver = resolver.clone();
            let outbox = outbox.clone();
            overlays.on_announce(Arc::new(move |key: &OverlayKey| {
                let Some(toc) = weak.upgrade() else {
                    return;
                };
                let scope = toc.scope().to_string();
                toc.with_items(|items| {
                    let window = window.lock().unwrap_or_else(PoisonError::into_inner);
                    let changes: Vec<ListChange> = items
                        .iter()
                        .enumerate()
                        .skip(window.offset)
                        .take(window.count)
                        .filter(|(_, item)| touches(key, &scope, *item))
                        .map(|(index, item)| ListChange::Change {
                            index: index - window.offset,
                            item: item_json(item, &resolver),
                        })
                        .collect();
                    if !changes.is_empty() {
                        outbox.send(BridgeMessage::WindowUpdate {
                            handle,
                            offset: window.offset,
                            total: items.len(),
                            changes,
                            items: None,
                        });
                    }
                });
            }))
        };

        let links = Links::new(toc, overlays);
        links.set(toc_listener, overlay_listener);
        Arc::new(Self {
            handle,
            window,
            resolver,
            outbox,
            links,
        })
    }
}

impl<T: TocItem> ListProxy for WindowedListProxy<T> {
    fn seek(&self, offset: usize, count: usize) -> Result<()> {
        self.links.toc.with_items(|items| {
            let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
            window.offset = offset.min(items.len());
            window.count = count;
            let slice: Vec<Value> = items
                .iter()
                .skip(window.offset)
                .take(count)
                .map(|item| item_json(item, &self.resolver))
                .collect();
            tracing::debug!(handle = %self.handle, offset = window.offset, count, total = items.len(), "window moved");
            self.outbox.send(BridgeMessage::WindowUpdate {
                handle: self.handle,
                offset: window.offset,
                total: items.len(),
                changes: Vec::new(),
                items: Some(slice),
            });
        });
        Ok(())
    }

    fn release(&self) {
        self.links.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AccountDef, ConversationInfo};
    use rand::Rng;
    use serde_json::json;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn conversation(id: &str, date: i64) -> ConversationInfo {
        ConversationInfo {
            id: id.into(),
            account_id: "a1".into(),
            folder_ids: vec!["inbox".into()],
            subject: id.into(),
            date,
            message_count: 1,
            message_ids: Vec::new(),
        }
    }

    fn inbox() -> Arc<OrderedToc<ConversationInfo>> {
        let toc = Arc::new(OrderedToc::new("inbox"));
        toc.load(Vec::new());
        toc
    }

    /// What a windowed client would show, rebuilt from the messages.
    #[derive(Debug, Default)]
    struct Mirror {
        offset: usize,
        total: usize,
        ids: Vec<String>,
    }

    impl Mirror {
        fn drain(&mut self, rx: &mut UnboundedReceiver<BridgeMessage>) {
            while let Ok(message) = rx.try_recv() {
                let BridgeMessage::WindowUpdate { offset, total, changes, items, .. } = message else {
                    panic!("unexpected message {message:?}");
                };
                self.offset = offset;
                self.total = total;
                if let Some(items) = items {
                    self.ids = items.iter().map(|i| i["state"]["id"].as_str().unwrap().to_string()).collect();
                }
                for change in changes {
                    match change {
                        ListChange::Add { index, item } => {
                            self.ids.insert(index, item["state"]["id"].as_str().unwrap().to_string())
                        }
                        ListChange::Change { index, item } => {
                            self.ids[index] = item["state"]["id"].as_str().unwrap().to_string()
                        }
                        ListChange::Remove { index, id } => {
                            assert_eq!(self.ids.remove(index), id);
                        }
                    }
                }
            }
        }
    }

    fn open_window(
        toc: &Arc<OrderedToc<ConversationInfo>>,
    ) -> (Arc<WindowedListProxy<ConversationInfo>>, UnboundedReceiver<BridgeMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let proxy = WindowedListProxy::open(
            Handle(1),
            Arc::clone(toc),
            Arc::new(DataOverlayManager::new()),
            Outbox::new(tx),
        );
        (proxy, rx)
    }

    #[test]
    fn seek_shows_exactly_the_requested_slice() {
        let toc = inbox();
        for n in 0..30 {
            toc.add_or_update(conversation(&format!("c{n:02}"), n));
        }
        let (proxy, mut rx) = open_window(&toc);
        let mut mirror = Mirror::default();

        proxy.seek(0, 10).unwrap();
        mirror.drain(&mut rx);
        assert_eq!(mirror.ids, toc.ordered_ids()[0..10]);

        proxy.seek(5, 10).unwrap();
        mirror.drain(&mut rx);
        assert_eq!(mirror.offset, 5);
        assert_eq!(mirror.total, 30);
        assert_eq!(mirror.ids, toc.ordered_ids()[5..15]);
    }

    #[test]
    fn inserts_before_the_window_keep_items_in_view() {
        let toc = inbox();
        for n in 0..10 {
            toc.add_or_update(conversation(&format!("c{n}"), n));
        }
        let (proxy, mut rx) = open_window(&toc);
        let mut mirror = Mirror::default();
        proxy.seek(3, 4).unwrap();
        mirror.drain(&mut rx);
        let before = mirror.ids.clone();

        // newest first: a newer conversation lands at index 0
        toc.add_or_update(conversation("new", 100));
        mirror.drain(&mut rx);

        assert_eq!(mirror.offset, 4);
        assert_eq!(mirror.ids, before);
        assert_eq!(mirror.total, 11);
    }

    #[test]
    fn unbounded_seek_follows_the_tail() {
        let toc = inbox();
        for n in 0..10 {
            toc.add_or_update(conversation(&format!("c{n}"), n * 2));
        }
        let (proxy, mut rx) = open_window(&toc);
        let mut mirror = Mirror::default();
        proxy.seek(2, usize::MAX).unwrap();
        mirror.drain(&mut rx);

        toc.add_or_update(conversation("late", 5));
        toc.remove("c1");
        mirror.drain(&mut rx);

        assert_eq!(mirror.total, 10);
        assert_eq!(mirror.ids, toc.ordered_ids()[2..]);
        assert!(mirror.ids.contains(&"late".to_string()));
    }

    #[test]
    fn random_edits_keep_the_window_in_sync() {
        let toc = inbox();
        let mut rng = rand::thread_rng();
        for n in 0..40 {
            toc.add_or_update(conversation(&format!("c{n}"), rng.gen_range(0..50)));
        }
        let (proxy, mut rx) = open_window(&toc);
        let mut mirror = Mirror::default();
        let mut count = 8;
        proxy.seek(10, count).unwrap();

        for step in 0..400 {
            let id = format!("c{}", rng.gen_range(0..60));
            match rng.gen_range(0..10) {
                0..=3 => toc.add_or_update(conversation(&id, rng.gen_range(0..50))),
                4..=6 => toc.remove(&id),
                7 => {
                    let mut moved = conversation(&id, rng.gen_range(0..50));
                    moved.folder_ids = vec!["archive".into()];
                    toc.add_or_update(moved);
                }
                _ => {
                    count = rng.gen_range(1..12);
                    proxy.seek(rng.gen_range(0..50), count).unwrap();
                }
            }
            mirror.drain(&mut rx);

            let expected: Vec<String> = toc.slice(mirror.offset, count).into_iter().map(|c| c.id).collect();
            assert_eq!(mirror.total, toc.len(), "step {step}");
            assert_eq!(mirror.ids, expected, "step {step}");
        }
    }

    #[test]
    fn entire_list_starts_full_then_sends_diffs() {
        let toc = Arc::new(OrderedToc::<AccountDef>::new(""));
        toc.load(vec![("z".into(), json!({ "id": "z", "name": "Zeta" }))]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let proxy = EntireListProxy::open(
            Handle(7),
            Arc::clone(&toc),
            Arc::new(DataOverlayManager::new()),
            Outbox::new(tx),
        );

        toc.add_or_update(AccountDef::new("a", "Alpha"));
        proxy.release();
        toc.add_or_update(AccountDef::new("m", "Mike"));

        let messages: Vec<BridgeMessage> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(messages.len(), 2);
        let BridgeMessage::ListUpdate { total, changes, .. } = &messages[1] else {
            panic!("expected a list update");
        };
        assert_eq!(*total, 2);
        assert!(matches!(&changes[0], ListChange::Add { index: 0, item } if item["state"]["name"] == "Alpha"));
        assert!(proxy.seek(0, 1).is_err());
    }

    #[test]
    fn overlay_announcements_refresh_matching_items() {
        let toc = Arc::new(OrderedToc::<AccountDef>::new(""));
        toc.load(Vec::new());
        toc.add_or_update(AccountDef::new("a1", "Work"));
        let overlays = Arc::new(DataOverlayManager::new());
        overlays.register_provider("accounts", "sync", Arc::new(|_: &str| Some(json!("syncing"))));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _proxy = EntireListProxy::open(Handle(1), Arc::clone(&toc), Arc::clone(&overlays), Outbox::new(tx));
        let _initial = rx.try_recv();

        overlays.announce(&OverlayKey::new("accounts", "a1"));
        overlays.announce(&OverlayKey::new("accounts", "other"));

        let messages: Vec<BridgeMessage> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(messages.len(), 1);
        let BridgeMessage::ListUpdate { changes, .. } = &messages[0] else {
            panic!("expected a list update");
        };
        assert!(matches!(&changes[0], ListChange::Change { index: 0, item } if item["overlays"]["sync"] == "syncing"));
    }
}
