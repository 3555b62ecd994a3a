//! Overlay port.
//!
//! Overlays are transient per-entity annotations that are not stored, such
//! as "a sync of this account is running". Providers compute them on demand;
//! changes are announced by `(namespace, id)` without a payload and
//! consumers re-resolve.

use serde_json::Value;

pub trait OverlayProvider: Send + Sync {
    /// Current overlay for `id`, or `None` when there is nothing to report.
    fn overlay_for(&self, id: &str) -> Option<Value>;
}

impl<F> OverlayProvider for F
where
    F: Fn(&str) -> Option<Value> + Send + Sync,
{
    fn overlay_for(&self, id: &str) -> Option<Value> {
        self(id)
    }
}
