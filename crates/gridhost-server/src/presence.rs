use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

type PresenceSink = Box<dyn Fn(bool) + Send + Sync>;

/// Process-wide "any window visible" flag, used to drive an OS-level
/// presence indicator such as the macOS dock icon.
pub struct PresenceIndicator {
    editors: AtomicBool,
    panels: AtomicBool,
    published: Mutex<Option<bool>>,
    recomputations: AtomicU64,
    sink: Option<PresenceSink>,
}

impl Default for PresenceIndicator {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceIndicator {
    pub fn new() -> Self {
        Self {
            editors: AtomicBool::new(false),
            panels: AtomicBool::new(false),
            published: Mutex::new(None),
            recomputations: AtomicU64::new(0),
            sink: None,
        }
    }

    /// The sink is only called when the combined value changes.
    pub fn with_sink(sink: impl Fn(bool) + Send + Sync + 'static) -> Self {
        Self {
            sink: Some(Box::new(sink)),
            ..Self::new()
        }
    }

    pub fn set_editors(&self, open: bool) {
        self.editors.store(open, Ordering::SeqCst);
        self.publish();
    }

    pub fn set_panels(&self, open: bool) {
        self.panels.store(open, Ordering::SeqCst);
        self.publish();
    }

    pub fn is_visible(&self) -> bool {
        self.editors.load(Ordering::SeqCst) || self.panels.load(Ordering::SeqCst)
    }

    /// Number of times the indicator was recomputed.
    pub fn recomputations(&self) -> u64 {
        self.recomputations.load(Ordering::SeqCst)
    }

    fn publish(&self) {
        self.recomputations.fetch_add(1, Ordering::SeqCst);
        let mut published = self.published.lock();
        let visible = self.is_visible();
        if *published == Some(visible) {
            return;
        }
        *published = Some(visible);
        tracing::debug!(visible, "presence indicator changed");
        if let Some(sink) = &self.sink {
            sink(visible);
        }
    }
}
