use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::capture::{CaptureDispatcher, CaptureStats, CaptureStrategy};
use crate::presence::PresenceIndicator;
use crate::session::{ClientId, PluginProcessor};
use crate::ui_thread::{UiContext, UiThread};
use crate::window::{EditorRequest, InputListener, Point, Position};

struct SessionEntry {
    processor: Arc<dyn PluginProcessor>,
    capture: Arc<CaptureDispatcher>,
    position: Position,
    generation: u64,
}

impl SessionEntry {
    fn request(&self, id: ClientId) -> EditorRequest {
        EditorRequest {
            id,
            processor: Arc::clone(&self.processor),
            capture: Arc::clone(&self.capture),
            position: self.position,
        }
    }
}

type SessionMap = Arc<Mutex<HashMap<ClientId, SessionEntry>>>;

/// Bookkeeping for every open remote editor.
///
/// The map lock only guards bookkeeping. Window work is queued to the UI
/// thread while the lock is held, which is fine because queueing never
/// blocks, and it keeps the UI-side order for an id identical to the order
/// callers mutated the map in. Window calls themselves always run later, on
/// the UI thread, without the lock.
pub struct SessionRegistry {
    sessions: SessionMap,
    generation: AtomicU64,
    ui: UiThread,
    presence: Arc<PresenceIndicator>,
}

impl SessionRegistry {
    pub fn new(ui: UiThread, presence: Arc<PresenceIndicator>) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            ui,
            presence,
        }
    }

    /// Opens an editor session for `id`, replacing any session already
    /// registered under it. The previous window is torn down on the UI
    /// thread before the new one is built, and also when the new one cannot
    /// be set up at all.
    pub fn open_session(
        &self,
        processor: Arc<dyn PluginProcessor>,
        id: ClientId,
        strategy: CaptureStrategy,
        x: i32,
        y: i32,
    ) {
        let capture = match CaptureDispatcher::new(id, strategy) {
            Ok(capture) => Arc::new(capture),
            Err(err) => {
                tracing::error!(?id, %err, "cannot open session without a capture hook");
                self.close_session(id, true);
                return;
            }
        };
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = SessionEntry {
            processor,
            capture,
            position: Position::new(x, y),
            generation,
        };
        let request = entry.request(id);

        let replaced = {
            let mut sessions = self.sessions.lock();
            let replaced = sessions.insert(id, entry);
            let map = Arc::clone(&self.sessions);
            let presence = Arc::clone(&self.presence);
            self.ui.post(move |ctx| {
                if ctx.close_editor(id).is_some() {
                    tracing::debug!(?id, "closed previous editor");
                }
                match ctx.open_editor(&request) {
                    Ok(()) => tracing::info!(
                        ?id,
                        plugin = request.processor.name(),
                        capture = ?request.capture.kind(),
                        "editor opened"
                    ),
                    Err(err) => {
                        tracing::error!(?id, %err, "failed to open editor");
                        drop_if_generation(&map, id, generation);
                    }
                }
                presence.set_editors(ctx.has_editors());
            });
            replaced
        };
        if replaced.is_some() {
            tracing::debug!(?id, "replaced existing session");
        }
    }

    /// Closes the session for `id`. A no-op when none exists.
    /// `update_indicator` is false during bulk closes, which recompute the
    /// presence indicator once at the end.
    pub fn close_session(&self, id: ClientId, update_indicator: bool) {
        let removed = {
            let mut sessions = self.sessions.lock();
            let removed = sessions.remove(&id);
            if removed.is_some() {
                self.post_close(id, update_indicator);
            }
            removed
        };
        if removed.is_some() {
            tracing::debug!(?id, "session closed");
        }
    }

    /// Closes every session and recomputes the presence indicator once.
    /// Returns the number of sessions closed.
    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = {
            let mut sessions = self.sessions.lock();
            let drained: Vec<_> = sessions.drain().collect();
            for (id, _) in &drained {
                self.post_close(*id, false);
            }
            let presence = Arc::clone(&self.presence);
            self.ui
                .post(move |ctx| presence.set_editors(ctx.has_editors()));
            drained
        };
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "closed all sessions");
        }
        drained.len()
    }

    /// Rebuilds the window for `id` with the same processor and capture
    /// hook. Listeners attached to the old window are carried over.
    pub fn reset_session(&self, id: ClientId) {
        let sessions = self.sessions.lock();
        let Some(entry) = sessions.get(&id) else {
            return;
        };
        let request = entry.request(id);
        let generation = entry.generation;
        let map = Arc::clone(&self.sessions);
        let presence = Arc::clone(&self.presence);
        self.ui.post(move |ctx| {
            let listeners = ctx.close_editor(id).unwrap_or_default();
            match ctx.open_editor(&request) {
                Ok(()) => {
                    for listener in listeners {
                        ctx.attach_listener(id, listener);
                    }
                    tracing::debug!(?id, "editor reset");
                }
                Err(err) => {
                    tracing::error!(?id, %err, "failed to rebuild editor");
                    drop_if_generation(&map, id, generation);
                }
            }
            presence.set_editors(ctx.has_editors());
        });
    }

    pub fn restart_session(&self, id: ClientId) {
        self.reset_session(id);
    }

    pub fn bring_to_front(&self, id: ClientId) {
        self.post_if_open(id, move |ctx| {
            if let Some(window) = ctx.editor_mut(id) {
                window.bring_to_front();
            }
        });
    }

    pub fn move_to(&self, id: ClientId, x: i32, y: i32) {
        let position = Position::new(x, y);
        let mut sessions = self.sessions.lock();
        let Some(entry) = sessions.get_mut(&id) else {
            return;
        };
        entry.position = position;
        self.ui.post(move |ctx| {
            if let Some(window) = ctx.editor_mut(id) {
                window.move_to(position);
            }
        });
    }

    pub fn update_capture_area(&self, id: ClientId, inset: i32) {
        self.post_if_open(id, move |ctx| {
            if let Some(window) = ctx.editor_mut(id) {
                window.set_capture_inset(inset);
            }
        });
    }

    pub fn attach_input_listener(&self, id: ClientId, listener: Arc<dyn InputListener>) {
        self.post_if_open(id, move |ctx| {
            ctx.attach_listener(id, listener);
        });
    }

    /// Translates a point local to the editor of `id` into screen space.
    /// Unknown ids return the point unchanged.
    pub fn relay_local_point_to_global(&self, id: ClientId, point: Point) -> Point {
        match self.sessions.lock().get(&id) {
            Some(entry) => point.offset_by(entry.position),
            None => point,
        }
    }

    pub fn active_processor(&self, id: ClientId) -> Option<Arc<dyn PluginProcessor>> {
        self.sessions
            .lock()
            .get(&id)
            .map(|entry| Arc::clone(&entry.processor))
    }

    pub fn capture_stats(&self, id: ClientId) -> Option<CaptureStats> {
        self.sessions.lock().get(&id).map(|entry| entry.capture.stats())
    }

    pub fn position(&self, id: ClientId) -> Option<Position> {
        self.sessions.lock().get(&id).map(|entry| entry.position)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Waits until every window operation queued so far has completed.
    pub fn settle(&self) {
        self.ui.flush();
    }

    fn post_if_open<F>(&self, id: ClientId, task: F)
    where
        F: FnOnce(&mut UiContext) + Send + 'static,
    {
        let sessions = self.sessions.lock();
        if sessions.contains_key(&id) {
            self.ui.post(task);
        }
    }

    fn post_close(&self, id: ClientId, update_indicator: bool) {
        let presence = Arc::clone(&self.presence);
        self.ui.post(move |ctx| {
            if ctx.close_editor(id).is_some() {
                tracing::info!(?id, "editor closed");
            }
            if update_indicator {
                presence.set_editors(ctx.has_editors());
            }
        });
    }
}

/// Forgets a session whose window could not be built, unless it has been
/// replaced in the meantime.
fn drop_if_generation(map: &SessionMap, id: ClientId, generation: u64) {
    let removed = {
        let mut sessions = map.lock();
        match sessions.get(&id) {
            Some(entry) if entry.generation == generation => sessions.remove(&id),
            _ => None,
        }
    };
    drop(removed);
}
