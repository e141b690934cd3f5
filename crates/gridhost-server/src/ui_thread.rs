//! The one thread allowed to touch windows.
//!
//! Window construction, destruction and geometry changes are posted to this
//! thread as tasks and run strictly in submission order. Callers never block
//! on a task unless they explicitly [`UiThread::flush`].

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::session::ClientId;
use crate::window::{
    EditorRequest, EditorWindow, InputListener, PanelKind, PanelWindow, WindowError,
    WindowFactory,
};

pub type UiTask = Box<dyn FnOnce(&mut UiContext) + Send + 'static>;

enum UiMessage {
    Run(UiTask),
    RunAt(Instant, UiTask),
    Flush(Sender<()>),
    Shutdown,
}

struct EditorSlot {
    window: Box<dyn EditorWindow>,
    listeners: Vec<Arc<dyn InputListener>>,
}

/// State owned by the UI thread. Tasks receive it mutably.
pub struct UiContext {
    factory: Box<dyn WindowFactory>,
    editors: HashMap<ClientId, EditorSlot>,
    panels: HashMap<PanelKind, Box<dyn PanelWindow>>,
}

impl UiContext {
    fn new(factory: Box<dyn WindowFactory>) -> Self {
        Self {
            factory,
            editors: HashMap::new(),
            panels: HashMap::new(),
        }
    }

    /// Builds the editor for `request.id`. A window still registered under
    /// that id is closed first.
    pub fn open_editor(&mut self, request: &EditorRequest) -> Result<(), WindowError> {
        self.close_editor(request.id);
        let window = self.factory.create_editor(request)?;
        self.editors.insert(
            request.id,
            EditorSlot {
                window,
                listeners: Vec::new(),
            },
        );
        Ok(())
    }

    /// Closes the editor for `id` and hands back the listeners that were
    /// attached to it. `None` when no editor exists.
    pub fn close_editor(&mut self, id: ClientId) -> Option<Vec<Arc<dyn InputListener>>> {
        let mut slot = self.editors.remove(&id)?;
        slot.window.close();
        Some(slot.listeners)
    }

    pub fn editor_mut(&mut self, id: ClientId) -> Option<&mut Box<dyn EditorWindow>> {
        self.editors.get_mut(&id).map(|slot| &mut slot.window)
    }

    pub fn attach_listener(&mut self, id: ClientId, listener: Arc<dyn InputListener>) -> bool {
        match self.editors.get_mut(&id) {
            Some(slot) => {
                slot.window.add_input_listener(Arc::clone(&listener));
                slot.listeners.push(listener);
                true
            }
            None => false,
        }
    }

    pub fn has_editors(&self) -> bool {
        !self.editors.is_empty()
    }

    pub fn editor_count(&self) -> usize {
        self.editors.len()
    }

    /// Shows the panel unless it is already open.
    pub fn show_panel(&mut self, kind: PanelKind) -> Result<(), WindowError> {
        if self.panels.contains_key(&kind) {
            return Ok(());
        }
        let panel = self.factory.create_panel(kind)?;
        self.panels.insert(kind, panel);
        Ok(())
    }

    /// Closes the panel. Returns `false` when it was not open.
    pub fn close_panel(&mut self, kind: PanelKind) -> bool {
        match self.panels.remove(&kind) {
            Some(mut panel) => {
                panel.close();
                true
            }
            None => false,
        }
    }

    pub fn panel_mut(&mut self, kind: PanelKind) -> Option<&mut Box<dyn PanelWindow>> {
        self.panels.get_mut(&kind)
    }

    pub fn has_panels(&self) -> bool {
        !self.panels.is_empty()
    }

    fn teardown(&mut self) {
        let ids: Vec<_> = self.editors.keys().copied().collect();
        for id in ids {
            self.close_editor(id);
        }
        for kind in PanelKind::ALL {
            self.close_panel(kind);
        }
    }
}

struct Inner {
    tx: Sender<UiMessage>,
    thread_id: ThreadId,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn stop(&self) {
        let _ = self.tx.send(UiMessage::Shutdown);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if thread::current().id() == self.thread_id {
                return;
            }
            if handle.join().is_err() {
                tracing::error!("ui thread panicked");
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Cloneable handle to the UI thread.
#[derive(Clone)]
pub struct UiThread {
    inner: Arc<Inner>,
}

impl UiThread {
    pub fn spawn(factory: Box<dyn WindowFactory>) -> io::Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = thread::Builder::new()
            .name("gridhost-ui".into())
            .spawn(move || run_loop(rx, UiContext::new(factory)))?;
        let thread_id = handle.thread().id();
        Ok(Self {
            inner: Arc::new(Inner {
                tx,
                thread_id,
                handle: Mutex::new(Some(handle)),
            }),
        })
    }

    pub fn post<F>(&self, task: F)
    where
        F: FnOnce(&mut UiContext) + Send + 'static,
    {
        if self.inner.tx.send(UiMessage::Run(Box::new(task))).is_err() {
            tracing::debug!("ui thread stopped, dropping task");
        }
    }

    /// Runs `task` on the UI thread once `delay` has elapsed.
    pub fn post_delayed<F>(&self, delay: Duration, task: F)
    where
        F: FnOnce(&mut UiContext) + Send + 'static,
    {
        let at = Instant::now() + delay;
        if self.inner.tx.send(UiMessage::RunAt(at, Box::new(task))).is_err() {
            tracing::debug!("ui thread stopped, dropping delayed task");
        }
    }

    /// Blocks until every task posted before this call has run. Returns
    /// immediately on the UI thread itself or once the thread has stopped.
    pub fn flush(&self) {
        if self.is_current() {
            return;
        }
        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
        if self.inner.tx.send(UiMessage::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }

    pub fn is_current(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }

    /// Stops the loop after the tasks already queued. Remaining windows are
    /// closed on the UI thread before it exits.
    pub fn shutdown(&self) {
        self.inner.stop();
    }
}

fn run_loop(rx: Receiver<UiMessage>, mut ctx: UiContext) {
    let mut timers: Vec<(Instant, UiTask)> = Vec::new();
    loop {
        let now = Instant::now();
        let mut index = 0;
        while index < timers.len() {
            if timers[index].0 <= now {
                let (_, task) = timers.remove(index);
                task(&mut ctx);
            } else {
                index += 1;
            }
        }

        let next_deadline = timers.iter().map(|(at, _)| *at).min();
        let message = match next_deadline {
            Some(deadline) => match rx.recv_deadline(deadline) {
                Ok(message) => message,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match rx.recv() {
                Ok(message) => message,
                Err(_) => break,
            },
        };

        match message {
            UiMessage::Run(task) => task(&mut ctx),
            UiMessage::RunAt(at, task) => timers.push((at, task)),
            UiMessage::Flush(ack) => {
                let _ = ack.send(());
            }
            UiMessage::Shutdown => break,
        }
    }
    if !timers.is_empty() {
        tracing::debug!(pending = timers.len(), "discarding delayed ui tasks");
    }
    ctx.teardown();
}
