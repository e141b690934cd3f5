//! Boundary toward the platform windowing layer.
//!
//! Every type here is created, used and destroyed on the UI thread only (see
//! [`crate::ui_thread`]), which is why windows are not required to be `Send`.
//! The factory itself crosses over once when the UI thread starts.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::capture::CaptureDispatcher;
use crate::session::{ClientId, PluginProcessor};

/// Screen position of a window's top-left corner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn offset_by(self, origin: Position) -> Self {
        Self {
            x: self.x + origin.x as f32,
            y: self.y + origin.y as f32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    pub key_code: u32,
    pub modifiers: u32,
    pub pressed: bool,
}

/// Receives key input forwarded from a remote client into an editor window.
pub trait InputListener: Send + Sync {
    /// Returns `true` when the event was consumed.
    fn on_key(&self, event: &KeyEvent) -> bool;
}

/// A native editor window showing a plug-in's UI.
pub trait EditorWindow {
    fn bring_to_front(&mut self);
    fn move_to(&mut self, position: Position);
    /// Shrinks the captured region by `inset` pixels on every side.
    fn set_capture_inset(&mut self, inset: i32);
    fn add_input_listener(&mut self, listener: Arc<dyn InputListener>);
    /// Detaches listeners, hides the window and releases native resources.
    fn close(&mut self);
}

/// Auxiliary windows owned by the server shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PanelKind {
    Settings,
    Statistics,
    PluginList,
    Splash,
}

impl PanelKind {
    pub const ALL: [PanelKind; 4] = [
        PanelKind::Settings,
        PanelKind::Statistics,
        PanelKind::PluginList,
        PanelKind::Splash,
    ];
}

pub trait PanelWindow {
    fn set_info(&mut self, _text: &str) {}
    fn close(&mut self);
}

/// Everything the windowing layer needs to build an editor.
#[derive(Clone)]
pub struct EditorRequest {
    pub id: ClientId,
    pub processor: Arc<dyn PluginProcessor>,
    /// Hook the window calls once per rendered frame.
    pub capture: Arc<CaptureDispatcher>,
    pub position: Position,
}

impl fmt::Debug for EditorRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EditorRequest")
            .field("id", &self.id)
            .field("processor", &self.processor.name())
            .field("capture", &self.capture.kind())
            .field("position", &self.position)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum WindowError {
    #[error("plugin {0} has no editor")]
    NoEditor(String),
    #[error("failed to create window: {0}")]
    Create(String),
}

pub trait WindowFactory: Send {
    fn create_editor(&mut self, request: &EditorRequest)
        -> Result<Box<dyn EditorWindow>, WindowError>;
    fn create_panel(&mut self, kind: PanelKind) -> Result<Box<dyn PanelWindow>, WindowError>;
}

/// Window factory for machines without a display. Windows only keep their
/// geometry and log what happens to them.
#[derive(Debug, Default)]
pub struct HeadlessWindows;

impl WindowFactory for HeadlessWindows {
    fn create_editor(
        &mut self,
        request: &EditorRequest,
    ) -> Result<Box<dyn EditorWindow>, WindowError> {
        if !request.processor.has_editor() {
            return Err(WindowError::NoEditor(request.processor.name().to_string()));
        }
        tracing::debug!(?request, "headless editor created");
        Ok(Box::new(HeadlessEditor {
            id: request.id,
            position: request.position,
            listeners: Vec::new(),
        }))
    }

    fn create_panel(&mut self, kind: PanelKind) -> Result<Box<dyn PanelWindow>, WindowError> {
        tracing::debug!(?kind, "headless panel created");
        Ok(Box::new(HeadlessPanel { kind }))
    }
}

struct HeadlessEditor {
    id: ClientId,
    position: Position,
    listeners: Vec<Arc<dyn InputListener>>,
}

impl EditorWindow for HeadlessEditor {
    fn bring_to_front(&mut self) {
        tracing::trace!(id = ?self.id, "bring to front");
    }

    fn move_to(&mut self, position: Position) {
        self.position = position;
    }

    fn set_capture_inset(&mut self, inset: i32) {
        tracing::trace!(id = ?self.id, inset, "capture inset");
    }

    fn add_input_listener(&mut self, listener: Arc<dyn InputListener>) {
        self.listeners.push(listener);
    }

    fn close(&mut self) {
        self.listeners.clear();
        tracing::debug!(id = ?self.id, position = ?self.position, "headless editor closed");
    }
}

struct HeadlessPanel {
    kind: PanelKind,
}

impl PanelWindow for HeadlessPanel {
    fn set_info(&mut self, text: &str) {
        tracing::info!(kind = ?self.kind, "{text}");
    }

    fn close(&mut self) {
        tracing::debug!(kind = ?self.kind, "headless panel closed");
    }
}
