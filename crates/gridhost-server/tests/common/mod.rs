#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use gridhost_server::capture::{CaptureStrategy, Delivery, FrameSink};
use gridhost_server::plugins::PluginCatalog;
use gridhost_server::session::{ClientId, PluginProcessor};
use gridhost_server::shutdown::{HostServer, ProcessExit};
use gridhost_server::supervisor::{
    SandboxChild, SandboxLauncher, SupervisorError, SupervisorOptions, WorkerStatus,
};
use gridhost_server::window::{
    EditorRequest, EditorWindow, InputListener, KeyEvent, PanelKind, PanelWindow, Position,
    WindowError, WindowFactory,
};
use gridhost_server::ExitCode;
use parking_lot::Mutex;

pub fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    done()
}

pub fn fast_options() -> SupervisorOptions {
    SupervisorOptions {
        launch_timeout: Duration::from_secs(2),
        stop_timeout: Duration::from_millis(500),
        poll_interval: Duration::from_millis(5),
        restart_delay: Duration::from_millis(10),
        scan_on_restart: false,
    }
}

pub struct Plugin {
    name: &'static str,
    editor: bool,
}

impl Plugin {
    pub fn new(name: &'static str) -> Arc<dyn PluginProcessor> {
        Arc::new(Self { name, editor: true })
    }

    pub fn without_editor(name: &'static str) -> Arc<dyn PluginProcessor> {
        Arc::new(Self {
            name,
            editor: false,
        })
    }
}

impl PluginProcessor for Plugin {
    fn name(&self) -> &str {
        self.name
    }

    fn has_editor(&self) -> bool {
        self.editor
    }
}

pub struct NullSink;

impl FrameSink for NullSink {
    fn deliver(&self, _delivery: Delivery) {}
}

pub fn native() -> CaptureStrategy {
    CaptureStrategy::native(Arc::new(NullSink))
}

pub struct NoopListener;

impl InputListener for NoopListener {
    fn on_key(&self, _event: &KeyEvent) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowEvent {
    Created(ClientId, Position),
    Moved(ClientId, Position),
    Front(ClientId),
    Inset(ClientId, i32),
    Listener(ClientId),
    Closed(ClientId),
    PanelShown(PanelKind),
    PanelClosed(PanelKind),
}

impl WindowEvent {
    fn client(&self) -> Option<ClientId> {
        match *self {
            WindowEvent::Created(id, _)
            | WindowEvent::Moved(id, _)
            | WindowEvent::Front(id)
            | WindowEvent::Inset(id, _)
            | WindowEvent::Listener(id)
            | WindowEvent::Closed(id) => Some(id),
            WindowEvent::PanelShown(_) | WindowEvent::PanelClosed(_) => None,
        }
    }
}

#[derive(Clone, Default)]
pub struct WindowLog(Arc<Mutex<Vec<WindowEvent>>>);

impl WindowLog {
    fn push(&self, event: WindowEvent) {
        self.0.lock().push(event);
    }

    pub fn events(&self) -> Vec<WindowEvent> {
        self.0.lock().clone()
    }

    pub fn for_client(&self, id: ClientId) -> Vec<WindowEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.client() == Some(id))
            .collect()
    }

    pub fn count(&self, wanted: WindowEvent) -> usize {
        self.events().iter().filter(|event| **event == wanted).count()
    }

    pub fn live_editors(&self, id: ClientId) -> isize {
        self.for_client(id).iter().fold(0, |live, event| match event {
            WindowEvent::Created(..) => live + 1,
            WindowEvent::Closed(_) => live - 1,
            _ => live,
        })
    }
}

/// Window factory that records every native call instead of drawing.
pub struct RecordingWindows {
    log: WindowLog,
}

impl RecordingWindows {
    pub fn new() -> (Box<dyn WindowFactory>, WindowLog) {
        let log = WindowLog::default();
        (Box::new(Self { log: log.clone() }), log)
    }
}

impl WindowFactory for RecordingWindows {
    fn create_editor(
        &mut self,
        request: &EditorRequest,
    ) -> Result<Box<dyn EditorWindow>, WindowError> {
        if !request.processor.has_editor() {
            return Err(WindowError::NoEditor(request.processor.name().to_string()));
        }
        self.log
            .push(WindowEvent::Created(request.id, request.position));
        Ok(Box::new(RecordingEditor {
            id: request.id,
            log: self.log.clone(),
        }))
    }

    fn create_panel(&mut self, kind: PanelKind) -> Result<Box<dyn PanelWindow>, WindowError> {
        self.log.push(WindowEvent::PanelShown(kind));
        Ok(Box::new(RecordingPanel {
            kind,
            log: self.log.clone(),
        }))
    }
}

struct RecordingEditor {
    id: ClientId,
    log: WindowLog,
}

impl EditorWindow for RecordingEditor {
    fn bring_to_front(&mut self) {
        self.log.push(WindowEvent::Front(self.id));
    }

    fn move_to(&mut self, position: Position) {
        self.log.push(WindowEvent::Moved(self.id, position));
    }

    fn set_capture_inset(&mut self, inset: i32) {
        self.log.push(WindowEvent::Inset(self.id, inset));
    }

    fn add_input_listener(&mut self, _listener: Arc<dyn InputListener>) {
        self.log.push(WindowEvent::Listener(self.id));
    }

    fn close(&mut self) {
        self.log.push(WindowEvent::Closed(self.id));
    }
}

struct RecordingPanel {
    kind: PanelKind,
    log: WindowLog,
}

impl PanelWindow for RecordingPanel {
    fn close(&mut self) {
        self.log.push(WindowEvent::PanelClosed(self.kind));
    }
}

/// Shared record of launches and rescans, in the order they happened.
#[derive(Clone, Default)]
pub struct Timeline(Arc<Mutex<Vec<&'static str>>>);

impl Timeline {
    pub fn push(&self, entry: &'static str) {
        self.0.lock().push(entry);
    }

    pub fn entries(&self) -> Vec<&'static str> {
        self.0.lock().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.lock().iter().filter(|e| **e == entry).count()
    }
}

/// How one fake worker behaves.
#[derive(Debug, Clone, Copy)]
pub struct Script {
    pub ready: bool,
    /// Status the worker exits with on its own, right after launch.
    pub exit: Option<WorkerStatus>,
    /// Status after a stop request; `None` ignores stop requests.
    pub on_stop: Option<WorkerStatus>,
}

impl Script {
    pub fn healthy() -> Self {
        Self {
            ready: true,
            exit: None,
            on_stop: Some(WorkerStatus::exited(0)),
        }
    }

    pub fn exits_with(code: i32) -> Self {
        Self {
            ready: false,
            exit: Some(WorkerStatus::exited(code)),
            on_stop: Some(WorkerStatus::exited(0)),
        }
    }

    pub fn crashes() -> Self {
        Self {
            ready: false,
            exit: Some(WorkerStatus::signaled()),
            on_stop: None,
        }
    }

    pub fn stubborn() -> Self {
        Self {
            ready: true,
            exit: None,
            on_stop: None,
        }
    }

    pub fn silent() -> Self {
        Self {
            ready: false,
            exit: None,
            on_stop: Some(WorkerStatus::exited(0)),
        }
    }
}

pub struct FakeLauncher {
    scripts: VecDeque<Script>,
    fallback: Script,
    timeline: Timeline,
    kills: Arc<AtomicUsize>,
    next_pid: AtomicU32,
    fail: bool,
}

impl FakeLauncher {
    pub fn new(timeline: Timeline) -> Self {
        Self {
            scripts: VecDeque::new(),
            fallback: Script::healthy(),
            timeline,
            kills: Arc::new(AtomicUsize::new(0)),
            next_pid: AtomicU32::new(4000),
            fail: false,
        }
    }

    pub fn then(mut self, script: Script) -> Self {
        self.scripts.push_back(script);
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn kills(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.kills)
    }
}

impl SandboxLauncher for FakeLauncher {
    fn launch(&mut self) -> Result<Box<dyn SandboxChild>, SupervisorError> {
        self.timeline.push("launch");
        if self.fail {
            return Err(SupervisorError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "no sandbox binary",
            )));
        }
        let script = self.scripts.pop_front().unwrap_or(self.fallback);
        Ok(Box::new(FakeChild {
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            ready: script.ready,
            status: script.exit,
            on_stop: script.on_stop,
            kills: Arc::clone(&self.kills),
        }))
    }
}

struct FakeChild {
    pid: u32,
    ready: bool,
    status: Option<WorkerStatus>,
    on_stop: Option<WorkerStatus>,
    kills: Arc<AtomicUsize>,
}

impl SandboxChild for FakeChild {
    fn id(&self) -> u32 {
        self.pid
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn try_wait(&mut self) -> io::Result<Option<WorkerStatus>> {
        Ok(self.status)
    }

    fn request_stop(&mut self) {
        if self.status.is_none() {
            self.status = self.on_stop;
        }
    }

    fn kill(&mut self) -> io::Result<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        self.status.get_or_insert(WorkerStatus::signaled());
        Ok(())
    }
}

pub struct CountingCatalog {
    timeline: Timeline,
}

impl CountingCatalog {
    pub fn new(timeline: Timeline) -> Arc<Self> {
        Arc::new(Self { timeline })
    }
}

impl PluginCatalog for CountingCatalog {
    fn rescan(&self) -> anyhow::Result<usize> {
        self.timeline.push("rescan");
        Ok(0)
    }
}

#[derive(Clone, Default)]
pub struct RecordingExit(Arc<Mutex<Vec<ExitCode>>>);

impl RecordingExit {
    pub fn codes(&self) -> Vec<ExitCode> {
        self.0.lock().clone()
    }
}

impl ProcessExit for RecordingExit {
    fn exit(&self, code: ExitCode) {
        self.0.lock().push(code);
    }
}

/// Host server fake. With a gate, `release` reports that it was entered and
/// then blocks until the test lets it go.
pub struct FakeServer {
    releases: Arc<AtomicUsize>,
    gate: Option<(Sender<()>, Receiver<()>)>,
}

impl FakeServer {
    pub fn new() -> (Self, Arc<AtomicUsize>) {
        let releases = Arc::new(AtomicUsize::new(0));
        (
            Self {
                releases: Arc::clone(&releases),
                gate: None,
            },
            releases,
        )
    }

    pub fn gated(entered: Sender<()>, proceed: Receiver<()>) -> (Self, Arc<AtomicUsize>) {
        let (mut server, releases) = Self::new();
        server.gate = Some((entered, proceed));
        (server, releases)
    }
}

impl HostServer for FakeServer {
    fn release(&mut self) {
        if let Some((entered, proceed)) = &self.gate {
            let _ = entered.send(());
            let _ = proceed.recv_timeout(Duration::from_secs(5));
        }
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}
