//! Lifecycle of the sandbox worker process.
//!
//! The supervisor runs on its own thread. It launches the worker, waits for
//! the worker's launch confirmation, and polls both the worker and the stop
//! flag at a fixed interval. When the worker terminates, its exit status is
//! classified into a recovery decision: clean exit, automatic relaunch, or a
//! fatal failure that is reported through [`SupervisorEvent::Failed`] and
//! never retried.

mod process;

pub use process::ProcessLauncher;

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use gridhost_bridge::{ExitClass, ExitCode, SandboxFailure};
use parking_lot::Mutex;
use thiserror::Error;

use crate::config::ServerConfig;
use crate::plugins::PluginCatalog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed(SandboxFailure),
}

impl SupervisorState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorEvent {
    Started { pid: u32 },
    Restarting { rescan: bool },
    Exited(ExitCode),
    Failed(SandboxFailure),
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn sandbox {}: {source}", .path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("sandbox i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("failed to start supervisor thread: {0}")]
    Thread(#[source] io::Error),
}

/// Cooperative cancellation token shared with the supervision loop.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// How a worker terminated. `code` is `None` when it was killed by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStatus {
    pub code: Option<i32>,
}

impl WorkerStatus {
    pub fn exited(code: i32) -> Self {
        Self { code: Some(code) }
    }

    pub fn signaled() -> Self {
        Self { code: None }
    }

    pub fn classify(self) -> ExitClass {
        ExitClass::from_status(self.code)
    }
}

impl From<std::process::ExitStatus> for WorkerStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

/// A launched worker as seen by the supervision loop.
pub trait SandboxChild: Send {
    fn id(&self) -> u32;
    /// Whether the worker has confirmed that it is up.
    fn is_ready(&self) -> bool;
    fn try_wait(&mut self) -> io::Result<Option<WorkerStatus>>;
    /// Asks the worker to exit on its own.
    fn request_stop(&mut self);
    fn kill(&mut self) -> io::Result<()>;
}

pub trait SandboxLauncher: Send {
    fn launch(&mut self) -> Result<Box<dyn SandboxChild>, SupervisorError>;
}

#[derive(Debug, Clone, Copy)]
pub struct SupervisorOptions {
    pub launch_timeout: Duration,
    pub stop_timeout: Duration,
    pub poll_interval: Duration,
    pub restart_delay: Duration,
    /// Rescan the plugin list before every automatic relaunch.
    pub scan_on_restart: bool,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            launch_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(3),
            poll_interval: Duration::from_millis(50),
            restart_delay: Duration::from_millis(250),
            scan_on_restart: false,
        }
    }
}

impl SupervisorOptions {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            launch_timeout: config.launch_timeout(),
            stop_timeout: config.stop_timeout(),
            poll_interval: config.poll_interval(),
            restart_delay: config.restart_delay(),
            scan_on_restart: config.scan_on_restart,
        }
    }
}

struct Control {
    state: SupervisorState,
    /// Pending relaunch and whether it asked for a rescan.
    restart: Option<bool>,
}

struct Shared {
    options: SupervisorOptions,
    control: Mutex<Control>,
    stop: StopFlag,
    child: Mutex<Option<Box<dyn SandboxChild>>>,
    last_exit: Mutex<Option<ExitClass>>,
    launcher: Mutex<Box<dyn SandboxLauncher>>,
    catalog: Arc<dyn PluginCatalog>,
    events: Sender<SupervisorEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopCause {
    Stop,
    Restart,
    LaunchTimeout,
}

enum RunOutcome {
    Exited(WorkerStatus),
    Stopped(WorkerStatus),
    Restarting(WorkerStatus),
    LaunchTimedOut(WorkerStatus),
}

impl Shared {
    fn state(&self) -> SupervisorState {
        self.control.lock().state
    }

    fn set_state(&self, state: SupervisorState) {
        let mut control = self.control.lock();
        if control.state != state {
            tracing::debug!(from = ?control.state, to = ?state, "supervisor state");
            control.state = state;
        }
    }

    /// Enters a terminal state unless a relaunch was requested meanwhile.
    /// Returns `true` when the loop has to keep going.
    fn settle(&self, terminal: SupervisorState) -> bool {
        let mut control = self.control.lock();
        if control.restart.is_some() && !self.stop.is_raised() {
            return true;
        }
        control.restart = None;
        tracing::debug!(from = ?control.state, to = ?terminal, "supervisor state");
        control.state = terminal;
        false
    }

    fn fail(&self, failure: SandboxFailure) -> bool {
        if self.settle(SupervisorState::Failed(failure)) {
            return true;
        }
        tracing::error!(%failure, code = failure.exit_code().code(), "sandbox failed");
        self.emit(SupervisorEvent::Failed(failure));
        false
    }

    fn queue_restart(&self, rescan: bool) {
        let mut control = self.control.lock();
        control.restart = Some(control.restart.unwrap_or(false) || rescan);
    }

    fn restart_pending(&self) -> bool {
        self.control.lock().restart.is_some()
    }

    fn take_restart(&self) -> Option<bool> {
        self.control.lock().restart.take()
    }

    fn emit(&self, event: SupervisorEvent) {
        let _ = self.events.send(event);
    }

    fn record_exit(&self, status: WorkerStatus) -> ExitClass {
        let class = status.classify();
        *self.last_exit.lock() = Some(class);
        self.emit(SupervisorEvent::Exited(class.exit_code()));
        class
    }

    fn with_child(&self, f: impl FnOnce(&mut Box<dyn SandboxChild>)) {
        if let Some(child) = self.child.lock().as_mut() {
            f(child);
        }
    }

    fn rescan(&self) {
        match self.catalog.rescan() {
            Ok(count) => tracing::info!(count, "plugin list refreshed before relaunch"),
            Err(err) => tracing::warn!(?err, "plugin rescan failed, relaunching anyway"),
        }
    }

    /// Sleeps up to `delay`, waking early when the stop flag is raised.
    fn pause(&self, delay: Duration) {
        let until = Instant::now() + delay;
        while !self.stop.is_raised() {
            let now = Instant::now();
            if now >= until {
                break;
            }
            thread::sleep(self.options.poll_interval.min(until - now));
        }
    }

    fn monitor(&self, child: Box<dyn SandboxChild>) -> RunOutcome {
        let pid = child.id();
        *self.child.lock() = Some(child);
        let launched = Instant::now();
        let mut ready = false;
        let mut stopping: Option<(Instant, StopCause)> = None;
        let mut killed = false;

        let status = loop {
            let (exited, now_ready) = {
                let mut guard = self.child.lock();
                let Some(child) = guard.as_mut() else {
                    break WorkerStatus::signaled();
                };
                (child.try_wait(), child.is_ready())
            };
            match exited {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(err) => tracing::warn!(pid, ?err, "failed to poll sandbox"),
            }

            if now_ready && !ready {
                ready = true;
                tracing::info!(pid, "sandbox running");
                self.emit(SupervisorEvent::Started { pid });
                if stopping.is_none() {
                    self.set_state(SupervisorState::Running);
                }
            }

            match stopping {
                None => {
                    let cause = if self.stop.is_raised() {
                        Some(StopCause::Stop)
                    } else if self.restart_pending() {
                        Some(StopCause::Restart)
                    } else if !ready && launched.elapsed() >= self.options.launch_timeout {
                        tracing::error!(pid, timeout = ?self.options.launch_timeout, "sandbox never confirmed launch");
                        Some(StopCause::LaunchTimeout)
                    } else {
                        None
                    };
                    if let Some(cause) = cause {
                        self.set_state(SupervisorState::Stopping);
                        tracing::info!(pid, ?cause, "stopping sandbox");
                        self.with_child(|child| child.request_stop());
                        stopping = Some((Instant::now(), cause));
                    }
                }
                Some((since, _)) => {
                    if !killed && since.elapsed() >= self.options.stop_timeout {
                        tracing::warn!(pid, "sandbox ignored stop request, killing it");
                        self.with_child(|child| {
                            if let Err(err) = child.kill() {
                                tracing::error!(pid, ?err, "failed to kill sandbox");
                            }
                        });
                        killed = true;
                    }
                }
            }

            thread::sleep(self.options.poll_interval);
        };

        // Dropped outside the lock: releasing a worker may wait briefly on
        // its output reader.
        let finished = self.child.lock().take();
        drop(finished);
        tracing::info!(pid, code = ?status.code, "sandbox exited");
        match stopping.map(|(_, cause)| cause) {
            None => RunOutcome::Exited(status),
            Some(StopCause::Stop) => RunOutcome::Stopped(status),
            Some(StopCause::Restart) => RunOutcome::Restarting(status),
            Some(StopCause::LaunchTimeout) => RunOutcome::LaunchTimedOut(status),
        }
    }
}

fn supervise(shared: &Shared) {
    loop {
        if shared.stop.is_raised() {
            shared.settle(SupervisorState::Stopped);
            return;
        }
        if let Some(rescan) = shared.take_restart() {
            tracing::info!(rescan, "relaunching sandbox");
            shared.emit(SupervisorEvent::Restarting { rescan });
            if rescan {
                shared.rescan();
            }
        }

        shared.set_state(SupervisorState::Starting);
        let launched = shared.launcher.lock().launch();
        let child = match launched {
            Ok(child) => child,
            Err(err) => {
                tracing::error!(?err, "failed to launch sandbox");
                if shared.fail(SandboxFailure::Init) {
                    continue;
                }
                return;
            }
        };

        match shared.monitor(child) {
            RunOutcome::Stopped(status) => {
                shared.record_exit(status);
                shared.settle(SupervisorState::Stopped);
                return;
            }
            RunOutcome::Restarting(status) => {
                shared.record_exit(status);
            }
            RunOutcome::LaunchTimedOut(status) => {
                let failure = match shared.record_exit(status) {
                    ExitClass::Fatal(failure) => failure,
                    _ => SandboxFailure::Init,
                };
                if !shared.fail(failure) {
                    return;
                }
            }
            RunOutcome::Exited(status) => match shared.record_exit(status) {
                ExitClass::Ok => {
                    if !shared.settle(SupervisorState::Stopped) {
                        return;
                    }
                }
                ExitClass::RestartRequested => {
                    shared.queue_restart(shared.options.scan_on_restart);
                    shared.pause(shared.options.restart_delay);
                }
                ExitClass::Fatal(failure) => {
                    if !shared.fail(failure) {
                        return;
                    }
                }
            },
        }
    }
}

struct Worker {
    handle: JoinHandle<()>,
    done: Receiver<()>,
}

impl Worker {
    fn join(self) {
        if self.handle.join().is_err() {
            tracing::error!("supervisor thread panicked");
        }
    }
}

/// Owns the sandbox worker and the thread that watches it.
pub struct SandboxSupervisor {
    shared: Arc<Shared>,
    events: Receiver<SupervisorEvent>,
    worker: Mutex<Option<Worker>>,
}

impl SandboxSupervisor {
    pub fn new(
        launcher: Box<dyn SandboxLauncher>,
        catalog: Arc<dyn PluginCatalog>,
        options: SupervisorOptions,
    ) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            shared: Arc::new(Shared {
                options,
                control: Mutex::new(Control {
                    state: SupervisorState::Stopped,
                    restart: None,
                }),
                stop: StopFlag::new(),
                child: Mutex::new(None),
                last_exit: Mutex::new(None),
                launcher: Mutex::new(launcher),
                catalog,
                events: tx,
            }),
            events: rx,
            worker: Mutex::new(None),
        }
    }

    /// Launches the worker from `Stopped` or `Failed`. A no-op while a
    /// worker is already being supervised.
    pub fn start(&self) -> Result<(), SupervisorError> {
        let mut worker = self.worker.lock();
        if let Some(current) = worker.take() {
            if !current.handle.is_finished() && !self.state().is_terminal() {
                *worker = Some(current);
                return Ok(());
            }
            current.join();
        }

        self.shared.stop.clear();
        self.shared.set_state(SupervisorState::Starting);
        let shared = Arc::clone(&self.shared);
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);
        let handle = thread::Builder::new()
            .name("gridhost-supervisor".into())
            .spawn(move || {
                supervise(&shared);
                drop(done_tx);
            })
            .map_err(SupervisorError::Thread)?;
        *worker = Some(Worker {
            handle,
            done: done_rx,
        });
        Ok(())
    }

    /// Raises the stop flag. The worker is asked to exit and killed if it
    /// has not done so within the stop timeout.
    pub fn request_stop(&self) {
        self.shared.stop.raise();
        let mut control = self.shared.control.lock();
        if matches!(
            control.state,
            SupervisorState::Starting | SupervisorState::Running
        ) {
            control.state = SupervisorState::Stopping;
        }
        tracing::info!("sandbox stop requested");
    }

    /// Relaunches the worker, refreshing the plugin list first when
    /// `rescan` is set. Ignored once a stop has been requested.
    pub fn restart(&self, rescan: bool) -> Result<(), SupervisorError> {
        if self.shared.stop.is_raised() && self.worker.lock().is_some() {
            tracing::warn!("ignoring restart request while stopping");
            return Ok(());
        }
        let idle = {
            let mut control = self.shared.control.lock();
            control.restart = Some(control.restart.unwrap_or(false) || rescan);
            control.state.is_terminal()
        };
        tracing::info!(rescan, "sandbox restart requested");
        if idle {
            self.start()?;
        }
        Ok(())
    }

    /// Waits up to `timeout` for the supervision thread to finish. Returns
    /// `false` on timeout.
    pub fn join(&self, timeout: Duration) -> bool {
        let mut worker = self.worker.lock();
        let Some(current) = worker.take() else {
            return true;
        };
        match current.done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                *worker = Some(current);
                false
            }
            _ => {
                current.join();
                true
            }
        }
    }

    /// Kills the current worker without waiting for it to cooperate.
    pub fn force_kill(&self) {
        self.shared.with_child(|child| {
            let pid = child.id();
            tracing::warn!(pid, "force killing sandbox");
            if let Err(err) = child.kill() {
                tracing::error!(pid, ?err, "failed to kill sandbox");
            }
        });
    }

    /// Stop, bounded join, then kill and a second bounded join. Returns
    /// whether the supervision thread finished.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.request_stop();
        if self.join(timeout) {
            return true;
        }
        self.force_kill();
        self.join(timeout)
    }

    pub fn state(&self) -> SupervisorState {
        self.shared.state()
    }

    pub fn events(&self) -> Receiver<SupervisorEvent> {
        self.events.clone()
    }

    pub fn stop_flag(&self) -> StopFlag {
        self.shared.stop.clone()
    }

    pub fn last_exit(&self) -> Option<ExitClass> {
        *self.shared.last_exit.lock()
    }

    pub fn pid(&self) -> Option<u32> {
        self.shared.child.lock().as_ref().map(|child| child.id())
    }

    pub fn options(&self) -> SupervisorOptions {
        self.shared.options
    }
}

impl Drop for SandboxSupervisor {
    fn drop(&mut self) {
        if self.worker.get_mut().is_some() && !self.shutdown(self.shared.options.stop_timeout * 2) {
            tracing::error!("supervisor thread did not finish");
        }
    }
}
