//! Process-wide teardown.
//!
//! [`ShutdownCoordinator::prepare_shutdown`] runs at most once. The first
//! caller records the exit code and runs every step; later callers only see
//! [`ShutdownOutcome::AlreadyShuttingDown`]. A restart request arriving while
//! a plain shutdown is in flight replaces the recorded code so the launcher
//! starts the server again.

use std::sync::Arc;
use std::time::Duration;

use gridhost_bridge::ExitCode;
use parking_lot::Mutex;

use crate::panels::Panels;
use crate::session::SessionRegistry;
use crate::supervisor::SandboxSupervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Idle,
    ShuttingDown,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Completed(ExitCode),
    AlreadyShuttingDown,
}

/// The resource that makes this process "the server", released in the last
/// step before exit.
pub trait HostServer: Send {
    fn release(&mut self);
}

/// Final step of the sequence.
pub trait ProcessExit: Send + Sync {
    fn exit(&self, code: ExitCode);
}

/// Ends the process with the contract exit status.
#[derive(Debug, Default)]
pub struct StdProcessExit;

impl ProcessExit for StdProcessExit {
    fn exit(&self, code: ExitCode) {
        tracing::info!(%code, "exiting");
        std::process::exit(code.code());
    }
}

struct ShutdownState {
    phase: ShutdownPhase,
    code: Option<ExitCode>,
}

pub struct ShutdownCoordinator {
    state: Mutex<ShutdownState>,
    registry: Arc<SessionRegistry>,
    panels: Panels,
    supervisor: Arc<SandboxSupervisor>,
    server: Mutex<Option<Box<dyn HostServer>>>,
    exit: Box<dyn ProcessExit>,
    join_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(
        registry: Arc<SessionRegistry>,
        panels: Panels,
        supervisor: Arc<SandboxSupervisor>,
        server: Box<dyn HostServer>,
        exit: Box<dyn ProcessExit>,
    ) -> Self {
        Self {
            state: Mutex::new(ShutdownState {
                phase: ShutdownPhase::Idle,
                code: None,
            }),
            registry,
            panels,
            supervisor,
            server: Mutex::new(Some(server)),
            exit,
            join_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// Tears the server down and exits with `code`.
    ///
    /// Must not be called from the UI thread: the sequence waits for the
    /// window teardown it queues there.
    pub fn prepare_shutdown(&self, code: ExitCode) -> ShutdownOutcome {
        {
            let mut state = self.state.lock();
            match state.phase {
                ShutdownPhase::Idle => {
                    state.phase = ShutdownPhase::ShuttingDown;
                    state.code = Some(code);
                }
                ShutdownPhase::ShuttingDown => {
                    if code == ExitCode::Restart && state.code == Some(ExitCode::Ok) {
                        tracing::info!("restart supersedes pending shutdown");
                        state.code = Some(code);
                    } else {
                        tracing::debug!(%code, "shutdown already in progress");
                    }
                    return ShutdownOutcome::AlreadyShuttingDown;
                }
                ShutdownPhase::Terminated => return ShutdownOutcome::AlreadyShuttingDown,
            }
        }
        tracing::info!(%code, "shutting down");

        self.supervisor.request_stop();

        let closed = self.registry.close_all();
        tracing::debug!(closed, "sessions closed");

        self.panels.hide_all();
        self.registry.settle();

        if !self.supervisor.join(self.join_timeout) {
            tracing::warn!(timeout = ?self.join_timeout, "sandbox supervisor did not stop in time");
            self.supervisor.force_kill();
            if !self.supervisor.join(self.join_timeout) {
                tracing::error!("sandbox supervisor still running after kill");
            }
        }

        if let Some(mut server) = self.server.lock().take() {
            server.release();
        }

        let code = {
            let mut state = self.state.lock();
            state.phase = ShutdownPhase::Terminated;
            state.code.unwrap_or(code)
        };
        tracing::info!(%code, "shutdown complete");
        self.exit.exit(code);
        ShutdownOutcome::Completed(code)
    }

    pub fn phase(&self) -> ShutdownPhase {
        self.state.lock().phase
    }

    pub fn is_shutting_down(&self) -> bool {
        self.phase() != ShutdownPhase::Idle
    }

    /// The recorded exit code, once a shutdown has been requested.
    pub fn exit_code(&self) -> Option<ExitCode> {
        self.state.lock().code
    }

    /// The final exit code once every step has run.
    pub fn finished_code(&self) -> Option<ExitCode> {
        let state = self.state.lock();
        match state.phase {
            ShutdownPhase::Terminated => state.code,
            _ => None,
        }
    }
}
