use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use gridhost_bridge::{decode_line, encode_line, ControlMessage, ProtocolError, WorkerEvent};

use super::{SandboxChild, SandboxLauncher, SupervisorError, WorkerStatus};
use crate::config::{ConfigError, ServerConfig};

/// How long a dropped worker handle waits for its stdout reader. Helper
/// processes spawned by plug-ins may keep the pipe open past the worker's
/// exit; the reader is detached after this.
const READER_GRACE: Duration = Duration::from_millis(200);

/// Launches `gridhost-sandbox` as a child process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    binary: PathBuf,
    id: u32,
    port: u16,
    master_pid: u32,
}

impl ProcessLauncher {
    pub fn new(binary: PathBuf, id: u32, port: u16) -> Self {
        Self {
            binary,
            id,
            port,
            master_pid: std::process::id(),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(
            config.sandbox_binary(),
            config.server_id,
            config.worker_port()?,
        ))
    }

    pub fn with_master_pid(mut self, pid: u32) -> Self {
        self.master_pid = pid;
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .arg("--id")
            .arg(self.id.to_string())
            .arg("--port")
            .arg(self.port.to_string())
            .arg("--master-pid")
            .arg(self.master_pid.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        command
    }
}

impl SandboxLauncher for ProcessLauncher {
    fn launch(&mut self) -> Result<Box<dyn SandboxChild>, SupervisorError> {
        let mut child = self
            .command()
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                path: self.binary.clone(),
                source,
            })?;
        let pid = child.id();
        tracing::info!(pid, binary = %self.binary.display(), port = self.port, "sandbox spawned");

        let stdin = child.stdin.take();
        let ready = Arc::new(AtomicBool::new(false));
        let reader = match child.stdout.take() {
            Some(stdout) => spawn_event_reader(pid, stdout, Arc::clone(&ready)),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "sandbox stdout was not captured",
            )),
        };
        let reader = match reader {
            Ok(reader) => reader,
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(err.into());
            }
        };

        Ok(Box::new(ProcessChild {
            child,
            stdin,
            ready,
            reader: Some(reader),
        }))
    }
}

fn spawn_event_reader(
    pid: u32,
    stdout: ChildStdout,
    ready: Arc<AtomicBool>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("gridhost-sandbox-{pid}"))
        .spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        tracing::debug!(pid, %err, "sandbox stdout closed");
                        break;
                    }
                };
                match decode_line::<WorkerEvent>(&line) {
                    Ok(WorkerEvent::Ready { port }) => {
                        tracing::info!(pid, port, "sandbox ready");
                        ready.store(true, Ordering::SeqCst);
                    }
                    Ok(WorkerEvent::Stopping) => tracing::debug!(pid, "sandbox stopping"),
                    Err(ProtocolError::Empty) => {}
                    Err(err) => tracing::warn!(pid, %err, %line, "unexpected sandbox output"),
                }
            }
        })
}

struct ProcessChild {
    child: Child,
    stdin: Option<ChildStdin>,
    ready: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl ProcessChild {
    /// Joins the stdout reader if it finishes within `grace`, otherwise
    /// leaves it running detached.
    fn reap_reader(&mut self, grace: Duration) {
        let Some(reader) = self.reader.take() else {
            return;
        };
        let deadline = Instant::now() + grace;
        while !reader.is_finished() {
            if Instant::now() >= deadline {
                tracing::debug!(
                    pid = self.child.id(),
                    "sandbox stdout still held open, detaching reader"
                );
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        if reader.join().is_err() {
            tracing::error!(pid = self.child.id(), "sandbox reader panicked");
        }
    }
}

impl SandboxChild for ProcessChild {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn try_wait(&mut self) -> io::Result<Option<WorkerStatus>> {
        Ok(self.child.try_wait()?.map(WorkerStatus::from))
    }

    fn request_stop(&mut self) {
        // Dropping stdin afterwards doubles as the stop signal.
        if let Some(mut stdin) = self.stdin.take() {
            let written = encode_line(&ControlMessage::Stop)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
                .and_then(|line| {
                    stdin.write_all(line.as_bytes())?;
                    stdin.flush()
                });
            if let Err(err) = written {
                tracing::debug!(pid = self.child.id(), %err, "could not deliver stop request");
            }
        }
    }

    fn kill(&mut self) -> io::Result<()> {
        self.stdin.take();
        match self.child.kill() {
            Ok(()) => Ok(()),
            // Already exited.
            Err(err) if err.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl Drop for ProcessChild {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            let _ = self.kill();
            let _ = self.child.wait();
        }
        self.reap_reader(READER_GRACE);
    }
}
