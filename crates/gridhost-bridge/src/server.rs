use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::exit::{ExitCode, SandboxFailure};
use crate::ipc::{ControlMessage, WorkerEvent};
use crate::master;

/// Highest worker id accepted on the command line.
pub const MAX_WORKER_ID: u32 = 1024;

#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub id: u32,
    pub port: u16,
    pub bind_address: IpAddr,
    pub master_pid: Option<u32>,
    /// How often the loop wakes up to check on the master process.
    pub poll_interval: Duration,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            id: 0,
            port: 0,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            master_pid: None,
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl BridgeOptions {
    pub fn with_id(mut self, id: u32) -> Self {
        self.id = id;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_bind_address(mut self, address: IpAddr) -> Self {
        self.bind_address = address;
        self
    }

    pub fn with_master_pid(mut self, pid: Option<u32>) -> Self {
        self.master_pid = pid;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn validate(&self) -> Result<(), SandboxFailure> {
        if self.port == 0 || self.id > MAX_WORKER_ID || self.poll_interval.is_zero() {
            return Err(SandboxFailure::Param);
        }
        Ok(())
    }
}

/// The worker's side of the bridge: owns the listening socket the audio
/// layer streams through and answers control messages from the supervisor.
#[derive(Debug)]
pub struct BridgeServer {
    options: BridgeOptions,
    listener: TcpListener,
}

impl BridgeServer {
    /// Validates the options, checks the master, claims the worker's port and
    /// then configures the listener, in that order. Every error maps onto one
    /// of the fatal sandbox exit codes.
    pub fn bind(options: BridgeOptions) -> Result<Self, SandboxFailure> {
        options.validate()?;
        if let Some(pid) = options.master_pid {
            if !master::is_process_alive(pid) {
                tracing::error!(pid, "master process not found");
                return Err(SandboxFailure::NoMaster);
            }
        }
        let address = SocketAddr::new(options.bind_address, options.port);
        let listener = TcpListener::bind(address).map_err(|err| {
            tracing::error!(?err, %address, "failed to bind sandbox listener");
            SandboxFailure::Bind
        })?;
        listener.set_nonblocking(true).map_err(|err| {
            tracing::error!(?err, "failed to initialise sandbox listener");
            SandboxFailure::Init
        })?;
        Ok(Self { options, listener })
    }

    pub fn port(&self) -> u16 {
        self.listener
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(self.options.port)
    }

    /// Runs until the supervisor asks for a stop, the control channel closes
    /// or the master process disappears.
    pub fn run(&self, commands: Receiver<ControlMessage>, events: Sender<WorkerEvent>) -> ExitCode {
        let _ = events.send(WorkerEvent::Ready { port: self.port() });
        tracing::info!(id = self.options.id, port = self.port(), "sandbox ready");
        loop {
            match commands.recv_timeout(self.options.poll_interval) {
                Ok(ControlMessage::Stop) | Err(RecvTimeoutError::Disconnected) => {
                    let _ = events.send(WorkerEvent::Stopping);
                    tracing::info!(id = self.options.id, "sandbox stopping");
                    return ExitCode::Ok;
                }
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(pid) = self.options.master_pid {
                        if !master::is_process_alive(pid) {
                            tracing::warn!(pid, "master process went away, shutting down");
                            let _ = events.send(WorkerEvent::Stopping);
                            return ExitCode::Ok;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::thread;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::ipc::{control_channel, event_channel};

    fn loopback() -> BridgeOptions {
        BridgeOptions::default()
            .with_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .with_poll_interval(Duration::from_millis(10))
    }

    fn free_port() -> u16 {
        let spare = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        spare.local_addr().unwrap().port()
    }

    #[test]
    fn zero_port_is_a_parameter_error() {
        let err = BridgeServer::bind(loopback().with_port(0)).unwrap_err();
        assert_eq!(err, SandboxFailure::Param);
    }

    #[test]
    fn oversized_id_is_a_parameter_error() {
        let options = loopback().with_port(free_port()).with_id(MAX_WORKER_ID + 1);
        assert_eq!(BridgeServer::bind(options).unwrap_err(), SandboxFailure::Param);
    }

    #[test]
    fn missing_master_is_reported() {
        let options = loopback()
            .with_port(free_port())
            .with_master_pid(Some(999_999_999));
        assert_eq!(
            BridgeServer::bind(options).unwrap_err(),
            SandboxFailure::NoMaster
        );
    }

    #[test]
    fn occupied_port_is_a_bind_error() {
        let taken = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = taken.local_addr().unwrap().port();
        let err = BridgeServer::bind(loopback().with_port(port)).unwrap_err();
        assert_eq!(err, SandboxFailure::Bind);
    }

    #[test]
    fn parameters_are_checked_before_the_master() {
        let options = loopback().with_port(0).with_master_pid(Some(999_999_999));
        assert_eq!(BridgeServer::bind(options).unwrap_err(), SandboxFailure::Param);
    }

    #[test]
    fn missing_master_wins_over_a_taken_port() {
        let taken = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = taken.local_addr().unwrap().port();
        let options = loopback()
            .with_port(port)
            .with_master_pid(Some(999_999_999));
        assert_eq!(
            BridgeServer::bind(options).unwrap_err(),
            SandboxFailure::NoMaster
        );
    }

    #[test]
    fn stop_message_ends_the_loop() {
        let server = BridgeServer::bind(loopback().with_port(free_port())).unwrap();
        let port = server.port();
        let (cmd_tx, cmd_rx) = control_channel();
        let (evt_tx, evt_rx) = event_channel();
        let handle = thread::spawn(move || server.run(cmd_rx, evt_tx));
        cmd_tx.send(ControlMessage::Stop).unwrap();
        assert_eq!(handle.join().unwrap(), ExitCode::Ok);
        let events: Vec<_> = evt_rx.iter().collect();
        assert_eq!(events, vec![WorkerEvent::Ready { port }, WorkerEvent::Stopping]);
    }

    #[test]
    fn closed_control_channel_counts_as_stop() {
        let server = BridgeServer::bind(loopback().with_port(free_port())).unwrap();
        let (cmd_tx, cmd_rx) = control_channel();
        let (evt_tx, _evt_rx) = event_channel();
        drop(cmd_tx);
        assert_eq!(server.run(cmd_rx, evt_tx), ExitCode::Ok);
    }
}
