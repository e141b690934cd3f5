use std::io::{self, BufRead, Write};
use std::thread;

use clap::Parser;
use gridhost_bridge::{
    control_channel, decode_line, encode_line, event_channel, BridgeOptions, BridgeServer,
    ControlMessage, ExitCode,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gridhost-sandbox")]
struct Args {
    /// Worker id assigned by the server
    #[arg(long, default_value_t = 0)]
    id: u32,

    /// Port the worker listens on
    #[arg(long)]
    port: Option<u16>,

    /// Pid of the server process that launched this worker
    #[arg(long = "master-pid")]
    master_pid: Option<u32>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .try_init()
        .ok();

    let code = match Args::try_parse() {
        Ok(args) => run(args),
        Err(err) => {
            let _ = err.print();
            // --help and --version land here as well.
            if err.use_stderr() {
                ExitCode::SandboxParamError
            } else {
                ExitCode::Ok
            }
        }
    };
    std::process::exit(code.code());
}

fn run(args: Args) -> ExitCode {
    let Some(port) = args.port else {
        tracing::error!("missing --port");
        return ExitCode::SandboxParamError;
    };
    let options = BridgeOptions::default()
        .with_id(args.id)
        .with_port(port)
        .with_master_pid(args.master_pid);
    let server = match BridgeServer::bind(options) {
        Ok(server) => server,
        Err(failure) => {
            tracing::error!(%failure, "sandbox failed to start");
            return failure.exit_code();
        }
    };

    let (cmd_tx, cmd_rx) = control_channel();
    let (evt_tx, evt_rx) = event_channel();

    let reader = thread::Builder::new()
        .name("gridhost-sandbox-control".into())
        .spawn(move || {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                match decode_line::<ControlMessage>(&line) {
                    Ok(message) => {
                        if cmd_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(err) => tracing::warn!(%err, "ignoring control line"),
                }
            }
            // stdin closed: dropping the sender stops the bridge loop.
        });
    if let Err(err) = reader {
        tracing::error!(?err, "failed to spawn control reader");
        return ExitCode::SandboxInitError;
    }

    let writer = thread::Builder::new()
        .name("gridhost-sandbox-events".into())
        .spawn(move || {
            let stdout = io::stdout();
            for event in evt_rx.iter() {
                let Ok(line) = encode_line(&event) else { continue };
                let mut out = stdout.lock();
                if out.write_all(line.as_bytes()).and_then(|_| out.flush()).is_err() {
                    break;
                }
            }
        });
    let writer = match writer {
        Ok(handle) => handle,
        Err(err) => {
            tracing::error!(?err, "failed to spawn event writer");
            return ExitCode::SandboxInitError;
        }
    };

    let code = server.run(cmd_rx, evt_tx);
    let _ = writer.join();
    code
}
