//! Sandbox worker side of the Gridhost plug-in host.
//!
//! The server process never hosts plug-ins itself. Each plug-in runs inside a
//! `gridhost-sandbox` worker process which is launched and watched by the
//! server's supervisor. This crate holds everything both sides have to agree
//! on: the exit status contract, the line based control protocol and the
//! worker's own bridge loop.

pub mod exit;
pub mod ipc;
pub mod master;
pub mod server;

pub use exit::*;
pub use ipc::*;
pub use server::*;
