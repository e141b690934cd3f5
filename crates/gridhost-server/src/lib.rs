//! Control plane of the Gridhost remote plug-in host.
//!
//! Remote clients open plug-in editors through the [`SessionRegistry`]; every
//! window lives on the single [`UiThread`] and streams its frames through a
//! per-session [`CaptureDispatcher`]. The plug-ins themselves run inside a
//! sandbox worker watched by the [`SandboxSupervisor`], and the
//! [`ShutdownCoordinator`] tears all of it down exactly once.

pub mod app;
pub mod capture;
pub mod config;
pub mod instance;
pub mod panels;
pub mod plugins;
pub mod presence;
pub mod session;
pub mod shutdown;
pub mod supervisor;
pub mod ui_thread;
pub mod window;

pub use app::{App, AppBuilder};
pub use capture::{CaptureDispatcher, CaptureStrategy, Delivery, Frame, FrameEncoder, FrameSink};
pub use config::ServerConfig;
pub use gridhost_bridge::{ExitClass, ExitCode, SandboxFailure};
pub use session::{ClientId, PluginProcessor, SessionRegistry};
pub use shutdown::{ShutdownCoordinator, ShutdownOutcome, ShutdownPhase};
pub use supervisor::{SandboxSupervisor, SupervisorEvent, SupervisorState};
pub use ui_thread::UiThread;
