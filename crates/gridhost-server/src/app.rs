use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::RecvTimeoutError;
use gridhost_bridge::ExitCode;

use crate::capture::CaptureStrategy;
use crate::config::{self, ServerConfig};
use crate::instance::InstanceLock;
use crate::panels::Panels;
use crate::plugins::{KnownPluginList, PluginCatalog};
use crate::presence::PresenceIndicator;
use crate::session::{ClientId, PluginProcessor, SessionRegistry};
use crate::shutdown::{HostServer, ProcessExit, ShutdownCoordinator, ShutdownOutcome, StdProcessExit};
use crate::supervisor::{
    ProcessLauncher, SandboxLauncher, SandboxSupervisor, SupervisorError, SupervisorEvent,
    SupervisorOptions,
};
use crate::ui_thread::UiThread;
use crate::window::{HeadlessWindows, InputListener, PanelKind, Point, WindowFactory};

const SPLASH_LINGER: Duration = Duration::from_millis(1500);

type PresenceSink = Box<dyn Fn(bool) + Send + Sync>;

/// Assembles an [`App`]. Every collaborator defaults to the production one.
pub struct AppBuilder {
    config: ServerConfig,
    factory: Option<Box<dyn WindowFactory>>,
    launcher: Option<Box<dyn SandboxLauncher>>,
    server: Option<Box<dyn HostServer>>,
    exit: Option<Box<dyn ProcessExit>>,
    presence_sink: Option<PresenceSink>,
}

impl AppBuilder {
    pub fn with_window_factory(mut self, factory: Box<dyn WindowFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn with_launcher(mut self, launcher: Box<dyn SandboxLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn with_host_server(mut self, server: Box<dyn HostServer>) -> Self {
        self.server = Some(server);
        self
    }

    pub fn with_process_exit(mut self, exit: Box<dyn ProcessExit>) -> Self {
        self.exit = Some(exit);
        self
    }

    pub fn with_presence_sink(mut self, sink: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.presence_sink = Some(Box::new(sink));
        self
    }

    pub fn build(self) -> Result<App> {
        let config = self.config;
        config.validate().context("invalid server config")?;
        let server: Box<dyn HostServer> = match self.server {
            Some(server) => server,
            None => Box::new(InstanceLock::acquire(
                &config::config_dir()?,
                config.server_id,
            )?),
        };

        let factory = self.factory.unwrap_or_else(|| Box::new(HeadlessWindows));
        let ui = UiThread::spawn(factory).context("failed to start ui thread")?;
        let presence = Arc::new(match self.presence_sink {
            Some(sink) => PresenceIndicator::with_sink(sink),
            None => PresenceIndicator::new(),
        });

        let plugins = Arc::new(KnownPluginList::load(
            config.plugin_cache_path()?,
            config.plugin_roots.clone(),
        )?);
        let launcher: Box<dyn SandboxLauncher> = match self.launcher {
            Some(launcher) => launcher,
            None => Box::new(ProcessLauncher::from_config(&config)?),
        };
        let supervisor = Arc::new(SandboxSupervisor::new(
            launcher,
            Arc::clone(&plugins) as Arc<dyn PluginCatalog>,
            SupervisorOptions::from_config(&config),
        ));

        let registry = Arc::new(SessionRegistry::new(ui.clone(), Arc::clone(&presence)));
        let panels = Panels::new(ui.clone(), Arc::clone(&presence));
        let shutdown = ShutdownCoordinator::new(
            Arc::clone(&registry),
            panels.clone(),
            Arc::clone(&supervisor),
            server,
            self.exit.unwrap_or_else(|| Box::new(StdProcessExit)),
        )
        .with_join_timeout(config.join_timeout());

        Ok(App {
            config,
            ui,
            presence,
            registry,
            panels,
            plugins,
            supervisor,
            shutdown: Arc::new(shutdown),
        })
    }
}

/// The server process: editor sessions on one side, the sandbox worker on
/// the other.
pub struct App {
    config: ServerConfig,
    ui: UiThread,
    presence: Arc<PresenceIndicator>,
    registry: Arc<SessionRegistry>,
    panels: Panels,
    plugins: Arc<KnownPluginList>,
    supervisor: Arc<SandboxSupervisor>,
    shutdown: Arc<ShutdownCoordinator>,
}

impl App {
    pub fn builder(config: ServerConfig) -> AppBuilder {
        AppBuilder {
            config,
            factory: None,
            launcher: None,
            server: None,
            exit: None,
            presence_sink: None,
        }
    }

    pub fn start(&self) -> Result<()> {
        if self.config.splash_on_start {
            self.panels.show_splash();
            self.panels.set_splash_info("Starting sandbox...");
        }
        self.supervisor
            .start()
            .context("failed to start sandbox supervisor")?;
        tracing::info!(
            id = self.config.server_id,
            port = ?self.config.worker_port().ok(),
            "server started"
        );
        Ok(())
    }

    /// Pumps supervisor events until the shutdown sequence has finished and
    /// returns the exit code it recorded.
    pub fn run(&self) -> ExitCode {
        let events = self.supervisor.events();
        let tick = self.config.poll_interval().max(Duration::from_millis(10));
        loop {
            if let Some(code) = self.shutdown.finished_code() {
                return code;
            }
            match events.recv_timeout(tick) {
                Ok(SupervisorEvent::Started { pid }) => {
                    tracing::info!(pid, "sandbox up");
                    self.panels.hide_splash(SPLASH_LINGER);
                }
                Ok(SupervisorEvent::Restarting { rescan }) => {
                    let closed = self.registry.close_all();
                    tracing::info!(rescan, closed, "sandbox relaunching");
                }
                Ok(SupervisorEvent::Exited(code)) => tracing::debug!(%code, "sandbox exited"),
                Ok(SupervisorEvent::Failed(failure)) => {
                    tracing::error!(%failure, "sandbox failed, shutting down");
                    if let ShutdownOutcome::Completed(code) =
                        self.shutdown.prepare_shutdown(failure.exit_code())
                    {
                        return code;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return self.shutdown.exit_code().unwrap_or(ExitCode::Ok);
                }
            }
        }
    }

    pub fn show_editor(
        &self,
        processor: Arc<dyn PluginProcessor>,
        id: ClientId,
        strategy: CaptureStrategy,
        x: i32,
        y: i32,
    ) {
        self.registry.open_session(processor, id, strategy, x, y);
    }

    pub fn hide_editor(&self, id: ClientId, update_presence: bool) {
        self.registry.close_session(id, update_presence);
    }

    pub fn reset_editor(&self, id: ClientId) {
        self.registry.reset_session(id);
    }

    pub fn restart_editor(&self, id: ClientId) {
        self.registry.restart_session(id);
    }

    pub fn bring_editor_to_front(&self, id: ClientId) {
        self.registry.bring_to_front(id);
    }

    pub fn move_editor(&self, id: ClientId, x: i32, y: i32) {
        self.registry.move_to(id, x, y);
    }

    pub fn update_capture_area(&self, id: ClientId, inset: i32) {
        self.registry.update_capture_area(id, inset);
    }

    pub fn local_point_to_global(&self, id: ClientId, point: Point) -> Point {
        self.registry.relay_local_point_to_global(id, point)
    }

    pub fn add_key_listener(&self, id: ClientId, listener: Arc<dyn InputListener>) {
        self.registry.attach_input_listener(id, listener);
    }

    pub fn current_window_processor(&self, id: ClientId) -> Option<Arc<dyn PluginProcessor>> {
        self.registry.active_processor(id)
    }

    pub fn show_panel(&self, kind: PanelKind) {
        self.panels.show(kind);
    }

    pub fn hide_panel(&self, kind: PanelKind) {
        self.panels.hide(kind);
    }

    pub fn hide_all_panels(&self) {
        self.panels.hide_all();
    }

    pub fn show_splash(&self) {
        self.panels.show_splash();
    }

    pub fn hide_splash(&self, wait: Duration) {
        self.panels.hide_splash(wait);
    }

    pub fn set_splash_info(&self, text: impl Into<String>) {
        self.panels.set_splash_info(text);
    }

    /// Closes every editor and relaunches the sandbox. Ignored once the
    /// server is shutting down.
    pub fn restart_server(&self, rescan: bool) -> Result<(), SupervisorError> {
        if self.shutdown.is_shutting_down() {
            tracing::warn!("ignoring server restart during shutdown");
            return Ok(());
        }
        let closed = self.registry.close_all();
        tracing::info!(rescan, closed, "restarting server");
        self.supervisor.restart(rescan)
    }

    pub fn prepare_shutdown(&self, code: ExitCode) -> ShutdownOutcome {
        self.shutdown.prepare_shutdown(code)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn supervisor(&self) -> &Arc<SandboxSupervisor> {
        &self.supervisor
    }

    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    pub fn plugins(&self) -> &Arc<KnownPluginList> {
        &self.plugins
    }

    pub fn presence(&self) -> &Arc<PresenceIndicator> {
        &self.presence
    }

    /// Waits until every queued window operation has run.
    pub fn settle(&self) {
        self.ui.flush();
    }
}
