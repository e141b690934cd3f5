use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use gridhost_server::plugins::PluginCatalog;
use gridhost_server::{App, ExitCode, ServerConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gridhost-server", about = "Remote audio plug-in host server")]
struct Cli {
    /// Config file to use instead of the default location
    #[arg(long)]
    config: Option<PathBuf>,

    /// Server id; selects the worker port and the instance lock
    #[arg(long)]
    id: Option<u32>,

    /// Path to the gridhost-sandbox executable
    #[arg(long = "sandbox-binary")]
    sandbox_binary: Option<PathBuf>,

    /// Do not show the splash screen on startup
    #[arg(long = "no-splash", default_value_t = false)]
    no_splash: bool,

    /// Rescan plug-in folders before starting
    #[arg(long, default_value_t = false)]
    scan: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => ServerConfig::load_from(path)?,
        None => ServerConfig::load()?,
    };
    if let Some(id) = cli.id {
        config.server_id = id;
    }
    if let Some(path) = cli.sandbox_binary {
        config.sandbox_binary = Some(path);
    }
    if cli.no_splash {
        config.splash_on_start = false;
    }

    let app = Arc::new(App::builder(config).build()?);
    if cli.scan {
        let count = app.plugins().rescan().context("plugin scan failed")?;
        tracing::info!(count, "plugin scan finished");
    }

    let handler_app = Arc::clone(&app);
    ctrlc::set_handler(move || {
        handler_app.prepare_shutdown(ExitCode::Ok);
    })
    .context("failed to install Ctrl-C handler")?;

    app.start()?;
    let code = app.run();
    std::process::exit(code.code());
}
