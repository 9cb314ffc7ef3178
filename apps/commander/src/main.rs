//! PAROL6 commander
//!
//! Supervises the headless controller, drives jogging at a fixed cadence,
//! runs user programs and serves the web API.

mod api;

use anyhow::Context;
use api::{AppState, build_router};
use clap::Parser;
use parol_control::{Commander, CommanderConfig};
use parol_driver::UdpTransport;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_LOG_FILTER: &str = "parol=info";

/// PAROL6 commander
#[derive(Parser, Debug)]
#[command(name = "parol-commander")]
#[command(about = "Headless PAROL6 commander with a web API", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Controller host
    #[arg(long)]
    host: Option<String>,

    /// Controller UDP port
    #[arg(long)]
    port: Option<u16>,

    /// Spawn the controller when it does not answer
    #[arg(long)]
    auto_start: bool,

    /// Controller script launched by --auto-start
    #[arg(long)]
    controller_script: Option<PathBuf>,

    /// Serial port handed to the controller
    #[arg(long)]
    com_port: Option<String>,

    /// Refuse to start unless the controller is ready
    #[arg(long)]
    require_ready: bool,

    /// Jog command rate (Hz)
    #[arg(long)]
    rate_hz: Option<f64>,

    /// Programs directory
    #[arg(long)]
    programs_dir: Option<PathBuf>,

    /// Web API bind host
    #[arg(long)]
    ui_host: Option<String>,

    /// Web API bind port
    #[arg(long)]
    ui_port: Option<u16>,

    /// Also write daily-rotated logs here
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

impl Args {
    fn apply(&self, config: &mut CommanderConfig) {
        if let Some(host) = &self.host {
            config.controller.host = host.clone();
        }
        if let Some(port) = self.port {
            config.controller.port = port;
        }
        if self.auto_start {
            config.controller.auto_start = true;
        }
        if let Some(script) = &self.controller_script {
            config.controller.script = Some(script.clone());
        }
        if let Some(com_port) = &self.com_port {
            config.controller.com_port = Some(com_port.clone());
        }
        if self.require_ready {
            config.require_ready = true;
        }
        if let Some(rate) = self.rate_hz {
            config.cadence.control_rate_hz = rate;
        }
        if let Some(dir) = &self.programs_dir {
            config.programs.dir = dir.clone();
        }
        if let Some(host) = &self.ui_host {
            config.ui.host = host.clone();
        }
        if let Some(port) = self.ui_port {
            config.ui.port = port;
        }
    }
}

fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "parol-commander.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        },
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    guard
}

fn load_config(args: &Args) -> anyhow::Result<CommanderConfig> {
    let mut config = match &args.config {
        Some(path) => CommanderConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CommanderConfig::default(),
    };
    config.apply_env().context("environment overrides")?;
    args.apply(&mut config);
    config.validate()?;
    Ok(config)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("interrupt received, shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_tracing(args.log_dir.as_deref());

    let config = load_config(&args)?;
    let bind = format!("{}:{}", config.ui.host, config.ui.port);

    let transport = UdpTransport::connect(&config.controller.host, config.controller.port)
        .context("opening controller socket")?;
    // ensure() may wait for the controller to come up
    let commander = tokio::task::spawn_blocking(move || Commander::start(config, transport))
        .await??;
    let commander = Arc::new(commander);

    let app = build_router(Arc::new(AppState {
        commander: commander.clone(),
    }));
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!(addr = %listener.local_addr()?, "web api listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tokio::task::spawn_blocking(move || commander.shutdown()).await?;
    Ok(())
}
