//! `ctlframed` - runs the socket server with the built-in control handler.
//!
//! See the `ctlframe` library for the server core.

use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use ctlframe::control::ControlHandler;
use ctlframe::{daemon, ExitReason, Server, ServerConfig};
use mimalloc::MiMalloc;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "ctlframed")]
#[command(version)]
#[command(about = "Control-socket server with WebSocket listener and job queue")]
struct Cli {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Control socket path
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// WebSocket listener port (0 disables it)
    #[arg(long)]
    ws_port: Option<u16>,

    /// Log file (default: stderr)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Detach from the terminal and write a pid file
    #[arg(short, long)]
    daemon: bool,

    /// Take over a socket another server is listening on
    #[arg(long)]
    force_socket: bool,

    /// Set by the server itself when it re-executes on restart
    #[arg(long, hide = true)]
    restart: bool,
}

impl Cli {
    fn into_config(self) -> Result<ServerConfig> {
        let mut config = ServerConfig::load(self.config.as_deref())?;
        if let Some(socket) = self.socket {
            config.socket_path = socket;
        }
        if let Some(port) = self.ws_port {
            config.ws_port = port;
        }
        if let Some(log) = self.log_file {
            config.log_path = Some(log);
        }
        config.daemon_mode |= self.daemon;
        config.force_socket |= self.force_socket;
        config.restart_mode |= self.restart;
        Ok(config)
    }
}

fn init_logging(config: &ServerConfig) -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(path) = &config.log_path {
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }
    builder.format_timestamp_secs().init();
    Ok(())
}

fn register_signals(server: &Server<ControlHandler>) -> Result<()> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::flag;

    let shutdown = server.state().shutdown_flag();
    let restart = server.state().restart_flag();
    flag::register(SIGINT, Arc::clone(&shutdown)).context("register SIGINT")?;
    flag::register(SIGTERM, shutdown).context("register SIGTERM")?;
    flag::register(SIGHUP, restart).context("register SIGHUP")?;
    Ok(())
}

/// Replace this process with a fresh copy running in restart mode.
fn reexec() -> Result<()> {
    let exe = std::env::current_exe().context("locate current executable")?;
    let mut args: Vec<_> = std::env::args_os().skip(1).collect();
    if !args.iter().any(|a| a == "--restart") {
        args.push("--restart".into());
    }
    log::info!("[server] re-executing {}", exe.display());
    let err = std::process::Command::new(&exe).args(&args).exec();
    Err(err).with_context(|| format!("exec {}", exe.display()))
}

fn main() -> Result<()> {
    let config = Cli::parse().into_config()?;
    init_logging(&config)?;
    log::info!(
        "{} v{} starting{}",
        config.program_name,
        env!("CARGO_PKG_VERSION"),
        if config.restart_mode { " (restart)" } else { "" }
    );

    let mut server = Server::bind(config, ControlHandler::new())?;

    if server.state().config().daemon_mode {
        daemon::daemonize()?;
        daemon::write_pid_file(&server.state().config().pid_path())?;
    }
    register_signals(&server)?;

    let reason = server.run()?;
    log::info!(
        "[server] handled {} packet(s) from {} connection(s)",
        server.handler().packets_handled(),
        server.handler().connections_seen()
    );
    match reason {
        ExitReason::Restart => {
            drop(server);
            reexec()
        }
        ExitReason::Shutdown | ExitReason::Stopped => {
            daemon::cleanup_on_shutdown(server.state().config());
            Ok(())
        }
    }
}
