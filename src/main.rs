//! Dullahan server binary.
//!
//! Thin CLI shell around the library: parse flags, set up logging in the
//! UID runtime directory, bootstrap the session, and hand control to the
//! event loop. Everything interesting lives in the `dullahan` library.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dullahan::config::{load_layouts, RuntimeDir, ServerConfig};
use dullahan::event_loop::EventLoop;
use dullahan::session::Session;
use dullahan::shell::detect_shell;
use mimalloc::MiMalloc;

/// mimalloc keeps allocation latency flat under the event loop's bursty
/// snapshot/delta allocation pattern.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Multi-client terminal multiplexer server.
#[derive(Debug, Parser)]
#[command(name = "dullahan", version, about)]
struct Cli {
    /// TCP port to listen on.
    #[arg(long, default_value_t = dullahan::constants::DEFAULT_PORT)]
    port: u16,

    /// Bind on all interfaces instead of loopback only.
    #[arg(long)]
    bind_all: bool,

    /// PEM certificate chain; TLS requires both --tls-cert and --tls-key.
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// PEM private key.
    #[arg(long)]
    tls_key: Option<PathBuf>,

    /// Directory served for non-WebSocket requests.
    #[arg(long)]
    static_root: Option<PathBuf>,

    /// Seconds of client silence before an idle ping.
    #[arg(long, default_value_t = 30)]
    idle_ping_secs: u64,

    /// Seconds after an idle ping before a silent client is dropped.
    #[arg(long, default_value_t = 30)]
    pong_timeout_secs: u64,

    /// Default width for new panes.
    #[arg(long, default_value_t = dullahan::constants::DEFAULT_COLS)]
    cols: u16,

    /// Default height for new panes.
    #[arg(long, default_value_t = dullahan::constants::DEFAULT_ROWS)]
    rows: u16,

    /// Log to stderr instead of the runtime-directory log file.
    #[arg(long)]
    foreground: bool,
}

fn main() {
    let code = match run() {
        Ok(()) => 0,
        Err(e) => {
            log::error!("fatal: {e:#}");
            eprintln!("dullahan: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let runtime = RuntimeDir::create()?;
    init_logging(&runtime, cli.foreground)?;
    runtime.write_pid()?;

    let config = ServerConfig {
        port: cli.port,
        bind_addr: if cli.bind_all {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        },
        tls_cert: cli.tls_cert,
        tls_key: cli.tls_key,
        idle_ping: Duration::from_secs(cli.idle_ping_secs),
        pong_deadline: Duration::from_secs(cli.pong_timeout_secs),
        default_dims: (cli.cols, cli.rows),
    };

    let shell = detect_shell();
    log::info!("dullahan {} starting, shell {shell}", env!("CARGO_PKG_VERSION"));

    let layouts = load_layouts();
    let session = Session::bootstrap(config.default_dims, shell, layouts)
        .context("session bootstrap failed")?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let mut event_loop =
        EventLoop::new(config, runtime, session, cli.static_root, shutdown)?;
    event_loop.run()
}

fn init_logging(runtime: &RuntimeDir, foreground: bool) -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if !foreground {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(runtime.log_path())
            .with_context(|| format!("cannot open {}", runtime.log_path().display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}
