use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use nix::sys::signal::{signal, SigHandler, Signal};
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::EnvFilter;

use devhttpd::{CommandEngine, Config, Server};

/// Log timestamps in the `[Thu Jan  1 00:00:00 2026]` form.
struct LocalTime;

impl FormatTime for LocalTime {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("[%a %b %e %H:%M:%S %Y]"))
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_timer(LocalTime)
        .with_target(false)
        .with_level(false)
        .init();
}

fn register_shutdown(token: &Arc<AtomicBool>) -> Result<()> {
    // writes to closed sockets must fail with EPIPE rather than kill us
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("failed to set SIGPIPE handler")?;
    signal_hook::flag::register(SIGINT, Arc::clone(token))
        .context("failed to set SIGINT handler")?;
    signal_hook::flag::register(SIGTERM, Arc::clone(token))
        .context("failed to set SIGTERM handler")?;
    Ok(())
}

fn main() -> Result<()> {
    let config = Config::from_command_line()?;
    init_logging();

    let engine = CommandEngine::new(config.interpreter.clone());
    let mut server = Server::bind(&config, Box::new(engine))?;
    register_shutdown(&server.shutdown_token())?;

    println!(
        "{}/{} Development Server started at {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        Local::now().format("%a %b %e %H:%M:%S %Y"),
    );
    println!("Listening on {}:{}", server.host(), server.port());
    println!("Document root is {}", server.document_root().display());
    println!("Press Ctrl-C to quit.");

    server.run()
}
