//! Process entry point: CLI/config plumbing plus the single calloop event
//! loop that drives everything `app::App` owns. This is the only thread;
//! every wait below is either a protocol event (the Wayland connection), a
//! one-shot/recurring timer, or a non-blocking socket poll.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use calloop::timer::{TimeoutAction, Timer};
use calloop::EventLoop;
use calloop_wayland_source::WaylandSource;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use wlrvnc::app::{App, CaptureTick};
use wlrvnc::config::Config;
use wlrvnc::wayland;

/// `wlrvncd`: exposes the current desktop session of a wlr-style
/// compositor as an RFB/VNC server.
#[derive(Debug, Parser)]
#[command(name = "wlrvncd", version, about)]
struct Cli {
    /// Path to a TOML config file. Fields not present
    /// fall back to `Config::default()`.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the RFB listen address from the config file.
    #[arg(long)]
    listen: Option<String>,

    /// Override the pre-shared VncAuth password from the config file.
    /// Prefer `--config` for anything but local testing; this ends up in
    /// shell history and `ps`.
    #[arg(long)]
    password: Option<String>,

    /// Override `log_filter` (a `tracing_subscriber::EnvFilter` directive).
    #[arg(long)]
    log_filter: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    if let Some(password) = cli.password {
        config.password = password;
    }
    if let Some(filter) = cli.log_filter {
        config.log_filter = filter;
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run(config) {
        error!(error = %e, "wlrvncd exiting with an error");
        return Err(e);
    }
    Ok(())
}

fn run(config: Config) -> anyhow::Result<()> {
    let mut event_loop: EventLoop<App> = EventLoop::try_new()?;
    let mut app = App::new_binding();

    let (conn, mut event_queue, qh) = wayland::connect_and_bind(&mut app)?;

    // `wl_output::Event::Mode` (which tells us the real output geometry)
    // arrives as a consequence of binding the output global in the first
    // roundtrip, not during it; one more roundtrip lets it land before we
    // size the renderer and the RFB framebuffer in `finish_init`.
    event_queue.roundtrip(&mut app)?;

    info!(size = ?app.output_size(), "bound compositor globals");
    app.finish_init(qh.clone(), config)?;

    WaylandSource::new(conn, event_queue)
        .insert(event_loop.handle())
        .map_err(|e| anyhow::anyhow!("failed to register the Wayland connection with the event loop: {e}"))?;

    // Capture pump: self-rescheduling timer. `start_capture` either starts
    // a capture immediately, tells us it's already in flight, or hands back
    // a `StartOutcome::ArmTimer` rate-limit delay; the armed flag
    // distinguishes "recheck single-flight soon" reschedules from "the
    // rate-limit delay has elapsed, fire the armed start now" ones, since
    // those two cases call different `App` methods.
    let armed = std::cell::Cell::new(false);
    event_loop
        .handle()
        .insert_source(Timer::immediate(), move |_, _, app| capture_pump_tick(app, &armed))
        .map_err(|e| anyhow::anyhow!("failed to install the capture pump timer: {e}"))?;

    // The RFB listener and client sockets are non-blocking end to end
    // (including the handshake), so a short recurring poll is a legitimate
    // timer-driven suspension point rather than a blocking wait.
    const RFB_POLL_PERIOD: Duration = Duration::from_millis(8);
    event_loop
        .handle()
        .insert_source(Timer::from_duration(RFB_POLL_PERIOD), move |_, _, app| {
            if let Err(e) = app.poll_rfb() {
                warn!(error = %e, "RFB poll failed");
            }
            TimeoutAction::ToDuration(RFB_POLL_PERIOD)
        })
        .map_err(|e| anyhow::anyhow!("failed to install the RFB poll timer: {e}"))?;

    info!("entering the event loop");
    event_loop.run(None, &mut app, |_| {})?;
    Ok(())
}

fn capture_pump_tick(app: &mut App, armed: &std::cell::Cell<bool>) -> TimeoutAction {
    let now = Instant::now();

    if armed.replace(false) {
        // The one-shot delay computed by a previous `start()` call has
        // elapsed; fire the armed start directly rather than recomputing
        // the rate-limit formula a second time.
        if let Err(e) = app.fire_capture_timer(now) {
            error!(error = %e, "deferred capture start failed, backing off");
            return TimeoutAction::ToDuration(Duration::from_millis(200));
        }
        return TimeoutAction::ToDuration(Duration::from_millis(1));
    }

    match app.start_capture(now) {
        Ok(CaptureTick::Started) => TimeoutAction::ToDuration(Duration::from_millis(1)),
        Ok(CaptureTick::Busy) => TimeoutAction::ToDuration(Duration::from_millis(4)),
        Ok(CaptureTick::Deferred(delay)) => {
            armed.set(true);
            TimeoutAction::ToDuration(delay)
        }
        Err(e) => {
            error!(error = %e, "capture pump failed, backing off");
            TimeoutAction::ToDuration(Duration::from_millis(200))
        }
    }
}
