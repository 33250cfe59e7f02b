//! Central application state: the `Dispatch` target for every Wayland
//! protocol object this bridge binds, and the glue that turns
//! a completed capture into a rendered frame and that frame into an RFB
//! `FramebufferUpdate`.
//!
//! Construction happens in two phases, matching the one event queue this
//! process ever opens (`wayland::connect_and_bind`, called with `App` itself
//! as the `Dispatch` target): `Binding` owns the registry builder and reacts
//! only to `wl_registry` globals, `Running` owns everything that depends on
//! those globals. `finish_init` is the one-time transition between them,
//! called once the initial roundtrip has returned.

use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};
use wayland_client::protocol::{wl_buffer, wl_output, wl_registry, wl_seat, wl_shm};
use wayland_client::{Connection, Dispatch, QueueHandle, WEnum};
use wayland_protocols::wp::linux_dmabuf::zv1::client::zwp_linux_dmabuf_v1;
use wayland_protocols_misc::zwp_virtual_keyboard_v1::client::zwp_virtual_keyboard_manager_v1;
use wayland_protocols_wlr::export_dmabuf::v1::client::{
    zwlr_export_dmabuf_frame_v1, zwlr_export_dmabuf_manager_v1,
};
use wayland_protocols_wlr::screencopy::v1::client::{zwlr_screencopy_frame_v1, zwlr_screencopy_manager_v1};
use wayland_protocols_wlr::virtual_pointer::v1::client::zwlr_virtual_pointer_manager_v1;

use crate::capture::dmabuf::{CancelReason, DmabufBackend};
use crate::capture::scheduler::{CaptureScheduler, SchedulerConfig};
use crate::capture::shm::ShmBackend;
use crate::capture::{BufferGeometry, CaptureStatus, CapturedFrame, DmabufPlane, FramePayload, StartOutcome};
use crate::config::Config;
use crate::damage::Rect;
use crate::error::{CoreError, CoreResult};
use crate::keyboard::KeyboardInjector;
use crate::keymap::KeymapResolver;
use crate::pointer::{PointerButton, PointerInjector, ScrollAxis};
use crate::render::{GlPixelFormat, GpuRenderer};
use crate::rfb::{RfbClient, RfbServer};
use crate::wayland::capture_session::{WlDmabufSession, WlScreencopySession};
use crate::wayland::input_session::{WlVirtualKeyboard, WlVirtualPointer};
use crate::wayland::{self, Globals, Registry};

type MakeShmSession = Box<dyn FnMut() -> WlScreencopySession>;
type Scheduler = CaptureScheduler<WlScreencopySession, WlDmabufSession, MakeShmSession>;

/// What a capture-pump tick should do next, reported back to the calloop
/// timer driving it so it can re-arm itself for the right moment instead of
/// polling blindly.
#[derive(Debug, Clone, Copy)]
pub enum CaptureTick {
    /// A capture is already in flight; recheck soon.
    Busy,
    /// A new capture was just dispatched to the compositor.
    Started,
    /// The rate limit (or the delay-smoother bias on top of it) hasn't
    /// elapsed yet; recheck in `Duration`.
    Deferred(Duration),
}

pub struct App {
    state: State,
    output_width: u32,
    output_height: u32,
}

enum State {
    Binding(Registry),
    Running(Box<Running>),
}

struct Running {
    globals: Globals,
    config: Config,
    qh: QueueHandle<App>,
    scheduler: Scheduler,
    renderer: GpuRenderer,
    keyboard: KeyboardInjector<WlVirtualKeyboard>,
    pointer: Option<PointerInjector<WlVirtualPointer>>,
    rfb: RfbServer,
    /// Single subscribed client (rfb::server's header comment: a second
    /// connection simply replaces whichever one was previously getting
    /// updates, rather than being refused).
    client: Option<RfbClient>,
    shm_pending_geometry: Option<BufferGeometry>,
}

impl App {
    /// Phase one: nothing is known yet except that we intend to bind the
    /// globals the core needs. `wayland::connect_and_bind` dispatches the
    /// initial roundtrip against this value.
    pub fn new_binding() -> Self {
        Self {
            state: State::Binding(Registry::new()),
            output_width: 1920,
            output_height: 1080,
        }
    }

    pub fn output_size(&self) -> (u32, u32) {
        (self.output_width, self.output_height)
    }

    fn running(&self) -> CoreResult<&Running> {
        match &self.state {
            State::Running(r) => Ok(r),
            State::Binding(_) => Err(CoreError::WaylandProtocol("App used before finish_init".into())),
        }
    }

    fn running_mut(&mut self) -> CoreResult<&mut Running> {
        match &mut self.state {
            State::Running(r) => Ok(r),
            State::Binding(_) => Err(CoreError::WaylandProtocol("App used before finish_init".into())),
        }
    }

    /// Phase two: consumes the registry builder, binds the dependent
    /// subsystems, and transitions to `Running`. Everything here is
    /// fail-fast — render/compositor-refusal errors are fatal at startup —
    /// since there is no sensible degraded mode for a bridge that can
    /// neither capture nor render.
    pub fn finish_init(&mut self, qh: QueueHandle<App>, config: Config) -> CoreResult<()> {
        let State::Binding(registry) = std::mem::replace(&mut self.state, State::Binding(Registry::new())) else {
            return Err(CoreError::WaylandProtocol("finish_init called more than once".into()));
        };
        let globals = registry.into_globals()?;
        wayland::log_capabilities(&globals);

        let shm_format = GlPixelFormat::from_config_str(&config.shm_format_fallback);
        let renderer = GpuRenderer::new(self.output_width, self.output_height, shm_format)?;

        let resolver = KeymapResolver::new(&config.layout, &config.variant)?;
        let serialized = resolver.serialize()?;
        let keyboard_manager = globals.virtual_keyboard_manager.as_ref().ok_or_else(|| {
            CoreError::CompositorRefused(
                "compositor has no zwp_virtual_keyboard_manager_v1; the keyboard path has no fallback".into(),
            )
        })?;
        let seat = globals
            .seat
            .as_ref()
            .ok_or_else(|| CoreError::CompositorRefused("compositor has no wl_seat".into()))?;
        let keyboard_proxy = keyboard_manager.create_virtual_keyboard(seat, &qh, ());
        let keyboard_sink = WlVirtualKeyboard::new(keyboard_proxy);
        keyboard_sink.set_keymap(&serialized.fd, serialized.size as u32);
        let keyboard = KeyboardInjector::new(resolver, keyboard_sink);

        let pointer = globals.virtual_pointer_manager.as_ref().map(|manager| {
            let proxy = manager.create_virtual_pointer(Some(seat), &qh, ());
            PointerInjector::new(WlVirtualPointer::new(proxy), self.output_width, self.output_height)
        });
        if pointer.is_none() {
            warn!("compositor does not implement zwlr_virtual_pointer_manager_v1; pointer passthrough is unavailable");
        }

        if config.password.is_empty() {
            return Err(CoreError::WaylandProtocol(
                "no RFB password configured; refusing to start an unauthenticated VncAuth server".into(),
            ));
        }
        let rfb = RfbServer::bind(
            &config.listen_addr,
            config.password.clone(),
            self.output_width.min(u16::MAX as u32) as u16,
            self.output_height.min(u16::MAX as u32) as u16,
        )
        .map_err(CoreError::Io)?;

        let scheduler_config = SchedulerConfig {
            rate_limit_hz: config.rate_limit_hz,
            smoother_time_constant: config.smoother_time_constant,
            overlay_cursor: config.overlay_cursor,
        };

        let scheduler = build_scheduler(&globals, &config, &qh, scheduler_config)?;

        self.state = State::Running(Box::new(Running {
            globals,
            config,
            qh,
            scheduler,
            renderer,
            keyboard,
            pointer,
            rfb,
            client: None,
            shm_pending_geometry: None,
        }));
        Ok(())
    }

    /// Tries to start the next capture, honouring single-flight and rate
    /// limiting. Called by the capture-pump timer in `main.rs` and, once a
    /// frame completes, chained directly from the `ready()` event handlers
    /// so the cadence is driven by real completions rather than a fixed
    /// poll.
    pub fn start_capture(&mut self, now: Instant) -> CoreResult<CaptureTick> {
        let running = self.running_mut()?;
        if running.scheduler.status() == CaptureStatus::InProgress {
            return Ok(CaptureTick::Busy);
        }
        match running.scheduler.start(now)? {
            StartOutcome::Immediate => Ok(CaptureTick::Started),
            StartOutcome::ArmTimer(d) => Ok(CaptureTick::Deferred(d)),
        }
    }

    pub fn fire_capture_timer(&mut self, now: Instant) -> CoreResult<()> {
        self.running_mut()?.scheduler.fire_start_timer(now)
    }

    pub fn rate_limit_period(&self) -> Duration {
        self.running()
            .map(|r| Duration::from_secs_f64(1.0 / r.config.rate_limit_hz))
            .unwrap_or(Duration::from_millis(50))
    }

    /// Accepts any pending RFB connections (replacing the current
    /// subscriber per the single-client deployment model), then drains
    /// whatever is readable on the current one.
    pub fn poll_rfb(&mut self) -> CoreResult<()> {
        let running = self.running_mut()?;
        for new_client in running.rfb.accept_ready() {
            if running.client.is_some() {
                info!("new RFB client connected, replacing the previous one's update subscription");
            }
            running.client = Some(new_client);
        }

        let Some(client) = running.client.as_mut() else {
            return Ok(());
        };
        match client.handle_readable() {
            Ok(events) => {
                for (down, keysym) in events.key_events {
                    running.keyboard.feed(keysym, down);
                }
                for (button_mask, x, y) in events.pointer_events {
                    apply_pointer_event(running, button_mask, x, y);
                }
                if events.wants_update {
                    send_update_to_client(running)?;
                }
            }
            Err(e) => {
                info!(error = %e, "RFB client disconnected");
                running.client = None;
            }
        }
        Ok(())
    }

    /// Renders a just-completed capture and, if a client is subscribed,
    /// pushes the resulting damage out as a `FramebufferUpdate`.
    pub fn on_captured_frame(&mut self, frame: CapturedFrame) -> CoreResult<()> {
        let running = self.running_mut()?;
        match &frame.payload {
            FramePayload::Shm { pixels, stride } => {
                running.renderer.render_framebuffer(pixels, frame.width, frame.height, *stride)?;
            }
            FramePayload::Dmabuf { planes, .. } => {
                running.renderer.render_dmabuf_frame(frame.width, frame.height, frame.format, planes)?;
            }
        }
        send_update_to_client(running)
    }

    /// `ready()` for the SHM path needs to map the pooled buffer before
    /// handing pixels to the scheduler; kept here rather than inline in the
    /// `Dispatch` impl since both the `Ready` event and tests want it.
    fn shm_ready(&mut self, now: Instant) -> CoreResult<()> {
        let running = self.running_mut()?;
        let pixels = running.scheduler.shm_read_pool_pixels()?;
        let frame = running.scheduler.shm_ready(now, pixels);
        if let Some(frame) = frame {
            self.on_captured_frame(frame)?;
        }
        Ok(())
    }
}

fn apply_pointer_event(running: &mut Running, button_mask: u8, x: u16, y: u16) {
    let Some(pointer) = running.pointer.as_mut() else {
        return;
    };
    pointer.motion(x as u32, y as u32);
    const BUTTONS: [(u8, PointerButton); 3] = [
        (0b0000_0001, PointerButton::Left),
        (0b0000_0010, PointerButton::Middle),
        (0b0000_0100, PointerButton::Right),
    ];
    for (mask, button) in BUTTONS {
        pointer.button(button, button_mask & mask != 0);
    }
    if button_mask & 0b0000_1000 != 0 {
        pointer.scroll(ScrollAxis::Vertical, -1);
    }
    if button_mask & 0b0001_0000 != 0 {
        pointer.scroll(ScrollAxis::Vertical, 1);
    }
    if button_mask & 0b0010_0000 != 0 {
        pointer.scroll(ScrollAxis::Horizontal, -1);
    }
    if button_mask & 0b0100_0000 != 0 {
        pointer.scroll(ScrollAxis::Horizontal, 1);
    }
}

fn send_update_to_client(running: &mut Running) -> CoreResult<()> {
    let Some(client) = running.client.as_mut() else {
        return Ok(());
    };
    let damage = running.renderer.current_damage().clone();
    let renderer = &running.renderer;
    let width = renderer.width();
    let height = renderer.height();
    let result = client.on_frame_done(width, height, &damage, |rect: &Rect| {
        renderer.copy_rect_pixels(rect).unwrap_or_else(|e| {
            warn!(error = %e, "readback for RFB rect failed, sending black");
            vec![0u8; (rect.w * rect.h * 4) as usize]
        })
    });
    if let Err(e) = result {
        info!(error = %e, "RFB client write failed, dropping it");
        running.client = None;
    }
    Ok(())
}

fn build_scheduler(
    globals: &Globals,
    config: &Config,
    qh: &QueueHandle<App>,
    scheduler_config: SchedulerConfig,
) -> CoreResult<Scheduler> {
    let output = globals.output.clone();
    let shm = globals.shm.clone();

    let make_shm_session: Option<MakeShmSession> = globals.screencopy_manager.clone().map(|manager| {
        let output = output.clone();
        let shm = shm.clone();
        let qh = qh.clone();
        Box::new(move || WlScreencopySession::new(manager.clone(), output.clone(), shm.clone(), qh.clone()))
            as MakeShmSession
    });

    let use_dmabuf = config.prefer_dmabuf && globals.export_dmabuf_manager.is_some();

    if use_dmabuf {
        let Some(make_shm_session) = make_shm_session else {
            return Err(CoreError::CompositorRefused(
                "compositor has no zwlr_screencopy_manager_v1 to fall back to".into(),
            ));
        };
        let manager = globals.export_dmabuf_manager.clone().unwrap();
        let session = WlDmabufSession::new(manager, output, qh.clone());
        let backend = DmabufBackend::new(session, config.rate_limit_hz);
        Ok(CaptureScheduler::new_dmabuf(backend, scheduler_config, make_shm_session))
    } else {
        let Some(manager) = globals.screencopy_manager.clone() else {
            return Err(CoreError::CompositorRefused("compositor has no zwlr_screencopy_manager_v1".into()));
        };
        let session = WlScreencopySession::new(manager, output.clone(), shm.clone(), qh.clone());
        let backend = ShmBackend::new(session, config.rate_limit_hz, config.smoother_time_constant, config.overlay_cursor);
        let make_shm_session = make_shm_session
            .ok_or_else(|| CoreError::CompositorRefused("compositor has no zwlr_screencopy_manager_v1".into()))?;
        Ok(CaptureScheduler::new_shm(backend, scheduler_config, make_shm_session))
    }
}

fn wenum_or<T: Copy>(value: WEnum<T>, fallback: T) -> T {
    match value {
        WEnum::Value(v) => v,
        WEnum::Unknown(_) => fallback,
    }
}

// --- Dispatch impls -------------------------------------------------------

impl Dispatch<wl_registry::WlRegistry, ()> for App {
    fn event(
        app: &mut Self,
        registry: &wl_registry::WlRegistry,
        event: wl_registry::Event,
        _: &(),
        _conn: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        if let State::Binding(reg) = &mut app.state {
            wayland::handle_registry_event(reg, registry, event, qh);
        } else {
            debug!("ignoring late wl_registry event after startup");
        }
    }
}

impl Dispatch<wl_shm::WlShm, ()> for App {
    fn event(_: &mut Self, _: &wl_shm::WlShm, event: wl_shm::Event, _: &(), _: &Connection, _: &QueueHandle<Self>) {
        if let wl_shm::Event::Format { format } = event {
            debug!(?format, "compositor announced an shm format");
        }
    }
}

impl Dispatch<wl_seat::WlSeat, ()> for App {
    fn event(_: &mut Self, _: &wl_seat::WlSeat, _event: wl_seat::Event, _: &(), _: &Connection, _: &QueueHandle<Self>) {
    }
}

impl Dispatch<wl_output::WlOutput, ()> for App {
    fn event(
        app: &mut Self,
        _: &wl_output::WlOutput,
        event: wl_output::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let wl_output::Event::Mode { width, height, .. } = event {
            if width > 0 && height > 0 {
                app.output_width = width as u32;
                app.output_height = height as u32;
            }
        }
    }
}

impl Dispatch<zwlr_screencopy_manager_v1::ZwlrScreencopyManagerV1, ()> for App {
    fn event(
        _: &mut Self,
        _: &zwlr_screencopy_manager_v1::ZwlrScreencopyManagerV1,
        _event: zwlr_screencopy_manager_v1::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<zwlr_export_dmabuf_manager_v1::ZwlrExportDmabufManagerV1, ()> for App {
    fn event(
        _: &mut Self,
        _: &zwlr_export_dmabuf_manager_v1::ZwlrExportDmabufManagerV1,
        _event: zwlr_export_dmabuf_manager_v1::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1, ()> for App {
    fn event(
        _: &mut Self,
        _: &zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1,
        _event: zwp_linux_dmabuf_v1::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        // Format/modifier advertisements; the renderer's EGL import path
        // negotiates modifiers per-frame from the export-dmabuf frame event
        // instead, so there is nothing to record here.
    }
}

impl Dispatch<zwp_virtual_keyboard_manager_v1::ZwpVirtualKeyboardManagerV1, ()> for App {
    fn event(
        _: &mut Self,
        _: &zwp_virtual_keyboard_manager_v1::ZwpVirtualKeyboardManagerV1,
        _event: zwp_virtual_keyboard_manager_v1::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<zwlr_virtual_pointer_manager_v1::ZwlrVirtualPointerManagerV1, ()> for App {
    fn event(
        _: &mut Self,
        _: &zwlr_virtual_pointer_manager_v1::ZwlrVirtualPointerManagerV1,
        _event: zwlr_virtual_pointer_manager_v1::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<wayland_client::protocol::wl_shm_pool::WlShmPool, ()> for App {
    fn event(
        _: &mut Self,
        _: &wayland_client::protocol::wl_shm_pool::WlShmPool,
        _event: wayland_client::protocol::wl_shm_pool::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<wl_buffer::WlBuffer, ()> for App {
    fn event(
        _: &mut Self,
        buffer: &wl_buffer::WlBuffer,
        event: wl_buffer::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let wl_buffer::Event::Release = event {
            buffer.destroy();
        }
    }
}

impl Dispatch<zwlr_screencopy_frame_v1::ZwlrScreencopyFrameV1, ()> for App {
    fn event(
        app: &mut Self,
        _proxy: &zwlr_screencopy_frame_v1::ZwlrScreencopyFrameV1,
        event: zwlr_screencopy_frame_v1::Event,
        _: &(),
        _: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        use zwlr_screencopy_frame_v1::Event;

        let Ok(running) = app.running_mut() else {
            return;
        };

        match event {
            Event::Buffer { format, width, height, stride } => {
                let format = wenum_or(format, wl_shm::Format::Argb8888) as u32;
                running.shm_pending_geometry = Some(BufferGeometry { width, height, stride, format });
            }
            Event::LinuxDmabuf { .. } => {
                // This bridge captures dma-buf through the dedicated
                // export-dmabuf manager instead of screencopy's own
                // alternate-buffer offer; nothing to record.
            }
            Event::BufferDone => {
                if let Some(geometry) = running.shm_pending_geometry.take() {
                    if let Err(e) = running.scheduler.shm_buffer(geometry) {
                        warn!(error = %e, "screencopy buffer negotiation failed");
                    }
                }
            }
            Event::Flags { flags } => {
                let flags = wenum_or(flags, zwlr_screencopy_frame_v1::Flags::empty());
                running.renderer.set_y_inverted(flags.contains(zwlr_screencopy_frame_v1::Flags::YInvert));
            }
            Event::Damage { x, y, width, height } => {
                running.scheduler.shm_damage(Rect { x, y, w: width, h: height });
            }
            Event::Ready { .. } => {
                if let Err(e) = app.shm_ready(Instant::now()) {
                    error!(error = %e, "failed to process a completed screencopy frame");
                }
            }
            Event::Failed => {
                running.scheduler.shm_failed();
            }
            _ => {}
        }
    }
}

impl Dispatch<zwlr_export_dmabuf_frame_v1::ZwlrExportDmabufFrameV1, ()> for App {
    fn event(
        app: &mut Self,
        _proxy: &zwlr_export_dmabuf_frame_v1::ZwlrExportDmabufFrameV1,
        event: zwlr_export_dmabuf_frame_v1::Event,
        _: &(),
        _: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        use zwlr_export_dmabuf_frame_v1::Event;

        let Ok(running) = app.running_mut() else {
            return;
        };

        match event {
            Event::Frame { width, height, format, mod_high, mod_low, .. } => {
                let modifier = ((mod_high as u64) << 32) | (mod_low as u64);
                let fourcc = drm_fourcc::DrmFourcc::try_from(format).unwrap_or_else(|_| {
                    warn!(format, "unrecognised dma-buf fourcc, defaulting to XRGB8888");
                    drm_fourcc::DrmFourcc::Xrgb8888
                });
                running.scheduler.dmabuf_frame(width, height, fourcc, modifier);
            }
            Event::Object { fd, size, offset, stride, .. } => {
                // `modifier` isn't known here; it arrived with the preceding
                // `Frame` event and `DmabufBackend::object()` stamps it onto
                // the plane before storing it.
                running.scheduler.dmabuf_object(DmabufPlane {
                    fd,
                    offset,
                    size,
                    pitch: stride,
                    modifier: 0,
                });
            }
            Event::Ready { .. } => {
                let completed = running.scheduler.dmabuf_ready(Instant::now());
                if let Some((_, frame)) = completed {
                    if let Err(e) = app.on_captured_frame(frame) {
                        error!(error = %e, "failed to render a dma-buf frame");
                    }
                }
            }
            Event::Cancel { reason } => {
                let reason = match reason {
                    WEnum::Value(zwlr_export_dmabuf_frame_v1::CancelReason::Permanent) => CancelReason::Permanent,
                    WEnum::Value(zwlr_export_dmabuf_frame_v1::CancelReason::Resizing) => CancelReason::Resizing,
                    _ => CancelReason::Temporary,
                };
                running.scheduler.dmabuf_cancel(reason);
            }
            _ => {}
        }
    }
}
