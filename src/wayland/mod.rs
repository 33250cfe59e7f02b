//! Compositor bring-up and protocol-object wiring, specified only through
//! the interfaces the core consumes and produces.
//!
//! This module's only job is to get from "a Wayland socket" to bound
//! protocol globals and an output; the interesting state machines
//! (`capture::shm`, `capture::dmabuf`, `keymap`, `keyboard`) live elsewhere
//! and only see the trait interfaces this module's thin session types
//! implement for them (`ScreencopySession`, `DmabufSession`,
//! `VirtualKeyboardSink`, `VirtualPointerSink`).

pub mod capture_session;
pub mod input_session;

use tracing::{info, warn};
use wayland_client::protocol::{wl_output, wl_registry, wl_seat, wl_shm};
use wayland_client::{Connection, Dispatch, QueueHandle};
use wayland_protocols::wp::linux_dmabuf::zv1::client::zwp_linux_dmabuf_v1;
use wayland_protocols_misc::zwp_virtual_keyboard_v1::client::zwp_virtual_keyboard_manager_v1;
use wayland_protocols_wlr::export_dmabuf::v1::client::zwlr_export_dmabuf_manager_v1;
use wayland_protocols_wlr::screencopy::v1::client::zwlr_screencopy_manager_v1;
use wayland_protocols_wlr::virtual_pointer::v1::client::zwlr_virtual_pointer_manager_v1;

use crate::error::{CoreError, CoreResult};

/// Every global this bridge needs, bound once during the initial registry
/// roundtrip. A missing global is `CompositorRefused`-class: the feature
/// that needed it is simply unavailable (dmabuf capture falls back to SHM;
/// a missing virtual-keyboard manager is fatal, since the keyboard path has
/// no fallback of its own).
pub struct Globals {
    pub shm: wl_shm::WlShm,
    pub seat: Option<wl_seat::WlSeat>,
    pub output: wl_output::WlOutput,
    pub screencopy_manager: Option<zwlr_screencopy_manager_v1::ZwlrScreencopyManagerV1>,
    pub export_dmabuf_manager: Option<zwlr_export_dmabuf_manager_v1::ZwlrExportDmabufManagerV1>,
    pub linux_dmabuf: Option<zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1>,
    pub virtual_keyboard_manager: Option<zwp_virtual_keyboard_manager_v1::ZwpVirtualKeyboardManagerV1>,
    pub virtual_pointer_manager: Option<zwlr_virtual_pointer_manager_v1::ZwlrVirtualPointerManagerV1>,
}

#[derive(Default)]
struct GlobalsBuilder {
    shm: Option<wl_shm::WlShm>,
    seat: Option<wl_seat::WlSeat>,
    output: Option<wl_output::WlOutput>,
    screencopy_manager: Option<zwlr_screencopy_manager_v1::ZwlrScreencopyManagerV1>,
    export_dmabuf_manager: Option<zwlr_export_dmabuf_manager_v1::ZwlrExportDmabufManagerV1>,
    linux_dmabuf: Option<zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1>,
    virtual_keyboard_manager: Option<zwp_virtual_keyboard_manager_v1::ZwpVirtualKeyboardManagerV1>,
    virtual_pointer_manager: Option<zwlr_virtual_pointer_manager_v1::ZwlrVirtualPointerManagerV1>,
}

impl GlobalsBuilder {
    fn finish(self) -> CoreResult<Globals> {
        Ok(Globals {
            shm: self
                .shm
                .ok_or_else(|| CoreError::CompositorRefused("compositor has no wl_shm global".into()))?,
            seat: self.seat,
            output: self
                .output
                .ok_or_else(|| CoreError::CompositorRefused("compositor has no wl_output global".into()))?,
            screencopy_manager: self.screencopy_manager,
            export_dmabuf_manager: self.export_dmabuf_manager,
            linux_dmabuf: self.linux_dmabuf,
            virtual_keyboard_manager: self.virtual_keyboard_manager,
            virtual_pointer_manager: self.virtual_pointer_manager,
        })
    }
}

/// Wraps the bits of client state the registry binding pass needs; the full
/// application state (`crate::app::App`) embeds this and implements
/// `Dispatch` for every protocol object listed above.
pub struct Registry {
    builder: GlobalsBuilder,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            builder: GlobalsBuilder::default(),
        }
    }

    pub fn into_globals(self) -> CoreResult<Globals> {
        self.builder.finish()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Connects to the compositor named by `WAYLAND_DISPLAY`/`$XDG_RUNTIME_DIR`
/// and performs the initial registry roundtrip. Returns the connection, the
/// event queue, and the bound globals. Any I/O or protocol error here is
/// `CompositorRefused` — there is nothing to capture without a connection.
pub fn connect_and_bind<D>(
    state: &mut D,
) -> CoreResult<(Connection, wayland_client::EventQueue<D>, QueueHandle<D>)>
where
    D: Dispatch<wl_registry::WlRegistry, ()>
        + Dispatch<wl_shm::WlShm, ()>
        + Dispatch<wl_seat::WlSeat, ()>
        + Dispatch<wl_output::WlOutput, ()>
        + 'static,
{
    let conn = Connection::connect_to_env()
        .map_err(|e| CoreError::CompositorRefused(format!("connect_to_env: {e}")))?;
    let display = conn.display();
    let mut event_queue = conn.new_event_queue();
    let qh = event_queue.handle();
    let _registry = display.get_registry(&qh, ());

    event_queue
        .roundtrip(state)
        .map_err(|e| CoreError::CompositorRefused(format!("initial roundtrip: {e}")))?;

    Ok((conn, event_queue, qh))
}

/// Registry global binding. The owning `App` forwards its `wl_registry`
/// events here; kept generic over the concrete `Dispatch` target only
/// through the free function below since `Registry` itself is not the
/// `Dispatch` impl target (the app's top-level state is, so it can reach
/// every sub-object's events too).
pub fn handle_registry_event<D>(
    registry_state: &mut Registry,
    registry: &wl_registry::WlRegistry,
    event: wl_registry::Event,
    qh: &QueueHandle<D>,
) where
    D: Dispatch<wl_shm::WlShm, ()>
        + Dispatch<wl_seat::WlSeat, ()>
        + Dispatch<wl_output::WlOutput, ()>
        + Dispatch<zwlr_screencopy_manager_v1::ZwlrScreencopyManagerV1, ()>
        + Dispatch<zwlr_export_dmabuf_manager_v1::ZwlrExportDmabufManagerV1, ()>
        + Dispatch<zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1, ()>
        + Dispatch<zwp_virtual_keyboard_manager_v1::ZwpVirtualKeyboardManagerV1, ()>
        + Dispatch<zwlr_virtual_pointer_manager_v1::ZwlrVirtualPointerManagerV1, ()>
        + 'static,
{
    let wl_registry::Event::Global { name, interface, version } = event else {
        return;
    };

    macro_rules! bind {
        ($target:expr, $iface:ty, $max:expr) => {
            $target = Some(registry.bind::<$iface, _, _>(name, version.min($max), qh, ()));
        };
    }

    match interface.as_str() {
        "wl_shm" => bind!(registry_state.builder.shm, wl_shm::WlShm, 1),
        "wl_seat" => bind!(registry_state.builder.seat, wl_seat::WlSeat, 7),
        "wl_output" => bind!(registry_state.builder.output, wl_output::WlOutput, 4),
        "zwlr_screencopy_manager_v1" => {
            bind!(
                registry_state.builder.screencopy_manager,
                zwlr_screencopy_manager_v1::ZwlrScreencopyManagerV1,
                3
            )
        }
        "zwlr_export_dmabuf_manager_v1" => {
            bind!(
                registry_state.builder.export_dmabuf_manager,
                zwlr_export_dmabuf_manager_v1::ZwlrExportDmabufManagerV1,
                1
            )
        }
        "zwp_linux_dmabuf_v1" => {
            bind!(registry_state.builder.linux_dmabuf, zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1, 4)
        }
        "zwp_virtual_keyboard_manager_v1" => {
            bind!(
                registry_state.builder.virtual_keyboard_manager,
                zwp_virtual_keyboard_manager_v1::ZwpVirtualKeyboardManagerV1,
                1
            )
        }
        "zwlr_virtual_pointer_manager_v1" => {
            bind!(
                registry_state.builder.virtual_pointer_manager,
                zwlr_virtual_pointer_manager_v1::ZwlrVirtualPointerManagerV1,
                2
            )
        }
        _ => {}
    }
}

/// Logs which optional globals are missing so a user who asked for
/// `prefer_dmabuf` and got SHM anyway knows why.
pub fn log_capabilities(globals: &Globals) {
    info!(
        screencopy = globals.screencopy_manager.is_some(),
        export_dmabuf = globals.export_dmabuf_manager.is_some(),
        virtual_keyboard = globals.virtual_keyboard_manager.is_some(),
        virtual_pointer = globals.virtual_pointer_manager.is_some(),
        "compositor capabilities"
    );
    if globals.virtual_keyboard_manager.is_none() {
        warn!("compositor does not implement zwp_virtual_keyboard_manager_v1; key injection is unavailable");
    }
}
