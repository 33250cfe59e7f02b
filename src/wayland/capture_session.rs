//! Thin `ScreencopySession`/`DmabufSession` implementations over the real
//! wlr protocol objects. These only issue requests; the
//! matching events are dispatched on `crate::app::App` (the `Dispatch`
//! target) and routed into the active backend through
//! `CaptureScheduler::shm_*`/`dmabuf_*`.

use std::os::fd::AsFd;

use wayland_client::protocol::{wl_output, wl_shm};
use wayland_client::QueueHandle;
use wayland_protocols_wlr::export_dmabuf::v1::client::{
    zwlr_export_dmabuf_frame_v1, zwlr_export_dmabuf_manager_v1,
};
use wayland_protocols_wlr::screencopy::v1::client::{zwlr_screencopy_frame_v1, zwlr_screencopy_manager_v1};

use crate::app::App;
use crate::capture::shm::ScreencopySession;
use crate::capture::BufferGeometry;
use crate::error::{CoreError, CoreResult};

pub struct WlScreencopySession {
    manager: zwlr_screencopy_manager_v1::ZwlrScreencopyManagerV1,
    output: wl_output::WlOutput,
    shm: wl_shm::WlShm,
    qh: QueueHandle<App>,
    frame: Option<zwlr_screencopy_frame_v1::ZwlrScreencopyFrameV1>,
    pool: Option<(wayland_client::protocol::wl_shm_pool::WlShmPool, BufferGeometry)>,
}

impl WlScreencopySession {
    pub fn new(
        manager: zwlr_screencopy_manager_v1::ZwlrScreencopyManagerV1,
        output: wl_output::WlOutput,
        shm: wl_shm::WlShm,
        qh: QueueHandle<App>,
    ) -> Self {
        Self {
            manager,
            output,
            shm,
            qh,
            frame: None,
            pool: None,
        }
    }

    pub fn frame(&self) -> Option<&zwlr_screencopy_frame_v1::ZwlrScreencopyFrameV1> {
        self.frame.as_ref()
    }
}

impl ScreencopySession for WlScreencopySession {
    fn capture_output(&mut self, overlay_cursor: bool) -> CoreResult<()> {
        let frame = self
            .manager
            .capture_output(overlay_cursor as i32, &self.output, &self.qh, ());
        self.frame = Some(frame);
        Ok(())
    }

    fn copy_with_damage(
        &mut self,
        geometry: BufferGeometry,
        pool_fd: &std::os::fd::OwnedFd,
    ) -> CoreResult<()> {
        let Some(frame) = &self.frame else {
            return Err(CoreError::CompositorRefused("copy_with_damage without an outstanding frame".into()));
        };

        let needs_new_pool = !matches!(&self.pool, Some((_, g)) if *g == geometry);
        if needs_new_pool {
            if let Some((pool, _)) = self.pool.take() {
                pool.destroy();
            }
            let size = geometry.stride as i32 * geometry.height as i32;
            let pool = self.shm.create_pool(pool_fd.as_fd(), size, &self.qh, ());
            self.pool = Some((pool, geometry));
        }

        let (pool, _) = self.pool.as_ref().unwrap();
        let buffer = pool.create_buffer(
            0,
            geometry.width as i32,
            geometry.height as i32,
            geometry.stride as i32,
            wl_shm::Format::try_from(geometry.format).unwrap_or(wl_shm::Format::Argb8888),
            &self.qh,
            (),
        );

        frame.copy_with_damage(&buffer);
        Ok(())
    }

    fn destroy(&mut self) {
        if let Some(frame) = self.frame.take() {
            frame.destroy();
        }
    }
}

pub struct WlDmabufSession {
    manager: zwlr_export_dmabuf_manager_v1::ZwlrExportDmabufManagerV1,
    output: wl_output::WlOutput,
    qh: QueueHandle<App>,
    frame: Option<zwlr_export_dmabuf_frame_v1::ZwlrExportDmabufFrameV1>,
    overlay_cursor: bool,
}

impl WlDmabufSession {
    pub fn new(
        manager: zwlr_export_dmabuf_manager_v1::ZwlrExportDmabufManagerV1,
        output: wl_output::WlOutput,
        qh: QueueHandle<App>,
    ) -> Self {
        Self {
            manager,
            output,
            qh,
            frame: None,
            overlay_cursor: false,
        }
    }

    pub fn set_overlay_cursor(&mut self, overlay_cursor: bool) {
        self.overlay_cursor = overlay_cursor;
    }
}

impl crate::capture::dmabuf::DmabufSession for WlDmabufSession {
    fn capture_output(&mut self) -> CoreResult<()> {
        let frame = self
            .manager
            .capture_output(self.overlay_cursor as i32, &self.output, &self.qh, ());
        self.frame = Some(frame);
        Ok(())
    }

    fn destroy(&mut self) {
        if let Some(frame) = self.frame.take() {
            frame.destroy();
        }
    }
}
