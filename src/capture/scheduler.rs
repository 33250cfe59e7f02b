//! Capture scheduler.
//!
//! Owns whichever backend is active, forwards protocol events to it, and
//! enforces single-flight: the scheduler is the only thing that calls
//! `start()`/`start_capture_now()` on a backend, so it is also the natural
//! place to guarantee a backend never gets a second `start` while one
//! capture is still `IN_PROGRESS`. Preference at startup is DMA-BUF when the
//! compositor advertises export-dmabuf support for the output, falling back
//! to SHM; a DMA-BUF backend going `FATAL` rebinds the scheduler to SHM for
//! subsequent frames.

use std::time::Instant;

use tracing::{info, warn};

use crate::damage::Rect;
use crate::error::CoreError;

use super::dmabuf::{CancelReason, DmabufBackend, DmabufSession};
use super::shm::{ScreencopySession, ShmBackend};
use super::{BufferGeometry, CaptureStatus, CapturedFrame, DmabufPlane, FrameCaptureBackend, StartOutcome};

enum Active<SS: ScreencopySession, DS: DmabufSession> {
    Shm(ShmBackend<SS>),
    Dmabuf(DmabufBackend<DS>),
}

/// Parameters needed to build a fresh SHM backend when falling back from a
/// dead DMA-BUF one; kept separately so the scheduler can rebuild a session
/// without the caller threading config through every call site.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub rate_limit_hz: f64,
    pub smoother_time_constant: f64,
    pub overlay_cursor: bool,
}

pub struct CaptureScheduler<SS, DS, F>
where
    SS: ScreencopySession,
    DS: DmabufSession,
    F: FnMut() -> SS,
{
    active: Active<SS, DS>,
    config: SchedulerConfig,
    make_shm_session: F,
}

impl<SS, DS, F> CaptureScheduler<SS, DS, F>
where
    SS: ScreencopySession,
    DS: DmabufSession,
    F: FnMut() -> SS,
{
    pub fn new_dmabuf(backend: DmabufBackend<DS>, config: SchedulerConfig, make_shm_session: F) -> Self {
        Self {
            active: Active::Dmabuf(backend),
            config,
            make_shm_session,
        }
    }

    pub fn new_shm(backend: ShmBackend<SS>, config: SchedulerConfig, make_shm_session: F) -> Self {
        Self {
            active: Active::Shm(backend),
            config,
            make_shm_session,
        }
    }

    pub fn is_dmabuf(&self) -> bool {
        matches!(self.active, Active::Dmabuf(_))
    }

    pub fn status(&self) -> CaptureStatus {
        match &self.active {
            Active::Shm(b) => b.status(),
            Active::Dmabuf(b) => b.status(),
        }
    }

    /// (a) single-flight: never call `start` on a backend already
    /// `IN_PROGRESS` — both backends already fail fast on this, the
    /// scheduler just forwards. (d) `start()`/`stop()` simply forward.
    pub fn start(&mut self, now: Instant) -> Result<StartOutcome, CoreError> {
        let outcome = match &mut self.active {
            Active::Shm(b) => b.start(now),
            Active::Dmabuf(b) => b.start(now),
        };
        if let Err(CoreError::CaptureFatal(_)) | Err(CoreError::CompositorRefused(_)) = &outcome {
            self.maybe_fall_back();
        }
        outcome
    }

    pub fn stop(&mut self) {
        match &mut self.active {
            Active::Shm(b) => b.stop(),
            Active::Dmabuf(b) => b.stop(),
        }
    }

    /// Fired by a timer armed from `start()`'s `StartOutcome::ArmTimer`.
    pub fn fire_start_timer(&mut self, now: Instant) -> Result<(), CoreError> {
        let result = match &mut self.active {
            Active::Shm(b) => b.start_capture_now(now),
            Active::Dmabuf(b) => b.start_capture_now(),
        };
        if result.is_err() {
            self.maybe_fall_back();
        }
        result
    }

    fn maybe_fall_back(&mut self) {
        if let Active::Dmabuf(b) = &self.active {
            if b.status() == CaptureStatus::Fatal {
                warn!("dma-buf capture fatal, falling back to screencopy (SHM) for subsequent frames");
                let session = (self.make_shm_session)();
                self.active = Active::Shm(ShmBackend::new(
                    session,
                    self.config.rate_limit_hz,
                    self.config.smoother_time_constant,
                    self.config.overlay_cursor,
                ));
            }
        }
    }

    // --- SHM protocol events; no-ops (with a warning) if SHM isn't active,
    // since a stale frame object's events arriving after a backend switch
    // are the compositor's problem, not ours to crash over. ---

    pub fn shm_buffer(&mut self, geometry: BufferGeometry) -> Result<(), CoreError> {
        match &mut self.active {
            Active::Shm(b) => b.buffer(geometry),
            Active::Dmabuf(_) => {
                warn!("ignoring screencopy buffer() event, dma-buf backend is active");
                Ok(())
            }
        }
    }

    pub fn shm_damage(&mut self, rect: Rect) {
        if let Active::Shm(b) = &mut self.active {
            b.damage(rect);
        }
    }

    pub fn shm_ready(&mut self, now: Instant, pixels: Vec<u8>) -> Option<CapturedFrame> {
        match &mut self.active {
            Active::Shm(b) => Some(b.ready(now, pixels)),
            Active::Dmabuf(_) => {
                warn!("ignoring screencopy ready() event, dma-buf backend is active");
                None
            }
        }
    }

    /// Geometry of the pooled SHM buffer, for the caller to size a readback
    /// buffer before `ready()`. `None` if SHM isn't the active backend.
    pub fn shm_geometry(&self) -> Option<BufferGeometry> {
        match &self.active {
            Active::Shm(b) => b.geometry(),
            Active::Dmabuf(_) => None,
        }
    }

    /// Maps and copies the pooled SHM buffer's bytes, for the `ready()`
    /// event handler to hand to `shm_ready` without holding the pool's
    /// lifetime hostage.
    pub fn shm_read_pool_pixels(&self) -> Result<Vec<u8>, CoreError> {
        match &self.active {
            Active::Shm(b) => b.read_pool_pixels(),
            Active::Dmabuf(_) => Err(CoreError::RenderFailure("shm_read_pool_pixels() while dma-buf backend is active".into())),
        }
    }

    pub fn shm_failed(&mut self) {
        if let Active::Shm(b) = &mut self.active {
            b.failed();
        } else {
            warn!("ignoring screencopy failed() event, dma-buf backend is active");
        }
    }

    // --- DMA-BUF protocol events ---

    pub fn dmabuf_frame(&mut self, width: u32, height: u32, format: drm_fourcc::DrmFourcc, modifier: u64) {
        if let Active::Dmabuf(b) = &mut self.active {
            b.frame(width, height, format, modifier);
        } else {
            warn!("ignoring export-dmabuf frame() event, screencopy backend is active");
        }
    }

    pub fn dmabuf_object(&mut self, plane: DmabufPlane) {
        if let Active::Dmabuf(b) = &mut self.active {
            b.object(plane);
        } else {
            warn!("ignoring export-dmabuf object() event, screencopy backend is active");
        }
    }

    pub fn dmabuf_ready(&mut self, now: Instant) -> Option<(StartOutcome, CapturedFrame)> {
        match &mut self.active {
            Active::Dmabuf(b) => Some(b.ready(now)),
            Active::Shm(_) => {
                warn!("ignoring export-dmabuf ready() event, screencopy backend is active");
                None
            }
        }
    }

    pub fn dmabuf_cancel(&mut self, reason: CancelReason) {
        if let Active::Dmabuf(b) = &mut self.active {
            b.cancel(reason);
            self.maybe_fall_back();
        } else {
            warn!("ignoring export-dmabuf cancel() event, screencopy backend is active");
        }
    }

    pub fn log_active(&self) {
        info!(dmabuf = self.is_dmabuf(), status = ?self.status(), "capture backend active");
    }
}
