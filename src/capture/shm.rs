//! SHM capture backend driving the screencopy protocol.
//!
//! ```text
//! IDLE --start--> AWAITING_BUFFER --buffer()--> COPYING --ready()--> DONE
//!                                |                       |
//!                                |                       +--failed()--> FAILED
//!                                +------------------------ stop() --> STOPPED
//! ```

use std::os::fd::OwnedFd;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::damage::Rect;
use crate::error::CoreError;
use crate::shm;
use crate::smoother::DelaySmoother;

use super::{BufferGeometry, CaptureStatus, CapturedFrame, FrameCaptureBackend, FramePayload, StartOutcome};

pub const RATE_LIMIT_HZ: f64 = 20.0;

/// Requests the backend issues against the compositor's screencopy
/// objects. Implemented by the Wayland glue over
/// `zwlr_screencopy_manager_v1`/`zwlr_screencopy_frame_v1`; a recording
/// mock drives the unit tests below.
pub trait ScreencopySession {
    /// Requests a new frame object for this output (`capture_output`).
    /// Returns `Err` if the compositor refused to hand back an object.
    fn capture_output(&mut self, overlay_cursor: bool) -> Result<(), CoreError>;
    /// Creates/rebinds the pool buffer if needed and requests a
    /// damage-reporting copy into it (`copy_with_damage`).
    fn copy_with_damage(&mut self, geometry: BufferGeometry, pool_fd: &OwnedFd) -> Result<(), CoreError>;
    /// Destroys the outstanding frame object, idempotent.
    fn destroy(&mut self);
}

struct Pool {
    fd: OwnedFd,
    geometry: BufferGeometry,
}

pub struct ShmBackend<S: ScreencopySession> {
    session: S,
    status: CaptureStatus,
    pool: Option<Pool>,
    damage_hint: Option<Rect>,
    rate_limit_hz: f64,
    last_done: Option<Instant>,
    start_time: Option<Instant>,
    smoother: DelaySmoother,
    overlay_cursor: bool,
}

impl<S: ScreencopySession> ShmBackend<S> {
    pub fn new(session: S, rate_limit_hz: f64, smoother_time_constant: f64, overlay_cursor: bool) -> Self {
        Self {
            session,
            status: CaptureStatus::Idle,
            pool: None,
            damage_hint: None,
            rate_limit_hz,
            last_done: None,
            start_time: None,
            smoother: DelaySmoother::new(smoother_time_constant),
            overlay_cursor,
        }
    }

    /// Computes whether `start()` may dispatch immediately or must arm a
    /// timer: `time_left = 1/RATE_LIMIT - (now - last_time) - delay`.
    pub fn start(&mut self, now: Instant) -> Result<StartOutcome, CoreError> {
        if self.status == CaptureStatus::InProgress {
            return Err(CoreError::CaptureFailed(
                "start() called while a capture is already in progress".into(),
            ));
        }

        let Some(last_done) = self.last_done else {
            self.start_capture_now(now)?;
            return Ok(StartOutcome::Immediate);
        };

        let period = Duration::from_secs_f64(1.0 / self.rate_limit_hz);
        let elapsed = now.saturating_duration_since(last_done);
        let delay = Duration::from_secs_f64(self.smoother.value().max(0.0));

        let time_left = period
            .checked_sub(elapsed)
            .and_then(|d| d.checked_sub(delay));

        match time_left {
            Some(d) if d > Duration::ZERO => Ok(StartOutcome::ArmTimer(d)),
            _ => {
                self.start_capture_now(now)?;
                Ok(StartOutcome::Immediate)
            }
        }
    }

    /// Called immediately, or by the timer armed from `start()`.
    pub fn start_capture_now(&mut self, now: Instant) -> Result<(), CoreError> {
        self.status = CaptureStatus::InProgress;
        self.start_time = Some(now);
        if let Err(e) = self.session.capture_output(self.overlay_cursor) {
            self.status = CaptureStatus::Fatal;
            return Err(e);
        }
        Ok(())
    }

    /// `buffer(format, w, h, stride)` event: (re)create the pool if the
    /// geometry changed, then request the damage-reporting copy.
    pub fn buffer(&mut self, geometry: BufferGeometry) -> Result<(), CoreError> {
        let needs_new_pool = match &self.pool {
            Some(pool) => pool.geometry != geometry,
            None => true,
        };

        if needs_new_pool {
            let size = geometry.stride as usize * geometry.height as usize;
            let fd = shm::allocate(size).map_err(|e| {
                self.status = CaptureStatus::Fatal;
                e
            })?;
            self.pool = Some(Pool { fd, geometry });
            debug!(?geometry, "recreated SHM pool for new geometry");
        }

        let pool_fd = &self.pool.as_ref().unwrap().fd;
        if let Err(e) = self.session.copy_with_damage(geometry, pool_fd) {
            self.status = CaptureStatus::Fatal;
            return Err(e);
        }
        Ok(())
    }

    /// `damage(x, y, w, h)` event: record the compositor's best-effort
    /// damage hint.
    pub fn damage(&mut self, rect: Rect) {
        self.damage_hint = Some(rect);
    }

    /// `ready()` event: stop the retry timer (implicit — caller owns
    /// timers), sample elapsed time, update the smoother, transition to
    /// DONE, and return the frame for the `on_done` continuation.
    pub fn ready(&mut self, now: Instant, pixels: Vec<u8>) -> CapturedFrame {
        let geometry = self
            .pool
            .as_ref()
            .map(|p| p.geometry)
            .expect("ready() without a negotiated pool");

        if let Some(start) = self.start_time {
            let dt = now.saturating_duration_since(start).as_secs_f64();
            self.smoother.update(dt, dt.max(1e-6));
        }
        self.last_done = Some(now);
        self.status = CaptureStatus::Done;

        CapturedFrame {
            width: geometry.width,
            height: geometry.height,
            format: fourcc_from_wl_shm_format(geometry.format),
            payload: FramePayload::Shm {
                pixels,
                stride: geometry.stride,
            },
            damage_hint: self.damage_hint.take(),
        }
    }

    /// `failed()` event: transient failure, retry allowed next tick.
    pub fn failed(&mut self) {
        warn!("screencopy frame failed");
        self.status = CaptureStatus::Failed;
    }

    pub fn delay(&self) -> f64 {
        self.smoother.value()
    }

    /// Geometry of the currently pooled buffer, if any has been negotiated.
    pub fn geometry(&self) -> Option<BufferGeometry> {
        self.pool.as_ref().map(|p| p.geometry)
    }

    /// Maps the pooled SHM buffer read-only and copies its bytes out. Called
    /// once the compositor's `ready()` event confirms the copy landed, so the
    /// caller can hand owned pixels to `ready()` without the frame's
    /// lifetime depending on the pool's.
    pub fn read_pool_pixels(&self) -> Result<Vec<u8>, CoreError> {
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| CoreError::RenderFailure("read_pool_pixels() before buffer()".into()))?;
        let mmap = unsafe { memmap2::Mmap::map(&pool.fd) }
            .map_err(|e| CoreError::AllocationFailure(format!("mmap pool for readback: {e}")))?;
        let len = pool.geometry.stride as usize * pool.geometry.height as usize;
        Ok(mmap[..len.min(mmap.len())].to_vec())
    }
}

/// `wl_shm::Format` and `drm_fourcc::DrmFourcc` agree numerically for every
/// code except the two wl_shm gives special-cased values (`Argb8888` = 0,
/// `Xrgb8888` = 1); everything else is passed through unchanged on the
/// assumption the numeric values coincide, falling back to XRGB8888 with a
/// warning for anything `drm-fourcc` doesn't recognise at all.
fn fourcc_from_wl_shm_format(format: u32) -> drm_fourcc::DrmFourcc {
    match format {
        0 => drm_fourcc::DrmFourcc::Argb8888,
        1 => drm_fourcc::DrmFourcc::Xrgb8888,
        other => drm_fourcc::DrmFourcc::try_from(other).unwrap_or_else(|_| {
            warn!(format = other, "unrecognised wl_shm format, defaulting to XRGB8888");
            drm_fourcc::DrmFourcc::Xrgb8888
        }),
    }
}

impl<S: ScreencopySession> FrameCaptureBackend for ShmBackend<S> {
    fn status(&self) -> CaptureStatus {
        self.status
    }

    fn stop(&mut self) {
        self.session.destroy();
        if self.status == CaptureStatus::InProgress {
            self.status = CaptureStatus::Stopped;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default, Clone)]
    struct MockSession {
        calls: Rc<RefCell<Vec<&'static str>>>,
        refuse: bool,
    }

    impl ScreencopySession for MockSession {
        fn capture_output(&mut self, _overlay_cursor: bool) -> Result<(), CoreError> {
            self.calls.borrow_mut().push("capture_output");
            if self.refuse {
                return Err(CoreError::CompositorRefused("no object".into()));
            }
            Ok(())
        }

        fn copy_with_damage(&mut self, _g: BufferGeometry, _pool_fd: &OwnedFd) -> Result<(), CoreError> {
            self.calls.borrow_mut().push("copy_with_damage");
            Ok(())
        }

        fn destroy(&mut self) {
            self.calls.borrow_mut().push("destroy");
        }
    }

    fn geometry() -> BufferGeometry {
        BufferGeometry {
            width: 1920,
            height: 1080,
            stride: 1920 * 4,
            format: 0,
        }
    }

    #[test]
    fn first_start_dispatches_immediately() {
        let mut backend = ShmBackend::new(MockSession::default(), RATE_LIMIT_HZ, 0.5, false);
        let outcome = backend.start(Instant::now()).unwrap();
        assert_eq!(outcome, StartOutcome::Immediate);
        assert_eq!(backend.status(), CaptureStatus::InProgress);
    }

    #[test]
    fn start_while_in_progress_fails_fast() {
        let mut backend = ShmBackend::new(MockSession::default(), RATE_LIMIT_HZ, 0.5, false);
        backend.start(Instant::now()).unwrap();
        let err = backend.start(Instant::now()).unwrap_err();
        assert!(matches!(err, CoreError::CaptureFailed(_)));
    }

    #[test]
    fn rate_limit_bypass_when_previous_frame_is_old_enough() {
        // scenario 2: previous frame done 80ms ago at 20Hz (period 50ms).
        let mut backend = ShmBackend::new(MockSession::default(), RATE_LIMIT_HZ, 0.5, false);
        let t0 = Instant::now();
        backend.last_done = Some(t0);
        let now = t0 + Duration::from_millis(80);
        let outcome = backend.start(now).unwrap();
        assert_eq!(outcome, StartOutcome::Immediate);
    }

    #[test]
    fn rate_limit_arms_timer_when_too_soon() {
        let mut backend = ShmBackend::new(MockSession::default(), RATE_LIMIT_HZ, 0.5, false);
        let t0 = Instant::now();
        backend.last_done = Some(t0);
        let now = t0 + Duration::from_millis(10);
        let outcome = backend.start(now).unwrap();
        match outcome {
            StartOutcome::ArmTimer(d) => assert!(d <= Duration::from_millis(40)),
            StartOutcome::Immediate => panic!("expected a timer to be armed"),
        }
    }

    #[test]
    fn buffer_allocates_pool_once_for_stable_geometry() {
        let mut backend = ShmBackend::new(MockSession::default(), RATE_LIMIT_HZ, 0.5, false);
        backend.start(Instant::now()).unwrap();
        backend.buffer(geometry()).unwrap();
        assert!(backend.pool.is_some());
        let fd_before = backend.pool.as_ref().unwrap().fd.as_raw_fd_for_test();
        backend.buffer(geometry()).unwrap();
        let fd_after = backend.pool.as_ref().unwrap().fd.as_raw_fd_for_test();
        assert_eq!(fd_before, fd_after, "same geometry must not reallocate the pool");
    }

    #[test]
    fn buffer_reallocates_pool_on_geometry_change() {
        let mut backend = ShmBackend::new(MockSession::default(), RATE_LIMIT_HZ, 0.5, false);
        backend.start(Instant::now()).unwrap();
        backend.buffer(geometry()).unwrap();
        let mut g2 = geometry();
        g2.width = 1280;
        g2.stride = 1280 * 4;
        backend.buffer(g2).unwrap();
        assert_eq!(backend.pool.as_ref().unwrap().geometry, g2);
    }

    #[test]
    fn ready_transitions_to_done_and_updates_smoother() {
        let mut backend = ShmBackend::new(MockSession::default(), RATE_LIMIT_HZ, 0.5, false);
        let t0 = Instant::now();
        backend.start(t0).unwrap();
        backend.buffer(geometry()).unwrap();
        let frame = backend.ready(t0 + Duration::from_millis(60), vec![0u8; 16]);
        assert_eq!(backend.status(), CaptureStatus::Done);
        assert_eq!(frame.width, 1920);
        assert!(backend.delay() > 0.0);
    }

    #[test]
    fn ready_maps_the_negotiated_wl_shm_format_to_the_matching_fourcc() {
        let mut backend = ShmBackend::new(MockSession::default(), RATE_LIMIT_HZ, 0.5, false);
        let t0 = Instant::now();
        backend.start(t0).unwrap();
        let mut g = geometry();
        g.format = 1; // wl_shm::Format::Xrgb8888
        backend.buffer(g).unwrap();
        let frame = backend.ready(t0 + Duration::from_millis(10), vec![0u8; 16]);
        assert_eq!(frame.format, drm_fourcc::DrmFourcc::Xrgb8888);
    }

    #[test]
    fn fourcc_from_wl_shm_format_special_cases_argb_and_passes_through_the_rest() {
        assert_eq!(fourcc_from_wl_shm_format(0), drm_fourcc::DrmFourcc::Argb8888);
        assert_eq!(fourcc_from_wl_shm_format(1), drm_fourcc::DrmFourcc::Xrgb8888);
        assert_eq!(
            fourcc_from_wl_shm_format(drm_fourcc::DrmFourcc::Abgr8888 as u32),
            drm_fourcc::DrmFourcc::Abgr8888
        );
        assert_eq!(fourcc_from_wl_shm_format(0xffff_ffff), drm_fourcc::DrmFourcc::Xrgb8888);
    }

    #[test]
    fn failed_event_sets_failed_status() {
        let mut backend = ShmBackend::new(MockSession::default(), RATE_LIMIT_HZ, 0.5, false);
        backend.start(Instant::now()).unwrap();
        backend.failed();
        assert_eq!(backend.status(), CaptureStatus::Failed);
    }

    #[test]
    fn compositor_refusal_is_fatal() {
        let session = MockSession {
            refuse: true,
            ..Default::default()
        };
        let mut backend = ShmBackend::new(session, RATE_LIMIT_HZ, 0.5, false);
        assert!(backend.start(Instant::now()).is_err());
        assert_eq!(backend.status(), CaptureStatus::Fatal);
    }

    #[test]
    fn stop_destroys_outstanding_frame_and_is_idempotent() {
        let mut backend = ShmBackend::new(MockSession::default(), RATE_LIMIT_HZ, 0.5, false);
        backend.start(Instant::now()).unwrap();
        backend.stop();
        assert_eq!(backend.status(), CaptureStatus::Stopped);
        backend.stop();
        assert_eq!(backend.session.calls.borrow().iter().filter(|c| **c == "destroy").count(), 2);
    }

    trait RawFdForTest {
        fn as_raw_fd_for_test(&self) -> i32;
    }

    impl RawFdForTest for OwnedFd {
        fn as_raw_fd_for_test(&self) -> i32 {
            use std::os::fd::AsRawFd;
            self.as_raw_fd()
        }
    }
}
