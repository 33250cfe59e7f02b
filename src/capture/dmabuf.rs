//! DMA-BUF capture backend driving the export-dmabuf protocol. Pixel data
//! is never copied into host memory; the
//! compositor hands over per-plane fds plus modifier/offset/pitch, owned by
//! this backend until the renderer creates an EGL image over them.
//!
//! ```text
//! IDLE --start--> AWAITING_FRAME
//!                    +-frame(start)--> COLLECTING_OBJECTS
//!                    |                    +-object()--> COLLECTING_OBJECTS
//!                    |                    +-ready()--> DONE
//!                    +-cancel(reason)--> {FAILED, FATAL}
//!                    +-stop()--> STOPPED
//! ```

use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::CoreError;

use super::{CaptureStatus, CapturedFrame, DmabufPlane, FrameCaptureBackend, FramePayload, StartOutcome};

/// Reason a `cancel` event carries (export-dmabuf-unstable-v1 `cancel_reason`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Permanent,
    Temporary,
    Resizing,
}

impl CancelReason {
    fn is_permanent(self) -> bool {
        matches!(self, CancelReason::Permanent)
    }
}

/// Requests the backend issues against the compositor's export-dmabuf
/// objects.
pub trait DmabufSession {
    /// `capture_output`; returns `Err` if the compositor refused to hand
    /// back a frame object at all.
    fn capture_output(&mut self) -> Result<(), CoreError>;
    fn destroy(&mut self);
}

pub struct DmabufBackend<S: DmabufSession> {
    session: S,
    status: CaptureStatus,
    width: u32,
    height: u32,
    format: drm_fourcc::DrmFourcc,
    modifier: u64,
    planes: Vec<DmabufPlane>,
    rate_limit_hz: f64,
    last_done: Option<Instant>,
}

impl<S: DmabufSession> DmabufBackend<S> {
    pub fn new(session: S, rate_limit_hz: f64) -> Self {
        Self {
            session,
            status: CaptureStatus::Idle,
            width: 0,
            height: 0,
            format: drm_fourcc::DrmFourcc::Xrgb8888,
            modifier: 0,
            planes: Vec::new(),
            rate_limit_hz,
            last_done: None,
        }
    }

    pub fn start(&mut self, now: Instant) -> Result<StartOutcome, CoreError> {
        if self.status == CaptureStatus::InProgress {
            return Err(CoreError::CaptureFailed(
                "start() called while a capture is already in progress".into(),
            ));
        }

        let outcome = match self.last_done {
            None => StartOutcome::Immediate,
            Some(last_done) => {
                let period = Duration::from_secs_f64(1.0 / self.rate_limit_hz);
                let elapsed = now.saturating_duration_since(last_done);
                if elapsed >= period {
                    StartOutcome::Immediate
                } else {
                    StartOutcome::ArmTimer(period - elapsed)
                }
            }
        };

        if outcome == StartOutcome::Immediate {
            self.start_capture_now()?;
        }
        Ok(outcome)
    }

    pub fn start_capture_now(&mut self) -> Result<(), CoreError> {
        self.status = CaptureStatus::InProgress;
        self.planes.clear();
        if let Err(e) = self.session.capture_output() {
            self.status = CaptureStatus::Fatal;
            return Err(e);
        }
        Ok(())
    }

    /// `frame(start)` event: geometry/format for the frame about to be
    /// described by a sequence of `object()` events.
    pub fn frame(&mut self, width: u32, height: u32, format: drm_fourcc::DrmFourcc, modifier: u64) {
        self.width = width;
        self.height = height;
        self.format = format;
        self.modifier = modifier;
    }

    /// `object()` event: one plane's fd/offset/size/pitch. The backend owns
    /// the fd from this point. The wire protocol carries the modifier once,
    /// on the preceding `frame()` event, not per object; stamp it onto the
    /// plane here so every plane the renderer later sees carries the real
    /// value instead of whatever the caller happened to pass in.
    pub fn object(&mut self, mut plane: DmabufPlane) {
        plane.modifier = self.modifier;
        self.planes.push(plane);
    }

    /// `ready()` event. If the rate-limit deadline has not been reached a
    /// timer is armed before `on_done` fires; otherwise it fires
    /// immediately. The deadline is measured from the previous
    /// completed capture, same cadence as the SHM backend's rate limiter.
    pub fn ready(&mut self, now: Instant) -> (StartOutcome, CapturedFrame) {
        let deadline_outcome = match self.last_done {
            None => StartOutcome::Immediate,
            Some(last_done) => {
                let period = Duration::from_secs_f64(1.0 / self.rate_limit_hz);
                let deadline = last_done + period;
                if now >= deadline {
                    StartOutcome::Immediate
                } else {
                    StartOutcome::ArmTimer(deadline - now)
                }
            }
        };

        self.last_done = Some(now);
        self.status = CaptureStatus::Done;

        let frame = CapturedFrame {
            width: self.width,
            height: self.height,
            format: self.format,
            payload: FramePayload::Dmabuf {
                planes: std::mem::take(&mut self.planes),
                modifier: self.modifier,
            },
            damage_hint: None,
        };

        (deadline_outcome, frame)
    }

    /// `cancel(reason)` event. `PERMANENT` maps to `FATAL` (caller should
    /// fall back to SHM or give up on dmabuf for this output); any other
    /// reason maps to `FAILED` (retry allowed). Always releases any
    /// outstanding plane fds exactly once.
    pub fn cancel(&mut self, reason: CancelReason) {
        warn!(?reason, "export-dmabuf frame cancelled");
        self.planes.clear();
        self.status = if reason.is_permanent() {
            CaptureStatus::Fatal
        } else {
            CaptureStatus::Failed
        };
    }
}

impl<S: DmabufSession> FrameCaptureBackend for DmabufBackend<S> {
    fn status(&self) -> CaptureStatus {
        self.status
    }

    fn stop(&mut self) {
        self.planes.clear();
        self.session.destroy();
        if self.status == CaptureStatus::InProgress {
            self.status = CaptureStatus::Stopped;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::OwnedFd;

    #[derive(Default)]
    struct MockSession {
        destroyed: u32,
        refuse: bool,
    }

    impl DmabufSession for MockSession {
        fn capture_output(&mut self) -> Result<(), CoreError> {
            if self.refuse {
                return Err(CoreError::CompositorRefused("no object".into()));
            }
            Ok(())
        }

        fn destroy(&mut self) {
            self.destroyed += 1;
        }
    }

    fn dummy_plane() -> DmabufPlane {
        // /dev/null is always openable and gives us a real fd to move
        // around without pulling in more test scaffolding.
        let file = std::fs::File::open("/dev/null").unwrap();
        DmabufPlane {
            fd: OwnedFd::from(file),
            offset: 0,
            size: 4096,
            pitch: 256,
            modifier: 0,
        }
    }

    #[test]
    fn permanent_cancel_is_fatal_and_clears_planes() {
        let mut backend = DmabufBackend::new(MockSession::default(), 20.0);
        backend.start(Instant::now()).unwrap();
        backend.frame(1920, 1080, drm_fourcc::DrmFourcc::Argb8888, 0);
        backend.object(dummy_plane());
        backend.cancel(CancelReason::Permanent);
        assert_eq!(backend.status(), CaptureStatus::Fatal);
        assert!(backend.planes.is_empty());
    }

    #[test]
    fn temporary_cancel_allows_retry() {
        let mut backend = DmabufBackend::new(MockSession::default(), 20.0);
        backend.start(Instant::now()).unwrap();
        backend.cancel(CancelReason::Temporary);
        assert_eq!(backend.status(), CaptureStatus::Failed);
    }

    #[test]
    fn ready_hands_over_all_collected_planes() {
        let mut backend = DmabufBackend::new(MockSession::default(), 20.0);
        backend.start(Instant::now()).unwrap();
        backend.frame(1920, 1080, drm_fourcc::DrmFourcc::Argb8888, 0);
        backend.object(dummy_plane());
        backend.object(dummy_plane());
        let (_, frame) = backend.ready(Instant::now());
        match frame.payload {
            FramePayload::Dmabuf { planes, .. } => assert_eq!(planes.len(), 2),
            _ => panic!("expected dmabuf payload"),
        }
        assert_eq!(backend.status(), CaptureStatus::Done);
    }

    #[test]
    fn compositor_refusal_is_fatal() {
        let session = MockSession {
            refuse: true,
            ..Default::default()
        };
        let mut backend = DmabufBackend::new(session, 20.0);
        assert!(backend.start(Instant::now()).is_err());
        assert_eq!(backend.status(), CaptureStatus::Fatal);
    }

    #[test]
    fn stop_closes_fds_exactly_once_via_destroy() {
        let mut backend = DmabufBackend::new(MockSession::default(), 20.0);
        backend.start(Instant::now()).unwrap();
        backend.object(dummy_plane());
        backend.stop();
        assert!(backend.planes.is_empty());
        assert_eq!(backend.session.destroyed, 1);
        backend.stop();
        assert_eq!(backend.session.destroyed, 2);
    }

    #[test]
    fn start_while_in_progress_fails_fast() {
        let mut backend = DmabufBackend::new(MockSession::default(), 20.0);
        backend.start(Instant::now()).unwrap();
        assert!(backend.start(Instant::now()).is_err());
    }

    #[test]
    fn ready_arms_timer_when_deadline_not_yet_reached() {
        let mut backend = DmabufBackend::new(MockSession::default(), 20.0);
        let t0 = Instant::now();
        backend.last_done = Some(t0);
        backend.start_capture_now().unwrap();
        backend.frame(1920, 1080, drm_fourcc::DrmFourcc::Argb8888, 0);
        let (outcome, _) = backend.ready(t0 + Duration::from_millis(10));
        assert!(matches!(outcome, StartOutcome::ArmTimer(_)));
    }

    #[test]
    fn ready_fires_immediately_once_deadline_passed() {
        let mut backend = DmabufBackend::new(MockSession::default(), 20.0);
        let t0 = Instant::now();
        backend.last_done = Some(t0);
        backend.start_capture_now().unwrap();
        backend.frame(1920, 1080, drm_fourcc::DrmFourcc::Argb8888, 0);
        let (outcome, _) = backend.ready(t0 + Duration::from_millis(80));
        assert_eq!(outcome, StartOutcome::Immediate);
    }
}
