//! Frame-capture pipeline: the SHM and DMA-BUF backends and the scheduler
//! that arbitrates between them.

pub mod dmabuf;
pub mod scheduler;
pub mod shm;

use std::os::fd::OwnedFd;
use std::time::Duration;

use crate::damage::Rect as DamageHint;

/// One plane of a DMA-BUF frame.
pub struct DmabufPlane {
    pub fd: OwnedFd,
    pub offset: u32,
    pub size: u32,
    pub pitch: u32,
    pub modifier: u64,
}

/// The value-typed record crossing the capture -> render boundary. Exactly
/// one of `pixels`/`planes` is populated.
pub enum FramePayload {
    Shm {
        pixels: Vec<u8>,
        stride: u32,
    },
    Dmabuf {
        planes: Vec<DmabufPlane>,
        modifier: u64,
    },
}

pub struct CapturedFrame {
    pub width: u32,
    pub height: u32,
    pub format: drm_fourcc::DrmFourcc,
    pub payload: FramePayload,
    pub damage_hint: Option<DamageHint>,
}

/// Tagged capture state shared by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStatus {
    Idle,
    InProgress,
    Stopped,
    Done,
    Failed,
    Fatal,
}

impl CaptureStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CaptureStatus::Stopped | CaptureStatus::Done | CaptureStatus::Failed | CaptureStatus::Fatal
        )
    }
}

/// What a backend's `start()` tells its caller to do next: dispatch the
/// compositor request right away, or arm a one-shot timer and call
/// `start_capture_now` when it fires, to honour the configured rate limit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StartOutcome {
    Immediate,
    ArmTimer(Duration),
}

/// Geometry negotiated for the pooled SHM buffer. The pool is recreated
/// whenever `(width, height, stride, format)` differs from what it was
/// built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferGeometry {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: u32,
}

/// Capability set every capture backend exposes to the scheduler: a
/// capability interface rather than a base-class cast, since the two
/// backends share no common representation beyond this.
pub trait FrameCaptureBackend {
    fn status(&self) -> CaptureStatus;
    fn stop(&mut self);
}
