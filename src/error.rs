use thiserror::Error;

/// Error kinds at the core boundary. Each variant is fatal or transient
/// exactly as documented on it; callers that need to distinguish should
/// match rather than stringify.
#[derive(Debug, Error)]
pub enum CoreError {
    /// SHM/mmap/pool creation failed. Fatal for the SHM backend.
    #[error("shared memory allocation failed: {0}")]
    AllocationFailure(String),

    /// A request returned no object (e.g. `capture_output` returned null).
    /// Fatal for that backend; the scheduler may retry with the other one.
    #[error("compositor refused request: {0}")]
    CompositorRefused(String),

    /// Transient per-frame failure (`failed` / non-permanent `cancel`).
    /// Recovered by the next scheduler tick.
    #[error("capture failed (transient): {0}")]
    CaptureFailed(String),

    /// Permanent failure (`PERMANENT` cancel, buffer init failure). The
    /// scheduler should switch backends or give up on this one.
    #[error("capture fatal: {0}")]
    CaptureFatal(String),

    /// No entry in the keymap lookup table for the requested symbol.
    /// Recovered locally by the injector (logged and dropped).
    #[error("no keymap entry for symbol {0:#x}")]
    UnknownSymbol(u32),

    /// Shader compile, EGL image creation, or readback error. Fatal at
    /// startup; per-frame occurrences drop the frame and surface a warning.
    #[error("render failure: {0}")]
    RenderFailure(String),

    #[error("wayland protocol error: {0}")]
    WaylandProtocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
