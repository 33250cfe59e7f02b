//! Pointer passthrough: absolute motion, buttons, and scroll injected back
//! into the compositor session.
//!
//! Mirrors the keyboard injector's shape — a sink trait plus a thin
//! resolver from wire coordinates to output-local ones — rather than
//! inventing new machinery for what is otherwise the same kind of problem.

use tracing::trace;

/// The virtual-pointer protocol requests this module drives
/// (`zwlr_virtual_pointer_v1`). Implemented by the Wayland glue; recorded by
/// a mock in tests.
pub trait VirtualPointerSink {
    fn motion_absolute(&mut self, time_ms: u32, x: u32, y: u32, x_extent: u32, y_extent: u32);
    fn button(&mut self, time_ms: u32, button: PointerButton, pressed: bool);
    fn axis(&mut self, time_ms: u32, axis: ScrollAxis, value: f64);
    fn frame(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerButton {
    Left,
    Right,
    Middle,
}

impl PointerButton {
    /// Linux evdev button codes, the values `zwlr_virtual_pointer_v1.button`
    /// expects.
    pub fn evdev_code(self) -> u32 {
        match self {
            PointerButton::Left => 0x110,
            PointerButton::Right => 0x111,
            PointerButton::Middle => 0x112,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollAxis {
    Vertical,
    Horizontal,
}

pub struct PointerInjector<S: VirtualPointerSink> {
    sink: S,
    width: u32,
    height: u32,
    start: std::time::Instant,
}

impl<S: VirtualPointerSink> PointerInjector<S> {
    pub fn new(sink: S, width: u32, height: u32) -> Self {
        Self {
            sink,
            width,
            height,
            start: std::time::Instant::now(),
        }
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
    }

    fn time_ms(&self) -> u32 {
        self.start.elapsed().as_millis() as u32
    }

    /// `x`/`y` are wire-space logical coordinates from the RFB client,
    /// already clamped to `[0, width) x [0, height)` by the caller.
    pub fn motion(&mut self, x: u32, y: u32) {
        trace!(x, y, "pointer motion");
        let time = self.time_ms();
        self.sink.motion_absolute(time, x, y, self.width, self.height);
        self.sink.frame();
    }

    pub fn button(&mut self, button: PointerButton, pressed: bool) {
        trace!(?button, pressed, "pointer button");
        let time = self.time_ms();
        self.sink.button(time, button, pressed);
        self.sink.frame();
    }

    /// RFB button masks 3/4 (wheel up/down) and 5/6 (wheel left/right) are
    /// translated to discrete scroll steps; one "click" is 15 units on the
    /// wire, matching `wl_pointer.axis` convention the virtual-pointer
    /// protocol reuses.
    pub fn scroll(&mut self, axis: ScrollAxis, steps: i32) {
        if steps == 0 {
            return;
        }
        trace!(?axis, steps, "pointer scroll");
        let time = self.time_ms();
        self.sink.axis(time, axis, (steps as f64) * 15.0);
        self.sink.frame();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        calls: Vec<String>,
    }

    impl VirtualPointerSink for RecordingSink {
        fn motion_absolute(&mut self, _t: u32, x: u32, y: u32, xe: u32, ye: u32) {
            self.calls.push(format!("motion({x},{y},{xe},{ye})"));
        }
        fn button(&mut self, _t: u32, button: PointerButton, pressed: bool) {
            self.calls.push(format!("button({button:?},{pressed})"));
        }
        fn axis(&mut self, _t: u32, axis: ScrollAxis, value: f64) {
            self.calls.push(format!("axis({axis:?},{value})"));
        }
        fn frame(&mut self) {
            self.calls.push("frame".to_string());
        }
    }

    #[test]
    fn motion_emits_absolute_then_frame() {
        let mut inj = PointerInjector::new(RecordingSink::default(), 1920, 1080);
        inj.motion(100, 200);
        assert_eq!(inj.sink.calls, vec!["motion(100,200,1920,1080)", "frame"]);
    }

    #[test]
    fn resize_changes_subsequent_extents() {
        let mut inj = PointerInjector::new(RecordingSink::default(), 1920, 1080);
        inj.resize(1280, 720);
        inj.motion(10, 10);
        assert_eq!(inj.sink.calls[0], "motion(10,10,1280,720)");
    }

    #[test]
    fn zero_scroll_steps_emit_nothing() {
        let mut inj = PointerInjector::new(RecordingSink::default(), 1920, 1080);
        inj.scroll(ScrollAxis::Vertical, 0);
        assert!(inj.sink.calls.is_empty());
    }

    #[test]
    fn scroll_emits_axis_scaled_by_fifteen() {
        let mut inj = PointerInjector::new(RecordingSink::default(), 1920, 1080);
        inj.scroll(ScrollAxis::Vertical, 2);
        assert_eq!(inj.sink.calls[0], "axis(Vertical,30)");
    }
}
