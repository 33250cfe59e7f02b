//! `VirtualKeyboardSink`/`VirtualPointerSink` implementations over the real
//! `zwp-virtual-keyboard`/`zwlr-virtual-pointer` protocol objects. These
//! protocols are
//! request-only from the client's point of view (no events to dispatch),
//! so unlike the capture sessions there is no matching `Dispatch` impl
//! needed on `App`.

use wayland_client::protocol::wl_keyboard::KeyState;
use wayland_client::protocol::wl_pointer::ButtonState;
use wayland_protocols_misc::zwp_virtual_keyboard_v1::client::zwp_virtual_keyboard_v1::ZwpVirtualKeyboardV1;
use wayland_protocols_wlr::virtual_pointer::v1::client::zwlr_virtual_pointer_v1::ZwlrVirtualPointerV1;

use crate::keyboard::VirtualKeyboardSink;
use crate::pointer::{PointerButton, ScrollAxis, VirtualPointerSink};

pub struct WlVirtualKeyboard {
    proxy: ZwpVirtualKeyboardV1,
}

impl WlVirtualKeyboard {
    pub fn new(proxy: ZwpVirtualKeyboardV1) -> Self {
        Self { proxy }
    }

    /// Hands the serialized keymap fd to the compositor once at startup so
    /// its key-code numbering matches ours.
    pub fn set_keymap(&self, fd: &std::os::fd::OwnedFd, size: u32) {
        use std::os::fd::AsFd;
        const WL_KEYBOARD_KEYMAP_FORMAT_XKB_V1: u32 = 1;
        self.proxy.keymap(WL_KEYBOARD_KEYMAP_FORMAT_XKB_V1, fd.as_fd(), size);
    }
}

impl VirtualKeyboardSink for WlVirtualKeyboard {
    fn modifiers(&mut self, depressed: u32, latched: u32, locked: u32, group: u32) {
        self.proxy.modifiers(depressed, latched, locked, group);
    }

    fn key(&mut self, time_ms: u32, code: u32, pressed: bool) {
        let state = if pressed { KeyState::Pressed } else { KeyState::Released };
        self.proxy.key(time_ms, code, state);
    }
}

pub struct WlVirtualPointer {
    proxy: ZwlrVirtualPointerV1,
}

impl WlVirtualPointer {
    pub fn new(proxy: ZwlrVirtualPointerV1) -> Self {
        Self { proxy }
    }
}

impl VirtualPointerSink for WlVirtualPointer {
    fn motion_absolute(&mut self, time_ms: u32, x: u32, y: u32, x_extent: u32, y_extent: u32) {
        self.proxy.motion_absolute(time_ms, x, y, x_extent, y_extent);
    }

    fn button(&mut self, time_ms: u32, button: PointerButton, pressed: bool) {
        let state = if pressed { ButtonState::Pressed } else { ButtonState::Released };
        self.proxy.button(time_ms, button.evdev_code(), state);
    }

    fn axis(&mut self, time_ms: u32, axis: ScrollAxis, value: f64) {
        let wl_axis = match axis {
            ScrollAxis::Vertical => 0,
            ScrollAxis::Horizontal => 1,
        };
        self.proxy.axis(time_ms, wl_axis, value);
    }

    fn frame(&mut self) {
        self.proxy.frame();
    }
}
