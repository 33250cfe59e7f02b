//! Keyboard injector.
//!
//! Tracks which key codes are currently pressed and replays a remote key
//! symbol through the virtual-keyboard sink: a modifier event followed by a
//! key event, idempotent on duplicate press/release.

use std::time::Instant;

use tracing::{debug, warn};

use crate::keymap::{KeyCode, KeymapResolver, ModMask, Symbol};
use crate::keyset::KeyStateSet;

/// The virtual-keyboard protocol requests the injector drives. Implemented
/// over `zwp_virtual_keyboard_v1` by the Wayland glue; a recording mock is
/// used in tests.
pub trait VirtualKeyboardSink {
    fn modifiers(&mut self, depressed: u32, latched: u32, locked: u32, group: u32);
    fn key(&mut self, time_ms: u32, code: u32, pressed: bool);
}

pub struct KeyboardInjector<S: VirtualKeyboardSink> {
    resolver: KeymapResolver,
    sink: S,
    keystate: KeyStateSet,
    start: Instant,
}

impl<S: VirtualKeyboardSink> KeyboardInjector<S> {
    pub fn new(resolver: KeymapResolver, sink: S) -> Self {
        Self {
            resolver,
            sink,
            keystate: KeyStateSet::new(),
            start: Instant::now(),
        }
    }

    /// The protocol's key-code numbering is keymap-keycode minus 8; this
    /// offset is specified by the virtual-keyboard/xkb wire format and must
    /// be preserved exactly.
    const WIRE_CODE_OFFSET: KeyCode = 8;

    pub fn feed(&mut self, symbol: Symbol, pressed: bool) {
        let Some(entry) = self.resolver.find(symbol) else {
            warn!(symbol = format!("{symbol:#x}"), "no keymap entry for symbol, dropping");
            return;
        };

        let mods: ModMask = self.resolver.mods_for(entry.code, entry.level);

        let already_pressed = self.keystate.contains(entry.code);
        if pressed == already_pressed {
            debug!(
                code = entry.code,
                pressed, "duplicate press/release, ignoring"
            );
            return;
        }

        if pressed {
            self.keystate.insert(entry.code);
        } else {
            self.keystate.remove(entry.code);
        }

        // Modifier event MUST precede the key event within one feed() call.
        self.sink.modifiers(0, mods, 0, 0);

        let wire_code = entry.code.saturating_sub(Self::WIRE_CODE_OFFSET);
        let time_ms = self.start.elapsed().as_millis() as u32;
        self.sink.key(time_ms, wire_code, pressed);
    }

    pub fn is_pressed(&self, code: KeyCode) -> bool {
        self.keystate.contains(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keymap::KeymapResolver;

    #[derive(Default)]
    struct RecordingSink {
        calls: Vec<Call>,
    }

    #[derive(Debug, PartialEq, Eq)]
    enum Call {
        Modifiers(u32, u32, u32, u32),
        Key(u32, bool),
    }

    impl VirtualKeyboardSink for RecordingSink {
        fn modifiers(&mut self, depressed: u32, latched: u32, locked: u32, group: u32) {
            self.calls.push(Call::Modifiers(depressed, latched, locked, group));
        }

        fn key(&mut self, _time_ms: u32, code: u32, pressed: bool) {
            self.calls.push(Call::Key(code, pressed));
        }
    }

    fn injector() -> KeyboardInjector<RecordingSink> {
        let resolver = KeymapResolver::new("us", "").expect("compile us keymap");
        KeyboardInjector::new(resolver, RecordingSink::default())
    }

    #[test]
    fn duplicate_press_emits_exactly_one_key_event() {
        let mut inj = injector();
        inj.feed(0x61, true); // 'a'
        inj.feed(0x61, true);
        let key_presses = inj
            .sink
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Key(_, true)))
            .count();
        assert_eq!(key_presses, 1);
    }

    #[test]
    fn press_then_release_clears_keystate() {
        let mut inj = injector();
        inj.feed(0x61, true);
        let entry = inj.resolver.find(0x61).unwrap();
        assert!(inj.is_pressed(entry.code));
        inj.feed(0x61, false);
        assert!(!inj.is_pressed(entry.code));
    }

    #[test]
    fn idempotent_release_without_prior_press_emits_nothing() {
        let mut inj = injector();
        inj.feed(0x61, false);
        assert!(inj.sink.calls.is_empty());
    }

    #[test]
    fn modifier_event_precedes_key_event() {
        let mut inj = injector();
        // Uppercase 'A' requires a Shift latch on a US layout.
        inj.feed(0x41, true);
        assert!(matches!(inj.sink.calls[0], Call::Modifiers(..)));
        assert!(matches!(inj.sink.calls[1], Call::Key(_, true)));
    }

    #[test]
    fn wire_code_is_keymap_code_minus_eight() {
        let mut inj = injector();
        inj.feed(0x61, true);
        let entry = inj.resolver.find(0x61).unwrap();
        let Call::Key(wire_code, true) = inj.sink.calls[1] else {
            panic!("expected key event");
        };
        assert_eq!(wire_code, entry.code - 8);
    }

    #[test]
    fn unknown_symbol_is_dropped_without_touching_sink() {
        let mut inj = injector();
        inj.feed(0xFFFF_FFF0, true);
        assert!(inj.sink.calls.is_empty());
    }
}
