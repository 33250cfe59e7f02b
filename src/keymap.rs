//! Keymap resolver.
//!
//! Builds a `(symbol, code, level)` lookup table once from the active
//! keymap and answers `find(symbol)` with the lowest-level (preferred) way
//! to type it. Also precomputes the modifier mask each `(code, level)` pair
//! requires, since the injector needs that on every `feed` call and
//! re-deriving it per call would mean re-scanning modifier combinations on
//! the hot path.

use std::collections::HashMap;
use std::os::fd::OwnedFd;

use xkbcommon::xkb;

use crate::error::{CoreError, CoreResult};
use crate::shm;

pub type Symbol = u32;
pub type KeyCode = u32;
pub type Level = u32;
pub type ModMask = u32;

/// One row of the resolver's lookup table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub symbol: Symbol,
    pub code: KeyCode,
    pub level: Level,
}

/// The serialized keymap text plus the shared-memory fd it was written
/// into, ready to hand to the virtual-keyboard sink's `keymap` request.
pub struct SerializedKeymap {
    pub fd: OwnedFd,
    pub size: usize,
}

pub struct KeymapResolver {
    keymap: xkb::Keymap,
    /// Sorted by (symbol ASC, level ASC); entries for the same symbol are
    /// contiguous with the lowest level first.
    table: Vec<Entry>,
    mods: HashMap<(KeyCode, Level), ModMask>,
}

impl KeymapResolver {
    pub fn new(layout: &str, variant: &str) -> CoreResult<Self> {
        let context = xkb::Context::new(xkb::CONTEXT_NO_FLAGS);
        let keymap = xkb::Keymap::new_from_names(
            &context,
            "evdev",
            "pc105",
            layout,
            variant,
            None,
            xkb::KEYMAP_COMPILE_NO_FLAGS,
        )
        .ok_or_else(|| {
            CoreError::CompositorRefused(format!(
                "failed to compile keymap for layout={layout:?} variant={variant:?}"
            ))
        })?;

        let mut state = xkb::State::new(&keymap);
        let mut table = Vec::new();
        let mut mods = HashMap::new();

        let min = keymap.min_keycode();
        let max = keymap.max_keycode();
        let num_mods = keymap.num_mods().min(10);

        for code in min..=max {
            let num_levels = keymap.num_levels_for_key(code, 0);
            for level in 0..num_levels {
                let syms = keymap.key_get_syms_by_level(code, 0, level);
                if syms.is_empty() {
                    continue;
                }
                let mask = find_mask_for_level(&mut state, &keymap, code, level, num_mods);
                mods.insert((code, level), mask);
                for sym in syms {
                    table.push(Entry {
                        symbol: sym.raw(),
                        code,
                        level,
                    });
                }
            }
        }

        table.sort_by(|a, b| a.symbol.cmp(&b.symbol).then(a.level.cmp(&b.level)));

        Ok(Self {
            keymap,
            table,
            mods,
        })
    }

    /// Binary-searches for `symbol`, then walks left while the predecessor
    /// shares the symbol, so the first match returned is the lowest-level
    /// (preferred) entry.
    pub fn find(&self, symbol: Symbol) -> Option<Entry> {
        let idx = self
            .table
            .binary_search_by(|e| e.symbol.cmp(&symbol))
            .ok()?;
        let mut first = idx;
        while first > 0 && self.table[first - 1].symbol == symbol {
            first -= 1;
        }
        Some(self.table[first])
    }

    pub fn mods_for(&self, code: KeyCode, level: Level) -> ModMask {
        self.mods.get(&(code, level)).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Serialises the keymap into the text format the virtual-keyboard
    /// sink expects and writes it into a fresh shared-memory segment so the
    /// compositor's key-code numbering matches ours.
    pub fn serialize(&self) -> CoreResult<SerializedKeymap> {
        let text = self.keymap.get_as_string(xkb::KEYMAP_FORMAT_TEXT_V1);
        let bytes = text.as_bytes();
        // `virtual_keyboard_v1.keymap` wants a NUL-terminated string.
        let size = bytes.len() + 1;
        let fd = shm::allocate(size)?;
        {
            let mut mmap = unsafe { memmap2::MmapMut::map_mut(&fd) }
                .map_err(|e| CoreError::AllocationFailure(format!("mmap keymap segment: {e}")))?;
            mmap[..bytes.len()].copy_from_slice(bytes);
            mmap[bytes.len()] = 0;
        }
        Ok(SerializedKeymap { fd, size })
    }
}

fn find_mask_for_level(
    state: &mut xkb::State,
    keymap: &xkb::Keymap,
    code: KeyCode,
    level: Level,
    num_mods: xkb::ModIndex,
) -> ModMask {
    let combos = 1u32 << num_mods;
    for mask in 0..combos {
        state.update_mask(mask, 0, 0, 0, 0, 0);
        if state.key_get_level(code, 0) == level {
            return mask;
        }
    }
    let _ = keymap;
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_sorted_by_symbol_then_level() {
        let resolver = KeymapResolver::new("us", "").expect("compile us keymap");
        assert!(!resolver.is_empty());
        for pair in resolver.table.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            assert!(
                a.symbol < b.symbol || (a.symbol == b.symbol && a.level <= b.level),
                "table out of order at {a:?} -> {b:?}"
            );
        }
    }

    #[test]
    fn find_returns_lowest_level_entry_for_symbol() {
        let resolver = KeymapResolver::new("us", "").expect("compile us keymap");
        // 'a' lowercase is keysym 0x61, shares a key with uppercase 'A' at
        // the next level; find() must prefer the lower level.
        let entry = resolver.find(0x61).expect("lowercase a should resolve");
        assert_eq!(entry.symbol, 0x61);
        if let Some(other) = resolver
            .table
            .iter()
            .filter(|e| e.symbol == 0x61)
            .map(|e| e.level)
            .min()
        {
            assert_eq!(entry.level, other);
        }
    }

    #[test]
    fn unknown_symbol_returns_none() {
        let resolver = KeymapResolver::new("us", "").expect("compile us keymap");
        assert!(resolver.find(0xFFFF_FFF0).is_none());
    }

    #[test]
    fn serialize_round_trips_through_text_format() {
        let resolver = KeymapResolver::new("us", "").expect("compile us keymap");
        let serialized = resolver.serialize().expect("serialize");
        let mmap = unsafe { memmap2::Mmap::map(&serialized.fd) }.expect("mmap");
        let text = std::str::from_utf8(&mmap[..serialized.size - 1]).expect("utf8");

        let context = xkb::Context::new(xkb::CONTEXT_NO_FLAGS);
        let reparsed = xkb::Keymap::new_from_string(
            &context,
            text.to_string(),
            xkb::KEYMAP_FORMAT_TEXT_V1,
            xkb::KEYMAP_COMPILE_NO_FLAGS,
        )
        .expect("reparse serialized keymap");

        assert_eq!(reparsed.min_keycode(), resolver.keymap.min_keycode());
        assert_eq!(reparsed.max_keycode(), resolver.keymap.max_keycode());
    }
}
