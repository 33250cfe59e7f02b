//! RFB 3.8 wire constants and message framing.
//!
//! Only the subset of the protocol the bridge actually speaks: Raw encoding,
//! one security type, and the five client-to-server message types. Everything
//! here is pure parsing/serialisation with no I/O of its own, so it is
//! unit-testable without a socket.

pub const PROTOCOL_VERSION: &[u8; 12] = b"RFB 003.008\n";

pub const SECURITY_TYPE_NONE: u8 = 1;
pub const SECURITY_TYPE_VNC_AUTH: u8 = 2;

pub const SECURITY_RESULT_OK: u32 = 0;
pub const SECURITY_RESULT_FAILED: u32 = 1;

pub const ENCODING_RAW: i32 = 0;

mod client_message_type {
    pub const SET_PIXEL_FORMAT: u8 = 0;
    pub const SET_ENCODINGS: u8 = 2;
    pub const FRAMEBUFFER_UPDATE_REQUEST: u8 = 3;
    pub const KEY_EVENT: u8 = 4;
    pub const POINTER_EVENT: u8 = 5;
    pub const CLIENT_CUT_TEXT: u8 = 6;
}

pub const SERVER_MESSAGE_FRAMEBUFFER_UPDATE: u8 = 0;

/// `PIXEL_FORMAT` as sent in `ServerInit`/`SetPixelFormat` (16 bytes on the
/// wire). The bridge always serves in its own fixed format (32bpp, true
/// colour, matching the renderer's RGBA8 working texture) regardless of what
/// a client requests via `SetPixelFormat` — format negotiation is scope the
/// Non-goals leave closed (see `SetPixelFormat` handling in `server.rs`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelFormat {
    pub bits_per_pixel: u8,
    pub depth: u8,
    pub big_endian: bool,
    pub true_color: bool,
    pub red_max: u16,
    pub green_max: u16,
    pub blue_max: u16,
    pub red_shift: u8,
    pub green_shift: u8,
    pub blue_shift: u8,
}

impl PixelFormat {
    /// The format the bridge serves: 32bpp RGBA8, little-endian, matching
    /// `GpuRenderer::copy_pixels`'s native readback layout.
    pub const RGBA8: PixelFormat = PixelFormat {
        bits_per_pixel: 32,
        depth: 24,
        big_endian: false,
        true_color: true,
        red_max: 255,
        green_max: 255,
        blue_max: 255,
        red_shift: 0,
        green_shift: 8,
        blue_shift: 16,
    };

    pub fn to_bytes(self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[0] = self.bits_per_pixel;
        buf[1] = self.depth;
        buf[2] = self.big_endian as u8;
        buf[3] = self.true_color as u8;
        buf[4..6].copy_from_slice(&self.red_max.to_be_bytes());
        buf[6..8].copy_from_slice(&self.green_max.to_be_bytes());
        buf[8..10].copy_from_slice(&self.blue_max.to_be_bytes());
        buf[10] = self.red_shift;
        buf[11] = self.green_shift;
        buf[12] = self.blue_shift;
        // buf[13..16] is padding.
        buf
    }

    pub fn from_bytes(buf: &[u8; 16]) -> Self {
        PixelFormat {
            bits_per_pixel: buf[0],
            depth: buf[1],
            big_endian: buf[2] != 0,
            true_color: buf[3] != 0,
            red_max: u16::from_be_bytes([buf[4], buf[5]]),
            green_max: u16::from_be_bytes([buf[6], buf[7]]),
            blue_max: u16::from_be_bytes([buf[8], buf[9]]),
            red_shift: buf[10],
            green_shift: buf[11],
            blue_shift: buf[12],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    SetPixelFormat(PixelFormat),
    SetEncodings(Vec<i32>),
    FramebufferUpdateRequest {
        incremental: bool,
        x: u16,
        y: u16,
        width: u16,
        height: u16,
    },
    KeyEvent {
        down: bool,
        keysym: u32,
    },
    PointerEvent {
        button_mask: u8,
        x: u16,
        y: u16,
    },
    ClientCutText,
}

/// Attempts to parse one complete message from the front of `buf`. Returns
/// `None` (leaving `buf` untouched) when fewer bytes than the message needs
/// have arrived yet — the caller re-polls once more data is readable.
/// Returns `Err` on a message type or length byte count has deemed invalid.
pub fn try_parse_message(buf: &mut Vec<u8>) -> Result<Option<ClientMessage>, String> {
    if buf.is_empty() {
        return Ok(None);
    }

    let msg_type = buf[0];
    let (needed, message) = match msg_type {
        client_message_type::SET_PIXEL_FORMAT => {
            const LEN: usize = 20;
            if buf.len() < LEN {
                return Ok(None);
            }
            let mut pf = [0u8; 16];
            pf.copy_from_slice(&buf[4..20]);
            (LEN, ClientMessage::SetPixelFormat(PixelFormat::from_bytes(&pf)))
        }
        client_message_type::SET_ENCODINGS => {
            if buf.len() < 4 {
                return Ok(None);
            }
            let count = u16::from_be_bytes([buf[2], buf[3]]) as usize;
            let len = 4 + count * 4;
            if buf.len() < len {
                return Ok(None);
            }
            let mut encodings = Vec::with_capacity(count);
            for chunk in buf[4..len].chunks_exact(4) {
                encodings.push(i32::from_be_bytes(chunk.try_into().unwrap()));
            }
            (len, ClientMessage::SetEncodings(encodings))
        }
        client_message_type::FRAMEBUFFER_UPDATE_REQUEST => {
            const LEN: usize = 10;
            if buf.len() < LEN {
                return Ok(None);
            }
            (
                LEN,
                ClientMessage::FramebufferUpdateRequest {
                    incremental: buf[1] != 0,
                    x: u16::from_be_bytes([buf[2], buf[3]]),
                    y: u16::from_be_bytes([buf[4], buf[5]]),
                    width: u16::from_be_bytes([buf[6], buf[7]]),
                    height: u16::from_be_bytes([buf[8], buf[9]]),
                },
            )
        }
        client_message_type::KEY_EVENT => {
            const LEN: usize = 8;
            if buf.len() < LEN {
                return Ok(None);
            }
            (
                LEN,
                ClientMessage::KeyEvent {
                    down: buf[1] != 0,
                    keysym: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
                },
            )
        }
        client_message_type::POINTER_EVENT => {
            const LEN: usize = 6;
            if buf.len() < LEN {
                return Ok(None);
            }
            (
                LEN,
                ClientMessage::PointerEvent {
                    button_mask: buf[1],
                    x: u16::from_be_bytes([buf[2], buf[3]]),
                    y: u16::from_be_bytes([buf[4], buf[5]]),
                },
            )
        }
        client_message_type::CLIENT_CUT_TEXT => {
            if buf.len() < 8 {
                return Ok(None);
            }
            let text_len = u32::from_be_bytes(buf[4..8].try_into().unwrap()) as usize;
            let len = 8 + text_len;
            if buf.len() < len {
                return Ok(None);
            }
            (len, ClientMessage::ClientCutText)
        }
        other => return Err(format!("unknown client message type {other}")),
    };

    buf.drain(..needed);
    Ok(Some(message))
}

/// Builds a `FramebufferUpdate` message carrying one Raw-encoded rectangle
/// per damage rect, each rectangle's pixel data supplied by `pixels_for`.
pub fn encode_framebuffer_update(
    rects: &[crate::damage::Rect],
    mut pixels_for: impl FnMut(&crate::damage::Rect) -> Vec<u8>,
) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(SERVER_MESSAGE_FRAMEBUFFER_UPDATE);
    out.push(0); // padding
    out.extend_from_slice(&(rects.len() as u16).to_be_bytes());

    for rect in rects {
        out.extend_from_slice(&(rect.x as u16).to_be_bytes());
        out.extend_from_slice(&(rect.y as u16).to_be_bytes());
        out.extend_from_slice(&(rect.w as u16).to_be_bytes());
        out.extend_from_slice(&(rect.h as u16).to_be_bytes());
        out.extend_from_slice(&ENCODING_RAW.to_be_bytes());
        out.extend(pixels_for(rect));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::damage::Rect;

    #[test]
    fn pixel_format_round_trips_through_bytes() {
        let bytes = PixelFormat::RGBA8.to_bytes();
        let parsed = PixelFormat::from_bytes(&bytes);
        assert_eq!(parsed, PixelFormat::RGBA8);
    }

    #[test]
    fn partial_framebuffer_update_request_returns_none() {
        let mut buf = vec![3, 0, 0, 0, 0]; // short by 5 bytes
        assert_eq!(try_parse_message(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 5, "buffer must be left untouched on partial read");
    }

    #[test]
    fn parses_framebuffer_update_request_and_drains_buffer() {
        let mut buf = vec![3, 1, 0, 0, 0, 0, 0x07, 0x80, 0x04, 0x38];
        let msg = try_parse_message(&mut buf).unwrap().unwrap();
        assert_eq!(
            msg,
            ClientMessage::FramebufferUpdateRequest {
                incremental: true,
                x: 0,
                y: 0,
                width: 1920,
                height: 1080,
            }
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn parses_key_event() {
        let mut buf = vec![4, 1, 0, 0, 0, 0, 0, 0x61];
        let msg = try_parse_message(&mut buf).unwrap().unwrap();
        assert_eq!(msg, ClientMessage::KeyEvent { down: true, keysym: 0x61 });
    }

    #[test]
    fn parses_pointer_event() {
        let mut buf = vec![5, 0b0000_0001, 0, 10, 0, 20];
        let msg = try_parse_message(&mut buf).unwrap().unwrap();
        assert_eq!(
            msg,
            ClientMessage::PointerEvent {
                button_mask: 1,
                x: 10,
                y: 20,
            }
        );
    }

    #[test]
    fn set_encodings_waits_for_the_full_list() {
        let mut buf = vec![2, 0, 0, 2]; // claims 2 encodings, none present yet
        assert_eq!(try_parse_message(&mut buf).unwrap(), None);
        buf.extend_from_slice(&0i32.to_be_bytes());
        buf.extend_from_slice(&(-239i32).to_be_bytes());
        let msg = try_parse_message(&mut buf).unwrap().unwrap();
        assert_eq!(msg, ClientMessage::SetEncodings(vec![0, -239]));
    }

    #[test]
    fn client_cut_text_is_skipped_whole() {
        let mut buf = vec![6, 0, 0, 0, 0, 0, 0, 3, b'h', b'i', b'!'];
        let msg = try_parse_message(&mut buf).unwrap().unwrap();
        assert_eq!(msg, ClientMessage::ClientCutText);
        assert!(buf.is_empty());
    }

    #[test]
    fn unknown_message_type_is_an_error() {
        let mut buf = vec![200, 0, 0, 0];
        assert!(try_parse_message(&mut buf).is_err());
    }

    #[test]
    fn framebuffer_update_encodes_one_raw_rect_per_damage_rect() {
        let rects = vec![Rect { x: 0, y: 0, w: 32, h: 32 }];
        let bytes = encode_framebuffer_update(&rects, |r| vec![0xAA; (r.w * r.h * 4) as usize]);
        assert_eq!(bytes[0], SERVER_MESSAGE_FRAMEBUFFER_UPDATE);
        assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]), 1);
        assert_eq!(bytes.len(), 4 + 12 + 32 * 32 * 4);
    }
}
