//! RFB/VNC downstream layer, peripheral to the core. Consumes the two calls
//! the core exposes (`on_frame_done`, `inject_key`) and the pointer
//! passthrough module, and produces them from a real TCP/RFB 3.8 connection
//! instead of a test mock.

mod des;
pub mod handshake;
pub mod server;
pub mod wire;

pub use server::{ClientEvents, RfbClient, RfbServer};
