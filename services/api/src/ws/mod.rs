//! Telephony Media Channel
//!
//! Telnyx opens a WebSocket per answered call and streams the caller's audio
//! over it. Submodules:
//!
//! - `protocol`: Telnyx media-stream JSON frames and their mapping to bridge events.
//! - `media`: the socket handler and the driver task feeding a bridge.

pub mod media;
pub mod protocol;

pub use media::ws_handler;
