//! Patient Simulator API Library Crate
//!
//! This library contains the web-facing half of the patient simulator: the
//! configuration, the Telnyx REST client, the API handlers, the Telnyx
//! media-stream WebSocket, and routing. The binaries are thin wrappers
//! around this library.

pub mod config;
pub mod handlers;
pub mod models;
pub mod router;
pub mod state;
pub mod telnyx;
pub mod ws;
