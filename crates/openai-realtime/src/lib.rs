//! OpenAI Realtime model channel for the patient simulator bridge.

pub mod client;
pub mod types;

pub use client::{DEFAULT_REALTIME_URL, RealtimeConnector};
