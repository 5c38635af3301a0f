//! Transport-agnostic core of the patient simulator: the per-call bridge, its
//! session state machine, transcripts, scenarios and the call registry.

pub mod bridge;
pub mod channel;
pub mod error;
pub mod generic_types;
pub mod registry;
pub mod scenario;
pub mod session;
pub mod transcript;

pub use bridge::{
    BridgeController, BridgeReport, BridgeSettings, CallControl, ModelConnector, RelayStats,
};
pub use channel::{ChannelEndpoint, ChannelHandle};
pub use error::{BridgeError, SessionError, TranscriptError};
pub use registry::{CallRegistry, HangupOutcome};
pub use scenario::{ModelSettings, Scenario, ScenarioCatalog};
pub use session::{CallSession, Phase};
pub use transcript::TranscriptSink;
