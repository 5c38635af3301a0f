use serde::{Deserialize, Serialize};
use std::fmt;

/// Which side of the bridge produced an audio frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameSource {
    /// Caller audio arriving from the telephony media stream.
    Call,
    /// Generated patient audio arriving from the speech model.
    Model,
}

/// One chunk of narrowband u-law audio in transit through the bridge.
///
/// The payload is kept in the base64 form both peers speak, so relaying a
/// frame never touches the audio itself. `seq` is assigned per source by the
/// channel driver and is only used to correlate playback marks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub source: FrameSource,
    pub seq: u64,
    pub payload: String,
}

impl AudioFrame {
    pub fn new(source: FrameSource, seq: u64, payload: impl Into<String>) -> Self {
        Self {
            source,
            seq,
            payload: payload.into(),
        }
    }
}

/// Speaker attribution for transcript text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The voice agent under test, heard through the phone call.
    Agent,
    /// The simulated patient voiced by the speech model.
    PatientSimulator,
}

impl Role {
    /// Label used in transcript artifacts.
    pub fn label(self) -> &'static str {
        match self {
            Role::Agent => "AGENT",
            Role::PatientSimulator => "PATIENT",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Agent => write!(f, "agent"),
            Role::PatientSimulator => write!(f, "patient"),
        }
    }
}

/// Out-of-band signals either peer can emit alongside audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// The model finished its handshake and accepts audio.
    SessionReady { session_id: String },
    /// The telephony media stream announced the call it carries.
    CallStarted { call_id: String, stream_id: Option<String> },
    /// The telephony side ended the stream (or the call hung up).
    CallStopped,
    /// The patient simulator finished its current spoken turn.
    TurnFinished,
    /// The model detected the caller starting to speak.
    SpeechStarted,
    /// Playback of outbound audio reached a previously sent mark.
    Mark { name: String },
    /// A piece of transcript text. `is_final` carries the complete turn text.
    Transcript {
        role: Role,
        text: String,
        is_final: bool,
    },
    /// The peer gave up transcribing a turn for `role`; no text will follow.
    TranscriptFailed { role: Role },
    /// A peer-reported error that does not end the connection.
    Error { message: String },
    /// The connection is gone. Emitted at most once per channel.
    ChannelClosed { error: Option<String> },
}

/// Everything a channel driver hands to the bridge, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Audio(AudioFrame),
    Control(ControlEvent),
}

/// Instructions the bridge sends to the telephony media channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelephonyCommand {
    /// Play a generated frame on the call.
    Audio(AudioFrame),
    /// Ask to be told when playback reaches this point.
    Mark(u64),
    /// Drop every frame still queued for playback.
    Clear,
}

/// Instructions the bridge sends to the upstream model channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelCommand {
    /// Session configuration handshake payload.
    Configure(SessionConfig),
    /// Caller audio to feed the model.
    Audio(AudioFrame),
}

/// Audio encodings the bridge can declare to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioCodec {
    /// G.711 u-law, 8 kHz mono; what the phone call itself carries.
    #[serde(rename = "g711_ulaw")]
    G711Ulaw,
}

/// Server-side voice activity detection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnDetection {
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl Default for TurnDetection {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 700,
        }
    }
}

/// Provider-neutral configuration sent once when a model session opens.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub instructions: String,
    pub voice: String,
    pub input_format: AudioCodec,
    pub output_format: AudioCodec,
    pub transcription_model: String,
    pub turn_detection: TurnDetection,
    pub temperature: f32,
    /// When set, the model is prompted to speak first with this cue.
    pub kickoff: Option<String>,
}
