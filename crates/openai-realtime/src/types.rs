//! Wire types for the OpenAI Realtime (beta) event protocol, and their
//! mapping onto bridge channel events.
//!
//! Only the events the bridge acts on are modelled. Everything else lands in
//! the `Unknown` variants so new server events never break a call.

use patient_sim_core::generic_types::{
    AudioCodec, AudioFrame, ChannelEvent, ControlEvent, FrameSource, Role, SessionConfig,
    TurnDetection,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Events sent to the server.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionResource },
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: Item },
    #[serde(rename = "response.create")]
    ResponseCreate {},
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionResource {
    pub modalities: Vec<String>,
    pub instructions: String,
    pub voice: String,
    pub input_audio_format: AudioCodec,
    pub output_audio_format: AudioCodec,
    pub input_audio_transcription: AudioTranscription,
    pub turn_detection: TurnDetectionConfig,
    pub temperature: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct AudioTranscription {
    pub model: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnDetectionConfig {
    ServerVad {
        threshold: f32,
        prefix_padding_ms: u32,
        silence_duration_ms: u32,
    },
}

impl From<&TurnDetection> for TurnDetectionConfig {
    fn from(vad: &TurnDetection) -> Self {
        TurnDetectionConfig::ServerVad {
            threshold: vad.threshold,
            prefix_padding_ms: vad.prefix_padding_ms,
            silence_duration_ms: vad.silence_duration_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Item {
    #[serde(rename = "type")]
    pub kind: String,
    pub role: String,
    pub content: Vec<ItemContent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemContent {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

/// Events received from the server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated { session: SessionInfo },
    #[serde(rename = "session.updated")]
    SessionUpdated { session: SessionInfo },
    #[serde(rename = "response.audio.delta")]
    ResponseAudioDelta { delta: String },
    #[serde(rename = "response.audio_transcript.delta")]
    ResponseAudioTranscriptDelta { delta: String },
    #[serde(rename = "response.audio_transcript.done")]
    ResponseAudioTranscriptDone {
        #[serde(default)]
        transcript: String,
    },
    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    InputAudioTranscriptionDelta { delta: String },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputAudioTranscriptionCompleted {
        #[serde(default)]
        transcript: String,
    },
    #[serde(rename = "conversation.item.input_audio_transcription.failed")]
    InputAudioTranscriptionFailed {
        #[serde(default)]
        error: Option<ApiError>,
    },
    #[serde(rename = "input_audio_buffer.speech_started")]
    InputAudioBufferSpeechStarted {
        #[serde(default)]
        audio_start_ms: Option<u64>,
    },
    #[serde(rename = "response.done")]
    ResponseDone {},
    #[serde(rename = "error")]
    Error { error: ApiError },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionInfo {
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub code: Option<String>,
    pub message: String,
}

/// Builds the events that open a session with `config`: the session update
/// and, when the patient speaks first, the kickoff turn.
pub fn configure_events(config: &SessionConfig) -> Vec<ClientEvent> {
    let session = SessionResource {
        modalities: vec!["text".to_string(), "audio".to_string()],
        instructions: config.instructions.clone(),
        voice: config.voice.clone(),
        input_audio_format: config.input_format,
        output_audio_format: config.output_format,
        input_audio_transcription: AudioTranscription {
            model: config.transcription_model.clone(),
        },
        turn_detection: TurnDetectionConfig::from(&config.turn_detection),
        temperature: config.temperature,
    };
    let mut events = vec![ClientEvent::SessionUpdate { session }];
    if let Some(cue) = &config.kickoff {
        events.push(ClientEvent::ConversationItemCreate {
            item: Item {
                kind: "message".to_string(),
                role: "user".to_string(),
                content: vec![ItemContent {
                    kind: "input_text".to_string(),
                    text: cue.clone(),
                }],
            },
        });
        events.push(ClientEvent::ResponseCreate {});
    }
    events
}

/// Forwards a caller frame. The payload is already base64 u-law.
pub fn append_audio(frame: AudioFrame) -> ClientEvent {
    ClientEvent::InputAudioBufferAppend {
        audio: frame.payload,
    }
}

/// Per-connection state needed to turn server events into channel events.
#[derive(Debug, Default)]
pub struct Translator {
    session_id: Option<String>,
    ready: bool,
    next_seq: u64,
}

impl Translator {
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Parses one text message. Malformed JSON yields `Err`; events the bridge
    /// does not care about yield `Ok(None)`.
    pub fn translate_text(&mut self, text: &str) -> serde_json::Result<Option<ChannelEvent>> {
        let event: ServerEvent = serde_json::from_str(text)?;
        Ok(self.translate(event))
    }

    pub fn translate(&mut self, event: ServerEvent) -> Option<ChannelEvent> {
        let control = match event {
            ServerEvent::SessionCreated { session } => {
                debug!(session_id = ?session.id, "Model session created");
                self.session_id = session.id;
                return None;
            }
            ServerEvent::SessionUpdated { session } => {
                if self.ready {
                    return None;
                }
                self.ready = true;
                let session_id = self
                    .session_id
                    .clone()
                    .or(session.id)
                    .unwrap_or_default();
                ControlEvent::SessionReady { session_id }
            }
            ServerEvent::ResponseAudioDelta { delta } => {
                let seq = self.next_seq;
                self.next_seq += 1;
                return Some(ChannelEvent::Audio(AudioFrame::new(
                    FrameSource::Model,
                    seq,
                    delta,
                )));
            }
            ServerEvent::ResponseAudioTranscriptDelta { delta } => ControlEvent::Transcript {
                role: Role::PatientSimulator,
                text: delta,
                is_final: false,
            },
            ServerEvent::ResponseAudioTranscriptDone { transcript } => ControlEvent::Transcript {
                role: Role::PatientSimulator,
                text: transcript,
                is_final: true,
            },
            ServerEvent::InputAudioTranscriptionDelta { delta } => ControlEvent::Transcript {
                role: Role::Agent,
                text: delta,
                is_final: false,
            },
            ServerEvent::InputAudioTranscriptionCompleted { transcript } => {
                ControlEvent::Transcript {
                    role: Role::Agent,
                    text: transcript,
                    is_final: true,
                }
            }
            ServerEvent::InputAudioTranscriptionFailed { error } => {
                if let Some(error) = error {
                    debug!(message = %error.message, "Agent transcription failed");
                }
                ControlEvent::TranscriptFailed { role: Role::Agent }
            }
            ServerEvent::InputAudioBufferSpeechStarted { .. } => ControlEvent::SpeechStarted,
            ServerEvent::ResponseDone {} => ControlEvent::TurnFinished,
            ServerEvent::Error { error } => ControlEvent::Error {
                message: match error.code {
                    Some(code) => format!("{code}: {}", error.message),
                    None => error.message,
                },
            },
            ServerEvent::Unknown => return None,
        };
        Some(ChannelEvent::Control(control))
    }
}
