//! Telnyx media-stream WebSocket messages.
//!
//! Telnyx speaks JSON frames tagged by `event`. Audio travels as base64 u-law
//! in `media.payload` and is relayed untouched.

use patient_sim_core::generic_types::{
    AudioFrame, ChannelEvent, ControlEvent, FrameSource, TelephonyCommand,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Messages Telnyx sends to the media-stream socket.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InboundMessage {
    Connected {
        #[serde(default)]
        version: Option<String>,
    },
    Start {
        #[serde(default)]
        stream_id: Option<String>,
        start: StartInfo,
    },
    Media {
        media: MediaPayload,
    },
    /// Playback reached a mark we sent earlier.
    Mark {
        mark: MarkInfo,
    },
    Stop {},
    Error {
        #[serde(default)]
        payload: serde_json::Value,
    },
    Dtmf {
        #[serde(default)]
        dtmf: serde_json::Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct StartInfo {
    pub call_control_id: String,
    /// Older stream versions nest the stream id here instead of at the top level.
    #[serde(default)]
    pub stream_id: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct MediaPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<String>,
    pub payload: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct MarkInfo {
    pub name: String,
}

/// Messages we send back over the media-stream socket.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Audio to play on the call.
    Media { media: MediaPayload },
    /// Drop everything queued for playback.
    Clear,
    Mark { mark: MarkInfo },
}

impl From<TelephonyCommand> for OutboundMessage {
    fn from(command: TelephonyCommand) -> Self {
        match command {
            TelephonyCommand::Audio(frame) => OutboundMessage::Media {
                media: MediaPayload {
                    track: None,
                    payload: frame.payload,
                },
            },
            TelephonyCommand::Mark(seq) => OutboundMessage::Mark {
                mark: MarkInfo {
                    name: seq.to_string(),
                },
            },
            TelephonyCommand::Clear => OutboundMessage::Clear,
        }
    }
}

/// Turns Telnyx frames into bridge events, numbering caller audio as it goes.
#[derive(Debug, Default)]
pub struct InboundMapper {
    next_seq: u64,
}

impl InboundMapper {
    pub fn map(&mut self, message: InboundMessage) -> Option<ChannelEvent> {
        match message {
            InboundMessage::Connected { version } => {
                debug!(?version, "Media stream connected");
                None
            }
            InboundMessage::Start { stream_id, start } => {
                Some(ChannelEvent::Control(ControlEvent::CallStarted {
                    call_id: start.call_control_id,
                    stream_id: stream_id.or(start.stream_id),
                }))
            }
            InboundMessage::Media { media } => {
                if media.payload.is_empty() || media.track.as_deref() == Some("outbound") {
                    return None;
                }
                let seq = self.next_seq;
                self.next_seq += 1;
                Some(ChannelEvent::Audio(AudioFrame::new(
                    FrameSource::Call,
                    seq,
                    media.payload,
                )))
            }
            InboundMessage::Mark { mark } => {
                Some(ChannelEvent::Control(ControlEvent::Mark { name: mark.name }))
            }
            InboundMessage::Stop {} => Some(ChannelEvent::Control(ControlEvent::CallStopped)),
            InboundMessage::Error { payload } => {
                Some(ChannelEvent::Control(ControlEvent::Error {
                    message: payload.to_string(),
                }))
            }
            InboundMessage::Dtmf { dtmf } => {
                debug!(%dtmf, "DTMF on media stream");
                None
            }
            InboundMessage::Unknown => {
                debug!("Ignoring unknown media stream event");
                None
            }
        }
    }
}
