//! WebSocket driver for one OpenAI Realtime session.

use crate::types::{self, ClientEvent, Translator};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{Sink, SinkExt, StreamExt};
use patient_sim_core::channel::{self, ChannelEndpoint, ChannelHandle};
use patient_sim_core::generic_types::{ChannelEvent, ControlEvent, ModelCommand};
use patient_sim_core::ModelConnector;
use secrecy::{ExposeSecret, SecretString};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message as WsMessage},
};
use tracing::{debug, info, warn};

pub const DEFAULT_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";

/// Opens one Realtime session per call.
#[derive(Debug)]
pub struct RealtimeConnector {
    base_url: String,
    api_key: SecretString,
    model: String,
}

impl RealtimeConnector {
    pub fn new(api_key: SecretString, model: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_REALTIME_URL.to_string(),
            api_key,
            model: model.into(),
        }
    }

    /// Points the connector at another endpoint, e.g. a local stand-in server.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn url(&self) -> String {
        format!("{}?model={}", self.base_url, self.model)
    }
}

#[async_trait]
impl ModelConnector for RealtimeConnector {
    async fn connect(&self) -> Result<ChannelHandle<ModelCommand>> {
        let mut request = self.url().into_client_request()?;
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", self.api_key.expose_secret()).parse()?,
        );
        request
            .headers_mut()
            .insert("OpenAI-Beta", "realtime=v1".parse()?);

        let (ws_stream, _) = connect_async(request)
            .await
            .context("Failed to connect to OpenAI Realtime WebSocket")?;
        info!(model = %self.model, "Connected to OpenAI Realtime API");

        let (mut handle, endpoint) = channel::pair("model");
        handle.attach_driver(tokio::spawn(drive(ws_stream, endpoint)));
        Ok(handle)
    }
}

enum Exit {
    /// The bridge closed its handle; nobody is listening any more.
    Released,
    /// The socket went away on its own.
    Lost(String),
}

/// Pumps commands to the socket and server events to the bridge until either
/// side goes away.
async fn drive<S>(ws_stream: S, mut endpoint: ChannelEndpoint<ModelCommand>)
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let mut translator = Translator::default();

    let exit = 'session: loop {
        tokio::select! {
            command = endpoint.commands.recv() => {
                let Some(command) = command else {
                    if let Err(e) = ws_tx.close().await {
                        debug!(error = %e, "Error closing model socket");
                    }
                    break 'session Exit::Released;
                };
                for event in client_events(command) {
                    if let Err(e) = send_event(&mut ws_tx, &event).await {
                        break 'session Exit::Lost(format!("send failed: {e}"));
                    }
                }
            }
            message = ws_rx.next() => match message {
                Some(Ok(WsMessage::Text(text))) => match translator.translate_text(&text) {
                    Ok(Some(event)) => {
                        if !endpoint.emit(event).await {
                            break 'session Exit::Released;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "Malformed event from model"),
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    let reason = frame
                        .map(|f| format!("closed by server ({}): {}", f.code, f.reason))
                        .unwrap_or_else(|| "closed by server".to_string());
                    break 'session Exit::Lost(reason);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break 'session Exit::Lost(e.to_string()),
                None => break 'session Exit::Lost("stream ended".to_string()),
            }
        }
    };

    match exit {
        Exit::Released => debug!(session_id = ?translator.session_id(), "Model channel released"),
        Exit::Lost(reason) => {
            warn!(session_id = ?translator.session_id(), %reason, "Model connection lost");
            endpoint
                .emit(ChannelEvent::Control(ControlEvent::ChannelClosed {
                    error: Some(reason),
                }))
                .await;
        }
    }
}

fn client_events(command: ModelCommand) -> Vec<ClientEvent> {
    match command {
        ModelCommand::Configure(config) => types::configure_events(&config),
        ModelCommand::Audio(frame) => vec![types::append_audio(frame)],
    }
}

async fn send_event<S>(sink: &mut S, event: &ClientEvent) -> Result<()>
where
    S: Sink<WsMessage> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let json = serde_json::to_string(event)?;
    sink.send(WsMessage::Text(json.into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use patient_sim_core::generic_types::{AudioFrame, FrameSource, SessionConfig};
    use patient_sim_core::scenario::{ModelSettings, Scenario};
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn session_config() -> SessionConfig {
        let scenario = Scenario {
            id: "billing_question".into(),
            name: "Billing Question".into(),
            system_prompt: "You are Robert.".into(),
            opening_line: "I have a question about a bill.".into(),
        };
        ModelSettings::default().session_config(&scenario)
    }

    #[test]
    fn test_url_carries_model() {
        let connector = RealtimeConnector::new(
            SecretString::from("sk-test".to_string()),
            "gpt-4o-realtime-preview",
        );
        assert_eq!(
            connector.url(),
            "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview"
        );
    }

    #[tokio::test]
    async fn test_driver_against_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

            let first = ws.next().await.unwrap().unwrap();
            let update: serde_json::Value =
                serde_json::from_str(first.to_text().unwrap()).unwrap();
            assert_eq!(update["type"], "session.update");

            for msg in [
                r#"{"type":"session.created","session":{"id":"sess_local"}}"#,
                r#"{"type":"session.updated","session":{"id":"sess_local"}}"#,
                r#"{"type":"response.audio.delta","delta":"UklGRg=="}"#,
            ] {
                ws.send(WsMessage::Text(msg.to_string().into())).await.unwrap();
            }

            let append = ws.next().await.unwrap().unwrap();
            let append: serde_json::Value = serde_json::from_str(append.to_text().unwrap()).unwrap();
            assert_eq!(append["type"], "input_audio_buffer.append");
            assert_eq!(append["audio"], "f39/fw==");
            ws.close(None).await.unwrap();
        });

        let connector =
            RealtimeConnector::new(SecretString::from("sk-test".to_string()), "test-model")
                .with_base_url(format!("ws://{addr}/v1/realtime"));
        let mut handle = connector.connect().await.unwrap();
        assert!(handle.send(ModelCommand::Configure(session_config())));

        assert_eq!(
            handle.recv().await,
            ChannelEvent::Control(ControlEvent::SessionReady {
                session_id: "sess_local".into()
            })
        );
        match handle.recv().await {
            ChannelEvent::Audio(frame) => assert_eq!(frame.payload, "UklGRg=="),
            other => panic!("unexpected {other:?}"),
        }

        let caller = AudioFrame::new(FrameSource::Call, 0, "f39/fw==");
        assert!(handle.send(ModelCommand::Audio(caller)));
        let closed = tokio::time::timeout(Duration::from_secs(2), handle.recv())
            .await
            .unwrap();
        assert!(matches!(
            closed,
            ChannelEvent::Control(ControlEvent::ChannelClosed { error: Some(_) })
        ));

        server.await.unwrap();
        handle.close(Duration::from_millis(100)).await;
    }
}
