//! The Telnyx media-stream socket: one bridge per connection.

use super::protocol::{InboundMapper, InboundMessage, OutboundMessage};
use crate::state::AppState;
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{Sink, SinkExt, StreamExt};
use patient_sim_core::channel::{self, ChannelEndpoint};
use patient_sim_core::generic_types::{ChannelEvent, ControlEvent, TelephonyCommand};
use patient_sim_core::BridgeController;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Runs the bridge for one media stream until the call ends or a peer fails.
#[instrument(name = "media_stream", skip_all)]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    info!("Telnyx media stream connected");

    let (mut telephony, endpoint) = channel::pair("telephony");
    telephony.attach_driver(tokio::spawn(drive(socket, endpoint)));

    let report = BridgeController::new(
        telephony,
        state.registry.clone(),
        state.connector.clone(),
        state.settings.clone(),
    )
    .with_call_control(state.telnyx.clone())
    .run()
    .await;

    match &report.failure {
        Some(failure) => error!(
            call_id = ?report.call_id,
            scenario = ?report.scenario_id,
            error = %failure,
            "Bridge ended early"
        ),
        None => info!(
            call_id = ?report.call_id,
            scenario = ?report.scenario_id,
            transcript = ?report.transcript,
            turns = report.stats.patient_turns,
            "Bridge finished"
        ),
    }
}

enum Exit {
    /// The bridge closed its handle.
    Released,
    /// The socket ended; `Some` carries an error.
    Ended(Option<String>),
}

/// Pumps Telnyx frames to the bridge and bridge commands to Telnyx.
async fn drive(socket: WebSocket, mut endpoint: ChannelEndpoint<TelephonyCommand>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut mapper = InboundMapper::default();

    let exit = 'stream: loop {
        tokio::select! {
            command = endpoint.commands.recv() => {
                let Some(command) = command else {
                    if let Err(e) = ws_tx.close().await {
                        debug!(error = %e, "Error closing media stream");
                    }
                    break 'stream Exit::Released;
                };
                if let Err(e) = send_msg(&mut ws_tx, OutboundMessage::from(command)).await {
                    break 'stream Exit::Ended(Some(format!("send failed: {e}")));
                }
            }
            message = ws_rx.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<InboundMessage>(text.as_str()) {
                        Ok(message) => {
                            if let Some(event) = mapper.map(message) {
                                if !endpoint.emit(event).await {
                                    break 'stream Exit::Released;
                                }
                            }
                        }
                        Err(e) => warn!(error = %e, "Malformed media stream frame"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => break 'stream Exit::Ended(None),
                Some(Ok(_)) => {}
                Some(Err(e)) => break 'stream Exit::Ended(Some(e.to_string())),
            }
        }
    };

    match exit {
        Exit::Released => debug!("Media stream released"),
        Exit::Ended(error) => {
            info!(?error, "Telnyx media stream disconnected");
            endpoint
                .emit(ChannelEvent::Control(ControlEvent::ChannelClosed { error }))
                .await;
        }
    }
}

async fn send_msg<S>(sink: &mut S, msg: OutboundMessage) -> anyhow::Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let json = serde_json::to_string(&msg)?;
    sink.send(Message::Text(json.into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::router::create_router;
    use crate::state::testing::{app_state, scenario};
    use async_trait::async_trait;
    use futures_util::{SinkExt, StreamExt};
    use patient_sim_core::channel::{self, ChannelEndpoint, ChannelHandle};
    use patient_sim_core::generic_types::{
        AudioFrame, ChannelEvent, ControlEvent, FrameSource, ModelCommand,
    };
    use patient_sim_core::ModelConnector;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

    /// Hands each model endpoint to the test instead of dialing out.
    struct LocalModel {
        endpoints: mpsc::UnboundedSender<ChannelEndpoint<ModelCommand>>,
    }

    #[async_trait]
    impl ModelConnector for LocalModel {
        async fn connect(&self) -> anyhow::Result<ChannelHandle<ModelCommand>> {
            let (handle, endpoint) = channel::pair("model");
            self.endpoints.send(endpoint)?;
            Ok(handle)
        }
    }

    async fn within<T>(fut: impl std::future::Future<Output = T>) -> T {
        tokio::time::timeout(Duration::from_secs(5), fut)
            .await
            .expect("timed out")
    }

    async fn next_json<S>(ws: &mut S) -> Value
    where
        S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        loop {
            match within(ws.next()).await {
                Some(Ok(WsMessage::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_media_stream_bridges_a_call() {
        let dir = tempfile::tempdir().unwrap();
        let (endpoint_tx, mut endpoint_rx) = mpsc::unbounded_channel();
        let state = app_state(Arc::new(LocalModel { endpoints: endpoint_tx }), dir.path()).await;
        state
            .registry
            .expect_call("v3:abc", scenario("refill", "Prescription Refill"));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = create_router(state.clone());
        tokio::spawn(async move { axum::serve(listener, app).await });

        let (mut ws, _) = connect_async(format!("ws://{addr}/media-stream")).await.unwrap();
        let send = |value: Value| WsMessage::Text(value.to_string().into());

        ws.send(send(json!({"event": "connected", "version": "1.0.0"}))).await.unwrap();
        ws.send(send(json!({
            "event": "start",
            "stream_id": "stream-1",
            "start": {"call_control_id": "v3:abc"}
        })))
        .await
        .unwrap();

        let mut model = within(endpoint_rx.recv()).await.unwrap();
        assert!(matches!(
            within(model.commands.recv()).await,
            Some(ModelCommand::Configure(_))
        ));
        model
            .emit(ChannelEvent::Control(ControlEvent::SessionReady {
                session_id: "sess_1".into(),
            }))
            .await;

        ws.send(send(json!({"event": "media", "media": {"track": "inbound", "payload": "f39/fw=="}})))
            .await
            .unwrap();
        match within(model.commands.recv()).await {
            Some(ModelCommand::Audio(frame)) => assert_eq!(frame.payload, "f39/fw=="),
            other => panic!("unexpected {other:?}"),
        }

        model
            .emit(ChannelEvent::Audio(AudioFrame::new(FrameSource::Model, 0, "UklGRg==")))
            .await;
        assert_eq!(
            next_json(&mut ws).await,
            json!({"event": "media", "media": {"payload": "UklGRg=="}})
        );
        assert_eq!(
            next_json(&mut ws).await,
            json!({"event": "mark", "mark": {"name": "0"}})
        );

        model
            .emit(ChannelEvent::Control(ControlEvent::Transcript {
                role: patient_sim_core::generic_types::Role::PatientSimulator,
                text: "I need a refill.".into(),
                is_final: true,
            }))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        ws.send(send(json!({"event": "mark", "mark": {"name": "0"}}))).await.unwrap();
        ws.send(send(json!({"event": "stop", "stop": {"call_control_id": "v3:abc"}})))
            .await
            .unwrap();

        // The bridge closes the socket once it has torn down.
        loop {
            match within(ws.next()).await {
                Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
        within(async {
            while !state.registry.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;

        let written: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(written.len(), 1);
        let transcript =
            std::fs::read_to_string(written[0].as_ref().unwrap().path()).unwrap();
        assert!(transcript.contains("[PATIENT]: I need a refill."));
    }

    #[tokio::test]
    async fn test_media_stream_for_unknown_call_closes() {
        let dir = tempfile::tempdir().unwrap();
        let (endpoint_tx, _endpoint_rx) = mpsc::unbounded_channel();
        let state = app_state(Arc::new(LocalModel { endpoints: endpoint_tx }), dir.path()).await;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = create_router(state);
        tokio::spawn(async move { axum::serve(listener, app).await });

        let (mut ws, _) = connect_async(format!("ws://{addr}/media-stream")).await.unwrap();
        ws.send(WsMessage::Text(
            json!({"event": "start", "start": {"call_control_id": "v3:stranger"}})
                .to_string()
                .into(),
        ))
        .await
        .unwrap();

        loop {
            match within(ws.next()).await {
                Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
