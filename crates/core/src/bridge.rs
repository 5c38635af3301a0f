//! Bridge controller
//!
//! One `BridgeController` runs per phone call. It owns the call's
//! [`CallSession`] and [`TranscriptSink`], pumps audio between the telephony
//! media channel and the model channel, and turns peer control events into
//! phase changes, barge-in clears and transcript entries.

use crate::channel::ChannelHandle;
use crate::error::BridgeError;
use crate::generic_types::{
    AudioFrame, ChannelEvent, ControlEvent, ModelCommand, Role, TelephonyCommand,
};
use crate::registry::CallRegistry;
use crate::scenario::{ModelSettings, Scenario};
use crate::session::{CallSession, Phase, Signal};
use crate::transcript::TranscriptSink;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{Instrument, debug, error, field, info, info_span, warn};

/// Frame counts at which relay progress is logged.
const RELAY_MILESTONES: [u64; 5] = [1, 10, 50, 100, 500];

/// Opens a model channel for one call.
#[async_trait]
pub trait ModelConnector: Send + Sync {
    async fn connect(&self) -> anyhow::Result<ChannelHandle<ModelCommand>>;
}

/// Call-control actions the bridge may take on the call it carries.
#[async_trait]
pub trait CallControl: Send + Sync {
    /// Ends the call early.
    async fn hangup(&self, call_id: &str) -> anyhow::Result<()>;
}

/// Per-bridge knobs, shared by every call the process handles.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub transcripts_dir: PathBuf,
    /// Deadline for the model to report ready, measured from call start.
    pub handshake_timeout: Duration,
    /// How long draining waits for queued outbound audio to play out.
    pub drain_grace: Duration,
    /// Bounded wait for each channel to shut down.
    pub close_timeout: Duration,
    /// Caller frames held while the model handshake is in flight.
    pub max_buffered_frames: usize,
    pub model: ModelSettings,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            transcripts_dir: PathBuf::from("./transcripts"),
            handshake_timeout: Duration::from_secs(10),
            drain_grace: Duration::from_millis(1500),
            close_timeout: Duration::from_secs(2),
            max_buffered_frames: 250,
            model: ModelSettings::default(),
        }
    }
}

/// Counters kept while a bridge runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Caller frames forwarded to the model.
    pub call_frames: u64,
    /// Model frames forwarded to the call.
    pub model_frames: u64,
    /// Caller frames lost because the pre-handshake buffer overflowed.
    pub dropped_call_frames: u64,
    pub clears: u64,
    pub patient_turns: u64,
}

/// Outcome of one bridge run.
#[derive(Debug)]
pub struct BridgeReport {
    pub call_id: Option<String>,
    pub scenario_id: Option<String>,
    pub model_session_id: Option<String>,
    /// Every phase the session went through, oldest first.
    pub phases: Vec<Phase>,
    /// Where the transcript was written, if it was.
    pub transcript: Option<PathBuf>,
    pub stats: RelayStats,
    /// Why the bridge ended early, if it did.
    pub failure: Option<BridgeError>,
}

type Connecting = JoinHandle<anyhow::Result<ChannelHandle<ModelCommand>>>;
type ConnectResult = Result<anyhow::Result<ChannelHandle<ModelCommand>>, JoinError>;

enum Inbound {
    Telephony(ChannelEvent),
    Model(ChannelEvent),
    Connected(ConnectResult),
    Deadline,
}

pub struct BridgeController {
    telephony: ChannelHandle<TelephonyCommand>,
    model: Option<ChannelHandle<ModelCommand>>,
    /// Model connect in flight; its result comes back through the pump.
    connecting: Option<Connecting>,
    registry: Arc<CallRegistry>,
    connector: Arc<dyn ModelConnector>,
    call_control: Option<Arc<dyn CallControl>>,
    settings: BridgeSettings,
    session: CallSession,
    scenario: Option<Scenario>,
    transcript: Option<TranscriptSink>,
    /// Marks sent after relayed model frames and not yet played out, oldest first.
    outstanding_marks: VecDeque<u64>,
    /// Caller frames received before the model was ready.
    pending_inbound: VecDeque<AudioFrame>,
    stats: RelayStats,
    failure: Option<BridgeError>,
    call_stopped: bool,
    handshake_deadline: Option<Instant>,
    drain_deadline: Option<Instant>,
}

impl BridgeController {
    pub fn new(
        telephony: ChannelHandle<TelephonyCommand>,
        registry: Arc<CallRegistry>,
        connector: Arc<dyn ModelConnector>,
        settings: BridgeSettings,
    ) -> Self {
        Self {
            telephony,
            model: None,
            connecting: None,
            registry,
            connector,
            call_control: None,
            settings,
            session: CallSession::new(),
            scenario: None,
            transcript: None,
            outstanding_marks: VecDeque::new(),
            pending_inbound: VecDeque::new(),
            stats: RelayStats::default(),
            failure: None,
            call_stopped: false,
            handshake_deadline: None,
            drain_deadline: None,
        }
    }

    /// Lets the bridge hang up calls it could not carry to the end.
    pub fn with_call_control(mut self, call_control: Arc<dyn CallControl>) -> Self {
        self.call_control = Some(call_control);
        self
    }

    /// Runs the bridge until the session is closed, then tears both channels
    /// down and flushes the transcript.
    pub async fn run(self) -> BridgeReport {
        let span = info_span!("bridge", call_id = field::Empty, scenario = field::Empty);
        self.pump().instrument(span).await
    }

    async fn pump(mut self) -> BridgeReport {
        debug!("Bridge awaiting call");
        while self.session.phase() != Phase::Closed {
            let deadline = self.current_deadline();
            let inbound = tokio::select! {
                event = self.telephony.recv() => Inbound::Telephony(event),
                event = next_model_event(&mut self.model) => Inbound::Model(event),
                result = next_connection(&mut self.connecting) => Inbound::Connected(result),
                _ = sleep_until(deadline) => Inbound::Deadline,
            };
            match inbound {
                Inbound::Telephony(event) => self.on_telephony(event),
                Inbound::Model(event) => self.on_model(event),
                Inbound::Connected(result) => {
                    self.connecting = None;
                    self.on_model_connected(result);
                }
                Inbound::Deadline => self.on_deadline(),
            }
        }
        self.teardown().await
    }

    fn current_deadline(&self) -> Option<Instant> {
        match self.session.phase() {
            Phase::AwaitingModelReady => self.handshake_deadline,
            Phase::Draining => self.drain_deadline,
            _ => None,
        }
    }

    fn on_telephony(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Audio(frame) => self.on_caller_frame(frame),
            ChannelEvent::Control(ControlEvent::CallStarted { call_id, stream_id }) => {
                if self.session.phase() == Phase::AwaitingCall {
                    self.start_call(call_id, stream_id);
                } else {
                    warn!(%call_id, "Duplicate call start ignored");
                }
            }
            ChannelEvent::Control(ControlEvent::CallStopped) => {
                info!("Call stopped");
                self.call_stopped = true;
                self.signal(Signal::CallStopped);
            }
            ChannelEvent::Control(ControlEvent::Mark { name }) => self.on_mark(&name),
            ChannelEvent::Control(ControlEvent::Error { message }) => {
                warn!(%message, "Telephony reported an error");
            }
            ChannelEvent::Control(ControlEvent::ChannelClosed { error }) => {
                match &error {
                    Some(reason) => warn!(%reason, "Telephony channel closed"),
                    None => info!("Telephony channel closed"),
                }
                if !self.call_stopped && self.session.call_id().is_some() && self.failure.is_none()
                {
                    self.failure = Some(BridgeError::ChannelClosed {
                        channel: "telephony",
                        reason: error.unwrap_or_else(|| "closed before the call stopped".into()),
                    });
                }
                self.signal(Signal::TelephonyClosed);
            }
            ChannelEvent::Control(other) => debug!(?other, "Ignoring telephony event"),
        }
    }

    fn on_caller_frame(&mut self, frame: AudioFrame) {
        match self.session.phase() {
            Phase::AwaitingCall => debug!(seq = frame.seq, "Dropping audio before call start"),
            Phase::AwaitingModelReady => {
                if self.pending_inbound.len() >= self.settings.max_buffered_frames {
                    self.pending_inbound.pop_front();
                    self.stats.dropped_call_frames += 1;
                    if self.stats.dropped_call_frames == 1 {
                        warn!(
                            capacity = self.settings.max_buffered_frames,
                            "Model not ready, dropping oldest buffered caller audio"
                        );
                    }
                }
                self.pending_inbound.push_back(frame);
            }
            Phase::Bridging | Phase::Draining => self.forward_to_model(frame),
            Phase::Closed => {}
        }
    }

    fn forward_to_model(&mut self, frame: AudioFrame) {
        let Some(model) = &self.model else {
            return;
        };
        if !model.send(ModelCommand::Audio(frame)) {
            debug!("Model channel closed, caller audio not forwarded");
            return;
        }
        self.stats.call_frames += 1;
        if RELAY_MILESTONES.contains(&self.stats.call_frames) {
            info!(frames = self.stats.call_frames, "Caller audio -> model");
        }
    }

    fn start_call(&mut self, call_id: String, stream_id: Option<String>) {
        let (call_id, scenario) = match self.registry.activate(&call_id, self.telephony.injector()) {
            Ok(claimed) => claimed,
            Err(e) => {
                self.fail(e);
                return;
            }
        };
        let span = tracing::Span::current();
        span.record("call_id", call_id.as_str());
        span.record("scenario", scenario.id.as_str());
        info!(?stream_id, "Call started");

        self.session.bind_call(call_id, stream_id, scenario.id.clone());
        self.transcript = Some(TranscriptSink::new(
            self.settings.transcripts_dir.clone(),
            scenario.id.clone(),
            scenario.name.clone(),
            self.session.started_at().unwrap_or_else(chrono::Utc::now),
        ));
        self.signal(Signal::CallStarted);
        self.handshake_deadline = Some(Instant::now() + self.settings.handshake_timeout);
        self.scenario = Some(scenario);
        let connector = self.connector.clone();
        self.connecting = Some(tokio::spawn(
            async move { connector.connect().await }.in_current_span(),
        ));
    }

    fn on_model_connected(&mut self, result: ConnectResult) {
        let model = match result.map_err(anyhow::Error::from).and_then(|connected| connected) {
            Ok(model) => model,
            Err(e) => {
                self.fail(BridgeError::ModelConnect(e));
                return;
            }
        };
        let Some(scenario) = self.scenario.as_ref() else {
            return;
        };
        if self.session.phase() != Phase::AwaitingModelReady {
            debug!(phase = %self.session.phase(), "Model connected too late, dropping it");
            return;
        }
        debug!(voice = %self.settings.model.voice, "Model connected, configuring session");
        let config = self.settings.model.session_config(scenario);
        if !model.send(ModelCommand::Configure(config)) {
            warn!("Model channel closed before it could be configured");
        }
        self.model = Some(model);
    }

    fn on_model(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Audio(frame) => self.on_model_frame(frame),
            ChannelEvent::Control(ControlEvent::SessionReady { session_id }) => {
                self.on_session_ready(session_id)
            }
            ChannelEvent::Control(ControlEvent::Transcript {
                role,
                text,
                is_final,
            }) => self.on_transcript(role, &text, is_final),
            ChannelEvent::Control(ControlEvent::SpeechStarted) => self.on_speech_started(),
            ChannelEvent::Control(ControlEvent::TranscriptFailed { role }) => {
                debug!(%role, "Transcription failed for a turn");
                if let Some(sink) = self.transcript.as_mut() {
                    sink.abandon(role);
                }
            }
            ChannelEvent::Control(ControlEvent::TurnFinished) => {
                self.stats.patient_turns += 1;
                debug!(turns = self.stats.patient_turns, "Patient finished speaking");
            }
            ChannelEvent::Control(ControlEvent::Error { message }) => {
                warn!(%message, "Model reported an error");
            }
            ChannelEvent::Control(ControlEvent::ChannelClosed { error }) => {
                self.on_model_closed(error)
            }
            ChannelEvent::Control(other) => debug!(?other, "Ignoring model event"),
        }
    }

    fn on_session_ready(&mut self, session_id: String) {
        if self.session.phase() != Phase::AwaitingModelReady {
            debug!(%session_id, "Ignoring repeated session ready");
            return;
        }
        self.signal(Signal::ModelReady);
        if let Err(e) = self.session.bind_model_session(session_id.clone()) {
            warn!(error = %e, "Could not bind model session");
        }
        info!(%session_id, buffered = self.pending_inbound.len(), "Model ready, bridging audio");
        while let Some(frame) = self.pending_inbound.pop_front() {
            self.forward_to_model(frame);
        }
    }

    fn on_model_frame(&mut self, frame: AudioFrame) {
        if self.session.phase() != Phase::Bridging {
            debug!(seq = frame.seq, phase = %self.session.phase(), "Dropping model audio");
            return;
        }
        let seq = frame.seq;
        if !self.telephony.send(TelephonyCommand::Audio(frame)) {
            debug!(seq, "Telephony channel closed, model audio not relayed");
            return;
        }
        if self.telephony.send(TelephonyCommand::Mark(seq)) {
            self.outstanding_marks.push_back(seq);
        }
        self.stats.model_frames += 1;
        if RELAY_MILESTONES.contains(&self.stats.model_frames) {
            info!(frames = self.stats.model_frames, "Model audio -> caller");
        }
    }

    fn on_mark(&mut self, name: &str) {
        let Ok(seq) = name.parse::<u64>() else {
            debug!(%name, "Ignoring foreign mark");
            return;
        };
        if !self.outstanding_marks.contains(&seq) {
            debug!(seq, "Ignoring stale mark");
            return;
        }
        while let Some(done) = self.outstanding_marks.pop_front() {
            if done == seq {
                break;
            }
        }
        self.check_drained();
    }

    fn on_speech_started(&mut self) {
        // Only what is already queued on the call is cleared. Audio still
        // arriving for the interrupted response is relayed; server VAD makes
        // the model cancel that response on its own.
        if self.session.phase() == Phase::Bridging && !self.outstanding_marks.is_empty() {
            let pending = self.outstanding_marks.len();
            if self.telephony.send(TelephonyCommand::Clear) {
                self.stats.clears += 1;
                info!(pending, "Caller barged in, clearing queued audio");
            }
            self.outstanding_marks.clear();
        } else {
            debug!("Caller started speaking");
        }
        if let Some(sink) = self.transcript.as_mut() {
            sink.reserve(Role::Agent);
        }
    }

    fn on_transcript(&mut self, role: Role, text: &str, is_final: bool) {
        let Some(sink) = self.transcript.as_mut() else {
            debug!(%role, "Transcript before call start ignored");
            return;
        };
        if !is_final {
            sink.record(text, role);
            return;
        }
        if let Some(utterance) = sink.complete(role, text) {
            info!(speaker = %role, text = %utterance.text(), "Utterance");
        }
    }

    fn on_model_closed(&mut self, error: Option<String>) {
        let reason = error.unwrap_or_else(|| "closed by peer".into());
        match self.session.phase() {
            Phase::AwaitingModelReady | Phase::Bridging => {
                warn!(%reason, "Model channel closed mid-call");
                if self.failure.is_none() {
                    self.failure = Some(BridgeError::ChannelClosed {
                        channel: "model",
                        reason,
                    });
                }
                self.signal(Signal::ModelClosed);
            }
            phase => debug!(%phase, %reason, "Model channel closed"),
        }
    }

    fn on_deadline(&mut self) {
        match self.session.phase() {
            Phase::AwaitingModelReady => {
                self.fail(BridgeError::HandshakeTimeout(self.settings.handshake_timeout));
            }
            Phase::Draining => {
                debug!(
                    outstanding = self.outstanding_marks.len(),
                    "Drain grace elapsed"
                );
                self.signal(Signal::Drained);
            }
            _ => {}
        }
    }

    fn check_drained(&mut self) {
        if self.session.phase() == Phase::Draining && self.outstanding_marks.is_empty() {
            debug!("Queued audio played out");
            self.signal(Signal::Drained);
        }
    }

    fn fail(&mut self, err: BridgeError) {
        error!(error = %err, call_id = ?self.session.call_id(), "Bridge failed");
        if self.failure.is_none() {
            self.failure = Some(err);
        }
        self.signal(Signal::Fatal);
    }

    fn signal(&mut self, signal: Signal) {
        let from = self.session.phase();
        match self.session.apply(signal) {
            Ok(Some(next)) => {
                info!(%from, to = %next, ?signal, "Phase changed");
                if next == Phase::Draining {
                    self.drain_deadline = Some(Instant::now() + self.settings.drain_grace);
                    self.check_drained();
                }
            }
            Ok(None) => debug!(phase = %from, ?signal, "Signal does not change phase"),
            Err(e) => error!(error = %e, "Rejected phase change"),
        }
    }

    async fn teardown(mut self) -> BridgeReport {
        if let Some(connecting) = self.connecting.take() {
            debug!("Abandoning model connect");
            connecting.abort();
        }
        let timeout = self.settings.close_timeout;
        let model = self.model.as_mut();
        let close_model = async move {
            if let Some(model) = model {
                model.close(timeout).await;
            }
        };
        tokio::join!(close_model, self.telephony.close(timeout));

        let call_id = self.session.call_id().map(str::to_string);
        let mut transcript = None;
        if let (Some(sink), Some(call_id)) = (self.transcript.as_mut(), call_id.as_deref()) {
            match sink.flush(call_id).await {
                Ok(path) => transcript = Some(path),
                Err(e) => error!(error = %e, "Transcript was not saved"),
            }
        }

        if let Some(call_id) = call_id.as_deref() {
            self.registry.release(call_id);
            if !self.call_stopped {
                hang_up(self.call_control.as_deref(), call_id).await;
            }
        }

        info!(
            call_frames = self.stats.call_frames,
            model_frames = self.stats.model_frames,
            clears = self.stats.clears,
            failed = self.failure.is_some(),
            "Bridge closed"
        );
        BridgeReport {
            call_id,
            scenario_id: self.session.scenario_id().map(str::to_string),
            model_session_id: self.session.model_session_id().map(str::to_string),
            phases: self.session.history().to_vec(),
            transcript,
            stats: self.stats,
            failure: self.failure,
        }
    }
}

async fn hang_up(call_control: Option<&dyn CallControl>, call_id: &str) {
    let Some(call_control) = call_control else {
        return;
    };
    info!(%call_id, "Ending call early");
    if let Err(e) = call_control.hangup(call_id).await {
        warn!(%call_id, error = ?e, "Hangup failed");
    }
}

async fn next_model_event(model: &mut Option<ChannelHandle<ModelCommand>>) -> ChannelEvent {
    match model {
        Some(model) => model.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_connection(connecting: &mut Option<Connecting>) -> ConnectResult {
    match connecting {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel;

    struct NeverConnects;

    #[async_trait]
    impl ModelConnector for NeverConnects {
        async fn connect(&self) -> anyhow::Result<ChannelHandle<ModelCommand>> {
            anyhow::bail!("unreachable in these tests")
        }
    }

    fn controller() -> (BridgeController, channel::ChannelEndpoint<TelephonyCommand>) {
        let (handle, endpoint) = channel::pair("telephony");
        let controller = BridgeController::new(
            handle,
            Arc::new(CallRegistry::new()),
            Arc::new(NeverConnects),
            BridgeSettings::default(),
        );
        (controller, endpoint)
    }

    #[tokio::test]
    async fn test_telephony_close_before_start_ends_quietly() {
        let (controller, endpoint) = controller();
        drop(endpoint);
        let report = controller.run().await;

        assert_eq!(report.phases, vec![Phase::AwaitingCall, Phase::Closed]);
        assert!(report.failure.is_none());
        assert!(report.transcript.is_none());
    }

    #[tokio::test]
    async fn test_audio_before_call_start_is_dropped() {
        let (controller, endpoint) = controller();
        let frame = AudioFrame::new(crate::generic_types::FrameSource::Call, 0, "AAAA");
        assert!(endpoint.emit(ChannelEvent::Audio(frame)).await);
        drop(endpoint);
        let report = controller.run().await;

        assert_eq!(report.stats.call_frames, 0);
        assert_eq!(report.stats.dropped_call_frames, 0);
    }

    #[test]
    fn test_mark_retires_everything_up_to_it() {
        let (mut controller, _endpoint) = controller();
        controller.outstanding_marks.extend([3, 4, 5, 6]);
        controller.on_mark("5");
        assert_eq!(controller.outstanding_marks, VecDeque::from([6]));

        controller.on_mark("2");
        controller.on_mark("not-ours");
        assert_eq!(controller.outstanding_marks, VecDeque::from([6]));
    }
}
