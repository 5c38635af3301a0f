//! Per-call session record and the bridge phase machine.
//!
//! A `CallSession` is owned by exactly one bridge controller and is only ever
//! mutated by it. Phase changes go through [`CallSession::transition`], which
//! rejects anything the machine below does not allow.

use crate::error::SessionError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Lifecycle phase of a bridged call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    AwaitingCall,
    AwaitingModelReady,
    Bridging,
    Draining,
    Closed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::AwaitingCall => "awaiting-call",
            Phase::AwaitingModelReady => "awaiting-model-ready",
            Phase::Bridging => "bridging",
            Phase::Draining => "draining",
            Phase::Closed => "closed",
        };
        f.write_str(name)
    }
}

impl Phase {
    /// Whether the machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (AwaitingCall, AwaitingModelReady)
                | (AwaitingModelReady, Bridging)
                | (Bridging, Draining)
                | (Draining, Closed)
        ) || (self != Closed && next == Closed)
    }
}

/// Lifecycle signals that may move a session between phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Telephony announced the call.
    CallStarted,
    /// Model finished its handshake.
    ModelReady,
    /// Telephony stopped the stream.
    CallStopped,
    /// Model connection went away.
    ModelClosed,
    /// Telephony connection went away.
    TelephonyClosed,
    /// In-flight outbound audio has been delivered or the grace period ran out.
    Drained,
    /// Unrecoverable failure (connect error, handshake timeout).
    Fatal,
}

/// The phase a session in `phase` moves to on `signal`, or `None` when the
/// signal does not change the phase.
pub fn phase_after(phase: Phase, signal: Signal) -> Option<Phase> {
    use Phase::*;
    match (phase, signal) {
        (Closed, _) => None,
        (AwaitingCall, Signal::CallStarted) => Some(AwaitingModelReady),
        (AwaitingModelReady, Signal::ModelReady) => Some(Bridging),
        (Bridging, Signal::CallStopped | Signal::ModelClosed) => Some(Draining),
        (Draining, Signal::Drained) => Some(Closed),
        // Nothing is left to deliver to once the call leg is gone.
        (_, Signal::TelephonyClosed | Signal::Fatal) => Some(Closed),
        // Before bridging there is no queued audio to drain.
        (AwaitingModelReady, Signal::CallStopped | Signal::ModelClosed) => Some(Closed),
        _ => None,
    }
}

/// Mutable record of one phone call, owned by its bridge controller.
#[derive(Debug, Clone)]
pub struct CallSession {
    call_id: Option<String>,
    stream_id: Option<String>,
    model_session_id: Option<String>,
    scenario_id: Option<String>,
    phase: Phase,
    history: Vec<Phase>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

impl Default for CallSession {
    fn default() -> Self {
        Self::new()
    }
}

impl CallSession {
    pub fn new() -> Self {
        Self {
            call_id: None,
            stream_id: None,
            model_session_id: None,
            scenario_id: None,
            phase: Phase::AwaitingCall,
            history: vec![Phase::AwaitingCall],
            started_at: None,
            ended_at: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Every phase the session has been in, oldest first.
    pub fn history(&self) -> &[Phase] {
        &self.history
    }

    pub fn call_id(&self) -> Option<&str> {
        self.call_id.as_deref()
    }

    pub fn stream_id(&self) -> Option<&str> {
        self.stream_id.as_deref()
    }

    pub fn model_session_id(&self) -> Option<&str> {
        self.model_session_id.as_deref()
    }

    pub fn scenario_id(&self) -> Option<&str> {
        self.scenario_id.as_deref()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Records the call this session carries and stamps the start time.
    pub fn bind_call(&mut self, call_id: String, stream_id: Option<String>, scenario_id: String) {
        self.call_id = Some(call_id);
        self.stream_id = stream_id;
        self.scenario_id = Some(scenario_id);
        self.started_at = Some(Utc::now());
    }

    /// Binds the model-side session id. Allowed once, and only after the
    /// model reported ready.
    pub fn bind_model_session(&mut self, session_id: String) -> Result<(), SessionError> {
        if let Some(existing) = &self.model_session_id {
            return Err(SessionError::ModelSessionAlreadyBound(existing.clone()));
        }
        if !matches!(self.phase, Phase::Bridging | Phase::Draining) {
            return Err(SessionError::ModelNotReady(self.phase));
        }
        self.model_session_id = Some(session_id);
        Ok(())
    }

    pub fn transition(&mut self, next: Phase) -> Result<(), SessionError> {
        if !self.phase.can_transition_to(next) {
            return Err(SessionError::IllegalTransition {
                from: self.phase,
                to: next,
            });
        }
        self.phase = next;
        self.history.push(next);
        if next == Phase::Closed {
            self.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Applies a lifecycle signal, returning the new phase if it changed.
    pub fn apply(&mut self, signal: Signal) -> Result<Option<Phase>, SessionError> {
        match phase_after(self.phase, signal) {
            Some(next) => {
                self.transition(next)?;
                Ok(Some(next))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_SIGNALS: [Signal; 7] = [
        Signal::CallStarted,
        Signal::ModelReady,
        Signal::CallStopped,
        Signal::ModelClosed,
        Signal::TelephonyClosed,
        Signal::Drained,
        Signal::Fatal,
    ];

    #[test]
    fn test_only_call_started_advances_from_awaiting_call() {
        for signal in ALL_SIGNALS {
            let next = phase_after(Phase::AwaitingCall, signal);
            match signal {
                Signal::CallStarted => assert_eq!(next, Some(Phase::AwaitingModelReady)),
                Signal::TelephonyClosed | Signal::Fatal => assert_eq!(next, Some(Phase::Closed)),
                _ => assert_eq!(next, None, "{signal:?} must not move awaiting-call"),
            }
        }
    }

    #[test]
    fn test_closed_ignores_every_signal() {
        for signal in ALL_SIGNALS {
            assert_eq!(phase_after(Phase::Closed, signal), None);
        }
    }

    #[test]
    fn test_happy_path_history() {
        let mut session = CallSession::new();
        session.apply(Signal::CallStarted).unwrap();
        session.apply(Signal::ModelReady).unwrap();
        session.apply(Signal::CallStopped).unwrap();
        session.apply(Signal::Drained).unwrap();

        assert_eq!(
            session.history(),
            &[
                Phase::AwaitingCall,
                Phase::AwaitingModelReady,
                Phase::Bridging,
                Phase::Draining,
                Phase::Closed
            ]
        );
        assert!(session.ended_at().is_some());
    }

    #[test]
    fn test_bridging_signals_that_keep_phase() {
        assert_eq!(phase_after(Phase::Bridging, Signal::CallStarted), None);
        assert_eq!(phase_after(Phase::Bridging, Signal::ModelReady), None);
        assert_eq!(phase_after(Phase::Bridging, Signal::Drained), None);
    }

    #[test]
    fn test_model_close_while_bridging_drains() {
        assert_eq!(
            phase_after(Phase::Bridging, Signal::ModelClosed),
            Some(Phase::Draining)
        );
        assert_eq!(
            phase_after(Phase::Bridging, Signal::TelephonyClosed),
            Some(Phase::Closed)
        );
    }

    #[test]
    fn test_illegal_transition_is_rejected() {
        let mut session = CallSession::new();
        let err = session.transition(Phase::Bridging).unwrap_err();
        assert_eq!(
            err,
            SessionError::IllegalTransition {
                from: Phase::AwaitingCall,
                to: Phase::Bridging
            }
        );
        assert_eq!(session.phase(), Phase::AwaitingCall);
        assert_eq!(session.history().len(), 1);
    }

    #[test]
    fn test_closed_is_terminal() {
        let mut session = CallSession::new();
        session.transition(Phase::Closed).unwrap();
        assert!(session.transition(Phase::Closed).is_err());
        assert_eq!(session.apply(Signal::CallStarted), Ok(None));
    }

    #[test]
    fn test_model_session_binds_once_after_ready() {
        let mut session = CallSession::new();
        assert_eq!(
            session.bind_model_session("sess_1".into()),
            Err(SessionError::ModelNotReady(Phase::AwaitingCall))
        );

        session.apply(Signal::CallStarted).unwrap();
        session.apply(Signal::ModelReady).unwrap();
        session.bind_model_session("sess_1".into()).unwrap();
        assert_eq!(session.model_session_id(), Some("sess_1"));

        assert_eq!(
            session.bind_model_session("sess_2".into()),
            Err(SessionError::ModelSessionAlreadyBound("sess_1".into()))
        );
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::AwaitingModelReady.to_string(), "awaiting-model-ready");
        assert_eq!(Phase::Closed.to_string(), "closed");
    }
}
