//! Process-wide table of calls this service placed.
//!
//! A call is inserted as *pending* when it is originated, becomes *active*
//! when its media stream announces it to a bridge, and is removed when that
//! bridge closes (or when the call hangs up before it ever streamed).

use crate::error::BridgeError;
use crate::generic_types::{ChannelEvent, ControlEvent};
use crate::scenario::Scenario;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::{sync::mpsc, task::AbortHandle};
use tracing::{debug, info};

/// Media streams sometimes report a call id that differs from the one the
/// REST API returned after this many characters.
const PREFIX_MATCH_LEN: usize = 16;

/// Leading characters two ids must share to count as the same call. Ids too
/// short to carry a full prefix only ever match exactly.
fn match_prefix(call_id: &str) -> Option<&str> {
    call_id
        .char_indices()
        .nth(PREFIX_MATCH_LEN)
        .map(|(end, _)| &call_id[..end])
        .or_else(|| (call_id.chars().count() == PREFIX_MATCH_LEN).then_some(call_id))
}

#[derive(Debug)]
struct CallEntry {
    scenario: Scenario,
    placed_at: DateTime<Utc>,
    bridge: Option<mpsc::WeakSender<ChannelEvent>>,
    timer: Option<AbortHandle>,
}

impl CallEntry {
    fn is_bridged(&self) -> bool {
        self.bridge.is_some()
    }
}

/// What a hangup notification found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HangupOutcome {
    /// Not a call we know about.
    Unknown,
    /// The call never reached a bridge; its entry was dropped.
    Pending,
    /// A live bridge was told the call stopped.
    Bridged,
}

#[derive(Debug, Default)]
pub struct CallRegistry {
    calls: Mutex<HashMap<String, CallEntry>>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn calls(&self) -> MutexGuard<'_, HashMap<String, CallEntry>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records an originated call that has not started streaming yet.
    pub fn expect_call(&self, call_id: impl Into<String>, scenario: Scenario) {
        let call_id = call_id.into();
        debug!(%call_id, scenario = %scenario.id, "Call registered as pending");
        self.calls().insert(
            call_id,
            CallEntry {
                scenario,
                placed_at: Utc::now(),
                bridge: None,
                timer: None,
            },
        );
    }

    pub fn contains(&self, call_id: &str) -> bool {
        self.calls().contains_key(call_id)
    }

    pub fn placed_at(&self, call_id: &str) -> Option<DateTime<Utc>> {
        self.calls().get(call_id).map(|entry| entry.placed_at)
    }

    /// Number of calls with a live bridge.
    pub fn active_calls(&self) -> usize {
        self.calls().values().filter(|e| e.is_bridged()).count()
    }

    /// Number of tracked calls, pending or active.
    pub fn len(&self) -> usize {
        self.calls().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls().is_empty()
    }

    /// Claims a pending call for a bridge. Returns the registered call id and
    /// its scenario.
    pub fn activate(
        &self,
        call_id: &str,
        bridge: mpsc::WeakSender<ChannelEvent>,
    ) -> Result<(String, Scenario), BridgeError> {
        if call_id.is_empty() {
            return Err(BridgeError::UnknownCall(String::new()));
        }
        let mut calls = self.calls();
        let key = if calls.contains_key(call_id) {
            call_id.to_string()
        } else {
            let prefix = match_prefix(call_id)
                .ok_or_else(|| BridgeError::UnknownCall(call_id.to_string()))?;
            calls
                .keys()
                .find(|known| match_prefix(known) == Some(prefix))
                .cloned()
                .ok_or_else(|| BridgeError::UnknownCall(call_id.to_string()))?
        };
        let entry = calls
            .get_mut(&key)
            .ok_or_else(|| BridgeError::UnknownCall(call_id.to_string()))?;
        if entry.is_bridged() {
            return Err(BridgeError::CallAlreadyBridged(key));
        }
        entry.bridge = Some(bridge);
        info!(call_id = %key, scenario = %entry.scenario.id, "Call bridged");
        Ok((key, entry.scenario.clone()))
    }

    /// Scenario of a tracked call.
    pub fn scenario_for(&self, call_id: &str) -> Option<Scenario> {
        self.calls().get(call_id).map(|entry| entry.scenario.clone())
    }

    /// Attaches the max-duration timer for a call. Returns `false` (and aborts
    /// the timer) if the call is not tracked.
    pub fn set_timer(&self, call_id: &str, timer: AbortHandle) -> bool {
        match self.calls().get_mut(call_id) {
            Some(entry) => {
                if let Some(previous) = entry.timer.replace(timer) {
                    previous.abort();
                }
                true
            }
            None => {
                timer.abort();
                false
            }
        }
    }

    /// Handles a call-ended notification from call control.
    pub async fn hangup(&self, call_id: &str) -> HangupOutcome {
        let bridge = {
            let mut calls = self.calls();
            let Some(entry) = calls.get_mut(call_id) else {
                return HangupOutcome::Unknown;
            };
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
            let bridge = entry.bridge.as_ref().map(|bridge| bridge.upgrade());
            if bridge.is_none() {
                calls.remove(call_id);
                return HangupOutcome::Pending;
            }
            bridge.flatten()
        };
        if let Some(tx) = bridge {
            if tx
                .send(ChannelEvent::Control(ControlEvent::CallStopped))
                .await
                .is_err()
            {
                debug!(%call_id, "Bridge already gone when hangup arrived");
            }
        }
        HangupOutcome::Bridged
    }

    /// Removes a call once its bridge has closed.
    pub fn release(&self, call_id: &str) {
        if let Some(entry) = self.calls().remove(call_id) {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
            debug!(%call_id, "Call released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel;

    fn scenario() -> Scenario {
        Scenario {
            id: "reschedule".into(),
            name: "Reschedule".into(),
            system_prompt: "You are Mike.".into(),
            opening_line: "Hi.".into(),
        }
    }

    #[test]
    fn test_activate_exact_match() {
        let registry = CallRegistry::new();
        registry.expect_call("v3:call-control-0001", scenario());
        let (handle, _endpoint) = channel::pair::<()>("telephony");

        let (call_id, scenario) = registry
            .activate("v3:call-control-0001", handle.injector())
            .unwrap();
        assert_eq!(call_id, "v3:call-control-0001");
        assert_eq!(scenario.id, "reschedule");
        assert_eq!(registry.active_calls(), 1);
    }

    #[test]
    fn test_activate_prefix_fallback() {
        let registry = CallRegistry::new();
        registry.expect_call("v3:abcdefghijklmnop-suffix-a", scenario());
        let (handle, _endpoint) = channel::pair::<()>("telephony");

        let (call_id, _) = registry
            .activate("v3:abcdefghijklmnop-other", handle.injector())
            .unwrap();
        assert_eq!(call_id, "v3:abcdefghijklmnop-suffix-a");
    }

    #[test]
    fn test_activate_unknown_call() {
        let registry = CallRegistry::new();
        let (handle, _endpoint) = channel::pair::<()>("telephony");
        let err = registry.activate("nope", handle.injector()).unwrap_err();
        assert!(matches!(err, BridgeError::UnknownCall(id) if id == "nope"));
    }

    #[test]
    fn test_activate_empty_id_claims_nothing() {
        let registry = CallRegistry::new();
        registry.expect_call("v3:real-call-control-id", scenario());
        let (handle, _endpoint) = channel::pair::<()>("telephony");

        let err = registry.activate("", handle.injector()).unwrap_err();
        assert!(matches!(err, BridgeError::UnknownCall(id) if id.is_empty()));
        assert_eq!(registry.active_calls(), 0);
    }

    #[test]
    fn test_activate_short_id_needs_exact_match() {
        let registry = CallRegistry::new();
        registry.expect_call("v3:real-call-control-id", scenario());
        registry.expect_call("v3:real", scenario());
        let (handle, _endpoint) = channel::pair::<()>("telephony");

        for short in ["v3:", "v3:real-call"] {
            let err = registry.activate(short, handle.injector()).unwrap_err();
            assert!(matches!(err, BridgeError::UnknownCall(_)));
        }
        // A full-length id never falls back onto a short registered one.
        let err = registry
            .activate("v3:realXXXXXXXXXXXXXX", handle.injector())
            .unwrap_err();
        assert!(matches!(err, BridgeError::UnknownCall(_)));
        assert_eq!(registry.active_calls(), 0);

        let (call_id, _) = registry.activate("v3:real", handle.injector()).unwrap();
        assert_eq!(call_id, "v3:real");
    }

    #[test]
    fn test_match_prefix_requires_full_length() {
        assert_eq!(match_prefix(""), None);
        assert_eq!(match_prefix("v3:abcdefghijkl"), None);
        assert_eq!(match_prefix("v3:abcdefghijklm"), Some("v3:abcdefghijklm"));
        assert_eq!(match_prefix("v3:abcdefghijklmnop"), Some("v3:abcdefghijklm"));
    }

    #[test]
    fn test_second_bridge_for_same_call_is_rejected() {
        let registry = CallRegistry::new();
        registry.expect_call("call-1", scenario());
        let (first, _e1) = channel::pair::<()>("telephony");
        let (second, _e2) = channel::pair::<()>("telephony");

        registry.activate("call-1", first.injector()).unwrap();
        let err = registry.activate("call-1", second.injector()).unwrap_err();
        assert!(matches!(err, BridgeError::CallAlreadyBridged(_)));
    }

    #[tokio::test]
    async fn test_hangup_of_pending_call_drops_it() {
        let registry = CallRegistry::new();
        registry.expect_call("call-1", scenario());
        assert_eq!(registry.hangup("call-1").await, HangupOutcome::Pending);
        assert!(!registry.contains("call-1"));
        assert_eq!(registry.hangup("call-1").await, HangupOutcome::Unknown);
    }

    #[tokio::test]
    async fn test_hangup_of_bridged_call_injects_stop() {
        let registry = CallRegistry::new();
        registry.expect_call("call-1", scenario());
        let (mut handle, _endpoint) = channel::pair::<()>("telephony");
        registry.activate("call-1", handle.injector()).unwrap();

        assert_eq!(registry.hangup("call-1").await, HangupOutcome::Bridged);
        assert_eq!(
            handle.recv().await,
            ChannelEvent::Control(ControlEvent::CallStopped)
        );
        assert!(registry.contains("call-1"));

        registry.release("call-1");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_release_aborts_timer() {
        let registry = CallRegistry::new();
        registry.expect_call("call-1", scenario());
        let timer = tokio::spawn(std::future::pending::<()>());
        assert!(registry.set_timer("call-1", timer.abort_handle()));

        registry.release("call-1");
        let joined = timer.await;
        assert!(joined.unwrap_err().is_cancelled());
    }
}
