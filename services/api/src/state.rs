//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the read-only
//! configuration and the service clients every handler and bridge shares.

use crate::config::Config;
use crate::telnyx::TelnyxClient;
use patient_sim_core::{BridgeSettings, CallRegistry, ModelConnector, ScenarioCatalog};
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub catalog: Arc<ScenarioCatalog>,
    pub registry: Arc<CallRegistry>,
    pub telnyx: Arc<TelnyxClient>,
    pub connector: Arc<dyn ModelConnector>,
    /// Per-bridge settings derived from `config`.
    pub settings: BridgeSettings,
}

impl AppState {
    pub fn new(
        config: Config,
        catalog: ScenarioCatalog,
        telnyx: TelnyxClient,
        connector: Arc<dyn ModelConnector>,
    ) -> Self {
        let settings = config.bridge_settings();
        Self {
            config: Arc::new(config),
            catalog: Arc::new(catalog),
            registry: Arc::new(CallRegistry::new()),
            telnyx: Arc::new(telnyx),
            connector,
            settings,
        }
    }
}
