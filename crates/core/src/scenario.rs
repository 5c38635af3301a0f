//! Scenario catalog
//!
//! A scenario describes one patient persona the simulator plays during a call.
//! The catalog is loaded once at startup and shared read-only by every bridge.

use crate::generic_types::{AudioCodec, SessionConfig, TurnDetection};
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::Path;

const BUILTIN_SCENARIOS: &str = include_str!("../scenarios.json");

const KICKOFF_CUE: &str = "The receptionist just answered the phone and greeted you. \
Introduce yourself and state your reason for calling.";

/// One patient persona.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    pub id: String,
    pub name: String,
    pub system_prompt: String,
    pub opening_line: String,
}

impl Scenario {
    /// Full role-play instructions for the speech model.
    pub fn instructions(&self) -> String {
        format!(
            "You are role-playing as a patient phoning a medical office. The person \
             answering is the office's AI receptionist.\n\n\
             RULES:\n\
             - Stay in character as the patient described below for the whole call\n\
             - Speak naturally, the way people talk on the phone\n\
             - Keep each reply to one to three sentences\n\
             - Never narrate actions or use stage directions\n\
             - When the receptionist asks for details your character knows, give them\n\
             - When the conversation reaches its natural end, say goodbye politely\n\n\
             PATIENT PERSONA:\n{}\n\n\
             Open the conversation with something like: \"{}\"",
            self.system_prompt, self.opening_line
        )
    }
}

/// Model-side knobs shared by every call.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSettings {
    pub voice: String,
    pub transcription_model: String,
    pub temperature: f32,
    pub turn_detection: TurnDetection,
    /// Prompt the model to speak before the agent does.
    pub patient_speaks_first: bool,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            voice: "alloy".to_string(),
            transcription_model: "whisper-1".to_string(),
            temperature: 0.8,
            turn_detection: TurnDetection::default(),
            patient_speaks_first: false,
        }
    }
}

impl ModelSettings {
    /// Builds the handshake payload for a call playing `scenario`.
    pub fn session_config(&self, scenario: &Scenario) -> SessionConfig {
        SessionConfig {
            instructions: scenario.instructions(),
            voice: self.voice.clone(),
            input_format: AudioCodec::G711Ulaw,
            output_format: AudioCodec::G711Ulaw,
            transcription_model: self.transcription_model.clone(),
            turn_detection: self.turn_detection.clone(),
            temperature: self.temperature,
            kickoff: self
                .patient_speaks_first
                .then(|| KICKOFF_CUE.to_string()),
        }
    }
}

/// Ordered, read-only list of scenarios.
#[derive(Debug, Clone)]
pub struct ScenarioCatalog {
    scenarios: Vec<Scenario>,
}

impl ScenarioCatalog {
    pub fn new(scenarios: Vec<Scenario>) -> Result<Self> {
        if scenarios.is_empty() {
            bail!("Scenario catalog is empty");
        }
        for (i, scenario) in scenarios.iter().enumerate() {
            if scenarios[..i].iter().any(|s| s.id == scenario.id) {
                bail!("Duplicate scenario id '{}'", scenario.id);
            }
        }
        Ok(Self { scenarios })
    }

    /// The catalog shipped with the service.
    pub fn builtin() -> Result<Self> {
        Self::from_json(BUILTIN_SCENARIOS).context("Built-in scenario catalog is invalid")
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let scenarios: Vec<Scenario> = serde_json::from_str(json)?;
        Self::new(scenarios)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenarios from {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("Invalid scenario file {}", path.display()))
    }

    pub fn get(&self, index: usize) -> Option<&Scenario> {
        self.scenarios.get(index)
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Scenario> {
        self.scenarios.iter()
    }
}
