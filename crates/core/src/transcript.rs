//! Speaker-attributed transcript accumulation and artifact writing.

use crate::error::TranscriptError;
use crate::generic_types::Role;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One speaker turn, built from fragments in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    role: Role,
    fragments: Vec<String>,
    finalized: bool,
}

impl Utterance {
    fn new(role: Role) -> Self {
        Self {
            role,
            fragments: Vec::new(),
            finalized: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn fragments(&self) -> &[String] {
        &self.fragments
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// The fragments concatenated in arrival order.
    pub fn text(&self) -> String {
        self.fragments.concat()
    }
}

/// Append-only transcript for a single call.
///
/// Each role has at most one open utterance at a time. Finalized utterances
/// are never touched again. The artifact path is fixed on the first flush, so
/// flushing again rewrites the same file with the same content.
#[derive(Debug)]
pub struct TranscriptSink {
    dir: PathBuf,
    scenario_id: String,
    scenario_name: String,
    started_at: DateTime<Utc>,
    utterances: Vec<Utterance>,
    open: HashMap<Role, usize>,
    artifact: Option<PathBuf>,
}

impl TranscriptSink {
    pub fn new(
        dir: impl Into<PathBuf>,
        scenario_id: impl Into<String>,
        scenario_name: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            dir: dir.into(),
            scenario_id: scenario_id.into(),
            scenario_name: scenario_name.into(),
            started_at,
            utterances: Vec::new(),
            open: HashMap::new(),
            artifact: None,
        }
    }

    pub fn utterances(&self) -> &[Utterance] {
        &self.utterances
    }

    pub fn finalized(&self) -> impl Iterator<Item = &Utterance> {
        self.utterances.iter().filter(|u| u.finalized)
    }

    pub fn has_open(&self, role: Role) -> bool {
        self.open.contains_key(&role)
    }

    /// Reserves the next transcript slot for `role` without adding text.
    /// No-op when an utterance for that role is already open.
    pub fn open(&mut self, role: Role) {
        if !self.open.contains_key(&role) {
            self.utterances.push(Utterance::new(role));
            self.open.insert(role, self.utterances.len() - 1);
        }
    }

    /// Holds a slot for a turn that has started but has no text yet.
    ///
    /// Unlike [`open`](Self::open), an empty slot for `role` that other
    /// speakers have since written past is retired and a fresh one is taken
    /// at the end, so a turn whose text never arrived cannot pull a later
    /// turn ahead of the ones it followed.
    pub fn reserve(&mut self, role: Role) {
        if let Some(&idx) = self.open.get(&role) {
            let stale =
                self.utterances[idx].fragments.is_empty() && idx + 1 < self.utterances.len();
            if !stale {
                return;
            }
            debug!(%role, "Retiring empty transcript slot");
            self.open.remove(&role);
        }
        self.open(role);
    }

    /// Gives up on the open utterance for `role`. Text already streamed is
    /// kept as a finished turn; an empty slot is simply dropped.
    pub fn abandon(&mut self, role: Role) {
        let Some(&idx) = self.open.get(&role) else {
            return;
        };
        if self.utterances[idx].fragments.is_empty() {
            self.open.remove(&role);
        } else {
            self.finalize(role);
        }
    }

    /// Appends a fragment to the open utterance for `role`, opening one if needed.
    pub fn record(&mut self, fragment: &str, role: Role) {
        if fragment.is_empty() {
            return;
        }
        self.open(role);
        if let Some(&idx) = self.open.get(&role) {
            self.utterances[idx].fragments.push(fragment.to_string());
        }
    }

    /// Closes the open utterance for `role`. No-op if none is open.
    pub fn finalize(&mut self, role: Role) -> Option<&Utterance> {
        let idx = self.open.remove(&role)?;
        let utterance = &mut self.utterances[idx];
        utterance.finalized = true;
        Some(&*utterance)
    }

    /// Closes the open utterance for `role` using the peer's complete text for
    /// the turn. The text is only recorded when no fragments streamed in.
    pub fn complete(&mut self, role: Role, full_text: &str) -> Option<&Utterance> {
        let streamed = self
            .open
            .get(&role)
            .is_some_and(|&idx| !self.utterances[idx].fragments.is_empty());
        if !streamed {
            self.record(full_text.trim(), role);
        }
        self.finalize(role)
    }

    /// Path the artifact for `call_id` is (or will be) written to.
    pub fn artifact_path(&self, call_id: &str) -> PathBuf {
        if let Some(path) = &self.artifact {
            return path.clone();
        }
        let call_tag: String = call_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(12)
            .collect();
        let file_name = format!(
            "{}_{}_{}.txt",
            self.scenario_id,
            self.started_at.format("%Y%m%d_%H%M%S"),
            if call_tag.is_empty() { "call".to_string() } else { call_tag },
        );
        self.dir.join(file_name)
    }

    /// Renders the finalized, non-empty utterances in order.
    pub fn render(&self, call_id: &str) -> String {
        let turns: Vec<&Utterance> = self
            .finalized()
            .filter(|u| !u.fragments.is_empty())
            .collect();
        let mut out = format!(
            "Scenario: {}\nCall:     {}\nStarted:  {}\nTurns:    {}\n",
            self.scenario_name,
            call_id,
            self.started_at.to_rfc3339(),
            turns.len()
        );
        for utterance in turns {
            out.push_str(&format!("\n[{}]: {}\n", utterance.role.label(), utterance.text()));
        }
        out
    }

    /// Writes the transcript artifact for the call and returns its path.
    pub async fn flush(&mut self, call_id: &str) -> Result<PathBuf, TranscriptError> {
        let path = self.artifact_path(call_id);
        let open = self.open.len();
        if open > 0 {
            debug!(open, "Unfinished utterances are left out of the transcript");
        }
        write_artifact(&self.dir, &path, self.render(call_id)).await?;
        self.artifact = Some(path.clone());
        info!(path = %path.display(), "Transcript saved");
        Ok(path)
    }
}

async fn write_artifact(dir: &Path, path: &Path, contents: String) -> Result<(), TranscriptError> {
    let io_err = |source| TranscriptError::Io {
        path: path.to_path_buf(),
        source,
    };
    tokio::fs::create_dir_all(dir).await.map_err(io_err)?;
    tokio::fs::write(path, contents).await.map_err(io_err)
}
