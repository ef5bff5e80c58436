//! Best-effort state snapshots.
//!
//! Enough to put a show back on air after a restart: the current question,
//! what has been excluded and which lifelines are spent. An in-flight round
//! is never restored, the phase always comes back as idle.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

use super::PhaseMachine;
use crate::error::{HubError, HubResult};
use crate::types::*;

/// Schema version for snapshot format compatibility
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HubSnapshot {
    pub schema_version: u32,
    /// Export timestamp (RFC 3339)
    pub exported_at: String,
    pub question: Option<Question>,
    pub question_no: u32,
    pub excluded: BTreeSet<AnswerOption>,
    pub lifelines: LifelineState,
    pub moderators: BTreeSet<Identity>,
    /// Keeps generations increasing across restarts
    #[serde(default)]
    pub generation: u64,
}

impl HubSnapshot {
    /// Validate the snapshot before import
    pub fn validate(&self) -> Result<(), String> {
        if self.schema_version > SNAPSHOT_SCHEMA_VERSION {
            return Err(format!(
                "Snapshot schema version {} is newer than supported version {}",
                self.schema_version, SNAPSHOT_SCHEMA_VERSION
            ));
        }

        if let Some(kind) = self
            .lifelines
            .used
            .intersection(&self.lifelines.available_for_vote)
            .next()
        {
            return Err(format!("Lifeline {} is both used and available", kind));
        }

        match &self.question {
            Some(question) if self.excluded.contains(&question.correct) => {
                Err("Snapshot excludes the correct answer".to_string())
            }
            None if !self.excluded.is_empty() => {
                Err("Snapshot has excluded options but no question".to_string())
            }
            _ => Ok(()),
        }
    }
}

impl PhaseMachine {
    pub fn export_snapshot(&self) -> HubSnapshot {
        HubSnapshot {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            exported_at: chrono::Utc::now().to_rfc3339(),
            question: self.game.question.clone(),
            question_no: self.game.question_no,
            excluded: self.game.excluded.clone(),
            lifelines: self.game.lifelines.clone(),
            moderators: self.game.moderators.clone(),
            generation: self.game.generation,
        }
    }

    /// Replace game state from a snapshot. Refused while a round is running.
    pub fn import_snapshot(&mut self, snapshot: HubSnapshot) -> HubResult<()> {
        snapshot.validate().map_err(HubError::MalformedPayload)?;
        if self.game.has_active_round() {
            return Err(HubError::InvalidPhaseAction(
                "cannot import while a round is running".to_string(),
            ));
        }

        self.cancel_pending_timer();
        self.game.question = snapshot.question;
        self.game.question_no = snapshot.question_no;
        self.game.excluded = snapshot.excluded;
        self.game.lifelines = snapshot.lifelines;
        self.game.moderators = snapshot.moderators;
        self.game.generation = self.game.generation.max(snapshot.generation);
        self.game.phase = GamePhase::Idle;
        self.game.locked_answer = None;
        self.game.reveal = None;
        self.game.last_result = None;
        self.game.mod_responses.clear();

        tracing::info!(
            question_no = self.game.question_no,
            exported_at = %snapshot.exported_at,
            "Snapshot imported"
        );
        self.touch();
        Ok(())
    }
}

/// Read a snapshot file. `Ok(None)` if there is none yet.
pub async fn load_snapshot(path: &Path) -> Result<Option<HubSnapshot>, String> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(format!("Failed to read {}: {}", path.display(), e)),
    };
    let snapshot: HubSnapshot = serde_json::from_str(&raw)
        .map_err(|e| format!("Failed to parse {}: {}", path.display(), e))?;
    snapshot.validate()?;
    Ok(Some(snapshot))
}

/// Write through a temp file so a crash never leaves a torn snapshot
pub async fn save_snapshot(path: &Path, snapshot: &HubSnapshot) -> std::io::Result<()> {
    let json = serde_json::to_vec_pretty(snapshot).map_err(std::io::Error::other)?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await
}
