use std::collections::BTreeSet;

use anyhow::Result;
use gift_exchange_core::{
    analyze, generate_assignments_with_attempts, regenerate, validate_complete, Assignment,
    AssignmentError, ParticipantId, ParticipantState, RegenerationClassification,
    RegenerationMode, ValidationOutcome, DEFAULT_MAX_ATTEMPTS,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ApiError {
    #[error("invalid event: {0}")]
    InvalidEvent(String),
    #[error("participant not found: {0}")]
    UnknownParticipant(String),
    #[error("assignments have not been drawn yet")]
    NotDrawn,
    #[error(
        "{0} participant(s) already viewed their assignment; use regenerate to keep their edges"
    )]
    AlreadyRevealed(usize),
    #[error("snapshot changed since it was read: expected {expected}, found {actual}")]
    StaleSnapshot { expected: String, actual: String },
}

impl ApiError {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidEvent(_) => "invalid_event",
            Self::UnknownParticipant(_) => "unknown_participant",
            Self::NotDrawn => "not_drawn",
            Self::AlreadyRevealed(_) => "already_revealed",
            Self::StaleSnapshot { .. } => "stale_snapshot",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GenerationConfig {
    pub max_attempts: usize,
    /// Fixed seed for reproducible draws; entropy when absent.
    pub seed: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self { max_attempts: DEFAULT_MAX_ATTEMPTS, seed: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
    #[serde(default)]
    pub has_viewed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventSnapshot {
    pub event_name: String,
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub assignments: Assignment,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub generated_at: Option<OffsetDateTime>,
}

impl EventSnapshot {
    #[must_use]
    pub fn participant_states(&self) -> Vec<ParticipantState> {
        self.participants
            .iter()
            .map(|participant| ParticipantState {
                id: participant.id.clone(),
                has_viewed: participant.has_viewed,
            })
            .collect()
    }

    #[must_use]
    pub fn participant_ids(&self) -> Vec<ParticipantId> {
        self.participants.iter().map(|participant| participant.id.clone()).collect()
    }

    #[must_use]
    pub fn participant_by_id(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants.iter().find(|participant| &participant.id == id)
    }

    /// Look a participant up by id, falling back to an exact name match.
    #[must_use]
    pub fn find_participant(&self, key: &str) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|participant| participant.id.as_str() == key)
            .or_else(|| self.participants.iter().find(|participant| participant.name == key))
    }

    /// Edges of participants who have already viewed their receiver.
    #[must_use]
    pub fn locked_assignments(&self) -> Assignment {
        let locked = self
            .participants
            .iter()
            .filter(|participant| participant.has_viewed)
            .map(|participant| participant.id.clone())
            .collect::<BTreeSet<_>>();
        self.assignments.restricted_to(&locked)
    }

    #[must_use]
    pub fn viewed_count(&self) -> usize {
        self.participants.iter().filter(|participant| participant.has_viewed).count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DrawResult {
    pub attempts: usize,
    pub snapshot_id: String,
    pub snapshot: EventSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnalysisReport {
    pub snapshot_id: String,
    pub classification: RegenerationClassification,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegenerationReport {
    pub mode: RegenerationMode,
    pub attempts: usize,
    /// Givers whose edge was regenerated; their notification state must be reset.
    pub notification_resets: Vec<ParticipantId>,
    pub preserved_givers: Vec<ParticipantId>,
    pub previous_snapshot_id: String,
    pub snapshot_id: String,
    pub snapshot: EventSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RevealResult {
    pub giver: ParticipantId,
    pub giver_name: String,
    pub receiver: ParticipantId,
    pub receiver_name: String,
    pub first_view: bool,
    pub snapshot_id: String,
    pub snapshot: EventSnapshot,
}

#[derive(Debug, Clone, Default)]
pub struct GiftExchangeApi {
    config: GenerationConfig,
}

impl GiftExchangeApi {
    #[must_use]
    pub fn new(config: GenerationConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    fn rng(&self) -> StdRng {
        match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    /// Create an event with fresh participant ids and no assignments.
    ///
    /// # Errors
    /// Returns [`ApiError::InvalidEvent`] when the event name or any participant
    /// name is blank, or when a name repeats.
    pub fn create_event(&self, event_name: &str, names: &[String]) -> Result<EventSnapshot> {
        if event_name.trim().is_empty() {
            return Err(ApiError::InvalidEvent("event name MUST be non-empty".to_string()).into());
        }
        if names.is_empty() {
            return Err(ApiError::InvalidEvent("at least one participant is required".to_string())
                .into());
        }

        let mut seen = BTreeSet::new();
        let mut participants = Vec::with_capacity(names.len());
        for name in names {
            let name = name.trim();
            if name.is_empty() {
                return Err(ApiError::InvalidEvent(
                    "participant names MUST be non-empty".to_string(),
                )
                .into());
            }
            if !seen.insert(name.to_string()) {
                return Err(ApiError::InvalidEvent(format!("duplicate participant name: {name}"))
                    .into());
            }
            participants.push(Participant {
                id: ParticipantId::generate(),
                name: name.to_string(),
                has_viewed: false,
            });
        }

        info!(event = event_name.trim(), participants = participants.len(), "created event");
        Ok(EventSnapshot {
            event_name: event_name.trim().to_string(),
            participants,
            assignments: Assignment::new(),
            generated_at: None,
        })
    }

    /// Draw a complete assignment set for every participant.
    ///
    /// # Errors
    /// Returns [`ApiError::AlreadyRevealed`] when existing assignments were already
    /// viewed, or the core [`AssignmentError`] when generation fails.
    pub fn draw(&self, snapshot: &EventSnapshot) -> Result<DrawResult> {
        let viewed = snapshot.viewed_count();
        if !snapshot.assignments.is_empty() && viewed > 0 {
            warn!(event = %snapshot.event_name, viewed, "draw refused after reveals");
            return Err(ApiError::AlreadyRevealed(viewed).into());
        }

        let ids = snapshot.participant_ids();
        let mut rng = self.rng();
        let generated =
            generate_assignments_with_attempts(&ids, &mut rng, self.config.max_attempts)?;
        if generated.attempts > 1 {
            warn!(
                event = %snapshot.event_name,
                attempts = generated.attempts,
                "full derangement needed more than one attempt"
            );
        }

        let mut next = snapshot.clone();
        for participant in &mut next.participants {
            participant.has_viewed = false;
        }
        next.assignments = generated.assignment;
        next.generated_at = Some(OffsetDateTime::now_utc());

        let snapshot_id = compute_snapshot_id(&next);
        info!(
            event = %next.event_name,
            participants = ids.len(),
            attempts = generated.attempts,
            snapshot_id = %snapshot_id,
            "drew assignments"
        );
        Ok(DrawResult { attempts: generated.attempts, snapshot_id, snapshot: next })
    }

    /// Classify whether the event can be regenerated right now.
    #[must_use]
    pub fn analyze(&self, snapshot: &EventSnapshot) -> AnalysisReport {
        let classification = analyze(&snapshot.participant_states());
        debug!(
            event = %snapshot.event_name,
            can_regenerate = classification.can_regenerate,
            full = classification.is_full_regeneration,
            locked = classification.locked_ids.len(),
            unlocked = classification.unlocked_ids.len(),
            "classified regeneration"
        );
        AnalysisReport { snapshot_id: compute_snapshot_id(snapshot), classification }
    }

    /// Regenerate assignments, keeping every edge a participant has already seen.
    ///
    /// When `expected_snapshot_id` is given the snapshot must still match it.
    ///
    /// # Errors
    /// Returns [`ApiError::StaleSnapshot`] on a fingerprint mismatch, or the core
    /// [`AssignmentError`] when regeneration is refused or fails.
    pub fn regenerate(
        &self,
        snapshot: &EventSnapshot,
        expected_snapshot_id: Option<&str>,
    ) -> Result<RegenerationReport> {
        let previous_snapshot_id = compute_snapshot_id(snapshot);
        if let Some(expected) = expected_snapshot_id {
            if expected != previous_snapshot_id {
                warn!(
                    event = %snapshot.event_name,
                    expected,
                    actual = %previous_snapshot_id,
                    "stale snapshot"
                );
                return Err(ApiError::StaleSnapshot {
                    expected: expected.to_string(),
                    actual: previous_snapshot_id,
                }
                .into());
            }
        }

        let mut rng = self.rng();
        let regeneration = match regenerate(
            &snapshot.participant_states(),
            &snapshot.assignments,
            &mut rng,
            self.config.max_attempts,
        ) {
            Ok(regeneration) => regeneration,
            Err(err) => {
                warn!(
                    event = %snapshot.event_name,
                    kind = err.kind(),
                    error = %err,
                    "regeneration failed"
                );
                return Err(err.into());
            }
        };

        if regeneration.mode == RegenerationMode::Full && regeneration.attempts > 1 {
            warn!(
                event = %snapshot.event_name,
                attempts = regeneration.attempts,
                "full derangement needed more than one attempt"
            );
        }

        let notification_resets = regeneration.reassigned.givers().cloned().collect::<Vec<_>>();
        let preserved_givers = regeneration
            .assignment
            .givers()
            .filter(|giver| regeneration.reassigned.get(giver).is_none())
            .cloned()
            .collect::<Vec<_>>();

        let mut next = snapshot.clone();
        next.assignments = regeneration.assignment;
        next.generated_at = Some(OffsetDateTime::now_utc());

        let snapshot_id = compute_snapshot_id(&next);
        info!(
            event = %next.event_name,
            mode = regeneration.mode.as_str(),
            attempts = regeneration.attempts,
            reassigned = notification_resets.len(),
            preserved = preserved_givers.len(),
            previous_snapshot_id = %previous_snapshot_id,
            snapshot_id = %snapshot_id,
            "regenerated assignments"
        );

        Ok(RegenerationReport {
            mode: regeneration.mode,
            attempts: regeneration.attempts,
            notification_resets,
            preserved_givers,
            previous_snapshot_id,
            snapshot_id,
            snapshot: next,
        })
    }

    /// Show a participant their receiver and lock them.
    ///
    /// # Errors
    /// Returns [`ApiError::UnknownParticipant`] when `participant` matches no id or
    /// name, or [`ApiError::NotDrawn`] when the participant has no assignment yet.
    pub fn reveal(&self, snapshot: &EventSnapshot, participant: &str) -> Result<RevealResult> {
        let giver = snapshot
            .find_participant(participant)
            .ok_or_else(|| ApiError::UnknownParticipant(participant.to_string()))?;
        let receiver_id = snapshot.assignments.get(&giver.id).ok_or(ApiError::NotDrawn)?;
        let receiver_name = snapshot
            .participant_by_id(receiver_id)
            .map_or_else(|| receiver_id.to_string(), |receiver| receiver.name.clone());

        let first_view = !giver.has_viewed;
        let mut next = snapshot.clone();
        for entry in &mut next.participants {
            if entry.id == giver.id {
                entry.has_viewed = true;
            }
        }

        let snapshot_id = compute_snapshot_id(&next);
        info!(event = %next.event_name, participant = %giver.id, first_view, "revealed assignment");
        Ok(RevealResult {
            giver: giver.id.clone(),
            giver_name: giver.name.clone(),
            receiver: receiver_id.clone(),
            receiver_name,
            first_view,
            snapshot_id,
            snapshot: next,
        })
    }

    /// Validate the stored assignments against the participant list.
    #[must_use]
    pub fn validate(&self, snapshot: &EventSnapshot) -> ValidationOutcome {
        let ids = snapshot.participant_ids();
        let universe = ids.iter().cloned().collect::<BTreeSet<_>>();
        let mut outcome = validate_complete(&universe, &snapshot.assignments);
        if ids.len() != universe.len() {
            outcome.violations.push(format!(
                "{} participant rows share {} distinct ids",
                ids.len(),
                universe.len()
            ));
            outcome.valid = false;
        }
        if !outcome.valid {
            warn!(
                event = %snapshot.event_name,
                violations = outcome.violations.len(),
                "stored assignments are invalid"
            );
        }
        outcome
    }
}

/// Stable error kind for transport layers; `None` for errors outside this crate and the core.
#[must_use]
pub fn error_kind(err: &anyhow::Error) -> Option<&'static str> {
    if let Some(core) = err.downcast_ref::<AssignmentError>() {
        return Some(core.kind());
    }
    err.downcast_ref::<ApiError>().map(ApiError::kind)
}

/// Fingerprint of everything regeneration depends on: participants, view flags, edges.
#[must_use]
pub fn compute_snapshot_id(snapshot: &EventSnapshot) -> String {
    let mut hasher = Sha256::new();
    hasher.update(snapshot.event_name.as_bytes());

    let mut participants = snapshot
        .participants
        .iter()
        .map(|participant| format!("participant:{}:{}", participant.id, participant.has_viewed))
        .collect::<Vec<_>>();
    participants.sort_unstable();
    for value in participants {
        hasher.update(value.as_bytes());
    }

    for (giver, receiver) in snapshot.assignments.iter() {
        hasher.update(format!("edge:{giver}->{receiver}").as_bytes());
    }

    let digest = hasher.finalize();
    let digest_hex = format!("{digest:x}");
    format!("snap_{}", &digest_hex[..16])
}
