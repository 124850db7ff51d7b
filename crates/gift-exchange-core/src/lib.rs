use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use rand::Rng;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Attempt cap used by the retry controller unless a caller overrides it.
pub const DEFAULT_MAX_ATTEMPTS: usize = 5;
pub const MIN_DERANGEMENT_ITEMS: usize = 2;
pub const MIN_REGENERATION_PARTICIPANTS: usize = 3;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AssignmentError {
    #[error("at least {required} participants are required, got {actual}")]
    InsufficientItems { actual: usize, required: usize },
    #[error("giver/receiver count mismatch: {givers} givers vs {receivers} receivers")]
    CountMismatch { givers: usize, receivers: usize },
    #[error("participant {0} appears more than once")]
    DuplicateParticipant(ParticipantId),
    #[error("regeneration is not possible: {reason}")]
    InsufficientParticipantsForRegeneration { reason: String },
    #[error(
        "assignment impossible: {givers} unlocked givers but {receivers} available receivers"
    )]
    AssignmentImpossible { givers: usize, receivers: usize },
    #[error("locked assignments are inconsistent with participants: {}", .violations.join("; "))]
    LockedStateInconsistent { violations: Vec<String> },
    #[error("no valid assignment after {attempts} attempts")]
    MaxAttemptsExceeded { attempts: usize, violations: Vec<Vec<String>> },
}

impl AssignmentError {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InsufficientItems { .. } => "insufficient_items",
            Self::CountMismatch { .. } => "count_mismatch",
            Self::DuplicateParticipant(_) => "duplicate_participant",
            Self::InsufficientParticipantsForRegeneration { .. } => {
                "insufficient_participants_for_regeneration"
            }
            Self::AssignmentImpossible { .. } => "assignment_impossible",
            Self::LockedStateInconsistent { .. } => "locked_state_inconsistent",
            Self::MaxAttemptsExceeded { .. } => "max_attempts_exceeded",
        }
    }

    /// Violation lists carried by the error, one per failed attempt.
    #[must_use]
    pub fn violations(&self) -> Vec<Vec<String>> {
        match self {
            Self::MaxAttemptsExceeded { violations, .. } => violations.clone(),
            Self::LockedStateInconsistent { violations } => vec![violations.clone()],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Fresh identifier for a participant that has none yet.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ParticipantId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ParticipantId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Giver to receiver mapping.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(transparent)]
pub struct Assignment(BTreeMap<ParticipantId, ParticipantId>);

impl Assignment {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn get(&self, giver: &ParticipantId) -> Option<&ParticipantId> {
        self.0.get(giver)
    }

    pub fn insert(
        &mut self,
        giver: ParticipantId,
        receiver: ParticipantId,
    ) -> Option<ParticipantId> {
        self.0.insert(giver, receiver)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ParticipantId, &ParticipantId)> {
        self.0.iter()
    }

    pub fn givers(&self) -> impl Iterator<Item = &ParticipantId> {
        self.0.keys()
    }

    pub fn receivers(&self) -> impl Iterator<Item = &ParticipantId> {
        self.0.values()
    }

    /// Edges whose giver is in `givers`.
    #[must_use]
    pub fn restricted_to(&self, givers: &BTreeSet<ParticipantId>) -> Self {
        self.iter()
            .filter(|(giver, _)| givers.contains(*giver))
            .map(|(giver, receiver)| (giver.clone(), receiver.clone()))
            .collect()
    }

    /// Union of both edge sets; entries in `other` win on a shared giver.
    #[must_use]
    pub fn merged_with(&self, other: &Self) -> Self {
        let mut merged = self.clone();
        for (giver, receiver) in other.iter() {
            merged.insert(giver.clone(), receiver.clone());
        }
        merged
    }
}

impl FromIterator<(ParticipantId, ParticipantId)> for Assignment {
    fn from_iter<T: IntoIterator<Item = (ParticipantId, ParticipantId)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Injected randomness for the generators.
pub trait RandomSource {
    /// Uniform index in `[0, upper)`; callers guarantee `upper >= 1`.
    fn next_index(&mut self, upper: usize) -> usize;
}

impl<R: Rng + ?Sized> RandomSource for R {
    fn next_index(&mut self, upper: usize) -> usize {
        self.gen_range(0..upper)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ParticipantState {
    pub id: ParticipantId,
    pub has_viewed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RegenerationClassification {
    pub can_regenerate: bool,
    pub is_full_regeneration: bool,
    pub locked_ids: BTreeSet<ParticipantId>,
    pub unlocked_ids: BTreeSet<ParticipantId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub violations: Vec<String>,
}

impl ValidationOutcome {
    #[must_use]
    pub fn from_violations(violations: Vec<String>) -> Self {
        Self { valid: violations.is_empty(), violations }
    }
}

/// Giver and receiver sides of a partial regeneration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct PartialPool {
    pub givers: BTreeSet<ParticipantId>,
    pub receivers: BTreeSet<ParticipantId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Generated {
    pub assignment: Assignment,
    pub attempts: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RegenerationMode {
    Full,
    Partial,
}

impl RegenerationMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Partial => "partial",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Regeneration {
    pub mode: RegenerationMode,
    /// Complete assignment set after the merge.
    pub assignment: Assignment,
    /// Only the edges that were newly generated.
    pub reassigned: Assignment,
    pub attempts: usize,
}

fn ensure_unique(items: &[ParticipantId]) -> Result<(), AssignmentError> {
    let mut seen = BTreeSet::new();
    for item in items {
        if !seen.insert(item) {
            return Err(AssignmentError::DuplicateParticipant(item.clone()));
        }
    }
    Ok(())
}

/// Build a single-cycle permutation over `items` (Sattolo's algorithm).
///
/// # Errors
/// Returns [`AssignmentError::InsufficientItems`] for fewer than two items and
/// [`AssignmentError::DuplicateParticipant`] when an id repeats.
pub fn generate_derangement<R>(
    items: &[ParticipantId],
    rng: &mut R,
) -> Result<Assignment, AssignmentError>
where
    R: RandomSource + ?Sized,
{
    if items.len() < MIN_DERANGEMENT_ITEMS {
        return Err(AssignmentError::InsufficientItems {
            actual: items.len(),
            required: MIN_DERANGEMENT_ITEMS,
        });
    }
    ensure_unique(items)?;

    let mut shuffled = items.to_vec();
    for i in (1..shuffled.len()).rev() {
        // j < i, never j == i: this is what forces a single cycle.
        let j = rng.next_index(i);
        shuffled.swap(i, j);
    }

    Ok(items.iter().cloned().zip(shuffled).collect())
}

/// Pair `givers` with a uniformly shuffled copy of `receivers`.
///
/// Self-assignment is possible when the pools overlap; callers validate and retry.
///
/// # Errors
/// Returns [`AssignmentError::CountMismatch`] when the pools differ in size and
/// [`AssignmentError::DuplicateParticipant`] when either pool repeats an id.
pub fn generate_bipartite<R>(
    givers: &[ParticipantId],
    receivers: &[ParticipantId],
    rng: &mut R,
) -> Result<Assignment, AssignmentError>
where
    R: RandomSource + ?Sized,
{
    if givers.len() != receivers.len() {
        return Err(AssignmentError::CountMismatch {
            givers: givers.len(),
            receivers: receivers.len(),
        });
    }
    ensure_unique(givers)?;
    ensure_unique(receivers)?;

    let mut shuffled = receivers.to_vec();
    for i in (1..shuffled.len()).rev() {
        let j = rng.next_index(i + 1);
        shuffled.swap(i, j);
    }

    Ok(givers.iter().cloned().zip(shuffled).collect())
}

fn incoming_counts(assignment: &Assignment) -> BTreeMap<&ParticipantId, usize> {
    let mut counts = BTreeMap::new();
    for receiver in assignment.receivers() {
        *counts.entry(receiver).or_insert(0_usize) += 1;
    }
    counts
}

fn push_self_assignments(assignment: &Assignment, violations: &mut Vec<String>) {
    for (giver, receiver) in assignment.iter() {
        if giver == receiver {
            violations.push(format!("{giver} is assigned to themselves"));
        }
    }
}

/// Check a full assignment set against `universe`, collecting every violation.
#[must_use]
pub fn validate_complete(
    universe: &BTreeSet<ParticipantId>,
    assignment: &Assignment,
) -> ValidationOutcome {
    let mut violations = Vec::new();

    if assignment.len() != universe.len() {
        violations.push(format!(
            "assignment has {} entries but there are {} participants",
            assignment.len(),
            universe.len()
        ));
    }

    push_self_assignments(assignment, &mut violations);

    let counts = incoming_counts(assignment);
    for (receiver, count) in &counts {
        if *count > 1 {
            violations.push(format!("{receiver} is receiving from {count} givers"));
        }
    }

    for (giver, receiver) in assignment.iter() {
        if !universe.contains(giver) {
            violations.push(format!("{giver} gives but is not a participant"));
        }
        if !universe.contains(receiver) {
            violations.push(format!("{receiver} receives but is not a participant"));
        }
    }

    for id in universe {
        if assignment.get(id).is_none() {
            violations.push(format!("{id} has no receiver"));
        }
        if !counts.contains_key(id) {
            violations.push(format!("{id} receives no gift"));
        }
    }

    ValidationOutcome::from_violations(violations)
}

/// Check a sub-assignment produced for the unlocked givers of `pool`.
#[must_use]
pub fn validate_partial(pool: &PartialPool, assignment: &Assignment) -> ValidationOutcome {
    let mut violations = Vec::new();

    for giver in &pool.givers {
        if assignment.get(giver).is_none() {
            violations.push(format!("{giver} has no receiver"));
        }
    }
    for giver in assignment.givers() {
        if !pool.givers.contains(giver) {
            violations.push(format!("{giver} is not an unlocked giver"));
        }
    }

    push_self_assignments(assignment, &mut violations);

    let counts = incoming_counts(assignment);
    for receiver in &pool.receivers {
        match counts.get(receiver).copied().unwrap_or(0) {
            1 => {}
            0 => violations.push(format!("{receiver} receives no gift")),
            count => violations.push(format!("{receiver} is receiving from {count} givers")),
        }
    }
    for receiver in counts.keys() {
        if !pool.receivers.contains(*receiver) {
            violations.push(format!("{receiver} is not in the available receiver pool"));
        }
    }

    ValidationOutcome::from_violations(violations)
}

/// Classify whether the current observation state allows regeneration.
///
/// Always recompute from fresh state; a participant may view their assignment
/// between two calls.
#[must_use]
pub fn analyze(participants: &[ParticipantState]) -> RegenerationClassification {
    let mut locked_ids = BTreeSet::new();
    let mut unlocked_ids = BTreeSet::new();
    for participant in participants {
        if participant.has_viewed {
            locked_ids.insert(participant.id.clone());
        } else {
            unlocked_ids.insert(participant.id.clone());
        }
    }

    let total = participants.len();
    if locked_ids.is_empty() {
        let can_regenerate = total >= MIN_REGENERATION_PARTICIPANTS;
        let reason = (!can_regenerate).then(|| {
            format!(
                "At least {MIN_REGENERATION_PARTICIPANTS} participants are required to \
                 regenerate assignments; this event has {total}."
            )
        });
        return RegenerationClassification {
            can_regenerate,
            is_full_regeneration: true,
            locked_ids,
            unlocked_ids,
            reason,
        };
    }

    let can_regenerate = unlocked_ids.len() >= MIN_REGENERATION_PARTICIPANTS;
    let reason = (!can_regenerate).then(|| {
        format!(
            "{} participant(s) have already viewed their assignment and {} have not; \
             partial regeneration needs at least {MIN_REGENERATION_PARTICIPANTS} \
             participants who have not viewed yet.",
            locked_ids.len(),
            unlocked_ids.len()
        )
    });

    RegenerationClassification {
        can_regenerate,
        is_full_regeneration: false,
        locked_ids,
        unlocked_ids,
        reason,
    }
}

/// Run `generate` then `validate` until a valid assignment appears.
///
/// A `max_attempts` of zero is treated as one attempt.
///
/// # Errors
/// Propagates generator errors immediately, or returns
/// [`AssignmentError::MaxAttemptsExceeded`] with the violations of every attempt.
pub fn with_retries<G, V>(
    max_attempts: usize,
    mut generate: G,
    validate: V,
) -> Result<Generated, AssignmentError>
where
    G: FnMut() -> Result<Assignment, AssignmentError>,
    V: Fn(&Assignment) -> ValidationOutcome,
{
    let max_attempts = max_attempts.max(1);
    let mut failures = Vec::with_capacity(max_attempts);

    for attempt in 1..=max_attempts {
        let assignment = generate()?;
        let outcome = validate(&assignment);
        if outcome.valid {
            return Ok(Generated { assignment, attempts: attempt });
        }
        failures.push(outcome.violations);
    }

    Err(AssignmentError::MaxAttemptsExceeded { attempts: max_attempts, violations: failures })
}

/// Full draw over `ids` with the default attempt cap.
///
/// # Errors
/// See [`generate_assignments_with_attempts`].
pub fn generate_assignments<R>(
    ids: &[ParticipantId],
    rng: &mut R,
) -> Result<Generated, AssignmentError>
where
    R: RandomSource + ?Sized,
{
    generate_assignments_with_attempts(ids, rng, DEFAULT_MAX_ATTEMPTS)
}

/// Full draw over `ids`: derangement checked by [`validate_complete`].
///
/// # Errors
/// Returns generator errors for too few or duplicate ids, or
/// [`AssignmentError::MaxAttemptsExceeded`] if no attempt validates.
pub fn generate_assignments_with_attempts<R>(
    ids: &[ParticipantId],
    rng: &mut R,
    max_attempts: usize,
) -> Result<Generated, AssignmentError>
where
    R: RandomSource + ?Sized,
{
    let universe = ids.iter().cloned().collect::<BTreeSet<_>>();
    with_retries(
        max_attempts,
        || generate_derangement(ids, &mut *rng),
        |candidate| validate_complete(&universe, candidate),
    )
}

/// Derive the giver and receiver pools for a partial regeneration.
///
/// # Errors
/// Returns [`AssignmentError::AssignmentImpossible`] when the pools differ in
/// size, which means the locked snapshot is inconsistent.
pub fn build_partial_pool(
    locked_assignments: &Assignment,
    locked_ids: &BTreeSet<ParticipantId>,
    unlocked_ids: &BTreeSet<ParticipantId>,
) -> Result<PartialPool, AssignmentError> {
    let locked_receivers = locked_assignments.receivers().collect::<BTreeSet<_>>();
    // Locked givers lose their incoming edge when their giver is reshuffled.
    let receivers = locked_ids
        .iter()
        .chain(unlocked_ids)
        .filter(|id| !locked_receivers.contains(id))
        .cloned()
        .collect::<BTreeSet<_>>();

    if unlocked_ids.len() != receivers.len() {
        return Err(AssignmentError::AssignmentImpossible {
            givers: unlocked_ids.len(),
            receivers: receivers.len(),
        });
    }

    Ok(PartialPool { givers: unlocked_ids.clone(), receivers })
}

/// Re-assign the unlocked givers while leaving `locked_assignments` untouched.
///
/// Returns only the new sub-assignment.
///
/// # Errors
/// Returns [`AssignmentError::AssignmentImpossible`] for an inconsistent
/// snapshot or [`AssignmentError::MaxAttemptsExceeded`] when every shuffle
/// produced a self-assignment.
pub fn regenerate_partial<R>(
    locked_assignments: &Assignment,
    locked_ids: &BTreeSet<ParticipantId>,
    unlocked_ids: &BTreeSet<ParticipantId>,
    rng: &mut R,
    max_attempts: usize,
) -> Result<Generated, AssignmentError>
where
    R: RandomSource + ?Sized,
{
    let pool = build_partial_pool(locked_assignments, locked_ids, unlocked_ids)?;
    let givers = pool.givers.iter().cloned().collect::<Vec<_>>();
    let receivers = pool.receivers.iter().cloned().collect::<Vec<_>>();

    with_retries(
        max_attempts,
        || generate_bipartite(&givers, &receivers, &mut *rng),
        |candidate| validate_partial(&pool, candidate),
    )
}

/// Classify, then run the full or partial path and merge with locked edges.
///
/// # Errors
/// Returns [`AssignmentError::DuplicateParticipant`] when an id repeats,
/// [`AssignmentError::InsufficientParticipantsForRegeneration`] when the
/// classification forbids regeneration, [`AssignmentError::LockedStateInconsistent`]
/// when the merged set fails complete validation, and any generator or retry error.
pub fn regenerate<R>(
    participants: &[ParticipantState],
    current: &Assignment,
    rng: &mut R,
    max_attempts: usize,
) -> Result<Regeneration, AssignmentError>
where
    R: RandomSource + ?Sized,
{
    let ids = participants.iter().map(|participant| participant.id.clone()).collect::<Vec<_>>();
    ensure_unique(&ids)?;

    let classification = analyze(participants);
    if !classification.can_regenerate {
        return Err(AssignmentError::InsufficientParticipantsForRegeneration {
            reason: classification.reason.unwrap_or_default(),
        });
    }

    if classification.is_full_regeneration {
        let generated = generate_assignments_with_attempts(&ids, rng, max_attempts)?;
        return Ok(Regeneration {
            mode: RegenerationMode::Full,
            reassigned: generated.assignment.clone(),
            assignment: generated.assignment,
            attempts: generated.attempts,
        });
    }

    let locked_assignments = current.restricted_to(&classification.locked_ids);
    let generated = regenerate_partial(
        &locked_assignments,
        &classification.locked_ids,
        &classification.unlocked_ids,
        rng,
        max_attempts,
    )?;

    let merged = locked_assignments.merged_with(&generated.assignment);
    let universe = ids.into_iter().collect::<BTreeSet<_>>();
    let outcome = validate_complete(&universe, &merged);
    if !outcome.valid {
        return Err(AssignmentError::LockedStateInconsistent { violations: outcome.violations });
    }

    Ok(Regeneration {
        mode: RegenerationMode::Partial,
        assignment: merged,
        reassigned: generated.assignment,
        attempts: generated.attempts,
    })
}
