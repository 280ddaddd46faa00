//! Memory types for the Strata system
//!
//! Defines the three memory tiers (episodes, facts, rules), the provenance
//! link and audit event records, and the closed enums that drive their
//! lifecycles.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MemoryError, Result};

/// Scope name shared by all tenants' global partition.
pub const GLOBAL_SCOPE: &str = "global";

/// Default episode time-to-live before hygiene may delete it.
pub const EPISODE_TTL_DAYS: i64 = 7;

/// A raw, short-lived observation awaiting consolidation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    /// Unique identifier for this episode
    pub id: Uuid,
    /// Tenant this episode belongs to
    pub tenant: String,
    /// Owning subsystem or session that produced the observation
    pub source: String,
    /// Optional session identifier
    pub session: Option<String>,
    /// Free-text content of the observation
    pub content: String,
    /// Vector embedding of the content
    pub embedding: Vec<f32>,
    /// Importance score 0.0-10.0
    pub importance: f64,
    /// How many times this episode has been returned by retrieval
    pub reference_count: u32,
    /// Where this episode is in the consolidation lifecycle
    pub status: ConsolidationStatus,
    /// How many consolidation attempts have been made
    pub consolidation_attempts: u32,
    /// Last consolidation error, if any
    pub last_error: Option<String>,
    /// Earliest time the next consolidation attempt may run
    pub next_retry_at: Option<DateTime<Utc>>,
    /// When this episode was created
    pub created_at: DateTime<Utc>,
    /// When this episode was last returned by retrieval
    pub last_referenced_at: DateTime<Utc>,
    /// When hygiene may delete this episode
    pub expires_at: DateTime<Utc>,
    /// Tombstone flag set by the forget operation
    pub forgotten: bool,
    /// Free-form tags
    pub tags: Vec<String>,
}

impl Episode {
    /// Create a new pending episode with default importance and TTL.
    pub fn new(tenant: &str, source: &str, content: String, embedding: Vec<f32>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant: tenant.to_string(),
            source: source.to_string(),
            session: None,
            content,
            embedding,
            importance: 5.0,
            reference_count: 0,
            status: ConsolidationStatus::Pending,
            consolidation_attempts: 0,
            last_error: None,
            next_retry_at: None,
            created_at: now,
            last_referenced_at: now,
            expires_at: now + Duration::days(EPISODE_TTL_DAYS),
            forgotten: false,
            tags: Vec::new(),
        }
    }

    /// Set the importance, clamped to the 0-10 scale.
    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = importance.clamp(0.0, 10.0);
        self
    }

    /// Set the session identifier.
    pub fn with_session(mut self, session: String) -> Self {
        self.session = Some(session);
        self
    }
}

/// Durable subject-predicate knowledge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    /// Unique identifier for this fact
    pub id: Uuid,
    /// Tenant this fact belongs to
    pub tenant: String,
    /// Subject of the statement (e.g. "user")
    pub subject: String,
    /// Predicate of the statement (e.g. "favorite_color")
    pub predicate: String,
    /// Full statement content
    pub content: String,
    /// Vector embedding of the content
    pub embedding: Vec<f32>,
    /// Importance score 0.0-10.0
    pub importance: f64,
    /// Confidence at the last confirmation
    pub confidence: f64,
    /// Permanence category controlling the decay rate
    pub permanence: Permanence,
    /// Episode this fact was extracted from, if any
    pub source_episode: Option<Uuid>,
    /// Subsystem that produced this fact
    pub source_system: Option<String>,
    /// Fact this one replaced, if any
    pub supersedes: Option<Uuid>,
    /// Current validity state
    pub validity: Validity,
    /// Visibility partition ("global" or a named scope)
    pub scope: String,
    /// How many times this fact has been returned by retrieval
    pub reference_count: u32,
    /// When this fact was created
    pub created_at: DateTime<Utc>,
    /// When this fact was last returned by retrieval
    pub last_referenced_at: DateTime<Utc>,
    /// When this fact was last confirmed (decay clock origin)
    pub last_confirmed_at: DateTime<Utc>,
    /// Free-form tags
    pub tags: Vec<String>,
}

impl Fact {
    /// Create a new active fact in the global scope.
    pub fn new(
        tenant: &str,
        subject: &str,
        predicate: &str,
        content: String,
        embedding: Vec<f32>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant: tenant.to_string(),
            subject: subject.to_string(),
            predicate: predicate.to_string(),
            content,
            embedding,
            importance: 5.0,
            confidence: 1.0,
            permanence: Permanence::Standard,
            source_episode: None,
            source_system: None,
            supersedes: None,
            validity: Validity::Active,
            scope: GLOBAL_SCOPE.to_string(),
            reference_count: 0,
            created_at: now,
            last_referenced_at: now,
            last_confirmed_at: now,
            tags: Vec::new(),
        }
    }

    /// Confidence discounted by elapsed time since last confirmation.
    pub fn effective_confidence(&self, now: DateTime<Utc>) -> f64 {
        crate::memory::decay::effective_confidence(
            self.confidence,
            self.permanence.decay_rate(),
            self.last_confirmed_at,
            now,
        )
    }
}

/// A learned behavioral pattern with a maturity state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Unique identifier for this rule
    pub id: Uuid,
    /// Tenant this rule belongs to
    pub tenant: String,
    /// Guidance content
    pub content: String,
    /// Vector embedding of the content
    pub embedding: Vec<f32>,
    /// Visibility partition ("global" or a named scope)
    pub scope: String,
    /// Maturity state (candidate through proven, or anti-pattern)
    pub maturity: Maturity,
    /// Confidence at the last confirmation
    pub confidence: f64,
    /// Permanence category controlling the decay rate
    pub permanence: Permanence,
    /// success / (success + 4*harmful + 0.01)
    pub effectiveness: f64,
    /// How many times this rule has been applied
    pub applied_count: u32,
    /// How many applications were reported helpful
    pub success_count: u32,
    /// How many applications were reported harmful
    pub harmful_count: u32,
    /// Accumulated reasons from harmful feedback
    pub harmful_reasons: Vec<String>,
    /// Episode this rule was extracted from, if any
    pub source_episode: Option<Uuid>,
    /// Tombstone flag set by the forget operation
    pub retracted: bool,
    /// How many times this rule has been returned by retrieval
    pub reference_count: u32,
    /// When this rule was created
    pub created_at: DateTime<Utc>,
    /// When this rule was last applied
    pub last_applied_at: Option<DateTime<Utc>>,
    /// When the maturity engine last evaluated this rule
    pub last_evaluated_at: Option<DateTime<Utc>>,
    /// When this rule was last confirmed (decay clock origin)
    pub last_confirmed_at: DateTime<Utc>,
    /// When this rule was last returned by retrieval
    pub last_referenced_at: DateTime<Utc>,
    /// Free-form tags
    pub tags: Vec<String>,
}

impl Rule {
    /// Create a new candidate rule in the global scope.
    pub fn new(tenant: &str, content: String, embedding: Vec<f32>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant: tenant.to_string(),
            content,
            embedding,
            scope: GLOBAL_SCOPE.to_string(),
            maturity: Maturity::Candidate,
            confidence: 0.5,
            permanence: Permanence::Standard,
            effectiveness: 0.0,
            applied_count: 0,
            success_count: 0,
            harmful_count: 0,
            harmful_reasons: Vec::new(),
            source_episode: None,
            retracted: false,
            reference_count: 0,
            created_at: now,
            last_applied_at: None,
            last_evaluated_at: None,
            last_confirmed_at: now,
            last_referenced_at: now,
            tags: Vec::new(),
        }
    }

    /// Confidence discounted by elapsed time since last confirmation.
    pub fn effective_confidence(&self, now: DateTime<Utc>) -> f64 {
        crate::memory::decay::effective_confidence(
            self.confidence,
            self.permanence.decay_rate(),
            self.last_confirmed_at,
            now,
        )
    }
}

/// Directed provenance or relationship edge between two memory items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryLink {
    /// Tenant this link belongs to
    pub tenant: String,
    /// Origin of the edge
    pub source: EntityRef,
    /// Destination of the edge
    pub target: EntityRef,
    /// Relationship kind
    pub relation: RelationKind,
    /// When this link was created
    pub created_at: DateTime<Utc>,
}

impl MemoryLink {
    pub fn new(tenant: &str, source: EntityRef, target: EntityRef, relation: RelationKind) -> Self {
        Self {
            tenant: tenant.to_string(),
            source,
            target,
            relation,
            created_at: Utc::now(),
        }
    }
}

/// Append-only audit record of a lifecycle transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEvent {
    /// Row id assigned by storage (0 before insertion)
    pub id: i64,
    /// Tenant this event belongs to
    pub tenant: String,
    /// Entity the event is about
    pub entity: EntityRef,
    /// Event type, e.g. "created", "superseded", "dead_letter"
    pub event: String,
    /// Who caused the event (caller name or "consolidation", "sweep")
    pub actor: String,
    /// Optional request correlation id
    pub request_id: Option<String>,
    /// Free-form structured payload
    pub payload: serde_json::Value,
    /// When the event was recorded
    pub created_at: DateTime<Utc>,
}

impl MemoryEvent {
    pub fn new(tenant: &str, entity: EntityRef, event: &str, actor: &str) -> Self {
        Self {
            id: 0,
            tenant: tenant.to_string(),
            entity,
            event: event.to_string(),
            actor: actor.to_string(),
            request_id: None,
            payload: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Typed reference to a memory item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: Uuid,
}

impl EntityRef {
    pub fn episode(id: Uuid) -> Self {
        Self { kind: EntityKind::Episode, id }
    }

    pub fn fact(id: Uuid) -> Self {
        Self { kind: EntityKind::Fact, id }
    }

    pub fn rule(id: Uuid) -> Self {
        Self { kind: EntityKind::Rule, id }
    }
}

/// The three memory tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Episode,
    Fact,
    Rule,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Episode => "episode",
            EntityKind::Fact => "fact",
            EntityKind::Rule => "rule",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "episode" => Ok(EntityKind::Episode),
            "fact" => Ok(EntityKind::Fact),
            "rule" => Ok(EntityKind::Rule),
            other => Err(MemoryError::Validation(format!(
                "unknown memory type '{other}'"
            ))),
        }
    }
}

/// Where an episode is in the consolidation lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidationStatus {
    Pending,
    Consolidated,
    Failed,
    DeadLetter,
}

impl ConsolidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsolidationStatus::Pending => "pending",
            ConsolidationStatus::Consolidated => "consolidated",
            ConsolidationStatus::Failed => "failed",
            ConsolidationStatus::DeadLetter => "dead_letter",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(ConsolidationStatus::Pending),
            "consolidated" => Ok(ConsolidationStatus::Consolidated),
            "failed" => Ok(ConsolidationStatus::Failed),
            "dead_letter" => Ok(ConsolidationStatus::DeadLetter),
            other => Err(MemoryError::Validation(format!(
                "unknown consolidation status '{other}'"
            ))),
        }
    }

    /// Terminal states require no further pipeline processing. `failed`
    /// remains retryable until the attempt ceiling converts it to
    /// `dead_letter`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConsolidationStatus::Consolidated | ConsolidationStatus::DeadLetter
        )
    }
}

/// Validity state of a fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Validity {
    Active,
    Fading,
    Superseded,
    Expired,
    Retracted,
}

impl Validity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Validity::Active => "active",
            Validity::Fading => "fading",
            Validity::Superseded => "superseded",
            Validity::Expired => "expired",
            Validity::Retracted => "retracted",
        }
    }

    /// Parse a stored validity value. The legacy value "forgotten"
    /// normalizes to `retracted`; it is accepted on read but never
    /// written.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "active" => Ok(Validity::Active),
            "fading" => Ok(Validity::Fading),
            "superseded" => Ok(Validity::Superseded),
            "expired" => Ok(Validity::Expired),
            "retracted" | "forgotten" => Ok(Validity::Retracted),
            other => Err(MemoryError::Validation(format!(
                "unknown validity '{other}'"
            ))),
        }
    }
}

/// Maturity state of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Maturity {
    Candidate,
    Established,
    Proven,
    AntiPattern,
}

impl Maturity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Maturity::Candidate => "candidate",
            Maturity::Established => "established",
            Maturity::Proven => "proven",
            Maturity::AntiPattern => "anti_pattern",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "candidate" => Ok(Maturity::Candidate),
            "established" => Ok(Maturity::Established),
            "proven" => Ok(Maturity::Proven),
            "anti_pattern" => Ok(Maturity::AntiPattern),
            other => Err(MemoryError::Validation(format!(
                "unknown maturity '{other}'"
            ))),
        }
    }
}

/// Fixed permanence categories and their decay rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permanence {
    /// Never decays
    Permanent,
    /// ~346-day half-life
    Stable,
    /// ~87-day half-life
    Standard,
    /// ~23-day half-life
    Volatile,
    /// ~7-day half-life
    Ephemeral,
}

impl Permanence {
    /// Daily decay rate applied to confidence.
    pub fn decay_rate(&self) -> f64 {
        match self {
            Permanence::Permanent => 0.0,
            Permanence::Stable => 0.002,
            Permanence::Standard => 0.008,
            Permanence::Volatile => 0.03,
            Permanence::Ephemeral => 0.1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Permanence::Permanent => "permanent",
            Permanence::Stable => "stable",
            Permanence::Standard => "standard",
            Permanence::Volatile => "volatile",
            Permanence::Ephemeral => "ephemeral",
        }
    }

    /// Parse a permanence value. Anything outside the fixed table is a
    /// validation error.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "permanent" => Ok(Permanence::Permanent),
            "stable" => Ok(Permanence::Stable),
            "standard" => Ok(Permanence::Standard),
            "volatile" => Ok(Permanence::Volatile),
            "ephemeral" => Ok(Permanence::Ephemeral),
            other => Err(MemoryError::Validation(format!(
                "unknown permanence '{other}'"
            ))),
        }
    }
}

/// Relationship kinds for memory links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    DerivedFrom,
    Supports,
    Contradicts,
    Supersedes,
    RelatedTo,
}

impl RelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationKind::DerivedFrom => "derived_from",
            RelationKind::Supports => "supports",
            RelationKind::Contradicts => "contradicts",
            RelationKind::Supersedes => "supersedes",
            RelationKind::RelatedTo => "related_to",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "derived_from" => Ok(RelationKind::DerivedFrom),
            "supports" => Ok(RelationKind::Supports),
            "contradicts" => Ok(RelationKind::Contradicts),
            "supersedes" => Ok(RelationKind::Supersedes),
            "related_to" => Ok(RelationKind::RelatedTo),
            other => Err(MemoryError::Validation(format!(
                "unknown relation '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_episode_new_defaults() {
        let episode = Episode::new("acme", "planner", "saw a thing".to_string(), vec![0.1; 8]);
        assert_eq!(episode.importance, 5.0);
        assert_eq!(episode.status, ConsolidationStatus::Pending);
        assert_eq!(episode.consolidation_attempts, 0);
        assert!(episode.next_retry_at.is_none());
        assert!(!episode.forgotten);
        assert!(episode.expires_at > episode.created_at);
    }

    #[test]
    fn test_episode_importance_clamping() {
        let episode =
            Episode::new("acme", "planner", "x".to_string(), vec![]).with_importance(42.0);
        assert_eq!(episode.importance, 10.0);

        let episode =
            Episode::new("acme", "planner", "x".to_string(), vec![]).with_importance(-3.0);
        assert_eq!(episode.importance, 0.0);
    }

    #[test]
    fn test_fact_new_defaults() {
        let fact = Fact::new("acme", "user", "editor", "user uses vim".to_string(), vec![]);
        assert_eq!(fact.confidence, 1.0);
        assert_eq!(fact.validity, Validity::Active);
        assert_eq!(fact.scope, GLOBAL_SCOPE);
        assert_eq!(fact.permanence, Permanence::Standard);
        assert!(fact.supersedes.is_none());
    }

    #[test]
    fn test_rule_new_defaults() {
        let rule = Rule::new("acme", "prefer small diffs".to_string(), vec![]);
        assert_eq!(rule.maturity, Maturity::Candidate);
        assert_eq!(rule.confidence, 0.5);
        assert_eq!(rule.effectiveness, 0.0);
        assert_eq!(rule.success_count, 0);
        assert!(!rule.retracted);
    }

    #[test]
    fn test_permanence_decay_rates() {
        assert_eq!(Permanence::Permanent.decay_rate(), 0.0);
        assert_eq!(Permanence::Stable.decay_rate(), 0.002);
        assert_eq!(Permanence::Standard.decay_rate(), 0.008);
        assert_eq!(Permanence::Volatile.decay_rate(), 0.03);
        assert_eq!(Permanence::Ephemeral.decay_rate(), 0.1);
    }

    #[test]
    fn test_permanence_rejects_unknown_values() {
        assert!(Permanence::parse("forever").is_err());
        assert!(Permanence::parse("").is_err());
        assert!(Permanence::parse("Permanent").is_err());
    }

    #[test]
    fn test_validity_legacy_alias() {
        assert_eq!(Validity::parse("forgotten").unwrap(), Validity::Retracted);
        assert_eq!(Validity::parse("retracted").unwrap(), Validity::Retracted);
    }

    #[test]
    fn test_consolidation_status_terminality() {
        assert!(!ConsolidationStatus::Pending.is_terminal());
        assert!(!ConsolidationStatus::Failed.is_terminal());
        assert!(ConsolidationStatus::Consolidated.is_terminal());
        assert!(ConsolidationStatus::DeadLetter.is_terminal());
    }

    #[test]
    fn test_enum_round_trips() {
        for value in ["pending", "consolidated", "failed", "dead_letter"] {
            assert_eq!(ConsolidationStatus::parse(value).unwrap().as_str(), value);
        }
        for value in ["active", "fading", "superseded", "expired", "retracted"] {
            assert_eq!(Validity::parse(value).unwrap().as_str(), value);
        }
        for value in ["candidate", "established", "proven", "anti_pattern"] {
            assert_eq!(Maturity::parse(value).unwrap().as_str(), value);
        }
        for value in ["derived_from", "supports", "contradicts", "supersedes", "related_to"] {
            assert_eq!(RelationKind::parse(value).unwrap().as_str(), value);
        }
    }

    #[test]
    fn test_fact_serialization() {
        let fact = Fact::new("acme", "user", "editor", "user uses vim".to_string(), vec![0.2; 4]);
        let json = serde_json::to_string(&fact).expect("Failed to serialize fact");
        let deserialized: Fact = serde_json::from_str(&json).expect("Failed to deserialize fact");
        assert_eq!(fact.id, deserialized.id);
        assert_eq!(fact.subject, deserialized.subject);
        assert_eq!(fact.validity, deserialized.validity);
    }
}
