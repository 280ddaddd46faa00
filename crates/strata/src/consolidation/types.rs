//! Wire contract between the pipeline and the extraction agent
//!
//! The agent is an external collaborator; the pipeline owns only this
//! request/response schema. The pipeline's correctness properties must
//! hold regardless of what the agent returns, so the response is
//! validated before anything is persisted.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MemoryError, Result};
use crate::memory::types::{Episode, Fact, Permanence, Rule};

/// What the pipeline sends the extraction agent for one
/// (tenant, source) group.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionRequest {
    pub tenant: String,
    pub source: String,
    pub episodes: Vec<EpisodeInput>,
    /// The group's currently active facts, so the agent can supersede
    /// or confirm instead of duplicating.
    pub active_facts: Vec<FactSnapshot>,
    pub active_rules: Vec<RuleSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EpisodeInput {
    pub id: Uuid,
    pub content: String,
    pub importance: f64,
}

impl From<&Episode> for EpisodeInput {
    fn from(episode: &Episode) -> Self {
        Self {
            id: episode.id,
            content: episode.content.clone(),
            importance: episode.importance,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FactSnapshot {
    pub id: Uuid,
    pub subject: String,
    pub predicate: String,
    pub content: String,
}

impl From<&Fact> for FactSnapshot {
    fn from(fact: &Fact) -> Self {
        Self {
            id: fact.id,
            subject: fact.subject.clone(),
            predicate: fact.predicate.clone(),
            content: fact.content.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleSnapshot {
    pub id: Uuid,
    pub content: String,
    pub maturity: String,
}

impl From<&Rule> for RuleSnapshot {
    fn from(rule: &Rule) -> Self {
        Self {
            id: rule.id,
            content: rule.content.clone(),
            maturity: rule.maturity.as_str().to_string(),
        }
    }
}

/// What the agent must return. Unknown fields are ignored; missing
/// lists default to empty.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ExtractionResponse {
    /// New durable knowledge. A fact whose (subject, predicate) matches
    /// an active fact supersedes it through the normal storage path.
    #[serde(default)]
    pub new_facts: Vec<ExtractedFact>,
    #[serde(default)]
    pub new_rules: Vec<ExtractedRule>,
    /// Ids of existing facts the episodes re-confirmed.
    #[serde(default)]
    pub confirmed_facts: Vec<Uuid>,
    /// Ids of existing rules the episodes re-confirmed.
    #[serde(default)]
    pub confirmed_rules: Vec<Uuid>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExtractedFact {
    pub subject: String,
    pub predicate: String,
    pub content: String,
    /// Permanence classification; must be one of the fixed categories.
    pub permanence: String,
    #[serde(default = "default_importance")]
    pub importance: f64,
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExtractedRule {
    pub content: String,
    #[serde(default)]
    pub scope: Option<String>,
    /// Ids of existing facts that back this rule; each produces a
    /// `supports` link.
    #[serde(default)]
    pub supported_by: Vec<Uuid>,
}

fn default_importance() -> f64 {
    5.0
}

impl ExtractionResponse {
    /// Reject malformed agent output before anything touches storage.
    /// Validation failure is a retryable extraction error.
    pub fn validate(&self) -> Result<()> {
        for fact in &self.new_facts {
            Permanence::parse(&fact.permanence).map_err(|_| {
                MemoryError::Extraction(format!(
                    "unknown permanence '{}' for fact '{}/{}'",
                    fact.permanence, fact.subject, fact.predicate
                ))
            })?;
            if fact.subject.trim().is_empty() || fact.predicate.trim().is_empty() {
                return Err(MemoryError::Extraction(
                    "fact with empty subject or predicate".to_string(),
                ));
            }
            if fact.content.trim().is_empty() {
                return Err(MemoryError::Extraction("fact with empty content".to_string()));
            }
        }
        for rule in &self.new_rules {
            if rule.content.trim().is_empty() {
                return Err(MemoryError::Extraction("rule with empty content".to_string()));
            }
        }
        Ok(())
    }
}
