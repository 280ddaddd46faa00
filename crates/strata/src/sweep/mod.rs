//! Decay and hygiene sweeps
//!
//! Two independent daily jobs: the decay sweep walks facts and rules,
//! recomputing effective confidence against the fade/expiry thresholds;
//! episode cleanup removes expired episodes and enforces the capacity
//! ceiling. Each owns a disjoint slice of work, so the jobs may overlap
//! in wall-clock time.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::config::{DecayConfig, StorageConfig};
use crate::error::Result;
use crate::memory::decay::{DecayAction, DecayThresholds, decay_action, next_fact_validity};
use crate::memory::types::Maturity;
use crate::storage::MemoryStore;

/// Outcome of one decay sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecayReport {
    pub facts_checked: usize,
    pub facts_faded: usize,
    pub facts_expired: usize,
    pub facts_revived: usize,
    pub rules_checked: usize,
    pub rules_demoted: usize,
}

/// Outcome of one episode cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub expired_deleted: usize,
    pub capacity_deleted: usize,
}

/// Walks facts and rules, applying confidence decay transitions.
pub struct DecaySweep {
    store: Arc<MemoryStore>,
    thresholds: DecayThresholds,
}

impl DecaySweep {
    pub fn new(store: Arc<MemoryStore>, config: &DecayConfig) -> Self {
        Self {
            store,
            thresholds: DecayThresholds {
                retrieval: config.retrieval_threshold,
                expiry: config.expiry_threshold,
            },
        }
    }

    /// Run one pass over every decaying fact and rule, across tenants.
    pub fn run(&self) -> Result<DecayReport> {
        let now = Utc::now();
        let mut report = DecayReport::default();

        for fact in self.store.decaying_facts()? {
            report.facts_checked += 1;
            let confidence = fact.effective_confidence(now);
            let action = decay_action(confidence, &self.thresholds);
            if let Some(validity) = next_fact_validity(fact.validity, action) {
                debug!(fact = %fact.id, from = fact.validity.as_str(), to = validity.as_str(),
                    confidence, "fact decay transition");
                self.store.set_fact_validity(fact.id, validity, "sweep")?;
                match action {
                    DecayAction::Fade => report.facts_faded += 1,
                    DecayAction::Expire => report.facts_expired += 1,
                    DecayAction::Keep => report.facts_revived += 1,
                }
            }
        }

        for rule in self.store.decaying_rules()? {
            report.rules_checked += 1;
            let confidence = rule.effective_confidence(now);
            // Rules are never hard-deleted; terminal decay demotes back
            // to candidate so the rule must re-earn its standing.
            // Anti-patterns are standing warnings and are left alone.
            if decay_action(confidence, &self.thresholds) == DecayAction::Expire
                && rule.maturity != Maturity::Candidate
                && rule.maturity != Maturity::AntiPattern
            {
                self.store.demote_decayed_rule(rule.id)?;
                report.rules_demoted += 1;
            }
        }

        info!(
            facts = report.facts_checked,
            faded = report.facts_faded,
            expired = report.facts_expired,
            revived = report.facts_revived,
            rules_demoted = report.rules_demoted,
            "decay sweep complete"
        );
        Ok(report)
    }
}

/// Deletes expired episodes and enforces the capacity ceiling.
pub struct EpisodeCleanup {
    store: Arc<MemoryStore>,
    capacity: usize,
}

impl EpisodeCleanup {
    pub fn new(store: Arc<MemoryStore>, config: &StorageConfig) -> Self {
        Self {
            store,
            capacity: config.episode_capacity,
        }
    }

    pub fn run(&self) -> Result<CleanupReport> {
        let now = Utc::now();
        let expired_deleted = self.store.delete_expired_episodes(now)?;
        let capacity_deleted = self.store.enforce_episode_capacity(self.capacity, now)?;
        info!(expired_deleted, capacity_deleted, "episode cleanup complete");
        Ok(CleanupReport {
            expired_deleted,
            capacity_deleted,
        })
    }
}
