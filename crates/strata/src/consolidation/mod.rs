//! Consolidation pipeline
//!
//! Batch process that distills pending episodes into facts and rules
//! with provenance. Episodes are grouped by (tenant, source) and each
//! group is processed independently: the extraction agent is consulted
//! once per group, and the group's writes plus its episode status flips
//! commit in a single transaction. A failed group never poisons the
//! groups after it.

pub mod prompts;
pub mod remote;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ConsolidationConfig;
use crate::embedding::Embedder;
use crate::error::{MemoryError, Result};
use crate::memory::types::{
    EntityRef, Episode, Fact, GLOBAL_SCOPE, MemoryLink, Permanence, RelationKind, Rule,
};
use crate::storage::{ConsolidationCommit, MemoryStore};
use types::{EpisodeInput, ExtractionRequest, ExtractionResponse, FactSnapshot, RuleSnapshot};

pub use remote::RemoteExtractor;

/// External text-generation agent that performs extraction.
///
/// The pipeline owns the request/response contract, not the agent's
/// reasoning. Atomicity, retry, and dead-letter behavior must hold for
/// any response, including adversarial or malformed output.
#[async_trait]
pub trait ExtractionAgent: Send + Sync {
    async fn extract(&self, request: &ExtractionRequest) -> Result<ExtractionResponse>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Outcome of one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsolidationReport {
    pub groups_processed: usize,
    pub groups_failed: usize,
    pub episodes_consolidated: usize,
    pub episodes_failed: usize,
    pub episodes_dead_lettered: usize,
    pub facts_created: usize,
    pub rules_created: usize,
}

/// Distills the episode backlog into durable memory.
pub struct ConsolidationPipeline {
    store: Arc<MemoryStore>,
    embedder: Arc<dyn Embedder>,
    agent: Arc<dyn ExtractionAgent>,
    config: ConsolidationConfig,
}

impl ConsolidationPipeline {
    pub fn new(
        store: Arc<MemoryStore>,
        embedder: Arc<dyn Embedder>,
        agent: Arc<dyn ExtractionAgent>,
        config: ConsolidationConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            agent,
            config,
        }
    }

    /// Run one consolidation pass over the current backlog.
    ///
    /// Group failures are recorded against their episodes and never
    /// propagate; only a failure to read the backlog itself errors out.
    pub async fn run(&self) -> Result<ConsolidationReport> {
        let now = Utc::now();
        let backlog = self.store.consolidation_backlog(now)?;
        let groups = group_episodes(backlog);
        let mut report = ConsolidationReport::default();

        for group in groups {
            let tenant = group[0].tenant.clone();
            let source = group[0].source.clone();
            match self.process_group(&tenant, &source, &group).await {
                Ok((facts, rules)) => {
                    report.groups_processed += 1;
                    report.episodes_consolidated += group.len();
                    report.facts_created += facts;
                    report.rules_created += rules;
                }
                Err(err) => {
                    warn!(tenant, source, error = %err, "consolidation group failed");
                    report.groups_failed += 1;
                    self.record_group_failure(&group, &err, &mut report)?;
                }
            }
        }

        info!(
            groups = report.groups_processed,
            failed_groups = report.groups_failed,
            consolidated = report.episodes_consolidated,
            dead_lettered = report.episodes_dead_lettered,
            facts = report.facts_created,
            rules = report.rules_created,
            "consolidation run complete"
        );
        Ok(report)
    }

    async fn process_group(
        &self,
        tenant: &str,
        source: &str,
        episodes: &[Episode],
    ) -> Result<(usize, usize)> {
        let active_facts = self.store.active_facts_for_group(tenant, source)?;
        let active_rules = self.store.active_rules_for_group(tenant)?;

        let request = ExtractionRequest {
            tenant: tenant.to_string(),
            source: source.to_string(),
            episodes: episodes.iter().map(EpisodeInput::from).collect(),
            active_facts: active_facts.iter().map(FactSnapshot::from).collect(),
            active_rules: active_rules.iter().map(RuleSnapshot::from).collect(),
        };

        let timeout = Duration::from_secs(self.config.agent_timeout_secs);
        let response = tokio::time::timeout(timeout, self.agent.extract(&request))
            .await
            .map_err(|_| {
                MemoryError::Extraction(format!(
                    "agent '{}' timed out after {timeout:?}",
                    self.agent.name()
                ))
            })??;
        response.validate()?;

        let commit = self.build_commit(tenant, source, episodes, &response)?;
        let facts = commit.new_facts.len();
        let rules = commit.new_rules.len();
        self.store.commit_consolidation(&commit)?;
        Ok((facts, rules))
    }

    fn build_commit(
        &self,
        tenant: &str,
        source: &str,
        episodes: &[Episode],
        response: &ExtractionResponse,
    ) -> Result<ConsolidationCommit> {
        let source_ids: Vec<Uuid> = episodes.iter().map(|e| e.id).collect();
        let primary_source = source_ids.first().copied();

        let mut new_facts = Vec::with_capacity(response.new_facts.len());
        for extracted in &response.new_facts {
            let mut fact = Fact::new(
                tenant,
                &extracted.subject,
                &extracted.predicate,
                extracted.content.clone(),
                self.embedder.embed(&extracted.content)?,
            );
            // Validated already; parse cannot fail here.
            fact.permanence = Permanence::parse(&extracted.permanence)?;
            fact.importance = extracted.importance.clamp(0.0, 10.0);
            fact.scope = extracted.scope.clone().unwrap_or_else(|| GLOBAL_SCOPE.to_string());
            fact.source_episode = primary_source;
            fact.source_system = Some(source.to_string());
            new_facts.push(fact);
        }

        let mut new_rules = Vec::with_capacity(response.new_rules.len());
        let mut support_links = Vec::new();
        for extracted in &response.new_rules {
            let mut rule = Rule::new(
                tenant,
                extracted.content.clone(),
                self.embedder.embed(&extracted.content)?,
            );
            rule.scope = extracted.scope.clone().unwrap_or_else(|| GLOBAL_SCOPE.to_string());
            rule.source_episode = primary_source;
            for fact_id in &extracted.supported_by {
                support_links.push(MemoryLink::new(
                    tenant,
                    EntityRef::fact(*fact_id),
                    EntityRef::rule(rule.id),
                    RelationKind::Supports,
                ));
            }
            new_rules.push(rule);
        }

        Ok(ConsolidationCommit {
            tenant: tenant.to_string(),
            source_episodes: source_ids,
            new_facts,
            new_rules,
            support_links,
            confirmed_facts: response.confirmed_facts.clone(),
            confirmed_rules: response.confirmed_rules.clone(),
            committed_at: Utc::now(),
        })
    }

    fn record_group_failure(
        &self,
        episodes: &[Episode],
        err: &MemoryError,
        report: &mut ConsolidationReport,
    ) -> Result<()> {
        let now = Utc::now();
        for episode in episodes {
            let attempts_after = episode.consolidation_attempts + 1;
            let dead_letter = attempts_after >= self.config.max_attempts;
            let next_retry = if dead_letter {
                None
            } else {
                // Exponential backoff on the per-episode attempt count.
                let exponent = episode.consolidation_attempts.min(6);
                let minutes = self.config.retry_backoff_minutes << exponent;
                Some(now + chrono::Duration::minutes(minutes))
            };
            self.store.record_consolidation_failure(
                episode.id,
                &err.to_string(),
                next_retry,
                dead_letter,
            )?;
            if dead_letter {
                report.episodes_dead_lettered += 1;
            } else {
                report.episodes_failed += 1;
            }
        }
        Ok(())
    }
}

/// Split a backlog (already ordered by tenant, source, created_at) into
/// (tenant, source) groups, preserving order.
fn group_episodes(backlog: Vec<Episode>) -> Vec<Vec<Episode>> {
    let mut groups: Vec<Vec<Episode>> = Vec::new();
    for episode in backlog {
        match groups.last_mut() {
            Some(group)
                if group[0].tenant == episode.tenant && group[0].source == episode.source =>
            {
                group.push(episode);
            }
            _ => groups.push(vec![episode]),
        }
    }
    groups
}
