//! Memory service: the tool-call surface
//!
//! Thin orchestration over storage, retrieval, and the maturity engine.
//! Every operation is bound to a caller identity; tenant filtering is
//! mandatory and independent of scope. Cross-tenant access requires the
//! elevated flag, never an implicit argument.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::embedding::Embedder;
use crate::error::{MemoryError, Result};
use crate::memory::maturity::{self, Feedback, MaturityChange};
use crate::memory::types::{
    EntityKind, EntityRef, Episode, Fact, MemoryEvent, Permanence, Rule,
};
use crate::retrieval::context::{ContextAssembler, ContextBlock};
use crate::retrieval::{MemoryItem, Retriever, ScoreWeights, ScoredItem, SearchOptions};
use crate::storage::{MemoryStore, StatsReport, StoredFact};
use crate::token::TokenCounter;

/// Authenticated caller context supplied by the identity layer.
///
/// The engine never authenticates; it trusts this struct and enforces
/// that non-elevated callers only touch their own tenant.
#[derive(Debug, Clone)]
pub struct CallerIdentity {
    pub tenant: String,
    /// Permits cross-tenant reads (operator tooling).
    pub elevated: bool,
}

impl CallerIdentity {
    pub fn new(tenant: &str) -> Self {
        Self {
            tenant: tenant.to_string(),
            elevated: false,
        }
    }

    pub fn elevated(tenant: &str) -> Self {
        Self {
            tenant: tenant.to_string(),
            elevated: true,
        }
    }

    /// Check that this caller may act on a record owned by `tenant`.
    fn authorize(&self, tenant: &str) -> Result<()> {
        if self.elevated || self.tenant == tenant {
            Ok(())
        } else {
            Err(MemoryError::Unauthorized(format!(
                "caller for tenant '{}' may not access tenant '{tenant}'",
                self.tenant
            )))
        }
    }
}

/// Parameters for storing a fact directly (outside consolidation).
#[derive(Debug, Clone)]
pub struct FactInput {
    pub subject: String,
    pub predicate: String,
    pub content: String,
    pub importance: Option<f64>,
    pub permanence: Option<Permanence>,
    pub scope: Option<String>,
    pub tags: Vec<String>,
}

/// Parameters for storing an episode.
#[derive(Debug, Clone)]
pub struct EpisodeInput {
    pub content: String,
    pub source: String,
    pub session: Option<String>,
    pub importance: Option<f64>,
    pub tags: Vec<String>,
}

/// Parameters for storing a rule.
#[derive(Debug, Clone)]
pub struct RuleInput {
    pub content: String,
    pub scope: Option<String>,
    pub tags: Vec<String>,
}

/// The memory engine's operation surface.
pub struct MemoryService {
    store: Arc<MemoryStore>,
    embedder: Arc<dyn Embedder>,
    retriever: Retriever,
    config: Config,
}

impl MemoryService {
    pub fn new(store: Arc<MemoryStore>, embedder: Arc<dyn Embedder>, config: Config) -> Self {
        let retriever = Retriever::new(store.clone(), embedder.clone(), config.retrieval.clone());
        Self {
            store,
            embedder,
            retriever,
            config,
        }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    /// Record a raw observation as a pending episode.
    pub fn store_episode(&self, caller: &CallerIdentity, input: EpisodeInput) -> Result<Uuid> {
        if input.content.trim().is_empty() {
            return Err(MemoryError::Validation("episode content is empty".to_string()));
        }
        if input.source.trim().is_empty() {
            return Err(MemoryError::Validation("episode source is empty".to_string()));
        }

        let mut episode = Episode::new(
            &caller.tenant,
            &input.source,
            input.content.clone(),
            self.embedder.embed(&input.content)?,
        );
        if let Some(importance) = input.importance {
            episode = episode.with_importance(importance);
        }
        if let Some(session) = input.session {
            episode = episode.with_session(session);
        }
        episode.expires_at =
            episode.created_at + chrono::Duration::days(self.config.storage.episode_ttl_days);
        episode.tags = input.tags;

        self.store.insert_episode(&episode)?;
        info!(tenant = caller.tenant, episode = %episode.id, "episode stored");
        Ok(episode.id)
    }

    /// Store a fact, superseding any active fact with the same
    /// (scope, subject, predicate).
    pub fn store_fact(&self, caller: &CallerIdentity, input: FactInput) -> Result<StoredFact> {
        if input.content.trim().is_empty() {
            return Err(MemoryError::Validation("fact content is empty".to_string()));
        }
        if input.subject.trim().is_empty() || input.predicate.trim().is_empty() {
            return Err(MemoryError::Validation(
                "fact subject and predicate are required".to_string(),
            ));
        }

        let mut fact = Fact::new(
            &caller.tenant,
            &input.subject,
            &input.predicate,
            input.content.clone(),
            self.embedder.embed(&input.content)?,
        );
        if let Some(importance) = input.importance {
            fact.importance = importance.clamp(0.0, 10.0);
        }
        if let Some(permanence) = input.permanence {
            fact.permanence = permanence;
        }
        if let Some(scope) = input.scope {
            fact.scope = scope;
        }
        fact.tags = input.tags;

        let stored = self.store.store_fact(&fact)?;
        info!(tenant = caller.tenant, fact = %stored.fact.id,
            superseded = ?stored.superseded, "fact stored");
        Ok(stored)
    }

    /// Store a new candidate rule.
    pub fn store_rule(&self, caller: &CallerIdentity, input: RuleInput) -> Result<Uuid> {
        if input.content.trim().is_empty() {
            return Err(MemoryError::Validation("rule content is empty".to_string()));
        }

        let mut rule = Rule::new(
            &caller.tenant,
            input.content.clone(),
            self.embedder.embed(&input.content)?,
        );
        if let Some(scope) = input.scope {
            rule.scope = scope;
        }
        rule.tags = input.tags;

        self.store.insert_rule(&rule)?;
        info!(tenant = caller.tenant, rule = %rule.id, "rule stored");
        Ok(rule.id)
    }

    /// Ranked search across memory tiers.
    pub fn search(
        &self,
        caller: &CallerIdentity,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<ScoredItem>> {
        self.retriever.search(&caller.tenant, query, options)
    }

    /// Composite-scored recall of facts and rules for a topic.
    pub fn recall(
        &self,
        caller: &CallerIdentity,
        topic: &str,
        scope: Option<&str>,
        limit: usize,
        min_confidence: Option<f64>,
    ) -> Result<Vec<ScoredItem>> {
        let weights = ScoreWeights::from(&self.config.retrieval);
        self.retriever
            .recall(&caller.tenant, topic, scope, limit, &weights, min_confidence)
    }

    /// Fetch one record by reference. Bumps its reference counter.
    pub fn get(&self, caller: &CallerIdentity, entity: EntityRef) -> Result<MemoryItem> {
        let item = self.load(entity)?;
        self.authorize_item(caller, &item, entity)?;
        self.store.bump_reference(entity, Utc::now())?;
        Ok(item)
    }

    /// Reset the decay clock on a fact or rule. Episodes have no decay
    /// concept and are rejected.
    pub fn confirm(&self, caller: &CallerIdentity, entity: EntityRef) -> Result<()> {
        let item = self.load(entity)?;
        self.authorize_item(caller, &item, entity)?;
        let now = Utc::now();
        match entity.kind {
            EntityKind::Fact => self.store.confirm_fact(entity.id, now, "confirm"),
            EntityKind::Rule => self.store.confirm_rule(entity.id, now, "confirm"),
            EntityKind::Episode => Err(MemoryError::Validation(
                "episodes have no decay clock to confirm".to_string(),
            )),
        }
    }

    /// Report that applying a rule helped.
    pub fn mark_helpful(&self, caller: &CallerIdentity, rule_id: Uuid) -> Result<MaturityChange> {
        self.apply_rule_feedback(caller, rule_id, Feedback::Helpful, None)
    }

    /// Report that applying a rule caused harm.
    pub fn mark_harmful(
        &self,
        caller: &CallerIdentity,
        rule_id: Uuid,
        reason: Option<String>,
    ) -> Result<MaturityChange> {
        self.apply_rule_feedback(caller, rule_id, Feedback::Harmful, reason)
    }

    fn apply_rule_feedback(
        &self,
        caller: &CallerIdentity,
        rule_id: Uuid,
        feedback: Feedback,
        reason: Option<String>,
    ) -> Result<MaturityChange> {
        let mut rule = self
            .store
            .get_rule(rule_id)?
            .ok_or_else(|| MemoryError::NotFound("rule", rule_id.to_string()))?;
        caller.authorize(&rule.tenant)?;

        let change = maturity::apply_feedback(&mut rule, feedback, reason, Utc::now());
        let event = match change {
            MaturityChange::Promoted(_) => "promoted",
            MaturityChange::Demoted(_) => "demoted",
            MaturityChange::Inverted => "inverted",
            MaturityChange::Unchanged => "feedback",
        };
        self.store.update_rule_feedback(&rule, event, "feedback")?;
        if change != MaturityChange::Unchanged {
            info!(tenant = caller.tenant, rule = %rule_id, event,
                maturity = rule.maturity.as_str(), "rule maturity change");
        }
        Ok(change)
    }

    /// Soft-delete a memory item and append the audit event.
    pub fn forget(&self, caller: &CallerIdentity, entity: EntityRef) -> Result<()> {
        let item = self.load(entity)?;
        self.authorize_item(caller, &item, entity)?;
        self.store.forget(entity, "forget")
    }

    /// Per-tier counts and health indicators for the caller's tenant.
    pub fn stats(&self, caller: &CallerIdentity) -> Result<StatsReport> {
        self.store.stats(&caller.tenant)
    }

    /// Audit trail for one memory item.
    pub fn events(&self, caller: &CallerIdentity, entity: EntityRef) -> Result<Vec<MemoryEvent>> {
        self.store.events_for(&caller.tenant, entity)
    }

    /// Assemble a budget-bounded context block for a session trigger.
    pub fn context(
        &self,
        caller: &CallerIdentity,
        trigger: &str,
        source: &str,
        token_budget: Option<usize>,
        tokenizer: &dyn TokenCounter,
    ) -> Result<ContextBlock> {
        let assembler =
            ContextAssembler::new(&self.retriever, tokenizer, self.config.context.clone());
        assembler.assemble(&caller.tenant, trigger, source, token_budget)
    }

    fn load(&self, entity: EntityRef) -> Result<MemoryItem> {
        let item = match entity.kind {
            EntityKind::Episode => self.store.get_episode(entity.id)?.map(MemoryItem::Episode),
            EntityKind::Fact => self.store.get_fact(entity.id)?.map(MemoryItem::Fact),
            EntityKind::Rule => self.store.get_rule(entity.id)?.map(MemoryItem::Rule),
        };
        item.ok_or_else(|| MemoryError::NotFound(entity.kind.as_str(), entity.id.to_string()))
    }

    fn authorize_item(
        &self,
        caller: &CallerIdentity,
        item: &MemoryItem,
        entity: EntityRef,
    ) -> Result<()> {
        let tenant = match item {
            MemoryItem::Episode(e) => &e.tenant,
            MemoryItem::Fact(f) => &f.tenant,
            MemoryItem::Rule(r) => &r.tenant,
        };
        // Non-elevated callers get not-found rather than confirmation
        // that a foreign record exists.
        if !caller.elevated && caller.tenant != *tenant {
            return Err(MemoryError::NotFound(entity.kind.as_str(), entity.id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::memory::types::{Maturity, Validity};
    use crate::token::HeuristicTokenizer;

    fn service() -> MemoryService {
        MemoryService::new(
            Arc::new(MemoryStore::open_in_memory().unwrap()),
            Arc::new(HashEmbedder::new()),
            Config::default(),
        )
    }

    fn episode_input(content: &str) -> EpisodeInput {
        EpisodeInput {
            content: content.to_string(),
            source: "planner".to_string(),
            session: None,
            importance: None,
            tags: Vec::new(),
        }
    }

    fn fact_input(subject: &str, predicate: &str, content: &str) -> FactInput {
        FactInput {
            subject: subject.to_string(),
            predicate: predicate.to_string(),
            content: content.to_string(),
            importance: None,
            permanence: None,
            scope: None,
            tags: Vec::new(),
        }
    }

    #[test]
    fn test_store_episode_rejects_empty_content() {
        let service = service();
        let caller = CallerIdentity::new("acme");
        let err = service.store_episode(&caller, episode_input("  ")).unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));
    }

    #[test]
    fn test_store_and_get_episode() {
        let service = service();
        let caller = CallerIdentity::new("acme");
        let id = service
            .store_episode(&caller, episode_input("saw a failing test"))
            .unwrap();

        let item = service.get(&caller, EntityRef::episode(id)).unwrap();
        assert_eq!(item.content(), "saw a failing test");

        // get bumps the reference counter.
        let reloaded = service.store().get_episode(id).unwrap().unwrap();
        assert_eq!(reloaded.reference_count, 1);
    }

    #[test]
    fn test_get_foreign_tenant_is_not_found() {
        let service = service();
        let owner = CallerIdentity::new("acme");
        let id = service.store_episode(&owner, episode_input("private note")).unwrap();

        let outsider = CallerIdentity::new("globex");
        let err = service.get(&outsider, EntityRef::episode(id)).unwrap_err();
        assert!(matches!(err, MemoryError::NotFound(..)));

        let operator = CallerIdentity::elevated("globex");
        assert!(service.get(&operator, EntityRef::episode(id)).is_ok());
    }

    #[test]
    fn test_store_fact_supersedes() {
        let service = service();
        let caller = CallerIdentity::new("acme");
        let old = service
            .store_fact(&caller, fact_input("user", "favorite_color", "favorite color is green"))
            .unwrap();
        let new = service
            .store_fact(&caller, fact_input("user", "favorite_color", "favorite color is blue"))
            .unwrap();

        assert_eq!(new.superseded, Some(old.fact.id));
        let old_loaded = service.store().get_fact(old.fact.id).unwrap().unwrap();
        assert_eq!(old_loaded.validity, Validity::Superseded);
    }

    #[test]
    fn test_confirm_rejects_episodes() {
        let service = service();
        let caller = CallerIdentity::new("acme");
        let id = service.store_episode(&caller, episode_input("observation")).unwrap();

        let err = service.confirm(&caller, EntityRef::episode(id)).unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));
    }

    #[test]
    fn test_confirm_resets_decay_clock() {
        let service = service();
        let caller = CallerIdentity::new("acme");
        let stored = service
            .store_fact(&caller, fact_input("user", "editor", "uses vim"))
            .unwrap();

        service.confirm(&caller, EntityRef::fact(stored.fact.id)).unwrap();
        let loaded = service.store().get_fact(stored.fact.id).unwrap().unwrap();
        let now = Utc::now();
        assert!((loaded.effective_confidence(now) - loaded.confidence).abs() < 1e-6);
    }

    #[test]
    fn test_rule_feedback_promotes_and_inverts() {
        let service = service();
        let caller = CallerIdentity::new("acme");
        let rule_id = service
            .store_rule(
                &caller,
                RuleInput {
                    content: "always write tests first".to_string(),
                    scope: None,
                    tags: Vec::new(),
                },
            )
            .unwrap();

        let mut last = MaturityChange::Unchanged;
        for _ in 0..5 {
            last = service.mark_helpful(&caller, rule_id).unwrap();
        }
        assert_eq!(last, MaturityChange::Promoted(Maturity::Established));

        let bad_rule = service
            .store_rule(
                &caller,
                RuleInput {
                    content: "force push to main".to_string(),
                    scope: None,
                    tags: Vec::new(),
                },
            )
            .unwrap();
        let mut last = MaturityChange::Unchanged;
        for i in 0..3 {
            last = service
                .mark_harmful(&caller, bad_rule, Some(format!("broke the build {i}")))
                .unwrap();
        }
        assert_eq!(last, MaturityChange::Inverted);

        let loaded = service.store().get_rule(bad_rule).unwrap().unwrap();
        assert_eq!(loaded.maturity, Maturity::AntiPattern);
        assert!(loaded.content.starts_with("AVOID:"));
        assert!(loaded.content.contains("broke the build"));
    }

    #[test]
    fn test_feedback_on_foreign_rule_is_unauthorized() {
        let service = service();
        let owner = CallerIdentity::new("acme");
        let rule_id = service
            .store_rule(
                &owner,
                RuleInput {
                    content: "prefer small commits".to_string(),
                    scope: None,
                    tags: Vec::new(),
                },
            )
            .unwrap();

        let outsider = CallerIdentity::new("globex");
        let err = service.mark_helpful(&outsider, rule_id).unwrap_err();
        assert!(matches!(err, MemoryError::Unauthorized(_)));
    }

    #[test]
    fn test_forget_fact_and_audit_trail() {
        let service = service();
        let caller = CallerIdentity::new("acme");
        let stored = service
            .store_fact(&caller, fact_input("user", "editor", "uses vim"))
            .unwrap();

        service.forget(&caller, EntityRef::fact(stored.fact.id)).unwrap();
        let loaded = service.store().get_fact(stored.fact.id).unwrap().unwrap();
        assert_eq!(loaded.validity, Validity::Retracted);

        let events = service.events(&caller, EntityRef::fact(stored.fact.id)).unwrap();
        let kinds: Vec<&str> = events.iter().map(|e| e.event.as_str()).collect();
        assert!(kinds.contains(&"created"));
        assert!(kinds.contains(&"forgotten"));
    }

    #[test]
    fn test_stats_reflect_writes() {
        let service = service();
        let caller = CallerIdentity::new("acme");
        service.store_episode(&caller, episode_input("one")).unwrap();
        service
            .store_fact(&caller, fact_input("user", "editor", "uses vim"))
            .unwrap();

        let report = service.stats(&caller).unwrap();
        assert_eq!(report.pending_episodes, 1);
        assert_eq!(report.active_facts, 1);
    }

    #[test]
    fn test_context_respects_budget() {
        let service = service();
        let caller = CallerIdentity::new("acme");
        for i in 0..6 {
            service
                .store_fact(&caller, fact_input("proj", &format!("p{i}"), &format!("project note {i}")))
                .unwrap();
        }

        let tokenizer = HeuristicTokenizer;
        let block = service
            .context(&caller, "project notes", "planner", Some(30), &tokenizer)
            .unwrap();
        assert!(block.token_count <= 30);
    }

    #[test]
    fn test_search_smoke() {
        let service = service();
        let caller = CallerIdentity::new("acme");
        service
            .store_fact(&caller, fact_input("user", "editor", "the user prefers vim"))
            .unwrap();

        let results = service
            .search(&caller, "the user prefers vim", &SearchOptions::default())
            .unwrap();
        assert!(!results.is_empty());
    }
}
