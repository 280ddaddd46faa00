//! Retrieval engine
//!
//! Three search modes (semantic, keyword, hybrid with Reciprocal Rank
//! Fusion) plus the composite-scored recall operation. Scoring
//! configuration is passed per call; nothing here reads process-wide
//! mutable state.

pub mod context;

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use lru::LruCache;
use tracing::debug;
use uuid::Uuid;

use crate::config::RetrievalConfig;
use crate::embedding::{Embedder, cosine_similarity};
use crate::error::{MemoryError, Result};
use crate::memory::types::{EntityKind, EntityRef, Episode, Fact, Rule};
use crate::storage::MemoryStore;

/// RRF constant.
const RRF_K: f64 = 60.0;

/// Days over which recency halves roughly every three weeks.
const RECENCY_SCALE_DAYS: f64 = 30.0;

/// How the search operation ranks candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Semantic,
    Keyword,
    #[default]
    Hybrid,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Semantic => "semantic",
            SearchMode::Keyword => "keyword",
            SearchMode::Hybrid => "hybrid",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "semantic" => Ok(SearchMode::Semantic),
            "keyword" => Ok(SearchMode::Keyword),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => Err(MemoryError::Validation(format!(
                "unknown search mode '{other}'"
            ))),
        }
    }
}

/// Per-call composite score weights for recall.
#[derive(Debug, Clone, Copy)]
pub struct ScoreWeights {
    pub relevance: f64,
    pub importance: f64,
    pub recency: f64,
    pub confidence: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            relevance: 0.4,
            importance: 0.3,
            recency: 0.2,
            confidence: 0.1,
        }
    }
}

impl From<&RetrievalConfig> for ScoreWeights {
    fn from(config: &RetrievalConfig) -> Self {
        Self {
            relevance: config.relevance_weight,
            importance: config.importance_weight,
            recency: config.recency_weight,
            confidence: config.confidence_weight,
        }
    }
}

/// A retrieved memory item of any tier.
#[derive(Debug, Clone)]
pub enum MemoryItem {
    Episode(Episode),
    Fact(Fact),
    Rule(Rule),
}

impl MemoryItem {
    pub fn entity(&self) -> EntityRef {
        match self {
            MemoryItem::Episode(e) => EntityRef::episode(e.id),
            MemoryItem::Fact(f) => EntityRef::fact(f.id),
            MemoryItem::Rule(r) => EntityRef::rule(r.id),
        }
    }

    pub fn id(&self) -> Uuid {
        self.entity().id
    }

    pub fn kind(&self) -> EntityKind {
        self.entity().kind
    }

    pub fn content(&self) -> &str {
        match self {
            MemoryItem::Episode(e) => &e.content,
            MemoryItem::Fact(f) => &f.content,
            MemoryItem::Rule(r) => &r.content,
        }
    }

    pub fn embedding(&self) -> &[f32] {
        match self {
            MemoryItem::Episode(e) => &e.embedding,
            MemoryItem::Fact(f) => &f.embedding,
            MemoryItem::Rule(r) => &r.embedding,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            MemoryItem::Episode(e) => e.created_at,
            MemoryItem::Fact(f) => f.created_at,
            MemoryItem::Rule(r) => r.created_at,
        }
    }

    /// 0-10 importance. Rules carry no importance attribute; they score
    /// at the neutral midpoint.
    pub fn importance(&self) -> f64 {
        match self {
            MemoryItem::Episode(e) => e.importance,
            MemoryItem::Fact(f) => f.importance,
            MemoryItem::Rule(_) => 5.0,
        }
    }

    /// Decay-discounted confidence. Episodes have no decay concept and
    /// always pass confidence filtering.
    pub fn effective_confidence(&self, now: DateTime<Utc>) -> f64 {
        match self {
            MemoryItem::Episode(_) => 1.0,
            MemoryItem::Fact(f) => f.effective_confidence(now),
            MemoryItem::Rule(r) => r.effective_confidence(now),
        }
    }
}

/// One ranked search or recall result.
#[derive(Debug, Clone)]
pub struct ScoredItem {
    pub item: MemoryItem,
    pub score: f64,
    /// Effective confidence at retrieval time
    pub confidence: f64,
}

/// Per-call search parameters.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Tiers to search. Empty means all three.
    pub kinds: Vec<EntityKind>,
    pub scope: Option<String>,
    pub mode: SearchMode,
    pub limit: usize,
    pub min_confidence: Option<f64>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            kinds: Vec::new(),
            scope: None,
            mode: SearchMode::Hybrid,
            limit: 10,
            min_confidence: None,
        }
    }
}

/// Search and recall over the memory store.
///
/// Query embeddings are cached in a small LRU keyed by query text, since
/// agent loops tend to repeat the same trigger phrases.
pub struct Retriever {
    store: Arc<MemoryStore>,
    embedder: Arc<dyn Embedder>,
    config: RetrievalConfig,
    query_cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl Retriever {
    pub fn new(store: Arc<MemoryStore>, embedder: Arc<dyn Embedder>, config: RetrievalConfig) -> Self {
        let cache_size =
            NonZeroUsize::new(config.query_cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            embedder,
            config,
            query_cache: Mutex::new(LruCache::new(cache_size)),
        }
    }

    fn query_embedding(&self, query: &str) -> Result<Vec<f32>> {
        if let Ok(mut cache) = self.query_cache.lock() {
            if let Some(cached) = cache.get(query) {
                return Ok(cached.clone());
            }
        }
        let embedding = self.embedder.embed(query)?;
        if let Ok(mut cache) = self.query_cache.lock() {
            cache.put(query.to_string(), embedding.clone());
        }
        Ok(embedding)
    }

    /// Ranked search across the requested tiers. Bumps reference
    /// counters on every returned item.
    pub fn search(
        &self,
        tenant: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<ScoredItem>> {
        let now = Utc::now();
        let kinds: &[EntityKind] = if options.kinds.is_empty() {
            &[EntityKind::Fact, EntityKind::Rule, EntityKind::Episode]
        } else {
            &options.kinds
        };
        let limit = if options.limit == 0 {
            self.config.default_limit
        } else {
            options.limit
        };
        let min_confidence = options.min_confidence.unwrap_or(self.config.min_confidence);

        let mut results = Vec::new();
        for kind in kinds {
            let candidates = self.visible_items(tenant, *kind, options.scope.as_deref())?;
            let candidates: Vec<MemoryItem> = candidates
                .into_iter()
                .filter(|item| item.effective_confidence(now) >= min_confidence)
                .collect();
            let ranked = match options.mode {
                SearchMode::Semantic => self.rank_semantic(query, &candidates, limit)?,
                SearchMode::Keyword => {
                    self.rank_keyword(tenant, *kind, options.scope.as_deref(), query, &candidates, limit)?
                }
                SearchMode::Hybrid => {
                    self.rank_hybrid(tenant, *kind, options.scope.as_deref(), query, &candidates, limit)?
                }
            };
            results.extend(ranked);
        }

        sort_scored(&mut results);
        results.truncate(limit);
        debug!(tenant, query, mode = options.mode.as_str(), hits = results.len(), "search");

        for result in &results {
            self.store.bump_reference(result.item.entity(), now)?;
        }
        Ok(results)
    }

    /// Composite-scored recall over facts and rules:
    /// `relevance*w1 + importance*w2 + recency*w3 + effective_confidence*w4`.
    pub fn recall(
        &self,
        tenant: &str,
        topic: &str,
        scope: Option<&str>,
        limit: usize,
        weights: &ScoreWeights,
        min_confidence: Option<f64>,
    ) -> Result<Vec<ScoredItem>> {
        let now = Utc::now();
        let limit = if limit == 0 { self.config.default_limit } else { limit };
        let min_confidence = min_confidence.unwrap_or(self.config.min_confidence);
        let query_embedding = self.query_embedding(topic)?;

        let mut results = Vec::new();
        for kind in [EntityKind::Fact, EntityKind::Rule] {
            for item in self.visible_items(tenant, kind, scope)? {
                let confidence = item.effective_confidence(now);
                if confidence < min_confidence {
                    continue;
                }
                let relevance =
                    f64::from(cosine_similarity(&query_embedding, item.embedding())).max(0.0);
                let age_days =
                    (now - item.created_at()).num_seconds().max(0) as f64 / 86_400.0;
                let recency = (-age_days / RECENCY_SCALE_DAYS).exp();
                let score = weights.relevance * relevance
                    + weights.importance * (item.importance() / 10.0)
                    + weights.recency * recency
                    + weights.confidence * confidence;
                results.push(ScoredItem { item, score, confidence });
            }
        }

        sort_scored(&mut results);
        results.truncate(limit);
        debug!(tenant, topic, hits = results.len(), "recall");

        for result in &results {
            self.store.bump_reference(result.item.entity(), now)?;
        }
        Ok(results)
    }

    /// Newest-first episodes for a source, for the recent-episodes
    /// section of context assembly. Does not bump reference counters;
    /// context assembly is prompt plumbing, not an explicit retrieval.
    pub fn recent_episodes(
        &self,
        tenant: &str,
        source: &str,
        limit: usize,
    ) -> Result<Vec<Episode>> {
        let mut episodes = self.store.visible_episodes(tenant, Some(source))?;
        episodes.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        episodes.truncate(limit);
        Ok(episodes)
    }

    fn visible_items(
        &self,
        tenant: &str,
        kind: EntityKind,
        scope: Option<&str>,
    ) -> Result<Vec<MemoryItem>> {
        Ok(match kind {
            EntityKind::Fact => self
                .store
                .visible_facts(tenant, scope)?
                .into_iter()
                .map(MemoryItem::Fact)
                .collect(),
            EntityKind::Rule => self
                .store
                .visible_rules(tenant, scope)?
                .into_iter()
                .map(MemoryItem::Rule)
                .collect(),
            // Episodes are partitioned by owning source, not scope.
            EntityKind::Episode => self
                .store
                .visible_episodes(tenant, scope)?
                .into_iter()
                .map(MemoryItem::Episode)
                .collect(),
        })
    }

    fn rank_semantic(
        &self,
        query: &str,
        candidates: &[MemoryItem],
        limit: usize,
    ) -> Result<Vec<ScoredItem>> {
        let query_embedding = self.query_embedding(query)?;
        let now = Utc::now();
        let mut scored: Vec<ScoredItem> = candidates
            .iter()
            .map(|item| ScoredItem {
                score: f64::from(cosine_similarity(&query_embedding, item.embedding())),
                confidence: item.effective_confidence(now),
                item: item.clone(),
            })
            .collect();
        sort_scored(&mut scored);
        scored.truncate(limit);
        Ok(scored)
    }

    fn rank_keyword(
        &self,
        tenant: &str,
        kind: EntityKind,
        scope: Option<&str>,
        query: &str,
        candidates: &[MemoryItem],
        limit: usize,
    ) -> Result<Vec<ScoredItem>> {
        let by_id: HashMap<Uuid, &MemoryItem> =
            candidates.iter().map(|item| (item.id(), item)).collect();
        let ids = self.store.keyword_search(kind, tenant, scope, query, limit)?;
        let now = Utc::now();
        // BM25 rank order becomes a descending positional score so that
        // cross-tier merging stays meaningful.
        Ok(ids
            .iter()
            .enumerate()
            .filter_map(|(position, id)| {
                by_id.get(id).map(|item| ScoredItem {
                    item: (*item).clone(),
                    score: 1.0 / (1.0 + position as f64),
                    confidence: item.effective_confidence(now),
                })
            })
            .collect())
    }

    fn rank_hybrid(
        &self,
        tenant: &str,
        kind: EntityKind,
        scope: Option<&str>,
        query: &str,
        candidates: &[MemoryItem],
        limit: usize,
    ) -> Result<Vec<ScoredItem>> {
        let semantic = self.rank_semantic(query, candidates, limit)?;
        let keyword_ids = self.store.keyword_search(kind, tenant, scope, query, limit)?;

        let semantic_ranks: HashMap<Uuid, usize> = semantic
            .iter()
            .enumerate()
            .map(|(position, result)| (result.item.id(), position + 1))
            .collect();
        let keyword_ranks: HashMap<Uuid, usize> = keyword_ids
            .iter()
            .enumerate()
            .map(|(position, id)| (*id, position + 1))
            .collect();

        let by_id: HashMap<Uuid, &MemoryItem> =
            candidates.iter().map(|item| (item.id(), item)).collect();
        let mut union: Vec<Uuid> = semantic_ranks.keys().copied().collect();
        for id in keyword_ranks.keys() {
            if !semantic_ranks.contains_key(id) {
                union.push(*id);
            }
        }

        let now = Utc::now();
        let mut fused = Vec::new();
        for id in union {
            let Some(item) = by_id.get(&id) else { continue };
            let score = rrf_score(
                semantic_ranks.get(&id).copied(),
                keyword_ranks.get(&id).copied(),
                limit,
            );
            fused.push(ScoredItem {
                item: (*item).clone(),
                score,
                confidence: item.effective_confidence(now),
            });
        }
        sort_scored(&mut fused);
        fused.truncate(limit);
        Ok(fused)
    }
}

/// Reciprocal Rank Fusion of two 1-based ranks. An item absent from one
/// list is assigned rank `limit + 1` for that list.
pub fn rrf_score(semantic_rank: Option<usize>, keyword_rank: Option<usize>, limit: usize) -> f64 {
    let missing = (limit + 1) as f64;
    let semantic = semantic_rank.map_or(missing, |r| r as f64);
    let keyword = keyword_rank.map_or(missing, |r| r as f64);
    1.0 / (RRF_K + semantic) + 1.0 / (RRF_K + keyword)
}

/// Deterministic result ordering: score descending, then newest
/// `created_at`, then lowest id.
fn sort_scored(results: &mut [ScoredItem]) {
    results.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.item.created_at().cmp(&a.item.created_at()))
            .then_with(|| a.item.id().cmp(&b.item.id()))
    });
}
