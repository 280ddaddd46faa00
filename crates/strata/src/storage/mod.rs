//! SQLite storage layer
//!
//! One transactional substrate for all five memory components. The
//! schema enforces the invariants the rest of the engine relies on:
//!
//! - a partial unique index guarantees at most one active fact per
//!   (tenant, scope, subject, predicate), so racing writers cannot both
//!   succeed;
//! - the link table has a composite unique key and duplicate edges are
//!   rejected as constraint errors;
//! - the event table is append-only (no update or delete statement
//!   exists for it);
//! - every content-bearing insert writes the embedding and the FTS row
//!   in the same transaction, so retrieval never observes a record
//!   lacking either.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use crate::error::{MemoryError, Result};
use crate::memory::types::{
    ConsolidationStatus, EntityKind, EntityRef, Episode, Fact, Maturity, MemoryEvent, MemoryLink,
    Permanence, RelationKind, Rule, Validity,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS episodes (
    id TEXT PRIMARY KEY,
    tenant TEXT NOT NULL,
    source TEXT NOT NULL,
    session TEXT,
    content TEXT NOT NULL,
    embedding TEXT NOT NULL,
    importance REAL NOT NULL,
    reference_count INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    consolidation_attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    next_retry_at TEXT,
    created_at TEXT NOT NULL,
    last_referenced_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    forgotten INTEGER NOT NULL DEFAULT 0,
    tags TEXT NOT NULL DEFAULT '[]'
);
CREATE INDEX IF NOT EXISTS idx_episodes_tenant_status ON episodes(tenant, status);
CREATE INDEX IF NOT EXISTS idx_episodes_expires ON episodes(expires_at);

CREATE TABLE IF NOT EXISTS facts (
    id TEXT PRIMARY KEY,
    tenant TEXT NOT NULL,
    subject TEXT NOT NULL,
    predicate TEXT NOT NULL,
    content TEXT NOT NULL,
    embedding TEXT NOT NULL,
    importance REAL NOT NULL,
    confidence REAL NOT NULL,
    permanence TEXT NOT NULL,
    source_episode TEXT,
    source_system TEXT,
    supersedes TEXT,
    validity TEXT NOT NULL,
    scope TEXT NOT NULL,
    reference_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    last_referenced_at TEXT NOT NULL,
    last_confirmed_at TEXT NOT NULL,
    tags TEXT NOT NULL DEFAULT '[]',
    dedup_key TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_facts_active_unique
    ON facts(tenant, scope, subject, predicate) WHERE validity = 'active';
CREATE UNIQUE INDEX IF NOT EXISTS idx_facts_dedup
    ON facts(dedup_key) WHERE dedup_key IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_facts_tenant_validity ON facts(tenant, validity);

CREATE TABLE IF NOT EXISTS rules (
    id TEXT PRIMARY KEY,
    tenant TEXT NOT NULL,
    content TEXT NOT NULL,
    embedding TEXT NOT NULL,
    scope TEXT NOT NULL,
    maturity TEXT NOT NULL,
    confidence REAL NOT NULL,
    permanence TEXT NOT NULL,
    effectiveness REAL NOT NULL,
    applied_count INTEGER NOT NULL DEFAULT 0,
    success_count INTEGER NOT NULL DEFAULT 0,
    harmful_count INTEGER NOT NULL DEFAULT 0,
    harmful_reasons TEXT NOT NULL DEFAULT '[]',
    source_episode TEXT,
    retracted INTEGER NOT NULL DEFAULT 0,
    reference_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    last_applied_at TEXT,
    last_evaluated_at TEXT,
    last_confirmed_at TEXT NOT NULL,
    last_referenced_at TEXT NOT NULL,
    tags TEXT NOT NULL DEFAULT '[]',
    dedup_key TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_rules_dedup
    ON rules(dedup_key) WHERE dedup_key IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_rules_tenant ON rules(tenant);

CREATE TABLE IF NOT EXISTS links (
    tenant TEXT NOT NULL,
    source_kind TEXT NOT NULL,
    source_id TEXT NOT NULL,
    target_kind TEXT NOT NULL,
    target_id TEXT NOT NULL,
    relation TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(tenant, source_kind, source_id, target_kind, target_id)
);

CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tenant TEXT NOT NULL,
    entity_kind TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    event TEXT NOT NULL,
    actor TEXT NOT NULL,
    request_id TEXT,
    payload TEXT NOT NULL DEFAULT 'null',
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_entity ON events(tenant, entity_kind, entity_id);

CREATE VIRTUAL TABLE IF NOT EXISTS episodes_fts
    USING fts5(id UNINDEXED, content, tokenize='porter unicode61');
CREATE VIRTUAL TABLE IF NOT EXISTS facts_fts
    USING fts5(id UNINDEXED, content, tokenize='porter unicode61');
CREATE VIRTUAL TABLE IF NOT EXISTS rules_fts
    USING fts5(id UNINDEXED, content, tokenize='porter unicode61');
";

/// Per-tier counts and backlog health surfaced by the stats operation.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StatsReport {
    pub pending_episodes: usize,
    pub consolidated_episodes: usize,
    pub failed_episodes: usize,
    pub dead_letter_episodes: usize,
    pub active_facts: usize,
    pub fading_facts: usize,
    pub superseded_facts: usize,
    pub expired_facts: usize,
    pub retracted_facts: usize,
    pub candidate_rules: usize,
    pub established_rules: usize,
    pub proven_rules: usize,
    pub anti_pattern_rules: usize,
    /// Age in seconds of the oldest episode still awaiting consolidation
    pub oldest_pending_age_secs: Option<i64>,
}

/// Outcome of storing a fact through the supersession path.
#[derive(Debug, Clone)]
pub struct StoredFact {
    pub fact: Fact,
    /// Id of the previously active fact this one replaced, if any
    pub superseded: Option<Uuid>,
}

/// Durable store for episodes, facts, rules, links, and audit events.
///
/// All methods take `&self`; the connection lives behind a mutex so the
/// store is `Send + Sync` and can be shared as `Arc<MemoryStore>`.
pub struct MemoryStore {
    conn: Mutex<Connection>,
}

impl MemoryStore {
    /// Open (or create) a database at the given directory.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let conn = Connection::open(dir.join("strata.db"))?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database. Used by tests and the scripted demos.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| MemoryError::Storage("connection mutex poisoned".to_string()))
    }

    // ------------------------------------------------------------------
    // Episodes
    // ------------------------------------------------------------------

    /// Append a new episode together with its FTS row.
    pub fn insert_episode(&self, episode: &Episode) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO episodes (id, tenant, source, session, content, embedding, importance,
                reference_count, status, consolidation_attempts, last_error, next_retry_at,
                created_at, last_referenced_at, expires_at, forgotten, tags)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                episode.id.to_string(),
                episode.tenant,
                episode.source,
                episode.session,
                episode.content,
                serde_json::to_string(&episode.embedding)?,
                episode.importance,
                episode.reference_count,
                episode.status.as_str(),
                episode.consolidation_attempts,
                episode.last_error,
                episode.next_retry_at.map(|t| t.to_rfc3339()),
                episode.created_at.to_rfc3339(),
                episode.last_referenced_at.to_rfc3339(),
                episode.expires_at.to_rfc3339(),
                episode.forgotten as i64,
                serde_json::to_string(&episode.tags)?,
            ],
        )?;
        tx.execute(
            "INSERT INTO episodes_fts (id, content) VALUES (?1, ?2)",
            params![episode.id.to_string(), episode.content],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_episode(&self, id: Uuid) -> Result<Option<Episode>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM episodes WHERE id = ?1",
            params![id.to_string()],
            episode_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Episodes eligible for consolidation: non-terminal status, not
    /// forgotten, and past any scheduled retry time.
    pub fn consolidation_backlog(&self, now: DateTime<Utc>) -> Result<Vec<Episode>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM episodes
             WHERE status IN ('pending', 'failed') AND forgotten = 0
               AND (next_retry_at IS NULL OR next_retry_at <= ?1)
             ORDER BY tenant, source, created_at, id",
        )?;
        let rows = stmt.query_map(params![now.to_rfc3339()], episode_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Record a retryable consolidation failure, or the terminal
    /// dead-letter transition once attempts are exhausted.
    pub fn record_consolidation_failure(
        &self,
        id: Uuid,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
        dead_letter: bool,
    ) -> Result<()> {
        let status = if dead_letter {
            ConsolidationStatus::DeadLetter
        } else {
            ConsolidationStatus::Failed
        };
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE episodes
             SET status = ?2, consolidation_attempts = consolidation_attempts + 1,
                 last_error = ?3, next_retry_at = ?4
             WHERE id = ?1",
            params![
                id.to_string(),
                status.as_str(),
                error,
                next_retry_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        if changed == 0 {
            return Err(MemoryError::NotFound("episode", id.to_string()));
        }
        let (tenant, attempts): (String, u32) = tx.query_row(
            "SELECT tenant, consolidation_attempts FROM episodes WHERE id = ?1",
            params![id.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        append_event_tx(
            &tx,
            &MemoryEvent::new(
                &tenant,
                EntityRef::episode(id),
                if dead_letter { "dead_letter" } else { "consolidation_failed" },
                "consolidation",
            )
            .with_payload(serde_json::json!({ "error": error, "attempts": attempts })),
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Delete episodes whose expiry has passed. Returns the number
    /// removed.
    pub fn delete_expired_episodes(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM episodes_fts WHERE id IN
                 (SELECT id FROM episodes WHERE expires_at <= ?1)",
            params![now.to_rfc3339()],
        )?;
        let deleted = tx.execute(
            "DELETE FROM episodes WHERE expires_at <= ?1",
            params![now.to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(deleted)
    }

    /// Delete the oldest consolidated-and-expired episodes until the
    /// total count is back under the capacity ceiling. Episodes that are
    /// non-terminal or unexpired are never touched, even under pressure.
    pub fn enforce_episode_capacity(
        &self,
        capacity: usize,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let total: usize =
            tx.query_row("SELECT COUNT(*) FROM episodes", [], |row| row.get(0))?;
        if total <= capacity {
            tx.commit()?;
            return Ok(0);
        }
        let excess = total - capacity;
        tx.execute(
            "DELETE FROM episodes_fts WHERE id IN (
                 SELECT id FROM episodes
                 WHERE status = 'consolidated' AND expires_at <= ?1
                 ORDER BY created_at, id LIMIT ?2)",
            params![now.to_rfc3339(), excess],
        )?;
        let deleted = tx.execute(
            "DELETE FROM episodes WHERE id IN (
                 SELECT id FROM episodes
                 WHERE status = 'consolidated' AND expires_at <= ?1
                 ORDER BY created_at, id LIMIT ?2)",
            params![now.to_rfc3339(), excess],
        )?;
        tx.commit()?;
        Ok(deleted)
    }

    // ------------------------------------------------------------------
    // Facts
    // ------------------------------------------------------------------

    /// Store a fact, superseding any currently active fact for the same
    /// (tenant, scope, subject, predicate) tuple.
    ///
    /// The uniqueness lookup, the old-fact demotion, the new insert, the
    /// supersedes link, and the audit events are one transaction, so
    /// racing writers on the same key cannot both succeed.
    pub fn store_fact(&self, fact: &Fact) -> Result<StoredFact> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let stored = store_fact_tx(&tx, fact)?;
        tx.commit()?;
        Ok(stored)
    }

    pub fn get_fact(&self, id: Uuid) -> Result<Option<Fact>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM facts WHERE id = ?1",
            params![id.to_string()],
            fact_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Active facts for a (tenant, source system) group, used to give the
    /// extraction agent its current-knowledge context.
    pub fn active_facts_for_group(&self, tenant: &str, source: &str) -> Result<Vec<Fact>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM facts
             WHERE tenant = ?1 AND validity = 'active'
               AND (source_system = ?2 OR source_system IS NULL)
             ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map(params![tenant, source], fact_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// All facts visible in a tenant/scope for scoring. Visibility is
    /// `scope IN (global, requested)`; validity active or fading.
    pub fn visible_facts(&self, tenant: &str, scope: Option<&str>) -> Result<Vec<Fact>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM facts
             WHERE tenant = ?1 AND validity IN ('active', 'fading')
               AND (scope = 'global' OR scope = ?2)
             ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map(params![tenant, scope.unwrap_or("global")], fact_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Facts subject to decay (active or fading), across all tenants.
    pub fn decaying_facts(&self) -> Result<Vec<Fact>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM facts WHERE validity IN ('active', 'fading') ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map([], fact_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Transition a fact's validity and record the audit event.
    pub fn set_fact_validity(&self, id: Uuid, validity: Validity, actor: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let tenant: String = tx
            .query_row(
                "SELECT tenant FROM facts WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| MemoryError::NotFound("fact", id.to_string()))?;
        tx.execute(
            "UPDATE facts SET validity = ?2 WHERE id = ?1",
            params![id.to_string(), validity.as_str()],
        )?;
        append_event_tx(
            &tx,
            &MemoryEvent::new(&tenant, EntityRef::fact(id), validity.as_str(), actor),
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Reset the decay clock on a fact. A fading fact returns to active.
    pub fn confirm_fact(&self, id: Uuid, now: DateTime<Utc>, actor: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE facts
             SET last_confirmed_at = ?2,
                 validity = CASE WHEN validity = 'fading' THEN 'active' ELSE validity END
             WHERE id = ?1",
            params![id.to_string(), now.to_rfc3339()],
        )?;
        if changed == 0 {
            return Err(MemoryError::NotFound("fact", id.to_string()));
        }
        let tenant: String = tx.query_row(
            "SELECT tenant FROM facts WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        append_event_tx(
            &tx,
            &MemoryEvent::new(&tenant, EntityRef::fact(id), "confirmed", actor),
        )?;
        tx.commit()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Rules
    // ------------------------------------------------------------------

    pub fn insert_rule(&self, rule: &Rule) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        insert_rule_tx(&tx, rule)?;
        append_event_tx(
            &tx,
            &MemoryEvent::new(&rule.tenant, EntityRef::rule(rule.id), "created", "store_rule"),
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_rule(&self, id: Uuid) -> Result<Option<Rule>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM rules WHERE id = ?1",
            params![id.to_string()],
            rule_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn visible_rules(&self, tenant: &str, scope: Option<&str>) -> Result<Vec<Rule>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM rules
             WHERE tenant = ?1 AND retracted = 0
               AND (scope = 'global' OR scope = ?2)
             ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map(params![tenant, scope.unwrap_or("global")], rule_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub fn active_rules_for_group(&self, tenant: &str) -> Result<Vec<Rule>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM rules WHERE tenant = ?1 AND retracted = 0 ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map(params![tenant], rule_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Rules subject to decay, across all tenants.
    pub fn decaying_rules(&self) -> Result<Vec<Rule>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT * FROM rules WHERE retracted = 0 ORDER BY created_at, id")?;
        let rows = stmt.query_map([], rule_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Persist feedback results: counters, effectiveness, maturity, and
    /// possibly rewritten content, atomically, with an audit event.
    pub fn update_rule_feedback(&self, rule: &Rule, event: &str, actor: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE rules
             SET content = ?2, maturity = ?3, effectiveness = ?4, applied_count = ?5,
                 success_count = ?6, harmful_count = ?7, harmful_reasons = ?8,
                 last_applied_at = ?9, last_evaluated_at = ?10
             WHERE id = ?1",
            params![
                rule.id.to_string(),
                rule.content,
                rule.maturity.as_str(),
                rule.effectiveness,
                rule.applied_count,
                rule.success_count,
                rule.harmful_count,
                serde_json::to_string(&rule.harmful_reasons)?,
                rule.last_applied_at.map(|t| t.to_rfc3339()),
                rule.last_evaluated_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        if changed == 0 {
            return Err(MemoryError::NotFound("rule", rule.id.to_string()));
        }
        // Content in the FTS index follows anti-pattern rewrites.
        tx.execute(
            "UPDATE rules_fts SET content = ?2 WHERE id = ?1",
            params![rule.id.to_string(), rule.content],
        )?;
        append_event_tx(
            &tx,
            &MemoryEvent::new(&rule.tenant, EntityRef::rule(rule.id), event, actor).with_payload(
                serde_json::json!({
                    "maturity": rule.maturity.as_str(),
                    "effectiveness": rule.effectiveness,
                    "success_count": rule.success_count,
                    "harmful_count": rule.harmful_count,
                }),
            ),
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Reset the decay clock on a rule.
    pub fn confirm_rule(&self, id: Uuid, now: DateTime<Utc>, actor: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE rules SET last_confirmed_at = ?2 WHERE id = ?1",
            params![id.to_string(), now.to_rfc3339()],
        )?;
        if changed == 0 {
            return Err(MemoryError::NotFound("rule", id.to_string()));
        }
        let tenant: String = tx.query_row(
            "SELECT tenant FROM rules WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        append_event_tx(
            &tx,
            &MemoryEvent::new(&tenant, EntityRef::rule(id), "confirmed", actor),
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Demote a rule that decayed past the expiry threshold. Rules are
    /// never hard-deleted, so terminal decay means demotion to candidate.
    pub fn demote_decayed_rule(&self, id: Uuid) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let tenant: String = tx
            .query_row(
                "SELECT tenant FROM rules WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| MemoryError::NotFound("rule", id.to_string()))?;
        tx.execute(
            "UPDATE rules SET maturity = 'candidate' WHERE id = ?1 AND maturity != 'anti_pattern'",
            params![id.to_string()],
        )?;
        append_event_tx(
            &tx,
            &MemoryEvent::new(&tenant, EntityRef::rule(id), "decay_demoted", "sweep"),
        )?;
        tx.commit()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Forget, links, events, counters
    // ------------------------------------------------------------------

    /// Soft-delete a memory item: facts flip to retracted, rules and
    /// episodes are tombstoned. Appends the audit event in the same
    /// transaction.
    pub fn forget(&self, entity: EntityRef, actor: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let (sql, table) = match entity.kind {
            EntityKind::Fact => ("UPDATE facts SET validity = 'retracted' WHERE id = ?1", "facts"),
            EntityKind::Rule => ("UPDATE rules SET retracted = 1 WHERE id = ?1", "rules"),
            EntityKind::Episode => {
                ("UPDATE episodes SET forgotten = 1 WHERE id = ?1", "episodes")
            }
        };
        let changed = tx.execute(sql, params![entity.id.to_string()])?;
        if changed == 0 {
            return Err(MemoryError::NotFound(entity.kind.as_str(), entity.id.to_string()));
        }
        let tenant: String = tx.query_row(
            &format!("SELECT tenant FROM {table} WHERE id = ?1"),
            params![entity.id.to_string()],
            |row| row.get(0),
        )?;
        append_event_tx(&tx, &MemoryEvent::new(&tenant, entity, "forgotten", actor))?;
        tx.commit()?;
        Ok(())
    }

    /// Insert a provenance link. A duplicate (tenant, source, target)
    /// edge is a constraint violation, not a merge.
    pub fn insert_link(&self, link: &MemoryLink) -> Result<()> {
        let conn = self.conn()?;
        insert_link_conn(&conn, link)
    }

    pub fn links_from(&self, tenant: &str, source: EntityRef) -> Result<Vec<MemoryLink>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT tenant, source_kind, source_id, target_kind, target_id, relation, created_at
             FROM links WHERE tenant = ?1 AND source_kind = ?2 AND source_id = ?3
             ORDER BY created_at",
        )?;
        let rows = stmt.query_map(
            params![tenant, source.kind.as_str(), source.id.to_string()],
            link_from_row,
        )?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Append an audit event. There is no update or delete path.
    pub fn append_event(&self, event: &MemoryEvent) -> Result<()> {
        let conn = self.conn()?;
        append_event_conn(&conn, event)
    }

    pub fn events_for(&self, tenant: &str, entity: EntityRef) -> Result<Vec<MemoryEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, tenant, entity_kind, entity_id, event, actor, request_id, payload, created_at
             FROM events WHERE tenant = ?1 AND entity_kind = ?2 AND entity_id = ?3
             ORDER BY id",
        )?;
        let rows = stmt.query_map(
            params![tenant, entity.kind.as_str(), entity.id.to_string()],
            event_from_row,
        )?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Atomic reference-count bump plus last-referenced update. This is a
    /// single SQL increment, never read-modify-write at the application
    /// layer.
    pub fn bump_reference(&self, entity: EntityRef, now: DateTime<Utc>) -> Result<()> {
        let table = match entity.kind {
            EntityKind::Episode => "episodes",
            EntityKind::Fact => "facts",
            EntityKind::Rule => "rules",
        };
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "UPDATE {table}
                 SET reference_count = reference_count + 1, last_referenced_at = ?2
                 WHERE id = ?1"
            ),
            params![entity.id.to_string(), now.to_rfc3339()],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Search support
    // ------------------------------------------------------------------

    /// Full-text match over one tier, restricted to rows visible in the
    /// tenant/scope. Returns ids in relevance order (best first).
    pub fn keyword_search(
        &self,
        kind: EntityKind,
        tenant: &str,
        scope: Option<&str>,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Uuid>> {
        let fts_query = sanitize_fts_query(query);
        if fts_query.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let sql = match kind {
            EntityKind::Fact => {
                "SELECT f.id FROM facts_fts
                 JOIN facts f ON f.id = facts_fts.id
                 WHERE facts_fts MATCH ?1 AND f.tenant = ?2
                   AND f.validity IN ('active', 'fading')
                   AND (f.scope = 'global' OR f.scope = ?3)
                 ORDER BY rank LIMIT ?4"
            }
            EntityKind::Rule => {
                "SELECT r.id FROM rules_fts
                 JOIN rules r ON r.id = rules_fts.id
                 WHERE rules_fts MATCH ?1 AND r.tenant = ?2 AND r.retracted = 0
                   AND (r.scope = 'global' OR r.scope = ?3)
                 ORDER BY rank LIMIT ?4"
            }
            EntityKind::Episode => {
                "SELECT e.id FROM episodes_fts
                 JOIN episodes e ON e.id = episodes_fts.id
                 WHERE episodes_fts MATCH ?1 AND e.tenant = ?2 AND e.forgotten = 0
                   AND (?3 IS NULL OR e.source = ?3)
                 ORDER BY rank LIMIT ?4"
            }
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(
            params![fts_query, tenant, scope, limit],
            |row| row.get::<_, String>(0),
        )?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(parse_uuid(&row?)?);
        }
        Ok(ids)
    }

    /// Episodes visible to a tenant, optionally restricted to a source.
    pub fn visible_episodes(&self, tenant: &str, source: Option<&str>) -> Result<Vec<Episode>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM episodes
             WHERE tenant = ?1 AND forgotten = 0 AND (?2 IS NULL OR source = ?2)
             ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map(params![tenant, source], episode_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    // ------------------------------------------------------------------
    // Consolidation commit
    // ------------------------------------------------------------------

    /// Commit one consolidation group atomically: new facts and rules,
    /// supersessions, provenance links, confirmations, episode status
    /// flips, and audit events all land or none do.
    pub fn commit_consolidation(&self, commit: &ConsolidationCommit) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        for fact in &commit.new_facts {
            // A retried or repeated extraction reproducing an existing
            // fact is collapsed by its idempotency key, not re-stored.
            if dedup_key_exists(&tx, "facts", fact.dedup_key().as_deref())? {
                continue;
            }
            store_fact_tx(&tx, fact)?;
            for episode_id in &commit.source_episodes {
                insert_link_tx_ignoring_dup(
                    &tx,
                    &MemoryLink::new(
                        &commit.tenant,
                        EntityRef::fact(fact.id),
                        EntityRef::episode(*episode_id),
                        RelationKind::DerivedFrom,
                    ),
                )?;
            }
        }

        for rule in &commit.new_rules {
            if dedup_key_exists(&tx, "rules", rule.dedup_key().as_deref())? {
                continue;
            }
            insert_rule_tx(&tx, rule)?;
            append_event_tx(
                &tx,
                &MemoryEvent::new(&commit.tenant, EntityRef::rule(rule.id), "created", "consolidation"),
            )?;
            for episode_id in &commit.source_episodes {
                insert_link_tx_ignoring_dup(
                    &tx,
                    &MemoryLink::new(
                        &commit.tenant,
                        EntityRef::rule(rule.id),
                        EntityRef::episode(*episode_id),
                        RelationKind::DerivedFrom,
                    ),
                )?;
            }
        }

        for link in &commit.support_links {
            insert_link_tx_ignoring_dup(&tx, link)?;
        }

        let now = commit.committed_at.to_rfc3339();
        for fact_id in &commit.confirmed_facts {
            tx.execute(
                "UPDATE facts SET last_confirmed_at = ?2,
                     validity = CASE WHEN validity = 'fading' THEN 'active' ELSE validity END
                 WHERE id = ?1 AND tenant = ?3",
                params![fact_id.to_string(), now, commit.tenant],
            )?;
        }
        for rule_id in &commit.confirmed_rules {
            tx.execute(
                "UPDATE rules SET last_confirmed_at = ?2 WHERE id = ?1 AND tenant = ?3",
                params![rule_id.to_string(), now, commit.tenant],
            )?;
        }

        for episode_id in &commit.source_episodes {
            tx.execute(
                "UPDATE episodes SET status = 'consolidated', last_error = NULL,
                     next_retry_at = NULL
                 WHERE id = ?1",
                params![episode_id.to_string()],
            )?;
            append_event_tx(
                &tx,
                &MemoryEvent::new(
                    &commit.tenant,
                    EntityRef::episode(*episode_id),
                    "consolidated",
                    "consolidation",
                ),
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------

    pub fn stats(&self, tenant: &str) -> Result<StatsReport> {
        let conn = self.conn()?;
        let mut report = StatsReport::default();

        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM episodes WHERE tenant = ?1 GROUP BY status")?;
        let rows = stmt.query_map(params![tenant], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, usize>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            match ConsolidationStatus::parse(&status) {
                Ok(ConsolidationStatus::Pending) => report.pending_episodes = count,
                Ok(ConsolidationStatus::Consolidated) => report.consolidated_episodes = count,
                Ok(ConsolidationStatus::Failed) => report.failed_episodes = count,
                Ok(ConsolidationStatus::DeadLetter) => report.dead_letter_episodes = count,
                Err(_) => {}
            }
        }

        let mut stmt = conn
            .prepare("SELECT validity, COUNT(*) FROM facts WHERE tenant = ?1 GROUP BY validity")?;
        let rows = stmt.query_map(params![tenant], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, usize>(1)?))
        })?;
        for row in rows {
            let (validity, count) = row?;
            match Validity::parse(&validity) {
                Ok(Validity::Active) => report.active_facts = count,
                Ok(Validity::Fading) => report.fading_facts = count,
                Ok(Validity::Superseded) => report.superseded_facts = count,
                Ok(Validity::Expired) => report.expired_facts = count,
                Ok(Validity::Retracted) => report.retracted_facts = count,
                Err(_) => {}
            }
        }

        let mut stmt = conn
            .prepare("SELECT maturity, COUNT(*) FROM rules WHERE tenant = ?1 GROUP BY maturity")?;
        let rows = stmt.query_map(params![tenant], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, usize>(1)?))
        })?;
        for row in rows {
            let (maturity, count) = row?;
            match Maturity::parse(&maturity) {
                Ok(Maturity::Candidate) => report.candidate_rules = count,
                Ok(Maturity::Established) => report.established_rules = count,
                Ok(Maturity::Proven) => report.proven_rules = count,
                Ok(Maturity::AntiPattern) => report.anti_pattern_rules = count,
                Err(_) => {}
            }
        }

        let oldest: Option<String> = conn
            .query_row(
                "SELECT MIN(created_at) FROM episodes
                 WHERE tenant = ?1 AND status IN ('pending', 'failed')",
                params![tenant],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        if let Some(created) = oldest {
            let created = parse_timestamp(&created)?;
            report.oldest_pending_age_secs = Some((Utc::now() - created).num_seconds().max(0));
        }

        Ok(report)
    }

    pub fn total_episode_count(&self) -> Result<usize> {
        let conn = self.conn()?;
        conn.query_row("SELECT COUNT(*) FROM episodes", [], |row| row.get(0))
            .map_err(Into::into)
    }
}

/// One consolidation group's atomic write set.
#[derive(Debug, Clone)]
pub struct ConsolidationCommit {
    pub tenant: String,
    pub source_episodes: Vec<Uuid>,
    pub new_facts: Vec<Fact>,
    pub new_rules: Vec<Rule>,
    pub support_links: Vec<MemoryLink>,
    pub confirmed_facts: Vec<Uuid>,
    pub confirmed_rules: Vec<Uuid>,
    pub committed_at: DateTime<Utc>,
}

impl Fact {
    /// Content-derived idempotency key for consolidation-produced facts.
    /// Direct writes carry no key.
    pub fn dedup_key(&self) -> Option<String> {
        self.source_episode.map(|_| {
            use std::collections::hash_map::DefaultHasher;
            use std::hash::{Hash, Hasher};
            let mut hasher = DefaultHasher::new();
            (&self.tenant, &self.scope, &self.subject, &self.predicate, &self.content)
                .hash(&mut hasher);
            format!("{:016x}", hasher.finish())
        })
    }
}

impl Rule {
    /// Content-derived idempotency key for consolidation-produced rules.
    pub fn dedup_key(&self) -> Option<String> {
        self.source_episode.map(|_| {
            use std::collections::hash_map::DefaultHasher;
            use std::hash::{Hash, Hasher};
            let mut hasher = DefaultHasher::new();
            (&self.tenant, &self.scope, &self.content).hash(&mut hasher);
            format!("{:016x}", hasher.finish())
        })
    }
}

// ----------------------------------------------------------------------
// Transaction helpers
// ----------------------------------------------------------------------

fn dedup_key_exists(
    tx: &rusqlite::Transaction<'_>,
    table: &str,
    key: Option<&str>,
) -> Result<bool> {
    let Some(key) = key else {
        return Ok(false);
    };
    let count: usize = tx.query_row(
        &format!("SELECT COUNT(*) FROM {table} WHERE dedup_key = ?1"),
        params![key],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn store_fact_tx(tx: &rusqlite::Transaction<'_>, fact: &Fact) -> Result<StoredFact> {
    let existing: Option<String> = tx
        .query_row(
            "SELECT id FROM facts
             WHERE tenant = ?1 AND scope = ?2 AND subject = ?3 AND predicate = ?4
               AND validity = 'active'",
            params![fact.tenant, fact.scope, fact.subject, fact.predicate],
            |row| row.get(0),
        )
        .optional()?;

    let superseded = match existing {
        Some(old_id) => {
            let old_id = parse_uuid(&old_id)?;
            tx.execute(
                "UPDATE facts SET validity = 'superseded' WHERE id = ?1",
                params![old_id.to_string()],
            )?;
            append_event_tx(
                tx,
                &MemoryEvent::new(&fact.tenant, EntityRef::fact(old_id), "superseded", "store_fact")
                    .with_payload(serde_json::json!({ "superseded_by": fact.id })),
            )?;
            Some(old_id)
        }
        None => None,
    };

    let mut fact = fact.clone();
    fact.supersedes = superseded.or(fact.supersedes);

    tx.execute(
        "INSERT INTO facts (id, tenant, subject, predicate, content, embedding, importance,
             confidence, permanence, source_episode, source_system, supersedes, validity, scope,
             reference_count, created_at, last_referenced_at, last_confirmed_at, tags, dedup_key)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
        params![
            fact.id.to_string(),
            fact.tenant,
            fact.subject,
            fact.predicate,
            fact.content,
            serde_json::to_string(&fact.embedding)?,
            fact.importance,
            fact.confidence,
            fact.permanence.as_str(),
            fact.source_episode.map(|id| id.to_string()),
            fact.source_system,
            fact.supersedes.map(|id| id.to_string()),
            fact.validity.as_str(),
            fact.scope,
            fact.reference_count,
            fact.created_at.to_rfc3339(),
            fact.last_referenced_at.to_rfc3339(),
            fact.last_confirmed_at.to_rfc3339(),
            serde_json::to_string(&fact.tags)?,
            fact.dedup_key(),
        ],
    )?;
    tx.execute(
        "INSERT INTO facts_fts (id, content) VALUES (?1, ?2)",
        params![fact.id.to_string(), fact.content],
    )?;
    append_event_tx(
        tx,
        &MemoryEvent::new(&fact.tenant, EntityRef::fact(fact.id), "created", "store_fact"),
    )?;

    if let Some(old_id) = superseded {
        insert_link_tx_ignoring_dup(
            tx,
            &MemoryLink::new(
                &fact.tenant,
                EntityRef::fact(fact.id),
                EntityRef::fact(old_id),
                RelationKind::Supersedes,
            ),
        )?;
    }

    Ok(StoredFact { fact, superseded })
}

fn insert_rule_tx(tx: &rusqlite::Transaction<'_>, rule: &Rule) -> Result<()> {
    tx.execute(
        "INSERT INTO rules (id, tenant, content, embedding, scope, maturity, confidence,
             permanence, effectiveness, applied_count, success_count, harmful_count,
             harmful_reasons, source_episode, retracted, reference_count, created_at,
             last_applied_at, last_evaluated_at, last_confirmed_at, last_referenced_at, tags,
             dedup_key)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
             ?18, ?19, ?20, ?21, ?22, ?23)",
        params![
            rule.id.to_string(),
            rule.tenant,
            rule.content,
            serde_json::to_string(&rule.embedding)?,
            rule.scope,
            rule.maturity.as_str(),
            rule.confidence,
            rule.permanence.as_str(),
            rule.effectiveness,
            rule.applied_count,
            rule.success_count,
            rule.harmful_count,
            serde_json::to_string(&rule.harmful_reasons)?,
            rule.source_episode.map(|id| id.to_string()),
            rule.retracted as i64,
            rule.reference_count,
            rule.created_at.to_rfc3339(),
            rule.last_applied_at.map(|t| t.to_rfc3339()),
            rule.last_evaluated_at.map(|t| t.to_rfc3339()),
            rule.last_confirmed_at.to_rfc3339(),
            rule.last_referenced_at.to_rfc3339(),
            serde_json::to_string(&rule.tags)?,
            rule.dedup_key(),
        ],
    )?;
    tx.execute(
        "INSERT INTO rules_fts (id, content) VALUES (?1, ?2)",
        params![rule.id.to_string(), rule.content],
    )?;
    Ok(())
}

fn insert_link_conn(conn: &Connection, link: &MemoryLink) -> Result<()> {
    conn.execute(
        "INSERT INTO links (tenant, source_kind, source_id, target_kind, target_id, relation, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            link.tenant,
            link.source.kind.as_str(),
            link.source.id.to_string(),
            link.target.kind.as_str(),
            link.target.id.to_string(),
            link.relation.as_str(),
            link.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn insert_link_tx_ignoring_dup(tx: &rusqlite::Transaction<'_>, link: &MemoryLink) -> Result<()> {
    tx.execute(
        "INSERT OR IGNORE INTO links
             (tenant, source_kind, source_id, target_kind, target_id, relation, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            link.tenant,
            link.source.kind.as_str(),
            link.source.id.to_string(),
            link.target.kind.as_str(),
            link.target.id.to_string(),
            link.relation.as_str(),
            link.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn append_event_conn(conn: &Connection, event: &MemoryEvent) -> Result<()> {
    conn.execute(
        "INSERT INTO events (tenant, entity_kind, entity_id, event, actor, request_id, payload, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            event.tenant,
            event.entity.kind.as_str(),
            event.entity.id.to_string(),
            event.event,
            event.actor,
            event.request_id,
            serde_json::to_string(&event.payload)?,
            event.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn append_event_tx(tx: &rusqlite::Transaction<'_>, event: &MemoryEvent) -> Result<()> {
    append_event_conn(tx, event)
}

// ----------------------------------------------------------------------
// Row mapping
// ----------------------------------------------------------------------

fn episode_from_row(row: &Row<'_>) -> rusqlite::Result<Episode> {
    Ok(Episode {
        id: get_uuid(row, "id")?,
        tenant: row.get("tenant")?,
        source: row.get("source")?,
        session: row.get("session")?,
        content: row.get("content")?,
        embedding: get_json(row, "embedding")?,
        importance: row.get("importance")?,
        reference_count: row.get("reference_count")?,
        status: get_parsed(row, "status", ConsolidationStatus::parse)?,
        consolidation_attempts: row.get("consolidation_attempts")?,
        last_error: row.get("last_error")?,
        next_retry_at: get_opt_timestamp(row, "next_retry_at")?,
        created_at: get_timestamp(row, "created_at")?,
        last_referenced_at: get_timestamp(row, "last_referenced_at")?,
        expires_at: get_timestamp(row, "expires_at")?,
        forgotten: row.get::<_, i64>("forgotten")? != 0,
        tags: get_json(row, "tags")?,
    })
}

fn fact_from_row(row: &Row<'_>) -> rusqlite::Result<Fact> {
    Ok(Fact {
        id: get_uuid(row, "id")?,
        tenant: row.get("tenant")?,
        subject: row.get("subject")?,
        predicate: row.get("predicate")?,
        content: row.get("content")?,
        embedding: get_json(row, "embedding")?,
        importance: row.get("importance")?,
        confidence: row.get("confidence")?,
        permanence: get_parsed(row, "permanence", Permanence::parse)?,
        source_episode: get_opt_uuid(row, "source_episode")?,
        source_system: row.get("source_system")?,
        supersedes: get_opt_uuid(row, "supersedes")?,
        validity: get_parsed(row, "validity", Validity::parse)?,
        scope: row.get("scope")?,
        reference_count: row.get("reference_count")?,
        created_at: get_timestamp(row, "created_at")?,
        last_referenced_at: get_timestamp(row, "last_referenced_at")?,
        last_confirmed_at: get_timestamp(row, "last_confirmed_at")?,
        tags: get_json(row, "tags")?,
    })
}

fn rule_from_row(row: &Row<'_>) -> rusqlite::Result<Rule> {
    Ok(Rule {
        id: get_uuid(row, "id")?,
        tenant: row.get("tenant")?,
        content: row.get("content")?,
        embedding: get_json(row, "embedding")?,
        scope: row.get("scope")?,
        maturity: get_parsed(row, "maturity", Maturity::parse)?,
        confidence: row.get("confidence")?,
        permanence: get_parsed(row, "permanence", Permanence::parse)?,
        effectiveness: row.get("effectiveness")?,
        applied_count: row.get("applied_count")?,
        success_count: row.get("success_count")?,
        harmful_count: row.get("harmful_count")?,
        harmful_reasons: get_json(row, "harmful_reasons")?,
        source_episode: get_opt_uuid(row, "source_episode")?,
        retracted: row.get::<_, i64>("retracted")? != 0,
        reference_count: row.get("reference_count")?,
        created_at: get_timestamp(row, "created_at")?,
        last_applied_at: get_opt_timestamp(row, "last_applied_at")?,
        last_evaluated_at: get_opt_timestamp(row, "last_evaluated_at")?,
        last_confirmed_at: get_timestamp(row, "last_confirmed_at")?,
        last_referenced_at: get_timestamp(row, "last_referenced_at")?,
        tags: get_json(row, "tags")?,
    })
}

fn link_from_row(row: &Row<'_>) -> rusqlite::Result<MemoryLink> {
    Ok(MemoryLink {
        tenant: row.get(0)?,
        source: EntityRef {
            kind: parse_in_row(row, 1, EntityKind::parse)?,
            id: uuid_in_row(row, 2)?,
        },
        target: EntityRef {
            kind: parse_in_row(row, 3, EntityKind::parse)?,
            id: uuid_in_row(row, 4)?,
        },
        relation: parse_in_row(row, 5, RelationKind::parse)?,
        created_at: timestamp_in_row(row, 6)?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<MemoryEvent> {
    let payload: String = row.get(7)?;
    Ok(MemoryEvent {
        id: row.get(0)?,
        tenant: row.get(1)?,
        entity: EntityRef {
            kind: parse_in_row(row, 2, EntityKind::parse)?,
            id: uuid_in_row(row, 3)?,
        },
        event: row.get(4)?,
        actor: row.get(5)?,
        request_id: row.get(6)?,
        payload: serde_json::from_str(&payload).map_err(|e| column_error(7, e))?,
        created_at: timestamp_in_row(row, 8)?,
    })
}

fn column_error(
    index: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(err))
}

fn get_uuid(row: &Row<'_>, column: &str) -> rusqlite::Result<Uuid> {
    let value: String = row.get(column)?;
    Uuid::parse_str(&value).map_err(|e| column_error(0, e))
}

fn get_opt_uuid(row: &Row<'_>, column: &str) -> rusqlite::Result<Option<Uuid>> {
    let value: Option<String> = row.get(column)?;
    value
        .map(|v| Uuid::parse_str(&v).map_err(|e| column_error(0, e)))
        .transpose()
}

fn uuid_in_row(row: &Row<'_>, index: usize) -> rusqlite::Result<Uuid> {
    let value: String = row.get(index)?;
    Uuid::parse_str(&value).map_err(|e| column_error(index, e))
}

fn get_timestamp(row: &Row<'_>, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    let value: String = row.get(column)?;
    DateTime::parse_from_rfc3339(&value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| column_error(0, e))
}

fn get_opt_timestamp(row: &Row<'_>, column: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let value: Option<String> = row.get(column)?;
    value
        .map(|v| {
            DateTime::parse_from_rfc3339(&v)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| column_error(0, e))
        })
        .transpose()
}

fn timestamp_in_row(row: &Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let value: String = row.get(index)?;
    DateTime::parse_from_rfc3339(&value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| column_error(index, e))
}

fn get_json<T: serde::de::DeserializeOwned>(row: &Row<'_>, column: &str) -> rusqlite::Result<T> {
    let value: String = row.get(column)?;
    serde_json::from_str(&value).map_err(|e| column_error(0, e))
}

fn get_parsed<T>(
    row: &Row<'_>,
    column: &str,
    parse: impl Fn(&str) -> Result<T>,
) -> rusqlite::Result<T> {
    let value: String = row.get(column)?;
    parse(&value).map_err(|e| column_error(0, std::io::Error::other(e.to_string())))
}

fn parse_in_row<T>(
    row: &Row<'_>,
    index: usize,
    parse: impl Fn(&str) -> Result<T>,
) -> rusqlite::Result<T> {
    let value: String = row.get(index)?;
    parse(&value).map_err(|e| column_error(index, std::io::Error::other(e.to_string())))
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| MemoryError::Storage(format!("bad uuid in storage: {e}")))
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| MemoryError::Storage(format!("bad timestamp in storage: {e}")))
}

/// Quote each term so user input cannot inject FTS5 operators.
fn sanitize_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "")))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::GLOBAL_SCOPE;

    fn store() -> MemoryStore {
        MemoryStore::open_in_memory().unwrap()
    }

    fn fact(tenant: &str, subject: &str, predicate: &str, content: &str) -> Fact {
        Fact::new(tenant, subject, predicate, content.to_string(), vec![0.5; 4])
    }

    #[test]
    fn test_episode_round_trip() {
        let store = store();
        let episode = Episode::new("acme", "planner", "observed a failing test".to_string(), vec![0.1; 4])
            .with_session("sess-1".to_string())
            .with_importance(7.0);
        store.insert_episode(&episode).unwrap();

        let loaded = store.get_episode(episode.id).unwrap().unwrap();
        assert_eq!(loaded.content, "observed a failing test");
        assert_eq!(loaded.session, Some("sess-1".to_string()));
        assert_eq!(loaded.importance, 7.0);
        assert_eq!(loaded.status, ConsolidationStatus::Pending);
    }

    #[test]
    fn test_store_fact_supersedes_active_fact() {
        let store = store();
        let old = fact("acme", "user", "favorite_color", "favorite color is green");
        let stored_old = store.store_fact(&old).unwrap();
        assert!(stored_old.superseded.is_none());

        let new = fact("acme", "user", "favorite_color", "favorite color is blue");
        let stored_new = store.store_fact(&new).unwrap();
        assert_eq!(stored_new.superseded, Some(old.id));
        assert_eq!(stored_new.fact.supersedes, Some(old.id));

        let old_loaded = store.get_fact(old.id).unwrap().unwrap();
        assert_eq!(old_loaded.validity, Validity::Superseded);
        let new_loaded = store.get_fact(new.id).unwrap().unwrap();
        assert_eq!(new_loaded.validity, Validity::Active);

        let links = store.links_from("acme", EntityRef::fact(new.id)).unwrap();
        assert!(links.iter().any(|l| l.relation == RelationKind::Supersedes
            && l.target.id == old.id));
    }

    #[test]
    fn test_active_unique_index_rejects_duplicate() {
        let store = store();
        store.store_fact(&fact("acme", "user", "editor", "uses vim")).unwrap();

        // Bypass the supersession path to hit the index directly.
        let dup = fact("acme", "user", "editor", "uses emacs");
        let conn = store.conn().unwrap();
        let result = conn.execute(
            "INSERT INTO facts (id, tenant, subject, predicate, content, embedding, importance,
                 confidence, permanence, validity, scope, reference_count, created_at,
                 last_referenced_at, last_confirmed_at, tags)
             VALUES (?1, 'acme', 'user', 'editor', ?2, '[]', 5.0, 1.0, 'standard', 'active',
                 'global', 0, ?3, ?3, ?3, '[]')",
            params![dup.id.to_string(), dup.content, dup.created_at.to_rfc3339()],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_same_tuple_different_tenants_can_both_be_active() {
        let store = store();
        store.store_fact(&fact("acme", "user", "editor", "uses vim")).unwrap();
        let other = store.store_fact(&fact("globex", "user", "editor", "uses emacs")).unwrap();
        assert!(other.superseded.is_none());
    }

    #[test]
    fn test_duplicate_link_rejected() {
        let store = store();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let link = MemoryLink::new(
            "acme",
            EntityRef::fact(a),
            EntityRef::episode(b),
            RelationKind::DerivedFrom,
        );
        store.insert_link(&link).unwrap();

        let dup = MemoryLink::new(
            "acme",
            EntityRef::fact(a),
            EntityRef::episode(b),
            RelationKind::Supports,
        );
        let err = store.insert_link(&dup).unwrap_err();
        assert!(matches!(err, MemoryError::Constraint(_)));
    }

    #[test]
    fn test_bump_reference_increments() {
        let store = store();
        let stored = store.store_fact(&fact("acme", "user", "os", "runs linux")).unwrap();
        store.bump_reference(EntityRef::fact(stored.fact.id), Utc::now()).unwrap();
        store.bump_reference(EntityRef::fact(stored.fact.id), Utc::now()).unwrap();

        let loaded = store.get_fact(stored.fact.id).unwrap().unwrap();
        assert_eq!(loaded.reference_count, 2);
    }

    #[test]
    fn test_keyword_search_stems_and_scopes() {
        let store = store();
        store
            .store_fact(&fact("acme", "project", "language", "the project is written in rust"))
            .unwrap();
        store
            .store_fact(&fact("globex", "project", "language", "the project is written in rust"))
            .unwrap();

        // Porter stemming matches "written" via "writing".
        let hits = store
            .keyword_search(EntityKind::Fact, "acme", None, "writing rust", 10)
            .unwrap();
        assert_eq!(hits.len(), 1);

        let no_hits = store
            .keyword_search(EntityKind::Fact, "initech", None, "rust", 10)
            .unwrap();
        assert!(no_hits.is_empty());
    }

    #[test]
    fn test_scope_visibility() {
        let store = store();
        let mut scoped = fact("acme", "deploy", "target", "deploys to staging");
        scoped.scope = "ops".to_string();
        store.store_fact(&scoped).unwrap();
        store.store_fact(&fact("acme", "user", "editor", "uses vim")).unwrap();

        let global_only = store.visible_facts("acme", None).unwrap();
        assert_eq!(global_only.len(), 1);
        assert_eq!(global_only[0].scope, GLOBAL_SCOPE);

        let with_scope = store.visible_facts("acme", Some("ops")).unwrap();
        assert_eq!(with_scope.len(), 2);
    }

    #[test]
    fn test_forget_fact_retracts_and_audits() {
        let store = store();
        let stored = store.store_fact(&fact("acme", "user", "editor", "uses vim")).unwrap();
        store.forget(EntityRef::fact(stored.fact.id), "operator").unwrap();

        let loaded = store.get_fact(stored.fact.id).unwrap().unwrap();
        assert_eq!(loaded.validity, Validity::Retracted);

        let events = store.events_for("acme", EntityRef::fact(stored.fact.id)).unwrap();
        assert!(events.iter().any(|e| e.event == "forgotten"));
    }

    #[test]
    fn test_forget_unknown_id_is_not_found() {
        let store = store();
        let err = store.forget(EntityRef::fact(Uuid::new_v4()), "operator").unwrap_err();
        assert!(matches!(err, MemoryError::NotFound(..)));
    }

    #[test]
    fn test_capacity_cleanup_spares_unconsolidated() {
        let store = store();
        let now = Utc::now();

        // Three consolidated and expired, one pending and expired, one fresh.
        for i in 0..3 {
            let mut episode =
                Episode::new("acme", "planner", format!("old observation {i}"), vec![]);
            episode.status = ConsolidationStatus::Consolidated;
            episode.created_at = now - chrono::Duration::days(30 - i);
            episode.expires_at = now - chrono::Duration::days(1);
            store.insert_episode(&episode).unwrap();
        }
        let mut pending = Episode::new("acme", "planner", "pending observation".to_string(), vec![]);
        pending.expires_at = now - chrono::Duration::days(1);
        store.insert_episode(&pending).unwrap();
        store
            .insert_episode(&Episode::new("acme", "planner", "fresh observation".to_string(), vec![]))
            .unwrap();

        let deleted = store.enforce_episode_capacity(3, now).unwrap();
        assert_eq!(deleted, 2, "only consolidated-and-expired rows are eligible");
        assert!(store.get_episode(pending.id).unwrap().is_some());
        assert_eq!(store.total_episode_count().unwrap(), 3);
    }

    #[test]
    fn test_delete_expired_episodes() {
        let store = store();
        let now = Utc::now();
        let mut expired = Episode::new("acme", "planner", "stale".to_string(), vec![]);
        expired.expires_at = now - chrono::Duration::hours(1);
        store.insert_episode(&expired).unwrap();
        store
            .insert_episode(&Episode::new("acme", "planner", "fresh".to_string(), vec![]))
            .unwrap();

        let deleted = store.delete_expired_episodes(now).unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get_episode(expired.id).unwrap().is_none());
    }

    #[test]
    fn test_stats_counts() {
        let store = store();
        store
            .insert_episode(&Episode::new("acme", "planner", "one".to_string(), vec![]))
            .unwrap();
        store.store_fact(&fact("acme", "user", "editor", "uses vim")).unwrap();
        store
            .insert_rule(&Rule::new("acme", "prefer small diffs".to_string(), vec![]))
            .unwrap();

        let report = store.stats("acme").unwrap();
        assert_eq!(report.pending_episodes, 1);
        assert_eq!(report.active_facts, 1);
        assert_eq!(report.candidate_rules, 1);
        assert!(report.oldest_pending_age_secs.is_some());

        let other = store.stats("globex").unwrap();
        assert_eq!(other.pending_episodes, 0);
        assert_eq!(other.active_facts, 0);
    }

    #[test]
    fn test_sanitize_fts_query() {
        assert_eq!(sanitize_fts_query("hello world"), "\"hello\" \"world\"");
        assert_eq!(sanitize_fts_query("a\"b OR 1"), "\"ab\" \"OR\" \"1\"");
        assert_eq!(sanitize_fts_query("   "), "");
    }
}
