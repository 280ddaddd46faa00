//! End-to-end lifecycle tests
//!
//! Exercise the full path a memory takes: raw episode, consolidation
//! through a scripted extraction agent, recall and context assembly,
//! feedback-driven rule maturity, and the decay sweep. No network and
//! no on-disk database; the agent is scripted and storage is in-memory.

use std::sync::Arc;

use chrono::{Duration, Utc};

use strata::config::{Config, ConsolidationConfig};
use strata::consolidation::types::{ExtractedFact, ExtractedRule, ExtractionResponse};
use strata::consolidation::ConsolidationPipeline;
use strata::embedding::HashEmbedder;
use strata::memory::types::{
    ConsolidationStatus, EntityRef, Maturity, Permanence, RelationKind, Validity,
};
use strata::retrieval::SearchOptions;
use strata::service::{EpisodeInput, FactInput, RuleInput};
use strata::storage::MemoryStore;
use strata::testing::StaticAgent;
use strata::token::HeuristicTokenizer;
use strata::{CallerIdentity, MemoryService};

fn test_service() -> (MemoryService, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::open_in_memory().unwrap());
    let service = MemoryService::new(store.clone(), Arc::new(HashEmbedder::new()), Config::default());
    (service, store)
}

fn episode_input(content: &str, source: &str) -> EpisodeInput {
    EpisodeInput {
        content: content.to_string(),
        source: source.to_string(),
        session: None,
        importance: None,
        tags: Vec::new(),
    }
}

fn pipeline(store: Arc<MemoryStore>, agent: Arc<StaticAgent>) -> ConsolidationPipeline {
    ConsolidationPipeline::new(
        store,
        Arc::new(HashEmbedder::new()),
        agent,
        ConsolidationConfig::default(),
    )
}

fn extracted_fact(subject: &str, predicate: &str, content: &str) -> ExtractedFact {
    ExtractedFact {
        subject: subject.to_string(),
        predicate: predicate.to_string(),
        content: content.to_string(),
        permanence: "standard".to_string(),
        importance: 6.0,
        scope: None,
    }
}

#[tokio::test]
async fn test_episode_to_fact_to_recall() {
    let (service, store) = test_service();
    let caller = CallerIdentity::new("acme");

    let episode_id = service
        .store_episode(
            &caller,
            episode_input("the user said they prefer the vim editor", "planner"),
        )
        .unwrap();

    let agent = Arc::new(StaticAgent::returning(ExtractionResponse {
        new_facts: vec![extracted_fact("user", "editor", "the user prefers vim")],
        ..Default::default()
    }));
    let report = pipeline(store.clone(), agent).run().await.unwrap();

    assert_eq!(report.episodes_consolidated, 1);
    assert_eq!(report.facts_created, 1);

    // Episode reached its terminal state.
    let episode = store.get_episode(episode_id).unwrap().unwrap();
    assert_eq!(episode.status, ConsolidationStatus::Consolidated);

    // The new fact carries provenance back to the episode.
    let facts = store.visible_facts("acme", None).unwrap();
    assert_eq!(facts.len(), 1);
    let fact = &facts[0];
    assert_eq!(fact.source_episode, Some(episode_id));
    let links = store.links_from("acme", EntityRef::fact(fact.id)).unwrap();
    assert!(links
        .iter()
        .any(|l| l.relation == RelationKind::DerivedFrom
            && l.target == EntityRef::episode(episode_id)));

    // Recall surfaces the consolidated knowledge.
    let results = service
        .recall(&caller, "the user prefers vim", None, 10, None)
        .unwrap();
    assert!(results.iter().any(|r| r.item.id() == fact.id));

    // And so does the assembled context block.
    let tokenizer = HeuristicTokenizer;
    let block = service
        .context(&caller, "which editor to use", "planner", None, &tokenizer)
        .unwrap();
    assert!(block.text.contains("the user prefers vim"));
}

#[tokio::test]
async fn test_consolidation_supersedes_existing_fact() {
    let (service, store) = test_service();
    let caller = CallerIdentity::new("acme");

    let old = service
        .store_fact(
            &caller,
            FactInput {
                subject: "user".to_string(),
                predicate: "editor".to_string(),
                content: "the user prefers emacs".to_string(),
                importance: None,
                permanence: None,
                scope: None,
                tags: Vec::new(),
            },
        )
        .unwrap();

    service
        .store_episode(&caller, episode_input("user switched to vim last week", "planner"))
        .unwrap();

    let agent = Arc::new(StaticAgent::returning(ExtractionResponse {
        new_facts: vec![extracted_fact("user", "editor", "the user prefers vim")],
        ..Default::default()
    }));
    pipeline(store.clone(), agent).run().await.unwrap();

    let old_fact = store.get_fact(old.fact.id).unwrap().unwrap();
    assert_eq!(old_fact.validity, Validity::Superseded);

    let active = store.visible_facts("acme", None).unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].content, "the user prefers vim");

    // The replacement links back to what it replaced.
    let links = store
        .links_from("acme", EntityRef::fact(active[0].id))
        .unwrap();
    assert!(links
        .iter()
        .any(|l| l.relation == RelationKind::Supersedes
            && l.target == EntityRef::fact(old.fact.id)));
}

#[tokio::test]
async fn test_consolidation_creates_rule_with_support_links() {
    let (service, store) = test_service();
    let caller = CallerIdentity::new("acme");

    let backing = service
        .store_fact(
            &caller,
            FactInput {
                subject: "ci".to_string(),
                predicate: "flaky_suite".to_string(),
                content: "the browser suite is flaky under parallelism".to_string(),
                importance: None,
                permanence: None,
                scope: None,
                tags: Vec::new(),
            },
        )
        .unwrap();

    service
        .store_episode(&caller, episode_input("browser tests failed again in parallel", "ci"))
        .unwrap();

    let agent = Arc::new(StaticAgent::returning(ExtractionResponse {
        new_rules: vec![ExtractedRule {
            content: "run the browser suite serially".to_string(),
            scope: None,
            supported_by: vec![backing.fact.id],
        }],
        ..Default::default()
    }));
    let report = pipeline(store.clone(), agent).run().await.unwrap();
    assert_eq!(report.rules_created, 1);

    let rules = store.visible_rules("acme", None).unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].maturity, Maturity::Candidate);

    let links = store
        .links_from("acme", EntityRef::fact(backing.fact.id))
        .unwrap();
    assert!(links
        .iter()
        .any(|l| l.relation == RelationKind::Supports
            && l.target == EntityRef::rule(rules[0].id)));
}

#[tokio::test]
async fn test_failed_group_retries_then_dead_letters() {
    let (service, store) = test_service();
    let caller = CallerIdentity::new("acme");
    let episode_id = service
        .store_episode(&caller, episode_input("unparseable observation", "planner"))
        .unwrap();

    let agent = Arc::new(StaticAgent::failing("agent returned garbage"));
    let config = ConsolidationConfig {
        max_attempts: 3,
        retry_backoff_minutes: 0,
        ..Default::default()
    };
    let pipeline = ConsolidationPipeline::new(
        store.clone(),
        Arc::new(HashEmbedder::new()),
        agent.clone(),
        config,
    );

    for _ in 0..2 {
        let report = pipeline.run().await.unwrap();
        assert_eq!(report.episodes_failed, 1);
        assert_eq!(report.episodes_dead_lettered, 0);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    let report = pipeline.run().await.unwrap();
    assert_eq!(report.episodes_dead_lettered, 1);
    assert_eq!(agent.call_count(), 3);

    let episode = store.get_episode(episode_id).unwrap().unwrap();
    assert_eq!(episode.status, ConsolidationStatus::DeadLetter);
    assert_eq!(episode.consolidation_attempts, 3);
    assert!(episode.last_error.is_some());

    // Dead-lettered episodes never re-enter the backlog.
    let report = pipeline.run().await.unwrap();
    assert_eq!(report.groups_processed + report.groups_failed, 0);
    assert_eq!(agent.call_count(), 3);
}

#[tokio::test]
async fn test_rule_lifecycle_promotion_and_inversion() {
    let (service, _store) = test_service();
    let caller = CallerIdentity::new("acme");

    let rule_id = service
        .store_rule(
            &caller,
            RuleInput {
                content: "pin dependency versions before release".to_string(),
                scope: None,
                tags: Vec::new(),
            },
        )
        .unwrap();

    for _ in 0..5 {
        service.mark_helpful(&caller, rule_id).unwrap();
    }
    let rule = service.store().get_rule(rule_id).unwrap().unwrap();
    assert_eq!(rule.maturity, Maturity::Established);

    // The full history is auditable.
    let events = service.events(&caller, EntityRef::rule(rule_id)).unwrap();
    let kinds: Vec<&str> = events.iter().map(|e| e.event.as_str()).collect();
    assert!(kinds.contains(&"created"));
    assert!(kinds.contains(&"promoted"));

    // A rule that keeps hurting flips into an anti-pattern.
    let bad = service
        .store_rule(
            &caller,
            RuleInput {
                content: "deploy on friday afternoons".to_string(),
                scope: None,
                tags: Vec::new(),
            },
        )
        .unwrap();
    for i in 0..3 {
        service
            .mark_harmful(&caller, bad, Some(format!("outage {i}")))
            .unwrap();
    }
    let inverted = service.store().get_rule(bad).unwrap().unwrap();
    assert_eq!(inverted.maturity, Maturity::AntiPattern);
    assert!(inverted.content.starts_with("AVOID: deploy on friday afternoons"));
}

#[tokio::test]
async fn test_decayed_fact_drops_out_of_recall() {
    use strata::sweep::DecaySweep;

    let (service, store) = test_service();
    let caller = CallerIdentity::new("acme");

    let embedder = HashEmbedder::new();
    use strata::embedding::Embedder;
    let mut stale = strata::memory::types::Fact::new(
        "acme",
        "env",
        "staging_url",
        "staging lives at staging.example.com".to_string(),
        embedder.embed("staging lives at staging.example.com").unwrap(),
    );
    stale.permanence = Permanence::Ephemeral;
    stale.created_at = Utc::now() - Duration::days(40);
    stale.last_confirmed_at = stale.created_at;
    store.store_fact(&stale).unwrap();

    let report = DecaySweep::new(store.clone(), &Config::default().decay)
        .run()
        .unwrap();
    assert_eq!(report.facts_expired, 1);

    let results = service
        .recall(&caller, "staging lives at staging.example.com", None, 10, None)
        .unwrap();
    assert!(results.is_empty());

    // Expiry is soft: the record survives with its audit trail.
    let fact = store.get_fact(stale.id).unwrap().unwrap();
    assert_eq!(fact.validity, Validity::Expired);
    let events = store.events_for("acme", EntityRef::fact(stale.id)).unwrap();
    assert!(events.iter().any(|e| e.event == "expired"));
}

#[tokio::test]
async fn test_search_stays_within_tenant() {
    let (service, _store) = test_service();
    let acme = CallerIdentity::new("acme");
    let globex = CallerIdentity::new("globex");

    service
        .store_fact(
            &acme,
            FactInput {
                subject: "user".to_string(),
                predicate: "editor".to_string(),
                content: "the acme user prefers vim".to_string(),
                importance: None,
                permanence: None,
                scope: None,
                tags: Vec::new(),
            },
        )
        .unwrap();

    let results = service
        .search(&globex, "the acme user prefers vim", &SearchOptions::default())
        .unwrap();
    assert!(results.is_empty());
}
