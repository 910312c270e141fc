use std::sync::Arc;

use corr_core::budget::{usd_to_micro, BudgetLedger};
use corr_core::cancel::CancellationToken;
use corr_core::collector::CollectorRegistry;
use corr_core::config::BudgetConfig;
use corr_core::cost_projector::Mode;
use corr_core::error::CorrError;
use corr_core::observability::RunMode;
use corr_core::orchestrator::{CorrelateRequest, CorrelateResponse};
use corr_core::types::{DetectionMethod, EvidenceKind, RelationshipType};

use corr_test::{
    commit, config_with_cap, harness, harness_with_collectors, item, ticket, window, Harness, ScriptedLlm,
    StubCollector, StubEmbedder,
};

fn request_for(items: Vec<corr_core::types::Evidence>) -> CorrelateRequest {
    CorrelateRequest {
        items: Some(items),
        ..CorrelateRequest::default()
    }
}

async fn run_items(harness: &Harness, items: Vec<corr_core::types::Evidence>) -> CorrelateResponse {
    harness
        .orchestrator
        .run(request_for(items), &CancellationToken::new())
        .await
        .expect("run succeeds")
}

// ── Scenario 1: explicit-reference short circuit ──────────────────

#[tokio::test]
async fn explicit_reference_short_circuit() {
    let fix = commit("c1", "alice", "2025-03-10T10:00:00Z", "Fix login crash (AUTH-123)");
    let bug = ticket("AUTH-123", "alice", "2025-03-09T08:00:00Z", "Login crashes on empty password");

    let h = harness(config_with_cap(1.0), StubEmbedder::new(), ScriptedLlm::unrelated());
    let response = run_items(&h, vec![fix, bug]).await;

    assert_eq!(response.relationships.len(), 1);
    let rel = &response.relationships[0];
    assert_eq!(rel.rel_type, RelationshipType::Solves);
    assert_eq!(rel.method, DetectionMethod::RuleBased);
    assert!(rel.confidence >= 0.90);

    assert_eq!(response.stories.len(), 1);
    assert_eq!(response.stories[0].members.len(), 2);

    assert_eq!(response.run_report.spend.actual_micro, 0);
    assert_eq!(h.ledger.snapshot().spent_micro, 0);
}

// ── Scenario 2: embedding-tier grouping ───────────────────────────

fn payment_retry_fixture() -> (Vec<corr_core::types::Evidence>, StubEmbedder) {
    let c1 = commit("c1", "alice", "2025-03-01T10:00:00Z", "refactor payment retry logic cleanup");
    let c2 = commit("c2", "alice", "2025-03-01T16:00:00Z", "refactor payment retry logic backoff");
    let c3 = commit("c3", "alice", "2025-03-03T09:00:00Z", "refactor payment retry logic tests");
    let noise = commit("c4", "alice", "2025-03-01T11:00:00Z", "update onboarding documentation images");

    let embedder = StubEmbedder::new()
        .with_vector_for(&c1, vec![1.0, 0.0, 0.01])
        .with_vector_for(&c2, vec![1.0, 0.0, 0.02])
        .with_vector_for(&c3, vec![1.0, 0.0, 0.03])
        .with_vector_for(&noise, vec![0.0, 1.0, 0.0]);

    (vec![c1, c2, c3, noise], embedder)
}

#[tokio::test]
async fn embedding_tier_groups_thematic_commits() {
    let (items, embedder) = payment_retry_fixture();
    let llm = ScriptedLlm::unrelated();
    let llm_calls = llm.call_counter();
    let h = harness(config_with_cap(1.0), embedder, llm);

    let response = run_items(&h, items).await;

    let themed: Vec<_> = response
        .relationships
        .iter()
        .filter(|r| r.method == DetectionMethod::Embedding)
        .collect();
    assert_eq!(themed.len(), 3);
    for rel in &themed {
        assert!(
            (0.75..=0.92).contains(&rel.confidence),
            "confidence {} out of band",
            rel.confidence
        );
    }

    assert_eq!(response.stories.len(), 1);
    assert_eq!(response.stories[0].members.len(), 3);

    assert!(response.run_report.spend.actual_micro > 0, "embedding spend expected");
    assert_eq!(response.run_report.tier_counts.llm_adjudicated, 0);
    assert_eq!(llm_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert!(h.ledger.snapshot().counters.embed_requests > 0);
}

// ── Scenario 3: LLM adjudication of the ambiguous band ────────────

fn ambiguous_pair_fixture() -> (Vec<corr_core::types::Evidence>, StubEmbedder) {
    let code = commit("c9", "alice", "2025-03-05T10:00:00Z", "tighten backoff");
    let bug = ticket("PAY-77", "alice", "2025-03-05T12:00:00Z", "Payments flaky under load");

    let embedder = StubEmbedder::new()
        .with_vector_for(&code, vec![1.0, 0.0])
        // cos = 0.63: inside [theta_low, theta_high), so the pair promotes.
        .with_vector_for(&bug, vec![0.63, 0.776_6]);

    (vec![code, bug], embedder)
}

#[tokio::test]
async fn llm_adjudicates_promoted_pair() {
    let (items, embedder) = ambiguous_pair_fixture();
    let h = harness(
        config_with_cap(1.0),
        embedder,
        ScriptedLlm::related(RelationshipType::Solves, 0.8),
    );

    let response = run_items(&h, items).await;

    assert_eq!(response.relationships.len(), 1);
    let rel = &response.relationships[0];
    assert_eq!(rel.method, DetectionMethod::Llm);
    assert_eq!(rel.rel_type, RelationshipType::Solves);
    assert!(rel.confidence >= 0.78, "confidence {} too low", rel.confidence);

    assert_eq!(response.run_report.tier_counts.llm_adjudicated, 1);
    // 100 input + 20 output tokens at the default unit prices.
    assert!(response.run_report.spend.actual_micro >= 600);
    assert_eq!(h.ledger.snapshot().counters.llm_requests, 1);
}

// ── Scenario 4: budget-driven degradation ─────────────────────────

#[tokio::test]
async fn budget_degradation_after_first_llm_call() {
    let mut items = Vec::new();
    let mut embedder = StubEmbedder::new();
    for i in 0..5 {
        let author = format!("dev{i}");
        let code = commit(
            &format!("c{i}"),
            &author,
            "2025-04-02T10:00:00Z",
            &format!("adjust worker pool {i}"),
        );
        let bug = ticket(
            &format!("PAY-1{i}"),
            &author,
            "2025-04-02T12:00:00Z",
            &format!("queue backlog variant {i}"),
        );
        let mut code_vec = vec![0.0_f32; 12];
        code_vec[i * 2] = 1.0;
        let mut bug_vec = vec![0.0_f32; 12];
        bug_vec[i * 2] = 0.63;
        bug_vec[i * 2 + 1] = 0.776_6;
        embedder = embedder.with_vector_for(&code, code_vec).with_vector_for(&bug, bug_vec);
        items.push(code);
        items.push(bug);
    }

    // Cap sized so one 5000-token LLM call lands the ledger past the 90%
    // disable-LLM rung but the pre-flight projection still fits.
    let mut config = config_with_cap(0.0165);
    config.concurrency.llm_workers = 1;

    let h = harness(
        config,
        embedder,
        ScriptedLlm::related(RelationshipType::Solves, 0.8).with_usage(5000, 0),
    );
    let response = run_items(&h, items).await;

    assert_eq!(response.run_report.mode, RunMode::Degraded);
    assert_eq!(response.run_report.tier_counts.llm_adjudicated, 1);
    assert_eq!(response.run_report.tier_counts.llm_skipped, 4);
    assert_eq!(response.relationships.len(), 1);

    let snapshot = h.ledger.snapshot();
    assert!(snapshot.spent_micro <= snapshot.cap_micro);
    assert_eq!(snapshot.reserved_micro, 0);
}

// ── Scenario 5: partial collector failure ─────────────────────────

#[tokio::test]
async fn partial_collector_failure_yields_warning_not_abort() {
    let healthy_items = vec![
        commit("c1", "alice", "2025-03-10T10:00:00Z", "Fix login crash (AUTH-123)"),
        ticket("AUTH-123", "alice", "2025-03-09T08:00:00Z", "Login crashes on empty password"),
    ];
    let mut registry = CollectorRegistry::new();
    registry.register(Arc::new(StubCollector::healthy("alpha", healthy_items)));
    registry.register(Arc::new(StubCollector::unavailable("beta")));

    let h = harness_with_collectors(
        config_with_cap(1.0),
        StubEmbedder::new(),
        ScriptedLlm::unrelated(),
        registry,
    );
    let request = CorrelateRequest {
        identity: Some("alice".to_string()),
        window: Some(window("2025-03-01T00:00:00Z", "2025-03-31T00:00:00Z")),
        mode: Mode::Auto,
        ..CorrelateRequest::default()
    };
    let response = h
        .orchestrator
        .run(request, &CancellationToken::new())
        .await
        .expect("run proceeds despite the dead collector");

    assert_eq!(response.relationships.len(), 1);
    let warnings = &response.run_report.partial_collection_warnings;
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].collector, "beta");
    assert!(warnings[0].reason.contains("unavailable"));
}

// ── Scenario 6: cancellation mid-embedding ────────────────────────

#[tokio::test]
async fn cancellation_mid_embedding_releases_reservations() {
    // Ten one-item batches; the embedder cancels the run token as the
    // second batch completes.
    let mut items = Vec::new();
    for i in 0..10 {
        let hour = i % 6;
        items.push(commit(
            &format!("c{i}"),
            "alice",
            &format!("2025-05-01T0{hour}:00:00Z"),
            &format!("incremental tuning step number {i}"),
        ));
    }

    let cancel = CancellationToken::new();
    let embedder = StubEmbedder::new()
        .with_batch_size(1)
        .cancelling_after(2, cancel.clone());
    let batches = embedder.call_counter();

    let mut config = config_with_cap(1.0);
    config.concurrency.embed_workers = 1;

    let h = harness(config, embedder, ScriptedLlm::unrelated());
    let result = h.orchestrator.run(request_for(items), &cancel).await;

    assert!(matches!(result, Err(CorrError::Cancelled)));
    assert_eq!(batches.load(std::sync::atomic::Ordering::SeqCst), 2);
    assert_eq!(h.ledger.snapshot().reserved_micro, 0);
    assert_eq!(h.ledger.snapshot().spent_micro, 0);
}

// ── Universal properties and boundary behaviors ───────────────────

#[tokio::test]
async fn empty_evidence_set_is_a_clean_noop() {
    let h = harness(config_with_cap(1.0), StubEmbedder::new(), ScriptedLlm::unrelated());
    let response = run_items(&h, Vec::new()).await;
    assert!(response.relationships.is_empty());
    assert!(response.stories.is_empty());
    assert_eq!(response.run_report.spend.actual_micro, 0);
}

#[tokio::test]
async fn identical_inputs_produce_identical_output() {
    let (items_a, embedder_a) = payment_retry_fixture();
    let (items_b, embedder_b) = payment_retry_fixture();

    let first = run_items(&harness(config_with_cap(1.0), embedder_a, ScriptedLlm::unrelated()), items_a).await;
    let second = run_items(&harness(config_with_cap(1.0), embedder_b, ScriptedLlm::unrelated()), items_b).await;

    assert_eq!(
        serde_json::to_vec(&first.relationships).unwrap(),
        serde_json::to_vec(&second.relationships).unwrap()
    );
    assert_eq!(
        serde_json::to_vec(&first.stories).unwrap(),
        serde_json::to_vec(&second.stories).unwrap()
    );
}

#[tokio::test]
async fn forced_llm_failure_degrades_but_keeps_lower_tiers() {
    // One explicit-reference pair (rule tier) plus one promoted pair the
    // LLM would have adjudicated.
    let fix = commit("c1", "alice", "2025-03-10T10:00:00Z", "Fix login crash (AUTH-123)");
    let bug = ticket("AUTH-123", "alice", "2025-03-09T08:00:00Z", "Login crashes on empty password");
    let (mut items, embedder) = ambiguous_pair_fixture();
    items.push(fix);
    items.push(bug);

    let h = harness(config_with_cap(1.0), embedder, ScriptedLlm::failing());
    let response = run_items(&h, items).await;

    assert_eq!(response.run_report.mode, RunMode::Degraded);
    assert!(response.run_report.tier_counts.llm_skipped >= 1);
    assert!(!response.relationships.is_empty());
    assert!(response.relationships.iter().all(|r| r.method != DetectionMethod::Llm));
    assert_eq!(h.ledger.snapshot().reserved_micro, 0);
}

#[tokio::test]
async fn embedding_provider_failure_is_recoverable() {
    let (items, _) = payment_retry_fixture();
    let h = harness(config_with_cap(1.0), StubEmbedder::new().failing(), ScriptedLlm::unrelated());

    let response = run_items(&h, items).await;

    assert_eq!(response.run_report.mode, RunMode::Degraded);
    assert!(response
        .run_report
        .failure_categories
        .iter()
        .any(|c| c.starts_with("embedding_batches_skipped")));
    // Un-embedded pairs fall through to the LLM gate instead of vanishing.
    assert!(response.run_report.tier_counts.llm_adjudicated > 0);
    assert_eq!(h.ledger.snapshot().reserved_micro, 0);
}

#[tokio::test]
async fn repeated_run_is_served_from_cache_for_free() {
    let (items, embedder) = payment_retry_fixture();
    let batches = embedder.call_counter();
    let h = harness(config_with_cap(1.0), embedder, ScriptedLlm::unrelated());

    let first = run_items(&h, items.clone()).await;
    let batches_after_first = batches.load(std::sync::atomic::Ordering::SeqCst);
    assert!(batches_after_first > 0);
    let spent_after_first = h.ledger.snapshot().spent_micro;

    let second = run_items(&h, items).await;
    assert_eq!(
        batches.load(std::sync::atomic::Ordering::SeqCst),
        batches_after_first,
        "second run must not re-embed"
    );
    assert_eq!(h.ledger.snapshot().spent_micro, spent_after_first, "cache hits are free");
    assert_eq!(
        serde_json::to_vec(&first.relationships).unwrap(),
        serde_json::to_vec(&second.relationships).unwrap()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reservations_never_exceed_the_cap() {
    let cap_micro = usd_to_micro(0.01);
    let ledger = Arc::new(BudgetLedger::new(&BudgetConfig {
        monthly_cap_usd: 0.01,
        ..BudgetConfig::default()
    }));

    let mut tasks = Vec::new();
    for worker in 0..16_u64 {
        let ledger = Arc::clone(&ledger);
        tasks.push(tokio::spawn(async move {
            let mut denied = 0_u32;
            for i in 0..50_u64 {
                let amount = ((worker * 7 + i * 13) % 500 + 1) as i64;
                match ledger.reserve(amount) {
                    Ok(handle) => {
                        if (worker + i) % 2 == 0 {
                            ledger.commit(handle, amount, amount).unwrap();
                        } else {
                            ledger.release(handle, amount).unwrap();
                        }
                    }
                    Err(_) => denied += 1,
                }
                let snapshot = ledger.snapshot();
                assert!(
                    snapshot.spent_micro + snapshot.reserved_micro <= snapshot.cap_micro,
                    "cap breached mid-flight"
                );
            }
            denied
        }));
    }

    let mut total_denied = 0;
    for task in tasks {
        total_denied += task.await.unwrap();
    }

    let snapshot = ledger.snapshot();
    assert!(snapshot.spent_micro <= cap_micro);
    assert_eq!(snapshot.reserved_micro, 0);
    assert!(total_denied > 0, "the cap should have been contended");
}

#[tokio::test]
async fn zero_cap_never_attempts_paid_operations() {
    let (items, embedder) = payment_retry_fixture();
    let batches = embedder.call_counter();
    let llm = ScriptedLlm::related(RelationshipType::Solves, 0.9);
    let llm_calls = llm.call_counter();

    let h = harness(config_with_cap(0.0), embedder, llm);
    let response = run_items(&h, items).await;

    assert_eq!(response.run_report.mode, RunMode::RuleBased);
    assert_eq!(batches.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(llm_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(response.run_report.spend.actual_micro, 0);
}

#[tokio::test]
async fn item_source_spread_is_reported_per_story() {
    let fix = commit("c1", "alice", "2025-03-10T10:00:00Z", "Fix login crash (AUTH-123)");
    let bug = ticket("AUTH-123", "alice", "2025-03-09T08:00:00Z", "Login crashes on empty password");
    let h = harness(config_with_cap(1.0), StubEmbedder::new(), ScriptedLlm::unrelated());
    let response = run_items(&h, vec![fix, bug]).await;

    let story = &response.stories[0];
    assert_eq!(story.per_source_counts.get("git"), Some(&1));
    assert_eq!(story.per_source_counts.get("jira"), Some(&1));
    let insights = response.insights.get(&story.id.0).expect("insights attached");
    assert_eq!(insights.collaboration.cross_source_links, 2);
    assert_eq!(insights.timeline.events.len(), 2);
}

#[tokio::test]
async fn comment_heavy_story_is_flagged_review_heavy() {
    let code = commit("c1", "alice", "2025-03-10T10:00:00Z", "Fix login crash (AUTH-123)");
    let bug = ticket("AUTH-123", "alice", "2025-03-09T08:00:00Z", "Login crashes on empty password");
    let mut comments = Vec::new();
    for i in 0..2 {
        comments.push(item(
            &format!("m{i}"),
            "jira",
            EvidenceKind::Comment,
            "bob",
            "2025-03-09T12:00:00Z",
            &format!("review note {i} on AUTH-123"),
            "see AUTH-123",
        ));
    }

    let h = harness(config_with_cap(1.0), StubEmbedder::new(), ScriptedLlm::unrelated());
    let mut items = vec![code, bug];
    items.extend(comments);
    let response = run_items(&h, items).await;

    assert_eq!(response.stories.len(), 1);
    let story = &response.stories[0];
    assert_eq!(story.members.len(), 4);
    let insights = response.insights.get(&story.id.0).unwrap();
    assert!(insights.patterns.review_heavy);
    assert_eq!(insights.collaboration.distinct_authors, 2);
}
