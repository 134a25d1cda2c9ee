//! Retrieval engine tests: ingest round-trips, decay lifecycle, fusion
//! behavior, and the query cache — driven through the store API and the
//! semantic_search tool.

mod helpers;

use helpers::{is_error, result_text, stub_vector, TestHarness};
use midos_server::store::{ChunkInput, SearchMode, SearchRequest, ARCHIVED};
use midos_server::types::KeyTier;
use serde_json::json;

fn seed_chunks(h: &TestHarness) {
    let items = vec![
        ChunkInput {
            text: "Semantic caching intercepts repeated LLM prompts and serves stored answers."
                .to_string(),
            vector: Some(stub_vector(
                "Semantic caching intercepts repeated LLM prompts and serves stored answers.",
            )),
            source: "knowledge\\chunks\\caching.md".to_string(),
            metadata: json!({ "quality": 1.0 }),
        },
        ChunkInput {
            text: "Reciprocal rank fusion combines vector and keyword rankings per document."
                .to_string(),
            vector: Some(stub_vector(
                "Reciprocal rank fusion combines vector and keyword rankings per document.",
            )),
            source: "knowledge/chunks/fusion.md".to_string(),
            metadata: json!({ "quality": 1.0 }),
        },
        ChunkInput {
            text: "Monthly quota counters reset when the UTC month rolls over.".to_string(),
            vector: Some(stub_vector(
                "Monthly quota counters reset when the UTC month rolls over.",
            )),
            source: "knowledge/chunks/quota.md".to_string(),
            metadata: json!({ "quality": 0.8 }),
        },
    ];
    assert_eq!(h.state.store.add(items), 3);
}

// ---------------------------------------------------------------------------
// Ingest + search round-trips
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_add_then_search_roundtrip_vector_mode() {
    let h = TestHarness::new();
    seed_chunks(&h);

    let text = "Semantic caching intercepts repeated LLM prompts and serves stored answers.";
    let req = SearchRequest {
        query: text.to_string(),
        top_k: 1,
        mode: SearchMode::Vector,
        rerank: false,
        alpha: 0.5,
    };
    let results = h.state.store.search(&h.state.embedder, &req).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].text, text);
    assert_eq!(results[0].search_mode, "vector");
}

#[tokio::test]
async fn test_hybrid_roundtrip_and_source_normalization() {
    let h = TestHarness::new();
    seed_chunks(&h);

    let results = h
        .state
        .store
        .search(&h.state.embedder, &SearchRequest::hybrid("semantic caching prompts", 3))
        .await;
    assert!(!results.is_empty());
    assert!(results[0].text.contains("Semantic caching"));
    // Backslash sources are normalized on ingest
    assert_eq!(results[0].source, "knowledge/chunks/caching.md");
}

#[tokio::test]
async fn test_keyword_mode_works_without_embeddings() {
    let h = TestHarness::new();
    seed_chunks(&h);

    let req = SearchRequest {
        query: "quota counters month".to_string(),
        top_k: 2,
        mode: SearchMode::Keyword,
        rerank: false,
        alpha: 0.5,
    };
    let results = h.state.store.search(&h.state.embedder, &req).await;
    assert!(!results.is_empty());
    assert!(results[0].text.contains("quota"));
}

#[tokio::test]
async fn test_rerank_orders_by_overlap() {
    let h = TestHarness::new();
    seed_chunks(&h);

    let req = SearchRequest {
        query: "rank fusion vector keyword".to_string(),
        top_k: 3,
        mode: SearchMode::Keyword,
        rerank: true,
        alpha: 0.5,
    };
    let results = h.state.store.search(&h.state.embedder, &req).await;
    assert!(!results.is_empty());
    assert!(results[0].text.contains("fusion"));
    // Rerank scores blend rank and overlap, bounded by 1.0
    assert!(results[0].score <= 1.0 + 1e-9);
}

#[tokio::test]
async fn test_persistence_across_reopen() {
    let h = TestHarness::new();
    seed_chunks(&h);

    let reopened = midos_server::store::VectorStore::open(
        &h.state.paths.table_dir,
        &h.state.paths.archive_log,
    );
    assert_eq!(reopened.count(), 3);
    assert_eq!(reopened.dim(), Some(helpers::STUB_DIM));
}

// ---------------------------------------------------------------------------
// Decay lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_refresh_is_idempotent_and_counts_accesses() {
    let h = TestHarness::new();
    seed_chunks(&h);

    assert!(h.state.store.refresh_chunk("knowledge/chunks/fusion.md"));
    assert!(h.state.store.refresh_chunk("knowledge/chunks/fusion.md"));

    let report = h.state.store.get_decay_report(10);
    let fusion = report.iter().find(|c| c.source.ends_with("fusion.md")).unwrap();
    assert_eq!(fusion.access_count, 2);

    assert!(!h.state.store.refresh_chunk("no/such/prefix"));
}

#[tokio::test]
async fn test_archive_sets_sentinel_and_logs() {
    let h = TestHarness::new();
    seed_chunks(&h);

    assert!(h.state.store.archive_chunk("knowledge/chunks/quota.md"));
    assert_eq!(h.state.store.archived_count(), 1);

    // Archived chunks leave the search surface
    let req = SearchRequest {
        query: "quota counters month".to_string(),
        top_k: 3,
        mode: SearchMode::Keyword,
        rerank: false,
        alpha: 0.5,
    };
    let results = h.state.store.search(&h.state.embedder, &req).await;
    assert!(results.iter().all(|r| !r.text.contains("quota counters")));

    let log = std::fs::read_to_string(&h.state.paths.archive_log).unwrap();
    let entry: serde_json::Value = serde_json::from_str(log.lines().next().unwrap()).unwrap();
    assert_eq!(entry["source"], "knowledge/chunks/quota.md");

    // The record is retained with the sentinel, visible on reopen
    let reopened = midos_server::store::VectorStore::open(
        &h.state.paths.table_dir,
        &h.state.paths.archive_log,
    );
    assert_eq!(reopened.count(), 3);
    assert_eq!(reopened.archived_count(), 1);
}

#[tokio::test]
async fn test_batch_rescore_reports_stats() {
    let h = TestHarness::new();
    seed_chunks(&h);
    h.state.store.archive_chunk("knowledge/chunks/quota.md");

    let stats = h.state.store.batch_rescore_decay();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.rescored, 2);
    assert_eq!(stats.archived, 1);
    // Fresh chunks are nowhere near the stale threshold
    assert_eq!(stats.stale, 0);

    let report = h.state.store.get_decay_report(10);
    assert!(report.iter().all(|c| c.decay_score != ARCHIVED));
}

// ---------------------------------------------------------------------------
// Through the dispatcher
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_semantic_search_tool_roundtrip() {
    let h = TestHarness::new();
    seed_chunks(&h);
    let pro = h.make_key(KeyTier::Pro);

    let resp = h
        .call_tool_with_auth(
            "semantic_search",
            json!({ "query": "semantic caching", "top_k": 2, "mode": "hybrid" }),
            &pro,
        )
        .await;
    assert!(!is_error(&resp), "semantic_search failed: {resp}");
    let text = result_text(&resp);
    assert!(text.contains("caching.md"), "expected caching chunk in: {text}");
}

#[tokio::test]
async fn test_semantic_search_stack_boost() {
    let h = TestHarness::new();
    seed_chunks(&h);
    let pro = h.make_key(KeyTier::Pro);

    let resp = h
        .call_tool_with_auth(
            "semantic_search",
            json!({ "query": "rankings and caching", "top_k": 3, "stack": "fusion" }),
            &pro,
        )
        .await;
    assert!(!is_error(&resp));
}

#[tokio::test]
async fn test_query_result_cache_serves_repeat_queries() {
    let h = TestHarness::new();
    seed_chunks(&h);

    let req = SearchRequest::hybrid("reciprocal rank fusion", 2);
    let first = h.state.store.search(&h.state.embedder, &req).await;
    let second = h.state.store.search(&h.state.embedder, &req).await;
    assert_eq!(first.len(), second.len());
    assert_eq!(first[0].text, second[0].text);
}
