//! Integration tests for the MCP surface via dispatch_jsonrpc():
//! protocol basics, tier gating, auth edge cases, content security, and
//! concurrency — the same chain both transports run.

mod helpers;

use helpers::{is_error, response_text, result_text, TestHarness};
use midos_server::types::KeyTier;
use serde_json::json;

// ---------------------------------------------------------------------------
// Protocol basics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_initialize() {
    let h = TestHarness::new();
    let resp = h.initialize().await;

    assert_eq!(resp["result"]["protocolVersion"], "2024-11-05");
    assert_eq!(resp["result"]["serverInfo"]["name"], "midos");
    assert!(resp["result"]["capabilities"]["tools"].is_object());
}

#[tokio::test]
async fn test_tools_list_has_schemas() {
    let h = TestHarness::new();
    let resp = h.request("tools/list", json!({}), &h.remote_meta(None)).await;
    let tools = resp["result"]["tools"].as_array().expect("tools array");
    assert!(tools.len() >= 15);

    for tool in tools {
        assert!(tool["inputSchema"].is_object(), "tool {} missing inputSchema", tool["name"]);
    }

    let names: Vec<&str> = tools.iter().filter_map(|t| t["name"].as_str()).collect();
    for expected in [
        "search_knowledge",
        "list_skills",
        "get_skill",
        "get_eureka",
        "semantic_search",
        "agent_handshake",
        "research_youtube",
        "pool_signal",
    ] {
        assert!(names.contains(&expected), "missing tool {expected}");
    }
}

#[tokio::test]
async fn test_unknown_method_errors() {
    let h = TestHarness::new();
    let resp = h.request("nonexistent/method", json!({}), &h.remote_meta(None)).await;
    assert!(resp.get("error").is_some());
    assert_eq!(resp["error"]["code"], -32601);
}

#[tokio::test]
async fn test_ping() {
    let h = TestHarness::new();
    let resp = h.request("ping", json!({}), &h.remote_meta(None)).await;
    assert!(resp["result"].is_object());
}

// ---------------------------------------------------------------------------
// Community tier (unauthenticated remote)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_search_knowledge_no_auth() {
    let h = TestHarness::new();
    let resp = h.call_tool("search_knowledge", json!({ "query": "python", "max_results": 3 })).await;
    assert!(!is_error(&resp), "search_knowledge should work unauthenticated: {resp}");
    assert!(result_text(&resp).contains("python_testing.md"));
}

#[tokio::test]
async fn test_list_skills_no_auth() {
    let h = TestHarness::new();
    let resp = h.call_tool("list_skills", json!({})).await;
    assert!(!is_error(&resp));
    let text = result_text(&resp);
    assert!(text.contains("Available skills"));
    assert!(!text.contains("(0)"), "expected skills but got none: {text}");
}

#[tokio::test]
async fn test_list_skills_stack_filter() {
    let h = TestHarness::new();
    let resp = h.call_tool("list_skills", json!({ "stack": "python" })).await;
    assert!(!is_error(&resp));
    assert!(result_text(&resp).contains("python-testing"));
}

#[tokio::test]
async fn test_hive_status_counts() {
    let h = TestHarness::new();
    let resp = h.call_tool("hive_status", json!({})).await;
    assert!(!is_error(&resp));
    let data: serde_json::Value = serde_json::from_str(&result_text(&resp)).unwrap();
    assert!(data["knowledge_files"].as_u64().unwrap() > 0);
    assert!(data["skills_count"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn test_project_status_is_substantial() {
    let h = TestHarness::new();
    let resp = h.call_tool("project_status", json!({})).await;
    assert!(!is_error(&resp));
    assert!(result_text(&resp).len() > 100);
}

#[tokio::test]
async fn test_agent_handshake_no_auth() {
    let h = TestHarness::new();
    let resp = h
        .call_tool(
            "agent_handshake",
            json!({
                "model": "claude-sonnet-4-5",
                "client": "claude-code",
                "languages": "python,typescript",
                "project_goal": "build a retrieval service"
            }),
        )
        .await;
    assert!(!is_error(&resp), "handshake failed: {resp}");
    let text = result_text(&resp);
    assert!(text.len() > 50);
    assert!(text.contains("Getting Started (3 steps)"));
    assert!(text.contains("Top Tools"));
    assert!(text.contains("claude-sonnet-4-5"));
}

#[tokio::test]
async fn test_get_protocol_not_found() {
    let h = TestHarness::new();
    let resp = h.call_tool("get_protocol", json!({ "name": "NONEXISTENT" })).await;
    assert!(response_text(&resp).to_lowercase().contains("not found"));
}

// ---------------------------------------------------------------------------
// Tier gating
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_pro_tools_blocked_without_auth() {
    let h = TestHarness::new();
    for (name, args) in [
        ("get_eureka", json!({ "name": "test" })),
        ("get_truth", json!({ "name": "test" })),
        ("semantic_search", json!({ "query": "test" })),
        ("research_youtube", json!({ "url": "https://www.youtube.com/watch?v=x" })),
        ("chunk_code", json!({ "file_path": "/tmp/x.py" })),
        ("memory_stats", json!({})),
        ("pool_status", json!({})),
        ("episodic_search", json!({ "query": "test" })),
    ] {
        let resp = h.call_tool(name, args).await;
        let text = response_text(&resp).to_lowercase();
        let blocked = is_error(&resp)
            || text.contains("requires")
            || text.contains("upgrade")
            || text.contains("tier");
        assert!(blocked, "pro tool '{name}' should be blocked without auth: {resp}");
    }
}

#[tokio::test]
async fn test_admin_tools_blocked_for_pro_key() {
    let h = TestHarness::new();
    let pro = h.make_key(KeyTier::Pro);
    for (name, args) in [
        ("episodic_store", json!({ "task_type": "TEST", "input_preview": "x" })),
        ("pool_signal", json!({ "action": "test", "topic": "t", "summary": "s" })),
    ] {
        let resp = h.call_tool_with_auth(name, args, &pro).await;
        let text = response_text(&resp).to_lowercase();
        assert!(
            is_error(&resp) && (text.contains("admin") || text.contains("tier")),
            "admin tool '{name}' should be blocked for a pro key: {resp}"
        );
    }
}

#[tokio::test]
async fn test_pro_tools_work_with_pro_key() {
    let h = TestHarness::new();
    let pro = h.make_key(KeyTier::Pro);

    let resp = h
        .call_tool_with_auth("get_eureka", json!({ "name": "EUREKA_RESPONSE_CACHE_2026" }), &pro)
        .await;
    assert!(!is_error(&resp), "get_eureka with pro key: {resp}");
    assert!(result_text(&resp).contains("response cache"));

    let resp = h
        .call_tool_with_auth("semantic_search", json!({ "query": "caching patterns" }), &pro)
        .await;
    assert!(!is_error(&resp), "semantic_search with pro key: {resp}");

    let resp = h.call_tool_with_auth("memory_stats", json!({}), &pro).await;
    assert!(!is_error(&resp));
}

#[tokio::test]
async fn test_team_key_reaches_admin_tools() {
    let h = TestHarness::new();
    let team = h.make_key(KeyTier::Team);
    let resp = h
        .call_tool_with_auth(
            "pool_signal",
            json!({ "action": "sync", "topic": "deploy", "summary": "rolling" }),
            &team,
        )
        .await;
    assert!(!is_error(&resp), "team key should reach admin tools: {resp}");
    assert!(result_text(&resp).contains("broadcast"));
}

// ---------------------------------------------------------------------------
// Auth validation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_malformed_tokens_stay_unauthenticated() {
    let h = TestHarness::new();
    // Wrong scheme, wrong prefix, oversized token — all fall back to the
    // free tier, so a pro tool stays blocked (not an auth error).
    let oversized = format!("midos_sk_{}", "a".repeat(200));
    for token in ["not_a_midos_key", oversized.as_str()] {
        let resp = h.call_tool_with_auth("get_eureka", json!({ "name": "test" }), token).await;
        let text = response_text(&resp).to_lowercase();
        assert!(
            text.contains("requires") || text.contains("tier"),
            "malformed token must not grant access: {resp}"
        );
    }
}

#[tokio::test]
async fn test_unknown_wellformed_key_is_auth_invalid() {
    let h = TestHarness::new();
    let fake = format!("midos_sk_{}", "0".repeat(48));
    let resp = h.call_tool_with_auth("get_eureka", json!({ "name": "test" }), &fake).await;
    assert!(is_error(&resp));
    assert!(response_text(&resp).contains("Invalid or revoked API key"));
}

#[tokio::test]
async fn test_revoked_key_is_rejected_everywhere() {
    let h = TestHarness::new();
    let key = h.make_key(KeyTier::Pro);
    assert!(h.state.keys.revoke(&key).unwrap());

    // Even a free tool rejects a revoked key outright
    let resp = h.call_tool_with_auth("list_skills", json!({}), &key).await;
    assert!(is_error(&resp));
    assert!(response_text(&resp).contains("Invalid or revoked"));
}

#[tokio::test]
async fn test_localhost_bypass_grants_pro() {
    let h = TestHarness::new();
    let meta = midos_server::types::RequestMeta::http(
        [("host".to_string(), "127.0.0.1:8419".to_string())].into_iter().collect(),
    );
    let resp = h.call_tool_with_meta("memory_stats", json!({}), &meta).await;
    assert!(!is_error(&resp), "localhost should reach pro tools without a key: {resp}");
}

// ---------------------------------------------------------------------------
// Content security
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_skill_truncated_for_community() {
    let h = TestHarness::new();
    let resp = h.call_tool("get_skill", json!({ "name": "angular" })).await;
    assert!(!is_error(&resp));
    let text = result_text(&resp);
    assert!(text.len() < 800, "community skill content too long: {} chars", text.len());
    assert!(text.to_lowercase().contains("pricing") || text.contains("Full content"));
}

#[tokio::test]
async fn test_skill_full_for_authenticated() {
    let h = TestHarness::new();
    let pro = h.make_key(KeyTier::Pro);
    let resp = h.call_tool_with_auth("get_skill", json!({ "name": "angular" }), &pro).await;
    let text = result_text(&resp);
    assert!(text.len() > 800, "authenticated callers get full content");
}

#[tokio::test]
async fn test_path_traversal_in_skill_name() {
    let h = TestHarness::new();
    for name in ["../../../etc/passwd", "..\\..\\..\\windows\\system32", "<script>alert(1)</script>"]
    {
        let resp = h.call_tool("get_skill", json!({ "name": name })).await;
        let text = response_text(&resp).to_lowercase();
        assert!(!text.contains("passwd"), "traversal payload echoed: {text}");
        assert!(
            text.contains("invalid") || text.contains("not found"),
            "traversal should be rejected: {text}"
        );
    }
}

#[tokio::test]
async fn test_youtube_host_restriction() {
    let h = TestHarness::new();
    let pro = h.make_key(KeyTier::Pro);
    let resp = h
        .call_tool_with_auth(
            "research_youtube",
            json!({ "url": "https://evil.example.com/x" }),
            &pro,
        )
        .await;
    assert!(is_error(&resp));
    assert!(response_text(&resp).to_lowercase().contains("youtube"));

    // Nothing was queued for the rejected URL
    let inbox = &h.state.paths.inbox_dir;
    let queued = std::fs::read_dir(inbox).map(|e| e.count()).unwrap_or(0);
    assert_eq!(queued, 0, "rejected URL must not write a command file");
}

#[tokio::test]
async fn test_resource_read_truncates_for_community() {
    let h = TestHarness::new();
    let resp = h
        .request(
            "resources/read",
            json!({ "uri": "midos://skill/angular" }),
            &h.remote_meta(None),
        )
        .await;
    let text = resp["result"]["contents"][0]["text"].as_str().unwrap_or("");
    assert!(!text.is_empty());
    assert!(text.len() < 800);
}

// ---------------------------------------------------------------------------
// Quota
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_anonymous_quota_exhaustion() {
    let h = TestHarness::new();
    // Free tier: 100 queries/month under the anonymous identifier.
    for i in 0..100 {
        let resp = h.call_tool("list_skills", json!({})).await;
        assert!(!is_error(&resp), "call {i} should be within quota");
    }
    let resp = h.call_tool("list_skills", json!({})).await;
    assert!(is_error(&resp), "101st call must be rate limited");
    let text = response_text(&resp);
    assert!(text.contains("100/100"), "quota error should carry count/limit: {text}");
    assert!(text.contains("midos.dev/pricing"));
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_parallel_community_tools() {
    let h = TestHarness::new();
    let (a, b, c, d, e) = tokio::join!(
        h.call_tool("hive_status", json!({})),
        h.call_tool("list_skills", json!({})),
        h.call_tool("search_knowledge", json!({ "query": "python" })),
        h.call_tool("project_status", json!({})),
        h.call_tool("get_skill", json!({ "name": "react" })),
    );
    for resp in [&a, &b, &c, &d, &e] {
        assert!(!is_error(resp), "parallel community call failed: {resp}");
    }
}
