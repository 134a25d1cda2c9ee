//! MCP JSON-RPC dispatch shared by the stdio and HTTP transports.
//!
//! Handles `initialize`, `tools/list`, `tools/call`, `resources/list`,
//! `resources/read`, and `ping`. Gate errors (auth, tier, quota) become
//! JSON-RPC `error` objects; tool-level domain errors become results with
//! `isError: true` so clients can still read the explanation.

use std::io::Write as IoWrite;
use std::sync::Arc;

use tokio::io::AsyncBufReadExt;
use tracing::info;

use crate::error::ServerError;
use crate::gate::{self, Caller};
use crate::knowledge::{self, DocKind};
use crate::profile::AgentProfile;
use crate::store::{SearchMode, SearchRequest};
use crate::synapse;
use crate::types::{RequestMeta, ServerState, PROTOCOL_VERSION, SERVER_NAME, TOOL_REGISTRY};

// ---------------------------------------------------------------------------
// Tool definitions
// ---------------------------------------------------------------------------

fn input_schema(name: &str) -> serde_json::Value {
    match name {
        "search_knowledge" => serde_json::json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Search terms" },
                "max_results": { "type": "integer", "description": "Max results (default: 5)" }
            },
            "required": ["query"]
        }),
        "list_skills" => serde_json::json!({
            "type": "object",
            "properties": {
                "stack": { "type": "string", "description": "Optional stack keyword to filter and score skills (e.g. 'python')" }
            }
        }),
        "get_skill" | "get_protocol" | "get_eureka" | "get_truth" => serde_json::json!({
            "type": "object",
            "properties": {
                "name": { "type": "string", "description": "Document name (letters, digits, '_', '-')" }
            },
            "required": ["name"]
        }),
        "semantic_search" => serde_json::json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Natural-language query" },
                "top_k": { "type": "integer", "description": "Results to return (default: 5)" },
                "mode": { "type": "string", "enum": ["vector", "keyword", "hybrid"], "description": "Retrieval mode (default: hybrid)" },
                "rerank": { "type": "boolean", "description": "Re-rank the fused results (default: false)" },
                "alpha": { "type": "number", "description": "Vector-leg weight in [0,1] for hybrid fusion (default: 0.5)" },
                "stack": { "type": "string", "description": "Optional stack token to boost matching results" }
            },
            "required": ["query"]
        }),
        "research_youtube" => serde_json::json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "YouTube video URL (youtube.com or youtu.be)" }
            },
            "required": ["url"]
        }),
        "episodic_search" => serde_json::json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "What to look for in past episodes" },
                "limit": { "type": "integer", "description": "Max episodes (default: 5)" }
            },
            "required": ["query"]
        }),
        "episodic_store" => serde_json::json!({
            "type": "object",
            "properties": {
                "task_type": { "type": "string", "description": "Episode category" },
                "input_preview": { "type": "string", "description": "Short preview of the episode input" },
                "outcome": { "type": "string", "description": "What happened" }
            },
            "required": ["task_type"]
        }),
        "chunk_code" => serde_json::json!({
            "type": "object",
            "properties": {
                "file_path": { "type": "string", "description": "Path to the source file to chunk" }
            },
            "required": ["file_path"]
        }),
        "agent_handshake" => serde_json::json!({
            "type": "object",
            "properties": {
                "model": { "type": "string", "description": "Model id or alias (e.g. 'claude-sonnet-4-5')" },
                "context_window": { "type": "integer", "description": "Declared context window in tokens" },
                "client": { "type": "string", "description": "Client id (e.g. 'claude-code', 'cursor')" },
                "languages": { "type": "string", "description": "Comma-separated languages (or a JSON array)" },
                "frameworks": { "type": "string", "description": "Comma-separated frameworks (or a JSON array)" },
                "platform": { "type": "string", "description": "OS / platform" },
                "project_goal": { "type": "string", "description": "What you are building" },
                "tier": { "type": "string", "description": "Declared tier (community/paid/premium/admin/owner)" }
            }
        }),
        "pool_signal" => serde_json::json!({
            "type": "object",
            "properties": {
                "action": { "type": "string", "description": "Signal kind" },
                "topic": { "type": "string", "description": "Signal topic" },
                "summary": { "type": "string", "description": "One-line summary" }
            },
            "required": ["action"]
        }),
        // hive_status, project_status, memory_stats, pool_status
        _ => serde_json::json!({
            "type": "object",
            "properties": {},
            "additionalProperties": false
        }),
    }
}

fn tool_definitions() -> serde_json::Value {
    let tools: Vec<serde_json::Value> = gate::on_list_tools()
        .iter()
        .map(|tool| {
            serde_json::json!({
                "name": tool.name,
                "description": tool.description,
                "inputSchema": input_schema(tool.name),
                "annotations": {
                    "readOnlyHint": !matches!(
                        tool.name,
                        "research_youtube" | "episodic_store" | "chunk_code" | "pool_signal"
                    ),
                    "openWorldHint": false
                }
            })
        })
        .collect();
    serde_json::Value::Array(tools)
}

// ---------------------------------------------------------------------------
// Tool call handler
// ---------------------------------------------------------------------------

fn doc_result(result: crate::error::Result<String>) -> (String, bool) {
    match result {
        Ok(text) => (text, false),
        Err(e) => (e.to_string(), true),
    }
}

async fn handle_tool_call(
    state: &ServerState,
    name: &str,
    args: &serde_json::Value,
    caller: &Caller,
) -> (String, bool) {
    match name {
        "search_knowledge" => {
            let query = args["query"].as_str().unwrap_or("");
            if query.is_empty() {
                return ("Error: 'query' is required".to_string(), true);
            }
            let max_results = args["max_results"].as_u64().unwrap_or(5).min(20) as usize;
            let hits = knowledge::search_knowledge(&state.paths, query, max_results);
            if hits.is_empty() {
                return (format!("No results for '{query}'"), false);
            }
            let mut out = format!("# MidOS Search: '{query}'\n\n");
            for hit in &hits {
                out.push_str(&format!(
                    "**{}** (score: {}, {} chars)\n{}\n\n",
                    hit.path, hit.score, hit.size, hit.preview
                ));
            }
            (out, false)
        }

        "list_skills" => {
            let stack = args["stack"].as_str();
            (knowledge::list_skills(&state.paths, stack), false)
        }

        "get_skill" => {
            let skill_name = args["name"].as_str().unwrap_or("");
            doc_result(knowledge::get_skill(&state.paths, skill_name, caller.is_authenticated()))
        }

        "get_protocol" => {
            let doc = args["name"].as_str().unwrap_or("");
            doc_result(knowledge::get_document(&state.paths, DocKind::Protocol, doc))
        }
        "get_eureka" => {
            let doc = args["name"].as_str().unwrap_or("");
            doc_result(knowledge::get_document(&state.paths, DocKind::Eureka, doc))
        }
        "get_truth" => {
            let doc = args["name"].as_str().unwrap_or("");
            doc_result(knowledge::get_document(&state.paths, DocKind::Truth, doc))
        }

        "hive_status" => (synapse::hive_status(state), false),
        "project_status" => (synapse::project_status(state), false),
        "memory_stats" => (synapse::memory_stats(state), false),
        "pool_status" => (synapse::pool_status(state), false),

        "semantic_search" => {
            let query = args["query"].as_str().unwrap_or("");
            if query.is_empty() {
                return ("Error: 'query' is required".to_string(), true);
            }
            let request = SearchRequest {
                query: query.to_string(),
                top_k: args["top_k"].as_u64().unwrap_or(5).clamp(1, 20) as usize,
                mode: args["mode"]
                    .as_str()
                    .and_then(SearchMode::parse)
                    .unwrap_or(SearchMode::Hybrid),
                rerank: args["rerank"].as_bool().unwrap_or(false),
                alpha: args["alpha"].as_f64().unwrap_or(0.5),
            };
            let mut results = state.store.search(&state.embedder, &request).await;

            // Optional stack re-rank: results mentioning the stack token float up.
            if let Some(stack) = args["stack"].as_str() {
                let token = stack.to_lowercase();
                results.sort_by(|a, b| {
                    let boost = |r: &crate::store::SearchResult| {
                        if r.text.to_lowercase().contains(&token)
                            || r.source.to_lowercase().contains(&token)
                        {
                            r.score * 1.5
                        } else {
                            r.score
                        }
                    };
                    boost(b).partial_cmp(&boost(a)).unwrap_or(std::cmp::Ordering::Equal)
                });
            }

            if results.is_empty() {
                let note = if state.embedder.is_enabled() {
                    ""
                } else {
                    " (vector leg unavailable — keyword-only degrade)"
                };
                return (format!("No matches for '{query}'{note}"), false);
            }

            let mut out = format!(
                "# Semantic Search: '{query}' ({} mode, {} results)\n\n",
                request.mode.as_str(),
                results.len()
            );
            for r in &results {
                let mut end = r.text.len().min(250);
                while end > 0 && !r.text.is_char_boundary(end) {
                    end -= 1;
                }
                out.push_str(&format!(
                    "**{}** (score {:.3})\n{}\n\n",
                    r.source,
                    r.score,
                    r.text[..end].replace('\n', " ")
                ));
            }
            (out, false)
        }

        "research_youtube" => {
            let command_url = args["url"].as_str().unwrap_or("");
            doc_result(synapse::research_youtube(&state.paths, command_url))
        }

        "episodic_search" => {
            let query = args["query"].as_str().unwrap_or("");
            if query.is_empty() {
                return ("Error: 'query' is required".to_string(), true);
            }
            let limit = args["limit"].as_u64().unwrap_or(5);
            doc_result(synapse::episodic_search(&state.paths, query, limit))
        }

        "episodic_store" => {
            if args["task_type"].as_str().unwrap_or("").is_empty() {
                return ("Error: 'task_type' is required".to_string(), true);
            }
            let mut payload = args.clone();
            if let Some(obj) = payload.as_object_mut() {
                obj.insert("action".to_string(), serde_json::json!("episodic_store"));
            }
            doc_result(synapse::episodic_store(&state.paths, payload))
        }

        "chunk_code" => {
            let file_path = args["file_path"].as_str().unwrap_or("");
            doc_result(synapse::chunk_code(&state.paths, file_path))
        }

        "agent_handshake" => {
            let profile: AgentProfile = match serde_json::from_value(args.clone()) {
                Ok(p) => p,
                Err(e) => return (format!("Error: invalid handshake payload: {e}"), true),
            };
            (crate::handshake::handshake(state, profile).await, false)
        }

        "pool_signal" => {
            let action = args["action"].as_str().unwrap_or("");
            let topic = args["topic"].as_str().unwrap_or("");
            let summary = args["summary"].as_str().unwrap_or("");
            doc_result(synapse::pool_signal(&state.paths, action, topic, summary))
        }

        _ => (format!("Unknown tool: {name}"), true),
    }
}

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

fn resources_list(state: &ServerState) -> serde_json::Value {
    let resources: Vec<serde_json::Value> = knowledge::skill_inventory(&state.paths)
        .into_iter()
        .map(|skill| {
            serde_json::json!({
                "uri": format!("midos://skill/{skill}"),
                "name": format!("Skill: {skill}"),
                "mimeType": "text/markdown"
            })
        })
        .collect();
    serde_json::Value::Array(resources)
}

fn read_resource(
    state: &ServerState,
    uri: &str,
    caller: &Caller,
) -> Result<serde_json::Value, ServerError> {
    let skill = uri
        .strip_prefix("midos://skill/")
        .or_else(|| uri.strip_prefix("resource://skill/"))
        .ok_or_else(|| ServerError::invalid(format!("Unknown resource: {uri}")))?;
    let text = knowledge::get_skill(&state.paths, skill, caller.is_authenticated())?;
    Ok(serde_json::json!({
        "contents": [{ "uri": uri, "mimeType": "text/markdown", "text": text }]
    }))
}

// ---------------------------------------------------------------------------
// JSON-RPC dispatch
// ---------------------------------------------------------------------------

/// Process a single JSON-RPC request. Returns `None` for notifications.
pub async fn dispatch_jsonrpc(
    state: &Arc<ServerState>,
    msg: &serde_json::Value,
    meta: &RequestMeta,
) -> Option<serde_json::Value> {
    let method = msg["method"].as_str().unwrap_or("");
    let id = msg.get("id").cloned();

    if id.is_none() || method.starts_with("notifications/") {
        return None;
    }

    let response = match method {
        "initialize" => {
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {
                        "tools": {},
                        "resources": {}
                    },
                    "serverInfo": {
                        "name": SERVER_NAME,
                        "version": env!("CARGO_PKG_VERSION")
                    },
                    "instructions": "MidOS knowledge server. Start with agent_handshake to get a configuration tailored to your model and stack, then search_knowledge / semantic_search for retrieval and list_skills / get_skill for capability patterns."
                }
            })
        }
        "tools/list" => {
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": { "tools": tool_definitions() }
            })
        }
        "tools/call" => {
            let tool_name = msg["params"]["name"].as_str().unwrap_or("");
            let arguments =
                msg["params"].get("arguments").cloned().unwrap_or(serde_json::json!({}));

            match gate::on_tool_call(state, tool_name, meta) {
                Err(e) => serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": { "code": e.jsonrpc_code(), "message": e.to_string() }
                }),
                Ok(caller) => {
                    let (text, is_error) =
                        handle_tool_call(state, tool_name, &arguments, &caller).await;
                    serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "result": {
                            "content": [{ "type": "text", "text": text }],
                            "isError": is_error
                        }
                    })
                }
            }
        }
        "resources/list" => {
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": { "resources": resources_list(state) }
            })
        }
        "resources/read" => {
            let uri = msg["params"]["uri"].as_str().unwrap_or("");
            let outcome = gate::resolve_caller(state, meta)
                .and_then(|caller| read_resource(state, uri, &caller));
            match outcome {
                Ok(result) => serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": result }),
                Err(e) => serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": { "code": e.jsonrpc_code(), "message": e.to_string() }
                }),
            }
        }
        "ping" => {
            serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": {} })
        }
        _ => {
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": "Method not found" }
            })
        }
    };

    Some(response)
}

// ---------------------------------------------------------------------------
// Stdio transport
// ---------------------------------------------------------------------------

/// Run the MCP stdio loop: one JSON-RPC frame per line. The stdio transport
/// is local by construction, so the gate applies the localhost bypass.
pub async fn run_mcp(state: Arc<ServerState>) {
    let meta = RequestMeta::stdio();
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let mut initialized = false;

    info!(
        tools = TOOL_REGISTRY.len(),
        chunks = state.store.count(),
        "MCP stdio server ready"
    );

    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }

        let msg: serde_json::Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => {
                let err = serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": { "code": -32700, "message": "Parse error" }
                });
                write_frame(&err);
                continue;
            }
        };

        let method = msg["method"].as_str().unwrap_or("");
        if method.starts_with("notifications/") {
            continue;
        }

        // Init ordering: reject everything but initialize/ping before init.
        if !initialized && method != "initialize" && method != "ping" {
            if let Some(id) = msg.get("id").cloned() {
                let err = serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {
                        "code": -32002,
                        "message": "Server not initialized. Send 'initialize' first."
                    }
                });
                write_frame(&err);
            }
            continue;
        }

        if let Some(response) = dispatch_jsonrpc(&state, &msg, &meta).await {
            if method == "initialize" {
                initialized = true;
            }
            write_frame(&response);
        }
    }
}

fn write_frame(frame: &serde_json::Value) {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let _ = writeln!(out, "{frame}");
    let _ = out.flush();
}
