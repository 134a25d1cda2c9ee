//! Synapse: file-drop IPC with sibling processes, plus the status
//! dashboards assembled from their state drops.
//!
//! Long-running work (video research, episodic memory, AST chunking, pool
//! coordination) is owned by sibling daemons. The server's side of the
//! contract is one JSON command file per request in `synapse/inbox/`.

use std::fs;

use chrono::Utc;
use serde::Serialize;
use url::Url;
use uuid::Uuid;

use crate::error::{Result, ServerError};
use crate::knowledge::{eureka_count, knowledge_file_count, skill_inventory};
use crate::types::{DataPaths, ServerState};

/// Hosts accepted by `research_youtube`.
const YOUTUBE_HOSTS: &[&str] = &["youtube.com", "www.youtube.com", "m.youtube.com", "youtu.be"];
const MAX_URL_LEN: usize = 2048;

// ---------------------------------------------------------------------------
// Command files
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Serialize)]
pub enum CommandType {
    #[serde(rename = "USER_COMMAND")]
    UserCommand,
    #[serde(rename = "RESEARCH_CYCLE")]
    ResearchCycle,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub enum Priority {
    #[serde(rename = "HIGH")]
    High,
    #[serde(rename = "NORMAL")]
    Normal,
    #[serde(rename = "LOW")]
    Low,
}

#[derive(Serialize)]
struct CommandFile<'a> {
    id: String,
    source: &'a str,
    #[serde(rename = "type")]
    command_type: CommandType,
    priority: Priority,
    payload: serde_json::Value,
    timestamp: String,
}

/// Drop one command file into the inbox. Returns the command id.
pub fn submit_command(
    paths: &DataPaths,
    source: &str,
    command_type: CommandType,
    priority: Priority,
    payload: serde_json::Value,
) -> Result<String> {
    // Timestamp for inbox ordering, uuid tail against same-instant collisions.
    let id = format!(
        "CMD_{}_{}_{}",
        source.to_uppercase(),
        Utc::now().timestamp_millis(),
        &Uuid::new_v4().simple().to_string()[..8]
    );
    let command = CommandFile {
        id: id.clone(),
        source,
        command_type,
        priority,
        payload,
        timestamp: Utc::now().to_rfc3339(),
    };

    fs::create_dir_all(&paths.inbox_dir)
        .map_err(|e| ServerError::internal(format!("inbox unavailable: {e}")))?;
    let body = serde_json::to_string_pretty(&command)
        .map_err(|e| ServerError::internal(format!("command serialization: {e}")))?;
    let path = paths.inbox_dir.join(format!("{id}.json"));
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, body)
        .and_then(|_| fs::rename(&tmp, &path))
        .map_err(|e| ServerError::internal(format!("command write failed: {e}")))?;
    Ok(id)
}

// ---------------------------------------------------------------------------
// research_youtube
// ---------------------------------------------------------------------------

/// Validate the URL (scheme, host allowlist, length) and queue a research
/// cycle. Nothing is written for rejected URLs.
pub fn research_youtube(paths: &DataPaths, raw_url: &str) -> Result<String> {
    if raw_url.len() > MAX_URL_LEN {
        return Err(ServerError::invalid("URL too long (max 2048 chars)".to_string()));
    }
    let parsed = Url::parse(raw_url)
        .map_err(|_| ServerError::invalid("Invalid URL".to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ServerError::invalid("Only http/https URLs are accepted".to_string()));
    }
    let host = parsed.host_str().unwrap_or("");
    if !YOUTUBE_HOSTS.contains(&host) {
        return Err(ServerError::invalid(format!(
            "Host '{host}' is not allowed — only youtube.com and youtu.be URLs can be queued"
        )));
    }

    let id = submit_command(
        paths,
        "mcp",
        CommandType::ResearchCycle,
        Priority::Normal,
        serde_json::json!({ "action": "research_youtube", "url": raw_url }),
    )?;
    Ok(format!("Task {id} submitted. Status: QUEUED."))
}

// ---------------------------------------------------------------------------
// Delegated tools
// ---------------------------------------------------------------------------

pub fn episodic_search(paths: &DataPaths, query: &str, limit: u64) -> Result<String> {
    let id = submit_command(
        paths,
        "mcp",
        CommandType::UserCommand,
        Priority::High,
        serde_json::json!({ "action": "episodic_search", "query": query, "limit": limit }),
    )?;
    Ok(format!(
        "Episodic search queued as {id}. The episodic memory daemon answers via synapse/state."
    ))
}

pub fn episodic_store(paths: &DataPaths, payload: serde_json::Value) -> Result<String> {
    let id = submit_command(paths, "mcp", CommandType::UserCommand, Priority::Normal, payload)?;
    Ok(format!("Episode queued for storage as {id}."))
}

pub fn chunk_code(paths: &DataPaths, file_path: &str) -> Result<String> {
    if file_path.trim().is_empty() {
        return Err(ServerError::invalid("'file_path' is required".to_string()));
    }
    let id = submit_command(
        paths,
        "mcp",
        CommandType::UserCommand,
        Priority::Normal,
        serde_json::json!({ "action": "chunk_code", "file_path": file_path }),
    )?;
    Ok(format!("Chunking queued as {id}."))
}

pub fn pool_signal(paths: &DataPaths, action: &str, topic: &str, summary: &str) -> Result<String> {
    if action.trim().is_empty() {
        return Err(ServerError::invalid("'action' is required".to_string()));
    }
    let id = submit_command(
        paths,
        "mcp",
        CommandType::UserCommand,
        Priority::High,
        serde_json::json!({
            "action": "pool_signal",
            "signal": action,
            "topic": topic,
            "summary": summary,
        }),
    )?;
    Ok(format!("Signal {id} broadcast to the pool."))
}

// ---------------------------------------------------------------------------
// Dashboards
// ---------------------------------------------------------------------------

fn read_state_file(paths: &DataPaths, name: &str) -> Option<serde_json::Value> {
    let raw = fs::read_to_string(paths.state_dir.join(name)).ok()?;
    serde_json::from_str(&raw).ok()
}

/// System status as JSON.
pub fn hive_status(state: &ServerState) -> String {
    let status = serde_json::json!({
        "server": crate::types::SERVER_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "knowledge_files": knowledge_file_count(&state.paths),
        "eureka_count": eureka_count(&state.paths),
        "skills_count": skill_inventory(&state.paths).len(),
        "chunks": state.store.count(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    });
    serde_json::to_string_pretty(&status).unwrap_or_else(|_| "{}".to_string())
}

/// Vector memory statistics as JSON.
pub fn memory_stats(state: &ServerState) -> String {
    let report = state.store.get_decay_report(5);
    let stats = serde_json::json!({
        "chunks": state.store.count(),
        "archived": state.store.archived_count(),
        "dimension": state.store.dim(),
        "embedding_enabled": state.embedder.is_enabled(),
        "embedding_cache_entries": state.embedder.cached_entries(),
        "stalest": report
            .iter()
            .map(|c| serde_json::json!({ "source": c.source, "decay_score": c.decay_score }))
            .collect::<Vec<_>>(),
    });
    serde_json::to_string_pretty(&stats).unwrap_or_else(|_| "{}".to_string())
}

/// Coordination pool status: sibling state drop if present, idle default
/// otherwise.
pub fn pool_status(state: &ServerState) -> String {
    let status = read_state_file(&state.paths, "pool.json").unwrap_or_else(|| {
        serde_json::json!({ "status": "idle", "instances": [], "note": "no pool daemon state found" })
    });
    serde_json::to_string_pretty(&status).unwrap_or_else(|_| "{}".to_string())
}

/// Live Markdown dashboard with a quick-start guide.
pub fn project_status(state: &ServerState) -> String {
    let knowledge = knowledge_file_count(&state.paths);
    let eureka = eureka_count(&state.paths);
    let skills = skill_inventory(&state.paths);
    let pending_commands = fs::read_dir(&state.paths.inbox_dir)
        .map(|entries| entries.flatten().count())
        .unwrap_or(0);

    format!(
        "# MidOS — Live Status\n\n\
         | Metric | Value |\n|---|---|\n\
         | Knowledge files | {knowledge} |\n\
         | EUREKA findings | {eureka} |\n\
         | Skills | {} |\n\
         | Memory chunks | {} |\n\
         | Queued commands | {pending_commands} |\n\
         | Uptime | {}s |\n\n\
         ## Quick Start\n\n\
         1. `search_knowledge` — find existing notes before building.\n\
         2. `agent_handshake` — declare your model and stack for a tailored setup.\n\
         3. `semantic_search` (pro) — hybrid retrieval over the chunk memory.\n\n\
         Skills available: {}\n",
        skills.len(),
        state.store.count(),
        state.started_at.elapsed().as_secs(),
        if skills.is_empty() { "(none)".to_string() } else { skills.join(", ") },
    )
}
