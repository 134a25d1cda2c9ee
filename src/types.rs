use dashmap::DashMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::embedding::EmbeddingClient;
use crate::keys::{KeyStore, QuotaLedger};
use crate::store::VectorStore;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// MCP protocol version this server speaks.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Server name reported by `initialize`.
pub const SERVER_NAME: &str = "midos";

/// Maximum document size (in bytes) read into memory by the knowledge tools.
pub const MAX_DOC_READ: usize = 512 * 1024;

/// Characters of skill content shown to unauthenticated callers.
pub const FREE_SKILL_PREVIEW: usize = 400;

// ---------------------------------------------------------------------------
// Tier labels
// ---------------------------------------------------------------------------

/// Entitlement level attached to an API key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyTier {
    Free,
    Dev,
    Pro,
    Team,
}

impl KeyTier {
    pub fn rank(self) -> u8 {
        match self {
            KeyTier::Free => 0,
            KeyTier::Dev => 1,
            KeyTier::Pro => 2,
            KeyTier::Team => 3,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            KeyTier::Free => "free",
            KeyTier::Dev => "dev",
            KeyTier::Pro => "pro",
            KeyTier::Team => "team",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "free" | "community" => Some(KeyTier::Free),
            "dev" => Some(KeyTier::Dev),
            "pro" | "premium" => Some(KeyTier::Pro),
            "team" | "admin" | "owner" => Some(KeyTier::Team),
            _ => None,
        }
    }
}

/// Minimum entitlement a tool demands. `Admin` tools need a team-rank key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToolTier {
    Free,
    Dev,
    Pro,
    Admin,
}

impl ToolTier {
    pub fn required_rank(self) -> u8 {
        match self {
            ToolTier::Free => 0,
            ToolTier::Dev => 1,
            ToolTier::Pro => 2,
            ToolTier::Admin => 3,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ToolTier::Free => "free",
            ToolTier::Dev => "dev",
            ToolTier::Pro => "pro",
            ToolTier::Admin => "admin",
        }
    }
}

// ---------------------------------------------------------------------------
// Tool registry (populated once at startup, immutable thereafter)
// ---------------------------------------------------------------------------

/// One registered tool: name, tier, and the metadata the handshake ranker reads.
pub struct ToolSpec {
    pub name: &'static str,
    pub tier: ToolTier,
    pub description: &'static str,
    /// Keywords the handshake ranker matches against the caller's stack/goal.
    pub tags: &'static [&'static str],
    /// Excluded from handshake output (still callable).
    pub exclude_from_output: bool,
}

/// The full tool table. Every tool name maps to exactly one tier and exactly
/// one handler arm in `mcp::handle_tool_call`.
pub static TOOL_REGISTRY: &[ToolSpec] = &[
    ToolSpec {
        name: "search_knowledge",
        tier: ToolTier::Free,
        description: "Keyword search across the MidOS knowledge base with ranked snippet previews.",
        tags: &["search", "knowledge", "docs", "documentation", "find"],
        exclude_from_output: false,
    },
    ToolSpec {
        name: "list_skills",
        tier: ToolTier::Free,
        description: "List available skills, optionally filtered and scored by a stack keyword.",
        tags: &["skills", "list", "capabilities", "stack"],
        exclude_from_output: false,
    },
    ToolSpec {
        name: "get_skill",
        tier: ToolTier::Free,
        description: "Fetch a skill document by name. Unauthenticated callers receive a preview.",
        tags: &["skill", "read", "pattern"],
        exclude_from_output: false,
    },
    ToolSpec {
        name: "get_protocol",
        tier: ToolTier::Free,
        description: "Fetch a protocol document by canonical name.",
        tags: &["protocol", "process", "docs"],
        exclude_from_output: false,
    },
    ToolSpec {
        name: "get_eureka",
        tier: ToolTier::Pro,
        description: "Fetch a EUREKA validated-finding document by name.",
        tags: &["eureka", "findings", "validated", "research"],
        exclude_from_output: false,
    },
    ToolSpec {
        name: "get_truth",
        tier: ToolTier::Pro,
        description: "Fetch a truth-patch document by name.",
        tags: &["truth", "patch", "provenance"],
        exclude_from_output: false,
    },
    ToolSpec {
        name: "hive_status",
        tier: ToolTier::Free,
        description: "System status as JSON: knowledge files, skills, chunk counts, uptime.",
        tags: &["status", "health", "stats"],
        exclude_from_output: true,
    },
    ToolSpec {
        name: "project_status",
        tier: ToolTier::Free,
        description: "Live Markdown dashboard with a quick-start guide.",
        tags: &["status", "dashboard", "overview"],
        exclude_from_output: true,
    },
    ToolSpec {
        name: "memory_stats",
        tier: ToolTier::Pro,
        description: "Vector memory statistics: chunk counts, staleness, archive totals.",
        tags: &["memory", "stats", "decay", "vector"],
        exclude_from_output: true,
    },
    ToolSpec {
        name: "pool_status",
        tier: ToolTier::Pro,
        description: "Coordination pool status for multi-instance deployments.",
        tags: &["pool", "coordination", "instances"],
        exclude_from_output: true,
    },
    ToolSpec {
        name: "semantic_search",
        tier: ToolTier::Pro,
        description: "Hybrid vector + keyword search over the knowledge memory, with optional stack re-ranking.",
        tags: &["search", "semantic", "vector", "hybrid", "rag", "embeddings"],
        exclude_from_output: false,
    },
    ToolSpec {
        name: "research_youtube",
        tier: ToolTier::Pro,
        description: "Queue a YouTube video for asynchronous research ingestion.",
        tags: &["research", "youtube", "video", "ingest"],
        exclude_from_output: false,
    },
    ToolSpec {
        name: "episodic_search",
        tier: ToolTier::Pro,
        description: "Search the episodic memory of past task executions (delegated).",
        tags: &["episodic", "memory", "history"],
        exclude_from_output: false,
    },
    ToolSpec {
        name: "episodic_store",
        tier: ToolTier::Admin,
        description: "Store an episode in episodic memory (delegated).",
        tags: &["episodic", "memory", "store"],
        exclude_from_output: true,
    },
    ToolSpec {
        name: "chunk_code",
        tier: ToolTier::Pro,
        description: "AST-based code chunking via the sibling chunker process.",
        tags: &["chunking", "code", "ast", "parse"],
        exclude_from_output: false,
    },
    ToolSpec {
        name: "agent_handshake",
        tier: ToolTier::Free,
        description: "Personalized onboarding: declares your model/client/stack, returns a budget-aware configuration.",
        tags: &["handshake", "onboarding", "configuration", "profile"],
        exclude_from_output: false,
    },
    ToolSpec {
        name: "pool_signal",
        tier: ToolTier::Admin,
        description: "Broadcast a coordination signal to the instance pool (delegated).",
        tags: &["pool", "signal", "coordination"],
        exclude_from_output: true,
    },
];

pub fn find_tool(name: &str) -> Option<&'static ToolSpec> {
    TOOL_REGISTRY.iter().find(|t| t.name == name)
}

// ---------------------------------------------------------------------------
// Data root layout
// ---------------------------------------------------------------------------

/// Resolved directory layout under the configurable data root.
#[derive(Clone)]
pub struct DataPaths {
    pub root: PathBuf,
    pub keys_file: PathBuf,
    pub usage_file: PathBuf,
    pub cli_profiles: PathBuf,
    pub knowledge_dir: PathBuf,
    pub eureka_dir: PathBuf,
    pub protocols_dir: PathBuf,
    pub truth_dir: PathBuf,
    pub chunks_dir: PathBuf,
    pub skills_dir: PathBuf,
    pub table_dir: PathBuf,
    pub archive_log: PathBuf,
    pub compat_log: PathBuf,
    pub inbox_dir: PathBuf,
    pub state_dir: PathBuf,
}

impl DataPaths {
    pub fn new(root: PathBuf) -> Self {
        let knowledge = root.join("knowledge");
        Self {
            keys_file: root.join("config").join("api_keys.json"),
            usage_file: root.join("config").join("api_usage.json"),
            cli_profiles: root.join("config").join("cli_profiles.json"),
            eureka_dir: knowledge.join("EUREKA"),
            protocols_dir: knowledge.join("protocols"),
            truth_dir: knowledge.join("truth"),
            chunks_dir: knowledge.join("chunks"),
            table_dir: knowledge.join("memory").join("midos_knowledge.lance"),
            archive_log: knowledge.join("memory").join("archived_chunks.jsonl"),
            compat_log: knowledge.join("SYSTEM").join("compatibility_log.jsonl"),
            skills_dir: root.join("skills"),
            inbox_dir: root.join("synapse").join("inbox"),
            state_dir: root.join("synapse").join("state"),
            knowledge_dir: knowledge,
            root,
        }
    }
}

// ---------------------------------------------------------------------------
// Request metadata (what the gate sees)
// ---------------------------------------------------------------------------

/// How the request arrived. Stdio is local by construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    Stdio,
    Http,
}

/// The header slice the gate inspects, normalized to lowercase keys.
#[derive(Clone, Debug)]
pub struct RequestMeta {
    pub transport: Transport,
    pub headers: HashMap<String, String>,
}

impl RequestMeta {
    pub fn stdio() -> Self {
        Self { transport: Transport::Stdio, headers: HashMap::new() }
    }

    pub fn http(headers: HashMap<String, String>) -> Self {
        Self { transport: Transport::Http, headers }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|s| s.as_str())
    }
}

// ---------------------------------------------------------------------------
// Server state (owned containers, constructed once at startup)
// ---------------------------------------------------------------------------

/// All process state. Each container guards its own interior mutability, so
/// the state itself is shared as a plain `Arc` by both transports.
pub struct ServerState {
    pub paths: DataPaths,
    pub store: VectorStore,
    pub embedder: EmbeddingClient,
    pub keys: KeyStore,
    pub quota: QuotaLedger,
    pub started_at: Instant,
}

impl ServerState {
    pub fn new(root: PathBuf, embedder: EmbeddingClient) -> Self {
        let paths = DataPaths::new(root);
        let store = VectorStore::open(&paths.table_dir, &paths.archive_log);
        let keys = KeyStore::new(paths.keys_file.clone());
        let quota = QuotaLedger::new(paths.usage_file.clone());
        Self { paths, store, embedder, keys, quota, started_at: Instant::now() }
    }
}

// ---------------------------------------------------------------------------
// HTTP session bookkeeping
// ---------------------------------------------------------------------------

/// Per-session record for the streamable HTTP transport. Sessions are an
/// optimization for clients that send `Mcp-Session-Id`; requests without one
/// are served statelessly.
pub struct McpSession {
    pub created: Instant,
    pub last_activity: Instant,
}

impl McpSession {
    pub fn new() -> Self {
        let now = Instant::now();
        Self { created: now, last_activity: now }
    }
}

impl Default for McpSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Axum application state: shared server state plus the session map.
#[derive(Clone)]
pub struct AppContext {
    pub state: Arc<ServerState>,
    pub sessions: Arc<DashMap<String, McpSession>>,
}
