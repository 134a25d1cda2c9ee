//! Static model and client catalogs with alias resolution.
//!
//! Resolution order: exact canonical id → exact alias → substring (both
//! directions) → fuzzy by longest-common-subsequence ratio with a 0.85
//! cutoff. The cutoff is deliberately high: "glm" must never land on a
//! gemini entry just because the letters overlap.

use std::collections::HashMap;
use std::sync::LazyLock;

// ---------------------------------------------------------------------------
// Specs
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelTier {
    Frontier,
    Balanced,
    Fast,
    Edge,
}

/// Known capabilities of a model, keyed by canonical id.
pub struct ModelSpec {
    pub id: &'static str,
    pub family: &'static str,
    pub context_window: u64,
    pub max_output: u64,
    pub supports_tools: bool,
    pub supports_vision: bool,
    pub supports_structured: bool,
    pub tier: ModelTier,
    pub code_score: u8,
    pub reasoning_score: u8,
    pub speed_tps: u32,
    pub tips: &'static [&'static str],
    pub recommended_skills: &'static [&'static str],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextManagement {
    AutoCompact,
    DynamicPruning,
    Manual,
    None,
}

/// Known capabilities of a client (CLI/IDE), keyed by canonical id.
pub struct ClientSpec {
    pub id: &'static str,
    pub transports: &'static [&'static str],
    pub has_hooks: bool,
    pub has_memory: bool,
    pub has_background_agents: bool,
    pub max_parallel_agents: u32,
    pub context_management: ContextManagement,
    pub max_context: u64,
    pub tips: &'static [&'static str],
}

// ---------------------------------------------------------------------------
// Catalog data
// ---------------------------------------------------------------------------

pub static MODEL_CATALOG: &[ModelSpec] = &[
    ModelSpec {
        id: "claude-opus-4-5",
        family: "claude",
        context_window: 200_000,
        max_output: 64_000,
        supports_tools: true,
        supports_vision: true,
        supports_structured: true,
        tier: ModelTier::Frontier,
        code_score: 10,
        reasoning_score: 10,
        speed_tps: 60,
        tips: &[
            "Give it the whole problem, not pre-chewed steps",
            "Use extended thinking for architecture decisions",
        ],
        recommended_skills: &["rag-pipeline", "mcp-server", "code-review"],
    },
    ModelSpec {
        id: "claude-sonnet-4-5",
        family: "claude",
        context_window: 200_000,
        max_output: 64_000,
        supports_tools: true,
        supports_vision: true,
        supports_structured: true,
        tier: ModelTier::Balanced,
        code_score: 9,
        reasoning_score: 9,
        speed_tps: 90,
        tips: &["Best cost/quality default for agentic coding loops"],
        recommended_skills: &["mcp-server", "testing-strategy"],
    },
    ModelSpec {
        id: "claude-haiku-4-5",
        family: "claude",
        context_window: 200_000,
        max_output: 32_000,
        supports_tools: true,
        supports_vision: true,
        supports_structured: true,
        tier: ModelTier::Fast,
        code_score: 7,
        reasoning_score: 7,
        speed_tps: 160,
        tips: &["Route bulk classification and extraction here"],
        recommended_skills: &["prompt-caching"],
    },
    ModelSpec {
        id: "gpt-5.2",
        family: "gpt",
        context_window: 400_000,
        max_output: 128_000,
        supports_tools: true,
        supports_vision: true,
        supports_structured: true,
        tier: ModelTier::Frontier,
        code_score: 9,
        reasoning_score: 10,
        speed_tps: 70,
        tips: &["Pin reasoning effort explicitly; defaults drift between minor versions"],
        recommended_skills: &["structured-output", "code-review"],
    },
    ModelSpec {
        id: "gpt-5-mini",
        family: "gpt",
        context_window: 400_000,
        max_output: 64_000,
        supports_tools: true,
        supports_vision: true,
        supports_structured: true,
        tier: ModelTier::Fast,
        code_score: 7,
        reasoning_score: 7,
        speed_tps: 150,
        tips: &[],
        recommended_skills: &["prompt-caching"],
    },
    ModelSpec {
        id: "gemini-3-pro",
        family: "gemini",
        context_window: 1_000_000,
        max_output: 64_000,
        supports_tools: true,
        supports_vision: true,
        supports_structured: true,
        tier: ModelTier::Frontier,
        code_score: 9,
        reasoning_score: 9,
        speed_tps: 80,
        tips: &["Exploit the 1M window for whole-repo context instead of chunked retrieval"],
        recommended_skills: &["rag-pipeline", "long-context"],
    },
    ModelSpec {
        id: "gemini-3-flash",
        family: "gemini",
        context_window: 1_000_000,
        max_output: 64_000,
        supports_tools: true,
        supports_vision: true,
        supports_structured: true,
        tier: ModelTier::Fast,
        code_score: 7,
        reasoning_score: 7,
        speed_tps: 180,
        tips: &[],
        recommended_skills: &["long-context"],
    },
    ModelSpec {
        id: "deepseek-v3.2",
        family: "deepseek",
        context_window: 128_000,
        max_output: 32_000,
        supports_tools: true,
        supports_vision: false,
        supports_structured: true,
        tier: ModelTier::Balanced,
        code_score: 8,
        reasoning_score: 8,
        speed_tps: 60,
        tips: &["No vision — describe screenshots in text"],
        recommended_skills: &["testing-strategy"],
    },
    ModelSpec {
        id: "glm-4.7",
        family: "glm",
        context_window: 128_000,
        max_output: 32_000,
        supports_tools: true,
        supports_vision: false,
        supports_structured: true,
        tier: ModelTier::Balanced,
        code_score: 8,
        reasoning_score: 7,
        speed_tps: 70,
        tips: &[],
        recommended_skills: &["mcp-server"],
    },
    ModelSpec {
        id: "qwen3-coder",
        family: "qwen",
        context_window: 256_000,
        max_output: 32_000,
        supports_tools: true,
        supports_vision: false,
        supports_structured: true,
        tier: ModelTier::Balanced,
        code_score: 8,
        reasoning_score: 7,
        speed_tps: 80,
        tips: &[],
        recommended_skills: &["code-review"],
    },
    ModelSpec {
        id: "kimi-k2",
        family: "kimi",
        context_window: 256_000,
        max_output: 32_000,
        supports_tools: true,
        supports_vision: false,
        supports_structured: true,
        tier: ModelTier::Balanced,
        code_score: 8,
        reasoning_score: 8,
        speed_tps: 55,
        tips: &[],
        recommended_skills: &["rag-pipeline"],
    },
    ModelSpec {
        id: "llama-4-maverick",
        family: "llama",
        context_window: 128_000,
        max_output: 16_000,
        supports_tools: true,
        supports_vision: true,
        supports_structured: false,
        tier: ModelTier::Fast,
        code_score: 6,
        reasoning_score: 6,
        speed_tps: 120,
        tips: &["Structured output is unreliable — validate and retry JSON"],
        recommended_skills: &["structured-output"],
    },
    ModelSpec {
        id: "mistral-large-3",
        family: "mistral",
        context_window: 128_000,
        max_output: 32_000,
        supports_tools: true,
        supports_vision: false,
        supports_structured: true,
        tier: ModelTier::Balanced,
        code_score: 7,
        reasoning_score: 7,
        speed_tps: 90,
        tips: &[],
        recommended_skills: &[],
    },
    ModelSpec {
        id: "grok-4",
        family: "grok",
        context_window: 256_000,
        max_output: 32_000,
        supports_tools: true,
        supports_vision: true,
        supports_structured: true,
        tier: ModelTier::Frontier,
        code_score: 8,
        reasoning_score: 9,
        speed_tps: 75,
        tips: &[],
        recommended_skills: &["code-review"],
    },
    ModelSpec {
        id: "phi-4-mini",
        family: "phi",
        context_window: 32_000,
        max_output: 8_000,
        supports_tools: false,
        supports_vision: false,
        supports_structured: false,
        tier: ModelTier::Edge,
        code_score: 4,
        reasoning_score: 4,
        speed_tps: 200,
        tips: &["Edge model: keep prompts short, avoid multi-step tool chains"],
        recommended_skills: &["small-context"],
    },
];

static MODEL_ALIASES: LazyLock<HashMap<&'static str, &'static str>> = LazyLock::new(|| {
    HashMap::from([
        ("opus", "claude-opus-4-5"),
        ("claude-opus", "claude-opus-4-5"),
        ("sonnet", "claude-sonnet-4-5"),
        ("claude-sonnet", "claude-sonnet-4-5"),
        ("haiku", "claude-haiku-4-5"),
        ("gpt5", "gpt-5.2"),
        ("gpt-5", "gpt-5.2"),
        ("gemini-pro", "gemini-3-pro"),
        ("gemini-flash", "gemini-3-flash"),
        ("deepseek", "deepseek-v3.2"),
        ("glm", "glm-4.7"),
        ("qwen-coder", "qwen3-coder"),
        ("kimi", "kimi-k2"),
        ("maverick", "llama-4-maverick"),
        ("mistral-large", "mistral-large-3"),
        ("grok", "grok-4"),
    ])
});

pub static CLIENT_CATALOG: &[ClientSpec] = &[
    ClientSpec {
        id: "claude-code",
        transports: &["stdio", "streamable-http"],
        has_hooks: true,
        has_memory: true,
        has_background_agents: true,
        max_parallel_agents: 10,
        context_management: ContextManagement::AutoCompact,
        max_context: 200_000,
        tips: &[
            "Register this server in .mcp.json for per-project scoping",
            "Hooks can auto-run agent_handshake on session start",
        ],
    },
    ClientSpec {
        id: "cursor",
        transports: &["stdio", "streamable-http"],
        has_hooks: false,
        has_memory: true,
        has_background_agents: true,
        max_parallel_agents: 4,
        context_management: ContextManagement::DynamicPruning,
        max_context: 200_000,
        tips: &["Add the server under Settings → MCP; restart to pick up tool changes"],
    },
    ClientSpec {
        id: "windsurf",
        transports: &["stdio"],
        has_hooks: false,
        has_memory: true,
        has_background_agents: false,
        max_parallel_agents: 1,
        context_management: ContextManagement::DynamicPruning,
        max_context: 128_000,
        tips: &[],
    },
    ClientSpec {
        id: "cline",
        transports: &["stdio"],
        has_hooks: false,
        has_memory: false,
        has_background_agents: false,
        max_parallel_agents: 1,
        context_management: ContextManagement::Manual,
        max_context: 128_000,
        tips: &["No persistent memory — re-run agent_handshake each session"],
    },
    ClientSpec {
        id: "roo-code",
        transports: &["stdio"],
        has_hooks: false,
        has_memory: false,
        has_background_agents: false,
        max_parallel_agents: 1,
        context_management: ContextManagement::Manual,
        max_context: 128_000,
        tips: &[],
    },
    ClientSpec {
        id: "copilot",
        transports: &["stdio", "streamable-http"],
        has_hooks: false,
        has_memory: false,
        has_background_agents: true,
        max_parallel_agents: 2,
        context_management: ContextManagement::AutoCompact,
        max_context: 128_000,
        tips: &[],
    },
    ClientSpec {
        id: "zed",
        transports: &["stdio"],
        has_hooks: false,
        has_memory: false,
        has_background_agents: false,
        max_parallel_agents: 1,
        context_management: ContextManagement::None,
        max_context: 128_000,
        tips: &[],
    },
    ClientSpec {
        id: "aider",
        transports: &["stdio"],
        has_hooks: false,
        has_memory: false,
        has_background_agents: false,
        max_parallel_agents: 1,
        context_management: ContextManagement::Manual,
        max_context: 64_000,
        tips: &["Keep the repo map small; aider spends context on diffs"],
    },
    ClientSpec {
        id: "gemini-cli",
        transports: &["stdio"],
        has_hooks: false,
        has_memory: true,
        has_background_agents: false,
        max_parallel_agents: 1,
        context_management: ContextManagement::AutoCompact,
        max_context: 1_000_000,
        tips: &[],
    },
    ClientSpec {
        id: "codex-cli",
        transports: &["stdio"],
        has_hooks: false,
        has_memory: false,
        has_background_agents: true,
        max_parallel_agents: 4,
        context_management: ContextManagement::AutoCompact,
        max_context: 400_000,
        tips: &[],
    },
];

static CLIENT_ALIASES: LazyLock<HashMap<&'static str, &'static str>> = LazyLock::new(|| {
    HashMap::from([
        ("claudecode", "claude-code"),
        ("claude_code", "claude-code"),
        ("cc", "claude-code"),
        ("github-copilot", "copilot"),
        ("copilot-cli", "copilot"),
        ("roo", "roo-code"),
        ("codex", "codex-cli"),
        ("gemini", "gemini-cli"),
    ])
});

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Similarity cutoff for the fuzzy stage. High on purpose: below this,
/// cross-family confusion ("glm" → "gemini-…") starts to slip through.
const FUZZY_CUTOFF: f64 = 0.85;

/// Longest-common-subsequence similarity ratio in [0, 1]: `2·lcs/(|a|+|b|)`.
fn lcs_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for i in 1..=a.len() {
        for j in 1..=b.len() {
            curr[j] = if a[i - 1] == b[j - 1] {
                prev[j - 1] + 1
            } else {
                prev[j].max(curr[j - 1])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    2.0 * prev[b.len()] as f64 / (a.len() + b.len()) as f64
}

/// Generic resolver over a canonical id set plus an alias map. Returns the
/// canonical id of the best match, if any.
fn resolve_key(
    raw: &str,
    canonical: impl Iterator<Item = &'static str> + Clone,
    aliases: &HashMap<&'static str, &'static str>,
) -> Option<&'static str> {
    let q = raw.trim().to_lowercase();
    if q.is_empty() {
        return None;
    }

    // Exact canonical
    if let Some(id) = canonical.clone().find(|id| *id == q) {
        return Some(id);
    }
    // Exact alias
    if let Some(target) = aliases.get(q.as_str()) {
        return Some(target);
    }
    // Substring, canonical first, then alias keys
    if let Some(id) = canonical.clone().find(|id| id.contains(&q) || q.contains(*id)) {
        return Some(id);
    }
    if let Some((_, target)) = aliases.iter().find(|(k, _)| k.contains(&q) || q.contains(**k)) {
        return Some(target);
    }

    // Fuzzy over the union of canonical and alias keys
    let mut best: Option<(&'static str, f64)> = None;
    for id in canonical {
        let r = lcs_ratio(&q, id);
        if r >= FUZZY_CUTOFF && best.map_or(true, |(_, b)| r > b) {
            best = Some((id, r));
        }
    }
    for (k, target) in aliases.iter() {
        let r = lcs_ratio(&q, k);
        if r >= FUZZY_CUTOFF && best.map_or(true, |(_, b)| r > b) {
            best = Some((target, r));
        }
    }
    best.map(|(id, _)| id)
}

/// Resolve a raw model string to its catalog entry.
pub fn resolve_model(raw: &str) -> Option<&'static ModelSpec> {
    let id = resolve_key(raw, MODEL_CATALOG.iter().map(|m| m.id), &MODEL_ALIASES)?;
    MODEL_CATALOG.iter().find(|m| m.id == id)
}

/// Resolve a raw client string to its catalog entry.
pub fn resolve_client(raw: &str) -> Option<&'static ClientSpec> {
    let id = resolve_key(raw, CLIENT_CATALOG.iter().map(|c| c.id), &CLIENT_ALIASES)?;
    CLIENT_CATALOG.iter().find(|c| c.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_and_alias_resolution() {
        assert_eq!(resolve_model("claude-opus-4-5").unwrap().id, "claude-opus-4-5");
        assert_eq!(resolve_model("  Sonnet ").unwrap().id, "claude-sonnet-4-5");
        assert_eq!(resolve_client("cc").unwrap().id, "claude-code");
    }

    #[test]
    fn substring_resolution() {
        // Caller sends a dated variant; the catalog id is a substring of it.
        assert_eq!(resolve_model("claude-sonnet-4-5-20260115").unwrap().id, "claude-sonnet-4-5");
        assert_eq!(resolve_client("cursor-nightly").unwrap().id, "cursor");
    }

    #[test]
    fn fuzzy_never_crosses_families() {
        // "glm" resolves through its alias, never to a gemini entry.
        let m = resolve_model("glm").unwrap();
        assert_eq!(m.family, "glm");

        let c = resolve_client("cursor").unwrap();
        assert_ne!(c.id, "claude-code");
    }

    #[test]
    fn garbage_resolves_to_none() {
        assert!(resolve_model("definitely-not-a-model-xyz").is_none());
        assert!(resolve_client("zzzzz").is_none());
    }

    #[test]
    fn lcs_ratio_bounds() {
        assert_eq!(lcs_ratio("abc", "abc"), 1.0);
        assert_eq!(lcs_ratio("", "abc"), 0.0);
        assert!(lcs_ratio("glm", "gemini-3-pro") < FUZZY_CUTOFF);
    }
}
