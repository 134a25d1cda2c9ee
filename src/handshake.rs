//! Handshake engine: personalized agent onboarding.
//!
//! Takes the declared profile, resolves it against the catalogs, ranks
//! tools / skills / knowledge chunks for the caller's stack and goal,
//! composes guardrails, and renders a context-budget-aware Markdown
//! configuration. Every handshake appends one line to the compatibility
//! log; failures there are swallowed.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write as IoWrite;

use serde::Deserialize;
use tracing::warn;

use crate::knowledge::{skill_compat, skill_inventory};
use crate::profile::{resolve_profile, AgentProfile, ContextLabel, ResolvedProfile};
use crate::store::{SearchRequest, SearchResult};
use crate::types::{ServerState, ToolSpec, TOOL_REGISTRY};

/// Core tools that always deserve a ranking bonus.
const CORE_TOOLS: &[&str] = &["search_knowledge", "semantic_search", "list_skills"];

/// Goals that are clearly just someone poking the endpoint — skip the
/// retrieval round-trip for them.
const TEST_PHRASES: &[&str] = &["test", "testing", "hello", "demo", "example", "prueba"];

/// Seed skills offered when nothing ranked at all.
const SEED_SKILLS: &[&str] =
    &["rag-pipeline", "mcp-server", "testing-strategy", "code-review", "prompt-caching"];

const MIN_CHUNK_SCORE: f64 = 0.25;
const MAX_SKILLS: usize = 15;

// ---------------------------------------------------------------------------
// Keyword helpers
// ---------------------------------------------------------------------------

fn keywords_of(profile: &AgentProfile) -> Vec<String> {
    let mut words: Vec<String> = Vec::new();
    if let Some(goal) = &profile.project_goal {
        words.extend(goal.to_lowercase().split_whitespace().map(|w| w.to_string()));
    }
    words.extend(profile.languages.iter().cloned());
    words.extend(profile.frameworks.iter().cloned());
    words
}

fn overlap(keywords: &[String], haystack: &str) -> usize {
    let hay = haystack.to_lowercase();
    keywords.iter().filter(|w| w.len() > 2 && hay.contains(w.as_str())).count()
}

// ---------------------------------------------------------------------------
// Per-client tool restrictions (config/cli_profiles.json)
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, Deserialize)]
struct ClientRestriction {
    #[serde(default)]
    allow: Vec<String>,
    #[serde(default)]
    deny: Vec<String>,
}

fn load_restriction(state: &ServerState, client_id: &str) -> Option<ClientRestriction> {
    let raw = fs::read_to_string(&state.paths.cli_profiles).ok()?;
    let map: HashMap<String, ClientRestriction> = serde_json::from_str(&raw).ok()?;
    map.get(client_id).cloned()
}

fn tool_permitted(restriction: &Option<ClientRestriction>, name: &str) -> bool {
    let Some(r) = restriction else { return true };
    if r.deny.iter().any(|d| d == name) {
        return false;
    }
    if r.allow.is_empty() {
        return true;
    }
    r.allow.iter().any(|a| a == "*" || a == name)
}

// ---------------------------------------------------------------------------
// Ranking
// ---------------------------------------------------------------------------

fn rank_tools(state: &ServerState, resolved: &ResolvedProfile) -> Vec<&'static ToolSpec> {
    let keywords = keywords_of(&resolved.profile);
    let restriction = resolved
        .client
        .and_then(|c| load_restriction(state, c.id));

    let mut scored: Vec<(f64, &'static ToolSpec)> = TOOL_REGISTRY
        .iter()
        .filter(|t| !t.exclude_from_output)
        .filter(|t| tool_permitted(&restriction, t.name))
        .map(|tool| {
            let haystack = format!("{} {}", tool.description, tool.tags.join(" "));
            let mut score = overlap(&keywords, &haystack) as f64;
            if CORE_TOOLS.contains(&tool.name) {
                score += 3.0;
            }
            (score, tool)
        })
        .collect();

    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.into_iter().map(|(_, t)| t).collect()
}

/// Three-layer skill ranking, deduplicated by name:
/// model recommendations (10), compatibility scan, goal-word hits.
fn rank_skills(state: &ServerState, resolved: &ResolvedProfile) -> Vec<(String, f64)> {
    let keywords = keywords_of(&resolved.profile);
    let inventory = skill_inventory(&state.paths);
    let mut scores: HashMap<String, f64> = HashMap::new();

    // Layer 1: the model's recommended skills
    if let Some(model) = resolved.model {
        for skill in model.recommended_skills {
            scores.insert(skill.to_string(), 10.0);
        }
    }

    // Layer 2: compatibility descriptors over the whole inventory
    for skill in &inventory {
        let mut score = 0.0;
        if let Some(compat) = skill_compat(&state.paths, skill) {
            let keyword_hits = compat
                .keywords
                .iter()
                .filter(|k| keywords.iter().any(|w| w == &k.to_lowercase()))
                .count();
            score += 2.0 * keyword_hits as f64;
            if compat
                .languages
                .iter()
                .any(|l| resolved.profile.languages.contains(&l.to_lowercase()))
            {
                score += 3.0;
            }
            if compat
                .frameworks
                .iter()
                .any(|f| resolved.profile.frameworks.contains(&f.to_lowercase()))
            {
                score += 3.0;
            }
        }

        // Layer 3: goal words appearing in the skill id
        if let Some(goal) = &resolved.profile.project_goal {
            let id_lower = skill.to_lowercase();
            score += goal
                .to_lowercase()
                .split_whitespace()
                .filter(|w| w.len() > 2 && id_lower.contains(w))
                .count() as f64;
        }

        if score > 0.0 {
            let entry = scores.entry(skill.clone()).or_insert(0.0);
            if score > *entry {
                *entry = score;
            }
        }
    }

    let mut ranked: Vec<(String, f64)> = scores.into_iter().collect();
    ranked.sort_by(|a, b| {
        b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.0.cmp(&b.0))
    });

    if ranked.is_empty() {
        ranked = SEED_SKILLS.iter().map(|s| (s.to_string(), 1.0)).collect();
    }
    ranked.truncate(MAX_SKILLS);
    ranked
}

/// Knowledge chunks relevant to the goal. Generic test goals short-circuit
/// to empty; the vector store is tried first, a local keyword scan over the
/// chunks directory is the fallback.
async fn rank_chunks(state: &ServerState, resolved: &ResolvedProfile) -> Vec<SearchResult> {
    let Some(goal) = resolved.profile.project_goal.clone() else { return Vec::new() };
    let goal_trimmed = goal.trim().to_lowercase();
    if goal_trimmed.is_empty() || TEST_PHRASES.contains(&goal_trimmed.as_str()) {
        return Vec::new();
    }

    let results = state
        .store
        .search(&state.embedder, &SearchRequest::hybrid(goal.clone(), 5))
        .await;
    let filtered: Vec<SearchResult> =
        results.into_iter().filter(|r| r.score >= MIN_CHUNK_SCORE).collect();
    if !filtered.is_empty() {
        return filtered;
    }

    // Fallback: keyword scan over the chunks directory, requiring at least
    // two meaningful-word hits.
    let meaningful: Vec<String> = goal_trimmed
        .split_whitespace()
        .filter(|w| w.len() > 3)
        .map(|w| w.to_string())
        .collect();
    if meaningful.len() < 2 {
        return Vec::new();
    }

    let Ok(entries) = fs::read_dir(&state.paths.chunks_dir) else { return Vec::new() };
    let mut hits = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.extension().is_some_and(|e| e == "md") {
            continue;
        }
        let Ok(content) = fs::read_to_string(&path) else { continue };
        let content_lower = content.to_lowercase();
        let word_hits = meaningful.iter().filter(|w| content_lower.contains(w.as_str())).count();
        if word_hits >= 2 {
            hits.push(SearchResult {
                text: content,
                source: path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
                score: word_hits as f64 / meaningful.len() as f64,
                timestamp: 0.0,
                metadata: String::new(),
                search_mode: "keyword",
            });
        }
        if hits.len() >= 5 {
            break;
        }
    }
    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    hits
}

// ---------------------------------------------------------------------------
// Guardrails & suggestions
// ---------------------------------------------------------------------------

fn guardrails(resolved: &ResolvedProfile) -> Vec<String> {
    let mut rules = vec![
        "Search existing knowledge before implementing anything new.".to_string(),
        "Never hardcode secrets; read them from the environment.".to_string(),
        "Synthesize into existing documents instead of scattering new ones.".to_string(),
    ];

    if resolved.label == ContextLabel::Small {
        rules.push(
            "Small context window: request previews, never full documents, and summarize before storing."
                .to_string(),
        );
    }
    if let Some(model) = resolved.model {
        if !model.supports_tools {
            rules.push(
                "This model cannot call tools directly — relay tool output through the user."
                    .to_string(),
            );
        }
        if !model.supports_vision {
            rules.push("No vision support: describe images and screenshots in text.".to_string());
        }
        if !model.supports_structured {
            rules.push(
                "Structured output is unreliable here — validate JSON and retry on parse failure."
                    .to_string(),
            );
        }
    }
    if let Some(client) = resolved.client {
        if !client.has_hooks {
            rules.push(
                "No hook support: re-run agent_handshake manually at the start of each session."
                    .to_string(),
            );
        }
        if !client.has_memory {
            rules.push(
                "No persistent memory: persist decisions into the knowledge base, not the session."
                    .to_string(),
            );
        }
        if !client.has_background_agents {
            rules.push("No background agents: queue long work via the research inbox.".to_string());
        }
    }
    if matches!(resolved.profile.tier.as_deref(), None | Some("community") | Some("free")) {
        rules.push(
            "Community tier: responses are previews — upgrade for full documents and semantic search."
                .to_string(),
        );
    }
    rules
}

fn suggestions(resolved: &ResolvedProfile, skills: &[(String, f64)]) -> Vec<String> {
    let mut out = Vec::new();

    if resolved.model.is_none() {
        if let Some(raw) = &resolved.profile.model {
            out.push(format!(
                "Model '{raw}' is not in the catalog — capabilities are assumed conservative. Declare context_window explicitly."
            ));
        }
    }
    if resolved.label == ContextLabel::Small {
        out.push(
            "Context budget is small: prefer search_knowledge snippets over full skill documents."
                .to_string(),
        );
    }
    if let Some(client) = resolved.client {
        if !client.has_hooks {
            out.push(
                "Your client has no hooks — add a session-start note to call agent_handshake first."
                    .to_string(),
            );
        }
        if client.id != "claude-code" && client.transports.contains(&"streamable-http") {
            out.push(
                "This client supports streamable HTTP — connect to /mcp directly instead of spawning a local process."
                    .to_string(),
            );
        }
    }
    let skill_names: HashSet<&str> = skills.iter().map(|(s, _)| s.as_str()).collect();
    for lang in &resolved.profile.languages {
        let token = format!("{lang}-");
        if let Some(matching) = skill_names.iter().find(|s| s.starts_with(&token)) {
            out.push(format!("Your stack includes {lang} — start with the '{matching}' skill."));
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Render
// ---------------------------------------------------------------------------

struct RenderBudget {
    tools: usize,
    skills: usize,
    chunks: usize,
    guardrails: usize,
    tips: usize,
    previews: bool,
}

impl RenderBudget {
    fn for_label(label: ContextLabel) -> Self {
        match label {
            ContextLabel::Small => {
                Self { tools: 3, skills: 2, chunks: 1, guardrails: 3, tips: 2, previews: false }
            }
            ContextLabel::Medium => Self {
                tools: 5,
                skills: 5,
                chunks: 2,
                guardrails: usize::MAX,
                tips: 5,
                previews: false,
            },
            ContextLabel::Large => Self {
                tools: usize::MAX,
                skills: MAX_SKILLS,
                chunks: usize::MAX,
                guardrails: usize::MAX,
                tips: usize::MAX,
                previews: true,
            },
        }
    }
}

fn preview(text: &str) -> String {
    if text.len() <= 200 {
        return text.replace('\n', " ");
    }
    let mut end = 200;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", text[..end].replace('\n', " "))
}

/// Run the full handshake pipeline and render the configuration.
pub async fn handshake(state: &ServerState, profile: AgentProfile) -> String {
    let resolved = resolve_profile(profile);
    let budget = RenderBudget::for_label(resolved.label);

    let tools = rank_tools(state, &resolved);
    let skills = rank_skills(state, &resolved);
    let chunks = rank_chunks(state, &resolved).await;
    let rails = guardrails(&resolved);
    let hints = suggestions(&resolved, &skills);

    let model_name = resolved.model.map(|m| m.id).unwrap_or("unknown model");
    let client_name = resolved.client.map(|c| c.id).unwrap_or("unknown client");

    let mut out = String::new();
    out.push_str("# MidOS Configuration\n\n");
    out.push_str(&format!(
        "Profile: **{model_name}** on **{client_name}** — effective context {} tokens ({}).\n\n",
        resolved.effective_context,
        resolved.label.as_str()
    ));

    // Always first: the three steps that make the rest of the payload useful.
    out.push_str("## Getting Started (3 steps)\n\n");
    out.push_str("1. `search_knowledge` your topic before writing anything new.\n");
    out.push_str("2. `list_skills` with your stack keyword, then `get_skill` the best match.\n");
    out.push_str("3. Re-run `agent_handshake` whenever your model, client, or goal changes.\n\n");

    out.push_str("## Top Tools\n\n");
    out.push_str("| Tool | Tier | Why |\n|---|---|---|\n");
    for tool in tools.iter().take(budget.tools) {
        let why = tool.description.split('.').next().unwrap_or(tool.description);
        out.push_str(&format!("| `{}` | {} | {} |\n", tool.name, tool.tier.label(), why));
    }
    out.push('\n');

    if !skills.is_empty() {
        out.push_str(&format!("## Skills ({})\n\n", skills.len().min(budget.skills)));
        for (skill, score) in skills.iter().take(budget.skills) {
            out.push_str(&format!("- `{skill}` (score {score:.0})\n"));
        }
        out.push('\n');
    }

    if !chunks.is_empty() {
        out.push_str("## Relevant Knowledge\n\n");
        for chunk in chunks.iter().take(budget.chunks) {
            if budget.previews {
                out.push_str(&format!("- **{}** — {}\n", chunk.source, preview(&chunk.text)));
            } else {
                out.push_str(&format!("- **{}** (score {:.2})\n", chunk.source, chunk.score));
            }
        }
        out.push('\n');
    }

    out.push_str("## Guardrails\n\n");
    for rule in rails.iter().take(budget.guardrails) {
        out.push_str(&format!("- {rule}\n"));
    }
    out.push('\n');

    let mut tips: Vec<&str> = Vec::new();
    if let Some(model) = resolved.model {
        tips.extend(model.tips);
    }
    if let Some(client) = resolved.client {
        tips.extend(client.tips);
    }
    if !tips.is_empty() {
        out.push_str("## Tips\n\n");
        for tip in tips.iter().take(budget.tips) {
            out.push_str(&format!("- {tip}\n"));
        }
        out.push('\n');
    }

    if !hints.is_empty() {
        out.push_str("## Suggestions\n\n");
        for hint in &hints {
            out.push_str(&format!("- {hint}\n"));
        }
        out.push('\n');
    }

    log_handshake(state, &resolved, tools.len(), skills.len());
    out
}

/// One JSON line per handshake. Best-effort: failures are logged, never
/// surfaced.
fn log_handshake(state: &ServerState, resolved: &ResolvedProfile, tools: usize, skills: usize) {
    let entry = serde_json::json!({
        "ts": chrono::Utc::now().to_rfc3339(),
        "model_raw": resolved.profile.model,
        "model": resolved.model.map(|m| m.id),
        "client_raw": resolved.profile.client,
        "client": resolved.client.map(|c| c.id),
        "effective_context": resolved.effective_context,
        "label": resolved.label.as_str(),
        "tools_ranked": tools,
        "skills_ranked": skills,
    });
    let append = || -> std::io::Result<()> {
        let path = &state.paths.compat_log;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{entry}")
    };
    if let Err(e) = append() {
        warn!(error = %e, "compatibility log append failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::resolve_profile;

    fn profile(goal: &str) -> AgentProfile {
        AgentProfile {
            model: Some("claude-sonnet-4-5".to_string()),
            client: Some("claude-code".to_string()),
            project_goal: Some(goal.to_string()),
            languages: vec!["python".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn core_tools_rank_first_without_keywords() {
        let resolved = resolve_profile(AgentProfile::default());
        let dir = tempfile::TempDir::new().unwrap();
        let state = crate::types::ServerState::new(
            dir.path().to_path_buf(),
            crate::embedding::EmbeddingClient::disabled(),
        );
        let ranked = rank_tools(&state, &resolved);
        let top: Vec<&str> = ranked.iter().take(3).map(|t| t.name).collect();
        for core in CORE_TOOLS {
            assert!(top.contains(core), "{core} should rank in the top 3: {top:?}");
        }
    }

    #[test]
    fn model_recommendations_dominate_skill_ranking() {
        let dir = tempfile::TempDir::new().unwrap();
        let state = crate::types::ServerState::new(
            dir.path().to_path_buf(),
            crate::embedding::EmbeddingClient::disabled(),
        );
        let resolved = resolve_profile(profile("build a retrieval service"));
        let skills = rank_skills(&state, &resolved);
        assert!(!skills.is_empty());
        // claude-sonnet-4-5 recommends mcp-server and testing-strategy at 10
        assert!(skills.iter().take(2).all(|(_, score)| *score >= 10.0));
    }

    #[test]
    fn guardrails_reflect_missing_capabilities() {
        let resolved = resolve_profile(AgentProfile {
            model: Some("phi-4-mini".to_string()),
            client: Some("cline".to_string()),
            ..Default::default()
        });
        let rails = guardrails(&resolved);
        let joined = rails.join("\n");
        assert!(joined.contains("cannot call tools"));
        assert!(joined.contains("No persistent memory"));
        assert!(joined.contains("Small context"));
    }
}
