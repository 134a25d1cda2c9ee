//! Agent profile resolution: raw handshake payload → normalized profile with
//! an effective context budget.

use serde::Deserialize;

use crate::catalog::{resolve_client, resolve_model, ClientSpec, ModelSpec};

/// Context floor applied when nothing usable is declared.
pub const DEFAULT_CONTEXT: u64 = 128_000;
/// Hard ceiling: anything above this is a typo or an abuse attempt.
pub const MAX_CONTEXT: u64 = 10_000_000;

/// What the connecting agent declares about itself. Every field is optional.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct AgentProfile {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub context_window: Option<u64>,
    #[serde(default)]
    pub client: Option<String>,
    #[serde(default, deserialize_with = "string_or_seq")]
    pub languages: Vec<String>,
    #[serde(default, deserialize_with = "string_or_seq")]
    pub frameworks: Vec<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub project_goal: Option<String>,
    #[serde(default)]
    pub tier: Option<String>,
}

/// Accept both `"python,typescript"` and `["python", "typescript"]`.
fn string_or_seq<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        One(String),
        Many(Vec<String>),
    }
    Ok(match Option::<Raw>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(Raw::One(s)) => s
            .split(',')
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect(),
        Some(Raw::Many(v)) => v.into_iter().map(|p| p.trim().to_lowercase()).collect(),
    })
}

/// Budget bucket the renderer sizes output by.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextLabel {
    Small,
    Medium,
    Large,
}

impl ContextLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            ContextLabel::Small => "small",
            ContextLabel::Medium => "medium",
            ContextLabel::Large => "large",
        }
    }
}

/// Catalog-resolved view of an [`AgentProfile`].
pub struct ResolvedProfile {
    pub profile: AgentProfile,
    pub model: Option<&'static ModelSpec>,
    pub client: Option<&'static ClientSpec>,
    pub effective_context: u64,
    pub label: ContextLabel,
}

/// Minimum of the non-zero declared/known windows. Falls back to the default
/// when nothing usable is declared; capped at the ceiling either way.
pub fn effective_context(
    declared: Option<u64>,
    model: Option<&ModelSpec>,
    client: Option<&ClientSpec>,
) -> u64 {
    let candidates = [
        declared.unwrap_or(0),
        model.map(|m| m.context_window).unwrap_or(0),
        client.map(|c| c.max_context).unwrap_or(0),
    ];
    let min_nonzero = candidates.iter().copied().filter(|&c| c > 0).min();
    min_nonzero.unwrap_or(DEFAULT_CONTEXT).min(MAX_CONTEXT)
}

pub fn context_label(effective: u64) -> ContextLabel {
    if effective <= 32_000 {
        ContextLabel::Small
    } else if effective <= 128_000 {
        ContextLabel::Medium
    } else {
        ContextLabel::Large
    }
}

/// Resolve a raw profile against the catalogs.
pub fn resolve_profile(profile: AgentProfile) -> ResolvedProfile {
    let model = profile.model.as_deref().and_then(resolve_model);
    let client = profile.client.as_deref().and_then(resolve_client);
    let effective = effective_context(profile.context_window, model, client);
    ResolvedProfile {
        model,
        client,
        effective_context: effective,
        label: context_label(effective),
        profile,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{resolve_client, resolve_model};

    #[test]
    fn effective_context_takes_min_nonzero() {
        let model = resolve_model("claude-sonnet-4-5");
        let client = resolve_client("aider"); // 64k client cap
        let eff = effective_context(Some(500_000), model, client);
        assert_eq!(eff, 64_000); // min(500k, 200k, 64k)
    }

    #[test]
    fn effective_context_defaults_and_caps() {
        assert_eq!(effective_context(None, None, None), DEFAULT_CONTEXT);
        assert_eq!(effective_context(Some(99_000_000), None, None), MAX_CONTEXT);
    }

    #[test]
    fn labels() {
        assert_eq!(context_label(32_000), ContextLabel::Small);
        assert_eq!(context_label(128_000), ContextLabel::Medium);
        assert_eq!(context_label(200_000), ContextLabel::Large);
    }
}
