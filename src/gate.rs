//! Request gate: key resolution, tier enforcement, quota accounting.
//!
//! Localhost connections (and the stdio transport, which is local by
//! construction) get pro-tier access without a key, but still count against
//! a stable anonymous quota identifier.

use sha2::{Digest, Sha256};

use crate::error::{Result, ServerError, KEYS_URL};
use crate::keys::KEY_PREFIX;
use crate::types::{find_tool, KeyTier, RequestMeta, ServerState, ToolTier, Transport};

/// The one canonical free-tool set. Everything else needs a key.
pub const FREE_TOOLS: &[&str] = &[
    "search_knowledge",
    "list_skills",
    "get_skill",
    "get_protocol",
    "hive_status",
    "project_status",
    "agent_handshake",
];

/// Bearer tokens at or beyond this length are treated as unauthenticated.
const MAX_TOKEN_LEN: usize = 128;

/// Resolved caller identity for one tool call.
#[derive(Clone, Debug)]
pub struct Caller {
    pub tier: KeyTier,
    pub key: Option<String>,
    /// Quota identifier: the key itself, or a stable anonymous id.
    pub identifier: String,
}

impl Caller {
    pub fn is_authenticated(&self) -> bool {
        self.key.is_some()
    }
}

// ---------------------------------------------------------------------------
// Source resolution
// ---------------------------------------------------------------------------

fn is_local_addr(addr: &str) -> bool {
    matches!(addr, "127.0.0.1" | "::1" | "localhost")
}

/// Effective source check: first of x-forwarded-for, x-real-ip, host.
fn is_localhost(meta: &RequestMeta) -> bool {
    if meta.transport == Transport::Stdio {
        return true;
    }
    if let Some(forwarded) = meta.header("x-forwarded-for") {
        let first = forwarded.split(',').next().unwrap_or("").trim();
        if !first.is_empty() {
            return is_local_addr(first);
        }
    }
    if let Some(real_ip) = meta.header("x-real-ip") {
        if !real_ip.is_empty() {
            return is_local_addr(real_ip);
        }
    }
    let host = meta.header("host").unwrap_or("");
    let host_name = host.split(':').next().unwrap_or("");
    is_local_addr(host_name)
}

/// Stable identifier for unauthenticated callers: `anon_` + sha256(ip)[..16].
fn anonymous_id(meta: &RequestMeta) -> String {
    if meta.transport == Transport::Stdio {
        return "anon_stdio".to_string();
    }
    let ip = meta
        .header("x-forwarded-for")
        .or_else(|| meta.header("x-real-ip"))
        .unwrap_or("anonymous");
    let digest = Sha256::digest(ip.as_bytes());
    let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    format!("anon_{hex}")
}

// ---------------------------------------------------------------------------
// Tier resolution
// ---------------------------------------------------------------------------

/// Extract the bearer token and resolve the caller's tier.
///
/// Localhost bypass grants pro without a key. Anything that is not
/// `Bearer midos_sk_…` with a plausible length is treated as
/// unauthenticated; a well-formed token that is unknown or revoked is an
/// [`ServerError::AuthInvalid`].
pub fn resolve_caller(state: &ServerState, meta: &RequestMeta) -> Result<Caller> {
    if is_localhost(meta) {
        return Ok(Caller { tier: KeyTier::Pro, key: None, identifier: anonymous_id(meta) });
    }

    let auth = meta.header("authorization").unwrap_or("").trim();
    if auth.is_empty() {
        return Ok(Caller { tier: KeyTier::Free, key: None, identifier: anonymous_id(meta) });
    }

    let token = match auth.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => token.trim(),
        _ => return Ok(Caller { tier: KeyTier::Free, key: None, identifier: anonymous_id(meta) }),
    };

    if !token.starts_with(KEY_PREFIX) || token.len() >= MAX_TOKEN_LEN {
        return Ok(Caller { tier: KeyTier::Free, key: None, identifier: anonymous_id(meta) });
    }

    match state.keys.lookup(token) {
        Some(record) if record.active => Ok(Caller {
            tier: record.tier,
            key: Some(token.to_string()),
            identifier: token.to_string(),
        }),
        _ => Err(ServerError::AuthInvalid(format!(
            "Invalid or revoked API key. Get a key at {KEYS_URL}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Per-call gating
// ---------------------------------------------------------------------------

/// Gate one tool call: auth, tier, then quota. Returns the resolved caller
/// so handlers can apply tier-dependent behavior (e.g. skill truncation).
pub fn on_tool_call(state: &ServerState, tool_name: &str, meta: &RequestMeta) -> Result<Caller> {
    let tool = find_tool(tool_name)
        .ok_or_else(|| ServerError::invalid(format!("Unknown tool: {tool_name}")))?;

    let caller = resolve_caller(state, meta)?;

    if tool.tier.required_rank() > caller.tier.rank() {
        let free_list = FREE_TOOLS.join(", ");
        let msg = match tool.tier {
            ToolTier::Admin => format!(
                "'{tool_name}' requires admin tier. Free tools: {free_list}. Get a key at {KEYS_URL}"
            ),
            _ => format!(
                "'{tool_name}' requires an API key. Free tools: {free_list}. Get a key at {KEYS_URL}"
            ),
        };
        return Err(ServerError::TierForbidden(msg));
    }

    let (allowed, count, limit) = state.quota.check_and_increment(&caller.identifier, caller.tier);
    if !allowed {
        return Err(ServerError::QuotaExceeded { count, limit });
    }

    Ok(caller)
}

/// Tool listing is not filtered: everyone sees the full registry
/// (discoverability), per-call gating does the enforcement.
pub fn on_list_tools() -> &'static [crate::types::ToolSpec] {
    crate::types::TOOL_REGISTRY
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn remote_meta(pairs: &[(&str, &str)]) -> RequestMeta {
        let mut headers: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        headers.entry("host".to_string()).or_insert_with(|| "midos.dev".to_string());
        RequestMeta::http(headers)
    }

    #[test]
    fn stdio_is_localhost() {
        assert!(is_localhost(&RequestMeta::stdio()));
    }

    #[test]
    fn forwarded_header_wins_over_host() {
        let meta = remote_meta(&[("x-forwarded-for", "203.0.113.9"), ("host", "127.0.0.1:8419")]);
        assert!(!is_localhost(&meta));

        let meta = remote_meta(&[("x-forwarded-for", "127.0.0.1, 10.0.0.2")]);
        assert!(is_localhost(&meta));
    }

    #[test]
    fn host_only_localhost_detected() {
        let meta = RequestMeta::http(HashMap::from([(
            "host".to_string(),
            "localhost:8419".to_string(),
        )]));
        assert!(is_localhost(&meta));
    }

    #[test]
    fn anonymous_id_is_stable_per_ip() {
        let a = anonymous_id(&remote_meta(&[("x-forwarded-for", "203.0.113.9")]));
        let b = anonymous_id(&remote_meta(&[("x-forwarded-for", "203.0.113.9")]));
        let c = anonymous_id(&remote_meta(&[("x-forwarded-for", "203.0.113.10")]));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("anon_"));
    }

    #[test]
    fn free_tools_are_registered_as_free() {
        for name in FREE_TOOLS {
            let tool = find_tool(name).expect("free tool must be registered");
            assert_eq!(tool.tier.required_rank(), 0, "{name} must be free tier");
        }
    }
}
