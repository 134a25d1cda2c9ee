//! Test harness: builds a ServerState over a temp-dir fixture tree and
//! drives dispatch_jsonrpc the same way both transports do.
#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use midos_server::embedding::{EmbeddingClient, EmbeddingProvider};
use midos_server::error::Result;
use midos_server::mcp::dispatch_jsonrpc;
use midos_server::types::{KeyTier, RequestMeta, ServerState};

pub const STUB_DIM: usize = 16;

/// Deterministic embedder: hash-derived vectors, identical text → identical
/// vector, so round-trip searches rank the exact chunk first.
pub struct StubEmbedder;

#[async_trait]
impl EmbeddingProvider for StubEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| stub_vector(t)).collect())
    }

    fn dim(&self) -> usize {
        STUB_DIM
    }
}

pub fn stub_vector(text: &str) -> Vec<f32> {
    let digest = Sha256::digest(text.as_bytes());
    (0..STUB_DIM).map(|i| digest[i % 32] as f32 / 255.0 + 0.01).collect()
}

pub struct TestHarness {
    pub dir: TempDir,
    pub state: Arc<ServerState>,
}

impl TestHarness {
    /// Fixture tree: knowledge notes, one EUREKA finding, protocols, truth
    /// patches, and three skills (one with a compat descriptor).
    pub fn new() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let root = dir.path();

        let write = |rel: &str, content: &str| {
            let path = root.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        };

        write(
            "knowledge/notes/python_testing.md",
            "# Python testing\nUse pytest fixtures and parametrize for coverage.\n",
        );
        write(
            "knowledge/caching_guide.md",
            "# Caching guide\nSemantic caching intercepts repeated prompts and reuses answers.\n",
        );
        write(
            "knowledge/EUREKA/EUREKA_RESPONSE_CACHE_2026.md",
            "# EUREKA: response cache\nValidated: response caching cut latency by 70%.\n",
        );
        write(
            "knowledge/protocols/INGESTION.md",
            "# Ingestion protocol\nStage, chunk, embed, verify, promote.\n",
        );
        write(
            "knowledge/truth/TRUTH_RETRIEVAL_2026.md",
            "# Truth patch\nHybrid retrieval beats either leg alone on this corpus.\n",
        );
        write(
            "skills/angular/SKILL.md",
            &format!("# Angular skill\n\n{}", "Component patterns and signals guidance. ".repeat(60)),
        );
        write("skills/react/SKILL.md", "# React skill\nHooks, suspense, server components.\n");
        write(
            "skills/python-testing/SKILL.md",
            "# Python testing skill\nFixtures, coverage gates, mutation testing.\n",
        );
        write(
            "skills/python-testing/compat.json",
            r#"{"languages":["python"],"frameworks":["pytest"],"keywords":["testing","coverage"]}"#,
        );

        let embedder = EmbeddingClient::new(Some(Arc::new(StubEmbedder)));
        let state = Arc::new(ServerState::new(root.to_path_buf(), embedder));
        Self { dir, state }
    }

    /// Header set for a simulated remote caller (never localhost).
    pub fn remote_meta(&self, auth: Option<&str>) -> RequestMeta {
        let mut headers = HashMap::from([
            ("host".to_string(), "midos.dev".to_string()),
            ("x-forwarded-for".to_string(), "203.0.113.50".to_string()),
        ]);
        if let Some(token) = auth {
            headers.insert("authorization".to_string(), format!("Bearer {token}"));
        }
        RequestMeta::http(headers)
    }

    pub async fn request(
        &self,
        method: &str,
        params: serde_json::Value,
        meta: &RequestMeta,
    ) -> serde_json::Value {
        let msg = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        dispatch_jsonrpc(&self.state, &msg, meta)
            .await
            .expect("request with id must produce a response")
    }

    pub async fn initialize(&self) -> serde_json::Value {
        self.request(
            "initialize",
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": { "name": "harness", "version": "1.0" }
            }),
            &self.remote_meta(None),
        )
        .await
    }

    /// Call a tool as an unauthenticated remote client.
    pub async fn call_tool(&self, name: &str, args: serde_json::Value) -> serde_json::Value {
        self.call_tool_with_meta(name, args, &self.remote_meta(None)).await
    }

    pub async fn call_tool_with_auth(
        &self,
        name: &str,
        args: serde_json::Value,
        token: &str,
    ) -> serde_json::Value {
        self.call_tool_with_meta(name, args, &self.remote_meta(Some(token))).await
    }

    pub async fn call_tool_with_meta(
        &self,
        name: &str,
        args: serde_json::Value,
        meta: &RequestMeta,
    ) -> serde_json::Value {
        self.request("tools/call", json!({ "name": name, "arguments": args }), meta).await
    }

    /// Mint a key directly through the key store.
    pub fn make_key(&self, tier: KeyTier) -> String {
        self.state.keys.generate("harness", tier).expect("key generation")
    }
}

/// Extract text content from a tool call response ("" when absent).
pub fn result_text(resp: &serde_json::Value) -> String {
    resp["result"]["content"][0]["text"].as_str().unwrap_or("").to_string()
}

/// Error object present, or result flagged isError.
pub fn is_error(resp: &serde_json::Value) -> bool {
    resp.get("error").is_some() || resp["result"]["isError"].as_bool().unwrap_or(false)
}

/// All caller-visible text: error message plus any result body.
pub fn response_text(resp: &serde_json::Value) -> String {
    let mut text = result_text(resp);
    if let Some(msg) = resp["error"]["message"].as_str() {
        text.push_str(msg);
    }
    text
}
