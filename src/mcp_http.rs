//! Streamable HTTP transport for the MCP protocol.
//!
//! `POST /mcp` carries JSON-RPC requests (single or batch) and answers with
//! a JSON body. Requests are served statelessly; clients that send
//! `initialize` get an `Mcp-Session-Id` header back and may echo it, which
//! keeps their session's activity timestamp fresh for the pruner.
//! `GET /mcp` is rejected — there are no server-push notifications.

use std::collections::HashMap;
use std::time::Instant;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Response,
};
use uuid::Uuid;

use crate::mcp::dispatch_jsonrpc;
use crate::types::{AppContext, McpSession, RequestMeta};

const SESSION_HEADER: &str = "mcp-session-id";

/// Headers the gate inspects, lowercased.
const GATE_HEADERS: &[&str] = &["authorization", "x-forwarded-for", "x-real-ip", "host"];

fn request_meta(headers: &HeaderMap) -> RequestMeta {
    let mut map = HashMap::new();
    for name in GATE_HEADERS {
        if let Some(value) = headers.get(*name).and_then(|v| v.to_str().ok()) {
            map.insert(name.to_string(), value.to_string());
        }
    }
    RequestMeta::http(map)
}

// ---------------------------------------------------------------------------
// POST /mcp
// ---------------------------------------------------------------------------

pub async fn handle_mcp_post(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let parsed: serde_json::Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(_) => {
            let err = serde_json::json!({
                "jsonrpc": "2.0",
                "id": null,
                "error": { "code": -32700, "message": "Parse error" }
            });
            return json_response(StatusCode::BAD_REQUEST, &err, None);
        }
    };

    let is_batch = parsed.is_array();
    let requests: Vec<serde_json::Value> = if is_batch {
        parsed.as_array().cloned().unwrap_or_default()
    } else {
        vec![parsed]
    };

    let meta = request_meta(&headers);

    // Touch the caller's session if they sent one.
    if let Some(sid) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
        if let Some(mut session) = ctx.sessions.get_mut(sid) {
            session.last_activity = Instant::now();
        }
    }

    let mut responses: Vec<serde_json::Value> = Vec::new();
    let mut new_session_id: Option<String> = None;

    for req in &requests {
        if req["method"].as_str() == Some("initialize") && new_session_id.is_none() {
            let sid = Uuid::new_v4().to_string();
            ctx.sessions.insert(sid.clone(), McpSession::new());
            new_session_id = Some(sid);
        }
        if let Some(resp) = dispatch_jsonrpc(&ctx.state, req, &meta).await {
            responses.push(resp);
        }
    }

    if responses.is_empty() {
        // All notifications
        return Response::builder()
            .status(StatusCode::ACCEPTED)
            .body(Body::empty())
            .unwrap_or_default();
    }

    let body_json = if is_batch {
        serde_json::Value::Array(responses)
    } else {
        responses.into_iter().next().unwrap_or(serde_json::Value::Null)
    };

    json_response(StatusCode::OK, &body_json, new_session_id)
}

// ---------------------------------------------------------------------------
// DELETE /mcp — session termination
// ---------------------------------------------------------------------------

pub async fn handle_mcp_delete(State(ctx): State<AppContext>, headers: HeaderMap) -> StatusCode {
    if let Some(sid) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
        ctx.sessions.remove(sid);
    }
    StatusCode::OK
}

// ---------------------------------------------------------------------------
// GET /mcp — not supported
// ---------------------------------------------------------------------------

pub async fn handle_mcp_get() -> StatusCode {
    StatusCode::METHOD_NOT_ALLOWED
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn json_response(
    status: StatusCode,
    body: &serde_json::Value,
    session_id: Option<String>,
) -> Response {
    let mut builder = Response::builder()
        .status(status)
        .header("content-type", "application/json");
    if let Some(sid) = session_id {
        builder = builder.header(SESSION_HEADER, sid);
    }
    builder
        .body(Body::from(serde_json::to_string(body).unwrap_or_default()))
        .unwrap_or_default()
}
