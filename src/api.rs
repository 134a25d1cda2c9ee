//! Non-MCP HTTP endpoints: liveness and readiness probes.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::Utc;

use crate::knowledge::{knowledge_file_count, skill_inventory};
use crate::types::{AppContext, SERVER_NAME};

/// `GET /health` — liveness.
pub async fn api_health(State(ctx): State<AppContext>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "server": SERVER_NAME,
        "uptime_seconds": ctx.state.started_at.elapsed().as_secs(),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// `GET /health/ready` — readiness with per-dependency checks. Returns 503
/// while any check is failing.
pub async fn api_ready(State(ctx): State<AppContext>) -> impl IntoResponse {
    let knowledge_ok = knowledge_file_count(&ctx.state.paths) > 0;
    let vector_ok = ctx.state.paths.table_dir.exists();
    let skills_ok = !skill_inventory(&ctx.state.paths).is_empty();

    let ready = knowledge_ok && vector_ok && skills_ok;
    let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    (
        status,
        Json(serde_json::json!({
            "status": if ready { "ready" } else { "degraded" },
            "checks": {
                "knowledge": knowledge_ok,
                "vector_store": vector_ok,
                "skills": skills_ok,
            }
        })),
    )
}
