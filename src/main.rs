//! MidOS binary — thin CLI shell over the [`midos_server`] library crate.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use clap::{Parser, Subcommand};
use dashmap::DashMap;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use midos_server::embedding::{EmbeddingClient, RemoteEmbedder};
use midos_server::keys::{KeyStore, QuotaLedger};
use midos_server::mcp::run_mcp;
use midos_server::resolve_root;
use midos_server::types::{AppContext, DataPaths, KeyTier, McpSession, ServerState};

// ---------------------------------------------------------------------------
// CLI definition (clap derive)
// ---------------------------------------------------------------------------

/// MidOS knowledge server — MCP tools over a curated knowledge base.
#[derive(Parser)]
#[command(name = "midos", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Data root directory (default: $MIDOS_ROOT or current directory)
    #[arg(long)]
    root: Option<PathBuf>,

    /// Run as MCP stdio server (for local clients)
    #[arg(long)]
    mcp: bool,

    /// Bind to 0.0.0.0 instead of 127.0.0.1
    #[arg(long)]
    bind_all: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// API key administration
    Keys {
        #[command(subcommand)]
        command: KeysCommands,
    },
}

#[derive(Subcommand)]
enum KeysCommands {
    /// Generate a new API key
    Generate {
        /// Key name/description
        #[arg(long)]
        name: String,
        /// Tier: free, dev, pro, team
        #[arg(long, default_value = "dev")]
        tier: String,
    },
    /// List all API keys (masked)
    List,
    /// Revoke an API key
    Revoke {
        /// Full key string to revoke
        #[arg(long)]
        key: String,
    },
    /// Show current-month usage counters
    Usage,
}

// ---------------------------------------------------------------------------
// Key administration
// ---------------------------------------------------------------------------

fn run_keys_command(root: PathBuf, command: &KeysCommands) -> i32 {
    let paths = DataPaths::new(root);
    let store = KeyStore::new(paths.keys_file.clone());

    match command {
        KeysCommands::Generate { name, tier } => {
            let Some(tier) = KeyTier::parse(tier) else {
                eprintln!("Invalid tier '{tier}'. Must be one of: free, dev, pro, team");
                return 2;
            };
            match store.generate(name, tier) {
                Ok(key) => {
                    println!("Generated {} key for '{name}':", tier.label());
                    println!("  {key}");
                    println!("  Store this securely — it won't be shown again in full.");
                    0
                }
                Err(e) => {
                    eprintln!("Key generation failed: {e}");
                    1
                }
            }
        }
        KeysCommands::List => {
            let keys = store.list();
            if keys.is_empty() {
                println!("No API keys found.");
                return 0;
            }
            println!("{:<22} {:<20} {:<8} {:<8} Created", "Prefix", "Name", "Tier", "Active");
            println!("{}", "-".repeat(80));
            for k in keys {
                println!(
                    "{:<22} {:<20} {:<8} {:<8} {}",
                    k.prefix,
                    k.name,
                    k.tier.label(),
                    if k.active { "yes" } else { "NO" },
                    &k.created[..k.created.len().min(10)]
                );
            }
            0
        }
        KeysCommands::Revoke { key } => match store.revoke(key) {
            Ok(true) => {
                println!("Key revoked: {}...", &key[..key.len().min(16)]);
                0
            }
            Ok(false) => {
                println!("Key not found: {}...", &key[..key.len().min(16)]);
                1
            }
            Err(e) => {
                eprintln!("Revoke failed: {e}");
                1
            }
        },
        KeysCommands::Usage => {
            let ledger = QuotaLedger::new(paths.usage_file.clone());
            let stats = ledger.usage_stats();
            if stats.is_empty() {
                println!("No usage data for {}.", midos_server::keys::current_month());
                return 0;
            }
            println!("Usage for {}:", midos_server::keys::current_month());
            println!("{:<22} Queries", "Identifier");
            println!("{}", "-".repeat(35));
            for (identifier, count) in stats {
                println!("{identifier:<22} {count}");
            }
            0
        }
    }
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

/// Resolves once the process is asked to stop (Ctrl+C anywhere, SIGTERM on
/// unix). A failed SIGTERM handler install degrades to Ctrl+C-only rather
/// than aborting startup.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable, relying on Ctrl+C");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received, draining...");
}

// ---------------------------------------------------------------------------
// Listener selection
// ---------------------------------------------------------------------------

/// Ports walked when `PORT` is not set.
const PORT_RANGE: std::ops::Range<u16> = 8419..8429;

/// An explicit `PORT` must bind or the process exits; without one, the first
/// free port in [`PORT_RANGE`] wins.
async fn bind_listener(bind_addr: &str) -> tokio::net::TcpListener {
    if let Ok(raw) = std::env::var("PORT") {
        let Ok(port) = raw.parse::<u16>() else {
            error!(value = raw.as_str(), "PORT is not a valid port number");
            std::process::exit(1);
        };
        return tokio::net::TcpListener::bind((bind_addr, port)).await.unwrap_or_else(|e| {
            error!(port, error = %e, "Could not bind requested port");
            std::process::exit(1);
        });
    }

    for port in PORT_RANGE {
        if let Ok(listener) = tokio::net::TcpListener::bind((bind_addr, port)).await {
            return listener;
        }
    }
    error!(
        range_start = PORT_RANGE.start,
        range_end = PORT_RANGE.end - 1,
        "Every port in the default range is taken; set PORT to override"
    );
    std::process::exit(1);
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("midos=info".parse().unwrap())
                .add_directive("midos_server=info".parse().unwrap()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let root = resolve_root(cli.root.clone());

    if let Some(Commands::Keys { command }) = &cli.command {
        std::process::exit(run_keys_command(root, command));
    }

    // Embedding provider: remote if configured, keyword-only otherwise.
    let embedder = match RemoteEmbedder::from_env() {
        Some(provider) => {
            info!("Remote embedding provider configured");
            EmbeddingClient::new(Some(Arc::new(provider)))
        }
        None => {
            warn!("MIDOS_EMBED_API_KEY not set — semantic search degrades to keyword-only");
            EmbeddingClient::disabled()
        }
    };

    let state = Arc::new(ServerState::new(root.clone(), embedder));
    info!(
        root = %root.display(),
        chunks = state.store.count(),
        "MidOS server state loaded"
    );

    if cli.mcp {
        run_mcp(state).await;
        return;
    }

    // HTTP mode
    let sessions: Arc<DashMap<String, McpSession>> = Arc::new(DashMap::new());
    let ctx = AppContext { state: state.clone(), sessions: sessions.clone() };

    let app = Router::new()
        .route("/health", get(midos_server::api::api_health))
        .route("/health/ready", get(midos_server::api::api_ready))
        .route(
            "/mcp",
            post(midos_server::mcp_http::handle_mcp_post)
                .delete(midos_server::mcp_http::handle_mcp_delete)
                .get(midos_server::mcp_http::handle_mcp_get),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(ctx);

    // Bind address: 127.0.0.1 by default, --bind-all for 0.0.0.0
    let bind_addr = if cli.bind_all { "0.0.0.0" } else { "127.0.0.1" };
    let listener = bind_listener(bind_addr).await;
    let port = listener.local_addr().map(|a| a.port()).unwrap_or(0);

    // Prune idle sessions every 5 minutes
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            let cutoff = std::time::Instant::now() - std::time::Duration::from_secs(1800);
            let before = sessions.len();
            sessions.retain(|_, session| session.last_activity > cutoff);
            let pruned = before - sessions.len();
            if pruned > 0 {
                debug!(pruned = pruned, remaining = sessions.len(), "Pruned idle MCP sessions");
            }
        }
    });

    // Flush quota counters on shutdown
    let flush_state = state.clone();

    info!("MCP HTTP transport at /mcp");
    info!(port = port, "http://localhost:{port}");

    let serve = axum::serve(listener, app).with_graceful_shutdown(wait_for_shutdown());
    if let Err(e) = serve.await {
        error!(error = %e, "Server error");
    }
    flush_state.quota.flush();
}
