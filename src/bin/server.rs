//! Rolecap REST API Server
//!
//! Run with: cargo run --features server --bin rolecap-server -- --root alice
//!
//! Endpoints:
//!   GET  /roles                    - List roles, most authoritative first
//!   GET  /roles/:id                - Get one role
//!   PUT  /roles/:id/capabilities   - Replace a role's capability map
//!   POST /principals               - Create principal
//!   POST /principals/:id/role      - Assign role
//!   GET  /principals/:id/state     - Snapshot sync state
//!   POST /check                    - Check a capability
//!   GET  /can-administer           - Compare two levels
//!   GET  /propagation/failures     - List failure records
//!   POST /propagation/retry        - Re-run failed propagations
//!
//! Mutating requests name the acting principal in `actor`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::EnvFilter;

use rolecap::{DirectoryError, Engine, EngineConfig, Error, Level, LmdbDirectory, Principal, PropagationFailure, Role, SyncState};

#[derive(Parser)]
#[command(name = "rolecap-server", about = "Hierarchical RBAC over HTTP")]
struct Args {
    /// LMDB directory
    #[arg(long, env = "ROLECAP_DB", default_value = "./data/rolecap.mdb")]
    db: PathBuf,
    #[arg(long, env = "PORT", default_value_t = 3000)]
    port: u16,
    /// Create this principal as a super admin on startup
    #[arg(long, env = "ROLECAP_ROOT")]
    root: Option<String>,
}

// ============================================================================
// State
// ============================================================================

struct AppState {
    engine: Engine,
    directory: Arc<LmdbDirectory>,
}

type Shared = Arc<AppState>;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Deserialize)]
struct UpdateCapabilitiesReq {
    actor: String,
    base_version: u64,
    capabilities: BTreeMap<String, bool>,
}

#[derive(Deserialize)]
struct CreatePrincipalReq {
    actor: String,
    id: String,
}

#[derive(Deserialize)]
struct AssignReq {
    actor: String,
    role: String,
}

#[derive(Deserialize)]
struct CheckReq {
    principal: String,
    capability: String,
}

#[derive(Deserialize)]
struct LevelsQuery {
    acting: Level,
    target: Level,
}

#[derive(Deserialize)]
struct ActorReq {
    actor: String,
}

#[derive(Serialize)]
struct CheckResult {
    allowed: bool,
}

#[derive(Serialize)]
struct StateResult {
    principal: String,
    state: SyncState,
}

#[derive(Serialize)]
struct RetryResult {
    roles: usize,
}

#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self { success: true, data: Some(data), error: None }
    }

    fn err(msg: impl Into<String>) -> Self {
        Self { success: false, data: None, error: Some(msg.into()) }
    }
}

type Reply<T> = (StatusCode, Json<ApiResponse<T>>);

// ============================================================================
// Helpers
// ============================================================================

fn status_of(e: &Error) -> StatusCode {
    match e {
        Error::NotFound { .. } => StatusCode::NOT_FOUND,
        Error::Validation(_) | Error::Config(_) => StatusCode::BAD_REQUEST,
        Error::AuthorizationDenied(_) => StatusCode::FORBIDDEN,
        Error::ConcurrentModification { .. } | Error::Directory(DirectoryError::RoleChanged { .. }) => StatusCode::CONFLICT,
        Error::Directory(_) | Error::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reply<T>(r: rolecap::Result<T>) -> Reply<T> {
    match r {
        Ok(v) => (StatusCode::OK, Json(ApiResponse::ok(v))),
        Err(e) => (status_of(&e), Json(ApiResponse::err(e.to_string()))),
    }
}

/// Run an engine call on the blocking pool; LMDB and directory retries sleep.
async fn blocking<T, F>(s: Shared, f: F) -> Reply<T>
where
    T: Send + 'static,
    F: FnOnce(&AppState) -> rolecap::Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(move || f(&s)).await {
        Ok(r) => reply(r),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(ApiResponse::err(format!("task failed: {}", e)))),
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn get_roles(State(s): State<Shared>) -> Reply<Vec<Role>> {
    blocking(s, |s| s.engine.list_roles()).await
}

async fn get_role(State(s): State<Shared>, Path(id): Path<String>) -> Reply<Role> {
    blocking(s, move |s| s.engine.get_role(&id)).await
}

async fn put_capabilities(State(s): State<Shared>, Path(id): Path<String>, Json(req): Json<UpdateCapabilitiesReq>) -> Reply<Role> {
    blocking(s, move |s| {
        let actor = s.engine.actor_for(&req.actor)?;
        s.engine.update_role_capabilities_map(&actor, &id, &req.capabilities, req.base_version)
    })
    .await
}

async fn post_principal(State(s): State<Shared>, Json(req): Json<CreatePrincipalReq>) -> Reply<Principal> {
    blocking(s, move |s| {
        let actor = s.engine.actor_for(&req.actor)?;
        // Creating principals is reserved for actors that can administer someone
        if s.engine.administrable_roles(&actor)?.is_empty() {
            return Err(Error::AuthorizationDenied(format!("{} administers no role", req.actor)));
        }
        Ok(s.directory.create_principal(&req.id, false)?)
    })
    .await
}

async fn post_assign(State(s): State<Shared>, Path(id): Path<String>, Json(req): Json<AssignReq>) -> Reply<Principal> {
    blocking(s, move |s| {
        let actor = s.engine.actor_for(&req.actor)?;
        s.engine.assign_role(&actor, &id, &req.role)
    })
    .await
}

async fn get_state(State(s): State<Shared>, Path(id): Path<String>) -> Reply<StateResult> {
    blocking(s, move |s| s.engine.sync_state(&id).map(|state| StateResult { principal: id, state })).await
}

async fn post_check(State(s): State<Shared>, Json(req): Json<CheckReq>) -> Reply<CheckResult> {
    blocking(s, move |s| Ok(CheckResult { allowed: s.engine.has_capability_for(&req.principal, &req.capability) })).await
}

async fn get_can_administer(State(s): State<Shared>, Query(q): Query<LevelsQuery>) -> Reply<bool> {
    (StatusCode::OK, Json(ApiResponse::ok(s.engine.can_administer(q.acting, q.target))))
}

async fn get_failures(State(s): State<Shared>) -> Reply<Vec<PropagationFailure>> {
    blocking(s, |s| s.engine.propagation_failures()).await
}

async fn post_retry(State(s): State<Shared>, Json(req): Json<ActorReq>) -> Reply<RetryResult> {
    blocking(s, move |s| {
        let actor = s.engine.actor_for(&req.actor)?;
        if !actor.super_admin {
            return Err(Error::AuthorizationDenied("remediation requires a super admin".into()));
        }
        s.engine.retry_failed_propagations().map(|roles| RetryResult { roles })
    })
    .await
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = EngineConfig::from_env()?;
    tracing::info!(db = %args.db.display(), "initializing database");
    let (engine, directory) = Engine::open(&args.db, config)?;

    if let Some(root) = &args.root {
        let p = directory.create_principal(root, true)?;
        if !p.super_admin {
            directory.put_principal(&p.with_super_admin(true))?;
        }
        tracing::info!(principal = %root, "super admin ready");
    }

    // CORS for demo
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let state: Shared = Arc::new(AppState { engine, directory });

    let app = Router::new()
        .route("/roles", get(get_roles))
        .route("/roles/:id", get(get_role))
        .route("/roles/:id/capabilities", put(put_capabilities))
        .route("/principals", post(post_principal))
        .route("/principals/:id/role", post(post_assign))
        .route("/principals/:id/state", get(get_state))
        .route("/check", post(post_check))
        .route("/can-administer", get(get_can_administer))
        .route("/propagation/failures", get(get_failures))
        .route("/propagation/retry", post(post_retry))
        .layer(cors)
        .with_state(state.clone());

    let addr = format!("0.0.0.0:{}", args.port);
    tracing::info!(%addr, "rolecap server running");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    state.engine.shutdown();
    Ok(())
}
