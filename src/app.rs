#![cfg(not(tarpaulin_include))]

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State},
    http::{HeaderValue, StatusCode, header},
    middleware,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::login::{self, SessionStore};
use crate::query::Pagination;
use crate::{admin, api, db};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub sessions: Arc<SessionStore>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(pool: SqlitePool, config: Config) -> Self {
        let lifetime = Duration::from_secs(config.session_hours * 3600);
        AppState {
            pool,
            sessions: Arc::new(SessionStore::new(lifetime)),
            config: Arc::new(config),
        }
    }

    pub fn upload_dir(&self) -> &Path {
        &self.config.upload_dir
    }

    pub fn pagination(&self, query: &PageQuery) -> Pagination {
        Pagination::new(query.page, self.config.clamp_per_page(query.per_page))
    }
}

/// `page` and `per_page` query parameters.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

/// Reply of the mutating admin endpoints.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
}

impl StatusResponse {
    pub fn ok(message: impl Into<String>) -> Json<StatusResponse> {
        Json(StatusResponse {
            status: "ok".to_string(),
            message: message.into(),
            id: None,
            count: None,
        })
    }

    pub fn with_id(message: impl Into<String>, id: i64) -> Json<StatusResponse> {
        let Json(mut response) = StatusResponse::ok(message);
        response.id = Some(id);
        Json(response)
    }

    pub fn with_count(message: impl Into<String>, count: u64) -> Json<StatusResponse> {
        let Json(mut response) = StatusResponse::ok(message);
        response.count = Some(count);
        Json(response)
    }
}

/// Build the full route table.
///
/// Admin routes sit behind [`login::require_admin`], which itself runs inside
/// [`login::require_auth`]; `/health`, `/login`, `/logout` and the uploaded
/// images are public.
pub fn router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route("/admin", get(admin::dashboard))
        .route("/admin/users", get(admin::user_list))
        .route("/admin/users/new", post(admin::user_new))
        .route("/admin/users/edit/:id", get(admin::user_get).post(admin::user_edit))
        .route("/admin/users/delete/:id", post(admin::user_delete))
        .route("/admin/users/import", post(admin::user_import))
        .route("/admin/users/preview", get(admin::user_preview))
        .route("/admin/users/bulk_delete", post(admin::user_bulk_delete))
        .route("/admin/outlets", get(admin::outlet_list))
        .route("/admin/outlets/new", post(admin::outlet_new))
        .route("/admin/outlets/edit/:id", get(admin::outlet_get).post(admin::outlet_edit))
        .route("/admin/outlets/delete/:id", post(admin::outlet_delete))
        .route("/admin/outlets/import", post(admin::outlet_import))
        .route("/admin/outlets/preview", get(admin::outlet_preview))
        .route("/admin/outlets/bulk_delete", post(admin::outlet_bulk_delete))
        .route("/admin/profile", get(admin::profile_get))
        .route("/admin/profile/update", post(admin::profile_update))
        .route("/admin/executions", get(admin::execution_list))
        .route("/admin/executions/delete/:id", post(admin::execution_delete))
        .route("/admin/executions/upload", post(admin::execution_upload))
        .route_layer(middleware::from_fn(login::require_admin));

    let protected = Router::new()
        .route("/", get(api::home))
        .route("/api/me", get(login::current_user))
        .route("/outlets", get(api::pending_outlets))
        .route("/all_visitation", get(api::unvisited_outlets))
        .route("/api/outlets", get(api::outlet_search))
        .route("/assign_execution/:outlet_id", get(api::assign_execution))
        .route(
            "/execution/new/:outlet_id",
            get(api::new_execution).post(api::submit_execution),
        )
        .route("/executions", get(api::execution_list))
        .route("/execution/:id", get(api::execution_detail))
        .route("/dashboard/data", get(api::dashboard_data))
        .route("/recent_executions", get(api::recent_executions))
        .route("/api/posm_deployments", get(api::posm_deployments))
        .route("/api/posm_deployments/export", get(api::export_deployments))
        .route("/api/agent_performance", get(api::agent_performance))
        .route("/reports/product_availability", get(api::product_availability))
        .route("/reports/execution_summary", get(api::execution_summary))
        .route("/reports/upload", post(api::upload_report))
        .route("/reports/bulk_execution_upload", post(api::bulk_execution_upload))
        .merge(admin_routes)
        .route_layer(middleware::from_fn_with_state(state.clone(), login::require_auth));

    let max_body = state.config.max_upload_bytes;
    let uploads = ServeDir::new(state.upload_dir());

    Router::new()
        .route("/health", get(health))
        .route("/login", get(login::login_prompt).post(login::handle_login))
        .route("/logout", get(login::handle_logout).post(login::handle_logout))
        .merge(protected)
        .nest_service("/static/uploads", uploads)
        .layer(DefaultBodyLimit::max(max_body))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Liveness and database reachability.
async fn health(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let timestamp = crate::models::format_timestamp(crate::models::now());
    match db::database_stats(&state.pool).await {
        Ok(stats) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "healthy",
                "timestamp": timestamp,
                "version": env!("CARGO_PKG_VERSION"),
                "database": stats,
            })),
        ),
        Err(e) => {
            warn!(error = %e, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "status": "degraded",
                    "timestamp": timestamp,
                    "version": env!("CARGO_PKG_VERSION"),
                    "error": e.to_string(),
                })),
            )
        }
    }
}

/// Open the database, build the router and serve until Ctrl-C.
pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    tokio::fs::create_dir_all(&config.upload_dir).await?;
    let pool = db::connect(&config).await?;
    let state = AppState::new(pool.clone(), config);

    // Expired sessions are otherwise only dropped when presented again
    let sessions = state.sessions.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(600));
        loop {
            tick.tick().await;
            let purged = sessions.purge_expired();
            if purged > 0 {
                info!(purged, "expired sessions removed");
            }
        }
    });

    let listener = TcpListener::bind(&state.config.bind).await?;
    let addr = listener.local_addr()?;
    info!(%addr, "listening");
    if let Ok(ip) = local_ip_address::local_ip() {
        info!("reachable on the local network at http://{}:{}", ip, addr.port());
    }

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "could not listen for shutdown signal");
            }
        })
        .await?;

    pool.close().await;
    info!("server stopped");
    Ok(())
}
