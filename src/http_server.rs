/// HTTP Server Module
///
/// Thin host surface over the scheduler core:
/// - Today's feed for one user (runs an on-demand reconcile, so opening
///   the app is itself a catch-up trigger)
/// - Interaction flags (read / favorite)
/// - Manual sweep trigger and sweep status for operators

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;

use crate::config::Config;
use crate::error::SchedulerError;
use crate::reconciler::{ReconcileOutcome, Reconciler};
use crate::store::UnlockStore;
use crate::sweep::{run_sweep, SweepStatus};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn UnlockStore>,
    pub reconciler: Arc<Reconciler>,
    pub sweep_status: Arc<RwLock<SweepStatus>>,
}

/// Create and configure the HTTP server router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/users/:user_id/today", get(today_endpoint))
        .route("/users/:user_id/reconcile", post(reconcile_endpoint))
        .route("/users/:user_id/tips/:tip_id/read", post(mark_read_endpoint))
        .route("/users/:user_id/tips/:tip_id/favorite", post(toggle_favorite_endpoint))
        .route("/sweep", post(sweep_endpoint))
        .route("/sweep-status", get(sweep_status_endpoint))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn status_for(e: &SchedulerError) -> StatusCode {
    match e {
        SchedulerError::UnknownUser(_) => StatusCode::NOT_FOUND,
        SchedulerError::UserInactive(_) | SchedulerError::QuizNotCompleted(_) => {
            StatusCode::CONFLICT
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Render the read model the mobile app builds "today's tips" from
fn today_payload(outcome: &ReconcileOutcome) -> serde_json::Value {
    let schedule = &outcome.schedule;
    serde_json::json!({
        "day_start": schedule.day_start.to_rfc3339(),
        "unlock_times": schedule.unlock_times.iter().map(|t| t.to_rfc3339()).collect::<Vec<_>>(),
        "slots": schedule.slots.iter().map(|s| serde_json::json!({
            "tip_id": s.tip_id,
            "position": s.position,
            "unlocked": s.unlocked_at.is_some(),
            "unlocked_at": s.unlocked_at.map(|t| t.to_rfc3339()),
        })).collect::<Vec<_>>(),
        "unlocked_count": outcome.total_unlocked,
        "next_unlock_at": outcome.next_unlock_at.to_rfc3339(),
    })
}

/// Health check endpoint
async fn health_check() -> Result<Json<serde_json::Value>, StatusCode> {
    Ok(Json(serde_json::json!({
        "status": "ok",
        "service": "linguatip_backend",
        "timestamp": Utc::now().to_rfc3339()
    })))
}

/// Today's feed for one user
async fn today_endpoint(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    match state.reconciler.reconcile(user_id, Utc::now()).await {
        Ok(outcome) => Ok(Json(today_payload(&outcome))),
        Err(e) => {
            if !e.is_not_eligible() {
                log::error!("Today read failed for user {}: {:#}", user_id, e);
            }
            Err(status_for(&e))
        }
    }
}

/// App-open trigger: reconcile now and return the delta
async fn reconcile_endpoint(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    match state.reconciler.reconcile(user_id, Utc::now()).await {
        Ok(outcome) => Ok(Json(serde_json::json!({
            "newly_unlocked": outcome.newly_unlocked,
            "total_unlocked": outcome.total_unlocked,
            "completed": outcome.completed,
            "next_unlock_at": outcome.next_unlock_at.to_rfc3339(),
        }))),
        Err(e) => {
            if !e.is_not_eligible() {
                log::error!("Reconcile failed for user {}: {:#}", user_id, e);
            }
            Err(status_for(&e))
        }
    }
}

async fn mark_read_endpoint(
    State(state): State<AppState>,
    Path((user_id, tip_id)): Path<(i64, i64)>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    match state.store.mark_read(user_id, tip_id).await {
        Ok(()) => Ok(Json(serde_json::json!({ "status": "ok" }))),
        Err(e) => {
            log::error!("Mark-read failed (user {}, tip {}): {:#}", user_id, tip_id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn toggle_favorite_endpoint(
    State(state): State<AppState>,
    Path((user_id, tip_id)): Path<(i64, i64)>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    match state.store.toggle_favorite(user_id, tip_id).await {
        Ok(favorite) => Ok(Json(serde_json::json!({ "favorite": favorite }))),
        Err(e) => {
            log::error!("Favorite toggle failed (user {}, tip {}): {:#}", user_id, tip_id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Manual sweep trigger endpoint
async fn sweep_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, StatusCode> {
    // Check authentication if admin_api_secret is set
    if let Some(secret) = &state.config.admin_api_secret {
        let auth_header = headers
            .get("authorization")
            .and_then(|h| h.to_str().ok())
            .unwrap_or("");

        let token = auth_header.strip_prefix("Bearer ").unwrap_or("");
        if token != secret.as_str() {
            return Err(StatusCode::UNAUTHORIZED);
        }
    }

    log::info!("Unlock sweep triggered via HTTP endpoint");

    match run_sweep(&state.store, &state.reconciler, Utc::now()).await {
        Ok(report) => {
            // Update sweep status
            let mut status = state.sweep_status.write().await;
            status.last_sweep = Some(report.finished_at);
            status.last_report = Some(report.clone());
            status.total_sweeps += 1;

            Ok(Json(serde_json::json!({
                "status": "success",
                "users_checked": report.users_checked,
                "tips_unlocked": report.tips_unlocked,
                "completions": report.completions,
                "failures": report.failures,
            })))
        }
        Err(e) => {
            log::error!("Manual sweep failed: {:#}", e);
            Ok(Json(serde_json::json!({
                "status": "error",
                "error": e.to_string()
            })))
        }
    }
}

/// Get sweep status endpoint
async fn sweep_status_endpoint(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let status = state.sweep_status.read().await;

    Ok(Json(serde_json::json!({
        "last_sweep": status.last_sweep.map(|d| d.to_rfc3339()),
        "total_sweeps": status.total_sweeps,
        "last_report": status.last_report.clone(),
    })))
}

/// Start the HTTP server
pub async fn start_server(state: AppState, port: u16) -> Result<()> {
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .context("Failed to bind HTTP server")?;

    log::info!("HTTP server listening on port {}", port);

    axum::serve(listener, app)
        .await
        .context("HTTP server error")?;

    Ok(())
}
