use axum::{
    extract::{Path, State},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use tower_http::trace::TraceLayer;
use tracing::info;

use common::{
    Ack, CleanupResponse, JobInfo, JobResultReport, JobResultView, JobSubmitRequest,
    JobSubmitResponse, SlaveHeartbeatRequest, SlaveHeartbeatResponse, SlaveInfo,
    SlaveRegisterRequest, SlaveRegisterResponse, StatisticsSnapshot,
};

use crate::{
    error::{HiveError, Result},
    state::AppState,
};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/jobs", post(submit_job).get(list_jobs))
        .route("/api/v1/jobs/:id", get(get_job))
        .route("/api/v1/jobs/:id/cancel", post(cancel_job))
        .route("/api/v1/jobs/:id/result", post(report_result).get(get_result))
        .route("/api/v1/slaves", get(list_slaves))
        .route("/api/v1/slaves/register", post(register_slave))
        .route("/api/v1/slaves/heartbeat", post(slave_heartbeat))
        .route("/api/v1/slaves/:id", delete(deregister_slave))
        .route("/api/v1/statistics", get(get_statistics))
        .route("/api/v1/cleanup", post(trigger_cleanup))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

async fn submit_job(
    State(state): State<AppState>,
    Json(req): Json<JobSubmitRequest>,
) -> Result<Json<JobSubmitResponse>> {
    let job_id = state.scheduler.submit_job(req).await?;
    Ok(Json(JobSubmitResponse { job_id }))
}

async fn list_jobs(State(state): State<AppState>) -> Result<Json<Vec<JobInfo>>> {
    Ok(Json(state.jobs.list_jobs().await?))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobInfo>> {
    state
        .jobs
        .get_job(&id)
        .await?
        .map(Json)
        .ok_or(HiveError::JobNotFound(id))
}

async fn cancel_job(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Ack>> {
    state.scheduler.cancel_job(&id).await?;
    Ok(Json(Ack::ok()))
}

async fn report_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(report): Json<JobResultReport>,
) -> Result<Json<Ack>> {
    state.scheduler.report_job_result(&id, report).await?;
    Ok(Json(Ack::ok()))
}

async fn get_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobResultView>> {
    if state.jobs.get_job(&id).await?.is_none() {
        return Err(HiveError::JobNotFound(id));
    }
    let result_payload = state.jobs.get_result(&id).await?;
    Ok(Json(JobResultView {
        job_id: id,
        result_payload,
    }))
}

async fn list_slaves(State(state): State<AppState>) -> Json<Vec<SlaveInfo>> {
    Json(state.registry.list_all())
}

async fn register_slave(
    State(state): State<AppState>,
    Json(req): Json<SlaveRegisterRequest>,
) -> Result<Json<SlaveRegisterResponse>> {
    let slave_id = state.scheduler.register_slave(&req).await?;
    Ok(Json(SlaveRegisterResponse { slave_id }))
}

async fn slave_heartbeat(
    State(state): State<AppState>,
    Json(req): Json<SlaveHeartbeatRequest>,
) -> Result<Json<SlaveHeartbeatResponse>> {
    state.registry.heartbeat(
        &req.slave_id,
        req.free_cores,
        req.free_memory,
        req.cpu_utilization,
        Utc::now(),
    )?;
    Ok(Json(SlaveHeartbeatResponse { ok: true }))
}

async fn deregister_slave(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Ack>> {
    state.scheduler.deregister_slave(&id).await?;
    Ok(Json(Ack::ok()))
}

async fn get_statistics(State(state): State<AppState>) -> Result<Json<StatisticsSnapshot>> {
    if let Some(snapshot) = state.statistics.latest().await? {
        return Ok(Json(snapshot));
    }
    // todavía no corrió ningún ciclo del janitor: vista calculada, no se guarda
    Ok(Json(state.statistics.compute_statistics(Utc::now()).await?))
}

async fn trigger_cleanup(State(state): State<AppState>) -> Result<Json<CleanupResponse>> {
    let resp = state.janitor.trigger_cleanup(Utc::now()).await?;
    info!(performed = resp.performed, "limpieza pedida por API");
    if resp.performed {
        // refrescar estadísticas sin esperar al próximo ciclo
        state.janitor.wake();
    }
    Ok(Json(resp))
}
