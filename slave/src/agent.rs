use std::{sync::Arc, time::Duration};

use anyhow::{bail, Result};
use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use reqwest::{Client, StatusCode};
use sysinfo::{CpuExt, System, SystemExt};
use tokio::{
    sync::{mpsc, RwLock},
    time::sleep,
};
use tracing::{info, warn};

use common::{
    Ack, JobDispatchRequest, JobDispatchResponse, JobResultReport, SlaveHeartbeatRequest,
    SlaveRegisterRequest, SlaveRegisterResponse,
};

use crate::{
    config::SlaveConfig,
    executor::{Completion, Executor},
};

const REGISTER_RETRY: Duration = Duration::from_secs(2);
const REPORT_ATTEMPTS: u32 = 3;

/// Conexión con el master: id actual (cambia si nos purgan) y cliente HTTP.
#[derive(Clone)]
pub struct Agent {
    client: Client,
    config: Arc<SlaveConfig>,
    slave_id: Arc<RwLock<String>>,
}

impl Agent {
    pub fn new(config: SlaveConfig) -> Self {
        Self {
            client: Client::new(),
            config: Arc::new(config),
            slave_id: Arc::new(RwLock::new(String::new())),
        }
    }

    pub async fn slave_id(&self) -> String {
        self.slave_id.read().await.clone()
    }

    async fn try_register(&self) -> Result<String> {
        let url = format!("{}/api/v1/slaves/register", self.config.master_url);
        let res = self
            .client
            .post(&url)
            .json(&SlaveRegisterRequest {
                hostname: self.config.hostname.clone(),
                endpoint: self.config.advertise_url.clone(),
                total_cores: self.config.total_cores,
                total_memory: self.config.total_memory,
            })
            .send()
            .await?;

        if !res.status().is_success() {
            bail!("el master respondió {} al registro", res.status());
        }
        let SlaveRegisterResponse { slave_id } = res.json().await?;
        Ok(slave_id)
    }

    /// Se registra en el master, reintentando hasta que responda.
    pub async fn register(&self) -> String {
        loop {
            match self.try_register().await {
                Ok(id) => {
                    info!(
                        "slave {} registrado ({} cores, {} MB) contra {}",
                        id, self.config.total_cores, self.config.total_memory, self.config.master_url
                    );
                    *self.slave_id.write().await = id.clone();
                    return id;
                }
                Err(e) => {
                    warn!("no se pudo registrar en el master: {e}; reintento en {:?}", REGISTER_RETRY);
                    sleep(REGISTER_RETRY).await;
                }
            }
        }
    }

    /// Heartbeats periódicos con la CPU de la máquina y el hueco local. Si el
    /// master ya no nos conoce (nos dio por muertos) nos registramos de nuevo.
    pub async fn heartbeat_loop(self, executor: Arc<Executor>) {
        let mut sys = System::new_all();
        let url = format!("{}/api/v1/slaves/heartbeat", self.config.master_url);

        loop {
            sleep(self.config.heartbeat_interval).await;

            sys.refresh_cpu();
            let (free_cores, free_memory) = executor.free();
            let req = SlaveHeartbeatRequest {
                slave_id: self.slave_id().await,
                free_cores,
                free_memory,
                cpu_utilization: sys.global_cpu_info().cpu_usage(),
            };

            match self.client.post(&url).json(&req).send().await {
                Ok(res) if res.status() == StatusCode::NOT_FOUND => {
                    warn!("el master no reconoce a {}, re-registrando", req.slave_id);
                    self.register().await;
                }
                Ok(res) if !res.status().is_success() => {
                    warn!("heartbeat respondió {}", res.status());
                }
                Ok(_) => {}
                Err(e) => warn!("error mandando heartbeat: {e}"),
            }
        }
    }

    /// Reporta al master cada job terminado.
    pub async fn report_loop(self, mut done: mpsc::UnboundedReceiver<Completion>) {
        while let Some(completion) = done.recv().await {
            self.report(completion).await;
        }
    }

    async fn report(&self, completion: Completion) {
        let url = format!(
            "{}/api/v1/jobs/{}/result",
            self.config.master_url, completion.job_id
        );
        let report = JobResultReport {
            slave_id: self.slave_id().await,
            outcome: completion.outcome,
            result_payload: completion.result_payload,
        };

        for attempt in 1..=REPORT_ATTEMPTS {
            match self.client.post(&url).json(&report).send().await {
                Ok(res) if res.status().is_success() => {
                    info!(job_id = %completion.job_id, "resultado reportado al master");
                    return;
                }
                Ok(res) if res.status() == StatusCode::NOT_FOUND => {
                    warn!(job_id = %completion.job_id, "el master ya no conoce el job, resultado descartado");
                    return;
                }
                Ok(res) => warn!(job_id = %completion.job_id, attempt, "reporte respondió {}", res.status()),
                Err(e) => warn!(job_id = %completion.job_id, attempt, "error reportando resultado: {e}"),
            }
            sleep(Duration::from_millis(500 * attempt as u64)).await;
        }
        warn!(job_id = %completion.job_id, "resultado perdido tras {} intentos", REPORT_ATTEMPTS);
    }
}

/* ---------------- endpoints que llama el master ---------------- */

pub fn build_router(executor: Arc<Executor>) -> Router {
    Router::new()
        .route("/api/v1/dispatch", post(dispatch))
        .route("/api/v1/jobs/:id/abort", post(abort))
        .with_state(executor)
}

async fn dispatch(
    State(executor): State<Arc<Executor>>,
    Json(req): Json<JobDispatchRequest>,
) -> Json<JobDispatchResponse> {
    info!(job_id = %req.job_id, cores = req.required_cores, "job recibido del master");
    Json(JobDispatchResponse {
        accepted: executor.start(req),
    })
}

async fn abort(State(executor): State<Arc<Executor>>, Path(id): Path<String>) -> Json<Ack> {
    if !executor.abort(&id) {
        info!(job_id = %id, "abort de un job que no está corriendo");
    }
    Json(Ack::ok())
}
