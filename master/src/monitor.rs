use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use common::{JobId, SlaveId};

use crate::{
    config::HiveConfig,
    registry::SlaveRegistry,
    scheduler::Scheduler,
    store::RequeueOutcome,
};

/// Lo que hizo una pasada del monitor.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub dead_slaves: Vec<SlaveId>,
    pub requeued: Vec<JobId>,
    pub failed: Vec<JobId>,
}

/// Detecta slaves sin heartbeat y recupera sus jobs.
pub struct HeartbeatMonitor {
    registry: Arc<SlaveRegistry>,
    scheduler: Arc<Scheduler>,
    timeout: chrono::Duration,
    poll_interval: Duration,
}

impl HeartbeatMonitor {
    pub fn new(registry: Arc<SlaveRegistry>, scheduler: Arc<Scheduler>, config: &HiveConfig) -> Self {
        Self {
            registry,
            scheduler,
            timeout: config.heartbeat_timeout_chrono(),
            poll_interval: config.heartbeat_poll_interval,
        }
    }

    /// Una pasada de chequeo:
    /// 1. slaves vivos con el último heartbeat más viejo que el timeout
    /// 2. marcarlos offline (esto suelta sus reservas)
    /// 3. reencolar o dar por fallidos los jobs que tenían
    /// 4. recuperar jobs asignados que perdieron su reserva
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        for slave_id in self.registry.stale_slaves(now, self.timeout) {
            // mark_offline devuelve vacío si otro camino ya lo marcó
            let orphaned = match self.registry.mark_offline(&slave_id) {
                Ok(jobs) => jobs,
                Err(e) => {
                    warn!(slave_id = %slave_id, "no se pudo marcar offline: {e}");
                    continue;
                }
            };

            for (job_id, outcome) in self.scheduler.requeue_orphans(&slave_id, &orphaned).await {
                match outcome {
                    RequeueOutcome::Requeued { .. } => report.requeued.push(job_id),
                    RequeueOutcome::Failed => report.failed.push(job_id),
                    RequeueOutcome::Skipped => {}
                }
            }
            report.dead_slaves.push(slave_id);
        }

        // jobs cuyo reencolado falló en una pasada anterior o en otro camino
        for (job_id, outcome) in self.scheduler.recover_stranded().await {
            match outcome {
                RequeueOutcome::Requeued { .. } => report.requeued.push(job_id),
                RequeueOutcome::Failed => report.failed.push(job_id),
                RequeueOutcome::Skipped => {}
            }
        }

        if !report.dead_slaves.is_empty() || !report.requeued.is_empty() {
            info!(
                dead = report.dead_slaves.len(),
                requeued = report.requeued.len(),
                failed = report.failed.len(),
                "slaves caídos procesados"
            );
            self.scheduler.notify();
        }
        report
    }

    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        info!(timeout = %self.timeout, poll = ?self.poll_interval, "monitor de heartbeats arrancado");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = sleep(self.poll_interval) => {}
            }
            self.sweep_once(Utc::now()).await;
        }
        info!("monitor de heartbeats detenido");
    }
}
