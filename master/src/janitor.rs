//! Loop de mantenimiento: limpieza (a lo sumo una por intervalo, aunque haya
//! varias instancias compitiendo por el mismo store) y estadísticas.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{sync::Notify, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::{CleanupResponse, StatisticsSnapshot};

use crate::{
    config::HiveConfig,
    error::Result,
    registry::SlaveRegistry,
    statistics::StatisticsAggregator,
    store::{JobStore, StatisticsStore},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JanitorState {
    Running,
    Stopped,
}

#[derive(Debug, Default)]
pub struct CycleReport {
    /// None si la limpieza falló
    pub cleanup: Option<CleanupResponse>,
    pub statistics: Option<StatisticsSnapshot>,
}

pub struct Janitor {
    registry: Arc<SlaveRegistry>,
    jobs: Arc<dyn JobStore>,
    stats: Arc<dyn StatisticsStore>,
    aggregator: Arc<StatisticsAggregator>,
    interval: Duration,
    cleanup_interval: chrono::Duration,
    retention: chrono::Duration,
    stop: CancellationToken,
    wake: Notify,
}

impl Janitor {
    pub fn new(
        registry: Arc<SlaveRegistry>,
        jobs: Arc<dyn JobStore>,
        stats: Arc<dyn StatisticsStore>,
        aggregator: Arc<StatisticsAggregator>,
        config: &HiveConfig,
    ) -> Self {
        Self {
            registry,
            jobs,
            stats,
            aggregator,
            interval: config.janitor_interval,
            cleanup_interval: config.cleanup_interval_chrono(),
            retention: config.retention_chrono(),
            stop: CancellationToken::new(),
            wake: Notify::new(),
        }
    }

    pub fn state(&self) -> JanitorState {
        if self.stop.is_cancelled() {
            JanitorState::Stopped
        } else {
            JanitorState::Running
        }
    }

    /// Adelanta el próximo ciclo.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Pide parar; se respeta entre ciclos.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Limpieza bajo la regla de `last_cleanup`: sólo quien gana el
    /// compare-and-update archiva y purga.
    pub async fn trigger_cleanup(&self, now: DateTime<Utc>) -> Result<CleanupResponse> {
        if !self.jobs.try_claim_cleanup(now, self.cleanup_interval).await? {
            debug!("limpieza ya hecha dentro del intervalo, se omite");
            return Ok(CleanupResponse {
                performed: false,
                archived_jobs: 0,
                purged_slaves: 0,
            });
        }

        let cutoff = now - self.retention;
        let archived_jobs = self.jobs.archive_finished_before(cutoff).await?;
        let purged_slaves = self.registry.purge_offline(cutoff);

        // las estadísticas viejas no impiden reportar lo ya archivado
        let pruned = match self.stats.prune_statistics_before(cutoff).await {
            Ok(n) => n,
            Err(e) => {
                warn!("no se pudieron podar estadísticas viejas: {e}");
                0
            }
        };

        info!(archived_jobs, purged_slaves, pruned_statistics = pruned, "limpieza realizada");
        Ok(CleanupResponse {
            performed: true,
            archived_jobs,
            purged_slaves,
        })
    }

    /// Un ciclo: limpieza y después estadísticas. Un fallo en un paso no
    /// impide el otro.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> CycleReport {
        let cleanup = match self.trigger_cleanup(now).await {
            Ok(r) => Some(r),
            Err(e) => {
                warn!("error en la limpieza: {e}");
                None
            }
        };
        let statistics = self.aggregator.generate_or_log(now).await;
        CycleReport { cleanup, statistics }
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(interval = ?self.interval, "janitor arrancado");
        loop {
            if self.stop.is_cancelled() || shutdown.is_cancelled() {
                break;
            }
            self.run_cycle(Utc::now()).await;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.stop.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = sleep(self.interval) => {}
            }
        }
        self.stop.cancel();
        info!("janitor detenido");
    }
}
