use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use common::{percent, JobState, SlaveState, SlaveUtilization, StatisticsSnapshot};

use crate::{
    error::Result,
    registry::SlaveRegistry,
    store::{JobStore, StatisticsStore},
};

/// Arma fotos periódicas del uso de la flota y de la cola.
pub struct StatisticsAggregator {
    registry: Arc<SlaveRegistry>,
    jobs: Arc<dyn JobStore>,
    stats: Arc<dyn StatisticsStore>,
}

impl StatisticsAggregator {
    pub fn new(
        registry: Arc<SlaveRegistry>,
        jobs: Arc<dyn JobStore>,
        stats: Arc<dyn StatisticsStore>,
    ) -> Self {
        Self {
            registry,
            jobs,
            stats,
        }
    }

    /// Calcula una foto sin guardarla. Los contadores de terminados y fallidos
    /// son los de la ventana desde la última foto guardada.
    pub async fn compute_statistics(&self, now: DateTime<Utc>) -> Result<StatisticsSnapshot> {
        let since = self
            .stats
            .latest_statistics()
            .await?
            .map(|s| s.generated_at);

        let slaves = self.registry.list_all();
        let jobs = self.jobs.list_jobs().await?;

        let online: Vec<_> = slaves
            .iter()
            .filter(|s| s.state != SlaveState::Offline)
            .collect();

        let total_cores: u64 = online.iter().map(|s| s.total_cores as u64).sum();
        let used_cores: u64 = online.iter().map(|s| s.used_cores() as u64).sum();
        let total_memory: u64 = online.iter().map(|s| s.total_memory).sum();
        let used_memory: u64 = online.iter().map(|s| s.used_memory()).sum();
        let avg_cpu_utilization = if online.is_empty() {
            0.0
        } else {
            online.iter().map(|s| s.cpu_utilization).sum::<f32>() / online.len() as f32
        };

        let in_window = |t: Option<DateTime<Utc>>| match (t, since) {
            (Some(t), Some(since)) => t > since && t <= now,
            (Some(t), None) => t <= now,
            (None, _) => false,
        };

        let count = |state: JobState| jobs.iter().filter(|j| j.state == state).count();
        let jobs_finished = jobs
            .iter()
            .filter(|j| j.state == JobState::Finished && in_window(j.finished_at))
            .count();
        let jobs_failed = jobs
            .iter()
            .filter(|j| j.state == JobState::Failed && in_window(j.finished_at))
            .count();

        Ok(StatisticsSnapshot {
            generated_at: now,
            slaves: slaves
                .iter()
                .map(|s| SlaveUtilization {
                    slave_id: s.id.clone(),
                    state: s.state,
                    used_cores: s.used_cores(),
                    total_cores: s.total_cores,
                    used_memory: s.used_memory(),
                    total_memory: s.total_memory,
                    cpu_utilization: s.cpu_utilization,
                    assigned_jobs: s.assigned_jobs.len(),
                })
                .collect(),
            online_slaves: online.len(),
            total_cores,
            used_cores,
            total_memory,
            used_memory,
            fleet_utilization_pct: percent(used_cores, total_cores),
            avg_cpu_utilization,
            queue_depth: count(JobState::Offline),
            waiting_jobs: count(JobState::Waiting),
            calculating_jobs: count(JobState::Calculating),
            jobs_finished,
            jobs_failed,
        })
    }

    /// Calcula y guarda una foto; la siguiente ventana arranca acá.
    pub async fn generate_statistics(&self, now: DateTime<Utc>) -> Result<StatisticsSnapshot> {
        let snapshot = self.compute_statistics(now).await?;
        self.stats.insert_statistics(snapshot.clone()).await?;
        debug!(
            online = snapshot.online_slaves,
            queue = snapshot.queue_depth,
            utilization = snapshot.fleet_utilization_pct,
            "estadísticas generadas"
        );
        Ok(snapshot)
    }

    /// Como `generate_statistics` pero sin propagar errores: una foto perdida
    /// no es motivo para cortar el ciclo.
    pub async fn generate_or_log(&self, now: DateTime<Utc>) -> Option<StatisticsSnapshot> {
        match self.generate_statistics(now).await {
            Ok(s) => Some(s),
            Err(e) => {
                warn!("no se pudieron generar estadísticas: {e}");
                None
            }
        }
    }

    pub async fn latest(&self) -> Result<Option<StatisticsSnapshot>> {
        self.stats.latest_statistics().await
    }
}
