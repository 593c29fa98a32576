use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::slave::{SlaveId, SlaveState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveUtilization {
    pub slave_id: SlaveId,
    pub state: SlaveState,
    pub used_cores: u32,
    pub total_cores: u32,
    pub used_memory: u64,
    pub total_memory: u64,
    pub cpu_utilization: f32,
    pub assigned_jobs: usize,
}

impl SlaveUtilization {
    pub fn core_utilization_pct(&self) -> f64 {
        percent(self.used_cores as u64, self.total_cores as u64)
    }
}

/// Foto inmutable de la flota, identificada por `generated_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub generated_at: DateTime<Utc>,
    pub slaves: Vec<SlaveUtilization>,
    pub online_slaves: usize,
    pub total_cores: u64,
    pub used_cores: u64,
    pub total_memory: u64,
    pub used_memory: u64,
    pub fleet_utilization_pct: f64,
    pub avg_cpu_utilization: f32,

    /// Jobs en cola (Offline)
    pub queue_depth: usize,
    pub waiting_jobs: usize,
    pub calculating_jobs: usize,

    /// Jobs terminados desde la foto anterior
    pub jobs_finished: usize,
    pub jobs_failed: usize,
}

pub fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    }
}
