use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::JobId;

pub type SlaveId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlaveState {
    Idle,
    Calculating,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveRegisterRequest {
    /// Identidad física del slave: re-registrarse con el mismo hostname devuelve el mismo id
    pub hostname: String,

    /// URL base donde el slave recibe jobs, ej: http://slave-1:9090
    pub endpoint: String,
    pub total_cores: u32,
    pub total_memory: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveRegisterResponse {
    pub slave_id: SlaveId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveHeartbeatRequest {
    pub slave_id: SlaveId,
    pub free_cores: u32,
    pub free_memory: u64,
    pub cpu_utilization: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveHeartbeatResponse {
    pub ok: bool,
}

/// Foto de un slave tal como la ve el registro del master.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveInfo {
    pub id: SlaveId,
    pub hostname: String,
    pub endpoint: String,
    pub state: SlaveState,
    pub total_cores: u32,
    pub free_cores: u32,
    pub total_memory: u64,
    pub free_memory: u64,
    pub cpu_utilization: f32,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,

    /// Lo que el propio slave dice tener libre en su último heartbeat (sólo informativo)
    pub reported_free_cores: Option<u32>,
    pub reported_free_memory: Option<u64>,

    /// Jobs con recursos reservados en este slave
    pub assigned_jobs: Vec<JobId>,

    // Métricas
    pub jobs_started: u64,
    pub jobs_finished: u64,
    pub jobs_failed: u64,
    pub total_job_time_ms: u64,
}

impl SlaveInfo {
    pub fn used_cores(&self) -> u32 {
        self.total_cores - self.free_cores
    }

    pub fn used_memory(&self) -> u64 {
        self.total_memory - self.free_memory
    }

    /// true si el slave tiene hueco libre para los requisitos dados
    pub fn fits(&self, cores: u32, memory: u64) -> bool {
        self.free_cores >= cores && self.free_memory >= memory
    }

    /// true si el job cabría en el slave vacío
    pub fn could_ever_fit(&self, cores: u32, memory: u64) -> bool {
        self.total_cores >= cores && self.total_memory >= memory
    }

    pub fn avg_job_ms(&self) -> Option<f64> {
        if self.jobs_finished > 0 {
            Some(self.total_job_time_ms as f64 / self.jobs_finished as f64)
        } else {
            None
        }
    }
}

/// Payload que el master empuja al slave al asignarle un job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDispatchRequest {
    pub job_id: JobId,
    pub attempt: u32,
    pub required_cores: u32,
    pub required_memory: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDispatchResponse {
    pub accepted: bool,
}
