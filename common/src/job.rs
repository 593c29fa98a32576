use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::slave::SlaveId;

pub type JobId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSubmitRequest {
    #[serde(default)]
    pub name: String,

    /// Prioridad: más alta se planifica antes
    #[serde(default)]
    pub priority: i32,

    pub required_cores: u32,

    /// Memoria requerida en MB
    pub required_memory: u64,

    /// Estado serializado del algoritmo (opaco para el Hive)
    #[serde(default)]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSubmitResponse {
    pub job_id: JobId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// En cola, esperando slave
    Offline,
    /// Reservado en un slave, payload en camino
    Waiting,
    Calculating,
    Finished,
    Aborted,
    Failed,
}

impl JobState {
    /// Estados terminales: el job ya no vuelve a la cola.
    pub fn is_final(&self) -> bool {
        matches!(self, JobState::Finished | JobState::Aborted | JobState::Failed)
    }

    /// Estados en los que el job ocupa recursos de un slave.
    pub fn is_assigned(&self) -> bool {
        matches!(self, JobState::Waiting | JobState::Calculating)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Offline => write!(f, "offline"),
            JobState::Waiting => write!(f, "waiting"),
            JobState::Calculating => write!(f, "calculating"),
            JobState::Finished => write!(f, "finished"),
            JobState::Aborted => write!(f, "aborted"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    /// Pide más recursos que el slave más grande de la flota
    Unschedulable,
    /// Superó el máximo de intentos (poison job)
    AttemptsExhausted,
    /// El slave reportó que el cálculo falló
    ReportedBySlave,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: JobId,
    pub name: String,
    pub priority: i32,
    pub required_cores: u32,
    pub required_memory: u64,
    pub state: JobState,
    pub failure_reason: Option<FailureReason>,
    pub assigned_slave_id: Option<SlaveId>,

    /// Slave que entregó el resultado final
    pub executed_by: Option<SlaveId>,
    pub attempt_count: u32,

    /// -------- Tiempos del job --------
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Tamaño del payload en bytes (el payload viaja aparte)
    pub payload_len: usize,
    pub has_result: bool,
}

impl JobInfo {
    pub fn new(id: JobId, req: &JobSubmitRequest, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            id,
            name: req.name.clone(),
            priority: req.priority,
            required_cores: req.required_cores,
            required_memory: req.required_memory,
            state: JobState::Offline,
            failure_reason: None,
            assigned_slave_id: None,
            executed_by: None,
            attempt_count: 0,
            enqueued_at,
            started_at: None,
            finished_at: None,
            payload_len: req.payload.len(),
            has_result: false,
        }
    }

    /// Los requisitos de recursos son válidos sólo si ambos son > 0.
    pub fn has_valid_requirements(&self) -> bool {
        self.required_cores > 0 && self.required_memory > 0
    }
}
