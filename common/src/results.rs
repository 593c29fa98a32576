use serde::{Deserialize, Serialize};

use crate::job::{JobId, JobState};
use crate::slave::SlaveId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobOutcome {
    Finished,
    Failed,
}

impl JobOutcome {
    pub fn final_state(&self) -> JobState {
        match self {
            JobOutcome::Finished => JobState::Finished,
            JobOutcome::Failed => JobState::Failed,
        }
    }
}

/// Lo que el slave manda al master cuando termina (bien o mal) un job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResultReport {
    pub slave_id: SlaveId,
    pub outcome: JobOutcome,

    /// Estado final serializado del algoritmo, si lo hay
    #[serde(default)]
    pub result_payload: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
}

impl Ack {
    pub fn ok() -> Self {
        Self { ok: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupResponse {
    /// false si otra instancia ya limpió dentro del intervalo
    pub performed: bool,
    pub archived_jobs: usize,
    pub purged_slaves: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResultView {
    pub job_id: JobId,
    pub result_payload: Option<Vec<u8>>,
}
