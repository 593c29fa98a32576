//! Ejecución local (simulada) de los jobs que manda el master.

use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{sync::mpsc, task::AbortHandle, time::sleep};
use tracing::{debug, info, warn};

use common::{JobDispatchRequest, JobId, JobOutcome};

/// Job terminado, listo para reportar al master.
#[derive(Debug, Clone)]
pub struct Completion {
    pub job_id: JobId,
    pub outcome: JobOutcome,
    pub result_payload: Option<Vec<u8>>,
}

struct RunningJob {
    cores: u32,
    memory: u64,
    handle: AbortHandle,
}

pub struct Executor {
    total_cores: u32,
    total_memory: u64,
    work: Duration,
    running: Mutex<HashMap<JobId, RunningJob>>,
    done_tx: mpsc::UnboundedSender<Completion>,
}

impl Executor {
    pub fn new(
        total_cores: u32,
        total_memory: u64,
        work: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Completion>) {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let executor = Arc::new(Self {
            total_cores,
            total_memory,
            work,
            running: Mutex::new(HashMap::new()),
            done_tx,
        });
        (executor, done_rx)
    }

    /// Arranca el job. Un job ya en marcha se acepta de nuevo sin duplicarlo;
    /// se rechaza si localmente no hay hueco.
    pub fn start(self: &Arc<Self>, req: JobDispatchRequest) -> bool {
        let mut running = self.running.lock();

        if running.contains_key(&req.job_id) {
            debug!(job_id = %req.job_id, "dispatch repetido, el job ya está corriendo");
            return true;
        }

        let used_cores: u32 = running.values().map(|j| j.cores).sum();
        let used_memory: u64 = running.values().map(|j| j.memory).sum();
        if used_cores + req.required_cores > self.total_cores
            || used_memory + req.required_memory > self.total_memory
        {
            warn!(
                job_id = %req.job_id,
                cores = req.required_cores,
                memory = req.required_memory,
                used_cores,
                "sin recursos locales, job rechazado"
            );
            return false;
        }

        let this = self.clone();
        let job_id = req.job_id.clone();
        let (cores, memory) = (req.required_cores, req.required_memory);
        let task = tokio::spawn(async move {
            info!(job_id = %req.job_id, attempt = req.attempt, "calculando (simulado) por {:?}", this.work);
            sleep(this.work).await;

            // si lo abortaron mientras tanto ya no está en el mapa
            if this.running.lock().remove(&req.job_id).is_some() {
                let _ = this.done_tx.send(Completion {
                    job_id: req.job_id,
                    outcome: JobOutcome::Finished,
                    result_payload: Some(req.payload),
                });
            }
        });

        running.insert(
            job_id,
            RunningJob {
                cores,
                memory,
                handle: task.abort_handle(),
            },
        );
        true
    }

    /// Corta un job en marcha. false si no estaba corriendo.
    pub fn abort(&self, job_id: &str) -> bool {
        match self.running.lock().remove(job_id) {
            Some(job) => {
                job.handle.abort();
                info!(job_id, "job abortado");
                true
            }
            None => false,
        }
    }

    /// Cores y memoria libres según lo que corre localmente.
    pub fn free(&self) -> (u32, u64) {
        let running = self.running.lock();
        let cores: u32 = running.values().map(|j| j.cores).sum();
        let memory: u64 = running.values().map(|j| j.memory).sum();
        (
            self.total_cores.saturating_sub(cores),
            self.total_memory.saturating_sub(memory),
        )
    }

    pub fn running_jobs(&self) -> usize {
        self.running.lock().len()
    }
}
