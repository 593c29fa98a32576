#![allow(dead_code)]

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use common::{
    JobId, JobInfo, JobState, JobSubmitRequest, SlaveId, SlaveInfo, SlaveRegisterRequest,
    StatisticsSnapshot,
};
use master::{
    registry::SlaveRegistry,
    scheduler::Scheduler,
    store::{JobStore, JobUpdate, MemoryStore, StatisticsStore, UpdateOutcome},
    transport::Dispatcher,
    Hive, HiveConfig, HiveError, Result,
};

/// Dispatcher de pruebas: anota lo que se envía y puede fallar para ciertos slaves.
#[derive(Default)]
pub struct RecordingDispatcher {
    pub dispatched: Mutex<Vec<(JobId, SlaveId)>>,
    pub aborted: Mutex<Vec<(JobId, SlaveId)>>,
    failing: Mutex<HashSet<SlaveId>>,
    cancel_in_flight: Mutex<Option<Arc<Scheduler>>>,
}

impl RecordingDispatcher {
    /// El próximo envío cancela el job antes de devolver el ack.
    pub fn cancel_during_next_dispatch(&self, scheduler: Arc<Scheduler>) {
        *self.cancel_in_flight.lock() = Some(scheduler);
    }

    pub fn fail_for(&self, slave_id: &str) {
        self.failing.lock().insert(slave_id.to_string());
    }

    pub fn heal(&self) {
        self.failing.lock().clear();
    }

    pub fn dispatched_jobs(&self) -> Vec<JobId> {
        self.dispatched.lock().iter().map(|(j, _)| j.clone()).collect()
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn dispatch(&self, slave: &SlaveInfo, job: &JobInfo, _payload: Arc<Vec<u8>>) -> Result<()> {
        if self.failing.lock().contains(&slave.id) {
            return Err(HiveError::Transport {
                slave_id: slave.id.clone(),
                reason: "connection refused".into(),
            });
        }
        self.dispatched.lock().push((job.id.clone(), slave.id.clone()));

        let canceller = self.cancel_in_flight.lock().take();
        if let Some(scheduler) = canceller {
            scheduler.cancel_job(&job.id).await?;
        }
        Ok(())
    }

    async fn abort(&self, slave: &SlaveInfo, job_id: &str) -> Result<()> {
        self.aborted.lock().push((job_id.to_string(), slave.id.clone()));
        Ok(())
    }
}

/// Envuelve un `MemoryStore`: puede hacer fallar las escrituras de jobs y
/// meter cambios entre los pasos de un tick.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    fail_updates: AtomicBool,
    abort_after_snapshot: Mutex<Option<JobId>>,
    drain_on_claim: Mutex<Option<(Arc<SlaveRegistry>, SlaveId)>>,
}

impl FlakyStore {
    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    /// La próxima lectura de la cola devuelve la foto y después aborta `job_id`.
    pub fn abort_after_next_snapshot(&self, job_id: &str) {
        *self.abort_after_snapshot.lock() = Some(job_id.to_string());
    }

    /// Cuando un claim deje un job en Waiting, marca el slave offline.
    pub fn drain_slave_on_next_claim(&self, registry: Arc<SlaveRegistry>, slave_id: &str) {
        *self.drain_on_claim.lock() = Some((registry, slave_id.to_string()));
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn insert_job(&self, job: JobInfo, payload: Vec<u8>) -> Result<()> {
        self.inner.insert_job(job, payload).await
    }

    async fn get_job(&self, id: &str) -> Result<Option<JobInfo>> {
        self.inner.get_job(id).await
    }

    async fn get_payload(&self, id: &str) -> Result<Option<Arc<Vec<u8>>>> {
        self.inner.get_payload(id).await
    }

    async fn list_jobs(&self) -> Result<Vec<JobInfo>> {
        self.inner.list_jobs().await
    }

    async fn queued_jobs(&self) -> Result<Vec<JobInfo>> {
        let snapshot = self.inner.queued_jobs().await?;

        let victim = self.abort_after_snapshot.lock().take();
        if let Some(job_id) = victim {
            self.inner
                .update_job_if(
                    &job_id,
                    Box::new(|j: &mut JobInfo| {
                        j.state = JobState::Aborted;
                        j.finished_at = Some(Utc::now());
                        true
                    }),
                )
                .await?;
        }
        Ok(snapshot)
    }

    async fn update_job_if(&self, id: &str, update: JobUpdate) -> Result<UpdateOutcome> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(HiveError::Storage("base de datos no disponible".into()));
        }
        let outcome = self.inner.update_job_if(id, update).await?;

        if matches!(&outcome, UpdateOutcome::Applied(j) if j.state == JobState::Waiting) {
            let drain = self.drain_on_claim.lock().take();
            if let Some((registry, slave_id)) = drain {
                registry.mark_offline(&slave_id)?;
            }
        }
        Ok(outcome)
    }

    async fn complete_job_if(
        &self,
        id: &str,
        update: JobUpdate,
        result: Option<Vec<u8>>,
    ) -> Result<UpdateOutcome> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(HiveError::Storage("base de datos no disponible".into()));
        }
        self.inner.complete_job_if(id, update, result).await
    }

    async fn get_result(&self, id: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get_result(id).await
    }

    async fn archive_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.inner.archive_finished_before(cutoff).await
    }

    async fn try_claim_cleanup(&self, now: DateTime<Utc>, interval: chrono::Duration) -> Result<bool> {
        self.inner.try_claim_cleanup(now, interval).await
    }

    async fn last_cleanup(&self) -> Result<Option<DateTime<Utc>>> {
        self.inner.last_cleanup().await
    }
}

#[async_trait]
impl StatisticsStore for FlakyStore {
    async fn insert_statistics(&self, snapshot: StatisticsSnapshot) -> Result<()> {
        self.inner.insert_statistics(snapshot).await
    }

    async fn latest_statistics(&self) -> Result<Option<StatisticsSnapshot>> {
        self.inner.latest_statistics().await
    }

    async fn prune_statistics_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.inner.prune_statistics_before(cutoff).await
    }
}

pub struct Fixture<S> {
    pub hive: Hive,
    pub store: Arc<S>,
    pub dispatcher: Arc<RecordingDispatcher>,
}

pub fn fixture() -> Fixture<MemoryStore> {
    fixture_with(HiveConfig::default(), MemoryStore::new())
}

pub fn fixture_with<S>(config: HiveConfig, store: S) -> Fixture<S>
where
    S: JobStore + StatisticsStore + 'static,
{
    let store = Arc::new(store);
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let hive = Hive::new(&config, store.clone(), dispatcher.clone());
    Fixture {
        hive,
        store,
        dispatcher,
    }
}

pub fn slave_req(hostname: &str, cores: u32, memory: u64) -> SlaveRegisterRequest {
    SlaveRegisterRequest {
        hostname: hostname.to_string(),
        endpoint: format!("http://{hostname}:9090"),
        total_cores: cores,
        total_memory: memory,
    }
}

pub fn job_req(name: &str, priority: i32, cores: u32, memory: u64) -> JobSubmitRequest {
    JobSubmitRequest {
        name: name.to_string(),
        priority,
        required_cores: cores,
        required_memory: memory,
        payload: name.as_bytes().to_vec(),
    }
}

/// Para cada slave, lo reservado coincide con los jobs Waiting/Calculating asignados a él.
pub async fn assert_reservations_match_jobs<S: JobStore>(hive: &Hive, store: &S) {
    let jobs = store.list_jobs().await.unwrap();

    for slave in hive.state.registry.list_all() {
        let mine: Vec<&JobInfo> = jobs
            .iter()
            .filter(|j| j.state.is_assigned() && j.assigned_slave_id.as_deref() == Some(slave.id.as_str()))
            .collect();

        let cores: u32 = mine.iter().map(|j| j.required_cores).sum();
        let memory: u64 = mine.iter().map(|j| j.required_memory).sum();
        let mut ids: Vec<JobId> = mine.iter().map(|j| j.id.clone()).collect();
        ids.sort();

        assert_eq!(slave.used_cores(), cores, "cores reservados en {}", slave.hostname);
        assert_eq!(slave.used_memory(), memory, "memoria reservada en {}", slave.hostname);
        assert_eq!(slave.assigned_jobs, ids, "jobs reservados en {}", slave.hostname);
    }
}
