//! Repositorio de jobs, del registro de limpieza y de las estadísticas.
//!
//! El core sólo habla con los traits [`JobStore`] y [`StatisticsStore`]; el motor
//! de almacenamiento real queda fuera. [`MemoryStore`] es la implementación por
//! defecto: cada operación es atómica sobre su tabla, y `update_job_if` da la
//! semántica de transacción de una fila (leer, modificar, escribir o nada).

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use common::{FailureReason, JobId, JobInfo, JobState, StatisticsSnapshot};

use crate::error::Result;

/// Mutación de un job dentro de una transacción. Si devuelve `false` no se
/// escribe nada (la precondición no se cumplió).
pub type JobUpdate = Box<dyn FnOnce(&mut JobInfo) -> bool + Send>;

#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    /// Se escribió; trae el job ya modificado
    Applied(JobInfo),
    /// La precondición falló; trae el job tal como estaba
    Rejected(JobInfo),
    NotFound,
}

impl UpdateOutcome {
    pub fn applied(self) -> Option<JobInfo> {
        match self {
            UpdateOutcome::Applied(job) => Some(job),
            _ => None,
        }
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: JobInfo, payload: Vec<u8>) -> Result<()>;

    /// Busca también entre los archivados.
    async fn get_job(&self, id: &str) -> Result<Option<JobInfo>>;

    async fn get_payload(&self, id: &str) -> Result<Option<Arc<Vec<u8>>>>;

    /// Jobs activos (no archivados), por orden de llegada.
    async fn list_jobs(&self) -> Result<Vec<JobInfo>>;

    /// Jobs en cola ordenados por (prioridad desc, llegada asc).
    async fn queued_jobs(&self) -> Result<Vec<JobInfo>>;

    /// Transacción de una fila sobre el job `id`.
    async fn update_job_if(&self, id: &str, update: JobUpdate) -> Result<UpdateOutcome>;

    /// Como `update_job_if`, pero si la mutación se aplica guarda también el
    /// resultado en la misma transacción.
    async fn complete_job_if(
        &self,
        id: &str,
        update: JobUpdate,
        result: Option<Vec<u8>>,
    ) -> Result<UpdateOutcome>;

    /// Busca también entre los archivados.
    async fn get_result(&self, id: &str) -> Result<Option<Vec<u8>>>;

    /// Archiva jobs terminales con `finished_at` anterior a `cutoff`.
    async fn archive_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    /// Compare-and-update de `last_cleanup`: sólo devuelve `true` a quien gana
    /// la carrera, y como mucho una vez por `interval`.
    async fn try_claim_cleanup(
        &self,
        now: DateTime<Utc>,
        interval: chrono::Duration,
    ) -> Result<bool>;

    async fn last_cleanup(&self) -> Result<Option<DateTime<Utc>>>;
}

#[async_trait]
pub trait StatisticsStore: Send + Sync {
    async fn insert_statistics(&self, snapshot: StatisticsSnapshot) -> Result<()>;

    async fn latest_statistics(&self) -> Result<Option<StatisticsSnapshot>>;

    async fn prune_statistics_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

#[derive(Debug)]
struct StoredJob {
    info: JobInfo,
    payload: Arc<Vec<u8>>,
    result: Option<Vec<u8>>,
    seq: u64,
}

/// Archivados que se conservan por defecto; los más viejos se descartan.
pub const DEFAULT_ARCHIVE_LIMIT: usize = 10_000;

#[derive(Debug)]
struct ArchivedJob {
    info: JobInfo,
    result: Option<Vec<u8>>,
}

#[derive(Default)]
struct JobTable {
    active: HashMap<JobId, StoredJob>,
    archived: HashMap<JobId, ArchivedJob>,
    /// orden de archivado, el primero es el más viejo
    archive_order: VecDeque<JobId>,
    next_seq: u64,
}

impl JobTable {
    fn apply(
        &mut self,
        id: &str,
        update: JobUpdate,
        result: Option<Vec<u8>>,
    ) -> UpdateOutcome {
        let Some(stored) = self.active.get_mut(id) else {
            return UpdateOutcome::NotFound;
        };

        let mut draft = stored.info.clone();
        if !update(&mut draft) {
            return UpdateOutcome::Rejected(stored.info.clone());
        }
        if let Some(payload) = result {
            draft.has_result = true;
            stored.result = Some(payload);
        }
        stored.info = draft.clone();
        UpdateOutcome::Applied(draft)
    }
}

/// Almacenamiento en memoria con semántica transaccional por fila.
pub struct MemoryStore {
    jobs: Mutex<JobTable>,
    archive_limit: usize,
    last_cleanup: Mutex<Option<DateTime<Utc>>>,
    statistics: Mutex<Vec<StatisticsSnapshot>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_archive_limit(DEFAULT_ARCHIVE_LIMIT)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_archive_limit(archive_limit: usize) -> Self {
        Self {
            jobs: Mutex::new(JobTable::default()),
            archive_limit,
            last_cleanup: Mutex::new(None),
            statistics: Mutex::new(Vec::new()),
        }
    }

    pub fn archived_len(&self) -> usize {
        self.jobs.lock().archived.len()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_job(&self, job: JobInfo, payload: Vec<u8>) -> Result<()> {
        let mut table = self.jobs.lock();
        let seq = table.next_seq;
        table.next_seq += 1;
        table.active.insert(
            job.id.clone(),
            StoredJob {
                info: job,
                payload: Arc::new(payload),
                result: None,
                seq,
            },
        );
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<JobInfo>> {
        let table = self.jobs.lock();
        Ok(table
            .active
            .get(id)
            .map(|j| j.info.clone())
            .or_else(|| table.archived.get(id).map(|a| a.info.clone())))
    }

    async fn get_payload(&self, id: &str) -> Result<Option<Arc<Vec<u8>>>> {
        Ok(self.jobs.lock().active.get(id).map(|j| j.payload.clone()))
    }

    async fn list_jobs(&self) -> Result<Vec<JobInfo>> {
        let table = self.jobs.lock();
        let mut jobs: Vec<&StoredJob> = table.active.values().collect();
        jobs.sort_by_key(|j| j.seq);
        Ok(jobs.into_iter().map(|j| j.info.clone()).collect())
    }

    async fn queued_jobs(&self) -> Result<Vec<JobInfo>> {
        let table = self.jobs.lock();
        let mut queued: Vec<&StoredJob> = table
            .active
            .values()
            .filter(|j| j.info.state == JobState::Offline)
            .collect();
        queued.sort_by(|a, b| {
            b.info
                .priority
                .cmp(&a.info.priority)
                .then(a.info.enqueued_at.cmp(&b.info.enqueued_at))
                .then(a.seq.cmp(&b.seq))
        });
        Ok(queued.into_iter().map(|j| j.info.clone()).collect())
    }

    async fn update_job_if(&self, id: &str, update: JobUpdate) -> Result<UpdateOutcome> {
        Ok(self.jobs.lock().apply(id, update, None))
    }

    async fn complete_job_if(
        &self,
        id: &str,
        update: JobUpdate,
        result: Option<Vec<u8>>,
    ) -> Result<UpdateOutcome> {
        Ok(self.jobs.lock().apply(id, update, result))
    }

    async fn get_result(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let table = self.jobs.lock();
        Ok(match table.active.get(id) {
            Some(j) => j.result.clone(),
            None => table.archived.get(id).and_then(|a| a.result.clone()),
        })
    }

    async fn archive_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut table = self.jobs.lock();

        let old: Vec<JobId> = table
            .active
            .values()
            .filter(|j| j.info.state.is_final())
            .filter(|j| j.info.finished_at.map(|t| t < cutoff).unwrap_or(false))
            .map(|j| j.info.id.clone())
            .collect();

        for id in &old {
            if let Some(stored) = table.active.remove(id) {
                table.archived.insert(
                    id.clone(),
                    ArchivedJob {
                        info: stored.info,
                        result: stored.result,
                    },
                );
                table.archive_order.push_back(id.clone());
            }
        }

        let mut evicted = 0;
        while table.archived.len() > self.archive_limit {
            let Some(oldest) = table.archive_order.pop_front() else {
                break;
            };
            table.archived.remove(&oldest);
            evicted += 1;
        }
        if evicted > 0 {
            debug!(evicted, limit = self.archive_limit, "archivados más viejos descartados");
        }
        Ok(old.len())
    }

    async fn try_claim_cleanup(
        &self,
        now: DateTime<Utc>,
        interval: chrono::Duration,
    ) -> Result<bool> {
        let mut last = self.last_cleanup.lock();
        let due = match *last {
            None => true,
            Some(prev) => now.signed_duration_since(prev) > interval,
        };
        if due {
            *last = Some(now);
        }
        Ok(due)
    }

    async fn last_cleanup(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(*self.last_cleanup.lock())
    }
}

#[async_trait]
impl StatisticsStore for MemoryStore {
    async fn insert_statistics(&self, snapshot: StatisticsSnapshot) -> Result<()> {
        self.statistics.lock().push(snapshot);
        Ok(())
    }

    async fn latest_statistics(&self) -> Result<Option<StatisticsSnapshot>> {
        Ok(self
            .statistics
            .lock()
            .iter()
            .max_by_key(|s| s.generated_at)
            .cloned())
    }

    async fn prune_statistics_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut stats = self.statistics.lock();
        let before = stats.len();
        // la última foto se conserva siempre
        let newest = stats.iter().map(|s| s.generated_at).max();
        stats.retain(|s| s.generated_at >= cutoff || Some(s.generated_at) == newest);
        Ok(before - stats.len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequeueOutcome {
    /// Volvió a la cola con este número de intento
    Requeued { attempt_count: u32 },
    /// Superó el máximo de intentos y quedó Failed
    Failed,
    /// Ya no estaba asignado a ese slave (cancelado, terminado, o ya reencolado)
    Skipped,
}

/// Devuelve a la cola un job que estaba en `slave_id`, o lo marca Failed si
/// con este intento perdido llega a `max_attempts`. Sólo actúa si el job sigue Waiting/Calculating en ese
/// slave, así que es seguro llamarlo desde varios caminos de recuperación.
pub async fn requeue_job(
    store: &dyn JobStore,
    job_id: &str,
    slave_id: &str,
    max_attempts: u32,
) -> Result<RequeueOutcome> {
    let slave = slave_id.to_string();
    let outcome = store
        .update_job_if(
            job_id,
            Box::new(move |job: &mut JobInfo| {
                if !job.state.is_assigned() || job.assigned_slave_id.as_deref() != Some(slave.as_str()) {
                    return false;
                }
                job.assigned_slave_id = None;
                job.started_at = None;
                job.attempt_count += 1;
                if job.attempt_count < max_attempts {
                    job.state = JobState::Offline;
                } else {
                    job.state = JobState::Failed;
                    job.failure_reason = Some(FailureReason::AttemptsExhausted);
                    job.finished_at = Some(Utc::now());
                }
                true
            }),
        )
        .await?;

    Ok(match outcome {
        UpdateOutcome::Applied(job) if job.state == JobState::Failed => {
            warn!(
                job_id,
                slave_id,
                attempts = job.attempt_count,
                max_attempts,
                "job superó el máximo de intentos, marcado FAILED"
            );
            RequeueOutcome::Failed
        }
        UpdateOutcome::Applied(job) => {
            info!(job_id, slave_id, attempt = job.attempt_count, "job reencolado");
            RequeueOutcome::Requeued {
                attempt_count: job.attempt_count,
            }
        }
        UpdateOutcome::Rejected(_) | UpdateOutcome::NotFound => RequeueOutcome::Skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::JobSubmitRequest;

    fn job(id: &str, priority: i32, enqueued_at: DateTime<Utc>) -> JobInfo {
        let req = JobSubmitRequest {
            name: id.to_string(),
            priority,
            required_cores: 1,
            required_memory: 64,
            payload: Vec::new(),
        };
        JobInfo::new(id.to_string(), &req, enqueued_at)
    }

    fn assign(slave: &str) -> JobUpdate {
        let slave = slave.to_string();
        Box::new(move |j: &mut JobInfo| {
            if j.state != JobState::Offline {
                return false;
            }
            j.state = JobState::Calculating;
            j.assigned_slave_id = Some(slave);
            true
        })
    }

    #[tokio::test]
    async fn queued_jobs_ordena_por_prioridad_y_llegada() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        store.insert_job(job("viejo-baja", 1, t0), vec![]).await.unwrap();
        store
            .insert_job(job("nuevo-alta", 9, t0 + chrono::Duration::seconds(5)), vec![])
            .await
            .unwrap();
        store
            .insert_job(job("nuevo-baja", 1, t0 + chrono::Duration::seconds(1)), vec![])
            .await
            .unwrap();
        store.insert_job(job("empate", 1, t0), vec![]).await.unwrap();

        let ids: Vec<String> = store
            .queued_jobs()
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids, vec!["nuevo-alta", "viejo-baja", "empate", "nuevo-baja"]);
    }

    #[tokio::test]
    async fn update_job_if_no_escribe_si_la_precondicion_falla() {
        let store = MemoryStore::new();
        store.insert_job(job("j1", 0, Utc::now()), vec![]).await.unwrap();

        let first = store.update_job_if("j1", assign("s1")).await.unwrap();
        assert!(matches!(first, UpdateOutcome::Applied(_)));

        let second = store.update_job_if("j1", assign("s2")).await.unwrap();
        match second {
            UpdateOutcome::Rejected(current) => {
                assert_eq!(current.assigned_slave_id.as_deref(), Some("s1"))
            }
            other => panic!("esperaba Rejected, llegó {other:?}"),
        }

        assert!(matches!(
            store.update_job_if("nope", assign("s1")).await.unwrap(),
            UpdateOutcome::NotFound
        ));
    }

    #[tokio::test]
    async fn requeue_vuelve_a_cola_y_limpia_asignacion() {
        let store = MemoryStore::new();
        store.insert_job(job("j1", 0, Utc::now()), vec![]).await.unwrap();
        store.update_job_if("j1", assign("s1")).await.unwrap();

        let out = requeue_job(&store, "j1", "s1", 3).await.unwrap();
        assert_eq!(out, RequeueOutcome::Requeued { attempt_count: 1 });

        let j = store.get_job("j1").await.unwrap().unwrap();
        assert_eq!(j.state, JobState::Offline);
        assert!(j.assigned_slave_id.is_none());

        // segunda llamada: ya no está en s1
        assert_eq!(
            requeue_job(&store, "j1", "s1", 3).await.unwrap(),
            RequeueOutcome::Skipped
        );
    }

    #[tokio::test]
    async fn requeue_marca_failed_al_agotar_intentos() {
        let store = MemoryStore::new();
        store.insert_job(job("j1", 0, Utc::now()), vec![]).await.unwrap();

        for expected in 1..=2 {
            store.update_job_if("j1", assign("s1")).await.unwrap();
            assert_eq!(
                requeue_job(&store, "j1", "s1", 3).await.unwrap(),
                RequeueOutcome::Requeued {
                    attempt_count: expected
                }
            );
        }

        store.update_job_if("j1", assign("s1")).await.unwrap();
        assert_eq!(
            requeue_job(&store, "j1", "s1", 3).await.unwrap(),
            RequeueOutcome::Failed
        );
        let j = store.get_job("j1").await.unwrap().unwrap();
        assert_eq!(j.state, JobState::Failed);
        assert_eq!(j.failure_reason, Some(FailureReason::AttemptsExhausted));
        assert_eq!(j.attempt_count, 3);
    }

    #[tokio::test]
    async fn archiva_solo_jobs_terminados_y_viejos() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        store.insert_job(job("viejo", 0, t0), vec![1]).await.unwrap();
        store.insert_job(job("reciente", 0, t0), vec![]).await.unwrap();
        store.insert_job(job("en-cola", 0, t0), vec![]).await.unwrap();

        for (id, finished) in [
            ("viejo", t0 - chrono::Duration::hours(48)),
            ("reciente", t0),
        ] {
            store
                .update_job_if(
                    id,
                    Box::new(move |j: &mut JobInfo| {
                        j.state = JobState::Finished;
                        j.finished_at = Some(finished);
                        true
                    }),
                )
                .await
                .unwrap();
        }

        let n = store
            .archive_finished_before(t0 - chrono::Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(store.list_jobs().await.unwrap().len(), 2);
        assert_eq!(store.archived_len(), 1);
        // archivado sigue siendo consultable
        assert!(store.get_job("viejo").await.unwrap().is_some());
        assert!(store.get_payload("viejo").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_cleanup_una_vez_por_intervalo() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        let interval = chrono::Duration::minutes(10);

        assert!(store.try_claim_cleanup(t0, interval).await.unwrap());
        assert!(!store.try_claim_cleanup(t0, interval).await.unwrap());
        assert!(!store
            .try_claim_cleanup(t0 + chrono::Duration::minutes(10), interval)
            .await
            .unwrap());
        assert!(store
            .try_claim_cleanup(t0 + chrono::Duration::minutes(11), interval)
            .await
            .unwrap());
        assert_eq!(
            store.last_cleanup().await.unwrap(),
            Some(t0 + chrono::Duration::minutes(11))
        );
    }

    fn finish() -> JobUpdate {
        Box::new(|j: &mut JobInfo| {
            if !j.state.is_assigned() {
                return false;
            }
            j.state = JobState::Finished;
            j.finished_at = Some(Utc::now());
            true
        })
    }

    #[tokio::test]
    async fn resultado_se_guarda_con_la_transicion() {
        let store = MemoryStore::new();
        store.insert_job(job("j1", 0, Utc::now()), vec![7]).await.unwrap();
        store.update_job_if("j1", assign("s1")).await.unwrap();

        let out = store
            .complete_job_if("j1", finish(), Some(vec![4, 2]))
            .await
            .unwrap();
        assert!(out.applied().unwrap().has_result);
        assert_eq!(store.get_result("j1").await.unwrap(), Some(vec![4, 2]));
        assert_eq!(*store.get_payload("j1").await.unwrap().unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn resultado_rechazado_no_se_guarda() {
        let store = MemoryStore::new();
        store.insert_job(job("j1", 0, Utc::now()), vec![]).await.unwrap();

        // sigue en cola: la precondición falla
        let out = store
            .complete_job_if("j1", finish(), Some(vec![1]))
            .await
            .unwrap();
        assert!(matches!(out, UpdateOutcome::Rejected(_)));
        assert_eq!(store.get_result("j1").await.unwrap(), None);
        assert!(!store.get_job("j1").await.unwrap().unwrap().has_result);
    }

    #[tokio::test]
    async fn archivar_conserva_el_resultado_y_respeta_el_limite() {
        let store = MemoryStore::with_archive_limit(2);
        let t0 = Utc::now();
        for id in ["a", "b", "c"] {
            store.insert_job(job(id, 0, t0), vec![]).await.unwrap();
            store.update_job_if(id, assign("s1")).await.unwrap();
            store
                .complete_job_if(id, finish(), Some(id.as_bytes().to_vec()))
                .await
                .unwrap();
            // uno por vez para fijar el orden de archivado
            store
                .archive_finished_before(Utc::now() + chrono::Duration::seconds(1))
                .await
                .unwrap();
        }

        assert_eq!(store.archived_len(), 2);
        assert!(store.get_job("a").await.unwrap().is_none());

        let b = store.get_job("b").await.unwrap().unwrap();
        assert!(b.has_result);
        assert_eq!(store.get_result("b").await.unwrap(), Some(b"b".to_vec()));
    }
}
