//! Planificador: asigna jobs en cola a slaves con hueco y conduce las
//! transiciones de estado de los jobs.
//!
//! Cada tick trabaja sobre una foto (posiblemente vieja) de la cola y de los
//! slaves. Lo que resuelve las carreras no es un lock global sino dos cosas:
//! la reserva atómica en el [`SlaveRegistry`] y el claim transaccional
//! `Offline -> Waiting` en el [`JobStore`]. Si cualquiera de los dos falla, lo
//! que ya se hizo se deshace antes de seguir con el siguiente job.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{sync::Notify, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::{
    FailureReason, JobId, JobInfo, JobResultReport, JobState, JobSubmitRequest, SlaveId,
    SlaveInfo,
};

use crate::{
    config::{HiveConfig, PlacementPolicy},
    error::{HiveError, Result},
    registry::SlaveRegistry,
    store::{requeue_job, JobStore, RequeueOutcome, UpdateOutcome},
    transport::Dispatcher,
};

/// Qué pasó en un tick; sirve para logs y tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub assigned: Vec<(JobId, SlaveId)>,
    pub unschedulable: Vec<JobId>,
    pub exhausted: Vec<JobId>,
    pub dispatch_failures: Vec<JobId>,
    /// Jobs que otro camino movió mientras el tick los miraba
    pub skipped: Vec<JobId>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.assigned.is_empty()
            && self.unschedulable.is_empty()
            && self.exhausted.is_empty()
            && self.dispatch_failures.is_empty()
            && self.skipped.is_empty()
    }
}

pub struct Scheduler {
    registry: Arc<SlaveRegistry>,
    store: Arc<dyn JobStore>,
    dispatcher: Arc<dyn Dispatcher>,
    max_attempts: u32,
    placement: PlacementPolicy,
    tick_interval: Duration,
    wake: Notify,
}

impl Scheduler {
    pub fn new(
        registry: Arc<SlaveRegistry>,
        store: Arc<dyn JobStore>,
        dispatcher: Arc<dyn Dispatcher>,
        config: &HiveConfig,
    ) -> Self {
        Self {
            registry,
            store,
            dispatcher,
            max_attempts: config.max_attempts,
            placement: config.placement,
            tick_interval: config.scheduler_tick,
            wake: Notify::new(),
        }
    }

    /// Despierta el loop: hay un job nuevo o un slave con hueco.
    pub fn notify(&self) {
        self.wake.notify_one();
    }

    /* ---------------- operaciones de clientes y slaves ---------------- */

    pub async fn submit_job(&self, req: JobSubmitRequest) -> Result<JobId> {
        let job_id = uuid::Uuid::new_v4().to_string();
        let job = JobInfo::new(job_id.clone(), &req, Utc::now());
        if !job.has_valid_requirements() {
            return Err(HiveError::InvalidResourceRequirement {
                cores: req.required_cores,
                memory: req.required_memory,
            });
        }

        self.store.insert_job(job, req.payload).await?;
        info!(
            job_id = %job_id,
            priority = req.priority,
            cores = req.required_cores,
            memory = req.required_memory,
            "job encolado"
        );

        self.notify();
        Ok(job_id)
    }

    /// Registra (o re-registra) un slave y reencola lo que tenía asignado.
    pub async fn register_slave(&self, req: &common::SlaveRegisterRequest) -> Result<SlaveId> {
        let registration = self.registry.register(req, Utc::now());
        self.requeue_orphans(&registration.slave_id, &registration.orphaned_jobs)
            .await;
        self.notify();
        Ok(registration.slave_id)
    }

    pub async fn deregister_slave(&self, slave_id: &str) -> Result<()> {
        let orphaned = self.registry.deregister(slave_id)?;
        self.requeue_orphans(slave_id, &orphaned).await;
        self.notify();
        Ok(())
    }

    /// Reencola jobs que perdieron su slave. Los errores se registran y no
    /// cortan el resto: el job queda como estaba hasta el próximo intento.
    pub async fn requeue_orphans(&self, slave_id: &str, jobs: &[JobId]) -> Vec<(JobId, RequeueOutcome)> {
        let mut out = Vec::with_capacity(jobs.len());
        for job_id in jobs {
            match requeue_job(self.store.as_ref(), job_id, slave_id, self.max_attempts).await {
                Ok(outcome) => out.push((job_id.clone(), outcome)),
                Err(e) => warn!(job_id = %job_id, slave_id, "no se pudo reencolar el job: {e}"),
            }
        }
        out
    }

    /// Reencola jobs que figuran Waiting/Calculating en un slave que ya no les
    /// guarda reserva. Pasa cuando el slave se drenó (caída, baja, re-registro
    /// o fallo de envío) y la escritura del reencolado falló: la reserva ya no
    /// existe, así que este barrido sobre el store es el único camino de vuelta.
    pub async fn recover_stranded(&self) -> Vec<(JobId, RequeueOutcome)> {
        let jobs = match self.store.list_jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!("no se pudieron listar jobs para recuperar huérfanos: {e}");
                return Vec::new();
            }
        };

        let mut out = Vec::new();
        for job in jobs.into_iter().filter(|j| j.state.is_assigned()) {
            let Some(slave_id) = job.assigned_slave_id.as_deref() else {
                continue;
            };
            if self.registry.holds(slave_id, &job.id) {
                continue;
            }
            // requeue_job re-chequea estado y slave dentro de la transacción
            match requeue_job(self.store.as_ref(), &job.id, slave_id, self.max_attempts).await {
                Ok(RequeueOutcome::Skipped) => {}
                Ok(outcome) => {
                    info!(job_id = %job.id, slave_id, "job varado recuperado");
                    out.push((job.id.clone(), outcome));
                }
                Err(e) => warn!(job_id = %job.id, slave_id, "no se pudo recuperar el job varado: {e}"),
            }
        }
        out
    }

    /// Resultado final de un job. Idempotente: un reporte repetido o de un
    /// slave que ya no tiene el job se registra y se ignora.
    pub async fn report_job_result(&self, job_id: &str, mut report: JobResultReport) -> Result<()> {
        let slave = report.slave_id.clone();
        let result = report.result_payload.take();
        let outcome = report.outcome;
        let now = Utc::now();

        // el resultado se escribe en la misma transacción que el estado final
        let update = self
            .store
            .complete_job_if(
                job_id,
                Box::new(move |job: &mut JobInfo| {
                    if !job.state.is_assigned() || job.assigned_slave_id.as_deref() != Some(slave.as_str())
                    {
                        return false;
                    }
                    job.state = outcome.final_state();
                    job.executed_by = Some(slave);
                    job.finished_at = Some(now);
                    if job.state == JobState::Failed {
                        job.failure_reason = Some(FailureReason::ReportedBySlave);
                    }
                    true
                }),
                result,
            )
            .await?;

        match update {
            UpdateOutcome::Applied(job) => {
                self.registry.release(
                    &report.slave_id,
                    job_id,
                    job.required_cores,
                    job.required_memory,
                );

                let duration_ms = job
                    .started_at
                    .map(|s| (now - s).num_milliseconds().max(0) as u64)
                    .unwrap_or(0);
                self.registry.record_job_outcome(
                    &report.slave_id,
                    job.state == JobState::Finished,
                    duration_ms,
                );

                info!(
                    job_id,
                    slave_id = %report.slave_id,
                    state = %job.state,
                    duration_ms,
                    "job finalizado"
                );
                self.notify();
                Ok(())
            }
            UpdateOutcome::Rejected(current) if current.state.is_final() => {
                warn!(
                    job_id,
                    slave_id = %report.slave_id,
                    state = %current.state,
                    "resultado duplicado para un job ya finalizado, ignorado"
                );
                Ok(())
            }
            UpdateOutcome::Rejected(current) => {
                warn!(
                    job_id,
                    slave_id = %report.slave_id,
                    state = %current.state,
                    assigned = ?current.assigned_slave_id,
                    "resultado de un slave que ya no tiene el job, ignorado"
                );
                Ok(())
            }
            UpdateOutcome::NotFound => Err(HiveError::JobNotFound(job_id.to_string())),
        }
    }

    /// Cancela un job en cola o en ejecución. Cancelar un job ya terminado es un no-op.
    pub async fn cancel_job(&self, job_id: &str) -> Result<()> {
        let now = Utc::now();
        let update = self
            .store
            .update_job_if(
                job_id,
                Box::new(move |job: &mut JobInfo| {
                    if job.state.is_final() {
                        return false;
                    }
                    job.state = JobState::Aborted;
                    job.finished_at = Some(now);
                    true
                }),
            )
            .await?;

        match update {
            UpdateOutcome::Applied(job) => {
                if let Some(slave_id) = job.assigned_slave_id.as_deref() {
                    self.registry
                        .release(slave_id, job_id, job.required_cores, job.required_memory);

                    // aviso best-effort; la reserva ya está liberada
                    if let Some(slave) = self.registry.get(slave_id) {
                        if let Err(e) = self.dispatcher.abort(&slave, job_id).await {
                            warn!(job_id, slave_id, "no se pudo avisar la cancelación al slave: {e}");
                        }
                    }
                    self.notify();
                }
                info!(job_id, "job cancelado");
                Ok(())
            }
            UpdateOutcome::Rejected(current) => {
                debug!(job_id, state = %current.state, "cancelación sobre un job ya finalizado");
                Ok(())
            }
            UpdateOutcome::NotFound => Err(HiveError::JobNotFound(job_id.to_string())),
        }
    }

    /* ---------------- planificación ---------------- */

    /// Una pasada de planificación:
    /// 1. cola ordenada por prioridad y llegada
    /// 2. foto de slaves disponibles
    /// 3. por job: elegir slave, reservar, claim, enviar, confirmar
    pub async fn tick(&self) -> Result<TickReport> {
        let mut report = TickReport::default();

        let queued = self.store.queued_jobs().await?;
        if queued.is_empty() {
            return Ok(report);
        }

        let mut slaves = self.registry.list_available();
        // para Unschedulable cuentan también los slaves offline todavía no purgados
        let registered = self.registry.list_all();

        for job in queued {
            if job.attempt_count >= self.max_attempts {
                if self.fail_queued(&job, FailureReason::AttemptsExhausted).await? {
                    report.exhausted.push(job.id.clone());
                }
                continue;
            }

            if !registered.is_empty()
                && !registered
                    .iter()
                    .any(|s| s.could_ever_fit(job.required_cores, job.required_memory))
            {
                if self.fail_queued(&job, FailureReason::Unschedulable).await? {
                    report.unschedulable.push(job.id.clone());
                }
                continue;
            }

            let Some(slave) = self.reserve_slot(&job, &mut slaves) else {
                debug!(job_id = %job.id, "sin slave con hueco, el job sigue en cola");
                continue;
            };

            match self.claim_and_dispatch(&job, &slave).await {
                Ok(Placement::Assigned) => report.assigned.push((job.id.clone(), slave.id.clone())),
                Ok(Placement::Skipped) => report.skipped.push(job.id.clone()),
                Ok(Placement::DispatchFailed) => report.dispatch_failures.push(job.id.clone()),
                Err(e) => {
                    // error de almacenamiento: la reserva ya se deshizo, el job
                    // sigue en cola para el próximo tick
                    warn!(
                        job_id = %job.id,
                        slave_id = %slave.id,
                        transient = e.is_transient(),
                        "fallo asignando job: {e}"
                    );
                }
            }
        }

        Ok(report)
    }

    /// Elige slave según la política y reserva. Actualiza la foto local para
    /// que los jobs siguientes del mismo tick vean el hueco ya ocupado.
    fn reserve_slot(&self, job: &JobInfo, slaves: &mut [SlaveInfo]) -> Option<SlaveInfo> {
        let mut candidates: Vec<usize> = slaves
            .iter()
            .enumerate()
            .filter(|(_, s)| s.fits(job.required_cores, job.required_memory))
            .map(|(i, _)| i)
            .collect();

        match self.placement {
            PlacementPolicy::BestFit => candidates.sort_by(|&a, &b| {
                let (sa, sb) = (&slaves[a], &slaves[b]);
                sa.free_cores
                    .cmp(&sb.free_cores)
                    .then(sa.free_memory.cmp(&sb.free_memory))
                    .then(sa.id.cmp(&sb.id))
            }),
            PlacementPolicy::WorstFit => candidates.sort_by(|&a, &b| {
                let (sa, sb) = (&slaves[a], &slaves[b]);
                sb.free_cores
                    .cmp(&sa.free_cores)
                    .then(sb.free_memory.cmp(&sa.free_memory))
                    .then(sa.id.cmp(&sb.id))
            }),
        }

        for idx in candidates {
            let slave_id = slaves[idx].id.clone();
            if self
                .registry
                .reserve(&slave_id, &job.id, job.required_cores, job.required_memory)
            {
                let s = &mut slaves[idx];
                s.free_cores -= job.required_cores;
                s.free_memory -= job.required_memory;
                return Some(s.clone());
            }

            // la foto estaba vieja: refrescar este slave y probar el siguiente
            match self.registry.get(&slave_id) {
                Some(fresh) if fresh.state != common::SlaveState::Offline => slaves[idx] = fresh,
                _ => {
                    slaves[idx].free_cores = 0;
                    slaves[idx].free_memory = 0;
                }
            }
        }
        None
    }

    async fn claim_and_dispatch(&self, job: &JobInfo, slave: &SlaveInfo) -> Result<Placement> {
        let release = || {
            self.registry
                .release(&slave.id, &job.id, job.required_cores, job.required_memory)
        };

        // claim transaccional: sólo si el job sigue en cola
        let slave_id = slave.id.clone();
        let now = Utc::now();
        let claimed = match self
            .store
            .update_job_if(
                &job.id,
                Box::new(move |j: &mut JobInfo| {
                    if j.state != JobState::Offline {
                        return false;
                    }
                    j.state = JobState::Waiting;
                    j.assigned_slave_id = Some(slave_id);
                    j.started_at = Some(now);
                    true
                }),
            )
            .await
        {
            Ok(UpdateOutcome::Applied(j)) => j,
            Ok(_) => {
                debug!(job_id = %job.id, "el job ya no está en cola, se suelta la reserva");
                release();
                return Ok(Placement::Skipped);
            }
            Err(e) => {
                release();
                return Err(e);
            }
        };

        // si el slave cayó entre la reserva y el claim, su reserva ya no existe
        // y nadie más va a reencolar este job
        if !self.registry.holds(&slave.id, &job.id) {
            self.revert_claim(&job.id, &slave.id).await?;
            return Ok(Placement::Skipped);
        }

        let payload = match self.store.get_payload(&job.id).await {
            Ok(Some(p)) => p,
            Ok(None) => {
                release();
                self.revert_claim(&job.id, &slave.id).await?;
                return Ok(Placement::Skipped);
            }
            Err(e) => {
                release();
                self.revert_claim(&job.id, &slave.id).await?;
                return Err(e);
            }
        };

        // sin locks tomados durante el envío
        match self.dispatcher.dispatch(slave, &claimed, payload).await {
            Ok(()) => {
                let slave_id = slave.id.clone();
                let confirmed = self
                    .store
                    .update_job_if(
                        &job.id,
                        Box::new(move |j: &mut JobInfo| {
                            if j.state != JobState::Waiting
                                || j.assigned_slave_id.as_deref() != Some(slave_id.as_str())
                            {
                                return false;
                            }
                            j.state = JobState::Calculating;
                            true
                        }),
                    )
                    .await?;

                match confirmed {
                    UpdateOutcome::Applied(_) => {
                        self.registry.record_job_started(&slave.id);
                        info!(
                            job_id = %job.id,
                            slave_id = %slave.id,
                            priority = job.priority,
                            attempt = job.attempt_count,
                            "job asignado y en cálculo"
                        );
                        Ok(Placement::Assigned)
                    }
                    // quien lo movió (cancelación, resultado, recuperación) ya soltó la reserva
                    _ => {
                        debug!(
                            job_id = %job.id,
                            "el job cambió de estado durante el envío (cancelado o ya terminado)"
                        );
                        Ok(Placement::Skipped)
                    }
                }
            }
            Err(e) => {
                warn!(job_id = %job.id, slave_id = %slave.id, "fallo enviando el job: {e}");
                release();
                let requeued =
                    requeue_job(self.store.as_ref(), &job.id, &slave.id, self.max_attempts).await?;
                if requeued == RequeueOutcome::Failed {
                    warn!(job_id = %job.id, "job descartado tras fallos de envío");
                }
                Ok(Placement::DispatchFailed)
            }
        }
    }

    /// Deshace un claim sin contar intento: el job no llegó a salir.
    async fn revert_claim(&self, job_id: &str, slave_id: &str) -> Result<()> {
        let slave = slave_id.to_string();
        self.store
            .update_job_if(
                job_id,
                Box::new(move |j: &mut JobInfo| {
                    if j.state != JobState::Waiting || j.assigned_slave_id.as_deref() != Some(slave.as_str())
                    {
                        return false;
                    }
                    j.state = JobState::Offline;
                    j.assigned_slave_id = None;
                    j.started_at = None;
                    true
                }),
            )
            .await?;
        Ok(())
    }

    /// Offline -> Failed. Devuelve false si el job ya no estaba en cola.
    async fn fail_queued(&self, job: &JobInfo, reason: FailureReason) -> Result<bool> {
        let now = Utc::now();
        let applied = self
            .store
            .update_job_if(
                &job.id,
                Box::new(move |j: &mut JobInfo| {
                    if j.state != JobState::Offline {
                        return false;
                    }
                    j.state = JobState::Failed;
                    j.failure_reason = Some(reason);
                    j.finished_at = Some(now);
                    true
                }),
            )
            .await?
            .applied()
            .is_some();

        if applied {
            warn!(
                job_id = %job.id,
                ?reason,
                cores = job.required_cores,
                memory = job.required_memory,
                attempts = job.attempt_count,
                "job marcado FAILED"
            );
        }
        Ok(applied)
    }

    /// Loop del planificador: un tick por intervalo o cuando alguien avisa.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        info!(tick = ?self.tick_interval, placement = ?self.placement, "scheduler arrancado");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = sleep(self.tick_interval) => {}
            }

            match self.tick().await {
                Ok(report) if report.is_empty() => {}
                Ok(report) => debug!(?report, "tick del scheduler"),
                Err(e) => warn!("error en tick del scheduler: {e}"),
            }
        }
        info!("scheduler detenido");
    }
}

enum Placement {
    Assigned,
    Skipped,
    DispatchFailed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use common::{JobOutcome, SlaveRegisterRequest};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingDispatcher {
        sent: Mutex<Vec<(JobId, SlaveId)>>,
        fail: bool,
    }

    #[async_trait]
    impl Dispatcher for RecordingDispatcher {
        async fn dispatch(
            &self,
            slave: &SlaveInfo,
            job: &JobInfo,
            _payload: Arc<Vec<u8>>,
        ) -> Result<()> {
            if self.fail {
                return Err(HiveError::Transport {
                    slave_id: slave.id.clone(),
                    reason: "conexión rechazada".into(),
                });
            }
            self.sent.lock().push((job.id.clone(), slave.id.clone()));
            Ok(())
        }

        async fn abort(&self, _slave: &SlaveInfo, _job_id: &str) -> Result<()> {
            Ok(())
        }
    }

    fn setup(fail: bool) -> (Arc<SlaveRegistry>, Arc<MemoryStore>, Scheduler) {
        let registry = Arc::new(SlaveRegistry::new());
        let store = Arc::new(MemoryStore::new());
        let dispatcher = Arc::new(RecordingDispatcher {
            fail,
            ..Default::default()
        });
        let sched = Scheduler::new(
            registry.clone(),
            store.clone(),
            dispatcher,
            &HiveConfig::default(),
        );
        (registry, store, sched)
    }

    fn slave(hostname: &str, cores: u32) -> SlaveRegisterRequest {
        SlaveRegisterRequest {
            hostname: hostname.into(),
            endpoint: format!("http://{hostname}:9090"),
            total_cores: cores,
            total_memory: 8192,
        }
    }

    fn job(priority: i32, cores: u32) -> JobSubmitRequest {
        JobSubmitRequest {
            name: format!("p{priority}"),
            priority,
            required_cores: cores,
            required_memory: 256,
            payload: vec![1, 2, 3],
        }
    }

    #[tokio::test]
    async fn submit_rechaza_requisitos_en_cero() {
        let (_, _, sched) = setup(false);
        let err = sched
            .submit_job(JobSubmitRequest {
                required_cores: 0,
                ..job(1, 1)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::InvalidResourceRequirement { .. }));
    }

    #[tokio::test]
    async fn tick_asigna_y_pasa_a_calculating() {
        let (registry, store, sched) = setup(false);
        let sid = sched.register_slave(&slave("s1", 4)).await.unwrap();
        let jid = sched.submit_job(job(1, 2)).await.unwrap();

        let report = sched.tick().await.unwrap();
        assert_eq!(report.assigned, vec![(jid.clone(), sid.clone())]);

        let j = store.get_job(&jid).await.unwrap().unwrap();
        assert_eq!(j.state, JobState::Calculating);
        assert_eq!(j.assigned_slave_id.as_deref(), Some(sid.as_str()));
        assert!(j.started_at.is_some());
        let s = registry.get(&sid).unwrap();
        assert_eq!(s.free_cores, 2);
        assert_eq!(s.jobs_started, 1);
    }

    #[tokio::test]
    async fn best_fit_elige_el_slave_mas_chico_que_cabe() {
        let (_, store, sched) = setup(false);
        let _grande = sched.register_slave(&slave("grande", 16)).await.unwrap();
        let chico = sched.register_slave(&slave("chico", 4)).await.unwrap();
        let _mini = sched.register_slave(&slave("mini", 1)).await.unwrap();
        let jid = sched.submit_job(job(1, 3)).await.unwrap();

        sched.tick().await.unwrap();
        let j = store.get_job(&jid).await.unwrap().unwrap();
        assert_eq!(j.assigned_slave_id, Some(chico));
    }

    #[tokio::test]
    async fn fallo_de_envio_suelta_reserva_y_reencola() {
        let (registry, store, sched) = setup(true);
        let sid = sched.register_slave(&slave("s1", 4)).await.unwrap();
        let jid = sched.submit_job(job(1, 2)).await.unwrap();

        let report = sched.tick().await.unwrap();
        assert_eq!(report.dispatch_failures, vec![jid.clone()]);

        let j = store.get_job(&jid).await.unwrap().unwrap();
        assert_eq!(j.state, JobState::Offline);
        assert_eq!(j.attempt_count, 1);
        assert!(j.assigned_slave_id.is_none());
        assert_eq!(registry.get(&sid).unwrap().free_cores, 4);
    }

    #[tokio::test]
    async fn fallos_de_envio_repetidos_terminan_en_failed() {
        let (_, store, sched) = setup(true);
        sched.register_slave(&slave("s1", 4)).await.unwrap();
        let jid = sched.submit_job(job(1, 2)).await.unwrap();

        for _ in 0..3 {
            sched.tick().await.unwrap();
        }
        let j = store.get_job(&jid).await.unwrap().unwrap();
        assert_eq!(j.state, JobState::Failed);
        assert_eq!(j.failure_reason, Some(FailureReason::AttemptsExhausted));
    }

    #[tokio::test]
    async fn sin_slaves_el_job_sigue_en_cola() {
        let (_, store, sched) = setup(false);
        let jid = sched.submit_job(job(1, 64)).await.unwrap();

        let report = sched.tick().await.unwrap();
        assert!(report.is_empty());
        let j = store.get_job(&jid).await.unwrap().unwrap();
        assert_eq!(j.state, JobState::Offline);
    }

    #[tokio::test]
    async fn resultado_libera_reserva_y_es_idempotente() {
        let (registry, store, sched) = setup(false);
        let sid = sched.register_slave(&slave("s1", 4)).await.unwrap();
        let jid = sched.submit_job(job(1, 2)).await.unwrap();
        sched.tick().await.unwrap();

        let report = JobResultReport {
            slave_id: sid.clone(),
            outcome: JobOutcome::Finished,
            result_payload: Some(vec![9]),
        };
        sched.report_job_result(&jid, report.clone()).await.unwrap();
        sched.report_job_result(&jid, report).await.unwrap();

        let j = store.get_job(&jid).await.unwrap().unwrap();
        assert_eq!(j.state, JobState::Finished);
        assert_eq!(j.executed_by.as_deref(), Some(sid.as_str()));
        let s = registry.get(&sid).unwrap();
        assert_eq!(s.free_cores, 4);
        assert_eq!(s.jobs_finished, 1);
        assert_eq!(store.get_result(&jid).await.unwrap(), Some(vec![9]));
    }

    #[tokio::test]
    async fn resultado_de_slave_equivocado_se_ignora() {
        let (registry, store, sched) = setup(false);
        let sid = sched.register_slave(&slave("s1", 4)).await.unwrap();
        let jid = sched.submit_job(job(1, 2)).await.unwrap();
        sched.tick().await.unwrap();

        sched
            .report_job_result(
                &jid,
                JobResultReport {
                    slave_id: "otro".into(),
                    outcome: JobOutcome::Finished,
                    result_payload: None,
                },
            )
            .await
            .unwrap();

        let j = store.get_job(&jid).await.unwrap().unwrap();
        assert_eq!(j.state, JobState::Calculating);
        assert_eq!(registry.get(&sid).unwrap().free_cores, 2);
    }

    #[tokio::test]
    async fn resultado_de_job_inexistente_es_not_found() {
        let (_, _, sched) = setup(false);
        let err = sched
            .report_job_result(
                "nope",
                JobResultReport {
                    slave_id: "s".into(),
                    outcome: JobOutcome::Failed,
                    result_payload: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn cancelar_job_en_calculo_libera_reserva() {
        let (registry, store, sched) = setup(false);
        let sid = sched.register_slave(&slave("s1", 4)).await.unwrap();
        let jid = sched.submit_job(job(1, 2)).await.unwrap();
        sched.tick().await.unwrap();

        sched.cancel_job(&jid).await.unwrap();
        let j = store.get_job(&jid).await.unwrap().unwrap();
        assert_eq!(j.state, JobState::Aborted);
        assert_eq!(registry.get(&sid).unwrap().free_cores, 4);

        // segunda cancelación: ack sin efectos
        sched.cancel_job(&jid).await.unwrap();
        assert!(matches!(
            sched.cancel_job("nope").await,
            Err(HiveError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn cancelar_job_en_cola() {
        let (_, store, sched) = setup(false);
        let jid = sched.submit_job(job(1, 2)).await.unwrap();
        sched.cancel_job(&jid).await.unwrap();

        assert_eq!(
            store.get_job(&jid).await.unwrap().unwrap().state,
            JobState::Aborted
        );
        assert!(store.queued_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn re_registro_reencola_jobs_huerfanos() {
        let (registry, store, sched) = setup(false);
        let sid = sched.register_slave(&slave("s1", 4)).await.unwrap();
        let jid = sched.submit_job(job(1, 2)).await.unwrap();
        sched.tick().await.unwrap();

        let again = sched.register_slave(&slave("s1", 4)).await.unwrap();
        assert_eq!(again, sid);

        let j = store.get_job(&jid).await.unwrap().unwrap();
        assert_eq!(j.state, JobState::Offline);
        assert_eq!(j.attempt_count, 1);
        assert_eq!(registry.get(&sid).unwrap().free_cores, 4);
    }
}
