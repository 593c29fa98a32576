//! Registro de slaves: capacidad libre, reservas por job y vida (heartbeats).
//!
//! Cada slave vive detrás de su propio `Mutex`; el mapa global sólo se bloquea
//! para altas, bajas y para clonar el `Arc` del slave. Reservar y liberar
//! recursos es una única sección crítica sobre el slave, nunca se cruza un
//! `.await` con un lock tomado.

use std::{
    collections::HashMap,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use common::{JobId, SlaveId, SlaveInfo, SlaveRegisterRequest, SlaveState};

use crate::error::{HiveError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Reserved {
    cores: u32,
    memory: u64,
}

#[derive(Debug)]
struct SlaveEntry {
    info: SlaveInfo,
    reservations: HashMap<JobId, Reserved>,
}

impl SlaveEntry {
    fn snapshot(&self) -> SlaveInfo {
        let mut info = self.info.clone();
        let mut jobs: Vec<JobId> = self.reservations.keys().cloned().collect();
        jobs.sort();
        info.assigned_jobs = jobs;
        info
    }

    fn refresh_state(&mut self) {
        if self.info.state == SlaveState::Offline {
            return;
        }
        self.info.state = if self.reservations.is_empty() {
            SlaveState::Idle
        } else {
            SlaveState::Calculating
        };
    }

    /// Devuelve capacidad al slave y los jobs que tenía reservados.
    fn drain_reservations(&mut self) -> Vec<JobId> {
        let mut jobs: Vec<JobId> = self.reservations.drain().map(|(id, _)| id).collect();
        jobs.sort();
        self.info.free_cores = self.info.total_cores;
        self.info.free_memory = self.info.total_memory;
        jobs
    }
}

/// Resultado de un (re)registro.
#[derive(Debug, Clone)]
pub struct Registration {
    pub slave_id: SlaveId,
    /// true si la misma identidad física ya estaba registrada
    pub reregistered: bool,
    /// Jobs que tenían recursos reservados en el slave antes de re-registrarse;
    /// quien llama debe reencolarlos.
    pub orphaned_jobs: Vec<JobId>,
}

#[derive(Default)]
struct Inner {
    slaves: HashMap<SlaveId, Arc<Mutex<SlaveEntry>>>,
    by_hostname: HashMap<String, SlaveId>,
}

#[derive(Default)]
pub struct SlaveRegistry {
    inner: RwLock<Inner>,
}

impl SlaveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, slave_id: &str) -> Option<Arc<Mutex<SlaveEntry>>> {
        self.inner.read().slaves.get(slave_id).cloned()
    }

    /// Registra un slave. Si el hostname ya existe se reutiliza el id, se
    /// resetea la capacidad libre a los totales y se limpian sus reservas.
    pub fn register(&self, req: &SlaveRegisterRequest, now: DateTime<Utc>) -> Registration {
        let mut inner = self.inner.write();

        if let Some(existing_id) = inner.by_hostname.get(&req.hostname).cloned() {
            if let Some(entry) = inner.slaves.get(&existing_id) {
                let mut e = entry.lock();
                let orphaned_jobs = e.drain_reservations();

                e.info.endpoint = req.endpoint.clone();
                e.info.total_cores = req.total_cores;
                e.info.free_cores = req.total_cores;
                e.info.total_memory = req.total_memory;
                e.info.free_memory = req.total_memory;
                e.info.last_heartbeat = now;
                e.info.registered_at = now;
                e.info.reported_free_cores = None;
                e.info.reported_free_memory = None;
                e.info.state = SlaveState::Idle;

                info!(
                    slave_id = %existing_id,
                    hostname = %req.hostname,
                    orphaned = orphaned_jobs.len(),
                    "slave re-registrado"
                );

                return Registration {
                    slave_id: existing_id,
                    reregistered: true,
                    orphaned_jobs,
                };
            }
        }

        let slave_id = uuid::Uuid::new_v4().to_string();
        let info = SlaveInfo {
            id: slave_id.clone(),
            hostname: req.hostname.clone(),
            endpoint: req.endpoint.clone(),
            state: SlaveState::Idle,
            total_cores: req.total_cores,
            free_cores: req.total_cores,
            total_memory: req.total_memory,
            free_memory: req.total_memory,
            cpu_utilization: 0.0,
            registered_at: now,
            last_heartbeat: now,
            reported_free_cores: None,
            reported_free_memory: None,
            assigned_jobs: Vec::new(),
            jobs_started: 0,
            jobs_finished: 0,
            jobs_failed: 0,
            total_job_time_ms: 0,
        };

        inner.slaves.insert(
            slave_id.clone(),
            Arc::new(Mutex::new(SlaveEntry {
                info,
                reservations: HashMap::new(),
            })),
        );
        inner.by_hostname.insert(req.hostname.clone(), slave_id.clone());

        info!(
            slave_id = %slave_id,
            hostname = %req.hostname,
            cores = req.total_cores,
            memory = req.total_memory,
            "slave registrado"
        );

        Registration {
            slave_id,
            reregistered: false,
            orphaned_jobs: Vec::new(),
        }
    }

    /// Baja explícita. Devuelve los jobs que tenía reservados.
    pub fn deregister(&self, slave_id: &str) -> Result<Vec<JobId>> {
        let entry = {
            let mut inner = self.inner.write();
            let entry = inner
                .slaves
                .remove(slave_id)
                .ok_or_else(|| HiveError::UnknownSlave(slave_id.to_string()))?;
            inner.by_hostname.retain(|_, id| id.as_str() != slave_id);
            entry
        };

        // Marcarlo Offline hace que un reserve concurrente con un Arc viejo falle
        let mut e = entry.lock();
        e.info.state = SlaveState::Offline;
        let jobs = e.drain_reservations();
        info!(slave_id, orphaned = jobs.len(), "slave dado de baja");
        Ok(jobs)
    }

    /// Heartbeat de un slave vivo. Un slave marcado Offline tiene que re-registrarse.
    pub fn heartbeat(
        &self,
        slave_id: &str,
        free_cores: u32,
        free_memory: u64,
        cpu_utilization: f32,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let entry = self
            .entry(slave_id)
            .ok_or_else(|| HiveError::UnknownSlave(slave_id.to_string()))?;
        let mut e = entry.lock();

        if e.info.state == SlaveState::Offline {
            warn!(slave_id, "heartbeat tardío de un slave ya marcado offline, debe re-registrarse");
            return Err(HiveError::UnknownSlave(slave_id.to_string()));
        }

        e.info.last_heartbeat = now;
        e.info.cpu_utilization = cpu_utilization.clamp(0.0, 100.0);
        e.info.reported_free_cores = Some(free_cores);
        e.info.reported_free_memory = Some(free_memory);
        Ok(())
    }

    /// Descuenta recursos del slave para `job_id` si alcanzan. Sin efectos si no.
    pub fn reserve(&self, slave_id: &str, job_id: &str, cores: u32, memory: u64) -> bool {
        let Some(entry) = self.entry(slave_id) else {
            return false;
        };
        let mut e = entry.lock();

        if e.info.state == SlaveState::Offline {
            return false;
        }
        if e.reservations.contains_key(job_id) {
            warn!(slave_id, job_id, "el job ya tiene reserva en este slave");
            return false;
        }
        if e.info.free_cores < cores || e.info.free_memory < memory {
            return false;
        }

        e.info.free_cores -= cores;
        e.info.free_memory -= memory;
        e.reservations
            .insert(job_id.to_string(), Reserved { cores, memory });
        e.refresh_state();

        debug!(
            slave_id,
            job_id,
            cores,
            memory,
            free_cores = e.info.free_cores,
            "recursos reservados"
        );
        true
    }

    /// Devuelve los recursos de `job_id`. Satura en los totales; una liberación
    /// duplicada se registra como anomalía y no cambia nada.
    pub fn release(&self, slave_id: &str, job_id: &str, cores: u32, memory: u64) {
        let Some(entry) = self.entry(slave_id) else {
            warn!(slave_id, job_id, "liberación sobre un slave desconocido, ignorada");
            return;
        };
        let mut e = entry.lock();

        let Some(reserved) = e.reservations.remove(job_id) else {
            warn!(slave_id, job_id, cores, memory, "liberación duplicada, ignorada");
            return;
        };

        if reserved.cores != cores || reserved.memory != memory {
            warn!(
                slave_id,
                job_id,
                cores,
                memory,
                reserved_cores = reserved.cores,
                reserved_memory = reserved.memory,
                "liberación con cantidades distintas a la reserva, se usa la reserva"
            );
        }

        let cores_after = e.info.free_cores.saturating_add(reserved.cores);
        let memory_after = e.info.free_memory.saturating_add(reserved.memory);
        if cores_after > e.info.total_cores || memory_after > e.info.total_memory {
            warn!(slave_id, job_id, "liberación por encima de la capacidad total, saturando");
        }
        e.info.free_cores = cores_after.min(e.info.total_cores);
        e.info.free_memory = memory_after.min(e.info.total_memory);
        e.refresh_state();

        debug!(slave_id, job_id, free_cores = e.info.free_cores, "recursos liberados");
    }

    /// true si `job_id` sigue con reserva en `slave_id`.
    pub fn holds(&self, slave_id: &str, job_id: &str) -> bool {
        self.entry(slave_id)
            .map(|entry| entry.lock().reservations.contains_key(job_id))
            .unwrap_or(false)
    }

    /// Copia de los slaves vivos, de más a menos cores libres.
    pub fn list_available(&self) -> Vec<SlaveInfo> {
        let entries: Vec<Arc<Mutex<SlaveEntry>>> =
            self.inner.read().slaves.values().cloned().collect();

        let mut out: Vec<SlaveInfo> = entries
            .iter()
            .map(|entry| entry.lock().snapshot())
            .filter(|s| s.state != SlaveState::Offline)
            .collect();

        out.sort_by(|a, b| {
            b.free_cores
                .cmp(&a.free_cores)
                .then(b.free_memory.cmp(&a.free_memory))
                .then(a.id.cmp(&b.id))
        });
        out
    }

    /// Todos los slaves, incluidos los offline, ordenados por id.
    pub fn list_all(&self) -> Vec<SlaveInfo> {
        let entries: Vec<Arc<Mutex<SlaveEntry>>> =
            self.inner.read().slaves.values().cloned().collect();
        let mut out: Vec<SlaveInfo> = entries.iter().map(|e| e.lock().snapshot()).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn get(&self, slave_id: &str) -> Option<SlaveInfo> {
        self.entry(slave_id).map(|e| e.lock().snapshot())
    }

    /// Marca el slave como Offline y devuelve los jobs que tenía asignados.
    /// Llamarlo dos veces devuelve una lista vacía la segunda vez.
    pub fn mark_offline(&self, slave_id: &str) -> Result<Vec<JobId>> {
        let entry = self
            .entry(slave_id)
            .ok_or_else(|| HiveError::UnknownSlave(slave_id.to_string()))?;
        let mut e = entry.lock();

        if e.info.state == SlaveState::Offline {
            return Ok(Vec::new());
        }

        e.info.state = SlaveState::Offline;
        let jobs = e.drain_reservations();
        warn!(slave_id, orphaned = jobs.len(), "slave marcado OFFLINE");
        Ok(jobs)
    }

    /// Slaves vivos cuyo último heartbeat tiene más de `timeout`.
    pub fn stale_slaves(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> Vec<SlaveId> {
        let entries: Vec<Arc<Mutex<SlaveEntry>>> =
            self.inner.read().slaves.values().cloned().collect();

        entries
            .iter()
            .filter_map(|entry| {
                let e = entry.lock();
                let expired = e.info.state != SlaveState::Offline
                    && now.signed_duration_since(e.info.last_heartbeat) > timeout;
                expired.then(|| e.info.id.clone())
            })
            .collect()
    }

    /// Borra slaves que llevan Offline desde antes de `older_than`.
    pub fn purge_offline(&self, older_than: DateTime<Utc>) -> usize {
        let mut inner = self.inner.write();

        let to_remove: Vec<SlaveId> = inner
            .slaves
            .iter()
            .filter(|(_, entry)| {
                let e = entry.lock();
                e.info.state == SlaveState::Offline && e.info.last_heartbeat < older_than
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in &to_remove {
            inner.slaves.remove(id);
        }
        inner.by_hostname.retain(|_, id| !to_remove.contains(id));

        if !to_remove.is_empty() {
            info!(purged = to_remove.len(), "slaves offline purgados");
        }
        to_remove.len()
    }

    /// Un job confirmado en cálculo en este slave.
    pub fn record_job_started(&self, slave_id: &str) {
        if let Some(entry) = self.entry(slave_id) {
            entry.lock().info.jobs_started += 1;
        }
    }

    /// Métricas por slave al llegar el resultado de un job.
    pub fn record_job_outcome(&self, slave_id: &str, finished: bool, duration_ms: u64) {
        if let Some(entry) = self.entry(slave_id) {
            let mut e = entry.lock();
            e.info.total_job_time_ms += duration_ms;
            if finished {
                e.info.jobs_finished += 1;
            } else {
                e.info.jobs_failed += 1;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().slaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
