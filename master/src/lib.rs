//! Núcleo del master de Hive: registro de slaves, cola de jobs, planificación,
//! detección de slaves caídos, estadísticas y mantenimiento.

pub mod config;
pub mod error;
pub mod handlers;
pub mod janitor;
pub mod monitor;
pub mod registry;
pub mod scheduler;
pub mod state;
pub mod statistics;
pub mod store;
pub mod transport;

pub use config::{HiveConfig, PlacementPolicy};
pub use error::{HiveError, Result};
pub use state::AppState;

use std::sync::Arc;

use crate::{
    janitor::Janitor, monitor::HeartbeatMonitor, registry::SlaveRegistry, scheduler::Scheduler,
    statistics::StatisticsAggregator,
    store::{JobStore, StatisticsStore},
    transport::Dispatcher,
};

/// Todos los componentes cableados sobre un mismo store (jobs, limpieza y
/// estadísticas).
pub struct Hive {
    pub state: AppState,
    pub monitor: Arc<HeartbeatMonitor>,
}

impl Hive {
    pub fn new<S>(config: &HiveConfig, store: Arc<S>, dispatcher: Arc<dyn Dispatcher>) -> Self
    where
        S: JobStore + StatisticsStore + 'static,
    {
        let registry = Arc::new(SlaveRegistry::new());
        let scheduler = Arc::new(Scheduler::new(
            registry.clone(),
            store.clone(),
            dispatcher,
            config,
        ));
        let statistics = Arc::new(StatisticsAggregator::new(
            registry.clone(),
            store.clone(),
            store.clone(),
        ));
        let janitor = Arc::new(Janitor::new(
            registry.clone(),
            store.clone(),
            store.clone(),
            statistics.clone(),
            config,
        ));
        let monitor = Arc::new(HeartbeatMonitor::new(
            registry.clone(),
            scheduler.clone(),
            config,
        ));

        Self {
            state: AppState {
                registry,
                jobs: store,
                scheduler,
                statistics,
                janitor,
            },
            monitor,
        }
    }
}
