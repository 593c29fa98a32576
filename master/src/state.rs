// master/src/state.rs

use std::sync::Arc;

use crate::{
    janitor::Janitor, registry::SlaveRegistry, scheduler::Scheduler,
    statistics::StatisticsAggregator, store::JobStore,
};

/// Lo que ven los handlers HTTP: cada componente por su interfaz estrecha.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SlaveRegistry>,
    pub jobs: Arc<dyn JobStore>,
    pub scheduler: Arc<Scheduler>,
    pub statistics: Arc<StatisticsAggregator>,
    pub janitor: Arc<Janitor>,
}
