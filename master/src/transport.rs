use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use common::{JobDispatchRequest, JobDispatchResponse, JobInfo, SlaveInfo};

use crate::error::{HiveError, Result};

/// Frontera con la capa de transporte: entregar un job a un slave y avisarle
/// de una cancelación. `Ok(())` en `dispatch` es el ack del slave.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, slave: &SlaveInfo, job: &JobInfo, payload: Arc<Vec<u8>>)
        -> Result<()>;

    async fn abort(&self, slave: &SlaveInfo, job_id: &str) -> Result<()>;
}

/// Empuja jobs a los slaves por HTTP/JSON (`POST {endpoint}/api/v1/dispatch`).
#[derive(Clone)]
pub struct HttpDispatcher {
    client: Client,
}

impl HttpDispatcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HiveError::Config(format!("no se pudo crear el cliente HTTP: {e}")))?;
        Ok(Self { client })
    }

    fn transport_err(slave: &SlaveInfo, reason: impl ToString) -> HiveError {
        HiveError::Transport {
            slave_id: slave.id.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn dispatch(
        &self,
        slave: &SlaveInfo,
        job: &JobInfo,
        payload: Arc<Vec<u8>>,
    ) -> Result<()> {
        let url = format!("{}/api/v1/dispatch", slave.endpoint.trim_end_matches('/'));
        let req = JobDispatchRequest {
            job_id: job.id.clone(),
            attempt: job.attempt_count,
            required_cores: job.required_cores,
            required_memory: job.required_memory,
            payload: payload.as_ref().clone(),
        };

        debug!(job_id = %job.id, slave_id = %slave.id, %url, "enviando job al slave");

        let resp = self
            .client
            .post(&url)
            .json(&req)
            .send()
            .await
            .map_err(|e| Self::transport_err(slave, e))?;

        if !resp.status().is_success() {
            return Err(Self::transport_err(
                slave,
                format!("el slave respondió {}", resp.status()),
            ));
        }

        let ack: JobDispatchResponse = resp
            .json()
            .await
            .map_err(|e| Self::transport_err(slave, e))?;
        if !ack.accepted {
            return Err(Self::transport_err(slave, "el slave rechazó el job"));
        }
        Ok(())
    }

    async fn abort(&self, slave: &SlaveInfo, job_id: &str) -> Result<()> {
        let url = format!(
            "{}/api/v1/jobs/{}/abort",
            slave.endpoint.trim_end_matches('/'),
            job_id
        );
        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| Self::transport_err(slave, e))?;

        if !resp.status().is_success() {
            return Err(Self::transport_err(
                slave,
                format!("abort respondió {}", resp.status()),
            ));
        }
        Ok(())
    }
}
