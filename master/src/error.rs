use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use common::{JobId, SlaveId};

#[derive(Error, Debug)]
pub enum HiveError {
    #[error("slave desconocido: {0}")]
    UnknownSlave(SlaveId),

    #[error("job no encontrado: {0}")]
    JobNotFound(JobId),

    #[error("requisitos de recursos inválidos: cores={cores}, memory={memory}")]
    InvalidResourceRequirement { cores: u32, memory: u64 },

    #[error("error de almacenamiento: {0}")]
    Storage(String),

    #[error("error de transporte hacia {slave_id}: {reason}")]
    Transport { slave_id: SlaveId, reason: String },

    #[error("configuración inválida: {0}")]
    Config(String),
}

impl HiveError {
    /// Errores de infraestructura que la operación de origen puede reintentar.
    pub fn is_transient(&self) -> bool {
        matches!(self, HiveError::Storage(_) | HiveError::Transport { .. })
    }

    fn status_code(&self) -> StatusCode {
        match self {
            HiveError::UnknownSlave(_) | HiveError::JobNotFound(_) => StatusCode::NOT_FOUND,
            HiveError::InvalidResourceRequirement { .. } => StatusCode::BAD_REQUEST,
            HiveError::Storage(_) | HiveError::Transport { .. } => StatusCode::SERVICE_UNAVAILABLE,
            HiveError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for HiveError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type Result<T> = std::result::Result<T, HiveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clasifica_errores_transitorios() {
        assert!(HiveError::Storage("timeout".into()).is_transient());
        assert!(HiveError::Transport {
            slave_id: "s1".into(),
            reason: "conexión rechazada".into()
        }
        .is_transient());
        assert!(!HiveError::UnknownSlave("s1".into()).is_transient());
        assert!(!HiveError::JobNotFound("j1".into()).is_transient());
    }

    #[test]
    fn mapea_errores_a_status_http() {
        assert_eq!(
            HiveError::UnknownSlave("s".into()).into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            HiveError::InvalidResourceRequirement { cores: 0, memory: 1 }
                .into_response()
                .status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            HiveError::Storage("caído".into()).into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
