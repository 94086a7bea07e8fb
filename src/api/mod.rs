//! API model services.
//!
//! Models sit between an HTTP layer (not part of this crate) and the DSE:
//! they forward requests over RPC and translate failures into stable
//! [`ApiError`] responses.

mod datasource_model;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use datasource_model::{DatasourceModel, DATASOURCE_MODEL_SERVICE_ID};

use crate::error::{DseError, ErrorKind};

/// Structured error response for one failed API request.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{status} {error_code}: {message}")]
pub struct ApiError {
    pub status: u16,
    pub error_code: String,
    pub message: String,
}

impl From<DseError> for ApiError {
    fn from(e: DseError) -> Self {
        let status = match e.kind() {
            ErrorKind::Configuration => 400,
            ErrorKind::Conflict => 409,
            ErrorKind::NotFound => 404,
            ErrorKind::TransientInfrastructure | ErrorKind::Transport => 503,
            ErrorKind::LifecycleMisuse | ErrorKind::Remote => 500,
        };
        Self {
            status,
            error_code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
