//! DSE error types.
//!
//! Every variant belongs to one [`ErrorKind`] of the error taxonomy. The
//! variant name ([`DseError::code`]) is stable: it travels over RPC so that a
//! caller can rebuild the exact error raised by a remote handler.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::TransportError;

pub type DseResult<T> = Result<T, DseError>;

/// Taxonomy bucket of a [`DseError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input detected before persistence; never retried.
    Configuration,
    Conflict,
    NotFound,
    /// Infrastructure failure; logged, compensated where defined, re-raised.
    TransientInfrastructure,
    /// Illegal Node/Service lifecycle ordering by the caller.
    LifecycleMisuse,
    /// Timeout, delivery failure or protocol mismatch on the transport.
    Transport,
    /// A remote handler failed with an error this node does not recognise.
    Remote,
}

#[derive(Debug, Error)]
pub enum DseError {
    #[error("Invalid driver: {0}")]
    InvalidDriver(String),

    #[error("Invalid config options for driver: {0}")]
    InvalidDriverOption(String),

    #[error("Missing required config options: {0}")]
    MissingRequiredConfigOptions(String),

    #[error("Bad configuration: {0}")]
    BadConfig(String),

    #[error("Invalid datasource name: '{0}'")]
    InvalidDatasourceName(String),

    #[error("Datasource name already in use: {0}")]
    DatasourceNameInUse(String),

    #[error("Datasource not found: {0}")]
    DatasourceNotFound(String),

    #[error("Driver not found: {0}")]
    DriverNotFound(String),

    #[error("Datasource creation failed: {0}")]
    DatasourceCreationError(String),

    #[error("Data service error: {0}")]
    DataServiceError(String),

    /// A service with this id is already running on the node.
    #[error("Service already exists: {0}")]
    ServiceAlreadyExists(String),

    #[error("Lifecycle violation: {0}")]
    Lifecycle(String),

    #[error("Invalid RPC arguments: {0}")]
    InvalidArguments(String),

    #[error("Unsupported RPC method: {0}")]
    UnsupportedMethod(String),

    #[error("Remote error {code}: {message}")]
    Remote { code: String, message: String },

    #[error(transparent)]
    Transport(TransportError),
}

impl DseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidDriver(_)
            | Self::InvalidDriverOption(_)
            | Self::MissingRequiredConfigOptions(_)
            | Self::BadConfig(_)
            | Self::InvalidDatasourceName(_)
            | Self::InvalidArguments(_)
            | Self::UnsupportedMethod(_) => ErrorKind::Configuration,
            Self::DatasourceNameInUse(_) | Self::ServiceAlreadyExists(_) => ErrorKind::Conflict,
            Self::DatasourceNotFound(_) | Self::DriverNotFound(_) => ErrorKind::NotFound,
            Self::DatasourceCreationError(_) | Self::DataServiceError(_) => {
                ErrorKind::TransientInfrastructure
            }
            Self::Lifecycle(_) => ErrorKind::LifecycleMisuse,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Remote { .. } => ErrorKind::Remote,
        }
    }

    /// Stable name of the variant, used on the wire and by the API layer.
    pub fn code(&self) -> &str {
        match self {
            Self::InvalidDriver(_) => "InvalidDriver",
            Self::InvalidDriverOption(_) => "InvalidDriverOption",
            Self::MissingRequiredConfigOptions(_) => "MissingRequiredConfigOptions",
            Self::BadConfig(_) => "BadConfig",
            Self::InvalidDatasourceName(_) => "InvalidDatasourceName",
            Self::DatasourceNameInUse(_) => "DatasourceNameInUse",
            Self::DatasourceNotFound(_) => "DatasourceNotFound",
            Self::DriverNotFound(_) => "DriverNotFound",
            Self::DatasourceCreationError(_) => "DatasourceCreationError",
            Self::DataServiceError(_) => "DataServiceError",
            Self::ServiceAlreadyExists(_) => "ServiceAlreadyExists",
            Self::Lifecycle(_) => "LifecycleViolation",
            Self::InvalidArguments(_) => "InvalidArguments",
            Self::UnsupportedMethod(_) => "UnsupportedMethod",
            Self::Remote { code, .. } => code,
            Self::Transport(e) => e.code(),
        }
    }

    /// Payload of the variant without the display prefix.
    pub fn detail(&self) -> String {
        match self {
            Self::InvalidDriver(s)
            | Self::InvalidDriverOption(s)
            | Self::MissingRequiredConfigOptions(s)
            | Self::BadConfig(s)
            | Self::InvalidDatasourceName(s)
            | Self::DatasourceNameInUse(s)
            | Self::DatasourceNotFound(s)
            | Self::DriverNotFound(s)
            | Self::DatasourceCreationError(s)
            | Self::DataServiceError(s)
            | Self::ServiceAlreadyExists(s)
            | Self::Lifecycle(s)
            | Self::InvalidArguments(s)
            | Self::UnsupportedMethod(s) => s.clone(),
            Self::Remote { message, .. } => message.clone(),
            Self::Transport(e) => e.to_string(),
        }
    }

    /// Rebuild an error raised by a remote handler from its wire form.
    pub fn from_remote(code: &str, message: String) -> Self {
        match code {
            "InvalidDriver" => Self::InvalidDriver(message),
            "InvalidDriverOption" => Self::InvalidDriverOption(message),
            "MissingRequiredConfigOptions" => Self::MissingRequiredConfigOptions(message),
            "BadConfig" => Self::BadConfig(message),
            "InvalidDatasourceName" => Self::InvalidDatasourceName(message),
            "DatasourceNameInUse" => Self::DatasourceNameInUse(message),
            "DatasourceNotFound" => Self::DatasourceNotFound(message),
            "DriverNotFound" => Self::DriverNotFound(message),
            "DatasourceCreationError" => Self::DatasourceCreationError(message),
            "DataServiceError" => Self::DataServiceError(message),
            "ServiceAlreadyExists" => Self::ServiceAlreadyExists(message),
            "InvalidArguments" => Self::InvalidArguments(message),
            "UnsupportedMethod" => Self::UnsupportedMethod(message),
            _ => Self::Remote {
                code: code.to_string(),
                message,
            },
        }
    }

    /// True for the "service already exists" outcome that reconciliation
    /// treats as an idempotent success.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::ServiceAlreadyExists(_))
    }
}

impl From<TransportError> for DseError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Remote { code, message } => Self::from_remote(&code, message),
            other => Self::Transport(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn taxonomy_buckets() {
        assert_eq!(
            DseError::InvalidDriverOption("c".into()).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            DseError::DatasourceNameInUse("x".into()).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            DseError::DriverNotFound("d".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            DseError::DataServiceError("sync".into()).kind(),
            ErrorKind::TransientInfrastructure
        );
        assert_eq!(
            DseError::Lifecycle("started".into()).kind(),
            ErrorKind::LifecycleMisuse
        );
    }

    #[test]
    fn remote_errors_keep_their_variant() {
        let original = DseError::DatasourceNameInUse("x".into());
        let transported = TransportError::Remote {
            code: original.code().to_string(),
            message: original.detail(),
        };

        let rebuilt = DseError::from(transported);
        assert!(matches!(rebuilt, DseError::DatasourceNameInUse(ref n) if n == "x"));
        assert_eq!(rebuilt.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn unknown_remote_codes_stay_remote() {
        let rebuilt = DseError::from_remote("KeyError", "boom".into());
        assert_eq!(rebuilt.kind(), ErrorKind::Remote);
        assert_eq!(rebuilt.code(), "KeyError");
    }

    #[test]
    fn transport_failures_are_distinct() {
        let err = DseError::from(TransportError::Timeout {
            target: "congress-control.n1".into(),
            method: "get_status".into(),
            timeout: Duration::from_millis(10),
        });
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(err.code(), "MessagingTimeout");
    }
}
