//! Domain error kinds and their HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Errors surfaced by drivers, supervisors and the command dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// Schema violation, bad operator, bad XPath. Returned to the caller and
    /// not logged at error level.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// A helper child exited during its grace period. Carries the tail of the
    /// helper's log.
    #[error("helper failed to spawn: {0}")]
    HelperSpawnFailure(String),

    /// `/status` not ready within bound, or an RPC call exceeded its deadline.
    #[error("helper timed out: {0}")]
    HelperTimeout(String),

    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("hierarchy parse error: {0}")]
    ParseError(String),

    #[error("stream upstream closed: {0}")]
    StreamUpstreamClosed(String),

    #[error("command not implemented: {0}")]
    NotImplemented(String),

    /// Unrecoverable supervisor invariant. Logged; closes the device's
    /// supervisor without taking down the process.
    #[error("fatal supervisor error: {0}")]
    Fatal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DriverError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            DriverError::InvalidArgument(_) => StatusCode::UNPROCESSABLE_ENTITY,
            DriverError::DeviceNotFound(_) => StatusCode::NOT_FOUND,
            DriverError::ElementNotFound(_) => StatusCode::NOT_FOUND,
            DriverError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            DriverError::HelperTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for DriverError {
    fn into_response(self) -> Response {
        match &self {
            DriverError::InvalidArgument(_) | DriverError::ElementNotFound(_) => {
                log::debug!("request error: {}", self)
            }
            other => log::error!("request error: {}", other),
        }
        (self.status_code(), self.to_string()).into_response()
    }
}

pub type Result<T, E = DriverError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            DriverError::DeviceNotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            DriverError::InvalidArgument("x".into()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            DriverError::NotImplemented("x".into()).status_code(),
            StatusCode::NOT_IMPLEMENTED
        );
    }
}
