use tonic::Status;

/// Crate-wide error type for everything that can reach the RPC boundary.
///
/// Each variant corresponds to one of the error kinds in the control
/// plane's error taxonomy; `into_status` is the single place that decides
/// the gRPC status code a caller sees.
#[derive(Debug, thiserror::Error)]
#[allow(dead_code)]
pub enum GatewayError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("readiness timeout waiting for session to become ready")]
    ReadinessTimeout,

    #[error("session failed: reason={reason} message={message}")]
    SessionFailed { reason: String, message: String },

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Credential(#[from] crate::credentials::CredentialError),

    #[error(transparent)]
    Registry(#[from] crate::registry::RegistryError),

    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    pub fn into_status(self) -> Status {
        match self {
            Self::NotFound(msg) => Status::not_found(msg),
            Self::BadRequest(msg) => Status::invalid_argument(msg),
            Self::ReadinessTimeout => Status::deadline_exceeded(self.to_string()),
            Self::SessionFailed { reason, message } => {
                Status::failed_precondition(format!("reason={reason} message={message}"))
            }
            Self::Unavailable(msg) => Status::unavailable(msg),
            Self::Registry(crate::registry::RegistryError::NotFound) => {
                Status::not_found("session not found")
            }
            Self::Credential(err) => Status::unauthenticated(err.to_string()),
            Self::Registry(err) => {
                tracing::error!(error = %err, "registry error");
                Status::internal("registry error")
            }
            Self::Kube(err) => {
                tracing::error!(error = %err, "kubernetes error");
                Status::internal("kubernetes error")
            }
            Self::Internal(err) => {
                tracing::error!(error = %err, "internal error");
                Status::internal("internal error")
            }
        }
    }
}

impl From<GatewayError> for Status {
    fn from(err: GatewayError) -> Self {
        err.into_status()
    }
}

impl From<fred::error::Error> for GatewayError {
    fn from(err: fred::error::Error) -> Self {
        tracing::error!(error = %err, "valkey error");
        Self::Unavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_status_not_found() {
        let status: Status = GatewayError::NotFound("session".into()).into();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }

    #[test]
    fn readiness_timeout_maps_to_deadline_exceeded() {
        let status: Status = GatewayError::ReadinessTimeout.into();
        assert_eq!(status.code(), tonic::Code::DeadlineExceeded);
    }

    #[test]
    fn session_failed_carries_reason_in_message() {
        let status: Status = GatewayError::SessionFailed {
            reason: "NoWarmPod".into(),
            message: "no ready pod matched profile".into(),
        }
        .into();
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);
        assert!(status.message().contains("NoWarmPod"));
    }

    #[test]
    fn registry_not_found_maps_to_not_found() {
        let status: Status =
            GatewayError::Registry(crate::registry::RegistryError::NotFound).into();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }
}
