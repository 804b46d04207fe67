use std::fmt;
use thiserror::Error;
use tokio::time::Duration;

#[derive(Error, Debug)]
pub enum StdError {
    #[error("JsonSerializationError: {0}")]
    JsonSerializationError(#[source] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("MetadataMissing: {0}")]
    MetadataMissing(String),

    #[error("InvalidArgument: {0}")]
    InvalidArgument(String),

    #[error("ValidationError: {0}")]
    ValidationError(String),

    #[error("{kind} {namespace}/{name} already exists and is not managed by Cluster")]
    OwnershipConflict {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("UnsupportedDowngrade: cannot downgrade MySQL from {current} to {desired}")]
    UnsupportedDowngrade { current: String, desired: String },

    #[error("TopologyError: {0}")]
    TopologyError(String),

    #[error("NoMemberAvailable: {0}")]
    NoMemberAvailable(String),
}

impl StdError {
    pub fn metric_label(&self) -> String {
        let label = match self {
            StdError::JsonSerializationError(_) => "json_serialization",
            StdError::KubeError(_) => "kube",
            StdError::MetadataMissing(_) => "metadata_missing",
            StdError::InvalidArgument(_) => "invalid_argument",
            StdError::ValidationError(_) => "validation",
            StdError::OwnershipConflict { .. } => "ownership_conflict",
            StdError::UnsupportedDowngrade { .. } => "unsupported_downgrade",
            StdError::TopologyError(_) => "topology",
            StdError::NoMemberAvailable(_) => "no_member",
        };
        label.to_string()
    }

    fn api_error(&self) -> Option<&kube::core::ErrorResponse> {
        match self {
            StdError::KubeError(kube::Error::Api(e)) => Some(e),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub struct ErrorWithRequeue {
    pub duration: Duration,
    pub error: StdError,
}

impl ErrorWithRequeue {
    pub fn new(error: StdError, duration: Duration) -> ErrorWithRequeue {
        ErrorWithRequeue { error, duration }
    }

    pub fn metric_label(&self) -> String {
        self.error.metric_label()
    }
}

impl fmt::Display for ErrorWithRequeue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} (requeue in {:?})", self.error, self.duration)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Standard Error: {0}")]
    StdError(#[source] StdError),

    #[error("Error With Requeue: {0}")]
    ErrorWithRequeue(#[source] ErrorWithRequeue),
}

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::StdError(e) => e.metric_label(),
            Error::ErrorWithRequeue(e) => e.metric_label(),
        }
    }

    fn inner(&self) -> &StdError {
        match self {
            Error::StdError(e) => e,
            Error::ErrorWithRequeue(e) => &e.error,
        }
    }

    /// The object does not exist on the API server.
    pub fn is_not_found(&self) -> bool {
        self.inner().api_error().is_some_and(|e| e.code == 404)
    }

    /// The write lost an optimistic-concurrency race on resourceVersion.
    pub fn is_conflict(&self) -> bool {
        self.inner()
            .api_error()
            .is_some_and(|e| e.code == 409 && e.reason == "Conflict")
    }

    /// A create hit an object that is already there.
    pub fn is_already_exists(&self) -> bool {
        self.inner()
            .api_error()
            .is_some_and(|e| e.code == 409 && e.reason == "AlreadyExists")
    }
}

impl From<StdError> for Error {
    fn from(e: StdError) -> Self {
        Error::StdError(e)
    }
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        Error::StdError(StdError::KubeError(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::StdError(StdError::JsonSerializationError(e))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> Error {
    Error::StdError(StdError::KubeError(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{reason} from test"),
        reason: reason.to_string(),
        code,
    })))
}
