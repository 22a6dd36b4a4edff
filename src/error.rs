use kube::error::ErrorResponse;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// A namespace rule could not be compiled. Requires user correction.
    #[error("invalid namespace rule: {0}")]
    InvalidRule(String),

    #[error("invalid ClusterSecret spec: {0}")]
    InvalidSpec(String),

    /// Rate limiting, timeouts and optimistic-concurrency conflicts.
    #[error("transient API error: {0}")]
    Transient(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error(
        "secret '{name}' in namespace '{namespace}' is owned by {}",
        owner.as_deref().unwrap_or("nobody")
    )]
    OwnershipConflict {
        namespace: String,
        name: String,
        owner: Option<String>,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("source secret '{namespace}/{name}' is unavailable")]
    SourceUnavailable { namespace: String, name: String },

    #[error("kubernetes API error: {0}")]
    Kube(#[source] kube::Error),
}

impl Error {
    /// Whether the failure is worth retrying within the current reconcile cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// Configuration errors are surfaced on the source and never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::InvalidRule(_) | Error::InvalidSpec(_))
    }
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ErrorResponse {
                code, reason, message, ..
            }) => match code {
                404 => Error::NotFound(message),
                409 if reason == "AlreadyExists" => Error::AlreadyExists(message),
                401 | 403 => Error::Forbidden(message),
                409 | 429 | 500 | 502 | 503 | 504 => Error::Transient(message),
                _ => Error::Kube(kube::Error::Api(ErrorResponse {
                    status: "Failure".to_owned(),
                    message,
                    reason,
                    code,
                })),
            },
            kube::Error::HyperError(e) => Error::Transient(e.to_string()),
            kube::Error::Service(e) => Error::Transient(e.to_string()),
            e => Error::Kube(e),
        }
    }
}
