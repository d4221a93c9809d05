use thiserror::Error;

/// Failure of a call to a downstream service, as seen by callers of
/// [`ServiceClient`](crate::ServiceClient).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    /// The call did not answer within its timeout.
    #[error("call timed out")]
    Timeout,

    /// No instance could be reached (connection refused, 5xx, nothing
    /// registered).
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// The service answered and refused the request (4xx).
    #[error("request rejected with status {code}: {message}")]
    RemoteRejected { code: u16, message: String },

    /// The service's circuit breaker is open; no call was made.
    #[error("circuit breaker open")]
    CircuitOpen,
}

impl ServiceError {
    /// Returns true if retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ServiceError::RemoteRejected { .. })
    }

    /// Returns the HTTP-style status code of a rejection.
    pub fn rejection_code(&self) -> Option<u16> {
        match self {
            ServiceError::RemoteRejected { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Short label for metrics and logs.
    pub fn outcome(&self) -> &'static str {
        match self {
            ServiceError::Timeout => "timeout",
            ServiceError::Unavailable(_) => "unavailable",
            ServiceError::RemoteRejected { .. } => "rejected",
            ServiceError::CircuitOpen => "circuit_open",
        }
    }
}

/// Errors raised by a [`Transport`](crate::Transport) for a single request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("status {code}: {body}")]
    Status { code: u16, body: String },

    #[error("invalid response body: {0}")]
    InvalidBody(String),
}

impl From<TransportError> for ServiceError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => ServiceError::Timeout,
            TransportError::Status { code, body } if (400..500).contains(&code) => {
                ServiceError::RemoteRejected {
                    code,
                    message: body,
                }
            }
            TransportError::Status { code, body } => {
                ServiceError::Unavailable(format!("status {code}: {body}"))
            }
            TransportError::Connection(reason) | TransportError::InvalidBody(reason) => {
                ServiceError::Unavailable(reason)
            }
        }
    }
}

/// Errors raised while resolving a service name to an address.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no healthy instance of {0}")]
    NoHealthyInstance(String),

    #[error("registry lookup for {service} failed: {reason}")]
    Lookup { service: String, reason: String },
}
