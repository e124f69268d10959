use reqwest::Method;

/// Error type returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum ObsError {
    /// Missing or inconsistent credentials, detected before any network activity.
    #[error("configuration error: {0}")]
    Config(String),
    /// Terminal HTTP error status returned by the build service.
    #[error("error talking to OBS: {method} {route} returned {status}: {message}")]
    Http {
        /// HTTP status code of the last response.
        status: u16,
        /// Reason phrase, followed by the response body when it is not empty.
        message: String,
        /// Method of the originating request.
        method: Method,
        /// Route of the originating request, relative to the API URL.
        route: String,
    },
    /// Every attempt of a request ran into the per-attempt timeout.
    #[error("{method} {route} timed out after {attempts} attempt(s)")]
    Timeout {
        method: Method,
        route: String,
        attempts: usize,
    },
    /// Network failure other than a timeout (connection refused, TLS, ...).
    #[error("transport error during {method} {route}: {source}")]
    Transport {
        method: Method,
        route: String,
        #[source]
        source: reqwest::Error,
    },
    /// The SSH signing capability failed or produced unusable output.
    #[error("ssh signing failed: {0}")]
    Signing(String),
    /// The request could not be encoded (bad header value, bad base URL).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ObsError {
    /// HTTP status of the failing response, if the failure was an HTTP error.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Method of the request that failed, when the failure is tied to a request.
    pub fn method(&self) -> Option<&Method> {
        match self {
            Self::Http { method, .. }
            | Self::Timeout { method, .. }
            | Self::Transport { method, .. } => Some(method),
            _ => None,
        }
    }

    /// Route of the request that failed, when the failure is tied to a request.
    pub fn route(&self) -> Option<&str> {
        match self {
            Self::Http { route, .. } | Self::Timeout { route, .. } | Self::Transport { route, .. } => {
                Some(route)
            }
            _ => None,
        }
    }

    /// `true` for a 404 response; many callers treat this as "resource absent".
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// True when every attempt of the request timed out.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
