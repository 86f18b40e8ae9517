use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{service} has no {resource}")]
    NotFound {
        service: &'static str,
        resource: String,
    },

    #[error("invalid response from {0}")]
    InvalidResponse(&'static str),

    #[error("{0} unavailable")]
    Unavailable(&'static str),
}

impl ClientError {
    /// Timeouts, connection failures and 5xx: the collaborator, not the
    /// caller, is at fault.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().map(|s| s.is_server_error()).unwrap_or(false)
            }
            ClientError::Unavailable(_) => true,
            _ => false,
        }
    }
}
