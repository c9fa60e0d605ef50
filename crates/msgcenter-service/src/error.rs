/// Errors surfaced by the message-center service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    Validation(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("not connected")]
    NotConnected,

    #[error("no account has been connected yet")]
    MissingAccount,

    #[error("operation cancelled")]
    Cancelled,

    #[error("store error: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// Transient failures that the retry executor may try again after a
    /// reconnect.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_) | Error::NotConnected)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Network(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
