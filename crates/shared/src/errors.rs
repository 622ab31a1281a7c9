use std::fmt;

/// Failure kinds the broker and the edge have to tell apart. Everything else
/// travels as a plain `anyhow::Error`; callers recover the kind with
/// `err.downcast_ref::<CoreError>()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    KeyIdNotFound,
    FailedToConnect,
    TooManyRequests,
    ProtocolError(String),
    AuthFailed,
    DuplicateTokenId,
    TokenNotFound,
    FailedToGenerateUniqueToken,
    Cancelled,
}

impl std::error::Error for CoreError {}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::KeyIdNotFound => write!(f, "key id not found"),
            CoreError::FailedToConnect => write!(f, "failed to connect"),
            CoreError::TooManyRequests => write!(f, "too many requests"),
            CoreError::ProtocolError(message) => write!(f, "protocol error: {}", message),
            CoreError::AuthFailed => write!(f, "authentication failed"),
            CoreError::DuplicateTokenId => write!(f, "token id already exists"),
            CoreError::TokenNotFound => write!(f, "token not found"),
            CoreError::FailedToGenerateUniqueToken => {
                write!(f, "failed to generate an unique token id")
            }
            CoreError::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// True when `err` is a `CoreError` of the given kind.
pub fn is_core_error(err: &anyhow::Error, kind: &CoreError) -> bool {
    err.downcast_ref::<CoreError>() == Some(kind)
}
