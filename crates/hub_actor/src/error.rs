use crate::state::ConnectionState;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid identity: {field} - {reason}")]
    InvalidIdentity { field: &'static str, reason: String },
    #[error("Illegal state transition from {from} to {to}")]
    IllegalTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
    #[error("Payload encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn invalid_identity(field: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidIdentity {
            field,
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
