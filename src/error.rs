use std::io;
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, Error>;

/// All errors this crate can produce.
///
/// The type is `Clone` because the PBF pipeline records the framer thread's
/// terminal status in a shared cell and re-raises it on every subsequent
/// consumer call. `Io` wraps the underlying error in an `Arc` for the same
/// reason.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("id {0} not found")]
    NotFound(u64),
    #[error("{0}")]
    MapFactory(String),
    #[error("OPL error: {message} on line {line} column {column}")]
    Opl {
        message: String,
        line: u64,
        column: u64,
    },
    #[error("PBF format error: {0}")]
    Pbf(String),
    #[error("invalid location: {0}")]
    InvalidLocation(String),
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl Error {
    pub(crate) fn opl(message: impl Into<String>, column: usize) -> Self {
        Error::Opl {
            message: message.into(),
            line: 0,
            column: column as u64,
        }
    }

    pub(crate) fn pbf(message: impl Into<String>) -> Self {
        Error::Pbf(message.into())
    }
}
