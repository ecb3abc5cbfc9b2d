use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("stereo source not found: {0}")]
    NotFound(String),
    #[error("invalid calibration: {0}")]
    Calibration(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("buffer size mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("sensor not started")]
    NotStarted,
    #[error("config error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("backend error: {0}")]
    Backend(String),
}
