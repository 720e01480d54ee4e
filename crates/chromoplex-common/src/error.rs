use thiserror::Error;

/// Pipeline-wide error taxonomy.
///
/// Fatal-at-startup conditions are `Config`; per-task failures surface as
/// `Kernel` or `Assignment`; `Convergence` carries the dedicated exit status
/// when the optimization loop exhausts its iteration budget.
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("kernel failure: {0}")]
    Kernel(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed data file: {0}")]
    DataFormat(String),

    #[error("assignment error: {0}")]
    Assignment(String),

    #[error("no convergence after {iterations} iterations (violation score {score})")]
    Convergence { iterations: u32, score: f64 },

    #[error("parallel controller error: {0}")]
    Parallel(String),

    #[error("step log error: {0}")]
    StepLog(String),

    #[error("step '{step}' failed: {traceback}")]
    StepFailed { step: String, traceback: String },

    #[error("interrupted")]
    Interrupted,

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
