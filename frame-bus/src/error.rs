use thiserror::Error;

pub type Result<T> = std::result::Result<T, StreamError>;

/// Every failure a consumer of the bus can observe.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Invalid buffer size or a misuse of the lifecycle (e.g. initializing twice).
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("unsupported stream: {0}")]
    UnsupportedStream(String),
    #[error("pipeline is not initialized")]
    NotInitialized,
    #[error("pipeline is already running")]
    AlreadyRunning,
    /// The relative index is outside the retained window.
    #[error("relative index {index} is out of range (capacity {capacity}, retained {retained})")]
    OutOfRange {
        index: i32,
        capacity: usize,
        retained: usize,
    },
    /// The frame at this index has not been decoded yet; retry shortly.
    #[error("frame at relative index {0} is not ready")]
    NotReady(i32),
    #[error("conversion failed: {0:#}")]
    ConversionFailed(anyhow::Error),
    #[error("decode failed after {attempts} consecutive errors: {last}")]
    DecodeFatal { attempts: u32, last: String },
    #[error("pipeline is closed")]
    PipelineClosed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StreamError {
    /// Whether retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StreamError::NotReady(_))
    }
}
