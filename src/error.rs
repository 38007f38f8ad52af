use thiserror::Error;

/// Result type for relay pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors that can occur while building or running a pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Pipeline has already been started
    #[error("Pipeline has already been started")]
    AlreadyStarted,

    /// Pipeline has not been started yet
    #[error("Pipeline has not been started")]
    NotStarted,

    /// Pipeline was stopped and cannot be used again
    #[error("Pipeline has already been stopped")]
    AlreadyStopped,

    /// No stages in pipeline
    #[error("Cannot build a pipeline with no stages")]
    NoStages,

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Stage execution error
    #[error("Stage execution failed: {0}")]
    StageError(String),

    /// Thread spawn or join error
    #[error("Thread error: {0}")]
    ThreadError(String),

    /// Fork, signal or wait error on a stage process
    #[error("Process error: {0}")]
    ProcessError(String),

    /// Shutdown error
    #[error("Pipeline shutdown error: {0}")]
    ShutdownError(String),

    /// Mapping or synchronising process-shared memory failed
    #[error("Shared memory error: {0}")]
    SharedMemory(String),

    /// Payload could not be encoded or decoded for a process-shared buffer
    #[error("Payload codec error: {0}")]
    Codec(String),

    /// Encoded payload does not fit into a process-shared slot
    #[error("Encoded payload of {size} bytes exceeds slot size of {slot_size} bytes")]
    PayloadTooLarge { size: usize, slot_size: usize },
}

impl From<bincode::Error> for PipelineError {
    fn from(err: bincode::Error) -> Self {
        PipelineError::Codec(err.to_string())
    }
}

impl From<nix::Error> for PipelineError {
    fn from(err: nix::Error) -> Self {
        PipelineError::ProcessError(err.to_string())
    }
}
