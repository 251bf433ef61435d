use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Checkpoint {0} has not been recorded")]
    InvalidCheckpoint(i32),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to spawn worker thread: {0}")]
    WorkerSpawn(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ExecError>;
