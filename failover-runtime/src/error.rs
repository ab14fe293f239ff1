use failover_core::ConfigError;
use std::sync::PoisonError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Test {0} is already running")]
    AlreadyRunning(Uuid),

    #[error("No test is running")]
    NotRunning,

    #[error("Mutex is poisoned.")]
    PoisonData,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
}

impl<T> From<PoisonError<T>> for RuntimeError {
    fn from(_err: PoisonError<T>) -> Self {
        Self::PoisonData
    }
}
