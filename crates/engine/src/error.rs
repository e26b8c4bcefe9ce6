use liboverride_core::CoreError;
use liboverride_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("entity cannot be overridden: {0}")]
    NotOverridable(String),

    #[error("entity is not a library override: {0}")]
    NotAnOverride(String),

    #[error("entity already carries override data: {0}")]
    AlreadyOverridden(String),

    #[error("override creation failed: {0}")]
    CreationFailed(String),
}
