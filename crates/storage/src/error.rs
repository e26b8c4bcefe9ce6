use liboverride_core::{EntityId, LibraryId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("entity not found: {0}")]
    EntityNotFound(EntityId),

    #[error("library not found: {0}")]
    LibraryNotFound(LibraryId),

    #[error("entity '{name}' of kind {kind} cannot be copied")]
    NotCopyable { name: String, kind: String },

    #[error("entity '{name}' is a {got}, expected {expected}")]
    KindMismatch {
        name: String,
        expected: String,
        got: String,
    },

    #[error("core error: {0}")]
    Core(#[from] liboverride_core::CoreError),
}
