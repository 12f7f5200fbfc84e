//! Document storage.

pub mod filesystem;

pub use filesystem::FileStorage;

use crate::error::StorageError;
use crate::job::DocumentRef;

/// Result of deleting a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// Where submitted documents live until their job is purged.
pub trait DocumentStorage: Send + Sync {
    /// Stores a new document and returns its handle.
    fn put(&self, name: &str, content: &[u8]) -> Result<DocumentRef, StorageError>;

    fn read(&self, document: &DocumentRef) -> Result<Vec<u8>, StorageError>;

    /// Removes a document. Deleting a missing document is not an error.
    fn delete(&self, document: &DocumentRef) -> Result<DeleteOutcome, StorageError>;
}
