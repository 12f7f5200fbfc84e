use std::path::{Path, PathBuf};

use uuid::Uuid;

use super::{DeleteOutcome, DocumentStorage};
use crate::error::StorageError;
use crate::job::DocumentRef;

/// Longest file-name suffix kept in a document key.
const MAX_NAME_LEN: usize = 96;

/// Reduces an uploaded file name to characters that are safe in a key.
fn sanitize_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "document".to_string()
    } else {
        trimmed.chars().take(MAX_NAME_LEN).collect()
    }
}

/// Stores documents as flat files in one directory.
pub struct FileStorage {
    directory: PathBuf,
}

impl FileStorage {
    pub fn new<P: AsRef<Path>>(directory: P) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn ensure_directory(&self) -> Result<(), StorageError> {
        if !self.directory.exists() {
            std::fs::create_dir_all(&self.directory).map_err(|e| {
                StorageError::CreateDirectory {
                    path: self.directory.clone(),
                    source: e,
                }
            })?;
        }
        Ok(())
    }

    /// Maps a key to its path, refusing anything that could escape the
    /// storage directory.
    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        if key.is_empty()
            || key.contains(['/', '\\'])
            || key == "."
            || key == ".."
            || key.starts_with('.')
        {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.directory.join(key))
    }

    /// Writes `content` to a new file, never overwriting.
    fn write_new(&self, path: &Path, content: &[u8]) -> Result<bool, StorageError> {
        use std::io::Write;

        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(mut file) => {
                file.write_all(content)
                    .and_then(|_| file.sync_all())
                    .map_err(|e| StorageError::WriteFile {
                        path: path.to_path_buf(),
                        source: e,
                    })?;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(StorageError::WriteFile {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }
}

impl DocumentStorage for FileStorage {
    fn put(&self, name: &str, content: &[u8]) -> Result<DocumentRef, StorageError> {
        self.ensure_directory()?;
        let safe = sanitize_name(name);

        for _ in 0..3 {
            let key = format!("{}_{}", Uuid::new_v4().simple(), safe);
            let path = self.path_for(&key)?;
            if self.write_new(&path, content)? {
                log::debug!("Stored document '{}' as {}", name, key);
                return Ok(DocumentRef {
                    key,
                    name: name.to_string(),
                });
            }
        }

        Err(StorageError::FileExists(self.directory.join(safe)))
    }

    fn read(&self, document: &DocumentRef) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(&document.key)?;
        std::fs::read(&path).map_err(|e| StorageError::ReadFile { path, source: e })
    }

    fn delete(&self, document: &DocumentRef) -> Result<DeleteOutcome, StorageError> {
        let path = self.path_for(&document.key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(DeleteOutcome::Deleted),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DeleteOutcome::NotFound),
            Err(e) => Err(StorageError::DeleteFile { path, source: e }),
        }
    }
}
