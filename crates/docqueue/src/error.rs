use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DocqueueError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Submission error: {0}")]
    Submit(#[from] SubmitError),

    #[error("Transition error: {0}")]
    Transition(#[from] crate::job::TransitionError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to delete file '{path}': {source}")]
    DeleteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid document key: {0}")]
    InvalidKey(String),

    #[error("File already exists: {0}")]
    FileExists(PathBuf),
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue storage error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Queue message '{message_id}' is corrupt: {reason}")]
    CorruptMessage { message_id: String, reason: String },
}

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("Invalid submission: {0}")]
    Validation(String),

    #[error("Infrastructure failure: {0}")]
    Infrastructure(String),
}

impl From<StorageError> for SubmitError {
    fn from(e: StorageError) -> Self {
        SubmitError::Infrastructure(e.to_string())
    }
}

impl From<crate::db::DatabaseError> for SubmitError {
    fn from(e: crate::db::DatabaseError) -> Self {
        SubmitError::Infrastructure(e.to_string())
    }
}

/// A background thread could not be started.
#[derive(Error, Debug)]
#[error("Failed to spawn thread '{thread}': {source}")]
pub struct SpawnError {
    pub thread: String,
    #[source]
    pub source: std::io::Error,
}

impl SpawnError {
    pub fn new(thread: impl Into<String>, source: std::io::Error) -> Self {
        Self {
            thread: thread.into(),
            source,
        }
    }
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("Worker pool needs at least one worker")]
    NoWorkers,
}

pub type Result<T> = std::result::Result<T, DocqueueError>;
