pub mod broadcast;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod job;
pub mod maintenance;
pub mod queue;
pub mod runtime;
pub mod storage;
pub mod store;
pub mod submit;
pub mod worker;

pub use broadcast::{JobProgressBroadcaster, JobProgressEvent};
pub use config::{load_config, Config};
pub use db::{Database, DatabaseError};
pub use engine::{AnalysisEngine, AnalysisRequest, EngineContext, EngineError, StubEngine};
pub use error::{
    ConfigError, DocqueueError, QueueError, Result, SpawnError, StorageError, SubmitError,
    WorkerError,
};
pub use job::{Job, JobEvent, JobId, JobState, JobStateKind, JobStatusView, LifecycleController};
pub use maintenance::{PendingReconciler, RetentionSweeper, SweepReport};
pub use queue::{Queue, SqliteQueue};
pub use runtime::{Runtime, Services};
pub use storage::{DocumentStorage, FileStorage};
pub use store::{JobFilter, JobStore};
pub use submit::{SubmitReceipt, SubmitRequest, Submitter};
pub use worker::{Executor, WorkerPool};
