pub mod executor;
pub mod limits;
pub mod pool;
pub mod progress;

pub use executor::{DiscardReason, Disposition, Executor, ExecutorSettings};
pub use limits::TimeLimits;
pub use pool::{WorkerPool, DEFAULT_POLL_TIMEOUT};
pub use progress::{BroadcastProgress, NoopProgress, ProgressReporter};
