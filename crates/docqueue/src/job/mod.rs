//! Job model and lifecycle state machine.

pub mod lifecycle;
pub mod model;

pub use lifecycle::{apply, JobEvent, LifecycleController, TransitionError};
pub use model::{
    AnalysisResult, DocumentRef, FailureCause, Job, JobId, JobInput, JobState, JobStateKind,
    JobStatusView, Progress, TimeoutPhase,
};
