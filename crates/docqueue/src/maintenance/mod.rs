//! Background housekeeping: retention and pending-job reconciliation.

pub mod reconciler;
pub mod scheduler;
pub mod sweeper;

pub use reconciler::{PendingReconciler, ReconcileReport, ReconcileSettings};
pub use scheduler::{MaintenanceTask, PeriodicTask};
pub use sweeper::{RetentionSettings, RetentionSweeper, SweepReport};
