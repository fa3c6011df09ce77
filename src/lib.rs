// Yard Migrator Library - resumable media catalog migration
// This exposes the core components for testing and integration

pub mod calendar;
pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod executors;
pub mod pipeline;
pub mod report;
pub mod shutdown;
pub mod store;
pub mod telemetry;

// Re-export key types for easy access
pub use calendar::{CalendarConfig, PublicationCalendar};
pub use catalog::{CatalogEntry, CatalogError, CatalogSource, JsonCatalogFile};
pub use config::MigrationConfig;
pub use coordinator::{
    AdvanceReport, BudgetConfig, CatalogWindow, Coordinator, CoordinatorConfig, CoordinatorError,
    DiscoverySummary, ResourceBudget, RunSummary, StopHandle, StopReason,
};
pub use executors::{
    BlockingExecutor, CalendarScheduleExecutor, CommandSpec, CommandStageExecutor,
    ConfirmPublishExecutor, StageExecutor, StageExecutors, StageFailure, StageOutput,
};
pub use pipeline::{
    FailureKind, ItemId, ItemRecord, RetryConfig, RetryPolicy, Stage, Step, StepTable,
    TransitionError,
};
pub use report::{verify_artifacts, MigrationReport};
pub use shutdown::ShutdownCoordinator;
pub use store::{CommitOutcome, FileStateStore, Lease, LeaseOwner, MemoryStateStore, StateStore, StoreError};
pub use telemetry::{create_dispatch_span, generate_correlation_id, init_telemetry};
