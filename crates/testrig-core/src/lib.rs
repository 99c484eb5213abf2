//! testrig core
//!
//! Domain model and pure building blocks of a test run:
//! - run configuration, outcomes and the error taxonomy
//! - settings documents (run settings / test settings) and their mutations
//! - batch planning across agents
//! - tracing setup and structured lifecycle events

pub mod batch;
pub mod domain;
pub mod obs;
pub mod settings;
pub mod telemetry;

pub use batch::{BatchPlan, BatchPlanner, BatchStrategy, PlanRequest, SliceSizing, SliceUnit, TestSlice};
pub use domain::{
    AttemptMode, DistributionPolicy, ExecutionAttempt, ExecutionEnvironment, ExecutionMode,
    PlatformCapabilities, ProxySettings, RerunAdmission, RerunPolicy, Result, RunConfiguration,
    RunError, RunOutcome, RunReport, SelectionSummary, TiaContext, TiaPolicy, TiaState,
};
pub use settings::{
    DataCollector, MutationOutcome, PersistedSettings, SettingsDocument, SettingsError,
    SettingsKind, XmlNode,
};
pub use telemetry::{init_tracing, LogFormat};

/// testrig version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
