//! Domain model for a test run.

pub mod config;
pub mod error;
pub mod outcome;
pub mod tia;

pub use config::{
    DistributionPolicy, ExecutionEnvironment, ExecutionMode, PlatformCapabilities, ProxySettings,
    RerunAdmission, RerunPolicy, RunConfiguration, TiaContext, TiaPolicy,
};
pub use error::{Result, RunError};
pub use outcome::{
    AttemptMode, ExecutionAttempt, RunOutcome, RunReport, SelectionSummary,
};
pub use tia::TiaState;
