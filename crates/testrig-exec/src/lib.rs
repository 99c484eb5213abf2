//! testrig exec
//!
//! Everything that touches processes and the filesystem during a run:
//! source resolution and discovery, impact selection, engine invocations,
//! the rerun loop and the orchestrator tying them together.

pub mod discovery;
pub mod dispatcher;
pub mod engine;
pub mod fakes;
pub mod invocation;
pub mod orchestrator;
pub mod process;
pub mod publisher;
pub mod report;
pub mod rerun;
pub mod response;
pub mod selector;

pub use discovery::{discover_tests, resolve_test_sources, DiscoveredTests, DiscoveryRequest, SourceFilter};
pub use dispatcher::{DispatchResult, ExecutionDispatcher};
pub use engine::{NativeEngine, TestEngine};
pub use invocation::{Invocation, InvocationBuilder, Selection};
pub use orchestrator::{synthesize_settings, Orchestrator};
pub use process::{run_process, ProcessOutput, ProcessSpec};
pub use publisher::{DirectoryPublisher, LogPublisher, ResultPublisher};
pub use report::TestReport;
pub use rerun::{RerunGate, RerunVerdict};
pub use response::{ResponseClassification, ResponseFile};
pub use selector::{
    ImpactDecision, ImpactHelper, ImpactSelector, NativeImpactHelper, PublishOutcome,
    SelectorState,
};
