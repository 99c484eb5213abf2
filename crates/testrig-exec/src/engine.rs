//! The native test engine seam.

use std::path::PathBuf;

use async_trait::async_trait;
use testrig_core::{ExecutionEnvironment, Result};
use tracing::info;

use crate::discovery::DiscoveryRequest;
use crate::invocation::Invocation;
use crate::process::{run_process, ProcessOutput, ProcessSpec};

/// Anything that can list and execute tests.
#[async_trait]
pub trait TestEngine: Send + Sync {
    /// Enumerate tests into `request.list_file`.
    async fn discover(&self, request: &DiscoveryRequest) -> Result<ProcessOutput>;

    /// Execute one invocation. Reports land at `invocation.report_path`.
    async fn execute(&self, invocation: &Invocation) -> Result<ProcessOutput>;
}

/// The engine binary, driven through its console arguments.
#[derive(Debug, Clone)]
pub struct NativeEngine {
    pub binary: PathBuf,
    pub working_directory: PathBuf,
    pub environment: ExecutionEnvironment,
}

impl NativeEngine {
    /// Engine binary run from `working_directory` with the run's secrets in its environment.
    pub fn new(
        binary: impl Into<PathBuf>,
        working_directory: impl Into<PathBuf>,
        environment: ExecutionEnvironment,
    ) -> Self {
        Self {
            binary: binary.into(),
            working_directory: working_directory.into(),
            environment,
        }
    }

    fn spec(&self, args: Vec<String>) -> ProcessSpec {
        ProcessSpec::new(&self.binary)
            .args(args)
            .env(self.environment.env_pairs())
            .cwd(&self.working_directory)
    }

    /// Console arguments for listing mode.
    pub fn discovery_args(request: &DiscoveryRequest) -> Vec<String> {
        let mut args: Vec<String> = request
            .sources
            .iter()
            .map(|s| s.display().to_string())
            .collect();
        args.push("/ListFullyQualifiedTests".to_string());
        // One argv element each; no shell in between, so no quoting.
        args.push(format!("/ListTestsTargetPath:{}", request.list_file.display()));
        if let Some(filter) = request.test_case_filter.as_deref().filter(|f| !f.is_empty()) {
            args.push(format!("/TestCaseFilter:{filter}"));
        }
        if let Some(settings) = &request.settings_path {
            args.push(format!("/Settings:{}", settings.display()));
        }
        if let Some(adapters) = &request.custom_adapters_path {
            args.push(format!("/TestAdapterPath:{}", adapters.display()));
        }
        args
    }
}

#[async_trait]
impl TestEngine for NativeEngine {
    async fn discover(&self, request: &DiscoveryRequest) -> Result<ProcessOutput> {
        info!(sources = request.sources.len(), "listing tests");
        run_process(&self.spec(Self::discovery_args(request))).await
    }

    async fn execute(&self, invocation: &Invocation) -> Result<ProcessOutput> {
        info!(attempt = invocation.attempt, "starting test engine");
        run_process(&self.spec(invocation.command_args())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovery_args() {
        let request = DiscoveryRequest {
            sources: vec![PathBuf::from("/b/A.Tests.dll")],
            test_case_filter: Some("Priority=1".to_string()),
            custom_adapters_path: None,
            settings_path: Some(PathBuf::from("/tmp/s.runsettings")),
            list_file: PathBuf::from("/tmp/scratch dir/list.txt"),
        };
        let args = NativeEngine::discovery_args(&request);
        assert_eq!(args[0], "/b/A.Tests.dll");
        assert!(args.contains(&"/ListFullyQualifiedTests".to_string()));
        assert!(args.contains(&"/ListTestsTargetPath:/tmp/scratch dir/list.txt".to_string()));
        assert!(args.iter().all(|a| !a.contains('"')));
        assert!(args.contains(&"/TestCaseFilter:Priority=1".to_string()));
        assert!(args.contains(&"/Settings:/tmp/s.runsettings".to_string()));
    }
}
