//! Scripted engine, impact helper and publisher (testing only)
//!
//! Nothing here spawns a process. The engine writes list files and TRX
//! reports exactly where the native one would, so the dispatcher and
//! orchestrator run unmodified against it.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use quick_xml::escape::escape;
use testrig_core::{AttemptMode, Result, RunError};

use crate::discovery::DiscoveryRequest;
use crate::engine::TestEngine;
use crate::invocation::Invocation;
use crate::process::ProcessOutput;
use crate::publisher::ResultPublisher;
use crate::selector::{ImpactHelper, PublishRequest, SelectRequest, UploadRequest};

// ---------------------------------------------------------------------------
// ScriptedEngine
// ---------------------------------------------------------------------------

/// What one scripted execution reports.
#[derive(Debug, Clone, Default)]
pub struct ScriptedAttempt {
    pub exit_code: i32,
    pub passed: Vec<String>,
    pub failed: Vec<String>,
    pub write_report: bool,
    pub stderr: String,
}

impl ScriptedAttempt {
    pub fn passing(tests: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            passed: tests.into_iter().map(Into::into).collect(),
            write_report: true,
            ..Default::default()
        }
    }

    /// Exits 1 when anything failed, like the native engine.
    pub fn failing(
        passed: impl IntoIterator<Item = impl Into<String>>,
        failed: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let failed: Vec<String> = failed.into_iter().map(Into::into).collect();
        Self {
            exit_code: if failed.is_empty() { 0 } else { 1 },
            passed: passed.into_iter().map(Into::into).collect(),
            failed,
            write_report: true,
            stderr: String::new(),
        }
    }

    /// The engine died before writing a report.
    pub fn crash(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            write_report: false,
            stderr: stderr.into(),
            ..Default::default()
        }
    }
}

/// One execution as the engine saw it.
#[derive(Debug, Clone)]
pub struct RecordedInvocation {
    pub attempt: u32,
    /// Command line arguments, or the response file lines.
    pub args: Vec<String>,
    pub response_file: Option<String>,
    /// Contents of the `/Settings:` file at execution time.
    pub settings: Option<String>,
}

impl RecordedInvocation {
    /// Names passed through `/Tests:`, if the invocation was restricted.
    pub fn test_names(&self) -> Option<Vec<String>> {
        tests_clause(&self.args)
    }

    pub fn used_response_file(&self) -> bool {
        self.response_file.is_some()
    }
}

/// In-memory engine that lists a fixed set of tests and replays scripted attempts.
///
/// With no script left, every selected test passes.
#[derive(Debug, Default)]
pub struct ScriptedEngine {
    discovered: Vec<String>,
    discovery_exit_code: i32,
    launch_fails: bool,
    script: Mutex<VecDeque<ScriptedAttempt>>,
    executions: Mutex<Vec<RecordedInvocation>>,
    discoveries: Mutex<Vec<DiscoveryRequest>>,
}

impl ScriptedEngine {
    pub fn new(discovered: Vec<String>) -> Self {
        Self {
            discovered,
            ..Default::default()
        }
    }

    pub fn then(self, attempt: ScriptedAttempt) -> Self {
        self.script.lock().unwrap().push_back(attempt);
        self
    }

    pub fn with_discovery_exit_code(mut self, code: i32) -> Self {
        self.discovery_exit_code = code;
        self
    }

    /// Every call fails as if the binary were missing.
    pub fn failing_to_launch(mut self) -> Self {
        self.launch_fails = true;
        self
    }

    pub fn executions(&self) -> Vec<RecordedInvocation> {
        self.executions.lock().unwrap().clone()
    }

    pub fn execution_count(&self) -> usize {
        self.executions.lock().unwrap().len()
    }

    pub fn discovery_count(&self) -> usize {
        self.discoveries.lock().unwrap().len()
    }

    pub fn discovery_requests(&self) -> Vec<DiscoveryRequest> {
        self.discoveries.lock().unwrap().clone()
    }

    fn launch_error() -> RunError {
        RunError::ProcessLaunch {
            program: PathBuf::from("scripted-engine"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "scripted launch failure"),
        }
    }

    fn next_attempt(&self, selected: Option<Vec<String>>) -> ScriptedAttempt {
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| ScriptedAttempt::passing(selected.unwrap_or_else(|| self.discovered.clone())))
    }
}

#[async_trait]
impl TestEngine for ScriptedEngine {
    async fn discover(&self, request: &DiscoveryRequest) -> Result<ProcessOutput> {
        self.discoveries.lock().unwrap().push(request.clone());
        if self.launch_fails {
            return Err(Self::launch_error());
        }
        if self.discovery_exit_code != 0 {
            return Ok(ProcessOutput {
                exit_code: self.discovery_exit_code,
                stderr: "scripted discovery failure".to_string(),
                ..Default::default()
            });
        }
        write_file(&request.list_file, &self.discovered.join("\n")).await?;
        Ok(ProcessOutput::default())
    }

    async fn execute(&self, invocation: &Invocation) -> Result<ProcessOutput> {
        let (args, response_file) = match &invocation.mode {
            AttemptMode::ArgumentList { args } => (args.clone(), None),
            AttemptMode::ResponseFile { path } => {
                let content = tokio::fs::read_to_string(path).await?;
                let lines = content.lines().map(str::to_string).collect();
                (lines, Some(content))
            }
        };
        let settings = match settings_path(&args) {
            Some(path) => tokio::fs::read_to_string(path).await.ok(),
            None => None,
        };
        let selected = tests_clause(&args);

        self.executions.lock().unwrap().push(RecordedInvocation {
            attempt: invocation.attempt,
            args,
            response_file,
            settings,
        });
        if self.launch_fails {
            return Err(Self::launch_error());
        }

        let attempt = self.next_attempt(selected);
        if attempt.write_report {
            write_file(&invocation.report_path, &render_trx(&attempt)).await?;
        }
        Ok(ProcessOutput {
            exit_code: attempt.exit_code,
            stderr: attempt.stderr,
            ..Default::default()
        })
    }
}

fn tests_clause(args: &[String]) -> Option<Vec<String>> {
    args.iter()
        .find_map(|a| a.trim().strip_prefix("/Tests:"))
        .map(|names| {
            names
                .trim_matches('"')
                .split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .collect()
        })
}

fn settings_path(args: &[String]) -> Option<PathBuf> {
    args.iter()
        .find_map(|a| a.trim().strip_prefix("/Settings:"))
        .map(|p| PathBuf::from(p.trim_matches('"')))
}

fn render_trx(attempt: &ScriptedAttempt) -> String {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<TestRun>\n  <Results>\n");
    let rows = attempt
        .passed
        .iter()
        .map(|t| (t, "Passed"))
        .chain(attempt.failed.iter().map(|t| (t, "Failed")));
    for (name, outcome) in rows {
        out.push_str(&format!(
            "    <UnitTestResult testName=\"{}\" outcome=\"{outcome}\" />\n",
            escape(name.as_str())
        ));
    }
    out.push_str("  </Results>\n</TestRun>\n");
    out
}

async fn write_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, content).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// ScriptedImpactHelper
// ---------------------------------------------------------------------------

/// In-memory impact helper with fixed answers per verb.
#[derive(Debug, Default)]
pub struct ScriptedImpactHelper {
    baseline: Option<String>,
    response: Option<String>,
    custom_filters: Option<String>,
    publish_exit_code: i32,
    select_exit_code: i32,
    upload_exit_code: i32,
    calls: Mutex<Vec<&'static str>>,
    select_requests: Mutex<Vec<SelectRequest>>,
    upload_requests: Mutex<Vec<UploadRequest>>,
}

impl ScriptedImpactHelper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_baseline(mut self, id: impl Into<String>) -> Self {
        self.baseline = Some(id.into());
        self
    }

    /// Response file content. Without one the helper writes no file.
    pub fn with_response(mut self, content: impl Into<String>) -> Self {
        self.response = Some(content.into());
        self
    }

    /// Filters a custom impact engine hands back when changes are published.
    pub fn with_custom_filters(mut self, filters: impl Into<String>) -> Self {
        self.custom_filters = Some(filters.into());
        self
    }

    pub fn with_publish_exit_code(mut self, code: i32) -> Self {
        self.publish_exit_code = code;
        self
    }

    pub fn with_select_exit_code(mut self, code: i32) -> Self {
        self.select_exit_code = code;
        self
    }

    pub fn with_upload_exit_code(mut self, code: i32) -> Self {
        self.upload_exit_code = code;
        self
    }

    fn count(&self, verb: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|v| **v == verb).count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn publish_calls(&self) -> usize {
        self.count("publish")
    }

    pub fn select_calls(&self) -> usize {
        self.count("select")
    }

    pub fn upload_calls(&self) -> usize {
        self.count("upload")
    }

    pub fn select_requests(&self) -> Vec<SelectRequest> {
        self.select_requests.lock().unwrap().clone()
    }

    pub fn upload_requests(&self) -> Vec<UploadRequest> {
        self.upload_requests.lock().unwrap().clone()
    }

    fn exit(code: i32) -> ProcessOutput {
        ProcessOutput {
            exit_code: code,
            ..Default::default()
        }
    }
}

#[async_trait]
impl ImpactHelper for ScriptedImpactHelper {
    async fn publish_changes(&self, request: &PublishRequest) -> Result<ProcessOutput> {
        self.calls.lock().unwrap().push("publish");
        if let Some(id) = &self.baseline {
            write_file(&request.baseline_file, id).await?;
        }
        if let (Some(filters), Some(file)) = (&self.custom_filters, &request.filter_file) {
            write_file(file, filters).await?;
        }
        Ok(Self::exit(self.publish_exit_code))
    }

    async fn generate_response(&self, request: &SelectRequest) -> Result<ProcessOutput> {
        self.calls.lock().unwrap().push("select");
        self.select_requests.lock().unwrap().push(request.clone());
        if let Some(content) = &self.response {
            write_file(&request.response_file, content).await?;
        }
        Ok(Self::exit(self.select_exit_code))
    }

    async fn upload_results(&self, request: &UploadRequest) -> Result<ProcessOutput> {
        self.calls.lock().unwrap().push("upload");
        self.upload_requests.lock().unwrap().push(request.clone());
        Ok(Self::exit(self.upload_exit_code))
    }
}

// ---------------------------------------------------------------------------
// RecordingPublisher
// ---------------------------------------------------------------------------

/// Publisher that remembers what it was handed.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<PathBuf>>,
    fail: bool,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn published(&self) -> Vec<PathBuf> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResultPublisher for RecordingPublisher {
    async fn publish(&self, files: &[PathBuf]) -> anyhow::Result<()> {
        self.published.lock().unwrap().extend_from_slice(files);
        if self.fail {
            anyhow::bail!("scripted publish failure");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::TestReport;

    #[test]
    fn test_tests_clause_parsing() {
        let args = vec!["a.dll".to_string(), "/Tests:N.A, N.B".to_string()];
        assert_eq!(tests_clause(&args), Some(vec!["N.A".to_string(), "N.B".to_string()]));
        assert_eq!(tests_clause(&["/Tests:\"".to_string()]), Some(vec![]));
        assert_eq!(tests_clause(&["a.dll".to_string()]), None);
    }

    #[test]
    fn test_rendered_trx_parses() {
        let attempt = ScriptedAttempt::failing(["A.<One>"], ["A.Two"]);
        let report = TestReport::parse(&render_trx(&attempt)).unwrap();
        assert_eq!(report.total, 2);
        assert!(report.passed.contains("A.<One>"));
        assert!(report.failed.contains("A.Two"));
        assert_eq!(attempt.exit_code, 1);
    }

    #[tokio::test]
    async fn test_default_execution_passes_selected_tests() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ScriptedEngine::new(vec!["A.One".into(), "A.Two".into()]);
        let invocation = Invocation::from_args(
            0,
            vec!["a.dll".into(), "/Tests:A.Two".into()],
            dir.path().join("out/r.trx"),
        );
        let output = engine.execute(&invocation).await.unwrap();
        assert!(output.success());
        let report = TestReport::read(&invocation.report_path).await.unwrap().unwrap();
        assert_eq!(report.passed.len(), 1);
        assert!(report.passed.contains("A.Two"));
        assert_eq!(engine.executions()[0].test_names(), Some(vec!["A.Two".to_string()]));
    }
}
