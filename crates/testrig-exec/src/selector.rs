//! Test impact analysis: deciding which tests a change affects.
//!
//! The selector drives the native impact helper through a fixed sequence:
//!
//! ```text
//! Idle -> ChangesPublished -> TestsDiscovered -> ResponseGenerated -> Classified
//!   \___________________ any failure ___________________/
//!                           Fallback (run everything)
//! ```
//!
//! Helper failures never fail the run; they only widen it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use testrig_core::obs::{emit_selection, emit_tia_fallback, emit_tia_state};
use testrig_core::{ExecutionEnvironment, Result, TiaPolicy, TiaState};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::discovery::{self, DiscoveredTests, DiscoveryRequest};
use crate::engine::TestEngine;
use crate::process::{run_process, ProcessOutput, ProcessSpec};
use crate::response::{ResponseClassification, ResponseFile};

/// Helper verbs, passed as the only argument.
pub const VERB_PUBLISH: &str = "PublishCodeChanges";
pub const VERB_SELECT: &str = "GetImpactedtests";
pub const VERB_UPLOAD: &str = "UpdateTestResults";

/// Publish the change set; the helper writes the baseline id to `baseline_file`.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub tia: TiaState,
    pub baseline_file: PathBuf,
    /// Where a custom impact engine writes extra test-case filters.
    pub filter_file: Option<PathBuf>,
}

/// Compute impacted tests from `discovered_tests_file` into `response_file`.
#[derive(Debug, Clone)]
pub struct SelectRequest {
    pub tia: TiaState,
    pub discovered_tests_file: PathBuf,
    pub response_file: PathBuf,
    /// The helper records the id of the test run it creates here.
    pub run_id_file: PathBuf,
    pub baseline_file: PathBuf,
    /// Tests discovered with the custom engine's filters.
    pub filtered_tests_file: Option<PathBuf>,
}

/// Report results so impact data stays current.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub tia: TiaState,
    /// First report of the run, if any was written.
    pub result_file: Option<PathBuf>,
    pub run_id_file: PathBuf,
}

/// The native impact helper seam.
#[async_trait]
pub trait ImpactHelper: Send + Sync {
    async fn publish_changes(&self, request: &PublishRequest) -> Result<ProcessOutput>;
    async fn generate_response(&self, request: &SelectRequest) -> Result<ProcessOutput>;
    async fn upload_results(&self, request: &UploadRequest) -> Result<ProcessOutput>;
}

/// Helper executable configured entirely through environment variables.
///
/// Each verb reads its own key set; keys whose input is optional are sent
/// empty rather than omitted, except the pipeline identifiers and the
/// rebase limit which only appear when known.
#[derive(Debug, Clone)]
pub struct NativeImpactHelper {
    helper_path: PathBuf,
    policy: TiaPolicy,
    environment: ExecutionEnvironment,
    timeout: Option<Duration>,
}

impl NativeImpactHelper {
    pub fn new(policy: &TiaPolicy, environment: &ExecutionEnvironment) -> Self {
        Self {
            helper_path: policy.helper_path.clone(),
            policy: policy.clone(),
            environment: environment.clone(),
            timeout: policy.helper_timeout_secs.map(Duration::from_secs),
        }
    }

    /// Run identity, credentials and proxy settings shared by every verb.
    pub fn common_env(&self, tia: &TiaState) -> Vec<(String, String)> {
        let mut env = Vec::new();
        let mut set = |k: &str, v: String| env.push((k.to_string(), v));

        for (key, value) in [
            ("collectionurl", &self.policy.collection_url),
            ("projectid", &self.policy.team_project),
            ("definitionrunid", &self.policy.definition_run_id),
        ] {
            if let Some(value) = value {
                set(key, value.clone());
            }
        }
        if let Some(token) = &self.environment.access_token {
            set("token", token.clone());
        }
        set("context", tia.context.as_str().to_string());
        if let Some(proxy) = &self.environment.proxy {
            set("proxyurl", proxy.url.clone());
            if let Some(user) = &proxy.username {
                set("proxyusername", user.clone());
            }
            if let Some(password) = &proxy.password {
                set("proxypassword", password.clone());
            }
            if let Some(bypass) = &proxy.bypass_list {
                set("proxybypasslist", bypass.clone());
            }
        }
        env
    }

    /// Environment for `PublishCodeChanges`.
    pub fn publish_env(&self, request: &PublishRequest) -> Vec<(String, String)> {
        let tia = &request.tia;
        let mut env = self.common_env(tia);
        let mut set = |k: &str, v: String| env.push((k.to_string(), v));

        if let Some(id) = &self.policy.definition_id {
            set("definitionid", id.clone());
        }
        set("sourcesdir", path_value(tia.sources_dir.as_deref()));
        set("newprovider", tia.use_file_level.to_string());
        set("prflow", tia.pr_flow.to_string());
        if let Some(limit) = tia.rebase_limit {
            set("rebaselimit", limit.to_string());
        }
        set("baselinefile", request.baseline_file.display().to_string());
        set(
            "filter",
            tia.filter_paths
                .as_deref()
                .map(str::trim)
                .unwrap_or_default()
                .to_string(),
        );
        set("userMapFile", path_value(tia.user_map_file.as_deref()));
        set(
            "testCaseFilterResponseFile",
            path_value(request.filter_file.as_deref()),
        );
        env
    }

    /// Environment for `GetImpactedtests`.
    pub fn select_env(&self, request: &SelectRequest) -> Vec<(String, String)> {
        let mut env = self.common_env(&request.tia);
        let mut set = |k: &str, v: String| env.push((k.to_string(), v));
        let text = |v: &Option<String>| v.clone().unwrap_or_default();

        set("responsefilepath", request.response_file.display().to_string());
        set(
            "discoveredtestspath",
            request.discovered_tests_file.display().to_string(),
        );
        set("runidfilepath", request.run_id_file.display().to_string());
        set("testruntitle", text(&self.policy.test_run_title));
        set(
            "baselinebuildfilepath",
            request.baseline_file.display().to_string(),
        );
        set("platform", text(&self.policy.build_platform));
        set("configuration", text(&self.policy.build_configuration));
        set(
            "useTestCaseFilterInResponseFile",
            self.policy.test_case_filter_in_response.to_string(),
        );
        set(
            "testCaseFilterOutputFile",
            path_value(request.filtered_tests_file.as_deref()),
        );
        set(
            "isCustomEngineEnabled",
            request.tia.user_map_file.is_some().to_string(),
        );
        env
    }

    /// Environment for `UpdateTestResults`.
    pub fn upload_env(&self, request: &UploadRequest) -> Vec<(String, String)> {
        let mut env = self.common_env(&request.tia);
        if let Some(file) = &request.result_file {
            env.push(("resultfile".to_string(), file.display().to_string()));
        }
        env.push((
            "runidfile".to_string(),
            request.run_id_file.display().to_string(),
        ));
        env
    }

    async fn run(&self, verb: &str, env: Vec<(String, String)>) -> Result<ProcessOutput> {
        info!(verb = verb, "invoking impact helper");
        let spec = ProcessSpec::new(&self.helper_path)
            .args([verb])
            .env(env)
            .timeout(self.timeout);
        run_process(&spec).await
    }
}

fn path_value(path: Option<&Path>) -> String {
    path.map(|p| p.display().to_string()).unwrap_or_default()
}

#[async_trait]
impl ImpactHelper for NativeImpactHelper {
    async fn publish_changes(&self, request: &PublishRequest) -> Result<ProcessOutput> {
        self.run(VERB_PUBLISH, self.publish_env(request)).await
    }

    async fn generate_response(&self, request: &SelectRequest) -> Result<ProcessOutput> {
        self.run(VERB_SELECT, self.select_env(request)).await
    }

    async fn upload_results(&self, request: &UploadRequest) -> Result<ProcessOutput> {
        self.run(VERB_UPLOAD, self.upload_env(request)).await
    }
}

/// Selector state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorState {
    Idle,
    ChangesPublished,
    TestsDiscovered,
    ResponseGenerated,
    Classified(ResponseClassification),
    Fallback { reason: String },
}

impl SelectorState {
    pub fn name(&self) -> &'static str {
        match self {
            SelectorState::Idle => "idle",
            SelectorState::ChangesPublished => "changes_published",
            SelectorState::TestsDiscovered => "tests_discovered",
            SelectorState::ResponseGenerated => "response_generated",
            SelectorState::Classified(_) => "classified",
            SelectorState::Fallback { .. } => "fallback",
        }
    }
}

/// Result of the publish step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    /// `None` when the helper could not be run at all.
    pub exit_code: Option<i32>,
    pub baseline_id: Option<String>,
}

/// What the run should execute after impact analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImpactDecision {
    /// Impact data unusable; run the full filtered set.
    RunAll { reason: String },
    /// Nothing is affected by the change.
    NoImpactedTests,
    Impacted(ResponseFile),
}

/// Drives the impact helper for one run.
pub struct ImpactSelector {
    helper: Arc<dyn ImpactHelper>,
    tia: TiaState,
    scratch_dir: PathBuf,
    baseline_file: PathBuf,
    run_id_file: PathBuf,
    /// Only allocated when a custom impact engine is configured.
    filter_file: Option<PathBuf>,
    filtered_tests_file: Option<PathBuf>,
    state: SelectorState,
}

impl ImpactSelector {
    pub fn new(
        helper: Arc<dyn ImpactHelper>,
        tia: TiaState,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        let scratch_dir = scratch_dir.into();
        let custom_engine = tia.user_map_file.is_some();
        Self {
            helper,
            baseline_file: scratch_file(&scratch_dir, ".baseline"),
            run_id_file: scratch_file(&scratch_dir, ".runid"),
            filter_file: custom_engine.then(|| scratch_file(&scratch_dir, ".filter")),
            filtered_tests_file: custom_engine.then(|| scratch_file(&scratch_dir, ".filtered")),
            tia,
            scratch_dir,
            state: SelectorState::Idle,
        }
    }

    pub fn state(&self) -> &SelectorState {
        &self.state
    }

    pub fn tia(&self) -> &TiaState {
        &self.tia
    }

    /// Whether impact analysis gave up and the run widened to everything.
    pub fn is_fallback(&self) -> bool {
        matches!(self.state, SelectorState::Fallback { .. })
    }

    /// File the helper writes the id of its test run to.
    pub fn run_id_file(&self) -> &Path {
        &self.run_id_file
    }

    fn transition(&mut self, next: SelectorState) {
        debug!(from = self.state.name(), to = next.name(), "selector transition");
        emit_tia_state(next.name());
        self.state = next;
    }

    fn fall_back(&mut self, reason: impl Into<String>) -> ImpactDecision {
        let reason = reason.into();
        emit_tia_fallback(&reason);
        self.transition(SelectorState::Fallback {
            reason: reason.clone(),
        });
        ImpactDecision::RunAll { reason }
    }

    /// Publish the change set and learn the baseline run.
    pub async fn publish_changes(&mut self) -> PublishOutcome {
        let request = PublishRequest {
            tia: self.tia.clone(),
            baseline_file: self.baseline_file.clone(),
            filter_file: self.filter_file.clone(),
        };

        let output = match self.helper.publish_changes(&request).await {
            Ok(output) => output,
            Err(e) => {
                self.fall_back(format!("publishing code changes failed: {e}"));
                return PublishOutcome {
                    exit_code: None,
                    baseline_id: None,
                };
            }
        };

        // The file stays in place: the selection verb reads it again.
        let baseline_id = tokio::fs::read_to_string(&self.baseline_file)
            .await
            .ok()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());

        if !output.success() {
            self.fall_back(format!(
                "publishing code changes exited with code {}",
                output.exit_code
            ));
        } else {
            if let Some(id) = &baseline_id {
                self.tia.record_baseline(id.clone());
            }
            self.transition(SelectorState::ChangesPublished);
        }

        PublishOutcome {
            exit_code: Some(output.exit_code),
            baseline_id,
        }
    }

    /// Enumerate every test matching the static filter.
    ///
    /// Runs regardless of the selector state; only advances the state when
    /// changes were published. With a custom impact engine the tests matching
    /// its filters are listed as well.
    pub async fn discover_tests(
        &mut self,
        engine: &dyn TestEngine,
        request: &DiscoveryRequest,
    ) -> Result<DiscoveredTests> {
        match discovery::discover_tests(engine, request).await {
            Ok(discovered) => {
                if self.state == SelectorState::ChangesPublished {
                    self.discover_filtered(engine, request).await;
                    self.transition(SelectorState::TestsDiscovered);
                }
                Ok(discovered)
            }
            Err(e) => {
                if !e.is_fatal() {
                    self.fall_back(format!("test discovery failed: {e}"));
                }
                Err(e)
            }
        }
    }

    async fn discover_filtered(&self, engine: &dyn TestEngine, request: &DiscoveryRequest) {
        let (Some(filter_file), Some(output)) = (&self.filter_file, &self.filtered_tests_file)
        else {
            return;
        };
        let Some(filters) = tokio::fs::read_to_string(filter_file)
            .await
            .ok()
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
        else {
            return;
        };

        let mut filtered = request.clone();
        filtered.test_case_filter = Some(filters);
        filtered.list_file = output.clone();
        match discovery::discover_tests(engine, &filtered).await {
            Ok(found) => debug!(count = found.len(), "listed tests matching custom filters"),
            Err(e) => warn!(error = %e, "listing tests for custom filters failed"),
        }
    }

    /// Ask the helper for impacted tests and classify its answer.
    pub async fn generate_response(&mut self, discovered: &DiscoveredTests) -> ImpactDecision {
        match &self.state {
            SelectorState::Fallback { reason } => {
                return ImpactDecision::RunAll {
                    reason: reason.clone(),
                }
            }
            SelectorState::TestsDiscovered => {}
            other => {
                let msg = format!("impacted tests requested in state {}", other.name());
                return self.fall_back(msg);
            }
        }

        let response_path = scratch_file(&self.scratch_dir, ".rsp");
        let request = SelectRequest {
            tia: self.tia.clone(),
            discovered_tests_file: discovered.list_file.clone(),
            response_file: response_path.clone(),
            run_id_file: self.run_id_file.clone(),
            baseline_file: self.baseline_file.clone(),
            filtered_tests_file: self.filtered_tests_file.clone(),
        };

        match self.helper.generate_response(&request).await {
            Ok(output) if output.success() => {}
            Ok(output) => {
                remove_quietly(&response_path).await;
                return self.fall_back(format!(
                    "impacted test selection exited with code {}",
                    output.exit_code
                ));
            }
            Err(e) => {
                remove_quietly(&response_path).await;
                return self.fall_back(format!("impacted test selection failed: {e}"));
            }
        }
        self.transition(SelectorState::ResponseGenerated);

        let response = match ResponseFile::load(&response_path).await {
            Ok(response) => response,
            Err(e) => {
                remove_quietly(&response_path).await;
                return self.fall_back(format!("response file unreadable: {e}"));
            }
        };
        remove_quietly(&response_path).await;

        let classification = response.classify();
        let count = match classification {
            ResponseClassification::PartialSelection(n) => n,
            _ => 0,
        };
        emit_selection(classification.name(), count);
        self.transition(SelectorState::Classified(classification));

        match classification {
            ResponseClassification::Empty => {
                self.fall_back("impact helper produced an empty response")
            }
            ResponseClassification::NoTestsSelected => ImpactDecision::NoImpactedTests,
            ResponseClassification::PartialSelection(_) => ImpactDecision::Impacted(response),
        }
    }

    /// Upload results so the next run can compute impact against them.
    ///
    /// The helper takes a single report: the first `*.trx` in `results_dir`.
    pub async fn upload_results(&mut self, results_dir: Option<&Path>) -> bool {
        let result_file = match results_dir {
            Some(dir) => first_report(dir).await,
            None => None,
        };
        let request = UploadRequest {
            tia: self.tia.clone(),
            result_file,
            run_id_file: self.run_id_file.clone(),
        };
        match self.helper.upload_results(&request).await {
            Ok(output) if output.success() => true,
            Ok(output) => {
                warn!(
                    exit_code = output.exit_code,
                    "uploading impact results failed"
                );
                false
            }
            Err(e) => {
                warn!(error = %e, "uploading impact results failed");
                false
            }
        }
    }

    /// Return to `Idle` once the run is over and drop the helper's files.
    pub async fn complete(&mut self) {
        let files = [Some(&self.baseline_file), Some(&self.run_id_file)]
            .into_iter()
            .chain([self.filter_file.as_ref(), self.filtered_tests_file.as_ref()])
            .flatten();
        for file in files {
            remove_quietly(file).await;
        }
        self.transition(SelectorState::Idle);
    }
}

fn scratch_file(dir: &Path, suffix: &str) -> PathBuf {
    dir.join(format!("testrig-{}{suffix}", Uuid::new_v4().simple()))
}

async fn first_report(dir: &Path) -> Option<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    let mut reports = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("trx"))
        {
            reports.push(path);
        }
    }
    reports.into_iter().min()
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "could not remove temporary file");
        }
    }
}
