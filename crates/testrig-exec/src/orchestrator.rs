//! End-to-end run: settings, impact selection, batching, dispatch, publishing.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use testrig_core::obs::{emit_run_finished, emit_run_started, run_span};
use testrig_core::settings::{parse_override_parameters, SettingsResult};
use testrig_core::{
    BatchPlan, BatchPlanner, BatchStrategy, DataCollector, ExecutionAttempt, ExecutionMode,
    MutationOutcome, PersistedSettings, PlanRequest, Result, RunConfiguration, RunError,
    RunOutcome, RunReport, SelectionSummary, SettingsDocument, SliceUnit, TiaState,
};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::discovery::{self, resolve_test_sources, DiscoveredTests, DiscoveryRequest};
use crate::dispatcher::ExecutionDispatcher;
use crate::engine::{NativeEngine, TestEngine};
use crate::invocation::{InvocationBuilder, Selection};
use crate::publisher::ResultPublisher;
use crate::selector::{ImpactDecision, ImpactHelper, ImpactSelector, NativeImpactHelper};

/// Features actually enabled after checking what the platform supports.
#[derive(Debug, Clone, Copy)]
struct Capabilities {
    parallel: bool,
    impact_analysis: bool,
    response_files: bool,
}

impl Capabilities {
    fn gate(config: &RunConfiguration) -> Self {
        let platform = &config.platform;
        if config.run_in_parallel && !platform.supports_parallel {
            warn!(
                engine_version = ?platform.engine_version,
                "parallel execution is not supported by this engine, running serially"
            );
        }
        if config.tia.enabled && !platform.supports_impact_analysis {
            warn!(
                engine_version = ?platform.engine_version,
                "test impact analysis is not supported by this engine, running all tests"
            );
        }
        Self {
            parallel: config.run_in_parallel && platform.supports_parallel,
            impact_analysis: config.tia.enabled && platform.supports_impact_analysis,
            response_files: platform.supports_response_files,
        }
    }
}

/// Runs a configuration against an engine, an impact helper and a publisher.
pub struct Orchestrator {
    engine: Arc<dyn TestEngine>,
    helper: Arc<dyn ImpactHelper>,
    publisher: Arc<dyn ResultPublisher>,
}

impl Orchestrator {
    /// Orchestrator over explicit collaborators; tests pass fakes here.
    pub fn new(
        engine: Arc<dyn TestEngine>,
        helper: Arc<dyn ImpactHelper>,
        publisher: Arc<dyn ResultPublisher>,
    ) -> Self {
        Self {
            engine,
            helper,
            publisher,
        }
    }

    /// Native engine and helper as described by `config`.
    pub fn native(config: &RunConfiguration, publisher: Arc<dyn ResultPublisher>) -> Self {
        let engine = NativeEngine::new(
            &config.platform.engine_path,
            &config.working_directory,
            config.environment.clone(),
        );
        let helper = NativeImpactHelper::new(&config.tia, &config.environment);
        Self::new(Arc::new(engine), Arc::new(helper), publisher)
    }

    /// Execute one run.
    ///
    /// Test failures come back as [`RunOutcome::Failed`]; only configuration
    /// problems and engine launch failures are errors.
    pub async fn run(&self, config: &RunConfiguration) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        self.run_inner(config, run_id)
            .instrument(run_span(&run_id.to_string()))
            .await
    }

    async fn run_inner(&self, config: &RunConfiguration, run_id: Uuid) -> Result<RunReport> {
        let started = Instant::now();
        let deadline = config
            .deadline_secs
            .map(|secs| started + Duration::from_secs(secs));

        validate(config)?;
        let digest = config.digest()?;
        let caps = Capabilities::gate(config);
        emit_run_started(
            &run_id.to_string(),
            &digest,
            config.is_distributed(),
            caps.impact_analysis,
        );

        let run = RunState {
            run_id,
            digest,
            started,
        };

        // Source resolution walks the filesystem; keep it off the runtime.
        let search_root = config.search_folder.clone();
        let patterns = config.test_sources.clone();
        let (sources, mut settings) = tokio::join!(
            tokio::task::spawn_blocking(move || resolve_test_sources(&search_root, &patterns)),
            load_settings(config.settings_file.as_deref()),
        );
        let sources = sources
            .map_err(|e| RunError::transient(format!("test source resolution did not finish: {e}")))??;

        if sources.is_empty() {
            warn!(
                search_folder = %config.search_folder.display(),
                "no test sources matched the configured patterns"
            );
            return Ok(run.finish(
                RunOutcome::skipped("no test sources matched"),
                Vec::new(),
                0,
                SelectionSummary::NothingToRun,
                None,
            ));
        }
        info!(count = sources.len(), "resolved test sources");

        let scratch = tempfile::Builder::new().prefix("testrig-").tempdir()?;

        let mut selector = caps.impact_analysis.then(|| {
            ImpactSelector::new(
                self.helper.clone(),
                TiaState::from_policy(&config.tia),
                scratch.path(),
            )
        });
        let mut baseline = None;
        if let Some(selector) = selector.as_mut() {
            baseline = selector.publish_changes().await.baseline_id;
        }

        let tia = selector.as_ref().map(ImpactSelector::tia);
        apply_mutations(&mut settings, config, &caps, tia, baseline.as_deref());
        let persisted = persist_settings(&settings, config, scratch.path());
        let settings_path = persisted.as_ref().map(|p| p.path().to_path_buf());

        let results_dir = results_directory(config, &settings, settings_path.as_deref());
        debug!(results_dir = %results_dir.display(), "results directory");

        let request = DiscoveryRequest {
            sources: sources.clone(),
            test_case_filter: config.test_case_filter.clone(),
            custom_adapters_path: config.custom_adapters_path.clone(),
            settings_path: settings_path.clone(),
            list_file: scratch.path().join("testrig-discovered.txt"),
        };
        let discovered = match selector.as_mut() {
            Some(selector) => selector.discover_tests(self.engine.as_ref(), &request).await,
            None => discovery::discover_tests(self.engine.as_ref(), &request).await,
        };
        let discovered = match discovered {
            Ok(discovered) => Some(discovered),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(error = %e, "test discovery failed, running every source");
                None
            }
        };

        if discovered.as_ref().is_some_and(DiscoveredTests::is_empty) {
            warn!("no tests matching the filter were discovered");
            if let Some(selector) = selector.as_mut() {
                selector.complete().await;
            }
            cleanup_settings(persisted);
            return Ok(run.finish(
                RunOutcome::Succeeded,
                Vec::new(),
                0,
                SelectionSummary::NothingToRun,
                None,
            ));
        }
        let discovered_count = discovered.as_ref().map_or(0, DiscoveredTests::len);

        let (selection, summary, plan) = match config.distribution.mode {
            ExecutionMode::Local => {
                let (selection, summary) = self
                    .select_local(selector.as_mut(), discovered.as_ref(), &caps)
                    .await;
                (selection, summary, None)
            }
            ExecutionMode::Distributed {
                agent_count,
                agent_index,
            } => {
                let plan = plan_distribution(config, agent_count, &sources, discovered.as_ref());
                let (selection, summary) =
                    agent_selection(&plan, agent_index, &sources, discovered.as_ref());
                (selection, summary, Some(plan))
            }
        };

        let Some(selection) = selection else {
            let outcome = match &summary {
                SelectionSummary::NoImpactedTests => {
                    info!("no tests are impacted by this change");
                    RunOutcome::Succeeded
                }
                _ => RunOutcome::skipped("this agent has no tests assigned"),
            };
            if let Some(selector) = selector.as_mut() {
                if outcome.is_success() {
                    selector.upload_results(None).await;
                }
                selector.complete().await;
            }
            cleanup_settings(persisted);
            return Ok(run.finish(outcome, Vec::new(), discovered_count, summary, plan));
        };

        let run_tag = run_id.simple().to_string();
        let builder = InvocationBuilder::new(
            config,
            sources,
            settings_path,
            &results_dir,
            scratch.path(),
            &run_tag[..8],
        );
        let dispatched = ExecutionDispatcher::new(self.engine.as_ref(), &builder, &config.rerun)
            .with_deadline(deadline)
            .run(&selection, config.ignore_failures)
            .await?;

        if !dispatched.report_files.is_empty() {
            if let Err(e) = self.publisher.publish(&dispatched.report_files).await {
                warn!(error = %e, "publishing test results failed");
            }
        }
        if let Some(selector) = selector.as_mut() {
            selector.upload_results(Some(&results_dir)).await;
            selector.complete().await;
        }
        cleanup_settings(persisted);

        Ok(run.finish(
            dispatched.outcome,
            dispatched.attempts,
            discovered_count,
            summary,
            plan,
        ))
    }

    async fn select_local(
        &self,
        selector: Option<&mut ImpactSelector>,
        discovered: Option<&DiscoveredTests>,
        caps: &Capabilities,
    ) -> (Option<Selection>, SelectionSummary) {
        let Some(selector) = selector else {
            return (Some(Selection::Full), SelectionSummary::Full);
        };
        let decision = match discovered {
            Some(discovered) => selector.generate_response(discovered).await,
            None => ImpactDecision::RunAll {
                reason: "test discovery failed".to_string(),
            },
        };
        match decision {
            ImpactDecision::RunAll { reason } => {
                (Some(Selection::Full), SelectionSummary::Fallback { reason })
            }
            ImpactDecision::NoImpactedTests => (None, SelectionSummary::NoImpactedTests),
            ImpactDecision::Impacted(_) if !caps.response_files => {
                let reason = "response files are not supported by this engine".to_string();
                warn!(%reason, "running all tests instead of the impacted set");
                (Some(Selection::Full), SelectionSummary::Fallback { reason })
            }
            ImpactDecision::Impacted(response) => {
                let clauses = response.clauses().len();
                (
                    Some(Selection::Impacted(response)),
                    SelectionSummary::Impacted { clauses },
                )
            }
        }
    }
}

struct RunState {
    run_id: Uuid,
    digest: String,
    started: Instant,
}

impl RunState {
    fn finish(
        &self,
        outcome: RunOutcome,
        attempts: Vec<ExecutionAttempt>,
        discovered: usize,
        selection: SelectionSummary,
        plan: Option<BatchPlan>,
    ) -> RunReport {
        let duration_ms = self.started.elapsed().as_millis() as u64;
        emit_run_finished(
            &self.run_id.to_string(),
            &outcome.to_string(),
            attempts.len(),
            duration_ms,
        );
        RunReport {
            run_id: self.run_id,
            outcome,
            attempts,
            discovered,
            selection,
            plan,
            config_digest: self.digest.clone(),
            duration_ms,
        }
    }
}

/// The settings document a run of `config` would hand the engine, before
/// an impact baseline is known.
pub async fn synthesize_settings(config: &RunConfiguration) -> SettingsDocument {
    let caps = Capabilities::gate(config);
    let mut settings = load_settings(config.settings_file.as_deref()).await;
    let tia = caps
        .impact_analysis
        .then(|| TiaState::from_policy(&config.tia));
    apply_mutations(&mut settings, config, &caps, tia.as_ref(), None);
    settings
}

/// Structural checks plus the filesystem checks only a live run can make.
fn validate(config: &RunConfiguration) -> Result<()> {
    config.validate()?;
    if !config.working_directory.is_dir() {
        return Err(RunError::configuration(format!(
            "working directory {} does not exist",
            config.working_directory.display()
        )));
    }
    if let Some(settings) = &config.settings_file {
        if !settings.is_file() {
            return Err(RunError::configuration(format!(
                "settings file {} does not exist",
                settings.display()
            )));
        }
    }
    Ok(())
}

async fn load_settings(path: Option<&Path>) -> SettingsDocument {
    match path {
        Some(path) => SettingsDocument::load(path)
            .await
            .unwrap_or_else(SettingsDocument::empty),
        None => SettingsDocument::empty(),
    }
}

fn apply(step: &str, result: SettingsResult<MutationOutcome>) {
    match result {
        Ok(MutationOutcome::Applied) => debug!(step, "settings updated"),
        Ok(MutationOutcome::Unchanged) => debug!(step, "settings already up to date"),
        Ok(MutationOutcome::Unsupported { reason }) => {
            warn!(step, %reason, "settings change skipped")
        }
        Err(e) => warn!(step, error = %e, "settings change failed"),
    }
}

fn apply_mutations(
    settings: &mut SettingsDocument,
    config: &RunConfiguration,
    caps: &Capabilities,
    tia: Option<&TiaState>,
    baseline: Option<&str>,
) {
    if caps.parallel {
        apply("parallel", settings.set_parallel());
    }
    if let Some(tia) = tia {
        if config.tia.disable_data_collector {
            debug!("impact data collector disabled by configuration");
        } else {
            apply(
                "impact collector",
                settings.add_data_collector(DataCollector::test_impact(tia)),
            );
        }
    }
    if let Some(raw) = config.override_parameters.as_deref().filter(|p| !p.trim().is_empty()) {
        match parse_override_parameters(raw) {
            Ok(overrides) => apply("override parameters", settings.set_override_parameters(&overrides)),
            Err(e) => warn!(error = %e, "ignoring malformed override parameters"),
        }
    }
    if config.screen_recorder {
        apply(
            "screen recorder",
            settings.add_data_collector(DataCollector::screen_recorder()),
        );
    }
    if config.code_coverage {
        apply("code coverage", settings.enable_code_coverage());
    }
    if config.is_distributed() {
        if let (Some(_), Some(id)) = (tia, baseline) {
            apply("impact baseline", settings.set_tia_baseline(id));
        }
    }
}

fn persist_settings(
    settings: &SettingsDocument,
    config: &RunConfiguration,
    scratch: &Path,
) -> Option<PersistedSettings> {
    settings.kind()?;
    match settings.persist(scratch, config.mutate_settings_in_place) {
        Ok(persisted) => {
            if persisted.is_temporary() {
                debug!(path = %persisted.path().display(), "wrote temporary settings file");
            }
            Some(persisted)
        }
        Err(e) => {
            warn!(error = %e, "could not write settings, using the original file");
            config.settings_file.clone().map(PersistedSettings::original)
        }
    }
}

fn cleanup_settings(persisted: Option<PersistedSettings>) {
    if let Some(persisted) = persisted {
        if let Err(e) = persisted.cleanup() {
            warn!(error = %e, "could not remove temporary settings file");
        }
    }
}

fn results_directory(
    config: &RunConfiguration,
    settings: &SettingsDocument,
    settings_path: Option<&Path>,
) -> PathBuf {
    if let Some(dir) = &config.results_directory {
        return dir.clone();
    }
    let from_settings = settings
        .source()
        .or(settings_path)
        .and_then(|path| settings.results_directory(path));
    from_settings.unwrap_or_else(|| config.working_directory.join("TestResults"))
}

fn plan_distribution(
    config: &RunConfiguration,
    agent_count: i64,
    sources: &[PathBuf],
    discovered: Option<&DiscoveredTests>,
) -> BatchPlan {
    let policy = &config.distribution;
    let request = match discovered {
        Some(discovered) => {
            let mut request = PlanRequest::new(
                agent_count,
                policy.strategy,
                policy.size_hint,
                discovered.len(),
            )
            .with_assemblies(sources.len());
            if policy.strategy == BatchStrategy::ExecutionTimeBased && !policy.timings.is_empty() {
                let durations = discovered
                    .tests
                    .iter()
                    .map(|t| policy.timings.get(t).copied())
                    .collect();
                request = request.with_durations(durations);
            }
            request
        }
        None => {
            warn!("no discovered tests to slice, distributing whole sources");
            PlanRequest::new(agent_count, BatchStrategy::AssemblyBased, None, sources.len())
                .with_assemblies(sources.len())
        }
    };

    let plan = BatchPlanner::plan(&request);
    for warning in &plan.warnings {
        warn!(%warning, "batch planning");
    }
    info!(
        strategy = plan.strategy.name(),
        slices = plan.slices.len(),
        agents = plan.agent_count,
        "planned test slices"
    );
    plan
}

fn agent_selection(
    plan: &BatchPlan,
    agent_index: usize,
    sources: &[PathBuf],
    discovered: Option<&DiscoveredTests>,
) -> (Option<Selection>, SelectionSummary) {
    let mine: Vec<_> = plan
        .slices_for_agent(agent_index)
        .filter(|slice| !slice.is_empty())
        .collect();
    let summary = SelectionSummary::Slice {
        slices: mine.iter().map(|s| s.index).collect(),
    };
    let Some(first) = mine.first() else {
        info!(agent_index, "no slices assigned to this agent");
        return (None, summary);
    };

    let selection = match first.unit {
        SliceUnit::Assemblies => Selection::Assemblies(
            mine.iter()
                .flat_map(|slice| slice.select(sources))
                .cloned()
                .collect(),
        ),
        SliceUnit::TestCases => {
            let tests = discovered.map(|d| d.tests.as_slice()).unwrap_or_default();
            Selection::Tests(
                mine.iter()
                    .flat_map(|slice| slice.select(tests))
                    .cloned()
                    .collect(),
            )
        }
    };
    info!(agent_index, slices = mine.len(), selection = selection.name(), "selected slices for this agent");
    (Some(selection), summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use testrig_core::{DistributionPolicy, PlatformCapabilities, TiaPolicy};

    fn discovered(n: usize) -> DiscoveredTests {
        DiscoveredTests {
            tests: (0..n).map(|i| format!("N.T{i}")).collect(),
            list_file: PathBuf::from("/tmp/list.txt"),
        }
    }

    fn distributed(strategy: BatchStrategy, size_hint: Option<u64>, agents: i64) -> RunConfiguration {
        RunConfiguration {
            test_sources: vec!["**/*.dll".to_string()],
            distribution: DistributionPolicy {
                mode: ExecutionMode::Distributed {
                    agent_count: agents,
                    agent_index: 0,
                },
                strategy,
                size_hint,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_capability_gating_disables_unsupported_features() {
        let config = RunConfiguration {
            run_in_parallel: true,
            tia: TiaPolicy {
                enabled: true,
                ..Default::default()
            },
            platform: PlatformCapabilities {
                supports_parallel: false,
                supports_impact_analysis: false,
                ..Default::default()
            },
            ..Default::default()
        };
        let caps = Capabilities::gate(&config);
        assert!(!caps.parallel);
        assert!(!caps.impact_analysis);
        assert!(caps.response_files);
    }

    #[test]
    fn test_agent_selection_by_test_count() {
        let config = distributed(BatchStrategy::TestCaseCountBased, Some(25), 4);
        let sources = vec![PathBuf::from("/b/A.dll")];
        let tests = discovered(100);
        let plan = plan_distribution(&config, 4, &sources, Some(&tests));
        assert_eq!(plan.slices.len(), 4);

        let (selection, summary) = agent_selection(&plan, 2, &sources, Some(&tests));
        match selection {
            Some(Selection::Tests(names)) => {
                assert_eq!(names.len(), 25);
                assert_eq!(names[0], "N.T50");
            }
            other => panic!("unexpected selection {other:?}"),
        }
        assert_eq!(summary, SelectionSummary::Slice { slices: vec![2] });
    }

    #[test]
    fn test_agent_selection_by_assembly() {
        let config = distributed(BatchStrategy::AssemblyBased, None, 2);
        let sources = vec![
            PathBuf::from("/b/A.dll"),
            PathBuf::from("/b/B.dll"),
            PathBuf::from("/b/C.dll"),
        ];
        let plan = plan_distribution(&config, 2, &sources, Some(&discovered(9)));
        let (selection, _) = agent_selection(&plan, 0, &sources, None);
        assert_eq!(
            selection,
            Some(Selection::Assemblies(vec![
                PathBuf::from("/b/A.dll"),
                PathBuf::from("/b/C.dll"),
            ]))
        );
    }

    #[test]
    fn test_agent_without_slices_gets_nothing() {
        let config = distributed(BatchStrategy::TestCaseCountBased, Some(10), 4);
        let sources = vec![PathBuf::from("/b/A.dll")];
        let tests = discovered(10);
        let plan = plan_distribution(&config, 4, &sources, Some(&tests));
        let (selection, summary) = agent_selection(&plan, 3, &sources, Some(&tests));
        assert!(selection.is_none());
        assert_eq!(summary, SelectionSummary::Slice { slices: vec![] });
    }

    #[test]
    fn test_undiscovered_run_slices_sources() {
        let config = distributed(BatchStrategy::TestCaseCountBased, Some(10), 2);
        let sources = vec![PathBuf::from("/b/A.dll"), PathBuf::from("/b/B.dll")];
        let plan = plan_distribution(&config, 2, &sources, None);
        assert_eq!(plan.strategy, BatchStrategy::AssemblyBased);
        let (selection, _) = agent_selection(&plan, 1, &sources, None);
        assert_eq!(
            selection,
            Some(Selection::Assemblies(vec![PathBuf::from("/b/B.dll")]))
        );
    }

    #[tokio::test]
    async fn test_synthesize_settings_applies_enabled_features() {
        let config = RunConfiguration {
            run_in_parallel: true,
            code_coverage: true,
            ..Default::default()
        };
        let settings = synthesize_settings(&config).await;
        let xml = settings.serialize().unwrap();
        assert!(xml.contains("MaxCpuCount"));
        assert!(xml.contains("Code Coverage"));

        let none = synthesize_settings(&RunConfiguration::default()).await;
        assert!(none.kind().is_none());
    }

    #[test]
    fn test_results_directory_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RunConfiguration {
            working_directory: dir.path().to_path_buf(),
            ..Default::default()
        };
        let settings = SettingsDocument::empty();
        assert_eq!(
            results_directory(&config, &settings, None),
            dir.path().join("TestResults")
        );

        config.results_directory = Some(PathBuf::from("/out"));
        assert_eq!(results_directory(&config, &settings, None), PathBuf::from("/out"));
    }

    #[test]
    fn test_validate_checks_filesystem() {
        let config = RunConfiguration {
            test_sources: vec!["**/*.dll".to_string()],
            working_directory: PathBuf::from("/nonexistent/testrig-wd"),
            ..Default::default()
        };
        assert!(matches!(validate(&config), Err(RunError::Configuration(_))));

        let dir = tempfile::tempdir().unwrap();
        let config = RunConfiguration {
            test_sources: vec!["**/*.dll".to_string()],
            working_directory: dir.path().to_path_buf(),
            settings_file: Some(dir.path().join("missing.runsettings")),
            ..Default::default()
        };
        assert!(matches!(validate(&config), Err(RunError::Configuration(_))));
    }
}
