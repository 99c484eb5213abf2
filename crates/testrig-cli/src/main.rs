//! testrig - test-execution orchestration CLI
//!
//! The `testrig` command drives a native test engine for one run.
//!
//! ## Commands
//!
//! - `run`: resolve, select, slice, execute and rerun tests from a config file
//! - `plan`: show how a test set would be sliced across agents
//! - `settings`: print the settings document a run would hand the engine

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use testrig_core::{
    init_tracing, BatchPlan, BatchPlanner, BatchStrategy, ExecutionMode, LogFormat, PlanRequest,
    ProxySettings, RunConfiguration, RunOutcome, RunReport, SelectionSummary,
};
use testrig_exec::{synthesize_settings, DirectoryPublisher, LogPublisher, Orchestrator, ResultPublisher};
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "testrig")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Test-execution orchestration for native test engines", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a test run described by a configuration file
    Run {
        /// Run configuration (.toml or .json)
        #[arg(short, long)]
        config: PathBuf,

        /// This agent's index in a distributed run
        #[arg(long, env = "TESTRIG_AGENT_INDEX")]
        agent_index: Option<usize>,

        /// Report test failures as success
        #[arg(long)]
        ignore_failures: bool,

        /// Copy report files into this directory after the run
        #[arg(long)]
        publish_dir: Option<PathBuf>,

        /// Write the run report as JSON to this path
        #[arg(long)]
        report_json: Option<PathBuf>,

        #[command(flatten)]
        secrets: SecretArgs,
    },

    /// Show how tests would be sliced across agents
    Plan {
        /// Number of agents
        #[arg(short, long, default_value = "1", allow_hyphen_values = true)]
        agents: i64,

        /// Slicing strategy
        #[arg(short, long, value_enum, default_value = "test-case-count")]
        strategy: StrategyArg,

        /// Tests per slice, or milliseconds per slice for time-based plans
        #[arg(long)]
        size: Option<u64>,

        /// Number of discovered tests
        #[arg(short, long)]
        count: usize,

        /// Number of test assemblies
        #[arg(long, default_value = "0")]
        assemblies: usize,
    },

    /// Print the settings document a run would use
    Settings {
        /// Run configuration (.toml or .json)
        #[arg(short, long)]
        config: PathBuf,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Credentials only ever taken from flags or the environment.
#[derive(clap::Args, Debug, Default)]
struct SecretArgs {
    /// Access token for the impact analysis service
    #[arg(long, env = "TESTRIG_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    /// Proxy for child processes
    #[arg(long, env = "TESTRIG_PROXY_URL")]
    proxy_url: Option<String>,

    #[arg(long, env = "TESTRIG_PROXY_USERNAME")]
    proxy_username: Option<String>,

    #[arg(long, env = "TESTRIG_PROXY_PASSWORD", hide_env_values = true)]
    proxy_password: Option<String>,

    #[arg(long, env = "TESTRIG_PROXY_BYPASS_LIST")]
    proxy_bypass_list: Option<String>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StrategyArg {
    Assembly,
    TestCaseCount,
    ExecutionTime,
}

impl From<StrategyArg> for BatchStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Assembly => BatchStrategy::AssemblyBased,
            StrategyArg::TestCaseCount => BatchStrategy::TestCaseCountBased,
            StrategyArg::ExecutionTime => BatchStrategy::ExecutionTimeBased,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    init_tracing(LogFormat::from_json_flag(cli.json), level);

    match dispatch(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}

async fn dispatch(command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Run {
            config,
            agent_index,
            ignore_failures,
            publish_dir,
            report_json,
            secrets,
        } => {
            let mut config = load_config(&config)?;
            apply_overrides(&mut config, agent_index, ignore_failures, secrets);
            cmd_run(&config, publish_dir, report_json.as_deref()).await
        }
        Commands::Plan {
            agents,
            strategy,
            size,
            count,
            assemblies,
        } => {
            cmd_plan(agents, strategy.into(), size, count, assemblies)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Settings { config, output } => {
            let config = load_config(&config)?;
            cmd_settings(&config, output.as_deref()).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Read a run configuration; `.json` files are JSON, anything else TOML.
fn load_config(path: &Path) -> Result<RunConfiguration> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let config = if is_json {
        serde_json::from_str(&text)
            .with_context(|| format!("Invalid JSON config {}", path.display()))?
    } else {
        toml::from_str(&text).with_context(|| format!("Invalid TOML config {}", path.display()))?
    };
    Ok(config)
}

fn apply_overrides(
    config: &mut RunConfiguration,
    agent_index: Option<usize>,
    ignore_failures: bool,
    secrets: SecretArgs,
) {
    if let Some(index) = agent_index {
        match &mut config.distribution.mode {
            ExecutionMode::Distributed { agent_index, .. } => *agent_index = index,
            ExecutionMode::Local => warn!(index, "agent index ignored for a local run"),
        }
    }
    if ignore_failures {
        config.ignore_failures = true;
    }
    if secrets.access_token.is_some() {
        config.environment.access_token = secrets.access_token;
    }
    if let Some(url) = secrets.proxy_url {
        config.environment.proxy = Some(ProxySettings {
            url,
            username: secrets.proxy_username,
            password: secrets.proxy_password,
            bypass_list: secrets.proxy_bypass_list,
        });
    }
}

async fn cmd_run(
    config: &RunConfiguration,
    publish_dir: Option<PathBuf>,
    report_json: Option<&Path>,
) -> Result<ExitCode> {
    let publisher: Arc<dyn ResultPublisher> = match publish_dir {
        Some(dir) => Arc::new(DirectoryPublisher::new(dir)),
        None => Arc::new(LogPublisher),
    };
    let orchestrator = Orchestrator::native(config, publisher);
    let report = orchestrator.run(config).await.context("Test run aborted")?;

    print_report(&report);
    if let Some(path) = report_json {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report {}", path.display()))?;
        info!(path = %path.display(), "wrote run report");
    }
    Ok(ExitCode::from(exit_status(&report.outcome)))
}

/// 0 for success or skip, 1 for test failures. Hard errors exit with 2.
fn exit_status(outcome: &RunOutcome) -> u8 {
    match outcome {
        RunOutcome::Succeeded | RunOutcome::Skipped { .. } => 0,
        RunOutcome::Failed { .. } => 1,
    }
}

fn outcome_line(outcome: &RunOutcome) -> String {
    match outcome {
        RunOutcome::Succeeded => "✓ SUCCEEDED".to_string(),
        RunOutcome::Failed { reason } => format!("✗ FAILED: {reason}"),
        RunOutcome::Skipped { reason } => format!("- SKIPPED: {reason}"),
    }
}

fn selection_line(selection: &SelectionSummary) -> String {
    match selection {
        SelectionSummary::Full => "all discovered tests".to_string(),
        SelectionSummary::Fallback { reason } => format!("all tests (impact analysis fell back: {reason})"),
        SelectionSummary::NoImpactedTests => "no impacted tests".to_string(),
        SelectionSummary::Impacted { clauses } => format!("impacted tests ({clauses} clauses)"),
        SelectionSummary::Slice { slices } => format!("slices {slices:?}"),
        SelectionSummary::NothingToRun => "nothing to run".to_string(),
    }
}

fn print_report(report: &RunReport) {
    println!("Run:        {}", report.run_id);
    println!("Outcome:    {}", outcome_line(&report.outcome));
    println!("Selection:  {}", selection_line(&report.selection));
    println!("Discovered: {}", report.discovered);
    println!(
        "Executions: {} ({} reruns)",
        report.execution_count(),
        report.rerun_count()
    );
    for attempt in &report.attempts {
        let status = if attempt.passed() { "✓" } else { "✗" };
        println!(
            "  {} attempt {} exit={} failed={} {}ms",
            status,
            attempt.attempt,
            attempt.exit_code,
            attempt.failed_test_ids.len(),
            attempt.duration_ms
        );
    }
    println!("Duration:   {}ms", report.duration_ms);
}

fn build_plan(
    agents: i64,
    strategy: BatchStrategy,
    size: Option<u64>,
    count: usize,
    assemblies: usize,
) -> BatchPlan {
    let request = PlanRequest::new(agents, strategy, size, count).with_assemblies(assemblies);
    BatchPlanner::plan(&request)
}

fn cmd_plan(
    agents: i64,
    strategy: BatchStrategy,
    size: Option<u64>,
    count: usize,
    assemblies: usize,
) -> Result<()> {
    if strategy == BatchStrategy::ExecutionTimeBased {
        warn!("no timing history is available from the command line, slices are sized by count");
    }
    let plan = build_plan(agents, strategy, size, count, assemblies);
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

async fn cmd_settings(config: &RunConfiguration, output: Option<&Path>) -> Result<()> {
    let settings = synthesize_settings(config).await;
    if settings.kind().is_none() {
        bail!("this configuration needs no settings document");
    }
    let xml = settings.serialize().context("Failed to serialize settings")?;
    match output {
        Some(path) => {
            std::fs::write(path, xml)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("✓ Settings written to {}", path.display());
        }
        None => println!("{xml}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use testrig_core::RerunAdmission;

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "testrig",
            "--json",
            "run",
            "--config",
            "ci.toml",
            "--agent-index",
            "2",
            "--ignore-failures",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Run {
                config,
                agent_index,
                ignore_failures,
                ..
            } => {
                assert_eq!(config, PathBuf::from("ci.toml"));
                assert_eq!(agent_index, Some(2));
                assert!(ignore_failures);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_load_toml_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ci.toml");
        std::fs::write(
            &path,
            r#"
test_sources = ["**/*Tests.dll"]
run_in_parallel = true

[rerun]
enabled = true
max_attempts = 2
admission = { type = "count_based", max_failed_tests = 5 }

[distribution]
strategy = "test_case_count_based"
size_hint = 25
mode = { mode = "distributed", agent_count = 4, agent_index = 0 }
"#,
        )
        .unwrap();
        let config = load_config(&path).unwrap();
        assert!(config.run_in_parallel);
        assert_eq!(
            config.rerun.admission,
            RerunAdmission::CountBased { max_failed_tests: 5 }
        );
        assert!(config.is_distributed());
    }

    #[test]
    fn test_load_json_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ci.json");
        std::fs::write(&path, r#"{"test_sources": ["*.dll"], "ignore_failures": true}"#).unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.test_sources, vec!["*.dll"]);
        assert!(config.ignore_failures);
    }

    #[test]
    fn test_load_config_reports_path() {
        let err = load_config(Path::new("/nonexistent/ci.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/ci.toml"));
    }

    #[test]
    fn test_overrides_apply_agent_index_and_secrets() {
        let mut config = RunConfiguration {
            distribution: testrig_core::DistributionPolicy {
                mode: ExecutionMode::Distributed {
                    agent_count: 4,
                    agent_index: 0,
                },
                ..Default::default()
            },
            ..Default::default()
        };
        let secrets = SecretArgs {
            access_token: Some("tok".to_string()),
            proxy_url: Some("http://proxy:8080".to_string()),
            ..Default::default()
        };
        apply_overrides(&mut config, Some(3), true, secrets);

        assert_eq!(
            config.distribution.mode,
            ExecutionMode::Distributed {
                agent_count: 4,
                agent_index: 3
            }
        );
        assert!(config.ignore_failures);
        assert_eq!(config.environment.access_token.as_deref(), Some("tok"));
        assert_eq!(config.environment.proxy.unwrap().url, "http://proxy:8080");
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_status(&RunOutcome::Succeeded), 0);
        assert_eq!(exit_status(&RunOutcome::skipped("none")), 0);
        assert_eq!(exit_status(&RunOutcome::failed("boom")), 1);
    }

    #[test]
    fn test_plan_four_agents() {
        let plan = build_plan(4, BatchStrategy::TestCaseCountBased, Some(25), 100, 0);
        assert_eq!(plan.slices.len(), 4);
        assert!(plan.slices.iter().all(|s| s.len == 25));
    }

    #[tokio::test]
    async fn test_settings_written_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.runsettings");
        let config = RunConfiguration {
            run_in_parallel: true,
            ..Default::default()
        };
        cmd_settings(&config, Some(&out)).await.unwrap();
        let xml = std::fs::read_to_string(&out).unwrap();
        assert!(xml.contains("<RunSettings>"));
    }
}
