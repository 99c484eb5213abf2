//! Run configuration: the validated, read-only input of one test run.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::error::{Result, RunError};
use crate::batch::BatchStrategy;

/// Environment variable carrying the access token to child processes.
pub const ENV_ACCESS_TOKEN: &str = "TESTRIG_ACCESS_TOKEN";
/// Proxy settings read by the CLI and forwarded to child processes.
pub const ENV_PROXY_URL: &str = "TESTRIG_PROXY_URL";
pub const ENV_PROXY_USERNAME: &str = "TESTRIG_PROXY_USERNAME";
pub const ENV_PROXY_PASSWORD: &str = "TESTRIG_PROXY_PASSWORD";
pub const ENV_PROXY_BYPASS: &str = "TESTRIG_PROXY_BYPASS_LIST";

/// Everything the orchestrator needs to know about one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfiguration {
    /// Glob patterns selecting test sources; a leading `!` excludes.
    pub test_sources: Vec<String>,

    /// Root directory the source patterns are matched against.
    pub search_folder: PathBuf,

    /// Working directory of the engine process.
    pub working_directory: PathBuf,

    /// Caller-supplied settings document (`.runsettings` or `.testsettings`).
    pub settings_file: Option<PathBuf>,

    /// Mutate the caller's settings file in place instead of a temporary copy.
    pub mutate_settings_in_place: bool,

    /// Raw override string, e.g. `-endpoint http://x -retries 3`.
    pub override_parameters: Option<String>,

    /// Static test-case filter expression.
    pub test_case_filter: Option<String>,

    /// Extra options appended verbatim to every engine invocation.
    pub other_console_options: Option<String>,

    pub run_in_parallel: bool,
    pub run_in_isolation: bool,
    pub code_coverage: bool,

    /// Attach the screen recorder collector (test settings only).
    pub screen_recorder: bool,

    /// Report success even when tests fail.
    pub ignore_failures: bool,

    pub custom_adapters_path: Option<PathBuf>,

    /// Where reports are written. Falls back to the settings document,
    /// then `<working_directory>/TestResults`.
    pub results_directory: Option<PathBuf>,

    /// Wall-clock budget for the whole run, checked between invocations.
    pub deadline_secs: Option<u64>,

    pub rerun: RerunPolicy,
    pub tia: TiaPolicy,
    pub distribution: DistributionPolicy,
    pub platform: PlatformCapabilities,
    pub environment: ExecutionEnvironment,
}

impl Default for RunConfiguration {
    fn default() -> Self {
        Self {
            test_sources: Vec::new(),
            search_folder: PathBuf::from("."),
            working_directory: PathBuf::from("."),
            settings_file: None,
            mutate_settings_in_place: false,
            override_parameters: None,
            test_case_filter: None,
            other_console_options: None,
            run_in_parallel: false,
            run_in_isolation: false,
            code_coverage: false,
            screen_recorder: false,
            ignore_failures: false,
            custom_adapters_path: None,
            results_directory: None,
            deadline_secs: None,
            rerun: RerunPolicy::default(),
            tia: TiaPolicy::default(),
            distribution: DistributionPolicy::default(),
            platform: PlatformCapabilities::default(),
            environment: ExecutionEnvironment::default(),
        }
    }
}

impl RunConfiguration {
    /// Structural validation. Filesystem checks happen in the orchestrator.
    pub fn validate(&self) -> Result<()> {
        if self.test_sources.iter().all(|p| p.trim().is_empty()) {
            return Err(RunError::configuration("test sources cannot be empty"));
        }
        if self.test_sources.iter().all(|p| p.trim_start().starts_with('!')) {
            return Err(RunError::configuration(
                "test sources must contain at least one include pattern",
            ));
        }
        if self.rerun.enabled {
            if self.rerun.max_attempts == 0 {
                return Err(RunError::configuration(
                    "rerun max_attempts must be greater than zero",
                ));
            }
            match self.rerun.admission {
                RerunAdmission::CountBased { max_failed_tests: 0 } => {
                    return Err(RunError::configuration(
                        "rerun max_failed_tests must be greater than zero",
                    ));
                }
                RerunAdmission::PercentageBased { threshold_percent }
                    if threshold_percent == 0 || threshold_percent > 100 =>
                {
                    return Err(RunError::configuration(format!(
                        "rerun threshold_percent must be within 1..=100, got {threshold_percent}"
                    )));
                }
                _ => {}
            }
        }
        if let ExecutionMode::Distributed {
            agent_count,
            agent_index,
        } = self.distribution.mode
        {
            if agent_count > 0 && agent_index as i64 >= agent_count {
                return Err(RunError::configuration(format!(
                    "agent index {agent_index} is outside agent count {agent_count}"
                )));
            }
        }
        if self.tia.enabled && self.tia.helper_path.as_os_str().is_empty() {
            return Err(RunError::configuration(
                "impact analysis is enabled but no helper path is configured",
            ));
        }
        Ok(())
    }

    /// Stable fingerprint of the non-secret configuration.
    pub fn digest(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(hex::encode(hasher.finalize()))
    }

    pub fn is_distributed(&self) -> bool {
        matches!(self.distribution.mode, ExecutionMode::Distributed { .. })
    }
}

/// Rerun behaviour for failed tests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RerunPolicy {
    pub enabled: bool,

    /// Maximum number of reruns after the initial attempt.
    pub max_attempts: u32,

    pub admission: RerunAdmission,
}

impl Default for RerunPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: 3,
            admission: RerunAdmission::default(),
        }
    }
}

/// When a failing set is small enough to be worth rerunning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RerunAdmission {
    /// Abort when distinct failures exceed the limit.
    CountBased { max_failed_tests: usize },

    /// Abort when the failing share exceeds the threshold.
    PercentageBased { threshold_percent: u32 },
}

impl Default for RerunAdmission {
    fn default() -> Self {
        RerunAdmission::PercentageBased {
            threshold_percent: 30,
        }
    }
}

/// Whether the run happens inside a build or a release pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TiaContext {
    #[default]
    Build,
    Release,
}

impl TiaContext {
    /// Value the impact helper expects for `context`.
    pub fn as_str(&self) -> &'static str {
        match self {
            TiaContext::Build => "CI",
            TiaContext::Release => "CD",
        }
    }
}

/// Test-impact-analysis settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TiaPolicy {
    pub enabled: bool,

    /// Native helper implementing the publish/select/upload verbs.
    pub helper_path: PathBuf,

    /// File-level impact instead of method-level.
    pub use_file_level: bool,

    pub rebase_limit: Option<u32>,
    pub sources_dir: Option<PathBuf>,

    /// Path filters forwarded verbatim to the helper.
    pub filter_paths: Option<String>,

    pub user_map_file: Option<PathBuf>,
    pub context: TiaContext,

    /// Pull-request validation run.
    pub pr_flow: bool,

    /// Skip injecting the impact collector into the settings document.
    pub disable_data_collector: bool,

    /// Identifiers of the pipeline run handed to the helper. The run id is
    /// the build id in build context and the release id in release context.
    pub collection_url: Option<String>,
    pub team_project: Option<String>,
    #[serde(alias = "build_id")]
    pub definition_run_id: Option<String>,
    pub definition_id: Option<String>,

    /// Labels of the test run the helper creates.
    pub test_run_title: Option<String>,
    pub build_platform: Option<String>,
    pub build_configuration: Option<String>,

    /// Let the helper put a `/TestCaseFilter:` clause in its response.
    pub test_case_filter_in_response: bool,

    pub helper_timeout_secs: Option<u64>,
}

impl Default for TiaPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            helper_path: PathBuf::new(),
            use_file_level: true,
            rebase_limit: None,
            sources_dir: None,
            filter_paths: None,
            user_map_file: None,
            context: TiaContext::Build,
            pr_flow: false,
            disable_data_collector: false,
            collection_url: None,
            team_project: None,
            definition_run_id: None,
            definition_id: None,
            test_run_title: None,
            build_platform: None,
            build_configuration: None,
            test_case_filter_in_response: false,
            helper_timeout_secs: Some(600),
        }
    }
}

/// Local single-agent run or one agent out of many.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Local,
    Distributed { agent_count: i64, agent_index: usize },
}

/// How tests are split across agents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct DistributionPolicy {
    pub mode: ExecutionMode,
    pub strategy: BatchStrategy,

    /// Tests per slice, or milliseconds per slice for time-based plans.
    pub size_hint: Option<u64>,

    /// Historical durations in milliseconds keyed by test name.
    pub timings: BTreeMap<String, u64>,
}

/// What the installed engine can do.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlatformCapabilities {
    pub engine_path: PathBuf,
    pub engine_version: Option<String>,
    pub supports_parallel: bool,
    pub supports_impact_analysis: bool,
    pub supports_response_files: bool,
}

impl Default for PlatformCapabilities {
    fn default() -> Self {
        Self {
            engine_path: PathBuf::from("vstest.console"),
            engine_version: None,
            supports_parallel: true,
            supports_impact_analysis: true,
            supports_response_files: true,
        }
    }
}

/// Secrets and network settings handed to child processes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ExecutionEnvironment {
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    pub proxy: Option<ProxySettings>,
}

/// Outbound proxy for the engine and the impact helper.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ProxySettings {
    pub url: String,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub bypass_list: Option<String>,
}

impl ExecutionEnvironment {
    /// Environment pairs for the engine process.
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if let Some(token) = &self.access_token {
            pairs.push((ENV_ACCESS_TOKEN.to_string(), token.clone()));
        }
        if let Some(proxy) = &self.proxy {
            pairs.push((ENV_PROXY_URL.to_string(), proxy.url.clone()));
            if let Some(user) = &proxy.username {
                pairs.push((ENV_PROXY_USERNAME.to_string(), user.clone()));
            }
            if let Some(password) = &proxy.password {
                pairs.push((ENV_PROXY_PASSWORD.to_string(), password.clone()));
            }
            if let Some(bypass) = &proxy.bypass_list {
                pairs.push((ENV_PROXY_BYPASS.to_string(), bypass.clone()));
            }
        }
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RunConfiguration {
        RunConfiguration {
            test_sources: vec!["**/*Tests.dll".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_default_with_sources_is_valid() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_empty_sources_rejected() {
        let cfg = RunConfiguration::default();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("test sources cannot be empty"));
    }

    #[test]
    fn test_exclude_only_sources_rejected() {
        let cfg = RunConfiguration {
            test_sources: vec!["!**/obj/**".to_string()],
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rerun_limits_validated() {
        let mut cfg = config();
        cfg.rerun.enabled = true;
        cfg.rerun.max_attempts = 0;
        assert!(cfg.validate().is_err());

        cfg.rerun.max_attempts = 2;
        cfg.rerun.admission = RerunAdmission::PercentageBased {
            threshold_percent: 101,
        };
        assert!(cfg.validate().is_err());

        cfg.rerun.admission = RerunAdmission::CountBased { max_failed_tests: 5 };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_agent_index_out_of_range() {
        let mut cfg = config();
        cfg.distribution.mode = ExecutionMode::Distributed {
            agent_count: 2,
            agent_index: 2,
        };
        assert!(cfg.validate().is_err());

        // Non-positive counts are corrected by the planner, not rejected.
        cfg.distribution.mode = ExecutionMode::Distributed {
            agent_count: 0,
            agent_index: 0,
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_digest_is_stable_and_ignores_secrets() {
        let mut a = config();
        let b = config();
        a.environment.access_token = Some("secret".to_string());
        assert_eq!(a.digest().unwrap(), b.digest().unwrap());
        assert_eq!(a.digest().unwrap().len(), 64);

        a.run_in_parallel = true;
        assert_ne!(a.digest().unwrap(), b.digest().unwrap());
    }

    #[test]
    fn test_env_pairs_carry_token_and_proxy() {
        let env = ExecutionEnvironment {
            access_token: Some("tok".to_string()),
            proxy: Some(ProxySettings {
                url: "http://proxy:8080".to_string(),
                username: Some("me".to_string()),
                password: Some("pw".to_string()),
                bypass_list: None,
            }),
        };
        let pairs = env.env_pairs();
        assert!(pairs.contains(&(ENV_ACCESS_TOKEN.to_string(), "tok".to_string())));
        assert!(pairs.contains(&(ENV_PROXY_PASSWORD.to_string(), "pw".to_string())));
        assert_eq!(pairs.len(), 4);
    }

    #[test]
    fn test_deserialize_from_toml() {
        let text = r#"
            test_sources = ["**/*Tests.dll", "!**/obj/**"]
            run_in_parallel = true

            [rerun]
            enabled = true
            max_attempts = 2
            admission = { type = "count_based", max_failed_tests = 5 }

            [distribution]
            strategy = "test_case_count_based"
            size_hint = 25
            mode = { mode = "distributed", agent_count = 4, agent_index = 1 }
        "#;
        let cfg: RunConfiguration = toml::from_str(text).expect("parse config");
        assert!(cfg.run_in_parallel);
        assert_eq!(
            cfg.rerun.admission,
            RerunAdmission::CountBased { max_failed_tests: 5 }
        );
        assert_eq!(cfg.distribution.strategy, BatchStrategy::TestCaseCountBased);
        assert!(cfg.is_distributed());
        assert!(cfg.validate().is_ok());
    }
}
