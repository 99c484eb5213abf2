//! Per-run impact-analysis state.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::config::{TiaContext, TiaPolicy};

/// Impact-analysis state built once per run from [`TiaPolicy`].
///
/// Everything except the baseline id is fixed at construction. The
/// baseline is learned from the publish step and can be recorded once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TiaState {
    pub enabled: bool,
    pub use_file_level: bool,
    pub rebase_limit: Option<u32>,
    pub sources_dir: Option<PathBuf>,
    pub filter_paths: Option<String>,
    pub user_map_file: Option<PathBuf>,
    pub context: TiaContext,
    pub pr_flow: bool,
    baseline_id: Option<String>,
}

impl TiaState {
    /// Fresh per-run state; no baseline recorded yet.
    pub fn from_policy(policy: &TiaPolicy) -> Self {
        Self {
            enabled: policy.enabled,
            use_file_level: policy.use_file_level,
            rebase_limit: policy.rebase_limit,
            sources_dir: policy.sources_dir.clone(),
            filter_paths: policy.filter_paths.clone(),
            user_map_file: policy.user_map_file.clone(),
            context: policy.context,
            pr_flow: policy.pr_flow,
            baseline_id: None,
        }
    }

    /// State for runs without impact analysis.
    pub fn disabled() -> Self {
        Self::from_policy(&TiaPolicy::default())
    }

    /// Baseline run the helper compared against, once published.
    pub fn baseline_id(&self) -> Option<&str> {
        self.baseline_id.as_deref()
    }

    /// Record the baseline run id. Returns `false` if one was already set.
    pub fn record_baseline(&mut self, id: impl Into<String>) -> bool {
        if self.baseline_id.is_some() {
            tracing::warn!("impact baseline already recorded, ignoring new value");
            return false;
        }
        self.baseline_id = Some(id.into());
        true
    }

    /// Impact level understood by the impact collector.
    pub fn impact_level(&self) -> &'static str {
        if self.use_file_level {
            "file"
        } else {
            "method"
        }
    }

    /// Root path written into the impact collector configuration.
    ///
    /// Release pipelines have no source checkout to map against.
    pub fn collector_root_path(&self) -> String {
        match (self.context, &self.sources_dir) {
            (TiaContext::Release, _) | (_, None) => String::new(),
            (TiaContext::Build, Some(dir)) => dir.display().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baseline_is_write_once() {
        let mut state = TiaState::disabled();
        assert!(state.baseline_id().is_none());
        assert!(state.record_baseline("1042"));
        assert!(!state.record_baseline("2000"));
        assert_eq!(state.baseline_id(), Some("1042"));
    }

    #[test]
    fn test_impact_level_follows_policy() {
        let policy = TiaPolicy {
            use_file_level: false,
            ..Default::default()
        };
        assert_eq!(TiaState::from_policy(&policy).impact_level(), "method");
        assert_eq!(TiaState::disabled().impact_level(), "file");
    }

    #[test]
    fn test_release_context_has_empty_root() {
        let policy = TiaPolicy {
            sources_dir: Some(PathBuf::from("/src")),
            context: TiaContext::Release,
            ..Default::default()
        };
        assert_eq!(TiaState::from_policy(&policy).collector_root_path(), "");

        let policy = TiaPolicy {
            sources_dir: Some(PathBuf::from("/src")),
            ..Default::default()
        };
        assert_eq!(TiaState::from_policy(&policy).collector_root_path(), "/src");
    }
}
