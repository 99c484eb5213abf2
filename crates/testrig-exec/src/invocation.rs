//! Engine command lines: argument lists and response files.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::TempPath;
use testrig_core::{AttemptMode, Result, RunConfiguration};

use crate::response::ResponseFile;

/// Which tests an invocation covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Every resolved source, narrowed only by the static filter.
    Full,
    /// A subset of the sources.
    Assemblies(Vec<PathBuf>),
    /// Explicit fully-qualified test names.
    Tests(Vec<String>),
    /// Impact-analysis clauses, passed through a response file.
    Impacted(ResponseFile),
}

impl Selection {
    pub fn name(&self) -> &'static str {
        match self {
            Selection::Full => "full",
            Selection::Assemblies(_) => "assemblies",
            Selection::Tests(_) => "tests",
            Selection::Impacted(_) => "impacted",
        }
    }
}

/// One ready-to-run engine invocation.
///
/// A response file written for the invocation is deleted when the
/// invocation is dropped.
#[derive(Debug)]
pub struct Invocation {
    pub attempt: u32,
    pub mode: AttemptMode,
    pub report_path: PathBuf,
    response_file: Option<TempPath>,
}

impl Invocation {
    /// An argument-list invocation.
    pub fn from_args(attempt: u32, args: Vec<String>, report_path: PathBuf) -> Self {
        Self {
            attempt,
            mode: AttemptMode::ArgumentList { args },
            report_path,
            response_file: None,
        }
    }

    /// Arguments as passed on the command line.
    pub fn command_args(&self) -> Vec<String> {
        match &self.mode {
            AttemptMode::ArgumentList { args } => args.clone(),
            AttemptMode::ResponseFile { path } => vec![format!("@{}", path.display())],
        }
    }

    /// Path of the response file, for response-file invocations.
    pub fn response_file_path(&self) -> Option<&Path> {
        match &self.mode {
            AttemptMode::ResponseFile { path } => Some(path),
            AttemptMode::ArgumentList { .. } => None,
        }
    }

    /// Remove the response file now instead of on drop.
    pub fn cleanup(self) -> std::io::Result<()> {
        match self.response_file {
            Some(temp) => temp.close(),
            None => Ok(()),
        }
    }
}

/// Wrap `value` in double quotes unless it already is.
fn quote_arg(value: &str) -> String {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        value.to_string()
    } else {
        format!("\"{value}\"")
    }
}

/// Rewrite a console argument for a response file line.
///
/// `/Option:value` becomes `/Option:"value"`; bare values such as source
/// paths are quoted whole; valueless switches stay as they are.
pub fn response_file_line(arg: &str) -> String {
    if !arg.starts_with('/') {
        return quote_arg(arg);
    }
    match arg.split_once(':') {
        Some((option, value)) if !value.is_empty() => format!("{option}:{}", quote_arg(value)),
        _ => arg.to_string(),
    }
}

/// Builds invocations for one run.
#[derive(Debug, Clone)]
pub struct InvocationBuilder {
    sources: Vec<PathBuf>,
    settings: Option<PathBuf>,
    test_case_filter: Option<String>,
    code_coverage: bool,
    in_isolation: bool,
    adapters: Option<PathBuf>,
    other_options: Option<String>,
    results_dir: PathBuf,
    scratch_dir: PathBuf,
    run_tag: String,
}

impl InvocationBuilder {
    /// `run_tag` keeps report names of concurrent runs apart.
    pub fn new(
        config: &RunConfiguration,
        sources: Vec<PathBuf>,
        settings: Option<PathBuf>,
        results_dir: impl Into<PathBuf>,
        scratch_dir: impl Into<PathBuf>,
        run_tag: impl Into<String>,
    ) -> Self {
        Self {
            sources,
            settings,
            test_case_filter: config.test_case_filter.clone().filter(|f| !f.trim().is_empty()),
            code_coverage: config.code_coverage,
            in_isolation: config.run_in_isolation,
            adapters: config.custom_adapters_path.clone(),
            other_options: config
                .other_console_options
                .clone()
                .filter(|o| !o.trim().is_empty()),
            results_dir: results_dir.into(),
            scratch_dir: scratch_dir.into(),
            run_tag: run_tag.into(),
        }
    }

    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    /// Unique report location for `attempt`.
    pub fn report_path(&self, attempt: u32) -> PathBuf {
        self.results_dir
            .join(format!("testrig-{}-{attempt}.trx", self.run_tag))
    }

    fn source_args(sources: &[PathBuf]) -> Vec<String> {
        sources.iter().map(|s| s.display().to_string()).collect()
    }

    fn common_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(settings) = &self.settings {
            args.push(format!("/Settings:{}", settings.display()));
        }
        if self.code_coverage {
            args.push("/EnableCodeCoverage".to_string());
        }
        if self.in_isolation {
            args.push("/InIsolation".to_string());
        }
        if let Some(adapters) = &self.adapters {
            args.push(format!("/TestAdapterPath:{}", adapters.display()));
        }
        args
    }

    fn report_args(&self, attempt: u32) -> Vec<String> {
        let report = self.report_path(attempt);
        let name = report
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        vec![
            format!("/logger:trx;LogFileName={name}"),
            format!("/ResultsDirectory:{}", self.results_dir.display()),
        ]
    }

    fn other_args(&self) -> Vec<String> {
        self.other_options
            .as_deref()
            .map(|o| o.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }

    fn filter_arg(&self) -> Option<String> {
        self.test_case_filter
            .as_ref()
            .map(|f| format!("/TestCaseFilter:{f}"))
    }

    fn argument_list(&self, attempt: u32, head: Vec<String>) -> Invocation {
        let mut args = head;
        args.extend(self.common_args());
        args.extend(self.report_args(attempt));
        args.extend(self.other_args());
        Invocation::from_args(attempt, args, self.report_path(attempt))
    }

    /// Build the invocation for `selection`.
    pub fn build(&self, selection: &Selection, attempt: u32) -> Result<Invocation> {
        let invocation = match selection {
            Selection::Full => {
                let mut head = Self::source_args(&self.sources);
                head.extend(self.filter_arg());
                self.argument_list(attempt, head)
            }
            Selection::Assemblies(subset) => {
                let mut head = Self::source_args(subset);
                head.extend(self.filter_arg());
                self.argument_list(attempt, head)
            }
            Selection::Tests(names) => {
                let mut head = Self::source_args(&self.sources);
                head.push(format!("/Tests:{}", names.join(",")));
                self.argument_list(attempt, head)
            }
            Selection::Impacted(response) => self.response_file(response, attempt)?,
        };
        Ok(invocation)
    }

    /// Rerun restricted to `failing`.
    pub fn rerun(&self, failing: &BTreeSet<String>, attempt: u32) -> Invocation {
        let names: Vec<&str> = failing.iter().map(String::as_str).collect();
        let mut head = Self::source_args(&self.sources);
        head.push(format!("/Tests:{}", names.join(",")));
        self.argument_list(attempt, head)
    }

    fn response_file(&self, response: &ResponseFile, attempt: u32) -> Result<Invocation> {
        let mut lines: Vec<String> = response.clauses().to_vec();
        lines.extend(Self::source_args(&self.sources).iter().map(|s| quote_arg(s)));
        lines.extend(
            self.common_args()
                .into_iter()
                .chain(self.report_args(attempt))
                .map(|a| response_file_line(&a)),
        );
        if let Some(other) = &self.other_options {
            lines.push(other.clone());
        }

        let mut file = tempfile::Builder::new()
            .prefix("testrig-")
            .suffix(".rsp")
            .tempfile_in(&self.scratch_dir)?;
        file.write_all(lines.join("\n").as_bytes())?;
        file.flush()?;
        let temp = file.into_temp_path();

        Ok(Invocation {
            attempt,
            mode: AttemptMode::ResponseFile {
                path: temp.to_path_buf(),
            },
            report_path: self.report_path(attempt),
            response_file: Some(temp),
        })
    }
}
