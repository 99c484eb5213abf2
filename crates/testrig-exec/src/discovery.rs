//! Test source resolution and test discovery.

use std::path::{Path, PathBuf};

use regex::Regex;
use testrig_core::{Result, RunError};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::engine::TestEngine;

/// Include/exclude glob patterns over paths relative to a search root.
///
/// `**` crosses directories, `*` and `?` do not. A leading `!` excludes.
/// Matching ignores case, as the engine's host filesystems usually do.
#[derive(Debug, Clone)]
pub struct SourceFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl SourceFilter {
    /// Compile include and `!`-prefixed exclude globs.
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut include = Vec::new();
        let mut exclude = Vec::new();
        for raw in patterns.iter().map(|p| p.trim()).filter(|p| !p.is_empty()) {
            let (target, pattern) = match raw.strip_prefix('!') {
                Some(rest) => (&mut exclude, rest),
                None => (&mut include, raw),
            };
            let regex = Regex::new(&glob_to_regex(pattern)).map_err(|e| {
                RunError::configuration(format!("invalid test source pattern '{raw}': {e}"))
            })?;
            target.push(regex);
        }
        Ok(Self { include, exclude })
    }

    /// Included by some pattern and excluded by none.
    pub fn matches(&self, relative: &str) -> bool {
        let path = relative.replace('\\', "/");
        self.include.iter().any(|r| r.is_match(&path)) && !self.exclude.iter().any(|r| r.is_match(&path))
    }
}

fn glob_to_regex(pattern: &str) -> String {
    let pattern = pattern.replace('\\', "/");
    let pattern = pattern.trim_start_matches("./");
    let mut out = String::from("(?i)^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    chars.next();
                    out.push_str("(?:.*/)?");
                } else {
                    out.push_str(".*");
                }
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    out
}

/// Walk `root` and return files matching the source patterns, sorted.
pub fn resolve_test_sources(root: &Path, patterns: &[String]) -> Result<Vec<PathBuf>> {
    let filter = SourceFilter::new(patterns)?;
    let mut sources = Vec::new();

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "skipping unreadable path while resolving test sources");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        if filter.matches(&relative.to_string_lossy()) {
            sources.push(entry.path().to_path_buf());
        }
    }

    sources.sort();
    debug!(count = sources.len(), root = %root.display(), "resolved test sources");
    Ok(sources)
}

/// Input to the engine's listing mode.
#[derive(Debug, Clone)]
pub struct DiscoveryRequest {
    pub sources: Vec<PathBuf>,
    pub test_case_filter: Option<String>,
    pub custom_adapters_path: Option<PathBuf>,
    pub settings_path: Option<PathBuf>,
    /// File the engine writes fully-qualified test names into.
    pub list_file: PathBuf,
}

/// Tests enumerated by the engine, in discovery order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveredTests {
    pub tests: Vec<String>,
    pub list_file: PathBuf,
}

impl DiscoveredTests {
    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    /// Read a list file: one name per line, blanks and duplicates dropped.
    pub async fn read(list_file: &Path) -> Result<Self> {
        let text = match tokio::fs::read_to_string(list_file).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let mut seen = std::collections::HashSet::new();
        let tests = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .filter(|l| seen.insert(l.to_string()))
            .map(str::to_string)
            .collect();
        Ok(Self {
            tests,
            list_file: list_file.to_path_buf(),
        })
    }
}

/// Run the engine in listing mode and read back what it found.
///
/// A non-zero exit from the listing run is a transient tooling error.
pub async fn discover_tests(
    engine: &dyn TestEngine,
    request: &DiscoveryRequest,
) -> Result<DiscoveredTests> {
    let output = engine.discover(request).await?;
    if !output.success() {
        return Err(RunError::transient(format!(
            "test discovery exited with code {}: {}",
            output.exit_code,
            output.stderr_tail(5)
        )));
    }
    let discovered = DiscoveredTests::read(&request.list_file).await?;
    info!(count = discovered.len(), "discovered tests");
    Ok(discovered)
}
