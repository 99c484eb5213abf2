//! Response files produced by the impact helper.

use std::path::Path;

use testrig_core::Result;

/// Clauses that select nothing at all.
const EMPTY_SELECTIONS: &[&str] = &[
    "/Tests:",
    "/Tests:\"",
    "/Tests:\"\"",
    "/TestCaseFilter:",
    "/TestCaseFilter:\"\"",
];

/// What a generated response file asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClassification {
    /// Nothing was produced; impact data is unusable.
    Empty,
    /// Impact analysis ran and no test is affected.
    NoTestsSelected,
    /// Impact analysis selected a subset.
    PartialSelection(usize),
}

impl ResponseClassification {
    pub fn name(&self) -> &'static str {
        match self {
            ResponseClassification::Empty => "empty",
            ResponseClassification::NoTestsSelected => "no_selection",
            ResponseClassification::PartialSelection(_) => "partial_selection",
        }
    }
}

/// Ordered clauses of a response file, one per line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseFile {
    clauses: Vec<String>,
}

impl ResponseFile {
    /// One clause per non-blank line.
    pub fn parse(content: &str) -> Self {
        Self {
            clauses: content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    /// Load a response file; a missing file reads as empty.
    pub async fn load(path: &Path) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Ok(Self::parse(&text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn clauses(&self) -> &[String] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Decide what the helper's answer means for the run.
    pub fn classify(&self) -> ResponseClassification {
        match self.clauses.as_slice() {
            [] => ResponseClassification::Empty,
            [only] if EMPTY_SELECTIONS.contains(&only.as_str()) => {
                ResponseClassification::NoTestsSelected
            }
            clauses => ResponseClassification::PartialSelection(
                clauses.iter().map(|c| selected_count(c)).sum(),
            ),
        }
    }

    /// Clauses joined back into file content.
    pub fn render(&self) -> String {
        self.clauses.join("\n")
    }
}

/// Tests named by a `/Tests:` clause; any other clause counts once.
fn selected_count(clause: &str) -> usize {
    match clause.strip_prefix("/Tests:") {
        Some(list) => list
            .trim_matches('"')
            .split(',')
            .filter(|t| !t.trim().is_empty())
            .count(),
        None => 1,
    }
}
