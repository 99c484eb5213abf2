//! TRX result report parsing.

use std::collections::BTreeSet;
use std::path::Path;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use testrig_core::{Result, RunError};

/// Outcomes the engine reports for tests that did not pass.
const FAILED_OUTCOMES: &[&str] = &["Failed", "Error", "Timeout", "Aborted"];

/// Per-test outcomes from one report.
///
/// Data-driven tests write one row per data set under a shared name; a name
/// with any failing row counts as failed and never appears in `passed`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestReport {
    /// Result rows, not distinct names.
    pub total: usize,
    pub passed: BTreeSet<String>,
    pub failed: BTreeSet<String>,
}

impl TestReport {
    /// Collect outcomes from every `UnitTestResult` row.
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);
        let mut report = TestReport::default();

        loop {
            let event = reader
                .read_event()
                .map_err(|e| RunError::transient(format!("unreadable test report: {e}")))?;
            match event {
                Event::Start(e) | Event::Empty(e) if e.name().as_ref() == b"UnitTestResult" => {
                    report.record(&e)?;
                }
                Event::Eof => break,
                _ => {}
            }
        }
        report.passed.retain(|name| !report.failed.contains(name));
        Ok(report)
    }

    /// Read a report from disk. `None` when the engine wrote no report.
    pub async fn read(path: &Path) -> Result<Option<Self>> {
        match tokio::fs::read_to_string(path).await {
            Ok(xml) => Self::parse(&xml).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn record(&mut self, element: &BytesStart<'_>) -> Result<()> {
        let mut name = None;
        let mut outcome = None;
        for attr in element.attributes() {
            let attr =
                attr.map_err(|e| RunError::transient(format!("bad report attribute: {e}")))?;
            let value = attr
                .unescape_value()
                .map_err(|e| RunError::transient(format!("bad report attribute: {e}")))?
                .into_owned();
            match attr.key.as_ref() {
                b"testName" => name = Some(value),
                b"outcome" => outcome = Some(value),
                _ => {}
            }
        }
        let Some(name) = name else {
            return Ok(());
        };
        self.total += 1;
        if outcome.as_deref().is_some_and(|o| FAILED_OUTCOMES.contains(&o)) {
            self.failed.insert(name);
        } else if outcome.as_deref() == Some("Passed") {
            self.passed.insert(name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRX: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<TestRun id="1" xmlns="http://microsoft.com/schemas/VisualStudio/TeamTest/2010">
  <Results>
    <UnitTestResult testName="Calc.Adds" outcome="Passed" duration="00:00:00.01" />
    <UnitTestResult testName="Calc.Divides" outcome="Failed">
      <Output><ErrorInfo><Message>expected 2</Message></ErrorInfo></Output>
    </UnitTestResult>
    <UnitTestResult testName="Calc.Hangs" outcome="Timeout" />
    <UnitTestResult testName="Calc.Skipped" outcome="NotExecuted" />
  </Results>
</TestRun>"#;

    #[test]
    fn test_parse_outcomes() {
        let report = TestReport::parse(TRX).unwrap();
        assert_eq!(report.total, 4);
        assert_eq!(
            report.failed,
            BTreeSet::from(["Calc.Divides".to_string(), "Calc.Hangs".to_string()])
        );
        assert!(report.passed.contains("Calc.Adds"));
        assert!(!report.passed.contains("Calc.Skipped"));
    }

    #[test]
    fn test_data_rows_sharing_a_name_fail_together() {
        let trx = r#"<TestRun><Results>
    <UnitTestResult testName="Row.Test" outcome="Failed" />
    <UnitTestResult testName="Row.Test" outcome="Passed" />
    <UnitTestResult testName="Row.Other" outcome="Passed" />
    <UnitTestResult testName="Row.Other" outcome="Passed" />
</Results></TestRun>"#;
        let report = TestReport::parse(trx).unwrap();
        assert_eq!(report.total, 4);
        assert_eq!(report.failed, BTreeSet::from(["Row.Test".to_string()]));
        assert_eq!(report.passed, BTreeSet::from(["Row.Other".to_string()]));
    }

    #[tokio::test]
    async fn test_read_missing_report() {
        let dir = tempfile::tempdir().unwrap();
        assert!(TestReport::read(&dir.path().join("none.trx"))
            .await
            .unwrap()
            .is_none());
    }
}
