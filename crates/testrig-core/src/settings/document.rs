//! The settings document handed to the engine.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::TempPath;
use tracing::{debug, warn};

use super::collector::DataCollector;
use super::error::{SettingsError, SettingsResult};
use super::node::XmlNode;
use super::SettingsKind;

/// Fixed identity of synthesized test settings.
pub const TEST_SETTINGS_ID: &str = "5d76a195-1e43-4b90-a6ce-4ec3de87ed25";
pub const TEST_SETTINGS_NAMESPACE: &str = "http://microsoft.com/schemas/VisualStudio/TeamTest/2010";

const RUN_COLLECTORS: &[&str] = &["DataCollectionRunSettings", "DataCollectors"];

/// Result of a single mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    Applied,
    Unchanged,
    Unsupported { reason: String },
}

impl MutationOutcome {
    fn unsupported(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        warn!(reason = %reason, "settings capability not supported");
        MutationOutcome::Unsupported { reason }
    }
}

/// Active document content. At most one kind is active.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SettingsContent {
    #[default]
    None,
    RunSettings(XmlNode),
    TestSettings(XmlNode),
}

/// A settings document and where it came from.
#[derive(Debug, Clone, Default)]
pub struct SettingsDocument {
    content: SettingsContent,
    source: Option<PathBuf>,
    dirty: bool,
}

impl SettingsDocument {
    /// A document with no active kind.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load a settings file. Unreadable or invalid files yield `None`.
    pub async fn load(path: &Path) -> Option<Self> {
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "settings file could not be read");
                return None;
            }
        };
        match Self::parse(&text, SettingsKind::from_path(path)) {
            Ok(mut doc) => {
                doc.source = Some(path.to_path_buf());
                Some(doc)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "invalid settings file, ignoring it");
                None
            }
        }
    }

    /// Parse document text that must have the root of `expected`.
    pub fn parse(text: &str, expected: SettingsKind) -> SettingsResult<Self> {
        let root = XmlNode::parse(text)?;
        if root.name != expected.root_name() {
            return Err(SettingsError::UnexpectedRoot {
                expected,
                found: root.name,
            });
        }
        let content = match expected {
            SettingsKind::RunSettings => SettingsContent::RunSettings(root),
            SettingsKind::TestSettings => SettingsContent::TestSettings(root),
        };
        Ok(Self {
            content,
            source: None,
            dirty: false,
        })
    }

    /// `None` until a document was loaded or materialised.
    pub fn kind(&self) -> Option<SettingsKind> {
        match self.content {
            SettingsContent::None => None,
            SettingsContent::RunSettings(_) => Some(SettingsKind::RunSettings),
            SettingsContent::TestSettings(_) => Some(SettingsKind::TestSettings),
        }
    }

    pub fn content(&self) -> &SettingsContent {
        &self.content
    }

    pub fn root(&self) -> Option<&XmlNode> {
        match &self.content {
            SettingsContent::None => None,
            SettingsContent::RunSettings(root) | SettingsContent::TestSettings(root) => Some(root),
        }
    }

    fn root_mut(&mut self) -> Option<&mut XmlNode> {
        match &mut self.content {
            SettingsContent::None => None,
            SettingsContent::RunSettings(root) | SettingsContent::TestSettings(root) => Some(root),
        }
    }

    /// File the document was loaded from.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Whether any mutation changed the document since it was loaded.
    pub fn is_modified(&self) -> bool {
        self.dirty
    }

    /// Return the root of `kind`, materialising the skeleton if no kind is
    /// active yet. Fails when another kind is already active.
    pub fn ensure_kind(&mut self, kind: SettingsKind) -> SettingsResult<&mut XmlNode> {
        if let Some(active) = self.kind() {
            if active != kind {
                return Err(SettingsError::KindConflict {
                    active,
                    requested: kind,
                });
            }
        } else {
            debug!(kind = %kind, "creating settings document");
            self.content = match kind {
                SettingsKind::RunSettings => {
                    SettingsContent::RunSettings(XmlNode::new(kind.root_name()))
                }
                SettingsKind::TestSettings => SettingsContent::TestSettings(
                    XmlNode::new(kind.root_name())
                        .with_attr("name", format!("testSettings-{TEST_SETTINGS_ID}"))
                        .with_attr("id", TEST_SETTINGS_ID)
                        .with_attr("xmlns", TEST_SETTINGS_NAMESPACE),
                ),
            };
            self.dirty = true;
        }
        self.root_mut().ok_or(SettingsError::MissingRoot)
    }

    fn active_or(&mut self, kind: SettingsKind) -> SettingsResult<(SettingsKind, &mut XmlNode)> {
        let kind = self.kind().unwrap_or(kind);
        Ok((kind, self.ensure_kind(kind)?))
    }

    /// Add a data collector unless one with the same friendly name exists.
    pub fn add_data_collector(&mut self, collector: DataCollector) -> SettingsResult<MutationOutcome> {
        let kind = self.kind().unwrap_or_else(|| collector.preferred_kind());
        if !collector.supports(kind) {
            return Ok(MutationOutcome::unsupported(format!(
                "collector '{}' is not supported in {}",
                collector.friendly_name(),
                kind
            )));
        }

        let root = self.ensure_kind(kind)?;
        let collectors = match kind {
            SettingsKind::RunSettings => root.ensure_path(RUN_COLLECTORS),
            SettingsKind::TestSettings => {
                let execution = root.ensure_child("Execution");
                let rule = execution.ensure_child("AgentRule");
                if rule.attr("name").is_none() {
                    rule.set_attr("name", format!("agent-{TEST_SETTINGS_ID}"));
                }
                rule.ensure_child("DataCollectors")
            }
        };

        let wanted = collector.friendly_name().to_string();
        let present = collectors.children_named("DataCollector").any(|existing| {
            existing
                .attr_ignore_case("friendlyName")
                .is_some_and(|name| name.eq_ignore_ascii_case(&wanted))
        });
        if present {
            debug!(collector = %wanted, "collector already present");
            return Ok(MutationOutcome::Unchanged);
        }

        collectors.push_child(collector.into_node());
        self.dirty = true;
        Ok(MutationOutcome::Applied)
    }

    /// Force code coverage on, reusing an existing coverage collector.
    pub fn enable_code_coverage(&mut self) -> SettingsResult<MutationOutcome> {
        let coverage = DataCollector::code_coverage();
        if self.kind() == Some(SettingsKind::TestSettings) {
            return Ok(MutationOutcome::unsupported(
                "code coverage collector requires a run settings document",
            ));
        }
        let wanted = coverage.friendly_name().to_string();
        let outcome = self.add_data_collector(coverage)?;
        if outcome != MutationOutcome::Unchanged {
            return Ok(outcome);
        }

        let Some(collectors) = self
            .root_mut()
            .and_then(|root| root.child_mut("DataCollectionRunSettings"))
            .and_then(|n| n.child_mut("DataCollectors"))
        else {
            return Ok(MutationOutcome::Unchanged);
        };
        let mut changed = false;
        for existing in collectors.elements_mut() {
            let matches = existing
                .attr_ignore_case("friendlyName")
                .is_some_and(|name| name.eq_ignore_ascii_case(&wanted));
            if matches {
                let flag = existing.ensure_path(&[
                    "Configuration",
                    "CodeCoverage",
                    "UseVerifiableInstrumentation",
                ]);
                if flag.text() != "False" {
                    flag.set_text("False");
                    changed = true;
                }
            }
        }
        if changed {
            self.dirty = true;
            return Ok(MutationOutcome::Applied);
        }
        Ok(MutationOutcome::Unchanged)
    }

    /// Let the engine pick the degree of parallelism (`MaxCpuCount = 0`).
    pub fn set_parallel(&mut self) -> SettingsResult<MutationOutcome> {
        if self.kind() == Some(SettingsKind::TestSettings) {
            return Ok(MutationOutcome::unsupported(
                "parallel execution cannot be configured in test settings",
            ));
        }
        let root = self.ensure_kind(SettingsKind::RunSettings)?;
        let max_cpu = root.ensure_path(&["RunConfiguration", "MaxCpuCount"]);
        if max_cpu.text() == "0" {
            return Ok(MutationOutcome::Unchanged);
        }
        max_cpu.set_text("0");
        self.dirty = true;
        Ok(MutationOutcome::Applied)
    }

    /// Override values of parameters already declared in the document.
    pub fn set_override_parameters(
        &mut self,
        overrides: &BTreeMap<String, String>,
    ) -> SettingsResult<MutationOutcome> {
        if overrides.is_empty() {
            return Ok(MutationOutcome::Unchanged);
        }
        let (container, item) = match self.kind() {
            None => {
                return Ok(MutationOutcome::unsupported(
                    "override parameters need a settings file that declares them",
                ))
            }
            Some(SettingsKind::RunSettings) => ("TestRunParameters", "Parameter"),
            Some(SettingsKind::TestSettings) => ("Properties", "Property"),
        };

        let Some(params) = self.root_mut().and_then(|root| root.child_mut(container)) else {
            return Ok(MutationOutcome::unsupported(format!(
                "settings file has no <{container}> section to override"
            )));
        };

        let mut applied = 0;
        for param in params.elements_mut().filter(|n| n.name == item) {
            let Some(name) = param.attr_ignore_case("name").map(str::to_string) else {
                continue;
            };
            let Some(value) = overrides.get(&name) else {
                continue;
            };
            let key = param
                .attributes
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("value"))
                .map(|(k, _)| k.clone())
                .unwrap_or_else(|| "value".to_string());
            debug!(parameter = %name, "overriding parameter");
            param.set_attr(key, value.clone());
            applied += 1;
        }

        for name in overrides.keys() {
            let declared = params.elements().any(|n| {
                n.name == item && n.attr_ignore_case("name") == Some(name.as_str())
            });
            if !declared {
                warn!(parameter = %name, "override parameter not declared in settings file");
            }
        }

        if applied == 0 {
            return Ok(MutationOutcome::Unchanged);
        }
        self.dirty = true;
        Ok(MutationOutcome::Applied)
    }

    /// Point the engine at the baseline run for impact analysis.
    pub fn set_tia_baseline(&mut self, baseline_id: &str) -> SettingsResult<MutationOutcome> {
        let (kind, root) = self.active_or(SettingsKind::RunSettings)?;
        let parent = match kind {
            SettingsKind::RunSettings => root.ensure_child("RunConfiguration"),
            SettingsKind::TestSettings => root.ensure_child("Execution"),
        };
        parent.ensure_child("TestImpact").set_attr("enabled", "true");
        parent.ensure_child("BaseLineRunId").set_attr("value", baseline_id);
        self.dirty = true;
        Ok(MutationOutcome::Applied)
    }

    /// `RunConfiguration/ResultsDirectory`, resolved against `settings_path`.
    pub fn results_directory(&self, settings_path: &Path) -> Option<PathBuf> {
        let SettingsContent::RunSettings(root) = &self.content else {
            return None;
        };
        let text = root
            .find_path(&["RunConfiguration", "ResultsDirectory"])?
            .text();
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let dir = PathBuf::from(text.replace('\\', "/"));
        if dir.is_absolute() {
            return Some(dir);
        }
        let base = settings_path.parent().unwrap_or_else(|| Path::new("."));
        Some(base.join(dir))
    }

    /// Serialize the active document.
    pub fn serialize(&self) -> SettingsResult<String> {
        self.root().ok_or(SettingsError::MissingRoot)?.to_xml()
    }

    /// Write the document where the engine can read it.
    ///
    /// An unmodified loaded document is used as-is. With `in_place`, the
    /// caller's file is overwritten. Otherwise a temporary file in `dir` is
    /// written and removed when the returned value is dropped.
    pub fn persist(&self, dir: &Path, in_place: bool) -> SettingsResult<PersistedSettings> {
        let kind = self
            .kind()
            .ok_or_else(|| SettingsError::Malformed("nothing to persist".into()))?;

        if let Some(source) = &self.source {
            if !self.dirty {
                return Ok(PersistedSettings::original(source.clone()));
            }
            if in_place {
                std::fs::write(source, self.serialize()?)?;
                return Ok(PersistedSettings::original(source.clone()));
            }
        }

        let xml = self.serialize()?;
        let mut file = tempfile::Builder::new()
            .prefix("testrig-")
            .suffix(kind.extension())
            .tempfile_in(dir)?;
        file.write_all(xml.as_bytes())?;
        file.flush()?;
        let temp = file.into_temp_path();
        Ok(PersistedSettings {
            path: temp.to_path_buf(),
            temp: Some(temp),
        })
    }
}

/// A settings file on disk. Temporary copies are deleted on drop.
#[derive(Debug)]
pub struct PersistedSettings {
    path: PathBuf,
    temp: Option<TempPath>,
}

impl PersistedSettings {
    /// The caller's file, passed through untouched.
    pub fn original(path: PathBuf) -> Self {
        Self { path, temp: None }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file is removed when this value drops.
    pub fn is_temporary(&self) -> bool {
        self.temp.is_some()
    }

    /// Delete a temporary copy now, reporting any I/O error.
    pub fn cleanup(self) -> std::io::Result<()> {
        match self.temp {
            Some(temp) => temp.close(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TiaPolicy, TiaState};

    fn tia() -> TiaState {
        TiaState::from_policy(&TiaPolicy {
            enabled: true,
            ..Default::default()
        })
    }

    fn run_settings(xml: &str) -> SettingsDocument {
        SettingsDocument::parse(xml, SettingsKind::RunSettings).expect("parse")
    }

    #[test]
    fn test_empty_document_has_no_kind() {
        let doc = SettingsDocument::empty();
        assert_eq!(doc.kind(), None);
        assert!(doc.serialize().is_err());
    }

    #[test]
    fn test_ensure_kind_materializes_test_settings_skeleton() {
        let mut doc = SettingsDocument::empty();
        let root = doc.ensure_kind(SettingsKind::TestSettings).unwrap();
        assert_eq!(root.name, "TestSettings");
        assert_eq!(root.attr("id"), Some(TEST_SETTINGS_ID));
        assert_eq!(root.attr("xmlns"), Some(TEST_SETTINGS_NAMESPACE));
        assert!(doc.is_modified());
    }

    #[test]
    fn test_ensure_kind_rejects_switch() {
        let mut doc = run_settings("<RunSettings/>");
        let err = doc.ensure_kind(SettingsKind::TestSettings).unwrap_err();
        assert!(matches!(err, SettingsError::KindConflict { .. }));
    }

    #[test]
    fn test_parse_rejects_wrong_root() {
        let err = SettingsDocument::parse("<TestSettings/>", SettingsKind::RunSettings).unwrap_err();
        assert!(matches!(err, SettingsError::UnexpectedRoot { .. }));
    }

    #[test]
    fn test_add_collector_to_empty_document() {
        let mut doc = SettingsDocument::empty();
        let outcome = doc.add_data_collector(DataCollector::test_impact(&tia())).unwrap();
        assert_eq!(outcome, MutationOutcome::Applied);
        assert_eq!(doc.kind(), Some(SettingsKind::RunSettings));
        let collectors = doc
            .root()
            .and_then(|r| r.find_path(RUN_COLLECTORS))
            .expect("collectors");
        assert_eq!(collectors.children_named("DataCollector").count(), 1);
    }

    #[test]
    fn test_add_collector_is_idempotent_ignoring_case() {
        let mut doc = run_settings(
            r#"<RunSettings><DataCollectionRunSettings><DataCollectors>
                 <DataCollector friendlyName="TEST IMPACT" uri="x"/>
               </DataCollectors></DataCollectionRunSettings></RunSettings>"#,
        );
        let outcome = doc.add_data_collector(DataCollector::test_impact(&tia())).unwrap();
        assert_eq!(outcome, MutationOutcome::Unchanged);
        assert!(!doc.is_modified());
    }

    #[test]
    fn test_add_collector_under_test_settings_agent_rule() {
        let mut doc = SettingsDocument::empty();
        doc.add_data_collector(DataCollector::screen_recorder()).unwrap();
        assert_eq!(doc.kind(), Some(SettingsKind::TestSettings));
        let rule = doc
            .root()
            .and_then(|r| r.find_path(&["Execution", "AgentRule"]))
            .expect("agent rule");
        assert_eq!(rule.attr("name"), Some(&*format!("agent-{TEST_SETTINGS_ID}")));
        assert!(rule.find_path(&["DataCollectors", "DataCollector"]).is_some());
    }

    #[test]
    fn test_screen_recorder_unsupported_in_run_settings() {
        let mut doc = run_settings("<RunSettings/>");
        let outcome = doc.add_data_collector(DataCollector::screen_recorder()).unwrap();
        assert!(matches!(outcome, MutationOutcome::Unsupported { .. }));
    }

    #[test]
    fn test_set_parallel_preserves_existing_configuration() {
        let mut doc = run_settings(
            "<RunSettings><RunConfiguration><TargetPlatform>x64</TargetPlatform></RunConfiguration></RunSettings>",
        );
        assert_eq!(doc.set_parallel().unwrap(), MutationOutcome::Applied);
        assert_eq!(doc.set_parallel().unwrap(), MutationOutcome::Unchanged);
        let config = doc.root().and_then(|r| r.child("RunConfiguration")).unwrap();
        assert_eq!(config.child("TargetPlatform").map(XmlNode::text), Some("x64".into()));
        assert_eq!(config.child("MaxCpuCount").map(XmlNode::text), Some("0".into()));
    }

    #[test]
    fn test_set_parallel_warns_for_test_settings() {
        let mut doc = SettingsDocument::empty();
        doc.ensure_kind(SettingsKind::TestSettings).unwrap();
        assert!(matches!(
            doc.set_parallel().unwrap(),
            MutationOutcome::Unsupported { .. }
        ));
    }

    #[test]
    fn test_override_parameters_updates_declared_only() {
        let mut doc = run_settings(
            r#"<RunSettings><TestRunParameters>
                 <Parameter name="url" value="http://old"/>
                 <Parameter Name="user" Value="a"/>
               </TestRunParameters></RunSettings>"#,
        );
        let overrides = BTreeMap::from([
            ("url".to_string(), "http://new".to_string()),
            ("user".to_string(), "b".to_string()),
            ("missing".to_string(), "x".to_string()),
        ]);
        assert_eq!(
            doc.set_override_parameters(&overrides).unwrap(),
            MutationOutcome::Applied
        );
        let params = doc.root().and_then(|r| r.child("TestRunParameters")).unwrap();
        let values: Vec<_> = params
            .elements()
            .map(|p| p.attr_ignore_case("value").unwrap_or_default().to_string())
            .collect();
        assert_eq!(values, vec!["http://new", "b"]);
        assert_eq!(params.elements().count(), 2);
        assert_eq!(params.elements().nth(1).unwrap().attr("Value"), Some("b"));
    }

    #[test]
    fn test_override_parameters_in_test_settings_properties() {
        let mut doc = SettingsDocument::parse(
            r#"<TestSettings><Properties><Property Name="env" Value="dev"/></Properties></TestSettings>"#,
            SettingsKind::TestSettings,
        )
        .unwrap();
        let overrides = BTreeMap::from([("env".to_string(), "prod".to_string())]);
        doc.set_override_parameters(&overrides).unwrap();
        let prop = doc
            .root()
            .and_then(|r| r.find_path(&["Properties", "Property"]))
            .unwrap();
        assert_eq!(prop.attr("Value"), Some("prod"));
    }

    #[test]
    fn test_override_without_document_is_unsupported() {
        let mut doc = SettingsDocument::empty();
        let overrides = BTreeMap::from([("a".to_string(), "b".to_string())]);
        assert!(matches!(
            doc.set_override_parameters(&overrides).unwrap(),
            MutationOutcome::Unsupported { .. }
        ));
        assert_eq!(doc.kind(), None);
    }

    #[test]
    fn test_tia_baseline_placement() {
        let mut doc = SettingsDocument::empty();
        doc.set_tia_baseline("4711").unwrap();
        let root = doc.root().unwrap();
        assert_eq!(
            root.find_path(&["RunConfiguration", "TestImpact"])
                .and_then(|n| n.attr("enabled")),
            Some("true")
        );
        assert_eq!(
            root.find_path(&["RunConfiguration", "BaseLineRunId"])
                .and_then(|n| n.attr("value")),
            Some("4711")
        );

        let mut doc = SettingsDocument::empty();
        doc.ensure_kind(SettingsKind::TestSettings).unwrap();
        doc.set_tia_baseline("9").unwrap();
        assert!(doc
            .root()
            .and_then(|r| r.find_path(&["Execution", "BaseLineRunId"]))
            .is_some());
    }

    #[test]
    fn test_code_coverage_forces_verifiable_instrumentation_off() {
        let mut doc = run_settings(
            r#"<RunSettings><DataCollectionRunSettings><DataCollectors>
                 <DataCollector friendlyName="Code Coverage"><Configuration><CodeCoverage>
                   <UseVerifiableInstrumentation>True</UseVerifiableInstrumentation>
                 </CodeCoverage></Configuration></DataCollector>
               </DataCollectors></DataCollectionRunSettings></RunSettings>"#,
        );
        assert_eq!(doc.enable_code_coverage().unwrap(), MutationOutcome::Applied);
        let flag = doc
            .root()
            .and_then(|r| {
                r.find_path(&[
                    "DataCollectionRunSettings",
                    "DataCollectors",
                    "DataCollector",
                    "Configuration",
                    "CodeCoverage",
                    "UseVerifiableInstrumentation",
                ])
            })
            .unwrap();
        assert_eq!(flag.text(), "False");
    }

    #[test]
    fn test_results_directory_resolves_relative_to_settings() {
        let doc = run_settings(
            "<RunSettings><RunConfiguration><ResultsDirectory>out\\results</ResultsDirectory></RunConfiguration></RunSettings>",
        );
        let dir = doc.results_directory(Path::new("/repo/tests/ci.runsettings"));
        assert_eq!(dir, Some(PathBuf::from("/repo/tests/out/results")));

        let doc = run_settings("<RunSettings/>");
        assert_eq!(doc.results_directory(Path::new("/x/a.runsettings")), None);
    }

    #[tokio::test]
    async fn test_persist_temp_copy_is_deleted_on_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let mut doc = SettingsDocument::empty();
        doc.set_parallel().unwrap();

        let persisted = doc.persist(dir.path(), false).unwrap();
        let path = persisted.path().to_path_buf();
        assert!(persisted.is_temporary());
        assert!(path.to_string_lossy().ends_with(".runsettings"));
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("<MaxCpuCount>0</MaxCpuCount>"));

        persisted.cleanup().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_persist_unmodified_original_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ci.runsettings");
        std::fs::write(&path, "<RunSettings><RunConfiguration/></RunSettings>").unwrap();

        let doc = SettingsDocument::load(&path).await.expect("load");
        let persisted = doc.persist(dir.path(), false).unwrap();
        assert_eq!(persisted.path(), path.as_path());
        assert!(!persisted.is_temporary());
        drop(persisted);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_load_invalid_file_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.runsettings");
        std::fs::write(&path, "<RunSettings><oops></RunSettings>").unwrap();
        assert!(SettingsDocument::load(&path).await.is_none());
        assert!(SettingsDocument::load(&dir.path().join("absent.runsettings"))
            .await
            .is_none());

        let path = dir.path().join("mismatch.testsettings");
        std::fs::write(&path, "<RunSettings/>").unwrap();
        assert!(SettingsDocument::load(&path).await.is_none());
    }
}
