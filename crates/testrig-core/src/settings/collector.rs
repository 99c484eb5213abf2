//! Data collector templates injected into settings documents.

use super::node::XmlNode;
use super::SettingsKind;
use crate::domain::TiaState;

/// Test impact collector identity.
pub const TEST_IMPACT_FRIENDLY_NAME: &str = "Test Impact";
pub const TEST_IMPACT_URI: &str = "datacollector://microsoft/TestImpact/1.0";
pub const TEST_IMPACT_ASSEMBLY: &str = "Microsoft.VisualStudio.TraceCollector.TestImpactDataCollector, Microsoft.VisualStudio.TraceCollector, Culture=neutral, PublicKeyToken=b03f5f7f11d50a3a";

/// Screen and voice recorder identity.
pub const SCREEN_RECORDER_FRIENDLY_NAME: &str = "Screen and Voice Recorder";
pub const SCREEN_RECORDER_URI: &str = "datacollector://microsoft/VideoRecorder/1.0";
pub const SCREEN_RECORDER_ASSEMBLY: &str = "Microsoft.VisualStudio.TestTools.DataCollection.VideoRecorder.VideoRecorderDataCollector, Microsoft.VisualStudio.TestTools.DataCollection.VideoRecorder, Version=12.0.0.0, Culture=neutral, PublicKeyToken=b03f5f7f11d50a3a";

/// Code coverage collector identity.
pub const CODE_COVERAGE_FRIENDLY_NAME: &str = "Code Coverage";
pub const CODE_COVERAGE_URI: &str = "datacollector://Microsoft/CodeCoverage/2.0";
pub const CODE_COVERAGE_ASSEMBLY: &str = "Microsoft.VisualStudio.Coverage.DynamicCoverageDataCollector, Microsoft.VisualStudio.TraceCollector, Version=11.0.0.0, Culture=neutral, PublicKeyToken=b03f5f7f11d50a3a";

/// Collectors the run knows how to configure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorKind {
    TestImpact,
    ScreenRecorder,
    CodeCoverage,
}

/// A `<DataCollector>` element plus the document kinds that accept it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataCollector {
    kind: CollectorKind,
    node: XmlNode,
}

impl DataCollector {
    /// Impact collector configured from the run's impact state.
    pub fn test_impact(tia: &TiaState) -> Self {
        let configuration = XmlNode::new("Configuration")
            .with_child(XmlNode::new("RootPath").with_text(tia.collector_root_path()))
            .with_child(XmlNode::new("ImpactLevel").with_text(tia.impact_level()))
            .with_child(XmlNode::new("LogFilePath").with_text("true"));
        Self {
            kind: CollectorKind::TestImpact,
            node: collector_node(TEST_IMPACT_URI, TEST_IMPACT_ASSEMBLY, TEST_IMPACT_FRIENDLY_NAME)
                .with_child(configuration),
        }
    }

    /// Screen recorder; only meaningful in test settings.
    pub fn screen_recorder() -> Self {
        Self {
            kind: CollectorKind::ScreenRecorder,
            node: collector_node(
                SCREEN_RECORDER_URI,
                SCREEN_RECORDER_ASSEMBLY,
                SCREEN_RECORDER_FRIENDLY_NAME,
            ),
        }
    }

    /// Dynamic code coverage; only meaningful in run settings.
    pub fn code_coverage() -> Self {
        let module_paths = XmlNode::new("ModulePaths")
            .with_child(
                XmlNode::new("Include")
                    .with_child(XmlNode::new("ModulePath").with_text(r".*\.dll$"))
                    .with_child(XmlNode::new("ModulePath").with_text(r".*\.exe$")),
            )
            .with_child(
                XmlNode::new("Exclude")
                    .with_child(XmlNode::new("ModulePath").with_text(r".*CPPUnitTestFramework.*")),
            );
        let coverage = XmlNode::new("CodeCoverage")
            .with_child(module_paths)
            .with_child(XmlNode::new("UseVerifiableInstrumentation").with_text("False"))
            .with_child(XmlNode::new("AllowLowIntegrityProcesses").with_text("True"))
            .with_child(XmlNode::new("CollectFromChildProcesses").with_text("True"))
            .with_child(XmlNode::new("CollectAspDotNet").with_text("False"));
        Self {
            kind: CollectorKind::CodeCoverage,
            node: collector_node(
                CODE_COVERAGE_URI,
                CODE_COVERAGE_ASSEMBLY,
                CODE_COVERAGE_FRIENDLY_NAME,
            )
            .with_child(XmlNode::new("Configuration").with_child(coverage)),
        }
    }

    pub fn kind(&self) -> CollectorKind {
        self.kind
    }

    /// Name used to detect an already configured collector.
    pub fn friendly_name(&self) -> &str {
        self.node.attr("friendlyName").unwrap_or_default()
    }

    pub fn node(&self) -> &XmlNode {
        &self.node
    }

    pub fn into_node(self) -> XmlNode {
        self.node
    }

    /// Whether a document of `kind` can host this collector.
    pub fn supports(&self, kind: SettingsKind) -> bool {
        match self.kind {
            CollectorKind::TestImpact => true,
            CollectorKind::ScreenRecorder => kind == SettingsKind::TestSettings,
            CollectorKind::CodeCoverage => kind == SettingsKind::RunSettings,
        }
    }

    /// Document kind to create when no document exists yet.
    pub fn preferred_kind(&self) -> SettingsKind {
        match self.kind {
            CollectorKind::ScreenRecorder => SettingsKind::TestSettings,
            _ => SettingsKind::RunSettings,
        }
    }
}

fn collector_node(uri: &str, assembly: &str, friendly_name: &str) -> XmlNode {
    XmlNode::new("DataCollector")
        .with_attr("uri", uri)
        .with_attr("assemblyQualifiedName", assembly)
        .with_attr("friendlyName", friendly_name)
}
