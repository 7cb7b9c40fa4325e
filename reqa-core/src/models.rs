use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A table attached to a requirement (imported from the source document)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequirementTable {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub headers: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<String>>,
}

impl RequirementTable {
    /// A table counts as empty only when it carries no title either
    pub fn is_empty(&self) -> bool {
        self.title.trim().is_empty()
            && self.headers.is_empty()
            && self.rows.iter().all(|r| r.is_empty())
    }
}

/// Supplemental content that was found near a requirement but not inside it
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LooseContent {
    #[serde(default)]
    pub paragraphs: Vec<String>,
    #[serde(default)]
    pub tables: Vec<RequirementTable>,
}

impl LooseContent {
    pub fn is_empty(&self) -> bool {
        self.paragraphs.iter().all(|p| p.trim().is_empty())
            && self.tables.iter().all(|t| t.is_empty())
    }
}

/// A test case generated for a requirement
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GeneratedTestCase {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub expected_result: String,
}

/// Represents a single requirement as the analysis engine sees it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Requirement {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tables: Vec<RequirementTable>,
    #[serde(default)]
    pub loose_content: Option<LooseContent>,
    /// Keys into the verification assumption catalog
    #[serde(default)]
    pub selected_assumptions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<Analysis>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generated_test_cases: Vec<GeneratedTestCase>,
}

impl Requirement {
    pub fn new(id: impl Into<String>, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            tables: Vec::new(),
            loose_content: None,
            selected_assumptions: Vec::new(),
            analysis: None,
            generated_test_cases: Vec::new(),
        }
    }

    /// Attach the result of an analysis run
    pub fn apply_analysis(&mut self, analysis: Analysis) {
        self.analysis = Some(analysis);
    }

    /// The description followed by any loose paragraphs, used as the
    /// reference text when checking model output for invented detail
    pub fn full_text(&self) -> String {
        let mut text = format!("{}\n{}", self.name, self.description);
        for table in &self.tables {
            append_table_text(&mut text, table);
        }
        if let Some(loose) = &self.loose_content {
            for p in &loose.paragraphs {
                text.push('\n');
                text.push_str(p);
            }
            for table in &loose.tables {
                append_table_text(&mut text, table);
            }
        }
        text
    }
}

fn append_table_text(text: &mut String, table: &RequirementTable) {
    text.push('\n');
    text.push_str(&table.title);
    text.push('\n');
    text.push_str(&table.headers.join(" "));
    for row in &table.rows {
        text.push('\n');
        text.push_str(&row.join(" "));
    }
}

/// The set of requirements belonging to one project
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RequirementSet {
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub requirements: Vec<Requirement>,
}

impl RequirementSet {
    pub fn get(&self, id: &str) -> Option<&Requirement> {
        self.requirements.iter().find(|r| r.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Requirement> {
        self.requirements.iter_mut().find(|r| r.id == id)
    }
}

/// An issue the model found in a requirement
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Issue {
    pub category: String,
    pub severity: String,
    pub description: String,
}

/// A concrete, editable recommendation for improving a requirement
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Recommendation {
    pub category: String,
    pub description: String,
    pub suggested_edit: String,
}

/// Which tier of the pipeline produced an answer
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AnalysisMode {
    /// Retrieval-augmented answer from a workspace
    Rag,
    /// Direct prompt without retrieval augmentation
    Direct,
}

impl fmt::Display for AnalysisMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisMode::Rag => write!(f, "RAG"),
            AnalysisMode::Direct => write!(f, "Direct"),
        }
    }
}

/// Why an analysis could not be produced
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AnalysisErrorKind {
    ServiceNotAvailable,
    WorkspaceNotConfigured,
    WorkspaceCreationFailed,
    ThreadCreationFailed,
    LlmRequestFailed,
    Timeout,
    EmptyResponse,
    ConfigurationTimeout,
    ParseError,
    FabricationDetected,
    Cancelled,
    UnknownError,
}

impl fmt::Display for AnalysisErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AnalysisErrorKind::ServiceNotAvailable => "Service not available",
            AnalysisErrorKind::WorkspaceNotConfigured => "Workspace not configured",
            AnalysisErrorKind::WorkspaceCreationFailed => "Workspace creation failed",
            AnalysisErrorKind::ThreadCreationFailed => "Thread creation failed",
            AnalysisErrorKind::LlmRequestFailed => "LLM request failed",
            AnalysisErrorKind::Timeout => "Timeout",
            AnalysisErrorKind::EmptyResponse => "Empty response",
            AnalysisErrorKind::ConfigurationTimeout => "Configuration timeout",
            AnalysisErrorKind::ParseError => "Parse error",
            AnalysisErrorKind::FabricationDetected => "Fabrication detected",
            AnalysisErrorKind::Cancelled => "Cancelled",
            AnalysisErrorKind::UnknownError => "Unknown error",
        };
        write!(f, "{}", s)
    }
}

/// Structured quality assessment of one requirement.
///
/// An analysis is either analyzed (score, issues and recommendations are
/// meaningful, `error_message` is `None`) or failed (`error_message` holds a
/// non-empty description and everything else is defaulted). Use
/// [`Analysis::failed`] to build the latter; the response parser builds the
/// former.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Analysis {
    pub is_analyzed: bool,
    pub original_quality_score: u8,
    #[serde(default)]
    pub issues: Vec<Issue>,
    #[serde(default)]
    pub recommendations: Vec<Recommendation>,
    #[serde(default)]
    pub freeform_feedback: String,
    #[serde(default)]
    pub hallucination_check: String,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_kind: Option<AnalysisErrorKind>,
    /// Warning raised by the fabrication guard on an otherwise valid analysis
    #[serde(default)]
    pub quality_warning: Option<String>,
    #[serde(default)]
    pub mode: Option<AnalysisMode>,
    pub timestamp: DateTime<Utc>,
}

impl Analysis {
    /// A successful analysis with the given score and no findings yet
    pub fn analyzed(score: u8) -> Self {
        Self {
            is_analyzed: true,
            original_quality_score: score.min(10),
            issues: Vec::new(),
            recommendations: Vec::new(),
            freeform_feedback: String::new(),
            hallucination_check: String::new(),
            error_message: None,
            error_kind: None,
            quality_warning: None,
            mode: None,
            timestamp: Utc::now(),
        }
    }

    /// A failed analysis; an empty message is replaced by the kind's description
    pub fn failed(kind: AnalysisErrorKind, message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.trim().is_empty() {
            message = kind.to_string();
        }
        Self {
            is_analyzed: false,
            original_quality_score: 0,
            issues: Vec::new(),
            recommendations: Vec::new(),
            freeform_feedback: String::new(),
            hallucination_check: String::new(),
            error_message: Some(message),
            error_kind: Some(kind),
            quality_warning: None,
            mode: None,
            timestamp: Utc::now(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.error_kind == Some(AnalysisErrorKind::Cancelled)
    }

    /// True when the analyzed/failed states are not mixed
    pub fn is_consistent(&self) -> bool {
        let has_error = self
            .error_message
            .as_deref()
            .map(|m| !m.trim().is_empty())
            .unwrap_or(false);
        self.is_analyzed != has_error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_analysis_is_consistent() {
        let analysis = Analysis::failed(AnalysisErrorKind::Timeout, "");
        assert!(!analysis.is_analyzed);
        assert_eq!(analysis.error_message.as_deref(), Some("Timeout"));
        assert_eq!(analysis.original_quality_score, 0);
        assert!(analysis.is_consistent());
    }

    #[test]
    fn test_analyzed_is_consistent() {
        let analysis = Analysis::analyzed(14);
        assert_eq!(analysis.original_quality_score, 10);
        assert!(analysis.is_consistent());
    }

    #[test]
    fn test_mixed_state_is_inconsistent() {
        let mut analysis = Analysis::analyzed(5);
        analysis.error_message = Some("boom".to_string());
        assert!(!analysis.is_consistent());
    }

    #[test]
    fn test_full_text_includes_tables_and_loose_content() {
        let mut req = Requirement::new("REQ-1", "Power", "The device shall power on");
        req.tables.push(RequirementTable {
            title: "Rails".to_string(),
            headers: vec!["Rail".to_string(), "Voltage".to_string()],
            rows: vec![vec!["VCC".to_string(), "3.3V".to_string()]],
        });
        req.loose_content = Some(LooseContent {
            paragraphs: vec!["Applies to rev B boards".to_string()],
            tables: Vec::new(),
        });
        let text = req.full_text();
        assert!(text.contains("3.3V"));
        assert!(text.contains("rev B"));
    }

    #[test]
    fn test_requirement_yaml_defaults() {
        let yaml = "id: REQ-7\ndescription: The pump shall stop\n";
        let req: Requirement = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(req.id, "REQ-7");
        assert!(req.tables.is_empty());
        assert!(req.analysis.is_none());
    }
}
