//! Derivation & Gap Analysis
//!
//! Derives testable capabilities from requirements, checks which capabilities
//! the requirement set covers, and rolls the results up into a testing
//! workflow validation. Capability derivation and gap analysis can be
//! delegated to injected implementations; the built-in fallbacks are a
//! keyword heuristic and identifier comparison.

use crate::ai::client::{AiError, AiResult, TextGenerator};
use crate::ai::events::{EngineEvent, EventPublisher};
use crate::ai::prompts::build_derivation_prompt;
use crate::ai::responses::extract_json;
use crate::config::DerivationConfig;
use crate::models::Requirement;
use async_trait::async_trait;
use futures_util::future::try_join_all;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Coverage below this share of requirements is reported as low
pub const LOW_COVERAGE_THRESHOLD: f64 = 0.7;
/// Minimum overall score for a valid testing workflow
pub const VALID_WORKFLOW_SCORE: f64 = 0.7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedCapability {
    pub id: String,
    pub description: String,
    /// 0.0 - 1.0
    pub confidence: f64,
    pub source_requirement_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivationResult {
    pub requirement_id: String,
    pub has_testable_content: bool,
    pub confidence: f64,
    pub derived_capabilities: Vec<DerivedCapability>,
    pub issues: Vec<String>,
    /// Set on placeholder results for items that failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DerivationResult {
    pub fn failed(requirement_id: &str, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            requirement_id: requirement_id.to_string(),
            has_testable_content: false,
            confidence: 0.0,
            derived_capabilities: Vec::new(),
            issues: vec![format!("Derivation failed: {}", error)],
            error: Some(error),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum GapSeverity {
    High,
    Medium,
    Low,
}

impl GapSeverity {
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= 0.8 {
            GapSeverity::High
        } else if confidence >= 0.5 {
            GapSeverity::Medium
        } else {
            GapSeverity::Low
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UncoveredCapability {
    pub capability: DerivedCapability,
    pub severity: GapSeverity,
    pub recommendation: String,
}

/// A requirement addressed by more than one capability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementOverlap {
    pub requirement_id: String,
    pub capability_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GapAnalysisResult {
    /// Ordered by severity, highest first
    pub uncovered_capabilities: Vec<UncoveredCapability>,
    pub overlaps: Vec<RequirementOverlap>,
}

/// Derivation of one requirement and its gap pass against the whole set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequirementGapReport {
    pub derivation: DerivationResult,
    pub gap: GapAnalysisResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WorkflowSeverity {
    Critical,
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowIssue {
    pub severity: WorkflowSeverity,
    pub category: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestingWorkflowValidation {
    /// 0 - 100
    pub coverage_percentage: f64,
    pub issues: Vec<WorkflowIssue>,
    pub recommendations: Vec<String>,
    /// 0.0 - 1.0
    pub overall_score: f64,
    pub is_valid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub requirement_id: String,
    pub completed: usize,
    pub total: usize,
}

pub type BatchProgressCallback<'a> = &'a (dyn Fn(&BatchProgress) + Send + Sync);

/// Derives capabilities for a single requirement
#[async_trait]
pub trait CapabilityDeriver: Send + Sync {
    async fn derive(
        &self,
        requirement: &Requirement,
        cancel: &CancellationToken,
    ) -> AiResult<DerivationResult>;
}

/// Compares capabilities against the requirement set
#[async_trait]
pub trait GapAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        capabilities: &[DerivedCapability],
        requirements: &[Requirement],
        cancel: &CancellationToken,
    ) -> AiResult<GapAnalysisResult>;
}

fn capability_id(requirement_id: &str, index: usize) -> String {
    format!("{}-CAP-{}", requirement_id, index + 1)
}

fn sentence_splitter() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[.!?;]\s+|[.!?;]$|\n+").expect("valid sentence regex"))
}

fn quantity_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b\d+(?:\.\d+)?\s*(?:%|percent|ms|s|sec|seconds?|minutes?|hours?|hz|khz|mhz|ghz|v|mv|a|ma|w|kw|kg|g|m|mm|cm|km|°c|c|bytes?|kb|mb|gb)\b|\d+(?:\.\d+)?\s*%",
        )
        .expect("valid quantity regex")
    })
}

fn contains_word(haystack_lower: &str, word: &str) -> bool {
    let word = word.to_lowercase();
    if word.is_empty() {
        return false;
    }
    haystack_lower.match_indices(&word).any(|(start, matched)| {
        let before = haystack_lower[..start].chars().next_back();
        let after = haystack_lower[start + matched.len()..].chars().next();
        !before.map(char::is_alphanumeric).unwrap_or(false)
            && !after.map(char::is_alphanumeric).unwrap_or(false)
    })
}

/// Keyword heuristic: one capability per testable sentence
pub fn derive_heuristically(req: &Requirement, testable_keywords: &[String]) -> DerivationResult {
    let mut text = req.description.clone();
    if let Some(loose) = &req.loose_content {
        for paragraph in &loose.paragraphs {
            text.push('\n');
            text.push_str(paragraph);
        }
    }

    let mut capabilities = Vec::new();
    let mut issues = Vec::new();

    for sentence in sentence_splitter()
        .split(&text)
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        let lower = sentence.to_lowercase();
        let keyword_hit = testable_keywords.iter().any(|k| contains_word(&lower, k));
        let measurable = quantity_regex().is_match(sentence);
        if !keyword_hit && !measurable {
            continue;
        }

        if contains_word(&lower, "tbd") || contains_word(&lower, "tbc") {
            issues.push(format!("Sentence has unresolved values: \"{}\"", sentence));
        }

        let modal = ["shall", "must"].iter().any(|m| contains_word(&lower, m));
        let mut confidence: f64 = 0.4;
        if keyword_hit {
            confidence += 0.2;
        }
        if modal {
            confidence += 0.15;
        }
        if measurable {
            confidence += 0.2;
        }

        capabilities.push(DerivedCapability {
            id: capability_id(&req.id, capabilities.len()),
            description: sentence.to_string(),
            confidence: confidence.min(0.95),
            source_requirement_id: req.id.clone(),
        });
    }

    if capabilities.is_empty() {
        issues.push("No testable statements found".to_string());
    }

    let confidence = capabilities
        .iter()
        .map(|c| c.confidence)
        .fold(0.0_f64, f64::max);

    DerivationResult {
        requirement_id: req.id.clone(),
        has_testable_content: !capabilities.is_empty(),
        confidence,
        derived_capabilities: capabilities,
        issues,
        error: None,
    }
}

/// Identifier comparison: a capability is covered when a requirement in the
/// set carries its id or its source requirement id
pub fn compare_identifiers(
    capabilities: &[DerivedCapability],
    requirements: &[Requirement],
) -> GapAnalysisResult {
    let ids: HashSet<&str> = requirements.iter().map(|r| r.id.as_str()).collect();

    let mut uncovered: Vec<UncoveredCapability> = capabilities
        .iter()
        .filter(|cap| {
            !ids.contains(cap.id.as_str()) && !ids.contains(cap.source_requirement_id.as_str())
        })
        .map(|cap| UncoveredCapability {
            capability: cap.clone(),
            severity: GapSeverity::from_confidence(cap.confidence),
            recommendation: format!(
                "Add a requirement that covers: {}",
                cap.description.trim()
            ),
        })
        .collect();
    uncovered.sort_by(|a, b| {
        a.severity
            .cmp(&b.severity)
            .then_with(|| a.capability.id.cmp(&b.capability.id))
    });

    let overlaps = requirements
        .iter()
        .filter_map(|req| {
            let capability_ids: Vec<String> = capabilities
                .iter()
                .filter(|cap| cap.id == req.id || cap.source_requirement_id == req.id)
                .map(|cap| cap.id.clone())
                .collect();
            (capability_ids.len() > 1).then(|| RequirementOverlap {
                requirement_id: req.id.clone(),
                capability_ids,
            })
        })
        .collect();

    GapAnalysisResult {
        uncovered_capabilities: uncovered,
        overlaps,
    }
}

/// Score the workflow from coverage (0-1) and issue counts
pub fn workflow_score(coverage: f64, critical: usize, errors: usize) -> f64 {
    let penalty = (0.25 * critical as f64 + 0.1 * errors as f64).min(1.0);
    (0.6 * coverage.clamp(0.0, 1.0) + 0.4 * (1.0 - penalty)).clamp(0.0, 1.0)
}

#[derive(Debug, Deserialize)]
struct RawCapabilities {
    #[serde(default, alias = "Capabilities")]
    capabilities: Vec<RawCapability>,
}

#[derive(Debug, Deserialize)]
struct RawCapability {
    #[serde(default, alias = "Description")]
    description: String,
    #[serde(default, alias = "Confidence")]
    confidence: Option<f64>,
}

/// Capability deriver that asks a text generator
pub struct LlmCapabilityDeriver {
    generator: Arc<dyn TextGenerator>,
}

impl LlmCapabilityDeriver {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }

    /// Turn the model's JSON reply into a derivation result
    pub fn parse_capabilities(requirement_id: &str, response: &str) -> AiResult<DerivationResult> {
        let raw: RawCapabilities = serde_json::from_str(extract_json(response))
            .map_err(|e| AiError::ParseError(e.to_string()))?;

        let capabilities: Vec<DerivedCapability> = raw
            .capabilities
            .into_iter()
            .filter(|c| !c.description.trim().is_empty())
            .enumerate()
            .map(|(i, c)| DerivedCapability {
                id: capability_id(requirement_id, i),
                description: c.description.trim().to_string(),
                confidence: c.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
                source_requirement_id: requirement_id.to_string(),
            })
            .collect();

        let confidence = if capabilities.is_empty() {
            0.0
        } else {
            capabilities.iter().map(|c| c.confidence).sum::<f64>() / capabilities.len() as f64
        };
        let issues = if capabilities.is_empty() {
            vec!["No testable statements found".to_string()]
        } else {
            Vec::new()
        };

        Ok(DerivationResult {
            requirement_id: requirement_id.to_string(),
            has_testable_content: !capabilities.is_empty(),
            confidence,
            derived_capabilities: capabilities,
            issues,
            error: None,
        })
    }
}

#[async_trait]
impl CapabilityDeriver for LlmCapabilityDeriver {
    async fn derive(
        &self,
        requirement: &Requirement,
        cancel: &CancellationToken,
    ) -> AiResult<DerivationResult> {
        let response = self
            .generator
            .generate(&build_derivation_prompt(requirement), cancel)
            .await?;
        if response.trim().is_empty() {
            return Err(AiError::EmptyResponse);
        }
        Self::parse_capabilities(&requirement.id, &response)
    }
}

pub struct DerivationEngine {
    config: DerivationConfig,
    deriver: Option<Arc<dyn CapabilityDeriver>>,
    gap_analyzer: Option<Arc<dyn GapAnalyzer>>,
    events: Arc<dyn EventPublisher>,
}

impl DerivationEngine {
    pub fn new(
        config: DerivationConfig,
        deriver: Option<Arc<dyn CapabilityDeriver>>,
        gap_analyzer: Option<Arc<dyn GapAnalyzer>>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            config,
            deriver,
            gap_analyzer,
            events,
        }
    }

    pub fn config(&self) -> &DerivationConfig {
        &self.config
    }

    async fn derive(&self, req: &Requirement, cancel: &CancellationToken) -> AiResult<DerivationResult> {
        if cancel.is_cancelled() {
            return Err(AiError::Cancelled);
        }
        match &self.deriver {
            Some(deriver) => deriver.derive(req, cancel).await,
            None => Ok(derive_heuristically(req, &self.config.testable_keywords)),
        }
    }

    /// Derive capabilities for one requirement. Failures produce a failed
    /// placeholder result rather than an error.
    pub async fn analyze_requirement_derivation(
        &self,
        req: &Requirement,
        cancel: &CancellationToken,
    ) -> DerivationResult {
        match timeout(self.config.item_timeout(), self.derive(req, cancel)).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!(requirement_id = %req.id, error = %e, "capability derivation failed");
                DerivationResult::failed(&req.id, e.to_string())
            }
            Err(_) => {
                warn!(requirement_id = %req.id, "capability derivation timed out");
                DerivationResult::failed(
                    &req.id,
                    AiError::Timeout(self.config.item_timeout_secs).to_string(),
                )
            }
        }
    }

    pub async fn analyze_gap(
        &self,
        capabilities: &[DerivedCapability],
        requirements: &[Requirement],
        cancel: &CancellationToken,
    ) -> GapAnalysisResult {
        if let Some(analyzer) = &self.gap_analyzer {
            match analyzer.analyze(capabilities, requirements, cancel).await {
                Ok(result) => return result,
                Err(e) => warn!(error = %e, "gap analyzer failed, comparing identifiers"),
            }
        }
        compare_identifiers(capabilities, requirements)
    }

    pub async fn analyze_requirement_gap(
        &self,
        req: &Requirement,
        all: &[Requirement],
        cancel: &CancellationToken,
    ) -> RequirementGapReport {
        let derivation = self.analyze_requirement_derivation(req, cancel).await;
        let gap = self
            .analyze_gap(&derivation.derived_capabilities, all, cancel)
            .await;
        RequirementGapReport { derivation, gap }
    }

    /// Derive every requirement with at most `max_concurrency` in flight.
    /// Results come back sorted by requirement id. With `continue_on_error`
    /// off the first failure aborts the batch.
    pub async fn analyze_batch_derivation(
        &self,
        reqs: &[Requirement],
        max_concurrency: usize,
        progress: Option<BatchProgressCallback<'_>>,
        cancel: &CancellationToken,
    ) -> AiResult<Vec<DerivationResult>> {
        let total = reqs.len();
        let semaphore = Semaphore::new(max_concurrency.max(1));
        let completed = AtomicUsize::new(0);
        info!(total, max_concurrency, "starting batch derivation");

        let tasks = reqs.iter().map(|req| {
            let semaphore = &semaphore;
            let completed = &completed;
            async move {
                let _permit = semaphore.acquire().await.map_err(|_| AiError::Cancelled)?;
                if cancel.is_cancelled() {
                    return Err(AiError::Cancelled);
                }

                let outcome = match timeout(self.config.item_timeout(), self.derive(req, cancel)).await
                {
                    Ok(outcome) => outcome,
                    Err(_) => Err(AiError::Timeout(self.config.item_timeout_secs)),
                };
                let result = match outcome {
                    Ok(result) => result,
                    Err(AiError::Cancelled) => return Err(AiError::Cancelled),
                    Err(e) if self.config.continue_on_error => {
                        warn!(requirement_id = %req.id, error = %e, "derivation failed, continuing");
                        DerivationResult::failed(&req.id, e.to_string())
                    }
                    Err(e) => {
                        warn!(requirement_id = %req.id, error = %e, "derivation failed, aborting batch");
                        return Err(e);
                    }
                };

                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                let update = BatchProgress {
                    requirement_id: req.id.clone(),
                    completed: done,
                    total,
                };
                if let Some(progress) = progress {
                    progress(&update);
                }
                self.events.publish(EngineEvent::BatchProgress {
                    requirement_id: update.requirement_id,
                    completed: done,
                    total,
                });
                Ok(result)
            }
        });

        let mut results = try_join_all(tasks).await?;
        results.sort_by(|a, b| a.requirement_id.cmp(&b.requirement_id));
        debug!(total, "batch derivation finished");
        Ok(results)
    }

    /// Batch derivation, one gap pass and a coverage rollup
    pub async fn validate_testing_workflow(
        &self,
        reqs: &[Requirement],
        cancel: &CancellationToken,
    ) -> AiResult<TestingWorkflowValidation> {
        let results = self
            .analyze_batch_derivation(reqs, self.config.max_concurrency, None, cancel)
            .await?;
        let capabilities: Vec<DerivedCapability> = results
            .iter()
            .flat_map(|r| r.derived_capabilities.iter().cloned())
            .collect();
        let gap = self.analyze_gap(&capabilities, reqs, cancel).await;

        Ok(rollup(reqs, &results, &capabilities, &gap))
    }
}

fn rollup(
    reqs: &[Requirement],
    results: &[DerivationResult],
    capabilities: &[DerivedCapability],
    gap: &GapAnalysisResult,
) -> TestingWorkflowValidation {
    let mut issues = Vec::new();
    let mut recommendations = Vec::new();

    if reqs.is_empty() {
        issues.push(WorkflowIssue {
            severity: WorkflowSeverity::Warning,
            category: "NoRequirements".to_string(),
            message: "There are no requirements to validate".to_string(),
        });
        return TestingWorkflowValidation {
            coverage_percentage: 0.0,
            issues,
            recommendations,
            overall_score: 0.0,
            is_valid: false,
        };
    }

    let uncovered_ids: HashSet<&str> = gap
        .uncovered_capabilities
        .iter()
        .map(|u| u.capability.id.as_str())
        .collect();
    let covered_requirements = reqs
        .iter()
        .filter(|req| {
            capabilities.iter().any(|cap| {
                !uncovered_ids.contains(cap.id.as_str())
                    && (cap.source_requirement_id == req.id || cap.id == req.id)
            })
        })
        .count();
    let coverage = covered_requirements as f64 / reqs.len() as f64;

    for result in results {
        if let Some(error) = &result.error {
            issues.push(WorkflowIssue {
                severity: WorkflowSeverity::Error,
                category: "DerivationFailed".to_string(),
                message: format!("{}: {}", result.requirement_id, error),
            });
        } else if !result.has_testable_content {
            issues.push(WorkflowIssue {
                severity: WorkflowSeverity::Warning,
                category: "NotTestable".to_string(),
                message: format!("{} has no testable statements", result.requirement_id),
            });
            recommendations.push(format!(
                "Rewrite {} as \"shall\" statements with measurable acceptance criteria",
                result.requirement_id
            ));
        }
    }

    for uncovered in &gap.uncovered_capabilities {
        let severity = match uncovered.severity {
            GapSeverity::High => WorkflowSeverity::Error,
            GapSeverity::Medium => WorkflowSeverity::Warning,
            GapSeverity::Low => WorkflowSeverity::Info,
        };
        issues.push(WorkflowIssue {
            severity,
            category: "UncoveredCapability".to_string(),
            message: format!(
                "{} is not covered by any requirement",
                uncovered.capability.id
            ),
        });
        recommendations.push(uncovered.recommendation.clone());
    }

    if coverage < LOW_COVERAGE_THRESHOLD {
        let severity = if coverage < 0.5 {
            WorkflowSeverity::Critical
        } else {
            WorkflowSeverity::Error
        };
        issues.push(WorkflowIssue {
            severity,
            category: "LowCoverage".to_string(),
            message: format!(
                "Only {:.0}% of requirements map to a testable capability",
                coverage * 100.0
            ),
        });
        recommendations.push(
            "Add verifiable acceptance criteria to requirements without testable content"
                .to_string(),
        );
    }

    let critical = issues
        .iter()
        .filter(|i| i.severity == WorkflowSeverity::Critical)
        .count();
    let errors = issues
        .iter()
        .filter(|i| i.severity == WorkflowSeverity::Error)
        .count();
    let overall_score = workflow_score(coverage, critical, errors);

    TestingWorkflowValidation {
        coverage_percentage: coverage * 100.0,
        issues,
        recommendations,
        overall_score,
        is_valid: overall_score >= VALID_WORKFLOW_SCORE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::events::NullPublisher;
    use crate::ai::testing::{MockTextGenerator, Script};
    use std::sync::Mutex;
    use std::time::Duration;

    fn engine() -> DerivationEngine {
        DerivationEngine::new(
            DerivationConfig::default(),
            None,
            None,
            Arc::new(NullPublisher),
        )
    }

    fn req(id: &str, description: &str) -> Requirement {
        Requirement::new(id, format!("{} name", id), description)
    }

    #[test]
    fn test_heuristic_one_capability_per_testable_sentence() {
        let r = req(
            "REQ-1",
            "The pump shall stop within 2 s of an alarm. Background: legacy units were noisy. \
             The display must show the flow rate.",
        );
        let result = derive_heuristically(&r, &DerivationConfig::default().testable_keywords);

        assert!(result.has_testable_content);
        assert_eq!(result.derived_capabilities.len(), 2);
        assert_eq!(result.derived_capabilities[0].id, "REQ-1-CAP-1");
        assert_eq!(result.derived_capabilities[1].id, "REQ-1-CAP-2");
        assert!(result.derived_capabilities[0].confidence > result.derived_capabilities[1].confidence);
        assert!(result
            .derived_capabilities
            .iter()
            .all(|c| c.source_requirement_id == "REQ-1"));
    }

    #[test]
    fn test_heuristic_flags_tbd_and_untestable() {
        let keywords = DerivationConfig::default().testable_keywords;
        let r = req("REQ-2", "The heater shall reach TBD degrees.");
        let result = derive_heuristically(&r, &keywords);
        assert_eq!(result.derived_capabilities.len(), 1);
        assert_eq!(result.issues.len(), 1);

        let r = req("REQ-3", "Notes from the kickoff meeting.");
        let result = derive_heuristically(&r, &keywords);
        assert!(!result.has_testable_content);
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_gap_severity_thresholds() {
        assert_eq!(GapSeverity::from_confidence(0.8), GapSeverity::High);
        assert_eq!(GapSeverity::from_confidence(0.79), GapSeverity::Medium);
        assert_eq!(GapSeverity::from_confidence(0.5), GapSeverity::Medium);
        assert_eq!(GapSeverity::from_confidence(0.1), GapSeverity::Low);
    }

    #[test]
    fn test_compare_identifiers() {
        let caps = vec![
            DerivedCapability {
                id: "CAP-A".to_string(),
                description: "low".to_string(),
                confidence: 0.3,
                source_requirement_id: "REQ-X".to_string(),
            },
            DerivedCapability {
                id: "CAP-B".to_string(),
                description: "high".to_string(),
                confidence: 0.9,
                source_requirement_id: "REQ-Y".to_string(),
            },
            DerivedCapability {
                id: "REQ-1-CAP-1".to_string(),
                description: "one".to_string(),
                confidence: 0.9,
                source_requirement_id: "REQ-1".to_string(),
            },
            DerivedCapability {
                id: "REQ-1-CAP-2".to_string(),
                description: "two".to_string(),
                confidence: 0.9,
                source_requirement_id: "REQ-1".to_string(),
            },
        ];
        let reqs = vec![req("REQ-1", "x"), req("REQ-2", "y")];
        let gap = compare_identifiers(&caps, &reqs);

        let uncovered: Vec<_> = gap
            .uncovered_capabilities
            .iter()
            .map(|u| (u.capability.id.as_str(), u.severity))
            .collect();
        assert_eq!(
            uncovered,
            vec![("CAP-B", GapSeverity::High), ("CAP-A", GapSeverity::Low)]
        );
        assert_eq!(gap.overlaps.len(), 1);
        assert_eq!(gap.overlaps[0].requirement_id, "REQ-1");
        assert_eq!(gap.overlaps[0].capability_ids.len(), 2);
    }

    #[test]
    fn test_workflow_score() {
        assert!((workflow_score(1.0, 0, 0) - 1.0).abs() < 1e-9);
        assert!((workflow_score(0.0, 1, 0) - 0.3).abs() < 1e-9);
        assert!((workflow_score(0.5, 10, 10) - 0.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_zero_capabilities_means_zero_coverage() {
        let reqs = vec![
            req("REQ-1", "Notes from the kickoff meeting."),
            req("REQ-2", "Background on the product family."),
            req("REQ-3", "Glossary entry for the pump."),
        ];
        let validation = engine()
            .validate_testing_workflow(&reqs, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(validation.coverage_percentage, 0.0);
        assert!(!validation.is_valid);
        assert!(validation
            .issues
            .iter()
            .any(|i| i.category == "LowCoverage"));
    }

    #[tokio::test]
    async fn test_full_coverage_is_valid() {
        let reqs = vec![
            req("REQ-1", "The pump shall stop within 2 s of an alarm."),
            req("REQ-2", "The display shall show the flow rate in L/min."),
        ];
        let validation = engine()
            .validate_testing_workflow(&reqs, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(validation.coverage_percentage, 100.0);
        assert!(validation.is_valid);
        assert!(!validation.issues.iter().any(|i| i.category == "LowCoverage"));
    }

    struct SlowDeriver {
        in_flight: AtomicUsize,
        max_seen: AtomicUsize,
        fail_id: Option<String>,
    }

    #[async_trait]
    impl CapabilityDeriver for SlowDeriver {
        async fn derive(
            &self,
            requirement: &Requirement,
            _cancel: &CancellationToken,
        ) -> AiResult<DerivationResult> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.fail_id.as_deref() == Some(requirement.id.as_str()) {
                return Err(AiError::LlmRequestFailed("boom".to_string()));
            }
            Ok(derive_heuristically(
                requirement,
                &DerivationConfig::default().testable_keywords,
            ))
        }
    }

    fn slow_engine(fail_id: Option<&str>, continue_on_error: bool) -> (DerivationEngine, Arc<SlowDeriver>) {
        let deriver = Arc::new(SlowDeriver {
            in_flight: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
            fail_id: fail_id.map(str::to_string),
        });
        let config = DerivationConfig {
            continue_on_error,
            ..DerivationConfig::default()
        };
        let engine = DerivationEngine::new(
            config,
            Some(deriver.clone() as Arc<dyn CapabilityDeriver>),
            None,
            Arc::new(NullPublisher),
        );
        (engine, deriver)
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_bounded_and_sorted() {
        let (engine, deriver) = slow_engine(None, true);
        let reqs: Vec<_> = (0..6)
            .rev()
            .map(|i| req(&format!("REQ-{}", i), "The pump shall stop."))
            .collect();
        let seen = Mutex::new(Vec::new());
        let progress: BatchProgressCallback<'_> =
            &|p: &BatchProgress| seen.lock().unwrap().push(p.completed);

        let results = engine
            .analyze_batch_derivation(&reqs, 2, Some(progress), &CancellationToken::new())
            .await
            .unwrap();

        let ids: Vec<_> = results.iter().map(|r| r.requirement_id.clone()).collect();
        assert_eq!(ids, vec!["REQ-0", "REQ-1", "REQ-2", "REQ-3", "REQ-4", "REQ-5"]);
        assert!(deriver.max_seen.load(Ordering::SeqCst) <= 2);
        let mut completed = seen.lock().unwrap().clone();
        completed.sort();
        assert_eq!(completed, vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_continue_on_error() {
        let (engine, _) = slow_engine(Some("REQ-2"), true);
        let reqs: Vec<_> = (1..=3)
            .map(|i| req(&format!("REQ-{}", i), "The pump shall stop."))
            .collect();
        let results = engine
            .analyze_batch_derivation(&reqs, 4, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
        assert!(results[1].is_failed());
        assert!(!results[0].is_failed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_aborts_without_continue_on_error() {
        let (engine, _) = slow_engine(Some("REQ-2"), false);
        let reqs: Vec<_> = (1..=3)
            .map(|i| req(&format!("REQ-{}", i), "The pump shall stop."))
            .collect();
        let err = engine
            .analyze_batch_derivation(&reqs, 4, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AiError::LlmRequestFailed(_)));
    }

    #[tokio::test]
    async fn test_llm_deriver_parses_capabilities() {
        let generator = Arc::new(MockTextGenerator::new(vec![Script::reply(
            r#"Here you go: {"capabilities": [
                {"description": "Stop the pump on alarm", "confidence": 0.9},
                {"description": "  ", "confidence": 0.4},
                {"description": "Log the alarm"}
            ]}"#,
        )]));
        let deriver = LlmCapabilityDeriver::new(generator);
        let result = deriver
            .derive(&req("REQ-7", "The pump shall stop."), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.derived_capabilities.len(), 2);
        assert_eq!(result.derived_capabilities[1].id, "REQ-7-CAP-2");
        assert!((result.confidence - 0.7).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_requirement_gap_report() {
        let reqs = vec![req("REQ-1", "The pump shall stop. The pump must log the stop.")];
        let report = engine()
            .analyze_requirement_gap(&reqs[0], &reqs, &CancellationToken::new())
            .await;
        assert_eq!(report.derivation.derived_capabilities.len(), 2);
        assert!(report.gap.uncovered_capabilities.is_empty());
        assert_eq!(report.gap.overlaps.len(), 1);
    }
}
