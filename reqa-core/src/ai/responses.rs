//! Response Parsing Module
//!
//! Turns raw model output into an [`Analysis`]. Models are asked for JSON but
//! do not always comply, so two readers are tried in turn: a lenient JSON
//! reader (fenced or bare, any common key casing) and a reader for the
//! natural-language layout models fall back to (`QUALITY SCORE: 7/10`,
//! `ISSUES:`, `RECOMMENDATIONS:` ...). Recommendations that are incomplete or
//! contain placeholder text are dropped afterwards.

use crate::config::ParserConfig;
use crate::models::{Analysis, Issue, Recommendation};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::sync::OnceLock;
use tracing::debug;

static SCORE_PATTERN: OnceLock<Regex> = OnceLock::new();
static SECTION_PATTERN: OnceLock<Regex> = OnceLock::new();
static FIELD_PATTERN: OnceLock<Regex> = OnceLock::new();
static SEVERITY_ISSUE_PATTERN: OnceLock<Regex> = OnceLock::new();
static BULLET_PATTERN: OnceLock<Regex> = OnceLock::new();

fn score_pattern() -> &'static Regex {
    SCORE_PATTERN.get_or_init(|| {
        Regex::new(r"(?im)^[\s#*]*(?:original\s+)?quality\s+score[\s*]*[:=][\s*]*(\d+(?:\.\d+)?)")
            .expect("valid score regex")
    })
}

fn section_pattern() -> &'static Regex {
    SECTION_PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)^[\s#*]*(issues|recommendations|freeform\s+feedback|feedback|hallucination\s+check)[\s*]*:?[\s*]*(.*)$",
        )
        .expect("valid section regex")
    })
}

fn field_pattern() -> &'static Regex {
    FIELD_PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^[\s*]*(category|description|suggested\s*edit)[\s*]*:[\s*]*(.*)$")
            .expect("valid field regex")
    })
}

fn severity_issue_pattern() -> &'static Regex {
    SEVERITY_ISSUE_PATTERN.get_or_init(|| {
        Regex::new(r"^\[(\w+)\]\s*(?:([^:]{1,40}):\s*)?(.+)$").expect("valid issue regex")
    })
}

fn bullet_pattern() -> &'static Regex {
    BULLET_PATTERN.get_or_init(|| Regex::new(r"^\s*(?:[-*•]|\d+[.)])\s+").expect("valid bullet regex"))
}

/// Extract JSON from a response that may contain markdown code blocks
pub fn extract_json(response: &str) -> &str {
    // Look for JSON in markdown code block
    if let Some(start) = response.find("```json") {
        let json_start = start + 7; // Skip "```json"
        if let Some(end) = response[json_start..].find("```") {
            return response[json_start..json_start + end].trim();
        }
    }

    // Look for generic code block
    if let Some(start) = response.find("```") {
        let code_start = start + 3;
        // Skip language identifier if present
        let json_start = if let Some(newline) = response[code_start..].find('\n') {
            code_start + newline + 1
        } else {
            code_start
        };
        if let Some(end) = response[json_start..].find("```") {
            return response[json_start..json_start + end].trim();
        }
    }

    // Try to find JSON object directly
    if let Some(start) = response.find('{') {
        if let Some(end) = response.rfind('}') {
            if end > start {
                return &response[start..=end];
            }
        }
    }

    response.trim()
}

#[derive(Debug, Deserialize)]
struct RawAnalysis {
    #[serde(
        default,
        alias = "QualityScore",
        alias = "qualityScore",
        alias = "OriginalQualityScore",
        alias = "originalQualityScore",
        alias = "score"
    )]
    quality_score: Option<Value>,
    #[serde(default, alias = "Issues")]
    issues: Vec<RawIssue>,
    #[serde(default, alias = "Recommendations")]
    recommendations: Vec<RawRecommendation>,
    #[serde(default, alias = "FreeformFeedback", alias = "freeformFeedback", alias = "feedback")]
    freeform_feedback: Option<Value>,
    #[serde(default, alias = "HallucinationCheck", alias = "hallucinationCheck")]
    hallucination_check: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawIssue {
    Text(String),
    Detailed {
        #[serde(default, alias = "Category", alias = "type", alias = "Type")]
        category: Option<String>,
        #[serde(default, alias = "Severity")]
        severity: Option<String>,
        #[serde(default, alias = "Description", alias = "text", alias = "Text")]
        description: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawRecommendation {
    Text(String),
    Detailed {
        #[serde(default, alias = "Category")]
        category: Option<String>,
        #[serde(default, alias = "Description")]
        description: Option<String>,
        #[serde(
            default,
            alias = "SuggestedEdit",
            alias = "suggestedEdit",
            alias = "suggested_edit"
        )]
        suggested_edit: Option<String>,
    },
}

/// Parses model output into analyses, applying recommendation hygiene
#[derive(Debug, Clone)]
pub struct ResponseParser {
    placeholder_markers: Vec<String>,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new(&ParserConfig::default())
    }
}

impl ResponseParser {
    pub fn new(config: &ParserConfig) -> Self {
        Self {
            placeholder_markers: config.placeholder_markers.clone(),
        }
    }

    /// Parse a raw response. Returns `None` only when neither JSON nor the
    /// natural-language layout can be recovered.
    pub fn parse_response(&self, raw: &str, requirement_id: &str) -> Option<Analysis> {
        if raw.trim().is_empty() {
            debug!(requirement_id, "empty response, nothing to parse");
            return None;
        }

        let mut analysis = match parse_json(raw) {
            Some(analysis) => analysis,
            None => {
                debug!(requirement_id, "response is not JSON, trying natural-language layout");
                parse_natural_language(raw)?
            }
        };

        let removed = self.strip_low_quality_recommendations(&mut analysis);
        if removed > 0 {
            debug!(requirement_id, removed, "dropped low-quality recommendations");
        }
        Some(analysis)
    }

    /// Remove recommendations with missing fields or placeholder text.
    /// Returns how many were removed.
    pub fn strip_low_quality_recommendations(&self, analysis: &mut Analysis) -> usize {
        let before = analysis.recommendations.len();
        analysis
            .recommendations
            .retain(|rec| is_usable_recommendation(rec, &self.placeholder_markers));
        before - analysis.recommendations.len()
    }
}

/// Parse with the default placeholder markers
pub fn parse_response(raw: &str, requirement_id: &str) -> Option<Analysis> {
    ResponseParser::default().parse_response(raw, requirement_id)
}

/// True when the text contains any of the placeholder markers (case-insensitive)
pub fn contains_placeholder(text: &str, markers: &[String]) -> bool {
    let lower = text.to_lowercase();
    markers
        .iter()
        .filter(|m| !m.is_empty())
        .any(|m| lower.contains(&m.to_lowercase()))
}

fn is_usable_recommendation(rec: &Recommendation, markers: &[String]) -> bool {
    let fields = [&rec.category, &rec.description, &rec.suggested_edit];
    fields.iter().all(|f| !f.trim().is_empty())
        && !fields.iter().any(|f| contains_placeholder(f, markers))
}

fn parse_json(raw: &str) -> Option<Analysis> {
    let json_str = extract_json(raw);
    let parsed: RawAnalysis = serde_json::from_str(json_str).ok()?;
    let score = parsed.quality_score.as_ref().and_then(score_from_value)?;

    let mut analysis = Analysis::analyzed(score);
    analysis.issues = parsed
        .issues
        .into_iter()
        .filter_map(|issue| match issue {
            RawIssue::Text(text) => non_empty(text).map(|description| Issue {
                category: "General".to_string(),
                severity: "Medium".to_string(),
                description,
            }),
            RawIssue::Detailed {
                category,
                severity,
                description,
            } => description.and_then(non_empty).map(|description| Issue {
                category: category.and_then(non_empty).unwrap_or_else(|| "General".to_string()),
                severity: severity.and_then(non_empty).unwrap_or_else(|| "Medium".to_string()),
                description,
            }),
        })
        .collect();
    analysis.recommendations = parsed
        .recommendations
        .into_iter()
        .map(|rec| match rec {
            RawRecommendation::Text(text) => Recommendation {
                category: String::new(),
                description: text,
                suggested_edit: String::new(),
            },
            RawRecommendation::Detailed {
                category,
                description,
                suggested_edit,
            } => Recommendation {
                category: category.unwrap_or_default().trim().to_string(),
                description: description.unwrap_or_default().trim().to_string(),
                suggested_edit: suggested_edit.unwrap_or_default().trim().to_string(),
            },
        })
        .collect();
    analysis.freeform_feedback = parsed
        .freeform_feedback
        .map(|v| value_to_text(&v))
        .unwrap_or_default();
    analysis.hallucination_check = parsed
        .hallucination_check
        .map(|v| match v {
            Value::Bool(false) => crate::ai::prompts::NO_FABRICATION.to_string(),
            Value::Bool(true) => crate::ai::prompts::FABRICATED_DETAILS.to_string(),
            other => value_to_text(&other),
        })
        .unwrap_or_default();
    Some(analysis)
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Scores arrive as 7, 7.5, "7" or "7/10"
fn score_from_value(value: &Value) -> Option<u8> {
    let number = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => {
            let leading: String = s
                .trim()
                .chars()
                .take_while(|c| c.is_ascii_digit() || *c == '.')
                .collect();
            leading.parse::<f64>().ok()?
        }
        _ => return None,
    };
    Some(clamp_score(number))
}

fn clamp_score(number: f64) -> u8 {
    number.round().clamp(0.0, 10.0) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Issues,
    Recommendations,
    Feedback,
    Hallucination,
}

#[derive(Default)]
struct PendingRecommendation {
    category: String,
    description: String,
    suggested_edit: String,
}

impl PendingRecommendation {
    fn is_empty(&self) -> bool {
        self.category.is_empty() && self.description.is_empty() && self.suggested_edit.is_empty()
    }

    fn finish(self) -> Recommendation {
        Recommendation {
            category: self.category.trim().to_string(),
            description: self.description.trim().to_string(),
            suggested_edit: self.suggested_edit.trim().to_string(),
        }
    }
}

fn parse_natural_language(text: &str) -> Option<Analysis> {
    let score = score_pattern()
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .map(clamp_score)?;

    let mut analysis = Analysis::analyzed(score);
    let mut section = Section::None;
    let mut feedback = Vec::new();
    let mut hallucination = Vec::new();
    let mut pending = PendingRecommendation::default();
    let mut last_field = "";

    for line in text.lines() {
        if score_pattern().is_match(line) {
            section = Section::None;
            continue;
        }

        if let Some(caps) = section_pattern().captures(line) {
            let name = caps[1].to_lowercase();
            let rest = caps.get(2).map(|m| m.as_str().trim()).unwrap_or("");
            section = match name.as_str() {
                "issues" => Section::Issues,
                "recommendations" => Section::Recommendations,
                "hallucination check" => Section::Hallucination,
                _ => Section::Feedback,
            };
            match section {
                Section::Feedback if !rest.is_empty() => feedback.push(rest.to_string()),
                Section::Hallucination if !rest.is_empty() => hallucination.push(rest.to_string()),
                _ => {}
            }
            continue;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match section {
            Section::Issues => {
                let item = bullet_pattern().replace(trimmed, "").trim().to_string();
                if item.is_empty() || item.eq_ignore_ascii_case("none") {
                    continue;
                }
                analysis.issues.push(parse_issue_line(&item));
            }
            Section::Recommendations => {
                let starts_item = bullet_pattern().is_match(line);
                let item = bullet_pattern().replace(trimmed, "").trim().to_string();
                if let Some(caps) = field_pattern().captures(&item) {
                    let key = caps[1].to_lowercase().replace(' ', "");
                    let value = caps.get(2).map(|m| m.as_str().trim()).unwrap_or("").to_string();
                    let starts_new = (key == "category" && !pending.is_empty())
                        || (starts_item && !pending.is_empty() && key != "suggestededit");
                    if starts_new {
                        analysis
                            .recommendations
                            .push(std::mem::take(&mut pending).finish());
                    }
                    match key.as_str() {
                        "category" => {
                            pending.category = value;
                            last_field = "category";
                        }
                        "description" => {
                            pending.description = value;
                            last_field = "description";
                        }
                        _ => {
                            pending.suggested_edit = value;
                            last_field = "suggested_edit";
                        }
                    }
                } else if !pending.is_empty() && !starts_item {
                    // continuation line of the previous field
                    let target = match last_field {
                        "category" => &mut pending.category,
                        "description" => &mut pending.description,
                        _ => &mut pending.suggested_edit,
                    };
                    target.push(' ');
                    target.push_str(&item);
                } else {
                    if !pending.is_empty() {
                        analysis
                            .recommendations
                            .push(std::mem::take(&mut pending).finish());
                    }
                    pending.description = item;
                    last_field = "description";
                }
            }
            Section::Feedback => feedback.push(trimmed.to_string()),
            Section::Hallucination => hallucination.push(trimmed.to_string()),
            Section::None => {}
        }
    }

    if !pending.is_empty() {
        analysis.recommendations.push(pending.finish());
    }
    analysis.freeform_feedback = feedback.join(" ");
    analysis.hallucination_check = hallucination.join(" ");
    Some(analysis)
}

fn parse_issue_line(item: &str) -> Issue {
    if let Some(caps) = severity_issue_pattern().captures(item) {
        return Issue {
            category: caps
                .get(2)
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_else(|| "General".to_string()),
            severity: caps[1].to_string(),
            description: caps[3].trim().to_string(),
        };
    }

    if let Some((category, description)) = item.split_once(':') {
        if !category.trim().is_empty() && category.len() <= 40 && !description.trim().is_empty() {
            return Issue {
                category: category.trim().to_string(),
                severity: "Medium".to_string(),
                description: description.trim().to_string(),
            };
        }
    }

    Issue {
        category: "General".to_string(),
        severity: "Medium".to_string(),
        description: item.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_from_markdown() {
        let response = r#"Here's my analysis:

```json
{
  "QualityScore": 7,
  "Issues": []
}
```

That's my evaluation."#;

        let json = extract_json(response);
        assert!(json.starts_with('{'));
        assert!(json.ends_with('}'));
        assert!(json.contains("QualityScore"));
    }

    #[test]
    fn test_extract_json_direct() {
        let response = r#"{"QualityScore": 8, "Issues": []}"#;
        let json = extract_json(response);
        assert_eq!(json, response);
    }

    #[test]
    fn test_parse_json_response() {
        let response = r#"```json
{
  "QualityScore": 6,
  "Issues": [
    {"Category": "Clarity", "Severity": "High", "Description": "'quickly' is undefined"}
  ],
  "Recommendations": [
    {
      "Category": "Clarity",
      "Description": "Quantify the response time",
      "SuggestedEdit": "The system shall respond to a login request within 2 seconds."
    }
  ],
  "FreeformFeedback": "Mostly clear.",
  "HallucinationCheck": "NO_FABRICATION"
}
```"#;

        let analysis = parse_response(response, "REQ-1").unwrap();
        assert!(analysis.is_analyzed);
        assert!(analysis.is_consistent());
        assert_eq!(analysis.original_quality_score, 6);
        assert_eq!(analysis.issues.len(), 1);
        assert_eq!(analysis.issues[0].severity, "High");
        assert_eq!(analysis.recommendations.len(), 1);
        assert_eq!(analysis.freeform_feedback, "Mostly clear.");
        assert_eq!(analysis.hallucination_check, "NO_FABRICATION");
    }

    #[test]
    fn test_parse_snake_case_and_string_score() {
        let response = r#"{"quality_score": "8/10", "issues": ["Missing units"], "recommendations": []}"#;
        let analysis = parse_response(response, "REQ-2").unwrap();
        assert_eq!(analysis.original_quality_score, 8);
        assert_eq!(analysis.issues[0].description, "Missing units");
        assert_eq!(analysis.issues[0].category, "General");
    }

    #[test]
    fn test_score_is_clamped() {
        let analysis = parse_response(r#"{"QualityScore": 14.2}"#, "REQ-3").unwrap();
        assert_eq!(analysis.original_quality_score, 10);
        let analysis = parse_response(r#"{"QualityScore": 6.6}"#, "REQ-3").unwrap();
        assert_eq!(analysis.original_quality_score, 7);
    }

    #[test]
    fn test_placeholder_recommendations_are_removed() {
        let response = r#"{
  "QualityScore": 5,
  "Recommendations": [
    {"Category": "Clarity", "Description": "Define timing", "SuggestedEdit": "The unit shall respond within [Define this] ms."},
    {"Category": "Clarity", "Description": "Give an example", "SuggestedEdit": "EXAMPLE: The unit shall beep."},
    {"Category": "", "Description": "No category", "SuggestedEdit": "Text"},
    {"Category": "Testability", "Description": "Missing edit"},
    {"Category": "Testability", "Description": "Add pass criteria", "SuggestedEdit": "The unit shall emit a tone audible at 1 m."}
  ]
}"#;
        let analysis = parse_response(response, "REQ-4").unwrap();
        assert_eq!(analysis.recommendations.len(), 1);
        assert_eq!(analysis.recommendations[0].category, "Testability");
        for rec in &analysis.recommendations {
            assert!(!rec.category.is_empty());
            assert!(!rec.description.is_empty());
            assert!(!rec.suggested_edit.is_empty());
        }
    }

    #[test]
    fn test_all_recommendations_removed_is_still_valid() {
        let response = r#"{"QualityScore": 4, "Recommendations": [{"Category": "X", "Description": "Y", "SuggestedEdit": "[TBD]"}]}"#;
        let analysis = parse_response(response, "REQ-5").unwrap();
        assert!(analysis.is_analyzed);
        assert!(analysis.recommendations.is_empty());
    }

    #[test]
    fn test_parse_natural_language_response() {
        let response = r#"QUALITY SCORE: 7/10

ISSUES:
- [High] Clarity: The term "promptly" is not measurable
- Testability: No pass/fail criteria

RECOMMENDATIONS:
1. Category: Clarity
   Description: Replace "promptly" with a time limit
   Suggested Edit: The controller shall acknowledge a fault
   within 500 ms of detection.
2. Category: Testability
   Description: State the observable outcome
   Suggested Edit: The controller shall set the FAULT LED on detection.

FEEDBACK: Reasonable requirement that needs measurable limits.

HALLUCINATION CHECK: NO_FABRICATION"#;

        let analysis = parse_response(response, "REQ-6").unwrap();
        assert_eq!(analysis.original_quality_score, 7);
        assert_eq!(analysis.issues.len(), 2);
        assert_eq!(analysis.issues[0].severity, "High");
        assert_eq!(analysis.issues[0].category, "Clarity");
        assert_eq!(analysis.issues[1].category, "Testability");
        assert_eq!(analysis.recommendations.len(), 2);
        assert_eq!(
            analysis.recommendations[0].suggested_edit,
            "The controller shall acknowledge a fault within 500 ms of detection."
        );
        assert_eq!(analysis.recommendations[1].category, "Testability");
        assert_eq!(
            analysis.freeform_feedback,
            "Reasonable requirement that needs measurable limits."
        );
        assert_eq!(analysis.hallucination_check, "NO_FABRICATION");
    }

    #[test]
    fn test_unrecoverable_response_returns_none() {
        assert!(parse_response("I'm sorry, I cannot help with that.", "REQ-7").is_none());
        assert!(parse_response("", "REQ-7").is_none());
        assert!(parse_response("{\"unrelated\": true}", "REQ-7").is_none());
    }

    #[test]
    fn test_hallucination_check_bool() {
        let analysis = parse_response(r#"{"QualityScore": 5, "HallucinationCheck": true}"#, "R").unwrap();
        assert_eq!(analysis.hallucination_check, "FABRICATED_DETAILS");
    }
}
