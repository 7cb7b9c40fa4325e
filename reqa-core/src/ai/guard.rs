//! Fabrication Guard
//!
//! Detects analyses whose suggested edits invent detail the requirement never
//! contained, either because the model admitted it in its hallucination check
//! or because an edit mentions a suspicious term (a standard, a bus, a
//! precision claim) absent from the original text.

use crate::config::FabricationConfig;
use crate::models::{Analysis, Recommendation};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Score penalty when the model admits fabricated details
pub const SELF_DECLARED_PENALTY: u8 = 3;
/// Score penalty when an edit introduces suspicious terms
pub const PATTERN_PENALTY: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FabricationKind {
    SelfDeclared,
    PatternDetected,
}

#[derive(Debug, Clone)]
pub struct GuardOutcome {
    pub flagged: bool,
    pub kind: Option<FabricationKind>,
    pub suspicious_terms: Vec<String>,
    pub analysis: Analysis,
}

pub struct FabricationGuard {
    terms: Vec<(String, Regex)>,
    self_declared_markers: Vec<Regex>,
}

impl Default for FabricationGuard {
    fn default() -> Self {
        Self::new(&FabricationConfig::default())
    }
}

/// Case-insensitive whole-word matcher for a term. Word boundaries only apply
/// at ends of the term that are themselves letters or digits, so terms like
/// `±` still match inside `±5`.
fn term_regex(term: &str) -> Option<Regex> {
    let first = term.chars().next()?;
    let last = term.chars().last()?;
    let prefix = if first.is_alphanumeric() {
        r"(?:^|[^\p{L}\p{N}])"
    } else {
        ""
    };
    let suffix = if last.is_alphanumeric() {
        r"(?:$|[^\p{L}\p{N}])"
    } else {
        ""
    };
    Regex::new(&format!("(?i){}{}{}", prefix, regex::escape(term), suffix)).ok()
}

/// Case-sensitive matcher for a self-declared marker. Underscores count as
/// word characters so `FABRICATED` does not fire inside `NO_FABRICATED_DETAILS`.
fn marker_regex(marker: &str) -> Option<Regex> {
    Regex::new(&format!(
        r"(?:^|[^\p{{L}}\p{{N}}_])({})(?:$|[^\p{{L}}\p{{N}}_])",
        regex::escape(marker)
    ))
    .ok()
}

/// True when the word right before `offset` is a negation such as `NO` or `not`
fn negated_before(text: &str, offset: usize) -> bool {
    let before =
        text[..offset].trim_end_matches(|c: char| c.is_whitespace() || c == '-' || c == ':');
    let word = before
        .rsplit(|c: char| !c.is_alphanumeric())
        .next()
        .unwrap_or_default();
    word.eq_ignore_ascii_case("no") || word.eq_ignore_ascii_case("not")
}

fn penalize(score: u8, penalty: u8) -> u8 {
    score.saturating_sub(penalty).max(1).min(score)
}

impl FabricationGuard {
    pub fn new(config: &FabricationConfig) -> Self {
        let terms = config
            .suspicious_terms
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .filter_map(|t| term_regex(t).map(|re| (t.to_string(), re)))
            .collect();
        Self {
            terms,
            self_declared_markers: config
                .self_declared_markers
                .iter()
                .map(|m| m.trim())
                .filter(|m| !m.is_empty())
                .filter_map(marker_regex)
                .collect(),
        }
    }

    /// Terms present in `edit` but not in `original`
    pub fn suspicious_terms_in(&self, edit: &str, original: &str) -> Vec<String> {
        self.terms
            .iter()
            .filter(|(_, re)| re.is_match(edit) && !re.is_match(original))
            .map(|(term, _)| term.clone())
            .collect()
    }

    pub fn is_self_declared(&self, hallucination_check: &str) -> bool {
        self.self_declared_markers.iter().any(|re| {
            re.captures_iter(hallucination_check)
                .filter_map(|caps| caps.get(1))
                .any(|m| !negated_before(hallucination_check, m.start()))
        })
    }

    /// Inspect a successful analysis against the requirement's own text
    pub fn check(&self, analysis: Analysis, original_text: &str) -> GuardOutcome {
        let mut analysis = analysis;
        if !analysis.is_analyzed {
            return GuardOutcome {
                flagged: false,
                kind: None,
                suspicious_terms: Vec::new(),
                analysis,
            };
        }

        if self.is_self_declared(&analysis.hallucination_check) {
            warn!(
                score = analysis.original_quality_score,
                "model declared fabricated details, discarding its recommendations"
            );
            analysis.original_quality_score =
                penalize(analysis.original_quality_score, SELF_DECLARED_PENALTY);
            analysis.recommendations = vec![Recommendation {
                category: "Manual Review".to_string(),
                description: "The analysis reported that its suggestions contained fabricated \
                              details, so they were discarded."
                    .to_string(),
                suggested_edit: "Review this requirement manually against its source documents."
                    .to_string(),
            }];
            analysis.quality_warning = Some(
                "Warning: the model reported fabricated details; recommendations need manual review"
                    .to_string(),
            );
            return GuardOutcome {
                flagged: true,
                kind: Some(FabricationKind::SelfDeclared),
                suspicious_terms: Vec::new(),
                analysis,
            };
        }

        let mut found: Vec<String> = Vec::new();
        for rec in &analysis.recommendations {
            for term in self.suspicious_terms_in(&rec.suggested_edit, original_text) {
                if !found.contains(&term) {
                    found.push(term);
                }
            }
        }

        if found.is_empty() {
            debug!("no fabricated details detected");
            return GuardOutcome {
                flagged: false,
                kind: None,
                suspicious_terms: found,
                analysis,
            };
        }

        warn!(terms = ?found, "suggested edits introduce details absent from the requirement");
        analysis.original_quality_score = penalize(analysis.original_quality_score, PATTERN_PENALTY);
        analysis.quality_warning = Some(format!(
            "Caution: suggested edits introduce details not present in the requirement ({})",
            found.join(", ")
        ));
        GuardOutcome {
            flagged: true,
            kind: Some(FabricationKind::PatternDetected),
            suspicious_terms: found,
            analysis,
        }
    }
}
