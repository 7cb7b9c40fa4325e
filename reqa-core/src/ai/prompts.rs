//! Prompt Templates for AI Operations
//!
//! This module builds the system prompt and the per-requirement context
//! prompt, plus the follow-up prompts used for repair, reflection and
//! fabrication correction. Everything here is pure string assembly.

use crate::models::{LooseContent, Requirement, RequirementTable};
use std::collections::BTreeMap;

/// Marker the model uses when it did not invent anything
pub const NO_FABRICATION: &str = "NO_FABRICATION";
/// Marker the model uses to admit invented detail
pub const FABRICATED_DETAILS: &str = "FABRICATED_DETAILS";
/// Reflection verdicts
pub const APPROVED: &str = "APPROVED";
pub const NEEDS_IMPROVEMENT: &str = "NEEDS_IMPROVEMENT";

/// Build the system prompt shared by every requirement in a session
pub fn system_prompt() -> String {
    format!(
        r#"You are an expert requirements analyst reviewing engineering requirements for quality.

## Rules
1. Judge only the text you are given. Never invent standards, protocols, interfaces,
   tolerances or numeric values that do not appear in the requirement or its context.
2. Every recommendation must contain a complete, ready-to-use rewrite in "SuggestedEdit".
   Never use placeholders such as "[Define this]" or "EXAMPLE:".
3. Use all supplied tables, supplemental content and verification assumptions.
4. If you had to assume any technical detail, say so in "HallucinationCheck".

## Evaluation Criteria
1. Clarity: Is the requirement unambiguous?
2. Completeness: Does it have sufficient detail for implementation?
3. Testability: Can it be verified with a clear pass/fail outcome?
4. Consistency: Do the description, tables and supplemental content agree?
5. Feasibility: Is it realistic and achievable?

## Response Format
Respond ONLY with valid JSON in this exact format:
```json
{{
  "QualityScore": <0-10>,
  "Issues": [
    {{
      "Category": "<Clarity|Completeness|Testability|Consistency|Feasibility>",
      "Severity": "<Low|Medium|High>",
      "Description": "<description of the issue>"
    }}
  ],
  "Recommendations": [
    {{
      "Category": "<category>",
      "Description": "<what to change and why>",
      "SuggestedEdit": "<complete rewritten requirement text>"
    }}
  ],
  "FreeformFeedback": "<overall assessment>",
  "HallucinationCheck": "<{NO_FABRICATION} or {FABRICATED_DETAILS}: list of assumed details>"
}}
```"#
    )
}

/// Render a table as a Markdown table, preceded by its title
pub fn render_table(table: &RequirementTable, label: &str) -> String {
    let mut out = String::new();
    if table.title.trim().is_empty() {
        out.push_str(&format!("#### {}\n", label));
    } else {
        out.push_str(&format!("#### {}: {}\n", label, table.title.trim()));
    }

    let columns = table
        .rows
        .iter()
        .map(|r| r.len())
        .chain(std::iter::once(table.headers.len()))
        .max()
        .unwrap_or(0);
    if columns == 0 {
        out.push_str("(empty table)\n");
        return out;
    }

    let header: Vec<String> = (0..columns)
        .map(|i| {
            table
                .headers
                .get(i)
                .map(|h| escape_cell(h))
                .unwrap_or_else(|| format!("Column {}", i + 1))
        })
        .collect();
    out.push_str(&format!("| {} |\n", header.join(" | ")));
    out.push_str(&format!("|{}\n", " --- |".repeat(columns)));

    for row in &table.rows {
        let cells: Vec<String> = (0..columns)
            .map(|i| row.get(i).map(|c| escape_cell(c)).unwrap_or_default())
            .collect();
        out.push_str(&format!("| {} |\n", cells.join(" | ")));
    }
    out
}

fn escape_cell(cell: &str) -> String {
    cell.replace('|', "\\|").replace(['\r', '\n'], " ").trim().to_string()
}

/// Format the selected verification assumptions. Unknown keys are kept
/// verbatim so that nothing the user selected is silently dropped.
pub fn assumptions_text(keys: &[String], catalog: &BTreeMap<String, String>) -> String {
    keys.iter()
        .filter(|k| !k.trim().is_empty())
        .map(|key| match catalog.get(key) {
            Some(text) => format!("- {}: {}", key, text),
            None => format!("- {}", key),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Build the per-requirement context prompt. Every non-empty field ends up
/// in its own section, in a fixed order.
pub fn build_context_prompt(
    id: &str,
    name: &str,
    description: &str,
    tables: &[RequirementTable],
    loose_content: Option<&LooseContent>,
    assumptions_text: &str,
) -> String {
    let mut prompt = String::from("## Requirement\n");
    prompt.push_str(&format!("- ID: {}\n", id));
    if !name.trim().is_empty() {
        prompt.push_str(&format!("- Name: {}\n", name.trim()));
    }

    prompt.push_str("\n### Description\n");
    if description.trim().is_empty() {
        prompt.push_str("(no description provided)\n");
    } else {
        prompt.push_str(description.trim());
        prompt.push('\n');
    }

    let tables: Vec<&RequirementTable> = tables.iter().filter(|t| !t.is_empty()).collect();
    if !tables.is_empty() {
        prompt.push_str("\n### Tables\n");
        for (i, table) in tables.iter().enumerate() {
            prompt.push_str(&render_table(table, &format!("Table {}", i + 1)));
            prompt.push('\n');
        }
    }

    if let Some(loose) = loose_content.filter(|l| !l.is_empty()) {
        prompt.push_str("\n### Supplemental Content\n");
        for paragraph in loose.paragraphs.iter().filter(|p| !p.trim().is_empty()) {
            prompt.push_str(paragraph.trim());
            prompt.push_str("\n\n");
        }
        let loose_tables = loose.tables.iter().filter(|t| !t.is_empty());
        for (i, table) in loose_tables.enumerate() {
            prompt.push_str(&render_table(table, &format!("Supplemental Table {}", i + 1)));
            prompt.push('\n');
        }
    }

    if !assumptions_text.trim().is_empty() {
        prompt.push_str("\n### Verification Assumptions\n");
        prompt.push_str(assumptions_text.trim());
        prompt.push('\n');
    }

    prompt.push_str(
        "\n## Task\nAnalyze this requirement against the evaluation criteria and respond in the required JSON format.\n",
    );
    prompt
}

/// Convenience wrapper taking the fields from a requirement
pub fn build_requirement_prompt(req: &Requirement, catalog: &BTreeMap<String, String>) -> String {
    build_context_prompt(
        &req.id,
        &req.name,
        &req.description,
        &req.tables,
        req.loose_content.as_ref(),
        &assumptions_text(&req.selected_assumptions, catalog),
    )
}

/// A self-contained prompt for use with an external, disconnected model
pub fn build_external_prompt(system: &str, context: &str) -> String {
    format!("{}\n\n---\n\n{}", system.trim(), context.trim())
}

/// Ask the model to turn unparseable output into the required JSON
pub fn build_repair_prompt(raw_response: &str) -> String {
    format!(
        r#"The following requirement analysis could not be read because it is not in the required JSON format.

## Previous Output
{}

## Task
Rewrite the same analysis as valid JSON with the keys "QualityScore", "Issues",
"Recommendations", "FreeformFeedback" and "HallucinationCheck". Do not add new findings.
Respond ONLY with the JSON object."#,
        raw_response.trim()
    )
}

/// Ask the model to critique its own answer
pub fn build_reflection_prompt(response: &str, original_prompt: &str) -> String {
    format!(
        r#"Review the requirement analysis below, which was produced for the request that follows it.

## Analysis Under Review
{}

## Original Request
{}

## Review Criteria
1. Format: Is it valid JSON in the required format?
2. Specificity: Are issues and recommendations specific to this requirement?
3. Placeholders: Is every SuggestedEdit complete, without bracketed placeholders or "EXAMPLE:" text?
4. Context: Does it use every table, supplemental paragraph and assumption that was supplied?

Reply with "{}" if the analysis meets every criterion. Otherwise reply with
"{}" followed by a short list of the problems."#,
        response.trim(),
        original_prompt.trim(),
        APPROVED,
        NEEDS_IMPROVEMENT
    )
}

/// Ask the model for a revised answer addressing its own critique
pub fn build_improvement_prompt(original_prompt: &str, response: &str, critique: &str) -> String {
    format!(
        r#"{}

## Your Previous Analysis
{}

## Review Findings
{}

## Task
Produce an improved analysis that fixes every finding above. Respond ONLY with the JSON object."#,
        original_prompt.trim(),
        response.trim(),
        critique.trim()
    )
}

/// Re-ask after the fabrication guard flagged the answer
pub fn build_anti_fabrication_prompt(original_prompt: &str, suspicious_terms: &[String]) -> String {
    let terms = if suspicious_terms.is_empty() {
        "(details the model admitted to assuming)".to_string()
    } else {
        suspicious_terms.join(", ")
    };
    format!(
        r#"{}

## Correction Required
Your previous analysis introduced technical details that are not in the requirement: {}.
Rewrite the analysis using ONLY information present in the requirement and its context.
Where information is missing, recommend that it be specified instead of inventing a value,
standard or interface. Set "HallucinationCheck" to "{}" only if nothing was assumed."#,
        original_prompt.trim(),
        terms,
        NO_FABRICATION
    )
}

/// Prompt used by the model-backed capability deriver
pub fn build_derivation_prompt(req: &Requirement) -> String {
    format!(
        r#"You are a verification engineer deriving testable system capabilities from a requirement.

## Requirement {}
{}

{}

## Task
List each distinct, testable behavior the system must exhibit to satisfy this requirement.
Respond ONLY with valid JSON in this exact format:
```json
{{
  "capabilities": [
    {{ "description": "<testable behavior>", "confidence": <0.0-1.0> }}
  ]
}}
```
If the requirement contains nothing testable, return: {{"capabilities": []}}"#,
        req.id,
        req.name,
        req.description
    )
}
