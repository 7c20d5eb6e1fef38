//! The Reviewer's structured output.
//!
//! The schema is declared explicitly and validated here, independent of any
//! provider-native structured-output feature.

use serde::{Deserialize, Serialize};
use serde_json::json;

/// Minimum score a passing report must carry.
pub const PASSING_SCORE: u32 = 80;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StructuredReport {
    pub word_count: u64,
    pub score: u32,
    pub comments: Vec<String>,
    pub is_passed: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ReportError {
    #[error("report is not a JSON object: {0}")]
    NotJson(String),
    #[error("report does not match schema: {0}")]
    Schema(String),
    #[error("score {0} is outside 0..=100")]
    ScoreOutOfRange(u32),
    #[error("report marked as passed with score {0} below {PASSING_SCORE}")]
    PassedBelowThreshold(u32),
}

impl StructuredReport {
    /// JSON Schema handed to the model describing the exact report shape.
    pub fn schema() -> serde_json::Value {
        json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["word_count", "score", "comments", "is_passed"],
            "properties": {
                "word_count": {
                    "type": "integer",
                    "minimum": 0,
                    "description": "Exact length of the reviewed text, as reported by word_counter"
                },
                "score": {
                    "type": "integer",
                    "minimum": 0,
                    "maximum": 100,
                    "description": "Quality score out of 100"
                },
                "comments": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Concrete revision suggestions, one sentence each"
                },
                "is_passed": {
                    "type": "boolean",
                    "description": "Ready to publish: score of 80 or more and the length meets the request"
                }
            }
        })
    }

    /// Parse and validate raw model output.
    ///
    /// Accepts a bare JSON object, optionally wrapped in a fenced code block
    /// or preceded by a line of prose.
    pub fn parse(raw: &str) -> Result<Self, ReportError> {
        let body = json_body(raw.trim());
        let value: serde_json::Value =
            serde_json::from_str(body).map_err(|e| ReportError::NotJson(e.to_string()))?;
        if !value.is_object() {
            return Err(ReportError::NotJson("top-level value is not an object".into()));
        }
        let report: Self =
            serde_json::from_value(value).map_err(|e| ReportError::Schema(e.to_string()))?;
        report.validate()?;
        Ok(report)
    }

    pub fn validate(&self) -> Result<(), ReportError> {
        if self.score > 100 {
            return Err(ReportError::ScoreOutOfRange(self.score));
        }
        if self.is_passed && self.score < PASSING_SCORE {
            return Err(ReportError::PassedBelowThreshold(self.score));
        }
        Ok(())
    }

    /// Human-readable report block returned to the Supervisor.
    pub fn render(&self) -> String {
        let verdict = if self.is_passed { "PASSED" } else { "NOT PASSED" };
        format!(
            "[Review Report]\n- Word count: {}\n- Score: {}\n- Verdict: {}\n- Suggestions: {}",
            self.word_count,
            self.score,
            verdict,
            self.comments.join("; ")
        )
    }
}

/// Narrow model output down to the JSON object it carries.
fn json_body(s: &str) -> &str {
    let body = strip_code_fence(s);
    if body.starts_with('{') {
        return body;
    }
    // Prose around the object: take the outermost braces.
    match (body.find('{'), body.rfind('}')) {
        (Some(start), Some(end)) if start < end => &body[start..=end],
        _ => body,
    }
}

fn strip_code_fence(s: &str) -> &str {
    let Some(rest) = s.strip_prefix("```") else {
        return s;
    };
    // Optional language tag, with or without a line break after it.
    let rest = rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    let rest = rest.trim_end();
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
