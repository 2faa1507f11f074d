//! Structured-output layer: schema-validated JSON replies and
//! confidence-thresholded replies.
//!
//! Both functions are thin wrappers over [`Invoker::invoke_with`] — no
//! bypass of cache, governor, or depth. The JSON path is a small
//! parser-with-error-feedback loop: every failed attempt rewrites the
//! next prompt to include the previous error text verbatim.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::error::RlmError;
use crate::invoker::{is_sentinel, InvokeOptions, Invoker};

/// Strip a single ```…``` fence (optionally tagged `json`) around a reply.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    let inner = inner.strip_suffix("```").unwrap_or(inner);
    inner.trim()
}

/// Invoke in JSON mode, parse, optionally validate against a JSON Schema,
/// and retry with error feedback.
///
/// Makes exactly `max_retries + 1` attempts before failing with
/// [`RlmError::InvalidStructuredOutput`], which carries the last raw
/// reply. Sentinel replies count as failed attempts: they are not valid
/// JSON and must never be mistaken for one.
pub async fn invoke_json(
    invoker: &Invoker,
    prompt: &str,
    context: Option<&str>,
    schema: Option<&serde_json::Value>,
    max_retries: u32,
) -> Result<serde_json::Value, RlmError> {
    let validator = match schema {
        Some(schema) => Some(jsonschema::validator_for(schema).map_err(|e| {
            RlmError::Configuration(format!("invalid JSON schema: {}", e))
        })?),
        None => None,
    };

    let mut current_prompt = prompt.to_string();
    let mut last_error = String::new();
    let mut last_response = String::new();

    for _attempt in 0..=max_retries {
        let reply = invoker
            .invoke_with(
                &current_prompt,
                InvokeOptions {
                    context: context.map(str::to_string),
                    json_mode: true,
                    ..Default::default()
                },
            )
            .await?;

        last_response = reply.clone();

        let failure = if is_sentinel(&reply) {
            Some(reply.clone())
        } else {
            match serde_json::from_str::<serde_json::Value>(strip_code_fences(&reply)) {
                Ok(value) => {
                    let schema_error = validator
                        .as_ref()
                        .and_then(|v| v.validate(&value).err().map(|e| e.to_string()));
                    match schema_error {
                        None => return Ok(value),
                        Some(e) => Some(format!("schema validation failed: {}", e)),
                    }
                }
                Err(e) => Some(e.to_string()),
            }
        };

        if let Some(error) = failure {
            last_error = error;
            current_prompt = format!(
                "{}\n\nPrevious response was invalid JSON. Error: {}. \
                 Respond with valid JSON only.",
                prompt, last_error
            );
        }
    }

    Err(RlmError::InvalidStructuredOutput {
        reason: last_error,
        last_response,
    })
}

static CONFIDENCE_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)^\s*CONFIDENCE:\s*(\d+)").unwrap());
static REASONING_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)^\s*REASONING:\s*(.+)$").unwrap());

/// A reply with its self-reported confidence.
#[derive(Debug, Clone, Serialize)]
pub struct ConfidenceReply {
    /// Full reply text, with the CONFIDENCE/REASONING trailer intact.
    pub answer: String,
    /// Confidence in `[0.0, 1.0]`; 0.0 when no CONFIDENCE line parsed.
    pub confidence: f64,
    pub reasoning: String,
}

/// Parse `CONFIDENCE: <0-100>` and `REASONING: <text>` lines out of a
/// reply. Missing confidence parses as 0.
pub fn parse_confidence(text: &str) -> (f64, String) {
    let confidence = CONFIDENCE_LINE
        .captures(text)
        .and_then(|c| c[1].parse::<u32>().ok())
        .map(|n| n.min(100) as f64 / 100.0)
        .unwrap_or(0.0);
    let reasoning = REASONING_LINE
        .captures(text)
        .map(|c| c[1].trim().to_string())
        .unwrap_or_default();
    (confidence, reasoning)
}

/// Invoke with instructions to emit a confidence trailer; raise
/// [`RlmError::LowConfidence`] when the parsed confidence is below
/// `min_confidence`.
pub async fn invoke_with_confidence(
    invoker: &Invoker,
    prompt: &str,
    context: Option<&str>,
    min_confidence: f64,
) -> Result<ConfidenceReply, RlmError> {
    let full_prompt = format!(
        "{}\n\nEnd your response with these two lines:\nCONFIDENCE: <0-100>\nREASONING: <one-line explanation>",
        prompt
    );

    let answer = invoker
        .invoke_with(
            &full_prompt,
            InvokeOptions {
                context: context.map(str::to_string),
                ..Default::default()
            },
        )
        .await?;

    let (confidence, reasoning) = parse_confidence(&answer);
    if confidence < min_confidence {
        return Err(RlmError::LowConfidence {
            confidence,
            threshold: min_confidence,
            reasoning,
        });
    }

    Ok(ConfidenceReply {
        answer,
        confidence,
        reasoning,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n[1,2]\n```"), "[1,2]");
    }

    #[test]
    fn test_parse_confidence() {
        let (c, r) = parse_confidence("Answer text\nCONFIDENCE: 85\nREASONING: stages align");
        assert!((c - 0.85).abs() < 1e-9);
        assert_eq!(r, "stages align");

        let (c, r) = parse_confidence("no trailer here");
        assert_eq!(c, 0.0);
        assert_eq!(r, "");

        // Values above 100 clamp rather than overflow the scale.
        let (c, _) = parse_confidence("CONFIDENCE: 250");
        assert_eq!(c, 1.0);
    }
}
