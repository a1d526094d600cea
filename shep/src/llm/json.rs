//! JSON extraction from LLM responses
//!
//! Models wrap JSON in prose, markdown fences, or both. Extraction tries
//! a fenced ```json block first, then a balanced brace/bracket scan that
//! honors string escapes, then the whole text.

use regex::Regex;
use std::sync::LazyLock;

use crate::error::{EngineError, Result};

static FENCED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```json\s*([\{\[].*?[\}\]])\s*```").unwrap());

/// Extract and parse JSON from a raw LLM response.
///
/// The raw text is preserved in the error so callers can log or retry.
pub fn extract_json(text: &str) -> Result<serde_json::Value> {
    if text.trim().is_empty() {
        return Err(EngineError::JsonParseFailed {
            message: "Empty response text".to_string(),
            raw: text.to_string(),
        });
    }

    if let Some(captures) = FENCED_RE.captures(text)
        && let Ok(value) = serde_json::from_str(&captures[1])
    {
        return Ok(value);
    }

    if let Some(candidate) = find_balanced(text, '{', '}').or_else(|| find_balanced(text, '[', ']'))
        && let Ok(value) = serde_json::from_str(candidate)
    {
        return Ok(value);
    }

    serde_json::from_str(text).map_err(|e| EngineError::JsonParseFailed {
        message: format!("No valid JSON found in response: {}", e),
        raw: text.to_string(),
    })
}

/// Find a complete JSON object or array by balancing delimiters
fn find_balanced(s: &str, open: char, close: char) -> Option<&str> {
    let start = s.find(open)?;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape = false;

    for (i, c) in s[start..].char_indices() {
        if escape {
            escape = false;
            continue;
        }
        if c == '\\' && in_string {
            escape = true;
            continue;
        }
        if c == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        if c == open {
            depth += 1;
        } else if c == close {
            depth -= 1;
            if depth == 0 {
                return Some(&s[start..start + i + c.len_utf8()]);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_plain_object() {
        let value = extract_json(r#"{"status": "working", "summary": "ok"}"#).unwrap();
        assert_eq!(value["status"], "working");
    }

    #[test]
    fn test_extract_fenced_block() {
        let text = "Here is my analysis:\n```json\n{\"decision\": \"fix\"}\n```\nDone.";
        let value = extract_json(text).unwrap();
        assert_eq!(value["decision"], "fix");
    }

    #[test]
    fn test_extract_embedded_object() {
        let text = "The model thinks {\"action\": \"retry\", \"reason\": \"timeout\"} is best";
        let value = extract_json(text).unwrap();
        assert_eq!(value["action"], "retry");
    }

    #[test]
    fn test_extract_array() {
        let value = extract_json(r#"criteria: ["compiles", "tests pass"]"#).unwrap();
        assert_eq!(value, json!(["compiles", "tests pass"]));
    }

    #[test]
    fn test_braces_inside_strings_ignored() {
        let text = r#"{"message": "use {placeholder} here", "ok": true}"#;
        let value = extract_json(text).unwrap();
        assert_eq!(value["message"], "use {placeholder} here");
    }

    #[test]
    fn test_escaped_quotes_inside_strings() {
        let text = r#"{"message": "he said \"no{\" loudly"}"#;
        let value = extract_json(text).unwrap();
        assert_eq!(value["message"], "he said \"no{\" loudly");
    }

    #[test]
    fn test_empty_input_fails_with_raw() {
        let err = extract_json("   ").unwrap_err();
        assert_eq!(err.raw_text(), Some("   "));
    }

    #[test]
    fn test_no_json_fails_with_raw() {
        let err = extract_json("I could not produce a structured answer").unwrap_err();
        assert_eq!(err.raw_text(), Some("I could not produce a structured answer"));
    }

    #[test]
    fn test_nested_objects() {
        let text = r#"{"outer": {"inner": [1, 2, {"deep": true}]}}"#;
        let value = extract_json(text).unwrap();
        assert_eq!(value["outer"]["inner"][2]["deep"], true);
    }

    #[test]
    fn test_round_trip() {
        let original = json!({
            "decision": "fix",
            "critical_issues": ["null deref", "race"],
            "nested": {"count": 3, "ratio": 0.5, "flag": true, "missing": null}
        });
        let text = serde_json::to_string(&original).unwrap();
        assert_eq!(extract_json(&text).unwrap(), original);
    }
}
