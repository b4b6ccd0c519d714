//! Extraction helpers for LLM replies.
//!
//! Models wrap structured answers in prose or markdown fences. These helpers
//! pull out the JSON object (or a fenced code block of a given language) so
//! the stage agents can deserialize it.
//!
//! # Example
//!
//! ```
//! use styleforge::utils::json_extraction::extract_json_from_response;
//!
//! let response = "Here is the result: {\"tone\": \"formal\", \"score\": 0.9}";
//! let json = extract_json_from_response(response);
//! assert_eq!(json, "{\"tone\": \"formal\", \"score\": 0.9}");
//! ```

use regex::Regex;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Error type for JSON extraction failures
#[derive(Debug, Clone, Error, PartialEq)]
pub enum JsonExtractionError {
    #[error("No JSON content found in response. Content starts with: '{content_preview}'")]
    NotFound { content_preview: String },

    #[error("Extracted JSON did not match the expected shape: {0}")]
    Invalid(String),
}

fn preview(content: &str) -> String {
    content.trim().chars().take(60).collect()
}

/// Finds the index of the `}` closing the object that starts at `s[0]`.
///
/// String literals and escape sequences are skipped, so braces inside
/// quoted values do not count.
pub fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}

/// Returns the body of the first fenced block tagged `lang`, or of the first
/// untagged block when no tagged one exists.
pub fn extract_code_block(content: &str, lang: &str) -> Option<String> {
    if let Some(block) = tagged_code_block(content, lang) {
        return Some(block);
    }

    let generic = Regex::new(r"```\s*\n([\s\S]*?)```").ok()?;
    generic
        .captures(content)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
}

fn tagged_code_block(content: &str, lang: &str) -> Option<String> {
    let tagged = Regex::new(&format!(r"(?i)```{}\s*\n([\s\S]*?)```", regex::escape(lang))).ok()?;
    tagged
        .captures(content)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Locates the first complete JSON object in `content`.
///
/// Tries a ```json fence first, then the first balanced `{...}` span in the
/// raw text.
pub fn try_extract_json_object(content: &str) -> Result<String, JsonExtractionError> {
    let candidates = [
        tagged_code_block(content, "json"),
        Some(content.to_string()),
    ];

    for candidate in candidates.into_iter().flatten() {
        if let Some(start) = candidate.find('{') {
            if let Some(end) = find_matching_brace(&candidate[start..]) {
                return Ok(candidate[start..=start + end].to_string());
            }
        }
    }

    Err(JsonExtractionError::NotFound {
        content_preview: preview(content),
    })
}

/// Lenient variant of [`try_extract_json_object`] that falls back to the
/// trimmed input.
pub fn extract_json_from_response(content: &str) -> String {
    try_extract_json_object(content).unwrap_or_else(|_| content.trim().to_string())
}

/// Extracts and deserializes the JSON object in an LLM reply.
pub fn parse_json_reply<T: DeserializeOwned>(content: &str) -> Result<T, JsonExtractionError> {
    let json = try_extract_json_object(content)?;
    serde_json::from_str(&json).map_err(|e| JsonExtractionError::Invalid(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_find_matching_brace_skips_strings() {
        let s = r#"{"a": "}", "b": {"c": 1}} trailing"#;
        let end = find_matching_brace(s).unwrap();
        assert_eq!(&s[..=end], r#"{"a": "}", "b": {"c": 1}}"#);
        assert_eq!(find_matching_brace("{\"open\": 1"), None);
    }

    #[test]
    fn test_extract_from_json_fence() {
        let reply = "Sure!\n```json\n{\"tone\": \"calm\"}\n```\nDone.";
        assert_eq!(extract_json_from_response(reply), "{\"tone\": \"calm\"}");
    }

    #[test]
    fn test_extract_from_prose() {
        let reply = "The analysis is {\"score\": 0.7, \"notes\": [\"ok\"]} as requested.";
        assert_eq!(
            extract_json_from_response(reply),
            "{\"score\": 0.7, \"notes\": [\"ok\"]}"
        );
    }

    #[test]
    fn test_not_found() {
        let err = try_extract_json_object("no structure here").unwrap_err();
        assert!(matches!(err, JsonExtractionError::NotFound { .. }));
        assert_eq!(extract_json_from_response("  plain  "), "plain");
    }

    #[test]
    fn test_extract_code_block_by_language() {
        let reply = "```css\nbody{}\n```\n```html\n<html></html>\n```";
        assert_eq!(extract_code_block(reply, "html").as_deref(), Some("<html></html>"));
        assert_eq!(extract_code_block(reply, "css").as_deref(), Some("body{}"));

        let untagged = "```\n<p>hi</p>\n```";
        assert_eq!(extract_code_block(untagged, "html").as_deref(), Some("<p>hi</p>"));
        assert_eq!(extract_code_block("no fences", "html"), None);
    }

    #[test]
    fn test_parse_json_reply() {
        #[derive(Deserialize)]
        struct Reply {
            tone: String,
        }

        let reply: Reply = parse_json_reply("```json\n{\"tone\": \"warm\"}\n```").unwrap();
        assert_eq!(reply.tone, "warm");

        let err = parse_json_reply::<Reply>("{\"mood\": 1}").err().unwrap();
        assert!(matches!(err, JsonExtractionError::Invalid(_)));
    }
}
