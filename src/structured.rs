//! Repair and decoding of JSON produced by a model in JSON mode.

use std::sync::OnceLock;

use regex::Regex;
use serde::de::DeserializeOwned;

use crate::Error;

/// Instruction appended to prompts that expect a JSON answer.
pub const JSON_INSTRUCTION: &str = "Respond with the result in JSON format.";

/// Fields that models sometimes fill with `""` instead of a number.
pub const NUMERIC_FIELDS: [&str; 3] = ["year", "season", "episode"];

static NUMERIC_FIELD_PATTERN: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();

fn numeric_field_pattern() -> Option<&'static Regex> {
    NUMERIC_FIELD_PATTERN
        .get_or_init(|| Regex::new(&format!(r#""({})"\s*:\s*"""#, NUMERIC_FIELDS.join("|"))))
        .as_ref()
        .ok()
}

/// Strip a surrounding Markdown code fence (```` ```json ```` or ```` ``` ````).
pub fn clean_json_content(content: &str) -> &str {
    let mut content = content.trim();
    if let Some(rest) = content.strip_prefix("```json") {
        content = rest;
    } else if let Some(rest) = content.strip_prefix("```") {
        content = rest;
    }
    content = content.trim();
    if let Some(rest) = content.strip_suffix("```") {
        content = rest;
    }
    content.trim()
}

/// Rewrite `"year": ""` (and season, episode) to `"year": null`.
pub fn normalize_empty_numeric_fields(content: &str) -> String {
    match numeric_field_pattern() {
        Some(pattern) => pattern.replace_all(content, r#""$1": null"#).into_owned(),
        None => content.to_string(),
    }
}

/// Fence stripping followed by numeric-field normalization.
pub fn repair(content: &str) -> String {
    normalize_empty_numeric_fields(clean_json_content(content))
}

/// Decode already repaired JSON into `T`.
pub fn decode<T: DeserializeOwned>(raw: &str) -> Result<T, Error> {
    serde_json::from_str(raw).map_err(|source| {
        tracing::error!(error = %source, raw, "failed to parse JSON response");
        Error::StructuredOutput {
            source,
            raw: raw.to_string(),
        }
    })
}

/// Append the JSON instruction, prefixed by the system prompt when present.
pub fn json_prompt(prompt: &str, system_prompt: Option<&str>) -> String {
    match system_prompt {
        Some(system) => format!("{system}\n\n{prompt}\n\n{JSON_INSTRUCTION}"),
        None => format!("{prompt}\n\n{JSON_INSTRUCTION}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Media {
        title: String,
        year: Option<i32>,
        season: Option<i32>,
    }

    #[test]
    fn test_clean_json_content() {
        assert_eq!(clean_json_content("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(clean_json_content("  ```\n{\"a\":1}```  "), "{\"a\":1}");
        assert_eq!(clean_json_content("{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn test_normalize_only_touches_numeric_fields() {
        let repaired = normalize_empty_numeric_fields(
            r#"{"title":"", "year" :  "", "season":"", "episode":"", "name":""}"#,
        );
        assert_eq!(
            repaired,
            r#"{"title":"", "year": null, "season": null, "episode": null, "name":""}"#
        );
    }

    #[test]
    fn test_decode_repaired_media() {
        let raw = repair("```json\n{\"title\":\"X\",\"year\":\"\",\"season\":null}\n```");
        let media: Media = decode(&raw).unwrap();
        assert_eq!(
            media,
            Media {
                title: "X".to_string(),
                year: None,
                season: None,
            }
        );
    }

    #[test]
    fn test_decode_failure_keeps_raw_content() {
        let err = decode::<Media>("{\"title\": 3}").unwrap_err();
        match err {
            Error::StructuredOutput { raw, .. } => assert_eq!(raw, "{\"title\": 3}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_json_prompt() {
        assert_eq!(
            json_prompt("Name this", Some("You are terse.")),
            "You are terse.\n\nName this\n\nRespond with the result in JSON format."
        );
        assert!(json_prompt("Name this", None).starts_with("Name this\n\n"));
    }
}
