//! Structured agent reports embedded in free-form model replies.
//!
//! Agents end their reply with a JSON object. Extraction and validation happen
//! here, once; callers receive typed values.

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Return the last top-level JSON object embedded in `text`, if any.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let mut found = None;
    let mut cursor = 0;
    while let Some(offset) = text[cursor..].find('{') {
        let start = cursor + offset;
        let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(Value::Object(_))) => {
                let end = start + stream.byte_offset();
                found = Some(&text[start..end]);
                cursor = end;
            }
            _ => cursor = start + 1,
        }
    }
    found
}

/// Parse the last embedded JSON object as `T`.
pub fn parse_report<T: DeserializeOwned>(text: &str) -> Result<T> {
    let json = extract_json_object(text).ok_or_else(|| anyhow!("no JSON report in reply"))?;
    serde_json::from_str(json).context("parse JSON report")
}

/// Declared status in an implementer or repair report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Done,
    Blocked,
}

/// Final report of an implementer or repair session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WorkReport {
    pub status: ReportStatus,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub questions: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::CheckVerdict;

    #[test]
    fn extracts_last_object_after_prose_and_code() {
        let reply = "I edited `fn main() { }` and ran tests.\n\
                     {\"status\":\"done\",\"summary\":\"first\"}\n\
                     Final:\n{\"status\":\"done\",\"summary\":\"second\",\"nested\":{\"a\":1}}\n";
        let report: WorkReport = parse_report(reply).expect("report");
        assert_eq!(report.summary, "second");
    }

    #[test]
    fn missing_object_is_an_error() {
        let err = parse_report::<WorkReport>("no json here {oops").unwrap_err();
        assert!(err.to_string().contains("no JSON report"));
    }

    #[test]
    fn blocked_report_carries_questions() {
        let reply = r#"{"status":"blocked","reason":"requirements unclear","questions":["which API?"]}"#;
        let report: WorkReport = parse_report(reply).expect("report");
        assert_eq!(report.status, ReportStatus::Blocked);
        assert_eq!(report.questions, vec!["which API?".to_string()]);
    }

    #[test]
    fn parses_checker_verdict() {
        let verdict: CheckVerdict =
            parse_report(r#"done {"complete":true,"confidence":0.85}"#).expect("verdict");
        assert!(verdict.complete);
        assert!(verdict.gaps.is_empty());
    }
}
