//! Result artifact parsing and per-line classification.
//!
//! 1 行 = 1 リクエストの NDJSON。行ごとに独立して parse し、壊れた行はログに出して skip する。
//!
//! ```text
//! {"custom_id":"item-42","response":{"status_code":200,"body":{"choices":[{"message":{"content":"{\"output\":\"...\"}"}}]}},"error":null}
//! ```
//!
//! # 分類（上から順に判定）
//! - `api_error`: error オブジェクトがある、または status_code が 200 以外
//! - `no_response`: message content がない（空文字を含む）
//! - `invalid_format`: content が JSON オブジェクトとして parse できない
//! - `empty_result`: required field が無い、または空
//! - `success`: それ以外

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::domain::{ResultOutcome, ResultRecord, WorkItemId};

/// One line of a results or errors artifact.
#[derive(Debug, Clone, Deserialize)]
pub struct ResultLine {
    pub custom_id: String,
    #[serde(default)]
    pub response: Option<LineResponse>,
    #[serde(default)]
    pub error: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LineResponse {
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub body: Option<Value>,
}

impl ResultLine {
    fn content(&self) -> Option<&str> {
        self.response
            .as_ref()?
            .body
            .as_ref()?
            .pointer("/choices/0/message/content")?
            .as_str()
    }

    fn is_api_error(&self) -> bool {
        let error_reported = self.error.as_ref().is_some_and(|e| !e.is_null());
        let bad_status = self
            .response
            .as_ref()
            .and_then(|r| r.status_code)
            .is_some_and(|code| code != 200);
        error_reported || bad_status
    }

    /// Short error description for logging.
    pub fn error_message(&self) -> String {
        if let Some(error) = self.error.as_ref().filter(|e| !e.is_null()) {
            return error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
        }
        match self.response.as_ref().and_then(|r| r.status_code) {
            Some(code) => format!("status {code}"),
            None => "unknown error".to_string(),
        }
    }
}

/// Strip a surrounding Markdown code fence (```json ... ```).
fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(body) = rest.strip_suffix("```") else {
        return trimmed;
    };
    // 先頭行は言語タグ
    match body.find('\n') {
        Some(newline) => body[newline + 1..].trim(),
        None => body.trim(),
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Classify one parsed line. Returns the inner payload on success.
pub fn classify(line: &ResultLine, required_field: &str) -> (ResultOutcome, Option<Value>) {
    if line.is_api_error() {
        return (ResultOutcome::ApiError, None);
    }
    let Some(content) = line.content().filter(|c| !c.trim().is_empty()) else {
        return (ResultOutcome::NoResponse, None);
    };
    let payload = match serde_json::from_str::<Value>(strip_code_fence(content)) {
        Ok(value @ Value::Object(_)) => value,
        _ => return (ResultOutcome::InvalidFormat, None),
    };
    match payload.get(required_field) {
        Some(value) if !is_empty_value(value) => (ResultOutcome::Success, Some(payload)),
        _ => (ResultOutcome::EmptyResult, None),
    }
}

#[derive(Debug, Default)]
pub struct ParsedArtifact {
    pub records: Vec<ResultRecord>,
    /// Lines that were not valid JSON or lacked a `custom_id`.
    pub malformed: usize,
    /// Lines whose `custom_id` did not map to a WorkItem id.
    pub unmapped: usize,
}

fn parse_line(raw: &str, line_no: usize) -> Option<ResultLine> {
    match serde_json::from_str::<ResultLine>(raw) {
        Ok(line) => Some(line),
        Err(e) => {
            warn!(line = line_no, error = %e, "skipping malformed artifact line");
            None
        }
    }
}

/// Parse a results artifact into classified records.
pub fn parse_results(ndjson: &str, required_field: &str) -> ParsedArtifact {
    let mut parsed = ParsedArtifact::default();
    for (idx, raw) in ndjson.lines().enumerate() {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let Some(line) = parse_line(raw, idx + 1) else {
            parsed.malformed += 1;
            continue;
        };
        let Some(record_id) = WorkItemId::from_correlation_id(&line.custom_id) else {
            warn!(line = idx + 1, custom_id = %line.custom_id, "unmapped custom_id, discarding line");
            parsed.unmapped += 1;
            continue;
        };
        let record = match classify(&line, required_field) {
            (ResultOutcome::Success, Some(payload)) => ResultRecord::success(record_id, payload),
            (outcome, _) => ResultRecord::failed(record_id, outcome),
        };
        parsed.records.push(record);
    }
    parsed
}

/// Log every line of an errors artifact. Returns the number of lines seen.
pub fn log_error_lines(ndjson: &str) -> usize {
    let mut seen = 0;
    for (idx, raw) in ndjson.lines().enumerate() {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        seen += 1;
        if let Some(line) = parse_line(raw, idx + 1) {
            warn!(custom_id = %line.custom_id, error = %line.error_message(), "remote request failed");
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn ok_line(custom_id: &str, content: Value) -> String {
        json!({
            "custom_id": custom_id,
            "response": {
                "status_code": 200,
                "body": { "choices": [{ "message": { "content": content } }] }
            },
            "error": null
        })
        .to_string()
    }

    fn classify_raw(raw: &str) -> ResultOutcome {
        let line: ResultLine = serde_json::from_str(raw).unwrap();
        classify(&line, "output").0
    }

    #[rstest]
    #[case::success(ok_line("item-1", json!(r#"{"output":"hola"}"#)), ResultOutcome::Success)]
    #[case::fenced(ok_line("item-1", json!("```json\n{\"output\":\"hola\"}\n```")), ResultOutcome::Success)]
    #[case::empty_object(ok_line("item-1", json!("{}")), ResultOutcome::EmptyResult)]
    #[case::empty_field(ok_line("item-1", json!(r#"{"output":""}"#)), ResultOutcome::EmptyResult)]
    #[case::null_field(ok_line("item-1", json!(r#"{"output":null}"#)), ResultOutcome::EmptyResult)]
    #[case::prose(ok_line("item-1", json!("Sure! Here you go")), ResultOutcome::InvalidFormat)]
    #[case::array(ok_line("item-1", json!("[1,2]")), ResultOutcome::InvalidFormat)]
    #[case::null_content(ok_line("item-1", Value::Null), ResultOutcome::NoResponse)]
    #[case::blank_content(ok_line("item-1", json!("  ")), ResultOutcome::NoResponse)]
    #[case::no_choices(
        json!({"custom_id": "item-1", "response": {"status_code": 200, "body": {"choices": []}}}).to_string(),
        ResultOutcome::NoResponse
    )]
    #[case::error_object(
        json!({"custom_id": "item-1", "response": null, "error": {"message": "boom"}}).to_string(),
        ResultOutcome::ApiError
    )]
    #[case::bad_status(
        json!({"custom_id": "item-1", "response": {"status_code": 500, "body": {}}}).to_string(),
        ResultOutcome::ApiError
    )]
    fn line_classification(#[case] raw: String, #[case] expected: ResultOutcome) {
        assert_eq!(classify_raw(&raw), expected);
    }

    #[test]
    fn malformed_lines_are_skipped_and_counted() {
        let valid = [
            ok_line("item-1", json!(r#"{"output":"a"}"#)),
            ok_line("item-2", json!("{}")),
            ok_line("item-3", json!("not json")),
        ];
        let ndjson = format!(
            "{}\n{{not json\n{}\n\n{}\n{{\"no_custom_id\":true}}\n",
            valid[0], valid[1], valid[2]
        );

        let parsed = parse_results(&ndjson, "output");
        assert_eq!(parsed.records.len(), 3);
        assert_eq!(parsed.malformed, 2);
        assert_eq!(parsed.records[0].outcome, ResultOutcome::Success);
        assert_eq!(parsed.records[0].payload, Some(json!({"output": "a"})));
        assert_eq!(parsed.records[1].outcome, ResultOutcome::EmptyResult);
        assert_eq!(parsed.records[2].outcome, ResultOutcome::InvalidFormat);
    }

    #[test]
    fn unmapped_custom_ids_are_discarded() {
        let ndjson = [
            ok_line("item-7", json!(r#"{"output":"a"}"#)),
            ok_line("request-7", json!(r#"{"output":"a"}"#)),
            ok_line("item-", json!(r#"{"output":"a"}"#)),
        ]
        .join("\n");

        let parsed = parse_results(&ndjson, "output");
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.records[0].record_id, WorkItemId::new("7"));
        assert_eq!(parsed.unmapped, 2);
    }

    #[test]
    fn error_lines_are_counted() {
        let ndjson = format!(
            "{}\n{}\ngarbage\n",
            json!({"custom_id": "item-1", "error": {"message": "rate limited"}}),
            json!({"custom_id": "item-2", "response": {"status_code": 400}})
        );
        assert_eq!(log_error_lines(&ndjson), 3);
    }
}
