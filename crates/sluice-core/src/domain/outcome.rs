//! Outcome model: per-item classification of a remote batch result line.
//!
//! `ResultRecord` is derived, never persisted on its own: it is folded into an
//! [`ItemUpdate`] which is what the work store actually receives.

use serde::{Deserialize, Serialize};

use super::ids::WorkItemId;

/// Classification of one result line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultOutcome {
    /// Inner payload parsed and the required field is non-empty.
    Success,
    /// Inner payload parsed but the required field is absent or empty.
    EmptyResult,
    /// The model answered with something that is not a JSON object.
    InvalidFormat,
    /// The response carried no message content at all.
    NoResponse,
    /// The remote API reported an error for this request.
    ApiError,
}

impl ResultOutcome {
    pub const ALL: [ResultOutcome; 5] = [
        ResultOutcome::Success,
        ResultOutcome::EmptyResult,
        ResultOutcome::InvalidFormat,
        ResultOutcome::NoResponse,
        ResultOutcome::ApiError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ResultOutcome::Success => "success",
            ResultOutcome::EmptyResult => "empty_result",
            ResultOutcome::InvalidFormat => "invalid_format",
            ResultOutcome::NoResponse => "no_response",
            ResultOutcome::ApiError => "api_error",
        }
    }

    pub fn is_success(self) -> bool {
        self == ResultOutcome::Success
    }
}

impl std::fmt::Display for ResultOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-item result derived from one artifact line.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRecord {
    pub record_id: WorkItemId,
    pub outcome: ResultOutcome,
    /// Parsed inner payload, present only on success.
    pub payload: Option<serde_json::Value>,
}

impl ResultRecord {
    pub fn success(record_id: WorkItemId, payload: serde_json::Value) -> Self {
        Self {
            record_id,
            outcome: ResultOutcome::Success,
            payload: Some(payload),
        }
    }

    pub fn failed(record_id: WorkItemId, outcome: ResultOutcome) -> Self {
        debug_assert!(!outcome.is_success());
        Self {
            record_id,
            outcome,
            payload: None,
        }
    }
}

/// Destination write for one WorkItem: always clears the claim, records the
/// outcome, and on success stores the payload.
///
/// Applying the same update twice yields the same row. Updates never create rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemUpdate {
    pub id: WorkItemId,
    pub result_status: ResultOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl From<ResultRecord> for ItemUpdate {
    fn from(record: ResultRecord) -> Self {
        Self {
            id: record.record_id,
            result_status: record.outcome,
            result: record.payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_serializes_as_snake_case() {
        for outcome in ResultOutcome::ALL {
            let s = serde_json::to_string(&outcome).unwrap();
            assert_eq!(s, format!("\"{}\"", outcome.as_str()));
        }
    }

    #[test]
    fn update_carries_payload_only_on_success() {
        let ok: ItemUpdate =
            ResultRecord::success(WorkItemId::new("1"), serde_json::json!({"output": "hi"})).into();
        let empty: ItemUpdate =
            ResultRecord::failed(WorkItemId::new("2"), ResultOutcome::EmptyResult).into();

        assert!(ok.result.is_some());
        assert_eq!(empty.result, None);
        assert_eq!(empty.result_status, ResultOutcome::EmptyResult);
    }
}
