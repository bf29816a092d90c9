//! Field extraction across heterogeneous response shapes.
//!
//! Remote peers disagree on where they put the command id and the success
//! flag. Each location is one extractor; the lists are tried in order and the
//! first hit wins. Supporting a new shape means appending an extractor.

use crate::wire::Verdict;
use serde_json::Value;

/// Pulls a command id out of a response, if present at this location.
pub type IdExtractor = fn(&Value) -> Option<&str>;

/// Pulls a verdict out of a response, if this location carries one.
pub type VerdictExtractor = fn(&Value) -> Option<Verdict>;

/// Id locations in priority order.
pub const ID_EXTRACTORS: &[(&str, IdExtractor)] = &[
    ("id", top_level_id),
    ("commandId", top_level_command_id),
    ("command.id", nested_command_id),
    ("result.command_id", nested_result_command_id),
];

/// Success indicator locations in priority order.
pub const VERDICT_EXTRACTORS: &[(&str, VerdictExtractor)] = &[
    ("success", success_flag),
    ("status", status_string),
    ("result.success", nested_result_success),
    ("mcp.response", mcp_response_status),
];

fn non_empty(value: Option<&Value>) -> Option<&str> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn top_level_id(value: &Value) -> Option<&str> {
    non_empty(value.get("id"))
}

fn top_level_command_id(value: &Value) -> Option<&str> {
    non_empty(value.get("commandId"))
}

fn nested_command_id(value: &Value) -> Option<&str> {
    non_empty(value.get("command").and_then(|c| c.get("id")))
}

fn nested_result_command_id(value: &Value) -> Option<&str> {
    non_empty(value.get("result").and_then(|r| r.get("command_id")))
}

fn success_flag(value: &Value) -> Option<Verdict> {
    value.get("success").and_then(Value::as_bool).map(Verdict::from_bool)
}

fn status_string(value: &Value) -> Option<Verdict> {
    match value.get("status").and_then(Value::as_str)? {
        "success" => Some(Verdict::Success),
        "error" | "failed" | "failure" => Some(Verdict::Failure),
        _ => None,
    }
}

fn nested_result_success(value: &Value) -> Option<Verdict> {
    value
        .get("result")
        .and_then(|r| r.get("success"))
        .and_then(Value::as_bool)
        .map(Verdict::from_bool)
}

fn mcp_response_status(value: &Value) -> Option<Verdict> {
    let is_mcp = value.get("type").and_then(Value::as_str) == Some("mcp.response");
    let ok = value.get("status").and_then(Value::as_str) == Some("success");
    (is_mcp && ok).then_some(Verdict::Success)
}

/// First non-empty command id found in `value`.
pub fn extract_command_id(value: &Value) -> Option<String> {
    ID_EXTRACTORS
        .iter()
        .find_map(|(_, extract)| extract(value))
        .map(str::to_string)
}

/// Verdict carried by `value`; `Unspecified` when no extractor matches.
pub fn extract_verdict(value: &Value) -> Verdict {
    VERDICT_EXTRACTORS
        .iter()
        .find_map(|(_, extract)| extract(value))
        .unwrap_or(Verdict::Unspecified)
}

/// Human-readable error text, if the response has any.
pub fn extract_error_message(value: &Value) -> Option<String> {
    non_empty(value.get("error"))
        .or_else(|| non_empty(value.get("error").and_then(|e| e.get("message"))))
        .or_else(|| non_empty(value.get("result").and_then(|r| r.get("error"))))
        .or_else(|| non_empty(value.get("message")))
        .map(str::to_string)
}
