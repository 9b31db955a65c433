//! Maps vendor HTTP failures and in-stream error objects onto
//! `AgentRuntimeErrorType`.

use tracing::warn;

use crate::errors::{AgentRuntimeError, AgentRuntimeErrorType};
use crate::model::ProviderId;

/// Normalizes a non-2xx response.
///
/// The body is parsed as JSON when possible and kept verbatim as a string
/// otherwise, so the caller can always render it.
pub fn normalize_http_error(provider: &ProviderId, status: u16, body_text: &str) -> AgentRuntimeError {
    let body = parse_body(body_text);
    let error_type = classify(Some(status), &body);
    let message = error_message(&body)
        .unwrap_or_else(|| format!("request failed with status {status}"));
    warn!(provider = %provider, status, error_type = %error_type, "provider request failed");
    AgentRuntimeError::new(error_type, provider.clone(), message).with_body(body)
}

/// Normalizes an error object that arrived inside a successful stream.
pub fn normalize_stream_error(provider: &ProviderId, value: &serde_json::Value) -> AgentRuntimeError {
    let error_type = classify(None, value);
    let message = error_message(value).unwrap_or_else(|| "provider stream error".to_string());
    warn!(provider = %provider, error_type = %error_type, "provider stream reported an error");
    AgentRuntimeError::new(error_type, provider.clone(), message).with_body(value.clone())
}

/// Normalizes a transport failure raised by the HTTP client.
pub fn from_transport(provider: &ProviderId, err: &reqwest::Error) -> AgentRuntimeError {
    let error_type = if err.is_timeout() {
        AgentRuntimeErrorType::Timeout
    } else {
        AgentRuntimeErrorType::NetworkError
    };
    warn!(provider = %provider, error_type = %error_type, "transport failure: {err}");
    AgentRuntimeError::new(error_type, provider.clone(), err.to_string())
}

/// Pure classification table: status (when known) plus body shape.
pub fn classify(status: Option<u16>, body: &serde_json::Value) -> AgentRuntimeErrorType {
    let code = error_code(body).unwrap_or_default().to_ascii_lowercase();
    let message = error_message(body).unwrap_or_default();
    let lower_message = message.to_ascii_lowercase();

    // MiniMax `base_resp.status_code`.
    match body
        .get("base_resp")
        .and_then(|b| b.get("status_code"))
        .and_then(serde_json::Value::as_i64)
    {
        Some(1004) => return AgentRuntimeErrorType::InvalidApiKey,
        Some(1008) => return AgentRuntimeErrorType::InsufficientQuota,
        Some(1002 | 1039) => return AgentRuntimeErrorType::QuotaLimitReached,
        _ => {}
    }

    if status == Some(401)
        || code == "invalid_api_key"
        || (code == "invalid_request_error" && lower_message.contains("api key"))
    {
        return AgentRuntimeErrorType::InvalidApiKey;
    }
    if code == "insufficient_quota" || message.contains("Insufficient Balance") {
        return AgentRuntimeErrorType::InsufficientQuota;
    }
    if code == "model_not_found" || (status == Some(404) && lower_message.contains("model")) {
        return AgentRuntimeErrorType::ModelNotFound;
    }
    if code == "context_length_exceeded" || code == "string_above_max_length" {
        return AgentRuntimeErrorType::ExceededContextWindow;
    }
    if status == Some(429) || code == "rate_limit_exceeded" {
        return AgentRuntimeErrorType::QuotaLimitReached;
    }
    if status == Some(403) {
        return AgentRuntimeErrorType::PermissionDenied;
    }
    if matches!(status, Some(502..=504)) || code == "service_unavailable" || code == "overloaded_error" {
        return AgentRuntimeErrorType::ServiceUnavailable;
    }
    AgentRuntimeErrorType::ProviderBizError
}

fn parse_body(body_text: &str) -> serde_json::Value {
    serde_json::from_str(body_text)
        .unwrap_or_else(|_| serde_json::Value::String(body_text.to_string()))
}

fn error_code(body: &serde_json::Value) -> Option<String> {
    let error = body.get("error");
    [
        error.and_then(|e| e.get("code")),
        error.and_then(|e| e.get("type")),
        body.get("code"),
        body.get("type"),
    ]
    .into_iter()
    .flatten()
    .find_map(|v| v.as_str().map(ToOwned::to_owned))
}

fn error_message(body: &serde_json::Value) -> Option<String> {
    if let Some(text) = body.as_str() {
        return (!text.trim().is_empty()).then(|| text.to_string());
    }
    let error = body.get("error");
    [
        error.and_then(|e| e.get("message")),
        error.filter(|e| e.is_string()),
        body.get("message"),
        body.get("base_resp").and_then(|b| b.get("status_msg")),
    ]
    .into_iter()
    .flatten()
    .find_map(|v| v.as_str().map(ToOwned::to_owned))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn provider() -> ProviderId {
        ProviderId::new("openai")
    }

    #[test]
    fn fixture_table_maps_documented_types() {
        let fixtures: Vec<(u16, serde_json::Value, AgentRuntimeErrorType)> = vec![
            (401, json!({"error": {"code": "invalid_api_key"}}), AgentRuntimeErrorType::InvalidApiKey),
            (401, json!("Unauthorized"), AgentRuntimeErrorType::InvalidApiKey),
            (400, json!({"error": {"type": "invalid_request_error", "message": "Incorrect API key provided"}}), AgentRuntimeErrorType::InvalidApiKey),
            (429, json!({"error": {"code": "insufficient_quota", "message": "You exceeded your current quota"}}), AgentRuntimeErrorType::InsufficientQuota),
            (402, json!({"error": {"message": "Insufficient Balance"}}), AgentRuntimeErrorType::InsufficientQuota),
            (404, json!({"error": {"code": "model_not_found"}}), AgentRuntimeErrorType::ModelNotFound),
            (404, json!({"error": "model 'llama9' not found"}), AgentRuntimeErrorType::ModelNotFound),
            (400, json!({"error": {"code": "context_length_exceeded"}}), AgentRuntimeErrorType::ExceededContextWindow),
            (400, json!({"error": {"code": "string_above_max_length"}}), AgentRuntimeErrorType::ExceededContextWindow),
            (429, json!({"error": {"code": "rate_limit_exceeded"}}), AgentRuntimeErrorType::QuotaLimitReached),
            (403, json!({"error": {"message": "region not supported"}}), AgentRuntimeErrorType::PermissionDenied),
            (503, json!({"error": {"message": "upstream down"}}), AgentRuntimeErrorType::ServiceUnavailable),
            (529, json!({"type": "error", "error": {"type": "overloaded_error"}}), AgentRuntimeErrorType::ServiceUnavailable),
            (200, json!({"base_resp": {"status_code": 1004, "status_msg": "login fail"}}), AgentRuntimeErrorType::InvalidApiKey),
            (200, json!({"base_resp": {"status_code": 1002, "status_msg": "rpm limit"}}), AgentRuntimeErrorType::QuotaLimitReached),
        ];

        for (status, body, expected) in fixtures {
            let err = normalize_http_error(&provider(), status, &body.to_string());
            assert_eq!(err.error_type, expected, "status={status} body={body}");
            assert_eq!(err.body.as_ref(), Some(&body));
        }
    }

    #[test]
    fn unmapped_shape_is_biz_error_with_raw_body() {
        let err = normalize_http_error(&provider(), 500, "<html>gateway exploded</html>");
        assert_eq!(err.error_type, AgentRuntimeErrorType::ProviderBizError);
        assert_eq!(err.body, Some(json!("<html>gateway exploded</html>")));
        assert_eq!(err.message, "<html>gateway exploded</html>");
    }

    #[test]
    fn unmapped_json_keeps_body_intact() {
        let body = json!({"status": "degraded", "detail": {"shard": 3}});
        let err = normalize_http_error(&provider(), 500, &body.to_string());
        assert_eq!(err.error_type, AgentRuntimeErrorType::ProviderBizError);
        assert_eq!(err.body, Some(body));
        assert_eq!(err.message, "request failed with status 500");
    }

    #[test]
    fn stream_error_objects_use_the_same_table() {
        let value = json!({"error": {"code": "context_length_exceeded", "message": "too long"}});
        let err = normalize_stream_error(&provider(), &value);
        assert_eq!(err.error_type, AgentRuntimeErrorType::ExceededContextWindow);
        assert_eq!(err.message, "too long");
    }
}
