//! HTTP attempt execution: request building from templates, dispatch,
//! and error classification.

use crate::context::{ContextSnapshot, ErrorInfo, ErrorType};
use crate::template::{self, Template};
use crate::workflow::HttpTask;
use serde_json::Value;

/// A fully resolved HTTP request, built once per task invocation and
/// reused across retry attempts.
#[derive(Debug)]
pub(super) struct RequestParts {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

/// Template-evaluate every request field against the resolved input.
pub(super) fn build_request(
    def: &HttpTask,
    input: &ContextSnapshot,
) -> Result<RequestParts, ErrorInfo> {
    let evaluate = |text: &str| -> Result<String, ErrorInfo> {
        Template::parse(text)
            .and_then(|t| t.evaluate_text(input))
            .map_err(|e| super::template_failure(&e))
    };

    let method = evaluate(&def.method)?;
    let url = evaluate(&def.url)?;
    let mut headers = Vec::with_capacity(def.headers.len());
    for (name, value) in &def.headers {
        headers.push((name.clone(), evaluate(value)?));
    }
    let body = match &def.body {
        Some(body) => Some(
            template::evaluate_value(body, input).map_err(|e| super::template_failure(&e))?,
        ),
        None => None,
    };

    Ok(RequestParts {
        method,
        url,
        headers,
        body,
    })
}

/// One HTTP attempt. Classification happens here; retry decisions are
/// the caller's.
pub(super) async fn attempt(
    client: &reqwest::Client,
    parts: &RequestParts,
) -> Result<Value, ErrorInfo> {
    let method = reqwest::Method::from_bytes(parts.method.to_uppercase().as_bytes())
        .map_err(|_| {
            ErrorInfo::new(
                ErrorType::UnknownError,
                format!("invalid HTTP method '{}'", parts.method),
            )
            .with_code("INVALID_METHOD")
        })?;

    let mut request = client.request(method, &parts.url);
    for (name, value) in &parts.headers {
        request = request.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &parts.body {
        request = request.json(body);
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => return Err(classify_transport_error(&e)),
    };

    let status = response.status();
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let body_text = match response.text().await {
        Ok(text) => text,
        Err(e) => {
            return Err(ErrorInfo::new(
                ErrorType::NetworkError,
                format!("failed to read response body: {e}"),
            )
            .with_status(status.as_u16())
            .retryable(true));
        }
    };

    if !status.is_success() {
        return Err(classify_status(status.as_u16(), &parts.url, &body_text));
    }

    let content = if content_type.contains("application/json") {
        serde_json::from_str(&body_text).unwrap_or(Value::String(body_text))
    } else {
        Value::String(body_text)
    };
    Ok(content)
}

fn classify_transport_error(e: &reqwest::Error) -> ErrorInfo {
    if e.is_timeout() {
        ErrorInfo::new(ErrorType::Timeout, format!("request timed out: {e}"))
            .with_code("IO_TIMEOUT")
            .retryable(true)
            .with_suggestion("The service did not answer in time; retries may succeed")
    } else if e.is_connect() {
        ErrorInfo::new(ErrorType::NetworkError, format!("connection failed: {e}"))
            .with_code("CONNECTION_FAILED")
            .retryable(true)
            .with_suggestion("Check that the service is reachable from the engine")
    } else if e.is_builder() || e.is_request() {
        ErrorInfo::new(ErrorType::UnknownError, format!("invalid request: {e}"))
            .with_code("INVALID_REQUEST")
    } else {
        ErrorInfo::new(ErrorType::NetworkError, format!("transport error: {e}")).retryable(true)
    }
}

fn classify_status(status: u16, url: &str, body: &str) -> ErrorInfo {
    let retryable = matches!(status, 408 | 429 | 500..=599);
    let mut info = ErrorInfo::new(
        ErrorType::HttpError,
        format!("request to {url} failed with status {status}"),
    )
    .with_status(status)
    .with_preview(super::truncate_preview(body))
    .retryable(retryable);

    info.suggestion = match status {
        401 | 403 => {
            info.support_action = Some("verify-credentials".to_string());
            Some("Verify the credentials configured for this service".to_string())
        }
        404 => Some("Check the resolved URL path".to_string()),
        408 => Some("The service timed out answering; retries may succeed".to_string()),
        429 => Some("The service is rate limiting requests; increase retry backoff".to_string()),
        500..=599 => Some("The service is failing; retries may succeed once it recovers".to_string()),
        _ => None,
    };
    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use indexmap::IndexMap;
    use serde_json::json;

    fn resolved_input(input: Value) -> ContextSnapshot {
        ExecutionContext::new(json!({}), IndexMap::new(), Vec::new()).task_snapshot(input)
    }

    #[test]
    fn test_build_request_evaluates_templates() {
        let def = HttpTask {
            method: "GET".to_string(),
            url: "http://api.internal/users/{{input.userId}}".to_string(),
            headers: IndexMap::from_iter([(
                "x-tenant".to_string(),
                "{{input.tenant}}".to_string(),
            )]),
            body: None,
        };
        let parts =
            build_request(&def, &resolved_input(json!({"userId": 42, "tenant": "acme"}))).unwrap();
        assert_eq!(parts.url, "http://api.internal/users/42");
        assert_eq!(parts.headers[0].1, "acme");
    }

    #[test]
    fn test_build_request_surfaces_template_errors() {
        let def = HttpTask {
            method: "GET".to_string(),
            url: "http://api.internal/users/{{input.missing}}".to_string(),
            headers: IndexMap::new(),
            body: None,
        };
        let err = build_request(&def, &resolved_input(json!({}))).unwrap_err();
        assert_eq!(err.error_type, ErrorType::TemplateError);
        assert!(!err.is_retryable);
    }

    #[test]
    fn test_classify_status_fatal_4xx() {
        let info = classify_status(400, "http://x/", "bad");
        assert_eq!(info.error_type, ErrorType::HttpError);
        assert_eq!(info.http_status_code, Some(400));
        assert!(!info.is_retryable);
    }

    #[test]
    fn test_classify_status_retryable() {
        for status in [408, 429, 500, 503] {
            let info = classify_status(status, "http://x/", "");
            assert!(info.is_retryable, "status {status} should be retryable");
        }
    }
}
