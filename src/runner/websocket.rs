//! WebSocket attempt execution: connect, send one request frame, await
//! the response.

use crate::context::{ContextSnapshot, ErrorInfo, ErrorType};
use crate::template::{self, Template};
use crate::workflow::WebSocketTask;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;

pub(super) struct RequestParts {
    pub url: String,
    pub request: Option<Value>,
}

pub(super) fn build_request(
    def: &WebSocketTask,
    input: &ContextSnapshot,
) -> Result<RequestParts, ErrorInfo> {
    let url = Template::parse(&def.url)
        .and_then(|t| t.evaluate_text(input))
        .map_err(|e| super::template_failure(&e))?;
    let request = match &def.request {
        Some(request) => Some(
            template::evaluate_value(request, input).map_err(|e| super::template_failure(&e))?,
        ),
        None => None,
    };
    Ok(RequestParts { url, request })
}

/// One WebSocket attempt: open the connection, send the request frame,
/// return the first data frame. A close (or stream end) without a
/// response is a network failure, same as a refused connection.
pub(super) async fn attempt(parts: &RequestParts) -> Result<Value, ErrorInfo> {
    let (mut stream, _handshake) = connect_async(parts.url.as_str()).await.map_err(|e| {
        ErrorInfo::new(
            ErrorType::NetworkError,
            format!("websocket connection to {} failed: {e}", parts.url),
        )
        .with_code("CONNECTION_FAILED")
        .retryable(true)
        .with_suggestion("Check that the service is reachable from the engine")
    })?;

    if let Some(request) = &parts.request {
        stream
            .send(Message::Text(request.to_string()))
            .await
            .map_err(|e| {
                ErrorInfo::new(
                    ErrorType::NetworkError,
                    format!("failed to send websocket request: {e}"),
                )
                .retryable(true)
            })?;
    }

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                let value =
                    serde_json::from_str(&text).unwrap_or(Value::String(text));
                let _ = stream.close(None).await;
                return Ok(value);
            }
            Ok(Message::Binary(bytes)) => {
                let value = serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                    Value::String(String::from_utf8_lossy(&bytes).into_owned())
                });
                let _ = stream.close(None).await;
                return Ok(value);
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(ErrorInfo::new(
                    ErrorType::NetworkError,
                    format!("websocket stream error: {e}"),
                )
                .retryable(true));
            }
        }
    }

    Err(ErrorInfo::new(
        ErrorType::NetworkError,
        "websocket closed without a response".to_string(),
    )
    .with_code("NO_RESPONSE")
    .retryable(true))
}
