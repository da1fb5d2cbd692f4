//! HTTP plumbing shared by the network adapters.

use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{GenError, Result};

/// Build an HTTP client with default and configured headers.
pub(crate) fn build_client(
    extra_headers: &HashMap<String, String>,
    auth_headers: HeaderMap,
    timeout: Duration,
) -> Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    headers.extend(auth_headers);

    for (key, value) in extra_headers {
        let header_name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| GenError::Config(format!("Invalid header name '{}': {}", key, e)))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|e| GenError::Config(format!("Invalid header value for '{}': {}", key, e)))?;
        headers.insert(header_name, header_value);
    }

    Client::builder()
        .default_headers(headers)
        .timeout(timeout)
        .build()
        .map_err(|e| GenError::Config(format!("Failed to build HTTP client: {}", e)))
}

/// Header value that must not show up in `Debug` output.
pub(crate) fn secret_header(value: &str) -> Result<HeaderValue> {
    let mut header_value = HeaderValue::from_str(value)
        .map_err(|_| GenError::Config("Credential contains invalid header characters".into()))?;
    header_value.set_sensitive(true);
    Ok(header_value)
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorBody {
    Detailed { message: String },
    Plain(String),
}

/// Best-effort extraction of an upstream error message.
pub(crate) fn error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(ErrorEnvelope {
            error: ErrorBody::Detailed { message },
        })
        | Ok(ErrorEnvelope {
            error: ErrorBody::Plain(message),
        }) => message,
        Err(_) => body.chars().take(500).collect(),
    }
}

/// Send a request and decode a JSON body, mapping failures onto [`GenError`].
pub(crate) async fn send_json<T: DeserializeOwned>(
    provider: &str,
    request: RequestBuilder,
    timeout: Duration,
) -> Result<T> {
    let response = request.timeout(timeout).send().await.map_err(|e| {
        warn!(provider, error = %e, "Request failed");
        if e.is_timeout() {
            GenError::Timeout(timeout)
        } else {
            GenError::from(e)
        }
    })?;

    let status = response.status();
    debug!(provider, status = status.as_u16(), "Response received");

    let body = response.text().await.map_err(|e| {
        if e.is_timeout() {
            GenError::Timeout(timeout)
        } else {
            GenError::from(e)
        }
    })?;

    if !status.is_success() {
        let message = error_message(&body);
        warn!(provider, status = status.as_u16(), message = %message, "Upstream error");
        return Err(GenError::request_failed(
            Some(status.as_u16()),
            format!("{}: {}", provider, message),
        ));
    }

    serde_json::from_str(&body).map_err(|e| {
        GenError::ResponseParseError(format!(
            "{}: {} | body preview: {}",
            provider,
            e,
            body.chars().take(200).collect::<String>()
        ))
    })
}

/// Map an event-source failure onto [`GenError`].
pub(crate) fn map_sse_error(provider: &str, err: reqwest_eventsource::Error) -> GenError {
    use reqwest_eventsource::Error as SseError;
    match err {
        SseError::InvalidStatusCode(status, _) => GenError::request_failed(
            Some(status.as_u16()),
            format!("{}: stream rejected", provider),
        ),
        SseError::Transport(e) => GenError::from(e),
        SseError::Utf8(e) => GenError::ResponseParseError(format!("{}: {}", provider, e)),
        SseError::Parser(e) => GenError::ResponseParseError(format!("{}: {}", provider, e)),
        other => GenError::request_failed(None, format!("{}: {}", provider, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message_detailed() {
        let body = r#"{"error":{"message":"Invalid API key","type":"auth"}}"#;
        assert_eq!(error_message(body), "Invalid API key");
    }

    #[test]
    fn test_error_message_plain() {
        assert_eq!(error_message(r#"{"error":"quota"}"#), "quota");
    }

    #[test]
    fn test_error_message_raw_body() {
        assert_eq!(error_message("Bad Gateway"), "Bad Gateway");
    }

    #[test]
    fn test_build_client_rejects_bad_header() {
        let mut headers = HashMap::new();
        headers.insert("bad header".to_string(), "x".to_string());
        let result = build_client(&headers, HeaderMap::new(), Duration::from_secs(1));
        assert!(matches!(result, Err(GenError::Config(_))));
    }

    #[test]
    fn test_secret_header_is_sensitive() {
        let value = secret_header("Bearer sk-1").unwrap();
        assert!(value.is_sensitive());
    }
}
