//! `http.request`: outbound HTTP on behalf of a script.
//!
//! Two clients are kept. The guarded one resolves DNS through
//! [`SafeDnsResolver`] and re-validates every redirect hop, so a public name
//! can't be used to reach private space. The private one is only used when a
//! (trusted) script explicitly passes `allowPrivateNetwork`.

use std::collections::BTreeMap;
use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::redirect::Policy;
use serde::Deserialize;
use serde_json::{json, Value};

use super::parse_payload;
use crate::config::Config;
use crate::error::ScriptError;
use crate::security::{validate_network_target, NetworkScheme, SafeDnsResolver};

/// Maximum number of request headers.
pub const MAX_HEADERS: usize = 32;
/// Maximum header name length.
pub const MAX_HEADER_NAME_LEN: usize = 128;
/// Maximum header value length.
pub const MAX_HEADER_VALUE_LEN: usize = 4096;
/// Redirect hops followed before giving up.
const MAX_REDIRECTS: usize = 5;

/// Methods scripts may use.
const ALLOWED_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

/// Headers the transport owns.
const FORBIDDEN_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authorization",
    "proxy-authenticate",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "content-length",
];

/// reqwest clients used by the bridge.
#[derive(Debug, Clone)]
pub(crate) struct HttpClients {
    guarded: reqwest::Client,
    private: reqwest::Client,
}

impl HttpClients {
    pub(crate) fn new() -> anyhow::Result<Self> {
        let user_agent = concat!("scriptbox/", env!("CARGO_PKG_VERSION"));

        let guarded = reqwest::Client::builder()
            .user_agent(user_agent)
            .dns_resolver(Arc::new(SafeDnsResolver))
            .redirect(Policy::custom(|attempt| {
                if attempt.previous().len() >= MAX_REDIRECTS {
                    return attempt.error(format!("too many redirects (limit: {MAX_REDIRECTS})"));
                }
                match validate_network_target(attempt.url().as_str(), NetworkScheme::Http, false) {
                    Ok(_) => attempt.follow(),
                    Err(e) => attempt.error(format!("redirect blocked: {e}")),
                }
            }))
            .build()?;

        let private = reqwest::Client::builder()
            .user_agent(user_agent)
            .redirect(Policy::limited(MAX_REDIRECTS))
            .build()?;

        Ok(Self { guarded, private })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HttpRequestPayload {
    url: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    json: Option<Value>,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    allow_private_network: bool,
}

fn parse_method(method: Option<&str>) -> Result<reqwest::Method, ScriptError> {
    let method = method.unwrap_or("GET").trim().to_ascii_uppercase();
    if !ALLOWED_METHODS.contains(&method.as_str()) {
        return Err(ScriptError::validation(format!(
            "HTTP method '{method}' is not allowed"
        )));
    }
    reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|e| ScriptError::validation(format!("invalid HTTP method: {e}")))
}

/// Validate script-supplied headers into a [`HeaderMap`].
pub(crate) fn build_headers(headers: &BTreeMap<String, String>) -> Result<HeaderMap, ScriptError> {
    if headers.len() > MAX_HEADERS {
        return Err(ScriptError::validation(format!(
            "at most {MAX_HEADERS} headers are allowed"
        )));
    }
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        if name.len() > MAX_HEADER_NAME_LEN {
            return Err(ScriptError::validation(format!(
                "header name exceeds {MAX_HEADER_NAME_LEN} bytes"
            )));
        }
        if value.len() > MAX_HEADER_VALUE_LEN {
            return Err(ScriptError::validation(format!(
                "header '{name}' exceeds {MAX_HEADER_VALUE_LEN} bytes"
            )));
        }
        let lower = name.to_ascii_lowercase();
        if FORBIDDEN_HEADERS.contains(&lower.as_str()) {
            return Err(ScriptError::validation(format!(
                "header '{name}' is managed by the host"
            )));
        }
        let header_name = HeaderName::from_bytes(lower.as_bytes())
            .map_err(|e| ScriptError::validation(format!("invalid header name '{name}': {e}")))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|e| ScriptError::validation(format!("invalid value for header '{name}': {e}")))?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}

fn transport_error(e: &reqwest::Error, timeout_ms: u128) -> ScriptError {
    if e.is_timeout() {
        ScriptError::transport(format!("request timed out after {timeout_ms}ms"))
    } else if e.is_redirect() {
        ScriptError::transport(format!("redirect failed: {e}"))
    } else {
        ScriptError::transport(e.to_string())
    }
}

pub(crate) async fn request(
    clients: &HttpClients,
    config: &Config,
    payload: Value,
) -> Result<Value, ScriptError> {
    let payload: HttpRequestPayload = parse_payload("http.request", payload)?;
    let url = validate_network_target(&payload.url, NetworkScheme::Http, payload.allow_private_network)?;
    let method = parse_method(payload.method.as_deref())?;
    let mut headers = build_headers(&payload.headers)?;
    let timeout = config.clamp_http_timeout(payload.timeout_ms);

    let body = match (payload.body, payload.json) {
        (Some(_), Some(_)) => {
            return Err(ScriptError::validation(
                "http.request accepts either body or json, not both",
            ))
        }
        (Some(body), None) => Some(body.into_bytes()),
        (None, Some(json)) => {
            if !headers.contains_key(reqwest::header::CONTENT_TYPE) {
                headers.insert(
                    reqwest::header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
            }
            Some(
                serde_json::to_vec(&json)
                    .map_err(|e| ScriptError::validation(format!("json body: {e}")))?,
            )
        }
        (None, None) => None,
    };
    if let Some(ref body) = body {
        if body.len() > config.http_max_request_body_bytes {
            return Err(ScriptError::validation(format!(
                "request body exceeds {} bytes",
                config.http_max_request_body_bytes
            )));
        }
    }

    let client = if payload.allow_private_network {
        &clients.private
    } else {
        &clients.guarded
    };

    log::debug!("[http] {method} {url} (timeout {timeout:?})");
    let mut builder = client.request(method, url).headers(headers).timeout(timeout);
    if let Some(body) = body {
        builder = builder.body(body);
    }

    let timeout_ms = timeout.as_millis();
    let mut response = builder
        .send()
        .await
        .map_err(|e| transport_error(&e, timeout_ms))?;

    let limit = config.http_max_response_bytes;
    if response.content_length().is_some_and(|len| len > limit as u64) {
        return Err(ScriptError::transport(format!(
            "response exceeds {limit} bytes"
        )));
    }

    let status = response.status();
    let mut response_headers = serde_json::Map::new();
    for (name, value) in response.headers() {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        match response_headers.get_mut(name.as_str()) {
            Some(Value::String(existing)) => {
                existing.push_str(", ");
                existing.push_str(&value);
            }
            _ => {
                response_headers.insert(name.as_str().to_string(), Value::String(value));
            }
        }
    }

    let mut bytes = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| transport_error(&e, timeout_ms))?
    {
        if bytes.len() + chunk.len() > limit {
            return Err(ScriptError::transport(format!(
                "response exceeds {limit} bytes"
            )));
        }
        bytes.extend_from_slice(&chunk);
    }

    let text = String::from_utf8_lossy(&bytes).into_owned();
    let parsed = serde_json::from_str::<Value>(&text).unwrap_or(Value::Null);

    Ok(json!({
        "ok": status.is_success(),
        "status": status.as_u16(),
        "statusText": status.canonical_reason().unwrap_or_default(),
        "headers": response_headers,
        "text": text,
        "json": parsed,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn clients() -> HttpClients {
        HttpClients::new().expect("clients")
    }

    #[test]
    fn test_parse_method() {
        assert_eq!(parse_method(None).expect("default"), reqwest::Method::GET);
        assert_eq!(parse_method(Some("patch")).expect("patch"), reqwest::Method::PATCH);
        assert!(parse_method(Some("CONNECT")).is_err());
        assert!(parse_method(Some("TRACE")).is_err());
    }

    #[test]
    fn test_build_headers_rejects_hop_by_hop() {
        let mut headers = BTreeMap::new();
        headers.insert("Host".to_string(), "evil".to_string());
        assert!(build_headers(&headers).is_err());

        let mut headers = BTreeMap::new();
        headers.insert("X-Token".to_string(), "abc".to_string());
        let map = build_headers(&headers).expect("headers");
        assert_eq!(map.get("x-token").expect("present"), "abc");
    }

    #[test]
    fn test_build_headers_limits() {
        let headers: BTreeMap<String, String> = (0..=MAX_HEADERS)
            .map(|i| (format!("x-h{i}"), "v".to_string()))
            .collect();
        assert!(build_headers(&headers).is_err());

        let mut headers = BTreeMap::new();
        headers.insert("x-big".to_string(), "v".repeat(MAX_HEADER_VALUE_LEN + 1));
        assert!(build_headers(&headers).is_err());
    }

    #[tokio::test]
    async fn test_private_target_rejected_without_opt_in() {
        let err = request(
            &clients(),
            &Config::default(),
            json!({"url": "http://127.0.0.1:9999/"}),
        )
        .await
        .expect_err("private");
        assert_eq!(err.kind(), "ValidationError");
        assert!(err.to_string().contains("private network"));
    }

    #[tokio::test]
    async fn test_request_roundtrip_with_private_opt_in() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/echo"))
            .and(header("x-token", "abc"))
            .and(body_json(json!({"hello": "world"})))
            .respond_with(
                ResponseTemplate::new(201)
                    .insert_header("x-reply", "yes")
                    .set_body_json(json!({"created": true})),
            )
            .mount(&server)
            .await;

        let result = request(
            &clients(),
            &Config::default(),
            json!({
                "url": format!("{}/echo", server.uri()),
                "method": "post",
                "headers": {"X-Token": "abc"},
                "json": {"hello": "world"},
                "allowPrivateNetwork": true,
            }),
        )
        .await
        .expect("request");

        assert_eq!(result["ok"], true);
        assert_eq!(result["status"], 201);
        assert_eq!(result["statusText"], "Created");
        assert_eq!(result["headers"]["x-reply"], "yes");
        assert_eq!(result["json"]["created"], true);
    }

    #[tokio::test]
    async fn test_non_json_body_and_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("nope"))
            .mount(&server)
            .await;

        let result = request(
            &clients(),
            &Config::default(),
            json!({"url": server.uri(), "allowPrivateNetwork": true}),
        )
        .await
        .expect("request");
        assert_eq!(result["ok"], false);
        assert_eq!(result["status"], 404);
        assert_eq!(result["text"], "nope");
        assert_eq!(result["json"], Value::Null);
    }

    #[tokio::test]
    async fn test_timeout_is_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(std::time::Duration::from_secs(5)))
            .mount(&server)
            .await;

        let err = request(
            &clients(),
            &Config::default(),
            json!({"url": server.uri(), "timeoutMs": 200, "allowPrivateNetwork": true}),
        )
        .await
        .expect_err("timeout");
        assert_eq!(err.kind(), "TransportError");
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_oversized_response_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(64)))
            .mount(&server)
            .await;

        let config = Config {
            http_max_response_bytes: 16,
            ..Config::default()
        };
        let err = request(
            &clients(),
            &config,
            json!({"url": server.uri(), "allowPrivateNetwork": true}),
        )
        .await
        .expect_err("too big");
        assert_eq!(err.kind(), "TransportError");
    }

    #[tokio::test]
    async fn test_body_and_json_conflict() {
        let err = request(
            &clients(),
            &Config::default(),
            json!({"url": "https://example.com", "body": "a", "json": {}}),
        )
        .await
        .expect_err("conflict");
        assert_eq!(err.kind(), "ValidationError");
    }
}
