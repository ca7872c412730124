//! The `HttpClient` capability.
//!
//! Scripts make blocking HTTP calls through `HttpClient.get/post/request`.
//! Arguments are checked here before anything reaches the network, and the
//! response is normalized into bridge wrappers before it goes back.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::Serialize;
use vigil_error::TransportError;

use crate::bridge::{ListApi, MapApi, ScriptValue};
use crate::error::InvalidInputValue;
use crate::HttpTransport;

/// Default number of HTTP calls one evaluation may make.
pub const DEFAULT_MAX_HTTP_CALLS: usize = 50;

/// A request ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Upper-case method token.
    pub method: String,
    /// Absolute URL.
    pub url: String,
    /// Header name/value pairs in script order.
    pub headers: Vec<(String, String)>,
    /// Request body, if any.
    pub body: Option<String>,
}

/// What the transport got back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawHttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Header name/value pairs; repeated names appear repeatedly.
    pub headers: Vec<(String, String)>,
    /// Body decoded as text.
    pub body: String,
}

/// Which `HttpClient` function a script called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpCall {
    /// `HttpClient.get(url, headers?)`
    Get,
    /// `HttpClient.post(url, body?, headers?)`
    Post,
    /// `HttpClient.request(url, method, body?, headers?)`
    Request,
}

impl HttpCall {
    /// Parse the op-level call name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "get" => Some(Self::Get),
            "post" => Some(Self::Post),
            "request" => Some(Self::Request),
            _ => None,
        }
    }

    /// The call site as reported in contract violations.
    pub fn site(self) -> &'static str {
        match self {
            Self::Get => "HttpClient.get()",
            Self::Post => "HttpClient.post()",
            Self::Request => "HttpClient.request()",
        }
    }

    /// Check the script's arguments and build the request.
    pub fn build_request(self, args: &[ScriptValue]) -> Result<HttpRequest, InvalidInputValue> {
        let arg = |index: usize| args.get(index).unwrap_or(&ScriptValue::Undefined);
        let site = self.site();

        let url = match arg(0) {
            ScriptValue::String { value } if !value.is_empty() => value.clone(),
            other => {
                return Err(InvalidInputValue::new(
                    site,
                    0,
                    format!("url must be a non-empty string, got {}", other.type_name()),
                ))
            }
        };

        let (method, body_index, headers_index) = match self {
            Self::Get => ("GET".to_string(), None, 1),
            Self::Post => ("POST".to_string(), Some(1), 2),
            Self::Request => (parse_method(site, arg(1))?, Some(2), 3),
        };

        let body = match body_index {
            Some(index) => parse_body(site, index, arg(index))?,
            None => None,
        };
        let headers = parse_headers(site, headers_index, arg(headers_index))?;

        Ok(HttpRequest {
            method,
            url,
            headers,
            body,
        })
    }
}

fn parse_method(site: &str, value: &ScriptValue) -> Result<String, InvalidInputValue> {
    let method = value.as_str().unwrap_or_default();
    if method.is_empty() || !method.bytes().all(is_token_byte) {
        return Err(InvalidInputValue::new(
            site,
            1,
            format!("method must be an HTTP token, got {}", value.type_name()),
        ));
    }
    Ok(method.to_ascii_uppercase())
}

// RFC 9110 tchar
fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

fn parse_body(
    site: &str,
    index: usize,
    value: &ScriptValue,
) -> Result<Option<String>, InvalidInputValue> {
    match value {
        v if v.is_absent() => Ok(None),
        ScriptValue::String { value } => Ok(Some(value.clone())),
        other => Err(InvalidInputValue::new(
            site,
            index,
            format!("body must be a string, got {}", other.type_name()),
        )),
    }
}

/// Only string-valued members become headers; anything else is skipped.
fn parse_headers(
    site: &str,
    index: usize,
    value: &ScriptValue,
) -> Result<Vec<(String, String)>, InvalidInputValue> {
    if value.is_absent() {
        return Ok(Vec::new());
    }
    if !value.has_named_members() {
        return Err(InvalidInputValue::new(
            site,
            index,
            format!("headers must be an object, got {}", value.type_name()),
        ));
    }
    Ok(value
        .members()
        .iter()
        .filter_map(|(name, v)| v.as_str().map(|s| (name.clone(), s.to_string())))
        .collect())
}

/// A cookie from a `Set-Cookie` response header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    /// Cookie name.
    pub name: String,
    /// Cookie value.
    pub value: String,
    /// `Domain` attribute.
    pub domain: Option<String>,
    /// `Path` attribute.
    pub path: Option<String>,
    /// `Max-Age` attribute in seconds.
    pub max_age: Option<i64>,
    /// `Expires` attribute, verbatim.
    pub expires: Option<String>,
    /// `Secure` flag.
    pub secure: bool,
    /// `HttpOnly` flag.
    pub http_only: bool,
    /// `SameSite` attribute; `Lax` when the server sent none.
    pub same_site: String,
}

impl Cookie {
    /// Parse one `Set-Cookie` header value. `None` if there is no name.
    pub fn parse(header: &str) -> Option<Self> {
        let mut parts = header.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let mut cookie = Cookie {
            name: name.to_string(),
            value: value.trim().trim_matches('"').to_string(),
            domain: None,
            path: None,
            max_age: None,
            expires: None,
            secure: false,
            http_only: false,
            same_site: "Lax".to_string(),
        };

        for attribute in parts {
            let (key, val) = match attribute.split_once('=') {
                Some((k, v)) => (k.trim(), Some(v.trim())),
                None => (attribute.trim(), None),
            };
            match (key.to_ascii_lowercase().as_str(), val) {
                ("domain", Some(v)) => cookie.domain = Some(v.trim_start_matches('.').to_string()),
                ("path", Some(v)) => cookie.path = Some(v.to_string()),
                ("max-age", Some(v)) => cookie.max_age = v.parse().ok(),
                ("expires", Some(v)) => cookie.expires = Some(v.to_string()),
                ("secure", _) => cookie.secure = true,
                ("httponly", _) => cookie.http_only = true,
                ("samesite", Some(v)) if !v.is_empty() => cookie.same_site = v.to_string(),
                _ => {}
            }
        }
        Some(cookie)
    }
}

/// A response as scripts see it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponse {
    /// Body text.
    pub body: String,
    /// HTTP status code.
    pub status_code: u16,
    /// Lower-cased header names to every value received for them.
    pub headers: MapApi<String, ListApi<String>>,
    /// Parsed `Set-Cookie` headers.
    pub cookies: ListApi<Cookie>,
}

impl From<RawHttpResponse> for HttpResponse {
    fn from(raw: RawHttpResponse) -> Self {
        let mut grouped: Vec<(String, Vec<String>)> = Vec::new();
        for (name, value) in raw.headers {
            let name = name.to_ascii_lowercase();
            match grouped.iter_mut().find(|(n, _)| *n == name) {
                Some((_, values)) => values.push(value),
                None => grouped.push((name, vec![value])),
            }
        }

        let cookies = grouped
            .iter()
            .filter(|(name, _)| name == "set-cookie")
            .flat_map(|(_, values)| values.iter())
            .filter_map(|v| Cookie::parse(v))
            .collect();

        Self {
            body: raw.body,
            status_code: raw.status,
            headers: grouped
                .into_iter()
                .map(|(name, values)| (name, ListApi::new(values)))
                .collect(),
            cookies,
        }
    }
}

/// Why a script's HTTP call did not produce a response.
#[derive(Debug, thiserror::Error)]
pub enum HttpClientError {
    /// The arguments broke the call contract.
    #[error(transparent)]
    InvalidInput(#[from] InvalidInputValue),

    /// The per-evaluation call budget is spent.
    #[error("HTTP call limit exceeded (max {max} calls per evaluation)")]
    LimitExceeded {
        /// The configured budget.
        max: usize,
    },

    /// The transport failed.
    #[error("{site} failed: {source}")]
    Transport {
        /// The call site.
        site: &'static str,
        /// The transport error.
        source: TransportError,
    },
}

/// Per-evaluation `HttpClient` state. Lives in the isolate's `OpState`.
pub struct HttpClient {
    transport: Arc<dyn HttpTransport>,
    max_calls: usize,
    calls_made: usize,
}

impl HttpClient {
    /// A client with a fresh call budget.
    pub fn new(transport: Arc<dyn HttpTransport>, max_calls: usize) -> Self {
        Self {
            transport,
            max_calls,
            calls_made: 0,
        }
    }

    /// Number of calls made so far.
    pub fn calls_made(&self) -> usize {
        self.calls_made
    }

    /// Validate, send, and normalize one call.
    pub fn call(
        &mut self,
        call: HttpCall,
        args: &[ScriptValue],
    ) -> Result<HttpResponse, HttpClientError> {
        let request = call.build_request(args)?;
        if self.calls_made >= self.max_calls {
            return Err(HttpClientError::LimitExceeded {
                max: self.max_calls,
            });
        }
        self.calls_made += 1;

        tracing::debug!(
            method = %request.method,
            headers = request.headers.len(),
            has_body = request.body.is_some(),
            "http call dispatched"
        );

        let raw = self
            .transport
            .send(&request)
            .map_err(|source| HttpClientError::Transport {
                site: call.site(),
                source,
            })?;
        Ok(raw.into())
    }
}

/// [`HttpTransport`] backed by a blocking `reqwest` client.
///
/// The client is built on first use, which happens on an evaluation thread.
/// Building a blocking client from inside an async runtime would panic.
pub struct ReqwestTransport {
    timeout: Duration,
    user_agent: String,
    client: OnceLock<reqwest::blocking::Client>,
}

impl ReqwestTransport {
    /// A transport with the given per-request timeout and user agent.
    pub fn new(timeout: Duration, user_agent: impl Into<String>) -> Self {
        Self {
            timeout,
            user_agent: user_agent.into(),
            client: OnceLock::new(),
        }
    }

    fn client(&self) -> Result<&reqwest::blocking::Client, TransportError> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let built = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .user_agent(self.user_agent.clone())
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;
        Ok(self.client.get_or_init(|| built))
    }

    fn classify(&self, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else if err.is_builder() {
            TransportError::InvalidRequest(err.to_string())
        } else {
            TransportError::Request(err.to_string())
        }
    }
}

impl HttpTransport for ReqwestTransport {
    fn send(&self, request: &HttpRequest) -> Result<RawHttpResponse, TransportError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;

        let mut builder = self.client()?.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().map_err(|e| self.classify(e))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response
            .text()
            .map_err(|e| TransportError::Body(e.to_string()))?;

        Ok(RawHttpResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    struct Recording {
        requests: Mutex<Vec<HttpRequest>>,
        response: RawHttpResponse,
    }

    impl HttpTransport for Recording {
        fn send(&self, request: &HttpRequest) -> Result<RawHttpResponse, TransportError> {
            self.requests.lock().push(request.clone());
            Ok(self.response.clone())
        }
    }

    fn args(value: serde_json::Value) -> Vec<ScriptValue> {
        ScriptValue::from_json(&value).items().to_vec()
    }

    #[test]
    fn get_rejects_non_object_headers_at_index_1() {
        let err = HttpCall::Get
            .build_request(&args(json!(["https://example.com", "not-an-object"])))
            .unwrap_err();
        assert_eq!(err.call_site, "HttpClient.get()");
        assert_eq!(err.index, 1);
    }

    #[test]
    fn headers_index_depends_on_call() {
        let err = HttpCall::Post
            .build_request(&args(json!(["https://example.com", "{}", 5])))
            .unwrap_err();
        assert_eq!((err.call_site.as_str(), err.index), ("HttpClient.post()", 2));

        let err = HttpCall::Request
            .build_request(&args(json!(["https://example.com", "PUT", null, [1]])))
            .unwrap_err();
        assert_eq!((err.call_site.as_str(), err.index), ("HttpClient.request()", 3));
    }

    #[test]
    fn only_string_headers_are_forwarded() {
        let request = HttpCall::Get
            .build_request(&args(json!([
                "https://example.com",
                {"Accept": "application/json", "X-Count": 3, "X-Flag": true}
            ])))
            .unwrap();
        assert_eq!(
            request.headers,
            vec![("Accept".to_string(), "application/json".to_string())]
        );
        assert_eq!(request.method, "GET");
    }

    #[test]
    fn request_validates_method_and_body() {
        let err = HttpCall::Request
            .build_request(&args(json!(["https://example.com", "BAD METHOD"])))
            .unwrap_err();
        assert_eq!(err.index, 1);

        let err = HttpCall::Request
            .build_request(&args(json!(["https://example.com", "put", {"a": 1}])))
            .unwrap_err();
        assert_eq!(err.index, 2);

        let ok = HttpCall::Request
            .build_request(&args(json!(["https://example.com", "patch", "{}"])))
            .unwrap();
        assert_eq!(ok.method, "PATCH");
        assert_eq!(ok.body.as_deref(), Some("{}"));
    }

    #[test]
    fn missing_url_is_index_0() {
        let err = HttpCall::Post.build_request(&[]).unwrap_err();
        assert_eq!(err.index, 0);
    }

    #[test]
    fn cookie_parsing_defaults_same_site_to_lax() {
        let cookie = Cookie::parse("session=abc123; Path=/; HttpOnly; Secure; Max-Age=60").unwrap();
        assert_eq!(cookie.name, "session");
        assert_eq!(cookie.value, "abc123");
        assert_eq!(cookie.path.as_deref(), Some("/"));
        assert_eq!(cookie.max_age, Some(60));
        assert!(cookie.secure && cookie.http_only);
        assert_eq!(cookie.same_site, "Lax");

        let strict = Cookie::parse("a=b; SameSite=Strict; Domain=.example.com").unwrap();
        assert_eq!(strict.same_site, "Strict");
        assert_eq!(strict.domain.as_deref(), Some("example.com"));

        assert!(Cookie::parse("=nameless").is_none());
        assert!(Cookie::parse("garbage").is_none());
    }

    #[test]
    fn response_groups_headers_and_extracts_cookies() {
        let raw = RawHttpResponse {
            status: 200,
            headers: vec![
                ("Set-Cookie".into(), "a=1".into()),
                ("Content-Type".into(), "text/plain".into()),
                ("set-cookie".into(), "b=2; SameSite=None".into()),
            ],
            body: "ok".into(),
        };
        let response = HttpResponse::from(raw);
        assert_eq!(response.status_code, 200);
        assert_eq!(response.headers.size(), 2);
        assert_eq!(response.headers.get("set-cookie").map(ListApi::len), Some(2));
        assert_eq!(response.cookies.len(), 2);
        assert_eq!(response.cookies.get(1).unwrap().same_site, "None");

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["statusCode"], 200);
        assert_eq!(json["cookies"]["@@vigil"], "list");
    }

    #[test]
    fn call_limit_is_enforced() {
        let transport = Arc::new(Recording {
            requests: Mutex::new(Vec::new()),
            response: RawHttpResponse {
                status: 204,
                headers: Vec::new(),
                body: String::new(),
            },
        });
        let mut client = HttpClient::new(transport.clone(), 2);
        let call_args = args(json!(["https://example.com"]));
        client.call(HttpCall::Get, &call_args).unwrap();
        client.call(HttpCall::Get, &call_args).unwrap();
        let err = client.call(HttpCall::Get, &call_args).unwrap_err();
        assert!(matches!(err, HttpClientError::LimitExceeded { max: 2 }));
        assert_eq!(transport.requests.lock().len(), 2);
    }

    #[test]
    fn invalid_arguments_do_not_consume_budget() {
        let transport = Arc::new(Recording {
            requests: Mutex::new(Vec::new()),
            response: RawHttpResponse {
                status: 200,
                headers: Vec::new(),
                body: String::new(),
            },
        });
        let mut client = HttpClient::new(transport, 1);
        assert!(client
            .call(HttpCall::Get, &args(json!(["https://x", 1])))
            .is_err());
        assert_eq!(client.calls_made(), 0);
    }
}
