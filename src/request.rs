//! Request and response values passed between policy layers.
//!
//! `RequestOptions` is treated as an immutable value: every `with_*` method consumes `self` and
//! returns a new value, so a policy that changes a request always hands a fresh value to the
//! next layer.

use crate::cancellation::CancelSignal;
use crate::error::{HttpError, RequestError};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl Method {
    /// Upper-case wire name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            "PATCH" => Ok(Method::Patch),
            "HEAD" => Ok(Method::Head),
            "OPTIONS" => Ok(Method::Options),
            other => Err(RequestError::Configuration(format!("unsupported HTTP method '{other}'"))),
        }
    }
}

/// How the transport should decode the response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    #[default]
    Json,
    Text,
    Blob,
    ArrayBuffer,
}

/// Outbound request description.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestOptions {
    pub url: String,
    pub method: Method,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub response_type: ResponseType,
    #[serde(default, with = "crate::config::serde_millis_opt", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub with_credentials: bool,
    /// Cancellation signal observed by the transport call.
    #[serde(skip)]
    pub signal: Option<CancelSignal>,
}

impl RequestOptions {
    /// Request for `url` with `method`.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self { url: url.into(), method, ..Self::default() }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_response_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_credentials(mut self, with_credentials: bool) -> Self {
        self.with_credentials = with_credentials;
        self
    }

    /// Attach the cancellation signal the transport should observe.
    pub fn with_signal(mut self, signal: CancelSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    /// URL path without any query string.
    pub fn path(&self) -> &str {
        self.url.split('?').next().unwrap_or(&self.url)
    }

    /// Query params rendered as `a=1&b=2`, keys in sorted order.
    pub fn query_string(&self) -> String {
        self.params.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join("&")
    }
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("params", &self.params)
            .field("headers", &self.headers)
            .field("data", &self.data)
            .field("response_type", &self.response_type)
            .field("timeout", &self.timeout)
            .field("with_credentials", &self.with_credentials)
            .field("signal", &self.signal.as_ref().map(|_| "<signal>"))
            .finish()
    }
}

impl PartialEq for RequestOptions {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url
            && self.method == other.method
            && self.headers == other.headers
            && self.data == other.data
            && self.params == other.params
            && self.response_type == other.response_type
            && self.timeout == other.timeout
            && self.with_credentials == other.with_credentials
    }
}

/// Decoded response body.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum ResponseBody {
    Json(Value),
    Text(String),
    Binary(Bytes),
    #[default]
    Empty,
}

impl ResponseBody {
    /// Body as JSON, parsing text bodies on the way.
    pub fn to_json(&self) -> Option<Value> {
        match self {
            ResponseBody::Json(v) => Some(v.clone()),
            ResponseBody::Text(t) => serde_json::from_str(t).ok(),
            ResponseBody::Binary(b) => serde_json::from_slice(b).ok(),
            ResponseBody::Empty => None,
        }
    }
}

impl From<Value> for ResponseBody {
    fn from(value: Value) -> Self {
        ResponseBody::Json(value)
    }
}

impl From<String> for ResponseBody {
    fn from(value: String) -> Self {
        ResponseBody::Text(value)
    }
}

impl From<&str> for ResponseBody {
    fn from(value: &str) -> Self {
        ResponseBody::Text(value.to_string())
    }
}

/// Response delivered back through every policy layer.
///
/// Always carries the originating request so any layer can trace a response to its cause.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse<T = ResponseBody> {
    pub data: T,
    pub status: u16,
    pub status_text: String,
    pub headers: BTreeMap<String, String>,
    pub config: RequestOptions,
}

impl<T> HttpResponse<T> {
    /// Response with `status` and `data`, no headers.
    pub fn new(config: RequestOptions, status: u16, data: T) -> Self {
        Self {
            data,
            status,
            status_text: canonical_reason(status).to_string(),
            headers: BTreeMap::new(),
            config,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// `true` for statuses below 400.
    pub fn is_success(&self) -> bool {
        self.status < 400
    }

    /// Convert the body, keeping status, headers and config.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> HttpResponse<U> {
        HttpResponse {
            data: f(self.data),
            status: self.status,
            status_text: self.status_text,
            headers: self.headers,
            config: self.config,
        }
    }
}

impl HttpResponse<ResponseBody> {
    /// Deserialize a JSON (or JSON text) body.
    pub fn json<U: DeserializeOwned>(&self) -> Result<U, RequestError> {
        let value = self.data.to_json().ok_or_else(|| {
            HttpError::new("response body is not JSON").with_code("ERR_BAD_RESPONSE")
        })?;
        serde_json::from_value(value).map_err(|e| {
            RequestError::Http(HttpError::new(e.to_string()).with_code("ERR_DESERIALIZE"))
        })
    }
}

pub(crate) fn canonical_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        408 => "Request Timeout",
        409 => "Conflict",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}
