use super::ReqwestOptions;
use crate::client::Transport;
use crate::error::{HttpError, RequestError};
use crate::request::{HttpResponse, Method, RequestOptions, ResponseBody, ResponseType};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;

/// [`Transport`] backed by a `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: ::reqwest::Client,
}

impl ReqwestTransport {
    /// Transport over a default client.
    pub fn new() -> Result<Self, RequestError> {
        let client = ::reqwest::Client::builder()
            .build()
            .map_err(|e| RequestError::Configuration(format!("cannot build reqwest client: {e}")))?;
        Ok(Self { client })
    }

    pub fn from_client(client: ::reqwest::Client) -> Self {
        Self { client }
    }

    pub fn from_options(options: &ReqwestOptions) -> Result<Self, RequestError> {
        let mut headers = ::reqwest::header::HeaderMap::new();
        for (name, value) in &options.default_headers {
            let name = ::reqwest::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| RequestError::Configuration(format!("invalid header name {name:?}: {e}")))?;
            let value = ::reqwest::header::HeaderValue::from_str(value)
                .map_err(|e| RequestError::Configuration(format!("invalid header value: {e}")))?;
            headers.insert(name, value);
        }

        let mut builder = ::reqwest::Client::builder().default_headers(headers);
        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(timeout) = options.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        if let Some(agent) = &options.user_agent {
            builder = builder.user_agent(agent.as_str());
        }
        let client = builder
            .build()
            .map_err(|e| RequestError::Configuration(format!("cannot build reqwest client: {e}")))?;
        Ok(Self { client })
    }
}

fn to_reqwest_method(method: Method) -> ::reqwest::Method {
    match method {
        Method::Get => ::reqwest::Method::GET,
        Method::Post => ::reqwest::Method::POST,
        Method::Put => ::reqwest::Method::PUT,
        Method::Delete => ::reqwest::Method::DELETE,
        Method::Patch => ::reqwest::Method::PATCH,
        Method::Head => ::reqwest::Method::HEAD,
        Method::Options => ::reqwest::Method::OPTIONS,
    }
}

fn map_error(err: ::reqwest::Error) -> RequestError {
    let message = err.to_string();
    let http = if err.is_timeout() {
        HttpError::new(format!("timeout: {message}")).with_code("ETIMEDOUT")
    } else if err.is_connect() {
        HttpError::network(format!("Network Error: {message}")).with_code("ECONNREFUSED")
    } else if err.is_decode() || err.is_body() {
        HttpError::new(message).with_code("ERR_BAD_RESPONSE")
    } else if err.is_builder() {
        HttpError::new(message).with_code("ERR_BAD_OPTION")
    } else {
        HttpError::network(format!("Network Error: {message}"))
    };
    http.into()
}

fn decode_body(response_type: ResponseType, bytes: Bytes) -> ResponseBody {
    if bytes.is_empty() {
        return ResponseBody::Empty;
    }
    match response_type {
        ResponseType::Json => match serde_json::from_slice(&bytes) {
            Ok(value) => ResponseBody::Json(value),
            Err(_) => ResponseBody::Text(String::from_utf8_lossy(&bytes).into_owned()),
        },
        ResponseType::Text => ResponseBody::Text(String::from_utf8_lossy(&bytes).into_owned()),
        ResponseType::Blob | ResponseType::ArrayBuffer => ResponseBody::Binary(bytes),
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: RequestOptions) -> Result<HttpResponse, RequestError> {
        let mut builder = self.client.request(to_reqwest_method(request.method), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.params.is_empty() {
            builder = builder.query(&request.params);
        }
        if let Some(data) = &request.data {
            builder = builder.json(data);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(map_error)?;
        let status = response.status();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let bytes = response.bytes().await.map_err(map_error)?;
        tracing::debug!(method = %request.method, url = %request.url, status = status.as_u16(), "reqwest response");

        let data = decode_body(request.response_type, bytes);
        let mut out = HttpResponse::new(request, status.as_u16(), data);
        out.status_text = status.canonical_reason().unwrap_or_default().to_string();
        out.headers = headers;
        Ok(out)
    }
}
