//! Contract between generated endpoint code and the request-policy layer.
//!
//! An endpoint group is built with `(configuration, base_path, client)` and issues every call
//! through the [`HttpClient`] it was given. Since [`PolicyClient`](crate::stack::PolicyClient)
//! is itself an `HttpClient`, endpoints never know which policies are active.
//!
//! ```rust
//! use reqpolicy::api::{ApiClient, Configuration, Endpoint, EndpointContext};
//! use reqpolicy::prelude::*;
//! use std::sync::Arc;
//!
//! struct PetApi {
//!     ctx: EndpointContext,
//! }
//!
//! impl Endpoint for PetApi {
//!     fn new(configuration: Arc<Configuration>, base_path: String, client: Arc<dyn HttpClient>) -> Self {
//!         Self { ctx: EndpointContext::new(configuration, base_path, client) }
//!     }
//! }
//!
//! impl PetApi {
//!     async fn get_pet(&self, id: u64) -> Result<HttpResponse, RequestError> {
//!         self.ctx.send(RequestOptions::get(format!("/pets/{id}"))).await
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let transport = Arc::new(|req: RequestOptions| async move {
//!     Ok::<_, RequestError>(HttpResponse::new(req, 200, ResponseBody::Empty))
//! });
//! let api = ApiClient::new(
//!     Configuration::new().with_base_path("https://petstore.test/v1"),
//!     Arc::new(InterceptorClient::new(transport)),
//! );
//! let res = api.endpoint::<PetApi>().get_pet(7).await.unwrap();
//! assert_eq!(res.config.url, "https://petstore.test/v1/pets/7");
//! # }
//! ```

use crate::client::HttpClient;
use crate::error::RequestError;
use crate::request::{HttpResponse, RequestOptions};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Base path used when the configuration does not name one.
pub const DEFAULT_BASE_PATH: &str = "http://localhost";

/// Settings shared by every endpoint group of one API.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Configuration {
    pub base_path: Option<String>,
    /// Sent with every request unless the request sets the same header.
    pub headers: BTreeMap<String, String>,
    pub bearer_token: Option<String>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = Some(base_path.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Merge configured headers and credentials into `options`; request values win.
    pub fn apply(&self, mut options: RequestOptions) -> RequestOptions {
        for (name, value) in &self.headers {
            if !has_header(&options, name) {
                options.headers.insert(name.clone(), value.clone());
            }
        }
        if let Some(token) = &self.bearer_token {
            if !has_header(&options, "authorization") {
                options.headers.insert("Authorization".to_string(), format!("Bearer {token}"));
            }
        }
        options
    }
}

fn has_header(options: &RequestOptions, name: &str) -> bool {
    options.headers.keys().any(|k| k.eq_ignore_ascii_case(name))
}

/// Join a base path and a relative path with exactly one slash. Absolute URLs pass through.
pub fn resolve_url(base_path: &str, path: &str) -> String {
    let lower = path.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return path.to_string();
    }
    let base = base_path.trim_end_matches('/');
    let relative = path.trim_start_matches('/');
    match (base.is_empty(), relative.is_empty()) {
        (true, true) => String::new(),
        (true, false) => relative.to_string(),
        (false, true) => base.to_string(),
        (false, false) => format!("{base}/{relative}"),
    }
}

/// A generated endpoint group.
pub trait Endpoint: Sized {
    fn new(configuration: Arc<Configuration>, base_path: String, client: Arc<dyn HttpClient>) -> Self;
}

/// State every endpoint group carries, plus the dispatch helper its methods call.
#[derive(Clone)]
pub struct EndpointContext {
    configuration: Arc<Configuration>,
    base_path: String,
    client: Arc<dyn HttpClient>,
}

impl std::fmt::Debug for EndpointContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointContext")
            .field("configuration", &self.configuration)
            .field("base_path", &self.base_path)
            .finish_non_exhaustive()
    }
}

impl EndpointContext {
    pub fn new(configuration: Arc<Configuration>, base_path: String, client: Arc<dyn HttpClient>) -> Self {
        Self { configuration, base_path, client }
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub fn client(&self) -> &Arc<dyn HttpClient> {
        &self.client
    }

    /// Resolve the URL against the base path, apply the configuration and send.
    pub async fn send(&self, options: RequestOptions) -> Result<HttpResponse, RequestError> {
        let url = resolve_url(&self.base_path, &options.url);
        let options = self.configuration.apply(options.with_url(url));
        self.client.request(options).await
    }
}

/// Entry point over one API: hands out endpoint groups sharing a client and configuration.
#[derive(Clone)]
pub struct ApiClient {
    configuration: Arc<Configuration>,
    base_path: String,
    client: Arc<dyn HttpClient>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("configuration", &self.configuration)
            .field("base_path", &self.base_path)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    pub fn new(configuration: Configuration, client: Arc<dyn HttpClient>) -> Self {
        let base_path = configuration
            .base_path
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_PATH.to_string());
        Self { configuration: Arc::new(configuration), base_path, client }
    }

    /// Build the endpoint group `E` over this client.
    pub fn endpoint<E: Endpoint>(&self) -> E {
        E::new(self.configuration.clone(), self.base_path.clone(), self.client.clone())
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub fn client(&self) -> &Arc<dyn HttpClient> {
        &self.client
    }
}
