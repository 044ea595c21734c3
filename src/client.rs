//! HTTP client contract and interceptor chain.
//!
//! [`HttpClient`] is the surface every policy wrapper preserves: generated endpoint code talks
//! to it and never learns which policies are active. [`Transport`] is the lower contract an
//! adapter implements: turn a [`RequestOptions`] into a network call and a raw response.
//!
//! [`InterceptorClient`] ties the two together:
//! 1. request interceptors run in registration order; a failing interceptor hands its error to
//!    its own `on_rejected`, which may recover with new options or abort the request;
//! 2. the transport call races the request's cancel signal and its `timeout`;
//! 3. a status outside `200..300` becomes [`HttpError::from_status`];
//! 4. response interceptors run in registration order; an error (from the network call or an
//!    earlier interceptor) is offered to the next `on_rejected`, which may recover.

use crate::error::{HttpError, RequestError};
use crate::request::{HttpResponse, Method, RequestOptions};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Uniform request surface.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn request(&self, options: RequestOptions) -> Result<HttpResponse, RequestError>;

    async fn get(&self, url: &str) -> Result<HttpResponse, RequestError> {
        self.request(RequestOptions::new(Method::Get, url)).await
    }

    async fn post(&self, url: &str, data: Value) -> Result<HttpResponse, RequestError> {
        self.request(RequestOptions::new(Method::Post, url).with_data(data)).await
    }

    async fn put(&self, url: &str, data: Value) -> Result<HttpResponse, RequestError> {
        self.request(RequestOptions::new(Method::Put, url).with_data(data)).await
    }

    async fn patch(&self, url: &str, data: Value) -> Result<HttpResponse, RequestError> {
        self.request(RequestOptions::new(Method::Patch, url).with_data(data)).await
    }

    async fn delete(&self, url: &str) -> Result<HttpResponse, RequestError> {
        self.request(RequestOptions::new(Method::Delete, url)).await
    }
}

#[async_trait]
impl<C: HttpClient + ?Sized> HttpClient for Arc<C> {
    async fn request(&self, options: RequestOptions) -> Result<HttpResponse, RequestError> {
        (**self).request(options).await
    }
}

/// Network adapter. Returns the raw response whatever its status.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: RequestOptions) -> Result<HttpResponse, RequestError>;
}

#[async_trait]
impl<F, Fut> Transport for F
where
    F: Fn(RequestOptions) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HttpResponse, RequestError>> + Send + 'static,
{
    async fn send(&self, request: RequestOptions) -> Result<HttpResponse, RequestError> {
        (self)(request).await
    }
}

/// Handle returned when registering an interceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterceptorId(u64);

type RequestFulfilled = Arc<dyn Fn(RequestOptions) -> Result<RequestOptions, RequestError> + Send + Sync>;
type RequestRejected = Arc<dyn Fn(RequestError) -> Result<RequestOptions, RequestError> + Send + Sync>;
type ResponseFulfilled = Arc<dyn Fn(HttpResponse) -> Result<HttpResponse, RequestError> + Send + Sync>;
type ResponseRejected = Arc<dyn Fn(RequestError) -> Result<HttpResponse, RequestError> + Send + Sync>;

/// Rewrites outgoing request options.
#[derive(Clone)]
pub struct RequestInterceptor {
    on_fulfilled: RequestFulfilled,
    on_rejected: Option<RequestRejected>,
}

impl RequestInterceptor {
    pub fn new<F>(on_fulfilled: F) -> Self
    where
        F: Fn(RequestOptions) -> Result<RequestOptions, RequestError> + Send + Sync + 'static,
    {
        Self { on_fulfilled: Arc::new(on_fulfilled), on_rejected: None }
    }

    /// Handle a failure of this interceptor's `on_fulfilled`.
    pub fn on_rejected<F>(mut self, on_rejected: F) -> Self
    where
        F: Fn(RequestError) -> Result<RequestOptions, RequestError> + Send + Sync + 'static,
    {
        self.on_rejected = Some(Arc::new(on_rejected));
        self
    }

    fn apply(&self, options: RequestOptions) -> Result<RequestOptions, RequestError> {
        match (self.on_fulfilled)(options) {
            Ok(options) => Ok(options),
            Err(err) => match &self.on_rejected {
                Some(recover) => recover(err),
                None => Err(err),
            },
        }
    }
}

impl std::fmt::Debug for RequestInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestInterceptor")
            .field("on_rejected", &self.on_rejected.is_some())
            .finish()
    }
}

/// Observes or rewrites responses and errors.
#[derive(Clone)]
pub struct ResponseInterceptor {
    on_fulfilled: ResponseFulfilled,
    on_rejected: Option<ResponseRejected>,
}

impl ResponseInterceptor {
    pub fn new<F>(on_fulfilled: F) -> Self
    where
        F: Fn(HttpResponse) -> Result<HttpResponse, RequestError> + Send + Sync + 'static,
    {
        Self { on_fulfilled: Arc::new(on_fulfilled), on_rejected: None }
    }

    /// Interceptor that only handles errors and passes responses through.
    pub fn on_error<F>(on_rejected: F) -> Self
    where
        F: Fn(RequestError) -> Result<HttpResponse, RequestError> + Send + Sync + 'static,
    {
        Self::new(Ok).on_rejected(on_rejected)
    }

    /// Handle an error left by the network call or an earlier interceptor.
    pub fn on_rejected<F>(mut self, on_rejected: F) -> Self
    where
        F: Fn(RequestError) -> Result<HttpResponse, RequestError> + Send + Sync + 'static,
    {
        self.on_rejected = Some(Arc::new(on_rejected));
        self
    }

    fn apply(&self, result: Result<HttpResponse, RequestError>) -> Result<HttpResponse, RequestError> {
        match result {
            Ok(response) => (self.on_fulfilled)(response),
            Err(err) => match &self.on_rejected {
                Some(recover) => recover(err),
                None => Err(err),
            },
        }
    }
}

impl std::fmt::Debug for ResponseInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseInterceptor")
            .field("on_rejected", &self.on_rejected.is_some())
            .finish()
    }
}

#[derive(Default)]
struct Interceptors {
    request: Vec<(InterceptorId, RequestInterceptor)>,
    response: Vec<(InterceptorId, ResponseInterceptor)>,
}

/// [`HttpClient`] over a [`Transport`], with interceptors, cancellation and timeouts.
#[derive(Clone)]
pub struct InterceptorClient {
    transport: Arc<dyn Transport>,
    interceptors: Arc<RwLock<Interceptors>>,
    next_id: Arc<AtomicU64>,
    default_timeout: Option<Duration>,
}

impl std::fmt::Debug for InterceptorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let interceptors = self.interceptors.read();
        f.debug_struct("InterceptorClient")
            .field("request_interceptors", &interceptors.request.len())
            .field("response_interceptors", &interceptors.response.len())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

impl InterceptorClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            interceptors: Arc::new(RwLock::new(Interceptors::default())),
            next_id: Arc::new(AtomicU64::new(1)),
            default_timeout: None,
        }
    }

    /// Timeout for requests that do not set their own.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    fn next_id(&self) -> InterceptorId {
        InterceptorId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn add_request_interceptor(&self, interceptor: RequestInterceptor) -> InterceptorId {
        let id = self.next_id();
        self.interceptors.write().request.push((id, interceptor));
        id
    }

    pub fn add_response_interceptor(&self, interceptor: ResponseInterceptor) -> InterceptorId {
        let id = self.next_id();
        self.interceptors.write().response.push((id, interceptor));
        id
    }

    /// Remove an interceptor of either kind. Unknown ids are ignored.
    pub fn remove_interceptor(&self, id: InterceptorId) -> bool {
        let mut interceptors = self.interceptors.write();
        let before = interceptors.request.len() + interceptors.response.len();
        interceptors.request.retain(|(i, _)| *i != id);
        interceptors.response.retain(|(i, _)| *i != id);
        before != interceptors.request.len() + interceptors.response.len()
    }

    fn request_chain(&self) -> Vec<RequestInterceptor> {
        self.interceptors.read().request.iter().map(|(_, i)| i.clone()).collect()
    }

    fn response_chain(&self) -> Vec<ResponseInterceptor> {
        self.interceptors.read().response.iter().map(|(_, i)| i.clone()).collect()
    }

    async fn dispatch(&self, options: RequestOptions) -> Result<HttpResponse, RequestError> {
        let signal = options.signal.clone();
        if let Some(reason) = signal.as_ref().and_then(|s| s.reason()) {
            return Err(RequestError::cancelled(reason));
        }
        let timeout = options.timeout.or(self.default_timeout);
        let (method, url) = (options.method, options.url.clone());

        let send = self.transport.send(options);
        let raced = async move {
            match signal {
                Some(signal) => tokio::select! {
                    out = send => out,
                    reason = signal.cancelled() => Err(RequestError::cancelled(reason)),
                },
                None => send.await,
            }
        };
        let response = match timeout {
            Some(limit) => match tokio::time::timeout(limit, raced).await {
                Ok(out) => out,
                Err(_) => Err(HttpError::timeout(limit).into()),
            },
            None => raced.await,
        }?;

        if (200..300).contains(&response.status) {
            return Ok(response);
        }
        tracing::debug!(%method, url = %url, status = response.status, "request failed with error status");
        Err(HttpError::from_status(response.status, &response.status_text, response.data.to_json()).into())
    }
}

#[async_trait]
impl HttpClient for InterceptorClient {
    async fn request(&self, options: RequestOptions) -> Result<HttpResponse, RequestError> {
        let mut options = options;
        for interceptor in self.request_chain() {
            options = interceptor.apply(options)?;
        }

        let mut result = self.dispatch(options).await;
        for interceptor in self.response_chain() {
            result = interceptor.apply(result);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::CancellationToken;
    use crate::request::ResponseBody;
    use serde_json::json;

    fn echo_transport() -> Arc<dyn Transport> {
        Arc::new(|request: RequestOptions| async move {
            let body = json!({ "url": request.url, "headers": request.headers });
            Ok::<_, RequestError>(HttpResponse::new(request, 200, ResponseBody::Json(body)))
        })
    }

    fn status_transport(status: u16) -> Arc<dyn Transport> {
        Arc::new(move |request: RequestOptions| async move {
            Ok::<_, RequestError>(HttpResponse::new(request, status, ResponseBody::Json(json!({"error": "nope"}))))
        })
    }

    #[tokio::test]
    async fn verbs_delegate_to_request() {
        let client = InterceptorClient::new(Arc::new(|request: RequestOptions| async move {
            let body = json!({ "method": request.method.as_str(), "data": request.data });
            Ok::<_, RequestError>(HttpResponse::new(request, 200, ResponseBody::Json(body)))
        }));
        let res = client.post("/pets", json!({"name": "rex"})).await.unwrap();
        assert_eq!(res.data, ResponseBody::Json(json!({"method": "POST", "data": {"name": "rex"}})));
        let res = client.delete("/pets/1").await.unwrap();
        assert_eq!(res.config.method, Method::Delete);
    }

    #[tokio::test]
    async fn request_interceptors_run_in_order() {
        let client = InterceptorClient::new(echo_transport());
        client.add_request_interceptor(RequestInterceptor::new(|o| Ok(o.with_header("x-trace", "1"))));
        client.add_request_interceptor(RequestInterceptor::new(|o| {
            let seen = o.headers.get("x-trace").cloned().unwrap_or_default();
            Ok(o.with_header("x-trace", format!("{seen}2")))
        }));
        let res = client.get("/pets").await.unwrap();
        assert_eq!(res.data.to_json().unwrap()["headers"]["x-trace"], "12");
    }

    #[tokio::test]
    async fn failing_request_interceptor_aborts_or_recovers() {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let client = InterceptorClient::new(Arc::new(move |request: RequestOptions| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, RequestError>(HttpResponse::new(request, 200, ResponseBody::Empty)) }
        }));
        let failing = client.add_request_interceptor(RequestInterceptor::new(|_| {
            Err(RequestError::Configuration("missing token".into()))
        }));
        let err = client.get("/pets").await.unwrap_err();
        assert!(matches!(err, RequestError::Configuration(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        client.remove_interceptor(failing);
        client.add_request_interceptor(
            RequestInterceptor::new(|_| Err(RequestError::Configuration("missing token".into())))
                .on_rejected(|_| Ok(RequestOptions::get("/fallback"))),
        );
        let res = client.get("/pets").await.unwrap();
        assert_eq!(res.config.url, "/fallback");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn error_status_is_normalized_for_response_interceptors() {
        let client = InterceptorClient::new(status_transport(404));
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let seen_in = seen.clone();
        client.add_response_interceptor(ResponseInterceptor::on_error(move |err| {
            *seen_in.lock() = Some(err.clone());
            Err(err)
        }));
        let err = client.get("/pets/9").await.unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert_eq!(err.code(), Some("ERR_BAD_REQUEST"));
        let http = seen.lock().clone().unwrap();
        assert_eq!(http.as_http().unwrap().details, Some(json!({"error": "nope"})));
    }

    #[tokio::test]
    async fn response_interceptor_can_recover() {
        let client = InterceptorClient::new(status_transport(503));
        client.add_response_interceptor(ResponseInterceptor::on_error(|_| {
            Ok(HttpResponse::new(RequestOptions::get("/cached"), 200, ResponseBody::from("stale")))
        }));
        client.add_response_interceptor(ResponseInterceptor::new(|r| Ok(r.with_header("x-seen", "yes"))));
        let res = client.get("/pets").await.unwrap();
        assert_eq!(res.data, ResponseBody::Text("stale".into()));
        assert_eq!(res.headers.get("x-seen").map(String::as_str), Some("yes"));
    }

    #[test]
    fn remove_unknown_interceptor_is_noop() {
        let client = InterceptorClient::new(echo_transport());
        let a = client.add_request_interceptor(RequestInterceptor::new(Ok));
        let b = client.add_response_interceptor(ResponseInterceptor::new(Ok));
        assert_ne!(a, b);
        assert!(client.remove_interceptor(b));
        assert!(!client.remove_interceptor(b));
        assert!(!client.remove_interceptor(InterceptorId(999)));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_and_cancellation_reject_the_call() {
        let slow: Arc<dyn Transport> = Arc::new(|request: RequestOptions| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, RequestError>(HttpResponse::new(request, 200, ResponseBody::Empty))
        });
        let client = InterceptorClient::new(slow);

        let err = client
            .request(RequestOptions::get("/slow").with_timeout(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("ETIMEDOUT"));

        let token = CancellationToken::new();
        let req = RequestOptions::get("/slow").with_signal(token.signal());
        let call = client.request(req);
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel("user navigated away");
        };
        let (out, ()) = tokio::join!(call, cancel);
        assert_eq!(out.unwrap_err().cancellation_reason(), Some("user navigated away"));

        let err = client
            .request(RequestOptions::get("/slow").with_signal(token.signal()))
            .await
            .unwrap_err();
        assert!(err.is_cancelled(), "already-cancelled signal never reaches the transport");
    }
}
