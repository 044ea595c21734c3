#![allow(dead_code)]

use reqpolicy::{HttpError, HttpResponse, RequestError, RequestOptions, ResponseBody, Transport};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Transport answering every request with a fixed status and body, counting calls.
#[derive(Clone)]
pub struct MockTransport {
    calls: Arc<AtomicUsize>,
    status: u16,
    body: Value,
    latency: Duration,
    failures: Arc<AtomicUsize>,
}

impl MockTransport {
    pub fn ok(body: Value) -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            status: 200,
            body,
            latency: Duration::ZERO,
            failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail the first `n` calls with a network error.
    pub fn failing_first(self, n: usize) -> Self {
        self.failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn shared(&self) -> Arc<dyn Transport> {
        Arc::new(self.clone())
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: RequestOptions) -> Result<HttpResponse, RequestError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let should_fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(HttpError::network("Network Error").into());
        }
        Ok(HttpResponse::new(request, self.status, ResponseBody::Json(self.body.clone())))
    }
}
