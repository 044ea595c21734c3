mod common;

use common::MockTransport;
use reqpolicy::telemetry::{CacheEvent, MemorySink, PolicyEvent, RequestOutcome};
use reqpolicy::{
    BatchConfig, CacheConfig, CancellationToken, DebounceConfig, HttpClient, HttpResponse, InterceptorClient, Jitter,
    PolicyClient, RecordingSleeper, RequestError, RequestInterceptor, RequestOptions, RequestRetry, ResponseBody,
    RetryConfig, ThrottleConfig, Transport,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{advance, Instant};

#[tokio::test(start_paused = true)]
async fn cached_get_is_served_until_ttl_expires() {
    let transport = MockTransport::ok(json!({ "id": 1 }));
    let client = PolicyClient::builder(InterceptorClient::new(transport.shared()))
        .with_cache(CacheConfig::enabled().with_ttl(Duration::from_millis(50)))
        .build();

    let first = client.get("/pets").await.unwrap();
    assert_eq!(first.status, 200);
    assert_eq!(first.data, ResponseBody::Json(json!({ "id": 1 })));

    advance(Duration::from_millis(20)).await;
    let second = client.get("/pets").await.unwrap();
    assert_eq!(second.data, first.data);
    assert_eq!(transport.calls(), 1);

    advance(Duration::from_millis(40)).await;
    client.get("/pets").await.unwrap();
    assert_eq!(transport.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn debounced_calls_collapse_to_the_last_one() {
    let transport = MockTransport::ok(json!([]));
    let client = PolicyClient::builder(InterceptorClient::new(transport.shared()))
        .with_debounce(DebounceConfig::enabled().with_delay(Duration::from_millis(300)))
        .build();
    let start = Instant::now();

    let c = client.clone();
    let first = tokio::spawn(async move { c.get("/search?q=cat").await });
    tokio::task::yield_now().await;
    advance(Duration::from_millis(100)).await;

    let c = client.clone();
    let second = tokio::spawn(async move {
        let res = c.get("/search?q=cat").await;
        (res, Instant::now())
    });

    let err = first.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
    let (res, done_at) = second.await.unwrap();
    assert_eq!(res.unwrap().status, 200);
    let waited = done_at - start;
    assert!(waited >= Duration::from_millis(400) && waited < Duration::from_millis(410), "{waited:?}");
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn retried_response_is_cached_once_it_succeeds() {
    let transport = MockTransport::ok(json!({ "ok": true })).failing_first(2);
    let sleeper = RecordingSleeper::new();
    let client = PolicyClient::builder(InterceptorClient::new(transport.shared()))
        .with_cache(CacheConfig::enabled())
        .with_retry_policy(
            RequestRetry::new(RetryConfig::enabled())
                .with_sleeper(sleeper.clone())
                .with_jitter(Jitter::None),
        )
        .build();

    assert_eq!(client.get("/flaky").await.unwrap().status, 200);
    assert_eq!(transport.calls(), 3);
    assert_eq!(sleeper.calls(), vec![Duration::from_millis(1000), Duration::from_millis(2000)]);

    client.get("/flaky").await.unwrap();
    assert_eq!(transport.calls(), 3);
}

#[tokio::test]
async fn error_responses_are_not_cached() {
    let transport = MockTransport::ok(json!({ "message": "boom" })).with_status(500);
    let client = PolicyClient::builder(InterceptorClient::new(transport.shared()))
        .with_cache(CacheConfig::enabled())
        .build();

    for _ in 0..2 {
        let err = client.get("/pets").await.unwrap_err();
        assert_eq!(err.status(), Some(500));
        assert_eq!(err.code(), Some("ERR_BAD_RESPONSE"));
    }
    assert_eq!(transport.calls(), 2);
    assert!(client.cache().map_or(false, |c| c.is_empty()));
}

#[tokio::test(start_paused = true)]
async fn throttled_client_defers_past_the_limit() {
    let transport = MockTransport::ok(json!({}));
    let client = PolicyClient::builder(InterceptorClient::new(transport.shared()))
        .with_throttling(ThrottleConfig::enabled().with_limit(2).with_interval(Duration::from_secs(1)))
        .build();
    let start = Instant::now();

    let results = futures::future::join_all((0..3).map(|i| {
        let client = client.clone();
        async move {
            let res = client.get(&format!("/pets/{i}")).await;
            (res, Instant::now())
        }
    }))
    .await;

    assert_eq!(transport.calls(), 3);
    assert!(results.iter().all(|(res, _)| res.is_ok()));
    assert_eq!(results[0].1, start);
    assert_eq!(results[1].1, start);
    assert!(results[2].1 - start >= Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn batched_requests_keep_their_own_results() {
    let transport: Arc<dyn Transport> = Arc::new(|request: RequestOptions| async move {
        let status = if request.url.ends_with("id=2") { 404 } else { 200 };
        Ok::<_, RequestError>(HttpResponse::new(request, status, ResponseBody::Empty))
    });
    let client = PolicyClient::builder(InterceptorClient::new(transport))
        .with_batching(BatchConfig::enabled())
        .build();

    let (found, missing) = tokio::join!(client.get("/pets?id=1"), client.get("/pets?id=2"));
    let found = found.unwrap();
    assert_eq!(found.status, 200);
    assert_eq!(found.config.url, "/pets?id=1");
    let missing = missing.unwrap_err();
    assert_eq!(missing.status(), Some(404));
    assert_eq!(missing.as_http().map(|e| e.message.as_str()), Some("Request failed with status code 404"));
    assert_eq!(client.batcher().map(|b| b.pending_batches()), Some(0));
}

#[tokio::test(start_paused = true)]
async fn cancelling_one_batched_request_spares_the_rest() {
    let transport = MockTransport::ok(json!({ "ok": true })).with_latency(Duration::from_millis(100));
    let client = PolicyClient::builder(InterceptorClient::new(transport.shared()))
        .with_batching(BatchConfig::enabled())
        .build();
    let token = CancellationToken::new();

    let (a, b, _) = tokio::join!(
        client.request(RequestOptions::get("/pets?id=1").with_signal(token.signal())),
        client.get("/pets?id=2"),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel("only a");
        },
    );
    assert_eq!(a.unwrap_err().cancellation_reason(), Some("only a"));
    let b = b.unwrap();
    assert_eq!(b.status, 200);
    assert_eq!(b.data, ResponseBody::Json(json!({ "ok": true })));
    assert_eq!(transport.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn cancelled_request_leaves_the_throttle_queue() {
    let transport = MockTransport::ok(json!({}));
    let client = PolicyClient::builder(InterceptorClient::new(transport.shared()))
        .with_throttling(ThrottleConfig::enabled().with_limit(1).with_interval(Duration::from_secs(60)))
        .build();
    client.get("/pets/1").await.unwrap();

    let token = CancellationToken::new();
    let c = client.clone();
    let queued = tokio::spawn({
        let signal = token.signal();
        async move { c.request(RequestOptions::get("/pets/2").with_signal(signal)).await }
    });
    tokio::task::yield_now().await;
    let throttler = client.throttler().unwrap();
    assert_eq!(throttler.queue_len(), 1);

    let start = Instant::now();
    token.cancel("user left");
    let err = queued.await.unwrap().unwrap_err();
    assert_eq!(err.cancellation_reason(), Some("user left"));
    assert_eq!(start.elapsed(), Duration::ZERO);
    assert_eq!(throttler.queue_len(), 0);
    assert_eq!(throttler.in_window(), 1);
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn plain_client_semantics_without_policies() {
    let transport = MockTransport::ok(json!({ "error": "missing" })).with_status(404);
    let client = PolicyClient::builder(InterceptorClient::new(transport.shared())).build();
    let err = client.get("/pets/9").await.unwrap_err();
    let http = err.as_http().unwrap();
    assert_eq!(http.status, Some(404));
    assert_eq!(http.code.as_deref(), Some("ERR_BAD_REQUEST"));
    assert_eq!(http.details, Some(json!({ "error": "missing" })));
}

#[tokio::test]
async fn interceptors_run_beneath_the_policies() {
    let transport = MockTransport::ok(json!({}));
    let inner = InterceptorClient::new(transport.shared());
    inner.add_request_interceptor(RequestInterceptor::new(|options| {
        Ok(options.with_header("x-trace", "abc"))
    }));
    let client = PolicyClient::builder(inner).with_cache(CacheConfig::enabled()).build();

    let res = client.get("/pets").await.unwrap();
    assert_eq!(res.config.headers.get("x-trace").map(String::as_str), Some("abc"));
}

#[tokio::test]
async fn sink_sees_policy_and_request_events() {
    let transport = MockTransport::ok(json!({}));
    let sink = MemorySink::with_capacity(32);
    let client = PolicyClient::builder(InterceptorClient::new(transport.shared()))
        .with_cache(CacheConfig::enabled())
        .with_sink(Arc::new(sink.clone()))
        .build();

    client.get("/pets").await.unwrap();
    client.get("/pets").await.unwrap();

    let events = sink.events();
    let key = "GET:/pets".to_string();
    assert!(events.contains(&PolicyEvent::Cache(CacheEvent::Miss { key: key.clone() })));
    assert!(events.contains(&PolicyEvent::Cache(CacheEvent::Stored { key: key.clone() })));
    assert!(events.contains(&PolicyEvent::Cache(CacheEvent::Hit { key })));
    let outcomes = events
        .iter()
        .filter(|e| matches!(e, PolicyEvent::Request(RequestOutcome::Success { status: 200, .. })))
        .count();
    assert_eq!(outcomes, 2);
}
