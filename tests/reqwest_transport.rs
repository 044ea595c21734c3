//! The reqwest adapter against a wiremock server.
#![cfg(feature = "reqwest")]

use reqpolicy::{
    create_client, CacheConfig, HttpClient, InterceptorClient, Jitter, PolicyClient, RecordingSleeper,
    RequestOptions, RequestRetry, ResponseBody, ResponseType, RetryConfig, TransportKind,
};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client() -> InterceptorClient {
    create_client(TransportKind::default()).unwrap()
}

#[tokio::test]
async fn cached_get_hits_the_server_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pets"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "id": 1 }])))
        .expect(1)
        .mount(&server)
        .await;

    let policy = PolicyClient::builder(client()).with_cache(CacheConfig::enabled()).build();
    let url = format!("{}/pets", server.uri());

    let first = policy.get(&url).await.unwrap();
    assert_eq!(first.status, 200);
    assert_eq!(first.status_text, "OK");
    assert_eq!(first.data, ResponseBody::Json(json!([{ "id": 1 }])));

    let second = policy.get(&url).await.unwrap();
    assert_eq!(second.data, first.data);
}

#[tokio::test]
async fn error_status_is_normalized_with_body_details() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pets/42"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "error": "not found" })))
        .mount(&server)
        .await;

    let err = client().get(&format!("{}/pets/42", server.uri())).await.unwrap_err();
    let http = err.as_http().unwrap();
    assert_eq!(http.status, Some(404));
    assert_eq!(http.code.as_deref(), Some("ERR_BAD_REQUEST"));
    assert_eq!(http.message, "Request failed with status code 404");
    assert_eq!(http.status_text.as_deref(), Some("Not Found"));
    assert_eq!(http.details, Some(json!({ "error": "not found" })));
}

#[tokio::test]
async fn unavailable_server_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_string("up"))
        .expect(1)
        .mount(&server)
        .await;

    let sleeper = RecordingSleeper::new();
    let policy = PolicyClient::builder(client())
        .with_retry_policy(
            RequestRetry::new(RetryConfig::enabled())
                .with_sleeper(sleeper.clone())
                .with_jitter(Jitter::None),
        )
        .build();

    let res = policy
        .request(RequestOptions::get(format!("{}/health", server.uri())).with_response_type(ResponseType::Text))
        .await
        .unwrap();
    assert_eq!(res.data, ResponseBody::Text("up".into()));
    assert_eq!(sleeper.calls().len(), 2);
}

#[tokio::test]
async fn params_headers_and_body_reach_the_server() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pets"))
        .and(query_param("dryRun", "true"))
        .and(header("x-api-key", "secret"))
        .and(body_json(json!({ "name": "rex" })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": 7 })))
        .expect(1)
        .mount(&server)
        .await;

    let res = client()
        .request(
            RequestOptions::post(format!("{}/pets", server.uri()))
                .with_param("dryRun", "true")
                .with_header("x-api-key", "secret")
                .with_data(json!({ "name": "rex" })),
        )
        .await
        .unwrap();
    assert_eq!(res.status, 201);
    assert_eq!(res.json::<serde_json::Value>().unwrap(), json!({ "id": 7 }));
}

#[tokio::test]
async fn slow_response_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let err = client()
        .request(RequestOptions::get(server.uri()).with_timeout(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some("ETIMEDOUT"));
}

#[tokio::test]
async fn binary_bodies_stay_bytes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/photo"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0xff, 0xd8, 0xff]))
        .mount(&server)
        .await;

    let res = client()
        .request(
            RequestOptions::get(format!("{}/photo", server.uri())).with_response_type(ResponseType::Blob),
        )
        .await
        .unwrap();
    assert_eq!(res.data, ResponseBody::Binary(bytes::Bytes::from_static(&[0xff, 0xd8, 0xff])));
}
