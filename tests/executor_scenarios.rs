mod common;

use common::ScriptedTransport;
use egress_guard::{
    InstantSleeper, Request, RequestError, RequestExecutor, RequestOptions, Response,
    ServiceTransport, TransportError, TransportErrorKind,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn server_error_then_success_returns_the_success_body() {
    let transport =
        ScriptedTransport::status(200).then_status(500).then(Response::new(200).body("hello"));
    let executor = RequestExecutor::builder()
        .transport(transport.clone())
        .max_retries(2)
        .retry_delay(Duration::from_millis(10))
        .build()
        .unwrap();

    let response = executor
        .request(Request::get("https://api.example.com/v1/x"), RequestOptions::new())
        .await
        .expect("second attempt succeeds");

    assert_eq!(response.body, b"hello".to_vec());
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn client_error_is_not_retried() {
    let transport = ScriptedTransport::status(400);
    let executor = RequestExecutor::builder()
        .transport(transport.clone())
        .with_sleeper(InstantSleeper)
        .build()
        .unwrap();

    let err = executor
        .request(Request::post("https://api.example.com/v1/z"), RequestOptions::new())
        .await
        .unwrap_err();

    assert!(err.is_client_error());
    assert_eq!(err.status(), Some(400));
    assert_eq!(err.attempts(), 1);
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn breaker_opens_after_threshold_and_skips_transport() {
    let transport = ScriptedTransport::status(503);
    let executor = RequestExecutor::builder()
        .transport(transport.clone())
        .failure_threshold(3)
        .with_sleeper(InstantSleeper)
        .build()
        .unwrap();
    let options = || RequestOptions::new().service_key("svc").max_retries(0);

    for _ in 0..3 {
        let err = executor.request(Request::get("/v1/w"), options()).await.unwrap_err();
        assert!(err.is_retries_exhausted());
    }
    assert_eq!(transport.calls(), 3);

    let err = executor.request(Request::get("/v1/w"), options()).await.unwrap_err();
    assert!(err.is_circuit_open());
    assert!(err.is_temporarily_unavailable());
    assert_eq!(err.service_key(), "svc");
    assert_eq!(err.endpoint(), "/v1/w");
    assert_eq!(err.attempts(), 0);
    assert!(err.to_string().contains("GET /v1/w [svc]"));
    assert_eq!(transport.calls(), 3, "rejected call must not reach the transport");

    // Other services are unaffected.
    let err = executor
        .request(Request::get("/v1/w"), RequestOptions::new().service_key("other").max_retries(0))
        .await
        .unwrap_err();
    assert!(err.is_retries_exhausted());
    assert_eq!(transport.calls(), 4);
}

#[tokio::test]
async fn persistent_failure_makes_exactly_n_plus_one_attempts() {
    for max_retries in [0usize, 1, 4] {
        let transport = ScriptedTransport::status(502);
        let executor = RequestExecutor::builder()
            .transport(transport.clone())
            .with_sleeper(InstantSleeper)
            .build()
            .unwrap();

        let err = executor
            .request(Request::get("/v1/x"), RequestOptions::new().max_retries(max_retries))
            .await
            .unwrap_err();

        assert_eq!(transport.calls(), max_retries + 1);
        match err {
            RequestError::RetriesExhausted { context, last } => {
                assert_eq!(context.attempts, max_retries + 1);
                assert!(matches!(*last, RequestError::Server { status: 502, .. }));
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn transport_failures_exhaust_into_transport_error() {
    let transport = ScriptedTransport::status(200)
        .then_fail(TransportError::no_response("empty reply"))
        .then_fail(TransportError::connection_aborted("reset"));
    let executor = RequestExecutor::builder()
        .transport(transport.clone())
        .with_sleeper(InstantSleeper)
        .build()
        .unwrap();

    let err = executor
        .request(Request::get("/v1/x"), RequestOptions::new().max_retries(1))
        .await
        .unwrap_err();

    match err {
        RequestError::RetriesExhausted { last, .. } => match *last {
            RequestError::Transport { source, .. } => {
                assert_eq!(source.kind, TransportErrorKind::ConnectionAborted)
            }
            other => panic!("expected Transport, got {other:?}"),
        },
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn custom_retry_status_set_is_honoured() {
    let transport = ScriptedTransport::status(200).then_status(408).then_status(503);
    let executor = RequestExecutor::builder()
        .transport(transport.clone())
        .retry_status_codes([408, 429])
        .with_sleeper(InstantSleeper)
        .build()
        .unwrap();

    let err = executor.request(Request::get("/v1/x"), RequestOptions::new()).await.unwrap_err();
    assert!(matches!(err, RequestError::Server { status: 503, .. }));
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn tower_service_can_act_as_transport() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let service = tower::service_fn(move |req: Request| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            assert_eq!(req.endpoint_key(), "/v1/items");
            if n == 0 {
                Ok::<_, TransportError>(Response::new(503))
            } else {
                Ok(Response::new(204))
            }
        }
    });
    let executor = RequestExecutor::builder()
        .transport(ServiceTransport::new(service))
        .with_sleeper(InstantSleeper)
        .build()
        .unwrap();

    let response = executor
        .request(Request::get("https://api.example.com/v1/items?page=2"), RequestOptions::new())
        .await
        .unwrap();
    assert_eq!(response.status, 204);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}
