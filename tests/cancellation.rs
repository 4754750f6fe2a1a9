mod common;

use common::{HangingTransport, ScriptedTransport};
use egress_guard::{
    CancelReason, CancellationToken, Request, RequestError, RequestExecutor, RequestOptions,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn cancel_reason(err: &RequestError) -> Option<CancelReason> {
    match err {
        RequestError::Cancelled { reason, .. } => Some(*reason),
        _ => None,
    }
}

#[tokio::test(start_paused = true)]
async fn token_stops_retries_during_backoff() {
    let transport = ScriptedTransport::status(503);
    let executor = RequestExecutor::builder()
        .transport(transport.clone())
        .retry_delay(Duration::from_secs(10))
        .build()
        .unwrap();
    let token = CancellationToken::new();

    let call = executor.request(Request::get("/v1/x"), RequestOptions::new().cancellation(token.clone()));
    let cancel = async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();
    };
    let (result, ()) = tokio::join!(call, cancel);

    let err = result.unwrap_err();
    assert_eq!(cancel_reason(&err), Some(CancelReason::Token));
    assert_eq!(err.attempts(), 1);
    assert_eq!(transport.calls(), 1);
    assert!(executor.in_flight().is_empty());
}

#[tokio::test(start_paused = true)]
async fn deadline_bounds_the_whole_call() {
    let transport = HangingTransport::default();
    let executor = RequestExecutor::builder()
        .transport(transport.clone())
        .timeout(Duration::from_secs(60))
        .build()
        .unwrap();

    let started = Instant::now();
    let err = executor
        .request(Request::get("/v1/slow"), RequestOptions::new().deadline(Duration::from_secs(3)))
        .await
        .unwrap_err();

    assert_eq!(cancel_reason(&err), Some(CancelReason::DeadlineElapsed));
    assert_eq!(started.elapsed(), Duration::from_secs(3));
    assert_eq!(transport.calls(), 1);
    assert!(executor.in_flight().is_empty());
}

#[tokio::test]
async fn cancelled_token_prevents_dispatch() {
    let transport = ScriptedTransport::status(200);
    let executor = RequestExecutor::builder().transport(transport.clone()).build().unwrap();
    let token = CancellationToken::new();
    token.cancel();

    let err = executor
        .request(Request::get("/v1/x"), RequestOptions::new().cancellation(token))
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(err.attempts(), 0);
    assert_eq!(transport.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancellation_does_not_roll_back_windows() {
    let transport = ScriptedTransport::new(
        egress_guard::Response::new(429).header("Retry-After", "30"),
    );
    let executor = RequestExecutor::builder().transport(transport.clone()).build().unwrap();

    let err = executor
        .request(Request::get("/v1/y"), RequestOptions::new().deadline(Duration::from_secs(1)))
        .await
        .unwrap_err();
    assert_eq!(cancel_reason(&err), Some(CancelReason::DeadlineElapsed));
    assert!(executor.rate_limits().is_limited("/v1/y"));
}

#[tokio::test(start_paused = true)]
async fn dropped_call_releases_its_tracked_entry() {
    let executor = Arc::new(
        RequestExecutor::builder()
            .transport(HangingTransport::default())
            .timeout(Duration::from_secs(3600))
            .build()
            .unwrap(),
    );

    let task = tokio::spawn({
        let executor = executor.clone();
        async move { executor.request(Request::get("/v1/hang"), RequestOptions::new()).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(executor.in_flight().len(), 1);

    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());
    assert!(executor.in_flight().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unbounded_deadline_behaves_like_no_deadline() {
    let transport = ScriptedTransport::status(200).then_status(503);
    let executor = RequestExecutor::builder()
        .transport(transport.clone())
        .retry_delay(Duration::from_secs(1))
        .build()
        .unwrap();

    let response = executor
        .request(Request::get("/v1/x"), RequestOptions::new().deadline(Duration::MAX))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(transport.calls(), 2);
}
