mod common;

use common::ScriptedTransport;
use egress_guard::{InstantSleeper, Request, RequestExecutor, RequestOptions};
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriter};

#[derive(Clone)]
struct SharedWriter(Arc<Mutex<Vec<u8>>>);

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedGuard;
    fn make_writer(&'a self) -> Self::Writer {
        SharedGuard(self.0.clone())
    }
}

struct SharedGuard(Arc<Mutex<Vec<u8>>>);
impl std::io::Write for SharedGuard {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.0.lock().unwrap();
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn retries_and_breaker_transitions_are_logged() {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let subscriber = tracing_subscriber::fmt()
        .with_writer(BoxMakeWriter::new(SharedWriter(buffer.clone())))
        .with_max_level(tracing::Level::DEBUG)
        .with_target(true)
        .with_ansi(false)
        .without_time()
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let executor = RequestExecutor::builder()
        .transport(ScriptedTransport::status(503))
        .failure_threshold(1)
        .with_sleeper(InstantSleeper)
        .build()
        .unwrap();
    executor
        .request(Request::get("/v1/x"), RequestOptions::new().service_key("svc").max_retries(1))
        .await
        .unwrap_err();

    let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
    assert!(logs.contains("egress_guard::executor"), "executor target missing: {logs}");
    assert!(logs.contains("retrying after failure"));
    assert!(logs.contains("retries exhausted"));
    assert!(logs.contains("service_key=svc"));
    assert!(logs.contains("egress_guard::circuit_breaker"));
    assert!(logs.contains("circuit breaker → open"));
}
