#![allow(dead_code)]

use async_trait::async_trait;
use egress_guard::{Request, Response, Transport, TransportError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// One scripted transport outcome.
#[derive(Debug, Clone)]
pub enum Step {
    Respond(Response),
    Fail(TransportError),
}

/// A call observed by [`ScriptedTransport`].
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub endpoint: String,
    /// Time since the transport was created.
    pub at: Duration,
}

/// Transport that replays a fixed script, then repeats a fallback step forever.
#[derive(Debug, Clone)]
pub struct ScriptedTransport {
    steps: Arc<Mutex<VecDeque<Step>>>,
    fallback: Step,
    latency: Duration,
    log: Arc<Mutex<Vec<Dispatch>>>,
    origin: Instant,
}

impl ScriptedTransport {
    pub fn new(fallback: Response) -> Self {
        Self {
            steps: Arc::new(Mutex::new(VecDeque::new())),
            fallback: Step::Respond(fallback),
            latency: Duration::ZERO,
            log: Arc::new(Mutex::new(Vec::new())),
            origin: Instant::now(),
        }
    }

    pub fn status(status: u16) -> Self {
        Self::new(Response::new(status))
    }

    pub fn then(self, response: Response) -> Self {
        self.steps.lock().unwrap().push_back(Step::Respond(response));
        self
    }

    pub fn then_status(self, status: u16) -> Self {
        self.then(Response::new(status))
    }

    pub fn then_fail(self, error: TransportError) -> Self {
        self.steps.lock().unwrap().push_back(Step::Fail(error));
        self
    }

    /// Every call takes this long before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> usize {
        self.log.lock().unwrap().len()
    }

    pub fn dispatches(&self) -> Vec<Dispatch> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: Request) -> Result<Response, TransportError> {
        self.log.lock().unwrap().push(Dispatch {
            endpoint: request.endpoint_key(),
            at: self.origin.elapsed(),
        });
        let step = self.steps.lock().unwrap().pop_front().unwrap_or_else(|| self.fallback.clone());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match step {
            Step::Respond(response) => Ok(response),
            Step::Fail(error) => Err(error),
        }
    }
}

/// Transport whose calls never complete.
#[derive(Debug, Clone, Default)]
pub struct HangingTransport {
    calls: Arc<Mutex<usize>>,
}

impl HangingTransport {
    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl Transport for HangingTransport {
    async fn send(&self, _request: Request) -> Result<Response, TransportError> {
        *self.calls.lock().unwrap() += 1;
        std::future::pending().await
    }
}
