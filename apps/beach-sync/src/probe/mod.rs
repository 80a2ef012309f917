//! Endpoint discovery.
//!
//! [`Prober::probe`] cycles through candidate endpoints round-robin until one
//! passes both the liveness check and the capability fetch. Every failure
//! advances one shared backoff, so the candidate for attempt `n` is
//! `candidates[n % len]` and the delay keeps growing across candidates.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

mod backend;
mod backoff;
mod endpoint;

pub use backend::{ClientErrorReport, ProbeBackend, ProbeFailure, ReqwestProbeBackend};
pub use backoff::{Backoff, Jitter};
pub use endpoint::{CAPABILITY_PATH, Endpoint, EndpointError, HEALTH_PATH, STREAM_PATH};

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    /// Consecutive failures between two threshold reports. Zero disables them.
    pub retry_threshold: u32,
    pub jitter: Jitter,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            retry_threshold: 6,
            jitter: Jitter::Random,
        }
    }
}

impl ProbeConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.min_backoff, self.max_backoff).with_jitter(self.jitter)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeEvent {
    /// An attempt failed; the next one starts after `delay`.
    Retry {
        attempt: u32,
        endpoint_index: usize,
        message: String,
        delay: Duration,
    },
    ThresholdCrossed(ClientErrorReport),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub index: usize,
    pub endpoint: Endpoint,
    pub capabilities: Value,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    #[error("probe cancelled")]
    Cancelled,
    #[error("no endpoint candidates to probe")]
    NoCandidates,
    #[error("probe task failed: {0}")]
    Task(String),
}

#[derive(Clone)]
pub struct Prober {
    backend: Arc<dyn ProbeBackend>,
    config: ProbeConfig,
    events: Option<mpsc::UnboundedSender<ProbeEvent>>,
}

impl Prober {
    pub fn new(backend: Arc<dyn ProbeBackend>, config: ProbeConfig) -> Self {
        Self {
            backend,
            config,
            events: None,
        }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<ProbeEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Starts probing on a new task. Backoff state is fresh per call.
    pub fn probe(&self, candidates: Vec<Endpoint>) -> ProbeHandle {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let run = ProbeRun {
            backend: self.backend.clone(),
            backoff: self.config.backoff(),
            retry_threshold: self.config.retry_threshold,
            events: self.events.clone(),
            candidates,
        };
        ProbeHandle {
            task: tokio::spawn(run.run(cancel_rx)),
            cancel: cancel_tx,
        }
    }
}

/// Pending probe. Await it for the outcome; dropping it cancels the probe.
pub struct ProbeHandle {
    task: JoinHandle<Result<ProbeOutcome, ProbeError>>,
    cancel: watch::Sender<bool>,
}

impl ProbeHandle {
    /// Stops the probe; the handle resolves to [`ProbeError::Cancelled`].
    /// A no-op once the probe has completed.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Future for ProbeHandle {
    type Output = Result<ProbeOutcome, ProbeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.task).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(err)) => Poll::Ready(Err(ProbeError::Task(err.to_string()))),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct ProbeRun {
    backend: Arc<dyn ProbeBackend>,
    backoff: Backoff,
    retry_threshold: u32,
    events: Option<mpsc::UnboundedSender<ProbeEvent>>,
    candidates: Vec<Endpoint>,
}

impl ProbeRun {
    async fn run(mut self, mut cancel: watch::Receiver<bool>) -> Result<ProbeOutcome, ProbeError> {
        if self.candidates.is_empty() {
            return Err(ProbeError::NoCandidates);
        }
        loop {
            let index = self.backoff.attempts() as usize % self.candidates.len();
            let endpoint = self.candidates[index].clone();

            let result = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => return Err(self.cancelled()),
                result = probe_endpoint(self.backend.as_ref(), &endpoint) => result,
            };

            let failure = match result {
                Ok(capabilities) => {
                    info!(
                        target = "beach_sync::probe",
                        endpoint = %endpoint,
                        index,
                        attempts = self.backoff.attempts() + 1,
                        "endpoint is live"
                    );
                    return Ok(ProbeOutcome {
                        index,
                        endpoint,
                        capabilities,
                        attempts: self.backoff.attempts() + 1,
                    });
                }
                Err(failure) => failure,
            };

            let delay = self.backoff.next_delay();
            let attempt = self.backoff.attempts();
            warn!(
                target = "beach_sync::probe",
                endpoint = %endpoint,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "probe attempt failed"
            );
            self.emit(ProbeEvent::Retry {
                attempt,
                endpoint_index: index,
                message: failure.message(),
                delay,
            });
            if self.retry_threshold > 0 && attempt % self.retry_threshold == 0 {
                self.emit(ProbeEvent::ThresholdCrossed(failure.report()));
            }

            tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => return Err(self.cancelled()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn emit(&self, event: ProbeEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn cancelled(&self) -> ProbeError {
        debug!(
            target = "beach_sync::probe",
            attempts = self.backoff.attempts(),
            "probe cancelled"
        );
        ProbeError::Cancelled
    }
}

/// Liveness and capability requests run concurrently; both must succeed.
async fn probe_endpoint(backend: &dyn ProbeBackend, endpoint: &Endpoint) -> Result<Value, ProbeFailure> {
    let health = endpoint.health_url().map_err(|err| setup_failure(endpoint, err))?;
    let capability = endpoint
        .capability_url()
        .map_err(|err| setup_failure(endpoint, err))?;
    let ((), capabilities) = tokio::try_join!(
        backend.check_health(&health),
        backend.fetch_capabilities(&capability)
    )?;
    Ok(capabilities)
}

fn setup_failure(endpoint: &Endpoint, err: EndpointError) -> ProbeFailure {
    ProbeFailure::Setup {
        path: endpoint.path_prefix().to_string(),
        detail: err.to_string(),
    }
}

/// Resolves once cancellation is requested or the handle is dropped.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}
