//! Fuzz worker pool
//!
//! Jobs are dispatched under a semaphore so at most `max_concurrent` requests
//! are in flight. Results are collected as tasks finish and reported through
//! the progress callback before the next dispatch, so every update the caller
//! sees happens while `run` is still executing.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use super::results::{FuzzResult, FuzzResultSet};
use crate::app::FuzzerConfig;
use crate::http::{HttpRequest, HttpSender, SendOptions};

/// One prepared request
#[derive(Debug, Clone)]
pub struct FuzzJob {
    /// Payload index in the step's payload list
    pub index: usize,

    /// Processed payload
    pub payload: String,

    /// Request with the payload already applied
    pub request: HttpRequest,
}

/// What a finished run produced
#[derive(Debug, Clone)]
pub struct FuzzOutcome {
    /// Collected results, ordered by payload index
    pub results: FuzzResultSet,

    /// Whether the run was cut short
    pub cancelled: bool,

    /// Wall time in milliseconds
    pub elapsed_ms: u64,
}

/// High-speed fuzzer engine
#[derive(Clone)]
pub struct FuzzEngine {
    sender: HttpSender,

    /// Maximum concurrent requests
    max_concurrent: usize,

    /// How long in-flight requests may finish after cancellation
    cancel_grace: Duration,

    options: SendOptions,
}

impl FuzzEngine {
    pub fn new(sender: HttpSender, config: &FuzzerConfig) -> Self {
        Self {
            sender,
            max_concurrent: config.max_concurrent.max(1),
            cancel_grace: Duration::from_secs(config.cancel_grace_secs),
            options: SendOptions::default().timeout(Duration::from_secs(config.request_timeout_secs)),
        }
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn with_follow_redirects(mut self, follow: bool) -> Self {
        self.options = self.options.follow_redirects(follow);
        self
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Run every job, reporting the accumulated results after each one lands
    pub async fn run<F, Fut>(&self, jobs: Vec<FuzzJob>, cancel: &CancellationToken, mut on_update: F) -> FuzzOutcome
    where
        F: FnMut(Vec<FuzzResult>) -> Fut,
        Fut: Future<Output = ()>,
    {
        let start = Instant::now();
        let total = jobs.len();
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks: JoinSet<FuzzResult> = JoinSet::new();
        let mut results = FuzzResultSet::new();
        let mut cancelled = false;

        tracing::info!(total, max_concurrent = self.max_concurrent, "Fuzz run started");

        for job in jobs {
            while let Some(joined) = tasks.try_join_next() {
                collect(&mut results, joined, &mut on_update).await;
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let sender = self.sender.clone();
            let options = self.options.clone();
            tasks.spawn(async move {
                let _permit = permit;
                send_job(&sender, job, &options).await
            });
        }

        if !cancelled {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        cancelled = true;
                        break;
                    }
                    joined = tasks.join_next() => match joined {
                        Some(joined) => collect(&mut results, joined, &mut on_update).await,
                        None => break,
                    },
                }
            }
        }

        if cancelled {
            tracing::info!(in_flight = tasks.len(), "Fuzz run cancelled, draining in-flight requests");
            let grace = tokio::time::sleep(self.cancel_grace);
            tokio::pin!(grace);
            loop {
                tokio::select! {
                    _ = &mut grace => break,
                    joined = tasks.join_next() => match joined {
                        Some(joined) => collect(&mut results, joined, &mut on_update).await,
                        None => break,
                    },
                }
            }
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        results.finalize();
        let elapsed_ms = start.elapsed().as_millis() as u64;
        tracing::info!(
            total,
            collected = results.len(),
            cancelled,
            elapsed_ms,
            "Fuzz run finished: {}",
            results.summary()
        );

        FuzzOutcome {
            results,
            cancelled,
            elapsed_ms,
        }
    }
}

async fn send_job(sender: &HttpSender, job: FuzzJob, options: &SendOptions) -> FuzzResult {
    match sender.send(&job.request, options).await {
        Ok(transaction) => FuzzResult::from_transaction(job.index, job.payload, &transaction),
        Err(e) => {
            tracing::debug!(index = job.index, error = %e, "Fuzz request failed");
            FuzzResult::failed(job.index, job.payload, e)
        }
    }
}

async fn collect<F, Fut>(results: &mut FuzzResultSet, joined: Result<FuzzResult, JoinError>, on_update: &mut F)
where
    F: FnMut(Vec<FuzzResult>) -> Fut,
    Fut: Future<Output = ()>,
{
    match joined {
        Ok(result) => {
            results.add(result);
            on_update(results.results().to_vec()).await;
        }
        Err(e) if e.is_cancelled() => {}
        Err(e) => tracing::warn!(error = %e, "Fuzz worker panicked"),
    }
}
