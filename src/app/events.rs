//! Application event handling
//!
//! Producers (proxy connections, flow runs) push typed events into a bounded
//! channel; a single observer task drains it.

use std::net::SocketAddr;
use tokio::sync::mpsc;

use crate::flow::{ExecutionResult, RunStatus};
use crate::fuzzer::FuzzResult;
use crate::http::HttpTransaction;

/// Application events
#[derive(Debug, Clone)]
pub enum AppEvent {
    /// Proxy listener bound
    ProxyStarted { addr: SocketAddr },

    /// Proxy listener closed and connections drained
    ProxyStopped,

    /// A transaction was captured by the proxy
    NewTransaction(HttpTransaction),

    /// A captured transaction completed or failed
    TransactionUpdate(HttpTransaction),

    /// A transaction is paused waiting for the operator
    InterceptQueued { id: u64, transaction: HttpTransaction },

    /// A flow run began
    FlowStarted { flow_id: String, run_id: String },

    /// A step finished; carries every result recorded so far
    StepExecuted {
        flow_id: String,
        run_id: String,
        step_index: usize,
        results: Vec<ExecutionResult>,
    },

    /// A running fuzz step collected more results
    FuzzUpdate {
        flow_id: String,
        step_id: String,
        results: Vec<FuzzResult>,
    },

    /// A flow run reached a terminal state
    FlowFinished {
        flow_id: String,
        run_id: String,
        status: RunStatus,
        error: Option<String>,
    },
}

impl AppEvent {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            AppEvent::ProxyStarted { .. } => "proxy_started",
            AppEvent::ProxyStopped => "proxy_stopped",
            AppEvent::NewTransaction(_) => "new_transaction",
            AppEvent::TransactionUpdate(_) => "transaction_update",
            AppEvent::InterceptQueued { .. } => "intercept_queued",
            AppEvent::FlowStarted { .. } => "flow_started",
            AppEvent::StepExecuted { .. } => "step_executed",
            AppEvent::FuzzUpdate { .. } => "fuzz_update",
            AppEvent::FlowFinished { .. } => "flow_finished",
        }
    }
}

/// Sending side of the event channel
///
/// Cloned into every producer. A sink with no receiver discards events.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Option<mpsc::Sender<AppEvent>>,
}

impl EventSink {
    /// Create a sink and the receiver the observer drains
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<AppEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that drops everything
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Send an event, waiting for room in the channel
    pub async fn emit(&self, event: AppEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(e) = tx.send(event).await {
            tracing::debug!(kind = e.0.kind(), "Event observer gone, dropping event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (sink, mut rx) = EventSink::channel(8);
        sink.emit(AppEvent::ProxyStopped).await;
        sink.emit(AppEvent::FlowStarted {
            flow_id: "f".into(),
            run_id: "r".into(),
        })
        .await;

        assert_eq!(rx.recv().await.unwrap().kind(), "proxy_stopped");
        assert_eq!(rx.recv().await.unwrap().kind(), "flow_started");
    }

    #[tokio::test]
    async fn test_closed_and_disabled_sinks_do_not_fail() {
        let (sink, rx) = EventSink::channel(1);
        drop(rx);
        sink.emit(AppEvent::ProxyStopped).await;
        EventSink::disabled().emit(AppEvent::ProxyStopped).await;
    }
}
