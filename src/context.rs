//! Per-call execution context.
//!
//! A [`Context`] travels with every call through the pipeline. It carries the
//! caller's cancellation signal and deadline, plus the OpenTelemetry context
//! holding the active span. Middlewares never mint their own cancellation
//! source; they only derive children that inherit the parent's.

use opentelemetry::Context as TraceContext;
use tokio::sync::watch;
use tokio::time::Instant;

/// Cancellation, deadline and trace context for one inbound call.
///
/// Cloning is cheap; clones observe the same cancellation signal.
#[derive(Clone, Debug, Default)]
pub struct Context {
    cancel: Option<watch::Receiver<bool>>,
    deadline: Option<Instant>,
    trace: TraceContext,
}

/// The sending half of a cancellable [`Context`]. Dropping it without calling
/// [`cancel`](CancelHandle::cancel) leaves the context live forever.
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

impl Context {
    /// An empty context: never cancelled, no deadline, no active span.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context that is cancelled when the returned handle says so.
    pub fn with_cancel() -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let cx = Self { cancel: Some(rx), ..Self::default() };
        (cx, CancelHandle(tx))
    }

    /// Returns a child expiring at `deadline`, or at the parent's deadline if
    /// that one is earlier.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        });
        self
    }

    /// Returns a child carrying `trace` and the parent's cancellation and deadline.
    pub fn with_trace_context(&self, trace: TraceContext) -> Self {
        Self { cancel: self.cancel.clone(), deadline: self.deadline, trace }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn trace_context(&self) -> &TraceContext {
        &self.trace
    }

    pub fn is_cancelled(&self) -> bool {
        let signalled = self.cancel.as_ref().is_some_and(|rx| *rx.borrow());
        let expired = self.deadline.is_some_and(|d| Instant::now() >= d);
        signalled || expired
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn cancelled(&self) {
        let signal = async {
            match self.cancel.clone() {
                // A dropped sender can never cancel.
                Some(mut rx) => {
                    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
                None => std::future::pending::<()>().await,
            }
        };

        match self.deadline {
            Some(deadline) => tokio::select! {
                () = signal => {}
                () = tokio::time::sleep_until(deadline) => {}
            },
            None => signal.await,
        }
    }
}
