use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedSender;

use crate::pipes::Fulfillment;

/// Typed job error classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Timeout,
    Server,
    Application,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout_error",
            ErrorKind::Server => "server_error",
            ErrorKind::Application => "application_error",
        }
    }
}

/// User-supplied execution policy.
#[derive(Debug, Clone, Default)]
pub struct JobPolicy {
    /// Per-job heartbeat timeout in seconds. Zero means no override; the
    /// profile's heartbeat timeout applies.
    pub timeout: f64,
}

/// One unit of work dispatched to a slave.
///
/// A job references its owning request by id only, so a request cleared by
/// reload cannot leave a dangling pointer: the fulfillment simply lands
/// as a logged orphan.
///
/// # Terminal Protocol
///
/// A job emits exactly one choke, possibly preceded by one error,
/// regardless of the exit path. The fulfillment for the owning request
/// part is sent on the choke: the recorded error if there is one, the
/// accumulated chunks otherwise.
#[derive(Debug)]
pub struct Job {
    event: String,
    policy: JobPolicy,
    future: String,
    target: String,
    chunks: Vec<Value>,
    error: Option<(ErrorKind, String)>,
    completed: bool,
    futures: UnboundedSender<Fulfillment>,
}

impl Job {
    pub fn new(
        event: impl Into<String>,
        policy: JobPolicy,
        future: impl Into<String>,
        target: impl Into<String>,
        futures: UnboundedSender<Fulfillment>,
    ) -> Self {
        Self {
            event: event.into(),
            policy,
            future: future.into(),
            target: target.into(),
            chunks: Vec::new(),
            error: None,
            completed: false,
            futures,
        }
    }

    /// Builds a job from per-target request arguments: `event` names the
    /// job, `timeout` overrides the heartbeat timeout when positive.
    pub fn from_args(
        args: &Value,
        future: &str,
        target: &str,
        futures: UnboundedSender<Fulfillment>,
    ) -> Self {
        let event = args.get("event").and_then(Value::as_str).unwrap_or("");
        let timeout = args.get("timeout").and_then(Value::as_f64).unwrap_or(0.0);

        Self::new(
            event,
            JobPolicy { timeout },
            future,
            target,
            futures,
        )
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn policy(&self) -> &JobPolicy {
        &self.policy
    }

    pub fn future(&self) -> &str {
        &self.future
    }

    /// Accumulates one output chunk.
    pub fn process_chunk(&mut self, value: Value) {
        if self.completed {
            tracing::warn!(event = %self.event, "chunk after completion ignored");
            return;
        }
        self.chunks.push(value);
    }

    /// Records the terminal error. The first error wins; the fulfillment
    /// itself waits for the choke.
    pub fn process_error(&mut self, kind: ErrorKind, message: impl Into<String>) {
        if self.completed {
            tracing::warn!(event = %self.event, "error after completion ignored");
            return;
        }
        if self.error.is_none() {
            self.error = Some((kind, message.into()));
        }
    }

    /// Completes the job and fulfills the owning request part.
    pub fn process_choke(&mut self) {
        if self.completed {
            tracing::warn!(event = %self.event, "duplicate choke ignored");
            return;
        }
        self.completed = true;

        let result = match self.error.take() {
            Some((kind, message)) => json!({
                "error": message,
                "code": kind.code(),
            }),
            None => match self.chunks.len() {
                0 => Value::Null,
                1 => self.chunks.remove(0),
                _ => Value::Array(std::mem::take(&mut self.chunks)),
            },
        };

        // The registry may have dropped the request (reload); the core logs
        // the orphan on the other end
        let _ = self.futures.send(Fulfillment {
            future: self.future.clone(),
            engine: self.target.clone(),
            result,
        });
    }
}
