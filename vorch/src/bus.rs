//! In-process command bus.
//!
//! A [`Queue`] is the sending half of a named, typed channel and an [`Inbox`]
//! its receiving half. `call` blocks until the handler replies or the timeout
//! elapses; `cast` enqueues and returns at once. Each inbox is drained by a
//! single worker ([`serve`]) that handles one message at a time.
//!
//! Every message has the wire shape `{command_name, payload}` and every reply
//! `{result}` or `{failure: {kind, message}}`; both are emitted at trace level
//! so a queue can be replayed or bridged to a remote executor.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

/// A message accepted by a queue.
///
/// Implementors serialize adjacently tagged as
/// `{"command_name": ..., "payload": ...}`.
pub trait Command: Serialize + Send + 'static {
    fn name(&self) -> &'static str;
}

/// Structured failure returned by a handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Failure {
    pub kind: String,
    pub message: String,
}

impl Failure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<&Error> for Failure {
    fn from(e: &Error) -> Self {
        Failure::new(e.kind(), e.to_string())
    }
}

impl From<Error> for Failure {
    fn from(e: Error) -> Self {
        Failure::from(&e)
    }
}

impl From<Failure> for Error {
    fn from(f: Failure) -> Self {
        Error::ExecutionFailure {
            kind: f.kind,
            message: f.message,
        }
    }
}

/// Wire form of a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub command_name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl WireMessage {
    pub fn encode<C: Command>(command: &C) -> Result<Self> {
        serde_json::to_value(command)
            .and_then(serde_json::from_value)
            .map_err(|e| Error::Internal(format!("encode {}: {e}", command.name())))
    }
}

/// Wire form of a call reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireReply {
    Result(serde_json::Value),
    Failure(Failure),
}

impl WireReply {
    pub fn encode<R: Serialize>(reply: &std::result::Result<R, Failure>) -> Self {
        match reply {
            Ok(r) => WireReply::Result(serde_json::to_value(r).unwrap_or_default()),
            Err(f) => WireReply::Failure(f.clone()),
        }
    }
}

enum Envelope<C, R> {
    Call {
        command: C,
        reply: oneshot::Sender<std::result::Result<R, Failure>>,
    },
    Cast(C),
}

/// Sending half of a named queue.
pub struct Queue<C, R> {
    name: &'static str,
    tx: mpsc::UnboundedSender<Envelope<C, R>>,
}

impl<C, R> Clone for Queue<C, R> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
        }
    }
}

/// Receiving half of a named queue.
pub struct Inbox<C, R> {
    name: &'static str,
    rx: mpsc::UnboundedReceiver<Envelope<C, R>>,
    _reply: PhantomData<fn() -> R>,
}

/// Create a queue and its inbox.
pub fn queue<C: Command, R>(name: &'static str) -> (Queue<C, R>, Inbox<C, R>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Queue { name, tx },
        Inbox {
            name,
            rx,
            _reply: PhantomData,
        },
    )
}

impl<C: Command, R: Send + 'static> Queue<C, R> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Send `command` and wait for the reply.
    ///
    /// Fails with `ExecutionTimeout` if no reply arrives within `timeout` and
    /// with `ExecutionFailure` if the handler returned a failure.
    pub async fn call(&self, command: C, timeout: Duration) -> Result<R> {
        let command_name = command.name();
        log_wire(self.name, "call", &command);

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Envelope::Call {
                command,
                reply: reply_tx,
            })
            .map_err(|_| Error::QueueClosed(self.name))?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(Ok(reply))) => Ok(reply),
            Ok(Ok(Err(failure))) => Err(failure.into()),
            Ok(Err(_)) => Err(Error::QueueClosed(self.name)),
            Err(_) => {
                warn!(queue = self.name, command = command_name, ?timeout, "Call timed out");
                Err(Error::ExecutionTimeout {
                    queue: self.name,
                    command: command_name.to_string(),
                    after: timeout,
                })
            }
        }
    }

    /// Enqueue `command` without waiting.
    pub fn cast(&self, command: C) {
        log_wire(self.name, "cast", &command);
        let command_name = command.name();
        if self.tx.send(Envelope::Cast(command)).is_err() {
            warn!(queue = self.name, command = command_name, "Cast dropped, queue closed");
        }
    }
}

fn log_wire<C: Command>(queue: &'static str, mode: &'static str, command: &C) {
    if tracing::enabled!(tracing::Level::TRACE) {
        match WireMessage::encode(command).and_then(|m| {
            serde_json::to_string(&m).map_err(|e| Error::Internal(e.to_string()))
        }) {
            Ok(wire) => trace!(queue, mode, %wire, "Send"),
            Err(e) => trace!(queue, mode, error = %e, "Send (unencodable)"),
        }
    } else {
        debug!(queue, mode, command = command.name(), "Send");
    }
}

/// Consumer of a queue.
#[async_trait]
pub trait Handler<C, R>: Send + Sync + 'static {
    async fn handle(&self, command: C) -> std::result::Result<R, Failure>;
}

/// Drain `inbox` with `handler` until every [`Queue`] is dropped.
pub fn serve<C, R, H>(mut inbox: Inbox<C, R>, handler: Arc<H>) -> JoinHandle<()>
where
    C: Command,
    R: Serialize + Send + 'static,
    H: Handler<C, R> + ?Sized,
{
    tokio::spawn(async move {
        debug!(queue = inbox.name, "Queue worker started");
        while let Some(envelope) = inbox.rx.recv().await {
            match envelope {
                Envelope::Call { command, reply } => {
                    let result = handler.handle(command).await;
                    if tracing::enabled!(tracing::Level::TRACE) {
                        if let Ok(wire) = serde_json::to_string(&WireReply::encode(&result)) {
                            trace!(queue = inbox.name, %wire, "Reply");
                        }
                    }
                    // Caller may have timed out already.
                    let _ = reply.send(result);
                }
                Envelope::Cast(command) => {
                    let command_name = command.name();
                    if let Err(failure) = handler.handle(command).await {
                        warn!(
                            queue = inbox.name,
                            command = command_name,
                            kind = %failure.kind,
                            message = %failure.message,
                            "Cast handler failed"
                        );
                    }
                }
            }
        }
        debug!(queue = inbox.name, "Queue worker stopped");
    })
}
