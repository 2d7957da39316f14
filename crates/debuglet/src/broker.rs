//! Message broker - single authority for sequence numbers and outbound writes.
//!
//! Every response and event a session sends, whether it comes from the reader
//! loop or from a debuggee notification, is numbered and written inside one
//! critical section. That keeps transmitted sequence numbers gap-free and in
//! send order, and keeps frames from interleaving on the wire.
//!
//! The broker also correlates engine-initiated requests with the client's
//! responses through a pending-request table guarded by the same lock.

use std::collections::HashMap;
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::sync::{Mutex, oneshot};

use crate::bridge::codec::FramingError;
use crate::bridge::framed::MessageWriter;
use crate::bridge::protocol::{Event, Message, Request, Response, Seq};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("no pending request for response to seq {request_seq}")]
    UnmatchedResponse { request_seq: Seq },
    #[error("request '{command}' timed out after {timeout:?}")]
    RequestTimeout { command: String, timeout: Duration },
    #[error("request '{command}' failed: {message}")]
    RequestFailed { command: String, message: String },
    #[error("message channel closed")]
    Closed,
    #[error("failed to encode message body: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Framing(#[from] FramingError),
}

/// Outcome of a command, as carried by a response.
pub type CommandOutcome = Result<Option<serde_json::Value>, String>;

/// Serialize a typed body for an event or response.
pub fn to_body<T: serde::Serialize>(body: &T) -> Result<serde_json::Value, BrokerError> {
    Ok(serde_json::to_value(body)?)
}

struct PendingRequest {
    command: String,
    tx: oneshot::Sender<Response>,
}

struct BrokerState {
    next_seq: Seq,
    writer: Option<MessageWriter<BoxedWriter>>,
    pending: HashMap<Seq, PendingRequest>,
}

impl BrokerState {
    /// Return the current counter value and advance it.
    fn next_seq(&mut self) -> Seq {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    async fn write(&mut self, message: Message) -> Result<(), BrokerError> {
        let writer = self.writer.as_mut().ok_or(BrokerError::Closed)?;
        if let Err(e) = writer.write_message(message).await {
            tracing::error!(error = %e, "Failed to write message, closing channel");
            self.writer = None;
            return Err(e.into());
        }
        Ok(())
    }

    async fn write_event(
        &mut self,
        event: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Seq, BrokerError> {
        let seq = self.next_seq();
        tracing::debug!(seq, event, "Sending event");
        self.write(Message::Event(Event {
            seq,
            event: event.to_string(),
            body,
        }))
        .await?;
        Ok(seq)
    }
}

pub struct MessageBroker {
    state: Mutex<BrokerState>,
    request_timeout: Option<Duration>,
}

impl MessageBroker {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: BoxedWriter = Box::new(writer);
        Self {
            state: Mutex::new(BrokerState {
                next_seq: 0,
                writer: Some(MessageWriter::new(writer)),
                pending: HashMap::new(),
            }),
            request_timeout: None,
        }
    }

    /// Default deadline for engine-initiated requests. `None` waits forever.
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub async fn send_event(
        &self,
        event: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Seq, BrokerError> {
        self.state.lock().await.write_event(event, body).await
    }

    /// Send several events back to back with nothing interleaved between them.
    pub async fn send_events(
        &self,
        events: Vec<(&str, Option<serde_json::Value>)>,
    ) -> Result<Vec<Seq>, BrokerError> {
        let mut state = self.state.lock().await;
        let mut seqs = Vec::with_capacity(events.len());
        for (event, body) in events {
            seqs.push(state.write_event(event, body).await?);
        }
        Ok(seqs)
    }

    /// Answer a client request.
    pub async fn send_response(
        &self,
        request: &Request,
        outcome: CommandOutcome,
    ) -> Result<Seq, BrokerError> {
        let mut state = self.state.lock().await;
        let seq = state.next_seq();
        let (success, body, message) = match outcome {
            Ok(body) => (true, body, None),
            Err(message) => (false, None, Some(message)),
        };
        tracing::debug!(
            seq,
            request_seq = request.seq,
            command = %request.command,
            success,
            "Sending response"
        );
        state
            .write(Message::Response(Response {
                seq,
                request_seq: request.seq,
                success,
                command: request.command.clone(),
                message,
                body,
            }))
            .await?;
        Ok(seq)
    }

    /// Send a request to the client and wait for its response body, using the
    /// broker's default deadline.
    pub async fn send_request(
        &self,
        command: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, BrokerError> {
        self.send_request_with_timeout(command, arguments, self.request_timeout)
            .await
    }

    pub async fn send_request_with_timeout(
        &self,
        command: &str,
        arguments: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, BrokerError> {
        let (tx, rx) = oneshot::channel();
        let seq = {
            let mut state = self.state.lock().await;
            let seq = state.next_seq();
            state.pending.insert(
                seq,
                PendingRequest {
                    command: command.to_string(),
                    tx,
                },
            );
            tracing::debug!(seq, command, "Sending request");
            let written = state
                .write(Message::Request(Request {
                    seq,
                    command: command.to_string(),
                    arguments,
                }))
                .await;
            if let Err(e) = written {
                state.pending.remove(&seq);
                return Err(e);
            }
            seq
        };

        let response = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.state.lock().await.pending.remove(&seq);
                    tracing::warn!(seq, command, ?limit, "Request timed out");
                    return Err(BrokerError::RequestTimeout {
                        command: command.to_string(),
                        timeout: limit,
                    });
                }
            },
            None => rx.await,
        }
        .map_err(|_| BrokerError::Closed)?;

        if response.success {
            Ok(response.body.unwrap_or(serde_json::Value::Null))
        } else {
            Err(BrokerError::RequestFailed {
                command: command.to_string(),
                message: response
                    .message
                    .unwrap_or_else(|| "request failed".to_string()),
            })
        }
    }

    /// Route one inbound message.
    ///
    /// Requests are handed back to the caller for command handling. Responses
    /// resolve the matching pending request. Client events are ignored.
    pub async fn dispatch_incoming(&self, message: Message) -> Result<Option<Request>, BrokerError> {
        match message {
            Message::Request(request) => Ok(Some(request)),
            Message::Response(response) => {
                let request_seq = response.request_seq;
                let pending = self.state.lock().await.pending.remove(&request_seq);
                match pending {
                    Some(PendingRequest { command, tx }) => {
                        if tx.send(response).is_err() {
                            tracing::debug!(request_seq, %command, "Requester gone before response arrived");
                        }
                        Ok(None)
                    }
                    None => {
                        tracing::warn!(request_seq, "Dropping response with no pending request");
                        Err(BrokerError::UnmatchedResponse { request_seq })
                    }
                }
            }
            Message::Event(event) => {
                tracing::debug!(seq = event.seq, event = %event.event, "Ignoring client event");
                Ok(None)
            }
        }
    }

    pub async fn pending_requests(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.writer.is_none()
    }

    /// Fail all pending requests and shut the outbound stream down.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        let dropped = state.pending.len();
        state.pending.clear();
        if let Some(mut writer) = state.writer.take()
            && let Err(e) = writer.close().await
        {
            tracing::debug!(error = %e, "Error closing outbound stream");
        }
        tracing::debug!(dropped_requests = dropped, "Broker closed");
    }
}
