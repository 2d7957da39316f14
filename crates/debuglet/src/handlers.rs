//! Pluggable handlers for commands outside the session lifecycle.
//!
//! Breakpoints, stepping, evaluation and the rest are supplied by whoever
//! embeds the engine. Each handler returns the response body (or an error
//! message) and the session numbers and sends the response.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;

use crate::bridge::protocol::Seq;
use crate::broker::{BrokerError, MessageBroker};
use crate::debuggee::Debuggee;
use crate::session::SessionPhase;
use crate::supervisor::SupervisorError;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("unsupported command: {0}")]
    Unsupported(String),
    #[error("'{command}' is not accepted while the session is {phase}")]
    NotAccepted {
        command: String,
        phase: SessionPhase,
    },
    #[error("invalid arguments for '{command}': {reason}")]
    InvalidArguments { command: String, reason: String },
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error("{0}")]
    Failed(String),
}

impl CommandError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// What a handler can reach while it runs.
#[derive(Clone)]
pub struct CommandContext {
    broker: Arc<MessageBroker>,
    debuggee: Option<Arc<Debuggee>>,
}

impl CommandContext {
    pub(crate) fn new(broker: Arc<MessageBroker>, debuggee: Option<Arc<Debuggee>>) -> Self {
        Self { broker, debuggee }
    }

    /// The debuggee bound to the requesting session, if any.
    pub fn debuggee(&self) -> Option<&Arc<Debuggee>> {
        self.debuggee.as_ref()
    }

    /// Emit an event (e.g. `stopped`) on the session's stream.
    pub async fn send_event(&self, event: &str, body: Option<Value>) -> Result<Seq, BrokerError> {
        self.broker.send_event(event, body).await
    }

    /// Issue an engine-initiated request and wait for the client's answer.
    pub async fn send_request(&self, command: &str, arguments: Value) -> Result<Value, BrokerError> {
        self.broker.send_request(command, arguments).await
    }
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, ctx: CommandContext, arguments: Value) -> Result<Value, CommandError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(CommandContext, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, CommandError>> + Send + 'static,
{
    async fn handle(&self, ctx: CommandContext, arguments: Value) -> Result<Value, CommandError> {
        (self.0)(ctx, arguments).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn CommandHandler>
where
    F: Fn(CommandContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, CommandError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Command name to handler lookup, shared by all sessions of a service.
#[derive(Default, Clone)]
pub struct CommandRegistry {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, command: impl Into<String>, handler: Arc<dyn CommandHandler>) {
        let command = command.into();
        if self.handlers.insert(command.clone(), handler).is_some() {
            tracing::warn!(%command, "Replacing existing command handler");
        }
    }

    pub fn with_handler(mut self, command: impl Into<String>, handler: Arc<dyn CommandHandler>) -> Self {
        self.register(command, handler);
        self
    }

    pub fn contains(&self, command: &str) -> bool {
        self.handlers.contains_key(command)
    }

    pub fn commands(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run the handler for `command`. A panicking handler becomes a failure.
    pub async fn dispatch(
        &self,
        command: &str,
        ctx: CommandContext,
        arguments: Value,
    ) -> Result<Value, CommandError> {
        let handler = self
            .handlers
            .get(command)
            .cloned()
            .ok_or_else(|| CommandError::Unsupported(command.to_string()))?;

        match AssertUnwindSafe(handler.handle(ctx, arguments))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(%command, "Command handler panicked");
                Err(CommandError::failed(format!(
                    "internal error while handling '{command}'"
                )))
            }
        }
    }
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.commands())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> CommandContext {
        let (writer, _reader) = tokio::io::duplex(1024);
        CommandContext::new(Arc::new(MessageBroker::new(writer)), None)
    }

    #[tokio::test]
    async fn registered_handler_receives_arguments() {
        let registry = CommandRegistry::new().with_handler(
            "evaluate",
            handler_fn(|_ctx, args| async move {
                Ok(json!({"result": args["expression"].clone(), "variablesReference": 0}))
            }),
        );

        let body = registry
            .dispatch("evaluate", context(), json!({"expression": "1 + 1"}))
            .await
            .unwrap();
        assert_eq!(body["result"], "1 + 1");
    }

    #[tokio::test]
    async fn unknown_command_is_unsupported() {
        let registry = CommandRegistry::new();
        let err = registry
            .dispatch("stepBack", context(), Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "unsupported command: stepBack");
    }

    #[tokio::test]
    async fn handler_error_message_is_kept() {
        let registry = CommandRegistry::new().with_handler(
            "setBreakpoints",
            handler_fn(|_ctx, _args| async { Err(CommandError::failed("no such file")) }),
        );
        let err = registry
            .dispatch("setBreakpoints", context(), Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "no such file");
    }

    #[tokio::test]
    async fn panicking_handler_becomes_failure() {
        let registry = CommandRegistry::new().with_handler(
            "threads",
            handler_fn(|_ctx, _args| async {
                if true {
                    panic!("boom");
                }
                Ok(Value::Null)
            }),
        );
        let err = registry
            .dispatch("threads", context(), Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "internal error while handling 'threads'");
    }

    #[test]
    fn commands_are_listed_sorted() {
        let noop = || handler_fn(|_ctx, _args| async { Ok(Value::Null) });
        let registry = CommandRegistry::new()
            .with_handler("threads", noop())
            .with_handler("pause", noop());
        assert!(registry.contains("pause"));
        assert_eq!(registry.commands(), vec!["pause", "threads"]);
    }
}
