//! Per-client session: lifecycle state machine and reader loop.
//!
//! One `Session` serves one transport connection. It reads requests in
//! arrival order, answers lifecycle commands itself and routes everything
//! else to the command registry once the client has finished configuring.
//! Debuggee notifications are turned into `output`/`exited`/`terminated`
//! events from `Running` on. Until then the session holds them in order,
//! keeping at most `max_held_output_bytes` of output; the exit report is
//! always kept.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::bridge::codec::FramingError;
use crate::bridge::framed::MessageReader;
use crate::bridge::protocol::{
    AttachArguments, DisconnectArguments, ExitedEventBody, InitializeArguments, LaunchArguments,
    OutputEventBody, Request, command, event,
};
use crate::broker::{BrokerError, MessageBroker, to_body};
use crate::capabilities::capabilities;
use crate::debuggee::{
    Debuggee, DebuggeeId, DebuggeeNotification, NotificationReceiver, NotificationSender,
};
use crate::handlers::{CommandContext, CommandError, CommandRegistry};
use crate::service::ServiceConfig;
use crate::supervisor::{LaunchSpec, ProcessSupervisor};
use crate::telemetry::emit_telemetry;

const SESSION_CLOSED: &str = "session is closed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    Connected,
    Initializing,
    Initialized,
    Configuring,
    Running,
    Terminating,
    Terminated,
    /// Transport went away while a debuggee was bound; it keeps running.
    Detached,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Initializing => "initializing",
            Self::Initialized => "initialized",
            Self::Configuring => "configuring",
            Self::Running => "running",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
            Self::Detached => "detached",
        }
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the session got its debuggee. Decides the default on `disconnect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Launch,
    Attach,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

pub struct Session {
    broker: Arc<MessageBroker>,
    supervisor: Arc<ProcessSupervisor>,
    commands: Arc<CommandRegistry>,
    config: Arc<ServiceConfig>,
    phase: SessionPhase,
    mode: Option<SessionMode>,
    debuggee: Option<Arc<Debuggee>>,
    terminate_on_disconnect: bool,
    notify_tx: NotificationSender,
    notify_rx: NotificationReceiver,
    held: VecDeque<DebuggeeNotification>,
    held_bytes: usize,
    held_overflowed: bool,
    in_flight: JoinSet<()>,
}

impl Session {
    pub fn new(
        broker: Arc<MessageBroker>,
        supervisor: Arc<ProcessSupervisor>,
        commands: Arc<CommandRegistry>,
        config: Arc<ServiceConfig>,
    ) -> Self {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let terminate_on_disconnect = config.terminate_on_disconnect;
        Self {
            broker,
            supervisor,
            commands,
            config,
            phase: SessionPhase::Connected,
            mode: None,
            debuggee: None,
            terminate_on_disconnect,
            notify_tx,
            notify_rx,
            held: VecDeque::new(),
            held_bytes: 0,
            held_overflowed: false,
            in_flight: JoinSet::new(),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn mode(&self) -> Option<SessionMode> {
        self.mode
    }

    pub fn debuggee(&self) -> Option<&Arc<Debuggee>> {
        self.debuggee.as_ref()
    }

    /// Serve the session until `disconnect`, transport closure, or a framing
    /// or transport error. The debuggee is never terminated implicitly here.
    pub async fn run<R>(mut self, mut reader: MessageReader<R>) -> Result<SessionPhase, SessionError>
    where
        R: AsyncRead + Unpin,
    {
        let result = self.serve(&mut reader).await;
        if let Err(e) = &result {
            tracing::error!(error = %e, phase = %self.phase, "Session failed");
        }
        self.teardown().await;
        result.map(|()| self.phase)
    }

    async fn serve<R>(&mut self, reader: &mut MessageReader<R>) -> Result<(), SessionError>
    where
        R: AsyncRead + Unpin,
    {
        emit_telemetry(&self.broker, &self.config.adapter).await?;

        loop {
            tokio::select! {
                biased;

                inbound = reader.read_message() => {
                    let Some(message) = inbound? else {
                        tracing::info!(phase = %self.phase, "Client closed the connection");
                        return Ok(());
                    };
                    let request = match self.broker.dispatch_incoming(message).await {
                        Ok(Some(request)) => request,
                        Ok(None) | Err(BrokerError::UnmatchedResponse { .. }) => continue,
                        Err(e) => return Err(e.into()),
                    };
                    if self.handle_request(request).await? == Flow::Stop {
                        return Ok(());
                    }
                }

                Some(notification) = self.notify_rx.recv() => {
                    if self.phase == SessionPhase::Running {
                        self.on_notification(notification).await?;
                    } else {
                        self.hold(notification);
                    }
                }

                Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    if let Err(e) = joined
                        && e.is_panic()
                    {
                        tracing::error!(error = %e, "Command task panicked");
                    }
                }
            }
        }
    }

    async fn teardown(&mut self) {
        self.in_flight.abort_all();
        if let Some(debuggee) = self.debuggee.take() {
            debuggee.unbind(&self.notify_tx);
            tracing::info!(
                debuggee_id = %debuggee.id(),
                "Detached from debuggee, leaving it running"
            );
            self.phase = SessionPhase::Detached;
        }
        self.broker.close().await;
    }

    async fn handle_request(&mut self, request: Request) -> Result<Flow, SessionError> {
        tracing::debug!(
            seq = request.seq,
            command = %request.command,
            phase = %self.phase,
            "Handling request"
        );

        if self.phase == SessionPhase::Terminated {
            self.respond(&request, Err(CommandError::failed(SESSION_CLOSED)))
                .await?;
            return Ok(Flow::Continue);
        }

        match request.command.as_str() {
            command::INITIALIZE => self.on_initialize(&request).await?,
            command::LAUNCH => {
                let outcome = self.launch(&request);
                self.respond(&request, outcome).await?;
            }
            command::ATTACH => {
                let outcome = self.attach(&request).await;
                self.respond(&request, outcome).await?;
            }
            command::CONFIGURATION_DONE => self.on_configuration_done(&request).await?,
            command::DISCONNECT => return self.on_disconnect(&request).await,
            _ => self.on_command(request).await?,
        }
        Ok(Flow::Continue)
    }

    async fn respond(
        &self,
        request: &Request,
        outcome: Result<Option<Value>, CommandError>,
    ) -> Result<(), SessionError> {
        if let Err(e) = &outcome {
            tracing::info!(seq = request.seq, command = %request.command, error = %e, "Request failed");
        }
        self.broker
            .send_response(request, outcome.map_err(|e| e.to_string()))
            .await?;
        Ok(())
    }

    fn require(&self, request: &Request, allowed: &[SessionPhase]) -> Result<(), CommandError> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(CommandError::NotAccepted {
                command: request.command.clone(),
                phase: self.phase,
            })
        }
    }

    async fn on_initialize(&mut self, request: &Request) -> Result<(), SessionError> {
        let args = match self
            .require(request, &[SessionPhase::Connected])
            .and_then(|()| arguments::<InitializeArguments>(request))
        {
            Ok(args) => args,
            Err(e) => return self.respond(request, Err(e)).await,
        };

        tracing::info!(
            adapter_id = ?args.adapter_id,
            client_id = ?args.client_id,
            client_name = ?args.client_name,
            "Initializing session"
        );
        self.phase = SessionPhase::Initializing;

        let body = to_body(&capabilities())?;
        self.broker.send_response(request, Ok(Some(body))).await?;
        self.broker.send_event(event::INITIALIZED, None).await?;
        self.phase = SessionPhase::Initialized;
        Ok(())
    }

    /// Launch and attach are only valid while configuring and before any
    /// debuggee is bound.
    fn require_unbound(&self, request: &Request) -> Result<(), CommandError> {
        self.require(
            request,
            &[SessionPhase::Initialized, SessionPhase::Configuring],
        )?;
        match &self.debuggee {
            Some(debuggee) => Err(CommandError::failed(format!(
                "session is already bound to debuggee {}",
                debuggee.id()
            ))),
            None => Ok(()),
        }
    }

    fn launch(&mut self, request: &Request) -> Result<Option<Value>, CommandError> {
        self.require_unbound(request)?;
        let args: LaunchArguments = arguments(request)?;
        if args.program.is_empty() {
            return Err(CommandError::InvalidArguments {
                command: request.command.clone(),
                reason: "program is required".to_string(),
            });
        }

        let terminate_on_disconnect = args
            .terminate_on_disconnect
            .unwrap_or(self.config.terminate_on_disconnect);
        let spec = LaunchSpec {
            program: args.program,
            args: args.args,
            cwd: args.cwd,
            env: args.env,
        };
        let debuggee = self.supervisor.launch(&spec, self.notify_tx.clone())?;

        self.terminate_on_disconnect = terminate_on_disconnect;
        Ok(Some(self.bind(debuggee, SessionMode::Launch)))
    }

    async fn attach(&mut self, request: &Request) -> Result<Option<Value>, CommandError> {
        self.require_unbound(request)?;
        let args: AttachArguments = arguments(request)?;
        let sink = self.notify_tx.clone();

        let debuggee = match (args.port, args.debuggee_id) {
            (Some(port), _) => {
                self.supervisor
                    .attach(args.host.as_deref(), port, sink)
                    .await?
            }
            (None, Some(id)) => {
                let id = DebuggeeId::parse(&id).map_err(|e| CommandError::InvalidArguments {
                    command: request.command.clone(),
                    reason: format!("debuggeeId: {e}"),
                })?;
                self.supervisor.reattach(Some(id), sink)?
            }
            (None, None) if args.host.is_some() => {
                return Err(CommandError::InvalidArguments {
                    command: request.command.clone(),
                    reason: "host given without port".to_string(),
                });
            }
            (None, None) => self.supervisor.reattach(None, sink)?,
        };

        Ok(Some(self.bind(debuggee, SessionMode::Attach)))
    }

    fn bind(&mut self, debuggee: Arc<Debuggee>, mode: SessionMode) -> Value {
        tracing::info!(debuggee_id = %debuggee.id(), ?mode, "Session bound to debuggee");
        let body = json!({ "debuggeeId": debuggee.id().to_string() });
        self.debuggee = Some(debuggee);
        self.mode = Some(mode);
        self.phase = SessionPhase::Configuring;
        body
    }

    async fn on_configuration_done(&mut self, request: &Request) -> Result<(), SessionError> {
        if let Err(e) = self.require(
            request,
            &[SessionPhase::Initialized, SessionPhase::Configuring],
        ) {
            return self.respond(request, Err(e)).await;
        }
        self.respond(request, Ok(None)).await?;
        self.phase = SessionPhase::Running;
        tracing::info!(held = self.held.len(), "Configuration done, session running");

        self.held_bytes = 0;
        while let Some(notification) = self.held.pop_front() {
            self.on_notification(notification).await?;
        }
        Ok(())
    }

    /// Queue a notification until the client is ready, dropping the oldest
    /// output once over budget.
    fn hold(&mut self, notification: DebuggeeNotification) {
        if let DebuggeeNotification::Output { data, .. } = &notification {
            self.held_bytes += data.len();
        }
        self.held.push_back(notification);

        let limit = self.config.max_held_output_bytes;
        while self.held_bytes > limit {
            let Some(oldest) = self
                .held
                .iter()
                .position(|n| matches!(n, DebuggeeNotification::Output { .. }))
            else {
                break;
            };
            if let Some(DebuggeeNotification::Output { data, .. }) = self.held.remove(oldest) {
                self.held_bytes -= data.len();
            }
            if !self.held_overflowed {
                self.held_overflowed = true;
                tracing::warn!(
                    limit_bytes = limit,
                    "Output held for the client over budget, dropping oldest output"
                );
            }
        }
    }

    async fn on_disconnect(&mut self, request: &Request) -> Result<Flow, SessionError> {
        let args = arguments::<DisconnectArguments>(request).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Ignoring malformed disconnect arguments");
            DisconnectArguments::default()
        });
        self.phase = SessionPhase::Terminating;

        let outcome = match self.debuggee.take() {
            None => Ok(None),
            Some(debuggee) => {
                debuggee.unbind(&self.notify_tx);
                let terminate = args.terminate_debuggee.unwrap_or(match self.mode {
                    Some(SessionMode::Launch) => self.terminate_on_disconnect,
                    _ => false,
                });
                if terminate {
                    self.supervisor
                        .terminate(&debuggee)
                        .await
                        .map(|()| None)
                        .map_err(CommandError::from)
                } else {
                    tracing::info!(
                        debuggee_id = %debuggee.id(),
                        "Disconnecting, debuggee keeps running"
                    );
                    Ok(None)
                }
            }
        };

        self.respond(request, outcome).await?;
        self.phase = SessionPhase::Terminated;
        Ok(Flow::Stop)
    }

    async fn on_command(&mut self, mut request: Request) -> Result<(), SessionError> {
        if self.phase != SessionPhase::Running {
            let err = if self.commands.contains(&request.command) {
                CommandError::NotAccepted {
                    command: request.command.clone(),
                    phase: self.phase,
                }
            } else {
                CommandError::Unsupported(request.command.clone())
            };
            return self.respond(&request, Err(err)).await;
        }

        let commands = Arc::clone(&self.commands);
        let broker = Arc::clone(&self.broker);
        let ctx = CommandContext::new(Arc::clone(&broker), self.debuggee.clone());
        let arguments = std::mem::take(&mut request.arguments);

        // Handlers may issue their own requests to the client, so they run
        // beside the reader loop rather than inside it.
        self.in_flight.spawn(
            async move {
                let outcome = commands
                    .dispatch(&request.command, ctx, arguments)
                    .await
                    .map(|body| (!body.is_null()).then_some(body))
                    .map_err(|e| {
                        tracing::info!(command = %request.command, error = %e, "Request failed");
                        e.to_string()
                    });
                if let Err(e) = broker.send_response(&request, outcome).await {
                    tracing::debug!(command = %request.command, error = %e, "Could not send response");
                }
            }
            .in_current_span(),
        );
        Ok(())
    }

    async fn on_notification(
        &mut self,
        notification: DebuggeeNotification,
    ) -> Result<(), SessionError> {
        match notification {
            DebuggeeNotification::Output { category, data } => {
                let body = to_body(&OutputEventBody {
                    output: data,
                    data: None,
                    category,
                })?;
                self.broker.send_event(event::OUTPUT, Some(body)).await?;
            }
            DebuggeeNotification::Exited { exit_code } => {
                self.phase = SessionPhase::Terminating;
                let mut events = Vec::with_capacity(2);
                if let Some(exit_code) = exit_code {
                    events.push((event::EXITED, Some(to_body(&ExitedEventBody { exit_code })?)));
                }
                events.push((event::TERMINATED, None));
                self.broker.send_events(events).await?;
                self.debuggee = None;
                self.phase = SessionPhase::Terminated;
                tracing::info!(?exit_code, "Debuggee gone, session terminated");
            }
        }
        Ok(())
    }
}

fn arguments<T: DeserializeOwned>(request: &Request) -> Result<T, CommandError> {
    request
        .parse_arguments()
        .map_err(|e| CommandError::InvalidArguments {
            command: request.command.clone(),
            reason: e.to_string(),
        })
}
