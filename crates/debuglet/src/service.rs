//! DebugService - shared state behind every session.
//!
//! Owns the process supervisor (and with it the debuggee registry), the
//! command registry and the configuration. Transports hand each accepted
//! connection to [`DebugService::run_session`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::Instrument;

use crate::bridge::codec::{DEFAULT_MAX_FRAME_LEN, DapCodec};
use crate::bridge::framed::MessageReader;
use crate::broker::MessageBroker;
use crate::handlers::CommandRegistry;
use crate::session::{Session, SessionError, SessionPhase};
use crate::supervisor::{ProcessSpawner, ProcessSupervisor, SupervisorConfig};
use crate::version::AdapterInfo;

pub struct ServiceConfig {
    /// Name and version reported in the telemetry event.
    pub adapter: AdapterInfo,
    /// Whether `disconnect` in launch mode terminates the debuggee by default.
    pub terminate_on_disconnect: bool,
    /// Deadline for engine-initiated requests. `None` waits forever.
    pub request_timeout: Option<Duration>,
    pub max_frame_len: usize,
    /// Output a session holds for the client before `configurationDone`.
    /// Oldest chunks are dropped beyond this.
    pub max_held_output_bytes: usize,
    pub supervisor: SupervisorConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            adapter: AdapterInfo::default(),
            terminate_on_disconnect: true,
            request_timeout: Some(Duration::from_secs(30)),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            max_held_output_bytes: 1024 * 1024,
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_adapter(mut self, adapter: AdapterInfo) -> Self {
        self.adapter = adapter;
        self
    }

    pub fn with_terminate_on_disconnect(mut self, terminate: bool) -> Self {
        self.terminate_on_disconnect = terminate;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_frame_len(mut self, max: usize) -> Self {
        self.max_frame_len = max;
        self
    }

    pub fn with_max_held_output_bytes(mut self, max: usize) -> Self {
        self.max_held_output_bytes = max;
        self
    }

    pub fn with_attach_timeout(mut self, timeout: Duration) -> Self {
        self.supervisor.attach_timeout = timeout;
        self
    }

    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.supervisor.terminate_grace = grace;
        self
    }

    pub fn with_output_drain_timeout(mut self, timeout: Duration) -> Self {
        self.supervisor.output_drain_timeout = timeout;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn ProcessSpawner>) -> Self {
        self.supervisor.spawner = spawner;
        self
    }
}

pub struct DebugService {
    config: Arc<ServiceConfig>,
    supervisor: Arc<ProcessSupervisor>,
    commands: Arc<CommandRegistry>,
    next_session: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl DebugService {
    pub fn new(config: ServiceConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            supervisor: Arc::new(ProcessSupervisor::new(config.supervisor.clone())),
            config: Arc::new(config),
            commands: Arc::new(CommandRegistry::new()),
            next_session: AtomicU64::new(1),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Install the handlers for non-lifecycle commands.
    pub fn with_commands(mut self, commands: CommandRegistry) -> Self {
        self.commands = Arc::new(commands);
        self
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    pub fn commands(&self) -> &CommandRegistry {
        &self.commands
    }

    /// Serve one client connection to completion.
    pub async fn run_session<R, W>(&self, reader: R, writer: W) -> Result<SessionPhase, SessionError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let session_id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let span = tracing::info_span!("session", session_id);

        async {
            tracing::info!("Session started");
            let broker = Arc::new(
                MessageBroker::new(writer).with_request_timeout(self.config.request_timeout),
            );
            let reader = MessageReader::with_codec(
                reader,
                DapCodec::with_max_frame_len(self.config.max_frame_len),
            );
            let session = Session::new(
                broker,
                Arc::clone(&self.supervisor),
                Arc::clone(&self.commands),
                Arc::clone(&self.config),
            );
            let result = session.run(reader).await;
            match &result {
                Ok(phase) => tracing::info!(%phase, "Session ended"),
                Err(e) => tracing::warn!(error = %e, "Session ended with error"),
            }
            result
        }
        .instrument(span)
        .await
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Terminate launched debuggees and close remote channels.
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }
}
