//! Debuggee supervision: spawning, remote attach, output capture, exit
//! watching and termination.
//!
//! The supervisor owns a registry of live debuggees. A debuggee stays in the
//! registry until it exits, whether or not a session is bound to it, so a
//! later session can re-attach.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::bridge::protocol::OutputCategory;
use crate::debuggee::{Debuggee, DebuggeeId, DebuggeeKind, NotificationSender};

const READ_CHUNK: usize = 8192;
const DEFAULT_ATTACH_HOST: &str = "127.0.0.1";

/// What to run for a `launch` request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for how debuggee processes are started.
///
/// Output is captured only for streams the returned child has piped.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, spec: &LaunchSpec) -> Result<Child, SpawnError>;
}

/// Spawns the program directly with stdout/stderr piped and stdin closed.
///
/// On unix the debuggee leads its own process group, so termination also
/// reaches processes it started.
pub struct CommandSpawner;

impl ProcessSpawner for CommandSpawner {
    fn spawn(&self, spec: &LaunchSpec) -> Result<Child, SpawnError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        #[cfg(unix)]
        command.process_group(0);
        Ok(command.spawn()?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("launch failed: {0}")]
    LaunchFailed(String),
    #[error("attach failed: {0}")]
    AttachFailed(String),
    #[error("terminate failed: {0}")]
    Terminate(String),
}

#[derive(Clone)]
pub struct SupervisorConfig {
    pub attach_timeout: Duration,
    /// How long a debuggee gets to exit after SIGTERM before it is killed.
    pub terminate_grace: Duration,
    /// How long to wait for captured streams to close once the process exits.
    pub output_drain_timeout: Duration,
    pub spawner: Arc<dyn ProcessSpawner>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            attach_timeout: Duration::from_secs(10),
            terminate_grace: Duration::from_secs(5),
            output_drain_timeout: Duration::from_secs(2),
            spawner: Arc::new(CommandSpawner),
        }
    }
}

impl SupervisorConfig {
    pub fn with_attach_timeout(mut self, timeout: Duration) -> Self {
        self.attach_timeout = timeout;
        self
    }

    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    pub fn with_output_drain_timeout(mut self, timeout: Duration) -> Self {
        self.output_drain_timeout = timeout;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn ProcessSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}

type Registry = Arc<DashMap<DebuggeeId, Arc<Debuggee>>>;

pub struct ProcessSupervisor {
    config: SupervisorConfig,
    debuggees: Registry,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            debuggees: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Spawn a debuggee with `sink` already bound, so no output is missed.
    ///
    /// Must be called from within a tokio runtime.
    pub fn launch(
        &self,
        spec: &LaunchSpec,
        sink: NotificationSender,
    ) -> Result<Arc<Debuggee>, SupervisorError> {
        tracing::info!(program = %spec.program, args = ?spec.args, cwd = ?spec.cwd, "Spawning debuggee");

        let mut child = self
            .config
            .spawner
            .spawn(spec)
            .map_err(|e| SupervisorError::LaunchFailed(format!("{}: {}", spec.program, e)))?;

        let debuggee = Arc::new(Debuggee::new(
            DebuggeeKind::Launched {
                program: spec.program.clone(),
                pid: child.id(),
            },
            Some(sink),
        ));

        let mut captures = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            captures.push(tokio::spawn(capture_stream(
                Arc::clone(&debuggee),
                stdout,
                OutputCategory::Stdout,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            captures.push(tokio::spawn(capture_stream(
                Arc::clone(&debuggee),
                stderr,
                OutputCategory::Stderr,
            )));
        }

        // Register before the watcher can observe an exit and deregister.
        self.debuggees
            .insert(debuggee.id(), Arc::clone(&debuggee));

        tokio::spawn(watch_process(
            Arc::clone(&debuggee),
            child,
            captures,
            self.config.output_drain_timeout,
            Arc::clone(&self.debuggees),
        ));

        tracing::info!(debuggee_id = %debuggee.id(), pid = ?debuggee.pid(), "Debuggee launched");
        Ok(debuggee)
    }

    /// Connect to an already-running debuggee's control channel.
    ///
    /// Bytes received on the channel are reported as stdout output; the
    /// channel closing counts as the debuggee going away.
    pub async fn attach(
        &self,
        host: Option<&str>,
        port: u16,
        sink: NotificationSender,
    ) -> Result<Arc<Debuggee>, SupervisorError> {
        let endpoint = format!("{}:{}", host.unwrap_or(DEFAULT_ATTACH_HOST), port);
        tracing::info!(%endpoint, "Attaching to remote debuggee");

        let stream =
            match tokio::time::timeout(self.config.attach_timeout, TcpStream::connect(&endpoint))
                .await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    return Err(SupervisorError::AttachFailed(format!("{endpoint}: {e}")));
                }
                Err(_) => {
                    return Err(SupervisorError::AttachFailed(format!(
                        "{endpoint}: timed out after {:?}",
                        self.config.attach_timeout
                    )));
                }
            };

        let debuggee = Arc::new(Debuggee::new(
            DebuggeeKind::Remote {
                endpoint: endpoint.clone(),
            },
            Some(sink),
        ));
        self.debuggees
            .insert(debuggee.id(), Arc::clone(&debuggee));

        tokio::spawn(watch_remote(
            Arc::clone(&debuggee),
            stream,
            Arc::clone(&self.debuggees),
        ));

        tracing::info!(debuggee_id = %debuggee.id(), %endpoint, "Attached to remote debuggee");
        Ok(debuggee)
    }

    /// Bind `sink` to a registered debuggee that no session holds.
    ///
    /// Without an id, exactly one detached debuggee must exist.
    pub fn reattach(
        &self,
        id: Option<DebuggeeId>,
        sink: NotificationSender,
    ) -> Result<Arc<Debuggee>, SupervisorError> {
        let debuggee = match id {
            Some(id) => self
                .get(id)
                .ok_or_else(|| SupervisorError::AttachFailed(format!("no debuggee with id {id}")))?,
            None => {
                let mut detached: Vec<_> = self
                    .debuggees()
                    .into_iter()
                    .filter(|d| !d.is_bound() && !d.has_exited())
                    .collect();
                match detached.len() {
                    0 => {
                        return Err(SupervisorError::AttachFailed(
                            "no detached debuggee to attach to".to_string(),
                        ));
                    }
                    1 => detached.remove(0),
                    n => {
                        return Err(SupervisorError::AttachFailed(format!(
                            "{n} detached debuggees, specify debuggeeId"
                        )));
                    }
                }
            }
        };

        debuggee
            .bind(sink)
            .map_err(|e| SupervisorError::AttachFailed(e.to_string()))?;
        tracing::info!(debuggee_id = %debuggee.id(), "Re-attached to debuggee");
        Ok(debuggee)
    }

    /// Stop a debuggee and wait for its exit to be recorded.
    ///
    /// Launched processes get SIGTERM first (unix) and are killed once the
    /// grace period runs out. Signals are sent by the exit watcher, which
    /// skips them once the process has been reaped. Remote debuggees have
    /// their channel closed.
    pub async fn terminate(&self, debuggee: &Debuggee) -> Result<(), SupervisorError> {
        if debuggee.has_exited() {
            return Ok(());
        }
        tracing::info!(debuggee_id = %debuggee.id(), "Terminating debuggee");

        let grace = self.config.terminate_grace;
        if debuggee.is_launched() {
            debuggee.request_terminate();
            if tokio::time::timeout(grace, debuggee.wait_for_exit())
                .await
                .is_ok()
            {
                return Ok(());
            }
            tracing::warn!(debuggee_id = %debuggee.id(), "Debuggee did not exit in time, killing");
        }
        debuggee.request_stop();

        match tokio::time::timeout(grace, debuggee.wait_for_exit()).await {
            Ok(_) => Ok(()),
            Err(_) => Err(SupervisorError::Terminate(format!(
                "debuggee {} did not exit within {:?}",
                debuggee.id(),
                grace
            ))),
        }
    }

    pub fn get(&self, id: DebuggeeId) -> Option<Arc<Debuggee>> {
        self.debuggees.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn debuggees(&self) -> Vec<Arc<Debuggee>> {
        self.debuggees
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Terminate every launched debuggee and drop remote channels.
    pub async fn shutdown(&self) {
        for debuggee in self.debuggees() {
            if debuggee.is_launched() {
                if let Err(e) = self.terminate(&debuggee).await {
                    tracing::error!(error = %e, "Failed to terminate debuggee during shutdown");
                }
            } else {
                debuggee.request_stop();
            }
        }
    }
}

/// Signal the process group led by `pid`, or just `pid` if it leads none.
#[cfg(unix)]
fn signal_debuggee(pid: u32, signal: nix::sys::signal::Signal) -> bool {
    use nix::sys::signal::{kill, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    let pid = Pid::from_raw(raw);
    match killpg(pid, signal).or_else(|_| kill(pid, signal)) {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(pid = raw, ?signal, error = %e, "Signal not delivered");
            false
        }
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> bool {
    signal_debuggee(pid, nix::sys::signal::Signal::SIGTERM)
}

#[cfg(unix)]
fn send_sigkill(pid: u32) {
    signal_debuggee(pid, nix::sys::signal::Signal::SIGKILL);
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) -> bool {
    false
}

#[cfg(not(unix))]
fn send_sigkill(_pid: u32) {}

#[cfg(unix)]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Decode `pending` as UTF-8, replacing invalid bytes with U+FFFD and leaving
/// a split trailing sequence for the next read.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    let mut text = String::with_capacity(pending.len());
    let mut rest = &pending[..];
    loop {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                text.push_str(valid);
                rest = &[];
                break;
            }
            Err(e) => {
                let (valid, after) = rest.split_at(e.valid_up_to());
                text.push_str(&String::from_utf8_lossy(valid));
                match e.error_len() {
                    Some(len) => {
                        text.push(char::REPLACEMENT_CHARACTER);
                        rest = &after[len..];
                    }
                    None => {
                        rest = after;
                        break;
                    }
                }
            }
        }
    }
    let consumed = pending.len() - rest.len();
    pending.drain(..consumed);
    text
}

async fn capture_stream<R>(debuggee: Arc<Debuggee>, mut reader: R, category: OutputCategory)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    let mut pending = Vec::new();
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                debuggee.publish_output(category, take_utf8(&mut pending));
            }
            Err(e) => {
                tracing::warn!(debuggee_id = %debuggee.id(), stream = category.as_str(), error = %e, "Output capture failed");
                break;
            }
        }
    }
    if !pending.is_empty() {
        debuggee.publish_output(category, String::from_utf8_lossy(&pending).into_owned());
    }
    tracing::trace!(debuggee_id = %debuggee.id(), stream = category.as_str(), "Output stream closed");
}

async fn watch_process(
    debuggee: Arc<Debuggee>,
    mut child: Child,
    mut captures: Vec<JoinHandle<()>>,
    drain_timeout: Duration,
    registry: Registry,
) {
    // `child.id()` is `None` once reaped, so a recycled pid is never signalled.
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            _ = debuggee.terminate_requested() => {
                if let Some(pid) = child.id()
                    && !send_sigterm(pid)
                    && let Err(e) = child.start_kill()
                {
                    tracing::warn!(debuggee_id = %debuggee.id(), error = %e, "Failed to kill debuggee");
                }
            }
            _ = debuggee.stop_requested() => {
                if let Some(pid) = child.id() {
                    send_sigkill(pid);
                }
                if let Err(e) = child.start_kill() {
                    tracing::warn!(debuggee_id = %debuggee.id(), error = %e, "Failed to kill debuggee");
                }
                break child.wait().await;
            }
        }
    };

    let exit_code = match status {
        Ok(status) => Some(exit_code_of(status)),
        Err(e) => {
            tracing::error!(debuggee_id = %debuggee.id(), error = %e, "Failed to wait for debuggee");
            None
        }
    };

    // Report output before the exit; the streams close once every holder of
    // the pipes (including grandchildren) is gone.
    let drained = tokio::time::timeout(drain_timeout, async {
        for capture in captures.iter_mut() {
            let _ = capture.await;
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            debuggee_id = %debuggee.id(),
            timeout = ?drain_timeout,
            "Output streams still open after exit, reporting exit anyway"
        );
        for capture in &captures {
            capture.abort();
        }
    }

    debuggee.record_exit(exit_code);
    registry.remove(&debuggee.id());
}

async fn watch_remote(debuggee: Arc<Debuggee>, stream: TcpStream, registry: Registry) {
    // Write half is held so the channel stays fully open until we stop.
    let (mut reader, _writer) = stream.into_split();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut pending = Vec::new();

    loop {
        tokio::select! {
            _ = debuggee.stop_requested() => {
                tracing::info!(debuggee_id = %debuggee.id(), "Closing remote control channel");
                break;
            }
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    tracing::info!(debuggee_id = %debuggee.id(), "Remote control channel closed");
                    break;
                }
                Ok(n) => {
                    pending.extend_from_slice(&buf[..n]);
                    debuggee.publish_output(OutputCategory::Stdout, take_utf8(&mut pending));
                }
                Err(e) => {
                    tracing::warn!(debuggee_id = %debuggee.id(), error = %e, "Remote control channel failed");
                    break;
                }
            }
        }
    }

    debuggee.record_exit(None);
    registry.remove(&debuggee.id());
}
