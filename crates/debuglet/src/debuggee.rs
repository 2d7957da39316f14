//! Debuggee handle - the target process as seen by sessions.
//!
//! A debuggee outlives the session that created it. Sessions bind a
//! notification sink to it while attached and unbind on detach; output and
//! the exit report go to whichever sink is bound at the time, and are also
//! kept in a bounded capture buffer.

use std::sync::Mutex as StdMutex;

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, mpsc, watch};

use crate::bridge::protocol::OutputCategory;

/// Per-stream cap on the capture buffer.
const MAX_CAPTURED_BYTES: usize = 1024 * 1024;

/// Unique identifier for a debuggee.
///
/// UUID v4 so ids handed to clients are never reused across debuggees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DebuggeeId(uuid::Uuid);

impl DebuggeeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for DebuggeeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DebuggeeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the engine reaches the debuggee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebuggeeKind {
    /// Spawned by the supervisor, which owns its lifetime.
    Launched { program: String, pid: Option<u32> },
    /// Already running; reached over its own control channel.
    Remote { endpoint: String },
}

/// Pushed from supervisor activities to the bound session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebuggeeNotification {
    Output {
        category: OutputCategory,
        data: String,
    },
    /// Reported exactly once. `exit_code` is `None` when a remote control
    /// channel closed and no code is known.
    Exited { exit_code: Option<i32> },
}

pub type NotificationSender = mpsc::UnboundedSender<DebuggeeNotification>;
pub type NotificationReceiver = mpsc::UnboundedReceiver<DebuggeeNotification>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebuggeeExit {
    pub exit_code: Option<i32>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BindError {
    #[error("debuggee {0} has already exited")]
    Exited(DebuggeeId),
    #[error("debuggee {0} is attached to another session")]
    AlreadyBound(DebuggeeId),
}

#[derive(Default)]
struct CapturedStream {
    text: String,
    overflowed: bool,
}

impl CapturedStream {
    /// Append `data` if it fits. Returns `false` only on the first overflow.
    fn push(&mut self, data: &str) -> bool {
        if self.text.len() + data.len() > MAX_CAPTURED_BYTES {
            let first_overflow = !self.overflowed;
            self.overflowed = true;
            return !first_overflow;
        }
        self.text.push_str(data);
        true
    }
}

#[derive(Default)]
struct Captured {
    stdout: CapturedStream,
    stderr: CapturedStream,
}

impl Captured {
    fn stream_mut(&mut self, category: OutputCategory) -> Option<&mut CapturedStream> {
        match category {
            OutputCategory::Stdout => Some(&mut self.stdout),
            OutputCategory::Stderr => Some(&mut self.stderr),
            OutputCategory::Telemetry => None,
        }
    }

    fn push(&mut self, category: OutputCategory, data: &str) -> bool {
        self.stream_mut(category).is_none_or(|stream| stream.push(data))
    }
}

struct DebuggeeInner {
    sink: Option<NotificationSender>,
    captured: Captured,
    exit: Option<DebuggeeExit>,
}

pub struct Debuggee {
    id: DebuggeeId,
    kind: DebuggeeKind,
    inner: StdMutex<DebuggeeInner>,
    exit_tx: watch::Sender<Option<DebuggeeExit>>,
    terminate: Notify,
    stop: Notify,
}

impl Debuggee {
    pub(crate) fn new(kind: DebuggeeKind, sink: Option<NotificationSender>) -> Self {
        let (exit_tx, _) = watch::channel(None);
        Self {
            id: DebuggeeId::new(),
            kind,
            inner: StdMutex::new(DebuggeeInner {
                sink,
                captured: Captured::default(),
                exit: None,
            }),
            exit_tx,
            terminate: Notify::new(),
            stop: Notify::new(),
        }
    }

    pub fn id(&self) -> DebuggeeId {
        self.id
    }

    pub fn kind(&self) -> &DebuggeeKind {
        &self.kind
    }

    pub fn is_launched(&self) -> bool {
        matches!(self.kind, DebuggeeKind::Launched { .. })
    }

    pub fn pid(&self) -> Option<u32> {
        match self.kind {
            DebuggeeKind::Launched { pid, .. } => pid,
            DebuggeeKind::Remote { .. } => None,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DebuggeeInner> {
        // Nothing panics while holding the lock; recover the data if it ever does.
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::error!(debuggee_id = %self.id, "Debuggee mutex poisoned");
            poisoned.into_inner()
        })
    }

    /// Attach a session sink. Fails if the debuggee already exited or another
    /// live session holds it.
    pub fn bind(&self, sink: NotificationSender) -> Result<(), BindError> {
        let mut inner = self.lock();
        if inner.exit.is_some() {
            return Err(BindError::Exited(self.id));
        }
        if let Some(current) = &inner.sink
            && !current.is_closed()
        {
            return Err(BindError::AlreadyBound(self.id));
        }
        inner.sink = Some(sink);
        tracing::debug!(debuggee_id = %self.id, "Session bound to debuggee");
        Ok(())
    }

    /// Detach `sink` if it is the bound one. Returns whether anything changed.
    pub fn unbind(&self, sink: &NotificationSender) -> bool {
        let mut inner = self.lock();
        match &inner.sink {
            Some(current) if current.same_channel(sink) => {
                inner.sink = None;
                tracing::debug!(debuggee_id = %self.id, "Session unbound from debuggee");
                true
            }
            _ => false,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.lock().sink.as_ref().is_some_and(|s| !s.is_closed())
    }

    /// Record a chunk of output and forward it to the bound session.
    pub(crate) fn publish_output(&self, category: OutputCategory, data: String) {
        if data.is_empty() {
            return;
        }
        let mut inner = self.lock();
        if !inner.captured.push(category, &data) {
            tracing::warn!(
                debuggee_id = %self.id,
                stream = category.as_str(),
                limit_bytes = MAX_CAPTURED_BYTES,
                "Capture buffer full, older output is kept and new output is only forwarded"
            );
        }
        Self::notify(&mut inner, DebuggeeNotification::Output { category, data });
    }

    /// Record termination. Only the first call has any effect.
    pub(crate) fn record_exit(&self, exit_code: Option<i32>) {
        let mut inner = self.lock();
        if inner.exit.is_some() {
            return;
        }
        let exit = DebuggeeExit { exit_code };
        inner.exit = Some(exit);
        if inner.sink.is_none() {
            tracing::info!(debuggee_id = %self.id, ?exit_code, "Debuggee exited while detached");
        } else {
            tracing::info!(debuggee_id = %self.id, ?exit_code, "Debuggee exited");
        }
        Self::notify(&mut inner, DebuggeeNotification::Exited { exit_code });
        drop(inner);
        self.exit_tx.send_replace(Some(exit));
    }

    fn notify(inner: &mut DebuggeeInner, notification: DebuggeeNotification) {
        if let Some(sink) = &inner.sink
            && sink.send(notification).is_err()
        {
            // Session went away without unbinding.
            inner.sink = None;
        }
    }

    pub fn exit(&self) -> Option<DebuggeeExit> {
        self.lock().exit
    }

    pub fn has_exited(&self) -> bool {
        self.exit().is_some()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit().and_then(|e| e.exit_code)
    }

    /// Wait until the debuggee has exited.
    pub async fn wait_for_exit(&self) -> DebuggeeExit {
        let mut rx = self.exit_tx.subscribe();
        loop {
            if let Some(exit) = *rx.borrow_and_update() {
                return exit;
            }
            if rx.changed().await.is_err() {
                // Sender lives as long as self; unreachable in practice.
                return DebuggeeExit { exit_code: None };
            }
        }
    }

    /// Output captured so far on one stream.
    pub fn captured_output(&self, category: OutputCategory) -> String {
        let inner = self.lock();
        match category {
            OutputCategory::Stdout => inner.captured.stdout.text.clone(),
            OutputCategory::Stderr => inner.captured.stderr.text.clone(),
            OutputCategory::Telemetry => String::new(),
        }
    }

    /// Ask the owning supervisor task to signal the process politely. Ignored
    /// once the process has been reaped.
    pub(crate) fn request_terminate(&self) {
        self.terminate.notify_one();
    }

    pub(crate) async fn terminate_requested(&self) {
        self.terminate.notified().await;
    }

    /// Ask the owning supervisor task to stop the debuggee (kill the process
    /// or close the control channel).
    pub(crate) fn request_stop(&self) {
        self.stop.notify_one();
    }

    pub(crate) async fn stop_requested(&self) {
        self.stop.notified().await;
    }
}

impl std::fmt::Debug for Debuggee {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Debuggee")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("exit", &self.exit())
            .finish()
    }
}
