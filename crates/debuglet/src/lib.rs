//! debuglet: debug adapter protocol engine.
//!
//! Frames and routes protocol messages, drives the per-client session
//! lifecycle and supervises the debuggee processes sessions launch or attach
//! to. Debugging commands beyond the lifecycle are plugged in through the
//! [`CommandRegistry`].

mod capabilities;
mod telemetry;
mod version;

pub mod bridge;
pub mod broker;
pub mod debuggee;
pub mod handlers;
pub mod service;
pub mod session;
pub mod supervisor;
pub mod transport;

pub use bridge::codec::{DapCodec, FramingError};
pub use bridge::framed::{MessageReader, MessageWriter};
pub use bridge::protocol::{Event, Message, OutputCategory, Request, Response, Seq};
pub use broker::{BrokerError, MessageBroker};
pub use capabilities::{Capabilities, ExceptionBreakpointFilter, capabilities};
pub use debuggee::{Debuggee, DebuggeeId, DebuggeeKind, DebuggeeNotification};
pub use handlers::{CommandContext, CommandError, CommandHandler, CommandRegistry, handler_fn};
pub use service::{DebugService, ServiceConfig};
pub use session::{Session, SessionError, SessionMode, SessionPhase};
pub use supervisor::{
    CommandSpawner, LaunchSpec, ProcessSpawner, ProcessSupervisor, SpawnError, SupervisorConfig,
    SupervisorError,
};
pub use version::{AdapterInfo, DEBUGLET_NAME, DEBUGLET_VERSION};
