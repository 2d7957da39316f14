//! Connection-time identification event.
//!
//! Sent once per session as the very first message, before any handshake
//! traffic, regardless of what the client does next.

use crate::bridge::protocol::{OutputCategory, OutputEventBody, Seq, event};
use crate::broker::{BrokerError, MessageBroker, to_body};
use crate::version::AdapterInfo;

pub fn telemetry_body(info: &AdapterInfo) -> OutputEventBody {
    OutputEventBody {
        output: info.name.clone(),
        data: Some(serde_json::json!({ "version": info.version })),
        category: OutputCategory::Telemetry,
    }
}

pub async fn emit_telemetry(broker: &MessageBroker, info: &AdapterInfo) -> Result<Seq, BrokerError> {
    let body = to_body(&telemetry_body(info))?;
    let seq = broker.send_event(event::OUTPUT, Some(body)).await?;
    tracing::debug!(seq, adapter = %info.name, version = %info.version, "Sent telemetry event");
    Ok(seq)
}
