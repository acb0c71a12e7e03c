//! Internal pipe message types.
//!
//! Engines and jobs talk back to the event core over three channels: the
//! `futures` pipe (fulfilled request parts), the `reaper` pipe (dead slave
//! disposal) and the `events` pipe (driver telemetry). Senders are cheap
//! clones; the receivers live in the reactor.

use std::collections::BTreeMap;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::slave::SlaveEvent;

/// One fulfilled part of an in-flight composite request.
#[derive(Debug, Clone)]
pub struct Fulfillment {
    /// Id of the owning request, resolved against the registry. Unknown
    /// ids are logged orphans, not errors.
    pub future: String,
    /// Part name, the application target the part belongs to.
    pub engine: String,
    pub result: Value,
}

/// Disposal request for a slave that reached the dead state.
#[derive(Debug, Clone)]
pub struct ReapRequest {
    pub engine: String,
    pub slave: Uuid,
}

/// Telemetry emitted by a driver inside a slave: a packed dictionary of
/// field name to raw blob.
#[derive(Debug, Clone)]
pub struct TelemetryEvent {
    pub driver: String,
    pub fields: BTreeMap<String, Vec<u8>>,
}

/// An inbound event from a worker process, addressed to its supervisor.
#[derive(Debug)]
pub struct SlaveMessage {
    pub engine: String,
    pub slave: Uuid,
    pub event: SlaveEvent,
}

/// Sender halves of the internal pipes, handed to every engine.
#[derive(Debug, Clone)]
pub struct CorePipes {
    pub futures: UnboundedSender<Fulfillment>,
    pub reaper: UnboundedSender<ReapRequest>,
}
