//! All SimFrame message types — the JSON "language" spoken across the frame
//! boundary.
//!
//! The host application and the embedded Wokwi simulator frame exchange JSON
//! envelopes.  Every envelope has the same four-field shape regardless of what
//! it carries:
//!
//! ```json
//! {
//!   "type": "simulation-control",
//!   "payload": { "action": "start" },
//!   "timestamp": 1714000000000,
//!   "id": "msg-550e8400-e29b-41d4-a716-446655440000"
//! }
//! ```
//!
//! # Why one payload record instead of one struct per type?
//!
//! The frame protocol is *not* tagged per-variant: the simulator fills in
//! whichever payload fields apply to the message type and omits the rest.
//! [`MessagePayload`] mirrors that with all-optional fields, which keeps
//! deserialization total over anything the frame might send.  Shape-level
//! payload checks belong to the session layer, not the envelope (see
//! `protocol::validate` for what the envelope gate does and does not check).
//!
//! # Wire names
//!
//! Field names on the wire are camelCase (`projectId`, `fileUpdate`) and the
//! type discriminants are the kebab-case strings the simulator emits,
//! including the simulator-prefixed `wokwi-ready` handshake signal and the
//! `wokwi:file:updated` response alias.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::state::{CustomChipData, FileUpdate, SimulationState};

// ── Message types ─────────────────────────────────────────────────────────────

/// Closed enumeration of every message type the bridge understands.
///
/// Host → frame: `LoadProject`, `InjectCode`, `SimulationControl`.
/// Frame → host: `InjectCodeResponse`, `StateUpdate`, `CustomChipEvent`,
/// `Ready`, `FileUpdated`.
///
/// `FileUpdated` is a response-only alias the simulator uses for file-update
/// confirmations; it is accepted by the validator but never sent by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Host asks the frame to load a simulation project by id.
    #[serde(rename = "load-project")]
    LoadProject,
    /// Host pushes a source file into the running project.
    #[serde(rename = "inject-code")]
    InjectCode,
    /// Frame confirms (or rejects) a prior code injection.
    #[serde(rename = "inject-code-response")]
    InjectCodeResponse,
    /// Host starts, stops, or resets the simulation.
    #[serde(rename = "simulation-control")]
    SimulationControl,
    /// Frame publishes a snapshot of the running simulation.
    #[serde(rename = "state-update")]
    StateUpdate,
    /// Frame publishes an event from a user-defined custom chip.
    #[serde(rename = "custom-chip-event")]
    CustomChipEvent,
    /// Frame announces it has finished booting and can receive commands.
    ///
    /// This is the handshake signal: the first trusted `wokwi-ready` flips
    /// the bridge to its ready state and drains the pending queue.
    #[serde(rename = "wokwi-ready")]
    Ready,
    /// Response-only alias the simulator emits after applying a file update.
    #[serde(rename = "wokwi:file:updated")]
    FileUpdated,
}

impl MessageType {
    /// Returns the wire string for this type, e.g. `"simulation-control"`.
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            MessageType::LoadProject => "load-project",
            MessageType::InjectCode => "inject-code",
            MessageType::InjectCodeResponse => "inject-code-response",
            MessageType::SimulationControl => "simulation-control",
            MessageType::StateUpdate => "state-update",
            MessageType::CustomChipEvent => "custom-chip-event",
            MessageType::Ready => "wokwi-ready",
            MessageType::FileUpdated => "wokwi:file:updated",
        }
    }

    /// Returns `true` for types whose loss would silently break the session.
    ///
    /// A `simulation-control` or `inject-code` that never reaches the frame
    /// leaves the caller waiting on a state change that will never come, so
    /// `send` treats these specially before the handshake completes: the
    /// caller is suspended until the frame is ready (or the handshake fails)
    /// instead of getting a fire-and-forget enqueue.
    pub fn is_high_priority(&self) -> bool {
        matches!(
            self,
            MessageType::SimulationControl | MessageType::InjectCode
        )
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_wire_str())
    }
}

// ── Simulation control actions ────────────────────────────────────────────────

/// The three control verbs understood by the simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Start,
    Stop,
    Reset,
}

// ── Payload ───────────────────────────────────────────────────────────────────

/// The variant record carried by every message.
///
/// All fields are optional: each message type populates the subset that is
/// meaningful for it and the rest are omitted from the JSON entirely.
/// The envelope validator only requires that a `payload` object is *present*;
/// which fields it holds is the session layer's concern.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MessagePayload {
    /// Project to load (`load-project`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,

    /// Raw source text (`inject-code`, legacy form without `fileUpdate`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// Control verb (`simulation-control`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<ControlAction>,

    /// Simulation snapshot (`state-update`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<SimulationState>,

    /// Custom chip data (`custom-chip-event`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chip_data: Option<CustomChipData>,

    /// File being injected or confirmed (`inject-code`, confirmations).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_update: Option<FileUpdate>,

    /// Explicit success flag on responses.
    ///
    /// Absent means success; only an explicit `false` marks a rejection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,

    /// Human-readable failure reason accompanying `success: false`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// A single message crossing the frame boundary, in either direction.
///
/// Invariant: a message is valid only if it carries all four fields and
/// `msg_type` is a member of [`MessageType`].  The `id` is an opaque token
/// used for log correlation only — response matching is by type + payload
/// shape, never by id (the simulator does not echo request ids back).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimMessage {
    /// Message discriminant.
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    /// Type-dependent payload record.
    pub payload: MessagePayload,
    /// Milliseconds since the Unix epoch at send time.
    pub timestamp: u64,
    /// Opaque unique token (`msg-<uuid4>`).
    pub id: String,
}

impl SimMessage {
    /// Builds a message with a fresh id and the current timestamp.
    pub fn new(msg_type: MessageType, payload: MessagePayload) -> Self {
        Self {
            msg_type,
            payload,
            timestamp: now_millis(),
            id: generate_message_id(),
        }
    }

    /// Builds a `load-project` request.
    pub fn load_project(project_id: impl Into<String>) -> Self {
        Self::new(
            MessageType::LoadProject,
            MessagePayload {
                project_id: Some(project_id.into()),
                ..Default::default()
            },
        )
    }

    /// Builds an `inject-code` request carrying a file update.
    pub fn inject_code(file_update: FileUpdate) -> Self {
        Self::new(
            MessageType::InjectCode,
            MessagePayload {
                file_update: Some(file_update),
                ..Default::default()
            },
        )
    }

    /// Builds a `simulation-control` request.
    pub fn control(action: ControlAction) -> Self {
        Self::new(
            MessageType::SimulationControl,
            MessagePayload {
                action: Some(action),
                ..Default::default()
            },
        )
    }

    /// Builds the handshake signal the frame sends when it has booted.
    ///
    /// The host never sends this; it exists for tests and for
    /// `force_ready`-style synthesis.
    pub fn ready() -> Self {
        Self::new(MessageType::Ready, MessagePayload::default())
    }
}

// ── Id and time helpers ───────────────────────────────────────────────────────

/// Generates an opaque unique message id.
///
/// UUIDs make collisions a non-concern without any shared counter; the id is
/// only ever used to correlate log lines, so nothing depends on its format.
pub fn generate_message_id() -> String {
    format!("msg-{}", Uuid::new_v4())
}

/// Milliseconds since the Unix epoch, the timestamp unit the frame protocol
/// uses (it is what `Date.now()` produces on the simulator side).
///
/// A clock before the epoch yields 0 rather than panicking.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
