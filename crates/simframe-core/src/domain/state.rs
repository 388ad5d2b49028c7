//! Domain entities describing the simulation and the host-side session view.
//!
//! These types mirror the JSON shapes the simulator publishes in
//! `state-update` and `custom-chip-event` payloads, plus the host-side
//! [`SessionState`] snapshot the orchestrator maintains for consuming UI.
//! Everything here is pure data: no I/O, no async, no clocks.

use serde::{Deserialize, Serialize};

use crate::error::Fault;
use crate::protocol::messages::SimMessage;

// ── Simulation snapshot (frame → host) ────────────────────────────────────────

/// A snapshot of the running simulation, published by the frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SimulationState {
    /// Whether the simulation clock is advancing.
    pub is_running: bool,
    /// Simulated runtime in milliseconds.
    pub runtime: u64,
    /// Per-component states (LEDs, buttons, chips...).
    pub components: Vec<ComponentState>,
    /// Recent serial monitor lines, when the frame chooses to include them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_output: Option<Vec<String>>,
}

/// State of one component on the simulated board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentState {
    /// Component identifier, e.g. `"led1"`.
    pub id: String,
    /// Component kind, e.g. `"wokwi-led"`.
    #[serde(rename = "type")]
    pub component_type: String,
    /// Component-specific value; shape varies per component kind.
    pub value: serde_json::Value,
    /// Pin states the component exposes.
    #[serde(default)]
    pub pins: Vec<PinState>,
}

/// State of a single pin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinState {
    /// Pin number on the board.
    pub number: u32,
    /// Digital or analog reading.
    pub value: PinValue,
    /// Pin direction/mode.
    pub mode: PinMode,
}

/// A pin reading — digital pins report booleans, analog pins report levels.
///
/// The frame protocol uses a bare JSON boolean or number here, so the enum is
/// untagged: serde picks the variant from the JSON value's own type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PinValue {
    Digital(bool),
    Level(f64),
}

/// Pin direction/mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinMode {
    Input,
    Output,
    Analog,
}

// ── Code injection (host → frame) ─────────────────────────────────────────────

/// A source file pushed into the running project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUpdate {
    /// Target filename inside the project, e.g. `"sketch.ino"`.
    pub filename: String,
    /// Full replacement content of the file.
    pub content: String,
    /// Content encoding; the frame only understands UTF-8 today.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

impl FileUpdate {
    /// The filenames the simulator accepts injections for.
    pub const ACCEPTED_FILENAMES: [&'static str; 3] = ["sketch.ino", "main.py", "main.cpp"];

    /// Builds a UTF-8 file update.
    pub fn utf8(filename: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            content: content.into(),
            encoding: Some("utf-8".to_string()),
        }
    }

    /// Returns `true` iff `filename` is one the simulator accepts.
    pub fn is_accepted_filename(filename: &str) -> bool {
        Self::ACCEPTED_FILENAMES.contains(&filename)
    }
}

// ── Custom chip events (frame → host) ─────────────────────────────────────────

/// Data attached to a `custom-chip-event` message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CustomChipData {
    /// Which custom chip produced the data, e.g. `"logic-analyzer-01"`.
    pub chip_id: String,
    /// Pin states the chip exposes.
    pub pins: Vec<PinState>,
    /// Events the chip emitted since the last update.
    pub custom_events: Vec<ChipEvent>,
}

/// One event emitted by a custom chip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChipEvent {
    /// The emitting chip.
    pub chip_id: String,
    /// Event name, e.g. `"signal-high"` or `"pin-change"`.
    pub event: String,
    /// Chip-specific data; shape varies per chip.
    pub data: serde_json::Value,
    /// Milliseconds since the Unix epoch at emission time.
    pub timestamp: u64,
}

// ── Host-side session view ────────────────────────────────────────────────────

/// Performance counters the orchestrator maintains for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceMetrics {
    /// Wall time of the last `load_project` call, in milliseconds.
    pub load_time_ms: u64,
    /// Request→confirmation latency samples (currently from code injection).
    pub message_latency_ms: Vec<u64>,
    /// Faults recorded since the last reset.
    pub error_count: u64,
    /// Milliseconds since the session was created (or simulated runtime,
    /// when the frame reports one).
    pub uptime_ms: u64,
}

/// Observable snapshot of one embedding session.
///
/// Mutated only by the session orchestrator; external callers read clones.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    /// The frame completed its handshake and can receive commands.
    pub loaded: bool,
    /// The simulation is currently running.
    pub running: bool,
    /// Project id from the last successful `load_project`, if any.
    pub current_project: Option<String>,
    /// Most recent frame-originated message.
    pub last_message: Option<SimMessage>,
    /// All faults since the last reset, oldest first.
    pub errors: Vec<Fault>,
    /// Diagnostics counters.
    pub performance: PerformanceMetrics,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
