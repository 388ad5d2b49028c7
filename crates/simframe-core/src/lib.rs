//! # simframe-core
//!
//! Shared library for SimFrame containing the frame message protocol, the
//! envelope validation gate, origin trust policy, and the pure domain model.
//!
//! This crate is the I/O-free foundation: it has zero dependencies on async
//! runtimes, sockets, or the hosting environment, which keeps every type in
//! it trivially unit-testable.
//!
//! # What SimFrame is
//!
//! SimFrame embeds a third-party, sandboxed circuit simulator (Wokwi) in an
//! iframe and exchanges structured commands and state updates with it across
//! an origin boundary the host does not control.  The channel has no delivery
//! guarantees of its own, so the bridge layer (the `simframe-bridge` crate)
//! adds ordering, queuing, handshake tracking, and trust gating on top of the
//! types defined here.
//!
//! - **`protocol`** – The JSON envelope every message travels in
//!   ([`SimMessage`]), the closed [`MessageType`] set, and the structural
//!   validator applied to every inbound and outbound value.
//!
//! - **`domain`** – Pure business types: the origin trust policy, the bridge
//!   configuration, and the simulation/session data model.
//!
//! - **`error`** – The caller-facing [`BridgeError`] taxonomy and the
//!   observable [`Fault`] record pushed to error listeners.

pub mod domain;
pub mod error;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `simframe_core::SimMessage` instead of the full module path.
pub use domain::config::BridgeConfig;
pub use domain::origin::OriginPolicy;
pub use domain::state::{
    CustomChipData, FileUpdate, PerformanceMetrics, SessionState, SimulationState,
};
pub use error::{BridgeError, Fault, FaultKind};
pub use protocol::messages::{ControlAction, MessagePayload, MessageType, SimMessage};
pub use protocol::validate::validate_envelope;
