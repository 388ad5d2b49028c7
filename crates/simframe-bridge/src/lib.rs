//! # simframe-bridge
//!
//! Reliable, ordered, typed message bridge to an embedded simulator frame.
//!
//! The embedded simulator boots at its own pace inside a sandboxed frame the
//! host does not control, and the raw channel between host and frame has no
//! delivery guarantees.  This crate adds the guarantees an application needs:
//! messages sent before the frame is ready are queued and flushed in order,
//! a watchdog turns a dead frame into an explicit failure instead of a hang,
//! and every inbound message passes an origin and structure gate before any
//! listener sees it.
//!
//! # Architecture (clean architecture)
//!
//! ```text
//! Host application
//!         ↕
//! [simframe-bridge]
//!   ├── application/
//!   │     ├── engine/   MessageBridge: queueing, handshake, trust gate
//!   │     └── session/  SimulatorSession: load/inject/control, state view
//!   └── infrastructure/
//!         └── transport/ DeliveryTarget seam (channel-backed + test doubles)
//!         ↕
//! Simulator frame (JSON messages, untrusted origin)
//! ```
//!
//! # Layer rules
//!
//! - Protocol types, validation, and the domain model live in
//!   `simframe-core` (I/O-free).
//! - `application` depends on `simframe-core` and `tokio` only.
//! - `infrastructure` is the delivery seam; a real embedding plugs its frame
//!   writer into [`ChannelTarget`], tests use the in-memory doubles.
//!
//! # For beginners: why two layers over one channel?
//!
//! The engine is protocol-shaped: it moves validated messages and knows
//! nothing about *why* they are sent.  The session is application-shaped: it
//! knows that injecting code deserves a confirmation, that a project id
//! should not be blank, and what "the simulation is running" means.  Keeping
//! them apart means the tricky concurrency (queues, watchdog, listener
//! dispatch) is testable with nothing but an in-memory target.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use simframe_bridge::{ChannelTarget, MessageBridge, SimulatorSession};
//! use simframe_core::BridgeConfig;
//!
//! # async fn demo() -> Result<(), simframe_core::BridgeError> {
//! let bridge = MessageBridge::new(BridgeConfig::default());
//! let (target, mut outbound) = ChannelTarget::new();
//! bridge.initialize(Arc::new(target));
//! // ... pump `outbound` into the frame, feed frame messages into
//! // `bridge.handle_raw(origin, value)` ...
//!
//! let session = SimulatorSession::new(bridge);
//! session.load_project("arduino-blink").await?;
//! session.inject_code("void setup() {}", "sketch.ino").await?;
//! session.start_simulation().await?;
//! # Ok(())
//! # }
//! ```

/// Application layer: the protocol engine and the session orchestrator.
pub mod application;

/// Infrastructure layer: the outbound delivery seam.
pub mod infrastructure;

pub use application::engine::{
    BridgeEvent, BridgeStats, EventKey, ListenerId, MessageBridge,
};
pub use application::session::{CallbackId, DebugInfo, SimulatorSession};
pub use infrastructure::transport::{
    ChannelTarget, DeliveryTarget, FailingTarget, RecordingTarget, TransportError,
};
