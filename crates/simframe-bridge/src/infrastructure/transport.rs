//! Delivery seam between the bridge engine and whatever actually carries
//! frames to the simulator — a real embedding posts into an iframe-style
//! channel, tests swap in in-memory targets.
//!
//! The trait is deliberately synchronous and fire-and-forget: posting into
//! a cross-frame channel either hands the message off immediately or fails
//! immediately. Ordering guarantees come from the engine calling `post` in
//! send order, never from the target itself.

use std::sync::Mutex;

use simframe_core::SimMessage;
use thiserror::Error;
use tokio::sync::mpsc;

// ── Errors ──────────────────────────────────────────────────────────────────

/// Failure handing a message to the underlying channel.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The receiving side of the channel is gone (frame torn down,
    /// receiver dropped).
    #[error("delivery channel closed")]
    ChannelClosed,

    /// The target rejected the message for a reason of its own.
    #[error("delivery rejected: {0}")]
    Rejected(String),
}

// ── Trait ───────────────────────────────────────────────────────────────────

/// Something the engine can deliver messages into.
///
/// Implementations must be cheap to call and must not block: the engine
/// invokes `post` under its channel lock to preserve call order.  For the
/// same reason an implementation must never call back into the bridge
/// from within `post`; queue the work and do it afterwards.
pub trait DeliveryTarget: Send + Sync {
    /// Hand one message to the frame. Synchronous fire-and-forget.
    fn post(&self, message: &SimMessage) -> Result<(), TransportError>;
}

// ── Channel-backed target ───────────────────────────────────────────────────

/// Delivery target backed by an unbounded tokio channel.
///
/// This is the seam a real embedding plugs a frame writer into: the
/// receiver half lives wherever the outbound frames get serialized onto
/// the actual transport.
pub struct ChannelTarget {
    tx: mpsc::UnboundedSender<SimMessage>,
}

impl ChannelTarget {
    /// Create a target and the receiver the embedding drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SimMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl DeliveryTarget for ChannelTarget {
    fn post(&self, message: &SimMessage) -> Result<(), TransportError> {
        self.tx
            .send(message.clone())
            .map_err(|_| TransportError::ChannelClosed)
    }
}

// ── Test doubles ────────────────────────────────────────────────────────────

/// Records every posted message for later inspection. Used throughout the
/// test suites; exported so integration tests can share it.
#[derive(Default)]
pub struct RecordingTarget {
    sent: Mutex<Vec<SimMessage>>,
}

impl RecordingTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything posted so far, in post order.
    pub fn sent(&self) -> Vec<SimMessage> {
        self.sent.lock().expect("recording lock poisoned").clone()
    }

    pub fn sent_len(&self) -> usize {
        self.sent.lock().expect("recording lock poisoned").len()
    }
}

impl DeliveryTarget for RecordingTarget {
    fn post(&self, message: &SimMessage) -> Result<(), TransportError> {
        self.sent
            .lock()
            .expect("recording lock poisoned")
            .push(message.clone());
        Ok(())
    }
}

/// Fails every post. Exercises the engine's delivery-fault path.
pub struct FailingTarget;

impl DeliveryTarget for FailingTarget {
    fn post(&self, _message: &SimMessage) -> Result<(), TransportError> {
        Err(TransportError::Rejected("target refuses delivery".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_target_forwards_in_order() {
        // Arrange
        let (target, mut rx) = ChannelTarget::new();
        let first = SimMessage::control(simframe_core::ControlAction::Start);
        let second = SimMessage::control(simframe_core::ControlAction::Stop);

        // Act
        target.post(&first).unwrap();
        target.post(&second).unwrap();

        // Assert
        assert_eq!(rx.try_recv().unwrap().id, first.id);
        assert_eq!(rx.try_recv().unwrap().id, second.id);
    }

    #[test]
    fn channel_target_reports_closed_receiver() {
        let (target, rx) = ChannelTarget::new();
        drop(rx);

        let result = target.post(&SimMessage::ready());
        assert!(matches!(result, Err(TransportError::ChannelClosed)));
    }

    #[test]
    fn recording_target_keeps_post_order() {
        let target = RecordingTarget::new();
        target.post(&SimMessage::load_project("p1")).unwrap();
        target.post(&SimMessage::load_project("p2")).unwrap();

        let sent = target.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].payload.project_id.as_deref(), Some("p1"));
        assert_eq!(sent[1].payload.project_id.as_deref(), Some("p2"));
    }
}
