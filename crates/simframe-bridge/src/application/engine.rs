//! The bridge protocol engine.
//!
//! [`MessageBridge`] owns one logical channel to a simulator frame and
//! gives callers three guarantees the raw channel does not have:
//!
//! 1. **No lost commands across the startup race.** Messages sent before
//!    the frame's ready signal are queued (bounded, oldest evicted) and
//!    flushed in FIFO order the moment the handshake completes.
//! 2. **No hung callers.** A watchdog re-arms the handshake wait up to a
//!    configured retry budget, then fails every pending waiter with a
//!    load-class fault instead of letting them block forever.
//! 3. **No untrusted input.** Every inbound message passes an origin
//!    allow-list and a structural envelope check before any listener
//!    sees it; failures are dropped, never surfaced as panics.
//!
//! The engine is `Clone` and shares its state behind an `Arc`, so an
//! embedding can hand clones to its inbound pump, its orchestrator, and
//! its diagnostics surface without coordination.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use simframe_core::{
    validate_envelope, BridgeConfig, BridgeError, Fault, FaultKind, MessageType, OriginPolicy,
    SimMessage,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::infrastructure::transport::DeliveryTarget;

// ── Events and listener bookkeeping ─────────────────────────────────────────

/// What a listener can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKey {
    /// Every inbound frame message, regardless of type.
    Any,
    /// Inbound frame messages of one specific type.
    Message(MessageType),
    /// The handshake completed.
    Ready,
    /// A handshake watchdog attempt elapsed and a retry started.
    ReadyRetry,
    /// An observable fault was recorded.
    Error,
}

/// The value handed to listeners.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// A validated inbound message.
    Message(SimMessage),
    /// The handshake completed (pending queue already flushed).
    Ready,
    /// Watchdog attempt `retry` of `max_retries` elapsed without a ready
    /// signal.
    ReadyRetry { retry: u32, max_retries: u32 },
    /// An observable fault.
    Fault(Fault),
}

/// Handle returned by [`MessageBridge::on`]; pass it to [`MessageBridge::off`]
/// to unsubscribe.
pub type ListenerId = u64;

type Callback = Arc<dyn Fn(&BridgeEvent) + Send + Sync>;

#[derive(Default)]
struct ListenerTable {
    next_id: ListenerId,
    entries: HashMap<EventKey, Vec<(ListenerId, Callback)>>,
}

impl ListenerTable {
    fn add(&mut self, key: EventKey, callback: Callback) -> ListenerId {
        self.next_id += 1;
        let id = self.next_id;
        self.entries.entry(key).or_default().push((id, callback));
        id
    }

    fn remove(&mut self, key: EventKey, id: ListenerId) -> bool {
        match self.entries.get_mut(&key) {
            Some(list) => {
                let before = list.len();
                list.retain(|(entry_id, _)| *entry_id != id);
                before != list.len()
            }
            None => false,
        }
    }

    fn snapshot(&self, key: EventKey) -> Vec<Callback> {
        self.entries
            .get(&key)
            .map(|list| list.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default()
    }
}

// ── Handshake phases ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum HandshakePhase {
    /// Waiting for the frame's ready signal.
    Pending,
    /// Handshake complete, pending queue flushed.
    Ready,
    /// Handshake will not complete in this epoch.
    Failed(HandshakeFailure),
}

#[derive(Debug, Clone)]
enum HandshakeFailure {
    TimedOut { retries: u32, timeout: Duration },
    Reset,
}

impl HandshakeFailure {
    fn to_error(&self) -> BridgeError {
        match self {
            HandshakeFailure::TimedOut { retries, timeout } => BridgeError::HandshakeTimeout {
                retries: *retries,
                timeout: *timeout,
            },
            HandshakeFailure::Reset => BridgeError::Reset,
        }
    }
}

// ── Diagnostics ─────────────────────────────────────────────────────────────

/// Counters and sizes exposed for debugging surfaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeStats {
    pub ready: bool,
    pub sent: u64,
    pub delivery_errors: u64,
    pub pending_len: usize,
    pub history_len: usize,
    pub retry_count: u32,
    pub watchdog_armed: bool,
    /// Wall-clock ms of the most recent successful delivery, if any.
    pub last_sent_at: Option<u64>,
}

// ── Engine internals ────────────────────────────────────────────────────────

struct ChannelState {
    target: Option<Arc<dyn DeliveryTarget>>,
    /// Bumped by initialize/reset so a stale watchdog tick (aborted, but
    /// already mid-execution) cannot fail a newer epoch.
    epoch: u64,
    ready: bool,
    retry_count: u32,
    /// Messages sent before the handshake, oldest first.
    pending: VecDeque<SimMessage>,
    /// Diagnostic ring of traffic in both directions, oldest first.
    history: VecDeque<SimMessage>,
    sent: u64,
    delivery_errors: u64,
    /// Wall-clock ms of the most recent successful delivery.
    last_sent_at: Option<u64>,
}

impl ChannelState {
    fn new() -> Self {
        Self {
            target: None,
            epoch: 0,
            ready: false,
            retry_count: 0,
            pending: VecDeque::new(),
            history: VecDeque::new(),
            sent: 0,
            delivery_errors: 0,
            last_sent_at: None,
        }
    }
}

struct HandshakeCell {
    phase_tx: watch::Sender<HandshakePhase>,
    watchdog: Option<JoinHandle<()>>,
}

struct EngineInner {
    config: BridgeConfig,
    policy: OriginPolicy,
    enforce_origin: AtomicBool,
    chan: Mutex<ChannelState>,
    listeners: Mutex<ListenerTable>,
    handshake: Mutex<HandshakeCell>,
}

fn push_bounded(queue: &mut VecDeque<SimMessage>, capacity: usize, message: SimMessage) {
    if queue.len() >= capacity {
        let evicted = queue.pop_front();
        if let Some(evicted) = evicted {
            warn!(
                evicted_type = %evicted.msg_type,
                capacity,
                "queue full, evicting oldest message"
            );
        }
    }
    queue.push_back(message);
}

impl EngineInner {
    fn chan(&self) -> std::sync::MutexGuard<'_, ChannelState> {
        self.chan.lock().expect("channel lock poisoned")
    }

    fn listeners(&self) -> std::sync::MutexGuard<'_, ListenerTable> {
        self.listeners.lock().expect("listener lock poisoned")
    }

    fn handshake(&self) -> std::sync::MutexGuard<'_, HandshakeCell> {
        self.handshake.lock().expect("handshake lock poisoned")
    }

    fn set_phase(&self, phase: HandshakePhase) {
        // send_replace never fails: the sender half lives in self.
        self.handshake().phase_tx.send_replace(phase);
    }

    /// Start a fresh handshake epoch: waiters subscribed to the previous
    /// epoch are rejected with `Reset`, new subscribers see `Pending`.
    ///
    /// This needs a channel swap rather than two `send_replace` calls —
    /// a watch channel coalesces rapid updates, so a reject-then-pending
    /// pair on one channel could be observed as `Pending` alone.
    fn begin_epoch(&self) {
        let (phase_tx, _) = watch::channel(HandshakePhase::Pending);
        let previous = std::mem::replace(&mut self.handshake().phase_tx, phase_tx);
        previous.send_replace(HandshakePhase::Failed(HandshakeFailure::Reset));
    }

    fn cancel_watchdog(&self) {
        if let Some(handle) = self.handshake().watchdog.take() {
            handle.abort();
        }
    }

    /// Invoke listeners for `key`, each isolated from the others: a
    /// panicking listener is logged and skipped, never propagated.
    ///
    /// Callbacks run on the caller's thread with no engine locks held,
    /// so a listener may call back into the engine freely.
    fn dispatch(&self, key: EventKey, event: &BridgeEvent) {
        let callbacks = self.listeners().snapshot(key);
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                error!(?key, "listener panicked; continuing with remaining listeners");
            }
        }
    }

    fn emit_fault(&self, fault: Fault) {
        warn!(kind = ?fault.kind, message = %fault.message, "bridge fault");
        self.dispatch(EventKey::Error, &BridgeEvent::Fault(fault));
    }

    /// Deliver one message to the attached target and record it in history.
    ///
    /// The post happens under the channel lock so concurrent senders cannot
    /// interleave out of call order. The communication fault on failure is
    /// dispatched after the lock is released.
    fn deliver_now(&self, message: &SimMessage) -> Result<(), BridgeError> {
        let post_result = {
            let mut chan = self.chan();
            let target = chan.target.clone().ok_or(BridgeError::NotAttached)?;
            match target.post(message) {
                Ok(()) => {
                    chan.sent += 1;
                    chan.last_sent_at = Some(simframe_core::protocol::now_millis());
                    push_bounded(
                        &mut chan.history,
                        self.config.history_capacity,
                        message.clone(),
                    );
                    Ok(())
                }
                Err(e) => {
                    chan.delivery_errors += 1;
                    Err(e)
                }
            }
        };

        match post_result {
            Ok(()) => {
                debug!(msg_type = %message.msg_type, id = %message.id, "message delivered");
                Ok(())
            }
            Err(e) => {
                self.emit_fault(
                    Fault::new(
                        FaultKind::Communication,
                        format!("failed to deliver {}: {e}", message.msg_type),
                    )
                    .with_context(json!({ "messageId": message.id })),
                );
                Err(BridgeError::Delivery(e.to_string()))
            }
        }
    }

    /// First trusted ready signal: flush the pending queue FIFO, then wake
    /// waiters and fire the ready event. Duplicates are ignored here (the
    /// caller still records them in history and dispatches type listeners).
    fn handle_ready_signal(&self) {
        let drained = {
            let mut chan = self.chan();
            if chan.ready {
                debug!("duplicate ready signal, already handshaken");
                return;
            }
            chan.ready = true;
            chan.retry_count = 0;
            std::mem::take(&mut chan.pending)
        };
        self.cancel_watchdog();

        let flushed = drained.len();
        for message in drained {
            // One failed flush entry must not starve the ones behind it;
            // deliver_now already emitted the communication fault.
            if let Err(e) = self.deliver_now(&message) {
                warn!(msg_type = %message.msg_type, "pending flush delivery failed: {e}");
            }
        }

        self.set_phase(HandshakePhase::Ready);
        self.dispatch(EventKey::Ready, &BridgeEvent::Ready);
        info!(flushed, "simulator frame ready, pending queue flushed");
    }

}

/// Spawn the handshake watchdog for a fresh epoch.
///
/// The task holds only a `Weak` so a dropped engine tears it down, and it
/// self-terminates once the channel reports ready.
fn arm_watchdog(inner: &Arc<EngineInner>) {
    let weak = Arc::downgrade(inner);
    let timeout = inner.config.handshake_timeout;
    let max_retries = inner.config.max_handshake_retries;
    let epoch = inner.chan().epoch;

    let handle = tokio::spawn(async move {
        loop {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else { return };

            let attempt = {
                let mut chan = inner.chan();
                if chan.ready || chan.epoch != epoch {
                    return;
                }
                chan.retry_count += 1;
                chan.retry_count
            };

            if attempt < max_retries {
                warn!(
                    attempt,
                    max_retries,
                    timeout_ms = timeout.as_millis() as u64,
                    "no ready signal, retrying handshake wait"
                );
                inner.dispatch(
                    EventKey::ReadyRetry,
                    &BridgeEvent::ReadyRetry {
                        retry: attempt,
                        max_retries,
                    },
                );
            } else {
                error!(
                    attempts = attempt,
                    "simulator frame never signalled ready, giving up"
                );
                inner.emit_fault(
                    Fault::new(FaultKind::Load, "simulator frame failed to become ready")
                        .with_context(json!({
                            "retries": attempt,
                            "timeoutMs": timeout.as_millis() as u64,
                        })),
                );
                inner.set_phase(HandshakePhase::Failed(HandshakeFailure::TimedOut {
                    retries: attempt,
                    timeout,
                }));
                return;
            }
        }
    });

    let previous = inner.handshake().watchdog.replace(handle);
    if let Some(previous) = previous {
        previous.abort();
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if let Ok(mut cell) = self.handshake.lock() {
            if let Some(handle) = cell.watchdog.take() {
                handle.abort();
            }
        }
    }
}

// ── Public engine handle ────────────────────────────────────────────────────

/// Reliable, ordered, validated message channel to one simulator frame.
///
/// Cheap to clone; all clones share the same channel state.
#[derive(Clone)]
pub struct MessageBridge {
    inner: Arc<EngineInner>,
}

impl MessageBridge {
    /// Build an engine with the given tunables. The origin allow-list is
    /// derived from the config (`dev_mode` adds loopback origins).
    pub fn new(config: BridgeConfig) -> Self {
        let policy = OriginPolicy::new().dev_mode(config.dev_mode);
        Self::with_policy(config, policy)
    }

    /// Build an engine with an explicit origin policy, for embeddings that
    /// proxy the simulator from their own domain.
    pub fn with_policy(config: BridgeConfig, policy: OriginPolicy) -> Self {
        let (phase_tx, _) = watch::channel(HandshakePhase::Pending);
        let enforce = config.enforce_origin;
        Self {
            inner: Arc::new(EngineInner {
                config,
                policy,
                enforce_origin: AtomicBool::new(enforce),
                chan: Mutex::new(ChannelState::new()),
                listeners: Mutex::new(ListenerTable::default()),
                handshake: Mutex::new(HandshakeCell {
                    phase_tx,
                    watchdog: None,
                }),
            }),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Attach a delivery target and start a fresh handshake epoch.
    ///
    /// Re-entrant: calling again resets the channel as if newly built —
    /// queues cleared, counters zeroed, previous watchdog cancelled, and
    /// callers suspended in [`wait_for_ready`](Self::wait_for_ready) from
    /// the previous epoch rejected with [`BridgeError::Reset`].
    ///
    /// Must be called from within a tokio runtime (spawns the watchdog).
    pub fn initialize(&self, target: Arc<dyn DeliveryTarget>) {
        self.inner.cancel_watchdog();
        {
            let mut chan = self.inner.chan();
            chan.target = Some(target);
            chan.epoch += 1;
            chan.ready = false;
            chan.retry_count = 0;
            chan.pending.clear();
            chan.history.clear();
            chan.sent = 0;
            chan.delivery_errors = 0;
            chan.last_sent_at = None;
        }
        self.inner.begin_epoch();
        arm_watchdog(&self.inner);
        info!(
            timeout_ms = self.inner.config.handshake_timeout.as_millis() as u64,
            max_retries = self.inner.config.max_handshake_retries,
            "bridge initialized, waiting for frame ready signal"
        );
    }

    /// Return the channel to its pre-initialize state: not ready, queues
    /// and counters cleared, every listener dropped, watchdog cancelled.
    /// Suspended `wait_for_ready` callers are rejected with
    /// [`BridgeError::Reset`]. The delivery target stays attached.
    pub fn reset(&self) {
        self.inner.cancel_watchdog();
        {
            let mut chan = self.inner.chan();
            chan.epoch += 1;
            chan.ready = false;
            chan.retry_count = 0;
            chan.pending.clear();
            chan.history.clear();
            chan.sent = 0;
            chan.delivery_errors = 0;
            chan.last_sent_at = None;
        }
        self.inner.set_phase(HandshakePhase::Failed(HandshakeFailure::Reset));
        *self.inner.listeners() = ListenerTable::default();
        info!("bridge reset");
    }

    /// [`reset`](Self::reset), then detach the delivery target.  The engine
    /// may be re-initialized later.
    pub fn destroy(&self) {
        self.reset();
        self.inner.chan().target = None;
        info!("bridge destroyed, delivery target detached");
    }

    /// Force the ready transition without a frame signal.  Debug/test
    /// escape hatch; a no-op when already ready.
    pub fn force_ready(&self) {
        warn!("forcing ready state without a frame handshake");
        self.inner.handle_ready_signal();
    }

    // ── Outbound ────────────────────────────────────────────────────────

    /// Send one message to the frame.
    ///
    /// After the handshake the message is delivered immediately, in call
    /// order.  Before the handshake it is queued (bounded, oldest evicted);
    /// ordinary types return `Ok` right away, while high-priority types
    /// (`simulation-control`, `inject-code`) suspend the caller until the
    /// handshake completes — the queued copy is the one delivered, exactly
    /// once, by the FIFO flush — or fail with the handshake's outcome.
    pub async fn send(&self, message: SimMessage) -> Result<(), BridgeError> {
        let raw = serde_json::to_value(&message).map_err(|_| BridgeError::InvalidMessage)?;
        if !validate_envelope(&raw) {
            return Err(BridgeError::InvalidMessage);
        }

        let msg_type = message.msg_type;
        let high_priority = {
            // Ready check and enqueue under one lock scope, so a ready
            // transition cannot slip between them and strand the message
            // behind an already-completed flush.
            let mut chan = self.inner.chan();
            if chan.target.is_none() {
                return Err(BridgeError::NotAttached);
            }
            if chan.ready {
                drop(chan);
                return self.inner.deliver_now(&message);
            }
            push_bounded(&mut chan.pending, self.inner.config.queue_capacity, message);
            msg_type.is_high_priority()
        };

        debug!(%msg_type, high_priority, "frame not ready, message queued");
        if high_priority {
            // Delivery itself happens inside the flush; this wait only
            // ties the caller's outcome to the handshake.
            self.wait_for_ready().await?;
        }
        Ok(())
    }

    /// Suspend until the handshake completes, or fail with the handshake's
    /// outcome (timeout budget exhausted, or reset).
    pub async fn wait_for_ready(&self) -> Result<(), BridgeError> {
        let mut rx = self.inner.handshake().phase_tx.subscribe();
        loop {
            let phase = rx.borrow_and_update().clone();
            match phase {
                HandshakePhase::Ready => return Ok(()),
                HandshakePhase::Failed(failure) => return Err(failure.to_error()),
                HandshakePhase::Pending => {
                    rx.changed().await.map_err(|_| BridgeError::Reset)?;
                }
            }
        }
    }

    // ── Inbound ─────────────────────────────────────────────────────────

    /// Feed one raw inbound message through the trust gate.
    ///
    /// Gate order: origin allow-list, structural envelope validation, typed
    /// decode.  Anything that fails is logged and dropped (an untrusted
    /// origin additionally records a security fault).  Survivors are
    /// appended to history and dispatched to type-specific listeners and
    /// then wildcard listeners, in registration order.
    pub fn handle_raw(&self, origin: &str, raw: Value) {
        if self.inner.enforce_origin.load(Ordering::Relaxed)
            && !self.inner.policy.is_trusted(origin)
        {
            let rejection = BridgeError::UntrustedOrigin(origin.to_owned());
            warn!("rejected inbound message: {rejection}");
            self.inner.emit_fault(
                Fault::new(FaultKind::Security, rejection.to_string())
                    .with_context(json!({ "origin": origin })),
            );
            return;
        }

        if !validate_envelope(&raw) {
            warn!(%origin, "discarding malformed frame message");
            return;
        }

        let message: SimMessage = match serde_json::from_value(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(%origin, "discarding undecodable frame message: {e}");
                return;
            }
        };

        if message.msg_type == MessageType::Ready {
            self.inner.handle_ready_signal();
        }

        {
            let mut chan = self.inner.chan();
            push_bounded(
                &mut chan.history,
                self.inner.config.history_capacity,
                message.clone(),
            );
        }

        debug!(msg_type = %message.msg_type, id = %message.id, "inbound message accepted");
        self.inner.dispatch(
            EventKey::Message(message.msg_type),
            &BridgeEvent::Message(message.clone()),
        );
        self.inner
            .dispatch(EventKey::Any, &BridgeEvent::Message(message));
    }

    // ── Listeners ───────────────────────────────────────────────────────

    /// Register a listener; the returned id unsubscribes via [`off`](Self::off).
    pub fn on(
        &self,
        key: EventKey,
        callback: impl Fn(&BridgeEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.listeners().add(key, Arc::new(callback))
    }

    /// Unsubscribe; returns `false` if the id was already gone.
    pub fn off(&self, key: EventKey, id: ListenerId) -> bool {
        self.inner.listeners().remove(key, id)
    }

    // ── Introspection ───────────────────────────────────────────────────

    pub fn is_ready(&self) -> bool {
        self.inner.chan().ready
    }

    /// Confirmation window the session layer uses for request/response
    /// operations.
    pub fn confirm_timeout(&self) -> Duration {
        self.inner.config.confirm_timeout
    }

    /// Toggle origin enforcement at runtime (tests, local dev).
    pub fn set_security_enforced(&self, enforced: bool) {
        if !enforced {
            warn!("origin enforcement disabled, all origins trusted");
        }
        self.inner.enforce_origin.store(enforced, Ordering::Relaxed);
    }

    /// Diagnostic ring of recent traffic, oldest first.
    pub fn history(&self) -> Vec<SimMessage> {
        self.inner.chan().history.iter().cloned().collect()
    }

    pub fn stats(&self) -> BridgeStats {
        let chan = self.inner.chan();
        BridgeStats {
            ready: chan.ready,
            sent: chan.sent,
            delivery_errors: chan.delivery_errors,
            pending_len: chan.pending.len(),
            history_len: chan.history.len(),
            retry_count: chan.retry_count,
            watchdog_armed: self.inner.handshake().watchdog.is_some(),
            last_sent_at: chan.last_sent_at,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::transport::{FailingTarget, RecordingTarget};
    use simframe_core::ControlAction;
    use std::sync::atomic::AtomicUsize;

    fn test_config() -> BridgeConfig {
        BridgeConfig {
            handshake_timeout: Duration::from_millis(40),
            max_handshake_retries: 3,
            queue_capacity: 4,
            history_capacity: 4,
            confirm_timeout: Duration::from_millis(100),
            enforce_origin: true,
            dev_mode: false,
        }
    }

    fn ready_envelope() -> Value {
        serde_json::to_value(SimMessage::ready()).unwrap()
    }

    fn trusted(bridge: &MessageBridge, raw: Value) {
        bridge.handle_raw("https://wokwi.com", raw);
    }

    #[tokio::test]
    async fn send_before_initialize_is_rejected() {
        let bridge = MessageBridge::new(test_config());

        let result = bridge.send(SimMessage::load_project("p1")).await;

        assert!(matches!(result, Err(BridgeError::NotAttached)));
    }

    #[tokio::test]
    async fn ordinary_send_before_ready_queues_without_blocking() {
        // Arrange
        let bridge = MessageBridge::new(test_config());
        let target = Arc::new(RecordingTarget::new());
        bridge.initialize(target.clone());

        // Act
        bridge.send(SimMessage::load_project("p1")).await.unwrap();

        // Assert: queued, nothing delivered yet
        assert_eq!(target.sent_len(), 0);
        assert_eq!(bridge.stats().pending_len, 1);
    }

    #[tokio::test]
    async fn ready_flushes_pending_in_fifo_order() {
        let bridge = MessageBridge::new(test_config());
        let target = Arc::new(RecordingTarget::new());
        bridge.initialize(target.clone());

        bridge.send(SimMessage::load_project("first")).await.unwrap();
        bridge.send(SimMessage::load_project("second")).await.unwrap();
        trusted(&bridge, ready_envelope());

        let sent = target.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].payload.project_id.as_deref(), Some("first"));
        assert_eq!(sent[1].payload.project_id.as_deref(), Some("second"));
        assert_eq!(bridge.stats().pending_len, 0);
        assert!(bridge.is_ready());
    }

    #[tokio::test]
    async fn high_priority_send_resumes_after_flush_and_delivers_once() {
        let bridge = MessageBridge::new(test_config());
        let target = Arc::new(RecordingTarget::new());
        bridge.initialize(target.clone());

        let sender = {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                bridge.send(SimMessage::control(ControlAction::Start)).await
            })
        };
        // Let the sender reach its suspended wait.
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(bridge.stats().pending_len, 1);

        trusted(&bridge, ready_envelope());
        sender.await.unwrap().unwrap();

        // Exactly one copy on the wire, no duplicate from the resumed caller.
        let sent = target.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].msg_type, MessageType::SimulationControl);
    }

    #[tokio::test]
    async fn high_priority_send_fails_when_handshake_times_out() {
        let mut config = test_config();
        config.handshake_timeout = Duration::from_millis(10);
        config.max_handshake_retries = 2;
        let bridge = MessageBridge::new(config);
        bridge.initialize(Arc::new(RecordingTarget::new()));

        let result = bridge.send(SimMessage::control(ControlAction::Start)).await;

        assert!(matches!(
            result,
            Err(BridgeError::HandshakeTimeout { retries: 2, .. })
        ));
    }

    #[tokio::test]
    async fn send_after_ready_delivers_immediately() {
        let bridge = MessageBridge::new(test_config());
        let target = Arc::new(RecordingTarget::new());
        bridge.initialize(target.clone());
        trusted(&bridge, ready_envelope());

        bridge.send(SimMessage::control(ControlAction::Stop)).await.unwrap();

        assert_eq!(target.sent_len(), 1);
        let stats = bridge.stats();
        assert_eq!(stats.sent, 1);
        assert!(stats.last_sent_at.is_some());
    }

    #[tokio::test]
    async fn pending_queue_evicts_oldest_on_overflow() {
        let bridge = MessageBridge::new(test_config()); // capacity 4
        let target = Arc::new(RecordingTarget::new());
        bridge.initialize(target.clone());

        for i in 0..6 {
            bridge
                .send(SimMessage::load_project(format!("p{i}")))
                .await
                .unwrap();
        }
        trusted(&bridge, ready_envelope());

        // Most recent 4 survive, in order.
        let ids: Vec<_> = target
            .sent()
            .iter()
            .map(|m| m.payload.project_id.clone().unwrap())
            .collect();
        assert_eq!(ids, vec!["p2", "p3", "p4", "p5"]);
    }

    #[tokio::test]
    async fn duplicate_ready_skips_transition_but_reaches_listeners() {
        let bridge = MessageBridge::new(test_config());
        bridge.initialize(Arc::new(RecordingTarget::new()));

        let ready_events = Arc::new(AtomicUsize::new(0));
        let ready_messages = Arc::new(AtomicUsize::new(0));
        {
            let counter = ready_events.clone();
            bridge.on(EventKey::Ready, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        {
            let counter = ready_messages.clone();
            bridge.on(EventKey::Message(MessageType::Ready), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        trusted(&bridge, ready_envelope());
        trusted(&bridge, ready_envelope());

        // One transition, but both signals hit history and type listeners.
        assert_eq!(ready_events.load(Ordering::SeqCst), 1);
        assert_eq!(ready_messages.load(Ordering::SeqCst), 2);
        assert_eq!(bridge.history().len(), 2);
    }

    #[tokio::test]
    async fn untrusted_origin_is_dropped_with_security_fault() {
        let bridge = MessageBridge::new(test_config());
        bridge.initialize(Arc::new(RecordingTarget::new()));

        let faults = Arc::new(Mutex::new(Vec::new()));
        {
            let faults = faults.clone();
            bridge.on(EventKey::Error, move |event| {
                if let BridgeEvent::Fault(fault) = event {
                    faults.lock().unwrap().push(fault.clone());
                }
            });
        }

        bridge.handle_raw("https://evil.example", ready_envelope());

        assert!(!bridge.is_ready());
        assert!(bridge.history().is_empty());
        let faults = faults.lock().unwrap();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].kind, FaultKind::Security);
    }

    #[tokio::test]
    async fn disabling_enforcement_admits_any_origin() {
        let bridge = MessageBridge::new(test_config());
        bridge.initialize(Arc::new(RecordingTarget::new()));
        bridge.set_security_enforced(false);

        bridge.handle_raw("https://evil.example", ready_envelope());

        assert!(bridge.is_ready());
    }

    #[tokio::test]
    async fn malformed_envelope_is_dropped_silently() {
        let bridge = MessageBridge::new(test_config());
        bridge.initialize(Arc::new(RecordingTarget::new()));

        let faults = Arc::new(AtomicUsize::new(0));
        {
            let faults = faults.clone();
            bridge.on(EventKey::Error, move |_| {
                faults.fetch_add(1, Ordering::SeqCst);
            });
        }

        trusted(&bridge, json!({ "type": "wokwi-ready" })); // missing fields
        trusted(&bridge, json!({ "type": "no-such-type", "payload": {}, "timestamp": 1, "id": "x" }));
        trusted(&bridge, json!("not an object"));

        assert!(!bridge.is_ready());
        assert!(bridge.history().is_empty());
        assert_eq!(faults.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn watchdog_emits_retries_then_load_fault() {
        let mut config = test_config();
        config.handshake_timeout = Duration::from_millis(10);
        config.max_handshake_retries = 3;
        let bridge = MessageBridge::new(config);

        let retries = Arc::new(AtomicUsize::new(0));
        let faults = Arc::new(Mutex::new(Vec::new()));
        {
            let retries = retries.clone();
            bridge.on(EventKey::ReadyRetry, move |_| {
                retries.fetch_add(1, Ordering::SeqCst);
            });
        }
        {
            let faults = faults.clone();
            bridge.on(EventKey::Error, move |event| {
                if let BridgeEvent::Fault(fault) = event {
                    faults.lock().unwrap().push(fault.clone());
                }
            });
        }
        bridge.initialize(Arc::new(RecordingTarget::new()));

        let outcome = bridge.wait_for_ready().await;

        assert!(matches!(
            outcome,
            Err(BridgeError::HandshakeTimeout { retries: 3, .. })
        ));
        assert_eq!(retries.load(Ordering::SeqCst), 2);
        let faults = faults.lock().unwrap();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].kind, FaultKind::Load);
        let context = faults[0].context.as_ref().unwrap();
        assert_eq!(context["retries"], 3);
        assert_eq!(context["timeoutMs"], 10);
    }

    #[tokio::test]
    async fn ready_signal_disarms_watchdog() {
        let bridge = MessageBridge::new(test_config());
        bridge.initialize(Arc::new(RecordingTarget::new()));
        assert!(bridge.stats().watchdog_armed);

        trusted(&bridge, ready_envelope());
        bridge.wait_for_ready().await.unwrap();

        // Past the would-be first expiry, still ready with no retries.
        tokio::time::sleep(Duration::from_millis(60)).await;
        let stats = bridge.stats();
        assert!(stats.ready);
        assert_eq!(stats.retry_count, 0);
    }

    #[tokio::test]
    async fn reset_rejects_waiters_and_clears_state() {
        let bridge = MessageBridge::new(test_config());
        let target = Arc::new(RecordingTarget::new());
        bridge.initialize(target.clone());
        bridge.send(SimMessage::load_project("p1")).await.unwrap();

        let listener_hits = Arc::new(AtomicUsize::new(0));
        {
            let hits = listener_hits.clone();
            bridge.on(EventKey::Any, move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        let waiter = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.wait_for_ready().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        bridge.reset();

        assert!(matches!(waiter.await.unwrap(), Err(BridgeError::Reset)));
        let stats = bridge.stats();
        assert_eq!(stats.pending_len, 0);
        assert_eq!(stats.history_len, 0);
        assert_eq!(stats.sent, 0);
        assert!(!stats.ready);

        // Listeners are gone: a late ready reaches nobody but still
        // performs the (fresh-epoch) transition.
        trusted(&bridge, ready_envelope());
        assert_eq!(listener_hits.load(Ordering::SeqCst), 0);
        assert_eq!(target.sent_len(), 0);
    }

    #[tokio::test]
    async fn reinitialize_starts_a_clean_epoch() {
        let bridge = MessageBridge::new(test_config());
        let first = Arc::new(RecordingTarget::new());
        bridge.initialize(first.clone());
        trusted(&bridge, ready_envelope());
        bridge.send(SimMessage::control(ControlAction::Start)).await.unwrap();
        assert_eq!(first.sent_len(), 1);

        let second = Arc::new(RecordingTarget::new());
        bridge.initialize(second.clone());

        assert!(!bridge.is_ready());
        assert_eq!(bridge.stats().sent, 0);
        trusted(&bridge, ready_envelope());
        bridge.send(SimMessage::control(ControlAction::Stop)).await.unwrap();
        assert_eq!(first.sent_len(), 1);
        assert_eq!(second.sent_len(), 1);
    }

    #[tokio::test]
    async fn destroy_detaches_target() {
        let bridge = MessageBridge::new(test_config());
        bridge.initialize(Arc::new(RecordingTarget::new()));

        bridge.destroy();

        let result = bridge.send(SimMessage::load_project("p1")).await;
        assert!(matches!(result, Err(BridgeError::NotAttached)));
    }

    #[tokio::test]
    async fn force_ready_flushes_without_frame_signal() {
        let bridge = MessageBridge::new(test_config());
        let target = Arc::new(RecordingTarget::new());
        bridge.initialize(target.clone());
        bridge.send(SimMessage::load_project("p1")).await.unwrap();

        bridge.force_ready();

        assert!(bridge.is_ready());
        assert_eq!(target.sent_len(), 1);
        bridge.wait_for_ready().await.unwrap();
    }

    #[tokio::test]
    async fn delivery_failure_emits_communication_fault_and_counts() {
        let bridge = MessageBridge::new(test_config());
        bridge.initialize(Arc::new(FailingTarget));
        trusted(&bridge, ready_envelope());

        let faults = Arc::new(Mutex::new(Vec::new()));
        {
            let faults = faults.clone();
            bridge.on(EventKey::Error, move |event| {
                if let BridgeEvent::Fault(fault) = event {
                    faults.lock().unwrap().push(fault.clone());
                }
            });
        }

        let result = bridge.send(SimMessage::control(ControlAction::Start)).await;

        assert!(matches!(result, Err(BridgeError::Delivery(_))));
        assert_eq!(bridge.stats().delivery_errors, 1);
        let faults = faults.lock().unwrap();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].kind, FaultKind::Communication);
    }

    #[tokio::test]
    async fn failed_flush_entry_does_not_starve_later_entries() {
        struct FailFirst {
            calls: AtomicUsize,
            recorded: RecordingTarget,
        }
        impl DeliveryTarget for FailFirst {
            fn post(
                &self,
                message: &SimMessage,
            ) -> Result<(), crate::infrastructure::transport::TransportError> {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(crate::infrastructure::transport::TransportError::Rejected(
                        "first post fails".into(),
                    ));
                }
                self.recorded.post(message)
            }
        }

        let bridge = MessageBridge::new(test_config());
        let target = Arc::new(FailFirst {
            calls: AtomicUsize::new(0),
            recorded: RecordingTarget::new(),
        });
        bridge.initialize(target.clone());
        bridge.send(SimMessage::load_project("doomed")).await.unwrap();
        bridge.send(SimMessage::load_project("survivor")).await.unwrap();

        trusted(&bridge, ready_envelope());

        let sent = target.recorded.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload.project_id.as_deref(), Some("survivor"));
    }

    #[tokio::test]
    async fn panicking_listener_does_not_poison_dispatch() {
        let bridge = MessageBridge::new(test_config());
        bridge.initialize(Arc::new(RecordingTarget::new()));

        let survivors = Arc::new(AtomicUsize::new(0));
        bridge.on(EventKey::Any, |_| panic!("listener bug"));
        {
            let survivors = survivors.clone();
            bridge.on(EventKey::Any, move |_| {
                survivors.fetch_add(1, Ordering::SeqCst);
            });
        }

        trusted(&bridge, ready_envelope());

        assert_eq!(survivors.load(Ordering::SeqCst), 1);
        assert!(bridge.is_ready());
    }

    #[tokio::test]
    async fn off_removes_exactly_one_listener() {
        let bridge = MessageBridge::new(test_config());
        bridge.initialize(Arc::new(RecordingTarget::new()));

        let hits = Arc::new(AtomicUsize::new(0));
        let first = {
            let hits = hits.clone();
            bridge.on(EventKey::Any, move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        {
            let hits = hits.clone();
            bridge.on(EventKey::Any, move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert!(bridge.off(EventKey::Any, first));
        assert!(!bridge.off(EventKey::Any, first));
        trusted(&bridge, ready_envelope());

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn history_is_a_bounded_ring_of_both_directions() {
        let bridge = MessageBridge::new(test_config()); // history capacity 4
        bridge.initialize(Arc::new(RecordingTarget::new()));
        trusted(&bridge, ready_envelope());

        for i in 0..5 {
            bridge
                .send(SimMessage::load_project(format!("p{i}")))
                .await
                .unwrap();
        }

        let history = bridge.history();
        assert_eq!(history.len(), 4);
        // Oldest entries (the ready signal and p0) were evicted.
        assert_eq!(history[0].payload.project_id.as_deref(), Some("p1"));
        assert_eq!(history[3].payload.project_id.as_deref(), Some("p4"));
    }

    #[tokio::test]
    async fn initialize_rejects_waiters_from_a_previous_epoch() {
        let bridge = MessageBridge::new(test_config());
        bridge.initialize(Arc::new(RecordingTarget::new()));

        let stale_waiter = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.wait_for_ready().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        bridge.initialize(Arc::new(RecordingTarget::new()));

        assert!(matches!(
            stale_waiter.await.unwrap(),
            Err(BridgeError::Reset)
        ));

        // A waiter from the new epoch resolves on the new handshake.
        trusted(&bridge, ready_envelope());
        bridge.wait_for_ready().await.unwrap();
    }
}
