//! High-level session orchestrator.
//!
//! [`SimulatorSession`] sits on top of a [`MessageBridge`] and exposes the
//! operations an embedding actually calls — load a project, inject code,
//! start/stop/reset the simulation — while maintaining an observable
//! [`SessionState`] snapshot and its own callback registries for messages,
//! state changes, and faults.
//!
//! The engine stays protocol-shaped (messages in, messages out); everything
//! that smells of application policy lives here: input validation before a
//! byte leaves the host, confirmation matching for code injection, and the
//! fault records pushed into session state.

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use serde_json::json;
use simframe_core::{
    BridgeError, ControlAction, Fault, FaultKind, FileUpdate, MessageType, SessionState,
    SimMessage,
};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::engine::{BridgeEvent, BridgeStats, EventKey, MessageBridge};

// ── Callback registry ───────────────────────────────────────────────────────

/// Handle for unregistering a session callback.
pub type CallbackId = u64;

struct CallbackSet<T> {
    next_id: CallbackId,
    entries: Vec<(CallbackId, Arc<dyn Fn(&T) + Send + Sync>)>,
}

impl<T> Default for CallbackSet<T> {
    fn default() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }
}

impl<T> CallbackSet<T> {
    fn add(&mut self, callback: Arc<dyn Fn(&T) + Send + Sync>) -> CallbackId {
        self.next_id += 1;
        self.entries.push((self.next_id, callback));
        self.next_id
    }

    fn remove(&mut self, id: CallbackId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        before != self.entries.len()
    }

    fn snapshot(&self) -> Vec<Arc<dyn Fn(&T) + Send + Sync>> {
        self.entries.iter().map(|(_, cb)| cb.clone()).collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

fn notify<T>(callbacks: &[Arc<dyn Fn(&T) + Send + Sync>], value: &T) {
    use std::panic::{catch_unwind, AssertUnwindSafe};
    for callback in callbacks {
        if catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
            tracing::error!("session callback panicked; continuing");
        }
    }
}

// ── Diagnostics ─────────────────────────────────────────────────────────────

/// Everything a debugging surface wants in one call.
#[derive(Debug)]
pub struct DebugInfo {
    pub state: SessionState,
    pub bridge: BridgeStats,
    pub history: Vec<SimMessage>,
    /// Registered session callbacks: (message, state-change, error).
    pub callback_counts: (usize, usize, usize),
}

// ── Session internals ───────────────────────────────────────────────────────

struct SessionInner {
    bridge: MessageBridge,
    confirm_timeout: Duration,
    started_at: Instant,
    state: Mutex<SessionState>,
    message_callbacks: Mutex<CallbackSet<SimMessage>>,
    state_callbacks: Mutex<CallbackSet<SessionState>>,
    error_callbacks: Mutex<CallbackSet<Fault>>,
}

impl SessionInner {
    fn state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().expect("session state lock poisoned")
    }

    /// Clone the snapshot outside the lock, then fan out. Callbacks may
    /// call back into the session freely.
    fn notify_state(&self) {
        let snapshot = self.state().clone();
        let callbacks = self
            .state_callbacks
            .lock()
            .expect("state callbacks lock poisoned")
            .snapshot();
        notify(&callbacks, &snapshot);
    }

    fn notify_message(&self, message: &SimMessage) {
        let callbacks = self
            .message_callbacks
            .lock()
            .expect("message callbacks lock poisoned")
            .snapshot();
        notify(&callbacks, message);
    }

    fn record_fault(&self, fault: Fault) {
        {
            let mut state = self.state();
            state.errors.push(fault.clone());
            state.performance.error_count += 1;
        }
        let callbacks = self
            .error_callbacks
            .lock()
            .expect("error callbacks lock poisoned")
            .snapshot();
        notify(&callbacks, &fault);
        self.notify_state();
    }

    /// Fold one state-update message into the session snapshot.
    fn apply_state_update(&self, message: &SimMessage) {
        {
            let mut state = self.state();
            if let Some(sim) = &message.payload.state {
                state.running = sim.is_running;
                if sim.runtime > 0 {
                    state.performance.uptime_ms = sim.runtime;
                }
            }
            state.last_message = Some(message.clone());
        }
        self.notify_message(message);
        self.notify_state();
    }

    fn apply_chip_event(&self, message: &SimMessage) {
        self.state().last_message = Some(message.clone());
        self.notify_message(message);
        self.notify_state();
    }
}

// ── Public session handle ───────────────────────────────────────────────────

/// One embedding session over one simulator frame.
///
/// Cheap to clone; all clones share the same session state.
#[derive(Clone)]
pub struct SimulatorSession {
    inner: Arc<SessionInner>,
}

impl SimulatorSession {
    /// Wrap a bridge. The session registers its own engine listeners
    /// (ready, state updates, chip events, faults) immediately.
    pub fn new(bridge: MessageBridge) -> Self {
        let confirm_timeout = bridge.confirm_timeout();
        let inner = Arc::new(SessionInner {
            bridge,
            confirm_timeout,
            started_at: Instant::now(),
            state: Mutex::new(SessionState::default()),
            message_callbacks: Mutex::new(CallbackSet::default()),
            state_callbacks: Mutex::new(CallbackSet::default()),
            error_callbacks: Mutex::new(CallbackSet::default()),
        });
        Self::install_bridge_listeners(&inner);
        Self { inner }
    }

    /// Hook the session into the engine's event stream.
    ///
    /// Listeners hold only a `Weak` back-reference: the engine outliving a
    /// dropped session must not keep the session state alive.
    fn install_bridge_listeners(inner: &Arc<SessionInner>) {
        let bridge = inner.bridge.clone();

        let weak = Arc::downgrade(inner);
        bridge.on(EventKey::Ready, move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.state().loaded = true;
                info!("session frame ready");
                inner.notify_state();
            }
        });

        let weak: Weak<SessionInner> = Arc::downgrade(inner);
        bridge.on(EventKey::Message(MessageType::StateUpdate), move |event| {
            if let (Some(inner), BridgeEvent::Message(message)) = (weak.upgrade(), event) {
                inner.apply_state_update(message);
            }
        });

        let weak: Weak<SessionInner> = Arc::downgrade(inner);
        bridge.on(
            EventKey::Message(MessageType::CustomChipEvent),
            move |event| {
                if let (Some(inner), BridgeEvent::Message(message)) = (weak.upgrade(), event) {
                    inner.apply_chip_event(message);
                }
            },
        );

        let weak: Weak<SessionInner> = Arc::downgrade(inner);
        bridge.on(EventKey::Error, move |event| {
            if let (Some(inner), BridgeEvent::Fault(fault)) = (weak.upgrade(), event) {
                inner.record_fault(fault.clone());
            }
        });

        let weak: Weak<SessionInner> = Arc::downgrade(inner);
        bridge.on(EventKey::Any, move |_| {
            if let Some(inner) = weak.upgrade() {
                // Wall-clock uptime; a frame-reported runtime overrides it
                // in apply_state_update.
                let uptime = inner.started_at.elapsed().as_millis() as u64;
                let mut state = inner.state();
                if state.performance.uptime_ms < uptime {
                    state.performance.uptime_ms = uptime;
                }
            }
        });
    }

    /// The underlying engine, for embeddings that need protocol-level
    /// access (listener registration, raw sends, the inbound pump).
    pub fn bridge(&self) -> &MessageBridge {
        &self.inner.bridge
    }

    // ── Operations ──────────────────────────────────────────────────────

    /// Ask the frame to load a project by id.
    ///
    /// Queued until the handshake like any ordinary send; the session's
    /// `current_project` is set as soon as the request is accepted.
    pub async fn load_project(&self, project_id: &str) -> Result<(), BridgeError> {
        if project_id.trim().is_empty() {
            return Err(BridgeError::InvalidArgument("project id is empty".into()));
        }

        let load_started = Instant::now();
        match self.inner.bridge.send(SimMessage::load_project(project_id)).await {
            Ok(()) => {
                {
                    let mut state = self.inner.state();
                    state.current_project = Some(project_id.to_owned());
                    state.performance.load_time_ms = load_started.elapsed().as_millis() as u64;
                }
                info!(project_id, "project load requested");
                self.inner.notify_state();
                Ok(())
            }
            Err(e) => {
                self.inner.record_fault(
                    Fault::new(FaultKind::Load, format!("project load failed: {e}"))
                        .with_context(json!({ "projectId": project_id })),
                );
                Err(e)
            }
        }
    }

    /// Push source code into the running project and wait for the frame to
    /// confirm it.
    ///
    /// Returns `Ok(true)` on confirmation.  Rejections (`success: false`),
    /// confirmation timeouts, and delivery failures each record a fault and
    /// return the matching error.  The confirmation listener is registered
    /// *before* the send, so a frame answering faster than the host resumes
    /// cannot slip through.
    pub async fn inject_code(&self, code: &str, filename: &str) -> Result<bool, BridgeError> {
        if code.trim().is_empty() {
            return Err(BridgeError::InvalidArgument("code content is empty".into()));
        }
        if !FileUpdate::is_accepted_filename(filename) {
            return Err(BridgeError::InvalidArgument(format!(
                "unsupported filename: {filename}"
            )));
        }

        let inject_started = Instant::now();

        // One-shot confirmation slot.  The slot is taken on first match so
        // later confirmations (or unrelated messages) are ignored.
        let (confirm_tx, confirm_rx) = oneshot::channel::<SimMessage>();
        let slot = Arc::new(Mutex::new(Some(confirm_tx)));
        let listener_slot = slot.clone();
        let listener = self.inner.bridge.on(EventKey::Any, move |event| {
            let BridgeEvent::Message(message) = event else {
                return;
            };
            if !is_injection_confirmation(message) {
                return;
            }
            if let Some(tx) = listener_slot
                .lock()
                .expect("confirmation slot lock poisoned")
                .take()
            {
                let _ = tx.send(message.clone());
            }
        });

        let sent = self
            .inner
            .bridge
            .send(SimMessage::inject_code(FileUpdate::utf8(filename, code)))
            .await;
        if let Err(e) = sent {
            self.inner.bridge.off(EventKey::Any, listener);
            self.inner.record_fault(
                Fault::new(FaultKind::Communication, format!("code injection failed: {e}"))
                    .with_context(json!({ "filename": filename })),
            );
            return Err(e);
        }

        let outcome = tokio::time::timeout(self.inner.confirm_timeout, confirm_rx).await;
        self.inner.bridge.off(EventKey::Any, listener);

        match outcome {
            Err(_elapsed) => {
                warn!(filename, "code injection confirmation timed out");
                self.inner.record_fault(
                    Fault::new(FaultKind::Communication, "code injection confirmation timed out")
                        .with_context(json!({
                            "filename": filename,
                            "timeoutMs": self.inner.confirm_timeout.as_millis() as u64,
                        })),
                );
                Err(BridgeError::ConfirmTimeout(self.inner.confirm_timeout))
            }
            // Sender dropped without firing: the bridge was reset and the
            // listener (which owns the slot) was cleared.
            Ok(Err(_dropped)) => Err(BridgeError::Reset),
            Ok(Ok(confirmation)) => {
                if confirmation.payload.success == Some(false) {
                    let reason = confirmation
                        .payload
                        .error
                        .clone()
                        .unwrap_or_else(|| "unspecified".into());
                    self.inner.record_fault(
                        Fault::new(
                            FaultKind::Simulation,
                            format!("code injection rejected: {reason}"),
                        )
                        .with_context(json!({ "filename": filename })),
                    );
                    Err(BridgeError::Rejected(reason))
                } else {
                    let latency = inject_started.elapsed().as_millis() as u64;
                    self.inner
                        .state()
                        .performance
                        .message_latency_ms
                        .push(latency);
                    debug!(filename, latency_ms = latency, "code injection confirmed");
                    self.inner.notify_state();
                    Ok(true)
                }
            }
        }
    }

    /// Forward an arbitrary pre-built message through the bridge.
    pub async fn send_custom_message(&self, message: SimMessage) -> Result<(), BridgeError> {
        let msg_type = message.msg_type;
        self.inner.bridge.send(message).await.map_err(|e| {
            self.inner.record_fault(Fault::new(
                FaultKind::Communication,
                format!("failed to send {msg_type}: {e}"),
            ));
            e
        })
    }

    pub async fn start_simulation(&self) -> Result<(), BridgeError> {
        self.control(ControlAction::Start).await
    }

    pub async fn stop_simulation(&self) -> Result<(), BridgeError> {
        self.control(ControlAction::Stop).await
    }

    /// Reset the *simulation* inside the frame (the session survives).
    pub async fn reset_simulation(&self) -> Result<(), BridgeError> {
        self.control(ControlAction::Reset).await?;
        {
            let mut state = self.inner.state();
            state.running = false;
            state.performance.uptime_ms = 0;
        }
        self.inner.notify_state();
        Ok(())
    }

    async fn control(&self, action: ControlAction) -> Result<(), BridgeError> {
        self.inner
            .bridge
            .send(SimMessage::control(action))
            .await
            .map_err(|e| {
                self.inner.record_fault(Fault::new(
                    FaultKind::Simulation,
                    format!("simulation control {action:?} failed: {e}"),
                ));
                e
            })
    }

    // ── Observation ─────────────────────────────────────────────────────

    /// Clone of the current session snapshot.
    pub fn state(&self) -> SessionState {
        self.inner.state().clone()
    }

    /// True once the frame handshake has completed and nothing has reset it.
    pub fn is_ready(&self) -> bool {
        self.inner.state().loaded && self.inner.bridge.is_ready()
    }

    pub fn on_message(
        &self,
        callback: impl Fn(&SimMessage) + Send + Sync + 'static,
    ) -> CallbackId {
        self.inner
            .message_callbacks
            .lock()
            .expect("message callbacks lock poisoned")
            .add(Arc::new(callback))
    }

    pub fn off_message(&self, id: CallbackId) -> bool {
        self.inner
            .message_callbacks
            .lock()
            .expect("message callbacks lock poisoned")
            .remove(id)
    }

    pub fn on_state_change(
        &self,
        callback: impl Fn(&SessionState) + Send + Sync + 'static,
    ) -> CallbackId {
        self.inner
            .state_callbacks
            .lock()
            .expect("state callbacks lock poisoned")
            .add(Arc::new(callback))
    }

    pub fn off_state_change(&self, id: CallbackId) -> bool {
        self.inner
            .state_callbacks
            .lock()
            .expect("state callbacks lock poisoned")
            .remove(id)
    }

    pub fn on_error(&self, callback: impl Fn(&Fault) + Send + Sync + 'static) -> CallbackId {
        self.inner
            .error_callbacks
            .lock()
            .expect("error callbacks lock poisoned")
            .add(Arc::new(callback))
    }

    pub fn off_error(&self, id: CallbackId) -> bool {
        self.inner
            .error_callbacks
            .lock()
            .expect("error callbacks lock poisoned")
            .remove(id)
    }

    /// Session snapshot, engine counters, and recent traffic in one bundle.
    pub fn debug_info(&self) -> DebugInfo {
        DebugInfo {
            state: self.state(),
            bridge: self.inner.bridge.stats(),
            history: self.inner.bridge.history(),
            callback_counts: (
                self.inner
                    .message_callbacks
                    .lock()
                    .expect("message callbacks lock poisoned")
                    .len(),
                self.inner
                    .state_callbacks
                    .lock()
                    .expect("state callbacks lock poisoned")
                    .len(),
                self.inner
                    .error_callbacks
                    .lock()
                    .expect("error callbacks lock poisoned")
                    .len(),
            ),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Reset the session and its engine to a clean slate.
    ///
    /// The engine reset drops *all* engine listeners, including this
    /// session's own, so they are re-installed afterwards; session-level
    /// callbacks registered via `on_*` survive.
    pub fn reset(&self) {
        self.inner.bridge.reset();
        *self.inner.state() = SessionState::default();
        Self::install_bridge_listeners(&self.inner);
        info!("session reset");
        self.inner.notify_state();
    }

    /// Tear the session down: destroy the engine and drop every
    /// session-level callback.
    pub fn cleanup(&self) {
        self.inner.bridge.destroy();
        *self.inner.state() = SessionState::default();
        *self
            .inner
            .message_callbacks
            .lock()
            .expect("message callbacks lock poisoned") = CallbackSet::default();
        *self
            .inner
            .state_callbacks
            .lock()
            .expect("state callbacks lock poisoned") = CallbackSet::default();
        *self
            .inner
            .error_callbacks
            .lock()
            .expect("error callbacks lock poisoned") = CallbackSet::default();
        info!("session cleaned up");
    }
}

/// Shape-based confirmation matching: the simulator does not echo request
/// ids, so a confirmation is any `inject-code-response`, or a state-update
/// (or its `wokwi:file:updated` alias) carrying a `fileUpdate` payload.
fn is_injection_confirmation(message: &SimMessage) -> bool {
    match message.msg_type {
        MessageType::InjectCodeResponse => true,
        MessageType::StateUpdate | MessageType::FileUpdated => {
            message.payload.file_update.is_some()
        }
        _ => false,
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
