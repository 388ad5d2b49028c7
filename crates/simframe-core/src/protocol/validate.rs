//! Envelope validation — the structural gate for untrusted frame input.
//!
//! Everything arriving from the embedded frame is attacker-controllable, so
//! the bridge treats it as a raw [`serde_json::Value`] until it has passed
//! this gate.  The gate is deliberately shallow:
//!
//! - the value must be a JSON object;
//! - it must contain all four envelope fields (`type`, `payload`,
//!   `timestamp`, `id`);
//! - `type` must be one of the known wire strings.
//!
//! Payload *field-level* correctness is not checked here.  The simulator is a
//! moving target and over-strict envelope validation would reject messages
//! from newer frame versions; the session layer inspects the payload fields
//! it actually needs.
//!
//! The same predicate runs on the outbound path, so a host bug that produces
//! a malformed message is caught before it leaves the process.

use serde_json::Value;

/// Every wire string the validator accepts, including the response-only
/// `wokwi:file:updated` alias.
pub const KNOWN_TYPES: [&str; 8] = [
    "load-project",
    "inject-code",
    "inject-code-response",
    "simulation-control",
    "state-update",
    "custom-chip-event",
    "wokwi-ready",
    "wokwi:file:updated",
];

/// Returns `true` iff `name` is a member of the closed message-type set.
pub fn is_known_type(name: &str) -> bool {
    KNOWN_TYPES.contains(&name)
}

/// Structural validity check for a raw envelope.
///
/// Pure predicate: no side effects, never panics.  Malformed input of any
/// shape (non-object, missing fields, unknown type, `type` that is not a
/// string) yields `false`.
///
/// # Examples
///
/// ```rust
/// use serde_json::json;
/// use simframe_core::protocol::validate_envelope;
///
/// let ok = json!({
///     "type": "wokwi-ready",
///     "payload": {},
///     "timestamp": 1714000000000u64,
///     "id": "msg-1",
/// });
/// assert!(validate_envelope(&ok));
/// assert!(!validate_envelope(&json!("not an object")));
/// ```
pub fn validate_envelope(raw: &Value) -> bool {
    let Some(obj) = raw.as_object() else {
        return false;
    };

    // All four envelope fields must be present.  Their inner shape is not
    // this gate's concern, only presence — with one exception: `type` must
    // be a known string, otherwise the message cannot be dispatched at all.
    if !obj.contains_key("payload") || !obj.contains_key("timestamp") || !obj.contains_key("id") {
        return false;
    }

    match obj.get("type").and_then(Value::as_str) {
        Some(name) => is_known_type(name),
        None => false,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
