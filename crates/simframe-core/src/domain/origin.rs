//! Origin trust policy — decides whether an inbound message's declared source
//! origin is allowed to talk to the bridge.
//!
//! The embedded frame lives on a different origin and shares its inbound
//! channel with every other frame and script on the page, so the declared
//! origin of each message is the first gate.  An origin here is the usual
//! `scheme://host[:port]` string the hosting environment reports alongside
//! each message.
//!
//! # Matching rules
//!
//! - Production: exact match against the allow-list (scheme + host).
//!   Substring matching would let `https://wokwi.com.evil.example` through,
//!   so the comparison is whole-string.
//! - Dev mode: local-loopback origins (`localhost`, `127.0.0.1`, `[::1]`)
//!   are additionally trusted, on any scheme and port, so a locally served
//!   simulator build works without editing the allow-list.
//! - Enforcement off: every origin is trusted and the bridge never emits a
//!   security fault.  Only for tests and throwaway prototypes.

/// Origins the production simulator is served from.
pub const DEFAULT_ALLOWED_ORIGINS: [&str; 3] = [
    "https://wokwi.com",
    "https://embed.wokwi.com",
    "https://api.wokwi.com",
];

/// Trust policy for inbound message origins.
#[derive(Debug, Clone)]
pub struct OriginPolicy {
    /// Exact-match allow-list of `scheme://host[:port]` strings.
    allowed: Vec<String>,
    /// Additionally trust loopback origins (development builds).
    dev_mode: bool,
}

impl OriginPolicy {
    /// Policy trusting the default simulator origins only.
    pub fn new() -> Self {
        Self {
            allowed: DEFAULT_ALLOWED_ORIGINS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            dev_mode: false,
        }
    }

    /// Policy with a custom allow-list.
    pub fn with_allowed(origins: impl IntoIterator<Item = String>) -> Self {
        Self {
            allowed: origins.into_iter().collect(),
            dev_mode: false,
        }
    }

    /// Enables or disables loopback trust.
    pub fn dev_mode(mut self, enabled: bool) -> Self {
        self.dev_mode = enabled;
        self
    }

    /// Returns `true` iff `origin` may deliver messages to the bridge.
    pub fn is_trusted(&self, origin: &str) -> bool {
        if self.allowed.iter().any(|a| a == origin) {
            return true;
        }
        self.dev_mode && is_loopback_origin(origin)
    }
}

impl Default for OriginPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns `true` iff the origin's host part is a loopback address.
///
/// Parses the host out of `scheme://host[:port]` instead of substring
/// matching, so `https://localhost.evil.example` is not loopback.
fn is_loopback_origin(origin: &str) -> bool {
    let Some((_, rest)) = origin.split_once("://") else {
        return false;
    };
    // Bracketed IPv6 hosts keep their brackets; everything else ends at the
    // first ':' (port) or '/' (path, which a well-formed origin lacks).
    let host = if let Some(stripped) = rest.strip_prefix('[') {
        match stripped.split_once(']') {
            Some((h, _)) => return h == "::1" && !host_has_path(rest),
            None => return false,
        }
    } else {
        rest.split([':', '/']).next().unwrap_or("")
    };
    (host == "localhost" || host == "127.0.0.1") && !host_has_path(rest)
}

/// A real origin never carries a path component.
fn host_has_path(rest: &str) -> bool {
    rest.contains('/')
}

// ── Tests ─────────────────────────────────────────────────────────────────────
