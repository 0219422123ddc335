//! Per-client security levels.
//!
//! The level is set by the management plane and only read here. It controls
//! how aggressively the proxy intercepts a client's TLS connections.

use serde::{Deserialize, Serialize};

/// Interception aggressiveness for one client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    /// Intercept everything that can be attributed; fail closed.
    Maximum,
    /// Intercept per policy; fail open.
    #[default]
    Standard,
    /// Never intercept; DNS-level blocking only.
    Basic,
    /// Proxy is a plain pipe for this client.
    Disabled,
}

impl SecurityLevel {
    /// Returns the level name as stored in the policy store.
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityLevel::Maximum => "maximum",
            SecurityLevel::Standard => "standard",
            SecurityLevel::Basic => "basic",
            SecurityLevel::Disabled => "disabled",
        }
    }

    /// Parses a level from its stored name.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "maximum" => Some(SecurityLevel::Maximum),
            "standard" => Some(SecurityLevel::Standard),
            "basic" => Some(SecurityLevel::Basic),
            "disabled" => Some(SecurityLevel::Disabled),
            _ => None,
        }
    }

    /// Returns true if connections must never be intercepted at this level.
    pub fn forces_passthru(&self) -> bool {
        matches!(self, SecurityLevel::Basic | SecurityLevel::Disabled)
    }

    /// Returns true for the fail-closed level.
    pub fn is_maximum(&self) -> bool {
        matches!(self, SecurityLevel::Maximum)
    }

    /// Returns true if requests may be rewritten at this level.
    pub fn supports_request_modification(&self) -> bool {
        matches!(self, SecurityLevel::Maximum | SecurityLevel::Standard)
    }
}

impl std::fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
