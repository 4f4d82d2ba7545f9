//! STARTTLS policy for outbound connections.

use serde::{Deserialize, Serialize};

/// When to negotiate TLS with a remote server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TlsPolicy {
    /// Use STARTTLS when advertised; if the upgrade fails, reconnect in
    /// plaintext (RFC 3207 Section 4.1).
    #[default]
    Opportunistic,

    /// The host must advertise STARTTLS and the upgrade must succeed, otherwise
    /// the host is treated as unusable.
    Required,

    /// Never issue STARTTLS.
    Disabled,
}

/// TLS settings for an outbound session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub policy: TlsPolicy,

    /// Skip certificate validation (self-signed, expired, wrong name).
    ///
    /// **SECURITY WARNING**: leaves the session open to man-in-the-middle
    /// attacks. Default: `false`
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

impl TlsConfig {
    #[must_use]
    pub const fn new(policy: TlsPolicy) -> Self {
        Self {
            policy,
            accept_invalid_certs: false,
        }
    }

    #[must_use]
    pub const fn required() -> Self {
        Self::new(TlsPolicy::Required)
    }

    #[must_use]
    pub const fn disabled() -> Self {
        Self::new(TlsPolicy::Disabled)
    }

    /// Opportunistic TLS that accepts any certificate. Test environments only.
    #[must_use]
    pub const fn insecure() -> Self {
        Self {
            policy: TlsPolicy::Opportunistic,
            accept_invalid_certs: true,
        }
    }

    #[must_use]
    pub const fn is_required(&self) -> bool {
        matches!(self.policy, TlsPolicy::Required)
    }

    #[must_use]
    pub const fn is_disabled(&self) -> bool {
        matches!(self.policy, TlsPolicy::Disabled)
    }

    #[must_use]
    pub const fn accepts_invalid_certs(&self) -> bool {
        self.accept_invalid_certs
    }
}
