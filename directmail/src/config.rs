//! Transport configuration.
//!
//! Every field has a default, so a configuration file only names what it
//! changes:
//!
//! ```ron
//! (
//!     hostname: "mailer.example.org",
//!     timeouts: (connect_secs: 10),
//!     retry: (max_attempts: 3, retry_delay_ms: 30000),
//!     tls: (policy: required),
//! )
//! ```

use directmail_common::config::{ClientTimeouts, TlsConfig};
use serde::{Deserialize, Serialize};

use crate::{dns::DnsConfig, policy::RetryPolicy};

/// When [`DirectTransport::send`](crate::DirectTransport::send) returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Completion {
    /// After every destination has finished, retries included. Nothing is
    /// ever reported as pending.
    #[default]
    AllAttempts,

    /// After each destination's first attempt. Recipients that failed
    /// temporarily are reported as pending; their retries continue in the
    /// background and the final outcome arrives as a
    /// [`TransportEvent::Settled`](crate::TransportEvent::Settled).
    FirstAttempt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Port used for every destination host without an explicit one.
    ///
    /// Default: 25
    #[serde(default = "defaults::port")]
    pub port: u16,

    /// Name announced in EHLO/HELO.
    ///
    /// Default: `localhost`
    #[serde(default = "defaults::hostname")]
    pub hostname: String,

    #[serde(default)]
    pub timeouts: ClientTimeouts,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub dns: DnsConfig,

    /// Publish the protocol transcript (commands and replies) as log events.
    ///
    /// Default: `false`
    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub completion: Completion,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: defaults::port(),
            hostname: defaults::hostname(),
            timeouts: ClientTimeouts::default(),
            retry: RetryPolicy::default(),
            tls: TlsConfig::default(),
            dns: DnsConfig::default(),
            debug: false,
            completion: Completion::default(),
        }
    }
}

impl TransportConfig {
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    #[must_use]
    pub const fn with_timeouts(mut self, timeouts: ClientTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub const fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    #[must_use]
    pub const fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    #[must_use]
    pub const fn with_completion(mut self, completion: Completion) -> Self {
        self.completion = completion;
        self
    }
}

mod defaults {
    pub const fn port() -> u16 {
        25
    }

    pub fn hostname() -> String {
        String::from("localhost")
    }
}
