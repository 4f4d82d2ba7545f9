//! Typed error handling for delivery operations.
//!
//! Failures are classified per recipient and only surface through the final
//! [`DeliveryReport`](crate::DeliveryReport). Whether a failure is worth
//! retrying is decided by [`DeliveryError::is_temporary`]: only SMTP-level 4xx
//! replies are, never network or resolution failures.

use std::{fmt, io, sync::Arc, time::Duration};

use directmail_common::Address;
use directmail_smtp::{ClientError, Response};
use thiserror::Error;

use crate::{dns::DnsError, outcome::DeliveryReport};

/// A reply code and text as received from a remote server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpReply {
    pub code: u16,
    pub message: String,
}

impl SmtpReply {
    #[must_use]
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        self.code >= 500 && self.code < 600
    }
}

impl From<&Response> for SmtpReply {
    fn from(response: &Response) -> Self {
        Self::new(response.code, response.lines.join(" "))
    }
}

impl fmt::Display for SmtpReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.message)
    }
}

/// Why a recipient was not (or not yet) delivered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The domain has no deliverable host.
    #[error("Could not resolve mail servers for {domain}: {reason}")]
    Resolution { domain: String, reason: String },

    /// No candidate host accepted a usable session, or the session broke
    /// after it was established.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// `MAIL FROM` was refused.
    #[error("Sender rejected: {0}")]
    SenderRejected(SmtpReply),

    /// `RCPT TO` was refused.
    #[error("Recipient rejected: {0}")]
    RecipientRejected(SmtpReply),

    /// 4xx to the greeting, `DATA` or the message body.
    #[error("Temporary failure: {0}")]
    TemporaryFailure(SmtpReply),

    /// 5xx to `DATA` or to the message body.
    #[error("Permanent failure: {0}")]
    PermanentFailure(SmtpReply),

    /// The server did not answer in time.
    #[error("Timed out waiting for {phase} after {}ms", .limit.as_millis())]
    Timeout { phase: &'static str, limit: Duration },

    /// The server answered with something SMTP does not allow here.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl DeliveryError {
    /// Returns `true` if this failure is worth another attempt.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        match self {
            Self::SenderRejected(reply) | Self::RecipientRejected(reply) => reply.is_temporary(),
            Self::TemporaryFailure(_) => true,
            _ => false,
        }
    }

    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        !self.is_temporary()
    }

    /// The server reply this error was built from, if any.
    #[must_use]
    pub const fn reply(&self) -> Option<&SmtpReply> {
        match self {
            Self::SenderRejected(reply)
            | Self::RecipientRejected(reply)
            | Self::TemporaryFailure(reply)
            | Self::PermanentFailure(reply) => Some(reply),
            _ => None,
        }
    }

    /// Short machine-friendly name for logs and events
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Resolution { .. } => "resolution",
            Self::Connection(_) => "connection",
            Self::SenderRejected(_) => "sender_rejected",
            Self::RecipientRejected(_) => "recipient_rejected",
            Self::TemporaryFailure(_) => "temporary_failure",
            Self::PermanentFailure(_) => "permanent_failure",
            Self::Timeout { .. } => "timeout",
            Self::Protocol(_) => "protocol",
        }
    }

    /// Classifies the reply to `DATA` or to the message body.
    ///
    /// Returns `None` for a 2xx reply.
    #[must_use]
    pub fn from_data_reply(reply: SmtpReply) -> Option<Self> {
        match reply.code {
            200..300 => None,
            400..500 => Some(Self::TemporaryFailure(reply)),
            500..600 => Some(Self::PermanentFailure(reply)),
            _ => Some(Self::Protocol(format!("Unexpected reply: {reply}"))),
        }
    }
}

impl From<DnsError> for DeliveryError {
    fn from(error: DnsError) -> Self {
        let domain = error.domain().to_string();
        Self::Resolution {
            domain,
            reason: error.to_string(),
        }
    }
}

impl From<ClientError> for DeliveryError {
    fn from(error: ClientError) -> Self {
        match error {
            ClientError::Io(e) => Self::Connection(format!("I/O error: {e}")),
            ClientError::ConnectionClosed => {
                Self::Connection("Connection closed unexpectedly".to_string())
            }
            ClientError::TlsError(msg) => Self::Connection(format!("TLS error: {msg}")),
            ClientError::ParseError(msg) => Self::Protocol(msg),
        }
    }
}

/// The message body could not be read.
///
/// Reported once per send operation as a
/// [`TransportEvent::Error`](crate::TransportEvent::Error), never as a
/// recipient failure.
#[derive(Debug, Clone, Error)]
#[error("Message source failed: {0}")]
pub struct SourceError(#[source] Arc<io::Error>);

impl SourceError {
    #[must_use]
    pub fn io(&self) -> &io::Error {
        &self.0
    }
}

impl From<io::Error> for SourceError {
    fn from(error: io::Error) -> Self {
        Self(Arc::new(error))
    }
}

/// One entry of the failure collection: the recipients of one destination
/// that were rejected for the same reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub domain: String,
    /// Last host a session was attempted against
    pub server: Option<String>,
    pub attempts: u32,
    pub recipients: Vec<Address>,
    pub error: DeliveryError,
}

impl fmt::Display for DeliveryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let recipients = self
            .recipients
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");

        write!(f, "{} ({recipients})", self.domain)?;
        if let Some(server) = &self.server {
            write!(f, " via {server}")?;
        }
        write!(f, " after {} attempt(s): {}", self.attempts, self.error)
    }
}

/// A send operation in which at least one recipient was rejected.
///
/// Carries the full report so accepted and pending recipients are still
/// visible to the caller.
#[derive(Debug, Clone, Error)]
#[error("{} of {} recipient(s) rejected", report.rejected.len(), report.len())]
pub struct SendError {
    pub report: DeliveryReport,
    pub failures: Vec<DeliveryFailure>,
}

impl SendError {
    /// Every rejected address across all failures
    pub fn recipients(&self) -> impl Iterator<Item = &Address> {
        self.failures.iter().flat_map(|f| f.recipients.iter())
    }
}
