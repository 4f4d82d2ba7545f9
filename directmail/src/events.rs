//! Observability channel for send operations.
//!
//! Every [`DirectTransport`](crate::DirectTransport) owns one broadcast
//! channel. Each send operation publishes onto it through its own
//! [`EventEmitter`], tagging every event with the operation's id. Publishing
//! never waits: with no subscriber, or a lagging one, events are dropped.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use directmail_common::{Address, incoming, outgoing};
use tokio::sync::broadcast;
use tracing::{Level, debug, error, info, warn};
use ulid::Ulid;

use crate::error::{DeliveryError, SourceError};

/// The step of a send operation a log entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Resolve,
    Connect,
    /// A command written to the server (transcript)
    Command,
    /// A reply read from the server (transcript)
    Reply,
    RetryScheduled,
    GroupDone,
    Completed,
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub send_id: Ulid,
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    pub kind: LogKind,
    /// The destination domain the entry is about, if any
    pub domain: Option<String>,
    pub message: String,
}

/// Final outcome of a destination whose retries outlived the send call.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub send_id: Ulid,
    pub domain: String,
    pub attempts: u32,
    pub accepted: Vec<Address>,
    pub rejected: Vec<(Address, DeliveryError)>,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Log(LogEntry),
    /// The message source failed. Published at most once per send operation.
    Error { send_id: Ulid, error: SourceError },
    /// Only published in [`Completion::FirstAttempt`](crate::Completion::FirstAttempt) mode.
    Settled(Settlement),
}

impl TransportEvent {
    #[must_use]
    pub const fn send_id(&self) -> Ulid {
        match self {
            Self::Log(entry) => entry.send_id,
            Self::Error { send_id, .. } => *send_id,
            Self::Settled(settlement) => settlement.send_id,
        }
    }
}

/// Per-send publisher. Cheap to share behind an `Arc`.
#[derive(Debug)]
pub struct EventEmitter {
    send_id: Ulid,
    debug: bool,
    sender: broadcast::Sender<TransportEvent>,
    source_error_reported: AtomicBool,
}

impl EventEmitter {
    #[must_use]
    pub const fn new(send_id: Ulid, debug: bool, sender: broadcast::Sender<TransportEvent>) -> Self {
        Self {
            send_id,
            debug,
            sender,
            source_error_reported: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn send_id(&self) -> Ulid {
        self.send_id
    }

    fn publish(&self, event: TransportEvent) {
        // No receivers is not an error
        let _ = self.sender.send(event);
    }

    /// Records a step. Debug entries are published only with `debug` on;
    /// every entry goes to `tracing`.
    pub fn log(&self, level: Level, kind: LogKind, domain: Option<&str>, message: impl Into<String>) {
        let message = message.into();
        let send_id = self.send_id;
        let domain_field = domain.unwrap_or_default();

        match level {
            Level::ERROR => error!(%send_id, domain = domain_field, ?kind, "{message}"),
            Level::WARN => warn!(%send_id, domain = domain_field, ?kind, "{message}"),
            Level::INFO => info!(%send_id, domain = domain_field, ?kind, "{message}"),
            _ => debug!(%send_id, domain = domain_field, ?kind, "{message}"),
        }

        if level >= Level::DEBUG && !self.debug {
            return;
        }

        self.publish(TransportEvent::Log(LogEntry {
            send_id,
            timestamp: Utc::now(),
            level,
            kind,
            domain: domain.map(ToString::to_string),
            message,
        }));
    }

    pub fn info(&self, kind: LogKind, domain: &str, message: impl Into<String>) {
        self.log(Level::INFO, kind, Some(domain), message);
    }

    pub fn warn(&self, kind: LogKind, domain: &str, message: impl Into<String>) {
        self.log(Level::WARN, kind, Some(domain), message);
    }

    /// A command as written to `server`
    pub fn command(&self, domain: &str, server: &str, command: &str) {
        outgoing!(level = TRACE, send_id = %self.send_id, server, "{command}");
        self.log(
            Level::DEBUG,
            LogKind::Command,
            Some(domain),
            format!("{server} << {command}"),
        );
    }

    /// A reply as read from `server`
    pub fn reply(&self, domain: &str, server: &str, reply: &str) {
        incoming!(level = TRACE, send_id = %self.send_id, server, "{reply}");
        self.log(
            Level::DEBUG,
            LogKind::Reply,
            Some(domain),
            format!("{server} >> {reply}"),
        );
    }

    /// Publishes a source error the first time one is reported; later calls
    /// are ignored. Returns whether this call published.
    pub fn source_error(&self, error: &SourceError) -> bool {
        if self.source_error_reported.swap(true, Ordering::AcqRel) {
            return false;
        }

        error!(send_id = %self.send_id, %error, "Message source failed");
        self.publish(TransportEvent::Error {
            send_id: self.send_id,
            error: error.clone(),
        });
        true
    }

    pub fn settled(&self, settlement: Settlement) {
        self.publish(TransportEvent::Settled(settlement));
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    fn emitter(debug: bool) -> (EventEmitter, broadcast::Receiver<TransportEvent>) {
        let (tx, rx) = broadcast::channel(64);
        (EventEmitter::new(Ulid::new(), debug, tx), rx)
    }

    #[test]
    fn test_info_entries_are_published() {
        let (emitter, mut rx) = emitter(false);
        emitter.info(LogKind::Resolve, "example.com", "resolved 2 hosts");

        let TransportEvent::Log(entry) = rx.try_recv().unwrap_or_else(|_| panic!("no event")) else {
            panic!("expected a log entry");
        };
        assert_eq!(entry.kind, LogKind::Resolve);
        assert_eq!(entry.level, Level::INFO);
        assert_eq!(entry.domain.as_deref(), Some("example.com"));
        assert_eq!(entry.send_id, emitter.send_id());
    }

    #[test]
    fn test_transcript_requires_debug() {
        let (quiet, mut quiet_rx) = emitter(false);
        quiet.command("example.com", "mx:25", "MAIL FROM:<a@b.c>");
        assert!(quiet_rx.try_recv().is_err());

        let (verbose, mut verbose_rx) = emitter(true);
        verbose.command("example.com", "mx:25", "MAIL FROM:<a@b.c>");
        verbose.reply("example.com", "mx:25", "250 OK");

        let kinds: Vec<LogKind> = std::iter::from_fn(|| verbose_rx.try_recv().ok())
            .filter_map(|event| match event {
                TransportEvent::Log(entry) => Some(entry.kind),
                _ => None,
            })
            .collect();
        assert_eq!(kinds, vec![LogKind::Command, LogKind::Reply]);
    }

    #[test]
    fn test_source_error_published_once() {
        let (emitter, mut rx) = emitter(false);
        let error = SourceError::from(io::Error::other("broken pipe"));

        assert!(emitter.source_error(&error));
        assert!(!emitter.source_error(&error));
        assert!(!emitter.source_error(&error));

        let errors = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|event| matches!(event, TransportEvent::Error { .. }))
            .count();
        assert_eq!(errors, 1);
    }

    #[test]
    fn test_publishing_without_subscribers() {
        let (tx, rx) = broadcast::channel(4);
        drop(rx);
        let emitter = EventEmitter::new(Ulid::new(), true, tx);
        emitter.info(LogKind::Completed, "example.com", "nobody listening");
    }
}
