//! Direct-to-MX outbound delivery.
//!
//! [`DirectTransport::send`] takes one envelope and one message body and
//! delivers it without a relay:
//! - recipients are grouped by domain and each domain's mail exchangers are
//!   resolved (MX, falling back to A/AAAA)
//! - every group runs its own SMTP session concurrently, replaying the same
//!   body from the [`MessageSource`]
//! - temporary (4xx) failures are retried with exponential backoff
//! - all per-recipient outcomes are folded into one [`DeliveryReport`]
//!
//! Progress is published on a broadcast channel, see
//! [`DirectTransport::subscribe`].
//!
//! ```no_run
//! use directmail::{DirectTransport, Envelope, TransportConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = DirectTransport::new(TransportConfig::default().with_hostname("mailer.example.org"))?;
//! let envelope = Envelope::parse("sender@example.org", ["someone@example.com"])?;
//!
//! let report = transport
//!     .send(envelope, "Subject: Hello\r\n\r\nHi there\r\n")
//!     .await?;
//! println!("{} accepted", report.accepted.len());
//! # Ok(())
//! # }
//! ```

mod config;
mod context;
mod dns;
mod error;
mod events;
mod outcome;
pub mod policy;
mod resolver;
mod scheduler;
mod session;
mod source;
mod transport;
mod types;

pub use config::{Completion, TransportConfig};
pub use directmail_common::{
    Address, Envelope, EnvelopeError,
    config::{ClientTimeouts, TlsConfig, TlsPolicy},
};
pub use dns::{DnsConfig, DnsError, DnsResolver, HickoryResolver, MailServer, StaticResolver};
pub use error::{DeliveryError, DeliveryFailure, SendError, SmtpReply, SourceError};
pub use events::{LogEntry, LogKind, Settlement, TransportEvent};
pub use outcome::{DeliveryReport, RecipientOutcome};
pub use policy::RetryPolicy;
pub use source::{BufferedSource, MessageSource, ReopenableSource, SourceBody};
pub use transport::DirectTransport;
pub use types::{DestinationGroup, GroupState};
