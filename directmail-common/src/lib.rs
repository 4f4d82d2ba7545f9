//! Types shared between the directmail crates.
//!
//! - [`address`]: RFC 5321 mailbox parsing and the [`Address`] newtype
//! - [`envelope`]: the immutable sender/recipient [`Envelope`] of one send operation
//! - [`config`]: TLS and timeout configuration used when talking to remote servers
//! - [`logging`]: subscriber initialisation and the `internal!`/`outgoing!`/`incoming!` macros

pub mod address;
pub mod config;
pub mod envelope;
pub mod logging;

pub use address::{Address, AddressError, Mailbox};
pub use envelope::{Envelope, EnvelopeError};
pub use tracing;
