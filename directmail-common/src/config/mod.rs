//! Settings that describe how the client side of an SMTP session behaves.
//!
//! - [`timeouts`]: per-phase timeouts for outbound sessions
//! - [`tls`]: STARTTLS policy and certificate validation

pub mod timeouts;
pub mod tls;

pub use timeouts::ClientTimeouts;
pub use tls::{TlsConfig, TlsPolicy};
