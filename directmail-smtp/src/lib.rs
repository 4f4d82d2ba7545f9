//! The client half of SMTP, as needed to hand a message to a remote mail
//! exchanger: connect, read replies, issue commands, upgrade with STARTTLS and
//! transmit a dot-stuffed message body.

pub mod client;

pub use client::{ClientError, Response, SmtpClient, encode_data};
