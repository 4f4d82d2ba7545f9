//! SMTP client connection and reply handling.
//!
//! ```no_run
//! use directmail_smtp::SmtpClient;
//!
//! # async fn example() -> Result<(), directmail_smtp::ClientError> {
//! let mut client = SmtpClient::connect("mx.example.com", 25, "mx.example.com").await?;
//! let greeting = client.read_greeting().await?;
//! assert!(greeting.is_success());
//!
//! let ehlo = client.ehlo("client.example.org").await?;
//! if ehlo.has_extension("STARTTLS") {
//!     client.starttls().await?;
//!     client.ehlo("client.example.org").await?;
//! }
//!
//! client.mail_from("sender@example.org").await?;
//! client.rcpt_to("recipient@example.com").await?;
//! client.data().await?;
//! client.send_data(b"Subject: Hi\n\nHello\n").await?;
//! client.quit().await?;
//! # Ok(())
//! # }
//! ```

mod data;
mod error;
mod response;
mod smtp_client;

pub use data::encode_data;
pub use error::{ClientError, Result};
pub use response::{Response, ResponseLine};
pub use smtp_client::SmtpClient;
