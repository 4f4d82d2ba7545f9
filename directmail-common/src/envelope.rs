use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::{Address, AddressError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("Invalid sender '{input}': {source}")]
    InvalidSender { input: String, source: AddressError },

    #[error("Invalid recipient '{input}': {source}")]
    InvalidRecipient { input: String, source: AddressError },

    #[error("Envelope has no recipients")]
    NoRecipients,
}

/// The sender and recipients of one send operation.
///
/// Recipients are unique by exact string and keep the order they were
/// supplied in. The envelope cannot be changed once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    sender: Option<Address>,
    recipients: Vec<Address>,
}

impl Envelope {
    /// Builds an envelope from already parsed addresses.
    ///
    /// A `None` sender is the null reverse-path `<>`.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::NoRecipients`] if `recipients` is empty.
    pub fn new(
        sender: Option<Address>,
        recipients: impl IntoIterator<Item = Address>,
    ) -> Result<Self, EnvelopeError> {
        let mut unique: Vec<Address> = Vec::new();
        for recipient in recipients {
            if !unique.contains(&recipient) {
                unique.push(recipient);
            }
        }

        if unique.is_empty() {
            return Err(EnvelopeError::NoRecipients);
        }

        Ok(Self {
            sender,
            recipients: unique,
        })
    }

    /// Parses and validates every address, then builds the envelope.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first structurally invalid address, or
    /// [`EnvelopeError::NoRecipients`].
    pub fn parse<'a>(
        sender: &str,
        recipients: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self, EnvelopeError> {
        let sender =
            Address::parse_reverse_path(sender).map_err(|source| EnvelopeError::InvalidSender {
                input: sender.to_string(),
                source,
            })?;

        let recipients = recipients
            .into_iter()
            .map(|input| {
                Address::parse(input).map_err(|source| EnvelopeError::InvalidRecipient {
                    input: input.to_string(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Self::new(sender, recipients)
    }

    /// The sender, or `None` for the null reverse-path
    #[inline]
    pub const fn sender(&self) -> Option<&Address> {
        self.sender.as_ref()
    }

    /// The sender as it appears inside `MAIL FROM:<...>`
    #[must_use]
    pub fn reverse_path(&self) -> String {
        self.sender
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default()
    }

    #[inline]
    pub fn recipients(&self) -> &[Address] {
        &self.recipients
    }

    /// Position of `recipient` in envelope order
    #[must_use]
    pub fn position(&self, recipient: &Address) -> Option<usize> {
        self.recipients.iter().position(|r| r == recipient)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_recipients_deduplicated_in_order() {
        let envelope = Envelope::parse(
            "sender@example.com",
            [
                "b@example.com",
                "a@example.com",
                "b@example.com",
                "B@example.com",
            ],
        )
        .unwrap();

        let recipients: Vec<String> = envelope
            .recipients()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(
            recipients,
            vec!["b@example.com", "a@example.com", "B@example.com"]
        );
    }

    #[test]
    fn test_null_sender() {
        let envelope = Envelope::parse("<>", ["a@example.com"]).unwrap();
        assert!(envelope.sender().is_none());
        assert_eq!(envelope.reverse_path(), "");
    }

    #[test]
    fn test_no_recipients() {
        let result = Envelope::parse("sender@example.com", []);
        assert_eq!(result.unwrap_err(), EnvelopeError::NoRecipients);
    }

    #[test]
    fn test_invalid_recipient_is_named() {
        let err = Envelope::parse("sender@example.com", ["ok@example.com", "broken"]).unwrap_err();
        assert!(matches!(
            err,
            EnvelopeError::InvalidRecipient { ref input, .. } if input == "broken"
        ));
    }

    #[test]
    fn test_invalid_sender() {
        let err = Envelope::parse("not an address", ["a@example.com"]).unwrap_err();
        assert!(matches!(err, EnvelopeError::InvalidSender { .. }));
    }

    #[test]
    fn test_position() {
        let envelope =
            Envelope::parse("s@example.com", ["a@example.com", "b@example.com"]).unwrap();
        let b = Address::parse("b@example.com").unwrap();
        assert_eq!(envelope.position(&b), Some(1));
    }
}
