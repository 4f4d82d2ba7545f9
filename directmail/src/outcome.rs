//! Per-recipient outcomes and their aggregation into one report.

use directmail_common::{Address, Envelope};
use ulid::Ulid;

use crate::{
    error::{DeliveryError, DeliveryFailure, SendError},
    types::DestinationGroup,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecipientOutcome {
    Accepted,
    /// Failed temporarily; another attempt may still succeed.
    Pending(DeliveryError),
    Rejected(DeliveryError),
}

impl RecipientOutcome {
    /// `Pending` for temporary errors, `Rejected` otherwise.
    #[must_use]
    pub fn from_error(error: DeliveryError) -> Self {
        if error.is_temporary() {
            Self::Pending(error)
        } else {
            Self::Rejected(error)
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Accepted | Self::Rejected(_))
    }

    #[must_use]
    pub const fn error(&self) -> Option<&DeliveryError> {
        match self {
            Self::Accepted => None,
            Self::Pending(error) | Self::Rejected(error) => Some(error),
        }
    }
}

/// Where every recipient of a send operation ended up, in envelope order.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub send_id: Ulid,
    pub accepted: Vec<Address>,
    /// Only populated in first-attempt completion mode
    pub pending: Vec<(Address, DeliveryError)>,
    pub rejected: Vec<(Address, DeliveryError)>,
}

impl DeliveryReport {
    /// Total number of recipients
    #[must_use]
    pub fn len(&self) -> usize {
        self.accepted.len() + self.pending.len() + self.rejected.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.rejected.is_empty()
    }
}

struct Slot {
    outcome: Option<RecipientOutcome>,
    domain: String,
    server: Option<String>,
    attempts: u32,
}

/// Folds destination groups into the final [`DeliveryReport`].
///
/// Groups may be folded in any order. A recipient no group reported on is
/// rejected rather than dropped.
pub struct ResultAggregator {
    send_id: Ulid,
    recipients: Vec<Address>,
    slots: Vec<Slot>,
}

impl ResultAggregator {
    #[must_use]
    pub fn new(send_id: Ulid, envelope: &Envelope) -> Self {
        let recipients = envelope.recipients().to_vec();
        let slots = recipients
            .iter()
            .map(|recipient| Slot {
                outcome: None,
                domain: recipient.domain_key(),
                server: None,
                attempts: 0,
            })
            .collect();

        Self {
            send_id,
            recipients,
            slots,
        }
    }

    pub fn fold(&mut self, group: &DestinationGroup) {
        for (recipient, outcome) in group.outcomes() {
            let Some(index) = self.recipients.iter().position(|r| r == recipient) else {
                continue;
            };

            self.slots[index] = Slot {
                outcome: outcome.cloned(),
                domain: group.domain().to_string(),
                server: group.last_server().map(ToString::to_string),
                attempts: group.attempts(),
            };
        }
    }

    /// `Ok` when no recipient was rejected.
    ///
    /// # Errors
    ///
    /// Returns [`SendError`] carrying the report and one failure entry per
    /// (destination, reason) when any recipient was rejected.
    pub fn finish(self) -> Result<DeliveryReport, SendError> {
        let mut report = DeliveryReport {
            send_id: self.send_id,
            accepted: Vec::new(),
            pending: Vec::new(),
            rejected: Vec::new(),
        };
        let mut failures: Vec<DeliveryFailure> = Vec::new();

        for (recipient, slot) in self.recipients.into_iter().zip(self.slots) {
            let error = match slot.outcome {
                Some(RecipientOutcome::Accepted) => {
                    report.accepted.push(recipient);
                    continue;
                }
                Some(RecipientOutcome::Pending(reason)) => {
                    report.pending.push((recipient, reason));
                    continue;
                }
                Some(RecipientOutcome::Rejected(reason)) => reason,
                None => DeliveryError::Protocol("No delivery outcome was recorded".to_string()),
            };

            match failures
                .iter_mut()
                .find(|f| f.domain == slot.domain && f.error == error)
            {
                Some(failure) => failure.recipients.push(recipient.clone()),
                None => failures.push(DeliveryFailure {
                    domain: slot.domain,
                    server: slot.server,
                    attempts: slot.attempts,
                    recipients: vec![recipient.clone()],
                    error: error.clone(),
                }),
            }

            report.rejected.push((recipient, error));
        }

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(SendError { report, failures })
        }
    }
}
