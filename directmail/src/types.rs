//! Per-destination delivery state.

use std::{sync::Arc, time::Duration};

use directmail_common::Address;
use ulid::Ulid;

use crate::{
    dns::MailServer,
    error::DeliveryError,
    events::Settlement,
    outcome::RecipientOutcome,
};

/// Where a destination group is in its retry cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    FirstAttempt,
    /// A temporary failure was seen; the next attempt starts after `delay`.
    Waiting { delay: Duration },
    Retrying,
    Done,
}

/// What one session attempt decided, for the recipients it was given.
#[derive(Debug, Clone)]
pub struct Attempt {
    /// The host the attempt ended on
    pub server: Option<String>,
    pub outcomes: Vec<(Address, RecipientOutcome)>,
}

impl Attempt {
    /// The same outcome for every recipient.
    #[must_use]
    pub fn uniform(server: Option<String>, recipients: &[Address], outcome: &RecipientOutcome) -> Self {
        Self {
            server,
            outcomes: recipients
                .iter()
                .map(|recipient| (recipient.clone(), outcome.clone()))
                .collect(),
        }
    }
}

/// Recipients of one domain, sharing a candidate host list and a retry cycle.
#[derive(Debug, Clone)]
pub struct DestinationGroup {
    domain: String,
    servers: Arc<Vec<MailServer>>,
    recipients: Vec<Address>,
    outcomes: Vec<Option<RecipientOutcome>>,
    attempts: u32,
    last_error: Option<DeliveryError>,
    last_server: Option<String>,
    state: GroupState,
}

impl DestinationGroup {
    /// `recipients` must be in envelope order.
    #[must_use]
    pub fn new(domain: impl Into<String>, servers: Arc<Vec<MailServer>>, recipients: Vec<Address>) -> Self {
        let outcomes = vec![None; recipients.len()];
        Self {
            domain: domain.into(),
            servers,
            recipients,
            outcomes,
            attempts: 0,
            last_error: None,
            last_server: None,
            state: GroupState::FirstAttempt,
        }
    }

    /// A group whose domain could not be resolved: every recipient is
    /// rejected and no attempt will be made.
    #[must_use]
    pub fn unresolvable(domain: impl Into<String>, recipients: Vec<Address>, error: DeliveryError) -> Self {
        let outcomes = vec![Some(RecipientOutcome::Rejected(error.clone())); recipients.len()];
        Self {
            domain: domain.into(),
            servers: Arc::new(Vec::new()),
            recipients,
            outcomes,
            attempts: 0,
            last_error: Some(error),
            last_server: None,
            state: GroupState::Done,
        }
    }

    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    #[must_use]
    pub fn servers(&self) -> &[MailServer] {
        &self.servers
    }

    #[must_use]
    pub fn recipients(&self) -> &[Address] {
        &self.recipients
    }

    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    #[must_use]
    pub const fn last_error(&self) -> Option<&DeliveryError> {
        self.last_error.as_ref()
    }

    #[must_use]
    pub fn last_server(&self) -> Option<&str> {
        self.last_server.as_deref()
    }

    #[must_use]
    pub const fn state(&self) -> GroupState {
        self.state
    }

    #[must_use]
    pub const fn is_done(&self) -> bool {
        matches!(self.state, GroupState::Done)
    }

    /// Recipients without a terminal outcome, in envelope order.
    #[must_use]
    pub fn pending(&self) -> Vec<Address> {
        self.recipients
            .iter()
            .zip(&self.outcomes)
            .filter(|(_, outcome)| !outcome.as_ref().is_some_and(RecipientOutcome::is_terminal))
            .map(|(recipient, _)| recipient.clone())
            .collect()
    }

    /// Every recipient with its current outcome, `None` if never attempted.
    pub fn outcomes(&self) -> impl Iterator<Item = (&Address, Option<&RecipientOutcome>)> {
        self.recipients.iter().zip(self.outcomes.iter().map(Option::as_ref))
    }

    /// Records the result of one attempt.
    ///
    /// Terminal outcomes are never overwritten and recipients outside the
    /// group are ignored.
    pub fn fold(&mut self, attempt: Attempt) {
        self.attempts += 1;
        if attempt.server.is_some() {
            self.last_server = attempt.server;
        }

        for (recipient, outcome) in attempt.outcomes {
            let Some(index) = self.recipients.iter().position(|r| *r == recipient) else {
                continue;
            };

            let slot = &mut self.outcomes[index];
            if slot.as_ref().is_some_and(RecipientOutcome::is_terminal) {
                continue;
            }

            if let Some(error) = outcome.error() {
                self.last_error = Some(error.clone());
            }
            *slot = Some(outcome);
        }
    }

    /// Waits `delay` before the next attempt.
    pub const fn wait(&mut self, delay: Duration) {
        self.state = GroupState::Waiting { delay };
    }

    /// Leaves [`GroupState::Waiting`] for the next attempt.
    pub const fn begin_retry(&mut self) {
        if let GroupState::Waiting { .. } = self.state {
            self.state = GroupState::Retrying;
        }
    }

    /// Out of attempts: every recipient still pending is rejected with the
    /// reason of its last temporary failure.
    pub fn exhaust(&mut self) {
        let fallback = self
            .last_error
            .clone()
            .unwrap_or_else(|| DeliveryError::Connection("No delivery attempt completed".to_string()));

        for outcome in &mut self.outcomes {
            *outcome = match outcome.take() {
                Some(RecipientOutcome::Pending(reason)) => Some(RecipientOutcome::Rejected(reason)),
                Some(terminal) => Some(terminal),
                None => Some(RecipientOutcome::Rejected(fallback.clone())),
            };
        }
        self.state = GroupState::Done;
    }

    /// Every recipient has a terminal outcome.
    pub const fn finish(&mut self) {
        self.state = GroupState::Done;
    }

    /// The group's authoritative outcome for a settlement event.
    #[must_use]
    pub fn settlement(&self, send_id: Ulid) -> Settlement {
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();

        for (recipient, outcome) in self.outcomes() {
            match outcome {
                Some(RecipientOutcome::Accepted) => accepted.push(recipient.clone()),
                Some(RecipientOutcome::Rejected(error) | RecipientOutcome::Pending(error)) => {
                    rejected.push((recipient.clone(), error.clone()));
                }
                None => rejected.push((
                    recipient.clone(),
                    DeliveryError::Connection("No delivery attempt completed".to_string()),
                )),
            }
        }

        Settlement {
            send_id,
            domain: self.domain.clone(),
            attempts: self.attempts,
            accepted,
            rejected,
        }
    }
}
