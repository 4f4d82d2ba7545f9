//! Retry scheduling for destination groups.
//!
//! ```text
//! FirstAttempt ──(all terminal)──────────────────────────────▶ Done
//!      │
//!      └─(temporary)─▶ Waiting ─▶ Retrying ─(all terminal)──▶ Done
//!                         ▲           │
//!                         └─(temp.)───┤
//!                                     └─(out of attempts)───▶ Done
//! ```
//!
//! A retry runs the full session again for the still-pending recipients,
//! against the host list resolved for the first attempt.

use std::time::Duration;

use tracing::Level;

use crate::{
    context::SendContext,
    events::{EventEmitter, LogKind},
    policy::RetryPolicy,
    session::SmtpSession,
    types::{DestinationGroup, GroupState},
};

#[derive(Debug, Clone)]
pub struct RetryScheduler {
    policy: RetryPolicy,
}

impl RetryScheduler {
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Runs one session attempt for the group's pending recipients and moves
    /// the group to its next state.
    pub async fn attempt_once(&self, ctx: &SendContext, group: &mut DestinationGroup) {
        if group.is_done() {
            return;
        }

        let pending = group.pending();
        let attempt = SmtpSession::new(ctx, group.domain())
            .attempt(group.servers(), &pending)
            .await;
        group.fold(attempt);

        self.schedule(&ctx.emitter, group);
    }

    /// Decides what follows the attempt just folded into `group`.
    pub fn schedule(&self, emitter: &EventEmitter, group: &mut DestinationGroup) {
        let attempts = group.attempts();
        let pending = group.pending().len();

        if pending == 0 {
            group.finish();
            emitter.info(
                LogKind::GroupDone,
                group.domain(),
                format!("Finished after {attempts} attempt(s)"),
            );
            return;
        }

        if !self.policy.should_retry(attempts) {
            group.exhaust();
            emitter.warn(
                LogKind::GroupDone,
                group.domain(),
                format!("Gave up on {pending} recipient(s) after {attempts} attempt(s)"),
            );
            return;
        }

        let delay = self.policy.backoff(attempts);
        group.wait(delay);
        emitter.log(
            Level::INFO,
            LogKind::RetryScheduled,
            Some(group.domain()),
            format!(
                "Retrying {pending} recipient(s) in {}ms ({} attempt(s) left)",
                delay.as_millis(),
                self.policy.remaining_attempts(attempts)
            ),
        );
    }

    /// Drives `group` until it is [`GroupState::Done`].
    pub async fn drive(&self, ctx: &SendContext, group: &mut DestinationGroup) {
        loop {
            match group.state() {
                GroupState::Done => return,
                GroupState::Waiting { delay } => {
                    Self::wait(delay).await;
                    group.begin_retry();
                }
                GroupState::FirstAttempt | GroupState::Retrying => {
                    self.attempt_once(ctx, group).await;
                }
            }
        }
    }

    async fn wait(delay: Duration) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}
