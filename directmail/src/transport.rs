use std::sync::Arc;

use directmail_common::{Envelope, internal};
use futures_util::future::join_all;
use hickory_resolver::ResolveError;
use tokio::sync::broadcast;
use tracing::Level;
use ulid::Ulid;

use crate::{
    config::{Completion, TransportConfig},
    context::SendContext,
    dns::{DnsResolver, HickoryResolver},
    error::SendError,
    events::{EventEmitter, LogKind, TransportEvent},
    outcome::{DeliveryReport, ResultAggregator},
    resolver::DestinationResolver,
    scheduler::RetryScheduler,
    source::MessageSource,
    types::DestinationGroup,
};

/// Events buffered per subscriber before the oldest are dropped
const EVENT_CAPACITY: usize = 1024;

/// Delivers messages straight to each recipient domain's mail servers.
///
/// One transport can serve any number of concurrent send operations; they
/// share the configuration, the DNS resolver (and its cache) and the event
/// channel, and nothing else.
pub struct DirectTransport {
    config: Arc<TransportConfig>,
    resolver: DestinationResolver,
    events: broadcast::Sender<TransportEvent>,
}

impl DirectTransport {
    pub const NAME: &'static str = env!("CARGO_PKG_NAME");
    pub const VERSION: &'static str = env!("CARGO_PKG_VERSION");

    /// A transport resolving through the system DNS configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the system DNS configuration cannot be loaded.
    pub fn new(config: TransportConfig) -> Result<Self, ResolveError> {
        let dns = HickoryResolver::new(config.dns.clone())?;
        Ok(Self::with_resolver(config, Arc::new(dns)))
    }

    #[must_use]
    pub fn with_resolver(config: TransportConfig, resolver: Arc<dyn DnsResolver>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config: Arc::new(config),
            resolver: DestinationResolver::new(resolver),
            events,
        }
    }

    /// Receives the events of every send operation started after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Delivers the message read from `source` to every recipient of
    /// `envelope`.
    ///
    /// Resolves once, with every recipient either accepted, rejected or (in
    /// [`Completion::FirstAttempt`] mode) pending.
    ///
    /// # Errors
    ///
    /// Returns [`SendError`] when at least one recipient was rejected. The
    /// error still carries the accepted and pending recipients.
    pub async fn send(
        &self,
        envelope: Envelope,
        source: impl MessageSource + 'static,
    ) -> Result<DeliveryReport, SendError> {
        let send_id = Ulid::new();
        let emitter = Arc::new(EventEmitter::new(
            send_id,
            self.config.debug,
            self.events.clone(),
        ));
        let ctx = Arc::new(SendContext::new(
            Arc::clone(&self.config),
            emitter,
            envelope,
            Arc::new(source),
        ));

        internal!(
            level = DEBUG,
            %send_id,
            recipients = ctx.envelope.recipients().len(),
            "Starting send operation"
        );

        let mut groups = self.resolver.resolve(&ctx.envelope, &ctx.emitter).await;
        let scheduler = RetryScheduler::new(self.config.retry.clone());

        match self.config.completion {
            Completion::AllAttempts => {
                join_all(groups.iter_mut().map(|group| scheduler.drive(&ctx, group))).await;
            }
            Completion::FirstAttempt => {
                join_all(
                    groups
                        .iter_mut()
                        .map(|group| scheduler.attempt_once(&ctx, group)),
                )
                .await;
            }
        }

        let mut aggregator = ResultAggregator::new(send_id, &ctx.envelope);
        for group in &groups {
            aggregator.fold(group);
        }

        let unfinished: Vec<DestinationGroup> =
            groups.into_iter().filter(|group| !group.is_done()).collect();
        if !unfinished.is_empty() {
            tokio::spawn(settle(scheduler, Arc::clone(&ctx), unfinished));
        }

        let result = aggregator.finish();
        let report = match &result {
            Ok(report) => report,
            Err(error) => &error.report,
        };
        ctx.emitter.log(
            Level::INFO,
            LogKind::Completed,
            None,
            format!(
                "{} accepted, {} pending, {} rejected",
                report.accepted.len(),
                report.pending.len(),
                report.rejected.len()
            ),
        );

        result
    }
}

/// Finishes the retries of groups that outlived their send call and
/// publishes each one's final outcome.
async fn settle(scheduler: RetryScheduler, ctx: Arc<SendContext>, groups: Vec<DestinationGroup>) {
    join_all(groups.into_iter().map(|mut group| {
        let scheduler = &scheduler;
        let ctx = &ctx;
        async move {
            scheduler.drive(ctx, &mut group).await;
            ctx.emitter.settled(group.settlement(ctx.send_id));
        }
    }))
    .await;
}
