//! Test support for delivering against in-process SMTP servers.

pub mod mock_server;

use std::sync::Arc;

use directmail::{DirectTransport, MailServer, StaticResolver, TransportConfig, TransportEvent};
pub use mock_server::{MockSmtpServer, SmtpCommand};
use tokio::sync::broadcast;

/// A mail server entry pointing at `server`.
#[must_use]
pub fn route(server: &MockSmtpServer, priority: u16) -> MailServer {
    MailServer::new(server.addr().ip().to_string(), priority).with_port(server.addr().port())
}

/// A transport that delivers every domain in `domains` to `server`.
#[must_use]
pub fn transport_to(server: &MockSmtpServer, domains: &[&str], config: TransportConfig) -> DirectTransport {
    let resolver = domains.iter().fold(StaticResolver::new(), |resolver, domain| {
        resolver.with_route(domain, vec![route(server, 10)])
    });
    DirectTransport::with_resolver(config, Arc::new(resolver))
}

/// Every event published so far.
pub fn drain(events: &mut broadcast::Receiver<TransportEvent>) -> Vec<TransportEvent> {
    std::iter::from_fn(|| events.try_recv().ok()).collect()
}
