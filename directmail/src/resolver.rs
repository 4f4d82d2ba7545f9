//! Partitions an envelope's recipients into destination groups.

use std::sync::Arc;

use directmail_common::{Address, Envelope};
use futures_util::future::join_all;

use crate::{
    dns::{DnsError, DnsResolver, MailServer},
    error::DeliveryError,
    events::{EventEmitter, LogKind},
    types::DestinationGroup,
};

/// Recipients sharing a destination, before resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// Case-folded domain, or the literal as written
    pub domain: String,
    pub recipients: Vec<Address>,
}

/// Groups recipients by domain (case-insensitive), in order of each domain's
/// first appearance. Recipients keep envelope order within their group.
#[must_use]
pub fn partition(recipients: &[Address]) -> Vec<Partition> {
    let mut partitions: Vec<Partition> = Vec::new();

    for recipient in recipients {
        let domain = recipient.domain_key();
        match partitions.iter_mut().find(|p| p.domain == domain) {
            Some(partition) => partition.recipients.push(recipient.clone()),
            None => partitions.push(Partition {
                domain,
                recipients: vec![recipient.clone()],
            }),
        }
    }

    partitions
}

pub struct DestinationResolver {
    dns: Arc<dyn DnsResolver>,
}

impl DestinationResolver {
    #[must_use]
    pub fn new(dns: Arc<dyn DnsResolver>) -> Self {
        Self { dns }
    }

    /// Candidate hosts for one partition.
    ///
    /// Address literals skip DNS and deliver to the literal IP on the
    /// configured port.
    async fn servers(&self, partition: &Partition) -> Result<Arc<Vec<MailServer>>, DeliveryError> {
        let Some(first) = partition.recipients.first() else {
            return Err(DnsError::NoMailServers(partition.domain.clone()).into());
        };

        if first.is_address_literal() {
            return first.literal_ip().map_or_else(
                || {
                    Err(DeliveryError::Resolution {
                        domain: partition.domain.clone(),
                        reason: "Malformed address literal".to_string(),
                    })
                },
                |ip| Ok(Arc::new(vec![MailServer::new(ip.to_string(), 0)])),
            );
        }

        let servers = self.dns.resolve_mail_servers(&partition.domain).await?;
        if servers.is_empty() {
            return Err(DnsError::NoMailServers(partition.domain.clone()).into());
        }

        Ok(servers)
    }

    /// Resolves every domain of `envelope` concurrently.
    ///
    /// A domain that fails to resolve becomes a finished group whose
    /// recipients are all rejected.
    pub async fn resolve(&self, envelope: &Envelope, emitter: &EventEmitter) -> Vec<DestinationGroup> {
        let partitions = partition(envelope.recipients());

        join_all(partitions.into_iter().map(|partition| async move {
            match self.servers(&partition).await {
                Ok(servers) => {
                    let hosts = servers
                        .iter()
                        .map(|server| server.host.as_str())
                        .collect::<Vec<_>>()
                        .join(", ");
                    emitter.info(
                        LogKind::Resolve,
                        &partition.domain,
                        format!("Resolved {} host(s): {hosts}", servers.len()),
                    );
                    DestinationGroup::new(partition.domain, servers, partition.recipients)
                }
                Err(error) => {
                    emitter.warn(LogKind::Resolve, &partition.domain, error.to_string());
                    DestinationGroup::unresolvable(partition.domain, partition.recipients, error)
                }
            }
        }))
        .await
    }
}
