//! DNS resolution for mail delivery.
//!
//! Implements MX record lookups with A/AAAA fallback per RFC 5321 section 5.1,
//! behind the [`DnsResolver`] trait so the engine can be pointed at fixed
//! hosts instead.
//!
//! # Caching Strategy
//!
//! - **DNS TTL by default**: Uses the smallest TTL of the returned records
//! - **Bounded TTLs**: Applies min (60s) and max (3600s) bounds to prevent extremes
//! - **Optional override**: `cache_ttl_secs` replaces the DNS TTL for all entries
//! - **Lock-free**: `DashMap` provides concurrent access without mutex contention

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;
use hickory_resolver::{
    ResolveError, TokioResolver,
    config::{ResolverConfig, ResolverOpts},
    name_server::TokioConnectionProvider,
    proto::rr::Record,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

const DEFAULT_TTL_SECS: u32 = 300;

/// Errors that can occur during DNS resolution.
#[derive(Debug, Error)]
pub enum DnsError {
    /// No MX, A, or AAAA records found for the domain.
    #[error("No mail servers found for domain: {0}")]
    NoMailServers(String),

    /// DNS query failed due to network or resolver issues.
    #[error("DNS lookup failed for {domain}: {source}")]
    LookupFailed {
        domain: String,
        #[source]
        source: ResolveError,
    },

    /// Domain does not exist (NXDOMAIN).
    #[error("Domain does not exist: {0}")]
    DomainNotFound(String),
}

impl DnsError {
    #[must_use]
    pub fn domain(&self) -> &str {
        match self {
            Self::NoMailServers(domain)
            | Self::DomainNotFound(domain)
            | Self::LookupFailed { domain, .. } => domain,
        }
    }
}

/// Configuration for the hickory-backed resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// DNS query timeout in seconds (default: 5)
    #[serde(default = "defaults::timeout_secs")]
    pub timeout_secs: u64,

    /// Cache TTL override in seconds. When unset the record TTL is used.
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,

    /// Minimum cache TTL in seconds (default: 60)
    #[serde(default = "defaults::min_cache_ttl_secs")]
    pub min_cache_ttl_secs: u64,

    /// Maximum cache TTL in seconds (default: 3600)
    #[serde(default = "defaults::max_cache_ttl_secs")]
    pub max_cache_ttl_secs: u64,
}

mod defaults {
    pub const fn timeout_secs() -> u64 {
        5
    }

    pub const fn min_cache_ttl_secs() -> u64 {
        60
    }

    pub const fn max_cache_ttl_secs() -> u64 {
        3600
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: defaults::timeout_secs(),
            cache_ttl_secs: None,
            min_cache_ttl_secs: defaults::min_cache_ttl_secs(),
            max_cache_ttl_secs: defaults::max_cache_ttl_secs(),
        }
    }
}

/// A candidate delivery host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MailServer {
    /// Hostname or IP address.
    pub host: String,
    /// MX preference (lower value = tried first). 0 for A/AAAA fallback.
    pub priority: u16,
    /// Port to connect to. `None` uses the transport's configured port.
    #[serde(default)]
    pub port: Option<u16>,
}

impl MailServer {
    #[must_use]
    pub fn new(host: impl Into<String>, priority: u16) -> Self {
        Self {
            host: host.into(),
            priority,
            port: None,
        }
    }

    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// `host:port`, bracketing IPv6 hosts.
    #[must_use]
    pub fn address(&self, default_port: u16) -> String {
        let port = self.port.unwrap_or(default_port);
        if self.host.contains(':') {
            format!("[{}]:{port}", self.host)
        } else {
            format!("{}:{port}", self.host)
        }
    }
}

/// Sorts by preference, then by host so equal preferences keep a stable order.
pub fn sort_servers(servers: &mut [MailServer]) {
    servers.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.host.cmp(&b.host)));
}

/// Looks up the hosts that accept mail for a domain.
#[async_trait]
pub trait DnsResolver: Send + Sync {
    /// Candidate hosts for `domain`, most preferred first.
    ///
    /// # Errors
    ///
    /// Returns `DnsError` if the domain does not exist or has no usable host.
    async fn resolve_mail_servers(&self, domain: &str) -> Result<Arc<Vec<MailServer>>, DnsError>;
}

#[derive(Debug, Clone)]
struct CachedResult {
    servers: Arc<Vec<MailServer>>,
    expires_at: Instant,
}

/// MX resolver backed by hickory, with a concurrent TTL cache.
#[derive(Debug)]
pub struct HickoryResolver {
    resolver: TokioResolver,
    cache: Arc<DashMap<String, CachedResult>>,
    config: DnsConfig,
}

impl HickoryResolver {
    /// Uses the system resolver configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the system DNS configuration cannot be loaded.
    pub fn new(config: DnsConfig) -> Result<Self, ResolveError> {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(config.timeout_secs);

        let resolver = TokioResolver::builder(TokioConnectionProvider::default())?
            .with_options(opts)
            .build();

        Ok(Self {
            resolver,
            cache: Arc::new(DashMap::new()),
            config,
        })
    }

    /// Uses explicit upstream servers instead of the system configuration.
    #[must_use]
    pub fn with_resolver_config(
        resolver_config: ResolverConfig,
        opts: ResolverOpts,
        config: DnsConfig,
    ) -> Self {
        let resolver =
            TokioResolver::builder_with_config(resolver_config, TokioConnectionProvider::default())
                .with_options(opts)
                .build();

        Self {
            resolver,
            cache: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Number of cached domains, expired entries included
    #[must_use]
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    fn cache_ttl(&self, dns_ttl: u32) -> u64 {
        self.config.cache_ttl_secs.unwrap_or_else(|| {
            u64::from(dns_ttl).clamp(self.config.min_cache_ttl_secs, self.config.max_cache_ttl_secs)
        })
    }

    /// Returns `(servers, ttl)` where ttl is the minimum TTL of the records.
    async fn lookup(&self, domain: &str) -> Result<(Vec<MailServer>, u32), DnsError> {
        match self.resolver.mx_lookup(domain).await {
            Ok(mx_lookup) => {
                let min_ttl = mx_lookup
                    .as_lookup()
                    .records()
                    .iter()
                    .map(Record::ttl)
                    .min()
                    .unwrap_or(DEFAULT_TTL_SECS);

                let mut servers: Vec<MailServer> = mx_lookup
                    .iter()
                    .map(|mx| {
                        let host = mx.exchange().to_utf8();
                        MailServer::new(host.trim_end_matches('.'), mx.preference())
                    })
                    // RFC 7505 null MX: the domain explicitly accepts no mail
                    .filter(|server| !server.host.is_empty())
                    .collect();

                if servers.is_empty() {
                    if mx_lookup.iter().next().is_some() {
                        return Err(DnsError::NoMailServers(domain.to_string()));
                    }
                    debug!(domain, "MX lookup returned no records, falling back to A/AAAA");
                    return self.fallback_to_a_aaaa(domain).await;
                }

                sort_servers(&mut servers);
                debug!(domain, count = servers.len(), ttl = min_ttl, "Resolved MX records");
                Ok((servers, min_ttl))
            }
            Err(err) if err.is_nx_domain() => Err(DnsError::DomainNotFound(domain.to_string())),
            Err(err) if err.is_no_records_found() => {
                debug!(domain, "No MX records found, falling back to A/AAAA");
                self.fallback_to_a_aaaa(domain).await
            }
            Err(err) => {
                warn!(domain, error = %err, "MX lookup failed");
                Err(DnsError::LookupFailed {
                    domain: domain.to_string(),
                    source: err,
                })
            }
        }
    }

    /// Implicit MX (RFC 5321 section 5.1): the domain's own addresses with priority 0.
    async fn fallback_to_a_aaaa(&self, domain: &str) -> Result<(Vec<MailServer>, u32), DnsError> {
        match self.resolver.lookup_ip(domain).await {
            Ok(ip_lookup) => {
                let min_ttl = ip_lookup
                    .as_lookup()
                    .records()
                    .iter()
                    .map(Record::ttl)
                    .min()
                    .unwrap_or(DEFAULT_TTL_SECS);

                let mut servers: Vec<MailServer> = ip_lookup
                    .iter()
                    .map(|ip| MailServer::new(ip.to_string(), 0))
                    .collect();

                if servers.is_empty() {
                    return Err(DnsError::NoMailServers(domain.to_string()));
                }

                sort_servers(&mut servers);
                debug!(domain, count = servers.len(), ttl = min_ttl, "Resolved A/AAAA records");
                Ok((servers, min_ttl))
            }
            Err(err) if err.is_nx_domain() => Err(DnsError::DomainNotFound(domain.to_string())),
            Err(err) if err.is_no_records_found() => {
                Err(DnsError::NoMailServers(domain.to_string()))
            }
            Err(err) => {
                warn!(domain, error = %err, "A/AAAA lookup failed");
                Err(DnsError::LookupFailed {
                    domain: domain.to_string(),
                    source: err,
                })
            }
        }
    }
}

#[async_trait]
impl DnsResolver for HickoryResolver {
    async fn resolve_mail_servers(&self, domain: &str) -> Result<Arc<Vec<MailServer>>, DnsError> {
        let key = domain.to_ascii_lowercase();

        if let Some(cached) = self.cache.get(&key) {
            if cached.expires_at > Instant::now() {
                debug!(domain, count = cached.servers.len(), "DNS cache hit");
                return Ok(Arc::clone(&cached.servers));
            }
            debug!(domain, "DNS cache entry expired");
        }

        let (servers, dns_ttl) = self.lookup(&key).await?;
        let servers = Arc::new(servers);
        let cache_ttl = self.cache_ttl(dns_ttl);

        self.cache.insert(
            key,
            CachedResult {
                servers: Arc::clone(&servers),
                expires_at: Instant::now() + Duration::from_secs(cache_ttl),
            },
        );

        Ok(servers)
    }
}

/// Fixed domain to host mapping.
///
/// Serves MX overrides (e.g. routing a domain to a smart host or a local test
/// server) and can wrap another resolver for every domain it does not know.
#[derive(Default)]
pub struct StaticResolver {
    routes: HashMap<String, Arc<Vec<MailServer>>>,
    fallback: Option<Arc<dyn DnsResolver>>,
}

impl StaticResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes `domain` (case-insensitive) to `servers`.
    #[must_use]
    pub fn with_route(mut self, domain: &str, mut servers: Vec<MailServer>) -> Self {
        sort_servers(&mut servers);
        self.routes
            .insert(domain.to_ascii_lowercase(), Arc::new(servers));
        self
    }

    /// Consults `resolver` for domains without a route.
    #[must_use]
    pub fn with_fallback(mut self, resolver: Arc<dyn DnsResolver>) -> Self {
        self.fallback = Some(resolver);
        self
    }
}

#[async_trait]
impl DnsResolver for StaticResolver {
    async fn resolve_mail_servers(&self, domain: &str) -> Result<Arc<Vec<MailServer>>, DnsError> {
        if let Some(servers) = self.routes.get(&domain.to_ascii_lowercase()) {
            if servers.is_empty() {
                return Err(DnsError::NoMailServers(domain.to_string()));
            }
            return Ok(Arc::clone(servers));
        }

        match &self.fallback {
            Some(fallback) => fallback.resolve_mail_servers(domain).await,
            None => Err(DnsError::DomainNotFound(domain.to_string())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_servers_is_stable_on_ties() {
        let mut servers = vec![
            MailServer::new("mx3.example.com", 20),
            MailServer::new("mx2.example.com", 10),
            MailServer::new("mx1.example.com", 10),
        ];
        sort_servers(&mut servers);

        let hosts: Vec<_> = servers.iter().map(|s| s.host.as_str()).collect();
        assert_eq!(hosts, ["mx1.example.com", "mx2.example.com", "mx3.example.com"]);
    }

    #[test]
    fn test_address_formatting() {
        assert_eq!(MailServer::new("mx.example.com", 0).address(25), "mx.example.com:25");
        assert_eq!(
            MailServer::new("127.0.0.1", 0).with_port(2525).address(25),
            "127.0.0.1:2525"
        );
        assert_eq!(MailServer::new("::1", 0).address(25), "[::1]:25");
    }

    #[tokio::test]
    async fn test_static_resolver_routes() {
        let resolver = StaticResolver::new().with_route(
            "Example.COM",
            vec![
                MailServer::new("backup.example.com", 20),
                MailServer::new("primary.example.com", 10),
            ],
        );

        let servers = resolver.resolve_mail_servers("example.com").await.unwrap();
        assert_eq!(servers[0].host, "primary.example.com");
        assert_eq!(servers[1].host, "backup.example.com");

        // Same domain twice yields the same ordering
        let again = resolver.resolve_mail_servers("EXAMPLE.com").await.unwrap();
        assert_eq!(servers, again);
    }

    #[tokio::test]
    async fn test_static_resolver_unknown_domain() {
        let resolver = StaticResolver::new();
        let err = resolver
            .resolve_mail_servers("nowhere.invalid")
            .await
            .unwrap_err();
        assert!(matches!(err, DnsError::DomainNotFound(_)));
        assert_eq!(err.domain(), "nowhere.invalid");
    }

    #[tokio::test]
    async fn test_static_resolver_fallback() {
        let inner: Arc<dyn DnsResolver> = Arc::new(
            StaticResolver::new().with_route("other.test", vec![MailServer::new("mx.other.test", 5)]),
        );
        let resolver = StaticResolver::new()
            .with_route("example.test", vec![MailServer::new("mx.example.test", 5)])
            .with_fallback(inner);

        let servers = resolver.resolve_mail_servers("other.test").await.unwrap();
        assert_eq!(servers[0].host, "mx.other.test");
    }

    #[tokio::test]
    async fn test_static_resolver_empty_route() {
        let resolver = StaticResolver::new().with_route("empty.test", vec![]);
        assert!(matches!(
            resolver.resolve_mail_servers("empty.test").await,
            Err(DnsError::NoMailServers(_))
        ));
    }

    #[tokio::test]
    #[ignore = "Requires network access"]
    async fn test_mx_lookup_gmail() {
        let resolver = HickoryResolver::new(DnsConfig::default()).unwrap();
        let servers = resolver.resolve_mail_servers("gmail.com").await.unwrap();

        assert!(!servers.is_empty());
        assert!(servers.windows(2).all(|w| w[0].priority <= w[1].priority));
        assert_eq!(resolver.cache_len(), 1);
    }

    #[tokio::test]
    #[ignore = "Requires network access"]
    async fn test_nonexistent_domain() {
        let resolver = HickoryResolver::new(DnsConfig::default()).unwrap();
        let result = resolver
            .resolve_mail_servers("this-domain-does-not-exist-12345.invalid")
            .await;
        assert!(result.is_err());
    }
}
