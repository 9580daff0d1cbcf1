use super::{
    DnsProvider,
    DnsStatus,
    DnsVerification,
    Resolve,
};
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

/// How long a lookup result is trusted.
pub const DNS_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

struct CacheEntry {
    verification: DnsVerification,
    captured_at: Instant,
}

/// Memoizes domain verifications for a fixed TTL.
///
/// Failed lookups are cached too, so a broken domain is only asked for once per TTL. Concurrent lookups of the same
/// domain are not coalesced, each one asks the resolver and the last one to finish wins the slot.
pub struct DnsCache<R> {
    resolver: R,
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
    error_ttl: Duration,
}

impl<R: Resolve> DnsCache<R> {
    pub fn new(resolver: R) -> Self {
        Self::with_ttl(resolver, DNS_CACHE_TTL, DNS_CACHE_TTL)
    }

    /// `error_ttl` applies to entries whose status is [`DnsStatus::Error`].
    pub fn with_ttl(resolver: R, ttl: Duration, error_ttl: Duration) -> Self {
        Self {
            resolver,
            entries: DashMap::new(),
            ttl,
            error_ttl,
        }
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    pub async fn verify(&self, domain: &str) -> DnsVerification {
        if let Some(cached) = self.fresh(domain) {
            trace!(%domain, status = %cached.status, "DNS cache hit");
            return cached;
        }

        let verification = match self.resolver.resolve_a(domain).await {
            Ok(response) => DnsVerification::from(response),
            Err(err) => {
                error!(%domain, "DNS verification failed: {err}");
                DnsVerification::failed(&err)
            }
        };

        debug!(%domain, status = %verification.status, "DNS verified");

        self.entries.insert(
            domain.to_string(),
            CacheEntry {
                verification: verification.clone(),
                captured_at: Instant::now(),
            },
        );

        verification
    }

    /// Swap the resolver and forget everything the previous one said.
    pub fn use_provider(&self, provider: DnsProvider) {
        self.resolver.use_provider(provider);
        self.clear();
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of entries, stale ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn fresh(&self, domain: &str) -> Option<DnsVerification> {
        let entry = self.entries.get(domain)?;
        let ttl = match entry.verification.status {
            DnsStatus::Error => self.error_ttl,
            _ => self.ttl,
        };
        if entry.captured_at.elapsed() < ttl {
            Some(entry.verification.clone())
        } else {
            None
        }
    }
}
