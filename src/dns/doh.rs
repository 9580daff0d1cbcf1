use super::{
    DnsError,
    DnsProvider,
    DohResponse,
    Resolve,
};
use arc_swap::ArcSwap;
use std::{
    sync::Arc,
    time::Duration,
};

// curl -H 'Accept: application/dns-json' 'https://dns.google/resolve?name=example.com&type=A'

/// DNS-over-HTTPS client speaking the JSON dialect offered by Google and Cloudflare.
pub struct DohClient {
    http: reqwest::Client,
    provider: ArcSwap<DnsProvider>,
}

impl DohClient {
    /// `timeout` of `None` keeps the transport default.
    pub fn new(provider: DnsProvider, timeout: Option<Duration>) -> Result<Self, DnsError> {
        let builder = reqwest::Client::builder();
        let builder = if let Some(timeout) = timeout {
            builder.timeout(timeout)
        } else {
            builder
        };
        Ok(Self {
            http: builder.build()?,
            provider: ArcSwap::from_pointee(provider),
        })
    }

    pub fn provider(&self) -> Arc<DnsProvider> {
        self.provider.load_full()
    }

    async fn request(&self, domain: &str) -> Result<DohResponse, DnsError> {
        let provider = self.provider.load_full();
        let url = url::Url::parse_with_params(provider.endpoint(), &[("name", domain), ("type", "A")])?;

        debug!(%domain, %provider, "DoH query");

        let res = self
            .http
            .get(url)
            .header("Accept", "application/dns-json")
            .send()
            .await?;

        if !res.status().is_success() {
            return Err(DnsError::Status(res.status().as_u16()));
        }

        let body: DohResponse = res.json().await?;
        trace!(%domain, ?body, "DoH response");

        Ok(body)
    }
}

impl Resolve for DohClient {
    async fn resolve_a(&self, domain: &str) -> Result<DohResponse, DnsError> {
        self.request(domain).await
    }

    fn use_provider(&self, provider: DnsProvider) {
        info!(%provider, "switching DNS provider");
        self.provider.store(Arc::new(provider));
    }
}
