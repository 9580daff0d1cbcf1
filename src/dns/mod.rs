//! Domain existence checks against public DNS-over-HTTPS resolvers.

pub mod cache;
pub mod doh;

use serde::{
    Deserialize,
    Serialize,
};
use std::{
    fmt,
    future::Future,
};

pub use cache::DnsCache;
pub use doh::DohClient;

#[derive(Debug, thiserror::Error)]
pub enum DnsError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("DNS API error: {0}")]
    Status(u16),

    #[error("invalid resolver url: {0}")]
    Url(#[from] url::ParseError),
}

/// Outcome of checking whether a request's domain resolves.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsStatus {
    /// Lookup not finished yet (or never started because the url had no host).
    #[default]
    Checking,
    Valid,
    /// The resolver answered, but the domain has no A record / does not exist.
    Invalid,
    /// The resolver could not be asked.
    Error,
}

impl DnsStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DnsStatus::Checking => "checking",
            DnsStatus::Valid => "valid",
            DnsStatus::Invalid => "invalid",
            DnsStatus::Error => "error",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, DnsStatus::Invalid | DnsStatus::Error)
    }
}

impl fmt::Display for DnsStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the `Answer` array of a DoH JSON response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsAnswer {
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: u16,
    #[serde(rename = "TTL", default)]
    pub ttl: u32,
    pub data: String,
}

/// JSON body returned by `GET <endpoint>?name=<domain>&type=A`.
///
/// See https://developers.google.com/speed/public-dns/docs/doh/json
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DohResponse {
    /// DNS rcode, 0 = NOERROR, 3 = NXDOMAIN
    #[serde(rename = "Status")]
    pub status: u32,
    #[serde(rename = "Answer", default)]
    pub answer: Vec<DnsAnswer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DnsVerification {
    pub exists: bool,
    pub status: DnsStatus,
    pub answers: Vec<DnsAnswer>,
    pub error: Option<String>,
}

impl DnsVerification {
    pub fn valid(answers: Vec<DnsAnswer>) -> Self {
        Self {
            exists: true,
            status: DnsStatus::Valid,
            answers,
            error: None,
        }
    }

    /// The resolver answered with a non-zero rcode.
    pub fn invalid(rcode: u32) -> Self {
        Self {
            exists: false,
            status: DnsStatus::Invalid,
            answers: vec![],
            error: Some(format!("DNS Status: {rcode}")),
        }
    }

    pub fn failed(err: &DnsError) -> Self {
        Self {
            exists: false,
            status: DnsStatus::Error,
            answers: vec![],
            error: Some(err.to_string()),
        }
    }
}

impl From<DohResponse> for DnsVerification {
    fn from(response: DohResponse) -> Self {
        match response {
            DohResponse { status: 0, answer } if !answer.is_empty() => DnsVerification::valid(answer),
            // NOERROR but no A record
            DohResponse { status: 0, .. } => DnsVerification {
                exists: false,
                status: DnsStatus::Invalid,
                answers: vec![],
                error: None,
            },
            DohResponse { status, .. } => DnsVerification::invalid(status),
        }
    }
}

/// Public resolver used for verification. Persisted as its string identifier.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub enum DnsProvider {
    #[default]
    Google,
    Cloudflare,
    /// Any endpoint speaking the DoH JSON dialect.
    Custom(url::Url),
}

impl DnsProvider {
    pub fn endpoint(&self) -> &str {
        match self {
            DnsProvider::Google => "https://dns.google/resolve",
            DnsProvider::Cloudflare => "https://cloudflare-dns.com/dns-query",
            DnsProvider::Custom(url) => url.as_str(),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            DnsProvider::Google => "google",
            DnsProvider::Cloudflare => "cloudflare",
            DnsProvider::Custom(url) => url.as_str(),
        }
    }
}

impl fmt::Display for DnsProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl std::str::FromStr for DnsProvider {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "google" => Ok(DnsProvider::Google),
            "cloudflare" => Ok(DnsProvider::Cloudflare),
            s if s.starts_with("https://") => Ok(DnsProvider::Custom(url::Url::parse(s)?)),
            s => Err(eyre::eyre!("Invalid DNS provider: {s:?}")),
        }
    }
}

/// Transport that asks a resolver for the A records of a domain.
pub trait Resolve: Send + Sync + 'static {
    fn resolve_a(&self, domain: &str) -> impl Future<Output = Result<DohResponse, DnsError>> + Send;

    /// Switch the resolver that subsequent queries go to.
    fn use_provider(&self, _provider: DnsProvider) {}
}
