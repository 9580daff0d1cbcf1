use crate::dns::{
    DnsStatus,
    DnsVerification,
};
use chrono::prelude::*;
use serde::{
    Serialize,
    Serializer,
};
use std::fmt;

/// Browser tab identifier as reported by the host.
pub type TabId = i64;

/// Tab id the host uses for requests that do not belong to any tab (service workers, the extension itself).
pub const NO_TAB: TabId = -1;

/// Failure reason the host reports for requests aborted by the user or the browser. Not a network defect.
pub const CANCELLED: &str = "NS_BINDING_ABORTED";

/// Request identifier assigned by the network layer. Only unique among the in-flight requests of a tab.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new(id: impl ToString) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ledger-assigned key of a record, never reused while the process runs. Asynchronous DNS checks carry it to find
/// their record again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RecordKey(pub u64);

/// HTTP outcome of a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Completed(u16),
    Failed(String),
}

impl RequestStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, RequestStatus::Pending)
    }

    /// A failure caused by the user / browser aborting the request.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RequestStatus::Failed(reason) if reason == CANCELLED)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestStatus::Pending => f.write_str("pending"),
            RequestStatus::Completed(code) => write!(f, "{code}"),
            RequestStatus::Failed(_) => f.write_str("ERROR"),
        }
    }
}

// Presentation consumers expect `"pending"`, the numeric code, or `"ERROR"`; the failure reason travels in
// `statusText`.
impl Serialize for RequestStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RequestStatus::Pending => serializer.serialize_str("pending"),
            RequestStatus::Completed(code) => serializer.serialize_u16(*code),
            RequestStatus::Failed(_) => serializer.serialize_str("ERROR"),
        }
    }
}

/// A single observed request of a tab.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    #[serde(skip)]
    pub key: RecordKey,
    pub id: RequestId,
    pub url: String,
    pub domain: Option<String>,
    pub method: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Local capture time, `HH:MM:SS`.
    pub timestamp: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RequestStatus,
    pub status_text: Option<String>,
    pub dns_status: DnsStatus,
    pub dns_error: Option<String>,
}

impl RequestRecord {
    pub fn new(
        key: RecordKey,
        id: RequestId,
        url: impl Into<String>,
        method: impl Into<String>,
        resource_type: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let url = url.into();
        let domain = extract_domain(&url);
        Self {
            key,
            id,
            domain,
            url,
            method: method.into(),
            resource_type: resource_type.into(),
            timestamp: started_at.with_timezone(&Local).format("%H:%M:%S").to_string(),
            started_at,
            completed_at: None,
            status: RequestStatus::Pending,
            status_text: None,
            dns_status: DnsStatus::Checking,
            dns_error: None,
        }
    }

    /// Pending -> Completed. Returns false (and leaves the record alone) for a request that already finished.
    pub fn complete(&mut self, code: u16, at: Option<DateTime<Utc>>) -> bool {
        if !self.status.is_pending() {
            return false;
        }
        self.status = RequestStatus::Completed(code);
        self.status_text = Some(status_text(code).to_string());
        self.completed_at = at;
        true
    }

    /// Pending -> Failed.
    pub fn fail(&mut self, reason: impl Into<String>, at: Option<DateTime<Utc>>) -> bool {
        if !self.status.is_pending() {
            return false;
        }
        let reason = reason.into();
        self.status_text = Some(reason.clone());
        self.status = RequestStatus::Failed(reason);
        self.completed_at = at;
        true
    }

    /// Checking -> outcome of the DNS check.
    pub fn apply_dns(&mut self, verification: &DnsVerification) -> bool {
        if self.dns_status != DnsStatus::Checking {
            return false;
        }
        self.dns_status = verification.status;
        self.dns_error = verification.error.clone();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.status.is_cancelled()
    }

    pub fn has_dns_error(&self) -> bool {
        self.dns_status.is_error()
    }

    /// Time between request start and completion / failure, if both are known.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|end| end - self.started_at)
    }
}

/// Host name of `url`, or `None` if it does not parse or carries no host.
pub fn extract_domain(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    parsed.host_str().filter(|host| !host.is_empty()).map(str::to_string)
}

/// Reason phrase for an HTTP status code.
pub fn status_text(code: u16) -> &'static str {
    reqwest::StatusCode::from_u16(code)
        .ok()
        .and_then(|status| status.canonical_reason())
        .unwrap_or("Unknown")
}
