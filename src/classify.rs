//! Derives a tab's error counts from its records. Always a full recount, never patched incrementally, so the counts
//! can not drift from the records they describe.

use crate::record::{
    RequestRecord,
    RequestStatus,
};
use serde::Serialize;
use std::collections::BTreeSet;

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ErrorCounts {
    pub http: usize,
    pub dns: usize,
}

impl ErrorCounts {
    pub fn total(&self) -> usize {
        self.http + self.dns
    }
}

/// HTTP failure: a completed request with a code outside `acceptable`, or a host-reported failure that is not a
/// cancellation.
pub fn is_http_error(record: &RequestRecord, acceptable: &BTreeSet<u16>) -> bool {
    match &record.status {
        RequestStatus::Pending => false,
        RequestStatus::Completed(code) => !acceptable.contains(code),
        RequestStatus::Failed(_) => !record.is_cancelled(),
    }
}

/// DNS failure: the domain did not resolve or could not be checked. The DNS outcome of a cancelled request is not
/// held against the page.
pub fn is_dns_error(record: &RequestRecord) -> bool {
    record.has_dns_error() && !record.is_cancelled()
}

pub fn classify<'a>(records: impl IntoIterator<Item = &'a RequestRecord>, acceptable: &BTreeSet<u16>) -> ErrorCounts {
    records.into_iter().fold(ErrorCounts::default(), |mut counts, record| {
        if is_http_error(record, acceptable) {
            counts.http += 1;
        }
        if is_dns_error(record) {
            counts.dns += 1;
        }
        counts
    })
}

/// Views offered to presentation consumers.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFilter {
    #[default]
    All,
    HttpErrors,
    DnsErrors,
}

impl RecordFilter {
    pub fn matches(&self, record: &RequestRecord, acceptable: &BTreeSet<u16>) -> bool {
        match self {
            RecordFilter::All => true,
            RecordFilter::HttpErrors => is_http_error(record, acceptable),
            // the popup lists every failed lookup here, cancelled or not
            RecordFilter::DnsErrors => record.has_dns_error(),
        }
    }
}

impl std::str::FromStr for RecordFilter {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(RecordFilter::All),
            "http-errors" => Ok(RecordFilter::HttpErrors),
            "dns-errors" => Ok(RecordFilter::DnsErrors),
            s => Err(eyre::eyre!("Invalid filter: {s:?}")),
        }
    }
}
