//! CSV and HAR renditions of a tab's records.

use crate::record::{
    RequestRecord,
    RequestStatus,
};
use serde::{
    Deserialize,
    Serialize,
};

pub const CSV_HEADER: [&str; 8] = ["Timestamp", "Status", "DNS Status", "Domain", "Method", "Type", "Duration", "URL"];

/// One line per record, header first. Duration is in milliseconds and empty while unknown.
pub fn to_csv<'a>(records: impl IntoIterator<Item = &'a RequestRecord>) -> String {
    let mut out = CSV_HEADER.join(",");
    out.push('\n');

    for record in records {
        let duration = record
            .duration()
            .map(|it| it.num_milliseconds().max(0).to_string())
            .unwrap_or_default();
        let fields = [
            csv_field(&record.timestamp),
            csv_field(&record.status.to_string()),
            csv_field(record.dns_status.as_str()),
            csv_field(record.domain.as_deref().unwrap_or("N/A")),
            csv_field(&record.method),
            csv_field(&record.resource_type),
            duration,
            // urls are always quoted
            format!("\"{}\"", record.url.replace('"', "\"\"")),
        ];
        out.push_str(&fields.join(","));
        out.push('\n');
    }

    out
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

// -=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-
// HAR

/// HTTP Archive 1.2, see http://www.softwareishard.com/blog/har-12-spec/
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Har {
    pub log: HarLog,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarLog {
    pub version: String,
    pub creator: HarCreator,
    pub entries: Vec<HarEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarCreator {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarEntry {
    pub started_date_time: String,
    /// Total time in ms
    pub time: f64,
    pub request: HarRequest,
    pub response: HarResponse,
    pub cache: serde_json::Map<String, serde_json::Value>,
    pub timings: HarTimings,
    #[serde(rename = "_resourceType")]
    pub resource_type: String,
    #[serde(rename = "_dnsStatus")]
    pub dns_status: String,
    #[serde(rename = "_dnsError", skip_serializing_if = "Option::is_none")]
    pub dns_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarNameValue {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarRequest {
    pub method: String,
    pub url: String,
    pub http_version: String,
    pub cookies: Vec<HarNameValue>,
    pub headers: Vec<HarNameValue>,
    pub query_string: Vec<HarNameValue>,
    pub headers_size: i64,
    pub body_size: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarResponse {
    /// 0 while pending or when the request failed
    pub status: u16,
    pub status_text: String,
    pub http_version: String,
    pub cookies: Vec<HarNameValue>,
    pub headers: Vec<HarNameValue>,
    pub content: HarContent,
    #[serde(rename = "redirectURL")]
    pub redirect_url: String,
    pub headers_size: i64,
    pub body_size: i64,
    #[serde(rename = "_error", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarContent {
    pub size: i64,
    pub mime_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarTimings {
    pub send: f64,
    pub wait: f64,
    pub receive: f64,
}

pub fn to_har<'a>(records: impl IntoIterator<Item = &'a RequestRecord>) -> Har {
    Har {
        log: HarLog {
            version: "1.2".to_string(),
            creator: HarCreator {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            entries: records.into_iter().map(har_entry).collect(),
        },
    }
}

fn har_entry(record: &RequestRecord) -> HarEntry {
    let time = record
        .duration()
        .map(|it| it.num_milliseconds().max(0) as f64)
        .unwrap_or(0.0);

    let query_string = url::Url::parse(&record.url)
        .map(|url| {
            url.query_pairs()
                .map(|(name, value)| HarNameValue {
                    name: name.into_owned(),
                    value: value.into_owned(),
                })
                .collect()
        })
        .unwrap_or_default();

    let (status, error) = match &record.status {
        RequestStatus::Pending => (0, None),
        RequestStatus::Completed(code) => (*code, None),
        RequestStatus::Failed(reason) => (0, Some(reason.clone())),
    };

    HarEntry {
        started_date_time: record.started_at.to_rfc3339(),
        time,
        request: HarRequest {
            method: record.method.clone(),
            url: record.url.clone(),
            http_version: String::new(),
            cookies: vec![],
            headers: vec![],
            query_string,
            headers_size: -1,
            body_size: -1,
        },
        response: HarResponse {
            status,
            status_text: record.status_text.clone().unwrap_or_default(),
            http_version: String::new(),
            cookies: vec![],
            headers: vec![],
            content: HarContent {
                size: 0,
                mime_type: String::new(),
            },
            redirect_url: String::new(),
            headers_size: -1,
            body_size: -1,
            error,
        },
        cache: Default::default(),
        timings: HarTimings {
            send: 0.0,
            wait: time,
            receive: 0.0,
        },
        resource_type: record.resource_type.clone(),
        dns_status: record.dns_status.to_string(),
        dns_error: record.dns_error.clone(),
    }
}
