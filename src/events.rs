//! Host events the monitor reacts to, and a reader for JSON-lines event logs.

use crate::record::{
    RequestId,
    TabId,
};
use chrono::prelude::*;
use futures::Stream;
use serde::{
    Deserialize,
    Serialize,
};
use tokio::io::{
    AsyncBufRead,
    AsyncBufReadExt as _,
};

/// A request is about to be sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStarted {
    pub request_id: RequestId,
    pub tab_id: TabId,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(rename = "type", default = "default_resource_type")]
    pub resource_type: String,
    /// Milliseconds since the unix epoch.
    pub time_stamp: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestCompleted {
    pub request_id: RequestId,
    pub tab_id: TabId,
    pub status_code: u16,
    pub time_stamp: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestFailed {
    pub request_id: RequestId,
    pub tab_id: TabId,
    /// Failure reason as reported by the host, e.g. `NS_ERROR_UNKNOWN_HOST`.
    pub error: String,
    pub time_stamp: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BrowserEvent {
    BeforeRequest(RequestStarted),
    Completed(RequestCompleted),
    ErrorOccurred(RequestFailed),
    TabNavigating {
        #[serde(rename = "tabId")]
        tab_id: TabId,
    },
    TabClosed {
        #[serde(rename = "tabId")]
        tab_id: TabId,
    },
    TabActivated {
        #[serde(rename = "tabId")]
        tab_id: TabId,
    },
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_resource_type() -> String {
    "other".to_string()
}

/// Host timestamp to UTC, falling back to now when absent or out of range.
pub fn event_time(time_stamp: Option<f64>) -> DateTime<Utc> {
    time_stamp
        .and_then(|ms| DateTime::from_timestamp_millis(ms as i64))
        .unwrap_or_else(Utc::now)
}

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("failed to read events: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid event on line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Parse one event per line. Blank lines and lines starting with `#` are skipped.
pub fn read_events<R>(reader: R) -> impl Stream<Item = Result<BrowserEvent, EventError>> + Send + 'static
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    async_stream::stream! {
        let mut lines = reader.lines();
        let mut line_no = 0;

        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => {
                    yield Err(EventError::Io(err));
                    break;
                }
            };
            line_no += 1;

            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            yield serde_json::from_str::<BrowserEvent>(line).map_err(|source| EventError::Parse { line: line_no, source });
        }
    }
}
