use crate::{
    classify::{
        classify,
        ErrorCounts,
        RecordFilter,
    },
    record::{
        RecordKey,
        RequestId,
        RequestRecord,
        TabId,
    },
};
use chrono::prelude::*;
use serde::Serialize;
use std::collections::{
    BTreeSet,
    HashMap,
};

/// Records of one tab in arrival order. `counts` is a cache of [`classify`] over `records`.
#[derive(Default, Debug, Clone)]
pub struct TabState {
    pub records: Vec<RequestRecord>,
    pub counts: ErrorCounts,
}

/// What presentation consumers get for a tab.
#[derive(Default, Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TabSnapshot {
    pub requests: Vec<RequestRecord>,
    pub error_count: usize,
    pub dns_error_count: usize,
    pub acceptable_codes: Vec<u16>,
}

/// New request to append to a tab.
#[derive(Debug, Clone)]
pub struct NewRequest {
    pub id: RequestId,
    pub url: String,
    pub method: String,
    pub resource_type: String,
    pub started_at: DateTime<Utc>,
}

/// Owns the request records of every tracked tab.
#[derive(Default, Debug)]
pub struct Ledger {
    tabs: HashMap<TabId, TabState>,
    next_key: u64,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a fresh page for `tab`, dropping whatever it had.
    pub fn on_tab_start(&mut self, tab: TabId) {
        self.tabs.insert(tab, TabState::default());
    }

    pub fn on_tab_closed(&mut self, tab: TabId) -> Option<TabState> {
        self.tabs.remove(&tab)
    }

    pub fn tab(&self, tab: TabId) -> Option<&TabState> {
        self.tabs.get(&tab)
    }

    pub fn is_tracked(&self, tab: TabId) -> bool {
        self.tabs.contains_key(&tab)
    }

    pub fn tab_ids(&self) -> Vec<TabId> {
        let mut ids = self.tabs.keys().copied().collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    /// Append a pending record, creating the tab on first sight. Returns `None` if the tab already holds a record
    /// with this request id.
    pub fn push(&mut self, tab: TabId, request: NewRequest) -> Option<&RequestRecord> {
        let state = self.tabs.entry(tab).or_default();
        if state.records.iter().any(|it| it.id == request.id) {
            return None;
        }

        let key = RecordKey(self.next_key);
        self.next_key += 1;

        let NewRequest {
            id,
            url,
            method,
            resource_type,
            started_at,
        } = request;
        state
            .records
            .push(RequestRecord::new(key, id, url, method, resource_type, started_at));
        state.records.last()
    }

    pub fn find_by_id_mut(&mut self, tab: TabId, id: &RequestId) -> Option<&mut RequestRecord> {
        self.tabs.get_mut(&tab)?.records.iter_mut().find(|it| &it.id == id)
    }

    pub fn find_by_key_mut(&mut self, tab: TabId, key: RecordKey) -> Option<&mut RequestRecord> {
        self.tabs.get_mut(&tab)?.records.iter_mut().find(|it| it.key == key)
    }

    /// Recount the errors of `tab`. Unknown tabs count as zero.
    pub fn reclassify(&mut self, tab: TabId, acceptable: &BTreeSet<u16>) -> ErrorCounts {
        let Some(state) = self.tabs.get_mut(&tab) else {
            return ErrorCounts::default();
        };
        state.counts = classify(&state.records, acceptable);
        state.counts
    }

    pub fn counts(&self, tab: TabId) -> ErrorCounts {
        self.tabs.get(&tab).map(|state| state.counts).unwrap_or_default()
    }

    /// Snapshot of `tab` for presentation; untracked tabs give an empty one.
    pub fn snapshot(&self, tab: TabId, acceptable: &BTreeSet<u16>, filter: RecordFilter) -> TabSnapshot {
        let acceptable_codes = acceptable.iter().copied().collect();
        let Some(state) = self.tabs.get(&tab) else {
            return TabSnapshot {
                acceptable_codes,
                ..Default::default()
            };
        };
        TabSnapshot {
            requests: state
                .records
                .iter()
                .filter(|it| filter.matches(it, acceptable))
                .cloned()
                .collect(),
            error_count: state.counts.http,
            dns_error_count: state.counts.dns,
            acceptable_codes,
        }
    }
}
