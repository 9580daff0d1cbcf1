//! Applies host events to the ledger and keeps error counts and badges current.

use crate::{
    context::Context,
    dns::Resolve,
    events::{
        event_time,
        BrowserEvent,
        RequestCompleted,
        RequestFailed,
        RequestStarted,
    },
    ledger::NewRequest,
    record::{
        RecordKey,
        TabId,
        CANCELLED,
        NO_TAB,
    },
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::instrument;

/// Dispatch a single event. Returns the handle of the DNS verification it started, if any.
pub async fn handle_event<R: Resolve>(ctx: &Arc<Context<R>>, event: BrowserEvent) -> Option<JoinHandle<()>> {
    match event {
        BrowserEvent::BeforeRequest(started) => return on_before_request(ctx, started).await,
        BrowserEvent::Completed(completed) => on_completed(ctx, completed).await,
        BrowserEvent::ErrorOccurred(failed) => on_error_occurred(ctx, failed).await,
        BrowserEvent::TabNavigating { tab_id } => on_tab_navigating(ctx, tab_id).await,
        BrowserEvent::TabClosed { tab_id } => on_tab_closed(ctx, tab_id).await,
        BrowserEvent::TabActivated { tab_id } => on_tab_activated(ctx, tab_id),
    }
    None
}

/// Record a new pending request and start verifying its domain in the background.
#[instrument(level = "debug", skip_all, fields(tab = event.tab_id, request = %event.request_id))]
pub async fn on_before_request<R: Resolve>(ctx: &Arc<Context<R>>, event: RequestStarted) -> Option<JoinHandle<()>> {
    if event.tab_id == NO_TAB {
        return None;
    }
    let tab = event.tab_id;

    let (key, domain) = {
        let mut ledger = ctx.ledger.lock().await;
        let Some(record) = ledger.push(tab, NewRequest {
            id: event.request_id,
            url: event.url,
            method: event.method,
            resource_type: event.resource_type,
            started_at: event_time(event.time_stamp),
        }) else {
            debug!("request already tracked");
            return None;
        };
        let found = (record.key, record.domain.clone());
        ctx.reclassify_locked(&mut ledger, tab);
        found
    };

    let Some(domain) = domain else {
        debug!("no domain to verify");
        return None;
    };

    let ctx = ctx.clone();
    Some(tokio::spawn(verify_record(ctx, tab, key, domain)))
}

/// Resolve `domain` and store the outcome on the record identified by `(tab, key)`. If the record is gone by then
/// (navigation, tab closed, cleared) the outcome is dropped.
async fn verify_record<R: Resolve>(ctx: Arc<Context<R>>, tab: TabId, key: RecordKey, domain: String) {
    let verification = ctx.dns().verify(&domain).await;

    let mut ledger = ctx.ledger.lock().await;
    let Some(record) = ledger.find_by_key_mut(tab, key) else {
        trace!(tab, ?key, %domain, "record discarded before DNS check finished");
        return;
    };
    if record.apply_dns(&verification) {
        ctx.reclassify_locked(&mut ledger, tab);
    }
}

#[instrument(level = "debug", skip_all, fields(tab = event.tab_id, request = %event.request_id))]
pub async fn on_completed<R: Resolve>(ctx: &Arc<Context<R>>, event: RequestCompleted) {
    if event.tab_id == NO_TAB {
        return;
    }

    let mut ledger = ctx.ledger.lock().await;
    // unknown when the request started before we were watching the tab
    let Some(record) = ledger.find_by_id_mut(event.tab_id, &event.request_id) else {
        trace!("completion of unknown request");
        return;
    };
    if !record.complete(event.status_code, Some(event_time(event.time_stamp))) {
        debug!(status = %record.status, "request already finished");
        return;
    }
    ctx.reclassify_locked(&mut ledger, event.tab_id);
}

#[instrument(level = "debug", skip_all, fields(tab = event.tab_id, request = %event.request_id))]
pub async fn on_error_occurred<R: Resolve>(ctx: &Arc<Context<R>>, event: RequestFailed) {
    if event.tab_id == NO_TAB {
        return;
    }
    if event.error == CANCELLED {
        trace!("request cancelled");
        return;
    }

    let mut ledger = ctx.ledger.lock().await;
    let Some(record) = ledger.find_by_id_mut(event.tab_id, &event.request_id) else {
        trace!("failure of unknown request");
        return;
    };
    if !record.fail(event.error, Some(event_time(event.time_stamp))) {
        debug!(status = %record.status, "request already finished");
        return;
    }
    ctx.reclassify_locked(&mut ledger, event.tab_id);
}

/// The tab started loading a new page.
pub async fn on_tab_navigating<R: Resolve>(ctx: &Arc<Context<R>>, tab: TabId) {
    debug!(tab, "tab navigating, clearing requests");
    ctx.clear_data(tab).await;
}

pub async fn on_tab_closed<R: Resolve>(ctx: &Arc<Context<R>>, tab: TabId) {
    debug!(tab, "tab closed");
    ctx.ledger.lock().await.on_tab_closed(tab);
    ctx.badge().forget(tab);
    ctx.deactivate_tab(tab);
}

pub fn on_tab_activated<R: Resolve>(ctx: &Arc<Context<R>>, tab: TabId) {
    trace!(tab, "tab activated");
    ctx.set_active_tab(tab);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        badge::BadgeBoard,
        classify::ErrorCounts,
        dns::{
            cache::tests::FakeResolver,
            DnsCache,
            DnsStatus,
        },
        record::{
            RequestId,
            RequestStatus,
        },
        storage::Storage,
    };

    async fn context(resolver: FakeResolver) -> (Arc<Context<FakeResolver>>, Arc<BadgeBoard>) {
        let board = Arc::new(BadgeBoard::new());
        let ctx = Context::load(Arc::new(Storage::in_memory()), DnsCache::new(resolver), board.clone())
            .await
            .unwrap();
        (ctx, board)
    }

    fn started(tab: TabId, id: &str, url: &str) -> RequestStarted {
        RequestStarted {
            request_id: RequestId::new(id),
            tab_id: tab,
            url: url.to_string(),
            method: "GET".to_string(),
            resource_type: "script".to_string(),
            time_stamp: None,
        }
    }

    fn completed(tab: TabId, id: &str, status_code: u16) -> RequestCompleted {
        RequestCompleted {
            request_id: RequestId::new(id),
            tab_id: tab,
            status_code,
            time_stamp: None,
        }
    }

    fn failed(tab: TabId, id: &str, error: &str) -> RequestFailed {
        RequestFailed {
            request_id: RequestId::new(id),
            tab_id: tab,
            error: error.to_string(),
            time_stamp: None,
        }
    }

    #[tokio::test]
    async fn test_request_lifecycle() {
        let (ctx, board) = context(FakeResolver::with_domains(&[("good.example", "10.0.0.1")])).await;

        let check = on_before_request(&ctx, started(1, "a", "https://good.example/app.js")).await;
        check.expect("dns check started").await.unwrap();
        on_completed(&ctx, completed(1, "a", 200)).await;

        let check = on_before_request(&ctx, started(1, "b", "https://good.example/missing.js")).await;
        check.unwrap().await.unwrap();
        on_completed(&ctx, completed(1, "b", 404)).await;

        let snapshot = ctx.get_requests(1).await;
        assert_eq!(snapshot.requests.len(), 2);
        assert_eq!(snapshot.requests[0].status, RequestStatus::Completed(200));
        assert_eq!(snapshot.requests[0].dns_status, DnsStatus::Valid);
        assert_eq!(snapshot.requests[1].status_text.as_deref(), Some("Not Found"));
        assert_eq!(snapshot.error_count, 1);
        assert_eq!(snapshot.dns_error_count, 0);
        assert_eq!(board.text(1), "1");

        // one lookup for both requests of the same domain
        assert_eq!(ctx.dns().resolver().calls(), 1);
    }

    #[tokio::test]
    async fn test_requests_without_tab_are_ignored() {
        let (ctx, _) = context(FakeResolver::default()).await;
        assert!(on_before_request(&ctx, started(NO_TAB, "a", "https://x.example/")).await.is_none());
        on_completed(&ctx, completed(NO_TAB, "a", 500)).await;
        assert!(ctx.tab_ids().await.is_empty());
        assert_eq!(ctx.dns().resolver().calls(), 0);
    }

    #[tokio::test]
    async fn test_unparsable_url_skips_dns() {
        let (ctx, _) = context(FakeResolver::default()).await;
        assert!(on_before_request(&ctx, started(2, "a", "::not-a-url::")).await.is_none());
        let snapshot = ctx.get_requests(2).await;
        assert_eq!(snapshot.requests.len(), 1);
        assert_eq!(snapshot.requests[0].domain, None);
        assert_eq!(snapshot.requests[0].dns_status, DnsStatus::Checking);
        assert_eq!(ctx.dns().resolver().calls(), 0);
    }

    #[tokio::test]
    async fn test_failures_and_cancellation() {
        let (ctx, board) = context(FakeResolver::default()).await;

        // unknown domains come back NXDOMAIN from the fake resolver
        on_before_request(&ctx, started(3, "a", "https://gone.example/")).await.unwrap().await.unwrap();
        on_before_request(&ctx, started(3, "b", "https://gone.example/x")).await.unwrap().await.unwrap();
        on_error_occurred(&ctx, failed(3, "a", "NS_ERROR_UNKNOWN_HOST")).await;
        on_error_occurred(&ctx, failed(3, "b", CANCELLED)).await;

        let snapshot = ctx.get_requests(3).await;
        assert_eq!(snapshot.requests[0].status, RequestStatus::Failed("NS_ERROR_UNKNOWN_HOST".into()));
        // cancellation is not even stored
        assert_eq!(snapshot.requests[1].status, RequestStatus::Pending);
        assert_eq!(ctx.counts(3).await, ErrorCounts { http: 1, dns: 2 });
        assert_eq!(board.text(3), "3");
    }

    #[tokio::test]
    async fn test_events_for_unknown_requests_are_ignored() {
        let (ctx, _) = context(FakeResolver::default()).await;
        on_completed(&ctx, completed(4, "never-seen", 500)).await;
        on_error_occurred(&ctx, failed(4, "never-seen", "NET::TIMEOUT")).await;
        assert!(!ctx.is_tracked(4).await);
    }

    #[tokio::test]
    async fn test_status_does_not_revert() {
        let (ctx, _) = context(FakeResolver::default()).await;
        on_before_request(&ctx, started(5, "a", "data:,x")).await;
        on_completed(&ctx, completed(5, "a", 500)).await;
        on_error_occurred(&ctx, failed(5, "a", "NET::TIMEOUT")).await;
        on_completed(&ctx, completed(5, "a", 200)).await;
        assert_eq!(ctx.get_requests(5).await.requests[0].status, RequestStatus::Completed(500));
    }

    #[tokio::test]
    async fn test_navigation_clears_tab_and_badge() {
        let (ctx, board) = context(FakeResolver::default()).await;
        on_before_request(&ctx, started(6, "a", "https://gone.example/")).await.unwrap().await.unwrap();
        on_completed(&ctx, completed(6, "a", 503)).await;
        assert_eq!(board.text(6), "2");

        on_tab_navigating(&ctx, 6).await;
        let snapshot = ctx.get_requests(6).await;
        assert!(snapshot.requests.is_empty());
        assert_eq!((snapshot.error_count, snapshot.dns_error_count), (0, 0));
        assert!(ctx.is_tracked(6).await);
        assert_eq!(board.text(6), "");
    }

    #[tokio::test]
    async fn test_closed_tab_is_forgotten() {
        let (ctx, board) = context(FakeResolver::default()).await;
        on_tab_activated(&ctx, 7);
        on_before_request(&ctx, started(7, "a", "https://gone.example/")).await.unwrap().await.unwrap();
        assert_eq!(board.text(7), "1");

        on_tab_closed(&ctx, 7).await;
        assert!(!ctx.is_tracked(7).await);
        assert!(ctx.get_requests(7).await.requests.is_empty());
        assert_eq!(ctx.counts(7).await, ErrorCounts::default());
        assert_eq!(board.get(7), None);
        assert_eq!(ctx.active_tab(), None);
    }

    #[tokio::test]
    async fn test_late_dns_result_is_dropped_after_navigation() {
        let (ctx, board) = context(FakeResolver::default()).await;

        // single threaded test runtime, the check only runs once we await it
        let check = on_before_request(&ctx, started(8, "a", "https://gone.example/")).await.unwrap();
        on_tab_navigating(&ctx, 8).await;
        on_before_request(&ctx, started(8, "a", "data:,reused-id")).await;
        check.await.unwrap();

        let snapshot = ctx.get_requests(8).await;
        assert_eq!(snapshot.requests.len(), 1);
        assert_eq!(snapshot.requests[0].dns_status, DnsStatus::Checking);
        assert_eq!(snapshot.dns_error_count, 0);
        assert_eq!(board.text(8), "");
    }

    #[tokio::test]
    async fn test_late_dns_result_does_not_revive_closed_tab() {
        let (ctx, board) = context(FakeResolver::default()).await;

        let check = on_before_request(&ctx, started(11, "a", "https://gone.example/")).await.unwrap();
        on_tab_closed(&ctx, 11).await;
        check.await.unwrap();

        assert!(!ctx.is_tracked(11).await);
        assert_eq!(board.get(11), None);
    }

    #[tokio::test]
    async fn test_dns_error_counts_after_completion() {
        let resolver = FakeResolver {
            broken: vec!["flaky.example".into()],
            ..Default::default()
        };
        let (ctx, _) = context(resolver).await;

        let check = on_before_request(&ctx, started(9, "a", "https://flaky.example/")).await.unwrap();
        on_completed(&ctx, completed(9, "a", 200)).await;
        check.await.unwrap();

        let snapshot = ctx.get_requests(9).await;
        assert_eq!(snapshot.requests[0].dns_status, DnsStatus::Error);
        assert_eq!(snapshot.requests[0].dns_error.as_deref(), Some("DNS API error: 502"));
        assert_eq!(ctx.counts(9).await, ErrorCounts { http: 0, dns: 1 });
    }

    #[tokio::test]
    async fn test_handle_event_dispatch() {
        let (ctx, _) = context(FakeResolver::default()).await;
        handle_event(&ctx, BrowserEvent::TabActivated { tab_id: 10 }).await;
        handle_event(&ctx, BrowserEvent::TabNavigating { tab_id: 10 }).await;
        handle_event(&ctx, BrowserEvent::BeforeRequest(started(10, "a", "data:,x"))).await;
        handle_event(&ctx, BrowserEvent::Completed(completed(10, "a", 418))).await;

        let snapshot = ctx.get_active_requests().await;
        assert_eq!(snapshot.requests.len(), 1);
        assert_eq!(snapshot.error_count, 1);

        assert!(ctx.clear_active().await);
        assert!(ctx.get_active_requests().await.requests.is_empty());

        handle_event(&ctx, BrowserEvent::TabClosed { tab_id: 10 }).await;
        assert!(!ctx.clear_active().await);
    }
}
