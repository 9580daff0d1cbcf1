use crate::{
    badge::{
        BadgePresenter,
        BadgeSink,
    },
    classify::{
        ErrorCounts,
        RecordFilter,
    },
    dns::{
        DnsCache,
        DnsProvider,
        Resolve,
    },
    ledger::{
        Ledger,
        TabSnapshot,
    },
    record::{
        TabId,
        NO_TAB,
    },
    settings::{
        validate_codes,
        ConfigStore,
        SettingChange,
        SettingsError,
        ACCEPTABLE_CODES_KEY,
        DNS_PROVIDER_KEY,
    },
    storage::{
        Storage,
        StorageChange,
    },
};
use std::sync::{
    atomic::{
        AtomicI64,
        Ordering,
    },
    Arc,
    Weak,
};
use tokio::{
    sync::{
        broadcast::error::RecvError,
        Mutex,
    },
    task::JoinHandle,
};

/// Holds the state shared by the event router, the DNS verification tasks and the settings listener.
pub struct Context<R> {
    pub(crate) ledger: Mutex<Ledger>,
    settings: ConfigStore,
    storage: Arc<Storage>,
    dns: DnsCache<R>,
    badge: BadgePresenter<Arc<dyn BadgeSink>>,
    /// Tab the user is looking at, [`NO_TAB`] if unknown.
    active_tab: AtomicI64,
}

impl<R: Resolve> Context<R> {
    pub fn new(storage: Arc<Storage>, settings: ConfigStore, dns: DnsCache<R>, badge: Arc<dyn BadgeSink>) -> Arc<Self> {
        Arc::new(Self {
            ledger: Mutex::new(Ledger::new()),
            settings,
            storage,
            dns,
            badge: BadgePresenter::new(badge),
            active_tab: AtomicI64::new(NO_TAB),
        })
    }

    /// Load settings from `storage` (persisting defaults where missing) and point the resolver at the configured
    /// provider.
    pub async fn load(
        storage: Arc<Storage>,
        dns: DnsCache<R>,
        badge: Arc<dyn BadgeSink>,
    ) -> Result<Arc<Self>, SettingsError> {
        let settings = ConfigStore::load(&storage).await?;
        dns.use_provider(settings.dns_provider());
        Ok(Self::new(storage, settings, dns, badge))
    }

    pub fn settings(&self) -> &ConfigStore {
        &self.settings
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn dns(&self) -> &DnsCache<R> {
        &self.dns
    }

    pub fn badge(&self) -> &BadgePresenter<Arc<dyn BadgeSink>> {
        &self.badge
    }

    pub fn active_tab(&self) -> Option<TabId> {
        match self.active_tab.load(Ordering::SeqCst) {
            NO_TAB => None,
            tab => Some(tab),
        }
    }

    pub(crate) fn set_active_tab(&self, tab: TabId) {
        self.active_tab.store(tab, Ordering::SeqCst);
    }

    /// Forget `tab` as active tab if it is the active one.
    pub(crate) fn deactivate_tab(&self, tab: TabId) {
        let _ = self
            .active_tab
            .compare_exchange(tab, NO_TAB, Ordering::SeqCst, Ordering::SeqCst);
    }

    // -=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-
    // queries & commands

    pub async fn tab_ids(&self) -> Vec<TabId> {
        self.ledger.lock().await.tab_ids()
    }

    pub async fn is_tracked(&self, tab: TabId) -> bool {
        self.ledger.lock().await.is_tracked(tab)
    }

    pub async fn counts(&self, tab: TabId) -> ErrorCounts {
        self.ledger.lock().await.counts(tab)
    }

    pub async fn get_requests(&self, tab: TabId) -> TabSnapshot {
        self.get_requests_filtered(tab, RecordFilter::All).await
    }

    pub async fn get_requests_filtered(&self, tab: TabId, filter: RecordFilter) -> TabSnapshot {
        let acceptable = self.settings.acceptable_codes();
        self.ledger.lock().await.snapshot(tab, &acceptable, filter)
    }

    /// Records of the active tab. Empty if no tab is active.
    pub async fn get_active_requests(&self) -> TabSnapshot {
        match self.active_tab() {
            Some(tab) => self.get_requests(tab).await,
            None => TabSnapshot {
                acceptable_codes: self.settings.acceptable_codes().into_iter().collect(),
                ..Default::default()
            },
        }
    }

    /// Drop the records of `tab` and reset its counts and badge.
    pub async fn clear_data(&self, tab: TabId) {
        let mut ledger = self.ledger.lock().await;
        ledger.on_tab_start(tab);
        self.reclassify_locked(&mut ledger, tab);
    }

    /// [`Self::clear_data`] for the active tab. Returns false if no tab is active.
    pub async fn clear_active(&self) -> bool {
        let Some(tab) = self.active_tab() else {
            return false;
        };
        self.clear_data(tab).await;
        true
    }

    /// Recount `tab` and refresh its badge. Tabs no longer tracked are left alone.
    pub(crate) fn reclassify_locked(&self, ledger: &mut Ledger, tab: TabId) -> ErrorCounts {
        if !ledger.is_tracked(tab) {
            return ErrorCounts::default();
        }
        let counts = ledger.reclassify(tab, &self.settings.acceptable_codes());
        self.badge.render(tab, counts);
        counts
    }

    /// Recount every tracked tab against the current settings.
    pub async fn reclassify_all(&self) {
        let mut ledger = self.ledger.lock().await;
        let tabs = ledger.tab_ids();
        debug!(tabs = tabs.len(), "reclassifying all tabs");
        for tab in tabs {
            self.reclassify_locked(&mut ledger, tab);
        }
    }

    // -=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-
    // settings

    /// Persist new acceptable codes. Every tab is recounted before this returns.
    pub async fn set_acceptable_codes(&self, codes: impl IntoIterator<Item = u16>) -> Result<(), SettingsError> {
        let codes = validate_codes(codes)?;
        self.storage.set(ACCEPTABLE_CODES_KEY, &codes).await?;
        info!(?codes, "acceptable codes changed");
        // the listener may have applied the change already, recounting twice is harmless
        self.settings.set_acceptable_codes(codes);
        self.reclassify_all().await;
        Ok(())
    }

    pub async fn set_dns_provider(&self, provider: DnsProvider) -> Result<(), SettingsError> {
        self.storage.set(DNS_PROVIDER_KEY, provider.id()).await?;
        if self.settings.set_dns_provider(provider.clone()) {
            self.dns.use_provider(provider);
        }
        Ok(())
    }

    /// React to a change of the settings storage, no matter who made it.
    pub async fn on_storage_change(&self, change: &StorageChange) {
        match self.settings.apply(change) {
            Some(SettingChange::AcceptableCodes(codes)) => {
                info!(?codes, "acceptable codes changed in storage");
                self.reclassify_all().await;
            }
            Some(SettingChange::DnsProvider(provider)) => {
                self.dns.use_provider(provider);
            }
            None => {}
        }
    }

    /// Re-read all settings from storage, e.g. after missing notifications.
    pub async fn reload_settings(&self) {
        for key in [ACCEPTABLE_CODES_KEY, DNS_PROVIDER_KEY] {
            let change = StorageChange {
                key: key.to_string(),
                old_value: None,
                new_value: self.storage.get(key).await,
            };
            self.on_storage_change(&change).await;
        }
    }

    /// Follow settings storage changes until the context is dropped.
    pub fn spawn_settings_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mut changes = self.storage.subscribe();
        let weak: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                let received = changes.recv().await;
                let Some(ctx) = weak.upgrade() else {
                    break;
                };
                match received {
                    Ok(change) => ctx.on_storage_change(&change).await,
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "settings listener lagged, reloading settings");
                        ctx.reload_settings().await;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("settings listener stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        badge::BadgeBoard,
        dns::cache::tests::FakeResolver,
        ledger::NewRequest,
        record::RequestId,
    };
    use chrono::Utc;

    #[tokio::test]
    async fn test_lagging_listener_reloads_settings() {
        let board = Arc::new(BadgeBoard::new());
        let ctx = Context::load(
            Arc::new(Storage::in_memory()),
            DnsCache::new(FakeResolver::default()),
            board.clone(),
        )
        .await
        .unwrap();

        {
            let mut ledger = ctx.ledger.lock().await;
            ledger.push(1, NewRequest {
                id: RequestId::new("1"),
                url: "https://example.com/missing".to_string(),
                method: "GET".to_string(),
                resource_type: "image".to_string(),
                started_at: Utc::now(),
            });
            ledger.find_by_id_mut(1, &RequestId::new("1")).unwrap().complete(404, None);
            ctx.reclassify_locked(&mut ledger, 1);
        }
        assert_eq!(board.text(1), "1");

        let _listener = ctx.spawn_settings_listener();

        // the listener has not run yet, the provider change falls out of the channel
        ctx.storage().set(DNS_PROVIDER_KEY, "cloudflare").await.unwrap();
        for i in 0..20u16 {
            ctx.storage().set(ACCEPTABLE_CODES_KEY, [200, 300 + i]).await.unwrap();
        }
        ctx.storage().set(ACCEPTABLE_CODES_KEY, [200, 404]).await.unwrap();

        // let the listener drain the whole backlog
        for _ in 0..100 {
            tokio::task::yield_now().await;
        }

        assert_eq!(ctx.settings().dns_provider(), DnsProvider::Cloudflare);
        assert_eq!(ctx.settings().acceptable_codes(), [200, 404].into());
        assert_eq!(ctx.counts(1).await, ErrorCounts::default());
        assert_eq!(board.text(1), "");
        assert_eq!(
            ctx.dns().resolver().providers.lock().unwrap().last(),
            Some(&DnsProvider::Cloudflare)
        );
    }

    #[tokio::test]
    async fn test_reload_settings_without_listener() {
        let storage = Arc::new(Storage::in_memory());
        let ctx = Context::load(
            storage.clone(),
            DnsCache::new(FakeResolver::default()),
            Arc::new(BadgeBoard::new()),
        )
        .await
        .unwrap();

        storage.set(ACCEPTABLE_CODES_KEY, [200]).await.unwrap();
        storage.remove(DNS_PROVIDER_KEY).await.unwrap();
        assert_eq!(ctx.settings().acceptable_codes().len(), 3);

        ctx.reload_settings().await;
        assert_eq!(ctx.settings().acceptable_codes(), [200].into());
        assert_eq!(ctx.settings().dns_provider(), DnsProvider::Google);
    }
}
