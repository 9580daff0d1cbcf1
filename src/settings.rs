use crate::{
    dns::DnsProvider,
    storage::{
        Storage,
        StorageChange,
        StorageError,
    },
};
use arc_swap::ArcSwap;
use serde_json::Value;
use std::{
    collections::BTreeSet,
    sync::Arc,
};

pub const ACCEPTABLE_CODES_KEY: &str = "acceptableCodes";
pub const DNS_PROVIDER_KEY: &str = "dnsProvider";

pub const DEFAULT_ACCEPTABLE_CODES: [u16; 3] = [200, 204, 304];

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("at least one acceptable status code is required")]
    NoCodes,

    #[error("invalid HTTP status code: {0}")]
    InvalidCode(u16),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Checks a user supplied code list. Codes must be real HTTP status codes (100-599).
pub fn validate_codes(codes: impl IntoIterator<Item = u16>) -> Result<BTreeSet<u16>, SettingsError> {
    let codes = codes.into_iter().collect::<BTreeSet<_>>();
    if codes.is_empty() {
        return Err(SettingsError::NoCodes);
    }
    if let Some(code) = codes.iter().find(|code| !(100..600).contains(*code)) {
        return Err(SettingsError::InvalidCode(*code));
    }
    Ok(codes)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub acceptable_codes: BTreeSet<u16>,
    pub dns_provider: DnsProvider,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            acceptable_codes: BTreeSet::from(DEFAULT_ACCEPTABLE_CODES),
            dns_provider: DnsProvider::default(),
        }
    }
}

/// A settings change that took effect in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingChange {
    AcceptableCodes(BTreeSet<u16>),
    DnsProvider(DnsProvider),
}

/// Process wide settings. Readers get a consistent snapshot without locking.
pub struct ConfigStore {
    current: ArcSwap<Settings>,
}

impl ConfigStore {
    pub fn new(settings: Settings) -> Self {
        Self {
            current: ArcSwap::from_pointee(settings),
        }
    }

    /// Read settings from `storage`. Missing acceptable codes are initialized with the defaults.
    pub async fn load(storage: &Storage) -> Result<Self, SettingsError> {
        let mut settings = Settings::default();

        match storage.get(ACCEPTABLE_CODES_KEY).await {
            Some(value) => {
                if let Some(codes) = parse_codes(&value) {
                    settings.acceptable_codes = codes;
                }
            }
            None => {
                debug!("no acceptable codes stored, saving defaults");
                storage.set(ACCEPTABLE_CODES_KEY, DEFAULT_ACCEPTABLE_CODES).await?;
            }
        }

        if let Some(provider) = storage.get(DNS_PROVIDER_KEY).await.as_ref().and_then(parse_provider) {
            settings.dns_provider = provider;
        }

        info!(
            acceptable_codes = ?settings.acceptable_codes,
            dns_provider = %settings.dns_provider,
            "settings loaded"
        );

        Ok(Self::new(settings))
    }

    pub fn current(&self) -> Arc<Settings> {
        self.current.load_full()
    }

    pub fn acceptable_codes(&self) -> BTreeSet<u16> {
        self.current.load().acceptable_codes.clone()
    }

    pub fn dns_provider(&self) -> DnsProvider {
        self.current.load().dns_provider.clone()
    }

    /// Returns whether anything changed.
    pub fn set_acceptable_codes(&self, codes: BTreeSet<u16>) -> bool {
        self.update(|settings| settings.acceptable_codes = codes.clone())
    }

    pub fn set_dns_provider(&self, provider: DnsProvider) -> bool {
        self.update(|settings| settings.dns_provider = provider.clone())
    }

    /// Apply a storage notification. Unrelated keys, unparsable values and values equal to the current ones yield
    /// `None`. A removed key falls back to its default.
    pub fn apply(&self, change: &StorageChange) -> Option<SettingChange> {
        match change.key.as_str() {
            ACCEPTABLE_CODES_KEY => {
                let codes = match &change.new_value {
                    Some(value) => parse_codes(value)?,
                    None => BTreeSet::from(DEFAULT_ACCEPTABLE_CODES),
                };
                self.set_acceptable_codes(codes.clone())
                    .then_some(SettingChange::AcceptableCodes(codes))
            }
            DNS_PROVIDER_KEY => {
                let provider = match &change.new_value {
                    Some(value) => parse_provider(value)?,
                    None => DnsProvider::default(),
                };
                self.set_dns_provider(provider.clone())
                    .then_some(SettingChange::DnsProvider(provider))
            }
            _ => None,
        }
    }

    /// `f` may run more than once when writers race.
    fn update(&self, f: impl Fn(&mut Settings)) -> bool {
        let mut changed = false;
        self.current.rcu(|current| {
            let mut next = Settings::clone(current);
            f(&mut next);
            changed = next != **current;
            if changed {
                Arc::new(next)
            } else {
                Arc::clone(current)
            }
        });
        changed
    }
}

fn parse_codes(value: &Value) -> Option<BTreeSet<u16>> {
    let codes = match serde_json::from_value::<Vec<u16>>(value.clone()) {
        Ok(codes) => codes,
        Err(err) => {
            warn!(?value, "ignoring stored acceptable codes: {err}");
            return None;
        }
    };
    match validate_codes(codes) {
        Ok(codes) => Some(codes),
        Err(err) => {
            warn!(?value, "ignoring stored acceptable codes: {err}");
            None
        }
    }
}

fn parse_provider(value: &Value) -> Option<DnsProvider> {
    let Some(id) = value.as_str() else {
        warn!(?value, "ignoring stored dns provider, expected a string");
        return None;
    };
    match id.parse() {
        Ok(provider) => Some(provider),
        Err(err) => {
            warn!(?value, "ignoring stored dns provider: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_codes() {
        assert_eq!(validate_codes([404, 200, 200]).unwrap(), BTreeSet::from([200, 404]));
        assert!(matches!(validate_codes(Vec::<u16>::new()), Err(SettingsError::NoCodes)));
        assert!(matches!(validate_codes([200, 99]), Err(SettingsError::InvalidCode(99))));
        assert!(matches!(validate_codes([600]), Err(SettingsError::InvalidCode(600))));
    }

    #[tokio::test]
    async fn test_load_persists_defaults() {
        let storage = Storage::in_memory();
        let config = ConfigStore::load(&storage).await.unwrap();
        assert_eq!(*config.current(), Settings::default());
        assert_eq!(storage.get(ACCEPTABLE_CODES_KEY).await, Some(json!([200, 204, 304])));
        // the provider default is not written
        assert_eq!(storage.get(DNS_PROVIDER_KEY).await, None);
    }

    #[tokio::test]
    async fn test_load_stored_values() {
        let storage = Storage::in_memory();
        storage.set(ACCEPTABLE_CODES_KEY, [200, 301]).await.unwrap();
        storage.set(DNS_PROVIDER_KEY, "cloudflare").await.unwrap();

        let config = ConfigStore::load(&storage).await.unwrap();
        assert_eq!(config.acceptable_codes(), BTreeSet::from([200, 301]));
        assert_eq!(config.dns_provider(), DnsProvider::Cloudflare);
    }

    #[tokio::test]
    async fn test_load_ignores_garbage() {
        let storage = Storage::in_memory();
        storage.set(ACCEPTABLE_CODES_KEY, "all of them").await.unwrap();
        storage.set(DNS_PROVIDER_KEY, 42).await.unwrap();

        let config = ConfigStore::load(&storage).await.unwrap();
        assert_eq!(*config.current(), Settings::default());
        // stored value is left for the user to fix
        assert_eq!(storage.get(ACCEPTABLE_CODES_KEY).await, Some(json!("all of them")));
    }

    #[test]
    fn test_apply_changes() {
        let config = ConfigStore::new(Settings::default());
        let change = |key: &str, new_value: Option<Value>| StorageChange {
            key: key.to_string(),
            old_value: None,
            new_value,
        };

        assert_eq!(
            config.apply(&change(ACCEPTABLE_CODES_KEY, Some(json!([200])))),
            Some(SettingChange::AcceptableCodes(BTreeSet::from([200])))
        );
        // same value again is not a change
        assert_eq!(config.apply(&change(ACCEPTABLE_CODES_KEY, Some(json!([200])))), None);
        assert_eq!(config.apply(&change(ACCEPTABLE_CODES_KEY, Some(json!([])))), None);
        assert_eq!(config.apply(&change("theme", Some(json!("dark")))), None);

        assert_eq!(
            config.apply(&change(ACCEPTABLE_CODES_KEY, None)),
            Some(SettingChange::AcceptableCodes(BTreeSet::from(DEFAULT_ACCEPTABLE_CODES)))
        );
        assert_eq!(
            config.apply(&change(DNS_PROVIDER_KEY, Some(json!("cloudflare")))),
            Some(SettingChange::DnsProvider(DnsProvider::Cloudflare))
        );
        assert_eq!(config.dns_provider(), DnsProvider::Cloudflare);
    }

    #[test]
    fn test_concurrent_writers_keep_both_settings() {
        let config = Arc::new(ConfigStore::new(Settings::default()));

        let codes_writer = {
            let config = config.clone();
            std::thread::spawn(move || {
                for i in 0..2000u16 {
                    config.set_acceptable_codes(BTreeSet::from([200, 300 + i % 100]));
                }
            })
        };
        let provider_writer = {
            let config = config.clone();
            std::thread::spawn(move || {
                for i in 0..2000 {
                    let provider = if i % 2 == 0 {
                        DnsProvider::Google
                    } else {
                        DnsProvider::Cloudflare
                    };
                    config.set_dns_provider(provider);
                }
            })
        };
        codes_writer.join().unwrap();
        provider_writer.join().unwrap();

        assert_eq!(config.acceptable_codes(), BTreeSet::from([200, 399]));
        assert_eq!(config.dns_provider(), DnsProvider::Cloudflare);
    }
}
