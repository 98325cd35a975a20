//! A thread-safe single-slot holder for the currently active template. Readers get a snapshot
//! with one atomic load; writers replace the whole entry with one atomic store.
use std::{sync::Arc, time::Duration};

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};

use crate::Template;

/// Cached template plus the metadata needed for conditional fetches. Never handed out of the
/// store; see [`CacheEntryInfo`] for an owned view.
#[derive(Debug)]
struct CacheEntry {
    template: Arc<Template>,
    etag: Option<String>,
    timestamp: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// Owned copy of the cache entry metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntryInfo {
    /// Version token returned by the server.
    pub etag: Option<String>,
    /// Template version.
    pub version: Option<String>,
    /// When the entry was stored or last revalidated.
    pub timestamp: DateTime<Utc>,
    /// After this moment the next fetch is unconditional.
    pub expires_at: DateTime<Utc>,
}

/// `TemplateStore` provides a thread-safe (`Sync`) storage for the active template.
///
/// `Template` itself is always immutable and can only be replaced completely. A reader holding an
/// `Arc<Template>` keeps a valid snapshot regardless of later writes.
pub struct TemplateStore {
    entry: ArcSwapOption<CacheEntry>,
    cache_timeout: Duration,
}

impl TemplateStore {
    /// Create an empty store. Entries expire `cache_timeout` after they were stored or
    /// revalidated.
    pub fn new(cache_timeout: Duration) -> Self {
        TemplateStore {
            entry: ArcSwapOption::empty(),
            cache_timeout,
        }
    }

    /// Get the currently active template. Returns `None` if no template has been stored yet.
    pub fn get_template(&self) -> Option<Arc<Template>> {
        self.entry
            .load_full()
            .map(|entry| Arc::clone(&entry.template))
    }

    /// Replace the active template.
    pub fn set_template(&self, template: Arc<Template>, etag: Option<String>) {
        let now = Utc::now();
        let entry = CacheEntry {
            template,
            etag,
            timestamp: now,
            expires_at: self.expiry(now),
        };
        self.entry.store(Some(Arc::new(entry)));
    }

    /// Mark the current entry as revalidated (server answered "not modified"). The template
    /// reference is kept as is.
    pub(crate) fn revalidate(&self) {
        let now = Utc::now();
        self.entry.rcu(|current| {
            current.as_ref().map(|entry| {
                Arc::new(CacheEntry {
                    template: Arc::clone(&entry.template),
                    etag: entry.etag.clone(),
                    timestamp: now,
                    expires_at: self.expiry(now),
                })
            })
        });
    }

    /// Version token to send with a conditional fetch. `None` when the store is empty or the
    /// entry has expired.
    pub(crate) fn etag_for_revalidation(&self, now: DateTime<Utc>) -> Option<String> {
        let entry = self.entry.load_full()?;
        if now > entry.expires_at {
            return None;
        }
        entry.etag.clone()
    }

    /// Metadata of the current entry.
    pub fn info(&self) -> Option<CacheEntryInfo> {
        self.entry.load_full().map(|entry| CacheEntryInfo {
            etag: entry.etag.clone(),
            version: entry.template.version.clone(),
            timestamp: entry.timestamp,
            expires_at: entry.expires_at,
        })
    }

    /// Drop the cached entry.
    pub fn clear(&self) {
        self.entry.store(None);
    }

    fn expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.cache_timeout)
            .ok()
            .and_then(|timeout| now.checked_add_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use chrono::Utc;

    use super::TemplateStore;
    use crate::Template;

    fn template(version: &str) -> Arc<Template> {
        Arc::new(Template::new(
            Some(version.to_owned()),
            "test",
            vec![],
            vec![],
        ))
    }

    #[test]
    fn can_set_template_from_another_thread() {
        let store = Arc::new(TemplateStore::new(Duration::from_secs(60)));

        assert!(store.get_template().is_none());

        {
            let store = store.clone();
            let _ = std::thread::spawn(move || {
                store.set_template(template("1"), Some("\"etag-1\"".to_owned()));
            })
            .join();
        }

        assert!(store.get_template().is_some());
    }

    #[test]
    fn readers_keep_their_snapshot() {
        let store = TemplateStore::new(Duration::from_secs(60));
        store.set_template(template("1"), None);

        let snapshot = store.get_template().unwrap();
        store.set_template(template("2"), None);

        assert_eq!(snapshot.version.as_deref(), Some("1"));
        assert_eq!(store.get_template().unwrap().version.as_deref(), Some("2"));
    }

    #[test]
    fn revalidate_keeps_template_identity() {
        let store = TemplateStore::new(Duration::from_secs(60));
        store.set_template(template("1"), Some("e1".to_owned()));
        let before = store.get_template().unwrap();
        let before_info = store.info().unwrap();

        store.revalidate();

        assert!(Arc::ptr_eq(&before, &store.get_template().unwrap()));
        let after_info = store.info().unwrap();
        assert_eq!(after_info.etag.as_deref(), Some("e1"));
        assert!(after_info.timestamp >= before_info.timestamp);
    }

    #[test]
    fn expired_entry_is_not_revalidated() {
        let store = TemplateStore::new(Duration::ZERO);
        store.set_template(template("1"), Some("e1".to_owned()));

        let later = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(store.etag_for_revalidation(later), None);
        // Still served while stale.
        assert!(store.get_template().is_some());
    }

    #[test]
    fn fresh_entry_offers_etag() {
        let store = TemplateStore::new(Duration::from_secs(60));
        assert_eq!(store.etag_for_revalidation(Utc::now()), None);

        store.set_template(template("1"), Some("e1".to_owned()));
        assert_eq!(
            store.etag_for_revalidation(Utc::now()).as_deref(),
            Some("e1")
        );

        store.clear();
        assert!(store.get_template().is_none());
    }
}
