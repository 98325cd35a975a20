//! Keeps the template store up to date with the server.
use std::{
    sync::{Arc, Condvar, Mutex, PoisonError, TryLockError},
    time::Duration,
};

use chrono::Utc;

use crate::{
    fetcher::{FetchResponse, TemplateSource},
    metrics::MetricsReporter,
    poller::{PollerThread, PollerThreadConfig},
    template_store::{CacheEntryInfo, TemplateStore},
    Error, Result, Template,
};

/// Outcome of a successful [`SyncClient::refresh`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new template was stored.
    Updated,
    /// The server confirmed the cached template; it was kept as is.
    NotModified,
    /// Another fetch was already in flight; this call waited for it instead of fetching.
    Coalesced,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    /// `Duration::ZERO` disables background polling.
    pub polling_interval: Duration,
    pub polling_jitter: Duration,
    /// Send the stored version token with fetches.
    pub enable_cache: bool,
    pub cache_timeout: Duration,
}

/// State shared with the poller thread.
struct SyncState {
    store: TemplateStore,
    source: Box<dyn TemplateSource>,
    enable_cache: bool,
    /// At most one fetch is in flight at any time. Holds the result of the last fetch.
    fetch_lock: Mutex<Option<Result<()>>>,
    /// `None` until the first template is available (or the token is rejected).
    first_result: (Mutex<Option<Result<()>>>, Condvar),
}

impl SyncState {
    fn refresh(&self) -> Result<RefreshOutcome> {
        let mut last_result = match self.fetch_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                log::debug!(target: "togglr", "fetch already in flight, waiting for it to finish");
                let last_result = self.fetch_lock.lock().unwrap_or_else(PoisonError::into_inner);
                return match &*last_result {
                    Some(Err(err)) => Err(err.clone()),
                    _ => Ok(RefreshOutcome::Coalesced),
                };
            }
        };

        let etag = if self.enable_cache {
            self.store.etag_for_revalidation(Utc::now())
        } else {
            None
        };

        let outcome = match self.source.fetch(etag.as_deref()) {
            Ok(FetchResponse::NotModified) if etag.is_some() => {
                self.store.revalidate();
                Ok(RefreshOutcome::NotModified)
            }
            Ok(FetchResponse::NotModified) => {
                // We never asked for revalidation, so there is nothing to keep.
                log::warn!(target: "togglr", "received unsolicited \"not modified\" response");
                Err(Error::UnexpectedStatus(304))
            }
            Ok(FetchResponse::Modified { template, etag }) => {
                log::info!(target: "togglr",
                           version:serde = template.version,
                           environment:display = template.environment;
                           "template updated");
                self.store.set_template(Arc::new(template), etag);
                Ok(RefreshOutcome::Updated)
            }
            Err(err) => {
                log::warn!(target: "togglr", "failed to refresh template: {err}");
                Err(err)
            }
        };

        match &outcome {
            Ok(_) => self.report_first(Ok(())),
            Err(Error::Unauthorized) => self.report_first(Err(Error::Unauthorized)),
            // Transient errors: keep waiting for a later fetch.
            Err(_) => {}
        }

        *last_result = Some(outcome.as_ref().map(|_| ()).map_err(Error::clone));
        outcome
    }

    fn report_first(&self, result: Result<()>) {
        let (lock, condvar) = &self.first_result;
        let mut first = lock.lock().unwrap_or_else(PoisonError::into_inner);
        if first.is_none() || result.is_ok() {
            *first = Some(result);
            condvar.notify_all();
        }
    }
}

/// Fetches templates, caches them with their version token and keeps them fresh in the
/// background.
pub struct SyncClient {
    state: Arc<SyncState>,
    options: SyncOptions,
    poller: Mutex<Option<PollerThread>>,
    metrics: Option<MetricsReporter>,
}

impl SyncClient {
    /// Create a client. Nothing is fetched until [`SyncClient::initialize`] or
    /// [`SyncClient::refresh`] is called.
    pub fn new(source: impl TemplateSource + 'static, options: SyncOptions) -> SyncClient {
        SyncClient::with_metrics(Box::new(source), options, None)
    }

    pub(crate) fn with_metrics(
        source: Box<dyn TemplateSource>,
        options: SyncOptions,
        metrics: Option<MetricsReporter>,
    ) -> SyncClient {
        SyncClient {
            state: Arc::new(SyncState {
                store: TemplateStore::new(options.cache_timeout),
                source,
                enable_cache: options.enable_cache,
                fetch_lock: Mutex::new(None),
                first_result: (Mutex::new(None), Condvar::new()),
            }),
            options,
            poller: Mutex::new(None),
            metrics,
        }
    }

    /// Fetch the template once and start background polling.
    ///
    /// Polling is started even if the first fetch fails; the error is returned so the caller can
    /// decide whether to wait. Calling this again only refreshes.
    pub fn initialize(&self) -> Result<()> {
        let result = self.refresh().map(|_| ());

        let mut poller = self.poller.lock().unwrap_or_else(PoisonError::into_inner);
        if poller.is_none() && !self.options.polling_interval.is_zero() {
            let state = Arc::clone(&self.state);
            *poller = Some(PollerThread::start(
                "togglr-poller",
                PollerThreadConfig {
                    interval: self.options.polling_interval,
                    jitter: self.options.polling_jitter,
                },
                move || {
                    // Errors are logged by `refresh`; polling continues regardless.
                    let _ = state.refresh();
                },
            )?);
            log::debug!(target: "togglr",
                        interval_ms = self.options.polling_interval.as_millis() as u64;
                        "started template polling");
        }

        result
    }

    /// Fetch the template now. Sends the stored version token when caching is enabled and the
    /// entry has not expired.
    ///
    /// If a fetch is already in flight, waits for it without issuing another request and returns
    /// [`RefreshOutcome::Coalesced`], or that fetch's error if it failed. On error the previously
    /// stored template is kept.
    pub fn refresh(&self) -> Result<RefreshOutcome> {
        self.state.refresh()
    }

    /// Currently active template snapshot.
    pub fn get_template(&self) -> Option<Arc<Template>> {
        self.state.store.get_template()
    }

    /// Store a template obtained out of band, e.g. a bootstrap file. It has no version token, so
    /// the next fetch is unconditional.
    pub fn load_template(&self, template: Template) {
        self.state.store.set_template(Arc::new(template), None);
        self.state.report_first(Ok(()));
    }

    /// Metadata of the cached entry.
    pub fn cache_entry_info(&self) -> Option<CacheEntryInfo> {
        self.state.store.info()
    }

    /// Block until a template is available, the server rejects the token, or `timeout` elapses.
    pub fn wait_for_template(&self, timeout: Duration) -> Result<()> {
        let (lock, condvar) = &self.state.first_result;
        let guard = lock.lock().map_err(|_| Error::PollerThreadPanicked)?;
        let (guard, _) = condvar
            .wait_timeout_while(guard, timeout, |first| first.is_none())
            .map_err(|_| Error::PollerThreadPanicked)?;
        guard.clone().unwrap_or(Err(Error::TemplateMissing))
    }

    /// Stop background polling, flush pending metrics and drop the cached template.
    pub fn destroy(&self) -> Result<()> {
        let poller = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let poller_result = match poller {
            Some(poller) => poller.shutdown(),
            None => Ok(()),
        };

        let metrics_result = match &self.metrics {
            Some(metrics) => metrics.shutdown(),
            None => Ok(()),
        };

        self.state.store.clear();
        log::debug!(target: "togglr", "sync client destroyed");

        poller_result.and(metrics_result)
    }

    pub(crate) fn metrics(&self) -> Option<&MetricsReporter> {
        self.metrics.as_ref()
    }
}
