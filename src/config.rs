use std::time::Duration;

use crate::{Client, Result, Template};

/// Configuration for [`Client`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub(crate) endpoint_url: String,
    pub(crate) api_token: String,
    pub(crate) environment: String,
    pub(crate) polling_interval: Duration,
    pub(crate) polling_jitter: Duration,
    pub(crate) request_timeout: Duration,
    pub(crate) retry_attempts: u32,
    pub(crate) enable_cache: bool,
    pub(crate) cache_timeout: Duration,
    pub(crate) metrics_endpoint: Option<String>,
    pub(crate) metrics_flush_interval: Duration,
    pub(crate) metrics_queue_capacity: usize,
    pub(crate) metrics_flush_threshold: usize,
    pub(crate) metrics_batch_size: usize,
    pub(crate) bootstrap: Option<Template>,
}

impl ClientConfig {
    /// Default delay between background template fetches.
    pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(30);
    /// Default per-request timeout.
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
    /// Default lifetime of a cached version token.
    pub const DEFAULT_CACHE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
    /// Default delay between metrics flushes.
    pub const DEFAULT_METRICS_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

    /// Create a configuration with default settings. Templates are fetched from
    /// `<endpoint_url>/<environment>`.
    ///
    /// ```
    /// # use togglr::ClientConfig;
    /// ClientConfig::new("https://flags.example.com/api/templates", "api-token", "production");
    /// ```
    pub fn new(
        endpoint_url: impl Into<String>,
        api_token: impl Into<String>,
        environment: impl Into<String>,
    ) -> Self {
        ClientConfig {
            endpoint_url: endpoint_url.into(),
            api_token: api_token.into(),
            environment: environment.into(),
            polling_interval: Self::DEFAULT_POLLING_INTERVAL,
            polling_jitter: Duration::ZERO,
            request_timeout: Self::DEFAULT_REQUEST_TIMEOUT,
            retry_attempts: 0,
            enable_cache: true,
            cache_timeout: Self::DEFAULT_CACHE_TIMEOUT,
            metrics_endpoint: None,
            metrics_flush_interval: Self::DEFAULT_METRICS_FLUSH_INTERVAL,
            metrics_queue_capacity: 10_000,
            metrics_flush_threshold: 500,
            metrics_batch_size: 1_000,
            bootstrap: None,
        }
    }

    /// Delay between background fetches. `Duration::ZERO` disables polling; call
    /// [`Client::refresh`] manually instead.
    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    /// Maximum random amount subtracted from each polling interval.
    pub fn polling_jitter(mut self, jitter: Duration) -> Self {
        self.polling_jitter = jitter;
        self
    }

    #[allow(missing_docs)]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Number of immediate retries after a network error within one fetch.
    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Whether to send the stored version token so the server can answer "not modified".
    pub fn enable_cache(mut self, enable: bool) -> Self {
        self.enable_cache = enable;
        self
    }

    /// How long a stored version token stays usable. An expired template is still served.
    pub fn cache_timeout(mut self, timeout: Duration) -> Self {
        self.cache_timeout = timeout;
        self
    }

    /// Enable evaluation metrics, delivered to `endpoint`.
    ///
    /// ```
    /// # use togglr::ClientConfig;
    /// let config = ClientConfig::new("https://flags.example.com/api/templates", "api-token", "production")
    ///     .metrics_endpoint("https://flags.example.com/api/metrics");
    /// ```
    pub fn metrics_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.metrics_endpoint = Some(endpoint.into());
        self
    }

    /// Delay between timer-driven metrics flushes.
    pub fn metrics_flush_interval(mut self, interval: Duration) -> Self {
        self.metrics_flush_interval = interval;
        self
    }

    /// Maximum number of queued metrics events.
    pub fn metrics_queue_capacity(mut self, capacity: usize) -> Self {
        self.metrics_queue_capacity = capacity;
        self
    }

    /// Queue length that triggers an early flush.
    pub fn metrics_flush_threshold(mut self, threshold: usize) -> Self {
        self.metrics_flush_threshold = threshold;
        self
    }

    /// Maximum number of events per metrics request.
    pub fn metrics_batch_size(mut self, batch_size: usize) -> Self {
        self.metrics_batch_size = batch_size;
        self
    }

    /// Template served until the first successful fetch.
    pub fn bootstrap(mut self, template: Template) -> Self {
        self.bootstrap = Some(template);
        self
    }

    /// Create a new [`Client`] using the specified configuration.
    ///
    /// ```
    /// # use togglr::{Client, ClientConfig};
    /// let client: Client = ClientConfig::new("https://flags.example.com/api/templates", "api-token", "production")
    ///     .to_client()
    ///     .unwrap();
    /// ```
    pub fn to_client(self) -> Result<Client> {
        Client::new(self)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::ClientConfig;

    #[test]
    fn defaults() {
        let config = ClientConfig::new("https://example.com", "token", "production");
        assert_eq!(config.polling_interval, Duration::from_secs(30));
        assert_eq!(config.polling_jitter, Duration::ZERO);
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.retry_attempts, 0);
        assert!(config.enable_cache);
        assert_eq!(config.cache_timeout, Duration::from_secs(300));
        assert!(config.metrics_endpoint.is_none());
        assert!(config.bootstrap.is_none());
    }

    #[test]
    fn setters_chain() {
        let config = ClientConfig::new("https://example.com", "token", "staging")
            .polling_interval(Duration::ZERO)
            .enable_cache(false)
            .retry_attempts(2)
            .metrics_endpoint("https://example.com/metrics")
            .metrics_batch_size(10);
        assert!(config.polling_interval.is_zero());
        assert!(!config.enable_cache);
        assert_eq!(config.retry_attempts, 2);
        assert_eq!(
            config.metrics_endpoint.as_deref(),
            Some("https://example.com/metrics")
        );
        assert_eq!(config.metrics_batch_size, 10);
    }
}
