use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;

use crate::{
    eval::{self, try_evaluate},
    fetcher::{HttpTemplateFetcher, HttpTemplateFetcherConfig, TemplateSource},
    metrics::{
        HttpMetricsSink, MetricsAggregator, MetricsConfig, MetricsEvent, MetricsReporter,
        MetricsSink,
    },
    sync_client::{RefreshOutcome, SyncClient, SyncOptions},
    template_store::CacheEntryInfo,
    ClientConfig, EvaluationContext, EvaluationResult, Result, Template,
};

/// A feature flag client.
///
/// In order to create a client instance, first create [`ClientConfig`].
///
/// Evaluation runs entirely in-process against the most recently fetched template and never
/// fails: problems resolve to a fallback value with
/// [`EvaluationReason::Error`](crate::EvaluationReason::Error).
///
/// # Examples
/// ```no_run
/// # use togglr::{Client, ClientConfig, EvaluationContext};
/// let client = Client::new(ClientConfig::new(
///     "https://flags.example.com/api/templates",
///     "api-token",
///     "production",
/// ))
/// .unwrap();
/// client.initialize().unwrap();
///
/// let context = EvaluationContext::default().with_user_id("user-1");
/// if client.is_enabled("new-checkout", &context) {
///     // ...
/// }
/// client.destroy().unwrap();
/// ```
pub struct Client {
    sync: SyncClient,
}

impl Client {
    /// Create a new `Client` that talks to the server over HTTP.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let source = HttpTemplateFetcher::new(HttpTemplateFetcherConfig {
            endpoint_url: config.endpoint_url.clone(),
            api_token: config.api_token.clone(),
            environment: config.environment.clone(),
            request_timeout: config.request_timeout,
            retry_attempts: config.retry_attempts,
        })?;

        let metrics_sink = match &config.metrics_endpoint {
            Some(endpoint) => Some(Box::new(HttpMetricsSink::new(
                endpoint,
                config.api_token.clone(),
                config.request_timeout,
            )?) as Box<dyn MetricsSink>),
            None => None,
        };

        Client::with_transport(config, Box::new(source), metrics_sink)
    }

    /// Create a client with custom transports. Metrics are collected only when `metrics_sink` is
    /// provided; `metrics_endpoint` is ignored.
    pub fn with_transport(
        config: ClientConfig,
        source: Box<dyn TemplateSource>,
        metrics_sink: Option<Box<dyn MetricsSink>>,
    ) -> Result<Self> {
        let metrics = match metrics_sink {
            Some(sink) => {
                let metrics_config = MetricsConfig {
                    queue_capacity: config.metrics_queue_capacity,
                    flush_threshold: config.metrics_flush_threshold,
                    batch_size: config.metrics_batch_size,
                    flush_interval: config.metrics_flush_interval,
                };
                let aggregator =
                    MetricsAggregator::new(config.environment.clone(), sink, &metrics_config);
                Some(MetricsReporter::start(
                    aggregator,
                    metrics_config.flush_interval,
                )?)
            }
            None => None,
        };

        let sync = SyncClient::with_metrics(
            source,
            SyncOptions {
                polling_interval: config.polling_interval,
                polling_jitter: config.polling_jitter,
                enable_cache: config.enable_cache,
                cache_timeout: config.cache_timeout,
            },
            metrics,
        );

        if let Some(template) = config.bootstrap {
            log::debug!(target: "togglr", version:serde = template.version; "loading bootstrap template");
            sync.load_template(template);
        }

        Ok(Client { sync })
    }

    /// Fetch the template and start background polling. See [`SyncClient::initialize`].
    pub fn initialize(&self) -> Result<()> {
        self.sync.initialize()
    }

    /// Fetch the template now. See [`SyncClient::refresh`].
    pub fn refresh(&self) -> Result<RefreshOutcome> {
        self.sync.refresh()
    }

    /// Block until a template is available. See [`SyncClient::wait_for_template`].
    pub fn wait_for_template(&self, timeout: Duration) -> Result<()> {
        self.sync.wait_for_template(timeout)
    }

    /// Currently active template snapshot.
    pub fn get_template(&self) -> Option<Arc<Template>> {
        self.sync.get_template()
    }

    /// Metadata of the cached template.
    pub fn cache_entry_info(&self) -> Option<CacheEntryInfo> {
        self.sync.cache_entry_info()
    }

    /// Evaluate a flag for `context`.
    pub fn evaluate(&self, flag_name: &str, context: &EvaluationContext) -> EvaluationResult {
        let started = Instant::now();
        let template = self.sync.get_template();
        let result = eval::evaluate(template.as_deref(), flag_name, context);
        self.record(flag_name, result.value(), &result.variant.name, context, started);
        result
    }

    /// Evaluate a flag and return its value, or `default_value` if the flag cannot be evaluated.
    pub fn get_value(
        &self,
        flag_name: &str,
        default_value: impl Into<serde_json::Value>,
        context: &EvaluationContext,
    ) -> serde_json::Value {
        let started = Instant::now();
        let template = self.sync.get_template();
        match try_evaluate(template.as_deref(), flag_name, context) {
            Ok(result) => {
                self.record(flag_name, result.value(), &result.variant.name, context, started);
                result.variant.value
            }
            Err((err, _)) => {
                log::debug!(target: "togglr", flag_name; "returning caller default because of: {err}");
                let value = default_value.into();
                self.record(flag_name, &value, eval::FLAG_DEFAULT_DISABLED, context, started);
                value
            }
        }
    }

    /// Return `true` if the flag is enabled for `context`.
    pub fn is_enabled(&self, flag_name: &str, context: &EvaluationContext) -> bool {
        self.evaluate(flag_name, context).enabled
    }

    /// Evaluate every flag of the current template. Empty if no template is loaded.
    pub fn evaluate_all(&self, context: &EvaluationContext) -> HashMap<String, EvaluationResult> {
        let Some(template) = self.sync.get_template() else {
            log::warn!(target: "togglr", "evaluating flags before a template has been loaded");
            return HashMap::new();
        };

        template
            .flag_names()
            .map(|flag_name| {
                let started = Instant::now();
                let result = eval::evaluate(Some(template.as_ref()), flag_name, context);
                self.record(flag_name, result.value(), &result.variant.name, context, started);
                (flag_name.to_owned(), result)
            })
            .collect()
    }

    /// Values of every flag of the current template. Flags that fail to evaluate map to their
    /// type fallback.
    pub fn get_all_values(&self, context: &EvaluationContext) -> HashMap<String, serde_json::Value> {
        self.evaluate_all(context)
            .into_iter()
            .map(|(flag_name, result)| (flag_name, result.variant.value))
            .collect()
    }

    /// Deliver queued metrics now. Returns the number of delivered events.
    pub fn flush_metrics(&self) -> usize {
        self.sync
            .metrics()
            .map_or(0, |metrics| metrics.aggregator().flush())
    }

    /// Number of metrics events dropped because the queue was full.
    pub fn metrics_dropped_count(&self) -> u64 {
        self.sync
            .metrics()
            .map_or(0, |metrics| metrics.aggregator().dropped_count())
    }

    /// Stop background work, flush metrics and drop the cached template.
    pub fn destroy(&self) -> Result<()> {
        self.sync.destroy()
    }

    fn record(
        &self,
        flag_name: &str,
        value: &serde_json::Value,
        variant: &str,
        context: &EvaluationContext,
        started: Instant,
    ) {
        let Some(metrics) = self.sync.metrics() else {
            return;
        };
        metrics.record(MetricsEvent {
            config_key: flag_name.to_owned(),
            value: value.clone(),
            variant: variant.to_owned(),
            context: context.clone(),
            timestamp: Utc::now(),
            evaluation_time_ms: started.elapsed().as_secs_f64() * 1000.0,
        });
    }
}
