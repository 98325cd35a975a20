//! Evaluation metrics: a bounded in-memory queue flushed upstream in batches.
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::Serialize;

use crate::{
    poller::{PollerThread, PollerThreadConfig},
    Error, EvaluationContext, Result,
};

/// One record per evaluation call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsEvent {
    /// Name of the evaluated flag.
    pub config_key: String,
    /// Served value.
    pub value: serde_json::Value,
    /// Name of the served variant.
    pub variant: String,
    #[allow(missing_docs)]
    pub context: EvaluationContext,
    #[allow(missing_docs)]
    pub timestamp: DateTime<Utc>,
    /// Wall-clock time spent evaluating, in milliseconds.
    pub evaluation_time_ms: f64,
}

/// Destination for metrics batches.
pub trait MetricsSink: Send + Sync {
    /// Deliver one batch. An error puts the batch back into the queue.
    fn send(&self, environment: &str, batch: &[MetricsEvent]) -> Result<()>;
}

impl<F> MetricsSink for F
where
    F: Fn(&str, &[MetricsEvent]) -> Result<()> + Send + Sync,
{
    fn send(&self, environment: &str, batch: &[MetricsEvent]) -> Result<()> {
        self(environment, batch)
    }
}

#[derive(Serialize)]
struct MetricsPayload<'a> {
    environment: &'a str,
    metrics: &'a [MetricsEvent],
}

/// Sends batches as `POST {"environment": ..., "metrics": [...]}` to a collector endpoint.
pub struct HttpMetricsSink {
    client: reqwest::blocking::Client,
    url: Url,
    api_token: String,
}

impl HttpMetricsSink {
    #[allow(missing_docs)]
    pub fn new(endpoint: &str, api_token: String, request_timeout: Duration) -> Result<HttpMetricsSink> {
        let url = Url::parse(endpoint).map_err(Error::InvalidEndpointUrl)?;
        let client = reqwest::blocking::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(HttpMetricsSink {
            client,
            url,
            api_token,
        })
    }
}

impl MetricsSink for HttpMetricsSink {
    fn send(&self, environment: &str, batch: &[MetricsEvent]) -> Result<()> {
        let response = self
            .client
            .post(self.url.clone())
            .bearer_auth(&self.api_token)
            .json(&MetricsPayload {
                environment,
                metrics: batch,
            })
            .send()?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status == reqwest::StatusCode::UNAUTHORIZED {
            Err(Error::Unauthorized)
        } else {
            Err(Error::UnexpectedStatus(status.as_u16()))
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Copy)]
pub struct MetricsConfig {
    /// Maximum number of queued events. New events are dropped while the queue is full.
    pub queue_capacity: usize,
    /// Queue length that triggers an early flush.
    pub flush_threshold: usize,
    /// Maximum number of events per upstream request.
    pub batch_size: usize,
    /// Delay between timer-driven flushes. `Duration::ZERO` disables the timer.
    pub flush_interval: Duration,
}

/// Bounded metrics queue. Recording never blocks on the network.
pub struct MetricsAggregator {
    environment: String,
    sink: Box<dyn MetricsSink>,
    queue: Mutex<VecDeque<MetricsEvent>>,
    capacity: usize,
    flush_threshold: usize,
    batch_size: usize,
    dropped: AtomicU64,
    // Held for the whole duration of a flush so that batches are sent in order.
    flush_lock: Mutex<()>,
}

impl MetricsAggregator {
    #[allow(missing_docs)]
    pub fn new(
        environment: impl Into<String>,
        sink: Box<dyn MetricsSink>,
        config: &MetricsConfig,
    ) -> MetricsAggregator {
        MetricsAggregator {
            environment: environment.into(),
            sink,
            queue: Mutex::new(VecDeque::new()),
            capacity: config.queue_capacity,
            flush_threshold: config.flush_threshold.max(1),
            batch_size: config.batch_size.max(1),
            dropped: AtomicU64::new(0),
            flush_lock: Mutex::new(()),
        }
    }

    /// Enqueue an event. Returns `true` when this event makes the queue reach the flush
    /// threshold. A queue that stays above the threshold, e.g. because the sink keeps failing,
    /// does not signal again until it has drained below it.
    pub fn record(&self, event: MetricsEvent) -> bool {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        if queue.len() >= self.capacity {
            drop(queue);
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            log::debug!(target: "togglr", dropped; "metrics queue is full, dropping event");
            return false;
        }
        queue.push_back(event);
        queue.len() == self.flush_threshold
    }

    /// Send all queued events in batches. Stops at the first failed batch, which is put back at
    /// the front of the queue. Returns the number of delivered events.
    pub fn flush(&self) -> usize {
        let _guard = self.flush_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut sent = 0;
        loop {
            let batch = self.next_batch();
            if batch.is_empty() {
                break;
            }

            match self.sink.send(&self.environment, &batch) {
                Ok(()) => {
                    sent += batch.len();
                }
                Err(err) => {
                    log::warn!(target: "togglr", batch_size = batch.len(); "failed to send metrics: {err}");
                    self.requeue(batch);
                    break;
                }
            }
        }

        if sent > 0 {
            log::debug!(target: "togglr", sent; "flushed metrics");
        }
        sent
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of events dropped because the queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn next_batch(&self) -> Vec<MetricsEvent> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let len = queue.len().min(self.batch_size);
        queue.drain(..len).collect()
    }

    /// Put a failed batch back at the front, keeping its newest events when the queue filled up
    /// in the meantime.
    fn requeue(&self, batch: Vec<MetricsEvent>) {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let free = self.capacity.saturating_sub(queue.len());
        let overflow = batch.len().saturating_sub(free);
        if overflow > 0 {
            self.dropped.fetch_add(overflow as u64, Ordering::Relaxed);
        }
        for event in batch.into_iter().skip(overflow).rev() {
            queue.push_front(event);
        }
    }
}

/// Owns the aggregator and its flusher thread.
pub(crate) struct MetricsReporter {
    aggregator: Arc<MetricsAggregator>,
    flusher: Mutex<Option<PollerThread>>,
}

impl MetricsReporter {
    pub(crate) fn start(aggregator: MetricsAggregator, flush_interval: Duration) -> Result<Self> {
        let aggregator = Arc::new(aggregator);
        let flusher = {
            let aggregator = Arc::clone(&aggregator);
            PollerThread::start(
                "togglr-metrics",
                PollerThreadConfig {
                    interval: flush_interval,
                    jitter: Duration::ZERO,
                },
                move || {
                    aggregator.flush();
                },
            )?
        };

        Ok(MetricsReporter {
            aggregator,
            flusher: Mutex::new(Some(flusher)),
        })
    }

    pub(crate) fn record(&self, event: MetricsEvent) {
        if self.aggregator.record(event) {
            if let Some(flusher) = &*self.flusher.lock().unwrap_or_else(PoisonError::into_inner) {
                flusher.wake();
            }
        }
    }

    pub(crate) fn aggregator(&self) -> &MetricsAggregator {
        &self.aggregator
    }

    /// Stop the flusher thread and deliver whatever is still queued.
    pub(crate) fn shutdown(&self) -> Result<()> {
        let flusher = self
            .flusher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let result = match flusher {
            Some(flusher) => flusher.shutdown(),
            None => Ok(()),
        };
        self.aggregator.flush();
        result
    }
}
