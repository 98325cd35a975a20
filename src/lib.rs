//! An embedded feature-targeting engine: flags are evaluated in-process against a template
//! fetched from a remote server.
//!
//! # Overview
//!
//! The library revolves around a [`Client`] that evaluates feature flags for an
//! [`EvaluationContext`] (user, session, application and free-form properties). Evaluation
//! walks the flag's strategies (segments, constraints, percentage rollout) and returns an
//! [`EvaluationResult`] carrying the served variant and the reason it was chosen.
//!
//! The client keeps its [`Template`] up to date in the background using conditional requests, so
//! an unchanged template costs a "not modified" response. Evaluations can optionally be reported
//! upstream as metrics in batches.
//!
//! Evaluation is deterministic: the same context always lands in the same rollout bucket and
//! variant, across processes and restarts.
//!
//! # Error Handling
//!
//! Evaluation never fails. A missing template, an unknown flag or a flag that could not be parsed
//! resolve to a fallback value with [`EvaluationReason::Error`].
//!
//! Synchronization and lifecycle operations return [`Result`]. In production, it is recommended
//! to log these errors and carry on: the last good template stays in use.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages under
//! the `togglr` target. Consider integrating a `log`-compatible logger implementation for better
//! visibility into synchronization.
//!
//! # Examples
//!
//! A runnable example can be found in the `demos/simple` directory of the repository.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod client;
mod config;
mod constraint;
mod context;
mod error;
mod eval;
mod fetcher;
mod metrics;
mod poller;
mod sharder;
mod strategy;
mod sync_client;
mod template;
mod template_store;
mod variant;

pub use client::Client;
pub use config::ClientConfig;
pub use context::{ContextValue, EvaluationContext};
pub use error::{Error, EvaluationError, Result};
pub use eval::{
    evaluate, get_fallback_value, EvaluationReason, EvaluationResult, ResolvedVariant,
    ENV_DEFAULT_DISABLED, ENV_DEFAULT_ENABLED, FLAG_DEFAULT_DISABLED, FLAG_DEFAULT_ENABLED,
};
pub use fetcher::{FetchResponse, HttpTemplateFetcher, HttpTemplateFetcherConfig, TemplateSource};
pub use metrics::{HttpMetricsSink, MetricsAggregator, MetricsConfig, MetricsEvent, MetricsSink};
pub use sharder::{get_bucket, get_percentage, murmur3_32};
pub use sync_client::{RefreshOutcome, SyncClient, SyncOptions};
pub use template::{
    Constraint, Flag, Operator, Segment, Stickiness, Strategy, StrategyParameters, Template,
    Timestamp, TryParse, ValueSource, ValueType, Variant,
};
pub use template_store::{CacheEntryInfo, TemplateStore};
pub use variant::select_variant;
