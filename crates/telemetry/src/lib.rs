#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Flux Telemetry
//!
//! Metrics and observability for the FluxForge control plane.
//!
//! This crate provides:
//! - [`MetricsRegistry`] -- process-local counters, gauges, and histograms
//!   (plain and labeled) with Prometheus text exposition
//! - [`EventBus`] -- broadcast-based distribution of [`ControlEvent`]s
//! - [`EventSink`] trait -- pluggable event publisher backend
//!
//! Events are **projections**, not the source of truth; dropping them is
//! acceptable. The registry is injected through constructors -- there are
//! no global singletons, and tests build their own root.
//!
//! The metric family names in [`names`] are part of the external contract:
//! dashboards and alert rules depend on them.

pub mod event;
pub mod metrics;
pub mod names;

pub use event::{BroadcastSink, ControlEvent, EventBus, EventSink, EventSubscriber};
pub use metrics::{Counter, CounterVec, Gauge, GaugeVec, Histogram, MetricsRegistry};
