//! Task Engine Metrics
//!
//! Prometheus collectors registered on an engine-owned registry, exposed by
//! the metrics server in `main.rs`.

use crate::error::{Error, Result};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

/// Engine metrics
pub struct EngineMetrics {
    registry: Registry,
    /// Tasks created, by workflow
    pub tasks_created: IntCounterVec,
    /// Tasks finished, by workflow and status
    pub tasks_finished: IntCounterVec,
    /// Stage dispatches, by workflow and stage
    pub stage_dispatches: IntCounterVec,
    /// Stage handler latency, by workflow and stage
    pub stage_duration: HistogramVec,
    /// Tasks not yet finished
    pub active_tasks: IntGauge,
}

fn metrics_err(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics registration failed: {}", e))
}

impl EngineMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("cloud_control_plane".into()), None)
            .map_err(metrics_err)?;

        let tasks_created = IntCounterVec::new(
            Opts::new("tasks_created_total", "Tasks created"),
            &["workflow"],
        )
        .map_err(metrics_err)?;
        let tasks_finished = IntCounterVec::new(
            Opts::new("tasks_finished_total", "Tasks that reached a terminal status"),
            &["workflow", "status"],
        )
        .map_err(metrics_err)?;
        let stage_dispatches = IntCounterVec::new(
            Opts::new("stage_dispatches_total", "Stage handler invocations"),
            &["workflow", "stage"],
        )
        .map_err(metrics_err)?;
        let stage_duration = HistogramVec::new(
            HistogramOpts::new("stage_duration_seconds", "Stage handler duration"),
            &["workflow", "stage"],
        )
        .map_err(metrics_err)?;
        let active_tasks =
            IntGauge::new("active_tasks", "Tasks not yet finished").map_err(metrics_err)?;

        registry
            .register(Box::new(tasks_created.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(tasks_finished.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(stage_dispatches.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(stage_duration.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(active_tasks.clone()))
            .map_err(metrics_err)?;

        Ok(Self {
            registry,
            tasks_created,
            tasks_finished,
            stage_dispatches,
            stage_duration,
            active_tasks,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the registry in the Prometheus text format
    pub fn encode_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("metrics encoding failed: {}", e)))?;
        String::from_utf8(buffer)
            .map_err(|e| Error::Internal(format!("metrics encoding failed: {}", e)))
    }
}
