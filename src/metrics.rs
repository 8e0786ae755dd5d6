//! Agent Metrics
//!
//! Prometheus counters for the device-handling pipeline. Components record
//! through the free functions below; until [`install`] is called they are
//! no-ops, which keeps tests free of global registry state.

use crate::error::Result;
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};
use std::sync::OnceLock;

static METRICS: OnceLock<AgentMetrics> = OnceLock::new();

/// Counters exported by the agent
#[derive(Debug, Clone)]
pub struct AgentMetrics {
    /// Decoded block-device uevents by action
    pub uevents: IntCounterVec,
    /// Identity matcher decisions by outcome
    pub match_outcomes: IntCounterVec,
    /// Conflicting writes seen by the retry loop
    pub store_conflicts: IntCounter,
    /// Drive anomalies flagged for operator attention, by reason
    pub drive_anomalies: IntCounterVec,
}

impl AgentMetrics {
    /// Create the counters and register them with `registry`
    pub fn new(registry: &Registry) -> Result<Self> {
        let metrics = Self {
            uevents: IntCounterVec::new(
                Opts::new("das_uevents_total", "Block device uevents decoded"),
                &["action"],
            )?,
            match_outcomes: IntCounterVec::new(
                Opts::new("das_match_outcomes_total", "Drive identity match decisions"),
                &["outcome"],
            )?,
            store_conflicts: IntCounter::new(
                "das_store_conflicts_total",
                "Optimistic concurrency conflicts on drive/volume writes",
            )?,
            drive_anomalies: IntCounterVec::new(
                Opts::new("das_drive_anomalies_total", "Drive anomalies flagged"),
                &["reason"],
            )?,
        };

        registry.register(Box::new(metrics.uevents.clone()))?;
        registry.register(Box::new(metrics.match_outcomes.clone()))?;
        registry.register(Box::new(metrics.store_conflicts.clone()))?;
        registry.register(Box::new(metrics.drive_anomalies.clone()))?;

        Ok(metrics)
    }
}

/// Register the agent counters with `registry` and enable recording
///
/// Only the first call takes effect.
pub fn install(registry: &Registry) -> Result<()> {
    if METRICS.get().is_some() {
        return Ok(());
    }
    let metrics = AgentMetrics::new(registry)?;
    let _ = METRICS.set(metrics);
    Ok(())
}

pub fn record_uevent(action: &str) {
    if let Some(m) = METRICS.get() {
        m.uevents.with_label_values(&[action]).inc();
    }
}

pub fn record_match(outcome: &str) {
    if let Some(m) = METRICS.get() {
        m.match_outcomes.with_label_values(&[outcome]).inc();
    }
}

pub fn record_conflict() {
    if let Some(m) = METRICS.get() {
        m.store_conflicts.inc();
    }
}

pub fn record_anomaly(reason: &str) {
    if let Some(m) = METRICS.get() {
        m.drive_anomalies.with_label_values(&[reason]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register() {
        let registry = Registry::new();
        let metrics = AgentMetrics::new(&registry).unwrap();
        metrics.uevents.with_label_values(&["add"]).inc();
        metrics.store_conflicts.inc();

        let families = registry.gather();
        let names: Vec<&str> = families.iter().map(|f| f.get_name()).collect();
        assert!(names.contains(&"das_uevents_total"));
        assert!(names.contains(&"das_store_conflicts_total"));
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        AgentMetrics::new(&registry).unwrap();
        assert!(AgentMetrics::new(&registry).is_err());
    }
}
