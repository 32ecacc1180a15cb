//! Prometheus gauges published by the runner manager.
//!
//! Per-runner series are deleted explicitly: the CI provider garbage-collects
//! offline runners on its own schedule, so the manager loop diffs the runner
//! set between ticks and removes series for runners that disappeared.

use lazy_static::lazy_static;
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    static ref RUNNERPOOL_REPLICAS: GaugeVec = GaugeVec::new(
        Opts::new(
            "quarry_runnerpool_replicas",
            "Desired replicas of a runner pool"
        ),
        &["runnerpool"]
    )
    .unwrap();
    static ref RUNNER_ONLINE: GaugeVec = GaugeVec::new(
        Opts::new("quarry_runner_online", "Whether a runner is online (0/1)"),
        &["runnerpool", "runner"]
    )
    .unwrap();
    static ref RUNNER_BUSY: GaugeVec = GaugeVec::new(
        Opts::new("quarry_runner_busy", "Whether a runner is busy (0/1)"),
        &["runnerpool", "runner"]
    )
    .unwrap();
}

pub fn init() -> Result<(), prometheus::Error> {
    REGISTRY.register(Box::new(RUNNERPOOL_REPLICAS.clone()))?;
    REGISTRY.register(Box::new(RUNNER_ONLINE.clone()))?;
    REGISTRY.register(Box::new(RUNNER_BUSY.clone()))?;
    Ok(())
}

pub fn update_runner_pool(pool: &str, replicas: i32) {
    RUNNERPOOL_REPLICAS
        .with_label_values(&[pool])
        .set(f64::from(replicas));
}

pub fn delete_runner_pool(pool: &str) {
    let _ = RUNNERPOOL_REPLICAS.remove_label_values(&[pool]);
}

pub fn update_runner(pool: &str, runner: &str, online: bool, busy: bool) {
    RUNNER_ONLINE
        .with_label_values(&[pool, runner])
        .set(if online { 1.0 } else { 0.0 });
    RUNNER_BUSY
        .with_label_values(&[pool, runner])
        .set(if busy { 1.0 } else { 0.0 });
}

pub fn delete_runner(pool: &str, runner: &str) {
    let _ = RUNNER_ONLINE.remove_label_values(&[pool, runner]);
    let _ = RUNNER_BUSY.remove_label_values(&[pool, runner]);
}

/// Render the registry in the Prometheus text exposition format.
pub fn gather_text() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buf)?;
    Ok(String::from_utf8(buf).unwrap_or_default())
}

#[cfg(test)]
pub(crate) fn gauge_value(name: &str, labels: &[(&str, &str)]) -> Option<f64> {
    for family in REGISTRY.gather() {
        if family.get_name() != name {
            continue;
        }
        'metric: for m in family.get_metric() {
            for (k, v) in labels {
                if !m
                    .get_label()
                    .iter()
                    .any(|l| l.get_name() == *k && l.get_value() == *v)
                {
                    continue 'metric;
                }
            }
            return Some(m.get_gauge().get_value());
        }
    }
    None
}
