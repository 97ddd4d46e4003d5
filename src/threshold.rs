use crate::model::{MetricSample, Status, Threshold, ThresholdKey};
use std::{
    collections::HashMap,
    sync::RwLock,
};

/// Hysteresis period: a soft-status must hold continuously for this many
/// seconds before it is reported (§4.3).
const LATCH_PERIOD_SECS: f64 = 300.0;

#[derive(Debug, Clone, Copy, Default)]
struct LatchState {
    warning_since: Option<f64>,
    critical_since: Option<f64>,
    last_reported: Status,
}

/// Evaluates samples against merged config/remote thresholds and applies
/// the soft-status hysteresis latch (C3).
pub struct ThresholdEngine {
    config_thresholds: RwLock<HashMap<ThresholdKey, Threshold>>,
    remote_thresholds: RwLock<HashMap<ThresholdKey, Threshold>>,
    latches: RwLock<HashMap<(String, Option<String>), LatchState>>,
}

impl ThresholdEngine {
    pub fn new(config_thresholds: HashMap<ThresholdKey, Threshold>) -> Self {
        ThresholdEngine {
            config_thresholds: RwLock::new(config_thresholds),
            remote_thresholds: RwLock::new(HashMap::new()),
            latches: RwLock::new(HashMap::new()),
        }
    }

    /// Hard-coded bootstrap thresholds applied before the first successful
    /// reconciliation pass (§4.1), scaled where the original scales by core
    /// count.
    pub fn builtin_defaults() -> HashMap<ThresholdKey, Threshold> {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1) as f64;

        let mut map = HashMap::new();
        map.insert(
            ThresholdKey {
                measurement: "cpu_idle".to_string(),
                item: None,
            },
            Threshold {
                low_critical: Some(1.0 / cores),
                low_warning: None,
                high_warning: None,
                high_critical: None,
            },
        );
        map.insert(
            ThresholdKey {
                measurement: "disk_used_perc".to_string(),
                item: None,
            },
            Threshold {
                low_critical: None,
                low_warning: None,
                high_warning: Some(80.0),
                high_critical: Some(90.0),
            },
        );
        map.insert(
            ThresholdKey {
                measurement: "net_err_in".to_string(),
                item: None,
            },
            Threshold {
                low_critical: None,
                low_warning: None,
                high_warning: Some(0.0),
                high_critical: None,
            },
        );
        map.insert(
            ThresholdKey {
                measurement: "net_err_out".to_string(),
                item: None,
            },
            Threshold {
                low_critical: None,
                low_warning: None,
                high_warning: Some(0.0),
                high_critical: None,
            },
        );
        map.insert(
            ThresholdKey {
                measurement: "mem_used_perc".to_string(),
                item: None,
            },
            Threshold {
                low_critical: None,
                low_warning: None,
                high_warning: Some(80.0),
                high_critical: Some(90.0),
            },
        );
        map
    }

    /// Called by the Reconciler (C7) after fetching remote thresholds.
    pub fn update_thresholds(&self, thresholds: HashMap<ThresholdKey, Threshold>) {
        *self.remote_thresholds.write().unwrap() = thresholds;
    }

    fn lookup(&self, measurement: &str, item: Option<&str>) -> Option<Threshold> {
        let exact = ThresholdKey {
            measurement: measurement.to_string(),
            item: item.map(str::to_string),
        };
        let wildcard = ThresholdKey {
            measurement: measurement.to_string(),
            item: None,
        };

        let remote = self.remote_thresholds.read().unwrap();
        if let Some(t) = remote.get(&exact).filter(|t| !t.is_empty()) {
            return Some(*t);
        }
        if let Some(t) = remote.get(&wildcard).filter(|t| !t.is_empty()) {
            return Some(*t);
        }
        drop(remote);

        let config = self.config_thresholds.read().unwrap();
        if let Some(t) = config.get(&exact).filter(|t| !t.is_empty()) {
            return Some(*t);
        }
        if let Some(t) = config.get(&wildcard).filter(|t| !t.is_empty()) {
            return Some(*t);
        }
        None
    }

    fn soft_status(value: f64, threshold: &Threshold) -> Status {
        if let Some(bound) = threshold.low_critical {
            if value < bound {
                return Status::Critical;
            }
        }
        if let Some(bound) = threshold.low_warning {
            if value < bound {
                return Status::Warning;
            }
        }
        if let Some(bound) = threshold.high_critical {
            if value > bound {
                return Status::Critical;
            }
        }
        if let Some(bound) = threshold.high_warning {
            if value > bound {
                return Status::Warning;
            }
        }
        Status::Ok
    }

    fn latch(&self, key: (String, Option<String>), soft: Status, time: f64) -> Status {
        let mut guard = self.latches.write().unwrap();
        let state = guard.entry(key).or_default();

        if let Some(since) = state.warning_since {
            if since > time {
                state.warning_since = None;
            }
        }
        if let Some(since) = state.critical_since {
            if since > time {
                state.critical_since = None;
            }
        }

        match soft {
            Status::Critical => {
                state.critical_since.get_or_insert(time);
                state.warning_since.get_or_insert(time);
            }
            Status::Warning => {
                state.critical_since = None;
                state.warning_since.get_or_insert(time);
            }
            Status::Ok | Status::Unknown => {
                state.critical_since = None;
                state.warning_since = None;
            }
        }

        let crit_dur = state.critical_since.map(|t| time - t).unwrap_or(0.0);
        let warn_dur = state.warning_since.map(|t| time - t).unwrap_or(0.0);

        let reported = if crit_dur >= LATCH_PERIOD_SECS {
            Status::Critical
        } else if warn_dur >= LATCH_PERIOD_SECS {
            Status::Warning
        } else if soft == Status::Warning && state.last_reported == Status::Critical {
            Status::Warning
        } else if soft == Status::Ok {
            Status::Ok
        } else {
            state.last_reported
        };

        state.last_reported = reported;
        reported
    }

    fn check_output(sample: &MetricSample, threshold: &Threshold, status: Status, soft: bool) -> String {
        let suffix = if soft { " for the last 5 minutes" } else { "" };
        match status {
            Status::Ok => format!("Current value: {}", sample.value),
            Status::Critical | Status::Warning => {
                let (direction, bound) = if threshold
                    .low_critical
                    .map(|b| sample.value < b)
                    .unwrap_or(false)
                    || threshold
                        .low_warning
                        .map(|b| sample.value < b)
                        .unwrap_or(false)
                {
                    (
                        "below threshold",
                        if status == Status::Critical {
                            threshold.low_critical
                        } else {
                            threshold.low_warning
                        },
                    )
                } else {
                    (
                        "above threshold",
                        if status == Status::Critical {
                            threshold.high_critical
                        } else {
                            threshold.high_warning
                        },
                    )
                };
                format!(
                    "Current value: {} {}{} (threshold: {}){}",
                    sample.value,
                    direction,
                    "",
                    bound.map(|b| b.to_string()).unwrap_or_default(),
                    suffix
                )
            }
            Status::Unknown => "Current value: unknown".to_string(),
        }
    }

    /// Evaluate `sample` against the merged threshold set, applying the
    /// hysteresis latch unless `with_soft_status` is false (used for
    /// discrete-event gauges, §4.3). Returns the evaluated sample plus the
    /// companion `_status` derived sample, or `(sample, None)` if no
    /// threshold applies.
    pub fn evaluate(
        &self,
        mut sample: MetricSample,
        with_soft_status: bool,
    ) -> (MetricSample, Option<MetricSample>) {
        let threshold = match self.lookup(&sample.measurement, sample.item.as_deref()) {
            Some(t) => t,
            None => return (sample, None),
        };

        let soft = Self::soft_status(sample.value, &threshold);
        let status = if with_soft_status {
            self.latch(sample.cache_key(), soft, sample.time)
        } else {
            soft
        };

        sample.check_output = Some(Self::check_output(&sample, &threshold, status, with_soft_status));
        sample.status = Some(status);

        let mut status_sample = MetricSample::new(
            format!("{}_status", sample.measurement),
            sample.time,
            status.as_value(),
        );
        status_sample.item = sample.item.clone();
        status_sample.status_of = Some(sample.measurement.clone());

        (sample, Some(status_sample))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with(measurement: &str, threshold: Threshold) -> ThresholdEngine {
        let mut map = HashMap::new();
        map.insert(
            ThresholdKey {
                measurement: measurement.to_string(),
                item: None,
            },
            threshold,
        );
        ThresholdEngine::new(map)
    }

    #[test]
    fn evaluates_ok_with_no_hysteresis_delay() {
        let engine = engine_with(
            "cpu_idle",
            Threshold {
                low_critical: Some(5.0),
                low_warning: Some(10.0),
                high_warning: None,
                high_critical: None,
            },
        );
        let sample = MetricSample::new("cpu_idle", 0.0, 50.0);
        let (evaluated, status_sample) = engine.evaluate(sample, true);
        assert_eq!(evaluated.status, Some(Status::Ok));
        let status_sample = status_sample.unwrap();
        assert_eq!(status_sample.measurement, "cpu_idle_status");
        assert_eq!(status_sample.value, 0.0);
        assert_eq!(status_sample.status_of.as_deref(), Some("cpu_idle"));
    }

    #[test]
    fn soft_status_latches_for_full_period_before_reporting() {
        let engine = engine_with(
            "some_metric",
            Threshold {
                low_critical: None,
                low_warning: None,
                high_warning: Some(80.0),
                high_critical: Some(90.0),
            },
        );

        for t in [0.0, 60.0, 299.0] {
            let (evaluated, _) = engine.evaluate(MetricSample::new("some_metric", t, 95.0), true);
            assert_eq!(evaluated.status, Some(Status::Ok), "at t={t}");
        }

        let (evaluated, _) = engine.evaluate(MetricSample::new("some_metric", 300.0, 95.0), true);
        assert_eq!(evaluated.status, Some(Status::Critical));

        let (evaluated, _) = engine.evaluate(MetricSample::new("some_metric", 301.0, 50.0), true);
        assert_eq!(evaluated.status, Some(Status::Ok));
    }

    #[test]
    fn remote_threshold_overrides_config() {
        let mut map = HashMap::new();
        map.insert(
            ThresholdKey {
                measurement: "mem_used_perc".to_string(),
                item: None,
            },
            Threshold {
                low_critical: None,
                low_warning: None,
                high_warning: Some(80.0),
                high_critical: Some(90.0),
            },
        );
        let engine = ThresholdEngine::new(map);

        let mut remote = HashMap::new();
        remote.insert(
            ThresholdKey {
                measurement: "mem_used_perc".to_string(),
                item: None,
            },
            Threshold {
                low_critical: None,
                low_warning: None,
                high_warning: Some(50.0),
                high_critical: Some(60.0),
            },
        );
        engine.update_thresholds(remote);

        let (evaluated, _) = engine.evaluate(MetricSample::new("mem_used_perc", 0.0, 55.0), false);
        assert_eq!(evaluated.status, Some(Status::Warning));
    }

    #[test]
    fn no_threshold_means_no_evaluation() {
        let engine = ThresholdEngine::new(HashMap::new());
        let (evaluated, status_sample) = engine.evaluate(MetricSample::new("unrelated", 0.0, 1.0), true);
        assert_eq!(evaluated.status, None);
        assert!(status_sample.is_none());
    }
}
