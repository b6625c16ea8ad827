//! bounded rolling history per data category (air, water).
//!
//! every sequence in a series (labels and each metric) has the same length;
//! appends past capacity evict the oldest entry of all of them together.

use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};

use crate::domain::{AIR_METRICS, WATER_METRICS};

pub const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSeries {
    #[serde(skip)]
    capacity: usize,
    labels: VecDeque<String>,
    metrics: BTreeMap<&'static str, VecDeque<f64>>,
    /// highest value seen per metric since the series was created or cleared
    max_recorded: BTreeMap<&'static str, f64>,
}

impl MetricSeries {
    pub fn new(metrics: &[&'static str], capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            labels: VecDeque::with_capacity(capacity),
            metrics: metrics
                .iter()
                .map(|m| (*m, VecDeque::with_capacity(capacity)))
                .collect(),
            max_recorded: BTreeMap::new(),
        }
    }

    pub fn air(capacity: usize) -> Self {
        Self::new(&AIR_METRICS, capacity)
    }

    pub fn water(capacity: usize) -> Self {
        Self::new(&WATER_METRICS, capacity)
    }

    /// append one sample. metrics absent from `values` are recorded as zero
    /// so the parallel sequences never drift apart.
    pub fn push(&mut self, label: impl Into<String>, values: &BTreeMap<String, f64>) {
        self.labels.push_back(label.into());
        for (name, series) in self.metrics.iter_mut() {
            let value = values.get(*name).copied().unwrap_or(0.0);
            series.push_back(value);
            self.max_recorded
                .entry(*name)
                .and_modify(|current| *current = current.max(value))
                .or_insert(value);
        }

        while self.labels.len() > self.capacity {
            self.labels.pop_front();
            for series in self.metrics.values_mut() {
                series.pop_front();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn labels(&self) -> &VecDeque<String> {
        &self.labels
    }

    pub fn values(&self, metric: &str) -> Option<&VecDeque<f64>> {
        self.metrics.get(metric)
    }

    pub fn max_recorded(&self, metric: &str) -> Option<f64> {
        self.max_recorded.get(metric).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn push_fills_every_metric() {
        let mut series = MetricSeries::air(DEFAULT_CAPACITY);
        series.push("10:00", &sample(&[("pm25", 42.0), ("co", 300.0)]));

        assert_eq!(series.len(), 1);
        assert_eq!(*series.values("pm25").unwrap(), vec![42.0]);
        assert_eq!(*series.values("so2").unwrap(), vec![0.0]);
        assert_eq!(*series.labels(), vec!["10:00".to_string()]);
    }

    #[test]
    fn evicts_oldest_in_lockstep() {
        let mut series = MetricSeries::water(DEFAULT_CAPACITY);
        for i in 0..101 {
            series.push(format!("t{}", i), &sample(&[("level", i as f64), ("ph", 7.0)]));
        }

        assert_eq!(series.len(), 100);
        assert_eq!(series.labels().front().map(String::as_str), Some("t1"));
        for metric in WATER_METRICS {
            assert_eq!(series.values(metric).unwrap().len(), 100, "{}", metric);
        }
        assert_eq!(series.values("level").unwrap().front(), Some(&1.0));
        assert_eq!(series.values("level").unwrap().back(), Some(&100.0));
    }

    #[test]
    fn max_survives_eviction() {
        let mut series = MetricSeries::air(2);
        series.push("a", &sample(&[("pm25", 90.0)]));
        series.push("b", &sample(&[("pm25", 10.0)]));
        series.push("c", &sample(&[("pm25", 20.0)]));

        assert_eq!(*series.values("pm25").unwrap(), vec![10.0, 20.0]);
        assert_eq!(series.max_recorded("pm25"), Some(90.0));
        assert_eq!(series.max_recorded("so2"), Some(0.0));
        assert_eq!(MetricSeries::air(2).max_recorded("pm25"), None);
    }

    #[test]
    fn untracked_metrics_are_ignored() {
        let mut series = MetricSeries::water(10);
        series.push("a", &sample(&[("pm25", 5.0)]));
        assert!(series.values("pm25").is_none());
        assert_eq!(*series.values("level").unwrap(), vec![0.0]);
    }
}
