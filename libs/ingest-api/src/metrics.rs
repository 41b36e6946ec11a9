use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

/// One exported metric series, the shape both plugin `Gather()` calls
/// and the host's own counters use so the manager can merge them
/// uniformly (see `spec.md` §4.4, §9 "Metrics aggregation").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricFamily {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

impl MetricFamily {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self { name: name.into(), labels: BTreeMap::new(), value }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Process-local atomic counters keyed by `(family, labels)`, cheap to
/// increment from any task. `Gather` materializes a snapshot of every
/// registered series as a `MetricFamily` list.
#[derive(Default, Clone)]
pub struct CounterRegistry {
    inner: Arc<RwLock<BTreeMap<(String, Vec<(String, String)>), Arc<AtomicU64>>>>,
}

impl CounterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment (creating if absent) the counter identified by `name`
    /// and its label set.
    pub fn inc(&self, name: &str, labels: &[(&str, &str)]) {
        let key = (
            name.to_string(),
            labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        );
        let counter = {
            let read = self.inner.read().unwrap();
            read.get(&key).cloned()
        };
        let counter = match counter {
            Some(c) => c,
            None => {
                let mut write = self.inner.write().unwrap();
                write.entry(key).or_insert_with(|| Arc::new(AtomicU64::new(0))).clone()
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn gather(&self) -> Vec<MetricFamily> {
        let read = self.inner.read().unwrap();
        read.iter()
            .map(|((name, labels), counter)| MetricFamily {
                name: name.clone(),
                labels: labels.iter().cloned().collect(),
                value: counter.load(Ordering::Relaxed) as f64,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increments_are_per_label_set() {
        let reg = CounterRegistry::new();
        reg.inc("enqueue_attempts_total", &[("result", "success")]);
        reg.inc("enqueue_attempts_total", &[("result", "success")]);
        reg.inc("enqueue_attempts_total", &[("result", "error")]);

        let families = reg.gather();
        let success = families
            .iter()
            .find(|f| f.labels.get("result").map(String::as_str) == Some("success"))
            .unwrap();
        let error = families
            .iter()
            .find(|f| f.labels.get("result").map(String::as_str) == Some("error"))
            .unwrap();
        assert_eq!(success.value, 2.0);
        assert_eq!(error.value, 1.0);
    }
}
