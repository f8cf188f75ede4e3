//! Export access tracking
//!
//! Wraps a module's exports object into a tracked view that records which
//! exported names are read by dependents. Reads of nested objects return
//! nested tracked views sharing the same accessed-name set, so deep access
//! is attributed to the top-level export it went through.
//!
//! The tracked view and the raw exports behave identically for every lookup;
//! only identity differs. Tracking state lives behind a cheap lock because
//! views are handed across task boundaries, not because of real contention.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};

/// Handle over the accessed-name set of one tracked exports object.
///
/// Cloning the tracker shares the underlying set.
#[derive(Debug, Clone, Default)]
pub struct ExportTracker {
    accessed: Arc<Mutex<BTreeSet<String>>>,
}

impl ExportTracker {
    /// Immutable snapshot of every name read since the last reset.
    pub fn accessed_names(&self) -> BTreeSet<String> {
        self.accessed.lock().clone()
    }

    /// Clear the accessed set.
    pub fn reset(&self) {
        self.accessed.lock().clear();
    }

    fn record(&self, name: &str) {
        self.accessed.lock().insert(name.to_string());
    }
}

/// Tracked view over a module's raw exports.
#[derive(Debug, Clone, Default)]
pub struct TrackedExports {
    values: Arc<Map<String, Value>>,
    tracker: ExportTracker,
}

impl TrackedExports {
    pub fn new(raw: Map<String, Value>) -> Self {
        Self {
            values: Arc::new(raw),
            tracker: ExportTracker::default(),
        }
    }

    /// Read an exported name, recording the access.
    pub fn get(&self, name: &str) -> Option<TrackedValue<'_>> {
        self.tracker.record(name);
        self.values.get(name).map(|value| TrackedValue {
            value,
            tracker: &self.tracker,
        })
    }

    /// Membership test. Counts as a read of `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.tracker.record(name);
        self.values.contains_key(name)
    }

    /// Number of exported names. Not a keyed read, so untracked.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The raw exports, bypassing tracking.
    pub fn raw(&self) -> &Map<String, Value> {
        &self.values
    }

    /// Shared handle to this view's accessed-name set.
    pub fn tracker(&self) -> ExportTracker {
        self.tracker.clone()
    }
}

/// A value read through a tracked view. Object values keep tracking on
/// nested reads; everything else passes through.
#[derive(Debug, Clone, Copy)]
pub struct TrackedValue<'a> {
    value: &'a Value,
    tracker: &'a ExportTracker,
}

impl<'a> TrackedValue<'a> {
    /// Nested keyed read. Recorded into the same accessed set as the
    /// top-level view.
    pub fn get(&self, name: &str) -> Option<TrackedValue<'a>> {
        let obj = self.value.as_object()?;
        self.tracker.record(name);
        obj.get(name).map(|value| TrackedValue {
            value,
            tracker: self.tracker,
        })
    }

    pub fn raw(&self) -> &'a Value {
        self.value
    }

    pub fn as_str(&self) -> Option<&'a str> {
        self.value.as_str()
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.value.as_f64()
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.value.as_bool()
    }

    pub fn is_object(&self) -> bool {
        self.value.is_object()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_exports() -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("count".to_string(), json!(1));
        map.insert("name".to_string(), json!("widget"));
        map.insert(
            "config".to_string(),
            json!({ "debug": true, "nested": { "deep": 42 } }),
        );
        map
    }

    #[test]
    fn test_reads_are_recorded() {
        let exports = TrackedExports::new(sample_exports());
        let tracker = exports.tracker();

        assert!(exports.get("count").is_some());
        assert!(exports.get("name").is_some());
        // Reading the same name twice records it once
        assert!(exports.get("count").is_some());

        let names: Vec<_> = tracker.accessed_names().into_iter().collect();
        assert_eq!(names, vec!["count".to_string(), "name".to_string()]);
    }

    #[test]
    fn test_missing_name_still_recorded() {
        let exports = TrackedExports::new(sample_exports());
        assert!(exports.get("absent").is_none());
        assert!(exports.tracker().accessed_names().contains("absent"));
    }

    #[test]
    fn test_nested_reads_share_one_set() {
        let exports = TrackedExports::new(sample_exports());
        let config = exports.get("config").unwrap();
        let nested = config.get("nested").unwrap();
        assert_eq!(nested.get("deep").unwrap().as_f64(), Some(42.0));

        let names = exports.tracker().accessed_names();
        assert!(names.contains("config"));
        assert!(names.contains("nested"));
        assert!(names.contains("deep"));
        assert_eq!(names.len(), 3);
    }

    #[test]
    fn test_values_pass_through_unchanged() {
        let exports = TrackedExports::new(sample_exports());
        assert_eq!(exports.get("name").unwrap().as_str(), Some("widget"));
        assert_eq!(
            exports.get("config").unwrap().get("debug").unwrap().as_bool(),
            Some(true)
        );
        assert_eq!(exports.raw().get("count"), Some(&json!(1)));
    }

    #[test]
    fn test_reset_clears_the_set() {
        let exports = TrackedExports::new(sample_exports());
        exports.get("count");
        let tracker = exports.tracker();
        assert!(!tracker.accessed_names().is_empty());

        tracker.reset();
        assert!(tracker.accessed_names().is_empty());

        // Tracking keeps working after reset
        exports.get("name");
        assert!(tracker.accessed_names().contains("name"));
    }

    #[test]
    fn test_non_object_values_have_no_children() {
        let exports = TrackedExports::new(sample_exports());
        let count = exports.get("count").unwrap();
        assert!(count.get("anything").is_none());
    }
}
