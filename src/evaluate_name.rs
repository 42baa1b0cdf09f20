use parking_lot::Mutex;
use std::collections::HashMap;

/// Remembers, per runtime object id, an expression that evaluates to it.
///
/// Entries are never evicted; an entry for a collected object is harmless.
#[derive(Debug, Default)]
pub struct EvaluateNameTracker {
    names: Mutex<HashMap<String, String>>,
}

impl EvaluateNameTracker {
    pub fn record(&self, object_id: &str, expression: &str) {
        self.names
            .lock()
            .insert(object_id.to_string(), expression.to_string());
    }

    pub fn get(&self, object_id: &str) -> Option<String> {
        self.names.lock().get(object_id).cloned()
    }

    /// Expression of a child of `parent_id`, e.g. `list` + `[0]`.
    pub fn build(&self, parent_id: &str, suffix: &str) -> Option<String> {
        self.get(parent_id).map(|parent| format!("{parent}{suffix}"))
    }
}

/// Suffix addressing a named field.
pub fn field_suffix(name: &str) -> String {
    format!(".{name}")
}

/// Suffix addressing an element by index or by a displayable key.
pub fn index_suffix(index: impl std::fmt::Display) -> String {
    format!("[{index}]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_from_recorded_parent() {
        let tracker = EvaluateNameTracker::default();
        tracker.record("a", "myList");
        assert_eq!(tracker.build("a", "[0]").as_deref(), Some("myList[0]"));
        assert_eq!(tracker.build("unknown", "[0]"), None);
    }

    #[test]
    fn test_chained_names() {
        let tracker = EvaluateNameTracker::default();
        tracker.record("objects/1", "list");
        let element = tracker.build("objects/1", &index_suffix(2)).unwrap();
        tracker.record("objects/2", &element);
        assert_eq!(
            tracker.build("objects/2", &field_suffix("name")).as_deref(),
            Some("list[2].name")
        );
        assert_eq!(index_suffix("\"k\""), "[\"k\"]");
    }
}
