//! Section registries: label to ID mapping
//!
//! Two maps coexist. The thread-local registry is the fast path for
//! `start`/`stop` and maps a label to an index into the watch array. The
//! shared registry is the authoritative enumeration used by the report phase;
//! insertion is guarded by a mutex and IDs are stable registration order.

use parking_lot::Mutex;
use std::collections::HashMap;

/// Insertion-ordered label map. IDs are dense indices in creation order.
#[derive(Debug, Default)]
pub struct LocalRegistry {
    ids: HashMap<String, usize>,
    labels: Vec<String>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, label: &str) -> Option<usize> {
        self.ids.get(label).copied()
    }

    /// Register a label, returning its ID. A no-op for known labels.
    pub fn add(&mut self, label: &str) -> usize {
        if let Some(id) = self.ids.get(label) {
            return *id;
        }
        let id = self.labels.len();
        self.ids.insert(label.to_string(), id);
        self.labels.push(label.to_string());
        id
    }

    pub fn label_of(&self, id: usize) -> Option<&str> {
        self.labels.get(id).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Labels in registration order.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(|s| s.as_str())
    }
}

/// The cross-thread registry. Only insertion takes the lock for writing.
#[derive(Debug, Default)]
pub struct SharedRegistry {
    inner: Mutex<LocalRegistry>,
}

impl SharedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, label: &str) -> Option<usize> {
        self.inner.lock().find(label)
    }

    pub fn add(&self, label: &str) -> usize {
        self.inner.lock().add(label)
    }

    pub fn label_of(&self, id: usize) -> Option<String> {
        self.inner.lock().label_of(id).map(|s| s.to_string())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Snapshot of all labels in stable ID order.
    pub fn snapshot(&self) -> Vec<String> {
        self.inner.lock().labels().map(|s| s.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_add_and_find() {
        let mut reg = LocalRegistry::new();
        assert_eq!(reg.find("A"), None);
        assert_eq!(reg.add("A"), 0);
        assert_eq!(reg.add("B"), 1);
        assert_eq!(reg.find("A"), Some(0));
        assert_eq!(reg.find("B"), Some(1));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut reg = LocalRegistry::new();
        assert_eq!(reg.add("A"), 0);
        assert_eq!(reg.add("A"), 0);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_label_of_round_trip() {
        let mut reg = LocalRegistry::new();
        reg.add("Root Section");
        reg.add("kernel");
        assert_eq!(reg.label_of(0), Some("Root Section"));
        assert_eq!(reg.label_of(1), Some("kernel"));
        assert_eq!(reg.label_of(2), None);
    }

    #[test]
    fn test_registration_order_preserved() {
        let mut reg = LocalRegistry::new();
        for label in ["z", "a", "m"] {
            reg.add(label);
        }
        let order: Vec<&str> = reg.labels().collect();
        assert_eq!(order, vec!["z", "a", "m"]);
    }

    #[test]
    fn test_shared_registry_concurrent_insertion() {
        let reg = Arc::new(SharedRegistry::new());
        let mut handles = Vec::new();
        for t in 0..8 {
            let reg = Arc::clone(&reg);
            handles.push(std::thread::spawn(move || {
                for i in 0..20 {
                    reg.add(&format!("sec{}", (t + i) % 10));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        // 10 distinct labels, each with a unique stable ID
        assert_eq!(reg.len(), 10);
        let snapshot = reg.snapshot();
        for (id, label) in snapshot.iter().enumerate() {
            assert_eq!(reg.find(label), Some(id));
        }
    }
}
