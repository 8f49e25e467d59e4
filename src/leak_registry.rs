//! Bookkeeping of live chunks, for leak triage.
//!
//! Every [`MemoryChunk`](crate::chunk::MemoryChunk) registers itself with a
//! registry when it is constructed and deregisters when its native buffer is
//! released. Whatever is left in a registry is either still in flight or leaked.
//!
//! Chunks use [`LeakRegistry::global`] unless given a registry explicitly.
//! The global registry only tracks anything with the `leak-registry` feature.

#[cfg(feature = "leak-registry")]
use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A chunk that has been constructed but whose buffer has not been released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveChunk {
    pub instance_id: u64,
    pub kind: &'static str,
    pub length: usize,
}

/// Set of live chunks, shared by clones of the same registry.
#[derive(Clone)]
pub struct LeakRegistry {
    live: Option<Arc<Mutex<BTreeMap<u64, LiveChunk>>>>,
}

#[cfg(feature = "leak-registry")]
lazy_static! {
    static ref GLOBAL_REGISTRY: LeakRegistry = LeakRegistry::new();
}

impl LeakRegistry {
    /// A fresh, empty registry.
    pub fn new() -> Self {
        Self {
            live: Some(Arc::new(Mutex::new(BTreeMap::new()))),
        }
    }

    /// A registry that records nothing.
    pub fn disabled() -> Self {
        Self { live: None }
    }

    #[cfg(feature = "leak-registry")]
    /// The process-wide registry.
    pub fn global() -> Self {
        GLOBAL_REGISTRY.clone()
    }

    #[cfg(not(feature = "leak-registry"))]
    /// The process-wide registry: disabled without the `leak-registry` feature.
    pub fn global() -> Self {
        Self::disabled()
    }

    pub fn is_enabled(&self) -> bool {
        self.live.is_some()
    }

    /// Record a newly constructed chunk.
    pub fn add_reference(&self, chunk: LiveChunk) {
        if let Some(live) = &self.live {
            live.lock().insert(chunk.instance_id, chunk);
        }
    }

    /// Forget a chunk whose buffer was released. Returns false if it was not registered.
    pub fn delete_reference(&self, instance_id: u64) -> bool {
        match &self.live {
            Some(live) => live.lock().remove(&instance_id).is_some(),
            None => false,
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.as_ref().map_or(0, |live| live.lock().len())
    }

    pub fn contains(&self, instance_id: u64) -> bool {
        self.live
            .as_ref()
            .is_some_and(|live| live.lock().contains_key(&instance_id))
    }

    /// Snapshot of every live chunk, ordered by instance id.
    pub fn dump(&self) -> Vec<LiveChunk> {
        self.live
            .as_ref()
            .map_or_else(Vec::new, |live| live.lock().values().cloned().collect())
    }

    /// Log every live chunk at warn level and return how many there were.
    pub fn log_live_chunks(&self) -> usize {
        let live = self.dump();
        if live.is_empty() {
            return 0;
        }
        tracing::warn!("LeakRegistry: {} chunks pending release", live.len());
        for (i, chunk) in live.iter().enumerate() {
            tracing::warn!(
                "LeakRegistry: [{}] --> {}#{} ({} bytes)",
                i,
                chunk.kind,
                chunk.instance_id,
                chunk.length
            );
        }
        live.len()
    }
}

impl Default for LeakRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LeakRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeakRegistry")
            .field("enabled", &self.is_enabled())
            .field("live", &self.live_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u64) -> LiveChunk {
        LiveChunk {
            instance_id: id,
            kind: "ByteBuffer",
            length: 16,
        }
    }

    #[test]
    fn add_and_delete() {
        let registry = LeakRegistry::new();
        registry.add_reference(entry(2));
        registry.add_reference(entry(1));
        assert_eq!(registry.live_count(), 2);
        assert!(registry.contains(1));
        assert_eq!(
            registry.dump().iter().map(|c| c.instance_id).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert!(registry.delete_reference(1));
        assert!(!registry.delete_reference(1));
        assert_eq!(registry.live_count(), 1);
    }

    #[test]
    fn clones_share_state() {
        let registry = LeakRegistry::new();
        let other = registry.clone();
        other.add_reference(entry(7));
        assert!(registry.contains(7));
        assert_eq!(registry.log_live_chunks(), 1);
    }

    #[test]
    fn disabled_records_nothing() {
        let registry = LeakRegistry::disabled();
        registry.add_reference(entry(1));
        assert_eq!(registry.live_count(), 0);
        assert!(registry.dump().is_empty());
        assert_eq!(registry.log_live_chunks(), 0);
    }

    #[cfg(feature = "leak-registry")]
    #[test]
    fn global_is_shared() {
        assert!(LeakRegistry::global().is_enabled());
        let id = u64::MAX - 3;
        LeakRegistry::global().add_reference(entry(id));
        assert!(LeakRegistry::global().contains(id));
        assert!(LeakRegistry::global().delete_reference(id));
    }
}
