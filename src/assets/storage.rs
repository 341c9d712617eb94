use parking_lot::RwLock;
use slotmap::{Key, SlotMap};
use std::sync::Arc;

/// Thread-safe arena of loaded assets, keyed by a generation-checked handle.
///
/// Assets are handed out as `Arc`s so a reader can keep using one while
/// another thread unloads it; the GPU side is released by the unload path,
/// not by the last `Arc`.
pub struct AssetStorage<H: Key, T> {
    map: RwLock<SlotMap<H, Arc<T>>>,
}

impl<H: Key, T> Default for AssetStorage<H, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Key, T> AssetStorage<H, T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            map: RwLock::new(SlotMap::with_key()),
        }
    }

    /// [Write] Takes ownership of a freshly loaded asset.
    pub fn add(&self, asset: T) -> H {
        self.map.write().insert(Arc::new(asset))
    }

    /// [Write] Stops tracking an asset and returns it for teardown.
    pub fn remove(&self, handle: H) -> Option<Arc<T>> {
        self.map.write().remove(handle)
    }

    /// [Read]
    pub fn get(&self, handle: H) -> Option<Arc<T>> {
        self.map.read().get(handle).cloned()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}
