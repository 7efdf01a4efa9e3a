//! # Adapter Registry
//!
//! Attached adapters by id. Several adapters may share one interrupt line;
//! the registry offers the interrupt to each of them in turn.

use crate::adapter::Adapter;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use helix_hal::interrupts::IrqReturn;
use helix_hal::DeviceHal;
use spin::RwLock;

/// Identifier of a registered adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AdapterId(u64);

impl AdapterId {
    /// Generate a new unique adapter ID
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for AdapterId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AdapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "megaraid{}", self.0)
    }
}

/// Registry of attached adapters
pub struct AdapterRegistry<H: DeviceHal> {
    adapters: RwLock<BTreeMap<AdapterId, Arc<Adapter<H>>>>,
}

impl<H: DeviceHal> Default for AdapterRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: DeviceHal> AdapterRegistry<H> {
    /// Create an empty registry
    pub const fn new() -> Self {
        Self { adapters: RwLock::new(BTreeMap::new()) }
    }

    /// Register an attached adapter
    pub fn register(&self, adapter: Adapter<H>) -> AdapterId {
        let id = AdapterId::new();
        log::info!("Registered adapter: {} (id={})", adapter.name(), id.as_u64());
        self.adapters.write().insert(id, Arc::new(adapter));
        id
    }

    /// Look up an adapter
    pub fn get(&self, id: AdapterId) -> Option<Arc<Adapter<H>>> {
        self.adapters.read().get(&id).cloned()
    }

    /// Remove an adapter; the caller detaches it once the last handle drops
    pub fn unregister(&self, id: AdapterId) -> Option<Arc<Adapter<H>>> {
        let adapter = self.adapters.write().remove(&id)?;
        log::info!("Unregistered adapter: {} (id={})", adapter.name(), id.as_u64());
        Some(adapter)
    }

    /// Registered adapter ids
    pub fn ids(&self) -> Vec<AdapterId> {
        self.adapters.read().keys().copied().collect()
    }

    /// Number of registered adapters
    pub fn len(&self) -> usize {
        self.adapters.read().len()
    }

    /// Whether no adapter is registered
    pub fn is_empty(&self) -> bool {
        self.adapters.read().is_empty()
    }

    /// Offer a shared interrupt to every adapter
    pub fn dispatch_interrupt(&self) -> IrqReturn {
        let adapters: Vec<_> = self.adapters.read().values().cloned().collect();
        adapters
            .iter()
            .fold(IrqReturn::None, |handled, adapter| handled.or(adapter.handle_interrupt()))
    }
}
