//! # Memory Lifecycle
//!
//! One [`Memory`] instance owns the element store, the string index, the
//! event bus and the keynode set. It is created by
//! [`Memory::initialize`] and torn down by [`Memory::shutdown`] (drain
//! pending events, stop the workers, flush the index); contexts are cheap
//! handles created from the shared instance.

use crate::events::EventBus;
use crate::index::{FsIndex, IndexStats};
use crate::keynodes::Keynodes;
use crate::store::{Store, StoreStats};
use crate::types::{MnemaError, Params};
use crate::context::MemoryContext;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Aggregate element and index counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryStats {
    pub elements: StoreStats,
    pub index: IndexStats,
}

/// A running semantic-graph memory.
pub struct Memory {
    params: Params,
    store: Arc<Store>,
    index: Arc<FsIndex>,
    bus: Arc<EventBus>,
    keynodes: Keynodes,
    /// Serializes mutation commit and event enqueue, so per-subscription
    /// delivery order equals commit order.
    commit_lock: Mutex<()>,
    /// Registered agents, keyed by agent name, each owning its keynode
    /// subscriptions.
    agents: Mutex<HashMap<String, Vec<crate::events::EventSubscription>>>,
    running: AtomicBool,
}

impl Memory {
    /// Construct and start a memory instance from `params`.
    pub fn initialize(params: Params) -> Result<Arc<Self>, MnemaError> {
        let store = Arc::new(Store::new());
        let index = Arc::new(FsIndex::open(&params)?);
        let bus = EventBus::new();
        EventBus::start(&bus);
        let keynodes = Keynodes::initialize(&store, &index)?;
        tracing::info!(repo = %params.repo_path.display(), "memory initialized");
        Ok(Arc::new(Self {
            params,
            store,
            index,
            bus,
            keynodes,
            commit_lock: Mutex::new(()),
            agents: Mutex::new(HashMap::new()),
            running: AtomicBool::new(true),
        }))
    }

    /// Create a context handle over this memory.
    #[must_use]
    pub fn context(self: &Arc<Self>) -> MemoryContext {
        MemoryContext::new(Arc::clone(self))
    }

    /// The parameters this instance was initialized with.
    #[must_use]
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// The well-known keynode set.
    #[must_use]
    pub fn keynodes(&self) -> &Keynodes {
        &self.keynodes
    }

    /// False once shutdown has begun.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Element and index counters.
    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            elements: self.store.stats(),
            index: self.index.stats(),
        }
    }

    /// Drain pending events, stop the worker pool and flush the index.
    /// Idempotent; later calls are no-ops.
    pub fn shutdown(&self) -> Result<(), MnemaError> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.agents.lock().clear();
        self.bus.shutdown();
        self.index.flush()?;
        tracing::info!("memory shut down");
        Ok(())
    }

    // Internal wiring for contexts and the agent runtime.

    pub(crate) fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub(crate) fn index(&self) -> &Arc<FsIndex> {
        &self.index
    }

    pub(crate) fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub(crate) fn commit_lock(&self) -> &Mutex<()> {
        &self.commit_lock
    }

    pub(crate) fn agents(&self) -> &Mutex<HashMap<String, Vec<crate::events::EventSubscription>>> {
        &self.agents
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(error = %e, "shutdown during drop failed");
        }
    }
}
