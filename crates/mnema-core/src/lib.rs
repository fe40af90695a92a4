//! # mnema-core
//!
//! The in-process semantic-graph memory for Mnema - THE LOGIC.
//!
//! This crate implements the shared memory substrate: a store of typed
//! graph elements (nodes, links, connectors), a concurrent
//! event-notification fabric by which agents react to graph mutations, a
//! file-backed string index attaching searchable content to links, and a
//! template matcher over the graph.
//!
//! ## Architecture
//!
//! - [`Memory`] owns the element store, the string index, the event bus
//!   and the keynode set; [`Memory::initialize`] / [`Memory::shutdown`]
//!   bracket its lifetime.
//! - [`MemoryContext`] is the per-caller facade through which every read
//!   and mutation flows; contexts are cheap and thread-safe.
//! - Mutations enqueue events; the bus worker pool delivers them to
//!   subscriptions, waiters and agents concurrently with further
//!   mutations.
//!
//! ## Architectural Constraints
//!
//! - No network dependencies; the wire protocol lives in apps/mnema
//! - No `unwrap`/`panic` outside tests; all fallible paths return
//!   `Result<T, MnemaError>`

// =============================================================================
// MODULES
// =============================================================================

pub mod agent;
pub mod context;
pub mod events;
mod index;
pub mod keynodes;
pub mod memory;
pub mod store;
pub mod template;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types
// =============================================================================

pub use types::{Addr, LogLevel, MnemaError, Params, TypeMask};

// =============================================================================
// RE-EXPORTS: Memory & Context
// =============================================================================

pub use context::{EventsBlockGuard, MemoryContext};
pub use memory::{Memory, MemoryStats};

// =============================================================================
// RE-EXPORTS: Store & Index Views
// =============================================================================

pub use index::IndexStats;
pub use store::{Connector, ConnectorIter, StoreStats};

// =============================================================================
// RE-EXPORTS: Events, Agents, Templates
// =============================================================================

pub use agent::{ActionAgent, ActionStatus, Agent};
pub use events::{
    ConditionWaiter, Event, EventKind, EventSubscription, EventWaiter, SubscriptionId,
};
pub use keynodes::Keynodes;
pub use template::{Binding, Template, TemplateArg};
