//! # Context Facade
//!
//! [`MemoryContext`] is the sole entry point for reading and mutating the
//! graph. Contexts are cheap, thread-safe handles over the shared memory;
//! each one owns its events-blocking state and its waiters. After a
//! `create_*` call returns, the new element is visible to every other
//! context.
//!
//! Mutations never invoke delegates on the calling thread: events are
//! enqueued and delivered on the bus worker pool. The exception is
//! [`MemoryContext::erase_element`], which (when called outside the pool)
//! blocks until its erase events have been delivered, so the cascade is
//! unlinked by the time it returns.

use crate::events::bus::{self, Delegate};
use crate::events::waiter::WaitCell;
use crate::events::{ConditionWaiter, Event, EventKind, EventSubscription, EventWaiter};
use crate::memory::Memory;
use crate::store::{Connector, ConnectorIter, EraseRecord};
use crate::template::{self, Binding, Template};
use crate::types::{Addr, MnemaError, TypeMask};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

// =============================================================================
// CONTEXT
// =============================================================================

/// Per-caller handle over a shared [`Memory`].
pub struct MemoryContext {
    memory: Arc<Memory>,
    /// Nesting depth of events-blocking scopes.
    blocked_depth: AtomicU32,
    waiters: Mutex<Vec<Arc<WaitCell>>>,
    destroyed: AtomicBool,
}

impl MemoryContext {
    pub(crate) fn new(memory: Arc<Memory>) -> Self {
        Self {
            memory,
            blocked_depth: AtomicU32::new(0),
            waiters: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
        }
    }

    fn ensure_usable(&self) -> Result<(), MnemaError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(MnemaError::InvalidState("context is destroyed".into()));
        }
        if !self.memory.is_running() {
            return Err(MnemaError::InvalidState("memory is shut down".into()));
        }
        Ok(())
    }

    /// The shared memory this context operates on.
    #[must_use]
    pub fn memory(&self) -> &Arc<Memory> {
        &self.memory
    }

    /// Cancel this context's waiters and refuse further operations.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        for waiter in self.waiters.lock().drain(..) {
            waiter.cancel();
        }
    }

    // =========================================================================
    // ELEMENT OPERATIONS
    // =========================================================================

    pub fn create_node(&self, mask: TypeMask) -> Result<Addr, MnemaError> {
        self.ensure_usable()?;
        self.memory.store().create_node(mask)
    }

    pub fn create_link(&self, mask: TypeMask) -> Result<Addr, MnemaError> {
        self.ensure_usable()?;
        self.memory.store().create_link(mask)
    }

    /// Create a connector between two live elements. Common edges are not
    /// deduplicated; callers needing uniqueness check with
    /// [`MemoryContext::check_connector`] first.
    pub fn create_connector(
        &self,
        mask: TypeMask,
        source: Addr,
        target: Addr,
    ) -> Result<Addr, MnemaError> {
        self.ensure_usable()?;
        let commit = self.memory.commit_lock().lock();
        let addr = self.memory.store().create_connector(mask, source, target)?;
        if !self.events_blocked() {
            self.memory.bus().emit_generate(Connector {
                addr,
                mask,
                source,
                target,
            });
        }
        drop(commit);
        Ok(addr)
    }

    /// Erase an element and its cascade (incident connectors, connectors of
    /// structures containing it). Erase events fire while the elements are
    /// still readable; when called from outside the bus worker pool, this
    /// returns only after those events are delivered and the slots freed.
    pub fn erase_element(&self, addr: Addr) -> Result<(), MnemaError> {
        self.ensure_usable()?;
        let commit = self.memory.commit_lock().lock();
        let records = self.memory.store().begin_erase(addr)?;

        if self.events_blocked() {
            drop(commit);
            Self::finish_cascade(&self.memory, &records);
            return Ok(());
        }

        let memory = Arc::clone(&self.memory);
        let owned: Vec<EraseRecord> = records.clone();
        let completion = self.memory.bus().emit_erase(
            &records,
            Box::new(move || Self::finish_cascade(&memory, &owned)),
        );
        drop(commit);
        // A bus worker cannot wait for deliveries only it could perform;
        // the cascade then unlinks after the last erase event.
        if !bus::on_worker_thread() {
            completion.wait();
        }
        Ok(())
    }

    fn finish_cascade(memory: &Arc<Memory>, records: &[EraseRecord]) {
        memory.store().finish_erase(records);
        // Any element may carry index entries: links their content, every
        // element a possible system identifier.
        for record in records {
            memory.index().remove_element(record.addr);
        }
    }

    pub fn is_element(&self, addr: Addr) -> bool {
        !self.destroyed.load(Ordering::Acquire) && self.memory.store().is_element(addr)
    }

    pub fn get_element_type(&self, addr: Addr) -> Result<TypeMask, MnemaError> {
        self.ensure_usable()?;
        self.memory.store().get_type(addr)
    }

    /// `(source, target)` of a connector.
    pub fn connector_endpoints(&self, addr: Addr) -> Result<(Addr, Addr), MnemaError> {
        self.ensure_usable()?;
        self.memory.store().connector_endpoints(addr)
    }

    /// Enumerate connectors leaving `element`, filtered by `mask`.
    pub fn iter_outgoing(
        &self,
        element: Addr,
        mask: TypeMask,
    ) -> Result<ConnectorIter<'_>, MnemaError> {
        self.ensure_usable()?;
        self.memory.store().iter_outgoing(element, mask)
    }

    /// Enumerate connectors arriving at `element`, filtered by `mask`.
    pub fn iter_incoming(
        &self,
        element: Addr,
        mask: TypeMask,
    ) -> Result<ConnectorIter<'_>, MnemaError> {
        self.ensure_usable()?;
        self.memory.store().iter_incoming(element, mask)
    }

    /// True when a connector of type `⊑ mask` connects the two elements.
    #[must_use]
    pub fn check_connector(&self, source: Addr, target: Addr, mask: TypeMask) -> bool {
        self.ensure_usable().is_ok()
            && self
                .memory
                .store()
                .connector_between(source, target, mask)
                .is_some()
    }

    // =========================================================================
    // LINK CONTENT
    // =========================================================================

    /// Replace the content of a link. Atomic for observers; emits a
    /// content-change event.
    pub fn set_link_content(&self, link: Addr, bytes: &[u8]) -> Result<(), MnemaError> {
        self.ensure_usable()?;
        let mask = self.memory.store().get_type(link)?;
        if !mask.is_link() {
            return Err(MnemaError::InvalidParams(format!(
                "element {link} is not a link"
            )));
        }
        let commit = self.memory.commit_lock().lock();
        self.memory.index().set_link_content(link, bytes)?;
        if !self.events_blocked() {
            self.memory.bus().emit_content_change(link, mask);
        }
        drop(commit);
        Ok(())
    }

    /// Content of a link; empty when none was ever set.
    pub fn get_link_content(&self, link: Addr) -> Result<Vec<u8>, MnemaError> {
        self.ensure_usable()?;
        let mask = self.memory.store().get_type(link)?;
        if !mask.is_link() {
            return Err(MnemaError::InvalidParams(format!(
                "element {link} is not a link"
            )));
        }
        Ok(self.memory.index().get_link_content(link)?.unwrap_or_default())
    }

    /// Live links whose content is exactly `bytes`.
    pub fn find_links_by_content(&self, bytes: &[u8]) -> Result<Vec<Addr>, MnemaError> {
        self.ensure_usable()?;
        let mut links = self.memory.index().find_links_by_exact_content(bytes);
        links.retain(|link| self.memory.store().is_element(*link));
        Ok(links)
    }

    /// Live links whose content contains every token of `bytes`.
    pub fn find_links_by_substring(&self, bytes: &[u8]) -> Result<Vec<Addr>, MnemaError> {
        self.ensure_usable()?;
        let mut links = self.memory.index().find_links_by_substring(bytes);
        links.retain(|link| self.memory.store().is_element(*link));
        Ok(links)
    }

    // =========================================================================
    // SYSTEM IDENTIFIERS
    // =========================================================================

    pub fn set_system_identifier(
        &self,
        addr: Addr,
        identifier: &str,
    ) -> Result<(), MnemaError> {
        self.ensure_usable()?;
        if !self.memory.store().is_element(addr) {
            return Err(MnemaError::ElementNotFound(addr));
        }
        self.memory.index().set_system_identifier(addr, identifier)
    }

    /// Resolve a system identifier to a live element.
    pub fn resolve_system_identifier(&self, identifier: &str) -> Result<Addr, MnemaError> {
        self.ensure_usable()?;
        match self.memory.index().resolve_system_identifier(identifier) {
            Some(addr) if self.memory.store().is_element(addr) => Ok(addr),
            _ => Err(MnemaError::IdentifierNotFound(identifier.to_string())),
        }
    }

    /// Identifier bound to an element, if any.
    #[must_use]
    pub fn system_identifier_of(&self, addr: Addr) -> Option<String> {
        self.memory.index().system_identifier_of(addr)
    }

    // =========================================================================
    // TEMPLATES
    // =========================================================================

    /// Enumerate every assignment of template variables realized by live
    /// elements.
    pub fn search_by_template(&self, template: &Template) -> Result<Vec<Binding>, MnemaError> {
        self.ensure_usable()?;
        template::search(self, template)
    }

    /// Materialize the elements missing to satisfy a template, honoring a
    /// partial binding.
    pub fn generate_by_template(
        &self,
        template: &Template,
        partial: Binding,
    ) -> Result<Binding, MnemaError> {
        self.ensure_usable()?;
        template::generate(self, template, partial)
    }

    // =========================================================================
    // EVENTS
    // =========================================================================

    /// Register a delegate for an event class on a subscription element.
    /// The delegate runs on the bus worker pool and must use its own
    /// context.
    pub fn subscribe<F>(
        &self,
        kind: EventKind,
        element: Addr,
        mask: TypeMask,
        delegate: F,
    ) -> Result<EventSubscription, MnemaError>
    where
        F: Fn(&Event) -> Result<(), MnemaError> + Send + Sync + 'static,
    {
        self.validate_subscription(kind, element, mask)?;
        let id = self
            .memory
            .bus()
            .subscribe(kind, element, mask, Some(Arc::new(delegate)));
        Ok(EventSubscription::new(id, Arc::clone(self.memory.bus())))
    }

    fn validate_subscription(
        &self,
        kind: EventKind,
        element: Addr,
        mask: TypeMask,
    ) -> Result<(), MnemaError> {
        self.ensure_usable()?;
        if !mask.is_valid() {
            return Err(MnemaError::InvalidParams(format!(
                "malformed type mask {mask}"
            )));
        }
        let element_type = self
            .memory
            .store()
            .get_type(element)
            .map_err(|_| MnemaError::ElementNotFound(element))?;
        if kind == EventKind::ChangeLinkContent && !element_type.is_link() {
            return Err(MnemaError::InvalidParams(format!(
                "content events require a link, {element} is {element_type}"
            )));
        }
        Ok(())
    }

    // =========================================================================
    // WAITERS
    // =========================================================================

    fn arm_waiter(
        &self,
        kind: EventKind,
        element: Addr,
        mask: TypeMask,
        predicate: Option<Box<dyn Fn(&Event) -> bool + Send + Sync>>,
    ) -> Result<(Arc<WaitCell>, EventSubscription), MnemaError> {
        self.validate_subscription(kind, element, mask)?;
        let cell = WaitCell::new();
        // The subscription starts without a delegate (live but silent) and
        // receives the resolving one once the waiter owns its cell.
        let id = self.memory.bus().subscribe(kind, element, mask, None);
        let subscription = EventSubscription::new(id, Arc::clone(self.memory.bus()));
        let delegate_cell = Arc::clone(&cell);
        let delegate: Arc<Delegate> = Arc::new(move |event: &Event| {
            let accepted = predicate.as_ref().is_none_or(|predicate| predicate(event));
            if accepted {
                delegate_cell.resolve();
            }
            Ok(())
        });
        subscription.install_delegate(delegate);
        self.waiters.lock().push(Arc::clone(&cell));
        Ok((cell, subscription))
    }

    /// Waiter resolving on the first event of `kind` on `element`.
    pub fn create_event_waiter(
        &self,
        kind: EventKind,
        element: Addr,
        mask: TypeMask,
    ) -> Result<EventWaiter, MnemaError> {
        let (cell, subscription) = self.arm_waiter(kind, element, mask, None)?;
        Ok(EventWaiter::new(cell, subscription))
    }

    /// [`MemoryContext::create_event_waiter`] plus a trigger invoked
    /// synchronously after arming, to emit the awaited mutation.
    pub fn create_event_waiter_with_trigger(
        &self,
        kind: EventKind,
        element: Addr,
        mask: TypeMask,
        trigger: impl FnOnce(),
    ) -> Result<EventWaiter, MnemaError> {
        let waiter = self.create_event_waiter(kind, element, mask)?;
        trigger();
        Ok(waiter)
    }

    /// Waiter resolving only on events accepted by `predicate`.
    pub fn create_condition_waiter<P>(
        &self,
        kind: EventKind,
        element: Addr,
        mask: TypeMask,
        predicate: P,
    ) -> Result<ConditionWaiter, MnemaError>
    where
        P: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        let (cell, subscription) =
            self.arm_waiter(kind, element, mask, Some(Box::new(predicate)))?;
        Ok(ConditionWaiter::new(cell, subscription))
    }

    /// [`MemoryContext::create_condition_waiter`] plus a trigger invoked
    /// synchronously after arming.
    pub fn create_condition_waiter_with_trigger<P>(
        &self,
        kind: EventKind,
        element: Addr,
        mask: TypeMask,
        trigger: impl FnOnce(),
        predicate: P,
    ) -> Result<ConditionWaiter, MnemaError>
    where
        P: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        let waiter = self.create_condition_waiter(kind, element, mask, predicate)?;
        trigger();
        Ok(waiter)
    }

    /// Waiter keyed by an event-class keynode instead of an [`EventKind`].
    pub fn create_event_waiter_by_class(
        &self,
        class: Addr,
        element: Addr,
        mask: TypeMask,
    ) -> Result<EventWaiter, MnemaError> {
        let kind = self
            .memory
            .keynodes()
            .event_kind_of(class)
            .ok_or_else(|| {
                MnemaError::InvalidParams(format!("{class} is not an event-class keynode"))
            })?;
        self.create_event_waiter(kind, element, mask)
    }

    // =========================================================================
    // EVENTS BLOCKING
    // =========================================================================

    /// True while this context suppresses event emission.
    #[must_use]
    pub fn events_blocked(&self) -> bool {
        self.blocked_depth.load(Ordering::Acquire) > 0
    }

    /// Enter an events-blocking scope. Scopes nest.
    pub fn begin_events_blocking(&self) {
        self.blocked_depth.fetch_add(1, Ordering::AcqRel);
    }

    /// Leave an events-blocking scope.
    pub fn end_events_blocking(&self) {
        let previous = self.blocked_depth.fetch_sub(1, Ordering::AcqRel);
        if previous == 0 {
            // Unbalanced end; restore and complain.
            self.blocked_depth.store(0, Ordering::Release);
            tracing::warn!("end_events_blocking without a matching begin");
        }
    }

    /// Scoped events-blocking guard; unblocks on every exit path.
    #[must_use]
    pub fn block_events(&self) -> EventsBlockGuard<'_> {
        self.begin_events_blocking();
        EventsBlockGuard { context: self }
    }
}

impl Drop for MemoryContext {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for MemoryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryContext")
            .field("events_blocked", &self.events_blocked())
            .field("destroyed", &self.destroyed.load(Ordering::Relaxed))
            .finish()
    }
}

// =============================================================================
// EVENTS-BLOCKING GUARD
// =============================================================================

/// RAII scope for events blocking on one context.
#[must_use = "the guard unblocks events when dropped"]
pub struct EventsBlockGuard<'a> {
    context: &'a MemoryContext,
}

impl Drop for EventsBlockGuard<'_> {
    fn drop(&mut self) {
        self.context.end_events_blocking();
    }
}
