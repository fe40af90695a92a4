//! # Event Bus
//!
//! Subscription registry, event matching, and the worker pool.
//!
//! Every subscription owns a FIFO queue. A mutation appends matching events
//! to the queues of matching subscriptions and marks each touched
//! subscription as scheduled on a shared channel; pool workers pick
//! subscriptions off the channel and drain their queues one event at a
//! time. Within a subscription delivery order equals enqueue order; across
//! subscriptions no order is guaranteed.
//!
//! Delegates run on pool workers, concurrently with further mutations, so
//! delegate code must use its own context. A delegate must never block on a
//! waiter bound to its own subscription.

use crate::store::{Connector, EraseRecord};
use crate::types::{Addr, MnemaError, TypeMask};
use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::{Condvar, Mutex, RwLock};
use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{Event, EventKind};

/// Size of the delivery worker pool.
const EVENT_WORKERS: usize = 4;

/// Upper bound on draining pending events at shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

thread_local! {
    static IS_BUS_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// True when the calling thread is one of the bus delivery workers.
///
/// Erase uses this to avoid waiting on deliveries that only the calling
/// worker could perform.
pub(crate) fn on_worker_thread() -> bool {
    IS_BUS_WORKER.with(Cell::get)
}

// =============================================================================
// SUBSCRIPTIONS
// =============================================================================

/// Opaque id of a registered subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Delegate invoked for each delivered event. Errors are logged, never
/// propagated to the mutator.
pub type Delegate = dyn Fn(&Event) -> Result<(), MnemaError> + Send + Sync;

struct QueuedEvent {
    event: Event,
    done: Option<Arc<EraseCompletion>>,
}

struct SubQueue {
    events: VecDeque<QueuedEvent>,
    scheduled: bool,
}

struct Subscription {
    id: u64,
    kind: EventKind,
    element: Addr,
    mask: TypeMask,
    /// Absent delegates keep the subscription live but drop events
    /// silently; waiters install theirs after arming.
    delegate: Mutex<Option<Arc<Delegate>>>,
    queue: Mutex<SubQueue>,
}

// =============================================================================
// ERASE COMPLETION
// =============================================================================

struct CompletionState {
    remaining: usize,
    finish: Option<Box<dyn FnOnce() + Send>>,
    done: bool,
}

/// Tracks the delivery of a batch of erase events. When the last one is
/// delivered, the finish action (unlink + retire in the store) runs on the
/// delivering worker, and threads blocked in [`EraseCompletion::wait`] are
/// released.
pub(crate) struct EraseCompletion {
    state: Mutex<CompletionState>,
    cond: Condvar,
}

impl EraseCompletion {
    fn new(count: usize, finish: Box<dyn FnOnce() + Send>) -> Arc<Self> {
        let completion = Arc::new(Self {
            state: Mutex::new(CompletionState {
                remaining: count,
                finish: Some(finish),
                done: false,
            }),
            cond: Condvar::new(),
        });
        if count == 0 {
            completion.run_finish();
        }
        completion
    }

    fn run_finish(&self) {
        let finish = {
            let mut state = self.state.lock();
            let finish = state.finish.take();
            state.done = true;
            finish
        };
        if let Some(finish) = finish {
            finish();
        }
        self.cond.notify_all();
    }

    fn complete_one(&self) {
        let finished = {
            let mut state = self.state.lock();
            state.remaining = state.remaining.saturating_sub(1);
            state.remaining == 0 && !state.done
        };
        if finished {
            self.run_finish();
        }
    }

    /// Block until the finish action has run.
    pub(crate) fn wait(&self) {
        let mut state = self.state.lock();
        while !state.done {
            self.cond.wait(&mut state);
        }
    }
}

// =============================================================================
// THE BUS
// =============================================================================

/// Process-wide event dispatcher shared by all contexts of one memory.
pub struct EventBus {
    subs: RwLock<HashMap<u64, Arc<Subscription>>>,
    by_element: RwLock<HashMap<Addr, Vec<u64>>>,
    sender: Mutex<Option<Sender<u64>>>,
    receiver: Receiver<u64>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
    pending: AtomicUsize,
}

impl EventBus {
    pub(crate) fn new() -> Arc<Self> {
        let (sender, receiver) = unbounded();
        Arc::new(Self {
            subs: RwLock::new(HashMap::new()),
            by_element: RwLock::new(HashMap::new()),
            sender: Mutex::new(Some(sender)),
            receiver,
            workers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            pending: AtomicUsize::new(0),
        })
    }

    /// Spawn the delivery worker pool.
    pub(crate) fn start(bus: &Arc<Self>) {
        let mut workers = bus.workers.lock();
        for n in 0..EVENT_WORKERS {
            let bus = Arc::clone(bus);
            let handle = std::thread::Builder::new()
                .name(format!("mnema-events-{n}"))
                .spawn(move || bus.worker_loop());
            match handle {
                Ok(handle) => workers.push(handle),
                Err(e) => tracing::error!("failed to spawn event worker: {e}"),
            }
        }
    }

    /// Drain pending events, close the channel and join the workers.
    pub(crate) fn shutdown(&self) {
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while self.pending.load(Ordering::Acquire) > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        let dropped = self.pending.load(Ordering::Acquire);
        if dropped > 0 {
            tracing::warn!(dropped, "shutting down with undelivered events");
        }
        *self.sender.lock() = None;
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.join();
        }
    }

    // =========================================================================
    // REGISTRATION
    // =========================================================================

    pub(crate) fn subscribe(
        &self,
        kind: EventKind,
        element: Addr,
        mask: TypeMask,
        delegate: Option<Arc<Delegate>>,
    ) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let sub = Arc::new(Subscription {
            id,
            kind,
            element,
            mask,
            delegate: Mutex::new(delegate),
            queue: Mutex::new(SubQueue {
                events: VecDeque::new(),
                scheduled: false,
            }),
        });
        self.subs.write().insert(id, sub);
        self.by_element.write().entry(element).or_default().push(id);
        SubscriptionId(id)
    }

    pub(crate) fn set_delegate(&self, id: SubscriptionId, delegate: Arc<Delegate>) {
        if let Some(sub) = self.subs.read().get(&id.0) {
            *sub.delegate.lock() = Some(delegate);
        }
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) {
        let removed = self.subs.write().remove(&id.0);
        let Some(sub) = removed else { return };
        let mut by_element = self.by_element.write();
        if let Some(ids) = by_element.get_mut(&sub.element) {
            ids.retain(|other| *other != id.0);
            if ids.is_empty() {
                by_element.remove(&sub.element);
            }
        }
        drop(by_element);
        // Undelivered events still count toward erase completions.
        let mut queue = sub.queue.lock();
        while let Some(item) = queue.events.pop_front() {
            if let Some(done) = item.done {
                done.complete_one();
            }
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
        queue.scheduled = false;
    }

    // =========================================================================
    // EMISSION
    // =========================================================================

    /// Match and enqueue events for a freshly created connector.
    pub(crate) fn emit_generate(&self, conn: Connector) {
        let deliveries = self.match_connector(conn, false);
        for (sub, event) in deliveries {
            self.enqueue(&sub, event, None);
        }
    }

    /// Match and enqueue events for an erase cascade. The `finish` action
    /// runs once every matched event has been delivered (immediately when
    /// nothing matched).
    pub(crate) fn emit_erase(
        &self,
        records: &[EraseRecord],
        finish: Box<dyn FnOnce() + Send>,
    ) -> Arc<EraseCompletion> {
        let mut deliveries: Vec<(Arc<Subscription>, Event)> = Vec::new();
        for record in records {
            if record.mask.is_connector() {
                let conn = Connector {
                    addr: record.addr,
                    mask: record.mask,
                    source: record.source,
                    target: record.target,
                };
                deliveries.extend(self.match_connector(conn, true));
            }
            // erase_element goes to subscriptions on the dying element
            // itself, whatever its kind.
            let subs = self.subs.read();
            if let Some(ids) = self.by_element.read().get(&record.addr) {
                for id in ids {
                    let Some(sub) = subs.get(id) else { continue };
                    if sub.kind == EventKind::EraseElement && sub.mask.subsumes(record.mask) {
                        deliveries.push((
                            Arc::clone(sub),
                            Event {
                                kind: EventKind::EraseElement,
                                subscription: record.addr,
                                element: record.addr,
                                element_type: record.mask,
                                source: Addr::EMPTY,
                                target: Addr::EMPTY,
                            },
                        ));
                    }
                }
            }
        }
        let completion = EraseCompletion::new(deliveries.len(), finish);
        for (sub, event) in deliveries {
            self.enqueue(&sub, event, Some(Arc::clone(&completion)));
        }
        completion
    }

    /// Enqueue content-change events for a link.
    pub(crate) fn emit_content_change(&self, link: Addr, link_type: TypeMask) {
        let subs = self.subs.read();
        let by_element = self.by_element.read();
        let Some(ids) = by_element.get(&link) else {
            return;
        };
        let mut deliveries = Vec::new();
        for id in ids {
            let Some(sub) = subs.get(id) else { continue };
            if sub.kind == EventKind::ChangeLinkContent && sub.mask.subsumes(link_type) {
                deliveries.push((
                    Arc::clone(sub),
                    Event {
                        kind: EventKind::ChangeLinkContent,
                        subscription: link,
                        element: link,
                        element_type: link_type,
                        source: Addr::EMPTY,
                        target: Addr::EMPTY,
                    },
                ));
            }
        }
        drop(by_element);
        drop(subs);
        for (sub, event) in deliveries {
            self.enqueue(&sub, event, None);
        }
    }

    /// Direction-aware matching for one connector against the registry.
    fn match_connector(
        &self,
        conn: Connector,
        erase: bool,
    ) -> Vec<(Arc<Subscription>, Event)> {
        let subs = self.subs.read();
        let by_element = self.by_element.read();
        let mut deliveries: Vec<(Arc<Subscription>, Event)> = Vec::new();

        let mut consider = |endpoint: Addr, outgoing_role: bool| {
            let Some(ids) = by_element.get(&endpoint) else {
                return;
            };
            for id in ids {
                let Some(sub) = subs.get(id) else { continue };
                let fired = match (sub.kind, erase) {
                    (EventKind::GenerateOutgoingArc, false)
                    | (EventKind::EraseOutgoingArc, true) => {
                        outgoing_role && conn.mask.is_arc()
                    }
                    (EventKind::GenerateIncomingArc, false)
                    | (EventKind::EraseIncomingArc, true) => {
                        !outgoing_role && conn.mask.is_arc()
                    }
                    (EventKind::GenerateEdge, false) | (EventKind::EraseEdge, true) => {
                        conn.mask.is_common_edge()
                    }
                    (EventKind::GenerateConnector, false)
                    | (EventKind::EraseConnector, true) => true,
                    _ => false,
                };
                if !fired || !sub.mask.subsumes(conn.mask) {
                    continue;
                }
                // A self-loop would match the same subscription from both
                // endpoints with an identical event; deliver once.
                if conn.source == conn.target
                    && deliveries.iter().any(|(existing, _)| existing.id == sub.id)
                {
                    continue;
                }
                deliveries.push((
                    Arc::clone(sub),
                    Event {
                        kind: sub.kind,
                        subscription: endpoint,
                        element: conn.addr,
                        element_type: conn.mask,
                        source: conn.source,
                        target: conn.target,
                    },
                ));
            }
        };

        consider(conn.source, true);
        consider(conn.target, false);
        deliveries
    }

    fn enqueue(&self, sub: &Arc<Subscription>, event: Event, done: Option<Arc<EraseCompletion>>) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        let schedule = {
            let mut queue = sub.queue.lock();
            queue.events.push_back(QueuedEvent { event, done });
            if queue.scheduled {
                false
            } else {
                queue.scheduled = true;
                true
            }
        };
        if schedule {
            let sender = self.sender.lock();
            match sender.as_ref() {
                Some(sender) => {
                    let _ = sender.send(sub.id);
                }
                None => {
                    // Shutdown already closed the channel; drop the event.
                    let mut queue = sub.queue.lock();
                    while let Some(item) = queue.events.pop_front() {
                        if let Some(done) = item.done {
                            done.complete_one();
                        }
                        self.pending.fetch_sub(1, Ordering::AcqRel);
                    }
                    queue.scheduled = false;
                }
            }
        }
    }

    // =========================================================================
    // DELIVERY
    // =========================================================================

    fn worker_loop(&self) {
        IS_BUS_WORKER.with(|flag| flag.set(true));
        while let Ok(id) = self.receiver.recv() {
            let sub = self.subs.read().get(&id).cloned();
            let Some(sub) = sub else { continue };
            loop {
                let item = {
                    let mut queue = sub.queue.lock();
                    match queue.events.pop_front() {
                        Some(item) => item,
                        None => {
                            queue.scheduled = false;
                            break;
                        }
                    }
                };
                let delegate = sub.delegate.lock().clone();
                if let Some(delegate) = delegate {
                    let event = item.event;
                    let outcome = catch_unwind(AssertUnwindSafe(|| delegate(&event)));
                    match outcome {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            tracing::warn!(subscription = sub.id, error = %e, "event delegate failed");
                        }
                        Err(_) => {
                            tracing::warn!(subscription = sub.id, "event delegate panicked");
                        }
                    }
                }
                if let Some(done) = item.done {
                    done.complete_one();
                }
                self.pending.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }
}

// =============================================================================
// SUBSCRIPTION HANDLE
// =============================================================================

/// Owned handle to a registered subscription; dropping it unsubscribes.
pub struct EventSubscription {
    id: SubscriptionId,
    bus: Arc<EventBus>,
}

impl EventSubscription {
    pub(crate) fn new(id: SubscriptionId, bus: Arc<EventBus>) -> Self {
        Self { id, bus }
    }

    /// Id of the underlying subscription.
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub(crate) fn install_delegate(&self, delegate: Arc<Delegate>) {
        self.bus.set_delegate(self.id, delegate);
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

impl std::fmt::Debug for EventSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSubscription")
            .field("id", &self.id)
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn started_bus() -> Arc<EventBus> {
        let bus = EventBus::new();
        EventBus::start(&bus);
        bus
    }

    fn arc_conn(addr: Addr, source: Addr, target: Addr) -> Connector {
        Connector {
            addr,
            mask: TypeMask::ARC_CONST_POS_PERM,
            source,
            target,
        }
    }

    fn wait_until(predicate: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if predicate() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn outgoing_subscription_receives_matching_arc() {
        let bus = started_bus();
        let source = Addr::new(0, 1);
        let target = Addr::new(0, 2);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        bus.subscribe(
            EventKind::GenerateOutgoingArc,
            source,
            TypeMask::ARC_MEMBERSHIP,
            Some(Arc::new(move |event: &Event| {
                assert_eq!(event.kind, EventKind::GenerateOutgoingArc);
                assert_eq!(event.subscription, event.source);
                hits2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
        );

        bus.emit_generate(arc_conn(Addr::new(0, 3), source, target));
        assert!(wait_until(|| hits.load(Ordering::SeqCst) == 1));

        // Arc in the other direction does not match the outgoing class.
        bus.emit_generate(arc_conn(Addr::new(0, 4), target, source));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        bus.shutdown();
    }

    #[test]
    fn mask_mismatch_is_not_delivered() {
        let bus = started_bus();
        let element = Addr::new(0, 1);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        bus.subscribe(
            EventKind::GenerateIncomingArc,
            element,
            TypeMask::ARC_CONST_POS_PERM,
            Some(Arc::new(move |_: &Event| {
                hits2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
        );
        bus.emit_generate(Connector {
            addr: Addr::new(0, 9),
            mask: TypeMask::ARC_COMMON_CONST,
            source: Addr::new(0, 2),
            target: element,
        });
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        bus.shutdown();
    }

    #[test]
    fn per_subscription_delivery_is_fifo() {
        let bus = started_bus();
        let element = Addr::new(0, 1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let order2 = Arc::clone(&order);
        bus.subscribe(
            EventKind::GenerateOutgoingArc,
            element,
            TypeMask::UNKNOWN,
            Some(Arc::new(move |event: &Event| {
                order2.lock().push(event.element.offset);
                Ok(())
            })),
        );
        for n in 10..60 {
            bus.emit_generate(arc_conn(Addr::new(1, n), element, Addr::new(0, 2)));
        }
        assert!(wait_until(|| order.lock().len() == 50));
        let seen = order.lock().clone();
        let expected: Vec<u16> = (10..60).collect();
        assert_eq!(seen, expected);
        bus.shutdown();
    }

    #[test]
    fn erase_completion_runs_after_delivery() {
        let bus = started_bus();
        let element = Addr::new(0, 1);
        let delivered = Arc::new(AtomicUsize::new(0));
        let delivered2 = Arc::clone(&delivered);
        bus.subscribe(
            EventKind::EraseOutgoingArc,
            element,
            TypeMask::UNKNOWN,
            Some(Arc::new(move |_: &Event| {
                delivered2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
        );
        let finished = Arc::new(AtomicUsize::new(0));
        let finished2 = Arc::clone(&finished);
        let records = [EraseRecord {
            addr: Addr::new(0, 5),
            mask: TypeMask::ARC_CONST_POS_PERM,
            source: element,
            target: Addr::new(0, 2),
        }];
        let completion = bus.emit_erase(
            &records,
            Box::new(move || {
                finished2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        completion.wait();
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        bus.shutdown();
    }

    #[test]
    fn erase_with_no_subscribers_finishes_inline() {
        let bus = started_bus();
        let finished = Arc::new(AtomicUsize::new(0));
        let finished2 = Arc::clone(&finished);
        let records = [EraseRecord {
            addr: Addr::new(0, 5),
            mask: TypeMask::NODE_CONST,
            source: Addr::EMPTY,
            target: Addr::EMPTY,
        }];
        let completion = bus.emit_erase(
            &records,
            Box::new(move || {
                finished2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        completion.wait();
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        bus.shutdown();
    }

    #[test]
    fn delegate_errors_do_not_stop_later_deliveries() {
        let bus = started_bus();
        let element = Addr::new(0, 1);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        bus.subscribe(
            EventKind::GenerateOutgoingArc,
            element,
            TypeMask::UNKNOWN,
            Some(Arc::new(move |_: &Event| {
                if hits2.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(MnemaError::InvalidState("first delivery fails".into()));
                }
                Ok(())
            })),
        );
        bus.emit_generate(arc_conn(Addr::new(0, 7), element, Addr::new(0, 2)));
        bus.emit_generate(arc_conn(Addr::new(0, 8), element, Addr::new(0, 2)));
        assert!(wait_until(|| hits.load(Ordering::SeqCst) == 2));
        bus.shutdown();
    }

    #[test]
    fn dropping_the_handle_unsubscribes() {
        let bus = started_bus();
        let element = Addr::new(0, 1);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        let id = bus.subscribe(
            EventKind::GenerateOutgoingArc,
            element,
            TypeMask::UNKNOWN,
            Some(Arc::new(move |_: &Event| {
                hits2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
        );
        drop(EventSubscription::new(id, Arc::clone(&bus)));
        bus.emit_generate(arc_conn(Addr::new(0, 7), element, Addr::new(0, 2)));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        bus.shutdown();
    }
}
