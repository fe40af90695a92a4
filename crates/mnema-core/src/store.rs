//! # Element Store
//!
//! Segmented slot storage for typed graph elements with intrusive incidence
//! lists.
//!
//! Elements live in segmented arrays indexed by `(segment, offset)`.
//! Allocation takes the lowest free slot of the existing segments and appends
//! a new segment when they are full. Erased slots are quarantined for the
//! rest of the run so an addr is never reused; their generation counter is
//! bumped so stale identifiers are detectable.
//!
//! Each connector slot embeds `next_out`/`prev_out` (threaded through its
//! source's outgoing list) and `next_in`/`prev_in` (threaded through its
//! target's incoming list). A common edge additionally enumerates in the
//! outgoing list of its target endpoint.
//!
//! Erasure is two-phase: [`Store::begin_erase`] collects the cascade set and
//! tombstones it (still readable, lists still walkable, so erase-event
//! delegates can inspect the dying elements), and [`Store::finish_erase`]
//! unlinks and retires the slots.

use crate::types::{Addr, MnemaError, TypeMask};
use parking_lot::RwLock;
use std::collections::HashSet;

/// Slots per segment. The offset half of an [`Addr`] is 16 bits, so a
/// segment may never exceed 65536 slots.
const SEGMENT_CAPACITY: usize = 4096;

// =============================================================================
// SLOTS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// Fully materialized element.
    Live,
    /// Collected for erasure; still readable until erase events are
    /// delivered.
    Tombstone,
    /// Erased. The slot is never reallocated within this run.
    Retired,
}

#[derive(Debug, Clone)]
struct Slot {
    state: SlotState,
    mask: TypeMask,
    generation: u32,
    source: Addr,
    target: Addr,
    first_out: Addr,
    first_in: Addr,
    next_out: Addr,
    prev_out: Addr,
    next_in: Addr,
    prev_in: Addr,
}

impl Slot {
    fn new(mask: TypeMask, generation: u32) -> Self {
        Self {
            state: SlotState::Live,
            mask,
            generation,
            source: Addr::EMPTY,
            target: Addr::EMPTY,
            first_out: Addr::EMPTY,
            first_in: Addr::EMPTY,
            next_out: Addr::EMPTY,
            prev_out: Addr::EMPTY,
            next_in: Addr::EMPTY,
            prev_in: Addr::EMPTY,
        }
    }

    fn is_readable(&self) -> bool {
        matches!(self.state, SlotState::Live | SlotState::Tombstone)
    }
}

// =============================================================================
// PUBLIC VIEWS
// =============================================================================

/// A read-only view of a connector yielded by incidence enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connector {
    /// Addr of the connector element itself.
    pub addr: Addr,
    /// Full type of the connector.
    pub mask: TypeMask,
    /// Source endpoint (first endpoint for common edges).
    pub source: Addr,
    /// Target endpoint (second endpoint for common edges).
    pub target: Addr,
}

/// One element of an erase cascade, captured before unlinking so that erase
/// events can still describe it.
#[derive(Debug, Clone, Copy)]
pub struct EraseRecord {
    pub addr: Addr,
    pub mask: TypeMask,
    pub source: Addr,
    pub target: Addr,
}

/// Aggregate element counts, used by the status surfaces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub nodes: usize,
    pub links: usize,
    pub connectors: usize,
    pub erased: usize,
}

// =============================================================================
// STORE
// =============================================================================

struct StoreInner {
    segments: Vec<Vec<Slot>>,
}

/// The shared element store. All access goes through a reader/writer lock;
/// mutations are serialized, reads may proceed concurrently.
pub struct Store {
    inner: RwLock<StoreInner>,
}

impl Store {
    pub(crate) fn new() -> Self {
        // Slot (0, 0) is permanently reserved so that Addr::EMPTY never
        // refers to an element.
        let mut first = Vec::with_capacity(SEGMENT_CAPACITY);
        let mut reserved = Slot::new(TypeMask::UNKNOWN, 0);
        reserved.state = SlotState::Retired;
        first.push(reserved);
        Self {
            inner: RwLock::new(StoreInner {
                segments: vec![first],
            }),
        }
    }

    // =========================================================================
    // CREATION
    // =========================================================================

    pub(crate) fn create_node(&self, mask: TypeMask) -> Result<Addr, MnemaError> {
        if !mask.is_valid() || !mask.is_node() || mask.is_link() || mask.is_connector() {
            return Err(MnemaError::InvalidParams(format!(
                "{mask} is not a node type"
            )));
        }
        let mut inner = self.inner.write();
        inner.allocate(mask)
    }

    pub(crate) fn create_link(&self, mask: TypeMask) -> Result<Addr, MnemaError> {
        if !mask.is_valid() || !mask.is_link() || mask.is_connector() {
            return Err(MnemaError::InvalidParams(format!(
                "{mask} is not a link type"
            )));
        }
        let mut inner = self.inner.write();
        inner.allocate(mask)
    }

    pub(crate) fn create_connector(
        &self,
        mask: TypeMask,
        source: Addr,
        target: Addr,
    ) -> Result<Addr, MnemaError> {
        if !mask.is_valid() || !mask.is_connector() || !mask.is_fully_specified_arc() {
            return Err(MnemaError::InvalidParams(format!(
                "{mask} is not a connector type"
            )));
        }
        let mut inner = self.inner.write();
        if !inner.is_readable(source) {
            return Err(MnemaError::ElementNotFound(source));
        }
        if !inner.is_readable(target) {
            return Err(MnemaError::ElementNotFound(target));
        }
        let addr = inner.allocate(mask)?;
        inner.slot_mut(addr).source = source;
        inner.slot_mut(addr).target = target;

        // Head insertion into the source's outgoing list.
        let old_out = inner.slot(source).first_out;
        inner.slot_mut(addr).next_out = old_out;
        if old_out.is_valid() {
            inner.slot_mut(old_out).prev_out = addr;
        }
        inner.slot_mut(source).first_out = addr;

        // Head insertion into the target's incoming list.
        let old_in = inner.slot(target).first_in;
        inner.slot_mut(addr).next_in = old_in;
        if old_in.is_valid() {
            inner.slot_mut(old_in).prev_in = addr;
        }
        inner.slot_mut(target).first_in = addr;

        Ok(addr)
    }

    // =========================================================================
    // READING
    // =========================================================================

    /// An element is live from creation until the final phase of its erase.
    pub(crate) fn is_element(&self, addr: Addr) -> bool {
        if !addr.is_valid() {
            return false;
        }
        self.inner.read().is_readable(addr)
    }

    pub(crate) fn get_type(&self, addr: Addr) -> Result<TypeMask, MnemaError> {
        let inner = self.inner.read();
        if !inner.is_readable(addr) {
            return Err(MnemaError::ElementNotFound(addr));
        }
        Ok(inner.slot(addr).mask)
    }

    /// Endpoints of a connector.
    pub(crate) fn connector_endpoints(&self, addr: Addr) -> Result<(Addr, Addr), MnemaError> {
        let inner = self.inner.read();
        if !inner.is_readable(addr) {
            return Err(MnemaError::ElementNotFound(addr));
        }
        let slot = inner.slot(addr);
        if !slot.mask.is_connector() {
            return Err(MnemaError::InvalidParams(format!(
                "element {addr} has no endpoints"
            )));
        }
        Ok((slot.source, slot.target))
    }

    /// Find a connector of type `⊑ mask` between two elements, if one
    /// exists. Common edges match in either orientation.
    pub(crate) fn connector_between(
        &self,
        source: Addr,
        target: Addr,
        mask: TypeMask,
    ) -> Option<Addr> {
        for conn in self.iter_outgoing(source, mask).ok()? {
            if conn.target == target || (conn.mask.is_common_edge() && conn.source == target) {
                return Some(conn.addr);
            }
        }
        None
    }

    pub(crate) fn stats(&self) -> StoreStats {
        let inner = self.inner.read();
        let mut stats = StoreStats::default();
        for segment in &inner.segments {
            for slot in segment {
                match slot.state {
                    SlotState::Live | SlotState::Tombstone => {
                        if slot.mask.is_link() {
                            stats.links += 1;
                        } else if slot.mask.is_node() {
                            stats.nodes += 1;
                        } else if slot.mask.is_connector() {
                            stats.connectors += 1;
                        }
                    }
                    SlotState::Retired => stats.erased += 1,
                }
            }
        }
        // The reserved (0, 0) slot is not an erased element.
        stats.erased = stats.erased.saturating_sub(1);
        stats
    }

    // =========================================================================
    // INCIDENCE ENUMERATION
    // =========================================================================

    /// Enumerate connectors leaving `owner`: every connector whose source is
    /// `owner`, plus common edges whose second endpoint is `owner`.
    pub(crate) fn iter_outgoing(
        &self,
        owner: Addr,
        mask: TypeMask,
    ) -> Result<ConnectorIter<'_>, MnemaError> {
        self.iter_incidence(owner, mask, Direction::Outgoing)
    }

    /// Enumerate connectors arriving at `owner`.
    pub(crate) fn iter_incoming(
        &self,
        owner: Addr,
        mask: TypeMask,
    ) -> Result<ConnectorIter<'_>, MnemaError> {
        self.iter_incidence(owner, mask, Direction::Incoming)
    }

    fn iter_incidence(
        &self,
        owner: Addr,
        mask: TypeMask,
        direction: Direction,
    ) -> Result<ConnectorIter<'_>, MnemaError> {
        let inner = self.inner.read();
        if !inner.is_readable(owner) {
            return Err(MnemaError::ElementNotFound(owner));
        }
        let (cursor, phase) = match direction {
            Direction::Outgoing => (inner.slot(owner).first_out, IterPhase::OutChain),
            Direction::Incoming => (inner.slot(owner).first_in, IterPhase::InChain),
        };
        drop(inner);
        Ok(ConnectorIter {
            store: self,
            owner,
            mask,
            direction,
            cursor,
            phase,
        })
    }

    // =========================================================================
    // TWO-PHASE ERASE
    // =========================================================================

    /// Phase one: collect the cascade set by BFS over incidence lists and
    /// tombstone it.
    ///
    /// The set is `{addr}` plus all connectors incident on any member, plus
    /// the incident connectors of every structure node containing a member.
    /// Tombstoned elements stay readable until [`Store::finish_erase`].
    pub(crate) fn begin_erase(&self, addr: Addr) -> Result<Vec<EraseRecord>, MnemaError> {
        let mut inner = self.inner.write();
        if !inner.is_readable(addr) {
            return Err(MnemaError::ElementNotFound(addr));
        }

        let mut seen: HashSet<Addr> = HashSet::new();
        let mut queue: Vec<Addr> = Vec::new();
        let mut records: Vec<EraseRecord> = Vec::new();

        seen.insert(addr);
        queue.push(addr);
        let mut head = 0;
        while head < queue.len() {
            let current = queue[head];
            head += 1;
            let slot = inner.slot(current);
            records.push(EraseRecord {
                addr: current,
                mask: slot.mask,
                source: slot.source,
                target: slot.target,
            });

            // All connectors incident on the current element.
            let mut incident: Vec<Addr> = Vec::new();
            inner.collect_incident(current, &mut incident);

            // Incident connectors of every structure containing the current
            // element.
            let mut cursor = inner.slot(current).first_in;
            while cursor.is_valid() {
                let arc = inner.slot(cursor);
                let (holder, next) = (arc.source, arc.next_in);
                if arc.mask.is_membership_arc()
                    && inner.is_readable(holder)
                    && TypeMask::NODE_STRUCT.subsumes(inner.slot(holder).mask)
                {
                    inner.collect_incident(holder, &mut incident);
                }
                cursor = next;
            }

            for candidate in incident {
                if seen.insert(candidate) {
                    queue.push(candidate);
                }
            }
        }

        for record in &records {
            inner.slot_mut(record.addr).state = SlotState::Tombstone;
        }
        Ok(records)
    }

    /// Phase two: unlink the cascade set from all incidence lists and retire
    /// the slots.
    pub(crate) fn finish_erase(&self, records: &[EraseRecord]) {
        let mut inner = self.inner.write();
        for record in records {
            let addr = record.addr;
            if inner.slot(addr).state != SlotState::Tombstone {
                continue;
            }
            if record.mask.is_connector() {
                inner.unlink_connector(addr);
            }
            let slot = inner.slot_mut(addr);
            slot.state = SlotState::Retired;
            slot.generation = slot.generation.wrapping_add(1);
            let generation = slot.generation;
            slot.mask = TypeMask::UNKNOWN;
            slot.source = Addr::EMPTY;
            slot.target = Addr::EMPTY;
            slot.first_out = Addr::EMPTY;
            slot.first_in = Addr::EMPTY;
            tracing::trace!(addr = %addr, generation, "slot retired");
        }
    }
}

impl StoreInner {
    fn allocate(&mut self, mask: TypeMask) -> Result<Addr, MnemaError> {
        let need_segment = self
            .segments
            .last()
            .is_none_or(|seg| seg.len() >= SEGMENT_CAPACITY);
        if need_segment {
            if self.segments.len() > u16::MAX as usize {
                return Err(MnemaError::InvalidState("element storage exhausted".into()));
            }
            self.segments.push(Vec::with_capacity(SEGMENT_CAPACITY));
        }
        let segment = self.segments.len() - 1;
        let offset = self.segments[segment].len();
        self.segments[segment].push(Slot::new(mask, 0));
        Ok(Addr::new(segment as u16, offset as u16))
    }

    fn slot(&self, addr: Addr) -> &Slot {
        &self.segments[addr.segment as usize][addr.offset as usize]
    }

    fn slot_mut(&mut self, addr: Addr) -> &mut Slot {
        &mut self.segments[addr.segment as usize][addr.offset as usize]
    }

    fn contains(&self, addr: Addr) -> bool {
        (addr.segment as usize) < self.segments.len()
            && (addr.offset as usize) < self.segments[addr.segment as usize].len()
    }

    fn is_readable(&self, addr: Addr) -> bool {
        addr.is_valid() && self.contains(addr) && self.slot(addr).is_readable()
    }

    /// Push every connector threaded through either incidence list of
    /// `element` onto `out`.
    fn collect_incident(&self, element: Addr, out: &mut Vec<Addr>) {
        let mut cursor = self.slot(element).first_out;
        while cursor.is_valid() {
            out.push(cursor);
            cursor = self.slot(cursor).next_out;
        }
        cursor = self.slot(element).first_in;
        while cursor.is_valid() {
            out.push(cursor);
            cursor = self.slot(cursor).next_in;
        }
    }

    fn unlink_connector(&mut self, addr: Addr) {
        let (source, target, next_out, prev_out, next_in, prev_in) = {
            let slot = self.slot(addr);
            (
                slot.source,
                slot.target,
                slot.next_out,
                slot.prev_out,
                slot.next_in,
                slot.prev_in,
            )
        };

        // Outgoing list of the source.
        if prev_out.is_valid() {
            self.slot_mut(prev_out).next_out = next_out;
        } else if source.is_valid() && self.contains(source) && self.slot(source).first_out == addr
        {
            self.slot_mut(source).first_out = next_out;
        }
        if next_out.is_valid() {
            self.slot_mut(next_out).prev_out = prev_out;
        }

        // Incoming list of the target.
        if prev_in.is_valid() {
            self.slot_mut(prev_in).next_in = next_in;
        } else if target.is_valid() && self.contains(target) && self.slot(target).first_in == addr {
            self.slot_mut(target).first_in = next_in;
        }
        if next_in.is_valid() {
            self.slot_mut(next_in).prev_in = prev_in;
        }
    }
}

// =============================================================================
// INCIDENCE ITERATOR
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IterPhase {
    /// Walking the owner's outgoing chain.
    OutChain,
    /// Walking the owner's incoming chain.
    InChain,
    Done,
}

/// Iterator over one incidence list of an element, optionally filtered by a
/// type mask.
///
/// The iterator re-acquires the store read lock at each step: every yielded
/// connector is a consistent snapshot, but the walk may interleave with
/// mutations that extend or truncate the tail of the list.
pub struct ConnectorIter<'a> {
    store: &'a Store,
    owner: Addr,
    mask: TypeMask,
    direction: Direction,
    cursor: Addr,
    phase: IterPhase,
}

impl Iterator for ConnectorIter<'_> {
    type Item = Connector;

    fn next(&mut self) -> Option<Self::Item> {
        let inner = self.store.inner.read();
        loop {
            if !self.cursor.is_valid() {
                match (self.direction, self.phase) {
                    // Outgoing enumeration also reports common edges whose
                    // second endpoint is the owner.
                    (Direction::Outgoing, IterPhase::OutChain) => {
                        self.phase = IterPhase::InChain;
                        if !inner.is_readable(self.owner) {
                            self.phase = IterPhase::Done;
                            return None;
                        }
                        self.cursor = inner.slot(self.owner).first_in;
                        continue;
                    }
                    _ => {
                        self.phase = IterPhase::Done;
                        return None;
                    }
                }
            }
            if self.phase == IterPhase::Done {
                return None;
            }
            if !inner.contains(self.cursor) || !inner.slot(self.cursor).is_readable() {
                // The chain was truncated under us; stop cleanly.
                self.phase = IterPhase::Done;
                return None;
            }
            let slot = inner.slot(self.cursor);
            let item = Connector {
                addr: self.cursor,
                mask: slot.mask,
                source: slot.source,
                target: slot.target,
            };
            let in_second_phase =
                self.direction == Direction::Outgoing && self.phase == IterPhase::InChain;
            self.cursor = if self.phase == IterPhase::OutChain {
                slot.next_out
            } else {
                slot.next_in
            };
            if in_second_phase && !item.mask.is_common_edge() {
                continue;
            }
            if self.mask.subsumes(item.mask) {
                return Some(item);
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
