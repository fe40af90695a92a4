//! # Keynodes
//!
//! Well-known elements resolved by system identifier at startup. A keynode
//! is an ordinary element; resolution creates it when the identifier is
//! unbound or points at an element that is no longer live (identifiers
//! survive restarts in the string index, element addrs do not).

use crate::events::EventKind;
use crate::index::FsIndex;
use crate::store::Store;
use crate::types::{Addr, MnemaError, TypeMask};

/// The well-known keynode set of one memory instance.
#[derive(Debug, Clone)]
pub struct Keynodes {
    /// Marks actions completed successfully.
    pub question_finished_successfully: Addr,
    /// Marks actions completed without a result.
    pub question_finished_unsuccessfully: Addr,
    /// Marks actions that failed with an error.
    pub question_finished_with_error: Addr,
    /// Structure recording agent/action edges.
    pub agents_set: Addr,
    /// One class node per event class, in [`EventKind::ALL`] order.
    event_classes: [(EventKind, Addr); 10],
}

fn resolve_or_create(
    store: &Store,
    index: &FsIndex,
    identifier: &str,
    mask: TypeMask,
) -> Result<Addr, MnemaError> {
    if let Some(addr) = index.resolve_system_identifier(identifier) {
        if store.is_element(addr) {
            return Ok(addr);
        }
    }
    let addr = store.create_node(mask)?;
    index.set_system_identifier(addr, identifier)?;
    Ok(addr)
}

impl Keynodes {
    pub(crate) fn initialize(store: &Store, index: &FsIndex) -> Result<Self, MnemaError> {
        let class = TypeMask::NODE_CONST_CLASS;
        let mut event_classes = [(EventKind::EraseElement, Addr::EMPTY); 10];
        for (slot, kind) in event_classes.iter_mut().zip(EventKind::ALL) {
            *slot = (
                kind,
                resolve_or_create(store, index, kind.system_identifier(), class)?,
            );
        }
        Ok(Self {
            question_finished_successfully: resolve_or_create(
                store,
                index,
                "question_finished_successfully",
                class,
            )?,
            question_finished_unsuccessfully: resolve_or_create(
                store,
                index,
                "question_finished_unsuccessfully",
                class,
            )?,
            question_finished_with_error: resolve_or_create(
                store,
                index,
                "question_finished_with_error",
                class,
            )?,
            agents_set: resolve_or_create(store, index, "agents_set", TypeMask::NODE_CONST_STRUCT)?,
            event_classes,
        })
    }

    /// The keynode publishing an event class as a graph element.
    #[must_use]
    pub fn event_class(&self, kind: EventKind) -> Addr {
        self.event_classes
            .iter()
            .find(|(candidate, _)| *candidate == kind)
            .map(|(_, addr)| *addr)
            .unwrap_or(Addr::EMPTY)
    }

    /// Reverse lookup: the event class a keynode stands for.
    #[must_use]
    pub fn event_kind_of(&self, addr: Addr) -> Option<EventKind> {
        self.event_classes
            .iter()
            .find(|(_, candidate)| *candidate == addr)
            .map(|(kind, _)| *kind)
    }
}
