//! # Event Fabric
//!
//! Mutations on the element store produce events; subscriptions receive them
//! on a worker pool. The closed set of event classes lives here, together
//! with the event payload delivered to delegates.
//!
//! Submodules:
//! - [`bus`] — subscription registry, matching, per-subscription FIFO
//!   queues and the worker pool draining them
//! - [`waiter`] — one-shot blocking waits over a subscription

pub mod bus;
pub mod waiter;

pub use bus::{EventBus, EventSubscription, SubscriptionId};
pub use waiter::{ConditionWaiter, EventWaiter};

use crate::types::{Addr, TypeMask};

// =============================================================================
// EVENT CLASSES
// =============================================================================

/// The closed set of event classes a subscription can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A new arc whose source is the subscription element.
    GenerateOutgoingArc,
    /// A new arc whose target is the subscription element.
    GenerateIncomingArc,
    /// A new common edge incident on the subscription element.
    GenerateEdge,
    /// Union of the three generate classes, any connector kind.
    GenerateConnector,
    /// Mirror of generate, fired before the connector is unlinked.
    EraseOutgoingArc,
    EraseIncomingArc,
    EraseEdge,
    EraseConnector,
    /// Fired for every element of an erase cascade, before unlinking.
    EraseElement,
    /// Fired after link content is successfully replaced.
    ChangeLinkContent,
}

impl EventKind {
    /// Every event class, in declaration order.
    pub const ALL: [Self; 10] = [
        Self::GenerateOutgoingArc,
        Self::GenerateIncomingArc,
        Self::GenerateEdge,
        Self::GenerateConnector,
        Self::EraseOutgoingArc,
        Self::EraseIncomingArc,
        Self::EraseEdge,
        Self::EraseConnector,
        Self::EraseElement,
        Self::ChangeLinkContent,
    ];

    /// The system identifier under which this class is published as a
    /// keynode.
    #[must_use]
    pub const fn system_identifier(self) -> &'static str {
        match self {
            Self::GenerateOutgoingArc => "event_generate_outgoing_arc",
            Self::GenerateIncomingArc => "event_generate_incoming_arc",
            Self::GenerateEdge => "event_generate_edge",
            Self::GenerateConnector => "event_generate_connector",
            Self::EraseOutgoingArc => "event_erase_outgoing_arc",
            Self::EraseIncomingArc => "event_erase_incoming_arc",
            Self::EraseEdge => "event_erase_edge",
            Self::EraseConnector => "event_erase_connector",
            Self::EraseElement => "event_erase_element",
            Self::ChangeLinkContent => "event_change_link_content",
        }
    }
}

// =============================================================================
// EVENT PAYLOAD
// =============================================================================

/// The payload delivered to a subscription delegate.
///
/// For connector events, `element` is the connector and `source`/`target`
/// its endpoints (symmetric for common edges). For [`EventKind::EraseElement`]
/// it is the dying element, and for [`EventKind::ChangeLinkContent`] the
/// link whose content changed; endpoints are empty in those cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    /// The class of the subscription this event was matched against.
    pub kind: EventKind,
    /// The subscription element the event was delivered for.
    pub subscription: Addr,
    /// The element the event describes.
    pub element: Addr,
    /// Type of `element` at the time the event fired.
    pub element_type: TypeMask,
    /// Source endpoint, when `element` is a connector.
    pub source: Addr,
    /// Target endpoint, when `element` is a connector.
    pub target: Addr,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_class_has_a_distinct_identifier() {
        let mut seen = std::collections::HashSet::new();
        for kind in EventKind::ALL {
            assert!(seen.insert(kind.system_identifier()));
        }
    }
}
