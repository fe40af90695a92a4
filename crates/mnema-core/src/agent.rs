//! # Agent Runtime
//!
//! Agents are long-lived subscribers bound to keynodes. A plain [`Agent`]
//! receives every matching event; an [`ActionAgent`] treats the event as
//! an action-start signal: the runtime runs the agent, marks the action
//! element with the matching `question_finished_*` keynode, and records the
//! agent/action edge in the agents-set structure.
//!
//! Registration is keyed by agent name and idempotent, as is
//! unregistration. One registration may bind an agent to several keynodes
//! (a union subscription).

use crate::context::MemoryContext;
use crate::events::{Event, EventKind, EventSubscription};
use crate::memory::Memory;
use crate::types::{Addr, MnemaError, TypeMask};
use std::sync::{Arc, Weak};

// =============================================================================
// ACTION STATUS
// =============================================================================

/// Outcome of an action agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStatus {
    /// The action completed and produced its result.
    Success,
    /// The action completed without a result.
    Unsuccess,
    /// The action failed.
    Error,
}

// =============================================================================
// AGENT TRAITS
// =============================================================================

/// A long-lived subscriber bound to its keynodes for the event class it
/// declares.
pub trait Agent: Send + Sync + 'static {
    /// Stable registry name of this agent.
    fn name(&self) -> &'static str;

    /// Event class the runtime subscribes this agent to on each keynode.
    /// Defaults to incoming arcs, the common action-initiation signal;
    /// agents watching erasure or link content override this.
    fn event_kind(&self) -> EventKind {
        EventKind::GenerateIncomingArc
    }

    /// Type filter applied to matching connectors. Agents for classes
    /// without a connector (element erase, content change) return
    /// [`TypeMask::UNKNOWN`].
    fn event_mask(&self) -> TypeMask {
        TypeMask::ARC_CONST_POS_PERM
    }

    /// Called for each matching event, on a bus worker thread. `ctx` is a
    /// fresh context owned by the runtime, not the registering one.
    fn on_event(&self, ctx: &MemoryContext, event: &Event) -> Result<(), MnemaError>;
}

/// An agent driven by action elements: an outgoing arc from one of its
/// keynodes to an action element starts a run.
pub trait ActionAgent: Send + Sync + 'static {
    /// Stable registry name of this agent.
    fn name(&self) -> &'static str;

    /// Perform the action. The returned status decides which completion
    /// keynode the runtime attaches to `action`.
    fn run(&self, ctx: &MemoryContext, action: Addr) -> ActionStatus;

    /// Called after the runtime marked `action` as finished successfully.
    fn on_success(&self, _ctx: &MemoryContext, _action: Addr) {}

    /// Called after the runtime marked `action` as finished without result.
    fn on_unsuccess(&self, _ctx: &MemoryContext, _action: Addr) {}

    /// Called after the runtime marked `action` as failed.
    fn on_error(&self, _ctx: &MemoryContext, _action: Addr) {}
}

// =============================================================================
// REGISTRATION
// =============================================================================

fn validate_keynodes(
    memory: &Memory,
    kind: EventKind,
    keynodes: &[Addr],
) -> Result<(), MnemaError> {
    if keynodes.is_empty() {
        return Err(MnemaError::InvalidParams(
            "an agent needs at least one keynode".to_string(),
        ));
    }
    for keynode in keynodes {
        let keynode_type = memory
            .store()
            .get_type(*keynode)
            .map_err(|_| MnemaError::ElementNotFound(*keynode))?;
        if kind == EventKind::ChangeLinkContent && !keynode_type.is_link() {
            return Err(MnemaError::InvalidParams(format!(
                "content events require a link keynode, {keynode} is {keynode_type}"
            )));
        }
    }
    Ok(())
}

/// Attach the completion keynode to an action and record the agent/action
/// edge in the agents-set structure.
fn finish_action(
    memory: &Arc<Memory>,
    ctx: &MemoryContext,
    keynode: Addr,
    action: Addr,
    status: ActionStatus,
) -> Result<(), MnemaError> {
    let kn = memory.keynodes();
    let (status_node, status_arc) = match status {
        ActionStatus::Success => (kn.question_finished_successfully, TypeMask::ARC_CONST_POS_PERM),
        ActionStatus::Unsuccess => {
            (kn.question_finished_unsuccessfully, TypeMask::ARC_CONST_POS_PERM)
        }
        ActionStatus::Error => (kn.question_finished_with_error, TypeMask::ARC_CONST_FUZ_PERM),
    };
    ctx.create_connector(status_arc, status_node, action)?;

    let edge = ctx.create_connector(TypeMask::EDGE_COMMON_CONST, keynode, action)?;
    ctx.create_connector(TypeMask::ARC_CONST_POS_PERM, kn.agents_set, edge)?;
    Ok(())
}

impl Memory {
    /// Register a plain agent on one or more keynodes, subscribing each for
    /// the event class and mask the agent declares. Idempotent by agent
    /// name.
    pub fn register_agent(
        self: &Arc<Self>,
        agent: Arc<dyn Agent>,
        keynodes: &[Addr],
    ) -> Result<(), MnemaError> {
        let kind = agent.event_kind();
        let mask = agent.event_mask();
        if !mask.is_valid() {
            return Err(MnemaError::InvalidParams(format!(
                "malformed type mask {mask}"
            )));
        }
        validate_keynodes(self, kind, keynodes)?;
        let mut agents = self.agents().lock();
        if agents.contains_key(agent.name()) {
            return Ok(());
        }
        let mut subscriptions = Vec::with_capacity(keynodes.len());
        for keynode in keynodes {
            let weak: Weak<Memory> = Arc::downgrade(self);
            let agent = Arc::clone(&agent);
            let id = self.bus().subscribe(
                kind,
                *keynode,
                mask,
                Some(Arc::new(move |event: &Event| {
                    let Some(memory) = weak.upgrade() else {
                        return Ok(());
                    };
                    let ctx = memory.context();
                    agent.on_event(&ctx, event)
                })),
            );
            subscriptions.push(EventSubscription::new(id, Arc::clone(self.bus())));
        }
        tracing::info!(agent = agent.name(), ?kind, keynodes = keynodes.len(), "agent registered");
        agents.insert(agent.name().to_string(), subscriptions);
        Ok(())
    }

    /// Register an action agent: outgoing positive-permanent arcs from its
    /// keynodes start runs. Idempotent by agent name.
    pub fn register_action_agent(
        self: &Arc<Self>,
        agent: Arc<dyn ActionAgent>,
        keynodes: &[Addr],
    ) -> Result<(), MnemaError> {
        validate_keynodes(self, EventKind::GenerateOutgoingArc, keynodes)?;
        let mut agents = self.agents().lock();
        if agents.contains_key(agent.name()) {
            return Ok(());
        }
        let mut subscriptions = Vec::with_capacity(keynodes.len());
        for keynode in keynodes {
            let weak: Weak<Memory> = Arc::downgrade(self);
            let agent = Arc::clone(&agent);
            let id = self.bus().subscribe(
                EventKind::GenerateOutgoingArc,
                *keynode,
                TypeMask::ARC_CONST_POS_PERM,
                Some(Arc::new(move |event: &Event| {
                    let Some(memory) = weak.upgrade() else {
                        return Ok(());
                    };
                    let ctx = memory.context();
                    let action = event.target;
                    let status = agent.run(&ctx, action);
                    finish_action(&memory, &ctx, event.subscription, action, status)?;
                    match status {
                        ActionStatus::Success => agent.on_success(&ctx, action),
                        ActionStatus::Unsuccess => agent.on_unsuccess(&ctx, action),
                        ActionStatus::Error => agent.on_error(&ctx, action),
                    }
                    Ok(())
                })),
            );
            subscriptions.push(EventSubscription::new(id, Arc::clone(self.bus())));
        }
        tracing::info!(agent = agent.name(), keynodes = keynodes.len(), "action agent registered");
        agents.insert(agent.name().to_string(), subscriptions);
        Ok(())
    }

    /// Drop an agent's subscriptions. Unknown names are a no-op.
    pub fn unregister_agent(&self, name: &str) {
        if self.agents().lock().remove(name).is_some() {
            tracing::info!(agent = name, "agent unregistered");
        }
    }
}
