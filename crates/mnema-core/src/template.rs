//! # Pattern Matcher
//!
//! Template-based subgraph search and generation. A template is a set of
//! triples `(source, connector, target)` and quintuples
//! `(source, connector, target, attribute-arc, attribute)` over named
//! variables; search enumerates every assignment of variables to live
//! elements, generation materializes the missing ones.
//!
//! The search pivots on constraints with a resolved endpoint (a known addr
//! or an already-bound variable, preferring constraints whose pivot has the
//! smaller incidence list) and walks that element's incidence lists.

use crate::context::MemoryContext;
use crate::store::Connector;
use crate::types::{Addr, MnemaError, TypeMask};
use std::collections::{HashMap, HashSet};

// =============================================================================
// TEMPLATE STRUCTURE
// =============================================================================

/// One slot of a template constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateArg {
    /// A fixed element.
    Known(Addr),
    /// Any element of a matching type; anonymous.
    Typed(TypeMask),
    /// A named variable, unconstrained in type.
    Var(String),
    /// A named variable constrained by a type mask.
    TypedVar(TypeMask, String),
}

impl TemplateArg {
    fn name(&self) -> Option<&str> {
        match self {
            Self::Var(name) | Self::TypedVar(_, name) => Some(name),
            _ => None,
        }
    }

    fn mask(&self) -> TypeMask {
        match self {
            Self::Typed(mask) | Self::TypedVar(mask, _) => *mask,
            _ => TypeMask::UNKNOWN,
        }
    }
}

impl From<Addr> for TemplateArg {
    fn from(addr: Addr) -> Self {
        Self::Known(addr)
    }
}

impl From<TypeMask> for TemplateArg {
    fn from(mask: TypeMask) -> Self {
        Self::Typed(mask)
    }
}

impl From<&str> for TemplateArg {
    fn from(name: &str) -> Self {
        Self::Var(name.to_string())
    }
}

impl From<(TypeMask, &str)> for TemplateArg {
    fn from((mask, name): (TypeMask, &str)) -> Self {
        Self::TypedVar(mask, name.to_string())
    }
}

#[derive(Debug, Clone)]
struct Constraint {
    source: TemplateArg,
    connector: TemplateArg,
    target: TemplateArg,
}

/// A subgraph pattern.
#[derive(Debug, Clone, Default)]
pub struct Template {
    constraints: Vec<Constraint>,
}

impl Template {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a triple constraint.
    pub fn triple(
        &mut self,
        source: impl Into<TemplateArg>,
        connector: impl Into<TemplateArg>,
        target: impl Into<TemplateArg>,
    ) -> &mut Self {
        self.constraints.push(Constraint {
            source: source.into(),
            connector: connector.into(),
            target: target.into(),
        });
        self
    }

    /// Add a quintuple: a triple plus an attribute arc from `attribute` to
    /// the triple's connector.
    pub fn quintuple(
        &mut self,
        source: impl Into<TemplateArg>,
        connector: impl Into<TemplateArg>,
        target: impl Into<TemplateArg>,
        attribute_arc: impl Into<TemplateArg>,
        attribute: impl Into<TemplateArg>,
    ) -> &mut Self {
        let connector = match connector.into() {
            // The attribute triple must be able to refer to the connector.
            TemplateArg::Typed(mask) => {
                TemplateArg::TypedVar(mask, format!("__connector_{}", self.constraints.len()))
            }
            other => other,
        };
        let attribute_target = match &connector {
            TemplateArg::Known(addr) => TemplateArg::Known(*addr),
            named => TemplateArg::Var(named.name().unwrap_or_default().to_string()),
        };
        self.triple(source, connector, target);
        self.triple(attribute, attribute_arc, attribute_target);
        self
    }
}

// =============================================================================
// BINDINGS
// =============================================================================

/// Assignment of template variables to element addrs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Binding {
    values: HashMap<String, Addr>,
}

impl Binding {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style bind.
    #[must_use]
    pub fn with(mut self, name: &str, addr: Addr) -> Self {
        self.values.insert(name.to_string(), addr);
        self
    }

    pub fn set(&mut self, name: &str, addr: Addr) {
        self.values.insert(name.to_string(), addr);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Addr> {
        self.values.get(name).copied()
    }

    fn canonical(&self) -> Vec<(String, Addr)> {
        let mut entries: Vec<_> = self
            .values
            .iter()
            .map(|(name, addr)| (name.clone(), *addr))
            .collect();
        entries.sort();
        entries
    }
}

// =============================================================================
// SEARCH
// =============================================================================

fn resolved(arg: &TemplateArg, binding: &Binding) -> Option<Addr> {
    match arg {
        TemplateArg::Known(addr) => Some(*addr),
        TemplateArg::Var(name) | TemplateArg::TypedVar(_, name) => binding.get(name),
        TemplateArg::Typed(_) => None,
    }
}

/// Try to match `arg` against a concrete element, extending the binding.
fn try_bind(arg: &TemplateArg, addr: Addr, element_type: TypeMask, binding: &mut Binding) -> bool {
    match arg {
        TemplateArg::Known(known) => *known == addr,
        TemplateArg::Typed(mask) => mask.subsumes(element_type),
        TemplateArg::Var(name) => match binding.get(name) {
            Some(bound) => bound == addr,
            None => {
                binding.set(name, addr);
                true
            }
        },
        TemplateArg::TypedVar(mask, name) => {
            if !mask.subsumes(element_type) {
                return false;
            }
            match binding.get(name) {
                Some(bound) => bound == addr,
                None => {
                    binding.set(name, addr);
                    true
                }
            }
        }
    }
}

/// Candidate connectors around a pivot element, deduplicated.
fn candidates_around(
    ctx: &MemoryContext,
    pivot: Addr,
    mask: TypeMask,
) -> Result<Vec<Connector>, MnemaError> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for conn in ctx.iter_outgoing(pivot, mask)? {
        if seen.insert(conn.addr) {
            out.push(conn);
        }
    }
    for conn in ctx.iter_incoming(pivot, mask)? {
        if seen.insert(conn.addr) {
            out.push(conn);
        }
    }
    Ok(out)
}

/// Pick the most selective unsolved constraint: one with a resolved
/// endpoint, preferring the smaller candidate neighborhood.
fn pick_constraint(
    ctx: &MemoryContext,
    constraints: &[Constraint],
    done: &[bool],
    binding: &Binding,
) -> Result<Option<(usize, Addr)>, MnemaError> {
    let mut best: Option<(usize, Addr, usize)> = None;
    for (n, constraint) in constraints.iter().enumerate() {
        if done[n] {
            continue;
        }
        let pivot = resolved(&constraint.source, binding)
            .or_else(|| resolved(&constraint.target, binding));
        let Some(pivot) = pivot else { continue };
        let degree = candidates_around(ctx, pivot, constraint.connector.mask())?.len();
        if best.as_ref().is_none_or(|(_, _, best_degree)| degree < *best_degree) {
            best = Some((n, pivot, degree));
        }
    }
    Ok(best.map(|(n, pivot, _)| (n, pivot)))
}

fn search_rec(
    ctx: &MemoryContext,
    constraints: &[Constraint],
    done: &mut [bool],
    binding: &Binding,
    seen: &mut HashSet<Vec<(String, Addr)>>,
    results: &mut Vec<Binding>,
) -> Result<(), MnemaError> {
    if done.iter().all(|solved| *solved) {
        if seen.insert(binding.canonical()) {
            results.push(binding.clone());
        }
        return Ok(());
    }
    let Some((n, pivot)) = pick_constraint(ctx, constraints, done, binding)? else {
        return Err(MnemaError::InvalidParams(
            "template has no anchored constraint".to_string(),
        ));
    };
    let constraint = &constraints[n];
    done[n] = true;
    for conn in candidates_around(ctx, pivot, constraint.connector.mask())? {
        // A common edge matches in either orientation.
        let mut orientations = vec![(conn.source, conn.target)];
        if conn.mask.is_common_edge() {
            orientations.push((conn.target, conn.source));
        }
        for (source, target) in orientations {
            let mut candidate = binding.clone();
            let source_type = match ctx.get_element_type(source) {
                Ok(mask) => mask,
                Err(_) => continue,
            };
            let target_type = match ctx.get_element_type(target) {
                Ok(mask) => mask,
                Err(_) => continue,
            };
            if !try_bind(&constraint.source, source, source_type, &mut candidate)
                || !try_bind(&constraint.target, target, target_type, &mut candidate)
                || !try_bind(&constraint.connector, conn.addr, conn.mask, &mut candidate)
            {
                continue;
            }
            search_rec(ctx, constraints, done, &candidate, seen, results)?;
        }
    }
    done[n] = false;
    Ok(())
}

pub(crate) fn search(
    ctx: &MemoryContext,
    template: &Template,
) -> Result<Vec<Binding>, MnemaError> {
    if template.constraints.is_empty() {
        return Ok(Vec::new());
    }
    let mut done = vec![false; template.constraints.len()];
    let mut seen = HashSet::new();
    let mut results = Vec::new();
    search_rec(
        ctx,
        &template.constraints,
        &mut done,
        &Binding::new(),
        &mut seen,
        &mut results,
    )?;
    Ok(results)
}

// =============================================================================
// GENERATION
// =============================================================================

fn materialize_endpoint(
    ctx: &MemoryContext,
    arg: &TemplateArg,
    binding: &mut Binding,
) -> Result<Addr, MnemaError> {
    if let Some(addr) = resolved(arg, binding) {
        if !ctx.is_element(addr) {
            return Err(MnemaError::ElementNotFound(addr));
        }
        return Ok(addr);
    }
    let mask = arg.mask().to_const();
    if !mask.is_node() {
        return Err(MnemaError::InvalidParams(
            "cannot materialize an untyped template slot".to_string(),
        ));
    }
    let addr = if mask.is_link() {
        ctx.create_link(mask)?
    } else {
        ctx.create_node(mask)?
    };
    if let Some(name) = arg.name() {
        binding.set(name, addr);
    }
    Ok(addr)
}

pub(crate) fn generate(
    ctx: &MemoryContext,
    template: &Template,
    partial: Binding,
) -> Result<Binding, MnemaError> {
    let mut binding = partial;
    for constraint in &template.constraints {
        let source = materialize_endpoint(ctx, &constraint.source, &mut binding)?;
        let target = materialize_endpoint(ctx, &constraint.target, &mut binding)?;

        if let Some(existing) = resolved(&constraint.connector, &binding) {
            let (conn_source, conn_target) = ctx.connector_endpoints(existing)?;
            let straight = conn_source == source && conn_target == target;
            let swapped = ctx.get_element_type(existing)?.is_common_edge()
                && conn_source == target
                && conn_target == source;
            if !straight && !swapped {
                return Err(MnemaError::InvalidParams(format!(
                    "bound connector {existing} does not join the constrained endpoints"
                )));
            }
            continue;
        }

        let mask = constraint.connector.mask();
        if !mask.is_connector() {
            return Err(MnemaError::InvalidParams(
                "template connector slot carries no connector type".to_string(),
            ));
        }
        let addr = ctx.create_connector(mask.to_const(), source, target)?;
        if let Some(name) = constraint.connector.name() {
            binding.set(name, addr);
        }
    }
    Ok(binding)
}
