// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Permission resolution.
//!
//! For a `(context, object, permission)` triple the resolver checks, in
//! order, stopping at the first success:
//!
//! 1. superuser context;
//! 2. `read` on a node flagged `visibleToPublicUsers`, or flagged
//!    `visibleToAuthenticatedUsers` with a principal present;
//! 3. the acting principal owns the node;
//! 4. a grant from the principal, or from a group it transitively belongs
//!    to, carries the permission;
//! 5. a relationship touching the node has a type-level propagation rule
//!    that lets the permission flow in from the far node, and the far node
//!    resolves to allowed.
//!
//! Steps 2-5 are evaluated breadth-first over the propagation graph with a
//! visited set, so cycles terminate and deep chains do not grow the stack.
//! Relationships are allowed a permission when both endpoints are.
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::GraphError;
use crate::graph::GraphStore;
use crate::ident::ObjectId;
use crate::record::{keys, NodeRecord, RelationshipRecord};
use crate::schema::{CONTAINS, OWNS, SECURITY};
use crate::security::{Permission, Permissions, SecurityContext};

/// Traversal direction along which a relationship type propagates permissions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PropagationDirection {
    /// Nothing propagates.
    #[default]
    None,
    /// From target to source: the source inherits from the target.
    In,
    /// From source to target: the target inherits from the source.
    Out,
    /// Both ways.
    Both,
}

impl PropagationDirection {
    /// Source side inherits from the target.
    const fn flows_in(self) -> bool {
        matches!(self, Self::In | Self::Both)
    }

    /// Target side inherits from the source.
    const fn flows_out(self) -> bool {
        matches!(self, Self::Out | Self::Both)
    }
}

impl FromStr for PropagationDirection {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "in" => Ok(Self::In),
            "out" => Ok(Self::Out),
            "both" => Ok(Self::Both),
            other => Err(GraphError::configuration(format!(
                "unknown propagation direction `{other}`"
            ))),
        }
    }
}

/// What happens to a permission when it crosses a propagating relationship.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PropagationMode {
    /// The far node's permission is added to this node's.
    Add,
    /// This node keeps its own permission; nothing is inherited.
    #[default]
    Keep,
}

/// Type-level propagation metadata of a relationship type.
///
/// Shared by every instance of the type; changing it affects existing
/// relationships immediately.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PropagationRule {
    direction: PropagationDirection,
    modes: [PropagationMode; 5],
}

impl PropagationRule {
    /// A rule with the given direction and every permission kept.
    pub const fn new(direction: PropagationDirection) -> Self {
        Self {
            direction,
            modes: [PropagationMode::Keep; 5],
        }
    }

    /// Sets the mode for one permission.
    #[must_use]
    pub const fn with(mut self, permission: Permission, mode: PropagationMode) -> Self {
        self.modes[permission as usize] = mode;
        self
    }

    /// Sets the direction.
    #[must_use]
    pub const fn with_direction(mut self, direction: PropagationDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Direction of the rule.
    pub const fn direction(&self) -> PropagationDirection {
        self.direction
    }

    /// Mode for `permission`.
    pub const fn mode(&self, permission: Permission) -> PropagationMode {
        self.modes[permission as usize]
    }
}

impl fmt::Display for PropagationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.direction)?;
        let added: Vec<_> = Permission::ALL
            .into_iter()
            .filter(|p| self.mode(*p) == PropagationMode::Add)
            .map(|p| format!("{}:add", p.name()))
            .collect();
        if !added.is_empty() {
            write!(f, "; {}", added.join(", "))?;
        }
        Ok(())
    }
}

/// Parses `"<direction>[; <permission>:<mode>, ...]"`, e.g. `"Out; read:add"`.
impl FromStr for PropagationRule {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(2, ';');
        let direction = parts.next().unwrap_or_default().parse()?;
        let mut rule = Self::new(direction);
        for entry in parts
            .next()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
        {
            let (perm, mode) = entry.split_once(':').ok_or_else(|| {
                GraphError::configuration(format!("malformed propagation entry `{entry}`"))
            })?;
            let permission = Permission::parse(perm)
                .ok_or_else(|| GraphError::configuration(format!("unknown permission `{perm}`")))?;
            let mode = match mode.trim().to_ascii_lowercase().as_str() {
                "add" => PropagationMode::Add,
                "keep" => PropagationMode::Keep,
                other => {
                    return Err(GraphError::configuration(format!(
                        "unknown propagation mode `{other}`"
                    )))
                }
            };
            rule = rule.with(permission, mode);
        }
        Ok(rule)
    }
}

/// Outcome of a permission check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Access granted.
    Allowed,
    /// Access denied.
    Denied,
}

impl Decision {
    /// `true` for [`Decision::Allowed`].
    pub const fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Returns the owner of `node`: the source of its (single) incoming `OWNS`
/// relationship.
pub fn owner_of(store: &GraphStore, node: &ObjectId) -> Option<ObjectId> {
    store
        .incoming(node)
        .find(|r| r.ty == OWNS)
        .map(|r| r.from)
}

/// Returns the grant relationship from `principal` to `object`, if any.
pub fn grant_edge<'a>(
    store: &'a GraphStore,
    principal: &ObjectId,
    object: &ObjectId,
) -> Option<&'a RelationshipRecord> {
    store
        .incoming(object)
        .find(|r| r.ty == SECURITY && r.from == *principal)
}

/// Permission bits carried by a grant relationship. Malformed values grant nothing.
pub fn grant_bits(rel: &RelationshipRecord) -> Permissions {
    rel.property(keys::ALLOWED)
        .and_then(crate::value::Value::as_i64)
        .and_then(|bits| Permissions::from_bits(bits).ok())
        .unwrap_or_default()
}

/// The principal plus every group it transitively belongs to.
pub fn principal_closure(store: &GraphStore, principal: ObjectId) -> FxHashSet<ObjectId> {
    let mut seen = FxHashSet::default();
    let mut stack = vec![principal];
    while let Some(p) = stack.pop() {
        if !seen.insert(p) {
            continue;
        }
        stack.extend(
            store
                .incoming(&p)
                .filter(|r| r.ty == CONTAINS)
                .map(|r| r.from),
        );
    }
    seen
}

/// Permission engine bound to one context and one store view.
///
/// Caches the principal's group closure, so reuse one resolver for many
/// checks (the query engine does).
pub struct PermissionResolver<'a> {
    ctx: &'a SecurityContext,
    store: &'a GraphStore,
    principals: FxHashSet<ObjectId>,
}

impl<'a> PermissionResolver<'a> {
    /// Binds a resolver.
    pub fn new(ctx: &'a SecurityContext, store: &'a GraphStore) -> Self {
        let principals = ctx
            .principal_id()
            .map(|p| principal_closure(store, p))
            .unwrap_or_default();
        Self {
            ctx,
            store,
            principals,
        }
    }

    /// `true` if [`Self::resolve`] allows.
    pub fn is_allowed(&self, object: ObjectId, permission: Permission) -> bool {
        self.resolve(object, permission).is_allowed()
    }

    /// Resolves one permission on one object. Unknown objects are denied.
    pub fn resolve(&self, object: ObjectId, permission: Permission) -> Decision {
        if self.ctx.is_super_user() {
            return Decision::Allowed;
        }
        let decision = if let Some(rel) = self.store.relationship(&object) {
            if self.resolve_node(rel.from, permission).is_allowed()
                && self.resolve_node(rel.to, permission).is_allowed()
            {
                Decision::Allowed
            } else {
                Decision::Denied
            }
        } else {
            self.resolve_node(object, permission)
        };
        if !decision.is_allowed() {
            trace!(object = %object, ?permission, principal = ?self.ctx.principal_id(), "permission denied");
        }
        decision
    }

    /// Full permission set on one object.
    pub fn permissions(&self, object: ObjectId) -> Permissions {
        Permission::ALL
            .into_iter()
            .filter(|p| self.is_allowed(object, *p))
            .fold(Permissions::NONE, |acc, p| acc.union(p.into()))
    }

    fn resolve_node(&self, start: ObjectId, permission: Permission) -> Decision {
        let mut visited = FxHashSet::default();
        let mut queue = VecDeque::from([start]);
        while let Some(id) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            let Some(node) = self.store.node(&id) else {
                continue;
            };
            if self.locally_allowed(node, permission) {
                return Decision::Allowed;
            }
            for rel in self.store.relationships_of(&node.id) {
                let Some(rule) = self.store.propagation_rule(&rel.ty) else {
                    continue;
                };
                if rule.mode(permission) != PropagationMode::Add {
                    continue;
                }
                let dir = rule.direction();
                if rel.to == id && dir.flows_out() {
                    queue.push_back(rel.from);
                }
                if rel.from == id && dir.flows_in() {
                    queue.push_back(rel.to);
                }
            }
        }
        Decision::Denied
    }

    fn locally_allowed(&self, node: &NodeRecord, permission: Permission) -> bool {
        if permission == Permission::Read
            && (node.visible_to_public_users()
                || (node.visible_to_authenticated_users() && self.ctx.principal().is_some()))
        {
            return true;
        }
        let Some(principal) = self.ctx.principal_id() else {
            return false;
        };
        if owner_of(self.store, &node.id) == Some(principal) {
            return true;
        }
        self.store
            .incoming(&node.id)
            .filter(|r| r.ty == SECURITY && self.principals.contains(&r.from))
            .any(|r| grant_bits(r).contains(permission))
    }
}

/// Convenience wrapper: resolve a single permission.
pub fn resolve(
    ctx: &SecurityContext,
    store: &GraphStore,
    object: ObjectId,
    permission: Permission,
) -> Decision {
    PermissionResolver::new(ctx, store).resolve(object, permission)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn rules_parse_and_print() {
        let rule: PropagationRule = "Out; read:add, write:add".parse().unwrap();
        assert_eq!(rule.direction(), PropagationDirection::Out);
        assert_eq!(rule.mode(Permission::Read), PropagationMode::Add);
        assert_eq!(rule.mode(Permission::Delete), PropagationMode::Keep);
        assert_eq!(rule.to_string(), "Out; read:add, write:add");
        let back: PropagationRule = rule.to_string().parse().unwrap();
        assert_eq!(back, rule);
    }

    #[test]
    fn malformed_rules_are_configuration_errors() {
        for text in ["Sideways", "Out; read", "Out; read:grow", "In; fly:add"] {
            let err = text.parse::<PropagationRule>().unwrap_err();
            assert!(matches!(err, GraphError::Configuration(_)), "{text}");
        }
    }

    #[test]
    fn direction_only_rule_inherits_nothing() {
        let rule: PropagationRule = "Both".parse().unwrap();
        assert!(Permission::ALL
            .into_iter()
            .all(|p| rule.mode(p) == PropagationMode::Keep));
    }
}
