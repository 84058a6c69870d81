// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Cascading delete resolution.
//!
//! Deleting a node removes every incident relationship. Whether the far-side
//! node goes too is decided per relationship instance by its
//! [`CascadeFlags`]:
//!
//! - `SOURCE_TO_TARGET`: deleting the source deletes the target.
//! - `TARGET_TO_SOURCE`: deleting the target deletes the source.
//! - `CONSTRAINT_BASED`: the far node is deleted only if it would violate its
//!   relationship constraints once the edge is gone.
//!
//! Without any flag only the edge is removed. If that leaves the far node
//! invalid, the resolver reports a validation failure attributed to it.
use std::fmt;

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::GraphError;
use crate::graph::GraphStore;
use crate::ident::ObjectId;
use crate::schema::Schema;
use crate::validation::{relationship_constraint_violations, ErrorToken};

/// Cascade-delete bitmask stored on a relationship instance.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CascadeFlags(u8);

impl CascadeFlags {
    /// No cascading.
    pub const NONE: Self = Self(0);
    /// Deleting the source deletes the target.
    pub const SOURCE_TO_TARGET: Self = Self(1);
    /// Deleting the target deletes the source.
    pub const TARGET_TO_SOURCE: Self = Self(2);
    /// Cascade only when the far node would become invalid.
    pub const CONSTRAINT_BASED: Self = Self(4);
    /// Cascade in both directions.
    pub const ALWAYS: Self = Self(1 | 2);

    const MASK: u8 = 1 | 2 | 4;

    /// Validates a raw bitmask.
    ///
    /// # Errors
    /// [`GraphError::Configuration`] if bits outside the three flags are set
    /// or the value is negative.
    pub fn from_bits(bits: i64) -> Result<Self, GraphError> {
        u8::try_from(bits)
            .ok()
            .filter(|b| b & !Self::MASK == 0)
            .map(Self)
            .ok_or_else(|| GraphError::configuration(format!("invalid cascade bitmask {bits}")))
    }

    /// Raw bits.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Returns `true` if every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    /// Bitwise union.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns `true` if no flag is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for CascadeFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Debug for CascadeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.contains(Self::SOURCE_TO_TARGET) {
            parts.push("SOURCE_TO_TARGET");
        }
        if self.contains(Self::TARGET_TO_SOURCE) {
            parts.push("TARGET_TO_SOURCE");
        }
        if self.contains(Self::CONSTRAINT_BASED) {
            parts.push("CONSTRAINT_BASED");
        }
        if parts.is_empty() {
            f.write_str("NONE")
        } else {
            f.write_str(&parts.join("|"))
        }
    }
}

/// Outcome of [`resolve_delete`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CascadePlan {
    /// Nodes to delete, the requested node first, then in discovery order.
    pub nodes: Vec<ObjectId>,
    /// Every relationship incident to a deleted node, each listed once.
    pub relationships: Vec<ObjectId>,
    /// Far nodes left invalid by the removal of an edge that does not cascade.
    pub failures: Vec<ErrorToken>,
}

impl CascadePlan {
    /// Returns `true` if `node` is scheduled for deletion.
    pub fn deletes(&self, node: &ObjectId) -> bool {
        self.nodes.contains(node)
    }
}

struct Resolution<'a> {
    store: &'a GraphStore,
    schema: &'a Schema,
    scheduled: FxHashSet<ObjectId>,
    removed: FxHashSet<ObjectId>,
    plan: CascadePlan,
    stack: Vec<ObjectId>,
}

impl Resolution<'_> {
    fn schedule(&mut self, node: ObjectId) {
        if !self.scheduled.insert(node) {
            return;
        }
        self.plan.nodes.push(node);
        for rel in self.store.relationships_of(&node) {
            if self.removed.insert(rel.id) {
                self.plan.relationships.push(rel.id);
            }
        }
        self.stack.push(node);
    }

    fn would_be_invalid(&self, node: ObjectId) -> bool {
        self.store.node(&node).is_some_and(|record| {
            !relationship_constraint_violations(self.schema, self.store, record, &self.removed)
                .is_empty()
        })
    }

    fn drain(&mut self) {
        while let Some(node) = self.stack.pop() {
            let rels: Vec<_> = self.store.relationships_of(&node).cloned().collect();
            for rel in rels {
                let Some(far) = rel.other_end(node) else {
                    continue;
                };
                if self.scheduled.contains(&far) {
                    continue;
                }
                let flags = rel.cascade;
                if (flags.contains(CascadeFlags::SOURCE_TO_TARGET) && rel.from == node)
                    || (flags.contains(CascadeFlags::TARGET_TO_SOURCE) && rel.to == node)
                {
                    self.schedule(far);
                } else if flags.contains(CascadeFlags::CONSTRAINT_BASED) && self.would_be_invalid(far)
                {
                    self.schedule(far);
                }
            }
        }
    }

    /// Far nodes whose constraint-based edges were removed but which have not
    /// been re-examined since later deletions removed more of their edges.
    fn constraint_candidates(&self) -> Vec<ObjectId> {
        let mut out = Vec::new();
        for rel_id in &self.plan.relationships {
            let Some(rel) = self.store.relationship(rel_id) else {
                continue;
            };
            if !rel.cascade.contains(CascadeFlags::CONSTRAINT_BASED) {
                continue;
            }
            for end in [rel.from, rel.to] {
                if !self.scheduled.contains(&end) && !out.contains(&end) && self.would_be_invalid(end)
                {
                    out.push(end);
                }
            }
        }
        out
    }
}

/// Computes the transitive closure of a node deletion.
///
/// Terminates on cyclic graphs; a node reached by several cascade chains is
/// scheduled once.
///
/// # Errors
/// [`GraphError::NotFound`] if `root` is not a node in `store`.
pub fn resolve_delete(
    store: &GraphStore,
    schema: &Schema,
    root: ObjectId,
) -> Result<CascadePlan, GraphError> {
    if store.node(&root).is_none() {
        return Err(GraphError::not_found(format!("node {root}")));
    }
    let mut res = Resolution {
        store,
        schema,
        scheduled: FxHashSet::default(),
        removed: FxHashSet::default(),
        plan: CascadePlan::default(),
        stack: Vec::new(),
    };
    res.schedule(root);
    loop {
        res.drain();
        // Later deletions may remove further edges of a node that looked
        // valid when first examined.
        let late = res.constraint_candidates();
        if late.is_empty() {
            break;
        }
        for node in late {
            res.schedule(node);
        }
    }

    let mut failures = Vec::new();
    let mut checked = FxHashSet::default();
    for rel_id in &res.plan.relationships {
        let Some(rel) = store.relationship(rel_id) else {
            continue;
        };
        for end in [rel.from, rel.to] {
            if res.scheduled.contains(&end) || !checked.insert(end) {
                continue;
            }
            if let Some(record) = store.node(&end) {
                failures.extend(relationship_constraint_violations(
                    schema,
                    store,
                    record,
                    &res.removed,
                ));
            }
        }
    }
    res.plan.failures = failures;
    debug!(
        root = %root,
        nodes = res.plan.nodes.len(),
        relationships = res.plan.relationships.len(),
        failures = res.plan.failures.len(),
        "resolved cascading delete"
    );
    Ok(res.plan)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn bitmask_rejects_unknown_bits() {
        assert_eq!(CascadeFlags::from_bits(3).unwrap(), CascadeFlags::ALWAYS);
        assert!(CascadeFlags::from_bits(8).is_err());
        assert!(CascadeFlags::from_bits(-1).is_err());
    }

    #[test]
    fn contains_requires_all_bits() {
        let flags = CascadeFlags::SOURCE_TO_TARGET | CascadeFlags::CONSTRAINT_BASED;
        assert!(flags.contains(CascadeFlags::SOURCE_TO_TARGET));
        assert!(!flags.contains(CascadeFlags::ALWAYS));
        assert!(!CascadeFlags::NONE.contains(CascadeFlags::NONE));
        assert_eq!(format!("{flags:?}"), "SOURCE_TO_TARGET|CONSTRAINT_BASED");
    }
}
