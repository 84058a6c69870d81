// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Transaction identifiers, the mutation log and per-transaction state.
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::cascade::CascadeFlags;
use crate::error::GraphError;
use crate::graph::GraphStore;
use crate::ident::{ObjectId, TypeName};
use crate::permission::PropagationRule;
use crate::record::{NodeRecord, RelationshipRecord};
use crate::security::SecurityContext;
use crate::value::Value;

/// Thin wrapper around a transaction identifier.
///
/// The engine issues monotonically increasing identifiers via
/// [`crate::Engine::begin`]. Nested handles share the identifier of the
/// outermost transaction.
///
/// # Invariants
/// - Zero is reserved as invalid; the engine never issues it and skips it on
///   wrap-around.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct TxId(u64);

impl TxId {
    /// Constructs a `TxId` from a raw `u64` value.
    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the underlying raw value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for TxId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One logged mutation.
///
/// Operations are applied to the transaction's working copy when issued and
/// replayed against the then-current committed state at commit. Replay fails
/// with [`GraphError::Conflict`] when the target vanished or reappeared in
/// the meantime.
#[derive(Debug, Clone)]
pub(crate) enum GraphOp {
    CreateNode(NodeRecord),
    CreateRelationship(RelationshipRecord),
    SetProperty {
        id: ObjectId,
        key: String,
        value: Option<Value>,
    },
    SetCascade {
        id: ObjectId,
        flags: CascadeFlags,
    },
    DeleteNode(ObjectId),
    DeleteRelationship(ObjectId),
    SetPropagation {
        rel_type: TypeName,
        rule: Option<PropagationRule>,
    },
}

impl GraphOp {
    pub(crate) fn apply(&self, store: &mut GraphStore) -> Result<(), GraphError> {
        match self {
            Self::CreateNode(record) => {
                if store.contains(&record.id) {
                    return Err(GraphError::Conflict { object: record.id });
                }
                store.insert_node(record.clone());
            }
            Self::CreateRelationship(record) => {
                if store.contains(&record.id) {
                    return Err(GraphError::Conflict { object: record.id });
                }
                store
                    .insert_relationship(record.clone())
                    .map_err(|_| GraphError::Conflict { object: record.id })?;
            }
            Self::SetProperty { id, key, value } => {
                store
                    .set_property(id, key, value.clone())
                    .map_err(|_| GraphError::Conflict { object: *id })?;
            }
            Self::SetCascade { id, flags } => {
                let rel = store
                    .relationship_mut(id)
                    .ok_or(GraphError::Conflict { object: *id })?;
                rel.cascade = *flags;
            }
            Self::DeleteNode(id) => {
                store
                    .delete_node(id)
                    .ok_or(GraphError::Conflict { object: *id })?;
            }
            Self::DeleteRelationship(id) => {
                store
                    .delete_relationship(id)
                    .ok_or(GraphError::Conflict { object: *id })?;
            }
            Self::SetPropagation { rel_type, rule } => {
                store.set_propagation_rule(rel_type.clone(), *rule);
            }
        }
        Ok(())
    }
}

/// Shared state of one logical unit of work (the outermost transaction and
/// every handle nested in it).
#[derive(Debug)]
pub(crate) struct TxState {
    pub(crate) id: TxId,
    pub(crate) ctx: SecurityContext,
    /// Snapshot of the committed store taken at begin, with this
    /// transaction's operations applied. Shared with the engine until the
    /// first write.
    pub(crate) working: Arc<GraphStore>,
    pub(crate) ops: Vec<GraphOp>,
    /// Committed version of every pre-existing object this transaction
    /// wrote, captured on first touch.
    pub(crate) base_versions: BTreeMap<ObjectId, u64>,
    /// Objects created here and still alive, in creation order.
    pub(crate) created: Vec<ObjectId>,
    /// Pre-existing objects deleted here, in deletion order.
    pub(crate) deleted: Vec<ObjectId>,
    /// Pre-existing objects whose properties or cascade flags were written.
    pub(crate) touched: BTreeSet<ObjectId>,
    /// Nodes to validate at commit besides created and touched ones.
    pub(crate) revalidate: BTreeSet<ObjectId>,
    /// Open handles: 1 for the outermost, +1 per nested handle.
    pub(crate) depth: usize,
    /// A nested handle finished without success.
    pub(crate) vetoed: bool,
    /// First write error; the transaction can no longer commit.
    pub(crate) poisoned: Option<GraphError>,
    pub(crate) closed: bool,
}

impl TxState {
    pub(crate) fn new(id: TxId, ctx: SecurityContext, working: Arc<GraphStore>) -> Self {
        Self {
            id,
            ctx,
            working,
            ops: Vec::new(),
            base_versions: BTreeMap::new(),
            created: Vec::new(),
            deleted: Vec::new(),
            touched: BTreeSet::new(),
            revalidate: BTreeSet::new(),
            depth: 1,
            vetoed: false,
            poisoned: None,
            closed: false,
        }
    }

    fn is_created(&self, id: &ObjectId) -> bool {
        self.created.contains(id)
    }

    /// Records the committed version of a pre-existing object before its
    /// first write.
    fn note_base(&mut self, id: ObjectId) {
        if self.is_created(&id) {
            return;
        }
        if let Some(version) = self.working.version_of(&id) {
            self.base_versions.entry(id).or_insert(version);
        }
    }

    /// Private copy of the snapshot, taken on first use.
    fn store_mut(&mut self) -> &mut GraphStore {
        Arc::make_mut(&mut self.working)
    }

    /// Applies `op` to the working copy and logs it.
    pub(crate) fn apply(&mut self, op: GraphOp) -> Result<(), GraphError> {
        match &op {
            GraphOp::CreateNode(n) => {
                self.store_mut().insert_node(n.clone());
                self.created.push(n.id);
                self.revalidate.insert(n.id);
            }
            GraphOp::CreateRelationship(r) => {
                self.store_mut().insert_relationship(r.clone())?;
                self.created.push(r.id);
                self.revalidate.extend([r.from, r.to]);
            }
            GraphOp::SetProperty { id, key, value } => {
                self.note_base(*id);
                self.store_mut().set_property(id, key, value.clone())?;
                if !self.is_created(id) {
                    self.touched.insert(*id);
                }
                self.revalidate.insert(*id);
            }
            GraphOp::SetCascade { id, flags } => {
                self.note_base(*id);
                let rel = self
                    .store_mut()
                    .relationship_mut(id)
                    .ok_or_else(|| GraphError::not_found(format!("relationship {id}")))?;
                rel.cascade = *flags;
                if !self.is_created(id) {
                    self.touched.insert(*id);
                }
            }
            GraphOp::DeleteNode(id) => {
                let incident: Vec<ObjectId> =
                    self.working.relationships_of(id).map(|r| r.id).collect();
                for rel in incident {
                    self.note_base(rel);
                }
                self.note_base(*id);
                let (_, rels) = self
                    .store_mut()
                    .delete_node(id)
                    .ok_or_else(|| GraphError::not_found(format!("node {id}")))?;
                self.forget(*id);
                for rel in rels {
                    self.forget(rel.id);
                    self.revalidate.extend([rel.from, rel.to]);
                }
                self.revalidate.remove(id);
            }
            GraphOp::DeleteRelationship(id) => {
                self.note_base(*id);
                let rel = self
                    .store_mut()
                    .delete_relationship(id)
                    .ok_or_else(|| GraphError::not_found(format!("relationship {id}")))?;
                self.forget(*id);
                self.revalidate.extend([rel.from, rel.to]);
            }
            GraphOp::SetPropagation { rel_type, rule } => {
                self.store_mut().set_propagation_rule(rel_type.clone(), *rule);
            }
        }
        self.ops.push(op);
        Ok(())
    }

    /// Bookkeeping for an object that disappeared from the working copy.
    fn forget(&mut self, id: ObjectId) {
        if let Some(pos) = self.created.iter().position(|c| *c == id) {
            self.created.remove(pos);
        } else if !self.deleted.contains(&id) {
            self.deleted.push(id);
        }
        self.touched.remove(&id);
    }
}
