// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! In-memory graph store: the storage collaborator behind the engine.
use std::collections::{BTreeMap, BTreeSet};

use crate::error::GraphError;
use crate::ident::{ObjectId, TypeName};
use crate::permission::PropagationRule;
use crate::record::{Direction, GraphObject, NodeRecord, RelationshipRecord};
use crate::value::Value;

/// Canonical 256-bit digest of the store contents.
pub type Hash = [u8; 32];

/// In-memory graph storage.
///
/// Besides nodes and relationships the store also holds the per-type
/// permission propagation rules, so that rule changes travel through the same
/// transactional copy/replay path as every other write.
#[derive(Debug, Clone, Default)]
pub struct GraphStore {
    /// Node records by id.
    pub(crate) nodes: BTreeMap<ObjectId, NodeRecord>,
    /// Relationship records by id.
    pub(crate) relationships: BTreeMap<ObjectId, RelationshipRecord>,
    /// Mapping from source node to outbound relationship ids (insertion order).
    pub(crate) edges_from: BTreeMap<ObjectId, Vec<ObjectId>>,
    /// Reverse adjacency: mapping from target node to inbound relationship ids.
    pub(crate) edges_to: BTreeMap<ObjectId, Vec<ObjectId>>,
    /// Node ids per exact type.
    pub(crate) by_type: BTreeMap<TypeName, BTreeSet<ObjectId>>,
    /// Propagation rule per relationship type.
    pub(crate) propagation: BTreeMap<TypeName, PropagationRule>,
}

impl GraphStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of relationships.
    pub fn relationship_count(&self) -> usize {
        self.relationships.len()
    }

    /// Iterate over all nodes in id order.
    pub fn iter_nodes(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.values()
    }

    /// Iterate over all relationships in id order.
    pub fn iter_relationships(&self) -> impl Iterator<Item = &RelationshipRecord> {
        self.relationships.values()
    }

    /// Iterate over nodes of exactly type `ty` in id order.
    pub fn nodes_of_type<'a>(&'a self, ty: &TypeName) -> impl Iterator<Item = &'a NodeRecord> + 'a {
        self.by_type
            .get(ty)
            .into_iter()
            .flatten()
            .filter_map(|id| self.nodes.get(id))
    }

    /// Returns a node when it exists.
    pub fn node(&self, id: &ObjectId) -> Option<&NodeRecord> {
        self.nodes.get(id)
    }

    /// Returns a mutable node when it exists.
    pub fn node_mut(&mut self, id: &ObjectId) -> Option<&mut NodeRecord> {
        self.nodes.get_mut(id)
    }

    /// Returns a relationship when it exists.
    pub fn relationship(&self, id: &ObjectId) -> Option<&RelationshipRecord> {
        self.relationships.get(id)
    }

    /// Returns a mutable relationship when it exists.
    pub fn relationship_mut(&mut self, id: &ObjectId) -> Option<&mut RelationshipRecord> {
        self.relationships.get_mut(id)
    }

    /// Looks up either kind of object.
    pub fn object(&self, id: &ObjectId) -> Option<GraphObject<'_>> {
        self.nodes
            .get(id)
            .map(GraphObject::Node)
            .or_else(|| self.relationships.get(id).map(GraphObject::Relationship))
    }

    /// Returns `true` if a node or relationship with `id` exists.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.nodes.contains_key(id) || self.relationships.contains_key(id)
    }

    /// Committed version of an object, if it exists.
    pub fn version_of(&self, id: &ObjectId) -> Option<u64> {
        self.nodes
            .get(id)
            .map(|n| n.version)
            .or_else(|| self.relationships.get(id).map(|r| r.version))
    }

    /// Outbound relationships of `node` in insertion order.
    pub fn outgoing<'a>(
        &'a self,
        node: &ObjectId,
    ) -> impl Iterator<Item = &'a RelationshipRecord> + 'a {
        self.edges_from
            .get(node)
            .into_iter()
            .flatten()
            .filter_map(|id| self.relationships.get(id))
    }

    /// Inbound relationships of `node` in insertion order.
    pub fn incoming<'a>(
        &'a self,
        node: &ObjectId,
    ) -> impl Iterator<Item = &'a RelationshipRecord> + 'a {
        self.edges_to
            .get(node)
            .into_iter()
            .flatten()
            .filter_map(|id| self.relationships.get(id))
    }

    /// All relationships touching `node` (outbound first). A self-loop is
    /// yielded once.
    pub fn relationships_of<'a>(
        &'a self,
        node: &'a ObjectId,
    ) -> impl Iterator<Item = &'a RelationshipRecord> + 'a {
        self.outgoing(node)
            .chain(self.incoming(node).filter(move |r| r.from != *node))
    }

    /// Relationships of type `ty` touching `node` in `direction`.
    pub fn relationships_by_type<'a>(
        &'a self,
        node: &'a ObjectId,
        ty: &'a str,
        direction: Direction,
    ) -> impl Iterator<Item = &'a RelationshipRecord> + 'a {
        self.relationships_of(node)
            .filter(move |r| r.ty == ty && direction.matches(r, *node))
    }

    /// Inserts or replaces a node.
    pub fn insert_node(&mut self, record: NodeRecord) {
        if let Some(prev) = self.nodes.get(&record.id) {
            if prev.ty != record.ty {
                let prev_ty = prev.ty.clone();
                self.remove_from_type_index(&prev_ty, &record.id);
            }
        }
        self.by_type
            .entry(record.ty.clone())
            .or_default()
            .insert(record.id);
        self.nodes.insert(record.id, record);
    }

    fn remove_from_type_index(&mut self, ty: &TypeName, id: &ObjectId) {
        let now_empty = self.by_type.get_mut(ty).is_some_and(|ids| {
            ids.remove(id);
            ids.is_empty()
        });
        if now_empty {
            self.by_type.remove(ty);
        }
    }

    /// Inserts a relationship between two existing nodes.
    ///
    /// If a relationship with the same id already exists it is replaced and
    /// the adjacency buckets are rewired.
    ///
    /// # Errors
    /// [`GraphError::NotFound`] if either endpoint is missing.
    pub fn insert_relationship(&mut self, record: RelationshipRecord) -> Result<(), GraphError> {
        for end in [record.from, record.to] {
            if !self.nodes.contains_key(&end) {
                return Err(GraphError::not_found(format!("node {end}")));
            }
        }
        if self.relationships.contains_key(&record.id) {
            self.unlink(&record.id);
        }
        self.edges_from
            .entry(record.from)
            .or_default()
            .push(record.id);
        self.edges_to.entry(record.to).or_default().push(record.id);
        self.relationships.insert(record.id, record);
        Ok(())
    }

    /// Removes a relationship from the adjacency buckets and the record map.
    fn unlink(&mut self, id: &ObjectId) -> Option<RelationshipRecord> {
        let rel = self.relationships.remove(id)?;
        let from_empty = self.edges_from.get_mut(&rel.from).map_or_else(
            || {
                debug_assert!(false, "missing outbound bucket for relationship {id}");
                false
            },
            |ids| {
                ids.retain(|e| e != id);
                ids.is_empty()
            },
        );
        if from_empty {
            self.edges_from.remove(&rel.from);
        }
        let to_empty = self.edges_to.get_mut(&rel.to).map_or_else(
            || {
                debug_assert!(false, "missing inbound bucket for relationship {id}");
                false
            },
            |ids| {
                ids.retain(|e| e != id);
                ids.is_empty()
            },
        );
        if to_empty {
            self.edges_to.remove(&rel.to);
        }
        Some(rel)
    }

    /// Deletes a relationship, returning the removed record.
    pub fn delete_relationship(&mut self, id: &ObjectId) -> Option<RelationshipRecord> {
        self.unlink(id)
    }

    /// Deletes a node together with every incident relationship.
    ///
    /// Returns the node and the removed relationships, or `None` if the node
    /// did not exist. This never touches the far-side nodes; cascading to them
    /// is decided by [`crate::cascade::resolve_delete`].
    pub fn delete_node(&mut self, id: &ObjectId) -> Option<(NodeRecord, Vec<RelationshipRecord>)> {
        let node = self.nodes.remove(id)?;
        self.remove_from_type_index(&node.ty, id);
        let mut incident: Vec<ObjectId> = self.edges_from.get(id).cloned().unwrap_or_default();
        incident.extend(self.edges_to.get(id).into_iter().flatten().copied());
        incident.sort_unstable();
        incident.dedup();
        let removed = incident.iter().filter_map(|rel| self.unlink(rel)).collect();
        Some((node, removed))
    }

    /// Sets (`Some`) or clears (`None`) a property on a node or relationship.
    ///
    /// Returns the previous value.
    ///
    /// # Errors
    /// [`GraphError::NotFound`] if the object does not exist.
    pub fn set_property(
        &mut self,
        id: &ObjectId,
        key: &str,
        value: Option<Value>,
    ) -> Result<Option<Value>, GraphError> {
        let props = if let Some(node) = self.nodes.get_mut(id) {
            &mut node.properties
        } else if let Some(rel) = self.relationships.get_mut(id) {
            &mut rel.properties
        } else {
            return Err(GraphError::not_found(format!("object {id}")));
        };
        Ok(match value {
            Some(v) => props.insert(key.to_owned(), v),
            None => props.remove(key),
        })
    }

    /// Propagation rule attached to a relationship type, if any.
    pub fn propagation_rule(&self, rel_type: &TypeName) -> Option<&PropagationRule> {
        self.propagation.get(rel_type)
    }

    /// Attaches (`Some`) or removes (`None`) the propagation rule of `rel_type`.
    pub fn set_propagation_rule(&mut self, rel_type: TypeName, rule: Option<PropagationRule>) {
        match rule {
            Some(rule) => {
                self.propagation.insert(rel_type, rule);
            }
            None => {
                self.propagation.remove(&rel_type);
            }
        }
    }

    /// Computes a canonical hash of the entire graph state.
    ///
    /// Traversal order is fixed: nodes by id, then relationships by id, then
    /// propagation rules by type. Versions and timestamps are excluded so the
    /// digest reflects content only.
    #[must_use]
    pub fn canonical_state_hash(&self) -> Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"TRELLIS_STATE_HASH_V1\0");
        hasher.update(&(self.nodes.len() as u64).to_le_bytes());
        for node in self.nodes.values() {
            hasher.update(b"N\0");
            hasher.update(node.id.as_bytes());
            hasher.update(node.ty.as_str().as_bytes());
            Self::hash_properties(&mut hasher, &node.properties);
        }
        hasher.update(&(self.relationships.len() as u64).to_le_bytes());
        for rel in self.relationships.values() {
            hasher.update(b"R\0");
            hasher.update(rel.id.as_bytes());
            hasher.update(rel.from.as_bytes());
            hasher.update(rel.to.as_bytes());
            hasher.update(rel.ty.as_str().as_bytes());
            hasher.update(&[rel.cascade.bits()]);
            Self::hash_properties(&mut hasher, &rel.properties);
        }
        for (ty, rule) in &self.propagation {
            hasher.update(b"P\0");
            hasher.update(ty.as_str().as_bytes());
            hasher.update(rule.to_string().as_bytes());
        }
        *hasher.finalize().as_bytes()
    }

    fn hash_properties(hasher: &mut blake3::Hasher, props: &crate::record::PropertyMap) {
        hasher.update(&(props.len() as u64).to_le_bytes());
        for (key, value) in props {
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(format!("{value:?}").as_bytes());
            hasher.update(b"\0");
        }
    }
}
