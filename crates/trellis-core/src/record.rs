// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Graph record types: nodes, relationships and the well-known property keys.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::cascade::CascadeFlags;
use crate::ident::{ObjectId, TypeName};
use crate::value::Value;

/// Property map of a node or relationship. Keys are unique per object.
pub type PropertyMap = BTreeMap<String, Value>;

/// Builds a [`PropertyMap`] from key/value pairs.
pub fn properties<I, K, V>(pairs: I) -> PropertyMap
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Well-known property keys.
pub mod keys {
    /// Object id (system, read-only).
    pub const ID: &str = "id";
    /// Type tag (system, read-only).
    pub const TYPE: &str = "type";
    /// Creation timestamp (system, read-only).
    pub const CREATED_DATE: &str = "createdDate";
    /// Last modification timestamp (system, read-only).
    pub const LAST_MODIFIED_DATE: &str = "lastModifiedDate";
    /// Display name.
    pub const NAME: &str = "name";
    /// Hidden flag.
    pub const HIDDEN: &str = "hidden";
    /// Soft-delete marker.
    pub const DELETED: &str = "deleted";
    /// Readable by anonymous contexts.
    pub const VISIBLE_TO_PUBLIC_USERS: &str = "visibleToPublicUsers";
    /// Readable by any authenticated context.
    pub const VISIBLE_TO_AUTHENTICATED_USERS: &str = "visibleToAuthenticatedUsers";
    /// Principal e-mail address.
    pub const EMAIL: &str = "eMail";
    /// Administrator flag on principals.
    pub const IS_ADMIN: &str = "isAdmin";
    /// Permission bitmask carried by grant relationships.
    pub const ALLOWED: &str = "allowed";

    /// Keys maintained by the system that callers can never write.
    pub const SYSTEM: &[&str] = &[ID, TYPE, CREATED_DATE, LAST_MODIFIED_DATE];

    /// Returns `true` if `key` is system-maintained.
    pub fn is_system(key: &str) -> bool {
        SYSTEM.contains(&key)
    }
}

/// Materialised record for a single node.
///
/// Visibility flags (`hidden`, `deleted`, `visibleToPublicUsers`,
/// `visibleToAuthenticatedUsers`) live in the property map as `Bool`
/// values; a missing flag reads as `false`.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeRecord {
    /// Node id.
    pub id: ObjectId,
    /// Node type.
    pub ty: TypeName,
    /// User-visible properties.
    pub properties: PropertyMap,
    /// Set once at creation.
    pub created_at: DateTime<Utc>,
    /// Bumped at commit whenever a property value actually changes.
    pub modified_at: DateTime<Utc>,
    /// Committed version, used for write-conflict detection.
    pub version: u64,
}

impl NodeRecord {
    /// Creates an empty node stamped with `now`.
    pub fn new(id: ObjectId, ty: TypeName, now: DateTime<Utc>) -> Self {
        Self {
            id,
            ty,
            properties: PropertyMap::new(),
            created_at: now,
            modified_at: now,
            version: 0,
        }
    }

    /// Returns a stored property.
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Returns a property including the system keys (`id`, `type`,
    /// `createdDate`, `lastModifiedDate`).
    pub fn value_of(&self, key: &str) -> Option<Value> {
        match key {
            keys::ID => Some(Value::String(self.id.to_string())),
            keys::TYPE => Some(Value::String(self.ty.to_string())),
            keys::CREATED_DATE => Some(Value::Date(self.created_at)),
            keys::LAST_MODIFIED_DATE => Some(Value::Date(self.modified_at)),
            _ => self.properties.get(key).cloned(),
        }
    }

    fn flag(&self, key: &str) -> bool {
        self.properties
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// `hidden` flag.
    pub fn is_hidden(&self) -> bool {
        self.flag(keys::HIDDEN)
    }

    /// `deleted` (soft-delete) flag.
    pub fn is_deleted(&self) -> bool {
        self.flag(keys::DELETED)
    }

    /// `visibleToPublicUsers` flag.
    pub fn visible_to_public_users(&self) -> bool {
        self.flag(keys::VISIBLE_TO_PUBLIC_USERS)
    }

    /// `visibleToAuthenticatedUsers` flag.
    pub fn visible_to_authenticated_users(&self) -> bool {
        self.flag(keys::VISIBLE_TO_AUTHENTICATED_USERS)
    }
}

/// Materialised record for a single directed relationship.
///
/// Invariants
/// - `from` and `to` reference existing nodes in the same store.
/// - `cascade` only ever holds the bits defined by [`CascadeFlags`].
#[derive(Clone, Debug, PartialEq)]
pub struct RelationshipRecord {
    /// Relationship id.
    pub id: ObjectId,
    /// Relationship type.
    pub ty: TypeName,
    /// Source node.
    pub from: ObjectId,
    /// Target node.
    pub to: ObjectId,
    /// Relationship properties.
    pub properties: PropertyMap,
    /// Cascade-delete bitmask of this instance.
    pub cascade: CascadeFlags,
    /// Set once at creation.
    pub created_at: DateTime<Utc>,
    /// Committed version, used for write-conflict detection.
    pub version: u64,
}

impl RelationshipRecord {
    /// Returns the endpoint opposite to `node`, or `None` if `node` is not an endpoint.
    pub fn other_end(&self, node: ObjectId) -> Option<ObjectId> {
        if self.from == node {
            Some(self.to)
        } else if self.to == node {
            Some(self.from)
        } else {
            None
        }
    }

    /// Returns a stored property.
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }
}

/// Borrowed view of either kind of graph object.
#[derive(Clone, Copy, Debug)]
pub enum GraphObject<'a> {
    /// A node.
    Node(&'a NodeRecord),
    /// A relationship.
    Relationship(&'a RelationshipRecord),
}

impl GraphObject<'_> {
    /// Id of the object.
    pub fn id(&self) -> ObjectId {
        match self {
            Self::Node(n) => n.id,
            Self::Relationship(r) => r.id,
        }
    }

    /// Type of the object.
    pub fn type_name(&self) -> &TypeName {
        match self {
            Self::Node(n) => &n.ty,
            Self::Relationship(r) => &r.ty,
        }
    }

    /// Property map of the object.
    pub fn properties(&self) -> &PropertyMap {
        match self {
            Self::Node(n) => &n.properties,
            Self::Relationship(r) => &r.properties,
        }
    }

    /// Returns the node when this is a node.
    pub fn as_node(&self) -> Option<&NodeRecord> {
        match self {
            Self::Node(n) => Some(n),
            Self::Relationship(_) => None,
        }
    }
}

/// Traversal direction relative to a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// The node is the relationship's source.
    Outgoing,
    /// The node is the relationship's target.
    Incoming,
    /// Either end.
    Both,
}

impl Direction {
    /// Returns `true` if `rel` touches `node` in this direction.
    pub fn matches(self, rel: &RelationshipRecord, node: ObjectId) -> bool {
        match self {
            Self::Outgoing => rel.from == node,
            Self::Incoming => rel.to == node,
            Self::Both => rel.from == node || rel.to == node,
        }
    }
}
