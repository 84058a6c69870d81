// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Security context and permission bits.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::GraphError;
use crate::graph::GraphStore;
use crate::ident::ObjectId;
use crate::permission::PermissionResolver;
use crate::record::keys;
use crate::schema::Schema;
use crate::value::Value;

/// A single permission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Permission {
    /// Read the object.
    Read,
    /// Modify properties.
    Write,
    /// Delete the object.
    Delete,
    /// Grant, revoke and change ownership.
    AccessControl,
    /// Create or remove relationships touching the object.
    Link,
}

impl Permission {
    /// All permissions in bit order.
    pub const ALL: [Self; 5] = [
        Self::Read,
        Self::Write,
        Self::Delete,
        Self::AccessControl,
        Self::Link,
    ];

    const fn bit(self) -> u8 {
        match self {
            Self::Read => 1,
            Self::Write => 1 << 1,
            Self::Delete => 1 << 2,
            Self::AccessControl => 1 << 3,
            Self::Link => 1 << 4,
        }
    }

    /// Lower-case name used in rule strings (`read`, `accessControl`, ...).
    pub const fn name(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
            Self::AccessControl => "accessControl",
            Self::Link => "link",
        }
    }

    /// Parses a permission name, case-insensitively.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(name.trim()))
    }
}

/// Set of permissions stored as a bitmask.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permissions(u8);

impl Permissions {
    /// Empty set.
    pub const NONE: Self = Self(0);
    /// Every permission.
    pub const ALL: Self = Self(0b1_1111);

    /// Validates a raw bitmask (as stored on grant relationships).
    ///
    /// # Errors
    /// [`GraphError::Configuration`] for bits outside the defined permissions.
    pub fn from_bits(bits: i64) -> Result<Self, GraphError> {
        u8::try_from(bits)
            .ok()
            .filter(|b| b & !Self::ALL.0 == 0)
            .map(Self)
            .ok_or_else(|| GraphError::configuration(format!("invalid permission bitmask {bits}")))
    }

    /// Raw bits.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Returns `true` if `permission` is in the set.
    pub const fn contains(self, permission: Permission) -> bool {
        self.0 & permission.bit() != 0
    }

    /// Returns `true` if the set is empty.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Union of two sets.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// `self` without the members of `other`.
    #[must_use]
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Adds a permission.
    pub fn insert(&mut self, permission: Permission) {
        self.0 |= permission.bit();
    }

    /// Iterates the contained permissions in bit order.
    pub fn iter(self) -> impl Iterator<Item = Permission> {
        Permission::ALL.into_iter().filter(move |p| self.contains(*p))
    }

    pub(crate) fn to_value(self) -> Value {
        Value::Long(i64::from(self.0))
    }
}

impl From<Permission> for Permissions {
    fn from(value: Permission) -> Self {
        Self(value.bit())
    }
}

impl<const N: usize> From<[Permission; N]> for Permissions {
    fn from(value: [Permission; N]) -> Self {
        value.into_iter().fold(Self::NONE, |acc, p| acc.union(p.into()))
    }
}

impl fmt::Debug for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(Permission::name)).finish()
    }
}

/// How the acting context is exposed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessMode {
    /// End-user facing; hidden objects are filtered from queries by default.
    Frontend,
    /// Administrative; hidden objects stay visible in queries, grants and
    /// ownership still apply.
    Backend,
    /// Bypasses every check.
    SuperUser,
}

/// The acting principal as seen by the permission engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Principal {
    id: ObjectId,
    admin: bool,
}

impl Principal {
    /// A regular principal.
    pub const fn new(id: ObjectId) -> Self {
        Self { id, admin: false }
    }

    /// A principal carrying the administrator flag.
    pub const fn admin(id: ObjectId) -> Self {
        Self { id, admin: true }
    }

    /// Principal node id.
    pub const fn id(&self) -> ObjectId {
        self.id
    }

    /// Administrator flag.
    pub const fn is_admin(&self) -> bool {
        self.admin
    }
}

/// Per-operation identity and access-mode carrier.
///
/// Immutable once built and passed explicitly to every component. There is
/// no ambient "current user".
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecurityContext {
    principal: Option<Principal>,
    mode: AccessMode,
}

impl SecurityContext {
    /// Builds a context from an optional principal and an access mode.
    pub const fn new(principal: Option<Principal>, mode: AccessMode) -> Self {
        Self { principal, mode }
    }

    /// Anonymous, front-end context.
    pub const fn anonymous() -> Self {
        Self::new(None, AccessMode::Frontend)
    }

    /// Context that bypasses every check.
    pub const fn superuser() -> Self {
        Self::new(None, AccessMode::SuperUser)
    }

    /// Front-end context for a regular principal.
    pub const fn frontend(principal: ObjectId) -> Self {
        Self::new(Some(Principal::new(principal)), AccessMode::Frontend)
    }

    /// Back-end context for a regular principal.
    pub const fn backend(principal: ObjectId) -> Self {
        Self::new(Some(Principal::new(principal)), AccessMode::Backend)
    }

    /// Builds a context for a principal node stored in `store`, picking up
    /// its `isAdmin` flag.
    ///
    /// # Errors
    /// [`GraphError::NotFound`] if `id` is not a principal node.
    pub fn for_principal(
        schema: &Schema,
        store: &GraphStore,
        id: ObjectId,
        mode: AccessMode,
    ) -> Result<Self, GraphError> {
        let node = store
            .node(&id)
            .filter(|n| schema.is_principal(&n.ty))
            .ok_or_else(|| GraphError::not_found(format!("principal {id}")))?;
        let admin = node
            .property(keys::IS_ADMIN)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let principal = if admin {
            Principal::admin(id)
        } else {
            Principal::new(id)
        };
        Ok(Self::new(Some(principal), mode))
    }

    /// The acting principal, if any.
    pub const fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    /// Id of the acting principal, if any.
    pub fn principal_id(&self) -> Option<ObjectId> {
        self.principal.map(|p| p.id)
    }

    /// Access mode.
    pub const fn mode(&self) -> AccessMode {
        self.mode
    }

    /// `true` for the superuser mode and for administrator principals.
    pub fn is_super_user(&self) -> bool {
        self.mode == AccessMode::SuperUser || self.principal.is_some_and(|p| p.admin)
    }

    /// Asks the permission engine whether `permission` is granted on `object`.
    pub fn is_allowed(&self, store: &GraphStore, object: ObjectId, permission: Permission) -> bool {
        PermissionResolver::new(self, store).is_allowed(object, permission)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn permission_sets_merge_and_subtract() {
        let rw = Permissions::from([Permission::Read, Permission::Write]);
        assert!(rw.contains(Permission::Read));
        assert!(!rw.contains(Permission::Delete));
        let r = rw.difference(Permission::Write.into());
        assert_eq!(r, Permission::Read.into());
        assert!(r.difference(Permission::Read.into()).is_empty());
        assert_eq!(format!("{rw:?}"), r#"{"read", "write"}"#);
    }

    #[test]
    fn bitmask_validation() {
        assert_eq!(Permissions::from_bits(31).unwrap(), Permissions::ALL);
        assert!(Permissions::from_bits(32).is_err());
    }

    #[test]
    fn admin_principal_is_super_user() {
        let id = ObjectId::new();
        assert!(!SecurityContext::frontend(id).is_super_user());
        assert!(SecurityContext::new(Some(Principal::admin(id)), AccessMode::Frontend).is_super_user());
        assert!(SecurityContext::superuser().is_super_user());
        assert!(SecurityContext::anonymous().principal().is_none());
    }

    #[test]
    fn permission_names_parse() {
        assert_eq!(Permission::parse("AccessControl"), Some(Permission::AccessControl));
        assert_eq!(Permission::parse(" read "), Some(Permission::Read));
        assert_eq!(Permission::parse("fly"), None);
    }
}
