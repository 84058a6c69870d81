// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Type registry: node and relationship types, property definitions,
//! relationship constraints, validators and the lifecycle callback table.
//!
//! A type tag on a record selects its entry here; behaviour is looked up, not
//! dispatched through a class hierarchy. Node types may name a parent type;
//! properties, constraints, validators and callbacks are inherited down the
//! parent chain.
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::cascade::CascadeFlags;
use crate::error::GraphError;
use crate::graph::GraphStore;
use crate::ident::TypeName;
use crate::lifecycle::{Callback, CallbackContext, LifecycleEvent};
use crate::permission::PropagationRule;
use crate::record::{keys, Direction, NodeRecord};
use crate::validation::ErrorToken;

/// Abstract base type of users and groups.
pub const PRINCIPAL: &str = "Principal";
/// Built-in user type.
pub const USER: &str = "User";
/// Built-in group type.
pub const GROUP: &str = "Group";
/// Ownership relationship (principal → node).
pub const OWNS: &str = "OWNS";
/// Grant relationship (principal → object) carrying an `allowed` bitmask.
pub const SECURITY: &str = "SECURITY";
/// Group membership relationship (group → member).
pub const CONTAINS: &str = "CONTAINS";

/// Value kind of a declared property.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PropertyKind {
    /// UTF-8 string.
    String,
    /// Boolean.
    Bool,
    /// UTC timestamp.
    Date,
    /// 32-bit integer.
    Int,
    /// 64-bit integer.
    Long,
    /// Double precision float.
    Double,
    /// One of a fixed set of constants.
    Enum(Vec<String>),
    /// Reference to another object.
    Ref,
    /// Collection of references.
    RefList,
}

/// Additional format a string property must satisfy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PropertyFormat {
    /// `local@domain.tld`.
    Email,
}

/// Declared property of a type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropertyDef {
    /// Value kind.
    pub kind: PropertyKind,
    /// Must be present and non-empty at commit.
    pub required: bool,
    /// At most one node of the declaring type (subtypes included) may hold a
    /// given value.
    pub unique: bool,
    /// Maintained by the system; never writable, even by owners.
    pub read_only: bool,
    /// Writable only by superuser contexts.
    pub privileged: bool,
    /// Optional string format.
    pub format: Option<PropertyFormat>,
}

impl PropertyDef {
    /// A plain optional property of `kind`.
    pub const fn new(kind: PropertyKind) -> Self {
        Self {
            kind,
            required: false,
            unique: false,
            read_only: false,
            privileged: false,
            format: None,
        }
    }

    /// Marks the property required.
    #[must_use]
    pub const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Marks the property unique.
    #[must_use]
    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Marks the property read-only.
    #[must_use]
    pub const fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Marks the property privileged.
    #[must_use]
    pub const fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    /// Adds a format constraint.
    #[must_use]
    pub const fn format(mut self, format: PropertyFormat) -> Self {
        self.format = Some(format);
        self
    }
}

/// A node of the declaring type must have at least one relationship of
/// `rel_type` in `direction`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelationshipConstraint {
    /// Required relationship type.
    pub rel_type: TypeName,
    /// Direction relative to the constrained node.
    pub direction: Direction,
}

/// Custom node validator run at commit.
pub type Validator = Arc<dyn Fn(&NodeRecord, &GraphStore) -> Vec<ErrorToken> + Send + Sync>;

/// A node type.
#[derive(Clone)]
pub struct NodeType {
    name: TypeName,
    parent: Option<TypeName>,
    properties: BTreeMap<String, PropertyDef>,
    constraints: Vec<RelationshipConstraint>,
    validators: Vec<Validator>,
    owned: bool,
    closed: bool,
}

impl NodeType {
    /// New root type. Instances get an owner on creation by default.
    pub fn new(name: impl Into<TypeName>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            properties: BTreeMap::new(),
            constraints: Vec::new(),
            validators: Vec::new(),
            owned: true,
            closed: false,
        }
    }

    /// Sets the parent type.
    #[must_use]
    pub fn extends(mut self, parent: impl Into<TypeName>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Declares a property.
    #[must_use]
    pub fn property(mut self, key: impl Into<String>, def: PropertyDef) -> Self {
        self.properties.insert(key.into(), def);
        self
    }

    /// Requires a relationship of `rel_type` in `direction`.
    #[must_use]
    pub fn requires(mut self, rel_type: impl Into<TypeName>, direction: Direction) -> Self {
        self.constraints.push(RelationshipConstraint {
            rel_type: rel_type.into(),
            direction,
        });
        self
    }

    /// Adds a custom validator.
    #[must_use]
    pub fn validator<F>(mut self, f: F) -> Self
    where
        F: Fn(&NodeRecord, &GraphStore) -> Vec<ErrorToken> + Send + Sync + 'static,
    {
        self.validators.push(Arc::new(f));
        self
    }

    /// Instances are created without an owner.
    #[must_use]
    pub fn unowned(mut self) -> Self {
        self.owned = false;
        self
    }

    /// Undeclared properties are rejected at commit.
    #[must_use]
    pub fn closed(mut self) -> Self {
        self.closed = true;
        self
    }

    /// Type name.
    pub fn name(&self) -> &TypeName {
        &self.name
    }

    /// Parent type, if any.
    pub fn parent(&self) -> Option<&TypeName> {
        self.parent.as_ref()
    }

    /// Properties declared directly on this type.
    pub fn properties(&self) -> &BTreeMap<String, PropertyDef> {
        &self.properties
    }

    /// Constraints declared directly on this type.
    pub fn constraints(&self) -> &[RelationshipConstraint] {
        &self.constraints
    }

    /// Validators declared directly on this type.
    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    /// Whether instances get an owner on creation.
    pub const fn is_owned(&self) -> bool {
        self.owned
    }

    /// Whether undeclared properties are rejected.
    pub const fn is_closed(&self) -> bool {
        self.closed
    }
}

impl fmt::Debug for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeType")
            .field("name", &self.name)
            .field("parent", &self.parent)
            .field("properties", &self.properties)
            .field("constraints", &self.constraints)
            .field("validators", &self.validators.len())
            .field("owned", &self.owned)
            .finish_non_exhaustive()
    }
}

/// A relationship type.
#[derive(Clone, Debug, PartialEq)]
pub struct RelationshipType {
    name: TypeName,
    source: Option<TypeName>,
    target: Option<TypeName>,
    default_cascade: CascadeFlags,
    propagation: Option<PropagationRule>,
    system: bool,
}

impl RelationshipType {
    /// An unconstrained relationship type without cascading.
    pub fn new(name: impl Into<TypeName>) -> Self {
        Self {
            name: name.into(),
            source: None,
            target: None,
            default_cascade: CascadeFlags::NONE,
            propagation: None,
            system: false,
        }
    }

    /// Restricts endpoints to the given node types (subtypes accepted).
    #[must_use]
    pub fn between(mut self, source: impl Into<TypeName>, target: impl Into<TypeName>) -> Self {
        self.source = Some(source.into());
        self.target = Some(target.into());
        self
    }

    /// Cascade bitmask given to new instances.
    #[must_use]
    pub const fn cascade(mut self, flags: CascadeFlags) -> Self {
        self.default_cascade = flags;
        self
    }

    /// Initial propagation rule, installed when the engine starts.
    #[must_use]
    pub const fn propagation(mut self, rule: PropagationRule) -> Self {
        self.propagation = Some(rule);
        self
    }

    const fn system(mut self) -> Self {
        self.system = true;
        self
    }

    /// Type name.
    pub fn name(&self) -> &TypeName {
        &self.name
    }

    /// Required source type.
    pub fn source(&self) -> Option<&TypeName> {
        self.source.as_ref()
    }

    /// Required target type.
    pub fn target(&self) -> Option<&TypeName> {
        self.target.as_ref()
    }

    /// Cascade bitmask for new instances.
    pub const fn default_cascade(&self) -> CascadeFlags {
        self.default_cascade
    }

    /// Initial propagation rule.
    pub const fn initial_propagation(&self) -> Option<PropagationRule> {
        self.propagation
    }

    /// System relationships are managed only through their dedicated
    /// operations (ownership, grants, membership).
    pub const fn is_system(&self) -> bool {
        self.system
    }
}

/// Immutable type registry shared by an engine.
#[derive(Clone)]
pub struct Schema {
    nodes: BTreeMap<TypeName, NodeType>,
    relationships: BTreeMap<TypeName, RelationshipType>,
    common: BTreeMap<String, PropertyDef>,
    callbacks: BTreeMap<(TypeName, LifecycleEvent), Vec<Callback>>,
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("relationships", &self.relationships.keys().collect::<Vec<_>>())
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

impl Schema {
    /// Starts a builder preloaded with the built-in types.
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::new()
    }

    /// Node type by name.
    pub fn node_type(&self, name: &str) -> Option<&NodeType> {
        self.nodes.get(name)
    }

    /// Relationship type by name.
    pub fn relationship_type(&self, name: &str) -> Option<&RelationshipType> {
        self.relationships.get(name)
    }

    /// All relationship types.
    pub fn relationship_types(&self) -> impl Iterator<Item = &RelationshipType> {
        self.relationships.values()
    }

    /// The type followed by its ancestors, nearest first.
    pub fn ancestors<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a NodeType> + 'a {
        let mut next = self.nodes.get(name);
        std::iter::from_fn(move || {
            let current = next?;
            next = current.parent.as_ref().and_then(|p| self.nodes.get(p));
            Some(current)
        })
    }

    /// Returns `true` if `ty` is `ancestor` or inherits from it.
    pub fn is_subtype(&self, ty: &str, ancestor: &str) -> bool {
        self.ancestors(ty).any(|t| t.name == ancestor)
    }

    /// `ty` and every type inheriting from it.
    pub fn subtypes_of(&self, ty: &str) -> Vec<TypeName> {
        self.nodes
            .keys()
            .filter(|name| self.is_subtype(name.as_str(), ty))
            .cloned()
            .collect()
    }

    /// Returns `true` for users, groups and their subtypes.
    pub fn is_principal(&self, ty: &TypeName) -> bool {
        self.is_subtype(ty.as_str(), PRINCIPAL)
    }

    /// Returns `true` for groups and their subtypes.
    pub fn is_group(&self, ty: &TypeName) -> bool {
        self.is_subtype(ty.as_str(), GROUP)
    }

    /// Effective definition of `key` on node type `ty`: nearest declaration
    /// wins, then the properties common to every node.
    pub fn property_def(&self, ty: &str, key: &str) -> Option<&PropertyDef> {
        self.ancestors(ty)
            .find_map(|t| t.properties.get(key))
            .or_else(|| self.common.get(key))
    }

    /// Effective property definitions of `ty`, including inherited ones.
    pub fn properties_of(&self, ty: &str) -> BTreeMap<&str, &PropertyDef> {
        let mut out: BTreeMap<&str, &PropertyDef> =
            self.common.iter().map(|(k, d)| (k.as_str(), d)).collect();
        let chain: Vec<_> = self.ancestors(ty).collect();
        for t in chain.into_iter().rev() {
            out.extend(t.properties.iter().map(|(k, d)| (k.as_str(), d)));
        }
        out
    }

    /// Relationship constraints of `ty`, including inherited ones.
    pub fn constraints_of<'a>(
        &'a self,
        ty: &str,
    ) -> impl Iterator<Item = &'a RelationshipConstraint> + 'a {
        self.ancestors(ty).flat_map(|t| t.constraints.iter())
    }

    /// Validators of `ty`, including inherited ones.
    pub fn validators_of<'a>(&'a self, ty: &str) -> impl Iterator<Item = &'a Validator> + 'a {
        self.ancestors(ty).flat_map(|t| t.validators.iter())
    }

    /// Whether instances of `ty` get an owner on creation.
    pub fn is_owned(&self, ty: &str) -> bool {
        self.node_type(ty).is_some_and(NodeType::is_owned)
    }

    /// Callbacks for `event` on `ty`: the furthest ancestor's first, each
    /// list in registration order.
    pub fn callbacks(&self, ty: &TypeName, event: LifecycleEvent) -> Vec<&Callback> {
        let mut chain: Vec<TypeName> = self.ancestors(ty.as_str()).map(|t| t.name.clone()).collect();
        if chain.is_empty() {
            chain.push(ty.clone());
        }
        chain
            .into_iter()
            .rev()
            .filter_map(|name| self.callbacks.get(&(name, event)))
            .flatten()
            .collect()
    }

    /// Runs the callbacks for `ctx.event` on the object's type in order,
    /// stopping at the first error.
    ///
    /// # Errors
    /// Whatever a callback returns.
    pub fn fire(&self, ctx: &CallbackContext<'_>) -> Result<(), GraphError> {
        for cb in self.callbacks(ctx.object.type_name(), ctx.event) {
            cb(ctx)?;
        }
        Ok(())
    }
}

/// Assembles a [`Schema`].
///
/// Registration errors (duplicates, unknown parents, parent cycles, unknown
/// endpoint types) are collected and reported by [`SchemaBuilder::build`].
pub struct SchemaBuilder {
    schema: Schema,
    errors: Vec<String>,
}

impl Default for SchemaBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaBuilder {
    /// Builder holding the built-in principal and system relationship types.
    pub fn new() -> Self {
        let flag = || PropertyDef::new(PropertyKind::Bool);
        let common = [
            (keys::NAME, PropertyDef::new(PropertyKind::String)),
            (keys::HIDDEN, flag()),
            (keys::DELETED, flag()),
            (keys::VISIBLE_TO_PUBLIC_USERS, flag()),
            (keys::VISIBLE_TO_AUTHENTICATED_USERS, flag()),
        ]
        .into_iter()
        .map(|(k, d)| (k.to_owned(), d))
        .collect();
        let mut builder = Self {
            schema: Schema {
                nodes: BTreeMap::new(),
                relationships: BTreeMap::new(),
                common,
                callbacks: BTreeMap::new(),
            },
            errors: Vec::new(),
        };
        let principal = NodeType::new(PRINCIPAL)
            .unowned()
            .property(
                keys::EMAIL,
                PropertyDef::new(PropertyKind::String)
                    .unique()
                    .format(PropertyFormat::Email),
            )
            .property(keys::IS_ADMIN, PropertyDef::new(PropertyKind::Bool).privileged());
        let user = NodeType::new(USER).extends(PRINCIPAL).unowned();
        let group = NodeType::new(GROUP).extends(PRINCIPAL).unowned();
        builder = builder.node_type(principal).node_type(user).node_type(group);
        for rel in [
            RelationshipType::new(OWNS).between(PRINCIPAL, "*"),
            RelationshipType::new(SECURITY).between(PRINCIPAL, "*"),
            RelationshipType::new(CONTAINS).between(GROUP, PRINCIPAL),
        ] {
            builder = builder.relationship_type(rel.system());
        }
        builder
    }

    /// Registers a node type.
    #[must_use]
    pub fn node_type(mut self, ty: NodeType) -> Self {
        if self.schema.nodes.contains_key(&ty.name)
            || self.schema.relationships.contains_key(&ty.name)
        {
            self.errors.push(format!("duplicate type `{}`", ty.name));
        } else {
            self.schema.nodes.insert(ty.name.clone(), ty);
        }
        self
    }

    /// Registers a relationship type.
    #[must_use]
    pub fn relationship_type(mut self, ty: RelationshipType) -> Self {
        if self.schema.nodes.contains_key(&ty.name)
            || self.schema.relationships.contains_key(&ty.name)
        {
            self.errors.push(format!("duplicate type `{}`", ty.name));
        } else {
            self.schema.relationships.insert(ty.name.clone(), ty);
        }
        self
    }

    /// Appends a callback for `event` on type `ty` (node or relationship type).
    #[must_use]
    pub fn on<F>(mut self, ty: impl Into<TypeName>, event: LifecycleEvent, f: F) -> Self
    where
        F: Fn(&CallbackContext<'_>) -> Result<(), GraphError> + Send + Sync + 'static,
    {
        self.schema
            .callbacks
            .entry((ty.into(), event))
            .or_default()
            .push(Arc::new(f));
        self
    }

    /// Validates cross references and returns the schema.
    ///
    /// # Errors
    /// [`GraphError::Configuration`] listing every registration problem.
    pub fn build(self) -> Result<Schema, GraphError> {
        let Self { schema, mut errors } = self;
        for ty in schema.nodes.values() {
            if let Some(parent) = &ty.parent {
                if !schema.nodes.contains_key(parent) {
                    errors.push(format!("type `{}` extends unknown type `{parent}`", ty.name));
                    continue;
                }
            }
            let mut seen = vec![&ty.name];
            let mut cursor = ty.parent.as_ref();
            while let Some(p) = cursor {
                if seen.contains(&p) {
                    errors.push(format!("type `{}` has a cyclic parent chain", ty.name));
                    break;
                }
                seen.push(p);
                cursor = schema.nodes.get(p).and_then(|t| t.parent.as_ref());
            }
        }
        for rel in schema.relationships.values() {
            for end in [&rel.source, &rel.target].into_iter().flatten() {
                if end != "*" && !schema.nodes.contains_key(end) {
                    errors.push(format!(
                        "relationship type `{}` references unknown type `{end}`",
                        rel.name
                    ));
                }
            }
        }
        for (ty, _) in schema.callbacks.keys() {
            if !schema.nodes.contains_key(ty) && !schema.relationships.contains_key(ty) {
                errors.push(format!("callback registered for unknown type `{ty}`"));
            }
        }
        if errors.is_empty() {
            Ok(schema)
        } else {
            Err(GraphError::configuration(errors.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::panic)]
    use super::*;

    #[test]
    fn builtins_are_principals() {
        let schema = Schema::builder().build().unwrap();
        assert!(schema.is_principal(&TypeName::from(USER)));
        assert!(schema.is_group(&TypeName::from(GROUP)));
        assert!(!schema.is_group(&TypeName::from(USER)));
        let email = schema.property_def(USER, keys::EMAIL).unwrap();
        assert!(email.unique);
        assert_eq!(email.format, Some(PropertyFormat::Email));
        assert!(schema.property_def(GROUP, keys::IS_ADMIN).unwrap().privileged);
        assert!(!schema.is_owned(USER));
    }

    #[test]
    fn inheritance_resolves_nearest_definition() {
        let schema = Schema::builder()
            .node_type(NodeType::new("Doc").property("title", PropertyDef::new(PropertyKind::String)))
            .node_type(
                NodeType::new("Memo")
                    .extends("Doc")
                    .property("title", PropertyDef::new(PropertyKind::String).required()),
            )
            .build()
            .unwrap();
        assert!(schema.property_def("Memo", "title").unwrap().required);
        assert!(!schema.property_def("Doc", "title").unwrap().required);
        assert!(schema.property_def("Memo", keys::HIDDEN).is_some());
        assert_eq!(
            schema.subtypes_of("Doc"),
            vec![TypeName::from("Doc"), TypeName::from("Memo")]
        );
        assert!(schema.properties_of("Memo")["title"].required);
    }

    #[test]
    fn build_reports_registration_errors() {
        let err = Schema::builder()
            .node_type(NodeType::new("A").extends("B"))
            .node_type(NodeType::new(USER))
            .relationship_type(RelationshipType::new("R").between("A", "Nope"))
            .build()
            .unwrap_err();
        let GraphError::Configuration(msg) = err else {
            panic!("expected configuration error, got {err:?}");
        };
        assert!(msg.contains("unknown type `B`"), "{msg}");
        assert!(msg.contains("duplicate type `User`"), "{msg}");
        assert!(msg.contains("unknown type `Nope`"), "{msg}");
    }

    #[test]
    fn parent_cycles_are_rejected() {
        let err = Schema::builder()
            .node_type(NodeType::new("A").extends("B"))
            .node_type(NodeType::new("B").extends("A"))
            .build()
            .unwrap_err();
        assert!(matches!(err, GraphError::Configuration(_)));
    }
}
