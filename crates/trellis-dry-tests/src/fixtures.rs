// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Sample schemas and principal helpers.
//!
//! Principals can only be created by a superuser, so every helper here runs
//! its own superuser transaction and returns the new id.

use trellis_core::{
    properties, CascadeFlags, Engine, NodeType, ObjectId, Permission, PropagationDirection,
    PropagationMode, PropagationRule, PropertyDef, PropertyKind, RelationshipType, SchemaBuilder,
    SecurityContext, Value, GROUP, USER,
};

/// Project node type.
pub const PROJECT: &str = "Project";
/// Task node type.
pub const TASK: &str = "Task";
/// Project to task relationship. Read and write flow from project to task.
pub const HAS_TASK: &str = "HAS_TASK";
/// Node type of the cascade tree.
pub const TREE_NODE: &str = "TreeNode";
/// Tree edge that cascades in both directions.
pub const CHILD: &str = "CHILD";
/// Tree edge without cascading.
pub const LEAF: &str = "LEAF";

/// Projects owning tasks.
///
/// `Task` carries `priority` (int), `done` (bool), `lat`/`lon` (double)
/// and a required `name`.
pub fn project_schema() -> SchemaBuilder {
    let propagation = PropagationRule::new(PropagationDirection::Out)
        .with(Permission::Read, PropagationMode::Add)
        .with(Permission::Write, PropagationMode::Add);
    SchemaBuilder::new()
        .node_type(
            NodeType::new(PROJECT)
                .property("name", PropertyDef::new(PropertyKind::String).required()),
        )
        .node_type(
            NodeType::new(TASK)
                .property("name", PropertyDef::new(PropertyKind::String).required())
                .property("priority", PropertyDef::new(PropertyKind::Int))
                .property("done", PropertyDef::new(PropertyKind::Bool))
                .property("lat", PropertyDef::new(PropertyKind::Double))
                .property("lon", PropertyDef::new(PropertyKind::Double)),
        )
        .relationship_type(
            RelationshipType::new(HAS_TASK)
                .between(PROJECT, TASK)
                .propagation(propagation),
        )
}

/// A single node type linked by a cascading `CHILD` edge and a plain
/// `LEAF` edge.
pub fn cascade_schema() -> SchemaBuilder {
    SchemaBuilder::new()
        .node_type(NodeType::new(TREE_NODE))
        .relationship_type(
            RelationshipType::new(CHILD)
                .between(TREE_NODE, TREE_NODE)
                .cascade(CascadeFlags::ALWAYS),
        )
        .relationship_type(RelationshipType::new(LEAF).between(TREE_NODE, TREE_NODE))
}

fn create_principal(engine: &Engine, ty: &str, name: &str, admin: bool) -> ObjectId {
    let mut props = properties([("name", Value::from(name))]);
    if admin {
        props.insert("isAdmin".into(), Value::Bool(true));
    }
    engine
        .transact(SecurityContext::superuser(), |tx| tx.create_node(ty, props))
        .expect("superuser can create principals")
}

/// Creates a `User` named `name`.
///
/// # Panics
/// If the commit fails.
pub fn create_user(engine: &Engine, name: &str) -> ObjectId {
    create_principal(engine, USER, name, false)
}

/// Creates a `User` with `isAdmin` set.
///
/// # Panics
/// If the commit fails.
pub fn create_admin(engine: &Engine, name: &str) -> ObjectId {
    create_principal(engine, USER, name, true)
}

/// Creates a `Group` named `name`.
///
/// # Panics
/// If the commit fails.
pub fn create_group(engine: &Engine, name: &str) -> ObjectId {
    create_principal(engine, GROUP, name, false)
}
