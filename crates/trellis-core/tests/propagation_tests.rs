// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

#![allow(missing_docs, clippy::unwrap_used, clippy::expect_used)]
mod common;

use common::{create_project, create_tasks, init_tracing, project_engine};
use trellis_core::{
    Direction, Engine, GraphError, NodeType, ObjectId, Permission, Permissions, PropagationDirection,
    PropagationMode, PropagationRule, PropertyMap, RelationshipType, SchemaBuilder,
    SecurityContext,
};
use trellis_dry_tests::{create_user, EngineTestBuilder, HAS_TASK};

const ITEM: &str = "Item";
const LINK: &str = "LINK";

fn item_engine() -> Engine {
    init_tracing();
    EngineTestBuilder::new()
        .with_schema(
            SchemaBuilder::new()
                .node_type(NodeType::new(ITEM))
                .relationship_type(RelationshipType::new(LINK).between(ITEM, ITEM)),
        )
        .build()
}

struct Fixture {
    engine: Engine,
    user: ObjectId,
    owned: ObjectId,
    other: ObjectId,
}

/// `owned` belongs to `user`; `other` has no owner. They are joined by one
/// `LINK`, from `owned` to `other` when `owned_is_source`.
fn linked(rule: Option<PropagationRule>, owned_is_source: bool) -> Fixture {
    let engine = item_engine();
    let user = create_user(&engine, "ann");
    let (owned, other) = engine
        .transact(SecurityContext::superuser(), |tx| {
            let owned = tx.create_node(ITEM, PropertyMap::new())?;
            let other = tx.create_node(ITEM, PropertyMap::new())?;
            tx.set_owner(owned, user)?;
            let (from, to) = if owned_is_source {
                (owned, other)
            } else {
                (other, owned)
            };
            tx.create_relationship(LINK, from, to, PropertyMap::new())?;
            tx.set_propagation(LINK, rule)?;
            Ok((owned, other))
        })
        .expect("fixture commits");
    Fixture {
        engine,
        user,
        owned,
        other,
    }
}

fn read_rule(direction: PropagationDirection) -> PropagationRule {
    PropagationRule::new(direction).with(Permission::Read, PropagationMode::Add)
}

fn can_read_other(rule: Option<PropagationRule>, owned_is_source: bool) -> bool {
    let fx = linked(rule, owned_is_source);
    assert!(fx
        .engine
        .is_allowed(&SecurityContext::frontend(fx.user), fx.owned, Permission::Read));
    fx.engine
        .is_allowed(&SecurityContext::frontend(fx.user), fx.other, Permission::Read)
}

#[test]
fn out_flows_from_source_to_target() {
    assert!(can_read_other(Some(read_rule(PropagationDirection::Out)), true));
    assert!(!can_read_other(Some(read_rule(PropagationDirection::Out)), false));
}

#[test]
fn in_flows_from_target_to_source() {
    assert!(!can_read_other(Some(read_rule(PropagationDirection::In)), true));
    assert!(can_read_other(Some(read_rule(PropagationDirection::In)), false));
}

#[test]
fn both_flows_either_way() {
    assert!(can_read_other(Some(read_rule(PropagationDirection::Both)), true));
    assert!(can_read_other(Some(read_rule(PropagationDirection::Both)), false));
}

#[test]
fn none_and_missing_rules_flow_nowhere() {
    for owned_is_source in [true, false] {
        assert!(!can_read_other(Some(read_rule(PropagationDirection::None)), owned_is_source));
        assert!(!can_read_other(None, owned_is_source));
    }
}

#[test]
fn keep_mode_withholds_the_permission() {
    let fx = linked(Some(read_rule(PropagationDirection::Out)), true);
    let ctx = SecurityContext::frontend(fx.user);
    assert_eq!(fx.engine.permissions(&ctx, fx.other), Permission::Read.into());
}

#[test]
fn propagation_is_transitive_and_terminates_on_cycles() {
    let engine = item_engine();
    let user = create_user(&engine, "ann");
    let (a, c, stray) = engine
        .transact(SecurityContext::superuser(), |tx| {
            let a = tx.create_node(ITEM, PropertyMap::new())?;
            let b = tx.create_node(ITEM, PropertyMap::new())?;
            let c = tx.create_node(ITEM, PropertyMap::new())?;
            let stray = tx.create_node(ITEM, PropertyMap::new())?;
            tx.set_owner(a, user)?;
            tx.create_relationship(LINK, a, b, PropertyMap::new())?;
            tx.create_relationship(LINK, b, c, PropertyMap::new())?;
            tx.create_relationship(LINK, c, b, PropertyMap::new())?;
            tx.create_relationship(LINK, stray, c, PropertyMap::new())?;
            tx.set_propagation(LINK, Some(read_rule(PropagationDirection::Out)))?;
            Ok((a, c, stray))
        })
        .unwrap();
    let ctx = SecurityContext::frontend(user);
    assert!(engine.is_allowed(&ctx, c, Permission::Read));
    assert!(!engine.is_allowed(&ctx, stray, Permission::Read));
    assert_eq!(
        engine
            .traverse(&ctx, a, Some(LINK), Direction::Outgoing, 5)
            .unwrap()
            .len(),
        2
    );
}

#[test]
fn schema_rules_are_installed_and_replaceable() {
    let engine = project_engine();
    let rule = engine.propagation_rule(HAS_TASK).expect("fixture rule");
    assert_eq!(rule.to_string(), "Out; read:add, write:add");

    let ann = create_user(&engine, "ann");
    let bob = create_user(&engine, "bob");
    let ann_ctx = SecurityContext::frontend(ann);
    let project = create_project(&engine, &ann_ctx, "alpha");
    let task = create_tasks(&engine, &ann_ctx, project, &[("t", None)])[0];
    engine
        .transact(ann_ctx, |tx| tx.grant(project, bob, Permissions::ALL))
        .unwrap();
    let bob_ctx = SecurityContext::frontend(bob);
    assert_eq!(
        engine.permissions(&bob_ctx, task),
        Permissions::from([Permission::Read, Permission::Write])
    );

    let read_only: PropagationRule = "Out; read:add".parse().unwrap();
    engine
        .transact(SecurityContext::superuser(), |tx| {
            tx.set_propagation(HAS_TASK, Some(read_only))
        })
        .unwrap();
    assert_eq!(engine.propagation_rule(HAS_TASK), Some(read_only));
    assert_eq!(engine.permissions(&bob_ctx, task), Permission::Read.into());
}

#[test]
fn only_superusers_change_rules() {
    let engine = project_engine();
    let ann = create_user(&engine, "ann");
    let err = engine
        .transact(SecurityContext::frontend(ann), |tx| {
            tx.set_propagation(HAS_TASK, None)
        })
        .unwrap_err();
    assert!(matches!(err, GraphError::Authorization { .. }));
    assert!(engine.propagation_rule(HAS_TASK).is_some());

    let err = engine
        .transact(SecurityContext::superuser(), |tx| {
            tx.set_propagation("NO_SUCH_TYPE", None)
        })
        .unwrap_err();
    assert!(matches!(err, GraphError::NotFound { .. }));
}
