// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

#![allow(missing_docs, clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod common;

use std::sync::Barrier;

use common::{create_project, init_tracing, project_engine, task_props};
use trellis_core::{
    keys, properties, Direction, Engine, ErrorToken, GraphError, GraphStore, NodeRecord,
    NodeType, ObjectId, Permission, Permissions, PropertyDef, PropertyKind, PropertyMap,
    SchemaBuilder, SecurityContext, Tx, TxOutcome, Value, ViolationKind, CONTAINS, GROUP, OWNS,
    SECURITY, USER,
};
use trellis_dry_tests::{create_group, create_user, EngineTestBuilder, HAS_TASK, PROJECT, TASK};

fn violations(err: GraphError) -> Vec<ErrorToken> {
    match err {
        GraphError::Validation(report) => report.tokens().to_vec(),
        other => panic!("expected a validation failure, got {other}"),
    }
}

fn principal(name: &str, email: &str) -> PropertyMap {
    properties([(keys::NAME, name), (keys::EMAIL, email)])
}

#[test]
fn email_is_unique_across_every_principal_type() {
    let engine = project_engine();
    let su = SecurityContext::superuser();
    let ann = engine
        .transact(su.clone(), |tx| tx.create_node(USER, principal("ann", "a@b.io")))
        .unwrap();
    let before = engine.state_hash();

    let err = engine
        .transact(su.clone(), |tx| tx.create_node(GROUP, principal("staff", "a@b.io")))
        .unwrap_err();
    let tokens = violations(err);
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].kind, ViolationKind::Unique);
    assert_eq!(tokens[0].to_string(), "Group.eMail already taken (a@b.io)");
    assert_eq!(engine.state_hash(), before);

    engine
        .transact(su.clone(), |tx| {
            tx.set_property(ann, keys::EMAIL, "a@b.io")?;
            tx.create_node(USER, principal("bob", "bob@b.io"))
        })
        .unwrap();
}

#[test]
fn two_new_principals_sharing_an_address_both_fail() {
    let engine = project_engine();
    let err = engine
        .transact(SecurityContext::superuser(), |tx| {
            tx.create_node(USER, principal("ann", "same@b.io"))?;
            tx.create_node(USER, principal("bob", "same@b.io"))
        })
        .unwrap_err();
    let tokens = violations(err);
    assert_eq!(tokens.len(), 2);
    assert!(tokens.iter().all(|t| t.kind == ViolationKind::Unique));
}

#[test]
fn email_must_look_like_an_address() {
    let engine = project_engine();
    let err = engine
        .transact(SecurityContext::superuser(), |tx| {
            tx.create_node(USER, principal("ann", "not-an-address"))
        })
        .unwrap_err();
    let tokens = violations(err);
    assert_eq!(tokens[0].kind, ViolationKind::Format);
    assert_eq!(tokens[0].property.as_deref(), Some(keys::EMAIL));
}

#[test]
fn required_properties_are_checked_at_commit() {
    let engine = project_engine();
    let ann = SecurityContext::frontend(create_user(&engine, "ann"));

    let err = engine
        .transact(ann.clone(), |tx| tx.create_node(PROJECT, PropertyMap::new()))
        .unwrap_err();
    let tokens = violations(err);
    assert_eq!(tokens[0].kind, ViolationKind::Required);
    assert_eq!(tokens[0].to_string(), "Project.name must not be empty");

    let err = engine
        .transact(ann.clone(), |tx| {
            tx.create_node(PROJECT, properties([("name", "")]))
        })
        .unwrap_err();
    assert_eq!(violations(err)[0].kind, ViolationKind::Required);

    // Intermediate states may be invalid.
    let project = create_project(&engine, &ann, "alpha");
    engine
        .transact(ann.clone(), |tx| {
            tx.remove_property(project, "name")?;
            tx.set_property(project, "name", "beta")
        })
        .unwrap();

    let err = engine
        .transact(ann, |tx| tx.remove_property(project, "name"))
        .unwrap_err();
    assert_eq!(violations(err)[0].object, Some(project));
}

#[test]
fn declared_kinds_are_enforced() {
    let engine = project_engine();
    let ann = SecurityContext::frontend(create_user(&engine, "ann"));
    let project = create_project(&engine, &ann, "p");
    for bad in [Value::Long(3), Value::from("high"), Value::Bool(true)] {
        let err = engine
            .transact(ann.clone(), |tx| {
                let mut props = task_props("t", None);
                props.insert("priority".into(), bad.clone());
                let task = tx.create_node(TASK, props)?;
                tx.create_relationship(HAS_TASK, project, task, PropertyMap::new())
            })
            .unwrap_err();
        let tokens = violations(err);
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].kind, ViolationKind::TypeMismatch);
        assert_eq!(tokens[0].value.as_ref(), Some(&bad));
    }

    engine
        .transact(ann, |tx| {
            let mut props = task_props("t", Some(3));
            props.insert("lat".into(), Value::Int(52));
            tx.create_node(TASK, props)
        })
        .unwrap();
}

#[test]
fn every_violation_is_reported_together() {
    let engine = project_engine();
    let ann = SecurityContext::frontend(create_user(&engine, "ann"));
    let err = engine
        .transact(ann, |tx| {
            tx.create_node(PROJECT, PropertyMap::new())?;
            tx.create_node(TASK, properties([("done", Value::from("yes"))]))
        })
        .unwrap_err();
    let GraphError::Validation(report) = err else {
        panic!("expected a validation failure");
    };
    assert_eq!(report.tokens().len(), 3);
    assert!(report.has(&ViolationKind::Required));
    assert!(report.has(&ViolationKind::TypeMismatch));
    assert!(!report.has(&ViolationKind::Unique));
}

#[test]
fn relationship_endpoints_must_match_the_type() {
    let engine = project_engine();
    let su = SecurityContext::superuser();
    let err = engine
        .transact(su, |tx| {
            let project = tx.create_node(PROJECT, properties([("name", "p")]))?;
            let task = tx.create_node(TASK, task_props("t", None))?;
            tx.create_relationship(HAS_TASK, task, project, PropertyMap::new())
        })
        .unwrap_err();
    let tokens = violations(err);
    let labels: Vec<_> = tokens.iter().filter_map(|t| t.property.as_deref()).collect();
    assert_eq!(labels, vec!["from", "to"]);
    assert!(tokens.iter().all(|t| t.kind == ViolationKind::TypeMismatch));
}

fn strict_engine() -> Engine {
    init_tracing();
    let bounds = |node: &NodeRecord, _: &GraphStore| {
        let lo = node.property("lo").and_then(Value::as_i64);
        let hi = node.property("hi").and_then(Value::as_i64);
        match lo.zip(hi) {
            Some((lo, hi)) if lo > hi => vec![ErrorToken::for_node(
                node,
                Some("lo"),
                ViolationKind::Custom("exceeds hi".into()),
            )],
            _ => Vec::new(),
        }
    };
    EngineTestBuilder::new()
        .with_schema(
            SchemaBuilder::new().node_type(
                NodeType::new("Span")
                    .closed()
                    .property("lo", PropertyDef::new(PropertyKind::Int))
                    .property("hi", PropertyDef::new(PropertyKind::Int))
                    .validator(bounds),
            ),
        )
        .build()
}

#[test]
fn closed_types_reject_undeclared_properties() {
    let engine = strict_engine();
    let su = SecurityContext::superuser();
    let err = engine
        .transact(su.clone(), |tx| {
            tx.create_node("Span", properties([("lo", 1_i32), ("width", 4_i32)]))
        })
        .unwrap_err();
    let tokens = violations(err);
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].kind, ViolationKind::UnknownProperty);
    assert_eq!(tokens[0].property.as_deref(), Some("width"));

    engine
        .transact(su, |tx| {
            tx.create_node("Span", properties([("lo", 1_i32), ("hi", 4_i32)]))
        })
        .unwrap();
}

#[test]
fn custom_validators_run_on_every_write() {
    let engine = strict_engine();
    let su = SecurityContext::superuser();
    let span = engine
        .transact(su.clone(), |tx| {
            tx.create_node("Span", properties([("lo", 1_i32), ("hi", 4_i32)]))
        })
        .unwrap();
    let err = engine
        .transact(su, |tx| tx.set_property(span, "lo", 5_i32))
        .unwrap_err();
    let tokens = violations(err);
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].to_string(), "Span.lo exceeds hi (5)");
    assert_eq!(tokens[0].object, Some(span));
}

#[test]
fn uniqueness_holds_against_concurrent_commits() {
    let engine = project_engine();
    let su = SecurityContext::superuser();
    let mut late = engine.begin(su.clone());
    late.create_node(USER, principal("ann", "race@b.io")).unwrap();

    std::thread::scope(|s| {
        s.spawn(|| {
            engine
                .transact(su.clone(), |tx| tx.create_node(USER, principal("bob", "race@b.io")))
                .expect("first writer commits");
        });
    });

    late.success();
    let tokens = violations(late.finish().unwrap_err());
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].kind, ViolationKind::Unique);
    assert_eq!(
        tokens[0].value.as_ref().and_then(Value::as_str),
        Some("race@b.io")
    );
}

type Write<'w> = &'w (dyn Fn(&Tx<'_>) -> Result<(), GraphError> + Sync);

/// Two superuser transactions apply their writes on snapshots taken before
/// either commits, then commit one after the other.
fn race(engine: &Engine, writes: [Write<'_>; 2]) -> Vec<Result<TxOutcome, GraphError>> {
    let barrier = Barrier::new(2);
    std::thread::scope(|s| {
        let handles: Vec<_> = writes
            .into_iter()
            .map(|write| {
                let barrier = &barrier;
                s.spawn(move || {
                    let mut tx = engine.begin(SecurityContext::superuser());
                    write(&tx).expect("write applies to the snapshot");
                    barrier.wait();
                    tx.success();
                    tx.finish()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("writer thread"))
            .collect()
    })
}

/// Exactly one writer wins; the other fails with a uniqueness violation.
fn one_winner(results: Vec<Result<TxOutcome, GraphError>>) {
    let (won, lost): (Vec<_>, Vec<_>) = results.into_iter().partition(Result::is_ok);
    assert_eq!(won.len(), 1);
    let err = lost.into_iter().next().and_then(Result::err).expect("one loser");
    let tokens = violations(err);
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].kind, ViolationKind::Unique);
}

fn edges(engine: &Engine, node: ObjectId, ty: &str, from: Option<ObjectId>) -> usize {
    engine
        .relationships(&SecurityContext::superuser(), node, Direction::Incoming)
        .unwrap()
        .iter()
        .filter(|r| r.ty == ty && (from.is_none() || from == Some(r.from)))
        .count()
}

fn unowned_project(engine: &Engine) -> ObjectId {
    engine
        .transact(SecurityContext::superuser(), |tx| {
            tx.create_node(PROJECT, properties([("name", "shared")]))
        })
        .unwrap()
}

#[test]
fn concurrent_grants_keep_one_edge_per_principal() {
    let engine = project_engine();
    let bob = create_user(&engine, "bob");
    let project = unowned_project(&engine);

    one_winner(race(
        &engine,
        [
            &|tx| tx.grant(project, bob, Permission::Read),
            &|tx| tx.grant(project, bob, Permission::Write),
        ],
    ));
    assert_eq!(edges(&engine, project, SECURITY, Some(bob)), 1);

    engine
        .transact(SecurityContext::superuser(), |tx| {
            tx.revoke(project, bob, Permissions::ALL)
        })
        .unwrap();
    assert_eq!(edges(&engine, project, SECURITY, Some(bob)), 0);
    assert_eq!(
        engine.permissions(&SecurityContext::frontend(bob), project),
        Permissions::NONE
    );
}

#[test]
fn concurrent_first_owners_cannot_both_win() {
    let engine = project_engine();
    let ann = create_user(&engine, "ann");
    let bob = create_user(&engine, "bob");
    let project = unowned_project(&engine);
    assert_eq!(edges(&engine, project, OWNS, None), 0);

    one_winner(race(
        &engine,
        [&|tx| tx.set_owner(project, ann), &|tx| tx.set_owner(project, bob)],
    ));
    assert_eq!(edges(&engine, project, OWNS, None), 1);
    let owner = engine
        .owner(&SecurityContext::superuser(), project)
        .unwrap()
        .expect("owned");
    assert!(owner == ann || owner == bob);
}

#[test]
fn concurrent_memberships_are_not_duplicated() {
    let engine = project_engine();
    let staff = create_group(&engine, "staff");
    let bob = create_user(&engine, "bob");

    one_winner(race(
        &engine,
        [&|tx| tx.add_member(staff, bob), &|tx| tx.add_member(staff, bob)],
    ));
    assert_eq!(edges(&engine, bob, CONTAINS, Some(staff)), 1);

    engine
        .transact(SecurityContext::superuser(), |tx| tx.remove_member(staff, bob))
        .unwrap();
    assert_eq!(edges(&engine, bob, CONTAINS, Some(staff)), 0);
}
