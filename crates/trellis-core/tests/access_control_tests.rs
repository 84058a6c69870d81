// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

#![allow(missing_docs, clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod common;

use proptest::prelude::*;
use proptest::test_runner::{Config as PropConfig, RngAlgorithm, TestRng, TestRunner};

use common::{create_project, create_tasks, project_engine};
use trellis_core::{
    grant_bits, keys, properties, AccessMode, Direction, GraphError, Permission, Permissions,
    PropertyMap, SecurityContext, OWNS, SECURITY, USER,
};
use trellis_dry_tests::{create_admin, create_group, create_user, PROJECT};

#[test]
fn owner_holds_everything_strangers_nothing() {
    let engine = project_engine();
    let ann = create_user(&engine, "ann");
    let bob = create_user(&engine, "bob");
    let ann_ctx = SecurityContext::frontend(ann);
    let project = create_project(&engine, &ann_ctx, "alpha");

    assert_eq!(engine.owner(&ann_ctx, project).unwrap(), Some(ann));
    assert_eq!(engine.permissions(&ann_ctx, project), Permissions::ALL);
    assert_eq!(
        engine.permissions(&SecurityContext::frontend(bob), project),
        Permissions::NONE
    );
    assert_eq!(
        engine.permissions(&SecurityContext::anonymous(), project),
        Permissions::NONE
    );
}

#[test]
fn unreadable_objects_look_missing_everywhere() {
    let engine = project_engine();
    let ann = create_user(&engine, "ann");
    let bob = create_user(&engine, "bob");
    let (ann_ctx, bob_ctx) = (SecurityContext::frontend(ann), SecurityContext::frontend(bob));
    let alpha = create_project(&engine, &ann_ctx, "alpha");
    create_project(&engine, &bob_ctx, "beta");

    let err = engine.get_node(&bob_ctx, alpha).unwrap_err();
    assert!(matches!(err, GraphError::NotFound { .. }));
    assert!(engine.relationships(&bob_ctx, alpha, Direction::Both).is_err());

    let for_bob = engine.query(&bob_ctx, &engine.new_query(PROJECT)).unwrap();
    assert_eq!(for_bob.raw_count, 1);
    assert!(!for_bob.ids().contains(&alpha));

    let all = engine
        .query(&SecurityContext::superuser(), &engine.new_query(PROJECT))
        .unwrap();
    assert_eq!(all.raw_count, 2);
}

#[test]
fn visibility_flags_grant_read_only() {
    let engine = project_engine();
    let ann = create_user(&engine, "ann");
    let bob = create_user(&engine, "bob");
    let ann_ctx = SecurityContext::frontend(ann);
    let public = create_project(&engine, &ann_ctx, "public");
    let members = create_project(&engine, &ann_ctx, "members");
    engine
        .transact(ann_ctx.clone(), |tx| {
            tx.set_property(public, keys::VISIBLE_TO_PUBLIC_USERS, true)?;
            tx.set_property(members, keys::VISIBLE_TO_AUTHENTICATED_USERS, true)
        })
        .unwrap();

    let anon = SecurityContext::anonymous();
    let bob_ctx = SecurityContext::frontend(bob);
    assert!(engine.get_node(&anon, public).is_ok());
    assert!(!engine.is_allowed(&anon, public, Permission::Write));
    assert!(engine.get_node(&anon, members).is_err());
    assert!(engine.get_node(&bob_ctx, members).is_ok());
    assert_eq!(engine.permissions(&bob_ctx, members), Permission::Read.into());
}

#[test]
fn public_flag_toggles_anonymous_query_results() {
    let engine = project_engine();
    let ann_ctx = SecurityContext::frontend(create_user(&engine, "ann"));
    let project = create_project(&engine, &ann_ctx, "alpha");
    create_project(&engine, &ann_ctx, "beta");
    let anon = SecurityContext::anonymous();
    let listed = || {
        let result = engine.query(&anon, &engine.new_query(PROJECT)).unwrap();
        (result.raw_count, result.ids().contains(&project))
    };
    assert_eq!(listed(), (0, false));

    for (public, expected) in [(true, (1, true)), (false, (0, false)), (true, (1, true))] {
        engine
            .transact(ann_ctx.clone(), |tx| {
                tx.set_property(project, keys::VISIBLE_TO_PUBLIC_USERS, public)
            })
            .unwrap();
        assert_eq!(listed(), expected, "visibleToPublicUsers = {public}");
    }
}

#[test]
fn ownership_transfer_replaces_the_owner() {
    let engine = project_engine();
    let ann = create_user(&engine, "ann");
    let bob = create_user(&engine, "bob");
    let (ann_ctx, bob_ctx) = (SecurityContext::frontend(ann), SecurityContext::frontend(bob));
    let project = create_project(&engine, &ann_ctx, "alpha");

    engine
        .transact(ann_ctx.clone(), |tx| tx.set_owner(project, bob))
        .unwrap();

    assert_eq!(engine.owner(&bob_ctx, project).unwrap(), Some(bob));
    assert!(engine.get_node(&ann_ctx, project).is_err());
    let owns = engine
        .relationships(&SecurityContext::superuser(), project, Direction::Incoming)
        .unwrap()
        .into_iter()
        .filter(|r| r.ty == OWNS)
        .count();
    assert_eq!(owns, 1);

    let err = engine
        .transact(ann_ctx, |tx| tx.set_owner(project, ann))
        .unwrap_err();
    assert!(matches!(err, GraphError::NotFound { .. }));
}

#[test]
fn access_control_is_needed_to_change_owner_or_grants() {
    let engine = project_engine();
    let ann = create_user(&engine, "ann");
    let bob = create_user(&engine, "bob");
    let ann_ctx = SecurityContext::frontend(ann);
    let project = create_project(&engine, &ann_ctx, "alpha");
    engine
        .transact(ann_ctx, |tx| {
            tx.grant(project, bob, [Permission::Read, Permission::Write])
        })
        .unwrap();

    let bob_ctx = SecurityContext::frontend(bob);
    let err = engine
        .transact(bob_ctx.clone(), |tx| tx.set_owner(project, bob))
        .unwrap_err();
    assert_eq!(
        err,
        GraphError::Authorization {
            reason: "Access control not permitted".into()
        }
    );
    let err = engine
        .transact(bob_ctx, |tx| tx.grant(project, bob, Permission::Delete))
        .unwrap_err();
    assert!(matches!(err, GraphError::Authorization { .. }));
}

#[test]
fn group_grants_reach_nested_members() {
    let engine = project_engine();
    let ann = create_user(&engine, "ann");
    let bob = create_user(&engine, "bob");
    let staff = create_group(&engine, "staff");
    let everyone = create_group(&engine, "everyone");
    let ann_ctx = SecurityContext::frontend(ann);
    let project = create_project(&engine, &ann_ctx, "alpha");

    engine
        .transact(SecurityContext::superuser(), |tx| {
            tx.add_member(everyone, staff)?;
            tx.add_member(staff, bob)
        })
        .unwrap();
    engine
        .transact(ann_ctx, |tx| tx.grant(project, everyone, Permission::Read))
        .unwrap();

    let bob_ctx = SecurityContext::frontend(bob);
    assert!(engine.is_allowed(&bob_ctx, project, Permission::Read));
    assert!(!engine.is_allowed(&bob_ctx, project, Permission::Write));

    engine
        .transact(SecurityContext::superuser(), |tx| tx.remove_member(staff, bob))
        .unwrap();
    assert!(!engine.is_allowed(&bob_ctx, project, Permission::Read));
}

#[test]
fn membership_needs_a_group() {
    let engine = project_engine();
    let ann = create_user(&engine, "ann");
    let bob = create_user(&engine, "bob");
    let err = engine
        .transact(SecurityContext::superuser(), |tx| tx.add_member(ann, bob))
        .unwrap_err();
    assert!(matches!(err, GraphError::NotFound { .. }));
}

#[test]
fn relationship_needs_permission_on_both_ends() {
    let engine = project_engine();
    let ann = create_user(&engine, "ann");
    let bob = create_user(&engine, "bob");
    let ann_ctx = SecurityContext::frontend(ann);
    let project = create_project(&engine, &ann_ctx, "alpha");
    let task = create_tasks(&engine, &ann_ctx, project, &[("t", None)])[0];
    let rel = engine
        .relationships(&ann_ctx, task, Direction::Incoming)
        .unwrap()
        .into_iter()
        .find(|r| r.from == project)
        .expect("has-task relationship")
        .id;

    engine
        .transact(ann_ctx, |tx| tx.grant(task, bob, Permission::Read))
        .unwrap();
    let bob_ctx = SecurityContext::frontend(bob);
    assert!(engine.get_node(&bob_ctx, task).is_ok());
    assert!(engine.get_relationship(&bob_ctx, rel).is_err());
    assert!(!engine.is_allowed(&bob_ctx, rel, Permission::Read));
}

#[test]
fn admins_bypass_checks_but_cannot_be_self_appointed() {
    let engine = project_engine();
    let ann = create_user(&engine, "ann");
    let bob = create_user(&engine, "bob");
    let root = create_admin(&engine, "root");
    let project = create_project(&engine, &SecurityContext::frontend(ann), "alpha");

    let admin_ctx = engine
        .security_context(root, AccessMode::Frontend)
        .unwrap();
    assert!(admin_ctx.is_super_user());
    assert_eq!(engine.permissions(&admin_ctx, project), Permissions::ALL);

    // Give bob write access to his own principal node.
    engine
        .transact(SecurityContext::superuser(), |tx| tx.set_owner(bob, bob))
        .unwrap();
    let bob_ctx = SecurityContext::frontend(bob);
    let err = engine
        .transact(bob_ctx.clone(), |tx| tx.set_property(bob, keys::IS_ADMIN, true))
        .unwrap_err();
    assert_eq!(
        err,
        GraphError::Authorization {
            reason: "Property isAdmin requires elevated rights".into()
        }
    );
    engine
        .transact(bob_ctx.clone(), |tx| tx.set_property(bob, "name", "robert"))
        .unwrap();

    let err = engine
        .transact(bob_ctx, |tx| {
            tx.create_node(USER, PropertyMap::new())
        })
        .unwrap_err();
    assert_eq!(
        err,
        GraphError::Authorization {
            reason: "Creation of principals not permitted".into()
        }
    );
}

#[test]
fn anonymous_contexts_cannot_create() {
    let engine = project_engine();
    let err = engine
        .transact(SecurityContext::anonymous(), |tx| {
            tx.create_node(PROJECT, properties([("name", "x")]))
        })
        .unwrap_err();
    assert_eq!(
        err,
        GraphError::Authorization {
            reason: "Creation not permitted".into()
        }
    );
}

#[test]
fn system_properties_are_read_only() {
    let engine = project_engine();
    let ann = create_user(&engine, "ann");
    let ann_ctx = SecurityContext::frontend(ann);
    let project = create_project(&engine, &ann_ctx, "alpha");
    let err = engine
        .transact(ann_ctx, |tx| tx.set_property(project, keys::ID, "x"))
        .unwrap_err();
    assert_eq!(
        err,
        GraphError::Authorization {
            reason: "Property id is read-only".into()
        }
    );
}

#[test]
fn grant_then_revoke_leaves_the_difference() {
    const SEED_BYTES: [u8; 32] = [
        0x7a, 0x11, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
        0, 0, 0, 0,
    ];
    let rng = TestRng::from_seed(RngAlgorithm::ChaCha, &SEED_BYTES);
    let config = PropConfig {
        cases: 32,
        ..PropConfig::default()
    };
    let mut runner = TestRunner::new_with_rng(config, rng);
    let bits = 0_i64..32;

    runner
        .run(&(bits.clone(), bits), |(granted, revoked)| {
            let granted = Permissions::from_bits(granted).expect("five-bit mask");
            let revoked = Permissions::from_bits(revoked).expect("five-bit mask");

            let engine = project_engine();
            let ann = create_user(&engine, "ann");
            let bob = create_user(&engine, "bob");
            let ann_ctx = SecurityContext::frontend(ann);
            let project = create_project(&engine, &ann_ctx, "alpha");
            engine
                .transact(ann_ctx, |tx| {
                    tx.grant(project, bob, granted)?;
                    tx.revoke(project, bob, revoked)
                })
                .expect("grant and revoke");

            let expected = granted.difference(revoked);
            let bob_ctx = SecurityContext::frontend(bob);
            prop_assert_eq!(engine.permissions(&bob_ctx, project), expected);

            let edge_left = engine
                .relationships(&SecurityContext::superuser(), project, Direction::Incoming)
                .expect("superuser reads")
                .iter()
                .any(|r| r.ty == SECURITY && r.from == bob);
            prop_assert_eq!(edge_left, !expected.is_empty());
            Ok(())
        })
        .expect("proptest with pinned seed should complete");
}

#[test]
fn grant_edge_is_unique_per_principal() {
    let engine = project_engine();
    let ann = create_user(&engine, "ann");
    let bob = create_user(&engine, "bob");
    let ann_ctx = SecurityContext::frontend(ann);
    let project = create_project(&engine, &ann_ctx, "alpha");
    engine
        .transact(ann_ctx.clone(), |tx| {
            tx.grant(project, bob, Permission::Read)?;
            tx.grant(project, bob, Permission::Write)?;
            tx.grant(project, bob, Permission::Read)
        })
        .unwrap();
    let grants = engine
        .relationships(&SecurityContext::superuser(), project, Direction::Incoming)
        .unwrap()
        .into_iter()
        .filter(|r| r.ty == SECURITY)
        .collect::<Vec<_>>();
    assert_eq!(grants.len(), 1);
    assert_eq!(
        grant_bits(&grants[0]),
        Permissions::from([Permission::Read, Permission::Write])
    );
}
