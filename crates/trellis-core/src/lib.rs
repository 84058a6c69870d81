// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! trellis-core: access control, transactions and paging for a typed
//! property graph.
//!
//! Every read or write goes through an explicit [`SecurityContext`]. Writes
//! happen inside a [`Tx`] whose outermost handle validates and commits
//! atomically; queries filter by `read` permission before counting, sort
//! stably and page by number, from the end, or from a cursor object.
#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]
#![deny(unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::missing_const_for_fn,
    clippy::redundant_pub_crate,
    clippy::module_name_repetitions,
    clippy::use_self
)]

mod cascade;
mod config;
mod engine_impl;
mod error;
mod graph;
mod ident;
mod lifecycle;
mod permission;
mod query;
mod record;
mod schema;
mod security;
mod tx;
mod validation;
mod value;

pub use cascade::{resolve_delete, CascadeFlags, CascadePlan};
pub use config::{EngineConfig, CONFIG_KEY};
pub use engine_impl::{Engine, Tx, TxOutcome};
pub use error::GraphError;
pub use graph::{GraphStore, Hash};
pub use ident::{ObjectId, TypeName};
pub use lifecycle::{Callback, CallbackContext, LifecycleEvent};
pub use permission::{
    grant_bits, grant_edge, owner_of, principal_closure, resolve, Decision, PermissionResolver,
    PropagationDirection, PropagationMode, PropagationRule,
};
pub use query::{execute, haversine_km, window, Filter, Query, QueryResult, TextMatch};
pub use record::{keys, properties, Direction, GraphObject, NodeRecord, PropertyMap, RelationshipRecord};
pub use schema::{
    NodeType, PropertyDef, PropertyFormat, PropertyKind, RelationshipConstraint, RelationshipType,
    Schema, SchemaBuilder, Validator, CONTAINS, GROUP, OWNS, PRINCIPAL, SECURITY, USER,
};
pub use security::{AccessMode, Permission, Permissions, Principal, SecurityContext};
pub use tx::TxId;
pub use validation::{
    check_value, is_email, relationship_constraint_violations, validate_node,
    validate_relationship, ErrorToken, ValidationReport, ViolationKind,
};
pub use value::{compare_nullable, Value};
