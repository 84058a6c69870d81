// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared test doubles and fixtures for Trellis crates.
#![forbid(unsafe_code)]
#![allow(clippy::expect_used)]
//!
//! # Modules
//!
//! - [`config`] - In-memory config store fake for testing without filesystem
//! - [`engine`] - Engine builder with schema and config overrides
//! - [`fixtures`] - Sample schemas and principal helpers

pub mod config;
pub mod engine;
pub mod fixtures;

pub use config::InMemoryConfigStore;
pub use engine::EngineTestBuilder;
pub use fixtures::{
    cascade_schema, create_admin, create_group, create_user, project_schema, CHILD, HAS_TASK,
    LEAF, PROJECT, TASK, TREE_NODE,
};
