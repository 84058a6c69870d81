// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Config port for Trellis: a raw blob store trait, a serde service on top of
//! it, and a filesystem adapter rooted at the platform config directory.
#![forbid(unsafe_code)]

mod fs;
mod service;

pub use fs::FsConfigStore;
pub use service::{ConfigError, ConfigService, ConfigStore};
