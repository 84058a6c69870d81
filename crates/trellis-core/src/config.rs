// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Engine configuration.
use serde::{Deserialize, Serialize};
use trellis_config::{ConfigError, ConfigService, ConfigStore};

use crate::query::TextMatch;

/// Key under which [`EngineConfig`] is stored in a [`ConfigStore`].
pub const CONFIG_KEY: &str = "engine";

/// Tunables of an [`crate::Engine`]. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Matching used by text filters that do not name a mode.
    pub text_match: TextMatch,
    /// Page size of queries built with [`crate::Engine::new_query`].
    pub default_page_size: i64,
    /// Reject commits whose written objects changed since the transaction began.
    pub detect_conflicts: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            text_match: TextMatch::Exact,
            default_page_size: 20,
            detect_conflicts: true,
        }
    }
}

impl EngineConfig {
    /// Loads the config stored under [`CONFIG_KEY`], or the defaults when
    /// nothing is stored.
    ///
    /// # Errors
    /// Store I/O failures and malformed JSON.
    pub fn load_or_default<S: ConfigStore>(service: &ConfigService<S>) -> Result<Self, ConfigError> {
        service.load_or_default(CONFIG_KEY)
    }

    /// Persists the config under [`CONFIG_KEY`].
    ///
    /// # Errors
    /// Store I/O failures.
    pub fn save<S: ConfigStore>(&self, service: &ConfigService<S>) -> Result<(), ConfigError> {
        service.save(CONFIG_KEY, self)
    }
}
