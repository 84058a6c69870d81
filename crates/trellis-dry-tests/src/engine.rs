// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Engine builder utilities for tests.

use trellis_core::{Engine, EngineConfig, SchemaBuilder, TextMatch};

/// Builder for test engines.
///
/// # Example
///
/// ```
/// use trellis_dry_tests::{project_schema, EngineTestBuilder};
///
/// let engine = EngineTestBuilder::new()
///     .with_schema(project_schema())
///     .with_page_size(5)
///     .build();
/// assert_eq!(engine.config().default_page_size, 5);
/// ```
pub struct EngineTestBuilder {
    schema: SchemaBuilder,
    config: EngineConfig,
}

impl Default for EngineTestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineTestBuilder {
    /// Built-in types only, default configuration.
    pub fn new() -> Self {
        Self {
            schema: SchemaBuilder::new(),
            config: EngineConfig::default(),
        }
    }

    /// Replace the schema.
    pub fn with_schema(mut self, schema: SchemaBuilder) -> Self {
        self.schema = schema;
        self
    }

    /// Replace the whole configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Default page size of [`Engine::new_query`].
    pub fn with_page_size(mut self, size: i64) -> Self {
        self.config.default_page_size = size;
        self
    }

    /// Default text matching.
    pub fn with_text_match(mut self, mode: TextMatch) -> Self {
        self.config.text_match = mode;
        self
    }

    /// Commit without comparing base versions.
    pub fn without_conflict_detection(mut self) -> Self {
        self.config.detect_conflicts = false;
        self
    }

    /// Build the engine.
    ///
    /// # Panics
    /// If the schema does not build.
    pub fn build(self) -> Engine {
        let schema = self.schema.build().expect("test schema should build");
        Engine::with_config(schema, self.config)
    }
}
