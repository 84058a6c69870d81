// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Lifecycle events and the callback signature.
use std::fmt;
use std::sync::Arc;

use crate::error::GraphError;
use crate::graph::GraphStore;
use crate::record::GraphObject;
use crate::security::SecurityContext;
use crate::tx::TxId;

/// Point in the commit protocol at which callbacks run.
///
/// For each category the `before*` callbacks of every object run before
/// any `after*` callback of that category.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecycleEvent {
    /// Before a new object becomes visible.
    BeforeCreation,
    /// After a new object has been staged.
    AfterCreation,
    /// Before a changed object is committed.
    BeforeModification,
    /// After a changed object has been staged.
    AfterModification,
    /// Before a deleted object disappears.
    BeforeDeletion,
    /// After a deleted object has been removed from the staged store.
    AfterDeletion,
}

impl LifecycleEvent {
    /// Lower camel-case name (`beforeCreation`, ...).
    pub const fn name(self) -> &'static str {
        match self {
            Self::BeforeCreation => "beforeCreation",
            Self::AfterCreation => "afterCreation",
            Self::BeforeModification => "beforeModification",
            Self::AfterModification => "afterModification",
            Self::BeforeDeletion => "beforeDeletion",
            Self::AfterDeletion => "afterDeletion",
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a callback sees.
///
/// `store` is the staged post-commit state; it is not yet published, so a
/// callback error still rolls everything back. For deletions `object` is the
/// record as it was before removal. Callbacks run while the engine's store
/// lock is held and must not call back into the engine.
#[derive(Clone, Copy)]
pub struct CallbackContext<'a> {
    /// The event being fired.
    pub event: LifecycleEvent,
    /// Committing transaction.
    pub tx: TxId,
    /// Object the event concerns.
    pub object: GraphObject<'a>,
    /// Context of the committing transaction.
    pub security: &'a SecurityContext,
    /// Staged store.
    pub store: &'a GraphStore,
}

impl fmt::Debug for CallbackContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackContext")
            .field("event", &self.event)
            .field("tx", &self.tx)
            .field("object", &self.object.id())
            .finish_non_exhaustive()
    }
}

/// Registered lifecycle callback. Returning an error aborts the commit.
pub type Callback = Arc<dyn Fn(&CallbackContext<'_>) -> Result<(), GraphError> + Send + Sync>;
