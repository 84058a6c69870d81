// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Engine facade and the transaction manager.
//!
//! Every transaction starts from the committed snapshot taken at begin and
//! copies it on its first write, so it reads its own writes and nothing
//! else. Mutations are checked against the acting context when issued,
//! applied to the copy and logged. Commits run one at a time: a commit
//! rejects the transaction if any object it wrote changed since begin,
//! replays the log onto a staged copy of the committed state, validates,
//! fires lifecycle callbacks and finally swaps the staged copy in. Readers
//! are only blocked by the swap. Any failure drops the staged copy, which is
//! the whole rollback.
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info, instrument, warn};

use crate::cascade::{resolve_delete, CascadeFlags, CascadePlan};
use crate::config::EngineConfig;
use crate::error::GraphError;
use crate::graph::{GraphStore, Hash};
use crate::ident::{ObjectId, TypeName};
use crate::lifecycle::{CallbackContext, LifecycleEvent};
use crate::permission::{grant_bits, grant_edge, owner_of, PermissionResolver, PropagationRule};
use crate::query::{self, Query, QueryResult};
use crate::record::{keys, Direction, NodeRecord, PropertyMap, RelationshipRecord};
use crate::schema::{Schema, CONTAINS, OWNS, SECURITY};
use crate::security::{AccessMode, Permission, Permissions, SecurityContext};
use crate::tx::{GraphOp, TxId, TxState};
use crate::validation::{validate_node, validate_relationship};
use crate::value::Value;

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Open outermost transaction per engine on this thread.
    static ACTIVE: RefCell<FxHashMap<u64, Rc<RefCell<TxState>>>> =
        RefCell::new(FxHashMap::default());
}

fn active_tx(engine: u64) -> Option<Rc<RefCell<TxState>>> {
    ACTIVE.with(|a| a.borrow().get(&engine).cloned())
}

/// How a [`Tx`] handle finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    /// The outermost handle committed.
    Committed,
    /// The outermost handle rolled back on request.
    RolledBack,
    /// A nested handle finished; the outermost handle decides.
    Joined,
}

/// Access-controlled, transactional property graph.
///
/// The engine is `Sync`: share it by reference across threads. Each thread
/// runs its own transactions; a [`Tx`] never leaves the thread that began it.
pub struct Engine {
    id: u64,
    /// Latest committed snapshot. Transactions share it until they write.
    store: RwLock<Arc<GraphStore>>,
    /// Serializes commits; readers only wait for the final swap.
    commit_lock: Mutex<()>,
    schema: Arc<Schema>,
    config: EngineConfig,
    tx_counter: AtomicU64,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.id)
            .field("schema", &self.schema)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Empty engine with the default configuration.
    pub fn new(schema: Schema) -> Self {
        Self::with_config(schema, EngineConfig::default())
    }

    /// Empty engine. Propagation rules declared on relationship types are
    /// installed into the store.
    pub fn with_config(schema: Schema, config: EngineConfig) -> Self {
        let mut store = GraphStore::new();
        for rel in schema.relationship_types() {
            if let Some(rule) = rel.initial_propagation() {
                store.set_propagation_rule(rel.name().clone(), Some(rule));
            }
        }
        Self {
            id: NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed),
            store: RwLock::new(Arc::new(store)),
            commit_lock: Mutex::new(()),
            schema: Arc::new(schema),
            config,
            tx_counter: AtomicU64::new(0),
        }
    }

    /// The type registry.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// The configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn next_tx_id(&self) -> TxId {
        loop {
            // Zero is reserved; skip it on wrap.
            let raw = self.tx_counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if raw != 0 {
                return TxId::from_raw(raw);
            }
        }
    }

    /// Begins a transaction on the current thread.
    ///
    /// If this thread already has an open transaction on this engine, the
    /// returned handle is nested in it: it shares the outer unit of work and
    /// its context (`ctx` is ignored), and only the outermost handle commits.
    pub fn begin(&self, ctx: SecurityContext) -> Tx<'_> {
        if let Some(state) = active_tx(self.id) {
            let tx = {
                let mut st = state.borrow_mut();
                st.depth += 1;
                debug!(tx = %st.id, depth = st.depth, "joined transaction");
                st.id
            };
            return Tx {
                engine: self,
                id: tx,
                state,
                nested: true,
                success: false,
                finished: false,
            };
        }
        let id = self.next_tx_id();
        let working = Arc::clone(&self.store.read());
        let state = Rc::new(RefCell::new(TxState::new(id, ctx, working)));
        ACTIVE.with(|a| a.borrow_mut().insert(self.id, Rc::clone(&state)));
        debug!(tx = %id, "began transaction");
        Tx {
            engine: self,
            id,
            state,
            nested: false,
            success: false,
            finished: false,
        }
    }

    /// Runs `f` in a transaction: marks success when `f` returns `Ok` and
    /// always finishes the handle.
    ///
    /// # Errors
    /// The error of `f`, or the commit failure.
    pub fn transact<R>(
        &self,
        ctx: SecurityContext,
        f: impl FnOnce(&Tx<'_>) -> Result<R, GraphError>,
    ) -> Result<R, GraphError> {
        let mut tx = self.begin(ctx);
        match f(&tx) {
            Ok(value) => {
                tx.success();
                tx.finish()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(finish) = tx.finish() {
                    debug!(error = %finish, "finishing failed transaction");
                }
                Err(err)
            }
        }
    }

    /// Runs `f` on the store this thread should read: the working copy of its
    /// open transaction, or the committed store.
    fn with_view<R>(&self, f: impl FnOnce(&GraphStore) -> R) -> R {
        if let Some(state) = active_tx(self.id) {
            let st = state.borrow();
            return f(&st.working);
        }
        let store = self.store.read();
        f(&store)
    }

    /// Reads a node. Unreadable nodes are reported as missing.
    ///
    /// # Errors
    /// [`GraphError::NotFound`].
    pub fn get_node(&self, ctx: &SecurityContext, id: ObjectId) -> Result<NodeRecord, GraphError> {
        self.with_view(|store| readable_node(store, ctx, &id).cloned())
    }

    /// Reads a relationship. Unreadable relationships are reported as missing.
    ///
    /// # Errors
    /// [`GraphError::NotFound`].
    pub fn get_relationship(
        &self,
        ctx: &SecurityContext,
        id: ObjectId,
    ) -> Result<RelationshipRecord, GraphError> {
        self.with_view(|store| readable_relationship(store, ctx, &id).cloned())
    }

    /// A query with this engine's default page size and text matching.
    pub fn new_query(&self, ty: impl Into<TypeName>) -> Query {
        Query::new(ty)
            .page_size(self.config.default_page_size)
            .text_match(self.config.text_match)
    }

    /// Runs a query.
    ///
    /// # Errors
    /// [`GraphError::NotFound`] for an unknown `offsetId`.
    pub fn query(&self, ctx: &SecurityContext, query: &Query) -> Result<QueryResult, GraphError> {
        self.with_view(|store| query::execute(&self.schema, store, ctx, query))
    }

    /// Resolves one permission.
    pub fn is_allowed(&self, ctx: &SecurityContext, id: ObjectId, permission: Permission) -> bool {
        self.with_view(|store| ctx.is_allowed(store, id, permission))
    }

    /// Every permission `ctx` holds on `id`.
    pub fn permissions(&self, ctx: &SecurityContext, id: ObjectId) -> Permissions {
        self.with_view(|store| PermissionResolver::new(ctx, store).permissions(id))
    }

    /// Owner of a readable node.
    ///
    /// # Errors
    /// [`GraphError::NotFound`].
    pub fn owner(&self, ctx: &SecurityContext, id: ObjectId) -> Result<Option<ObjectId>, GraphError> {
        self.with_view(|store| {
            readable_node(store, ctx, &id)?;
            Ok(owner_of(store, &id))
        })
    }

    /// Readable relationships touching a readable node in `direction`.
    ///
    /// # Errors
    /// [`GraphError::NotFound`].
    pub fn relationships(
        &self,
        ctx: &SecurityContext,
        id: ObjectId,
        direction: Direction,
    ) -> Result<Vec<RelationshipRecord>, GraphError> {
        self.with_view(|store| readable_relationships(store, ctx, &id, direction))
    }

    /// Breadth-first walk from `start` along relationships (of `rel_type`,
    /// when given) in `direction`, up to `max_depth` hops.
    ///
    /// Returns readable nodes in discovery order, `start` excluded.
    /// Unreadable nodes are neither returned nor walked through.
    ///
    /// # Errors
    /// [`GraphError::NotFound`] if `start` is missing or unreadable.
    pub fn traverse(
        &self,
        ctx: &SecurityContext,
        start: ObjectId,
        rel_type: Option<&str>,
        direction: Direction,
        max_depth: usize,
    ) -> Result<Vec<ObjectId>, GraphError> {
        self.with_view(|store| {
            readable_node(store, ctx, &start)?;
            let resolver = PermissionResolver::new(ctx, store);
            let mut seen = FxHashSet::default();
            seen.insert(start);
            let mut frontier = vec![start];
            let mut out = Vec::new();
            for _ in 0..max_depth {
                let mut next = Vec::new();
                for node in &frontier {
                    for rel in store.relationships_of(node) {
                        if !direction.matches(rel, *node) || rel_type.is_some_and(|t| rel.ty != t) {
                            continue;
                        }
                        let Some(far) = rel.other_end(*node) else {
                            continue;
                        };
                        if seen.insert(far) && resolver.is_allowed(far, Permission::Read) {
                            out.push(far);
                            next.push(far);
                        }
                    }
                }
                if next.is_empty() {
                    break;
                }
                frontier = next;
            }
            Ok(out)
        })
    }

    /// Context for a stored principal, honouring its `isAdmin` flag.
    ///
    /// # Errors
    /// [`GraphError::NotFound`] if `principal` is not a principal node.
    pub fn security_context(
        &self,
        principal: ObjectId,
        mode: AccessMode,
    ) -> Result<SecurityContext, GraphError> {
        self.with_view(|store| SecurityContext::for_principal(&self.schema, store, principal, mode))
    }

    /// Current propagation rule of a relationship type.
    pub fn propagation_rule(&self, rel_type: &str) -> Option<PropagationRule> {
        self.with_view(|store| store.propagation_rule(&TypeName::from(rel_type)).copied())
    }

    /// Number of nodes, regardless of permissions.
    pub fn node_count(&self) -> usize {
        self.with_view(GraphStore::node_count)
    }

    /// Canonical hash of the committed state.
    pub fn state_hash(&self) -> Hash {
        self.store.read().canonical_state_hash()
    }

    /// Publishes a finished transaction.
    ///
    /// The staged store is built and validated beside the current snapshot,
    /// so readers keep going until the swap.
    #[instrument(skip_all, fields(tx = %state.id, ops = state.ops.len()))]
    fn commit(&self, state: &TxState) -> Result<(), GraphError> {
        let _serial = self.commit_lock.lock();
        let committed = Arc::clone(&self.store.read());
        if self.config.detect_conflicts {
            for (id, base) in &state.base_versions {
                if committed.version_of(id) != Some(*base) {
                    warn!(object = %id, "write conflict");
                    return Err(GraphError::Conflict { object: *id });
                }
            }
        }

        let mut staged = GraphStore::clone(&committed);
        for op in &state.ops {
            op.apply(&mut staged)?;
        }

        let created: Vec<ObjectId> = state
            .created
            .iter()
            .copied()
            .filter(|id| staged.contains(id))
            .collect();
        let modified: Vec<ObjectId> = state
            .touched
            .iter()
            .copied()
            .filter(|id| changed(&committed, &staged, id))
            .collect();
        let deleted: Vec<ObjectId> = state
            .deleted
            .iter()
            .copied()
            .filter(|id| committed.contains(id))
            .collect();

        let now = Utc::now();
        for id in &created {
            stamp(&mut staged, id, |_| {});
        }
        for id in &modified {
            stamp(&mut staged, id, |node| node.modified_at = now);
        }

        let mut check: BTreeSet<ObjectId> = state.revalidate.clone();
        check.extend(created.iter().copied());
        check.extend(modified.iter().copied());
        let mut tokens = Vec::new();
        for id in &check {
            if let Some(node) = staged.node(id) {
                tokens.extend(validate_node(&self.schema, &staged, node));
            } else if let Some(rel) = staged.relationship(id) {
                tokens.extend(validate_relationship(&self.schema, &staged, rel));
            }
        }
        if !tokens.is_empty() {
            warn!(violations = tokens.len(), "validation failed");
            return Err(GraphError::validation(tokens));
        }

        let fire = |events: [LifecycleEvent; 2], ids: &[ObjectId], source: &GraphStore| {
            for event in events {
                for id in ids {
                    if let Some(object) = source.object(id) {
                        self.schema.fire(&CallbackContext {
                            event,
                            tx: state.id,
                            object,
                            security: &state.ctx,
                            store: &staged,
                        })?;
                    }
                }
            }
            Ok::<(), GraphError>(())
        };
        fire(
            [LifecycleEvent::BeforeCreation, LifecycleEvent::AfterCreation],
            &created,
            &staged,
        )?;
        fire(
            [LifecycleEvent::BeforeModification, LifecycleEvent::AfterModification],
            &modified,
            &staged,
        )?;
        fire(
            [LifecycleEvent::BeforeDeletion, LifecycleEvent::AfterDeletion],
            &deleted,
            &*committed,
        )?;

        *self.store.write() = Arc::new(staged);
        info!(
            created = created.len(),
            modified = modified.len(),
            deleted = deleted.len(),
            "committed"
        );
        Ok(())
    }
}

/// Returns `true` if the properties or cascade flags of `id` differ.
fn changed(before: &GraphStore, after: &GraphStore, id: &ObjectId) -> bool {
    if let (Some(a), Some(b)) = (before.node(id), after.node(id)) {
        return a.properties != b.properties;
    }
    if let (Some(a), Some(b)) = (before.relationship(id), after.relationship(id)) {
        return a.properties != b.properties || a.cascade != b.cascade;
    }
    false
}

/// Bumps the version of a written object; `touch` updates node timestamps.
fn stamp(store: &mut GraphStore, id: &ObjectId, touch: impl FnOnce(&mut NodeRecord)) {
    if let Some(node) = store.node_mut(id) {
        node.version += 1;
        touch(node);
    } else if let Some(rel) = store.relationship_mut(id) {
        rel.version += 1;
    }
}

fn readable_node<'s>(
    store: &'s GraphStore,
    ctx: &SecurityContext,
    id: &ObjectId,
) -> Result<&'s NodeRecord, GraphError> {
    store
        .node(id)
        .filter(|n| ctx.is_allowed(store, n.id, Permission::Read))
        .ok_or_else(|| GraphError::not_found(format!("node {id}")))
}

fn readable_relationship<'s>(
    store: &'s GraphStore,
    ctx: &SecurityContext,
    id: &ObjectId,
) -> Result<&'s RelationshipRecord, GraphError> {
    store
        .relationship(id)
        .filter(|r| ctx.is_allowed(store, r.id, Permission::Read))
        .ok_or_else(|| GraphError::not_found(format!("relationship {id}")))
}

fn readable_relationships(
    store: &GraphStore,
    ctx: &SecurityContext,
    id: &ObjectId,
    direction: Direction,
) -> Result<Vec<RelationshipRecord>, GraphError> {
    readable_node(store, ctx, id)?;
    let resolver = PermissionResolver::new(ctx, store);
    Ok(store
        .relationships_of(id)
        .filter(|r| direction.matches(r, *id) && resolver.is_allowed(r.id, Permission::Read))
        .cloned()
        .collect())
}

/// Handle on a (possibly nested) transaction.
///
/// Mark it successful with [`Tx::success`] and complete it with
/// [`Tx::finish`]. Dropping an unfinished handle is the same as finishing it
/// without success. A handle is bound to the thread that began it.
pub struct Tx<'e> {
    engine: &'e Engine,
    id: TxId,
    state: Rc<RefCell<TxState>>,
    nested: bool,
    success: bool,
    finished: bool,
}

impl std::fmt::Debug for Tx<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tx")
            .field("id", &self.id)
            .field("nested", &self.nested)
            .field("success", &self.success)
            .finish_non_exhaustive()
    }
}

impl Tx<'_> {
    /// Id of the unit of work (shared by nested handles).
    pub fn id(&self) -> TxId {
        self.id
    }

    /// `true` for handles joined to an outer transaction.
    pub fn is_nested(&self) -> bool {
        self.nested
    }

    /// The context every operation of this unit of work runs under.
    pub fn security(&self) -> SecurityContext {
        self.state.borrow().ctx.clone()
    }

    /// Marks this handle successful. Every handle of the nest must be marked
    /// for the outermost one to commit.
    pub fn success(&mut self) {
        self.success = true;
    }

    /// Finishes the handle.
    ///
    /// Nested handles only report back to the outer one. The outermost
    /// handle rolls back when not marked successful; otherwise it commits,
    /// unless a nested handle vetoed, a nested handle is still open, or a
    /// write failed earlier.
    ///
    /// # Errors
    /// [`GraphError::TransactionAborted`] for a veto or an open nested
    /// handle, the first failed write's error, or the commit failure
    /// ([`GraphError::Conflict`], [`GraphError::Validation`], a callback
    /// error).
    pub fn finish(mut self) -> Result<TxOutcome, GraphError> {
        self.complete()
    }

    /// Finishes the handle without success.
    ///
    /// # Errors
    /// [`GraphError::TransactionClosed`] if the outer transaction already finished.
    pub fn rollback(mut self) -> Result<TxOutcome, GraphError> {
        self.success = false;
        self.complete()
    }

    fn complete(&mut self) -> Result<TxOutcome, GraphError> {
        self.finished = true;
        let mut st = self.state.borrow_mut();
        if self.nested {
            if st.closed {
                return Err(GraphError::TransactionClosed);
            }
            st.depth -= 1;
            if !self.success {
                st.vetoed = true;
                debug!(tx = %st.id, "nested transaction finished without success");
            }
            return Ok(TxOutcome::Joined);
        }
        ACTIVE.with(|a| {
            let mut active = a.borrow_mut();
            if active
                .get(&self.engine.id)
                .is_some_and(|s| Rc::ptr_eq(s, &self.state))
            {
                active.remove(&self.engine.id);
            }
        });
        st.closed = true;
        let open = st.depth.saturating_sub(1);
        st.depth = 0;
        if !self.success {
            debug!(tx = %st.id, "rolled back");
            return Ok(TxOutcome::RolledBack);
        }
        let result = if open > 0 {
            Err(GraphError::TransactionAborted {
                reason: format!("{open} nested transaction(s) still open"),
            })
        } else if st.vetoed {
            Err(GraphError::TransactionAborted {
                reason: "a nested transaction did not succeed".into(),
            })
        } else if let Some(err) = st.poisoned.take() {
            Err(err)
        } else {
            self.engine.commit(&st)
        };
        match result {
            Ok(()) => Ok(TxOutcome::Committed),
            Err(err) => {
                warn!(tx = %st.id, error = %err, "rolled back");
                Err(err)
            }
        }
    }

    fn read<R>(&self, f: impl FnOnce(&TxState) -> Result<R, GraphError>) -> Result<R, GraphError> {
        let st = self.state.borrow();
        if st.closed {
            return Err(GraphError::TransactionClosed);
        }
        f(&st)
    }

    /// Runs a write. A failure poisons the unit of work.
    fn write<R>(
        &self,
        op: &'static str,
        f: impl FnOnce(&mut TxState, &Schema) -> Result<R, GraphError>,
    ) -> Result<R, GraphError> {
        let mut st = self.state.borrow_mut();
        if st.closed {
            return Err(GraphError::TransactionClosed);
        }
        let result = f(&mut st, &self.engine.schema);
        if let Err(err) = &result {
            debug!(tx = %st.id, op, error = %err, "write failed");
            if st.poisoned.is_none() {
                st.poisoned = Some(err.clone());
            }
        }
        result
    }

    // ----- reads -------------------------------------------------------------

    /// Reads a node as this transaction sees it.
    ///
    /// # Errors
    /// [`GraphError::NotFound`].
    pub fn node(&self, id: ObjectId) -> Result<NodeRecord, GraphError> {
        self.read(|st| readable_node(&st.working, &st.ctx, &id).cloned())
    }

    /// Reads a relationship as this transaction sees it.
    ///
    /// # Errors
    /// [`GraphError::NotFound`].
    pub fn relationship(&self, id: ObjectId) -> Result<RelationshipRecord, GraphError> {
        self.read(|st| readable_relationship(&st.working, &st.ctx, &id).cloned())
    }

    /// Reads one property (system keys included).
    ///
    /// # Errors
    /// [`GraphError::NotFound`].
    pub fn property(&self, id: ObjectId, key: &str) -> Result<Option<Value>, GraphError> {
        self.read(|st| Ok(readable_node(&st.working, &st.ctx, &id)?.value_of(key)))
    }

    /// Runs a query over this transaction's view.
    ///
    /// # Errors
    /// [`GraphError::NotFound`] for an unknown `offsetId`.
    pub fn query(&self, query: &Query) -> Result<QueryResult, GraphError> {
        self.read(|st| query::execute(&self.engine.schema, &st.working, &st.ctx, query))
    }

    /// Resolves one permission for this transaction's context.
    pub fn is_allowed(&self, id: ObjectId, permission: Permission) -> bool {
        self.read(|st| Ok(st.ctx.is_allowed(&st.working, id, permission)))
            .unwrap_or(false)
    }

    /// Owner of a readable node.
    ///
    /// # Errors
    /// [`GraphError::NotFound`].
    pub fn owner(&self, id: ObjectId) -> Result<Option<ObjectId>, GraphError> {
        self.read(|st| {
            readable_node(&st.working, &st.ctx, &id)?;
            Ok(owner_of(&st.working, &id))
        })
    }

    /// Readable relationships touching a readable node.
    ///
    /// # Errors
    /// [`GraphError::NotFound`].
    pub fn relationships(
        &self,
        id: ObjectId,
        direction: Direction,
    ) -> Result<Vec<RelationshipRecord>, GraphError> {
        self.read(|st| readable_relationships(&st.working, &st.ctx, &id, direction))
    }

    // ----- writes ------------------------------------------------------------

    /// Creates a node with a fresh id. See [`Tx::create_node_with_id`].
    ///
    /// # Errors
    /// As [`Tx::create_node_with_id`].
    pub fn create_node(&self, ty: &str, properties: PropertyMap) -> Result<ObjectId, GraphError> {
        self.create_node_with_id(ObjectId::new(), ty, properties)
    }

    /// Creates a node. When the type is owned and the context has a
    /// principal, the principal becomes the owner.
    ///
    /// # Errors
    /// - [`GraphError::NotFound`] for an unregistered type.
    /// - [`GraphError::Authorization`] for anonymous creation, principal
    ///   creation without superuser rights, or read-only/privileged properties.
    /// - [`GraphError::Conflict`] if `id` is taken.
    pub fn create_node_with_id(
        &self,
        id: ObjectId,
        ty: &str,
        properties: PropertyMap,
    ) -> Result<ObjectId, GraphError> {
        self.write("create_node", |st, schema| {
            let ty = schema
                .node_type(ty)
                .map(|t| t.name().clone())
                .ok_or_else(|| GraphError::not_found(format!("node type {ty}")))?;
            if !st.ctx.is_super_user() {
                if schema.is_principal(&ty) {
                    return Err(GraphError::authorization("Creation of principals not permitted"));
                }
                if st.ctx.principal().is_none() {
                    return Err(GraphError::authorization("Creation not permitted"));
                }
            }
            if st.working.contains(&id) {
                return Err(GraphError::Conflict { object: id });
            }
            for key in properties.keys() {
                check_property_write(st, schema, &ty, key)?;
            }
            let mut record = NodeRecord::new(id, ty.clone(), Utc::now());
            record.properties = properties;
            st.apply(GraphOp::CreateNode(record))?;
            if schema.is_owned(ty.as_str()) {
                if let Some(owner) = st.ctx.principal_id().filter(|p| st.working.node(p).is_some()) {
                    link(st, OWNS, owner, id, PropertyMap::new(), CascadeFlags::NONE)?;
                }
            }
            Ok(id)
        })
    }

    /// Creates a relationship. Requires `link` on both endpoints; the cascade
    /// bitmask starts at the type's default.
    ///
    /// # Errors
    /// - [`GraphError::NotFound`] for an unknown type or endpoint.
    /// - [`GraphError::Authorization`] without `link`, or for the system
    ///   relationship types.
    pub fn create_relationship(
        &self,
        ty: &str,
        from: ObjectId,
        to: ObjectId,
        properties: PropertyMap,
    ) -> Result<ObjectId, GraphError> {
        self.write("create_relationship", |st, schema| {
            let def = schema
                .relationship_type(ty)
                .ok_or_else(|| GraphError::not_found(format!("relationship type {ty}")))?;
            if def.is_system() {
                return Err(GraphError::authorization(format!(
                    "{ty} relationships are managed by dedicated operations"
                )));
            }
            for end in [from, to] {
                readable_node(&st.working, &st.ctx, &end)?;
                require(st, end, Permission::Link, "Link not permitted")?;
            }
            if let Some(key) = properties.keys().find(|k| keys::is_system(k)) {
                return Err(GraphError::authorization(format!("Property {key} is read-only")));
            }
            let (name, cascade) = (def.name().clone(), def.default_cascade());
            link(st, name.as_str(), from, to, properties, cascade)
        })
    }

    /// Sets a property on a node or relationship.
    ///
    /// Object-level `write` is checked first, then the property itself:
    /// system and read-only properties are never writable and privileged ones
    /// need superuser rights. Writing the current value is accepted and fires
    /// no callbacks at commit.
    ///
    /// # Errors
    /// [`GraphError::NotFound`] for unknown or unreadable objects,
    /// [`GraphError::Authorization`] otherwise.
    pub fn set_property(
        &self,
        id: ObjectId,
        key: &str,
        value: impl Into<Value>,
    ) -> Result<(), GraphError> {
        self.put(id, key, Some(value.into()))
    }

    /// Removes a property.
    ///
    /// # Errors
    /// As [`Tx::set_property`].
    pub fn remove_property(&self, id: ObjectId, key: &str) -> Result<(), GraphError> {
        self.put(id, key, None)
    }

    fn put(&self, id: ObjectId, key: &str, value: Option<Value>) -> Result<(), GraphError> {
        self.write("set_property", |st, schema| {
            if let Ok(node) = readable_node(&st.working, &st.ctx, &id) {
                let ty = node.ty.clone();
                require(st, id, Permission::Write, "Modification not permitted")?;
                check_property_write(st, schema, &ty, key)?;
            } else {
                let rel = readable_relationship(&st.working, &st.ctx, &id)
                    .map_err(|_| GraphError::not_found(format!("object {id}")))?;
                if schema
                    .relationship_type(rel.ty.as_str())
                    .is_some_and(|t| t.is_system())
                {
                    return Err(GraphError::authorization(format!(
                        "{} relationships are managed by dedicated operations",
                        rel.ty
                    )));
                }
                require(st, id, Permission::Write, "Modification not permitted")?;
                if keys::is_system(key) {
                    return Err(GraphError::authorization(format!("Property {key} is read-only")));
                }
            }
            st.apply(GraphOp::SetProperty {
                id,
                key: key.to_owned(),
                value,
            })
        })
    }

    /// Deletes a node and everything its cascade closure reaches.
    ///
    /// Only the root needs `delete`. Far nodes left without a required
    /// relationship fail validation at commit.
    ///
    /// # Errors
    /// [`GraphError::NotFound`] or [`GraphError::Authorization`].
    pub fn delete_node(&self, id: ObjectId) -> Result<CascadePlan, GraphError> {
        self.write("delete_node", |st, schema| {
            readable_node(&st.working, &st.ctx, &id)?;
            require(st, id, Permission::Delete, "Deletion not permitted")?;
            let plan = resolve_delete(&st.working, schema, id)?;
            for failure in &plan.failures {
                debug!(tx = %st.id, %failure, "cascade leaves node invalid");
            }
            for node in &plan.nodes {
                st.apply(GraphOp::DeleteNode(*node))?;
            }
            Ok(plan)
        })
    }

    /// Deletes a relationship. Requires `link` on both endpoints.
    ///
    /// # Errors
    /// [`GraphError::NotFound`] or [`GraphError::Authorization`].
    pub fn delete_relationship(&self, id: ObjectId) -> Result<(), GraphError> {
        self.write("delete_relationship", |st, schema| {
            let rel = readable_relationship(&st.working, &st.ctx, &id)?;
            let (ty, from, to) = (rel.ty.clone(), rel.from, rel.to);
            if schema.relationship_type(ty.as_str()).is_some_and(|t| t.is_system()) {
                return Err(GraphError::authorization(format!(
                    "{ty} relationships are managed by dedicated operations"
                )));
            }
            require(st, from, Permission::Link, "Link not permitted")?;
            require(st, to, Permission::Link, "Link not permitted")?;
            st.apply(GraphOp::DeleteRelationship(id))
        })
    }

    /// Changes the cascade bitmask of a relationship instance.
    ///
    /// # Errors
    /// [`GraphError::NotFound`] or [`GraphError::Authorization`].
    pub fn set_cascade(&self, id: ObjectId, flags: CascadeFlags) -> Result<(), GraphError> {
        self.write("set_cascade", |st, _| {
            readable_relationship(&st.working, &st.ctx, &id)?;
            require(st, id, Permission::Write, "Modification not permitted")?;
            st.apply(GraphOp::SetCascade { id, flags })
        })
    }

    /// Makes `principal` the sole owner of `node`, replacing any previous
    /// ownership in the same mutation.
    ///
    /// # Errors
    /// [`GraphError::NotFound`] or [`GraphError::Authorization`] without
    /// `accessControl` on the node.
    pub fn set_owner(&self, node: ObjectId, principal: ObjectId) -> Result<(), GraphError> {
        self.write("set_owner", |st, schema| {
            readable_node(&st.working, &st.ctx, &node)?;
            require_principal(st, schema, principal)?;
            require(st, node, Permission::AccessControl, "Access control not permitted")?;
            let existing: Vec<(ObjectId, ObjectId)> = st
                .working
                .incoming(&node)
                .filter(|r| r.ty == OWNS)
                .map(|r| (r.id, r.from))
                .collect();
            if let [(_, owner)] = existing.as_slice() {
                if *owner == principal {
                    return Ok(());
                }
            }
            for (rel, _) in existing {
                st.apply(GraphOp::DeleteRelationship(rel))?;
            }
            link(st, OWNS, principal, node, PropertyMap::new(), CascadeFlags::NONE)?;
            Ok(())
        })
    }

    /// Adds permissions to the grant from `principal` on `object`, creating
    /// the grant if needed.
    ///
    /// # Errors
    /// [`GraphError::NotFound`] or [`GraphError::Authorization`] without
    /// `accessControl` on the object.
    pub fn grant(
        &self,
        object: ObjectId,
        principal: ObjectId,
        permissions: impl Into<Permissions>,
    ) -> Result<(), GraphError> {
        let permissions = permissions.into();
        self.write("grant", |st, schema| {
            readable_node(&st.working, &st.ctx, &object)?;
            require_principal(st, schema, principal)?;
            require(st, object, Permission::AccessControl, "Access control not permitted")?;
            if permissions.is_empty() {
                return Ok(());
            }
            match grant_edge(&st.working, &principal, &object).map(|r| (r.id, grant_bits(r))) {
                Some((rel, bits)) => {
                    let merged = bits.union(permissions);
                    if merged == bits {
                        return Ok(());
                    }
                    st.apply(GraphOp::SetProperty {
                        id: rel,
                        key: keys::ALLOWED.to_owned(),
                        value: Some(merged.to_value()),
                    })
                }
                None => {
                    let props = PropertyMap::from([(keys::ALLOWED.to_owned(), permissions.to_value())]);
                    link(st, SECURITY, principal, object, props, CascadeFlags::NONE).map(|_| ())
                }
            }
        })
    }

    /// Removes permissions from the grant from `principal` on `object`; the
    /// grant disappears once empty.
    ///
    /// # Errors
    /// [`GraphError::NotFound`] or [`GraphError::Authorization`] without
    /// `accessControl` on the object.
    pub fn revoke(
        &self,
        object: ObjectId,
        principal: ObjectId,
        permissions: impl Into<Permissions>,
    ) -> Result<(), GraphError> {
        let permissions = permissions.into();
        self.write("revoke", |st, schema| {
            readable_node(&st.working, &st.ctx, &object)?;
            require_principal(st, schema, principal)?;
            require(st, object, Permission::AccessControl, "Access control not permitted")?;
            let Some((rel, bits)) =
                grant_edge(&st.working, &principal, &object).map(|r| (r.id, grant_bits(r)))
            else {
                return Ok(());
            };
            let rest = bits.difference(permissions);
            if rest == bits {
                Ok(())
            } else if rest.is_empty() {
                st.apply(GraphOp::DeleteRelationship(rel))
            } else {
                st.apply(GraphOp::SetProperty {
                    id: rel,
                    key: keys::ALLOWED.to_owned(),
                    value: Some(rest.to_value()),
                })
            }
        })
    }

    /// Adds `member` to `group`. Requires `accessControl` on the group.
    ///
    /// # Errors
    /// [`GraphError::NotFound`] if `group` is not a group or `member` not a
    /// principal; [`GraphError::Authorization`].
    pub fn add_member(&self, group: ObjectId, member: ObjectId) -> Result<(), GraphError> {
        self.write("add_member", |st, schema| {
            require_group(st, schema, group)?;
            require_principal(st, schema, member)?;
            require(st, group, Permission::AccessControl, "Access control not permitted")?;
            if membership(&st.working, group, member).is_some() {
                return Ok(());
            }
            link(st, CONTAINS, group, member, PropertyMap::new(), CascadeFlags::NONE).map(|_| ())
        })
    }

    /// Removes `member` from `group`. Requires `accessControl` on the group.
    ///
    /// # Errors
    /// As [`Tx::add_member`].
    pub fn remove_member(&self, group: ObjectId, member: ObjectId) -> Result<(), GraphError> {
        self.write("remove_member", |st, schema| {
            require_group(st, schema, group)?;
            require_principal(st, schema, member)?;
            require(st, group, Permission::AccessControl, "Access control not permitted")?;
            match membership(&st.working, group, member) {
                Some(rel) => st.apply(GraphOp::DeleteRelationship(rel)),
                None => Ok(()),
            }
        })
    }

    /// Replaces (`Some`) or removes (`None`) the propagation rule of a
    /// relationship type. Superuser only; takes effect for every instance.
    ///
    /// # Errors
    /// [`GraphError::Authorization`] or [`GraphError::NotFound`].
    pub fn set_propagation(
        &self,
        rel_type: &str,
        rule: Option<PropagationRule>,
    ) -> Result<(), GraphError> {
        self.write("set_propagation", |st, schema| {
            if !st.ctx.is_super_user() {
                return Err(GraphError::authorization(
                    "Changing propagation rules not permitted",
                ));
            }
            let rel_type = schema
                .relationship_type(rel_type)
                .map(|t| t.name().clone())
                .ok_or_else(|| GraphError::not_found(format!("relationship type {rel_type}")))?;
            st.apply(GraphOp::SetPropagation { rel_type, rule })
        })
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.success = false;
            if let Err(err) = self.complete() {
                debug!(tx = %self.id, error = %err, "dropped transaction handle");
            }
        }
    }
}

fn require(
    st: &TxState,
    id: ObjectId,
    permission: Permission,
    reason: &str,
) -> Result<(), GraphError> {
    if st.ctx.is_allowed(&st.working, id, permission) {
        return Ok(());
    }
    debug!(tx = %st.id, object = %id, ?permission, "denied");
    Err(GraphError::authorization(reason))
}

fn require_principal(st: &TxState, schema: &Schema, id: ObjectId) -> Result<(), GraphError> {
    st.working
        .node(&id)
        .filter(|n| schema.is_principal(&n.ty))
        .map(|_| ())
        .ok_or_else(|| GraphError::not_found(format!("principal {id}")))
}

fn require_group(st: &TxState, schema: &Schema, id: ObjectId) -> Result<(), GraphError> {
    readable_node(&st.working, &st.ctx, &id)
        .ok()
        .filter(|n| schema.is_group(&n.ty))
        .map(|_| ())
        .ok_or_else(|| GraphError::not_found(format!("group {id}")))
}

fn membership(store: &GraphStore, group: ObjectId, member: ObjectId) -> Option<ObjectId> {
    store
        .outgoing(&group)
        .find(|r| r.ty == CONTAINS && r.to == member)
        .map(|r| r.id)
}

/// Per-property write rules, checked independently of object-level `write`.
fn check_property_write(
    st: &TxState,
    schema: &Schema,
    ty: &TypeName,
    key: &str,
) -> Result<(), GraphError> {
    let def = schema.property_def(ty.as_str(), key);
    if keys::is_system(key) || def.is_some_and(|d| d.read_only) {
        return Err(GraphError::authorization(format!("Property {key} is read-only")));
    }
    if def.is_some_and(|d| d.privileged) && !st.ctx.is_super_user() {
        debug!(tx = %st.id, property = key, "privileged property write denied");
        return Err(GraphError::authorization(format!(
            "Property {key} requires elevated rights"
        )));
    }
    Ok(())
}

fn link(
    st: &mut TxState,
    ty: &str,
    from: ObjectId,
    to: ObjectId,
    properties: PropertyMap,
    cascade: CascadeFlags,
) -> Result<ObjectId, GraphError> {
    let id = ObjectId::new();
    st.apply(GraphOp::CreateRelationship(RelationshipRecord {
        id,
        ty: TypeName::from(ty),
        from,
        to,
        properties,
        cascade,
        created_at: Utc::now(),
        version: 0,
    }))?;
    Ok(id)
}
