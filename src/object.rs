use std::fmt;

use crate::cache_key::CacheKey;
use crate::connection::Connection;
use crate::error::Result;
use crate::Id;

/// Where a persisted object sits in its load/save lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    /// Identity (id) is known but fields have not been loaded yet.
    Ghost,
    /// Fields reflect the database row.
    Loaded,
    /// Fields have been mutated, or never saved, since the last load.
    Dirty,
    /// A save is in flight.
    Saving,
}

/// A user-defined persisted entity type.
///
/// One implementation per row-backed Rust type. [`crate::Handle`] drives
/// instances of `Self` through the Ghost/Loaded/Dirty/Saving state
/// machine purely via these hooks; `Self` never has to know about
/// identity maps, transactions, or statement caches.
///
/// `do_save_new`/`do_save_existing` are responsible for writing every
/// table in the persisted hierarchy, base table first, exactly as
/// `spec.md` §4.6 describes; for a type with no sub-tables that is a
/// single `INSERT`/`UPDATE` against [`Self::primary_table_name`].
pub trait Persistent: Clone + Default + 'static {
    /// Table holding the columns shared across a persisted hierarchy.
    fn primary_table_name() -> &'static str;
    /// Table holding the columns exclusive to this concrete type. Equal
    /// to [`Self::primary_table_name`] for a type with no sub-tables.
    fn exclusive_table_name() -> &'static str;
    /// Name of the primary key column on [`Self::primary_table_name`].
    fn primary_key_name() -> &'static str;

    /// Populates a fresh instance by `SELECT`ing row `id`.
    fn do_load(conn: &Connection, id: Id) -> Result<Self>;
    /// Inserts a brand-new row and returns the id SQLite assigned it.
    fn do_save_new(&self, conn: &Connection) -> Result<Id>;
    /// Updates the existing row `id`.
    fn do_save_existing(&self, conn: &Connection, id: Id) -> Result<()>;

    /// Resets fields to an empty state, as when transitioning to
    /// [`ObjectState::Ghost`]. Defaults to `Self::default()`.
    fn do_ghostify(&mut self) {
        *self = Self::default();
    }
}

/// One instance per row, owned exclusively by an [`crate::IdentityMap`].
///
/// Never constructed directly by user code; reached only through a
/// [`crate::Handle`]. The identity map owns the storage ([`std::rc::Rc`]
/// keeps it alive), while handles are non-owning references plus the
/// `handle_count` refcount that actually governs eviction — the arena
/// shape the component design calls for.
pub struct PersistentObject<T> {
    pub(crate) id: Option<Id>,
    pub(crate) cache_key: Option<CacheKey>,
    pub(crate) handle_count: usize,
    pub(crate) state: ObjectState,
    pub(crate) fields: T,
    /// Number of in-flight save attempts whose rollback callback is still
    /// registered with some open transaction frame. Blocks eviction even
    /// at `handle_count == 0` until every such callback has fired (on
    /// cancel) or been discarded (on the outermost commit).
    pub(crate) pending_rollback_count: usize,
}

impl<T: Persistent> PersistentObject<T> {
    pub(crate) fn new_dirty(cache_key: CacheKey) -> Self {
        Self {
            id: None,
            cache_key: Some(cache_key),
            handle_count: 0,
            state: ObjectState::Dirty,
            fields: T::default(),
            pending_rollback_count: 0,
        }
    }

    pub(crate) fn new_ghost(cache_key: CacheKey, id: Id) -> Self {
        Self {
            id: Some(id),
            cache_key: Some(cache_key),
            handle_count: 0,
            state: ObjectState::Ghost,
            fields: T::default(),
            pending_rollback_count: 0,
        }
    }

    /// The row id, if this object has ever been saved.
    pub fn id(&self) -> Option<Id> {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ObjectState {
        self.state
    }

    /// Resets fields to empty via [`Persistent::do_ghostify`].
    pub(crate) fn ghostify_fields(&mut self) {
        self.fields.do_ghostify();
    }
}

impl<T> fmt::Debug for PersistentObject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentObject")
            .field("id", &self.id)
            .field("cache_key", &self.cache_key)
            .field("handle_count", &self.handle_count)
            .field("state", &self.state)
            .field("pending_rollback_count", &self.pending_rollback_count)
            .finish()
    }
}
