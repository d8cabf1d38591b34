use std::any::TypeId;
use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::object::{ObjectState, Persistent, PersistentObject};
use crate::Id;

/// A refcounted smart reference into an [`crate::IdentityMap`] — the only
/// legal way user code touches a persisted object.
///
/// Two handles compare equal iff they reference the same object (pointer
/// equality on the identity map's storage, after identity-map dedup has
/// already collapsed same-row fetches onto one object). A handle
/// constructed with [`Self::none`] references nothing; every other
/// operation on it fails with [`Error::UnboundHandle`].
pub struct Handle<'conn, T: Persistent> {
    conn: &'conn Connection,
    inner: Option<Rc<RefCell<PersistentObject<T>>>>,
}

impl<'conn, T: Persistent> Handle<'conn, T> {
    /// Asks the identity map for a brand-new, unsaved, [`ObjectState::Dirty`]
    /// object.
    pub fn new(conn: &'conn Connection) -> Result<Self> {
        let map = conn.identity_map::<T>();
        let (_cache_key, obj) = map.provide_new()?;
        obj.borrow_mut().handle_count = 1;
        Ok(Self {
            conn,
            inner: Some(obj),
        })
    }

    /// Asks the identity map for the object backing row `id`: the cached
    /// object if one already exists, otherwise a freshly constructed
    /// [`ObjectState::Ghost`]. Never triggers a load by itself; the first
    /// field read does that.
    pub fn load(conn: &'conn Connection, id: Id) -> Result<Self> {
        Self::by_id(conn, id)
    }

    /// Identical to [`Self::load`], under the caller's promise that `id`
    /// names a row that really exists. [`crate::TableCursor`] is the one
    /// caller in this crate that can make that promise honestly: its ids
    /// come straight out of a `SELECT` against the very table it names.
    /// Lying about it is not memory-unsafe (this crate
    /// `#![forbid(unsafe_code)]`) — it just means the eventual field read
    /// fails with whatever error the `SELECT ... WHERE id = ?` in
    /// [`Persistent::do_load`] returns for a missing row.
    pub fn create_unchecked(conn: &'conn Connection, id: Id) -> Result<Self> {
        Self::by_id(conn, id)
    }

    fn by_id(conn: &'conn Connection, id: Id) -> Result<Self> {
        let map = conn.identity_map::<T>();
        let (cache_key, obj) = map.provide_by_id(id)?;
        map.notify_handle_constructed(cache_key)?;
        Ok(Self {
            conn,
            inner: Some(obj),
        })
    }

    /// A handle bound to no object.
    pub fn none(conn: &'conn Connection) -> Self {
        Self { conn, inner: None }
    }

    /// Whether this handle currently references an object.
    pub fn is_bound(&self) -> bool {
        self.inner.is_some()
    }

    /// The row id, if this object has ever been saved.
    pub fn id(&self) -> Option<Id> {
        self.inner.as_ref().and_then(|rc| rc.borrow().id)
    }

    /// Current lifecycle state, or `None` for an unbound handle.
    pub fn state(&self) -> Option<ObjectState> {
        self.inner.as_ref().map(|rc| rc.borrow().state())
    }

    /// Whether the referenced object's runtime type is `Sub`. In this
    /// crate's simplified, non-hierarchical persistence model `T` is
    /// always its own base type, so this reduces to a `TypeId`
    /// comparison; kept as a named method for API parity with the
    /// component design's polymorphic base/derived support, and so a
    /// future hierarchy-aware `T::Base` does not change call sites.
    pub fn has_dynamic_type<Sub: Persistent>(&self) -> bool {
        self.inner.is_some() && TypeId::of::<T>() == TypeId::of::<Sub>()
    }

    fn rc(&self) -> Result<&Rc<RefCell<PersistentObject<T>>>> {
        self.inner.as_ref().ok_or(Error::UnboundHandle)
    }

    fn ensure_loaded(&self) -> Result<()> {
        let rc = self.rc()?;
        let needs_load = rc.borrow().state() == ObjectState::Ghost;
        if needs_load {
            let id = rc
                .borrow()
                .id()
                .expect("a ghost object always carries an id");
            let fields = T::do_load(self.conn, id)?;
            let mut obj = rc.borrow_mut();
            obj.fields = fields;
            obj.state = ObjectState::Loaded;
        }
        Ok(())
    }

    /// Reads the object's fields, triggering a load first if this handle
    /// still points at a [`ObjectState::Ghost`]. A load failure leaves
    /// the object `Ghost`.
    pub fn read(&self) -> Result<Ref<'_, T>> {
        self.ensure_loaded()?;
        Ok(Ref::map(self.rc()?.borrow(), |o| &o.fields))
    }

    /// Mutably borrows the object's fields, loading them first if needed
    /// and transitioning `Loaded -> Dirty`.
    pub fn write(&self) -> Result<RefMut<'_, T>> {
        self.ensure_loaded()?;
        let rc = self.rc()?;
        {
            let mut obj = rc.borrow_mut();
            if obj.state() == ObjectState::Loaded {
                obj.state = ObjectState::Dirty;
            }
        }
        Ok(RefMut::map(rc.borrow_mut(), |o| &mut o.fields))
    }

    /// Explicitly discards loaded fields, returning to [`ObjectState::Ghost`].
    /// A no-op if the object has never been saved: an object with no id
    /// has no row to ghost back to, and ghosting it would strand its only
    /// copy of unsaved data with no way to reload it.
    pub fn ghostify(&self) -> Result<()> {
        let rc = self.rc()?;
        let mut obj = rc.borrow_mut();
        if obj.id.is_some() {
            obj.ghostify_fields();
            obj.state = ObjectState::Ghost;
        }
        Ok(())
    }

    /// Runs the save protocol: snapshot fields, register a
    /// transaction-rollback callback, `INSERT` (new objects) or `UPDATE`
    /// (existing ones), then commit or cancel depending on the outcome.
    ///
    /// If already `Loaded` (nothing to persist), returns the existing id
    /// without touching the database.
    pub fn save(&self) -> Result<Id> {
        let rc = self.rc()?.clone();
        {
            let o = rc.borrow();
            if o.state() == ObjectState::Loaded {
                return Ok(o.id().expect("a loaded object always carries an id"));
            }
        }

        let is_new = rc.borrow().id().is_none();
        let cache_key = rc
            .borrow()
            .cache_key
            .expect("cached objects always carry a cache key");
        let snapshot = rc.borrow().fields.clone();
        let map = self.conn.identity_map::<T>();

        let opened_txn = self.conn.transaction_depth() == 0;
        let txn = if opened_txn {
            Some(self.conn.begin()?)
        } else {
            None
        };

        {
            let mut o = rc.borrow_mut();
            o.state = ObjectState::Saving;
            o.pending_rollback_count += 1;
        }

        {
            let rc_cancel = Rc::clone(&rc);
            let map_cancel = Rc::clone(&map);
            let rc_discard = Rc::clone(&rc);
            self.conn.transaction_coordinator().register_rollback(
                move || {
                    let mut o = rc_cancel.borrow_mut();
                    o.fields = snapshot;
                    o.state = ObjectState::Dirty;
                    o.pending_rollback_count = o.pending_rollback_count.saturating_sub(1);
                    if is_new {
                        if let Some(id) = o.id.take() {
                            map_cancel.notify_save_failed(cache_key, id);
                        }
                    }
                },
                move || {
                    let mut o = rc_discard.borrow_mut();
                    o.pending_rollback_count = o.pending_rollback_count.saturating_sub(1);
                },
            );
        }

        let outcome = if is_new {
            T::do_save_new(&rc.borrow().fields, self.conn)
        } else {
            let id = rc.borrow().id().expect("an existing object always carries an id");
            T::do_save_existing(&rc.borrow().fields, self.conn, id).map(|()| id)
        };

        match outcome {
            Ok(id) => {
                if is_new {
                    rc.borrow_mut().id = Some(id);
                    map.notify_id_assigned(cache_key, id);
                }
                rc.borrow_mut().state = ObjectState::Loaded;
                match txn {
                    Some(txn) => txn.commit().map(|()| id),
                    None => Ok(id),
                }
            }
            Err(e) => {
                log::warn!(target: "persist_core", "save failed for {}, rolling back: {e}", T::primary_table_name());
                if let Some(txn) = txn {
                    let _ = txn.cancel();
                } else {
                    self.conn.transaction_coordinator().poison();
                }
                Err(e)
            }
        }
    }
}

impl<'conn, T: Persistent> Clone for Handle<'conn, T> {
    fn clone(&self) -> Self {
        if let Some(rc) = &self.inner {
            let cache_key = rc
                .borrow()
                .cache_key
                .expect("cached objects always carry a cache key");
            // `Clone::clone` cannot return `Result`, but the counter it
            // bumps is the same hard-failure-on-overflow counter
            // `Handle::by_id` propagates through `?`. A `usize` handle
            // count reaching `usize::MAX` live clones of one handle is not
            // a condition this crate can recover from either way.
            self.conn
                .identity_map::<T>()
                .notify_handle_constructed(cache_key)
                .expect("handle counter overflow");
        }
        Self {
            conn: self.conn,
            inner: self.inner.clone(),
        }
    }
}

impl<'conn, T: Persistent> Drop for Handle<'conn, T> {
    fn drop(&mut self) {
        if let Some(rc) = self.inner.take() {
            if let Some(cache_key) = rc.borrow().cache_key {
                // Same counter as above; a failure here would mean a
                // handle was destroyed twice for one construction, an
                // internal bookkeeping bug rather than a recoverable
                // condition `Drop` could act on differently.
                self.conn
                    .identity_map::<T>()
                    .notify_handle_destroyed(cache_key)
                    .expect("handle counter underflow");
            }
        }
    }
}

impl<'conn, T: Persistent> PartialEq for Handle<'conn, T> {
    fn eq(&self, other: &Self) -> bool {
        match (&self.inner, &other.inner) {
            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl<'conn, T: Persistent> Eq for Handle<'conn, T> {}

impl<'conn, T: Persistent> fmt::Debug for Handle<'conn, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}
