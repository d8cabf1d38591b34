use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::rc::Rc;

use slab::Slab;

use crate::cache_key::CacheKey;
use crate::error::{Error, Result};
use crate::object::{ObjectState, Persistent, PersistentObject};
use crate::Id;

/// Objects with a refcount of zero are kept around speculatively up to
/// this many entries before the oldest one is actually evicted. Matches
/// the teacher's own default pool sizing order of magnitude without
/// pretending to derive it from anything more principled.
const DEFAULT_ORPHAN_CAPACITY: usize = 64;

/// The per-connection, per-base-type cache enforcing the "one object per
/// row" rule.
///
/// Storage is arena-shaped: `by_cache_key` is the sole owner of object
/// memory (an `Rc` per slot so [`crate::Handle`] can hold a cheap, safe
/// clone instead of a raw pointer); `by_id` is an index into it, populated
/// once an object's id becomes known. [`CacheKey`] allocation is
/// delegated to [`slab::Slab`], which already implements "probe for the
/// lowest free slot, reuse slots made free by removal".
pub struct IdentityMap<T: Persistent> {
    by_cache_key: RefCell<Slab<Rc<RefCell<PersistentObject<T>>>>>,
    by_id: RefCell<HashMap<Id, CacheKey>>,
    orphan_cache: RefCell<VecDeque<CacheKey>>,
    orphan_capacity: Cell<usize>,
    caching_enabled: Cell<bool>,
}

impl<T: Persistent> IdentityMap<T> {
    pub(crate) fn new() -> Self {
        Self {
            by_cache_key: RefCell::new(Slab::new()),
            by_id: RefCell::new(HashMap::new()),
            orphan_cache: RefCell::new(VecDeque::new()),
            orphan_capacity: Cell::new(DEFAULT_ORPHAN_CAPACITY),
            caching_enabled: Cell::new(true),
        }
    }

    /// Number of objects currently cached (loaded, dirty, ghost, or
    /// orphaned), regardless of live handle count.
    pub fn len(&self) -> usize {
        self.by_cache_key.borrow().len()
    }

    /// Whether the cache currently holds no objects at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the bounded orphan cache is currently in play. When
    /// disabled, an object whose handle count drops to zero is evicted
    /// immediately instead of being held speculatively.
    pub fn caching_enabled(&self) -> bool {
        self.caching_enabled.get()
    }

    /// Toggles the orphan cache, intended for bulk operations that would
    /// otherwise thrash it. Disabling it flushes every orphan currently
    /// held.
    pub fn set_caching_enabled(&self, enabled: bool) {
        self.caching_enabled.set(enabled);
        if !enabled {
            let drained: Vec<CacheKey> = self.orphan_cache.borrow_mut().drain(..).collect();
            for key in drained {
                self.evict(key);
            }
        }
    }

    /// Maximum number of zero-refcount objects held speculatively.
    pub fn orphan_capacity(&self) -> usize {
        self.orphan_capacity.get()
    }

    /// Changes the orphan cache bound, evicting the oldest entries
    /// immediately if the new bound is smaller than the current size.
    pub fn set_orphan_capacity(&self, capacity: usize) {
        self.orphan_capacity.set(capacity);
        loop {
            let overflow = {
                let mut orphans = self.orphan_cache.borrow_mut();
                if orphans.len() > capacity {
                    orphans.pop_front()
                } else {
                    None
                }
            };
            match overflow {
                Some(key) => self.evict(key),
                None => break,
            }
        }
    }

    /// Allocates a cache key and constructs a fresh, unsaved [`ObjectState::Dirty`]
    /// object, inserted only into the cache-key table.
    pub(crate) fn provide_new(&self) -> Result<(CacheKey, Rc<RefCell<PersistentObject<T>>>)> {
        let mut slab = self.by_cache_key.borrow_mut();
        if slab.len() == usize::MAX {
            return Err(Error::OverflowError);
        }
        let entry = slab.vacant_entry();
        let cache_key = CacheKey::from_slab_key(entry.key());
        let obj = Rc::new(RefCell::new(PersistentObject::new_dirty(cache_key)));
        entry.insert(Rc::clone(&obj));
        Ok((cache_key, obj))
    }

    /// Returns the cached object for `id`, constructing a fresh
    /// [`ObjectState::Ghost`] (inserted into both tables) if it is not
    /// already present.
    pub(crate) fn provide_by_id(&self, id: Id) -> Result<(CacheKey, Rc<RefCell<PersistentObject<T>>>)> {
        if let Some(&cache_key) = self.by_id.borrow().get(&id) {
            let slab = self.by_cache_key.borrow();
            let obj = slab
                .get(cache_key.slab_key())
                .expect("by_id and by_cache_key must agree");
            return Ok((cache_key, Rc::clone(obj)));
        }
        let mut slab = self.by_cache_key.borrow_mut();
        if slab.len() == usize::MAX {
            return Err(Error::OverflowError);
        }
        let entry = slab.vacant_entry();
        let cache_key = CacheKey::from_slab_key(entry.key());
        let obj = Rc::new(RefCell::new(PersistentObject::new_ghost(cache_key, id)));
        entry.insert(Rc::clone(&obj));
        drop(slab);
        self.by_id.borrow_mut().insert(id, cache_key);
        Ok((cache_key, obj))
    }

    /// Bumps the handle counter for the object at `cache_key`. If it was
    /// previously zero (the object was sitting in the orphan cache), the
    /// entry is pulled back out of the orphan queue since it is live
    /// again.
    ///
    /// Fails with [`Error::OverflowError`] rather than wrapping or
    /// saturating: `spec.md` §3/§7 group the handle counter with `Id` and
    /// `CacheKey` as a counter whose exhaustion is a hard failure, not a
    /// condition to paper over.
    pub(crate) fn notify_handle_constructed(&self, cache_key: CacheKey) -> Result<()> {
        let was_zero = {
            let slab = self.by_cache_key.borrow();
            match slab.get(cache_key.slab_key()) {
                Some(obj) => {
                    let mut o = obj.borrow_mut();
                    let was_zero = o.handle_count == 0;
                    o.handle_count = o
                        .handle_count
                        .checked_add(1)
                        .ok_or(Error::OverflowError)?;
                    was_zero
                }
                None => return Ok(()),
            }
        };
        if was_zero {
            self.orphan_cache.borrow_mut().retain(|k| *k != cache_key);
        }
        Ok(())
    }

    /// Drops the handle counter for the object at `cache_key`. If it
    /// reaches zero and the object is evictable (loaded, not saving, not
    /// registered against a pending transaction rollback), either queues
    /// it in the orphan cache or evicts it immediately depending on
    /// whether caching is enabled.
    ///
    /// A decrement past zero would mean a handle was destroyed twice for
    /// the same construction, which is an internal bookkeeping bug rather
    /// than a condition a caller can trigger or recover from; it is
    /// reported the same way, via [`Error::OverflowError`], rather than
    /// wrapping silently.
    pub(crate) fn notify_handle_destroyed(&self, cache_key: CacheKey) -> Result<()> {
        let evictable = {
            let slab = self.by_cache_key.borrow();
            match slab.get(cache_key.slab_key()) {
                Some(obj) => {
                    let mut o = obj.borrow_mut();
                    o.handle_count = o
                        .handle_count
                        .checked_sub(1)
                        .ok_or(Error::OverflowError)?;
                    o.handle_count == 0
                        && o.state == ObjectState::Loaded
                        && o.pending_rollback_count == 0
                }
                None => return Ok(()),
            }
        };
        if evictable {
            if self.caching_enabled.get() {
                self.push_orphan(cache_key);
            } else {
                self.evict(cache_key);
            }
        }
        Ok(())
    }

    /// Records that `cache_key`'s object was assigned `id` on its first
    /// successful save.
    pub(crate) fn notify_id_assigned(&self, cache_key: CacheKey, id: Id) {
        self.by_id.borrow_mut().insert(id, cache_key);
    }

    /// Undoes a speculative `by_id` entry after a save is rolled back.
    /// Only meaningful for objects that were new (never saved before);
    /// the object itself remains cached, `Dirty`, under its cache key.
    pub(crate) fn notify_save_failed(&self, cache_key: CacheKey, id: Id) {
        let mut by_id = self.by_id.borrow_mut();
        if by_id.get(&id) == Some(&cache_key) {
            by_id.remove(&id);
        }
    }

    /// Forces eviction of `cache_key` regardless of cache policy. Refuses
    /// (returning `false`) if the object still has live handles.
    pub fn uncache(&self, cache_key: CacheKey) -> bool {
        let busy = {
            let slab = self.by_cache_key.borrow();
            match slab.get(cache_key.slab_key()) {
                Some(obj) => obj.borrow().handle_count > 0,
                None => return true,
            }
        };
        if busy {
            return false;
        }
        self.orphan_cache.borrow_mut().retain(|k| *k != cache_key);
        self.evict(cache_key);
        true
    }

    fn push_orphan(&self, cache_key: CacheKey) {
        let overflow = {
            let mut orphans = self.orphan_cache.borrow_mut();
            orphans.push_back(cache_key);
            if orphans.len() > self.orphan_capacity.get() {
                orphans.pop_front()
            } else {
                None
            }
        };
        if let Some(oldest) = overflow {
            self.evict(oldest);
        }
    }

    fn evict(&self, cache_key: CacheKey) {
        let removed = self.by_cache_key.borrow_mut().try_remove(cache_key.slab_key());
        if let Some(obj) = removed {
            log::trace!(target: "persist_core", "evicting {cache_key} (id={:?})", obj.borrow().id);
            if let Some(id) = obj.borrow().id {
                self.by_id.borrow_mut().remove(&id);
            }
        }
    }
}

impl<T: Persistent> fmt::Debug for IdentityMap<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityMap")
            .field("cached", &self.len())
            .field("orphans", &self.orphan_cache.borrow().len())
            .field("caching_enabled", &self.caching_enabled.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct Dummy {
        value: i64,
    }

    impl Persistent for Dummy {
        fn primary_table_name() -> &'static str {
            "dummy"
        }
        fn exclusive_table_name() -> &'static str {
            "dummy"
        }
        fn primary_key_name() -> &'static str {
            "col_A"
        }
        fn do_load(_conn: &crate::Connection, _id: Id) -> Result<Self> {
            Ok(Self::default())
        }
        fn do_save_new(&self, _conn: &crate::Connection) -> Result<Id> {
            Ok(1)
        }
        fn do_save_existing(&self, _conn: &crate::Connection, _id: Id) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn provide_by_id_is_idempotent() {
        let map = IdentityMap::<Dummy>::new();
        let (k1, a) = map.provide_by_id(7).unwrap();
        let (k2, b) = map.provide_by_id(7).unwrap();
        assert_eq!(k1, k2);
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn provide_new_allocates_distinct_cache_keys() {
        let map = IdentityMap::<Dummy>::new();
        let (k1, _) = map.provide_new().unwrap();
        let (k2, _) = map.provide_new().unwrap();
        assert_ne!(k1, k2);
    }

    #[test]
    fn handle_count_zero_evicts_when_caching_disabled() {
        let map = IdentityMap::<Dummy>::new();
        map.set_caching_enabled(false);
        let (cache_key, obj) = map.provide_by_id(1).unwrap();
        obj.borrow_mut().state = ObjectState::Loaded;
        map.notify_handle_constructed(cache_key).unwrap();
        map.notify_handle_destroyed(cache_key).unwrap();
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn handle_count_zero_orphans_when_caching_enabled() {
        let map = IdentityMap::<Dummy>::new();
        let (cache_key, obj) = map.provide_by_id(1).unwrap();
        obj.borrow_mut().state = ObjectState::Loaded;
        map.notify_handle_constructed(cache_key).unwrap();
        map.notify_handle_destroyed(cache_key).unwrap();
        assert_eq!(map.len(), 1);
        let (revived_key, revived) = map.provide_by_id(1).unwrap();
        assert_eq!(revived_key, cache_key);
        assert!(Rc::ptr_eq(&obj, &revived));
    }

    #[test]
    fn dirty_object_survives_zero_handles() {
        let map = IdentityMap::<Dummy>::new();
        let (cache_key, obj) = map.provide_new().unwrap();
        assert_eq!(obj.borrow().state, ObjectState::Dirty);
        map.notify_handle_constructed(cache_key).unwrap();
        map.notify_handle_destroyed(cache_key).unwrap();
        assert_eq!(map.len(), 1, "dirty objects are never evicted");
    }

    #[test]
    fn orphan_cache_evicts_oldest_past_capacity() {
        let map = IdentityMap::<Dummy>::new();
        map.set_orphan_capacity(1);
        let (k1, obj1) = map.provide_by_id(1).unwrap();
        obj1.borrow_mut().state = ObjectState::Loaded;
        map.notify_handle_constructed(k1).unwrap();
        map.notify_handle_destroyed(k1).unwrap();

        let (k2, obj2) = map.provide_by_id(2).unwrap();
        obj2.borrow_mut().state = ObjectState::Loaded;
        map.notify_handle_constructed(k2).unwrap();
        map.notify_handle_destroyed(k2).unwrap();

        assert_eq!(map.len(), 1);
        assert!(map.provide_by_id(1).unwrap().1.borrow().state == ObjectState::Ghost);
    }
}
