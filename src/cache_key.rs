/// A per-identity-map integer distinct from [`crate::Id`], assigned when an
/// object enters the cache before any `Id` is known.
///
/// Allocation is delegated to [`slab::Slab`], which is exactly the
/// "monotonically probe for a free slot, reuse freed slots" allocator the
/// component design calls for: inserting yields the lowest currently-free
/// slot, and removing an entry frees that slot for the next insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(pub(crate) usize);

impl CacheKey {
    pub(crate) fn from_slab_key(key: usize) -> Self {
        Self(key)
    }

    pub(crate) fn slab_key(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}
