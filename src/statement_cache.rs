use std::fmt;

use crate::error::Result;
use crate::statement::{FromColumn, StatementHandle, StepResult, Value};

/// Per-connection cache of prepared statements, keyed by SQL text.
///
/// The actual text-keyed caching of compiled statements is delegated to
/// [`rusqlite::Connection::prepare_cached`]: it already implements
/// "return the cached statement for this text if one is free, else
/// compile a new one and cache that instead" — which is precisely the
/// lookup/insert rule this type needs, and precisely why asking for the
/// same text twice while the first lease is still outstanding yields two
/// independent [`StatementHandle`]s rather than one shared, re-entered
/// one. `StatementCache` layers the extra contract on top: the
/// single-statement precheck, and a lease that resets the handle and
/// clears its bindings when returned.
pub struct StatementCache<'conn> {
    conn: &'conn rusqlite::Connection,
}

impl<'conn> StatementCache<'conn> {
    pub(crate) fn new(conn: &'conn rusqlite::Connection) -> Self {
        Self { conn }
    }

    /// Lends a [`StatementHandle`] prepared from `sql_text`.
    ///
    /// Fails with [`crate::Error::TooManyStatements`] if `sql_text`
    /// contains more than one statement.
    pub fn lend(&self, sql_text: &str) -> Result<StatementLease<'conn>> {
        StatementHandle::check_single_statement(sql_text)?;
        let size_before = self.conn.prepared_statement_cache_size();
        let stmt = self.conn.prepare_cached(sql_text)?;
        if self.conn.prepared_statement_cache_size() > size_before {
            log::trace!(target: "persist_core", "statement cache miss, compiled: {sql_text}");
        } else {
            log::trace!(target: "persist_core", "statement cache hit: {sql_text}");
        }
        let handle = StatementHandle::new(stmt);
        handle.lock();
        Ok(StatementLease { handle })
    }

    /// Number of compiled statements rusqlite currently holds for this
    /// connection, across all SQL texts, on loan or not.
    pub fn size(&self) -> usize {
        self.conn.prepared_statement_cache_size()
    }
}

impl fmt::Debug for StatementCache<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatementCache")
            .field("size", &self.size())
            .finish()
    }
}

/// An on-loan [`StatementHandle`].
///
/// The only legal way to return a handle to the cache is to let this
/// guard drop: it resets the statement, clears its bindings, and
/// unlocks it, mirroring the teacher's own acquire/use/return-on-drop
/// pooled-object shape.
#[must_use]
pub struct StatementLease<'conn> {
    handle: StatementHandle<'conn>,
}

impl<'conn> StatementLease<'conn> {
    /// Binds `value` to the named parameter `:param_name`.
    pub fn bind(&mut self, param_name: &str, value: impl Into<Value>) -> Result<()> {
        self.handle.bind(param_name, value)
    }

    /// Advances the statement by one row.
    pub fn step(&mut self) -> Result<StepResult> {
        self.handle.step()
    }

    /// Steps the statement, failing if it produced a result row.
    pub fn step_final(&mut self) -> Result<()> {
        self.handle.step_final()
    }

    /// Extracts column `col_index` of the current row as `T`.
    pub fn extract<T: FromColumn>(&self, col_index: usize) -> Result<T> {
        self.handle.extract(col_index)
    }
}

impl fmt::Debug for StatementLease<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatementLease").field("handle", &self.handle).finish()
    }
}

impl Drop for StatementLease<'_> {
    fn drop(&mut self) {
        self.handle.reset();
        self.handle.clear_bindings();
        self.handle.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> rusqlite::Connection {
        rusqlite::Connection::open_in_memory().unwrap()
    }

    #[test]
    fn rejects_text_with_more_than_one_statement() {
        let c = conn();
        let cache = StatementCache::new(&c);
        assert!(matches!(
            cache.lend("select 1; select 2"),
            Err(crate::Error::TooManyStatements)
        ));
    }

    #[test]
    fn concurrent_leases_of_the_same_text_get_distinct_statements() {
        let c = conn();
        c.execute_batch("CREATE TABLE t(a INTEGER)").unwrap();
        let cache = StatementCache::new(&c);

        // Two outstanding leases of the same text must not alias: each one
        // independently binds/steps without the other interfering.
        let mut a = cache.lend("INSERT INTO t(a) VALUES (:v)").unwrap();
        let mut b = cache.lend("INSERT INTO t(a) VALUES (:v)").unwrap();
        a.bind("v", 1_i64).unwrap();
        b.bind("v", 2_i64).unwrap();
        a.step_final().unwrap();
        b.step_final().unwrap();
        drop(a);
        drop(b);

        let mut check = cache.lend("SELECT a FROM t ORDER BY a").unwrap();
        assert_eq!(check.step().unwrap(), StepResult::Row);
        assert_eq!(check.extract::<i64>(0).unwrap(), 1);
        assert_eq!(check.step().unwrap(), StepResult::Row);
        assert_eq!(check.extract::<i64>(0).unwrap(), 2);
    }

    #[test]
    fn returned_lease_is_reusable_after_drop() {
        let c = conn();
        c.execute_batch("CREATE TABLE t(a INTEGER)").unwrap();
        let cache = StatementCache::new(&c);

        {
            let mut lease = cache.lend("INSERT INTO t(a) VALUES (:v)").unwrap();
            lease.bind("v", 1_i64).unwrap();
            lease.step_final().unwrap();
        }
        {
            let mut lease = cache.lend("INSERT INTO t(a) VALUES (:v)").unwrap();
            lease.bind("v", 2_i64).unwrap();
            lease.step_final().unwrap();
        }

        let mut check = cache.lend("SELECT count(*) FROM t").unwrap();
        check.step().unwrap();
        assert_eq!(check.extract::<i64>(0).unwrap(), 2);
    }
}
