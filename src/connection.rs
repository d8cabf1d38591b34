use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::cell::RefCell;

use crate::error::Result;
use crate::identity_map::IdentityMap;
use crate::object::Persistent;
use crate::statement_cache::StatementCache;
use crate::transaction::{Transaction, TransactionCoordinator};
use crate::Id;

/// Configuration for opening a [`Connection`].
///
/// Mirrors the teacher's own `sqlite::Config`: a plain struct carrying
/// the database path, `Deserialize`-able behind the `config` cargo
/// feature so applications can source it the same way they source pool
/// configuration, with a convenience constructor that opens the
/// connection directly.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "config", derive(serde::Deserialize))]
pub struct Config {
    /// Path to the SQLite database file. `:memory:` opens a private,
    /// temporary in-memory database, exactly as the underlying engine
    /// defines it.
    pub path: String,
}

impl Config {
    /// Creates a new config pointing at `path`.
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    /// Opens a [`Connection`] using this configuration.
    pub fn open(&self) -> Result<Connection> {
        Connection::open(&self.path)
    }
}

/// The open database handle, its statement cache, its transaction
/// coordinator, and the registry of per-base-type identity maps hanging
/// off it.
///
/// Everything reachable from a `Connection` is meant to be driven by
/// exactly one thread: no field here is behind an `Arc`/`Mutex`, only
/// `RefCell`/`Cell`, and the type deliberately has no `Send`/`Sync`
/// impls (auto-trait inference already denies them, since `RefCell` and
/// `Rc` are neither).
pub struct Connection {
    conn: rusqlite::Connection,
    txn: TransactionCoordinator,
    identity_maps: RefCell<HashMap<TypeId, Box<dyn Any>>>,
}

impl Connection {
    /// Opens `path`, enabling foreign keys as the component design
    /// requires.
    ///
    /// A fresh `Connection` value denotes an open connection for its
    /// entire lifetime; Rust's ownership model already rules out the
    /// "operate on an already-closed connection" case the component
    /// design calls [`crate::Error::InvalidConnection`] for; there is no
    /// separate `is_valid` state machine to violate.
    pub fn open(path: &str) -> Result<Self> {
        if path.is_empty() {
            return Err(crate::Error::InvalidConnection);
        }
        let conn = rusqlite::Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn,
            txn: TransactionCoordinator::new(),
            identity_maps: RefCell::new(HashMap::new()),
        })
    }

    /// Opens a private, temporary in-memory database. A thin convenience
    /// over [`Self::open`] with SQLite's own `:memory:` path, used
    /// throughout this crate's own test suite.
    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    /// Always `true` for a live `Connection` value; see the note on
    /// [`Self::open`] for why there is no runtime "closed" state to
    /// check here.
    pub fn is_valid(&self) -> bool {
        true
    }

    /// Prepares, steps to completion, and finalizes `text` without
    /// caching it. Intended for one-shot DDL/DML such as schema setup at
    /// application init.
    pub fn execute_sql(&self, text: &str) -> Result<()> {
        self.conn.execute_batch(text)?;
        Ok(())
    }

    /// The rowid SQLite assigned to the most recent successful `INSERT`
    /// on this connection. [`Persistent::do_save_new`] implementations
    /// call this immediately after their `INSERT` to learn the new id.
    pub fn last_insert_rowid(&self) -> Id {
        self.conn.last_insert_rowid()
    }

    /// Lends prepared statements keyed by SQL text. [`Persistent`]
    /// implementations use this to build their `SELECT`/`INSERT`/`UPDATE`
    /// statements.
    pub fn statement_cache(&self) -> StatementCache<'_> {
        StatementCache::new(&self.conn)
    }

    /// The identity map for base type `T`, constructed on first use and
    /// reused for the lifetime of this connection.
    pub fn identity_map<T: Persistent>(&self) -> Rc<IdentityMap<T>> {
        let type_id = TypeId::of::<T>();
        let mut maps = self.identity_maps.borrow_mut();
        let boxed = maps
            .entry(type_id)
            .or_insert_with(|| Box::new(Rc::new(IdentityMap::<T>::new())) as Box<dyn Any>);
        boxed
            .downcast_ref::<Rc<IdentityMap<T>>>()
            .expect("identity map registry keyed by TypeId cannot mismatch its own type")
            .clone()
    }

    pub(crate) fn transaction_coordinator(&self) -> &TransactionCoordinator {
        &self.txn
    }

    /// Opens a new transaction level: `BEGIN` at depth zero, a named
    /// `SAVEPOINT` at every level beneath that. Dropping the returned
    /// [`Transaction`] without an explicit [`Transaction::commit`] or
    /// [`Transaction::cancel`] cancels it.
    pub fn begin(&self) -> Result<Transaction<'_>> {
        Transaction::begin(&self.conn, &self.txn)
    }

    /// Current transaction nesting depth (0 outside any transaction).
    pub fn transaction_depth(&self) -> usize {
        self.txn.depth()
    }

    /// Whether the outermost transaction has been poisoned by an
    /// unrecoverable SQL failure and must be cancelled.
    pub fn is_transaction_poisoned(&self) -> bool {
        self.txn.is_poisoned()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("transaction_depth", &self.txn.depth())
            .field("transaction_poisoned", &self.txn.is_poisoned())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_rejects_empty_path() {
        assert!(matches!(Connection::open(""), Err(crate::Error::InvalidConnection)));
    }

    #[test]
    fn open_in_memory_enables_foreign_keys() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_sql("CREATE TABLE t(id INTEGER PRIMARY KEY)").unwrap();
        assert_eq!(conn.transaction_depth(), 0);
    }

    #[test]
    fn identity_map_is_reused_across_calls() {
        #[derive(Clone, Default)]
        struct Dummy;
        impl Persistent for Dummy {
            fn primary_table_name() -> &'static str {
                "dummy"
            }
            fn exclusive_table_name() -> &'static str {
                "dummy"
            }
            fn primary_key_name() -> &'static str {
                "id"
            }
            fn do_load(_conn: &Connection, _id: Id) -> Result<Self> {
                Ok(Self)
            }
            fn do_save_new(&self, _conn: &Connection) -> Result<Id> {
                Ok(1)
            }
            fn do_save_existing(&self, _conn: &Connection, _id: Id) -> Result<()> {
                Ok(())
            }
        }
        let conn = Connection::open_in_memory().unwrap();
        let a = conn.identity_map::<Dummy>();
        let b = conn.identity_map::<Dummy>();
        assert!(Rc::ptr_eq(&a, &b));
    }
}
