use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use crate::connection::Connection;
use crate::error::Result;
use crate::handle::Handle;
use crate::object::Persistent;
use crate::statement::StepResult;
use crate::statement_cache::StatementLease;
use crate::Id;

/// Shared, mutable stream state. Every clone of a [`TableCursor`] holds an
/// `Rc` to the same `CursorState`, so advancing through any clone advances
/// the underlying `SELECT` for all of them — the same "one stream, many
/// handles to it" shape `Rc<RefCell<_>>` already gives the rest of this
/// crate, generalized here instead of reached for a `Mutex` the crate's
/// single-threaded model has no use for.
struct CursorState<'conn> {
    lease: Option<StatementLease<'conn>>,
    current: Option<Id>,
}

impl<'conn> CursorState<'conn> {
    fn advance(&mut self) -> Result<()> {
        self.current = match &mut self.lease {
            Some(lease) => match lease.step()? {
                StepResult::Row => Some(lease.extract::<Id>(0)?),
                StepResult::Done => None,
            },
            None => None,
        };
        Ok(())
    }
}

/// A lazy, forward-only cursor over a `SELECT <pk> FROM <table>` result
/// set, materializing each row into a [`Handle<T>`] via
/// [`Handle::create_unchecked`].
///
/// Unlike the teacher's pooled resources, `TableCursor` never owns its
/// rows eagerly: `spec.md` §9 resolves the "eager `Reader` vs. lazy
/// `TableIterator`" open question in favor of the lazy form, so one row at
/// a time is pulled off the shared [`StatementLease`] as the cursor
/// advances. Cloning a cursor does not duplicate the stream; both clones
/// advance together.
pub struct TableCursor<'conn, T: Persistent> {
    conn: &'conn Connection,
    state: Rc<RefCell<CursorState<'conn>>>,
    _marker: PhantomData<T>,
}

impl<'conn, T: Persistent> TableCursor<'conn, T> {
    /// Opens a cursor over every row of [`Persistent::primary_table_name`],
    /// ordered by [`Persistent::primary_key_name`].
    pub fn scan_all(conn: &'conn Connection) -> Result<Self> {
        let sql = format!(
            "SELECT {} FROM {} ORDER BY {}",
            T::primary_key_name(),
            T::primary_table_name(),
            T::primary_key_name()
        );
        Self::from_sql(conn, &sql)
    }

    /// Opens a cursor over the primary keys returned by an arbitrary
    /// `sql_text`. The first (and only) selected column must be the
    /// table's primary key; any other column, or zero columns, produces
    /// whatever error `extract::<Id>(0)` raises on the first `advance`.
    pub fn from_sql(conn: &'conn Connection, sql_text: &str) -> Result<Self> {
        let lease = conn.statement_cache().lend(sql_text)?;
        let state = Rc::new(RefCell::new(CursorState {
            lease: Some(lease),
            current: None,
        }));
        state.borrow_mut().advance()?;
        Ok(Self {
            conn,
            state,
            _marker: PhantomData,
        })
    }

    /// A cursor bound to no statement. Compares equal to any other cursor
    /// that currently holds no materialized element, the same "end
    /// iterator" sentinel a default-constructed forward iterator gives
    /// you.
    pub fn none(conn: &'conn Connection) -> Self {
        Self {
            conn,
            state: Rc::new(RefCell::new(CursorState {
                lease: None,
                current: None,
            })),
            _marker: PhantomData,
        }
    }

    /// Whether the cursor currently holds a materialized row.
    pub fn has_current(&self) -> bool {
        self.state.borrow().current.is_some()
    }

    /// The handle for the current row, or `None` if the stream is
    /// exhausted (or this is a [`Self::none`] sentinel).
    pub fn current(&self) -> Result<Option<Handle<'conn, T>>> {
        match self.state.borrow().current {
            Some(id) => Handle::create_unchecked(self.conn, id).map(Some),
            None => Ok(None),
        }
    }

    /// Advances the shared stream by one row, returning the element that
    /// was current *before* advancing — identical postfix-increment
    /// semantics to a stream iterator: every clone sharing this cursor's
    /// state observes the advance.
    pub fn advance(&self) -> Result<Option<Handle<'conn, T>>> {
        let previous = self.current()?;
        self.state.borrow_mut().advance()?;
        Ok(previous)
    }
}

impl<'conn, T: Persistent> Clone for TableCursor<'conn, T> {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn,
            state: Rc::clone(&self.state),
            _marker: PhantomData,
        }
    }
}

impl<'conn, T: Persistent> Iterator for TableCursor<'conn, T> {
    type Item = Handle<'conn, T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.advance().ok().flatten()
    }
}

impl<'conn, T: Persistent> PartialEq for TableCursor<'conn, T> {
    /// Two cursors compare equal iff neither currently holds a
    /// materialized element — the same "is this the end iterator" check a
    /// forward iterator supports, not pointer identity of the shared
    /// stream.
    fn eq(&self, other: &Self) -> bool {
        !self.has_current() && !other.has_current()
    }
}

impl<'conn, T: Persistent> Eq for TableCursor<'conn, T> {}

impl<'conn, T: Persistent> fmt::Debug for TableCursor<'conn, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableCursor")
            .field("has_current", &self.has_current())
            .finish()
    }
}
