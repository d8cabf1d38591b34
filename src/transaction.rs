use std::cell::{Cell, RefCell};

use crate::error::{Error, Result};

/// A registered save's two possible outcomes: `on_cancel` restores
/// in-memory state if this level (or an enclosing one) is rolled back;
/// `on_discard` just clears the object's "rollback pending" bookkeeping
/// once it becomes certain no enclosing rollback can ever reach it, i.e.
/// at the outermost `COMMIT`.
struct FrameEntry {
    on_cancel: Box<dyn FnOnce()>,
    on_discard: Box<dyn FnOnce()>,
}

/// One level's worth of rollback callbacks, run in reverse registration
/// order if that level is cancelled, merged into the enclosing level if
/// it commits instead.
type RollbackFrame = Vec<FrameEntry>;

/// Nested-savepoint transaction stack for a single connection.
///
/// Depth 0 maps to a plain `BEGIN`/`COMMIT`/`ROLLBACK`; every deeper level
/// maps to a named `SAVEPOINT`. Each level owns a frame of rollback
/// callbacks, the data-layer analogue of the teacher's `DropGuard`: a
/// save registers one before touching the database, and it only ever
/// runs if that level is cancelled, not if it commits.
pub struct TransactionCoordinator {
    depth: Cell<usize>,
    poisoned: Cell<bool>,
    frames: RefCell<Vec<RollbackFrame>>,
}

impl Default for TransactionCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionCoordinator {
    pub(crate) fn new() -> Self {
        Self {
            depth: Cell::new(0),
            poisoned: Cell::new(false),
            frames: RefCell::new(Vec::new()),
        }
    }

    /// Current nesting depth (0 outside any transaction).
    pub fn depth(&self) -> usize {
        self.depth.get()
    }

    /// Whether the outermost transaction has been poisoned by an
    /// unrecoverable SQL failure.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.get()
    }

    /// Registers a save's rollback/discard pair with the innermost open
    /// frame. `on_cancel` runs (in reverse registration order, alongside
    /// the rest of that frame) if this level or any enclosing one is
    /// cancelled; `on_discard` runs instead, exactly once, once the
    /// outermost transaction commits with nothing left to roll this save
    /// back.
    pub(crate) fn register_rollback(
        &self,
        on_cancel: impl FnOnce() + 'static,
        on_discard: impl FnOnce() + 'static,
    ) {
        if let Some(frame) = self.frames.borrow_mut().last_mut() {
            frame.push(FrameEntry {
                on_cancel: Box::new(on_cancel),
                on_discard: Box::new(on_discard),
            });
        }
    }

    /// Marks the outermost transaction poisoned: every enclosing `commit`
    /// will refuse and force a `cancel` instead. Called when a SQL
    /// operation fails inside a transaction level this caller did not
    /// open itself, so it cannot unilaterally cancel just its own level.
    pub(crate) fn poison(&self) {
        log::warn!(target: "persist_core", "transaction poisoned at depth {}", self.depth.get());
        self.poisoned.set(true);
    }

    pub(crate) fn begin(&self, conn: &rusqlite::Connection) -> Result<()> {
        let depth = self.depth.get();
        let sql = if depth == 0 {
            "BEGIN".to_owned()
        } else {
            format!("SAVEPOINT sp_{depth}")
        };
        log::trace!(target: "persist_core", "{sql}");
        if let Err(e) = conn.execute_batch(&sql) {
            // A failed `BEGIN` at depth 0 opened nothing: there is no frame
            // for a future `cancel()` to unwind through, and thus no place
            // that would ever clear `poisoned` again. Only a failed
            // `SAVEPOINT` inside an already-open transaction poisons it.
            if depth > 0 {
                self.poisoned.set(true);
            }
            return Err(e.into());
        }
        self.depth.set(depth + 1);
        self.frames.borrow_mut().push(Vec::new());
        Ok(())
    }

    pub(crate) fn commit(&self, conn: &rusqlite::Connection) -> Result<()> {
        let depth = self.depth.get();
        if depth == 0 || self.poisoned.get() {
            return Err(Error::TransactionNestingError);
        }
        let new_depth = depth - 1;
        let sql = if new_depth == 0 {
            "COMMIT".to_owned()
        } else {
            format!("RELEASE SAVEPOINT sp_{new_depth}")
        };
        log::trace!(target: "persist_core", "{sql}");
        if let Err(e) = conn.execute_batch(&sql) {
            self.poisoned.set(true);
            log::warn!(target: "persist_core", "commit at depth {depth} failed, transaction poisoned: {e}");
            return Err(e.into());
        }
        self.depth.set(new_depth);
        let frame = self.frames.borrow_mut().pop().unwrap_or_default();
        if new_depth > 0 {
            // Merge into the enclosing frame so an outer cancel still
            // rolls back changes this level already released.
            if let Some(outer) = self.frames.borrow_mut().last_mut() {
                outer.extend(frame);
            }
        } else {
            // Nothing enclosing can ever roll these saves back now.
            for entry in frame {
                (entry.on_discard)();
            }
        }
        Ok(())
    }

    pub(crate) fn cancel(&self, conn: &rusqlite::Connection) -> Result<()> {
        let depth = self.depth.get();
        if depth == 0 {
            return Err(Error::TransactionNestingError);
        }
        let new_depth = depth - 1;
        let sql = if new_depth == 0 {
            "ROLLBACK".to_owned()
        } else {
            format!("ROLLBACK TO SAVEPOINT sp_{new_depth}; RELEASE SAVEPOINT sp_{new_depth}")
        };
        log::debug!(target: "persist_core", "{sql}");
        let result = conn.execute_batch(&sql);
        self.depth.set(new_depth);
        if new_depth == 0 {
            self.poisoned.set(false);
        }
        if let Some(frame) = self.frames.borrow_mut().pop() {
            for entry in frame.into_iter().rev() {
                (entry.on_cancel)();
            }
        }
        result.map_err(Into::into)
    }
}

impl std::fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("depth", &self.depth.get())
            .field("poisoned", &self.poisoned.get())
            .finish()
    }
}

/// A single open transaction level.
///
/// Borrowed out of [`crate::Connection::begin`]. Dropping it without
/// calling [`Self::commit`] or [`Self::cancel`] cancels it, the same
/// return-or-detach-on-drop discipline the teacher's pooled [`Object`]
/// uses to decide between returning and discarding.
///
/// [`Object`]: https://docs.rs/deadpool/latest/deadpool/managed/struct.Object.html
#[must_use]
pub struct Transaction<'a> {
    conn: &'a rusqlite::Connection,
    coordinator: &'a TransactionCoordinator,
    finished: Cell<bool>,
}

impl<'a> Transaction<'a> {
    pub(crate) fn begin(
        conn: &'a rusqlite::Connection,
        coordinator: &'a TransactionCoordinator,
    ) -> Result<Self> {
        coordinator.begin(conn)?;
        Ok(Self {
            conn,
            coordinator,
            finished: Cell::new(false),
        })
    }

    /// Nesting depth this transaction was opened at.
    pub fn depth(&self) -> usize {
        self.coordinator.depth()
    }

    /// Commits this level. A poisoned transaction refuses to commit and
    /// is forced through [`Self::cancel`] instead, at every enclosing
    /// level, matching the component design's strict poison propagation.
    pub fn commit(self) -> Result<()> {
        self.finished.set(true);
        if self.coordinator.is_poisoned() {
            let _ = self.coordinator.cancel(self.conn);
            return Err(Error::TransactionNestingError);
        }
        let result = self.coordinator.commit(self.conn);
        if result.is_err() {
            let _ = self.coordinator.cancel(self.conn);
        }
        result
    }

    /// Cancels this level, running its rollback frame.
    pub fn cancel(self) -> Result<()> {
        self.finished.set(true);
        self.coordinator.cancel(self.conn)
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished.get() {
            let _ = self.coordinator.cancel(self.conn);
        }
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("depth", &self.depth())
            .field("finished", &self.finished.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc;

    fn conn() -> rusqlite::Connection {
        rusqlite::Connection::open_in_memory().unwrap()
    }

    #[test]
    fn nested_commit_merges_into_enclosing_frame() {
        let c = conn();
        let coord = TransactionCoordinator::new();
        let log: Rc<StdRefCell<Vec<&'static str>>> = Rc::new(StdRefCell::new(Vec::new()));

        coord.begin(&c).unwrap();
        coord.begin(&c).unwrap();
        assert_eq!(coord.depth(), 2);

        let log_inner = Rc::clone(&log);
        coord.register_rollback(
            move || log_inner.borrow_mut().push("cancelled"),
            move || {},
        );
        coord.commit(&c).unwrap(); // releases the inner savepoint
        assert_eq!(coord.depth(), 1);
        assert!(log.borrow().is_empty(), "commit must not run on_cancel");

        coord.cancel(&c).unwrap(); // rolls back the outer transaction
        assert_eq!(coord.depth(), 0);
        assert_eq!(*log.borrow(), vec!["cancelled"]);
    }

    #[test]
    fn outermost_commit_discards_pending_rollbacks() {
        let c = conn();
        let coord = TransactionCoordinator::new();
        let discarded = Rc::new(std::cell::Cell::new(false));

        coord.begin(&c).unwrap();
        let d = Rc::clone(&discarded);
        coord.register_rollback(|| (), move || d.set(true));
        coord.commit(&c).unwrap();

        assert!(discarded.get());
    }

    #[test]
    fn poisoned_transaction_refuses_commit() {
        let c = conn();
        let coord = TransactionCoordinator::new();
        coord.begin(&c).unwrap();
        coord.poison();
        assert!(matches!(coord.commit(&c), Err(Error::TransactionNestingError)));
    }

    #[test]
    fn depth_zero_cancel_is_an_error() {
        let c = conn();
        let coord = TransactionCoordinator::new();
        assert!(matches!(coord.cancel(&c), Err(Error::TransactionNestingError)));
    }

    #[test]
    fn failed_depth_zero_begin_does_not_poison() {
        let c = conn();
        let coord = TransactionCoordinator::new();

        // Put the connection into a transaction behind the coordinator's
        // back, so its own depth-0 `BEGIN` fails ("cannot start a
        // transaction within a transaction") without having opened
        // anything the coordinator could later unwind through `cancel()`.
        c.execute_batch("BEGIN").unwrap();
        assert!(coord.begin(&c).is_err());
        assert_eq!(coord.depth(), 0);
        assert!(!coord.is_poisoned(), "nothing was opened, so nothing should be poisoned");
        c.execute_batch("ROLLBACK").unwrap();

        // A later, legitimate transaction must work normally.
        coord.begin(&c).unwrap();
        coord.commit(&c).unwrap();
    }
}
