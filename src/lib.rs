#![doc = include_str!("../README.md")]
#![deny(
    nonstandard_style,
    rust_2018_idioms,
    rustdoc::broken_intra_doc_links,
    rustdoc::private_intra_doc_links
)]
#![forbid(non_ascii_idents, unsafe_code)]
#![warn(
    deprecated_in_future,
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    unreachable_pub,
    unused_import_braces,
    unused_labels,
    unused_lifetimes,
    unused_qualifications
)]

//! A typed persistence layer over a single embedded SQLite connection.
//!
//! The crate guarantees that every row of a persisted entity type is
//! represented by at most one live in-memory object per [`Connection`],
//! that concurrent mutations through independent [`Handle`]s converge
//! deterministically, and that a failed save never leaks partial state
//! to the database or to memory.
//!
//! The pieces fit together as follows, leaves first:
//!
//! - [`StatementHandle`] / [`StatementCache`] — prepared statement reuse
//!   with an exclusive-use lock.
//! - [`Connection`] / [`TransactionCoordinator`] — the open database
//!   handle, its statement cache, and a nested-savepoint transaction
//!   stack.
//! - [`IdentityMap`] — the per-connection, per-base-type cache enforcing
//!   one object per row.
//! - [`PersistentObject`] / [`Persistent`] — the ghost/loaded/dirty/saving
//!   state machine backing a single row.
//! - [`Handle`] — the refcounted smart reference user code actually
//!   touches.
//! - [`TableCursor`] — a lazy forward iterator materializing rows into
//!   handles.
//!
//! None of these types are [`Send`] or [`Sync`]: a [`Connection`] and
//! everything hanging off it is meant to be driven by exactly one thread.
//! Open a separate [`Connection`] per thread instead of sharing one.

mod cache_key;
mod connection;
mod cursor;
mod error;
mod handle;
mod identity_map;
mod object;
mod statement;
mod statement_cache;
mod transaction;

pub use crate::cache_key::CacheKey;
pub use crate::connection::{Config, Connection};
pub use crate::cursor::TableCursor;
pub use crate::error::{Error, Result};
pub use crate::handle::Handle;
pub use crate::identity_map::IdentityMap;
pub use crate::object::{ObjectState, Persistent, PersistentObject};
pub use crate::statement::{StatementHandle, StepResult};
pub use crate::statement_cache::StatementCache;
pub use crate::transaction::{Transaction, TransactionCoordinator};

/// Row primary key, allocated by SQLite's `AUTOINCREMENT` on the base
/// table of a persisted type hierarchy.
pub type Id = i64;

const _: () = assert!(std::mem::size_of::<i64>() >= 8);
