//! Copy-on-write core of a union filesystem.
//!
//! A union mount stacks branch directories, each read-only or read-write,
//! into one merged namespace. This crate implements the machinery underneath
//! such a mount: [`BranchIo`] performs any directory-entry operation against
//! a branch picked by ordinal, [`CowEngine`] promotes objects from read-only
//! onto read-write branches when they are about to be modified, and
//! [`WhiteoutStore`] records and answers for deletions of objects that still
//! exist lower in the stack. The FUSE front-end, branch discovery and option
//! parsing live elsewhere and talk to this crate through [`Config`],
//! [`BranchFinder`] and the errno surface on [`CowfsError`].

pub mod branch;
pub mod config;
pub mod cow;
pub mod error;
pub mod whiteout;

pub use branch::{BranchIo, PathKind};
pub use config::{
    BackendKind, Branch, BranchFinder, BranchMode, BranchSpec, Config, HIDETAG, METADIR,
    PATHLEN_MAX,
};
pub use cow::{CowEngine, FileKind};
pub use error::{CowfsError, Result};
pub use whiteout::{WhiteoutKind, WhiteoutStore};
