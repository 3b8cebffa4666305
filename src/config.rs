use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use crate::error::{CowfsError, Result};

/// Upper bound on every constructed branch-local path, terminator included.
pub const PATHLEN_MAX: usize = 4096;

/// Name of the per-branch metadata directory holding whiteout markers.
pub const METADIR: &str = ".unionfs";

/// Reserved terminal name of a whiteout marker inside the metadata directory.
pub const HIDETAG: &str = "__HIDDEN__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BranchMode {
    #[serde(rename = "ro")]
    ReadOnly,
    #[serde(rename = "rw")]
    ReadWrite,
}

impl std::fmt::Display for BranchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BranchMode::ReadOnly => write!(f, "ro"),
            BranchMode::ReadWrite => write!(f, "rw"),
        }
    }
}

impl std::str::FromStr for BranchMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ro" => Ok(BranchMode::ReadOnly),
            "rw" => Ok(BranchMode::ReadWrite),
            _ => Err(format!("Invalid branch mode '{}'. Must be one of: ro, rw", s)),
        }
    }
}

/// How branch-local paths are turned into syscalls.
///
/// `Handle` issues every operation through the branch's long-lived root
/// descriptor with the `*at` syscall family, so it keeps working if the
/// branch root is renamed underneath a running mount. `Prefix` concatenates
/// the branch root onto the path and uses plain path syscalls. The choice is
/// made once per process; both backends are observationally equivalent short
/// of a root rename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Handle,
    Prefix,
}

/// One branch as described by the mounting front-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchSpec {
    pub path: PathBuf,
    pub mode: BranchMode,
}

/// One underlying directory of the union stack. The ordinal of a branch is
/// its index in [`Config::branches`]; lower ordinals shadow higher ones.
#[derive(Debug)]
pub struct Branch {
    root: PathBuf,
    mode: BranchMode,
    // Open from initialization until teardown, never rotated.
    handle: Option<File>,
}

impl Branch {
    fn open(spec: &BranchSpec, backend: BackendKind) -> Result<Branch> {
        let handle = match backend {
            BackendKind::Handle => {
                let dir = OpenOptions::new()
                    .read(true)
                    .custom_flags(libc::O_DIRECTORY)
                    .open(&spec.path)
                    .map_err(|e| {
                        CowfsError::Config(format!(
                            "Failed to open branch root {}: {}",
                            spec.path.display(),
                            e
                        ))
                    })?;
                Some(dir)
            }
            BackendKind::Prefix => None,
        };

        Ok(Branch {
            root: spec.path.clone(),
            mode: spec.mode,
            handle,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mode(&self) -> BranchMode {
        self.mode
    }

    pub(crate) fn handle(&self) -> std::io::Result<&File> {
        self.handle
            .as_ref()
            .ok_or_else(|| std::io::Error::from_raw_os_error(libc::EBADF))
    }
}

/// Immutable per-mount configuration, passed by reference into the
/// constructed [`BranchIo`](crate::BranchIo), [`CowEngine`](crate::CowEngine)
/// and [`WhiteoutStore`](crate::WhiteoutStore) values.
#[derive(Debug)]
pub struct Config {
    cow_enabled: bool,
    backend: BackendKind,
    branches: Vec<Branch>,
    metadir: String,
    hide_tag: String,
}

impl Config {
    pub fn new(specs: &[BranchSpec], backend: BackendKind, cow_enabled: bool) -> Result<Config> {
        let mut branches = Vec::with_capacity(specs.len());
        for spec in specs {
            branches.push(Branch::open(spec, backend)?);
        }

        Ok(Config {
            cow_enabled,
            backend,
            branches,
            metadir: METADIR.to_string(),
            hide_tag: HIDETAG.to_string(),
        })
    }

    pub fn with_metadir(mut self, metadir: impl Into<String>) -> Config {
        self.metadir = metadir.into();
        self
    }

    pub fn with_hide_tag(mut self, hide_tag: impl Into<String>) -> Config {
        self.hide_tag = hide_tag.into();
        self
    }

    pub fn cow_enabled(&self) -> bool {
        self.cow_enabled
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn nbranches(&self) -> usize {
        self.branches.len()
    }

    pub fn branch(&self, ordinal: usize) -> Option<&Branch> {
        self.branches.get(ordinal)
    }

    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    pub fn metadir(&self) -> &str {
        &self.metadir
    }

    pub fn hide_tag(&self) -> &str {
        &self.hide_tag
    }
}

/// Branch discovery, owned by the front-end: given a union path, the ordinal
/// of the branch the path currently resolves on, or `None` if it resolves
/// nowhere in the stack.
pub trait BranchFinder {
    fn find_rorw_branch(&self, path: &OsStr) -> Option<usize>;
}
