//! Whiteout handling for the union stack.
//!
//! A whiteout is a marker that makes an object still present on a lower
//! branch look deleted in the union view. Markers live in a reserved
//! metadata directory at the top of each read-write branch, mirroring the
//! branch tree: the whiteout for `/a/b/c` sits at
//! `<branch>/.unionfs/a/b/c/__HIDDEN__`. The marker is an empty file when a
//! file was hidden and an empty directory when a directory was, and hiding a
//! directory implicitly hides everything below it — lookups walk the path
//! prefix by prefix instead of planting a marker at every descendant.

use std::ffi::{OsStr, OsString};
use std::sync::Arc;

use crate::branch::{BranchIo, PathKind};
use crate::config::{BranchFinder, Config, PATHLEN_MAX};
use crate::cow::CowEngine;
use crate::error::{CowfsError, Result};

/// Which flavor of marker to plant; must match the type of the object being
/// hidden at the moment of hiding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhiteoutKind {
    File,
    Dir,
}

pub struct WhiteoutStore {
    cfg: Arc<Config>,
    io: Arc<BranchIo>,
    cow: Arc<CowEngine>,
}

impl WhiteoutStore {
    pub fn new(cow: Arc<CowEngine>) -> WhiteoutStore {
        WhiteoutStore {
            cfg: cow.config().clone(),
            io: cow.io().clone(),
            cow,
        }
    }

    /// Marker location for `path`: `<metadir><path>/<hide tag>`.
    fn marker_fragments<'a>(&'a self, path: &'a OsStr) -> [&'a OsStr; 4] {
        [
            OsStr::new(self.cfg.metadir()),
            path,
            OsStr::new("/"),
            OsStr::new(self.cfg.hide_tag()),
        ]
    }

    /// True iff `path` itself is shadowed by a marker on `branch`.
    pub fn is_hidden(&self, path: &OsStr, branch: usize) -> bool {
        // cow mode disabled, no hidden files
        if !self.cfg.cow_enabled() {
            return false;
        }
        self.io.lstat(branch, &self.marker_fragments(path)).is_ok()
    }

    /// True iff any prefix of `path` (the path itself included) is shadowed
    /// by a marker on `branch`.
    pub fn path_hidden(&self, path: &OsStr, branch: usize) -> bool {
        if !self.cfg.cow_enabled() {
            return false;
        }

        use std::os::unix::ffi::OsStrExt;
        let bytes = path.as_bytes();
        let mut i = 0;
        while i < bytes.len() && bytes[i] == b'/' {
            i += 1;
        }
        loop {
            while i < bytes.len() && bytes[i] != b'/' {
                i += 1;
            }
            if self.is_hidden(OsStr::from_bytes(&bytes[..i]), branch) {
                return true;
            }
            while i < bytes.len() && bytes[i] == b'/' {
                i += 1;
            }
            if i >= bytes.len() {
                break;
            }
        }

        false
    }

    /// Plant a file whiteout for `path` on `branch_rw`.
    pub fn hide_file(&self, path: &OsStr, branch_rw: usize) -> Result<()> {
        self.create_whiteout(path, branch_rw, WhiteoutKind::File)
    }

    /// Plant a directory whiteout for `path` on `branch_rw`.
    pub fn hide_dir(&self, path: &OsStr, branch_rw: usize) -> Result<()> {
        self.create_whiteout(path, branch_rw, WhiteoutKind::Dir)
    }

    /// Called after a successful unlink/rmdir on the read-write branch:
    /// plant a whiteout iff the same path still resolves somewhere in the
    /// stack. Either way the union view no longer exposes `path`. The
    /// caller's `kind` is trusted to match what remains below.
    pub fn maybe_whiteout(
        &self,
        path: &OsStr,
        branch_rw: usize,
        kind: WhiteoutKind,
        finder: &dyn BranchFinder,
    ) -> Result<()> {
        // not interested in the branch itself, only whether it exists at all
        if finder.find_rorw_branch(path).is_some() {
            return self.create_whiteout(path, branch_rw, kind);
        }
        Ok(())
    }

    /// Remove any marker for `path` on every branch up to `max_branch`
    /// (`None` means the whole stack). Best effort: failures are logged,
    /// never aggregated.
    pub fn remove_hidden(&self, path: &OsStr, max_branch: Option<usize>) -> Result<()> {
        if !self.cfg.cow_enabled() {
            return Ok(());
        }

        let nbranches = self.cfg.nbranches();
        let limit = match max_branch {
            Some(max) => nbranches.min(max + 1),
            None => nbranches,
        };

        let fragments = self.marker_fragments(path);
        for branch in 0..limit {
            let res = match self.io.path_is_dir(branch, &fragments) {
                PathKind::IsFile => self.io.unlink(branch, &fragments),
                PathKind::IsDir => self.io.rmdir(branch, &fragments),
                PathKind::NotExisting => continue,
            };
            if let Err(e) = res {
                tracing::warn!("removing whiteout for {:?} on {} failed: {}", path, branch, e);
            }
        }

        Ok(())
    }

    fn create_whiteout(&self, path: &OsStr, branch_rw: usize, kind: WhiteoutKind) -> Result<()> {
        if !self.cfg.cow_enabled() {
            return Ok(());
        }

        let mut metapath = OsString::from(self.cfg.metadir());
        metapath.push(path);
        if metapath.len() >= PATHLEN_MAX {
            return Err(CowfsError::Whiteout(std::io::Error::from_raw_os_error(
                libc::ENAMETOOLONG,
            )));
        }

        // metapath is branch-local; creating the chain on branch_rw against
        // itself makes this a plain mkdir walk, e.g. branch/.unionfs/some_dir
        self.cow
            .create_path_chain(&metapath, branch_rw, branch_rw)?;

        let fragments = [
            metapath.as_os_str(),
            OsStr::new("/"),
            OsStr::new(self.cfg.hide_tag()),
        ];
        match kind {
            WhiteoutKind::File => {
                let marker = self
                    .io
                    .open(
                        branch_rw,
                        &fragments,
                        libc::O_WRONLY | libc::O_CREAT,
                        libc::S_IRUSR | libc::S_IWUSR,
                    )
                    .map_err(CowfsError::Whiteout)?;
                drop(marker);
            }
            WhiteoutKind::Dir => {
                self.io
                    .mkdir(branch_rw, &fragments, libc::S_IRWXU)
                    .map_err(CowfsError::Whiteout)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendKind, BranchMode, BranchSpec};
    use std::fs;

    struct NeverFinds;

    impl BranchFinder for NeverFinds {
        fn find_rorw_branch(&self, _path: &OsStr) -> Option<usize> {
            None
        }
    }

    fn store(cow_enabled: bool) -> (tempfile::TempDir, WhiteoutStore) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("rw")).unwrap();
        let specs = [BranchSpec {
            path: dir.path().join("rw"),
            mode: BranchMode::ReadWrite,
        }];
        let cfg = Arc::new(Config::new(&specs, BackendKind::Handle, cow_enabled).unwrap());
        let io = Arc::new(BranchIo::new(cfg.clone()));
        let cow = Arc::new(CowEngine::new(cfg, io));
        (dir, WhiteoutStore::new(cow))
    }

    #[test]
    fn test_hide_file_plants_marker() {
        let (dir, store) = store(true);
        store.hide_file(OsStr::new("/gone.txt"), 0).unwrap();

        let marker = dir.path().join("rw/.unionfs/gone.txt/__HIDDEN__");
        assert!(marker.is_file());
        assert!(store.is_hidden(OsStr::new("/gone.txt"), 0));
    }

    #[test]
    fn test_hide_dir_plants_directory_marker() {
        let (dir, store) = store(true);
        store.hide_dir(OsStr::new("/logs"), 0).unwrap();

        let marker = dir.path().join("rw/.unionfs/logs/__HIDDEN__");
        assert!(marker.is_dir());
    }

    #[test]
    fn test_hiding_a_directory_hides_descendants() {
        let (_dir, store) = store(true);
        store.hide_dir(OsStr::new("/logs"), 0).unwrap();

        assert!(store.path_hidden(OsStr::new("/logs"), 0));
        assert!(store.path_hidden(OsStr::new("/logs/2024/jan.txt"), 0));
        assert!(!store.path_hidden(OsStr::new("/log"), 0));
        assert!(!store.path_hidden(OsStr::new("/other"), 0));
        // only prefixes under path-component decomposition count
        assert!(!store.is_hidden(OsStr::new("/logs/2024/jan.txt"), 0));
    }

    #[test]
    fn test_cow_disabled_short_circuits() {
        let (dir, store) = store(false);
        store.hide_file(OsStr::new("/gone.txt"), 0).unwrap();

        assert!(!dir.path().join("rw/.unionfs").exists());
        assert!(!store.is_hidden(OsStr::new("/gone.txt"), 0));
        assert!(!store.path_hidden(OsStr::new("/gone.txt"), 0));
    }

    #[test]
    fn test_remove_hidden_matches_marker_kind() {
        let (dir, store) = store(true);
        store.hide_file(OsStr::new("/f"), 0).unwrap();
        store.hide_dir(OsStr::new("/d"), 0).unwrap();

        store.remove_hidden(OsStr::new("/f"), None).unwrap();
        store.remove_hidden(OsStr::new("/d"), None).unwrap();

        assert!(!dir.path().join("rw/.unionfs/f/__HIDDEN__").exists());
        assert!(!dir.path().join("rw/.unionfs/d/__HIDDEN__").exists());
        assert!(!store.is_hidden(OsStr::new("/f"), 0));

        // nothing left to remove is not an error
        store.remove_hidden(OsStr::new("/f"), Some(0)).unwrap();
    }

    #[test]
    fn test_maybe_whiteout_skips_when_path_gone_from_stack() {
        let (dir, store) = store(true);
        store
            .maybe_whiteout(OsStr::new("/tmp"), 0, WhiteoutKind::File, &NeverFinds)
            .unwrap();
        assert!(!dir.path().join("rw/.unionfs/tmp").exists());
    }
}
