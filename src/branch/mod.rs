//! Branch-relative filesystem operations.
//!
//! Every directory-entry syscall the engine needs exists here once, taking a
//! branch ordinal plus a list of path fragments. Fragments are concatenated
//! in order with no implicit separators (callers supply literal `/` where
//! wanted) and the result is bounded by [`PATHLEN_MAX`](crate::PATHLEN_MAX);
//! overruns fail with `ENAMETOOLONG`. Which syscall flavor actually runs is
//! decided once per process by [`BackendKind`](crate::BackendKind).

mod backend;

use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::io;
use std::sync::Arc;

use nix::unistd::{Gid, Uid};

use crate::config::{BackendKind, Branch, Config};
use backend::{Backend, HandleBackend, PrefixBackend};

/// What `lstat` found at a path, reduced to the three answers the hiding
/// protocol needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    NotExisting,
    IsFile,
    IsDir,
}

pub struct BranchIo {
    cfg: Arc<Config>,
    backend: Box<dyn Backend>,
}

impl BranchIo {
    pub fn new(cfg: Arc<Config>) -> BranchIo {
        let backend: Box<dyn Backend> = match cfg.backend() {
            BackendKind::Handle => Box::new(HandleBackend),
            BackendKind::Prefix => Box::new(PrefixBackend),
        };
        BranchIo { cfg, backend }
    }

    fn branch(&self, ordinal: usize) -> io::Result<&Branch> {
        self.cfg
            .branch(ordinal)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))
    }

    pub fn stat(&self, branch: usize, fragments: &[&OsStr]) -> io::Result<libc::stat> {
        self.backend.stat(self.branch(branch)?, fragments)
    }

    pub fn lstat(&self, branch: usize, fragments: &[&OsStr]) -> io::Result<libc::stat> {
        self.backend.lstat(self.branch(branch)?, fragments)
    }

    pub fn open(
        &self,
        branch: usize,
        fragments: &[&OsStr],
        flags: libc::c_int,
        mode: libc::mode_t,
    ) -> io::Result<File> {
        self.backend.open(self.branch(branch)?, fragments, flags, mode)
    }

    /// Entry names of a directory, dot entries included.
    pub fn read_dir(&self, branch: usize, fragments: &[&OsStr]) -> io::Result<Vec<OsString>> {
        self.backend.read_dir(self.branch(branch)?, fragments)
    }

    pub fn mkdir(&self, branch: usize, fragments: &[&OsStr], mode: libc::mode_t) -> io::Result<()> {
        self.backend.mkdir(self.branch(branch)?, fragments, mode)
    }

    pub fn rmdir(&self, branch: usize, fragments: &[&OsStr]) -> io::Result<()> {
        self.backend.rmdir(self.branch(branch)?, fragments)
    }

    pub fn unlink(&self, branch: usize, fragments: &[&OsStr]) -> io::Result<()> {
        self.backend.unlink(self.branch(branch)?, fragments)
    }

    /// Hard-link across branches. When the branches live on different
    /// filesystems the kernel's verdict (usually `EXDEV`) passes through
    /// unchanged.
    pub fn link(
        &self,
        old_branch: usize,
        old_path: &OsStr,
        new_branch: usize,
        new_path: &OsStr,
    ) -> io::Result<()> {
        self.backend.link(
            self.branch(old_branch)?,
            old_path,
            self.branch(new_branch)?,
            new_path,
        )
    }

    pub fn symlink(&self, target: &OsStr, branch: usize, fragments: &[&OsStr]) -> io::Result<()> {
        self.backend.symlink(target, self.branch(branch)?, fragments)
    }

    pub fn readlink(&self, branch: usize, fragments: &[&OsStr]) -> io::Result<OsString> {
        self.backend.readlink(self.branch(branch)?, fragments)
    }

    pub fn chmod(&self, branch: usize, fragments: &[&OsStr], mode: libc::mode_t) -> io::Result<()> {
        self.backend.chmod(self.branch(branch)?, fragments, mode)
    }

    pub fn chown(
        &self,
        branch: usize,
        fragments: &[&OsStr],
        owner: libc::uid_t,
        group: libc::gid_t,
    ) -> io::Result<()> {
        self.backend.chown(self.branch(branch)?, fragments, owner, group)
    }

    pub fn lchown(
        &self,
        branch: usize,
        fragments: &[&OsStr],
        owner: libc::uid_t,
        group: libc::gid_t,
    ) -> io::Result<()> {
        self.backend.lchown(self.branch(branch)?, fragments, owner, group)
    }

    pub fn creat(
        &self,
        branch: usize,
        fragments: &[&OsStr],
        mode: libc::mode_t,
    ) -> io::Result<File> {
        self.backend.creat(self.branch(branch)?, fragments, mode)
    }

    pub fn mknod(
        &self,
        branch: usize,
        fragments: &[&OsStr],
        mode: libc::mode_t,
        dev: libc::dev_t,
    ) -> io::Result<()> {
        self.backend.mknod(self.branch(branch)?, fragments, mode, dev)
    }

    pub fn mkfifo(
        &self,
        branch: usize,
        fragments: &[&OsStr],
        mode: libc::mode_t,
    ) -> io::Result<()> {
        self.backend.mkfifo(self.branch(branch)?, fragments, mode)
    }

    pub fn rename(
        &self,
        old_branch: usize,
        old_path: &OsStr,
        new_branch: usize,
        new_path: &OsStr,
    ) -> io::Result<()> {
        self.backend.rename(
            self.branch(old_branch)?,
            old_path,
            self.branch(new_branch)?,
            new_path,
        )
    }

    pub fn truncate(
        &self,
        branch: usize,
        fragments: &[&OsStr],
        length: libc::off_t,
    ) -> io::Result<()> {
        self.backend.truncate(self.branch(branch)?, fragments, length)
    }

    pub fn utimens(
        &self,
        branch: usize,
        fragments: &[&OsStr],
        times: &[libc::timespec; 2],
    ) -> io::Result<()> {
        self.backend.utimens(self.branch(branch)?, fragments, times)
    }

    pub fn statfs(&self, branch: usize) -> io::Result<libc::statfs> {
        self.backend.statfs(self.branch(branch)?)
    }

    pub fn lsetxattr(
        &self,
        branch: usize,
        fragments: &[&OsStr],
        name: &OsStr,
        value: &[u8],
        flags: libc::c_int,
    ) -> io::Result<()> {
        self.backend
            .lsetxattr(self.branch(branch)?, fragments, name, value, flags)
    }

    pub fn lgetxattr(
        &self,
        branch: usize,
        fragments: &[&OsStr],
        name: &OsStr,
    ) -> io::Result<Vec<u8>> {
        self.backend.lgetxattr(self.branch(branch)?, fragments, name)
    }

    pub fn llistxattr(&self, branch: usize, fragments: &[&OsStr]) -> io::Result<Vec<OsString>> {
        self.backend.llistxattr(self.branch(branch)?, fragments)
    }

    pub fn lremovexattr(
        &self,
        branch: usize,
        fragments: &[&OsStr],
        name: &OsStr,
    ) -> io::Result<()> {
        self.backend.lremovexattr(self.branch(branch)?, fragments, name)
    }

    /// Probe what sits at a path on a branch without following symlinks.
    pub fn path_is_dir(&self, branch: usize, fragments: &[&OsStr]) -> PathKind {
        match self.lstat(branch, fragments) {
            Err(_) => PathKind::NotExisting,
            Ok(st) if st.st_mode & libc::S_IFMT == libc::S_IFDIR => PathKind::IsDir,
            Ok(_) => PathKind::IsFile,
        }
    }

    /// Hand ownership of a freshly created entry to the acting context.
    /// A root context keeps kernel-assigned ownership.
    pub fn set_owner(&self, branch: usize, path: &OsStr, uid: Uid, gid: Gid) -> io::Result<()> {
        if uid.is_root() || gid.as_raw() == 0 {
            return Ok(());
        }
        self.lchown(branch, &[path], uid.as_raw(), gid.as_raw())
            .map_err(|e| {
                tracing::warn!("set_owner: setting the file owner of {:?} failed: {}", path, e);
                e
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BranchMode, BranchSpec};
    use std::fs;

    fn config(backend: BackendKind) -> (tempfile::TempDir, Arc<Config>) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("b0")).unwrap();
        let specs = [BranchSpec {
            path: dir.path().join("b0"),
            mode: BranchMode::ReadWrite,
        }];
        let cfg = Arc::new(Config::new(&specs, backend, true).unwrap());
        (dir, cfg)
    }

    #[test]
    fn test_path_is_dir_tristate() {
        for backend in [BackendKind::Handle, BackendKind::Prefix] {
            let (_dir, cfg) = config(backend);
            let io = BranchIo::new(cfg);

            assert_eq!(io.path_is_dir(0, &[OsStr::new("/gone")]), PathKind::NotExisting);

            io.mkdir(0, &[OsStr::new("/d")], 0o755).unwrap();
            assert_eq!(io.path_is_dir(0, &[OsStr::new("/d")]), PathKind::IsDir);

            drop(io.creat(0, &[OsStr::new("/f")], 0o644).unwrap());
            assert_eq!(io.path_is_dir(0, &[OsStr::new("/f")]), PathKind::IsFile);
        }
    }

    #[test]
    fn test_bad_ordinal_is_einval() {
        let (_dir, cfg) = config(BackendKind::Handle);
        let io = BranchIo::new(cfg);
        let err = io.lstat(7, &[OsStr::new("/x")]).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }

    #[test]
    fn test_fragments_join_without_separators() {
        let (_dir, cfg) = config(BackendKind::Handle);
        let io = BranchIo::new(cfg);
        io.mkdir(0, &[OsStr::new("/a")], 0o755).unwrap();
        io.mkdir(0, &[OsStr::new("/a"), OsStr::new("/b")], 0o755).unwrap();
        // the two fragments name the same entry as the single "/a/b"
        assert_eq!(io.path_is_dir(0, &[OsStr::new("/a/b")]), PathKind::IsDir);
    }

    #[test]
    fn test_set_owner_noop_for_root_context() {
        let (_dir, cfg) = config(BackendKind::Handle);
        let io = BranchIo::new(cfg);
        drop(io.creat(0, &[OsStr::new("/owned")], 0o644).unwrap());
        io.set_owner(0, OsStr::new("/owned"), Uid::from_raw(0), Gid::from_raw(0))
            .unwrap();
    }
}
