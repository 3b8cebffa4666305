//! Copy-on-write promotion: materializing an object from a read-only branch
//! onto a read-write branch, parents first, with metadata carried along.

mod copy;

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::branch::BranchIo;
use crate::config::{Config, PATHLEN_MAX};
use crate::error::{CowfsError, Result};

/// File type of a promotion source, decided from the `lstat` mode bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl FileKind {
    pub fn from_mode(mode: libc::mode_t) -> FileKind {
        match mode & libc::S_IFMT {
            libc::S_IFDIR => FileKind::Directory,
            libc::S_IFLNK => FileKind::Symlink,
            libc::S_IFBLK => FileKind::BlockDevice,
            libc::S_IFCHR => FileKind::CharDevice,
            libc::S_IFIFO => FileKind::Fifo,
            libc::S_IFSOCK => FileKind::Socket,
            _ => FileKind::Regular,
        }
    }
}

/// Everything one promotion needs, captured when the job starts and alive
/// only for its duration.
pub(crate) struct CowJob<'a> {
    pub umask: libc::mode_t,
    pub uid: libc::uid_t,
    pub from_branch: usize,
    pub from_path: &'a OsStr,
    pub to_branch: usize,
    pub to_path: &'a OsStr,
    pub stat: libc::stat,
}

pub struct CowEngine {
    cfg: Arc<Config>,
    io: Arc<BranchIo>,
}

impl CowEngine {
    pub fn new(cfg: Arc<Config>, io: Arc<BranchIo>) -> CowEngine {
        CowEngine { cfg, io }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.cfg
    }

    pub fn io(&self) -> &Arc<BranchIo> {
        &self.io
    }

    /// Promote `path` from the read-only branch `ro` to the read-write
    /// branch `rw`: parents first, then the object itself, dispatched on its
    /// type. Sockets are refused. Nothing is cleaned up on failure; the next
    /// attempt overwrites whatever was left behind.
    pub fn promote(&self, path: &OsStr, ro: usize, rw: usize) -> Result<()> {
        self.create_parents(path, ro, rw)?;

        let uid = nix::unistd::getuid().as_raw();
        let umask = process_umask();

        let stat = match self.io.lstat(ro, &[path]) {
            Ok(st) => st,
            Err(e) => {
                tracing::warn!("promote: {:?} {} -> {}: file disappeared", path, ro, rw);
                return Err(CowfsError::SourceVanished(e));
            }
        };

        let job = CowJob {
            umask,
            uid,
            from_branch: ro,
            from_path: path,
            to_branch: rw,
            to_path: path,
            stat,
        };

        match FileKind::from_mode(stat.st_mode) {
            FileKind::Symlink => copy::copy_link(&self.io, &job),
            FileKind::Directory => self.copy_directory(path, ro, rw),
            FileKind::BlockDevice | FileKind::CharDevice => copy::copy_special(&self.io, &job),
            FileKind::Fifo => copy::copy_fifo(&self.io, &job),
            FileKind::Socket => {
                tracing::warn!("promote: {} {:?}: sockets are not supported", ro, path);
                Err(CowfsError::UnsupportedType(PathBuf::from(path)))
            }
            FileKind::Regular => copy::copy_file(&self.io, &job),
        }
    }

    /// Promote a directory and everything inside it. Entries are promoted in
    /// whatever order the branch yields them; the first failure ends the
    /// walk.
    pub fn copy_directory(&self, path: &OsStr, ro: usize, rw: usize) -> Result<()> {
        self.create_path_chain(path, ro, rw)?;

        let entries = self.io.read_dir(ro, &[path]).map_err(CowfsError::Branch)?;
        for name in entries {
            if name == "." || name == ".." {
                continue;
            }

            let mut child = path.to_os_string();
            child.push("/");
            child.push(&name);
            if child.as_bytes().len() >= PATHLEN_MAX {
                return Err(CowfsError::Branch(std::io::Error::from_raw_os_error(
                    libc::ENAMETOOLONG,
                )));
            }

            self.promote(&child, ro, rw)?;
        }

        Ok(())
    }

    /// Walk `path` prefix by prefix, creating every directory missing on
    /// `rw` with the mode and metadata of its counterpart on `ro`. Calling
    /// with `ro == rw` means a plain `mkdir` chain with mode `rwxrwx---` and
    /// no metadata transfer; only the whiteout store uses that form, for the
    /// metadata directory tree. Idempotent: nothing happens for prefixes
    /// that already exist.
    pub fn create_path_chain(&self, path: &OsStr, ro: usize, rw: usize) -> Result<()> {
        if !self.cfg.cow_enabled() {
            return Ok(());
        }
        if self.io.stat(rw, &[path]).is_ok() {
            return Ok(());
        }

        let bytes = path.as_bytes();
        let mut i = 0;
        while i < bytes.len() && bytes[i] == b'/' {
            i += 1;
        }
        loop {
            while i < bytes.len() && bytes[i] != b'/' {
                i += 1;
            }
            self.create_dir_step(OsStr::from_bytes(&bytes[..i]), ro, rw)?;
            while i < bytes.len() && bytes[i] == b'/' {
                i += 1;
            }
            if i >= bytes.len() {
                break;
            }
        }

        Ok(())
    }

    /// One prefix of [`create_path_chain`]: create it on `rw` unless already
    /// there.
    fn create_dir_step(&self, prefix: &OsStr, ro: usize, rw: usize) -> Result<()> {
        if self.io.stat(rw, &[prefix]).is_ok() {
            return Ok(());
        }

        let src_stat = if ro == rw {
            // metadata directory chain, not a cow operation
            None
        } else {
            match self.io.stat(ro, &[prefix]) {
                Ok(st) => Some(st),
                // lower branch entry removed in the meantime?
                Err(e) => return Err(CowfsError::SourceVanished(e)),
            }
        };

        let mode = match &src_stat {
            Some(st) => st.st_mode & 0o7777,
            None => libc::S_IRWXU | libc::S_IRWXG,
        };

        if let Err(e) = self.io.mkdir(rw, &[prefix], mode) {
            tracing::warn!("creating {} {:?} failed: {}", rw, prefix, e);
            return Err(CowfsError::Branch(e));
        }

        if let Some(mut st) = src_stat {
            // directory already removed by another process?
            copy::setfile(&self.io, rw, prefix, &mut st).map_err(CowfsError::Metadata)?;
        }

        Ok(())
    }

    /// [`create_path_chain`] for the dirname of `path` — the form used when
    /// the last segment is the object about to be copied.
    fn create_parents(&self, path: &OsStr, ro: usize, rw: usize) -> Result<()> {
        let bytes = path.as_bytes();
        let dirname = match bytes.iter().rposition(|&b| b == b'/') {
            Some(0) => OsStr::new("/"),
            Some(pos) => OsStr::from_bytes(&bytes[..pos]),
            None => OsStr::new("."),
        };
        self.create_path_chain(dirname, ro, rw)
    }
}

/// The process umask, read without mutating it where the platform allows.
/// The fallback `umask(0)`-and-restore dance is momentarily visible to other
/// threads.
pub(crate) fn process_umask() -> libc::mode_t {
    if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
        for line in status.lines() {
            if let Some(rest) = line.strip_prefix("Umask:") {
                if let Ok(mask) = libc::mode_t::from_str_radix(rest.trim(), 8) {
                    return mask;
                }
            }
        }
    }

    let prior = unsafe { libc::umask(0) };
    unsafe { libc::umask(prior) };
    prior
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_kind_from_mode() {
        assert_eq!(FileKind::from_mode(libc::S_IFREG | 0o644), FileKind::Regular);
        assert_eq!(FileKind::from_mode(libc::S_IFDIR | 0o755), FileKind::Directory);
        assert_eq!(FileKind::from_mode(libc::S_IFLNK | 0o777), FileKind::Symlink);
        assert_eq!(FileKind::from_mode(libc::S_IFBLK | 0o600), FileKind::BlockDevice);
        assert_eq!(FileKind::from_mode(libc::S_IFCHR | 0o600), FileKind::CharDevice);
        assert_eq!(FileKind::from_mode(libc::S_IFIFO | 0o600), FileKind::Fifo);
        assert_eq!(FileKind::from_mode(libc::S_IFSOCK | 0o755), FileKind::Socket);
        // anything unrecognized copies as a regular file
        assert_eq!(FileKind::from_mode(0), FileKind::Regular);
    }

    #[test]
    fn test_process_umask_matches_syscall() {
        let expected = unsafe { libc::umask(0) };
        unsafe { libc::umask(expected) };
        assert_eq!(process_umask(), expected);
    }
}
