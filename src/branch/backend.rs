//! The two interchangeable syscall backends behind [`BranchIo`](super::BranchIo).
//!
//! `HandleBackend` issues every operation against the branch's long-lived
//! root descriptor using the `*at` syscall family; constructed paths are
//! handed over in relative form. `PrefixBackend` prepends the branch root
//! and uses the plain path-based syscalls. Apart from tolerance to a rename
//! of the branch root, the two must behave identically.

use std::ffi::{CStr, CString, OsStr, OsString};
use std::fs::File;
use std::io;
use std::mem;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::ptr;

use crate::config::{Branch, PATHLEN_MAX};

fn cvt(res: libc::c_int) -> io::Result<libc::c_int> {
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res)
    }
}

fn cvt_size(res: libc::ssize_t) -> io::Result<usize> {
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res as usize)
    }
}

fn name_too_long() -> io::Error {
    io::Error::from_raw_os_error(libc::ENAMETOOLONG)
}

fn to_cstring(bytes: Vec<u8>) -> io::Result<CString> {
    CString::new(bytes).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

/// Append `fragments` to `buf` in caller order, with no implicit separators.
/// Fails with `ENAMETOOLONG` once the result (NUL terminator included) no
/// longer fits in `PATHLEN_MAX`.
pub(crate) fn push_fragments(buf: &mut Vec<u8>, fragments: &[&OsStr]) -> io::Result<()> {
    for fragment in fragments {
        buf.extend_from_slice(fragment.as_bytes());
        if buf.len() >= PATHLEN_MAX {
            tracing::warn!("path too long while composing branch-local path");
            return Err(name_too_long());
        }
    }
    Ok(())
}

/// Relative form handed to the `*at` family: leading slashes stripped, an
/// empty remainder becomes `.`.
pub(crate) fn relative(path: &[u8]) -> &[u8] {
    let start = path.iter().take_while(|&&b| b == b'/').count();
    if start == path.len() {
        b"."
    } else {
        &path[start..]
    }
}

fn split_xattr_list(buf: &[u8]) -> Vec<OsString> {
    buf.split(|&b| b == 0)
        .filter(|name| !name.is_empty())
        .map(|name| OsStr::from_bytes(name).to_os_string())
        .collect()
}

/// Drains a directory stream into entry names and closes it. The stream owns
/// its descriptor after `fdopendir`, so `closedir` is the only cleanup.
fn drain_dir(dirp: *mut libc::DIR) -> Vec<OsString> {
    let mut names = Vec::new();
    loop {
        let entry = unsafe { libc::readdir(dirp) };
        if entry.is_null() {
            break;
        }
        let name = unsafe { CStr::from_ptr((*entry).d_name.as_ptr()) };
        names.push(OsStr::from_bytes(name.to_bytes()).to_os_string());
    }
    unsafe {
        libc::closedir(dirp);
    }
    names
}

/// One implementation per directory-entry syscall. Fragment slices are
/// concatenated in order by the backend; `link` and `rename` construct two
/// paths and may span branches.
pub(crate) trait Backend: Send + Sync + std::fmt::Debug {
    fn stat(&self, branch: &Branch, fragments: &[&OsStr]) -> io::Result<libc::stat>;
    fn lstat(&self, branch: &Branch, fragments: &[&OsStr]) -> io::Result<libc::stat>;
    fn open(
        &self,
        branch: &Branch,
        fragments: &[&OsStr],
        flags: libc::c_int,
        mode: libc::mode_t,
    ) -> io::Result<File>;
    fn read_dir(&self, branch: &Branch, fragments: &[&OsStr]) -> io::Result<Vec<OsString>>;
    fn mkdir(&self, branch: &Branch, fragments: &[&OsStr], mode: libc::mode_t) -> io::Result<()>;
    fn rmdir(&self, branch: &Branch, fragments: &[&OsStr]) -> io::Result<()>;
    fn unlink(&self, branch: &Branch, fragments: &[&OsStr]) -> io::Result<()>;
    fn link(
        &self,
        old_branch: &Branch,
        old_path: &OsStr,
        new_branch: &Branch,
        new_path: &OsStr,
    ) -> io::Result<()>;
    fn symlink(&self, target: &OsStr, branch: &Branch, fragments: &[&OsStr]) -> io::Result<()>;
    fn readlink(&self, branch: &Branch, fragments: &[&OsStr]) -> io::Result<OsString>;
    fn chmod(&self, branch: &Branch, fragments: &[&OsStr], mode: libc::mode_t) -> io::Result<()>;
    fn chown(
        &self,
        branch: &Branch,
        fragments: &[&OsStr],
        owner: libc::uid_t,
        group: libc::gid_t,
    ) -> io::Result<()>;
    fn lchown(
        &self,
        branch: &Branch,
        fragments: &[&OsStr],
        owner: libc::uid_t,
        group: libc::gid_t,
    ) -> io::Result<()>;
    fn creat(&self, branch: &Branch, fragments: &[&OsStr], mode: libc::mode_t) -> io::Result<File>;
    fn mknod(
        &self,
        branch: &Branch,
        fragments: &[&OsStr],
        mode: libc::mode_t,
        dev: libc::dev_t,
    ) -> io::Result<()>;
    fn mkfifo(&self, branch: &Branch, fragments: &[&OsStr], mode: libc::mode_t) -> io::Result<()>;
    fn rename(
        &self,
        old_branch: &Branch,
        old_path: &OsStr,
        new_branch: &Branch,
        new_path: &OsStr,
    ) -> io::Result<()>;
    fn truncate(&self, branch: &Branch, fragments: &[&OsStr], length: libc::off_t)
        -> io::Result<()>;
    fn utimens(
        &self,
        branch: &Branch,
        fragments: &[&OsStr],
        times: &[libc::timespec; 2],
    ) -> io::Result<()>;
    fn statfs(&self, branch: &Branch) -> io::Result<libc::statfs>;
    fn lsetxattr(
        &self,
        branch: &Branch,
        fragments: &[&OsStr],
        name: &OsStr,
        value: &[u8],
        flags: libc::c_int,
    ) -> io::Result<()>;
    fn lgetxattr(&self, branch: &Branch, fragments: &[&OsStr], name: &OsStr)
        -> io::Result<Vec<u8>>;
    fn llistxattr(&self, branch: &Branch, fragments: &[&OsStr]) -> io::Result<Vec<OsString>>;
    fn lremovexattr(&self, branch: &Branch, fragments: &[&OsStr], name: &OsStr) -> io::Result<()>;
}

#[derive(Debug)]
pub(crate) struct HandleBackend;

impl HandleBackend {
    fn path(&self, fragments: &[&OsStr]) -> io::Result<CString> {
        let mut buf = Vec::new();
        push_fragments(&mut buf, fragments)?;
        let rel = relative(&buf).to_vec();
        to_cstring(rel)
    }

    fn dirfd(&self, branch: &Branch) -> io::Result<RawFd> {
        Ok(branch.handle()?.as_raw_fd())
    }

    /// Open for the xattr quadruple: `O_NOFOLLOW`, with the `ELOOP` a
    /// symlink provokes reported as `ENOTSUP` (symlinks carry no xattrs).
    fn xattr_open(
        &self,
        branch: &Branch,
        fragments: &[&OsStr],
        flags: libc::c_int,
    ) -> io::Result<File> {
        let path = self.path(fragments)?;
        let res =
            unsafe { libc::openat(self.dirfd(branch)?, path.as_ptr(), flags | libc::O_NOFOLLOW, 0) };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ELOOP) {
                return Err(io::Error::from_raw_os_error(libc::ENOTSUP));
            }
            return Err(err);
        }
        Ok(unsafe { File::from_raw_fd(res) })
    }
}

impl Backend for HandleBackend {
    fn stat(&self, branch: &Branch, fragments: &[&OsStr]) -> io::Result<libc::stat> {
        let path = self.path(fragments)?;
        let mut st: libc::stat = unsafe { mem::zeroed() };
        cvt(unsafe { libc::fstatat(self.dirfd(branch)?, path.as_ptr(), &mut st, 0) })?;
        Ok(st)
    }

    fn lstat(&self, branch: &Branch, fragments: &[&OsStr]) -> io::Result<libc::stat> {
        let path = self.path(fragments)?;
        let mut st: libc::stat = unsafe { mem::zeroed() };
        cvt(unsafe {
            libc::fstatat(
                self.dirfd(branch)?,
                path.as_ptr(),
                &mut st,
                libc::AT_SYMLINK_NOFOLLOW,
            )
        })?;
        Ok(st)
    }

    fn open(
        &self,
        branch: &Branch,
        fragments: &[&OsStr],
        flags: libc::c_int,
        mode: libc::mode_t,
    ) -> io::Result<File> {
        let path = self.path(fragments)?;
        let fd = cvt(unsafe {
            libc::openat(
                self.dirfd(branch)?,
                path.as_ptr(),
                flags,
                mode as libc::c_uint,
            )
        })?;
        Ok(unsafe { File::from_raw_fd(fd) })
    }

    fn read_dir(&self, branch: &Branch, fragments: &[&OsStr]) -> io::Result<Vec<OsString>> {
        let path = self.path(fragments)?;
        let fd = cvt(unsafe {
            libc::openat(
                self.dirfd(branch)?,
                path.as_ptr(),
                libc::O_RDONLY | libc::O_DIRECTORY,
                0,
            )
        })?;
        let dirp = unsafe { libc::fdopendir(fd) };
        if dirp.is_null() {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fd);
            }
            return Err(err);
        }
        Ok(drain_dir(dirp))
    }

    fn mkdir(&self, branch: &Branch, fragments: &[&OsStr], mode: libc::mode_t) -> io::Result<()> {
        let path = self.path(fragments)?;
        cvt(unsafe { libc::mkdirat(self.dirfd(branch)?, path.as_ptr(), mode) })?;
        Ok(())
    }

    fn rmdir(&self, branch: &Branch, fragments: &[&OsStr]) -> io::Result<()> {
        let path = self.path(fragments)?;
        cvt(unsafe { libc::unlinkat(self.dirfd(branch)?, path.as_ptr(), libc::AT_REMOVEDIR) })?;
        Ok(())
    }

    fn unlink(&self, branch: &Branch, fragments: &[&OsStr]) -> io::Result<()> {
        let path = self.path(fragments)?;
        cvt(unsafe { libc::unlinkat(self.dirfd(branch)?, path.as_ptr(), 0) })?;
        Ok(())
    }

    fn link(
        &self,
        old_branch: &Branch,
        old_path: &OsStr,
        new_branch: &Branch,
        new_path: &OsStr,
    ) -> io::Result<()> {
        let from = self.path(&[old_path])?;
        let to = self.path(&[new_path])?;
        cvt(unsafe {
            libc::linkat(
                self.dirfd(old_branch)?,
                from.as_ptr(),
                self.dirfd(new_branch)?,
                to.as_ptr(),
                0,
            )
        })?;
        Ok(())
    }

    fn symlink(&self, target: &OsStr, branch: &Branch, fragments: &[&OsStr]) -> io::Result<()> {
        let target = to_cstring(target.as_bytes().to_vec())?;
        let path = self.path(fragments)?;
        cvt(unsafe { libc::symlinkat(target.as_ptr(), self.dirfd(branch)?, path.as_ptr()) })?;
        Ok(())
    }

    fn readlink(&self, branch: &Branch, fragments: &[&OsStr]) -> io::Result<OsString> {
        let path = self.path(fragments)?;
        let mut buf = vec![0u8; PATHLEN_MAX];
        let len = cvt_size(unsafe {
            libc::readlinkat(
                self.dirfd(branch)?,
                path.as_ptr(),
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len() - 1,
            )
        })?;
        buf.truncate(len);
        Ok(OsString::from_vec(buf))
    }

    fn chmod(&self, branch: &Branch, fragments: &[&OsStr], mode: libc::mode_t) -> io::Result<()> {
        let path = self.path(fragments)?;
        cvt(unsafe { libc::fchmodat(self.dirfd(branch)?, path.as_ptr(), mode, 0) })?;
        Ok(())
    }

    fn chown(
        &self,
        branch: &Branch,
        fragments: &[&OsStr],
        owner: libc::uid_t,
        group: libc::gid_t,
    ) -> io::Result<()> {
        let path = self.path(fragments)?;
        cvt(unsafe { libc::fchownat(self.dirfd(branch)?, path.as_ptr(), owner, group, 0) })?;
        Ok(())
    }

    fn lchown(
        &self,
        branch: &Branch,
        fragments: &[&OsStr],
        owner: libc::uid_t,
        group: libc::gid_t,
    ) -> io::Result<()> {
        let path = self.path(fragments)?;
        cvt(unsafe {
            libc::fchownat(
                self.dirfd(branch)?,
                path.as_ptr(),
                owner,
                group,
                libc::AT_SYMLINK_NOFOLLOW,
            )
        })?;
        Ok(())
    }

    fn creat(&self, branch: &Branch, fragments: &[&OsStr], mode: libc::mode_t) -> io::Result<File> {
        self.open(
            branch,
            fragments,
            libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC,
            mode,
        )
    }

    fn mknod(
        &self,
        branch: &Branch,
        fragments: &[&OsStr],
        mode: libc::mode_t,
        dev: libc::dev_t,
    ) -> io::Result<()> {
        let path = self.path(fragments)?;
        cvt(unsafe { libc::mknodat(self.dirfd(branch)?, path.as_ptr(), mode, dev) })?;
        Ok(())
    }

    fn mkfifo(&self, branch: &Branch, fragments: &[&OsStr], mode: libc::mode_t) -> io::Result<()> {
        let path = self.path(fragments)?;
        cvt(unsafe { libc::mkfifoat(self.dirfd(branch)?, path.as_ptr(), mode) })?;
        Ok(())
    }

    fn rename(
        &self,
        old_branch: &Branch,
        old_path: &OsStr,
        new_branch: &Branch,
        new_path: &OsStr,
    ) -> io::Result<()> {
        let from = self.path(&[old_path])?;
        let to = self.path(&[new_path])?;
        cvt(unsafe {
            libc::renameat(
                self.dirfd(old_branch)?,
                from.as_ptr(),
                self.dirfd(new_branch)?,
                to.as_ptr(),
            )
        })?;
        Ok(())
    }

    fn truncate(
        &self,
        branch: &Branch,
        fragments: &[&OsStr],
        length: libc::off_t,
    ) -> io::Result<()> {
        let path = self.path(fragments)?;
        let fd = cvt(unsafe {
            libc::openat(self.dirfd(branch)?, path.as_ptr(), libc::O_WRONLY, 0)
        })?;
        let file = unsafe { File::from_raw_fd(fd) };
        cvt(unsafe { libc::ftruncate(file.as_raw_fd(), length) })?;
        Ok(())
    }

    fn utimens(
        &self,
        branch: &Branch,
        fragments: &[&OsStr],
        times: &[libc::timespec; 2],
    ) -> io::Result<()> {
        let path = self.path(fragments)?;
        cvt(unsafe {
            libc::utimensat(
                self.dirfd(branch)?,
                path.as_ptr(),
                times.as_ptr(),
                libc::AT_SYMLINK_NOFOLLOW,
            )
        })?;
        Ok(())
    }

    fn statfs(&self, branch: &Branch) -> io::Result<libc::statfs> {
        let mut buf: libc::statfs = unsafe { mem::zeroed() };
        cvt(unsafe { libc::fstatfs(branch.handle()?.as_raw_fd(), &mut buf) })?;
        Ok(buf)
    }

    fn lsetxattr(
        &self,
        branch: &Branch,
        fragments: &[&OsStr],
        name: &OsStr,
        value: &[u8],
        flags: libc::c_int,
    ) -> io::Result<()> {
        let file = self.xattr_open(branch, fragments, libc::O_WRONLY)?;
        let name = to_cstring(name.as_bytes().to_vec())?;
        cvt(unsafe {
            libc::fsetxattr(
                file.as_raw_fd(),
                name.as_ptr(),
                value.as_ptr() as *const libc::c_void,
                value.len(),
                flags,
            )
        })?;
        Ok(())
    }

    fn lgetxattr(
        &self,
        branch: &Branch,
        fragments: &[&OsStr],
        name: &OsStr,
    ) -> io::Result<Vec<u8>> {
        let file = self.xattr_open(branch, fragments, libc::O_RDONLY)?;
        let name = to_cstring(name.as_bytes().to_vec())?;
        let size = cvt_size(unsafe {
            libc::fgetxattr(file.as_raw_fd(), name.as_ptr(), ptr::null_mut(), 0)
        })?;
        let mut value = vec![0u8; size];
        let len = cvt_size(unsafe {
            libc::fgetxattr(
                file.as_raw_fd(),
                name.as_ptr(),
                value.as_mut_ptr() as *mut libc::c_void,
                value.len(),
            )
        })?;
        value.truncate(len);
        Ok(value)
    }

    fn llistxattr(&self, branch: &Branch, fragments: &[&OsStr]) -> io::Result<Vec<OsString>> {
        let file = self.xattr_open(branch, fragments, libc::O_RDONLY)?;
        let size = cvt_size(unsafe { libc::flistxattr(file.as_raw_fd(), ptr::null_mut(), 0) })?;
        let mut list = vec![0u8; size];
        let len = cvt_size(unsafe {
            libc::flistxattr(
                file.as_raw_fd(),
                list.as_mut_ptr() as *mut libc::c_char,
                list.len(),
            )
        })?;
        list.truncate(len);
        Ok(split_xattr_list(&list))
    }

    fn lremovexattr(&self, branch: &Branch, fragments: &[&OsStr], name: &OsStr) -> io::Result<()> {
        let file = self.xattr_open(branch, fragments, libc::O_WRONLY)?;
        let name = to_cstring(name.as_bytes().to_vec())?;
        cvt(unsafe { libc::fremovexattr(file.as_raw_fd(), name.as_ptr()) })?;
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct PrefixBackend;

impl PrefixBackend {
    fn path(&self, branch: &Branch, fragments: &[&OsStr]) -> io::Result<CString> {
        let mut buf = branch.root().as_os_str().as_bytes().to_vec();
        if !buf.ends_with(b"/") {
            buf.push(b'/');
        }
        if buf.len() >= PATHLEN_MAX {
            return Err(name_too_long());
        }
        push_fragments(&mut buf, fragments)?;
        to_cstring(buf)
    }
}

impl Backend for PrefixBackend {
    fn stat(&self, branch: &Branch, fragments: &[&OsStr]) -> io::Result<libc::stat> {
        let path = self.path(branch, fragments)?;
        let mut st: libc::stat = unsafe { mem::zeroed() };
        cvt(unsafe { libc::stat(path.as_ptr(), &mut st) })?;
        Ok(st)
    }

    fn lstat(&self, branch: &Branch, fragments: &[&OsStr]) -> io::Result<libc::stat> {
        let path = self.path(branch, fragments)?;
        let mut st: libc::stat = unsafe { mem::zeroed() };
        cvt(unsafe { libc::lstat(path.as_ptr(), &mut st) })?;
        Ok(st)
    }

    fn open(
        &self,
        branch: &Branch,
        fragments: &[&OsStr],
        flags: libc::c_int,
        mode: libc::mode_t,
    ) -> io::Result<File> {
        let path = self.path(branch, fragments)?;
        let fd = cvt(unsafe { libc::open(path.as_ptr(), flags, mode as libc::c_uint) })?;
        Ok(unsafe { File::from_raw_fd(fd) })
    }

    fn read_dir(&self, branch: &Branch, fragments: &[&OsStr]) -> io::Result<Vec<OsString>> {
        let path = self.path(branch, fragments)?;
        let dirp = unsafe { libc::opendir(path.as_ptr()) };
        if dirp.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(drain_dir(dirp))
    }

    fn mkdir(&self, branch: &Branch, fragments: &[&OsStr], mode: libc::mode_t) -> io::Result<()> {
        let path = self.path(branch, fragments)?;
        cvt(unsafe { libc::mkdir(path.as_ptr(), mode) })?;
        Ok(())
    }

    fn rmdir(&self, branch: &Branch, fragments: &[&OsStr]) -> io::Result<()> {
        let path = self.path(branch, fragments)?;
        cvt(unsafe { libc::rmdir(path.as_ptr()) })?;
        Ok(())
    }

    fn unlink(&self, branch: &Branch, fragments: &[&OsStr]) -> io::Result<()> {
        let path = self.path(branch, fragments)?;
        cvt(unsafe { libc::unlink(path.as_ptr()) })?;
        Ok(())
    }

    fn link(
        &self,
        old_branch: &Branch,
        old_path: &OsStr,
        new_branch: &Branch,
        new_path: &OsStr,
    ) -> io::Result<()> {
        let from = self.path(old_branch, &[old_path])?;
        let to = self.path(new_branch, &[new_path])?;
        cvt(unsafe { libc::link(from.as_ptr(), to.as_ptr()) })?;
        Ok(())
    }

    fn symlink(&self, target: &OsStr, branch: &Branch, fragments: &[&OsStr]) -> io::Result<()> {
        let target = to_cstring(target.as_bytes().to_vec())?;
        let path = self.path(branch, fragments)?;
        cvt(unsafe { libc::symlink(target.as_ptr(), path.as_ptr()) })?;
        Ok(())
    }

    fn readlink(&self, branch: &Branch, fragments: &[&OsStr]) -> io::Result<OsString> {
        let path = self.path(branch, fragments)?;
        let mut buf = vec![0u8; PATHLEN_MAX];
        let len = cvt_size(unsafe {
            libc::readlink(
                path.as_ptr(),
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len() - 1,
            )
        })?;
        buf.truncate(len);
        Ok(OsString::from_vec(buf))
    }

    fn chmod(&self, branch: &Branch, fragments: &[&OsStr], mode: libc::mode_t) -> io::Result<()> {
        let path = self.path(branch, fragments)?;
        cvt(unsafe { libc::chmod(path.as_ptr(), mode) })?;
        Ok(())
    }

    fn chown(
        &self,
        branch: &Branch,
        fragments: &[&OsStr],
        owner: libc::uid_t,
        group: libc::gid_t,
    ) -> io::Result<()> {
        let path = self.path(branch, fragments)?;
        cvt(unsafe { libc::chown(path.as_ptr(), owner, group) })?;
        Ok(())
    }

    fn lchown(
        &self,
        branch: &Branch,
        fragments: &[&OsStr],
        owner: libc::uid_t,
        group: libc::gid_t,
    ) -> io::Result<()> {
        let path = self.path(branch, fragments)?;
        cvt(unsafe { libc::lchown(path.as_ptr(), owner, group) })?;
        Ok(())
    }

    fn creat(&self, branch: &Branch, fragments: &[&OsStr], mode: libc::mode_t) -> io::Result<File> {
        self.open(
            branch,
            fragments,
            libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC,
            mode,
        )
    }

    fn mknod(
        &self,
        branch: &Branch,
        fragments: &[&OsStr],
        mode: libc::mode_t,
        dev: libc::dev_t,
    ) -> io::Result<()> {
        let path = self.path(branch, fragments)?;
        cvt(unsafe { libc::mknod(path.as_ptr(), mode, dev) })?;
        Ok(())
    }

    fn mkfifo(&self, branch: &Branch, fragments: &[&OsStr], mode: libc::mode_t) -> io::Result<()> {
        let path = self.path(branch, fragments)?;
        cvt(unsafe { libc::mkfifo(path.as_ptr(), mode) })?;
        Ok(())
    }

    fn rename(
        &self,
        old_branch: &Branch,
        old_path: &OsStr,
        new_branch: &Branch,
        new_path: &OsStr,
    ) -> io::Result<()> {
        let from = self.path(old_branch, &[old_path])?;
        let to = self.path(new_branch, &[new_path])?;
        cvt(unsafe { libc::rename(from.as_ptr(), to.as_ptr()) })?;
        Ok(())
    }

    fn truncate(
        &self,
        branch: &Branch,
        fragments: &[&OsStr],
        length: libc::off_t,
    ) -> io::Result<()> {
        let path = self.path(branch, fragments)?;
        cvt(unsafe { libc::truncate(path.as_ptr(), length) })?;
        Ok(())
    }

    fn utimens(
        &self,
        branch: &Branch,
        fragments: &[&OsStr],
        times: &[libc::timespec; 2],
    ) -> io::Result<()> {
        let path = self.path(branch, fragments)?;
        let tv = [
            libc::timeval {
                tv_sec: times[0].tv_sec,
                tv_usec: times[0].tv_nsec / 1000,
            },
            libc::timeval {
                tv_sec: times[1].tv_sec,
                tv_usec: times[1].tv_nsec / 1000,
            },
        ];
        let res = unsafe { libc::utimes(path.as_ptr(), tv.as_ptr()) };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOENT) {
                // utimes() reports ENOENT for an existing symlink on
                // filesystems that cannot set symlink times. Nothing can be
                // done about it, so the only swallowed ENOENT in the crate
                // is this one.
                let mut st: libc::stat = unsafe { mem::zeroed() };
                let lres = unsafe { libc::lstat(path.as_ptr(), &mut st) };
                if lres == 0 && st.st_mode & libc::S_IFMT == libc::S_IFLNK {
                    return Ok(());
                }
            }
            return Err(err);
        }
        Ok(())
    }

    fn statfs(&self, branch: &Branch) -> io::Result<libc::statfs> {
        let path = to_cstring(branch.root().as_os_str().as_bytes().to_vec())?;
        let mut buf: libc::statfs = unsafe { mem::zeroed() };
        cvt(unsafe { libc::statfs(path.as_ptr(), &mut buf) })?;
        Ok(buf)
    }

    fn lsetxattr(
        &self,
        branch: &Branch,
        fragments: &[&OsStr],
        name: &OsStr,
        value: &[u8],
        flags: libc::c_int,
    ) -> io::Result<()> {
        let path = self.path(branch, fragments)?;
        let name = to_cstring(name.as_bytes().to_vec())?;
        cvt(unsafe {
            libc::lsetxattr(
                path.as_ptr(),
                name.as_ptr(),
                value.as_ptr() as *const libc::c_void,
                value.len(),
                flags,
            )
        })?;
        Ok(())
    }

    fn lgetxattr(
        &self,
        branch: &Branch,
        fragments: &[&OsStr],
        name: &OsStr,
    ) -> io::Result<Vec<u8>> {
        let path = self.path(branch, fragments)?;
        let name = to_cstring(name.as_bytes().to_vec())?;
        let size = cvt_size(unsafe {
            libc::lgetxattr(path.as_ptr(), name.as_ptr(), ptr::null_mut(), 0)
        })?;
        let mut value = vec![0u8; size];
        let len = cvt_size(unsafe {
            libc::lgetxattr(
                path.as_ptr(),
                name.as_ptr(),
                value.as_mut_ptr() as *mut libc::c_void,
                value.len(),
            )
        })?;
        value.truncate(len);
        Ok(value)
    }

    fn llistxattr(&self, branch: &Branch, fragments: &[&OsStr]) -> io::Result<Vec<OsString>> {
        let path = self.path(branch, fragments)?;
        let size = cvt_size(unsafe { libc::llistxattr(path.as_ptr(), ptr::null_mut(), 0) })?;
        let mut list = vec![0u8; size];
        let len = cvt_size(unsafe {
            libc::llistxattr(
                path.as_ptr(),
                list.as_mut_ptr() as *mut libc::c_char,
                list.len(),
            )
        })?;
        list.truncate(len);
        Ok(split_xattr_list(&list))
    }

    fn lremovexattr(&self, branch: &Branch, fragments: &[&OsStr], name: &OsStr) -> io::Result<()> {
        let path = self.path(branch, fragments)?;
        let name = to_cstring(name.as_bytes().to_vec())?;
        cvt(unsafe { libc::lremovexattr(path.as_ptr(), name.as_ptr()) })?;
        Ok(())
    }
}
