//! Per-type object copies and metadata transfer, after BSD `cp`: symlinks,
//! fifos and device nodes are recreated rather than copied, regular files go
//! through a shared mapping when small enough and a bounce buffer otherwise.

use std::ffi::OsStr;
use std::fs::{File, Permissions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::os::unix::io::{AsRawFd, IntoRawFd};
use std::ptr;
use std::slice;

use crate::branch::BranchIo;
use crate::cow::CowJob;
use crate::error::{CowfsError, Result};

/// Files at or below this size are transferred through one shared mapping,
/// so big files don't trash memory.
const MMAP_LIMIT: i64 = 8 * 1048576;

/// Bounce-buffer size for the read/write loop.
const MAXBSIZE: usize = 4096;

const RETAINBITS: libc::mode_t = libc::S_ISUID
    | libc::S_ISGID
    | libc::S_ISVTX
    | libc::S_IRWXU
    | libc::S_IRWXG
    | libc::S_IRWXO;

fn short_write() -> io::Error {
    io::Error::new(io::ErrorKind::WriteZero, "short write")
}

/// Close a destination descriptor with the result checked; data loss at
/// close time must fail the job.
fn close_checked(file: File) -> io::Result<()> {
    let fd = file.into_raw_fd();
    if unsafe { libc::close(fd) } < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Transfer stat data onto a freshly created object: timestamps first (the
/// source record carries second resolution only), then ownership, then mode.
/// A chown refused with `EPERM` drops `setuid|setgid|sticky` and continues;
/// every other failure is logged and reported after the remaining steps have
/// still run. The mode in `st` is narrowed in place so the caller's
/// follow-up decisions see what actually got applied.
pub(crate) fn setfile(
    io: &BranchIo,
    branch: usize,
    path: &OsStr,
    st: &mut libc::stat,
) -> io::Result<()> {
    let mut first_err: Option<io::Error> = None;
    st.st_mode &=
        libc::S_ISUID | libc::S_ISGID | libc::S_IRWXU | libc::S_IRWXG | libc::S_IRWXO;

    let times = [
        libc::timespec {
            tv_sec: st.st_atime,
            tv_nsec: 0,
        },
        libc::timespec {
            tv_sec: st.st_mtime,
            tv_nsec: 0,
        },
    ];
    if let Err(e) = io.utimens(branch, &[path], &times) {
        tracing::warn!("utimens: {} {:?}: {}", branch, path, e);
        first_err.get_or_insert(e);
    }

    // Set uid/gid before the mode; chown removes setuid bits. If chown is
    // refused, lose setuid/setgid/sticky.
    if let Err(e) = io.chown(branch, &[path], st.st_uid, st.st_gid) {
        if e.raw_os_error() != Some(libc::EPERM) {
            tracing::warn!("chown: {} {:?}: {}", branch, path, e);
            first_err.get_or_insert(e);
        }
        st.st_mode &= !(libc::S_ISVTX | libc::S_ISUID | libc::S_ISGID);
    }

    if let Err(e) = io.chmod(branch, &[path], st.st_mode) {
        tracing::warn!("chmod: {} {:?}: {}", branch, path, e);
        first_err.get_or_insert(e);
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Stat transfer for a recreated symlink: ownership only. Symlinks do not
/// carry a reliable mode or timestamps across platforms.
fn setlink(io: &BranchIo, branch: usize, path: &OsStr, st: &libc::stat) -> io::Result<()> {
    if let Err(e) = io.lchown(branch, &[path], st.st_uid, st.st_gid) {
        if e.raw_os_error() != Some(libc::EPERM) {
            tracing::warn!("lchown: {} {:?}: {}", branch, path, e);
            return Err(e);
        }
    }
    Ok(())
}

/// Copy an ordinary file with all of its stat data.
pub(crate) fn copy_file(io: &BranchIo, job: &CowJob) -> Result<()> {
    let from = io
        .open(job.from_branch, &[job.from_path], libc::O_RDONLY, 0)
        .map_err(|e| {
            tracing::warn!("{} {:?}: {}", job.from_branch, job.from_path, e);
            CowfsError::Branch(e)
        })?;

    let mut fs = job.stat;
    let to = io
        .open(
            job.to_branch,
            &[job.to_path],
            libc::O_WRONLY | libc::O_TRUNC | libc::O_CREAT,
            fs.st_mode & !(libc::S_ISVTX | libc::S_ISUID | libc::S_ISGID) & 0o7777,
        )
        .map_err(|e| {
            tracing::warn!("{} {:?}: {}", job.to_branch, job.to_path, e);
            CowfsError::Branch(e)
        })?;

    if fs.st_size > 0 && fs.st_size <= MMAP_LIMIT {
        let size = fs.st_size as usize;
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ,
                libc::MAP_SHARED,
                from.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            let e = io::Error::last_os_error();
            tracing::warn!("mmap: {} {:?}: {}", job.from_branch, job.from_path, e);
            return Err(CowfsError::DestinationWrite(e));
        }
        unsafe {
            libc::madvise(addr, size, libc::MADV_SEQUENTIAL);
        }

        let data = unsafe { slice::from_raw_parts(addr as *const u8, size) };
        let write_res = (&to).write(data);

        // Some systems don't unmap on close(2).
        let munmap_err = if unsafe { libc::munmap(addr, size) } < 0 {
            Some(io::Error::last_os_error())
        } else {
            None
        };

        match write_res {
            Ok(n) if n == size => {}
            Ok(_) => {
                tracing::warn!("{} {:?}: short write", job.to_branch, job.to_path);
                return Err(CowfsError::DestinationWrite(short_write()));
            }
            Err(e) => {
                tracing::warn!("{} {:?}: {}", job.to_branch, job.to_path, e);
                return Err(CowfsError::DestinationWrite(e));
            }
        }
        if let Some(e) = munmap_err {
            tracing::warn!("munmap: {} {:?}: {}", job.from_branch, job.from_path, e);
            return Err(CowfsError::DestinationWrite(e));
        }
    } else {
        let mut buf = [0u8; MAXBSIZE];
        loop {
            let rcount = match (&from).read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!("copy failed: {} {:?}: {}", job.from_branch, job.from_path, e);
                    return Err(CowfsError::Branch(e));
                }
            };
            match (&to).write(&buf[..rcount]) {
                Ok(wcount) if wcount == rcount => {}
                Ok(_) => {
                    tracing::warn!("{} {:?}: short write", job.to_branch, job.to_path);
                    return Err(CowfsError::DestinationWrite(short_write()));
                }
                Err(e) => {
                    tracing::warn!("{} {:?}: {}", job.to_branch, job.to_path, e);
                    return Err(CowfsError::DestinationWrite(e));
                }
            }
        }
    }

    let mut meta_err: Option<io::Error> = None;
    match setfile(io, job.to_branch, job.to_path, &mut fs) {
        Err(e) => meta_err = Some(e),
        Ok(()) => {
            // If the source was setuid or setgid, lose the bits unless the
            // copy is owned by the same user and group.
            if fs.st_mode & (libc::S_ISUID | libc::S_ISGID) != 0 && fs.st_uid == job.uid {
                match to.metadata() {
                    Err(e) => {
                        tracing::warn!("{} {:?}: {}", job.to_branch, job.to_path, e);
                        meta_err = Some(e);
                    }
                    Ok(md) => {
                        if md.gid() == fs.st_gid {
                            let mode = fs.st_mode & RETAINBITS & !job.umask;
                            if let Err(e) = to.set_permissions(Permissions::from_mode(mode)) {
                                tracing::warn!("{} {:?}: {}", job.to_branch, job.to_path, e);
                                meta_err = Some(e);
                            }
                        }
                    }
                }
            }
        }
    }

    drop(from);
    if let Err(e) = close_checked(to) {
        tracing::warn!("{} {:?}: {}", job.to_branch, job.to_path, e);
        return Err(CowfsError::DestinationWrite(e));
    }

    match meta_err {
        Some(e) => Err(CowfsError::Metadata(e)),
        None => Ok(()),
    }
}

/// Recreate a symlink on the destination branch with the source's target,
/// then carry its ownership over.
pub(crate) fn copy_link(io: &BranchIo, job: &CowJob) -> Result<()> {
    let target = io
        .readlink(job.from_branch, &[job.from_path])
        .map_err(|e| {
            tracing::warn!("readlink: {} {:?}: {}", job.from_branch, job.from_path, e);
            CowfsError::Branch(e)
        })?;

    io.symlink(&target, job.to_branch, &[job.to_path])
        .map_err(|e| {
            tracing::warn!("symlink: {:?}: {}", target, e);
            CowfsError::Branch(e)
        })?;

    setlink(io, job.to_branch, job.to_path, &job.stat).map_err(CowfsError::Metadata)
}

/// Recreate a fifo on the destination branch, then carry its stat data over.
pub(crate) fn copy_fifo(io: &BranchIo, job: &CowJob) -> Result<()> {
    io.mkfifo(job.to_branch, &[job.to_path], job.stat.st_mode & 0o7777)
        .map_err(|e| {
            tracing::warn!("mkfifo: {} {:?}: {}", job.to_branch, job.to_path, e);
            CowfsError::Branch(e)
        })?;

    let mut st = job.stat;
    setfile(io, job.to_branch, job.to_path, &mut st).map_err(CowfsError::Metadata)
}

/// Recreate a block or character device on the destination branch, then
/// carry its stat data over.
pub(crate) fn copy_special(io: &BranchIo, job: &CowJob) -> Result<()> {
    io.mknod(
        job.to_branch,
        &[job.to_path],
        job.stat.st_mode,
        job.stat.st_rdev,
    )
    .map_err(|e| {
        tracing::warn!("mknod: {} {:?}: {}", job.to_branch, job.to_path, e);
        CowfsError::Branch(e)
    })?;

    let mut st = job.stat;
    setfile(io, job.to_branch, job.to_path, &mut st).map_err(CowfsError::Metadata)
}
