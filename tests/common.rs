#![allow(dead_code)]

use std::ffi::OsStr;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cowfs::{
    BackendKind, BranchFinder, BranchIo, BranchMode, BranchSpec, Config, CowEngine, WhiteoutStore,
};
use tempfile::TempDir;

pub const RO: usize = 0;
pub const RW: usize = 1;

/// A two-branch stack in a tempdir: branch 0 is `ro/`, branch 1 is `rw/`.
pub struct Stack {
    pub dir: TempDir,
    pub cfg: Arc<Config>,
    pub io: Arc<BranchIo>,
    pub cow: Arc<CowEngine>,
    pub store: WhiteoutStore,
}

impl Stack {
    pub fn new(backend: BackendKind) -> Stack {
        Stack::with_cow_enabled(backend, true)
    }

    pub fn with_cow_enabled(backend: BackendKind, cow_enabled: bool) -> Stack {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("ro")).unwrap();
        fs::create_dir(dir.path().join("rw")).unwrap();

        let specs = [
            BranchSpec {
                path: dir.path().join("ro"),
                mode: BranchMode::ReadOnly,
            },
            BranchSpec {
                path: dir.path().join("rw"),
                mode: BranchMode::ReadWrite,
            },
        ];
        let cfg = Arc::new(Config::new(&specs, backend, cow_enabled).unwrap());
        let io = Arc::new(BranchIo::new(cfg.clone()));
        let cow = Arc::new(CowEngine::new(cfg.clone(), io.clone()));
        let store = WhiteoutStore::new(cow.clone());

        Stack {
            dir,
            cfg,
            io,
            cow,
            store,
        }
    }

    pub fn ro(&self) -> PathBuf {
        self.dir.path().join("ro")
    }

    pub fn rw(&self) -> PathBuf {
        self.dir.path().join("rw")
    }

    /// Host path of a union path on the given branch.
    pub fn on(&self, branch: usize, union_path: &str) -> PathBuf {
        let root = if branch == RO { self.ro() } else { self.rw() };
        root.join(union_path.trim_start_matches('/'))
    }

    /// A finder that reports the first branch where the path exists on disk.
    pub fn finder(&self) -> StackFinder {
        StackFinder {
            roots: vec![self.ro(), self.rw()],
        }
    }
}

pub struct StackFinder {
    roots: Vec<PathBuf>,
}

impl BranchFinder for StackFinder {
    fn find_rorw_branch(&self, path: &OsStr) -> Option<usize> {
        let bytes = path.as_bytes();
        let start = bytes.iter().position(|&b| b != b'/').unwrap_or(bytes.len());
        let rel = Path::new(OsStr::from_bytes(&bytes[start..]));

        self.roots
            .iter()
            .position(|root| root.join(rel).symlink_metadata().is_ok())
    }
}

/// The process umask, needed to predict on-disk modes of freshly created
/// entries.
pub fn umask() -> u32 {
    let prior = unsafe { libc::umask(0) };
    unsafe { libc::umask(prior) };
    prior
}

pub fn os(s: &str) -> &OsStr {
    OsStr::new(s)
}

/// Recursively assert that two directory trees match in entry names, types,
/// permission bits, file contents and symlink targets.
pub fn assert_trees_equal(a: &Path, b: &Path) {
    use std::os::unix::fs::{FileTypeExt, MetadataExt};

    let mut names_a: Vec<_> = fs::read_dir(a).unwrap().map(|e| e.unwrap().file_name()).collect();
    let mut names_b: Vec<_> = fs::read_dir(b).unwrap().map(|e| e.unwrap().file_name()).collect();
    names_a.sort();
    names_b.sort();
    assert_eq!(names_a, names_b, "entries differ between {:?} and {:?}", a, b);

    for name in names_a {
        let pa = a.join(&name);
        let pb = b.join(&name);
        let ma = fs::symlink_metadata(&pa).unwrap();
        let mb = fs::symlink_metadata(&pb).unwrap();

        assert_eq!(
            ma.file_type(),
            mb.file_type(),
            "type mismatch at {:?}",
            pa
        );
        assert_eq!(
            ma.mode() & 0o7777,
            mb.mode() & 0o7777,
            "mode mismatch at {:?}",
            pa
        );

        if ma.file_type().is_symlink() {
            assert_eq!(fs::read_link(&pa).unwrap(), fs::read_link(&pb).unwrap());
        } else if ma.file_type().is_dir() {
            assert_trees_equal(&pa, &pb);
        } else if ma.file_type().is_file() {
            assert_eq!(fs::read(&pa).unwrap(), fs::read(&pb).unwrap());
        } else if ma.file_type().is_fifo() {
            // nothing beyond type and mode to compare
        }
    }
}

/// Deterministic junk bytes for large-file tests.
pub fn junk(len: usize) -> Vec<u8> {
    let mut state: u64 = 0x9e3779b97f4a7c15;
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        out.extend_from_slice(&state.to_le_bytes());
    }
    out.truncate(len);
    out
}
