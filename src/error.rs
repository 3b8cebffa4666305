use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CowfsError>;

#[derive(Error, Debug)]
pub enum CowfsError {
    #[error("branch I/O error: {0}")]
    Branch(#[from] io::Error),

    #[error("source vanished during promotion: {0}")]
    SourceVanished(io::Error),

    #[error("destination write failed: {0}")]
    DestinationWrite(io::Error),

    #[error("metadata transfer failed: {0}")]
    Metadata(io::Error),

    #[error("copy-on-write of sockets is not supported: {0}")]
    UnsupportedType(PathBuf),

    #[error("whiteout creation failed: {0}")]
    Whiteout(io::Error),

    #[error("config error: {0}")]
    Config(String),
}

impl CowfsError {
    /// The `errno` the FUSE-facing caller should report for this error.
    pub fn errno(&self) -> i32 {
        match self {
            CowfsError::Branch(e)
            | CowfsError::SourceVanished(e)
            | CowfsError::DestinationWrite(e)
            | CowfsError::Metadata(e)
            | CowfsError::Whiteout(e) => e.raw_os_error().unwrap_or(libc::EIO),
            CowfsError::UnsupportedType(_) => libc::ENOTSUP,
            CowfsError::Config(_) => libc::EINVAL,
        }
    }
}
