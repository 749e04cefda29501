//! Shared-memory segment creation and publication.
//!
//! The daemon creates the segment but never maps or touches it; clients map
//! it themselves using the spec returned by `GetSegment`. Creation is
//! mechanism-specific (POSIX `shm_open`, a plain file, System V `shmget`);
//! whatever was created is unlinked/removed again when the [`Segment`] is
//! dropped.

use log::{info, warn};
use partake_proto::{SegmentMapping, SegmentSpec};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// How to create the segment, from the CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentMethod {
    /// POSIX shared memory. `name` must start with exactly one slash; a name
    /// is generated when absent.
    Posix { name: Option<String>, force: bool },
    /// A regular file created (or replaced, with `force`) at `path`.
    File { path: PathBuf, force: bool },
    /// System V shared memory. Key 0 selects a private segment.
    SystemV {
        key: i32,
        force: bool,
        huge_pages: bool,
        huge_page_size: Option<usize>,
    },
    /// Win32 named file mapping. Not supported by this build.
    Win32 {
        filename: Option<PathBuf>,
        name: Option<String>,
        force: bool,
        large_pages: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentConfig {
    pub method: SegmentMethod,
    pub size: usize,
}

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("shm_open({name}): {source}")]
    ShmOpen {
        name: String,
        source: std::io::Error,
    },
    #[error("ftruncate({name}): {source}")]
    Resize {
        name: String,
        source: std::io::Error,
    },
    #[error("{path}: {source}", path = .path.display())]
    File {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("shmget(key {key}): {source}")]
    ShmGet { key: i32, source: std::io::Error },
    #[error("{0} shared memory is not supported on this platform")]
    Unsupported(&'static str),
}

enum Cleanup {
    PosixShm { name: String },
    File { path: PathBuf },
    SystemV { shm_id: i32 },
}

/// A created shared-memory segment. Publishes its mapping spec and removes
/// the underlying object on drop.
pub struct Segment {
    spec: SegmentSpec,
    cleanup: Cleanup,
}

impl Segment {
    pub fn create(config: &SegmentConfig) -> Result<Self, SegmentError> {
        match &config.method {
            SegmentMethod::Posix { name, force } => {
                create_posix_shm(name.as_deref(), *force, config.size)
            }
            SegmentMethod::File { path, force } => create_file(path, *force, config.size),
            SegmentMethod::SystemV {
                key,
                force,
                huge_pages,
                huge_page_size,
            } => create_sysv(*key, *force, *huge_pages, *huge_page_size, config.size),
            SegmentMethod::Win32 { .. } => Err(SegmentError::Unsupported("Win32")),
        }
    }

    pub fn size(&self) -> usize {
        self.spec.size as usize
    }

    pub fn spec(&self) -> SegmentSpec {
        self.spec.clone()
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        match &self.cleanup {
            Cleanup::PosixShm { name } => {
                if let Err(err) = shm_unlink(name) {
                    warn!("failed to unlink shared memory {name}: {err}");
                }
            }
            Cleanup::File { path } => {
                if let Err(err) = std::fs::remove_file(path) {
                    warn!("failed to remove {}: {err}", path.display());
                }
            }
            Cleanup::SystemV { shm_id } => {
                // SAFETY: plain syscall on an id we created.
                let ret = unsafe { libc::shmctl(*shm_id, libc::IPC_RMID, std::ptr::null_mut()) };
                if ret != 0 {
                    warn!(
                        "failed to remove System V shared memory {shm_id}: {}",
                        std::io::Error::last_os_error()
                    );
                }
            }
        }
    }
}

/// System page size; the default allocation granularity.
pub fn page_size() -> usize {
    // SAFETY: sysconf with a valid name has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).unwrap_or(4096)
}

fn errno() -> std::io::Error {
    std::io::Error::last_os_error()
}

fn cstring(s: &str) -> std::ffi::CString {
    // Segment names are validated CLI input; interior NULs cannot occur.
    std::ffi::CString::new(s).unwrap_or_default()
}

fn shm_unlink(name: &str) -> std::io::Result<()> {
    let cname = cstring(name);
    // SAFETY: valid NUL-terminated string.
    if unsafe { libc::shm_unlink(cname.as_ptr()) } != 0 {
        return Err(errno());
    }
    Ok(())
}

fn create_posix_shm(
    name: Option<&str>,
    force: bool,
    size: usize,
) -> Result<Segment, SegmentError> {
    let name = match name {
        Some(name) => name.to_owned(),
        None => format!("/partake-{}-{:08x}", std::process::id(), rand::random::<u32>()),
    };
    if force {
        // Best effort; the name may simply not exist yet.
        let _ = shm_unlink(&name);
    }
    let cname = cstring(&name);
    // SAFETY: valid NUL-terminated string; O_EXCL guarantees we create.
    let fd = unsafe {
        libc::shm_open(
            cname.as_ptr(),
            libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
            0o600,
        )
    };
    if fd < 0 {
        return Err(SegmentError::ShmOpen {
            name,
            source: errno(),
        });
    }
    // SAFETY: fd is owned and open.
    let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
    let ftruncate_err = if ret != 0 { Some(errno()) } else { None };
    // SAFETY: closing our own fd; the segment persists until unlinked.
    unsafe { libc::close(fd) };
    if let Some(source) = ftruncate_err {
        let _ = shm_unlink(&name);
        return Err(SegmentError::Resize { name, source });
    }
    info!("created POSIX shared memory {name} ({size} bytes)");
    Ok(Segment {
        spec: SegmentSpec {
            mapping: SegmentMapping::PosixShm { name: name.clone() },
            size: size as u64,
        },
        cleanup: Cleanup::PosixShm { name },
    })
}

fn create_file(path: &Path, force: bool, size: usize) -> Result<Segment, SegmentError> {
    let file_err = |source| SegmentError::File {
        path: path.to_owned(),
        source,
    };
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(!force)
        .create(force)
        .truncate(force)
        .open(path)
        .map_err(file_err)?;
    file.set_len(size as u64).map_err(|source| {
        let _ = std::fs::remove_file(path);
        file_err(source)
    })?;
    let canonical = std::fs::canonicalize(path).map_err(file_err)?;
    info!("created file-backed shared memory {} ({size} bytes)", canonical.display());
    Ok(Segment {
        spec: SegmentSpec {
            mapping: SegmentMapping::MmapFile {
                path: canonical.to_string_lossy().into_owned(),
            },
            size: size as u64,
        },
        cleanup: Cleanup::File {
            path: path.to_owned(),
        },
    })
}

fn create_sysv(
    key: i32,
    force: bool,
    huge_pages: bool,
    huge_page_size: Option<usize>,
    size: usize,
) -> Result<Segment, SegmentError> {
    let mut flags = libc::IPC_CREAT | libc::IPC_EXCL | 0o600;
    if huge_pages {
        #[cfg(target_os = "linux")]
        {
            flags |= libc::SHM_HUGETLB;
            if let Some(huge_size) = huge_page_size {
                flags |= (huge_size.trailing_zeros() as i32) << libc::MAP_HUGE_SHIFT;
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = huge_page_size;
            return Err(SegmentError::Unsupported("huge-page System V"));
        }
    }
    let ipc_key = if key == 0 { libc::IPC_PRIVATE } else { key };
    // SAFETY: plain syscall; no pointers involved.
    let mut shm_id = unsafe { libc::shmget(ipc_key, size, flags) };
    if shm_id < 0 && force && ipc_key != libc::IPC_PRIVATE {
        // Remove whatever holds the key and retry once.
        // SAFETY: plain syscalls; no pointers involved (RMID takes none).
        unsafe {
            let existing = libc::shmget(ipc_key, 0, 0);
            if existing >= 0 {
                libc::shmctl(existing, libc::IPC_RMID, std::ptr::null_mut());
            }
        }
        shm_id = unsafe { libc::shmget(ipc_key, size, flags) };
    }
    if shm_id < 0 {
        return Err(SegmentError::ShmGet {
            key,
            source: errno(),
        });
    }
    info!("created System V shared memory id {shm_id} ({size} bytes)");
    Ok(Segment {
        spec: SegmentSpec {
            mapping: SegmentMapping::SystemV { shm_id },
            size: size as u64,
        },
        cleanup: Cleanup::SystemV { shm_id },
    })
}
