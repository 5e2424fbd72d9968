//! Virtual filesystem
//!
//! A thin multiplexer: filesystem backends register mount functions,
//! `mount_with_cache` tries them in order against a block cache, and the
//! VFS owns the process-wide handle table that per-task file descriptors
//! index into. Backends never see handles.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::FsError;
use crate::sync::IrqMutex;

pub mod blockdev;
pub mod cache;
pub mod fat16;
pub mod file;

pub use cache::BlockCache;
pub use file::{FileStat, VfsFile};

/// Upper bound on simultaneously open VFS files.
pub const MAX_HANDLES: usize = 2048;

/// Transient backend failures are retried this many times by
/// [`read_file_all`] and the lazy content load.
pub const READ_RETRIES: usize = 3;

/// Operations a filesystem implementation provides to the VFS.
pub trait FsBackend: Send + Sync {
    fn name(&self) -> &'static str;
    fn read_file(&self, path: &str, buf: &mut [u8]) -> Result<usize, FsError>;
    fn write_file(&self, path: &str, data: &[u8]) -> Result<usize, FsError>;
    fn file_size(&self, path: &str) -> Result<usize, FsError>;
    fn list_dir(&self, path: &str) -> Result<Vec<String>, FsError>;
    fn is_dir(&self, path: &str) -> bool;
}

/// A mount probe: given the cache, return a live backend or decline.
pub type MountFn = fn(Arc<Mutex<BlockCache>>) -> Result<Arc<dyn FsBackend>, FsError>;

struct Registry {
    probes: Vec<(&'static str, MountFn)>,
    active: Option<Arc<dyn FsBackend>>,
}

static REGISTRY: IrqMutex<Registry> = IrqMutex::new(Registry {
    probes: Vec::new(),
    active: None,
});

/// Handle table: fd 3..31 of every task resolves through here.
static HANDLES: IrqMutex<Vec<Option<VfsFile>>> = IrqMutex::new(Vec::new());

/// Register a filesystem probe. Order of registration is probe order.
pub fn register_backend(name: &'static str, probe: MountFn) {
    REGISTRY.with(|r| r.probes.push((name, probe)));
}

/// Try every registered backend against `cache`; the first one that
/// recognizes the volume becomes the active filesystem.
pub fn mount_with_cache(cache: BlockCache) -> Result<&'static str, FsError> {
    let cache = Arc::new(Mutex::new(cache));
    let probes = REGISTRY.with(|r| r.probes.clone());
    for (name, probe) in probes {
        match probe(Arc::clone(&cache)) {
            Ok(backend) => {
                REGISTRY.with(|r| r.active = Some(backend));
                log::info!("vfs: mounted {}", name);
                return Ok(name);
            }
            Err(e) => log::debug!("vfs: {} declined: {:?}", name, e),
        }
    }
    Err(FsError::NoBackend)
}

/// Swap in a backend directly (boot-time RAM volumes, tests).
pub fn set_active_backend(backend: Arc<dyn FsBackend>) {
    REGISTRY.with(|r| r.active = Some(backend));
}

fn active() -> Result<Arc<dyn FsBackend>, FsError> {
    REGISTRY.with(|r| r.active.clone()).ok_or(FsError::NoBackend)
}

// --- handle table --------------------------------------------------------

/// Open `path` on the active backend; returns a global handle index.
pub fn open(path: &str) -> Result<usize, FsError> {
    let file = VfsFile::open(active()?, path)?;
    HANDLES.with(|handles| {
        for (i, slot) in handles.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(file);
                return Ok(i);
            }
        }
        if handles.len() >= MAX_HANDLES {
            return Err(FsError::BadHandle);
        }
        handles.push(Some(file));
        Ok(handles.len() - 1)
    })
}

/// Run `f` against an open handle.
pub fn with_handle<R>(
    handle: usize,
    f: impl FnOnce(&mut VfsFile) -> Result<R, FsError>,
) -> Result<R, FsError> {
    HANDLES.with(|handles| {
        let file = handles
            .get_mut(handle)
            .and_then(|slot| slot.as_mut())
            .ok_or(FsError::BadHandle)?;
        f(file)
    })
}

/// Release a handle slot.
pub fn close(handle: usize) -> Result<(), FsError> {
    HANDLES.with(|handles| {
        let slot = handles.get_mut(handle).ok_or(FsError::BadHandle)?;
        if slot.take().is_none() {
            return Err(FsError::BadHandle);
        }
        Ok(())
    })
}

pub fn read(handle: usize, buf: &mut [u8]) -> Result<usize, FsError> {
    with_handle(handle, |file| file.read(buf))
}

pub fn write(handle: usize, data: &[u8]) -> Result<usize, FsError> {
    with_handle(handle, |file| file.write(data))
}

pub fn lseek(handle: usize, offset: i64, whence: u32) -> Result<usize, FsError> {
    with_handle(handle, |file| file.lseek(offset, whence))
}

pub fn fstat(handle: usize) -> Result<FileStat, FsError> {
    with_handle(handle, |file| Ok(file.stat()))
}

// --- path-level operations ----------------------------------------------

/// List a directory through the active backend.
pub fn list_path(path: &str) -> Result<Vec<String>, FsError> {
    active()?.list_dir(path)
}

pub fn is_dir(path: &str) -> bool {
    active().map(|b| b.is_dir(path)).unwrap_or(false)
}

/// Join `path` onto `cwd` and normalize `.` and `..` components.
pub fn resolve_path(cwd: &str, path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    let base = if path.starts_with('/') { "" } else { cwd };
    for component in base.split('/').chain(path.split('/')) {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            c => parts.push(c),
        }
    }
    let mut out = String::from("/");
    out.push_str(&parts.join("/"));
    out
}

/// Whole-file read with retry; tolerates transient device or cache
/// hiccups.
pub fn read_file_all(path: &str) -> Result<Vec<u8>, FsError> {
    let backend = active()?;
    let size = backend.file_size(path)?;
    let mut buf = alloc::vec![0u8; size];
    let mut last = FsError::IoError;
    for attempt in 0..READ_RETRIES {
        match backend.read_file(path, &mut buf) {
            Ok(n) => {
                buf.truncate(n);
                return Ok(buf);
            }
            Err(e) => {
                last = e;
                log::warn!("vfs: read {} failed (attempt {}): {:?}", path, attempt + 1, e);
            }
        }
    }
    Err(last)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Backend double that counts content reads and can fail a number of
    /// them, for the lazy-load and retry contracts.
    struct MockBackend {
        data: Vec<u8>,
        content_reads: AtomicUsize,
        fail_first: AtomicUsize,
    }

    impl MockBackend {
        fn new(data: &[u8]) -> Arc<Self> {
            Arc::new(Self {
                data: data.to_vec(),
                content_reads: AtomicUsize::new(0),
                fail_first: AtomicUsize::new(0),
            })
        }
    }

    impl FsBackend for MockBackend {
        fn name(&self) -> &'static str {
            "mock"
        }

        fn read_file(&self, _path: &str, buf: &mut [u8]) -> Result<usize, FsError> {
            self.content_reads.fetch_add(1, Ordering::Relaxed);
            if self
                .fail_first
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                    n.checked_sub(1)
                })
                .is_ok()
            {
                return Err(FsError::IoError);
            }
            let n = buf.len().min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            Ok(n)
        }

        fn write_file(&self, _path: &str, data: &[u8]) -> Result<usize, FsError> {
            Ok(data.len())
        }

        fn file_size(&self, _path: &str) -> Result<usize, FsError> {
            Ok(self.data.len())
        }

        fn list_dir(&self, _path: &str) -> Result<Vec<String>, FsError> {
            Ok(Vec::new())
        }

        fn is_dir(&self, _path: &str) -> bool {
            false
        }
    }

    #[test]
    fn open_and_fstat_issue_no_content_read() {
        let backend = MockBackend::new(b"lazy bytes");
        let mut file = VfsFile::open(backend.clone() as Arc<dyn FsBackend>, "/x").unwrap();
        assert_eq!(file.stat().size, 10);
        assert!(!file.is_loaded());
        assert_eq!(backend.content_reads.load(Ordering::Relaxed), 0);

        // First read populates the buffer with exactly one backend read.
        let mut buf = [0u8; 4];
        assert_eq!(file.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"lazy");
        assert!(file.is_loaded());
        assert_eq!(backend.content_reads.load(Ordering::Relaxed), 1);

        // Subsequent reads come from the cache.
        file.read(&mut buf).unwrap();
        assert_eq!(backend.content_reads.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn read_past_size_is_eof_not_error() {
        let backend = MockBackend::new(b"abc");
        let mut file = VfsFile::open(backend as Arc<dyn FsBackend>, "/x").unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(file.read(&mut buf).unwrap(), 3);
        assert_eq!(file.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn lseek_updates_offset_without_io() {
        let backend = MockBackend::new(b"0123456789");
        let mut file = VfsFile::open(backend.clone() as Arc<dyn FsBackend>, "/x").unwrap();
        assert_eq!(file.lseek(4, file::SEEK_SET).unwrap(), 4);
        assert_eq!(backend.content_reads.load(Ordering::Relaxed), 0);
        let mut buf = [0u8; 2];
        file.read(&mut buf).unwrap();
        assert_eq!(&buf, b"45");
        assert_eq!(file.lseek(-1, file::SEEK_CUR).unwrap(), 5);
        assert_eq!(file.lseek(0, file::SEEK_END).unwrap(), 10);
        // Clamped to size.
        assert_eq!(file.lseek(100, file::SEEK_SET).unwrap(), 10);
        assert!(file.lseek(-99, file::SEEK_SET).is_err());
    }

    #[test]
    fn lazy_load_retries_transient_failures() {
        let backend = MockBackend::new(b"flaky");
        backend.fail_first.store(2, Ordering::Relaxed);
        let mut file = VfsFile::open(backend.clone() as Arc<dyn FsBackend>, "/x").unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(file.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"flaky");
        assert_eq!(backend.content_reads.load(Ordering::Relaxed), 3);
    }

    /// Backend whose file content is the path itself, so reads reveal
    /// which path a handle is bound to.
    struct PathEcho;

    impl FsBackend for PathEcho {
        fn name(&self) -> &'static str {
            "pathecho"
        }

        fn read_file(&self, path: &str, buf: &mut [u8]) -> Result<usize, FsError> {
            let bytes = path.as_bytes();
            let n = buf.len().min(bytes.len());
            buf[..n].copy_from_slice(&bytes[..n]);
            Ok(n)
        }

        fn write_file(&self, _path: &str, data: &[u8]) -> Result<usize, FsError> {
            Ok(data.len())
        }

        fn file_size(&self, path: &str) -> Result<usize, FsError> {
            Ok(path.len())
        }

        fn list_dir(&self, _path: &str) -> Result<Vec<String>, FsError> {
            Ok(Vec::new())
        }

        fn is_dir(&self, _path: &str) -> bool {
            false
        }
    }

    // Two tasks, same local fd number, different global handles: each
    // task reads its own file. Exercises the real registry and handle
    // table, which no other test touches.
    #[test]
    fn same_fd_number_isolated_across_tasks() {
        use crate::mm::PhysAddr;
        use crate::sched::task::Task;

        set_active_backend(Arc::new(PathEcho));
        let handle_a = open("/a.txt").unwrap();
        let handle_b = open("/b.txt").unwrap();
        assert_ne!(handle_a, handle_b);

        let mut task_a = Task::new(1, "a", false, PhysAddr::new(0));
        let mut task_b = Task::new(2, "b", false, PhysAddr::new(0));
        assert_eq!(task_a.alloc_fd(handle_a), Some(3));
        assert_eq!(task_b.alloc_fd(handle_b), Some(3));

        let mut buf = [0u8; 16];
        let n = read(task_a.handle_for(3).unwrap(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"/a.txt");
        let n = read(task_b.handle_for(3).unwrap(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"/b.txt");

        close(task_a.release_fd(3).unwrap()).unwrap();
        close(task_b.release_fd(3).unwrap()).unwrap();
        // Double close is a handle error, not a panic.
        assert!(close(handle_a).is_err());
    }

    #[test]
    fn path_resolution_normalizes() {
        assert_eq!(resolve_path("/usr", "app.elf"), "/usr/app.elf");
        assert_eq!(resolve_path("/usr", "/apps/x.elf"), "/apps/x.elf");
        assert_eq!(resolve_path("/a/b", "../c"), "/a/c");
        assert_eq!(resolve_path("/", "./x/./y"), "/x/y");
        assert_eq!(resolve_path("/a", "../../.."), "/");
    }
}
