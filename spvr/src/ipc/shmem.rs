//! Typed POSIX shared memory mappings.
//!
//! A segment is a named kernel object (`shm_open`) sized to exactly one `T`
//! and mapped `MAP_SHARED` into every participating process. The mapping
//! handle is a typestate smart pointer:
//!
//! - [`Shm<T, Creator>`](Shm::create) creates the object, constructs `T` in
//!   place, and on drop destroys `T`, unmaps, and unlinks the name.
//! - [`Shm<T, Opener>`](Shm::open) attaches to an existing object and only
//!   ever unmaps. It never constructs or destroys the content.
//!
//! ```no_run
//! use spvr::ipc::shmem::{Creator, Opener, SegmentError, SharedMemorySafe, Shm, ShmPath};
//! use std::sync::atomic::{AtomicU64, Ordering};
//!
//! #[repr(C)]
//! #[derive(Default)]
//! struct Counter {
//!     value: AtomicU64,
//! }
//!
//! // SAFETY: repr(C), a single atomic, no pointers.
//! unsafe impl SharedMemorySafe for Counter {}
//!
//! let path = ShmPath::new("/my-counter")?;
//!
//! // Owning process
//! let owner = Shm::<Counter, Creator>::create(&path)?;
//! owner.value.store(42, Ordering::Release);
//!
//! // Any other process
//! let view = Shm::<Counter, Opener>::open(&path)?;
//! assert_eq!(view.value.load(Ordering::Acquire), 42);
//! # Ok::<(), SegmentError>(())
//! ```
//!
//! # Crash leftovers
//!
//! A creator killed by `SIGKILL` leaves its name behind and the next
//! [`Shm::create`] fails with [`SegmentError::AlreadyExists`]. Owners that know
//! they are the only legitimate creator may `shm::unlink` the name first.

use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ops::Deref;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::ptr::{self, NonNull, null_mut};
use std::sync::atomic::*;
use std::time::Duration;

use minstant::Instant;
use rustix::fs::{Mode, fstat, ftruncate};
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use rustix::{io, shm};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How long [`Shm::open`] waits for a zero-sized object to be sized by its
/// creator.
pub const SIZE_WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Result alias for shared memory operations.
pub type Result<T> = std::result::Result<T, SegmentError>;

/// Errors raised while creating, attaching or validating a segment.
///
/// All of them are startup failures; nothing in this crate retries them.
#[derive(Debug, Error)]
pub enum SegmentError {
    /// The name is not a portable POSIX shared memory name.
    #[error("invalid shared memory path `{path}`: {reason}")]
    InvalidPath { path: String, reason: &'static str },
    /// An owner tried to create a segment whose name is already taken.
    #[error("shared memory `{path}` already exists (another owner is running or a previous one crashed)")]
    AlreadyExists { path: String },
    /// An attacher found no segment under the name.
    #[error("shared memory `{path}` does not exist")]
    NotFound { path: String },
    /// Any other failing syscall.
    #[error("{op} failed for `{path}`: {source}")]
    Posix {
        op: &'static str,
        path: String,
        #[source]
        source: io::Errno,
    },
    /// The object exists but its size does not match the mapped type.
    #[error("shared memory `{path}` size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: String,
        expected: usize,
        actual: i64,
    },
    /// The owner never published a completed layout.
    #[error("shared memory `{path}` was not initialized by its owner in time")]
    NotInitialized { path: String },
    /// The owner published a layout this build does not understand.
    #[error("shared memory `{path}` has an incompatible layout: {detail}")]
    LayoutMismatch { path: String, detail: String },
}

impl SegmentError {
    fn posix(op: &'static str, path: &ShmPath, err: io::Errno) -> Self {
        Self::Posix {
            op,
            path: path.to_string(),
            source: err,
        }
    }

    /// Whether the OS refused access to the shared memory namespace, as in
    /// sandboxes without a writable `/dev/shm`.
    #[must_use]
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::Posix { source, .. } if *source == io::Errno::ACCESS)
    }
}

const POSIX_NAME_MAX: usize = 255;

/// A validated POSIX shared memory name.
///
/// Must start with `/`, contain no other `/`, and be at most 255 bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ShmPath(String);

impl ShmPath {
    /// Validates and wraps a shared memory name.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentError::InvalidPath`] if the name is not portable.
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        validate_shm_path(&path)?;
        Ok(Self(path))
    }

    /// Whether `path` would pass [`ShmPath::new`]. Usable in const context.
    #[must_use]
    pub const fn is_valid(path: &str) -> bool {
        let bytes = path.as_bytes();
        if bytes.len() < 2 || bytes.len() > POSIX_NAME_MAX || bytes[0] != b'/' {
            return false;
        }
        let mut i = 1;
        while i < bytes.len() {
            if bytes[i] == b'/' {
                return false;
            }
            i += 1;
        }
        true
    }

    /// Wraps a name already checked by [`ShmPath::is_valid`].
    pub(crate) fn from_checked(path: &str) -> Self {
        debug_assert!(Self::is_valid(path));
        Self(path.to_owned())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ShmPath {
    type Error = SegmentError;

    fn try_from(path: String) -> Result<Self> {
        Self::new(path)
    }
}

impl From<ShmPath> for String {
    fn from(path: ShmPath) -> Self {
        path.0
    }
}

impl AsRef<str> for ShmPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShmPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn validate_shm_path(path: &str) -> Result<()> {
    let invalid = |reason| {
        Err(SegmentError::InvalidPath {
            path: path.to_string(),
            reason,
        })
    };

    if !path.starts_with('/') {
        return invalid("path must start with '/'");
    }
    if path.len() == 1 {
        return invalid("path must name an object after the leading '/'");
    }
    if path[1..].contains('/') {
        return invalid("path must not contain additional '/' characters");
    }
    if path.len() > POSIX_NAME_MAX {
        return invalid("path length must be <= 255 bytes");
    }
    Ok(())
}

/// Cleanup policy of a mapping, selected by the [`Creator`] / [`Opener`] marker.
pub trait ShmMode {
    /// Whether this handle constructed the content and therefore destroys it
    /// and unlinks the name on drop.
    const OWNS_CONTENT: bool;
}

/// Typestate marker for the single owning process.
///
/// Drop order: `drop_in_place(T)`, `munmap`, `shm_unlink`.
pub struct Creator;
impl ShmMode for Creator {
    const OWNS_CONTENT: bool = true;
}

/// Typestate marker for attaching processes. Drop only unmaps.
pub struct Opener;
impl ShmMode for Opener {
    const OWNS_CONTENT: bool = false;
}

/// Types that may live in memory mapped by several processes.
///
/// # Safety
///
/// Implementers guarantee that the type
/// - has a stable layout (`#[repr(C)]` or `#[repr(transparent)]`),
/// - holds no pointers or references (addresses are per process),
/// - is `Send + Sync` and mutates shared state only through atomics or a
///   documented single-writer protocol,
/// - stays sound if its `Drop` never runs (crashed processes skip it).
///
/// `std::sync::Mutex` and friends are process-local and must not appear.
pub unsafe trait SharedMemorySafe: Send + Sync {}

macro_rules! impl_shared_memory_safe {
    ($($t:ty),* $(,)?) => {
        $(
            unsafe impl SharedMemorySafe for $t {}
        )*
    };
}

impl_shared_memory_safe! {
    i8, i16, i32, i64, isize,
    u8, u16, u32, u64, usize,
    f32, f64,
    bool,
    AtomicBool,
    AtomicI8, AtomicI16, AtomicI32, AtomicI64, AtomicIsize,
    AtomicU8, AtomicU16, AtomicU32, AtomicU64, AtomicUsize,
}

unsafe impl<T: SharedMemorySafe, const N: usize> SharedMemorySafe for [T; N] {}

/// Handle to one `T` living in a named shared memory object.
///
/// Dereferences to `&T`; the reference is valid for the lifetime of the handle.
/// Mutation goes through `T`'s interior mutability.
///
/// ```text
///  "/name" ──> kernel object (size_of::<T>() bytes)
///                ▲                     ▲
///          Shm<T, Creator>       Shm<T, Opener>
///          (process A)           (process B)
/// ```
pub struct Shm<T: SharedMemorySafe, M: ShmMode> {
    ptr: NonNull<T>,
    path: ShmPath,
    _mode: PhantomData<M>,
}

// SAFETY: T: SharedMemorySafe implies Send + Sync, and the pointer targets a
// process-wide mapping rather than thread-local data.
unsafe impl<T: SharedMemorySafe, M: ShmMode> Send for Shm<T, M> {}

// SAFETY: see Send; &Shm only hands out &T.
unsafe impl<T: SharedMemorySafe, M: ShmMode> Sync for Shm<T, M> {}

/// Maps `size_of::<T>()` bytes of `fd` read-write and shared.
fn map_object<T>(fd: &rustix::fd::OwnedFd, path: &ShmPath) -> Result<NonNull<T>> {
    // SAFETY: a fresh mapping aliases nothing in this process. The object is
    // at least size_of::<T>() bytes (ftruncate or fstat checked that), and
    // mmap returns page-aligned addresses which satisfy T's alignment.
    let raw = unsafe {
        mmap(
            null_mut(),
            size_of::<T>(),
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )
    }
    .map_err(|err| SegmentError::posix("mmap", path, err))?;

    NonNull::new(raw.cast::<T>()).ok_or_else(|| SegmentError::posix("mmap", path, io::Errno::FAULT))
}

impl<T: SharedMemorySafe + Default> Shm<T, Creator> {
    /// Creates the named object, maps it, and constructs `T::default()` in place.
    ///
    /// # Errors
    ///
    /// - [`SegmentError::AlreadyExists`] if the name is taken (`EEXIST`).
    /// - [`SegmentError::Posix`] for permission, resource or mapping failures.
    ///   The name is unlinked again before returning.
    ///
    /// # Panics
    ///
    /// Propagates a panic from `T::default()` after unmapping and unlinking.
    pub fn create(path: &ShmPath) -> Result<Self> {
        let fd = shm::open(
            path.as_str(),
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|err| match err {
            err if err == io::Errno::EXIST => SegmentError::AlreadyExists {
                path: path.to_string(),
            },
            err => SegmentError::posix("shm_open", path, err),
        })?;

        let mapped = ftruncate(&fd, size_of::<T>() as u64)
            .map_err(|err| SegmentError::posix("ftruncate", path, err))
            .and_then(|()| map_object::<T>(&fd, path));
        // The mapping keeps the object alive; the descriptor is no longer needed.
        drop(fd);
        let ptr = match mapped {
            Ok(ptr) => ptr,
            Err(err) => {
                let _ = shm::unlink(path.as_str());
                return Err(err);
            }
        };

        // SAFETY: ptr is a fresh, exclusive, correctly sized and aligned mapping.
        let init = catch_unwind(AssertUnwindSafe(|| unsafe {
            ptr.as_ptr().write(T::default());
        }));
        if let Err(payload) = init {
            // SAFETY: the mapping was created above and nothing references it.
            unsafe {
                let _ = munmap(ptr.as_ptr().cast(), size_of::<T>());
            }
            let _ = shm::unlink(path.as_str());
            resume_unwind(payload);
        }

        Ok(Self {
            ptr,
            path: path.clone(),
            _mode: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe> Shm<T, Opener> {
    /// Opens and maps an object created by another process.
    ///
    /// The content is used as already constructed. Callers that need to know
    /// the owner finished construction must check a marker inside `T` (see
    /// `channel::layout`).
    ///
    /// # Errors
    ///
    /// - [`SegmentError::NotFound`] if nothing exists under the name (`ENOENT`).
    /// - [`SegmentError::SizeMismatch`] if the object is not `size_of::<T>()`
    ///   bytes. A zero size means the creator has not called `ftruncate` yet,
    ///   so it is retried for up to [`SIZE_WAIT_TIMEOUT`] first.
    /// - [`SegmentError::Posix`] for any other failing syscall.
    pub fn open(path: &ShmPath) -> Result<Self> {
        let fd = shm::open(path.as_str(), shm::OFlags::RDWR, Mode::empty()).map_err(
            |err| match err {
                err if err == io::Errno::NOENT => SegmentError::NotFound {
                    path: path.to_string(),
                },
                err => SegmentError::posix("shm_open", path, err),
            },
        )?;

        let size = wait_for_size(&fd, path, SIZE_WAIT_TIMEOUT)?;
        if size != size_of::<T>() as i64 {
            return Err(SegmentError::SizeMismatch {
                path: path.to_string(),
                expected: size_of::<T>(),
                actual: size,
            });
        }

        let ptr = map_object::<T>(&fd, path)?;
        Ok(Self {
            ptr,
            path: path.clone(),
            _mode: PhantomData,
        })
    }
}

/// Object size once nonzero, or zero if it stays unsized for `timeout`.
fn wait_for_size(fd: &rustix::fd::OwnedFd, path: &ShmPath, timeout: Duration) -> Result<i64> {
    let start = Instant::now();
    loop {
        let stat = fstat(fd).map_err(|err| SegmentError::posix("fstat", path, err))?;
        if stat.st_size != 0 || start.elapsed() >= timeout {
            return Ok(stat.st_size);
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

impl<T: SharedMemorySafe, M: ShmMode> Shm<T, M> {
    /// Name of the underlying object.
    #[must_use]
    pub fn path(&self) -> &ShmPath {
        &self.path
    }

    /// Mapped length in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        size_of::<T>()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        size_of::<T>() == 0
    }
}

impl<T: SharedMemorySafe, M: ShmMode> Drop for Shm<T, M> {
    fn drop(&mut self) {
        if M::OWNS_CONTENT {
            // SAFETY: the creator constructed T in create() and this is the last
            // handle to it in this process.
            unsafe { ptr::drop_in_place(self.ptr.as_ptr()) };
        }

        // SAFETY: ptr/len describe the mapping made at construction.
        unsafe {
            let _ = munmap(self.ptr.as_ptr().cast(), size_of::<T>());
        }

        if M::OWNS_CONTENT {
            let _ = shm::unlink(self.path.as_str());
        }
    }
}

impl<T: SharedMemorySafe, M: ShmMode> Deref for Shm<T, M> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the mapping stays valid until Drop, and the content was
        // constructed by the creator before any opener could see the name.
        unsafe { self.ptr.as_ref() }
    }
}
