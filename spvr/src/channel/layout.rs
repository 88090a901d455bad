//! Canonical, versioned layout of the control segment.
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │ SegmentHeader  magic, version, geometry    │  64-byte aligned
//! ├────────────────────────────────────────────┤
//! │ LogRing        cursors + 64 × 256 B slots  │
//! ├────────────────────────────────────────────┤
//! │ ChannelState   generation, rotation, lens  │
//! └────────────────────────────────────────────┘
//! ```
//!
//! The owner publishes [`SEGMENT_MAGIC`] with release ordering once the
//! content is constructed and clears it when the content is destroyed.
//! Attachers wait for the magic, then refuse any version or geometry they
//! were not built for.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use minstant::Instant;

use super::log::{LINE_STRIDE, LOG_CAPACITY, LogRing};
use super::state::ChannelState;
use crate::ipc::shmem::{SegmentError, SharedMemorySafe, ShmPath};

pub const SEGMENT_MAGIC: u64 = 0x5350_5652_4354_524C; // "SPVRCTRL" in ASCII

/// Bumped whenever the byte layout of [`SegmentLayout`] changes.
pub const LAYOUT_VERSION: u32 = 2;

/// How long an attacher waits for the owner to publish the layout.
pub const INIT_TIMEOUT: Duration = Duration::from_secs(1);

#[repr(C)]
#[repr(align(64))]
struct SegmentHeader {
    magic: AtomicU64,
    version: AtomicU32,
    log_capacity: AtomicU32,
    line_stride: AtomicU32,
}

impl Drop for SegmentHeader {
    fn drop(&mut self) {
        // Attachers still mapping the segment see the owner is gone.
        self.magic.store(0, Ordering::Release);
    }
}

/// Everything that lives in the control segment.
#[repr(C)]
pub struct SegmentLayout {
    header: SegmentHeader,
    log: LogRing,
    state: ChannelState,
}

// SAFETY: repr(C) composition of SharedMemorySafe parts; the header is atomics only.
unsafe impl SharedMemorySafe for SegmentLayout {}

impl Default for SegmentLayout {
    fn default() -> Self {
        Self {
            header: SegmentHeader {
                magic: AtomicU64::new(0),
                version: AtomicU32::new(LAYOUT_VERSION),
                log_capacity: AtomicU32::new(LOG_CAPACITY as u32),
                line_stride: AtomicU32::new(LINE_STRIDE as u32),
            },
            log: LogRing::default(),
            state: ChannelState::default(),
        }
    }
}

impl SegmentLayout {
    #[must_use]
    pub fn log(&self) -> &LogRing {
        &self.log
    }

    #[must_use]
    pub fn state(&self) -> &ChannelState {
        &self.state
    }

    /// Marks the layout as constructed. Called once by the owner.
    pub(crate) fn publish(&self) {
        self.header.magic.store(SEGMENT_MAGIC, Ordering::Release);
    }

    /// Whether an owner has published the layout and not yet torn it down.
    #[must_use]
    pub fn is_published(&self) -> bool {
        self.header.magic.load(Ordering::Acquire) == SEGMENT_MAGIC
    }

    /// Waits up to `timeout` for the owner to publish, then checks that the
    /// published layout matches this build.
    ///
    /// # Errors
    ///
    /// [`SegmentError::NotInitialized`] on timeout,
    /// [`SegmentError::LayoutMismatch`] on a version or geometry mismatch.
    pub(crate) fn wait_ready(&self, path: &ShmPath, timeout: Duration) -> Result<(), SegmentError> {
        let start = Instant::now();
        while !self.is_published() {
            if start.elapsed() >= timeout {
                return Err(SegmentError::NotInitialized {
                    path: path.to_string(),
                });
            }
            std::thread::yield_now();
        }
        self.check_geometry(path)
    }

    fn check_geometry(&self, path: &ShmPath) -> Result<(), SegmentError> {
        let mismatch = |detail: String| {
            Err(SegmentError::LayoutMismatch {
                path: path.to_string(),
                detail,
            })
        };

        let version = self.header.version.load(Ordering::Relaxed);
        if version != LAYOUT_VERSION {
            return mismatch(format!("version {version}, expected {LAYOUT_VERSION}"));
        }
        let capacity = self.header.log_capacity.load(Ordering::Relaxed) as usize;
        let stride = self.header.line_stride.load(Ordering::Relaxed) as usize;
        if capacity != LOG_CAPACITY || stride != LINE_STRIDE {
            return mismatch(format!(
                "log ring {capacity}×{stride}, expected {LOG_CAPACITY}×{LINE_STRIDE}"
            ));
        }
        Ok(())
    }
}
