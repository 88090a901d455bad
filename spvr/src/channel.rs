//! The control channel: log ring plus pose/lens state in one shared segment.
//!
//! [`ControlChannel`] is the in-process façade. Every accessor takes the
//! channel's mutex for the duration of its shared-memory access, so threads of
//! one process are serialized. Across processes the segment relies on its own
//! atomics:
//!
//! - the log ring is single-writer/single-reader (the driver logs, the monitor
//!   pulls),
//! - the pose/lens state is a seqlock, so a reader in either process never
//!   observes a half-written rotation.
//!
//! ```no_run
//! use spvr::channel::{ControlChannel, ControlPlane};
//! use spvr::ShmPath;
//!
//! let path = ShmPath::new("/spvr-control")?;
//!
//! // Driver process
//! let owner = ControlChannel::create(&path)?;
//! owner.log("driver up");
//!
//! // Monitor process
//! let monitor = ControlChannel::attach(&path)?;
//! assert_eq!(monitor.pull_log(), "driver up");
//! # Ok::<(), spvr::SegmentError>(())
//! ```

pub mod layout;
pub mod log;
pub mod state;
#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::time::Duration;

use glam::Quat;
use parking_lot::Mutex;

use crate::ipc::shmem::{Creator, Opener, SegmentError, Shm, ShmMode, ShmPath};
use crate::trace::{debug, info};

pub use layout::{INIT_TIMEOUT, LAYOUT_VERSION, SegmentLayout};
pub use log::{LINE_STRIDE, LOG_CAPACITY, LogRing, MAX_LINE_LEN};
pub use state::{
    ChannelState, DEFAULT_DISTORTION, DEFAULT_DISTORTION_SCALE, DistortionCoefficients,
    StateSnapshot,
};

/// Well-known name of the control segment.
pub const DEFAULT_SEGMENT_PATH: &str = "/spvr-control";

const _: () = assert!(ShmPath::is_valid(DEFAULT_SEGMENT_PATH));

/// Returns [`DEFAULT_SEGMENT_PATH`] as a validated path.
#[must_use]
pub fn default_segment_path() -> ShmPath {
    ShmPath::from_checked(DEFAULT_SEGMENT_PATH)
}

/// Operations the rest of the driver needs from a control channel.
///
/// Implemented by [`ControlChannel`] in both roles so consumers can hold an
/// `Arc<dyn ControlPlane>` without caring whether their process owns the
/// segment.
pub trait ControlPlane: Send + Sync {
    /// Appends a line to the log ring. Lines longer than [`MAX_LINE_LEN`]
    /// bytes are truncated. Returns `false` when the ring was full and the line
    /// was dropped.
    fn log(&self, text: &str) -> bool;

    /// Takes the oldest unread line, or `""` if there is none.
    fn pull_log(&self) -> String;

    fn set_rotation(&self, rotation: Quat);

    fn rotation(&self) -> Quat;

    fn set_distortion_coefficients(&self, k0: f32, k1: f32);

    /// Stored coefficients, plus whether they differ from
    /// [`DEFAULT_DISTORTION`] (i.e. someone configured them).
    fn distortion_coefficients(&self) -> (DistortionCoefficients, bool);

    fn set_distortion_scale(&self, scale: f32);

    fn distortion_scale(&self) -> f32;

    /// All pose/lens fields from one consistent write, with its generation.
    fn snapshot(&self) -> StateSnapshot;
}

/// Mutex-guarded view of the control segment.
///
/// `ControlChannel<Creator>` owns the segment: it constructs the content, and
/// dropping it destroys the content and unlinks the name.
/// `ControlChannel<Opener>` attaches to a segment created elsewhere and only
/// releases its mapping.
pub struct ControlChannel<M: ShmMode> {
    segment: Mutex<Shm<SegmentLayout, M>>,
    path: ShmPath,
}

/// The owning process's channel.
pub type OwnedChannel = ControlChannel<Creator>;

/// An attached process's channel.
pub type AttachedChannel = ControlChannel<Opener>;

impl ControlChannel<Creator> {
    /// Creates and publishes the segment.
    ///
    /// # Errors
    ///
    /// [`SegmentError::AlreadyExists`] if another owner holds the name, or a
    /// syscall failure.
    pub fn create(path: &ShmPath) -> Result<Self, SegmentError> {
        let segment = Shm::<SegmentLayout, Creator>::create(path)?;
        segment.publish();
        info!(path = %path, bytes = segment.len(), "control segment created");
        Ok(Self::from_segment(segment))
    }
}

impl ControlChannel<Opener> {
    /// Attaches to a segment, waiting up to [`INIT_TIMEOUT`] for its owner to
    /// finish publishing it.
    ///
    /// # Errors
    ///
    /// [`SegmentError::NotFound`] if no owner created it, plus the errors of
    /// [`ControlChannel::attach_timeout`].
    pub fn attach(path: &ShmPath) -> Result<Self, SegmentError> {
        Self::attach_timeout(path, INIT_TIMEOUT)
    }

    /// [`ControlChannel::attach`] with an explicit publish timeout.
    ///
    /// # Errors
    ///
    /// [`SegmentError::NotFound`], [`SegmentError::SizeMismatch`],
    /// [`SegmentError::NotInitialized`] or [`SegmentError::LayoutMismatch`].
    pub fn attach_timeout(path: &ShmPath, timeout: Duration) -> Result<Self, SegmentError> {
        let segment = Shm::<SegmentLayout, Opener>::open(path)?;
        segment.wait_ready(path, timeout)?;
        info!(path = %path, "attached to control segment");
        Ok(Self::from_segment(segment))
    }
}

impl<M: ShmMode> ControlChannel<M> {
    fn from_segment(segment: Shm<SegmentLayout, M>) -> Self {
        let path = segment.path().clone();
        Self {
            segment: Mutex::new(segment),
            path,
        }
    }

    fn with<R>(&self, f: impl FnOnce(&SegmentLayout) -> R) -> R {
        let segment = self.segment.lock();
        f(&segment)
    }

    #[must_use]
    pub fn path(&self) -> &ShmPath {
        &self.path
    }

    /// Lines waiting for [`ControlPlane::pull_log`].
    #[must_use]
    pub fn unread_log_lines(&self) -> usize {
        self.with(|segment| segment.log().unread())
    }

    /// Whether the owning process still has the segment published. Always
    /// true for the owner itself.
    #[must_use]
    pub fn owner_alive(&self) -> bool {
        self.with(SegmentLayout::is_published)
    }
}

impl<M: ShmMode> ControlPlane for ControlChannel<M> {
    fn log(&self, text: &str) -> bool {
        // SAFETY: the mutex makes this thread the only writer in the process.
        let accepted = self.with(|segment| unsafe { segment.log().push(text) });
        if !accepted {
            debug!(path = %self.path, "log ring full, line dropped");
        }
        accepted
    }

    fn pull_log(&self) -> String {
        // SAFETY: the mutex makes this thread the only reader in the process.
        self.with(|segment| unsafe { segment.log().pop() })
    }

    fn set_rotation(&self, rotation: Quat) {
        self.with(|segment| segment.state().set_rotation(rotation));
    }

    fn rotation(&self) -> Quat {
        self.with(|segment| segment.state().rotation())
    }

    fn set_distortion_coefficients(&self, k0: f32, k1: f32) {
        self.with(|segment| {
            segment
                .state()
                .set_distortion_coefficients(DistortionCoefficients { k0, k1 });
        });
    }

    fn distortion_coefficients(&self) -> (DistortionCoefficients, bool) {
        let coefficients = self.with(|segment| segment.state().distortion_coefficients());
        (coefficients, coefficients != DEFAULT_DISTORTION)
    }

    fn set_distortion_scale(&self, scale: f32) {
        self.with(|segment| segment.state().set_distortion_scale(scale));
    }

    fn distortion_scale(&self) -> f32 {
        self.with(|segment| segment.state().distortion_scale())
    }

    fn snapshot(&self) -> StateSnapshot {
        self.with(|segment| segment.state().snapshot())
    }
}

impl<M: ShmMode> fmt::Debug for ControlChannel<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlChannel")
            .field("path", &self.path)
            .field("owner", &M::OWNS_CONTENT)
            .finish_non_exhaustive()
    }
}
