//! Control channel and pose ingestion for a phone-based VR headset driver.
//!
//! The driver process and an external control process share one POSIX shared
//! memory segment. It carries a ring-buffered log stream and the latest head
//! rotation. A background thread receives rotation packets over UDP and
//! republishes them into the segment, where the driver reads them once per
//! frame.
//!
//! ```text
//! phone ──UDP──> PoseIngestor ──set_rotation──> ControlChannel ──rotation──> HmdDriver ──> host
//!                                                    │
//!                                  log / pull_log    │  shared memory segment
//!                                                    ▼
//!                                              spvr-monitor
//! ```

pub mod channel;
pub mod driver;
pub mod ipc;
pub mod net;
pub mod pose;
pub mod runtime;
pub mod trace;

pub use channel::{ControlChannel, ControlPlane};
pub use driver::{DriverConfig, DriverContext, DriverError, DriverHost};
pub use ipc::shmem::{SegmentError, ShmPath};
pub use runtime::ingestor::{IngestorConfig, IngestorHealth, PoseIngestor};
pub use trace::init_tracing;

// Re-export the quaternion type used throughout the public API.
pub use glam::Quat;
