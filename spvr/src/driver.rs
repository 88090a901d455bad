//! Headset driver surface handed to the VR runtime.
//!
//! The runtime's own plugin ABI stays outside this crate. What lives here is
//! the Rust side of that boundary: a [`DriverHost`] trait for the callbacks
//! the runtime offers, the [`HmdDriver`] device, and the [`DriverContext`]
//! that wires the control channel, logger and pose ingestor together.

pub mod context;
pub mod hmd;
pub mod logger;

use glam::Quat;

pub use context::{DriverConfig, DriverContext, DriverError, SegmentRole};
pub use hmd::{DeviceProperty, DisplayConfig, Eye, HmdDriver, PropertyError};
pub use logger::ChannelLogger;

/// Callbacks the VR runtime provides to the driver.
pub trait DriverHost {
    /// Announces a new tracked device by serial number.
    fn tracked_device_added(&self, serial_number: &str);

    fn tracked_device_pose_updated(&self, object_id: u32, pose: &DriverPose);

    /// User-configured interpupillary distance in meters, if any.
    fn ipd_setting(&self) -> Option<f32> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackingResult {
    #[default]
    Uninitialized,
    CalibratingInProgress,
    CalibratingOutOfRange,
    RunningOk,
    RunningOutOfRange,
}

/// One pose report for a tracked device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriverPose {
    /// Seconds between sampling the pose and handing it over.
    pub pose_time_offset: f64,
    pub world_from_driver_rotation: Quat,
    pub driver_from_head_rotation: Quat,
    pub rotation: Quat,
    pub pose_is_valid: bool,
    pub result: TrackingResult,
    pub device_is_connected: bool,
    pub will_drift_in_yaw: bool,
}

impl Default for DriverPose {
    fn default() -> Self {
        Self {
            pose_time_offset: 0.0,
            world_from_driver_rotation: Quat::IDENTITY,
            driver_from_head_rotation: Quat::IDENTITY,
            rotation: Quat::IDENTITY,
            pose_is_valid: false,
            result: TrackingResult::Uninitialized,
            device_is_connected: false,
            will_drift_in_yaw: false,
        }
    }
}
