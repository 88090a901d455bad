//! The head-mounted display device.
//!
//! Orientation comes from the control channel (fed by the pose ingestor);
//! position is never tracked. The display is a plain side-by-side window:
//! each eye gets half of it, projection is the unit frustum and distortion
//! correction is left to the phone, so [`HmdDriver::compute_distortion`] is
//! the identity.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::logger::ChannelLogger;
use super::{DriverHost, DriverPose, TrackingResult};
use crate::channel::ControlPlane;

/// Device class reported for [`DeviceProperty::DeviceClass`].
pub const DEVICE_CLASS_HMD: i32 = 1;

/// Universe id reported for [`DeviceProperty::CurrentUniverseId`]. Neither 0
/// (invalid) nor 1 (reserved by another vendor).
pub const UNIVERSE_ID: u64 = 3;

/// Latency hint attached to every pose, in seconds.
pub const POSE_TIME_OFFSET: f64 = 0.15;

const NOT_ACTIVATED: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowBounds {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderTargetSize {
    pub width: u32,
    pub height: u32,
}

/// A viewport inside the output window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Tangents of the half-angles of an eye's frustum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectionRaw {
    pub left: f32,
    pub right: f32,
    pub top: f32,
    pub bottom: f32,
}

/// Where one output pixel samples from, per color channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistortionCoordinates {
    pub red: [f32; 2],
    pub green: [f32; 2],
    pub blue: [f32; 2],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Eye {
    Left,
    Right,
}

/// Static description of the headset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub serial_number: String,
    pub model_number: String,
    /// Interpupillary distance in meters, used unless the host overrides it.
    pub ipd: f32,
    /// Refresh rate in Hz.
    pub display_frequency: f32,
    pub seconds_from_vsync_to_photons: f32,
    pub window: WindowBounds,
    pub render_target: RenderTargetSize,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            serial_number: "SPVR0815".to_owned(),
            model_number: "SmartPhoneVR Driver 0x0000".to_owned(),
            ipd: 0.063,
            display_frequency: 60.0,
            seconds_from_vsync_to_photons: 0.011_111_1,
            window: WindowBounds {
                x: 0,
                y: 0,
                width: 1280,
                height: 720,
            },
            render_target: RenderTargetSize {
                width: 1512,
                height: 1680,
            },
        }
    }
}

/// Tracked-device properties the runtime may query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceProperty {
    IsOnDesktop,
    UserIpdMeters,
    UserHeadToEyeDepthMeters,
    DisplayFrequency,
    SecondsFromVsyncToPhotons,
    DeviceClass,
    CurrentUniverseId,
    ModelNumber,
    RenderModelName,
    SerialNumber,
    ManufacturerName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PropertyError {
    /// The device has no value of the requested type for this property.
    #[error("property {0:?} is not provided by this device")]
    ValueNotProvided(DeviceProperty),
    /// The caller's buffer cannot hold the value and its terminator.
    #[error("buffer of {capacity} bytes is too small, {required} needed")]
    BufferTooSmall { required: usize, capacity: usize },
}

/// The headset as seen by the runtime.
pub struct HmdDriver {
    display: DisplayConfig,
    channel: Arc<dyn ControlPlane>,
    logger: ChannelLogger,
    object_id: AtomicU32,
}

impl HmdDriver {
    #[must_use]
    pub fn new(display: DisplayConfig, channel: Arc<dyn ControlPlane>, logger: ChannelLogger) -> Self {
        Self {
            display,
            channel,
            logger,
            object_id: AtomicU32::new(NOT_ACTIVATED),
        }
    }

    #[must_use]
    pub fn serial_number(&self) -> &str {
        &self.display.serial_number
    }

    #[must_use]
    pub fn model_number(&self) -> &str {
        &self.display.model_number
    }

    #[must_use]
    pub fn display(&self) -> &DisplayConfig {
        &self.display
    }

    /// Replaces the configured IPD with the user's setting from the host.
    pub fn set_ipd(&mut self, ipd: f32) {
        self.display.ipd = ipd;
    }

    /// Binds the device to the runtime's object id.
    pub fn activate(&self, object_id: u32) {
        self.logger.log(&format!("HmdDriver::activate({object_id})"));
        self.object_id.store(object_id, Ordering::Release);
    }

    pub fn deactivate(&self) {
        self.logger.log("HmdDriver::deactivate()");
        self.object_id.store(NOT_ACTIVATED, Ordering::Release);
    }

    pub fn power_off(&self) {
        self.deactivate();
    }

    /// The object id from the last [`HmdDriver::activate`], if still active.
    #[must_use]
    pub fn object_id(&self) -> Option<u32> {
        match self.object_id.load(Ordering::Acquire) {
            NOT_ACTIVATED => None,
            id => Some(id),
        }
    }

    /// Current pose: latest rotation from the channel, no position.
    #[must_use]
    pub fn get_pose(&self) -> DriverPose {
        DriverPose {
            pose_time_offset: POSE_TIME_OFFSET,
            rotation: self.channel.rotation(),
            pose_is_valid: true,
            result: TrackingResult::RunningOk,
            device_is_connected: true,
            will_drift_in_yaw: true,
            ..DriverPose::default()
        }
    }

    /// Pushes the current pose to the host if the device is active.
    pub fn run_frame(&self, host: &dyn DriverHost) {
        match self.object_id() {
            Some(object_id) => host.tracked_device_pose_updated(object_id, &self.get_pose()),
            None => {
                self.logger
                    .debug("HmdDriver::run_frame() called while not activated");
            }
        }
    }

    #[must_use]
    pub fn window_bounds(&self) -> WindowBounds {
        self.display.window
    }

    #[must_use]
    pub fn recommended_render_target_size(&self) -> RenderTargetSize {
        self.display.render_target
    }

    /// Left half of the window for the left eye, right half for the right.
    #[must_use]
    pub fn eye_output_viewport(&self, eye: Eye) -> Viewport {
        let half = self.display.window.width / 2;
        Viewport {
            x: match eye {
                Eye::Left => 0,
                Eye::Right => half,
            },
            y: 0,
            width: half,
            height: self.display.window.height,
        }
    }

    #[must_use]
    pub fn projection_raw(&self, _eye: Eye) -> ProjectionRaw {
        ProjectionRaw {
            left: -1.0,
            right: 1.0,
            top: -1.0,
            bottom: 1.0,
        }
    }

    #[must_use]
    pub fn compute_distortion(&self, _eye: Eye, u: f32, v: f32) -> DistortionCoordinates {
        DistortionCoordinates {
            red: [u, v],
            green: [u, v],
            blue: [u, v],
        }
    }

    /// # Errors
    ///
    /// [`PropertyError::ValueNotProvided`] for anything but
    /// [`DeviceProperty::IsOnDesktop`].
    pub fn bool_property(&self, property: DeviceProperty) -> Result<bool, PropertyError> {
        let value = match property {
            // Reporting `true` makes the runtime nag about a non-fullscreen window.
            DeviceProperty::IsOnDesktop => Ok(false),
            other => Err(PropertyError::ValueNotProvided(other)),
        };
        self.trace_property("bool", property, &value);
        value
    }

    /// # Errors
    ///
    /// [`PropertyError::ValueNotProvided`] for non-float properties.
    pub fn float_property(&self, property: DeviceProperty) -> Result<f32, PropertyError> {
        let value = match property {
            DeviceProperty::UserIpdMeters => Ok(self.display.ipd),
            DeviceProperty::UserHeadToEyeDepthMeters => Ok(0.0),
            DeviceProperty::DisplayFrequency => Ok(self.display.display_frequency),
            DeviceProperty::SecondsFromVsyncToPhotons => {
                Ok(self.display.seconds_from_vsync_to_photons)
            }
            other => Err(PropertyError::ValueNotProvided(other)),
        };
        self.trace_property("float", property, &value);
        value
    }

    /// # Errors
    ///
    /// [`PropertyError::ValueNotProvided`] for anything but
    /// [`DeviceProperty::DeviceClass`].
    pub fn int32_property(&self, property: DeviceProperty) -> Result<i32, PropertyError> {
        let value = match property {
            DeviceProperty::DeviceClass => Ok(DEVICE_CLASS_HMD),
            other => Err(PropertyError::ValueNotProvided(other)),
        };
        self.trace_property("int32", property, &value);
        value
    }

    /// # Errors
    ///
    /// [`PropertyError::ValueNotProvided`] for anything but
    /// [`DeviceProperty::CurrentUniverseId`].
    pub fn uint64_property(&self, property: DeviceProperty) -> Result<u64, PropertyError> {
        let value = match property {
            DeviceProperty::CurrentUniverseId => Ok(UNIVERSE_ID),
            other => Err(PropertyError::ValueNotProvided(other)),
        };
        self.trace_property("uint64", property, &value);
        value
    }

    /// # Errors
    ///
    /// [`PropertyError::ValueNotProvided`] for non-string properties.
    pub fn string_property(&self, property: DeviceProperty) -> Result<&str, PropertyError> {
        let value = match property {
            DeviceProperty::ModelNumber | DeviceProperty::RenderModelName => {
                Ok(self.display.model_number.as_str())
            }
            DeviceProperty::SerialNumber => Ok(self.display.serial_number.as_str()),
            other => Err(PropertyError::ValueNotProvided(other)),
        };
        self.trace_property("string", property, &value);
        value
    }

    /// Copies a string property into `buf` with a NUL terminator and returns
    /// the bytes written, terminator included.
    ///
    /// # Errors
    ///
    /// [`PropertyError::BufferTooSmall`] (with the size needed) if `buf`
    /// cannot hold the value plus terminator, or any error of
    /// [`HmdDriver::string_property`].
    pub fn copy_string_property(
        &self,
        property: DeviceProperty,
        buf: &mut [u8],
    ) -> Result<usize, PropertyError> {
        let value = self.string_property(property)?.as_bytes();
        let required = value.len() + 1;
        if required > buf.len() {
            return Err(PropertyError::BufferTooSmall {
                required,
                capacity: buf.len(),
            });
        }
        buf[..value.len()].copy_from_slice(value);
        buf[value.len()] = 0;
        Ok(required)
    }

    fn trace_property<T: std::fmt::Debug>(
        &self,
        kind: &str,
        property: DeviceProperty,
        value: &Result<T, PropertyError>,
    ) {
        self.logger
            .debug(&format!("HmdDriver::{kind}_property({property:?}) => {value:?}"));
    }
}

impl std::fmt::Debug for HmdDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmdDriver")
            .field("serial_number", &self.display.serial_number)
            .field("object_id", &self.object_id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::MemoryChannel;
    use glam::Quat;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingHost {
        poses: Mutex<Vec<(u32, DriverPose)>>,
    }

    impl DriverHost for RecordingHost {
        fn tracked_device_added(&self, _serial_number: &str) {}

        fn tracked_device_pose_updated(&self, object_id: u32, pose: &DriverPose) {
            self.poses.lock().push((object_id, *pose));
        }
    }

    fn hmd() -> (HmdDriver, Arc<MemoryChannel>) {
        let channel = Arc::new(MemoryChannel::new());
        let logger = ChannelLogger::new(channel.clone());
        let hmd = HmdDriver::new(DisplayConfig::default(), channel.clone(), logger);
        (hmd, channel)
    }

    #[test]
    fn pose_reports_channel_rotation() {
        let (hmd, channel) = hmd();
        let q = Quat::from_rotation_x(0.4);
        channel.set_rotation(q);

        let pose = hmd.get_pose();
        assert_eq!(pose.rotation, q);
        assert_eq!(pose.pose_time_offset, 0.15);
        assert!(pose.pose_is_valid && pose.device_is_connected && pose.will_drift_in_yaw);
        assert_eq!(pose.result, TrackingResult::RunningOk);
        assert_eq!(pose.world_from_driver_rotation, Quat::IDENTITY);
        assert_eq!(pose.driver_from_head_rotation, Quat::IDENTITY);
    }

    #[test]
    fn run_frame_pushes_only_while_active() {
        let (hmd, channel) = hmd();
        let host = RecordingHost::default();

        hmd.run_frame(&host);
        assert!(host.poses.lock().is_empty());

        hmd.activate(7);
        assert_eq!(hmd.object_id(), Some(7));
        hmd.run_frame(&host);
        hmd.power_off();
        hmd.run_frame(&host);

        let poses = host.poses.lock();
        assert_eq!(poses.len(), 1);
        assert_eq!(poses[0].0, 7);
        assert_eq!(hmd.object_id(), None);

        let log = channel.drain_log();
        assert!(log.iter().any(|line| line.ends_with("HmdDriver::activate(7)")));
        assert!(log.iter().any(|line| line.ends_with("HmdDriver::deactivate()")));
    }

    #[test]
    fn display_geometry() {
        let (hmd, _) = hmd();
        assert_eq!(
            hmd.window_bounds(),
            WindowBounds {
                x: 0,
                y: 0,
                width: 1280,
                height: 720
            }
        );
        assert_eq!(
            hmd.recommended_render_target_size(),
            RenderTargetSize {
                width: 1512,
                height: 1680
            }
        );
        assert_eq!(
            hmd.eye_output_viewport(Eye::Left),
            Viewport {
                x: 0,
                y: 0,
                width: 640,
                height: 720
            }
        );
        assert_eq!(hmd.eye_output_viewport(Eye::Right).x, 640);
        assert_eq!(
            hmd.projection_raw(Eye::Right),
            ProjectionRaw {
                left: -1.0,
                right: 1.0,
                top: -1.0,
                bottom: 1.0
            }
        );
        let d = hmd.compute_distortion(Eye::Left, 0.25, 0.75);
        assert_eq!((d.red, d.green, d.blue), ([0.25, 0.75], [0.25, 0.75], [0.25, 0.75]));
    }

    #[test]
    fn typed_properties() {
        let (mut hmd, _) = hmd();
        assert_eq!(hmd.bool_property(DeviceProperty::IsOnDesktop), Ok(false));
        assert_eq!(hmd.float_property(DeviceProperty::UserIpdMeters), Ok(0.063));
        assert_eq!(hmd.float_property(DeviceProperty::DisplayFrequency), Ok(60.0));
        assert_eq!(hmd.int32_property(DeviceProperty::DeviceClass), Ok(DEVICE_CLASS_HMD));
        assert_eq!(hmd.uint64_property(DeviceProperty::CurrentUniverseId), Ok(3));
        assert_eq!(hmd.string_property(DeviceProperty::SerialNumber), Ok("SPVR0815"));
        assert_eq!(
            hmd.string_property(DeviceProperty::RenderModelName),
            Ok("SmartPhoneVR Driver 0x0000")
        );

        assert_eq!(
            hmd.float_property(DeviceProperty::SerialNumber),
            Err(PropertyError::ValueNotProvided(DeviceProperty::SerialNumber))
        );
        assert!(hmd.string_property(DeviceProperty::ManufacturerName).is_err());

        hmd.set_ipd(0.07);
        assert_eq!(hmd.float_property(DeviceProperty::UserIpdMeters), Ok(0.07));
    }

    #[test]
    fn string_property_copy_needs_room_for_terminator() {
        let (hmd, _) = hmd();
        let mut exact = [0xffu8; 9];
        assert_eq!(hmd.copy_string_property(DeviceProperty::SerialNumber, &mut exact), Ok(9));
        assert_eq!(&exact, b"SPVR0815\0");

        let mut short = [0u8; 8];
        assert_eq!(
            hmd.copy_string_property(DeviceProperty::SerialNumber, &mut short),
            Err(PropertyError::BufferTooSmall {
                required: 9,
                capacity: 8
            })
        );
    }
}
