//! Process-level driver state.
//!
//! A [`DriverContext`] is built once at driver entry and owns everything the
//! driver needs: the control channel, the logger, the headset and the pose
//! ingestor. Teardown is deterministic. [`DriverContext::cleanup`] (or drop)
//! stops and joins the ingestor before the channel goes away.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::DriverHost;
use super::hmd::{DisplayConfig, HmdDriver};
use super::logger::ChannelLogger;
use crate::channel::{ControlChannel, ControlPlane, default_segment_path};
use crate::ipc::shmem::{SegmentError, ShmPath};
use crate::runtime::ingestor::{IngestorConfig, IngestorError, PoseIngestor};
use crate::trace::info;

/// Whether this process creates the control segment or joins an existing one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentRole {
    #[default]
    Owner,
    Attacher,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub segment: ShmPath,
    pub role: SegmentRole,
    pub ingestor: IngestorConfig,
    pub display: DisplayConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            segment: default_segment_path(),
            role: SegmentRole::default(),
            ingestor: IngestorConfig::default(),
            display: DisplayConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("control channel unavailable: {0}")]
    Segment(#[from] SegmentError),
    #[error("pose ingestor failed to start: {0}")]
    Ingestor(#[from] IngestorError),
}

pub struct DriverContext {
    role: SegmentRole,
    channel: Arc<dyn ControlPlane>,
    logger: ChannelLogger,
    hmd: HmdDriver,
    ingestor: PoseIngestor,
    cleaned_up: bool,
}

impl DriverContext {
    /// Opens the channel in the configured role and starts the pose ingestor.
    ///
    /// # Errors
    ///
    /// [`DriverError::Segment`] if the channel cannot be created or attached,
    /// [`DriverError::Ingestor`] if the receiver thread cannot be spawned.
    pub fn new(config: DriverConfig) -> Result<Self, DriverError> {
        info!(segment = %config.segment, role = ?config.role, "driver context starting");

        let channel: Arc<dyn ControlPlane> = match config.role {
            SegmentRole::Owner => Arc::new(ControlChannel::create(&config.segment)?),
            SegmentRole::Attacher => Arc::new(ControlChannel::attach(&config.segment)?),
        };
        let logger = ChannelLogger::new(Arc::clone(&channel));
        logger.debug("DriverContext created");

        let hmd = HmdDriver::new(config.display, Arc::clone(&channel), logger.clone());
        let ingestor = PoseIngestor::new(config.ingestor, Arc::clone(&channel));
        ingestor.start()?;

        Ok(Self {
            role: config.role,
            channel,
            logger,
            hmd,
            ingestor,
            cleaned_up: false,
        })
    }

    /// Applies host settings and announces the headset.
    pub fn init(&mut self, host: &dyn DriverHost) {
        if let Some(ipd) = host.ipd_setting() {
            self.hmd.set_ipd(ipd);
        }
        self.logger.debug(&format!(
            "DriverContext::init() announcing {}",
            self.hmd.serial_number()
        ));
        host.tracked_device_added(self.hmd.serial_number());
    }

    pub fn run_frame(&self, host: &dyn DriverHost) {
        self.hmd.run_frame(host);
    }

    /// Number of headsets this driver manages. Always one.
    #[must_use]
    pub const fn tracked_device_count(&self) -> u32 {
        1
    }

    /// The device at `index`, if any.
    #[must_use]
    pub fn tracked_device(&self, index: u32) -> Option<&HmdDriver> {
        (index == 0).then_some(&self.hmd)
    }

    #[must_use]
    pub fn hmd(&self) -> &HmdDriver {
        &self.hmd
    }

    #[must_use]
    pub fn channel(&self) -> &Arc<dyn ControlPlane> {
        &self.channel
    }

    #[must_use]
    pub fn ingestor(&self) -> &PoseIngestor {
        &self.ingestor
    }

    #[must_use]
    pub fn logger(&self) -> &ChannelLogger {
        &self.logger
    }

    #[must_use]
    pub const fn role(&self) -> SegmentRole {
        self.role
    }

    /// Deactivates the headset and stops the ingestor. Later calls do nothing.
    pub fn cleanup(&mut self) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;
        self.logger.debug("DriverContext::cleanup()");
        if self.hmd.object_id().is_some() {
            self.hmd.deactivate();
        }
        self.ingestor.shutdown();
        info!("driver context cleaned up");
    }
}

impl Drop for DriverContext {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl std::fmt::Debug for DriverContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverContext")
            .field("role", &self.role)
            .field("hmd", &self.hmd)
            .field("ingestor", &self.ingestor)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverPose;
    use crate::net::Endpoint;
    use crate::runtime::IngestorHealth;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Host {
        added: Mutex<Vec<String>>,
        poses: Mutex<Vec<u32>>,
    }

    impl DriverHost for Host {
        fn tracked_device_added(&self, serial_number: &str) {
            self.added.lock().push(serial_number.to_owned());
        }

        fn tracked_device_pose_updated(&self, object_id: u32, _pose: &DriverPose) {
            self.poses.lock().push(object_id);
        }

        fn ipd_setting(&self) -> Option<f32> {
            Some(0.065)
        }
    }

    fn config(name: &str) -> DriverConfig {
        DriverConfig {
            segment: ShmPath::new(format!("/spvr-ctx-{name}-{}", std::process::id())).unwrap(),
            ingestor: IngestorConfig {
                bind_addr: Endpoint::localhost(0),
                ..IngestorConfig::default()
            },
            ..DriverConfig::default()
        }
    }

    #[test]
    fn default_config_owns_well_known_segment() {
        let config = DriverConfig::default();
        assert_eq!(config.segment.as_str(), "/spvr-control");
        assert_eq!(config.role, SegmentRole::Owner);
    }

    #[test]
    fn context_lifecycle() {
        let mut ctx = match DriverContext::new(config("lifecycle")) {
            Ok(ctx) => ctx,
            Err(DriverError::Segment(err)) if err.is_permission_denied() => return,
            Err(err) => panic!("context failed: {err}"),
        };
        assert_eq!(ctx.role(), SegmentRole::Owner);
        assert_eq!(ctx.tracked_device_count(), 1);
        assert!(ctx.tracked_device(0).is_some());
        assert!(ctx.tracked_device(1).is_none());

        let host = Host::default();
        ctx.init(&host);
        assert_eq!(*host.added.lock(), ["SPVR0815"]);
        assert_eq!(ctx.hmd().display().ipd, 0.065);

        ctx.hmd().activate(0);
        ctx.run_frame(&host);
        assert_eq!(*host.poses.lock(), [0]);

        ctx.cleanup();
        assert_eq!(ctx.ingestor().health(), IngestorHealth::Stopped);
        assert_eq!(ctx.hmd().object_id(), None);
        ctx.cleanup();
    }

    #[test]
    fn attacher_without_owner_fails() {
        let config = DriverConfig {
            role: SegmentRole::Attacher,
            ..config("orphan")
        };
        match DriverContext::new(config) {
            Err(DriverError::Segment(SegmentError::NotFound { .. })) => {}
            Err(DriverError::Segment(err)) if err.is_permission_denied() => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }
}
