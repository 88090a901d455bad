//! Heap-backed [`ControlPlane`] for unit tests that don't need a real segment.

use glam::Quat;
use parking_lot::Mutex;

use super::{ControlPlane, DEFAULT_DISTORTION, DistortionCoefficients, SegmentLayout, StateSnapshot};

/// Same ring and seqlock as the shared segment, allocated with `Box`.
pub(crate) struct MemoryChannel {
    layout: Mutex<Box<SegmentLayout>>,
}

impl MemoryChannel {
    pub(crate) fn new() -> Self {
        let layout = Box::<SegmentLayout>::default();
        layout.publish();
        Self {
            layout: Mutex::new(layout),
        }
    }

    /// Pops every unread line.
    pub(crate) fn drain_log(&self) -> Vec<String> {
        std::iter::from_fn(|| Some(self.pull_log()).filter(|line| !line.is_empty())).collect()
    }
}

impl ControlPlane for MemoryChannel {
    fn log(&self, text: &str) -> bool {
        let layout = self.layout.lock();
        // SAFETY: the mutex serializes writers.
        unsafe { layout.log().push(text) }
    }

    fn pull_log(&self) -> String {
        let layout = self.layout.lock();
        // SAFETY: the mutex serializes readers.
        unsafe { layout.log().pop() }
    }

    fn set_rotation(&self, rotation: Quat) {
        self.layout.lock().state().set_rotation(rotation);
    }

    fn rotation(&self) -> Quat {
        self.layout.lock().state().rotation()
    }

    fn set_distortion_coefficients(&self, k0: f32, k1: f32) {
        self.layout
            .lock()
            .state()
            .set_distortion_coefficients(DistortionCoefficients { k0, k1 });
    }

    fn distortion_coefficients(&self) -> (DistortionCoefficients, bool) {
        let coefficients = self.layout.lock().state().distortion_coefficients();
        (coefficients, coefficients != DEFAULT_DISTORTION)
    }

    fn set_distortion_scale(&self, scale: f32) {
        self.layout.lock().state().set_distortion_scale(scale);
    }

    fn distortion_scale(&self) -> f32 {
        self.layout.lock().state().distortion_scale()
    }

    fn snapshot(&self) -> StateSnapshot {
        self.layout.lock().state().snapshot()
    }
}
