//! Owner and attacher mappings of one control segment.
//!
//! Every test maps the same per-process segment name, so they run serially.
//! Sandboxes without a writable `/dev/shm` skip them.
//!
//! ```bash
//! RUST_LOG=spvr=debug cargo test --features tracing --test control_channel -- --nocapture
//! ```

use std::sync::Once;

use serial_test::serial;
use spvr::channel::{
    AttachedChannel, ControlPlane, DEFAULT_DISTORTION, DistortionCoefficients, LOG_CAPACITY,
    MAX_LINE_LEN, OwnedChannel,
};
use spvr::{Quat, SegmentError, ShmPath};

static INIT_TRACING: Once = Once::new();

fn init_test_tracing() {
    INIT_TRACING.call_once(spvr::init_tracing);
}

fn segment_path() -> ShmPath {
    ShmPath::new(format!("/spvr-it-{}", std::process::id())).unwrap()
}

/// Creates the test segment, or `None` when shared memory is off limits.
fn owner() -> Option<OwnedChannel> {
    init_test_tracing();
    match OwnedChannel::create(&segment_path()) {
        Ok(channel) => Some(channel),
        Err(err) if err.is_permission_denied() => None,
        Err(err) => panic!("create failed: {err}"),
    }
}

fn attacher() -> AttachedChannel {
    AttachedChannel::attach(&segment_path()).unwrap()
}

#[test]
#[serial]
fn owner_log_reaches_attacher() {
    let Some(owner) = owner() else { return };
    let attacher = attacher();

    assert!(owner.log("hello"));
    assert_eq!(attacher.unread_log_lines(), 1);
    assert_eq!(attacher.pull_log(), "hello");
    assert_eq!(attacher.pull_log(), "");
}

#[test]
#[serial]
fn log_ring_is_bounded_across_mappings() {
    let Some(owner) = owner() else { return };
    let attacher = attacher();

    for i in 0..LOG_CAPACITY + 10 {
        owner.log(&format!("line {i}"));
    }
    assert_eq!(attacher.unread_log_lines(), LOG_CAPACITY);
    assert!(!owner.log("one more"));

    for i in 0..LOG_CAPACITY {
        assert_eq!(attacher.pull_log(), format!("line {i}"));
    }
    assert_eq!(attacher.pull_log(), "");
    assert!(owner.log("room again"));
}

#[test]
#[serial]
fn long_lines_are_truncated() {
    let Some(owner) = owner() else { return };
    let attacher = attacher();

    owner.log(&"m".repeat(300));
    assert_eq!(attacher.pull_log().len(), MAX_LINE_LEN);
}

#[test]
#[serial]
fn rotation_is_shared_between_mappings() {
    let Some(owner) = owner() else { return };
    let attacher = attacher();
    assert_eq!(attacher.rotation(), Quat::IDENTITY);

    let q = Quat::from_xyzw(1.0, 2.0, 3.0, 4.0).normalize();
    attacher.set_rotation(q);

    let seen = owner.rotation();
    assert!(seen.abs_diff_eq(q, 1e-6));
    assert!((seen.length() - 1.0).abs() < 1e-6);
    assert_eq!(owner.snapshot().generation, 2);
}

#[test]
#[serial]
fn distortion_flags_configured_values() {
    let Some(owner) = owner() else { return };
    let attacher = attacher();

    assert_eq!(owner.distortion_coefficients(), (DEFAULT_DISTORTION, false));
    assert_eq!(owner.distortion_scale(), 1.0);

    attacher.set_distortion_coefficients(0.3, 0.1);
    attacher.set_distortion_scale(0.9);

    assert_eq!(
        owner.distortion_coefficients(),
        (DistortionCoefficients { k0: 0.3, k1: 0.1 }, true)
    );
    assert_eq!(owner.distortion_scale(), 0.9);
}

#[test]
#[serial]
fn attach_without_owner_is_not_found() {
    init_test_tracing();
    match AttachedChannel::attach(&segment_path()) {
        Err(SegmentError::NotFound { .. }) => {}
        Err(err) if err.is_permission_denied() => {}
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[test]
#[serial]
fn second_owner_is_rejected() {
    let Some(_owner) = owner() else { return };
    assert!(matches!(
        OwnedChannel::create(&segment_path()),
        Err(SegmentError::AlreadyExists { .. })
    ));
}

#[test]
#[serial]
fn dropping_owner_releases_the_name() {
    let Some(owner) = owner() else { return };
    let attacher = attacher();
    assert!(attacher.owner_alive());

    drop(owner);

    assert!(!attacher.owner_alive());
    assert!(matches!(
        AttachedChannel::attach(&segment_path()),
        Err(SegmentError::NotFound { .. })
    ));

    // The name is free for a new owner even while the old mapping lives on.
    let Some(_next) = self::owner() else { return };
    assert!(!attacher.owner_alive());
}
