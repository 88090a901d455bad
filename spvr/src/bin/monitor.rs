//! Control-channel monitor.
//!
//! Prints the driver's log lines and the headset rotation as they change, and
//! optionally configures lens distortion on start.
//!
//! # Usage
//!
//! ```sh
//! spvr-monitor --k0 0.3    # join the segment a running driver owns
//! spvr-monitor --own       # own /spvr-control, driver runs as attacher
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: stop polling and release the segment

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use signal_hook::consts::{SIGINT, SIGTERM};
use spvr::channel::{
    AttachedChannel, ControlPlane, DEFAULT_SEGMENT_PATH, OwnedChannel, StateSnapshot,
};
use spvr::{SegmentError, ShmPath};

const DEFAULT_INTERVAL_MS: u64 = 50;

#[derive(Debug, thiserror::Error)]
enum MonitorError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Segment(#[from] SegmentError),
    #[error("failed to install signal handler: {0}")]
    Signal(#[source] std::io::Error),
}

struct Options {
    segment: ShmPath,
    own: bool,
    interval: Duration,
    k0: Option<f32>,
    k1: Option<f32>,
    scale: Option<f32>,
}

enum Channel {
    Owned(OwnedChannel),
    Attached(AttachedChannel),
}

impl Channel {
    fn open(options: &Options) -> Result<Self, SegmentError> {
        if options.own {
            OwnedChannel::create(&options.segment).map(Self::Owned)
        } else {
            AttachedChannel::attach(&options.segment).map(Self::Attached)
        }
    }

    fn plane(&self) -> &dyn ControlPlane {
        match self {
            Self::Owned(channel) => channel as &dyn ControlPlane,
            Self::Attached(channel) => channel as &dyn ControlPlane,
        }
    }

    fn owner_alive(&self) -> bool {
        match self {
            Self::Owned(_) => true,
            Self::Attached(channel) => channel.owner_alive(),
        }
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("spvr-monitor: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), MonitorError> {
    spvr::init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let options = parse_args(&args)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&shutdown)).map_err(MonitorError::Signal)?;
    }

    let channel = Channel::open(&options)?;
    eprintln!(
        "spvr-monitor: {} {}",
        if options.own { "owning" } else { "attached to" },
        options.segment
    );

    let plane = channel.plane();
    configure_distortion(plane, &options);

    let mut last_generation = None;
    while !shutdown.load(Ordering::Relaxed) {
        loop {
            let line = plane.pull_log();
            if line.is_empty() {
                break;
            }
            println!("{line}");
        }

        let snapshot = plane.snapshot();
        if last_generation != Some(snapshot.generation) {
            print_state(&snapshot);
            last_generation = Some(snapshot.generation);
        }

        if !channel.owner_alive() {
            eprintln!("spvr-monitor: segment owner went away");
            break;
        }
        std::thread::sleep(options.interval);
    }

    eprintln!("spvr-monitor: stopped");
    Ok(())
}

fn configure_distortion(plane: &dyn ControlPlane, options: &Options) {
    if options.k0.is_some() || options.k1.is_some() {
        let (current, _) = plane.distortion_coefficients();
        plane.set_distortion_coefficients(
            options.k0.unwrap_or(current.k0),
            options.k1.unwrap_or(current.k1),
        );
    }
    if let Some(scale) = options.scale {
        plane.set_distortion_scale(scale);
    }
}

fn print_state(snapshot: &StateSnapshot) {
    let q = snapshot.rotation;
    println!(
        "[gen {}] rotation w={:+.4} x={:+.4} y={:+.4} z={:+.4}  k0={} k1={} scale={}",
        snapshot.generation,
        q.w,
        q.x,
        q.y,
        q.z,
        snapshot.distortion.k0,
        snapshot.distortion.k1,
        snapshot.distortion_scale
    );
}

fn parse_value<T: FromStr>(args: &[String], i: &mut usize, flag: &str) -> Result<T, MonitorError>
where
    T::Err: std::fmt::Display,
{
    *i += 1;
    let raw = args
        .get(*i)
        .ok_or_else(|| MonitorError::Usage(format!("missing value for {flag}")))?;
    raw.parse()
        .map_err(|e| MonitorError::Usage(format!("invalid value for {flag}: {e}")))
}

fn parse_args(args: &[String]) -> Result<Options, MonitorError> {
    let mut segment = DEFAULT_SEGMENT_PATH.to_owned();
    let mut own = false;
    let mut interval_ms = DEFAULT_INTERVAL_MS;
    let (mut k0, mut k1, mut scale) = (None, None, None);

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--segment" | "-s" => segment = parse_value(args, &mut i, "--segment")?,
            "--own" | "-o" => own = true,
            "--interval" | "-i" => interval_ms = parse_value(args, &mut i, "--interval")?,
            "--k0" => k0 = Some(parse_value(args, &mut i, "--k0")?),
            "--k1" => k1 = Some(parse_value(args, &mut i, "--k1")?),
            "--scale" => scale = Some(parse_value(args, &mut i, "--scale")?),
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            arg => return Err(MonitorError::Usage(format!("unknown argument: {arg}"))),
        }
        i += 1;
    }

    Ok(Options {
        segment: ShmPath::new(segment)?,
        own,
        interval: Duration::from_millis(interval_ms.max(1)),
        k0,
        k1,
        scale,
    })
}

fn print_usage() {
    eprintln!(
        r#"spvr-monitor - SmartPhoneVR control channel monitor

USAGE:
    spvr-monitor [OPTIONS]

OPTIONS:
    -s, --segment <PATH>    Shared memory name (default: /spvr-control)
    -o, --own               Create and own the segment instead of attaching
                            (the driver must then run as an attacher)
    -i, --interval <MS>     Poll interval in milliseconds (default: 50)
        --k0 <F>            Set distortion coefficient k0 on start
        --k1 <F>            Set distortion coefficient k1 on start
        --scale <F>         Set distortion scale on start
    -h, --help              Print this help message

SIGNALS:
    SIGTERM, SIGINT         Stop and release the segment

ENVIRONMENT:
    RUST_LOG                Log filter when built with --features tracing
"#
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("spvr-monitor")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn defaults_attach_to_the_driver_owned_segment() {
        let options = parse_args(&args(&[])).unwrap();
        assert!(!options.own);
        assert_eq!(options.segment.as_str(), DEFAULT_SEGMENT_PATH);
        assert_eq!(options.interval, Duration::from_millis(DEFAULT_INTERVAL_MS));
        assert_eq!(
            spvr::DriverConfig::default().role,
            spvr::driver::SegmentRole::Owner
        );
    }

    #[test]
    fn own_and_distortion_flags() {
        let options = parse_args(&args(&["-o", "--k0", "0.3", "--scale", "0.9"])).unwrap();
        assert!(options.own);
        assert_eq!(options.k0, Some(0.3));
        assert_eq!(options.k1, None);
        assert_eq!(options.scale, Some(0.9));
    }

    #[test]
    fn bad_arguments_are_usage_errors() {
        assert!(matches!(
            parse_args(&args(&["--attach"])),
            Err(MonitorError::Usage(_))
        ));
        assert!(matches!(
            parse_args(&args(&["--k0"])),
            Err(MonitorError::Usage(_))
        ));
    }
}
