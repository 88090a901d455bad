//! Latest-value pose and lens state shared between processes.
//!
//! All fields are `f32` bit patterns in atomics guarded by a seqlock. The
//! 64-bit `sequence` word holds the generation in its low half and the pid of
//! the process that last claimed it in its high half. Writers CAS the
//! generation from even to odd (stamping their pid in the same step), store,
//! then CAS their own stamped word to the next even value. Readers retry until
//! they load the same even word before and after reading.
//!
//! A generation that stays odd for [`STALE_WRITER_TIMEOUT`] is checked against
//! its stamped pid. A live writer is waited for. A dead one has its update
//! completed as-is by whichever reader or writer notices first.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering, fence};
use std::time::Duration;

use glam::Quat;
use minstant::Instant;
use rustix::io::Errno;
use rustix::process::{Pid, test_kill_process};
use serde::{Deserialize, Serialize};

use crate::ipc::shmem::SharedMemorySafe;
use crate::trace::warn;

/// Radial distortion pair used until a control process configures one.
pub const DEFAULT_DISTORTION: DistortionCoefficients = DistortionCoefficients {
    k0: 0.441,
    k1: 0.156,
};

pub const DEFAULT_DISTORTION_SCALE: f32 = 1.0;

/// How long an odd generation may persist before its writer's pid is checked.
pub const STALE_WRITER_TIMEOUT: Duration = Duration::from_millis(50);

/// Lens radial-distortion coefficients.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistortionCoefficients {
    pub k0: f32,
    pub k1: f32,
}

impl Default for DistortionCoefficients {
    fn default() -> Self {
        DEFAULT_DISTORTION
    }
}

/// A consistent copy of every field, tagged with the generation it was read at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateSnapshot {
    pub rotation: Quat,
    pub distortion: DistortionCoefficients,
    pub distortion_scale: f32,
    /// Even; grows by two with every completed write.
    pub generation: u32,
}

#[repr(C)]
#[repr(align(64))]
pub struct ChannelState {
    /// writer pid << 32 | generation
    sequence: AtomicU64,
    /// w, x, y, z
    rotation: [AtomicU32; 4],
    distortion: [AtomicU32; 2],
    distortion_scale: AtomicU32,
}

// SAFETY: repr(C) atomics only; concurrent access follows the seqlock protocol.
unsafe impl SharedMemorySafe for ChannelState {}

impl Default for ChannelState {
    fn default() -> Self {
        let bits = |v: f32| AtomicU32::new(v.to_bits());
        Self {
            sequence: AtomicU64::new(0),
            rotation: [bits(1.0), bits(0.0), bits(0.0), bits(0.0)],
            distortion: [bits(DEFAULT_DISTORTION.k0), bits(DEFAULT_DISTORTION.k1)],
            distortion_scale: bits(DEFAULT_DISTORTION_SCALE),
        }
    }
}

fn store(cell: &AtomicU32, value: f32) {
    cell.store(value.to_bits(), Ordering::Relaxed);
}

fn load(cell: &AtomicU32) -> f32 {
    f32::from_bits(cell.load(Ordering::Relaxed))
}

const fn pack(writer: u32, generation: u32) -> u64 {
    ((writer as u64) << 32) | generation as u64
}

const fn generation_of(word: u64) -> u32 {
    word as u32
}

const fn writer_of(word: u64) -> u32 {
    (word >> 32) as u32
}

/// `kill(pid, 0)` says the process is gone. An unstamped word counts as dead.
fn writer_is_dead(writer: u32) -> bool {
    match i32::try_from(writer).ok().and_then(Pid::from_raw) {
        Some(pid) => test_kill_process(pid) == Err(Errno::SRCH),
        None => true,
    }
}

/// Starts (or continues) the stall clock and reports whether it ran out.
fn stalled(since: &mut Option<Instant>) -> bool {
    since.get_or_insert_with(Instant::now).elapsed() >= STALE_WRITER_TIMEOUT
}

impl ChannelState {
    pub fn set_rotation(&self, rotation: Quat) {
        self.write(|state| {
            store(&state.rotation[0], rotation.w);
            store(&state.rotation[1], rotation.x);
            store(&state.rotation[2], rotation.y);
            store(&state.rotation[3], rotation.z);
        });
    }

    pub fn set_distortion_coefficients(&self, coefficients: DistortionCoefficients) {
        self.write(|state| {
            store(&state.distortion[0], coefficients.k0);
            store(&state.distortion[1], coefficients.k1);
        });
    }

    pub fn set_distortion_scale(&self, scale: f32) {
        self.write(|state| store(&state.distortion_scale, scale));
    }

    #[must_use]
    pub fn rotation(&self) -> Quat {
        self.snapshot().rotation
    }

    #[must_use]
    pub fn distortion_coefficients(&self) -> DistortionCoefficients {
        self.snapshot().distortion
    }

    #[must_use]
    pub fn distortion_scale(&self) -> f32 {
        self.snapshot().distortion_scale
    }

    /// Current generation; odd while a write is in progress.
    #[must_use]
    pub fn generation(&self) -> u32 {
        generation_of(self.sequence.load(Ordering::Acquire))
    }

    /// Reads every field as of one completed write.
    ///
    /// Blocks while a live writer is mid-update.
    #[must_use]
    pub fn snapshot(&self) -> StateSnapshot {
        let mut stall = None;
        loop {
            let before = self.sequence.load(Ordering::Acquire);
            let generation = generation_of(before);
            if generation & 1 == 0 {
                let snapshot = self.load_fields(generation);
                fence(Ordering::Acquire);
                if self.sequence.load(Ordering::Relaxed) == before {
                    return snapshot;
                }
            } else {
                self.wait_for_writer(before, &mut stall);
            }
            std::hint::spin_loop();
        }
    }

    fn load_fields(&self, generation: u32) -> StateSnapshot {
        StateSnapshot {
            rotation: Quat::from_xyzw(
                load(&self.rotation[1]),
                load(&self.rotation[2]),
                load(&self.rotation[3]),
                load(&self.rotation[0]),
            ),
            distortion: DistortionCoefficients {
                k0: load(&self.distortion[0]),
                k1: load(&self.distortion[1]),
            },
            distortion_scale: load(&self.distortion_scale),
            generation,
        }
    }

    fn write(&self, update: impl FnOnce(&Self)) {
        let claimed = self.begin_write();
        update(self);
        let published = pack(writer_of(claimed), generation_of(claimed).wrapping_add(1));
        if self
            .sequence
            .compare_exchange(claimed, published, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            warn!(
                generation = generation_of(claimed),
                "state update was recovered by another process before it finished"
            );
        }
    }

    /// Moves the generation from even to odd under this process's pid and
    /// returns the claimed word.
    fn begin_write(&self) -> u64 {
        let writer = std::process::id();
        let mut stall = None;
        loop {
            let current = self.sequence.load(Ordering::Relaxed);
            let generation = generation_of(current);
            if generation & 1 == 0 {
                let claimed = pack(writer, generation.wrapping_add(1));
                if self
                    .sequence
                    .compare_exchange_weak(current, claimed, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    // Keep the field stores below from becoming visible before
                    // the odd generation.
                    fence(Ordering::Release);
                    return claimed;
                }
            } else {
                self.wait_for_writer(current, &mut stall);
            }
            std::hint::spin_loop();
        }
    }

    /// Yields to the writer holding `word`; once it has stalled, checks
    /// whether its process is still alive.
    fn wait_for_writer(&self, word: u64, stall: &mut Option<Instant>) {
        if stalled(stall) {
            self.recover_abandoned(word);
            *stall = None;
        }
        std::thread::yield_now();
    }

    /// Publishes the odd generation in `word` if its writer process is dead.
    /// Fields keep whatever the dead writer stored.
    fn recover_abandoned(&self, word: u64) {
        let writer = writer_of(word);
        if !writer_is_dead(writer) {
            return;
        }
        let recovered = pack(std::process::id(), generation_of(word).wrapping_add(1));
        if self
            .sequence
            .compare_exchange(word, recovered, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            warn!(
                writer,
                generation = generation_of(word),
                "completed state update abandoned by a dead writer"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::process::Command;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    #[test]
    fn defaults() {
        let state = ChannelState::default();
        let snapshot = state.snapshot();
        assert_eq!(snapshot.rotation, Quat::IDENTITY);
        assert_eq!(snapshot.distortion, DEFAULT_DISTORTION);
        assert_eq!(snapshot.distortion_scale, 1.0);
        assert_eq!(snapshot.generation, 0);
    }

    #[test]
    fn rotation_keeps_component_order() {
        let state = ChannelState::default();
        let q = Quat::from_xyzw(0.1, 0.2, 0.3, 0.9);
        state.set_rotation(q);
        let back = state.rotation();
        assert_eq!((back.x, back.y, back.z, back.w), (0.1, 0.2, 0.3, 0.9));
    }

    #[test]
    fn every_write_advances_generation_by_two() {
        let state = ChannelState::default();
        state.set_rotation(Quat::IDENTITY);
        assert_eq!(state.generation(), 2);
        state.set_distortion_coefficients(DistortionCoefficients { k0: 0.3, k1: 0.1 });
        state.set_distortion_scale(0.8);
        assert_eq!(state.generation(), 6);

        let snapshot = state.snapshot();
        assert_eq!(snapshot.generation, 6);
        assert_eq!(snapshot.distortion, DistortionCoefficients { k0: 0.3, k1: 0.1 });
        assert_eq!(snapshot.distortion_scale, 0.8);
    }

    #[test]
    fn generation_wraps_without_losing_parity() {
        let state = ChannelState::default();
        state.sequence.store(pack(0, u32::MAX - 1), Ordering::Relaxed);
        state.set_distortion_scale(2.0);
        assert_eq!(state.generation(), 0);
        assert_eq!(state.distortion_scale(), 2.0);
    }

    #[test]
    fn writes_are_stamped_with_this_process() {
        let state = ChannelState::default();
        state.set_distortion_scale(0.5);
        let word = state.sequence.load(Ordering::Relaxed);
        assert_eq!(writer_of(word), std::process::id());
        assert_eq!(generation_of(word), 2);
    }

    /// Pid of a child that has exited and been reaped.
    fn dead_pid() -> u32 {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    #[test]
    fn dead_writer_is_recovered() {
        let state = ChannelState::default();
        // A writer process that crashed mid-update.
        state.sequence.store(pack(dead_pid(), 7), Ordering::Relaxed);

        let started = std::time::Instant::now();
        let snapshot = state.snapshot();
        assert!(started.elapsed() >= STALE_WRITER_TIMEOUT);
        assert_eq!(snapshot.generation, 8);

        state.set_distortion_scale(1.5);
        assert_eq!(state.generation(), 10);
        assert_eq!(state.distortion_scale(), 1.5);
    }

    #[test]
    fn live_foreign_writer_is_never_taken_over() {
        let mut child = Command::new("sleep").arg("5").spawn().unwrap();
        let writer = child.id();
        let state = Arc::new(ChannelState::default());
        state.sequence.store(pack(writer, 7), Ordering::Relaxed);

        let finisher = {
            let state = Arc::clone(&state);
            thread::spawn(move || {
                thread::sleep(STALE_WRITER_TIMEOUT * 4);
                state.distortion_scale.store(3.0f32.to_bits(), Ordering::Relaxed);
                state.sequence.store(pack(writer, 8), Ordering::Release);
            })
        };

        let started = std::time::Instant::now();
        let snapshot = state.snapshot();
        assert!(started.elapsed() >= STALE_WRITER_TIMEOUT * 4);
        assert_eq!(snapshot.generation, 8);
        assert_eq!(snapshot.distortion_scale, 3.0);
        assert_eq!(writer_of(state.sequence.load(Ordering::Relaxed)), writer);

        finisher.join().unwrap();
        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn slow_live_writer_blocks_readers_and_writers() {
        let state = Arc::new(ChannelState::default());
        let slow = {
            let state = Arc::clone(&state);
            thread::spawn(move || {
                state.write(|s| {
                    store(&s.rotation[0], 0.5);
                    store(&s.rotation[1], 0.5);
                    thread::sleep(STALE_WRITER_TIMEOUT * 4);
                    store(&s.rotation[2], 0.5);
                    store(&s.rotation[3], 0.5);
                });
            })
        };
        while state.generation() & 1 == 0 {
            thread::yield_now();
        }

        let fast = {
            let state = Arc::clone(&state);
            thread::spawn(move || state.set_rotation(Quat::from_xyzw(0.0, 0.0, 1.0, 0.0)))
        };

        let snapshot = state.snapshot();
        assert_eq!(snapshot.generation & 1, 0);
        assert!(snapshot.generation >= 2);
        let q = snapshot.rotation;
        let whole_slow = (q.x, q.y, q.z, q.w) == (0.5, 0.5, 0.5, 0.5);
        let whole_fast = (q.x, q.y, q.z, q.w) == (0.0, 0.0, 1.0, 0.0);
        assert!(whole_slow || whole_fast, "torn read: {q:?}");

        slow.join().unwrap();
        fast.join().unwrap();
        assert_eq!(state.generation(), 4);
        assert_eq!(state.rotation(), Quat::from_xyzw(0.0, 0.0, 1.0, 0.0));
    }

    #[test]
    fn readers_never_see_torn_rotation() {
        let state = Arc::new(ChannelState::default());
        state.set_rotation(Quat::from_xyzw(0.0, 0.0, 0.0, 0.0));
        let done = Arc::new(AtomicBool::new(false));

        let writer = {
            let state = Arc::clone(&state);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut v = 0.0f32;
                while !done.load(Ordering::Relaxed) {
                    v += 1.0;
                    state.set_rotation(Quat::from_xyzw(v, v, v, v));
                }
            })
        };

        let mut last_generation = 0;
        for _ in 0..100_000 {
            let snapshot = state.snapshot();
            let q = snapshot.rotation;
            assert!(q.x == q.y && q.y == q.z && q.z == q.w, "torn read: {q:?}");
            assert_eq!(snapshot.generation & 1, 0);
            assert!(snapshot.generation.wrapping_sub(last_generation) < u32::MAX / 2);
            last_generation = snapshot.generation;
        }
        done.store(true, Ordering::Relaxed);
        writer.join().unwrap();
    }
}
