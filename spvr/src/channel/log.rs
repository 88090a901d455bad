//! Fixed-capacity text ring living inside the control segment.
//!
//! 64 slots of 256 bytes each. A line holds at most 255 bytes of UTF-8 text
//! followed by a NUL terminator. The ring is single-producer/single-consumer:
//! one side owns `write_index`, the other owns `read_index`, and the `unread`
//! counter hands slots back and forth with release/acquire ordering. Because
//! every field is an atomic or a protocol-owned cell, the two sides may live in
//! different processes.
//!
//! A full ring drops new lines instead of overwriting unread ones, so the
//! writer never blocks on a slow or absent reader.
//!
//! ```text
//!            read_index          write_index
//!                 │                   │
//!   ┌───┬───┬───┬─▼─┬───┬───┬───┬───┬─▼─┬───┐
//!   │   │   │   │ a │ b │ c │ d │ e │   │   │   unread = 5
//!   └───┴───┴───┴───┴───┴───┴───┴───┴───┴───┘
//! ```

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::ipc::shmem::SharedMemorySafe;

/// Number of line slots.
pub const LOG_CAPACITY: usize = 64;

/// Byte stride of one slot, terminator included.
pub const LINE_STRIDE: usize = 256;

/// Longest line stored without truncation, in bytes.
pub const MAX_LINE_LEN: usize = LINE_STRIDE - 1;

/// One line slot. Ownership alternates between writer and reader under the
/// `unread` hand-off.
#[repr(transparent)]
struct LineSlot(UnsafeCell<[u8; LINE_STRIDE]>);

impl LineSlot {
    const fn new() -> Self {
        Self(UnsafeCell::new([0; LINE_STRIDE]))
    }
}

// SAFETY: a slot is only written while it is not counted in `unread` and only
// read while it is, and the counter transitions are release/acquire, so the
// two sides never touch the same slot concurrently.
unsafe impl Sync for LineSlot {}

/// Writer-owned cursor, on its own cache line.
#[repr(C)]
#[repr(align(64))]
struct WriterState {
    write_index: AtomicU32,
}

/// Reader-owned cursor, on its own cache line.
#[repr(C)]
#[repr(align(64))]
struct ReaderState {
    read_index: AtomicU32,
}

/// Hand-off counter shared by both sides.
#[repr(C)]
#[repr(align(64))]
struct HandOff {
    unread: AtomicU32,
}

/// The log ring.
///
/// `push` and `pop` are `unsafe` because the ring cannot tell who is calling:
/// at most one thread, in any process, may act as writer and at most one as
/// reader at any moment. `ControlChannel` upholds this inside a process with its
/// mutex; across processes it holds by convention (the driver writes, the
/// monitor reads).
#[repr(C)]
pub struct LogRing {
    writer: WriterState,
    reader: ReaderState,
    hand_off: HandOff,
    slots: [LineSlot; LOG_CAPACITY],
}

// SAFETY: repr(C), atomics and byte arrays only, no pointers; concurrent
// access follows the SPSC protocol documented on the type.
unsafe impl SharedMemorySafe for LogRing {}

impl Default for LogRing {
    fn default() -> Self {
        Self {
            writer: WriterState {
                write_index: AtomicU32::new(0),
            },
            reader: ReaderState {
                read_index: AtomicU32::new(0),
            },
            hand_off: HandOff {
                unread: AtomicU32::new(0),
            },
            slots: [const { LineSlot::new() }; LOG_CAPACITY],
        }
    }
}

impl LogRing {
    /// Appends a line, truncating it to [`MAX_LINE_LEN`] bytes.
    ///
    /// Returns `false` and leaves the ring untouched when all slots are unread.
    ///
    /// # Safety
    ///
    /// No other thread or process may call `push` concurrently.
    pub unsafe fn push(&self, text: &str) -> bool {
        if self.hand_off.unread.load(Ordering::Acquire) as usize >= LOG_CAPACITY {
            return false;
        }

        // Reduced modulo capacity so a corrupted cursor from a peer process
        // can never index out of bounds.
        let index = self.writer.write_index.load(Ordering::Relaxed) as usize % LOG_CAPACITY;
        let line = truncate_to_boundary(text, MAX_LINE_LEN).as_bytes();

        // SAFETY: the slot is not unread, so the reader has released it (its
        // Release decrement pairs with our Acquire load) and we are the only
        // writer.
        let slot = unsafe { &mut *self.slots[index].0.get() };
        slot[..line.len()].copy_from_slice(line);
        slot[line.len()] = 0;

        self.writer
            .write_index
            .store(((index + 1) % LOG_CAPACITY) as u32, Ordering::Relaxed);
        self.hand_off.unread.fetch_add(1, Ordering::Release);
        true
    }

    /// Removes and returns the oldest unread line, or `""` when none is unread.
    ///
    /// Never blocks.
    ///
    /// # Safety
    ///
    /// No other thread or process may call `pop` concurrently.
    pub unsafe fn pop(&self) -> String {
        if self.hand_off.unread.load(Ordering::Acquire) == 0 {
            return String::new();
        }

        let index = self.reader.read_index.load(Ordering::Relaxed) as usize % LOG_CAPACITY;

        // SAFETY: the slot is unread, so the writer has published it (its
        // Release increment pairs with our Acquire load) and will not touch it
        // until we hand it back below.
        let slot = unsafe { &*self.slots[index].0.get() };
        let len = slot.iter().position(|&b| b == 0).unwrap_or(MAX_LINE_LEN);
        let line = String::from_utf8_lossy(&slot[..len]).into_owned();

        self.reader
            .read_index
            .store(((index + 1) % LOG_CAPACITY) as u32, Ordering::Relaxed);
        self.hand_off.unread.fetch_sub(1, Ordering::Release);
        line
    }

    /// Number of lines written but not yet read.
    #[must_use]
    pub fn unread(&self) -> usize {
        (self.hand_off.unread.load(Ordering::Acquire) as usize).min(LOG_CAPACITY)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.unread() == 0
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.unread() == LOG_CAPACITY
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        LOG_CAPACITY
    }
}

/// Longest prefix of `text` that fits in `limit` bytes without splitting a
/// UTF-8 sequence.
fn truncate_to_boundary(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
