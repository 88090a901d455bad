//! Inter-process primitives.
//!
//! - `shmem`: typed POSIX shared memory mappings with creator/opener typestate.

pub mod shmem;
