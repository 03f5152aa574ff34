//! uthread-core: a POSIX-style user-space threading runtime.
//!
//! Every primitive is a lock-free compare-and-swap state machine over
//! atomics; blocking goes through the address-keyed wait channel in
//! [`sync::waitchan`]. Operations return POSIX errno-style integers
//! (0 on success) so the C ABI crate can forward them unchanged.

#![deny(unsafe_code)]

pub mod config;
pub mod errno;
#[allow(unsafe_code)]
pub mod pthread;
#[allow(unsafe_code)]
pub mod sync;
#[allow(unsafe_code)]
pub mod time;

pub use config::{RuntimeConfig, SafetyLevel};
pub use errno::ErrorKind;
pub use time::Timespec;
