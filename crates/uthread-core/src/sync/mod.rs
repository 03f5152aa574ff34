//! Building blocks shared by every primitive: the wait channel, the paired
//! 32-bit counter, low-level locks and the process-liveness oracle.

pub mod liveness;
pub mod lll;
pub mod paired;
pub mod waitchan;

pub use liveness::{LivenessOracle, ScriptedOracle, SystemOracle};
pub use paired::{Limb, PairedCounter};
pub use waitchan::{WaitFlags, WaitKey, WaitStatus, Waiter};
