//! Attribute objects for threads and synchronization primitives.
//!
//! Attributes are plain values copied into the object at init time. Every
//! setter validates its argument and returns `EINVAL` for anything outside
//! the documented set; getters cannot fail.

use crate::config;
use crate::errno;
use crate::time::{CLOCK_MONOTONIC, CLOCK_REALTIME, valid_clock_id};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Smallest stack a thread may be created with.
pub const PTHREAD_STACK_MIN: usize = 16384;
/// Guard size used when none is requested.
pub const DEFAULT_GUARD_SIZE: usize = 4096;

pub const PTHREAD_CREATE_JOINABLE: i32 = 0;
pub const PTHREAD_CREATE_DETACHED: i32 = 1;

pub const PTHREAD_PROCESS_PRIVATE: i32 = 0;
pub const PTHREAD_PROCESS_SHARED: i32 = 1;

pub const PTHREAD_MUTEX_NORMAL: i32 = 0;
pub const PTHREAD_MUTEX_RECURSIVE: i32 = 1;
pub const PTHREAD_MUTEX_ERRORCHECK: i32 = 2;
pub const PTHREAD_MUTEX_DEFAULT: i32 = PTHREAD_MUTEX_NORMAL;
/// One past the last valid type. Destroyed mutexes carry this type.
pub const PTHREAD_MUTEX_TYPE_MAX: i32 = 3;

pub const PTHREAD_MUTEX_STALLED: i32 = 0;
pub const PTHREAD_MUTEX_ROBUST: i32 = 0x100;

pub const PTHREAD_PRIO_NONE: i32 = 0;
pub const PTHREAD_PRIO_INHERIT: i32 = 1;
pub const PTHREAD_PRIO_PROTECT: i32 = 2;

/// Attribute flag bit: object is process-shared. Matches `WaitFlags::SHARED`.
pub const ATTR_SHARED: u32 = 0x01;
/// Attribute flag bit: mutex is robust.
pub const ATTR_ROBUST: u32 = PTHREAD_MUTEX_ROBUST as u32;

// ---------------------------------------------------------------------------
// Validators
// ---------------------------------------------------------------------------

#[must_use]
pub const fn valid_mutex_type(kind: i32) -> bool {
    kind >= 0 && kind < PTHREAD_MUTEX_TYPE_MAX
}

#[must_use]
pub const fn valid_pshared(pshared: i32) -> bool {
    matches!(pshared, PTHREAD_PROCESS_PRIVATE | PTHREAD_PROCESS_SHARED)
}

#[must_use]
pub const fn valid_robustness(robust: i32) -> bool {
    matches!(robust, PTHREAD_MUTEX_STALLED | PTHREAD_MUTEX_ROBUST)
}

#[must_use]
pub const fn valid_detach_state(state: i32) -> bool {
    matches!(state, PTHREAD_CREATE_JOINABLE | PTHREAD_CREATE_DETACHED)
}

/// Errno for a mutex protocol request: only `PRIO_NONE` is implemented.
#[must_use]
pub const fn protocol_errno(protocol: i32) -> i32 {
    match protocol {
        PTHREAD_PRIO_NONE => 0,
        PTHREAD_PRIO_INHERIT | PTHREAD_PRIO_PROTECT => errno::ENOSYS,
        _ => errno::EINVAL,
    }
}

#[inline]
const fn shared_bit(pshared: i32) -> u32 {
    if pshared == PTHREAD_PROCESS_SHARED {
        ATTR_SHARED
    } else {
        0
    }
}

#[inline]
const fn pshared_of(flags: u32) -> i32 {
    if flags & ATTR_SHARED != 0 {
        PTHREAD_PROCESS_SHARED
    } else {
        PTHREAD_PROCESS_PRIVATE
    }
}

// ---------------------------------------------------------------------------
// Mutex attributes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutexAttr {
    kind: i32,
    flags: u32,
}

impl Default for MutexAttr {
    fn default() -> Self {
        Self {
            kind: PTHREAD_MUTEX_DEFAULT,
            flags: 0,
        }
    }
}

impl MutexAttr {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_type(&mut self, kind: i32) -> i32 {
        if !valid_mutex_type(kind) {
            return errno::EINVAL;
        }
        self.kind = kind;
        0
    }

    #[must_use]
    pub fn kind(&self) -> i32 {
        self.kind
    }

    pub fn set_pshared(&mut self, pshared: i32) -> i32 {
        if !valid_pshared(pshared) {
            return errno::EINVAL;
        }
        self.flags = (self.flags & !ATTR_SHARED) | shared_bit(pshared);
        0
    }

    #[must_use]
    pub fn pshared(&self) -> i32 {
        pshared_of(self.flags)
    }

    pub fn set_robust(&mut self, robust: i32) -> i32 {
        if !valid_robustness(robust) {
            return errno::EINVAL;
        }
        self.flags = (self.flags & !ATTR_ROBUST) | robust as u32;
        0
    }

    #[must_use]
    pub fn robust(&self) -> i32 {
        if self.flags & ATTR_ROBUST != 0 {
            PTHREAD_MUTEX_ROBUST
        } else {
            PTHREAD_MUTEX_STALLED
        }
    }

    pub fn set_protocol(&mut self, protocol: i32) -> i32 {
        protocol_errno(protocol)
    }

    #[must_use]
    pub fn protocol(&self) -> i32 {
        PTHREAD_PRIO_NONE
    }

    pub fn set_prioceiling(&mut self, _ceiling: i32) -> i32 {
        errno::ENOSYS
    }

    pub fn prioceiling(&self) -> Result<i32, i32> {
        Err(errno::ENOSYS)
    }

    #[must_use]
    pub(crate) fn flags(&self) -> u32 {
        self.flags
    }
}

// ---------------------------------------------------------------------------
// Condition variable attributes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CondAttr {
    flags: u32,
    clock: i32,
}

impl Default for CondAttr {
    fn default() -> Self {
        Self {
            flags: 0,
            clock: CLOCK_REALTIME,
        }
    }
}

impl CondAttr {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_pshared(&mut self, pshared: i32) -> i32 {
        if !valid_pshared(pshared) {
            return errno::EINVAL;
        }
        self.flags = shared_bit(pshared);
        0
    }

    #[must_use]
    pub fn pshared(&self) -> i32 {
        pshared_of(self.flags)
    }

    /// Selects the clock timed waits measure deadlines against.
    pub fn set_clock(&mut self, clock_id: i32) -> i32 {
        if !valid_clock_id(clock_id) {
            return errno::EINVAL;
        }
        self.clock = clock_id;
        0
    }

    #[must_use]
    pub fn clock(&self) -> i32 {
        self.clock
    }

    #[must_use]
    pub(crate) fn flags(&self) -> u32 {
        self.flags
    }
}

// ---------------------------------------------------------------------------
// Read-write lock and barrier attributes (pshared only)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SharedAttr {
    flags: u32,
}

impl SharedAttr {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_pshared(&mut self, pshared: i32) -> i32 {
        if !valid_pshared(pshared) {
            return errno::EINVAL;
        }
        self.flags = shared_bit(pshared);
        0
    }

    #[must_use]
    pub fn pshared(&self) -> i32 {
        pshared_of(self.flags)
    }

    #[must_use]
    pub(crate) fn flags(&self) -> u32 {
        self.flags
    }
}

pub type RwLockAttr = SharedAttr;
pub type BarrierAttr = SharedAttr;

// ---------------------------------------------------------------------------
// Thread attributes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadAttr {
    detach_state: i32,
    stack_size: usize,
    guard_size: usize,
    name: Option<String>,
}

impl Default for ThreadAttr {
    fn default() -> Self {
        Self {
            detach_state: PTHREAD_CREATE_JOINABLE,
            stack_size: config::runtime_config().default_stack_size,
            guard_size: DEFAULT_GUARD_SIZE,
            name: None,
        }
    }
}

impl ThreadAttr {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_detach_state(&mut self, state: i32) -> i32 {
        if !valid_detach_state(state) {
            return errno::EINVAL;
        }
        self.detach_state = state;
        0
    }

    #[must_use]
    pub fn detach_state(&self) -> i32 {
        self.detach_state
    }

    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.detach_state == PTHREAD_CREATE_DETACHED
    }

    pub fn set_stack_size(&mut self, size: usize) -> i32 {
        if size < PTHREAD_STACK_MIN {
            return errno::EINVAL;
        }
        self.stack_size = size;
        0
    }

    #[must_use]
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Recorded on the thread; placement is left to the OS thread service.
    pub fn set_guard_size(&mut self, size: usize) -> i32 {
        self.guard_size = size;
        0
    }

    #[must_use]
    pub fn guard_size(&self) -> usize {
        self.guard_size
    }

    /// Caller-supplied stacks are not supported.
    pub fn set_stack(&mut self, _addr: usize, _size: usize) -> i32 {
        errno::EINVAL
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

/// Clock ids accepted by [`CondAttr::set_clock`].
pub const COND_CLOCKS: [i32; 2] = [CLOCK_REALTIME, CLOCK_MONOTONIC];
