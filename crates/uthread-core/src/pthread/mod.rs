//! POSIX threads.
//!
//! Thread lifecycle, cancellation and the synchronization objects of
//! `<pthread.h>` and `<semaphore.h>`, all built on [`crate::sync`].

pub mod attr;
pub mod barrier;
pub mod cancel;
pub mod cleanup;
pub mod cond;
pub mod exit;
pub mod mutex;
pub mod once;
pub mod registry;
pub mod rwlock;
pub mod sem;
pub mod spin;
pub mod thread;
pub mod tls;

pub use attr::{
    BarrierAttr, CondAttr, MutexAttr, PTHREAD_CREATE_DETACHED, PTHREAD_CREATE_JOINABLE,
    PTHREAD_MUTEX_DEFAULT, PTHREAD_MUTEX_ERRORCHECK, PTHREAD_MUTEX_NORMAL,
    PTHREAD_MUTEX_RECURSIVE, PTHREAD_MUTEX_ROBUST, PTHREAD_MUTEX_STALLED,
    PTHREAD_PROCESS_PRIVATE, PTHREAD_PROCESS_SHARED, PTHREAD_STACK_MIN, RwLockAttr, ThreadAttr,
};
pub use barrier::{Barrier, PTHREAD_BARRIER_SERIAL_THREAD};
pub use cancel::{
    PTHREAD_CANCEL_ASYNCHRONOUS, PTHREAD_CANCEL_DEFERRED, PTHREAD_CANCEL_DISABLE,
    PTHREAD_CANCEL_ENABLE, cancel, setcancelstate, setcanceltype, testcancel,
};
pub use cleanup::with_cleanup;
pub use cond::{Cond, PTHREAD_COND_CLOCK_MONOTONIC, PTHREAD_COND_CLOCK_REALTIME};
pub use exit::{PTHREAD_CANCELED, exit};
pub use mutex::Mutex;
pub use once::Once;
pub use rwlock::RwLock;
pub use sem::{SEM_VALUE_MAX, Semaphore};
pub use spin::SpinLock;
pub use thread::{
    ThreadFlags, ThreadRecord, create, current, detach, equal, join, timedjoin, tryjoin,
};
pub use tls::{PTHREAD_DESTRUCTOR_ITERATIONS, PTHREAD_KEYS_MAX};
