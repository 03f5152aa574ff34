//! Thread records and lifecycle.
//!
//! A [`ThreadRecord`] exists for every thread the runtime knows about:
//! threads started with [`create`], plus foreign threads (the process's
//! main thread included) adopted the first time they call into the
//! runtime. The record's identity word doubles as the termination signal:
//! it is cleared to zero and broadcast when the thread finishes, and joiners
//! block on it.
//!
//! The `joiner` word is 0 while nobody joins, the record's own address once
//! detached, and the joiner's record address otherwise.

use std::cell::OnceCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};

use bitflags::bitflags;

use super::attr::{DEFAULT_GUARD_SIZE, ThreadAttr};
use super::cancel::{self, PTHREAD_CANCEL_DISABLE};
use super::cleanup;
use super::exit::ThreadExit;
use super::registry;
use super::tls;
use crate::errno;
use crate::sync::waitchan::{self, WaitFlags, Waiter};
use crate::time::{CLOCK_REALTIME, Timespec};

bitflags! {
    /// Per-thread state bits, kept in one atomic word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ThreadFlags: u32 {
        const USR_STACK = 1 << 0;
        const EXITING = 1 << 1;
        const CANCELLED = 1 << 2;
        const CANCELLING = 1 << 3;
        /// Resources collected by a join or a detach.
        const TERMINATED = 1 << 4;
        const CANCEL_ASYNC = 1 << 5;
        const CANCEL_DISABLE = 1 << 6;
        /// Inside the deferred-to-async window of a cancellation point.
        const CANCEL_TRANS = 1 << 7;
        const MAIN_THREAD = 1 << 8;
        /// Foreign thread adopted on first use.
        const ADOPTED = 1 << 9;
    }
}

impl ThreadFlags {
    const GONE: u32 =
        Self::CANCEL_DISABLE.bits() | Self::EXITING.bits() | Self::TERMINATED.bits();

    /// A cancellation is pending and enabled, and the thread is not exiting.
    #[must_use]
    pub const fn cancel_due(self) -> bool {
        self.bits() & (Self::GONE | Self::CANCELLED.bits()) == Self::CANCELLED.bits()
    }

    /// As [`Self::cancel_due`], with the thread in asynchronous mode.
    #[must_use]
    pub const fn async_cancel_due(self) -> bool {
        let want = Self::CANCEL_ASYNC.bits() | Self::CANCELLED.bits();
        self.bits() & (Self::GONE | want) == want
    }
}

// ---------------------------------------------------------------------------
// Thread record
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ThreadRecord {
    id: AtomicU32,
    flags: AtomicU32,
    joiner: AtomicUsize,
    retval: AtomicUsize,
    os_tid: AtomicI32,
    finished: AtomicBool,
    stack_size: usize,
    guard_size: usize,
    waiter: Arc<Waiter>,
}

impl ThreadRecord {
    fn new(stack_size: usize, guard_size: usize, flags: ThreadFlags, waiter: Arc<Waiter>) -> Self {
        Self {
            id: AtomicU32::new(0),
            flags: AtomicU32::new(flags.bits()),
            joiner: AtomicUsize::new(0),
            retval: AtomicUsize::new(0),
            os_tid: AtomicI32::new(0),
            finished: AtomicBool::new(false),
            stack_size,
            guard_size,
            waiter,
        }
    }

    /// An unlinked record with no identity.
    pub(crate) fn blank() -> Self {
        Self::new(0, 0, ThreadFlags::empty(), Arc::new(Waiter::new()))
    }

    /// Identity, or 0 once the thread has finished.
    #[inline]
    pub fn id(&self) -> u32 {
        self.id.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn flags(&self) -> ThreadFlags {
        ThreadFlags::from_bits_retain(self.flags.load(Ordering::SeqCst))
    }

    /// Applies `f` in a CAS loop; returns `(old, new)`.
    pub(crate) fn update_flags(
        &self,
        mut f: impl FnMut(ThreadFlags) -> ThreadFlags,
    ) -> (ThreadFlags, ThreadFlags) {
        let mut old = self.flags.load(Ordering::SeqCst);
        loop {
            let new = f(ThreadFlags::from_bits_retain(old)).bits();
            if new == old {
                let same = ThreadFlags::from_bits_retain(old);
                return (same, same);
            }
            match self
                .flags
                .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    return (
                        ThreadFlags::from_bits_retain(old),
                        ThreadFlags::from_bits_retain(new),
                    );
                }
                Err(seen) => old = seen,
            }
        }
    }

    fn set_flags(&self, bits: ThreadFlags) -> ThreadFlags {
        ThreadFlags::from_bits_retain(self.flags.fetch_or(bits.bits(), Ordering::SeqCst))
    }

    /// Address of the record, stable for its lifetime. Used as the
    /// detached-marker in `joiner` and as the C handle value.
    #[inline]
    pub fn addr(&self) -> usize {
        self as *const Self as usize
    }

    pub fn is_detached(&self) -> bool {
        self.joiner.load(Ordering::SeqCst) == self.addr()
    }

    /// Joined, or detached and finished: the handle no longer names a thread.
    pub fn is_reaped(&self) -> bool {
        self.flags().contains(ThreadFlags::TERMINATED)
    }

    pub fn is_main(&self) -> bool {
        self.flags().contains(ThreadFlags::MAIN_THREAD)
    }

    pub fn retval(&self) -> usize {
        self.retval.load(Ordering::SeqCst)
    }

    pub(crate) fn set_retval(&self, value: usize) {
        self.retval.store(value, Ordering::SeqCst);
    }

    /// Kernel thread id, 0 until the thread has started.
    pub fn os_tid(&self) -> i32 {
        self.os_tid.load(Ordering::SeqCst)
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    pub fn guard_size(&self) -> usize {
        self.guard_size
    }

    pub(crate) fn waiter(&self) -> &Arc<Waiter> {
        &self.waiter
    }

    /// Whether the thread is parked in a wait right now.
    pub fn is_blocked(&self) -> bool {
        self.waiter.is_parked()
    }
}

// ---------------------------------------------------------------------------
// Calling thread
// ---------------------------------------------------------------------------

struct Current {
    record: Arc<ThreadRecord>,
}

impl Drop for Current {
    fn drop(&mut self) {
        if self.record.flags().contains(ThreadFlags::ADOPTED) {
            finish(&self.record);
        }
    }
}

thread_local! {
    static CURRENT: OnceCell<Current> = const { OnceCell::new() };
}

fn os_tid() -> i32 {
    // SAFETY: gettid has no preconditions.
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

fn adopt() -> Current {
    let tid = os_tid();
    let main = i64::from(tid) == i64::from(std::process::id());
    let mut flags = ThreadFlags::ADOPTED | ThreadFlags::USR_STACK;
    if main {
        flags |= ThreadFlags::MAIN_THREAD;
    }
    let record = Arc::new(ThreadRecord::new(0, 0, flags, waitchan::current_waiter()));
    // Nobody can join a foreign thread except the main thread.
    if !main {
        record.joiner.store(record.addr(), Ordering::SeqCst);
    }
    record.os_tid.store(tid, Ordering::SeqCst);
    match registry::link(&record, main) {
        Ok(id) => record.id.store(id, Ordering::SeqCst),
        Err(e) => tracing::warn!(errno = e, "thread identities exhausted; adopted thread stays unlinked"),
    }
    tracing::trace!(id = record.id(), main, "adopted foreign thread");
    Current { record }
}

/// The calling thread's record, adopting the thread if needed.
pub fn current() -> Arc<ThreadRecord> {
    CURRENT
        .try_with(|slot| Arc::clone(&slot.get_or_init(adopt).record))
        .unwrap_or_else(|_| {
            let orphan = ThreadRecord::blank();
            orphan.set_flags(ThreadFlags::EXITING);
            Arc::new(orphan)
        })
}

/// Identity of the calling thread.
#[inline]
pub fn current_id() -> u32 {
    current().id()
}

// ---------------------------------------------------------------------------
// Creation and termination
// ---------------------------------------------------------------------------

/// Starts a thread running `start`; its return value becomes the thread's
/// exit value. `EAGAIN` if the OS refuses to spawn it.
pub fn create(
    attr: Option<&ThreadAttr>,
    start: impl FnOnce() -> usize + Send + 'static,
) -> Result<Arc<ThreadRecord>, i32> {
    let defaults;
    let attr = match attr {
        Some(attr) => attr,
        None => {
            defaults = ThreadAttr::new();
            &defaults
        }
    };

    let record = Arc::new(ThreadRecord::new(
        attr.stack_size(),
        attr.guard_size(),
        ThreadFlags::empty(),
        Arc::new(Waiter::new()),
    ));
    if attr.is_detached() {
        record.joiner.store(record.addr(), Ordering::SeqCst);
    }
    let id = registry::link(&record, false)?;
    record.id.store(id, Ordering::SeqCst);
    registry::live_inc();

    let mut builder = std::thread::Builder::new().stack_size(attr.stack_size());
    if let Some(name) = attr.name() {
        builder = builder.name(name.to_owned());
    }
    let child = Arc::clone(&record);
    match builder.spawn(move || entry(child, start)) {
        // The OS-level handle is not needed: joins wait on the identity word.
        Ok(_handle) => Ok(record),
        Err(err) => {
            tracing::warn!(%err, id, "thread spawn failed");
            registry::unlink(id);
            registry::live_dec();
            record.id.store(0, Ordering::SeqCst);
            record.set_flags(ThreadFlags::TERMINATED);
            Err(errno::EAGAIN)
        }
    }
}

fn entry(record: Arc<ThreadRecord>, start: impl FnOnce() -> usize) {
    waitchan::adopt_waiter(Arc::clone(&record.waiter));
    record.os_tid.store(os_tid(), Ordering::SeqCst);
    let _ = CURRENT.try_with(|slot| {
        slot.set(Current {
            record: Arc::clone(&record),
        })
    });

    match panic::catch_unwind(AssertUnwindSafe(start)) {
        Ok(value) => record.set_retval(value),
        Err(payload) => match payload.downcast::<ThreadExit>() {
            Ok(mut marker) => marker.disarm(),
            Err(other) => {
                tracing::error!(id = record.id(), "thread start routine panicked");
                record.set_flags(ThreadFlags::EXITING);
                cleanup::run_all();
                finish(&record);
                panic::resume_unwind(other);
            }
        },
    }
    finish(&record);
}

/// Tears a thread down: unlink, key destructors, then publish the zero
/// identity so joiners wake. Runs once per record.
pub(crate) fn finish(record: &ThreadRecord) {
    if record.finished.swap(true, Ordering::SeqCst) {
        return;
    }
    // EXITING goes up before the detach check: a concurrent detach either
    // lands first and is seen here, or sees EXITING and reaps itself.
    record.set_flags(ThreadFlags::EXITING);
    let detached = record.is_detached();
    let id = record.id();
    registry::unlink(id);
    tls::run_destructors();
    if !record.flags().contains(ThreadFlags::ADOPTED) {
        registry::live_dec();
    }
    if detached {
        record.set_flags(ThreadFlags::TERMINATED);
    }
    tracing::debug!(id, detached, "thread finished");
    record.id.store(0, Ordering::SeqCst);
    waitchan::wake_word(&record.id, WaitFlags::BROADCAST);
}

// ---------------------------------------------------------------------------
// Join / detach
// ---------------------------------------------------------------------------

fn check_joinable(target: &Arc<ThreadRecord>, me: &Arc<ThreadRecord>) -> Result<(), i32> {
    if target.is_reaped() {
        return Err(errno::ESRCH);
    }
    if target.is_detached() {
        return Err(errno::EINVAL);
    }
    if Arc::ptr_eq(target, me) || me.joiner.load(Ordering::SeqCst) == target.addr() {
        return Err(errno::EDEADLK);
    }
    Ok(())
}

fn claim_joiner(target: &ThreadRecord, me: &ThreadRecord) -> Result<(), i32> {
    target
        .joiner
        .compare_exchange(0, me.addr(), Ordering::SeqCst, Ordering::SeqCst)
        .map(|_| ())
        .map_err(|_| errno::EINVAL)
}

struct JoinClaim<'a> {
    target: &'a ThreadRecord,
    me: usize,
}

fn release_joiner(claim: &JoinClaim<'_>) {
    let _ = claim
        .target
        .joiner
        .compare_exchange(claim.me, 0, Ordering::SeqCst, Ordering::SeqCst);
}

fn reap(target: &ThreadRecord) -> usize {
    target.set_flags(ThreadFlags::TERMINATED);
    target.retval()
}

fn join_until(target: &Arc<ThreadRecord>, deadline: Option<&Timespec>) -> Result<usize, i32> {
    let me = current();
    check_joinable(target, &me)?;
    claim_joiner(target, &me)?;

    let claim = JoinClaim {
        target,
        me: me.addr(),
    };
    let waited = cleanup::with_cleanup(&claim, release_joiner, || -> Result<(), i32> {
        loop {
            let id = target.id();
            if id == 0 {
                return Ok(());
            }
            let timeout = match deadline {
                Some(abstime) => Some(abstime.remaining(CLOCK_REALTIME)?),
                None => None,
            };
            let prev = cancel::cancelpoint_begin();
            waitchan::wait(&target.id, id, timeout, WaitFlags::empty());
            cancel::cancelpoint_end(prev);
        }
    });
    match waited {
        Ok(()) => Ok(reap(target)),
        Err(e) => {
            release_joiner(&claim);
            Err(e)
        }
    }
}

/// Waits for `target` to finish and returns its exit value.
pub fn join(target: &Arc<ThreadRecord>) -> Result<usize, i32> {
    join_until(target, None)
}

/// [`join`] with an absolute `CLOCK_REALTIME` deadline. On `ETIMEDOUT` the
/// thread stays joinable.
pub fn timedjoin(target: &Arc<ThreadRecord>, abstime: &Timespec) -> Result<usize, i32> {
    join_until(target, Some(abstime))
}

/// Non-blocking join: `EBUSY` while `target` is still running.
pub fn tryjoin(target: &Arc<ThreadRecord>) -> Result<usize, i32> {
    let me = current();
    check_joinable(target, &me)?;
    if target.id() != 0 {
        return Err(errno::EBUSY);
    }
    claim_joiner(target, &me)?;
    Ok(reap(target))
}

/// Marks `target` detached. A thread already exiting is waited for and
/// collected here.
pub fn detach(target: &Arc<ThreadRecord>) -> i32 {
    if target.is_reaped() {
        return errno::ESRCH;
    }
    if target.is_detached() {
        return errno::EINVAL;
    }
    if target
        .joiner
        .compare_exchange(0, target.addr(), Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return errno::EINVAL;
    }
    if target.flags().contains(ThreadFlags::EXITING) {
        loop {
            let id = target.id();
            if id == 0 {
                break;
            }
            waitchan::wait(&target.id, id, None, WaitFlags::empty());
        }
        reap(target);
    }
    0
}

// ---------------------------------------------------------------------------
// Miscellaneous
// ---------------------------------------------------------------------------

static CONCURRENCY: AtomicI32 = AtomicI32::new(0);

#[must_use]
pub fn equal(a: &Arc<ThreadRecord>, b: &Arc<ThreadRecord>) -> bool {
    Arc::ptr_eq(a, b)
}

/// Identity of a live thread.
pub fn gettid_np(target: &ThreadRecord) -> Result<u32, i32> {
    match target.id() {
        0 => Err(errno::ESRCH),
        id => Ok(id),
    }
}

/// Calls `f` for every live thread; a negative return stops the walk and
/// is returned. Cancellation is disabled for the duration of the walk.
pub fn foreach_np(f: impl FnMut(&Arc<ThreadRecord>) -> i32) -> i32 {
    let _ = current();
    let prev = cancel::setcancelstate(PTHREAD_CANCEL_DISABLE).unwrap_or(PTHREAD_CANCEL_DISABLE);
    let ret = registry::walk(f);
    let _ = cancel::setcancelstate(prev);
    ret
}

/// Aborts `target`'s current blocking wait without cancelling it.
pub fn interrupt_np(target: &ThreadRecord) -> i32 {
    if target.id() == 0 {
        return errno::ESRCH;
    }
    target.waiter.interrupt();
    0
}

pub fn yield_now() {
    std::thread::yield_now();
}

pub fn setconcurrency(level: i32) -> i32 {
    if level < 0 {
        return errno::EINVAL;
    }
    CONCURRENCY.store(level, Ordering::Relaxed);
    0
}

#[must_use]
pub fn getconcurrency() -> i32 {
    CONCURRENCY.load(Ordering::Relaxed)
}

pub fn getschedparam(_target: &ThreadRecord) -> i32 {
    errno::ENOSYS
}

pub fn setschedparam(_target: &ThreadRecord, _priority: i32) -> i32 {
    errno::ENOSYS
}

pub fn setschedprio(_target: &ThreadRecord, _priority: i32) -> i32 {
    errno::ENOSYS
}

/// Guard size a record gets when its attribute did not specify one.
pub const fn default_guard_size() -> usize {
    DEFAULT_GUARD_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn flag_predicates() {
        let c = ThreadFlags::CANCELLED;
        assert!(c.cancel_due());
        assert!(!c.async_cancel_due());
        assert!((c | ThreadFlags::CANCEL_ASYNC).async_cancel_due());
        assert!(!(c | ThreadFlags::CANCEL_DISABLE).cancel_due());
        assert!(!(c | ThreadFlags::EXITING).cancel_due());
        assert!(!(c | ThreadFlags::CANCEL_ASYNC | ThreadFlags::TERMINATED).async_cancel_due());
        assert!(!ThreadFlags::CANCEL_ASYNC.async_cancel_due());
    }

    #[test]
    fn create_and_join_returns_value() {
        let t = create(None, || 42).unwrap();
        assert_ne!(t.id(), 0);
        assert_eq!(join(&t), Ok(42));
        assert!(t.is_reaped());
        assert_eq!(join(&t), Err(errno::ESRCH));
        assert_eq!(detach(&t), errno::ESRCH);
    }

    #[test]
    fn self_join_is_deadlock() {
        let (tx, rx) = mpsc::channel();
        let t = create(None, move || {
            let me = current();
            tx.send(join(&me)).unwrap();
            0
        })
        .unwrap();
        assert_eq!(rx.recv().unwrap(), Err(errno::EDEADLK));
        join(&t).unwrap();
    }

    #[test]
    fn second_joiner_is_rejected() {
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let t = create(None, move || {
            go_rx.recv().unwrap();
            7
        })
        .unwrap();
        let t2 = Arc::clone(&t);
        let first = std::thread::spawn(move || join(&t2));
        while t.joiner.load(Ordering::SeqCst) == 0 {
            std::thread::yield_now();
        }
        assert_eq!(join(&t), Err(errno::EINVAL));
        assert_eq!(tryjoin(&t), Err(errno::EBUSY));
        go_tx.send(()).unwrap();
        assert_eq!(first.join().unwrap(), Ok(7));
    }

    #[test]
    fn tryjoin_busy_then_ok() {
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let t = create(None, move || {
            go_rx.recv().unwrap();
            5
        })
        .unwrap();
        assert_eq!(tryjoin(&t), Err(errno::EBUSY));
        go_tx.send(()).unwrap();
        while t.id() != 0 {
            std::thread::yield_now();
        }
        assert_eq!(tryjoin(&t), Ok(5));
    }

    #[test]
    fn timedjoin_times_out_and_stays_joinable() {
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let t = create(None, move || {
            go_rx.recv().unwrap();
            9
        })
        .unwrap();
        let deadline = Timespec::after(CLOCK_REALTIME, Duration::from_millis(30));
        assert_eq!(timedjoin(&t, &deadline), Err(errno::ETIMEDOUT));
        assert_eq!(t.joiner.load(Ordering::SeqCst), 0);
        go_tx.send(()).unwrap();
        assert_eq!(join(&t), Ok(9));
    }

    #[test]
    fn detached_threads_cannot_be_joined() {
        let mut attr = ThreadAttr::new();
        attr.set_detach_state(super::super::attr::PTHREAD_CREATE_DETACHED);
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let t = create(Some(&attr), move || {
            go_rx.recv().unwrap();
            0
        })
        .unwrap();
        assert!(t.is_detached());
        assert_eq!(join(&t), Err(errno::EINVAL));
        assert_eq!(detach(&t), errno::EINVAL);
        go_tx.send(()).unwrap();
        while !t.is_reaped() {
            std::thread::yield_now();
        }
        assert_eq!(gettid_np(&t), Err(errno::ESRCH));
    }

    #[test]
    fn detach_racing_exit_always_reaps() {
        for _ in 0..2000 {
            let t = create(None, || 0).unwrap();
            assert_eq!(detach(&t), 0);
            while t.id() != 0 {
                std::thread::yield_now();
            }
            // Either the exiting thread saw the detach and marked itself
            // reaped before clearing its id, or detach saw EXITING and
            // reaped before returning.
            assert!(t.is_reaped());
            assert_eq!(detach(&t), errno::ESRCH);
            assert_eq!(join(&t), Err(errno::ESRCH));
        }
    }

    #[test]
    fn detach_after_finish_collects() {
        let t = create(None, || 1).unwrap();
        while t.id() != 0 {
            std::thread::yield_now();
        }
        assert_eq!(detach(&t), 0);
        assert!(t.is_reaped());
    }

    #[test]
    fn registry_tracks_running_threads() {
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let t = create(None, move || {
            go_rx.recv().unwrap();
            0
        })
        .unwrap();
        let id = gettid_np(&t).unwrap();
        assert!(registry::lookup(id).is_some_and(|r| Arc::ptr_eq(&r, &t)));
        let mut found = false;
        foreach_np(|r| {
            if Arc::ptr_eq(r, &t) {
                found = true;
                return -1;
            }
            0
        });
        assert!(found);
        go_tx.send(()).unwrap();
        join(&t).unwrap();
        assert!(registry::lookup(id).is_none_or(|r| !Arc::ptr_eq(&r, &t)));
    }

    #[test]
    fn current_is_stable_and_adopted() {
        let a = current();
        let b = current();
        assert!(equal(&a, &b));
        assert!(a.flags().contains(ThreadFlags::ADOPTED));
        assert_ne!(a.id(), 0);
        assert!(a.os_tid() > 0);
    }

    #[test]
    fn concurrency_hint() {
        assert_eq!(setconcurrency(-1), errno::EINVAL);
        assert_eq!(setconcurrency(3), 0);
        assert_eq!(getconcurrency(), 3);
        assert_eq!(setconcurrency(0), 0);
    }

    #[test]
    fn sched_params_are_unsupported() {
        let me = current();
        assert_eq!(getschedparam(&me), errno::ENOSYS);
        assert_eq!(setschedparam(&me, 1), errno::ENOSYS);
        assert_eq!(setschedprio(&me, 1), errno::ENOSYS);
    }

    #[test]
    fn stack_attributes_are_recorded() {
        let mut attr = ThreadAttr::new();
        attr.set_stack_size(256 * 1024);
        attr.set_guard_size(8192);
        let t = create(Some(&attr), || 0).unwrap();
        assert_eq!(t.stack_size(), 256 * 1024);
        assert_eq!(t.guard_size(), 8192);
        join(&t).unwrap();
        assert_eq!(default_guard_size(), DEFAULT_GUARD_SIZE);
    }
}
