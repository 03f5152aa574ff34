//! Reader-writer locks with writer preference.
//!
//! `own` holds (owner, holding readers): the owner is `UNOWNED`, the
//! `READERS` sentinel while readers hold the lock, or the writer's thread
//! identity. `queue` holds (queued writers, pending readers). Once a writer
//! is queued, new readers wait behind it; a thread that already holds a
//! read lock may still take another one, or it would deadlock against the
//! writer waiting for it.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU32, Ordering};

use super::attr::{ATTR_SHARED, RwLockAttr};
use super::thread;
use crate::errno;
use crate::sync::liveness;
use crate::sync::paired::{Limb, PairedCounter};
use crate::sync::waitchan::{self, WaitFlags, WaitKey};
use crate::time::{CLOCK_REALTIME, Timespec};

const UNOWNED: u32 = 0;
const READERS: u32 = 1 << 31;

thread_local! {
    /// Read locks held by this thread: (lock address, depth).
    static READ_HELD: RefCell<Vec<(usize, u32)>> = const { RefCell::new(Vec::new()) };
}

fn read_depth(addr: usize) -> u32 {
    READ_HELD
        .try_with(|held| {
            held.borrow()
                .iter()
                .find(|(a, _)| *a == addr)
                .map_or(0, |(_, d)| *d)
        })
        .unwrap_or(0)
}

fn adjust_read_depth(addr: usize, up: bool) {
    let _ = READ_HELD.try_with(|held| {
        let mut held = held.borrow_mut();
        match held.iter().position(|(a, _)| *a == addr) {
            Some(i) if up => held[i].1 += 1,
            Some(i) => {
                held[i].1 -= 1;
                if held[i].1 == 0 {
                    held.swap_remove(i);
                }
            }
            None if up => held.push((addr, 1)),
            None => {}
        }
    });
}

#[derive(Clone, Copy)]
enum Acquire<'a> {
    Block,
    Try,
    Until(&'a Timespec),
}

#[derive(Debug)]
pub struct RwLock {
    own: PairedCounter,
    queue: PairedCounter,
    shpid: AtomicU32,
    flags: AtomicU32,
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RwLock {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            own: PairedCounter::new(UNOWNED, 0),
            queue: PairedCounter::new(0, 0),
            shpid: AtomicU32::new(0),
            flags: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn with_attr(attr: &RwLockAttr) -> Self {
        let rw = Self::new();
        rw.flags.store(attr.flags(), Ordering::Relaxed);
        rw
    }

    pub fn init(&self, attr: Option<&RwLockAttr>) -> i32 {
        if self.busy() {
            return errno::EBUSY;
        }
        self.flags
            .store(attr.map_or(0, RwLockAttr::flags), Ordering::Relaxed);
        self.shpid.store(0, Ordering::Relaxed);
        0
    }

    pub fn destroy(&self) -> i32 {
        if self.busy() {
            return errno::EBUSY;
        }
        0
    }

    fn busy(&self) -> bool {
        self.own.load() != (UNOWNED, 0) || self.queue.load() != (0, 0)
    }

    /// Number of threads holding a read lock.
    #[must_use]
    pub fn readers(&self) -> u32 {
        self.own.hi()
    }

    #[must_use]
    pub fn queued_writers(&self) -> u32 {
        self.queue.lo()
    }

    #[must_use]
    pub fn pending_readers(&self) -> u32 {
        self.queue.hi()
    }

    fn addr(&self) -> usize {
        self as *const Self as usize
    }

    fn shared(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & ATTR_SHARED != 0
    }

    fn wait_flags(&self) -> WaitFlags {
        if self.shared() {
            WaitFlags::SHARED
        } else {
            WaitFlags::empty()
        }
    }

    fn reader_key(&self) -> WaitKey {
        WaitKey::of_limb(&self.own, Limb::Lo)
    }

    fn writer_key(&self) -> WaitKey {
        WaitKey::of_limb(&self.queue, Limb::Lo)
    }

    fn wake_readers(&self) {
        waitchan::wake(self.reader_key(), self.wait_flags() | WaitFlags::BROADCAST);
    }

    fn wake_writer(&self) {
        waitchan::wake(self.writer_key(), self.wait_flags());
    }

    fn write_owned_by(&self, owner: u32, me: u32) -> bool {
        owner == me
            && (!self.shared() || self.shpid.load(Ordering::SeqCst) == liveness::current_process())
    }

    fn readable(&self, held: bool) -> bool {
        let (owner, _) = self.own.load();
        let (writers, _) = self.queue.load();
        (owner == UNOWNED || owner == READERS) && (writers == 0 || held)
    }

    fn deadline(how: Acquire<'_>) -> Result<Option<std::time::Duration>, i32> {
        match how {
            Acquire::Until(abstime) => abstime.remaining(CLOCK_REALTIME).map(Some),
            _ => Ok(None),
        }
    }

    fn read_acquire(&self, how: Acquire<'_>) -> i32 {
        let me = thread::current_id();
        if self.write_owned_by(self.own.lo(), me) {
            return errno::EDEADLK;
        }
        let held = read_depth(self.addr()) > 0;
        let mut pending = false;
        loop {
            let (owner, readers) = self.own.load();
            if (owner == UNOWNED || owner == READERS)
                && (self.queue.lo() == 0 || held)
            {
                if self
                    .own
                    .compare_exchange((owner, readers), (READERS, readers + 1))
                    .is_ok()
                {
                    if pending {
                        self.queue.add_hi(-1);
                    }
                    adjust_read_depth(self.addr(), true);
                    return 0;
                }
                continue;
            }
            if matches!(how, Acquire::Try) {
                return errno::EBUSY;
            }
            let timeout = match Self::deadline(how) {
                Ok(timeout) => timeout,
                Err(e) => {
                    if pending {
                        self.queue.add_hi(-1);
                    }
                    return e;
                }
            };
            if !pending {
                // Re-check after registering so an unlock in between sees us.
                self.queue.add_hi(1);
                pending = true;
                continue;
            }
            waitchan::wait_while(
                self.reader_key(),
                || !self.readable(held),
                timeout,
                self.wait_flags(),
            );
        }
    }

    /// Drops one queued-writer registration.
    fn writer_dequeue(&self) {
        let (prev, _) = self.queue.add_lo(-1);
        let (owner, _) = self.own.load();
        let write_owned = owner != UNOWNED && owner != READERS;
        if prev == 1 {
            if !write_owned && self.queue.hi() > 0 {
                self.wake_readers();
            }
        } else if prev > 1 && owner == UNOWNED {
            // We may have swallowed the wakeup meant for the next writer.
            self.wake_writer();
        }
    }

    fn write_acquire(&self, how: Acquire<'_>) -> i32 {
        let me = thread::current_id();
        if self.write_owned_by(self.own.lo(), me) || read_depth(self.addr()) > 0 {
            return errno::EDEADLK;
        }
        let mut queued = false;
        loop {
            if self.own.compare_exchange((UNOWNED, 0), (me, 0)).is_ok() {
                if self.shared() {
                    self.shpid
                        .store(liveness::current_process(), Ordering::SeqCst);
                }
                if queued {
                    self.writer_dequeue();
                }
                return 0;
            }
            if matches!(how, Acquire::Try) {
                return errno::EBUSY;
            }
            let timeout = match Self::deadline(how) {
                Ok(timeout) => timeout,
                Err(e) => {
                    if queued {
                        self.writer_dequeue();
                    }
                    return e;
                }
            };
            if !queued {
                self.queue.add_lo(1);
                queued = true;
                continue;
            }
            waitchan::wait_while(
                self.writer_key(),
                || self.own.lo() != UNOWNED,
                timeout,
                self.wait_flags(),
            );
        }
    }

    pub fn rdlock(&self) -> i32 {
        self.read_acquire(Acquire::Block)
    }

    pub fn tryrdlock(&self) -> i32 {
        self.read_acquire(Acquire::Try)
    }

    pub fn timedrdlock(&self, abstime: &Timespec) -> i32 {
        self.read_acquire(Acquire::Until(abstime))
    }

    pub fn wrlock(&self) -> i32 {
        self.write_acquire(Acquire::Block)
    }

    pub fn trywrlock(&self) -> i32 {
        self.write_acquire(Acquire::Try)
    }

    pub fn timedwrlock(&self, abstime: &Timespec) -> i32 {
        self.write_acquire(Acquire::Until(abstime))
    }

    /// Releases a read or write hold. `EPERM` when the caller holds
    /// neither.
    pub fn unlock(&self) -> i32 {
        let (owner, _) = self.own.load();
        if owner == UNOWNED {
            return errno::EPERM;
        }
        if owner != READERS {
            if !self.write_owned_by(owner, thread::current_id()) {
                return errno::EPERM;
            }
            if self.own.compare_exchange((owner, 0), (UNOWNED, 0)).is_err() {
                return errno::EPERM;
            }
            let (writers, readers) = self.queue.load();
            if writers > 0 {
                self.wake_writer();
            } else if readers > 0 {
                self.wake_readers();
            }
            return 0;
        }

        if read_depth(self.addr()) == 0 {
            return errno::EPERM;
        }
        let released = self.own.fetch_update(|(owner, n)| match (owner, n) {
            (READERS, 1) => Some((UNOWNED, 0)),
            (READERS, n) if n > 1 => Some((READERS, n - 1)),
            _ => None,
        });
        match released {
            Err(_) => errno::EPERM,
            Ok((_, n)) => {
                adjust_read_depth(self.addr(), false);
                if n == 1 {
                    let (writers, readers) = self.queue.load();
                    if writers > 0 {
                        self.wake_writer();
                    } else if readers > 0 {
                        self.wake_readers();
                    }
                }
                0
            }
        }
    }
}
