//! Stress scenarios. Each one returns the number of primitive operations it
//! performed, or a description of the invariant it saw broken.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use uthread_core::ErrorKind;
use uthread_core::pthread::{
    Barrier, Cond, Mutex, MutexAttr, Once, PTHREAD_BARRIER_SERIAL_THREAD, PTHREAD_CANCELED,
    PTHREAD_MUTEX_RECURSIVE, RwLock, Semaphore, ThreadRecord, cancel, create, join, with_cleanup,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    MutexCounter,
    RecursiveMutex,
    CondQueue,
    #[serde(rename = "rwlock_mix")]
    RwLockMix,
    BarrierRounds,
    SemHandoff,
    OnceRace,
    CancelWaiters,
}

impl Scenario {
    pub const ALL: [Self; 8] = [
        Self::MutexCounter,
        Self::RecursiveMutex,
        Self::CondQueue,
        Self::RwLockMix,
        Self::BarrierRounds,
        Self::SemHandoff,
        Self::OnceRace,
        Self::CancelWaiters,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::MutexCounter => "mutex_counter",
            Self::RecursiveMutex => "recursive_mutex",
            Self::CondQueue => "cond_queue",
            Self::RwLockMix => "rwlock_mix",
            Self::BarrierRounds => "barrier_rounds",
            Self::SemHandoff => "sem_handoff",
            Self::OnceRace => "once_race",
            Self::CancelWaiters => "cancel_waiters",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.name() == name)
    }

    #[must_use]
    pub const fn describe(self) -> &'static str {
        match self {
            Self::MutexCounter => "non-atomic counter increments under a normal mutex",
            Self::RecursiveMutex => "nested acquisitions of a recursive mutex",
            Self::CondQueue => "producers and consumers over a mutex and two condvars",
            Self::RwLockMix => "readers checking a paired counter one writer updates",
            Self::BarrierRounds => "one serial thread per barrier round",
            Self::SemHandoff => "one producer posting to several consumers",
            Self::OnceRace => "racing callers of a single once control",
            Self::CancelWaiters => "cancelling threads parked in a condvar wait",
        }
    }

    pub fn run(self, params: &ScenarioParams) -> Result<Outcome, String> {
        match self {
            Self::MutexCounter => mutex_counter(params),
            Self::RecursiveMutex => recursive_mutex(params),
            Self::CondQueue => cond_queue(params),
            Self::RwLockMix => rwlock_mix(params),
            Self::BarrierRounds => barrier_rounds(params),
            Self::SemHandoff => sem_handoff(params),
            Self::OnceRace => once_race(params),
            Self::CancelWaiters => cancel_waiters(params),
        }
    }
}

/// Scale knobs shared by every scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioParams {
    pub threads: usize,
    pub iterations: u64,
}

impl Default for ScenarioParams {
    fn default() -> Self {
        Self {
            threads: 4,
            iterations: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub ops: u64,
    pub detail: String,
}

/// `Busy (Device or resource busy)`-style text for a failure status.
fn describe_errno(rc: i32) -> String {
    match ErrorKind::from_errno(rc) {
        Some(kind) => format!("{kind:?} ({kind})"),
        None => format!("errno {rc}"),
    }
}

fn spawn(start: impl FnOnce() -> usize + Send + 'static) -> Result<Arc<ThreadRecord>, String> {
    create(None, start).map_err(|e| format!("thread create failed: {}", describe_errno(e)))
}

fn join_all(threads: &[Arc<ThreadRecord>]) -> Result<Vec<usize>, String> {
    threads
        .iter()
        .map(|t| join(t).map_err(|e| format!("join of thread {} failed: {}", t.id(), describe_errno(e))))
        .collect()
}

fn status(rc: i32, what: &str) -> Result<(), String> {
    if rc == 0 {
        Ok(())
    } else {
        Err(format!("{what} failed: {}", describe_errno(rc)))
    }
}

fn mutex_counter(params: &ScenarioParams) -> Result<Outcome, String> {
    let shared = Arc::new((Mutex::new(), AtomicU64::new(0)));
    let iters = params.iterations;
    let threads = (0..params.threads)
        .map(|_| {
            let shared = Arc::clone(&shared);
            spawn(move || {
                let (lock, count) = &*shared;
                for _ in 0..iters {
                    lock.lock();
                    let v = count.load(Ordering::Relaxed);
                    count.store(v + 1, Ordering::Relaxed);
                    lock.unlock();
                }
                0
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    join_all(&threads)?;

    let expected = params.threads as u64 * iters;
    let got = shared.1.load(Ordering::SeqCst);
    if got != expected {
        return Err(format!("counter {got}, expected {expected}"));
    }
    Ok(Outcome {
        ops: expected * 2,
        detail: format!("counter={got}"),
    })
}

fn recursive_mutex(params: &ScenarioParams) -> Result<Outcome, String> {
    const DEPTH: u64 = 3;
    let mut attr = MutexAttr::new();
    status(attr.set_type(PTHREAD_MUTEX_RECURSIVE), "settype")?;
    let shared = Arc::new((Mutex::with_attr(&attr), AtomicU64::new(0)));
    let iters = params.iterations;
    let threads = (0..params.threads)
        .map(|_| {
            let shared = Arc::clone(&shared);
            spawn(move || {
                let (lock, count) = &*shared;
                let mut failures = 0;
                for _ in 0..iters {
                    for _ in 0..DEPTH {
                        if lock.lock() != 0 {
                            failures += 1;
                        }
                    }
                    let v = count.load(Ordering::Relaxed);
                    count.store(v + 1, Ordering::Relaxed);
                    for _ in 0..DEPTH {
                        lock.unlock();
                    }
                }
                failures
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let failures: usize = join_all(&threads)?.into_iter().sum();
    if failures > 0 {
        return Err(format!("{failures} nested lock calls failed"));
    }
    if shared.0.owner() != 0 {
        return Err("mutex still owned after all threads finished".into());
    }
    let got = shared.1.load(Ordering::SeqCst);
    Ok(Outcome {
        ops: got * DEPTH * 2,
        detail: format!("counter={got} depth={DEPTH}"),
    })
}

struct Queue {
    lock: Mutex,
    not_empty: Cond,
    not_full: Cond,
    len: AtomicU64,
    consumed: AtomicU64,
    producers_left: AtomicUsize,
}

const QUEUE_CAPACITY: u64 = 8;

fn cond_queue(params: &ScenarioParams) -> Result<Outcome, String> {
    let producers = params.threads.div_ceil(2).max(1);
    let consumers = (params.threads / 2).max(1);
    let q = Arc::new(Queue {
        lock: Mutex::new(),
        not_empty: Cond::new(),
        not_full: Cond::new(),
        len: AtomicU64::new(0),
        consumed: AtomicU64::new(0),
        producers_left: AtomicUsize::new(producers),
    });
    let iters = params.iterations;

    let mut threads = Vec::new();
    for _ in 0..producers {
        let q = Arc::clone(&q);
        threads.push(spawn(move || {
            for _ in 0..iters {
                q.lock.lock();
                while q.len.load(Ordering::Relaxed) == QUEUE_CAPACITY {
                    q.not_full.wait(&q.lock);
                }
                q.len.fetch_add(1, Ordering::Relaxed);
                q.not_empty.signal();
                q.lock.unlock();
            }
            q.lock.lock();
            q.producers_left.fetch_sub(1, Ordering::Relaxed);
            q.not_empty.broadcast();
            q.lock.unlock();
            0
        })?);
    }
    for _ in 0..consumers {
        let q = Arc::clone(&q);
        threads.push(spawn(move || {
            let mut taken = 0;
            q.lock.lock();
            loop {
                while q.len.load(Ordering::Relaxed) == 0
                    && q.producers_left.load(Ordering::Relaxed) > 0
                {
                    q.not_empty.wait(&q.lock);
                }
                if q.len.load(Ordering::Relaxed) == 0 {
                    break;
                }
                q.len.fetch_sub(1, Ordering::Relaxed);
                q.consumed.fetch_add(1, Ordering::Relaxed);
                taken += 1;
                q.not_full.signal();
            }
            q.lock.unlock();
            taken
        })?);
    }
    join_all(&threads)?;

    let expected = producers as u64 * iters;
    let got = q.consumed.load(Ordering::SeqCst);
    if got != expected {
        return Err(format!("consumed {got} items, produced {expected}"));
    }
    Ok(Outcome {
        ops: got * 2,
        detail: format!("producers={producers} consumers={consumers} items={got}"),
    })
}

fn rwlock_mix(params: &ScenarioParams) -> Result<Outcome, String> {
    struct Pair {
        lock: RwLock,
        a: AtomicU64,
        b: AtomicU64,
        torn: AtomicU64,
    }
    let pair = Arc::new(Pair {
        lock: RwLock::new(),
        a: AtomicU64::new(0),
        b: AtomicU64::new(0),
        torn: AtomicU64::new(0),
    });
    let iters = params.iterations;
    let threads = (0..params.threads.max(2))
        .map(|i| {
            let pair = Arc::clone(&pair);
            spawn(move || {
                for _ in 0..iters {
                    if i == 0 {
                        pair.lock.wrlock();
                        pair.a.fetch_add(1, Ordering::Relaxed);
                        std::hint::spin_loop();
                        pair.b.fetch_add(1, Ordering::Relaxed);
                    } else {
                        pair.lock.rdlock();
                        if pair.a.load(Ordering::Relaxed) != pair.b.load(Ordering::Relaxed) {
                            pair.torn.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    pair.lock.unlock();
                }
                0
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    join_all(&threads)?;

    let torn = pair.torn.load(Ordering::SeqCst);
    if torn > 0 {
        return Err(format!("{torn} readers saw a half-applied write"));
    }
    Ok(Outcome {
        ops: threads.len() as u64 * iters * 2,
        detail: format!("writes={}", pair.a.load(Ordering::SeqCst)),
    })
}

fn barrier_rounds(params: &ScenarioParams) -> Result<Outcome, String> {
    let parties = u32::try_from(params.threads.max(1)).map_err(|_| "too many threads".to_string())?;
    let barrier = Barrier::new(parties, None).map_err(|e| format!("barrier init: {}", describe_errno(e)))?;
    let shared = Arc::new((barrier, AtomicU64::new(0)));
    let rounds = params.iterations.min(10_000);
    let threads = (0..parties)
        .map(|_| {
            let shared = Arc::clone(&shared);
            spawn(move || {
                let (barrier, serials) = &*shared;
                for _ in 0..rounds {
                    if barrier.wait() == PTHREAD_BARRIER_SERIAL_THREAD {
                        serials.fetch_add(1, Ordering::Relaxed);
                    }
                }
                0
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    join_all(&threads)?;

    let serials = shared.1.load(Ordering::SeqCst);
    if serials != rounds {
        return Err(format!("{serials} serial threads over {rounds} rounds"));
    }
    status(shared.0.destroy(), "barrier destroy")?;
    Ok(Outcome {
        ops: rounds * u64::from(parties),
        detail: format!("parties={parties} rounds={rounds}"),
    })
}

fn sem_handoff(params: &ScenarioParams) -> Result<Outcome, String> {
    let sem = Semaphore::new(0, false).map_err(|e| format!("sem init: {}", describe_errno(e)))?;
    let sem = Arc::new(sem);
    let consumers = params.threads.max(1);
    let iters = params.iterations;
    let threads = (0..consumers)
        .map(|_| {
            let sem = Arc::clone(&sem);
            spawn(move || {
                let mut failures = 0;
                for _ in 0..iters {
                    if sem.wait() != 0 {
                        failures += 1;
                    }
                }
                failures
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let total = consumers as u64 * iters;
    for _ in 0..total {
        status(sem.post(), "sem post")?;
    }
    let failures: usize = join_all(&threads)?.into_iter().sum();
    if failures > 0 {
        return Err(format!("{failures} waits failed"));
    }
    if sem.getvalue() != 0 {
        return Err(format!("{} units left over", sem.getvalue()));
    }
    Ok(Outcome {
        ops: total * 2,
        detail: format!("consumers={consumers} units={total}"),
    })
}

fn once_race(params: &ScenarioParams) -> Result<Outcome, String> {
    let shared = Arc::new((Once::new(), AtomicU64::new(0)));
    let threads = (0..params.threads.max(2))
        .map(|_| {
            let shared = Arc::clone(&shared);
            spawn(move || {
                let (once, runs) = &*shared;
                once.call_once(|| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    std::thread::yield_now();
                }) as usize
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let statuses = join_all(&threads)?;
    if statuses.iter().any(|&rc| rc != 0) {
        return Err(format!("call_once statuses {statuses:?}"));
    }
    let runs = shared.1.load(Ordering::SeqCst);
    if runs != 1 {
        return Err(format!("routine ran {runs} times"));
    }
    Ok(Outcome {
        ops: threads.len() as u64,
        detail: format!("callers={}", threads.len()),
    })
}

fn release(lock: &Mutex) {
    lock.unlock();
}

fn cancel_waiters(params: &ScenarioParams) -> Result<Outcome, String> {
    struct Parked {
        lock: Mutex,
        cv: Cond,
        go: AtomicBool,
    }
    let parked = Arc::new(Parked {
        lock: Mutex::new(),
        cv: Cond::new(),
        go: AtomicBool::new(false),
    });
    let waiters = params.threads.max(1);
    let threads = (0..waiters)
        .map(|_| {
            let parked = Arc::clone(&parked);
            spawn(move || {
                parked.lock.lock();
                with_cleanup(&parked.lock, release, || {
                    while !parked.go.load(Ordering::Relaxed) {
                        parked.cv.wait(&parked.lock);
                    }
                });
                parked.lock.unlock();
                0
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    while (parked.cv.waiters() as usize) < waiters {
        std::thread::yield_now();
    }
    for t in &threads {
        status(cancel(t), "cancel")?;
    }
    let retvals = join_all(&threads)?;
    let cancelled = retvals.iter().filter(|&&rv| rv == PTHREAD_CANCELED).count();
    if cancelled != waiters {
        return Err(format!("{cancelled} of {waiters} waiters were cancelled"));
    }
    // Every handler released the mutex it reacquired on the way out.
    status(parked.lock.trylock(), "trylock after cancellation")?;
    parked.lock.unlock();
    Ok(Outcome {
        ops: waiters as u64,
        detail: format!("cancelled={cancelled}"),
    })
}
