//! Process-liveness oracle for robust locks.
//!
//! A robust lock word records the owning process id. Waiters poll the
//! oracle to find out whether that process still exists; if it does not,
//! the lock is claimed and the caller learns about it via `EOWNERDEAD`.
//!
//! The default oracle probes with `kill(pid, 0)`. Tests and the stress
//! harness install a [`ScriptedOracle`] to declare arbitrary ids dead.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};

/// Answers "which process am I" and "is that process still alive".
pub trait LivenessOracle: Send + Sync {
    fn current_process(&self) -> u32;
    fn is_alive(&self, pid: u32) -> bool;
}

/// Oracle backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemOracle;

impl LivenessOracle for SystemOracle {
    fn current_process(&self) -> u32 {
        std::process::id()
    }

    fn is_alive(&self, pid: u32) -> bool {
        // 0 and values past i32::MAX name no single process for kill(2).
        let Ok(pid) = i32::try_from(pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        // SAFETY: signal 0 performs the existence and permission check only.
        let rc = unsafe { libc::kill(pid, 0) };
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
}

/// Oracle whose notion of death is scripted: every id is alive unless
/// explicitly marked dead.
#[derive(Debug)]
pub struct ScriptedOracle {
    pid: u32,
    dead: Mutex<HashSet<u32>>,
}

impl ScriptedOracle {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pid: std::process::id(),
            dead: Mutex::new(HashSet::new()),
        }
    }

    pub fn mark_dead(&self, pid: u32) {
        self.dead.lock().insert(pid);
    }

    pub fn revive(&self, pid: u32) {
        self.dead.lock().remove(&pid);
    }
}

impl Default for ScriptedOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl LivenessOracle for ScriptedOracle {
    fn current_process(&self) -> u32 {
        self.pid
    }

    fn is_alive(&self, pid: u32) -> bool {
        pid != 0 && !self.dead.lock().contains(&pid)
    }
}

static ORACLE: RwLock<Option<Arc<dyn LivenessOracle>>> = parking_lot::const_rwlock(None);

/// The installed oracle (the system one unless replaced).
pub fn oracle() -> Arc<dyn LivenessOracle> {
    ORACLE
        .read()
        .clone()
        .unwrap_or_else(|| Arc::new(SystemOracle))
}

/// Replaces the process-wide oracle.
pub fn set_oracle(oracle: Arc<dyn LivenessOracle>) {
    *ORACLE.write() = Some(oracle);
}

/// Restores the system oracle.
pub fn reset_oracle() {
    *ORACLE.write() = None;
}

/// Installs the shared scripted oracle and returns it. Repeated calls
/// return the same instance, so independent callers can mark distinct ids
/// dead without stepping on each other.
pub fn install_scripted() -> Arc<ScriptedOracle> {
    static SCRIPTED: OnceLock<Arc<ScriptedOracle>> = OnceLock::new();
    let scripted = Arc::clone(SCRIPTED.get_or_init(|| Arc::new(ScriptedOracle::new())));
    set_oracle(scripted.clone());
    scripted
}

#[inline]
pub fn current_process() -> u32 {
    oracle().current_process()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_oracle_sees_itself() {
        let sys = SystemOracle;
        assert!(sys.is_alive(sys.current_process()));
    }

    #[test]
    fn system_oracle_rejects_impossible_ids() {
        let sys = SystemOracle;
        assert!(!sys.is_alive(0));
        assert!(!sys.is_alive(u32::MAX));
    }

    #[test]
    fn scripted_oracle_marks_and_revives() {
        let o = ScriptedOracle::new();
        assert!(o.is_alive(4242));
        o.mark_dead(4242);
        assert!(!o.is_alive(4242));
        o.revive(4242);
        assert!(o.is_alive(4242));
        assert_eq!(o.current_process(), std::process::id());
    }

    #[test]
    fn install_scripted_is_shared() {
        let a = install_scripted();
        let b = install_scripted();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(current_process(), std::process::id());
    }
}
