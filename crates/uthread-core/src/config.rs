//! Runtime configuration resolved from the environment.
//!
//! `UTHREAD_MODE` selects between `strict` (POSIX behavior, the default) and
//! `hardened` (normal mutexes track their owner and report `EDEADLK` on
//! self-relock instead of hanging). Robust mutex polling and the default
//! thread stack size are also tunable:
//!
//! | variable                    | default   |
//! |-----------------------------|-----------|
//! | `UTHREAD_MODE`              | `strict`  |
//! | `UTHREAD_ROBUST_POLL_MS`    | 25        |
//! | `UTHREAD_ROBUST_POLL_MAX_MS`| 1500      |
//! | `UTHREAD_DEFAULT_STACK`     | 2 MiB     |
//!
//! The mode sits behind an atomic state machine so the mutex hot path reads
//! a single byte once resolved.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::RwLock;

use crate::pthread::attr::PTHREAD_STACK_MIN;

const MODE_UNRESOLVED: u8 = 0;
const MODE_STRICT: u8 = 1;
const MODE_HARDENED: u8 = 2;
const MODE_RESOLVING: u8 = 255;

static MODE_STATE: AtomicU8 = AtomicU8::new(MODE_UNRESOLVED);
static CONFIG: RwLock<Option<RuntimeConfig>> = parking_lot::const_rwlock(None);

pub const DEFAULT_ROBUST_POLL: Duration = Duration::from_millis(25);
pub const DEFAULT_ROBUST_POLL_MAX: Duration = Duration::from_millis(1500);
pub const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SafetyLevel {
    #[default]
    Strict,
    Hardened,
}

impl SafetyLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Hardened => "hardened",
        }
    }

    #[must_use]
    pub const fn is_hardened(self) -> bool {
        matches!(self, Self::Hardened)
    }
}

/// Fully resolved runtime knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub mode: SafetyLevel,
    /// First sleep slice while polling a robust lock held by another process.
    pub robust_poll: Duration,
    /// Ceiling for the doubling robust poll slice.
    pub robust_poll_max: Duration,
    /// Stack size for threads created without an explicit one.
    pub default_stack_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mode: SafetyLevel::Strict,
            robust_poll: DEFAULT_ROBUST_POLL,
            robust_poll_max: DEFAULT_ROBUST_POLL_MAX,
            default_stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

impl RuntimeConfig {
    /// Builds a configuration from `lookup`, falling back to defaults for
    /// missing or unparsable values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let mode = lookup("UTHREAD_MODE")
            .map(|raw| parse_mode_value(&raw))
            .unwrap_or_default();
        let robust_poll = lookup("UTHREAD_ROBUST_POLL_MS")
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map_or(defaults.robust_poll, Duration::from_millis);
        let robust_poll_max = lookup("UTHREAD_ROBUST_POLL_MAX_MS")
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .map_or(defaults.robust_poll_max, Duration::from_millis)
            .max(robust_poll);
        let default_stack_size = lookup("UTHREAD_DEFAULT_STACK")
            .and_then(|raw| raw.trim().parse::<usize>().ok())
            .map_or(defaults.default_stack_size, |size| {
                size.max(PTHREAD_STACK_MIN)
            });
        Self {
            mode,
            robust_poll,
            robust_poll_max,
            default_stack_size,
        }
    }

    fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

/// Parses a mode string. Unrecognized values fall back to strict.
#[must_use]
pub fn parse_mode_value(raw: &str) -> SafetyLevel {
    match raw.trim().to_ascii_lowercase().as_str() {
        "hardened" | "repair" | "full" => SafetyLevel::Hardened,
        _ => SafetyLevel::Strict,
    }
}

fn mode_to_u8(level: SafetyLevel) -> u8 {
    match level {
        SafetyLevel::Strict => MODE_STRICT,
        SafetyLevel::Hardened => MODE_HARDENED,
    }
}

/// The process-wide configuration, resolved on first use.
pub fn runtime_config() -> RuntimeConfig {
    if let Some(cfg) = *CONFIG.read() {
        return cfg;
    }
    let mut slot = CONFIG.write();
    if let Some(cfg) = *slot {
        return cfg;
    }
    let cfg = RuntimeConfig::from_env();
    tracing::debug!(
        mode = cfg.mode.as_str(),
        robust_poll_ms = cfg.robust_poll.as_millis() as u64,
        robust_poll_max_ms = cfg.robust_poll_max.as_millis() as u64,
        default_stack_size = cfg.default_stack_size,
        "uthread runtime configuration resolved"
    );
    *slot = Some(cfg);
    cfg
}

/// The current safety level. Hot path: one relaxed load once resolved.
#[must_use]
pub fn mode() -> SafetyLevel {
    let cached = MODE_STATE.load(Ordering::Relaxed);
    match cached {
        MODE_STRICT => return SafetyLevel::Strict,
        MODE_HARDENED => return SafetyLevel::Hardened,
        MODE_RESOLVING => return SafetyLevel::Strict,
        _ => {}
    }

    if MODE_STATE
        .compare_exchange(
            MODE_UNRESOLVED,
            MODE_RESOLVING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        return match MODE_STATE.load(Ordering::Relaxed) {
            MODE_HARDENED => SafetyLevel::Hardened,
            _ => SafetyLevel::Strict,
        };
    }

    let resolved = runtime_config().mode;
    MODE_STATE.store(mode_to_u8(resolved), Ordering::Release);
    resolved
}

/// Replaces the resolved configuration. Used by tests and the harness to
/// switch modes without touching the process environment.
pub fn override_for_tests(cfg: RuntimeConfig) {
    *CONFIG.write() = Some(cfg);
    MODE_STATE.store(mode_to_u8(cfg.mode), Ordering::Release);
}
