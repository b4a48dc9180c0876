//! Keeps the host awake while a transfer is active. The original's plugin
//! system had an optional `platform.py` hook used on macOS to call
//! `caffeinate`; we model that as a trait with a no-op default so platforms
//! without a known inhibitor don't need special-casing at call sites.

pub(crate) trait SleepInhibitor: Send + Sync {
    fn acquire(&self) -> Box<dyn SleepGuard>;
}

pub(crate) trait SleepGuard: Send {}

pub(crate) struct NoopInhibitor;

struct NoopGuard;

impl SleepGuard for NoopGuard {}

impl SleepInhibitor for NoopInhibitor {
    fn acquire(&self) -> Box<dyn SleepGuard> {
        Box::new(NoopGuard)
    }
}

#[cfg(target_os = "macos")]
pub(crate) struct CaffeinateInhibitor;

#[cfg(target_os = "macos")]
struct CaffeinateGuard {
    _child: std::process::Child,
}

#[cfg(target_os = "macos")]
impl SleepGuard for CaffeinateGuard {}

#[cfg(target_os = "macos")]
impl SleepInhibitor for CaffeinateInhibitor {
    fn acquire(&self) -> Box<dyn SleepGuard> {
        match std::process::Command::new("caffeinate").arg("-i").spawn() {
            Ok(child) => Box::new(CaffeinateGuard { _child: child }),
            Err(_) => Box::new(NoopGuard),
        }
    }
}

/// Picks the inhibitor for the current platform.
pub(crate) fn platform_inhibitor() -> Box<dyn SleepInhibitor> {
    #[cfg(target_os = "macos")]
    {
        Box::new(CaffeinateInhibitor)
    }
    #[cfg(not(target_os = "macos"))]
    {
        Box::new(NoopInhibitor)
    }
}
