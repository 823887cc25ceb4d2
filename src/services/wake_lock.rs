//! Keeps the host awake while an upload is running.
//!
//! A lock is taken through [`WakeLockGuard::hold`] and released when the
//! guard drops, so every exit path of an upload (success, error, abort, or
//! the future being dropped) releases exactly once.

use std::{
    io,
    process::{Child, Command, Stdio},
    sync::Mutex,
};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum WakeLockError {
    #[error("wake lock unsupported on this host")]
    Unsupported,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A platform facility that prevents sleep while held.
pub trait WakeLock: Send + Sync {
    fn acquire(&self) -> Result<(), WakeLockError>;
    fn release(&self);
}

/// Releases the lock it holds on drop.
#[must_use = "the wake lock is released as soon as the guard is dropped"]
pub struct WakeLockGuard<'a> {
    lock: &'a dyn WakeLock,
}

impl<'a> WakeLockGuard<'a> {
    /// Acquire `lock`. A failure is logged and yields `None`: uploads run
    /// without a wake lock rather than not at all.
    pub fn hold(lock: &'a dyn WakeLock) -> Option<Self> {
        match lock.acquire() {
            Ok(()) => {
                debug!("wake lock acquired");
                Some(Self { lock })
            }
            Err(err) => {
                warn!(error = %err, "could not acquire wake lock");
                None
            }
        }
    }
}

impl Drop for WakeLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
        debug!("wake lock released");
    }
}

/// For hosts without a wake lock.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWakeLock;

impl WakeLock for NoopWakeLock {
    fn acquire(&self) -> Result<(), WakeLockError> {
        Ok(())
    }

    fn release(&self) {}
}

/// Holds a `systemd-inhibit` child for as long as the lock is held.
#[derive(Debug, Default)]
pub struct InhibitWakeLock {
    child: Mutex<Option<Child>>,
}

impl InhibitWakeLock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WakeLock for InhibitWakeLock {
    fn acquire(&self) -> Result<(), WakeLockError> {
        if !cfg!(target_os = "linux") {
            return Err(WakeLockError::Unsupported);
        }
        let mut slot = self.child.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_some() {
            return Ok(());
        }
        let child = Command::new("systemd-inhibit")
            .args([
                "--what=idle:sleep",
                "--who=beta-upload",
                "--why=video upload in progress",
                "--mode=block",
                "sleep",
                "infinity",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        *slot = Some(child);
        Ok(())
    }

    fn release(&self) {
        let mut slot = self.child.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(mut child) = slot.take() {
            if let Err(err) = child.kill() {
                warn!(error = %err, "failed to stop systemd-inhibit");
            }
            let _ = child.wait();
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Counts acquire/release calls.
    #[derive(Debug, Default)]
    pub struct CountingWakeLock {
        pub acquired: AtomicUsize,
        pub released: AtomicUsize,
        pub fail: AtomicBool,
    }

    impl CountingWakeLock {
        pub fn failing() -> Self {
            let lock = Self::default();
            lock.fail.store(true, Ordering::SeqCst);
            lock
        }

        pub fn acquired(&self) -> usize {
            self.acquired.load(Ordering::SeqCst)
        }

        pub fn released(&self) -> usize {
            self.released.load(Ordering::SeqCst)
        }
    }

    impl WakeLock for CountingWakeLock {
        fn acquire(&self) -> Result<(), WakeLockError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(WakeLockError::Unsupported);
            }
            self.acquired.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn release(&self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::CountingWakeLock;
    use super::*;

    #[test]
    fn guard_releases_on_drop() {
        let lock = CountingWakeLock::default();
        {
            let _guard = WakeLockGuard::hold(&lock);
            assert_eq!(lock.acquired(), 1);
            assert_eq!(lock.released(), 0);
        }
        assert_eq!(lock.released(), 1);
    }

    #[test]
    fn failed_acquire_is_not_released() {
        let lock = CountingWakeLock::failing();
        let guard = WakeLockGuard::hold(&lock);
        assert!(guard.is_none());
        drop(guard);
        assert_eq!(lock.acquired(), 0);
        assert_eq!(lock.released(), 0);
    }
}
