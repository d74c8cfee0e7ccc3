use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use parking_lot::{RwLock, RwLockReadGuard, RwLockUpgradableReadGuard, RwLockWriteGuard};

use crate::Error;

/// How often a blocked waiter re-checks for interruptions.
const INTERRUPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Shared read guard of a [TreeLock].
pub type TreeReadGuard<'a> = RwLockReadGuard<'a, ()>;
/// Upgradable read guard of a [TreeLock].
pub type TreeUpgradableReadGuard<'a> = RwLockUpgradableReadGuard<'a, ()>;
/// Exclusive guard of a [TreeLock].
pub type TreeWriteGuard<'a> = RwLockWriteGuard<'a, ()>;

/// The read-write-upgradable lock guarding one tree and its storage strategy.
///
/// Three modes are available:
/// * shared read, any number of holders;
/// * upgradable read, one holder at a time, compatible with shared readers;
/// * exclusive write.
///
/// Waits block the calling thread indefinitely, unless [TreeLock::interrupt_waiters] is called,
/// in which case every wait in progress fails with an `io::ErrorKind::Interrupted` [Error::Io].
#[derive(Debug, Default)]
pub struct TreeLock {
    inner: RwLock<()>,
    interrupts: AtomicU64,
}

impl TreeLock {
    /// Creates a new unlocked lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock in shared mode.
    pub fn read(&self) -> Result<TreeReadGuard<'_>, Error> {
        self.wait_for(
            || self.inner.try_read(),
            || self.inner.try_read_for(INTERRUPT_POLL_INTERVAL),
        )
    }

    /// Acquires the lock in upgradable mode.
    pub fn upgradable_read(&self) -> Result<TreeUpgradableReadGuard<'_>, Error> {
        self.wait_for(
            || self.inner.try_upgradable_read(),
            || self.inner.try_upgradable_read_for(INTERRUPT_POLL_INTERVAL),
        )
    }

    /// Acquires the lock in exclusive mode.
    pub fn write(&self) -> Result<TreeWriteGuard<'_>, Error> {
        self.wait_for(
            || self.inner.try_write(),
            || self.inner.try_write_for(INTERRUPT_POLL_INTERVAL),
        )
    }

    /// Upgrades an upgradable guard into an exclusive one, waiting for the shared readers to leave.
    ///
    /// If the wait is interrupted the upgradable guard is released.
    pub fn upgrade<'a>(
        &'a self,
        mut guard: TreeUpgradableReadGuard<'a>,
    ) -> Result<TreeWriteGuard<'a>, Error> {
        let epoch = self.interrupts.load(Ordering::Acquire);
        loop {
            match RwLockUpgradableReadGuard::try_upgrade_for(guard, INTERRUPT_POLL_INTERVAL) {
                Ok(write_guard) => return Ok(write_guard),
                Err(upgradable) => guard = upgradable,
            }
            if self.interrupts.load(Ordering::Acquire) != epoch {
                trace!("lock upgrade interrupted");
                return Err(Error::interrupted());
            }
        }
    }

    /// Makes every lock wait currently in progress fail with an interrupted error.
    ///
    /// Waits started after this call are not affected.
    pub fn interrupt_waiters(&self) {
        self.interrupts.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns whether the lock is currently held in exclusive mode.
    pub fn is_write_locked(&self) -> bool {
        self.inner.is_locked_exclusive()
    }

    /// Runs `try_lock` once, then polls `try_lock_for` until it succeeds or the waiters are
    /// interrupted. The epoch is taken before the first attempt.
    fn wait_for<G>(
        &self,
        try_lock: impl FnOnce() -> Option<G>,
        mut try_lock_for: impl FnMut() -> Option<G>,
    ) -> Result<G, Error> {
        let epoch = self.interrupts.load(Ordering::Acquire);
        if let Some(guard) = try_lock() {
            return Ok(guard);
        }
        loop {
            if let Some(guard) = try_lock_for() {
                return Ok(guard);
            }
            if self.interrupts.load(Ordering::Acquire) != epoch {
                trace!("lock wait interrupted");
                return Err(Error::interrupted());
            }
        }
    }
}
