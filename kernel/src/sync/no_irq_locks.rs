//! Locks that keep local interrupts disabled for the whole critical section,
//! so interrupt handlers can never spin against their own hart.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use lock_api::{GuardSend, RawMutex, RawRwLock};
use spin::{Mutex, RwLock};

use crate::cpu;

// Nesting-aware interrupt disabling: only the outermost release restores the
// flag, and only to the state observed at the outermost acquisition.
// Hart-local once SMP exists; a single hart runs today.
static DISABLE_DEPTH: AtomicUsize = AtomicUsize::new(0);
static WAS_ENABLED: AtomicBool = AtomicBool::new(false);

fn push_irq_disable() {
    let enabled = cpu::irqs_enabled();
    cpu::irq_disable();
    if DISABLE_DEPTH.fetch_add(1, Ordering::Acquire) == 0 {
        WAS_ENABLED.store(enabled, Ordering::Relaxed);
    }
}

fn pop_irq_restore() {
    let depth = DISABLE_DEPTH.fetch_sub(1, Ordering::Release);
    debug_assert!(depth > 0);
    if depth == 1 && WAS_ENABLED.load(Ordering::Relaxed) {
        cpu::irq_enable();
    }
}

pub type NoIrqMutex<T> = lock_api::Mutex<NoIrqMutexRaw, T>;
pub type NoIrqMutexGuard<'a, T> = lock_api::MutexGuard<'a, NoIrqMutexRaw, T>;

pub struct NoIrqMutexRaw<R: RawMutex = Mutex<()>>(R);

/// `NoIrqMutex` usable in a `static`.
pub const fn no_irq_mutex<T>(value: T) -> NoIrqMutex<T> {
    NoIrqMutex::const_new(<NoIrqMutexRaw as RawMutex>::INIT, value)
}

unsafe impl<R: RawMutex> RawMutex for NoIrqMutexRaw<R> {
    type GuardMarker = GuardSend;

    const INIT: Self = Self(R::INIT);

    #[inline(always)]
    fn lock(&self) {
        push_irq_disable();
        self.0.lock();
    }

    #[inline(always)]
    fn try_lock(&self) -> bool {
        push_irq_disable();
        match self.0.try_lock() {
            true => true,
            false => {
                pop_irq_restore();
                false
            }
        }
    }

    #[inline(always)]
    unsafe fn unlock(&self) {
        self.0.unlock();
        pop_irq_restore();
    }
}

pub type NoIrqRwLock<T> = lock_api::RwLock<NoIrqRwLockRaw, T>;
pub type NoIrqRwLockReadGuard<'a, T> = lock_api::RwLockReadGuard<'a, NoIrqRwLockRaw, T>;
pub type NoIrqRwLockWriteGuard<'a, T> = lock_api::RwLockWriteGuard<'a, NoIrqRwLockRaw, T>;

pub struct NoIrqRwLockRaw<R: RawRwLock = RwLock<()>>(R);

/// `NoIrqRwLock` usable in a `static`.
pub const fn no_irq_rwlock<T>(value: T) -> NoIrqRwLock<T> {
    NoIrqRwLock::const_new(<NoIrqRwLockRaw as RawRwLock>::INIT, value)
}

unsafe impl<R: RawRwLock> RawRwLock for NoIrqRwLockRaw<R> {
    const INIT: Self = Self(R::INIT);
    type GuardMarker = GuardSend;

    #[inline(always)]
    fn lock_shared(&self) {
        push_irq_disable();
        self.0.lock_shared()
    }

    #[inline(always)]
    fn try_lock_shared(&self) -> bool {
        push_irq_disable();
        match self.0.try_lock_shared() {
            true => true,
            false => {
                pop_irq_restore();
                false
            }
        }
    }

    #[inline(always)]
    unsafe fn unlock_shared(&self) {
        self.0.unlock_shared();
        pop_irq_restore();
    }

    #[inline(always)]
    fn lock_exclusive(&self) {
        push_irq_disable();
        self.0.lock_exclusive()
    }

    #[inline(always)]
    fn try_lock_exclusive(&self) -> bool {
        push_irq_disable();
        match self.0.try_lock_exclusive() {
            true => true,
            false => {
                pop_irq_restore();
                false
            }
        }
    }

    #[inline(always)]
    unsafe fn unlock_exclusive(&self) {
        self.0.unlock_exclusive();
        pop_irq_restore();
    }

    #[inline(always)]
    fn is_locked(&self) -> bool {
        self.0.is_locked()
    }

    #[inline(always)]
    fn is_locked_exclusive(&self) -> bool {
        self.0.is_locked_exclusive()
    }
}
