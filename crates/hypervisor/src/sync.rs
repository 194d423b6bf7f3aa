//! Spinlocks and cross-core barriers
//!
//! `spin::Mutex` covers the simple cases (logger, MMIO allocator). The
//! subsystems that re-enter their own lock from nested handler paths (vGIC
//! refresh inside the IRQ top-half inside a distributor MMIO trap) need a
//! recursive lock keyed on the owning core: the tag is `core_id + 1`, zero
//! meaning unlocked.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::core_ctx::current_core_id;

/// Recursive spinlock. IRQs must be masked while it is held.
pub struct RecursiveSpinlock {
    tag: AtomicU32,
    count: AtomicU32,
}

impl RecursiveSpinlock {
    pub const fn new() -> Self {
        Self {
            tag: AtomicU32::new(0),
            count: AtomicU32::new(0),
        }
    }

    pub fn lock(&self) {
        let my_tag = current_core_id() + 1;
        if self.tag.load(Ordering::Acquire) != my_tag {
            while self
                .tag
                .compare_exchange_weak(0, my_tag, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                core::hint::spin_loop();
            }
            self.count.store(1, Ordering::Relaxed);
        } else {
            // Only the owner reaches here, plain increment is fine
            self.count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn try_lock(&self) -> bool {
        let my_tag = current_core_id() + 1;
        if self.tag.load(Ordering::Acquire) == my_tag {
            self.count.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            let ok = self
                .tag
                .compare_exchange(0, my_tag, Ordering::Acquire, Ordering::Relaxed)
                .is_ok();
            if ok {
                self.count.store(1, Ordering::Relaxed);
            }
            ok
        }
    }

    pub fn unlock(&self) {
        if self.count.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.tag.store(0, Ordering::Release);
        }
    }

    /// Mask IRQs, then take the lock. Returns the previous DAIF flags.
    pub fn lock_mask_irq(&self) -> u64 {
        let flags = crate::arch::mask_irq();
        self.lock();
        flags
    }

    pub fn unlock_restore_irq(&self, flags: u64) {
        self.unlock();
        crate::arch::restore_interrupt_flags(flags);
    }

    #[cfg(test)]
    pub fn is_locked(&self) -> bool {
        self.tag.load(Ordering::Relaxed) != 0
    }
}

/// One-shot rendezvous: initialized with a mask of participating cores, each
/// participant clears its own bit and spins until the mask drains.
pub struct Barrier {
    val: AtomicU32,
}

impl Barrier {
    pub const fn new() -> Self {
        Self { val: AtomicU32::new(0) }
    }

    pub fn init(&self, core_list: u32) {
        self.val.store(core_list, Ordering::SeqCst);
    }

    pub fn wait(&self) {
        let own = 1u32 << current_core_id();
        while self.val.fetch_and(!own, Ordering::SeqCst) != 0 {
            core::hint::spin_loop();
        }
    }

    /// Arrive without spinning for the others (asynchronous participants)
    pub fn arrive(&self) {
        let own = 1u32 << current_core_id();
        self.val.fetch_and(!own, Ordering::SeqCst);
    }

    pub fn remaining(&self) -> u32 {
        self.val.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recursive_lock_reenters() {
        let lock = RecursiveSpinlock::new();
        lock.lock();
        assert!(lock.is_locked());
        lock.lock();
        lock.unlock();
        assert!(lock.is_locked());
        lock.unlock();
        assert!(!lock.is_locked());
    }

    #[test]
    fn try_lock_on_owned_lock() {
        let lock = RecursiveSpinlock::new();
        assert!(lock.try_lock());
        assert!(lock.try_lock());
        lock.unlock();
        lock.unlock();
        assert!(!lock.is_locked());
    }

    #[test]
    fn barrier_drains_per_core_bits() {
        let barrier = Barrier::new();
        // Only core 0 exists on the host; a single-participant barrier
        // must not spin.
        barrier.init(1 << 0);
        barrier.wait();
        assert_eq!(barrier.remaining(), 0);
    }
}
