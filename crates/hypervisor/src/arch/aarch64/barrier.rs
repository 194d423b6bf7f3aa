// Instruction and memory barriers, event/interrupt wait primitives

#[cfg(target_arch = "aarch64")]
mod imp {
    #[inline(always)]
    pub fn dsb_sy() {
        unsafe { core::arch::asm!("dsb sy", options(nostack)) }
    }

    #[inline(always)]
    pub fn dsb_ish() {
        unsafe { core::arch::asm!("dsb ish", options(nostack)) }
    }

    /// Non-shareable DSB, enough when the effects stay on this core
    #[inline(always)]
    pub fn dsb_local() {
        unsafe { core::arch::asm!("dsb nsh", options(nostack)) }
    }

    #[inline(always)]
    pub fn dmb_sy() {
        unsafe { core::arch::asm!("dmb sy", options(nostack)) }
    }

    #[inline(always)]
    pub fn isb() {
        unsafe { core::arch::asm!("isb", options(nostack)) }
    }

    #[inline(always)]
    pub fn wfi() {
        unsafe { core::arch::asm!("wfi", options(nomem, nostack)) }
    }

    #[inline(always)]
    pub fn wfe() {
        unsafe { core::arch::asm!("wfe", options(nomem, nostack)) }
    }

    #[inline(always)]
    pub fn sev() {
        unsafe { core::arch::asm!("sev", options(nomem, nostack)) }
    }

    #[inline(always)]
    pub fn sevl() {
        unsafe { core::arch::asm!("sevl", options(nomem, nostack)) }
    }
}

#[cfg(not(target_arch = "aarch64"))]
mod imp {
    // Host-side stand-ins. Plain fences keep compiler ordering honest in
    // tests; the wait instructions degrade to spin hints.
    use core::sync::atomic::{fence, Ordering};

    #[inline(always)]
    pub fn dsb_sy() {
        fence(Ordering::SeqCst);
    }

    #[inline(always)]
    pub fn dsb_ish() {
        fence(Ordering::SeqCst);
    }

    #[inline(always)]
    pub fn dsb_local() {
        fence(Ordering::SeqCst);
    }

    #[inline(always)]
    pub fn dmb_sy() {
        fence(Ordering::SeqCst);
    }

    #[inline(always)]
    pub fn isb() {
        fence(Ordering::SeqCst);
    }

    #[inline(always)]
    pub fn wfi() {
        core::hint::spin_loop();
    }

    #[inline(always)]
    pub fn wfe() {
        core::hint::spin_loop();
    }

    #[inline(always)]
    pub fn sev() {}

    #[inline(always)]
    pub fn sevl() {}
}

pub use imp::*;
