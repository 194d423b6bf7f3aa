// FP/SIMD register file access for the debugger
//
// The guest's V registers are only materialized when a debugger asks for
// them (or writes them back); normal trap handling never touches SIMD state.

/// Matches the layout ventana_fpu_save_regs/ventana_fpu_load_regs use:
/// 32 x 128-bit Q registers, then FPSR and FPCR.
#[repr(C, align(16))]
#[derive(Clone, Copy)]
pub struct FpuRegisterCache {
    pub q: [[u64; 2]; 32],
    pub fpsr: u32,
    pub fpcr: u32,
}

impl FpuRegisterCache {
    pub const fn new() -> Self {
        Self {
            q: [[0; 2]; 32],
            fpsr: 0,
            fpcr: 0,
        }
    }
}

static_assertions::const_assert_eq!(core::mem::offset_of!(FpuRegisterCache, fpsr), 0x200);

#[cfg(target_arch = "aarch64")]
extern "C" {
    fn ventana_fpu_save_regs(cache: *mut FpuRegisterCache);
    fn ventana_fpu_load_regs(cache: *const FpuRegisterCache);
}

static mut FPU_CACHES: [FpuRegisterCache; crate::core_ctx::MAX_CORES] =
    [FpuRegisterCache::new(); crate::core_ctx::MAX_CORES];

/// Snapshot this core's live FP/SIMD state into the per-core cache.
pub fn save_registers() -> &'static FpuRegisterCache {
    let core = crate::core_ctx::current_core_id() as usize;
    unsafe {
        let cache = &mut FPU_CACHES[core];
        #[cfg(target_arch = "aarch64")]
        ventana_fpu_save_regs(cache);
        cache
    }
}

/// Mutable view of the cache, for debugger register writes.
pub fn cached_registers_mut() -> &'static mut FpuRegisterCache {
    let core = crate::core_ctx::current_core_id() as usize;
    unsafe { &mut FPU_CACHES[core] }
}

/// Push the (possibly debugger-modified) cache back into the register file.
pub fn commit_registers() {
    let core = crate::core_ctx::current_core_id() as usize;
    unsafe {
        let _cache = &FPU_CACHES[core];
        #[cfg(target_arch = "aarch64")]
        ventana_fpu_load_regs(_cache);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_layout_matches_assembly() {
        assert_eq!(core::mem::offset_of!(FpuRegisterCache, q), 0);
        assert_eq!(core::mem::size_of::<FpuRegisterCache>(), 0x210);
    }

    #[test]
    fn write_then_read_roundtrip() {
        let _guard = crate::lib::test_lock();
        let cache = cached_registers_mut();
        cache.q[3] = [0xDEAD_BEEF, 0xCAFE];
        cache.fpcr = 0x0300_0000;
        commit_registers();
        let snap = save_registers();
        // Host stubs leave the cache untouched
        assert_eq!(snap.q[3], [0xDEAD_BEEF, 0xCAFE]);
    }
}
