//! Guest memory access
//!
//! Copies bytes between hypervisor memory and arbitrary guest *virtual*
//! addresses, one page at a time:
//!
//! 1. `AT S12E1R` resolves the guest VA through both translation stages.
//! 2. A stage-2 fault whose IPA is the GICD page is redirected to the
//!    distributor emulator.
//! 3. A stage-1 fault means the guest itself cannot see the address: reads
//!    come back zero-filled and short, writes are discarded.
//! 4. Otherwise the resolved host PA is mapped into this core's private
//!    aliasing window with the exact attributes and shareability PAR_EL1
//!    reported (via the mutable MAIR slot), dodging the architectural
//!    mismatched-attributes trap.
//!
//! Writes finish with clean-to-PoU + I-cache invalidation + EL1 TLB
//! invalidation so patched instructions and page tables become visible
//! immediately.
//!
//! Device-memory copies may hit bus errors; the copy runs with the core
//! context register cleared, and the SError vector restores it to signal
//! the loop to stop (the caller then sees a short count).

#[cfg(target_arch = "aarch64")]
use crate::arch::{barrier, cache, sysreg};
#[cfg(target_arch = "aarch64")]
use crate::core_ctx::{self, current_core_id};
#[cfg(target_arch = "aarch64")]
use crate::memory_map;
#[cfg(target_arch = "aarch64")]
use crate::mmu;

#[cfg(target_arch = "aarch64")]
mod par {
    pub const PAR_F: u64 = 1 << 0;
    pub const PAR_S: u64 = 1 << 9;
    pub const PAR_SH_SHIFT: u64 = 7;
    pub const PAR_SH_MASK: u64 = 3;
    pub const PAR_ATTR_SHIFT: u64 = 56;
    pub const PAR_ATTR_MASK: u64 = 0xFF;
    pub const PAR_PA_MASK: u64 = 0x0000_FFFF_FFFF_F000;
}
#[cfg(target_arch = "aarch64")]
use par::*;

/// Copy between guest VA space and hypervisor buffers. Returns the number of
/// bytes actually transferred; a short count means a fault cut the access.
/// `read_buf` and `write_buf` select the direction(s).
pub fn guest_read_write_memory(
    addr: u64,
    size: usize,
    read_buf: Option<&mut [u8]>,
    write_buf: Option<&[u8]>,
) -> usize {
    let mut cur = addr;
    let mut remaining = size;
    let mut done = 0usize;
    let mut read_rest = read_buf;

    while remaining > 0 {
        let to_page_end = ((cur & !0xFFF) + 0x1000 - cur) as usize;
        let expected = to_page_end.min(remaining);

        let (rb, rb_later) = match read_rest.take() {
            Some(b) => {
                let (now, later) = b.split_at_mut(expected);
                (Some(now), Some(later))
            }
            None => (None, None),
        };
        let wb = write_buf.map(|b| &b[done..done + expected]);

        let actual = guest_read_write_memory_page(cur, expected, rb, wb);
        read_rest = rb_later;
        cur += actual as u64;
        done += actual;
        remaining -= actual;
        if actual != expected {
            break;
        }
    }

    done
}

pub fn guest_read_memory(addr: u64, buf: &mut [u8]) -> usize {
    guest_read_write_memory(addr, buf.len(), Some(buf), None)
}

pub fn guest_write_memory(addr: u64, buf: &[u8]) -> usize {
    guest_read_write_memory(addr, buf.len(), None, Some(buf))
}

#[cfg(target_arch = "aarch64")]
fn guest_read_write_memory_page(
    addr: u64,
    size: usize,
    read_buf: Option<&mut [u8]>,
    write_buf: Option<&[u8]>,
) -> usize {
    let flags = crate::arch::mask_irq();
    let offset = addr & 0xFFF;

    sysreg::at_s12e1r(addr);
    let par = sysreg::read_par_el1();

    let transferred;
    if par & PAR_F != 0 {
        if par & PAR_S != 0 {
            // Stage-2 fault; if the IPA is the GICD page this is a
            // debugger-side distributor access
            sysreg::at_s1e1r(addr);
            let par1 = sysreg::read_par_el1();
            let gicd_pa = crate::platform::active().gicd_pa as u64;
            if par1 & PAR_F == 0 && par1 & PAR_PA_MASK == gicd_pa {
                transferred = crate::vgic::guest_read_write_gicd(offset as usize, size, read_buf, write_buf);
            } else {
                // The guest maps it, but to something it cannot reach
                if let Some(rb) = read_buf {
                    rb.fill(0);
                }
                transferred = size;
            }
        } else {
            // Stage-1 fault: the address does not exist for the guest
            transferred = 0;
        }
    } else {
        let mem_attribs = (par >> PAR_ATTR_SHIFT) & PAR_ATTR_MASK;
        let shareability = (par >> PAR_SH_SHIFT) & PAR_SH_MASK;
        let pa = par & PAR_PA_MASK;
        let core = current_core_id();

        // Point the mutable MAIR slot at the guest's effective attributes
        let mair = sysreg::read_mair_el2();
        unsafe {
            sysreg::write_mair_el2(
                mair | (mem_attribs << (8 * mmu::MEMTYPE_GUEST_SLOT)),
            );
        }
        barrier::isb();

        let attribs = mmu::PteS1::XN.bits()
            | mmu::PteS1::AF.bits()
            | mmu::s1_shareability(shareability)
            | mmu::s1_attr_index(mmu::MEMTYPE_GUEST_SLOT);
        let window = memory_map::map_guest_window_page(core, pa, attribs);
        cache::tlb_invalidate_el2_page_local(window as usize);
        barrier::dsb_local();

        let va = window + offset;
        if mem_attribs & 0xF0 != 0 {
            transferred = read_write_normal(va, size, read_buf, write_buf);
        } else {
            transferred = read_write_device(va, size, read_buf, write_buf);
        }

        barrier::dsb_local();
        barrier::isb();
        memory_map::unmap_guest_window_page(core);
        cache::tlb_invalidate_el2_page_local(window as usize);
        barrier::dsb_local();

        unsafe {
            sysreg::write_mair_el2(
                sysreg::read_mair_el2() & !(0xFF << (8 * mmu::MEMTYPE_GUEST_SLOT)),
            );
        }
        barrier::isb();
    }

    crate::arch::restore_interrupt_flags(flags);
    transferred
}

#[cfg(target_arch = "aarch64")]
fn read_write_normal(
    va: u64,
    size: usize,
    read_buf: Option<&mut [u8]>,
    write_buf: Option<&[u8]>,
) -> usize {
    if let Some(rb) = read_buf {
        unsafe { core::ptr::copy_nonoverlapping(va as *const u8, rb.as_mut_ptr(), size) };
    }
    if let Some(wb) = write_buf {
        unsafe { core::ptr::copy_nonoverlapping(wb.as_ptr(), va as *mut u8, size) };
        // The write may have hit executable memory or live translation
        // tables, possibly via other aliases
        cache::coherency_for_guest_write(va as usize, size);
    }
    size
}

/// Bus-error-tolerant device copy: runs with the core context register
/// cleared; the SError handler restores it, which stops the loop.
#[cfg(target_arch = "aarch64")]
fn read_write_device(
    va: u64,
    size: usize,
    read_buf: Option<&mut [u8]>,
    write_buf: Option<&[u8]>,
) -> usize {
    let core = current_core_id();

    core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::SeqCst);
    core_ctx::set_ctx_register_null();
    core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::SeqCst);

    let mut ok_bytes = size;

    if let Some(rb) = read_buf {
        let mut off = 0usize;
        while off < size && core_ctx::is_ctx_register_null() {
            let a = va as usize + off;
            let rem = size - off;
            unsafe {
                if a % 4 == 0 && rem >= 4 {
                    let v = core::ptr::read_volatile(a as *const u32);
                    rb[off..off + 4].copy_from_slice(&v.to_le_bytes());
                    off += 4;
                } else if a % 2 == 0 && rem >= 2 {
                    let v = core::ptr::read_volatile(a as *const u16);
                    rb[off..off + 2].copy_from_slice(&v.to_le_bytes());
                    off += 2;
                } else {
                    rb[off] = core::ptr::read_volatile(a as *const u8);
                    off += 1;
                }
            }
        }
        if off != size {
            ok_bytes = off;
        }
    }

    if ok_bytes == size {
        if let Some(wb) = write_buf {
            let mut off = 0usize;
            while off < size && core_ctx::is_ctx_register_null() {
                let a = va as usize + off;
                let rem = size - off;
                unsafe {
                    if a % 4 == 0 && rem >= 4 {
                        let mut bytes = [0u8; 4];
                        bytes.copy_from_slice(&wb[off..off + 4]);
                        core::ptr::write_volatile(a as *mut u32, u32::from_le_bytes(bytes));
                        off += 4;
                    } else if a % 2 == 0 && rem >= 2 {
                        let mut bytes = [0u8; 2];
                        bytes.copy_from_slice(&wb[off..off + 2]);
                        core::ptr::write_volatile(a as *mut u16, u16::from_le_bytes(bytes));
                        off += 2;
                    } else {
                        core::ptr::write_volatile(a as *mut u8, wb[off]);
                        off += 1;
                    }
                }
            }
            if off != size {
                ok_bytes = off;
            }
        }
    }

    core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::SeqCst);
    core_ctx::restore_ctx_register(core);
    core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::SeqCst);

    ok_bytes
}

// Host build: a small flat "guest RAM" stands in for the translated guest
// address space so the layers above (software breakpoints, GDB memory
// commands) can be exercised off-target.
#[cfg(not(target_arch = "aarch64"))]
pub const HOST_GUEST_RAM_BASE: u64 = 0x4000_0000;
#[cfg(not(target_arch = "aarch64"))]
pub const HOST_GUEST_RAM_SIZE: usize = 0x1_0000;

#[cfg(not(target_arch = "aarch64"))]
static HOST_GUEST_RAM: spin::Mutex<[u8; HOST_GUEST_RAM_SIZE]> =
    spin::Mutex::new([0; HOST_GUEST_RAM_SIZE]);

#[cfg(not(target_arch = "aarch64"))]
fn guest_read_write_memory_page(
    addr: u64,
    size: usize,
    read_buf: Option<&mut [u8]>,
    write_buf: Option<&[u8]>,
) -> usize {
    if addr < HOST_GUEST_RAM_BASE
        || addr + size as u64 > HOST_GUEST_RAM_BASE + HOST_GUEST_RAM_SIZE as u64
    {
        return 0;
    }
    let off = (addr - HOST_GUEST_RAM_BASE) as usize;
    let mut ram = HOST_GUEST_RAM.lock();
    if let Some(rb) = read_buf {
        rb.copy_from_slice(&ram[off..off + size]);
    }
    if let Some(wb) = write_buf {
        ram[off..off + size].copy_from_slice(wb);
    }
    size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_roundtrip() {
        let addr = HOST_GUEST_RAM_BASE + 0x100;
        let data = [0x20, 0x00, 0x80, 0xD2u8]; // mov x0, #1
        assert_eq!(guest_write_memory(addr, &data), 4);
        let mut back = [0u8; 4];
        assert_eq!(guest_read_memory(addr, &mut back), 4);
        assert_eq!(back, data);
    }

    #[test]
    fn unmapped_address_reports_zero_bytes() {
        let mut buf = [0u8; 8];
        assert_eq!(guest_read_memory(0x10, &mut buf), 0);
    }

    #[test]
    fn cross_page_copy_is_split_but_complete() {
        let addr = HOST_GUEST_RAM_BASE + 0xFFC;
        let data = [1u8, 2, 3, 4, 5, 6, 7, 8];
        assert_eq!(guest_write_memory(addr, &data), 8);
        let mut back = [0u8; 8];
        assert_eq!(guest_read_memory(addr, &mut back), 8);
        assert_eq!(back, data);
    }
}
