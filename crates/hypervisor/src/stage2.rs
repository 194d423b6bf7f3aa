//! Stage-2 translation: guest IPA -> host PA
//!
//! The map is a static identity over the guest-visible address space, built
//! once by the boot core, with two substitutions inside the GIC 2 MiB
//! region:
//!  - the guest's GICC pages are remapped onto GICV, so the guest programs
//!    the virtual CPU interface thinking it is the physical one;
//!  - GICD and GICH are left unmapped, so distributor accesses trap into the
//!    emulator and the hypervisor control interface is unreachable.
//!
//! No demand paging: a stage-2 fault outside the GICD page is a guest bug.

use crate::arch::{barrier, cache, sysreg};
use crate::memory_map;
use crate::mmu::{self, PteS2, ENTRIES_PER_TABLE};

#[repr(C, align(4096))]
struct Stage2Table([u64; ENTRIES_PER_TABLE]);

static mut S2_L1: Stage2Table = Stage2Table([0; ENTRIES_PER_TABLE]);
static mut S2_L2: Stage2Table = Stage2Table([0; ENTRIES_PER_TABLE]);
static mut S2_L3: Stage2Table = Stage2Table([0; ENTRIES_PER_TABLE]);

fn s2_normal_block() -> u64 {
    // MemAttr = Normal WB/WB combines to whatever stage 1 asked for
    // ("unchanged"), S2AP = RW
    (PteS2::VALID | PteS2::MEMATTR_NORMAL | PteS2::S2AP_READ | PteS2::S2AP_WRITE
        | PteS2::SH_INNER | PteS2::AF)
        .bits()
}

fn s2_device_page() -> u64 {
    (PteS2::VALID | PteS2::TABLE_PAGE | PteS2::MEMATTR_DEV_NGNRE
        | PteS2::S2AP_READ | PteS2::S2AP_WRITE | PteS2::AF | PteS2::XN)
        .bits()
}

/// Build the identity map with the GIC substitutions. Returns the table root
/// PA for VTTBR_EL2.
pub fn configure() -> u64 {
    let plat = crate::platform::active();

    let gic_l1_idx = mmu::table_index(plat.gicd_pa as u64, mmu::L1_SHIFT);
    let gic_l2_idx = mmu::table_index(plat.gicd_pa as u64, mmu::L2_SHIFT);
    let gic_2mb_base = (plat.gicd_pa as u64) & !((1 << mmu::L2_SHIFT) - 1);

    unsafe {
        let l1 = &mut *core::ptr::addr_of_mut!(S2_L1.0);
        let l2 = &mut *core::ptr::addr_of_mut!(S2_L2.0);
        let l3 = &mut *core::ptr::addr_of_mut!(S2_L3.0);

        // Identity 1 GiB blocks everywhere...
        for (i, entry) in l1.iter_mut().enumerate() {
            *entry = ((i as u64) << mmu::L1_SHIFT) | s2_normal_block();
        }

        // ...except the GiB holding the GIC, which goes through an L2
        let l2_pa = memory_map::image_va_to_pa(core::ptr::addr_of!(S2_L2) as u64);
        l1[gic_l1_idx] = l2_pa | (PteS2::VALID | PteS2::TABLE_PAGE).bits();

        let gib_base = (plat.gicd_pa as u64) & !((1 << mmu::L1_SHIFT) - 1);
        for (i, entry) in l2.iter_mut().enumerate() {
            *entry = (gib_base + ((i as u64) << mmu::L2_SHIFT)) | s2_normal_block();
        }

        // ...and the 2 MiB holding the GIC goes through an L3
        let l3_pa = memory_map::image_va_to_pa(core::ptr::addr_of!(S2_L3) as u64);
        l2[gic_l2_idx] = l3_pa | (PteS2::VALID | PteS2::TABLE_PAGE).bits();

        for (i, entry) in l3.iter_mut().enumerate() {
            let page_pa = gic_2mb_base + ((i as u64) << mmu::L3_SHIFT);
            *entry = map_gic_page(plat, page_pa);
        }

        memory_map::image_va_to_pa(core::ptr::addr_of!(S2_L1) as u64)
    }
}

/// Stage-2 descriptor for one page of the GIC 2 MiB region.
fn map_gic_page(plat: &crate::platform::PlatformDescriptor, page_pa: u64) -> u64 {
    let gicd = plat.gicd_pa as u64;
    let gicc = plat.gicc_pa as u64;
    let gich = plat.gich_pa as u64;
    let gicv = plat.gicv_pa as u64;

    if page_pa == gicc || page_pa == gicc + 0x1000 {
        // Transparent GICC -> GICV substitution (main page + DIR alias page)
        (gicv + (page_pa - gicc)) | s2_device_page()
    } else if page_pa >= gicd && page_pa < gicd + 0x1000 {
        // Unmapped: faults feed the distributor emulator
        0
    } else if page_pa >= gich && page_pa < gich + 0x1_0000 {
        // Unmapped: the guest gets no way to program the LRs; this span also
        // covers the real GICV alias on the Tegra layout
        0
    } else if page_pa >= gicv && page_pa < gicv + 0x1_0000 {
        0
    } else if page_pa >= gicc && page_pa < gicc + 0x1_0000 {
        // Upper GICC alias pages (QEMU maps a 64 KiB window)
        0
    } else {
        page_pa | s2_device_page()
    }
}

/// VTCR_EL2 RES1 bit
const VTCR_EL2_RSVD: u64 = 1 << 31;

pub fn vtcr_value() -> u64 {
    let ps = sysreg::read_id_aa64mmfr0_el1() & 0xF;
    VTCR_EL2_RSVD
        | (ps << 16)                           // PS
        | (0b00 << 14)                         // TG0: 4KB
        | (0b11 << 12)                         // SH0: inner shareable
        | (0b01 << 10)                         // ORGN0: WBWA
        | (0b01 << 8)                          // IRGN0: WBWA
        | (0b01 << 6)                          // SL0: start at level 1
        | (64 - memory_map::VA_SPACE_SIZE)     // T0SZ
}

const HCR_VM: u64 = 1 << 0;

static VTTBR: core::sync::atomic::AtomicU64 = core::sync::atomic::AtomicU64::new(0);

/// Program and enable stage-2 translation on this core. The table itself is
/// built once, by whichever core gets here first (the boot core on cold
/// boot).
pub fn configure_and_enable() {
    use core::sync::atomic::Ordering;

    let mut vttbr = VTTBR.load(Ordering::Acquire);
    if vttbr == 0 {
        vttbr = configure();
        VTTBR.store(vttbr, Ordering::Release);
    }

    unsafe {
        sysreg::write_vttbr_el2(vttbr);
        sysreg::write_vtcr_el2(vtcr_value());
        barrier::dsb_local();
        barrier::isb();

        let hcr = sysreg::read_hcr_el2();
        sysreg::write_hcr_el2(hcr | HCR_VM);
        barrier::dsb_local();
        barrier::isb();
    }

    cache::tlb_invalidate_el1_stage12_local();
    barrier::dsb_local();
    barrier::isb();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gic_substitutions() {
        let plat = crate::platform::active();
        // GICD and GICH pages are holes
        assert_eq!(map_gic_page(plat, plat.gicd_pa as u64), 0);
        assert_eq!(map_gic_page(plat, plat.gich_pa as u64), 0);
        // GICC goes to GICV
        let desc = map_gic_page(plat, plat.gicc_pa as u64);
        assert_eq!(mmu::descriptor_pa(desc), plat.gicv_pa as u64);
        let desc2 = map_gic_page(plat, plat.gicc_pa as u64 + 0x1000);
        assert_eq!(mmu::descriptor_pa(desc2), plat.gicv_pa as u64 + 0x1000);
    }

    #[test]
    fn other_device_pages_are_identity() {
        let plat = crate::platform::active();
        let pa = (plat.gicd_pa as u64 & !0x1F_FFFF) + 0x1000;
        if pa != plat.gicd_pa as u64 {
            let desc = map_gic_page(plat, pa);
            assert_eq!(mmu::descriptor_pa(desc), pa);
            assert_ne!(desc & PteS2::XN.bits(), 0);
        }
    }

    #[test]
    fn vtcr_starts_walk_at_level_1() {
        let vtcr = vtcr_value();
        assert_eq!((vtcr >> 6) & 3, 1);
        assert_eq!(vtcr & 0x3F, 25);
    }
}
