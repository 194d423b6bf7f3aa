//! EL2 virtual memory layout and MMU bring-up
//!
//! The hypervisor owns a 39-bit EL2 address space backed by a single
//! self-referential translation table: entry 511 of the top-level table
//! points at the table itself, which makes the table double as its own L2
//! and L3 for the top of the address space. Everything the hypervisor maps
//! lives in the last 2 MiB L3 range, so one 4 KiB table page is the entire
//! stage-1 translation structure, and the running table is always writable
//! at `VA_TTBL` with no extra mapping work.
//!
//! Layout of the last L3 range (all VAs):
//!   VA_IMAGE              image (code + data + BSS), then tempbss
//!   VA_CRASH_STACKS       4 KiB crash stack per core
//!   VA_STACKS_TOP         per-core stack with a guard page below each
//!   VA_GUEST_MEM          per-core 4 KiB guest aliasing window (1 page gap)
//!   VA_GICD/GICC/GICH     GIC blocks (GICC maps the *virtual* interface)
//!   VA_MMIO_PLAT_BASE     bump-allocated platform device windows
//!   VA_TTBL               the translation table itself

use spin::Mutex;

use crate::arch::{barrier, cache, sysreg};
use crate::mmu::{self, ENTRIES_PER_TABLE};

pub const VA_SPACE_SIZE: u64 = 39;

pub const VA_L3_BASE: u64 = 0x7F_FFE0_0000;
pub const VA_IMAGE: u64 = VA_L3_BASE;
pub const VA_CRASH_STACKS_BOTTOM: u64 = 0x7F_FFF0_0000;
pub const CRASH_STACKS_SIZE: usize = 0x4000;
pub const VA_STACKS_TOP: u64 = 0x7F_FFF4_0000;
pub const VA_GUEST_MEM: u64 = 0x7F_FFF6_0000;
pub const VA_GICD: u64 = 0x7F_FFF8_0000;
pub const VA_GICC: u64 = 0x7F_FFF8_1000;
pub const VA_GICH: u64 = 0x7F_FFF8_3000;
pub const VA_MMIO_PLAT_BASE: u64 = 0x7F_FFF9_0000;
pub const VA_TTBL: u64 = 0x7F_FFFF_F000;

/// Handed over by the loader, read-only afterwards.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct LoadImageLayout {
    pub start_pa: u64,
    pub max_image_size: usize,
    pub image_size: usize,
    pub temp_pa: u64,
    pub max_temp_size: usize,
    pub temp_size: usize,
    pub vbar: u64,
}

static mut LAYOUT: LoadImageLayout = LoadImageLayout {
    start_pa: 0,
    max_image_size: 0,
    image_size: 0,
    temp_pa: 0,
    max_temp_size: 0,
    temp_size: 0,
    vbar: 0,
};

pub fn layout() -> &'static LoadImageLayout {
    unsafe { &*core::ptr::addr_of!(LAYOUT) }
}

/// Physical address of image memory mapped at an image VA.
pub fn image_va_to_pa(va: u64) -> u64 {
    va - VA_IMAGE + layout().start_pa
}

#[cfg(target_arch = "aarch64")]
fn running_table() -> &'static mut [u64; ENTRIES_PER_TABLE] {
    unsafe { &mut *(VA_TTBL as *mut [u64; ENTRIES_PER_TABLE]) }
}

#[cfg(not(target_arch = "aarch64"))]
fn running_table() -> &'static mut [u64; ENTRIES_PER_TABLE] {
    static mut HOST_TTBL: [u64; ENTRIES_PER_TABLE] = [0; ENTRIES_PER_TABLE];
    unsafe { &mut *core::ptr::addr_of_mut!(HOST_TTBL) }
}

/// Build the EL2 stage-1 table. `mmu_table` is a physical pointer into the
/// temp region; the MMU is still off.
pub fn setup_mmu(layout: &LoadImageLayout, mmu_table: *mut u64) {
    let table = unsafe { &mut *(mmu_table as *mut [u64; ENTRIES_PER_TABLE]) };
    mmu::init_table(table);

    // Self-reference: the table reuses itself as L2 for 0x7FC0000000+ and as
    // L3 for the last 2 MiB, and appears at VA_TTBL.
    table[ENTRIES_PER_TABLE - 1] = (mmu_table as u64)
        | mmu::PteS1::VALID.bits()
        | mmu::PteS1::TABLE_PAGE.bits()
        | mmu::PteS1::AF.bits()
        | mmu::PteS1::XN.bits();

    let normal = mmu::s1_normal_attribs();
    let device = mmu::s1_device_attribs();

    // Image + as much of the temp region as fits behind it
    let temp_in_image_max = layout.max_image_size - layout.image_size;
    let (temp_in_image, temp_extra) = if layout.temp_size <= temp_in_image_max {
        (layout.temp_size, 0)
    } else {
        (temp_in_image_max, layout.temp_size - temp_in_image_max)
    };
    let image_map_size = (layout.image_size + temp_in_image + 0xFFF) & !0xFFF;
    let temp_extra_map_size = (temp_extra + 0xFFF) & !0xFFF;

    let mut va = VA_IMAGE;
    mmu::map_page_range(table, VA_L3_BASE, va, layout.start_pa, image_map_size, normal);
    va += image_map_size as u64;
    let mut pa = layout.temp_pa;
    mmu::map_page_range(table, VA_L3_BASE, va, pa, temp_extra_map_size, normal);
    pa += temp_extra_map_size as u64;

    // Crash stacks (fixed total size)
    mmu::map_page_range(
        table,
        VA_L3_BASE,
        VA_CRASH_STACKS_BOTTOM,
        pa,
        CRASH_STACKS_SIZE,
        normal,
    );
    pa += CRASH_STACKS_SIZE as u64;

    // Regular stacks, one page each with a guard page below
    let stack_size = mmu::PAGE_SIZE;
    let mut stack_va = VA_STACKS_TOP - stack_size as u64;
    for _ in 0..crate::core_ctx::MAX_CORES {
        mmu::map_page_range(table, VA_L3_BASE, stack_va, pa, stack_size, normal);
        stack_va -= 2 * stack_size as u64;
        pa += stack_size as u64;
    }

    // GIC: the GICC window maps the *virtual* CPU interface so EL2's own
    // accesses and the guest's see the same interface the LRs feed
    let plat = crate::platform::active();
    mmu::map_page(table, VA_L3_BASE, VA_GICD, plat.gicd_pa as u64, device);
    mmu::map_page_range(table, VA_L3_BASE, VA_GICC, plat.gicc_pa as u64, 0x2000, device);
    mmu::map_page(table, VA_L3_BASE, VA_GICH, plat.gich_pa as u64, device);
}

/// TCR_EL2 RES1 bits (bit 31 and bit 23)
const TCR_EL2_RSVD: u64 = (1 << 31) | (1 << 23);

pub fn tcr_el2_value() -> u64 {
    let ps = sysreg::read_id_aa64mmfr0_el1() & 0xF;
    TCR_EL2_RSVD
        | (ps << 16)             // PS: detected PA size
        | (0b00 << 14)           // TG0: 4KB granule
        | (0b11 << 12)           // SH0: inner shareable
        | (0b01 << 10)           // ORGN0: WBWA
        | (0b01 << 8)            // IRGN0: WBWA
        | (64 - VA_SPACE_SIZE)   // T0SZ
}

/// Turn the MMU on. VBAR_EL2 is installed first: the fetch after SCTLR.M is
/// set faults on the stale physical PC, and the vector at its final VA is
/// what carries execution across.
pub fn enable_mmu(layout: &LoadImageLayout) {
    unsafe {
        LAYOUT = *layout;

        let mmu_table_pa = layout.temp_pa + layout.max_temp_size as u64;

        sysreg::write_vbar_el2(layout.vbar);

        sysreg::write_ttbr0_el2(mmu_table_pa);
        sysreg::write_tcr_el2(tcr_el2_value());
        sysreg::write_mair_el2(mmu::MAIR_EL2_VALUE);
        barrier::dsb_local();
        barrier::isb();

        cache::tlb_invalidate_el2_local();
        barrier::dsb_local();
        barrier::isb();

        let mut sctlr = sysreg::read_sctlr_el2();
        sctlr |= (1 << 12) | (1 << 2) | (1 << 0); // I, C, M
        sysreg::write_sctlr_el2(sctlr);
        barrier::dsb_local();
        barrier::isb();
    }
}

pub fn stack_top(core_id: u32) -> u64 {
    VA_STACKS_TOP - 0x2000 * core_id as u64
}

pub fn crash_stack_top(core_id: u32) -> u64 {
    VA_CRASH_STACKS_BOTTOM + 0x1000 * (core_id as u64 + 1)
}

/// Per-core guest aliasing window VA (one page, one-page gap between cores).
pub fn guest_mem_window(core_id: u32) -> u64 {
    VA_GUEST_MEM + 0x2000 * core_id as u64
}

/// Map a page into this core's guest window with caller-chosen attributes.
pub fn map_guest_window_page(core_id: u32, pa: u64, attribs: u64) -> u64 {
    let va = guest_mem_window(core_id);
    mmu::map_page(running_table(), VA_L3_BASE, va, pa, attribs);
    va
}

pub fn unmap_guest_window_page(core_id: u32) {
    mmu::unmap_page(running_table(), VA_L3_BASE, guest_mem_window(core_id));
}

static MMIO_ALLOC: Mutex<u64> = Mutex::new(VA_MMIO_PLAT_BASE);

/// Map a physical device range at a fresh EL2 VA. Non-reentrant with
/// respect to the returned region (no unmap).
pub fn platform_mmio(pa: u64, size: usize) -> u64 {
    let mut next = MMIO_ALLOC.lock();
    let va = *next;
    let size = (size + 0xFFF) & !0xFFF;
    mmu::map_page_range(
        running_table(),
        VA_L3_BASE,
        va,
        pa,
        size,
        mmu::s1_device_attribs(),
    );
    *next += size as u64;
    va
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_regions_do_not_overlap() {
        assert!(VA_IMAGE < VA_CRASH_STACKS_BOTTOM);
        assert!(VA_CRASH_STACKS_BOTTOM + CRASH_STACKS_SIZE as u64 <= VA_STACKS_TOP - 0x2000 * 4);
        assert!(VA_STACKS_TOP <= VA_GUEST_MEM);
        assert!(VA_GUEST_MEM + 0x2000 * 4 <= VA_GICD);
        assert!(VA_GICH + 0x1000 <= VA_MMIO_PLAT_BASE);
        assert!(VA_MMIO_PLAT_BASE < VA_TTBL);
        // Everything must live inside the recursive L3 window
        assert_eq!(VA_L3_BASE & ((1 << 21) - 1), 0);
        assert!(VA_TTBL < VA_L3_BASE + (1 << 21));
    }

    #[test]
    fn stack_tops_are_guard_separated() {
        assert_eq!(stack_top(0) - stack_top(1), 0x2000);
        assert_eq!(stack_top(0), VA_STACKS_TOP);
    }

    #[test]
    fn mmio_allocator_hands_out_fresh_pages() {
        let a = platform_mmio(0x7000_0000, 0x100);
        let b = platform_mmio(0x7000_2000, 0x2000);
        assert_eq!(a & 0xFFF, 0);
        assert!(b >= a + 0x1000);
    }

    #[test]
    fn tcr_t0sz_matches_va_space() {
        assert_eq!(tcr_el2_value() & 0x3F, 25);
    }
}
