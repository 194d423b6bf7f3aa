//! Page-table descriptor primitives (4 KiB granule, 39-bit address space)
//!
//! The EL2 stage-1 map uses a single self-referential table (see
//! `memory_map`); stage 2 uses a conventional three-level walk over
//! statically allocated table pages.

use bitflags::bitflags;

pub const PAGE_SIZE: usize = 0x1000;
pub const ENTRIES_PER_TABLE: usize = 512;

pub const L1_SHIFT: usize = 30;
pub const L2_SHIFT: usize = 21;
pub const L3_SHIFT: usize = 12;

const PA_MASK: u64 = 0x0000_FFFF_FFFF_F000;

bitflags! {
    /// Stage-1 descriptor bits (EL2 regime)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteS1: u64 {
        const VALID      = 1 << 0;
        /// Table descriptor at L1/L2, page descriptor at L3
        const TABLE_PAGE = 1 << 1;
        const NS         = 1 << 5;
        const AP_RO      = 1 << 7;
        const SH_OUTER   = 0b10 << 8;
        const SH_INNER   = 0b11 << 8;
        const AF         = 1 << 10;
        const NG         = 1 << 11;
        const XN         = 1 << 54;
    }
}

bitflags! {
    /// Stage-2 descriptor bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteS2: u64 {
        const VALID      = 1 << 0;
        const TABLE_PAGE = 1 << 1;
        /// MemAttr[3:0] = 0b1111: Normal WB/WB, combines to the stage-1 type
        const MEMATTR_NORMAL = 0b1111 << 2;
        /// MemAttr[3:0] = 0b0001: Device-nGnRE
        const MEMATTR_DEV_NGNRE = 0b0001 << 2;
        const S2AP_READ  = 1 << 6;
        const S2AP_WRITE = 1 << 7;
        const SH_INNER   = 0b11 << 8;
        const AF         = 1 << 10;
        const XN         = 1 << 54;
    }
}

/// Memory attribute indices programmed into MAIR_EL2. The GUEST slot is
/// rewritten on the fly by guest_memory to match whatever PAR_EL1 reports.
pub const MEMTYPE_DEVICE_NGNRNE: u64 = 0;
pub const MEMTYPE_NORMAL: u64 = 1;
pub const MEMTYPE_DEVICE_NGNRE: u64 = 2;
pub const MEMTYPE_NORMAL_NC: u64 = 3;
pub const MEMTYPE_GUEST_SLOT: u64 = 4;

/// MAIR_EL2 value matching the indices above (attr0 = 0x00 Device-nGnRnE,
/// attr1 = 0xFF Normal WBWA, attr2 = 0x04 Device-nGnRE, attr3 = 0x44 Normal
/// NC); the guest slot (attr4) starts as Device-nGnRnE and is repointed per
/// access.
pub const MAIR_EL2_VALUE: u64 = 0x0000_0000_4404_FF00;

#[inline]
pub const fn s1_attr_index(idx: u64) -> u64 {
    (idx & 7) << 2
}

#[inline]
pub const fn s1_shareability(sh: u64) -> u64 {
    (sh & 3) << 8
}

/// Standard attributes for hypervisor-owned normal memory
pub fn s1_normal_attribs() -> u64 {
    (PteS1::VALID | PteS1::AF | PteS1::SH_INNER).bits() | s1_attr_index(MEMTYPE_NORMAL)
}

/// Standard attributes for device MMIO
pub fn s1_device_attribs() -> u64 {
    (PteS1::VALID | PteS1::AF | PteS1::SH_INNER | PteS1::XN).bits()
        | s1_attr_index(MEMTYPE_DEVICE_NGNRE)
}

#[inline]
pub const fn table_index(va: u64, shift: usize) -> usize {
    ((va >> shift) & 0x1FF) as usize
}

#[inline]
pub const fn descriptor_pa(desc: u64) -> u64 {
    desc & PA_MASK
}

pub fn init_table(table: &mut [u64; ENTRIES_PER_TABLE]) {
    for e in table.iter_mut() {
        *e = 0;
    }
}

/// Write a page descriptor for `va` into a self-referential last-level
/// table whose L3 window starts at `l3_base_va`.
pub fn map_page(
    table: &mut [u64; ENTRIES_PER_TABLE],
    l3_base_va: u64,
    va: u64,
    pa: u64,
    attribs: u64,
) {
    let idx = ((va - l3_base_va) as usize) >> L3_SHIFT;
    table[idx & (ENTRIES_PER_TABLE - 1)] =
        (pa & PA_MASK) | attribs | PteS1::VALID.bits() | PteS1::TABLE_PAGE.bits();
}

pub fn unmap_page(table: &mut [u64; ENTRIES_PER_TABLE], l3_base_va: u64, va: u64) {
    let idx = ((va - l3_base_va) as usize) >> L3_SHIFT;
    table[idx & (ENTRIES_PER_TABLE - 1)] = 0;
}

pub fn map_page_range(
    table: &mut [u64; ENTRIES_PER_TABLE],
    l3_base_va: u64,
    va: u64,
    pa: u64,
    size: usize,
    attribs: u64,
) {
    let size = (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    let mut off = 0;
    while off < size {
        map_page(table, l3_base_va, va + off as u64, pa + off as u64, attribs);
        off += PAGE_SIZE;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_page_sets_page_descriptor() {
        let mut table = [0u64; ENTRIES_PER_TABLE];
        map_page(&mut table, 0x7F_FFE0_0000, 0x7F_FFE0_3000, 0x8000_1000, s1_normal_attribs());
        let desc = table[3];
        assert_eq!(desc & 3, 3); // valid + page
        assert_eq!(descriptor_pa(desc), 0x8000_1000);
        assert_ne!(desc & PteS1::AF.bits(), 0);
    }

    #[test]
    fn unmap_page_clears_entry() {
        let mut table = [0u64; ENTRIES_PER_TABLE];
        map_page(&mut table, 0x7F_FFE0_0000, 0x7F_FFE0_3000, 0x8000_1000, s1_normal_attribs());
        unmap_page(&mut table, 0x7F_FFE0_0000, 0x7F_FFE0_3000);
        assert_eq!(table[3], 0);
    }

    #[test]
    fn range_mapping_is_contiguous() {
        let mut table = [0u64; ENTRIES_PER_TABLE];
        map_page_range(&mut table, 0x7F_FFE0_0000, 0x7F_FFE0_0000, 0x4000_0000, 0x3000, s1_normal_attribs());
        for i in 0..3 {
            assert_eq!(descriptor_pa(table[i]), 0x4000_0000 + (i as u64) * 0x1000);
        }
        assert_eq!(table[3], 0);
    }

    #[test]
    fn device_attribs_are_xn() {
        assert_ne!(s1_device_attribs() & PteS1::XN.bits(), 0);
        assert_eq!(s1_normal_attribs() & PteS1::XN.bits(), 0);
    }
}
