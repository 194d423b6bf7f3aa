//! Hardware watchpoints
//!
//! The debugger's requests ("split" entries: exact address, size, direction)
//! are stored verbatim, then folded into at most 16 hardware register pairs
//! ("combined" entries):
//!
//! - a size >= 16, power-of-two, size-aligned range becomes a MASK entry;
//! - a range of up to 9 bytes covers one or two 8-byte doublewords through
//!   the byte-address-select mask, sharing a hardware slot with any
//!   neighbour that watches the same doubleword.
//!
//! Folding ORs the BAS and LSC fields, which can *broaden* a watchpoint
//! (read-only + write-only sharing a slot watches read-write). The debug
//! exception handler therefore re-checks against the split table and stays
//! silent on broadened false positives.

use super::{load_watchpoint_regs, DebugControl, DebugRegisterPair};
use crate::arch::sysreg;
use crate::lib::error::{HvError, Result};
use crate::smp;
use crate::sync::RecursiveSpinlock;

pub const MAX_COMBINED_WATCHPOINTS: usize = 16;
pub const MAX_SPLIT_WATCHPOINTS: usize = 128;

/// vr marker bits (RES0 in hardware): entry continues in the next slot /
/// entry is such a continuation
const VR_HAS_SECOND: u64 = 1;
const VR_IS_SECOND: u64 = 2;

fn overlaps(a_start: u64, a_size: u64, b_start: u64, b_size: u64) -> bool {
    a_start < b_start + b_size && b_start < a_start + a_size
}

pub struct WatchpointManager {
    pub max_watchpoints: u32,
    pub max_split_watchpoints: u32,
    allocation_bitmap: u16,
    num_split: usize,
    split: [DebugRegisterPair; MAX_SPLIT_WATCHPOINTS],
    combined: [DebugRegisterPair; MAX_COMBINED_WATCHPOINTS],
}

impl WatchpointManager {
    pub const fn new() -> Self {
        Self {
            max_watchpoints: 0,
            max_split_watchpoints: 0,
            allocation_bitmap: 0,
            num_split: 0,
            split: [DebugRegisterPair {
                cr: DebugControl(0),
                vr: 0,
            }; MAX_SPLIT_WATCHPOINTS],
            combined: [DebugRegisterPair {
                cr: DebugControl(0),
                vr: 0,
            }; MAX_COMBINED_WATCHPOINTS],
        }
    }

    pub fn combined_table(&self) -> &[DebugRegisterPair; MAX_COMBINED_WATCHPOINTS] {
        &self.combined
    }

    fn find_combined(&self, addr: u64) -> Option<usize> {
        let addr = addr & !7;
        let mut used = !self.allocation_bitmap & ((1u32 << self.max_watchpoints) - 1) as u16;
        while used != 0 {
            let pos = used.trailing_zeros() as usize;
            used &= !(1 << pos);
            if self.combined[pos].vr == addr {
                return Some(pos);
            }
        }
        None
    }

    fn allocate_combined(bitmap: &mut u16) -> Option<usize> {
        if *bitmap == 0 {
            return None;
        }
        let pos = bitmap.trailing_zeros() as usize;
        *bitmap &= !(1 << pos);
        Some(pos)
    }

    /// Dry run: would a <=9-byte request at (addr, size) still fit in the
    /// hardware bank?
    fn check_normal_watchpoint_range(&self, addr: u64, size: u64) -> bool {
        let mut bitmap = self.allocation_bitmap;
        if self.find_combined(addr).is_none() && Self::allocate_combined(&mut bitmap).is_none() {
            return false;
        }

        let addr2 = (addr + size) & !7;
        if addr2 != addr & !7 && self.find_combined(addr2).is_none() {
            return Self::allocate_combined(&mut bitmap).is_some();
        }

        true
    }

    fn is_range_mask_watchpoint(addr: u64, size: u64) -> bool {
        size.is_power_of_two() && size >= 16 && addr & (size - 1) == 0
    }

    /// Fold one split entry into the combined table.
    fn combine_watchpoint(&mut self, wp: DebugRegisterPair) -> bool {
        let mut slot = self.find_combined(wp.vr & !7);

        // MASK entries only share a slot when address and mask agree exactly
        // (merging permissions is fine, merging geometry is not)
        if wp.cr.mask() != 0 {
            if let Some(pos) = slot {
                if wp.cr.mask() != self.combined[pos].cr.mask()
                    || wp.vr & !7 != self.combined[pos].vr
                {
                    slot = None;
                }
            }
        }

        let pos = match slot {
            Some(pos) => pos,
            None => match Self::allocate_combined(&mut self.allocation_bitmap) {
                Some(pos) => {
                    self.combined[pos] = DebugRegisterPair::default();
                    self.combined[pos].vr = wp.vr & !7;
                    self.combined[pos].cr.set_mask(wp.cr.mask());
                    pos
                }
                None => return false,
            },
        };

        let cr = &mut self.combined[pos].cr;
        cr.set_lower_el();
        cr.set_non_secure();
        cr.set_el1_and_el0();
        cr.set_enabled(true);

        // Merging may broaden the selection and the permitted directions
        cr.or_bas(wp.cr.bas());
        cr.or_lsc(wp.cr.lsc());

        true
    }

    fn combine_all(&mut self) {
        self.combined = [DebugRegisterPair::default(); MAX_COMBINED_WATCHPOINTS];
        self.allocation_bitmap = ((1u32 << self.max_watchpoints) - 1) as u16;
        for i in 0..self.num_split {
            let wp = self.split[i];
            self.combine_watchpoint(wp);
        }
    }

    fn do_find_split(
        &self,
        addr: u64,
        size: u64,
        direction: u32,
        strict: bool,
    ) -> Option<usize> {
        for i in 0..self.num_split {
            let wp = &self.split[i];
            if wp.vr & VR_IS_SECOND != 0 {
                continue;
            }

            let (off, sz) = if wp.cr.mask() != 0 {
                (0u64, 1u64 << wp.cr.mask())
            } else {
                let off = wp.cr.bas().trailing_zeros() as u64;
                let mut sz = wp.cr.bas().count_ones() as u64;
                if wp.vr & VR_HAS_SECOND != 0 {
                    sz += self.split[i + 1].cr.bas().count_ones() as u64;
                }
                (off, sz)
            };

            let wpaddr = (wp.vr & !7) + off;
            if strict {
                if addr == wpaddr && direction == wp.cr.lsc() && sz == size {
                    return Some(i);
                }
            } else if overlaps(wpaddr, sz, addr, size) && direction & wp.cr.lsc() != 0 {
                return Some(i);
            }
        }

        None
    }

    pub fn find_split(
        &self,
        addr: u64,
        size: u64,
        direction: u32,
        strict: bool,
    ) -> Option<DebugRegisterPair> {
        self.do_find_split(addr, size, direction, strict)
            .map(|i| self.split[i])
    }

    pub fn add(&mut self, addr: u64, size: u64, direction: u32) -> Result<()> {
        if size == 0 {
            return Err(HvError::InvalidArgument);
        }

        if self.do_find_split(addr, size, direction, true).is_some() {
            return Err(HvError::AlreadyExists);
        }

        if self.num_split == self.max_split_watchpoints as usize {
            return Err(HvError::ResourceExhausted);
        }

        let old_num_split = self.num_split;

        if Self::is_range_mask_watchpoint(addr, size) {
            let mut wp = DebugRegisterPair::default();
            wp.cr.set_lsc(direction);
            wp.vr = addr;
            wp.cr.set_bas(0xFF); // TRM-mandated for MASK entries
            wp.cr.set_mask(size.trailing_zeros());
            self.split[self.num_split] = wp;
            self.num_split += 1;

            if !self.combine_watchpoint(wp) {
                self.num_split = old_num_split;
                self.combine_all();
                return Err(HvError::ResourceExhausted);
            }
        } else if size <= 9 {
            // One or two doubleword-sized BAS entries
            if !self.check_normal_watchpoint_range(addr, size) {
                return Err(HvError::ResourceExhausted);
            }

            let addr2 = (addr + size) & !7;
            let off1 = addr & 7;
            let size1 = if addr & !7 != addr2 { 8 - off1 } else { size };
            let size2 = size - size1;

            let mut wp = DebugRegisterPair::default();
            wp.cr.set_lsc(direction);
            wp.vr = addr & !7;
            wp.cr.set_bas((((1u64 << (off1 + size1)) - (1u64 << off1)) & 0xFF) as u32);

            let mut wp2 = None;
            if size2 != 0 {
                if self.num_split + 2 > self.max_split_watchpoints as usize {
                    return Err(HvError::ResourceExhausted);
                }
                let mut second = DebugRegisterPair::default();
                second.cr.set_lsc(direction);
                second.cr.set_bas(((1u64 << size2) - 1) as u32);
                second.vr = addr2 | VR_IS_SECOND;
                wp.vr |= VR_HAS_SECOND;
                wp2 = Some(second);
            }

            self.split[self.num_split] = wp;
            self.num_split += 1;
            if let Some(second) = wp2 {
                self.split[self.num_split] = second;
                self.num_split += 1;
            }

            let ok = self.combine_watchpoint(wp)
                && wp2.map_or(true, |second| self.combine_watchpoint(second));
            if !ok {
                self.num_split = old_num_split;
                self.combine_all();
                return Err(HvError::ResourceExhausted);
            }
        } else {
            return Err(HvError::InvalidArgument);
        }

        Ok(())
    }

    pub fn remove(&mut self, addr: u64, size: u64, direction: u32) -> Result<()> {
        if size == 0 {
            return Err(HvError::InvalidArgument);
        }

        let pos = self
            .do_find_split(addr, size, direction, true)
            .ok_or(HvError::NotFound)?;

        let num = if self.split[pos].vr & VR_HAS_SECOND != 0 { 2 } else { 1 };
        for i in pos + num..self.num_split {
            self.split[i - num] = self.split[i];
        }
        self.num_split -= num;
        self.combine_all();

        Ok(())
    }

    pub fn remove_all(&mut self) {
        self.allocation_bitmap = ((1u32 << self.max_watchpoints) - 1) as u16;
        self.num_split = 0;
        self.split = [DebugRegisterPair::default(); MAX_SPLIT_WATCHPOINTS];
        self.combined = [DebugRegisterPair::default(); MAX_COMBINED_WATCHPOINTS];
    }
}

static G_WATCHPOINT_LOCK: RecursiveSpinlock = RecursiveSpinlock::new();
static mut G_WATCHPOINT_MANAGER: WatchpointManager = WatchpointManager::new();

fn manager() -> &'static mut WatchpointManager {
    unsafe { &mut *core::ptr::addr_of_mut!(G_WATCHPOINT_MANAGER) }
}

/// Probe the bank size (boot core, cold boot only), rebuild the combined
/// table on warmboot, and load this core's registers.
pub fn init() {
    G_WATCHPOINT_LOCK.lock();

    let ctx = crate::core_ctx::current_core_ctx();
    let mgr = manager();
    if ctx.is_boot_core && !ctx.warmboot {
        let num = (((sysreg::read_id_aa64dfr0_el1() >> 20) & 0xF) + 1) as u32;
        mgr.max_watchpoints = num;
        mgr.max_split_watchpoints = (8 * num).min(MAX_SPLIT_WATCHPOINTS as u32);
        mgr.allocation_bitmap = ((1u32 << num) - 1) as u16;
    } else if ctx.is_boot_core {
        mgr.combine_all();
    }

    load_watchpoint_regs(mgr.combined_table(), mgr.max_watchpoints as usize);

    G_WATCHPOINT_LOCK.unlock();
}

fn commit_handler(_args: usize) {
    let flags = crate::arch::mask_irq();
    let mgr = manager();
    load_watchpoint_regs(mgr.combined_table(), mgr.max_watchpoints as usize);
    crate::arch::restore_interrupt_flags(flags);
}

fn commit_and_broadcast() {
    crate::arch::dmb_sy();
    smp::execute_function_on_all_cores(commit_handler, 0, true);
}

pub fn add(addr: u64, size: u64, direction: u32) -> Result<()> {
    G_WATCHPOINT_LOCK.lock();
    let r = manager().add(addr, size, direction);
    if r.is_ok() {
        commit_and_broadcast();
    }
    G_WATCHPOINT_LOCK.unlock();
    r
}

pub fn remove(addr: u64, size: u64, direction: u32) -> Result<()> {
    G_WATCHPOINT_LOCK.lock();
    let r = manager().remove(addr, size, direction);
    if r.is_ok() {
        commit_and_broadcast();
    }
    G_WATCHPOINT_LOCK.unlock();
    r
}

pub fn remove_all() {
    G_WATCHPOINT_LOCK.lock();
    manager().remove_all();
    commit_and_broadcast();
    G_WATCHPOINT_LOCK.unlock();
}

/// Watchpoint exception filtering: report only when a split entry actually
/// covers (addr, direction), so OR-broadened combined entries stay silent.
pub fn find_split(addr: u64, size: u64, direction: u32, strict: bool) -> Option<DebugRegisterPair> {
    G_WATCHPOINT_LOCK.lock();
    let r = manager().find_split(addr, size, direction, strict);
    G_WATCHPOINT_LOCK.unlock();
    r
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::{LSC_ANY, LSC_LOAD, LSC_STORE};

    fn fresh() -> WatchpointManager {
        let mut m = WatchpointManager::new();
        m.max_watchpoints = 4;
        m.max_split_watchpoints = 32;
        m.allocation_bitmap = (1 << 4) - 1;
        m
    }

    fn used_combined(m: &WatchpointManager) -> usize {
        (!m.allocation_bitmap & ((1u32 << m.max_watchpoints) - 1) as u16).count_ones() as usize
    }

    #[test]
    fn small_watchpoint_within_one_doubleword() {
        let mut m = fresh();
        m.add(0x1002, 2, LSC_STORE).unwrap();
        assert_eq!(used_combined(&m), 1);
        let wp = m.find_split(0x1002, 2, LSC_STORE, true).unwrap();
        assert_eq!(wp.vr & !7, 0x1000);
        assert_eq!(wp.cr.bas(), 0b1100);
    }

    #[test]
    fn straddling_watchpoint_uses_two_slots() {
        let mut m = fresh();
        // 6 bytes at 0x1005: 3 in the first doubleword, 3 in the second
        m.add(0x1005, 6, LSC_LOAD).unwrap();
        assert_eq!(used_combined(&m), 2);
        let wp = m.find_split(0x1005, 6, LSC_LOAD, true).unwrap();
        assert_ne!(wp.vr & 1, 0);
        assert_eq!(wp.cr.bas(), 0b1110_0000);
    }

    #[test]
    fn neighbours_share_a_combined_slot() {
        let mut m = fresh();
        m.add(0x1000, 2, LSC_LOAD).unwrap();
        m.add(0x1004, 2, LSC_LOAD).unwrap();
        // Same doubleword: one hardware slot, merged BAS
        assert_eq!(used_combined(&m), 1);
        let combined = m.combined_table()[0];
        assert_eq!(combined.cr.bas(), 0b0011_0011);
    }

    #[test]
    fn merged_directions_broaden_and_filtering_catches_it() {
        let mut m = fresh();
        m.add(0x1000, 2, LSC_LOAD).unwrap();
        m.add(0x1004, 2, LSC_STORE).unwrap();
        let combined = m.combined_table()[0];
        assert_eq!(combined.cr.lsc(), LSC_ANY);

        // A store hit on 0x1000 is a broadened false positive: the loose
        // split lookup must not blame the load-only entry
        assert!(m.find_split(0x1000, 1, LSC_STORE, false).is_none());
        assert!(m.find_split(0x1000, 1, LSC_LOAD, false).is_some());
        assert!(m.find_split(0x1004, 1, LSC_STORE, false).is_some());
    }

    #[test]
    fn large_aligned_range_uses_mask() {
        let mut m = fresh();
        m.add(0x4000, 64, LSC_ANY).unwrap();
        assert_eq!(used_combined(&m), 1);
        let combined = m.combined_table()[0];
        assert_eq!(combined.cr.mask(), 6);
        assert_eq!(combined.cr.bas(), 0xFF);
        let wp = m.find_split(0x4000, 64, LSC_ANY, true).unwrap();
        assert_eq!(wp.cr.mask(), 6);
    }

    #[test]
    fn unaligned_large_range_rejected() {
        let mut m = fresh();
        assert_eq!(m.add(0x4008, 64, LSC_ANY), Err(HvError::InvalidArgument));
        assert_eq!(m.add(0x4000, 12, LSC_ANY), Err(HvError::InvalidArgument));
    }

    #[test]
    fn remove_restores_slots() {
        let mut m = fresh();
        m.add(0x1005, 6, LSC_LOAD).unwrap();
        assert_eq!(used_combined(&m), 2);
        m.remove(0x1005, 6, LSC_LOAD).unwrap();
        assert_eq!(used_combined(&m), 0);
        assert!(m.find_split(0x1005, 6, LSC_LOAD, true).is_none());
        assert_eq!(m.remove(0x1005, 6, LSC_LOAD), Err(HvError::NotFound));
    }

    #[test]
    fn removing_one_neighbour_keeps_the_other() {
        let mut m = fresh();
        m.add(0x1000, 2, LSC_LOAD).unwrap();
        m.add(0x1004, 2, LSC_STORE).unwrap();
        m.remove(0x1000, 2, LSC_LOAD).unwrap();
        assert_eq!(used_combined(&m), 1);
        // The surviving entry's direction is no longer broadened
        assert_eq!(m.combined_table()[0].cr.lsc(), LSC_STORE);
        assert_eq!(m.combined_table()[0].cr.bas(), 0b0011_0000);
    }

    #[test]
    fn hardware_bank_exhaustion() {
        let mut m = fresh();
        // 4 distinct doublewords fill the bank
        for i in 0..4u64 {
            m.add(0x1000 + 8 * i, 1, LSC_ANY).unwrap();
        }
        assert_eq!(m.add(0x2000, 1, LSC_ANY), Err(HvError::ResourceExhausted));
    }

    #[test]
    fn duplicate_rejected() {
        let mut m = fresh();
        m.add(0x1000, 4, LSC_ANY).unwrap();
        assert_eq!(m.add(0x1000, 4, LSC_ANY), Err(HvError::AlreadyExists));
    }
}
