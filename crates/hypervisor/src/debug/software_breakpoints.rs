//! Software breakpoints
//!
//! A software breakpoint patches one guest instruction with `BRK #uid`,
//! where the 16-bit immediate (0x2000 + counter) identifies the owner when
//! the trap arrives. The original word is stashed for the revert.
//!
//! Breakpoints live on guest *virtual* addresses; translation tables can
//! change under us (and differ per core), so placing one on an address that
//! is invalid for any core is unpredictable by contract. Guest stage-1 MMU
//! switches revert every patch first and re-apply after (see traps::sysreg).
//!
//! Apply/revert run as an execute-on-all-cores broadcast in which only the
//! initiating core writes guest memory; the other cores spin on the
//! `tried_to_apply_or_revert` flag, which is cheaper than a full cross-core
//! barrier and still guarantees I-cache-consistent observation once the RPC
//! drains.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::core_ctx::current_core_id;
use crate::guest_memory;
use crate::lib::error::{HvError, Result};
use crate::smp;
use crate::sync::RecursiveSpinlock;

pub const MAX_SW_BREAKPOINTS: usize = 32;

const BRK_BASE_UID: u16 = 0x2000;

/// A64 BRK #imm16
pub fn brk_instruction(uid: u16) -> u32 {
    0xD420_0000 | ((uid as u32) << 5)
}

#[derive(Debug, Clone, Copy)]
pub struct SoftwareBreakpoint {
    pub address: u64,
    pub saved_instruction: u32,
    pub uid: u16,
    pub persistent: bool,
    pub applied: bool,
}

impl SoftwareBreakpoint {
    const fn empty() -> Self {
        Self {
            address: 0,
            saved_instruction: 0,
            uid: 0,
            persistent: false,
            applied: false,
        }
    }
}

pub struct SoftwareBreakpointManager {
    num_breakpoints: usize,
    breakpoints: [SoftwareBreakpoint; MAX_SW_BREAKPOINTS],
    bp_unique_counter: u16,
}

impl SoftwareBreakpointManager {
    pub const fn new() -> Self {
        Self {
            num_breakpoints: 0,
            breakpoints: [SoftwareBreakpoint::empty(); MAX_SW_BREAKPOINTS],
            bp_unique_counter: 0,
        }
    }

    /// Slot holding `address`, or the slot it would be inserted at.
    fn find_closest_slot(&self, address: u64) -> usize {
        if self.num_breakpoints == 0 || address <= self.breakpoints[0].address {
            return 0;
        }
        if address > self.breakpoints[self.num_breakpoints - 1].address {
            return self.num_breakpoints;
        }

        let mut a = 0;
        let mut b = self.num_breakpoints - 1;
        while b - a > 1 {
            let m = (a + b) / 2;
            if self.breakpoints[m].address < address {
                a = m;
            } else if self.breakpoints[m].address > address {
                b = m;
            } else {
                return m;
            }
        }
        b
    }

    pub fn find_by_uid(&self, uid: u16) -> Option<&SoftwareBreakpoint> {
        self.breakpoints[..self.num_breakpoints]
            .iter()
            .find(|bp| bp.uid == uid)
    }
}

static G_SW_BREAKPOINT_LOCK: RecursiveSpinlock = RecursiveSpinlock::new();
static mut G_SW_BREAKPOINT_MANAGER: SoftwareBreakpointManager = SoftwareBreakpointManager::new();

/// Single-writer handshake for the broadcast apply/revert
static TRIED_TO_APPLY_OR_REVERT: AtomicBool = AtomicBool::new(false);

fn manager() -> &'static mut SoftwareBreakpointManager {
    unsafe { &mut *core::ptr::addr_of_mut!(G_SW_BREAKPOINT_MANAGER) }
}

fn do_apply(id: usize) -> bool {
    let mgr = manager();
    let bp = &mut mgr.breakpoints[id];
    let brk = brk_instruction(bp.uid).to_le_bytes();
    let mut saved = [0u8; 4];

    let n = guest_memory::guest_read_write_memory(bp.address, 4, Some(&mut saved), Some(&brk));
    if n == 4 {
        bp.saved_instruction = u32::from_le_bytes(saved);
    }
    bp.applied = n == 4;
    TRIED_TO_APPLY_OR_REVERT.store(true, Ordering::SeqCst);
    n == 4
}

fn do_revert(id: usize) -> bool {
    let mgr = manager();
    let bp = &mut mgr.breakpoints[id];
    let saved = bp.saved_instruction.to_le_bytes();

    let n = guest_memory::guest_write_memory(bp.address, &saved);
    bp.applied = n != 4;
    TRIED_TO_APPLY_OR_REVERT.store(true, Ordering::SeqCst);
    n == 4
}

static BROADCAST_SRC_CORE: AtomicUsize = AtomicUsize::new(0);

fn broadcast_src_core() -> u32 {
    BROADCAST_SRC_CORE.load(Ordering::SeqCst) as u32
}

fn apply_handler(id: usize) {
    if current_core_id() == broadcast_src_core() {
        do_apply(id);
        crate::arch::sev();
    } else {
        while !TRIED_TO_APPLY_OR_REVERT.load(Ordering::SeqCst) {
            crate::arch::wfe();
        }
    }
}

fn revert_handler(id: usize) {
    if current_core_id() == broadcast_src_core() {
        do_revert(id);
        crate::arch::sev();
    } else {
        while !TRIED_TO_APPLY_OR_REVERT.load(Ordering::SeqCst) {
            crate::arch::wfe();
        }
    }
}

fn apply(id: usize) -> bool {
    if manager().breakpoints[id].applied {
        return true;
    }

    TRIED_TO_APPLY_OR_REVERT.store(false, Ordering::SeqCst);
    BROADCAST_SRC_CORE.store(current_core_id() as usize, Ordering::SeqCst);
    smp::execute_function_on_all_cores(apply_handler, id, true);
    manager().breakpoints[id].applied
}

fn revert(id: usize) -> bool {
    if !manager().breakpoints[id].applied {
        return true;
    }

    TRIED_TO_APPLY_OR_REVERT.store(false, Ordering::SeqCst);
    BROADCAST_SRC_CORE.store(current_core_id() as usize, Ordering::SeqCst);
    smp::execute_function_on_all_cores(revert_handler, id, true);
    !manager().breakpoints[id].applied
}

/// Re-apply every breakpoint, this core only (no broadcast): used around
/// guest stage-1 MMU changes where the other cores are not involved.
pub fn apply_all() -> bool {
    let flags = G_SW_BREAKPOINT_LOCK.lock_mask_irq();
    let mut ok = true;
    for i in 0..manager().num_breakpoints {
        ok = ok && do_apply(i);
    }
    G_SW_BREAKPOINT_LOCK.unlock_restore_irq(flags);
    ok
}

pub fn revert_all() -> bool {
    let flags = G_SW_BREAKPOINT_LOCK.lock_mask_irq();
    let mut ok = true;
    for i in 0..manager().num_breakpoints {
        ok = ok && do_revert(i);
    }
    G_SW_BREAKPOINT_LOCK.unlock_restore_irq(flags);
    ok
}

pub fn add(addr: u64, persistent: bool) -> Result<()> {
    if addr & 3 != 0 {
        return Err(HvError::InvalidArgument);
    }

    G_SW_BREAKPOINT_LOCK.lock();
    let mgr = manager();

    let id = mgr.find_closest_slot(addr);

    if id != mgr.num_breakpoints && mgr.breakpoints[id].address == addr {
        G_SW_BREAKPOINT_LOCK.unlock();
        return Err(HvError::AlreadyExists);
    }
    if mgr.num_breakpoints == MAX_SW_BREAKPOINTS {
        G_SW_BREAKPOINT_LOCK.unlock();
        return Err(HvError::ResourceExhausted);
    }

    let mut i = mgr.num_breakpoints;
    while i > id {
        mgr.breakpoints[i] = mgr.breakpoints[i - 1];
        i -= 1;
    }
    mgr.num_breakpoints += 1;

    let bp = &mut mgr.breakpoints[id];
    bp.address = addr;
    bp.persistent = persistent;
    bp.applied = false;
    bp.uid = BRK_BASE_UID + mgr.bp_unique_counter;
    mgr.bp_unique_counter += 1;

    let rc = if apply(id) { Ok(()) } else { Err(HvError::Fault) };
    G_SW_BREAKPOINT_LOCK.unlock();
    rc
}

/// Remove a breakpoint. With `keep_persistent`, a persistent entry has its
/// patch reverted but stays in the table, so a later `apply_all` restores
/// it.
pub fn remove(addr: u64, keep_persistent: bool) -> Result<()> {
    if addr & 3 != 0 {
        return Err(HvError::InvalidArgument);
    }

    G_SW_BREAKPOINT_LOCK.lock();
    let mgr = manager();

    let id = mgr.find_closest_slot(addr);
    if id == mgr.num_breakpoints || mgr.breakpoints[id].address != addr {
        G_SW_BREAKPOINT_LOCK.unlock();
        return Err(HvError::NotFound);
    }

    let ok = revert(id);

    if !(keep_persistent && mgr.breakpoints[id].persistent) {
        for i in id..mgr.num_breakpoints - 1 {
            mgr.breakpoints[i] = mgr.breakpoints[i + 1];
        }
        mgr.num_breakpoints -= 1;
        mgr.breakpoints[mgr.num_breakpoints] = SoftwareBreakpoint::empty();
    }

    G_SW_BREAKPOINT_LOCK.unlock();
    if ok {
        Ok(())
    } else {
        Err(HvError::Fault)
    }
}

pub fn remove_all(keep_persistent: bool) -> Result<()> {
    G_SW_BREAKPOINT_LOCK.lock();
    let mgr = manager();
    let mut ok = true;

    let mut id = 0;
    while id < mgr.num_breakpoints {
        if keep_persistent && mgr.breakpoints[id].persistent {
            ok = ok && revert(id);
            id += 1;
        } else {
            ok = ok && revert(id);
            for i in id..mgr.num_breakpoints - 1 {
                mgr.breakpoints[i] = mgr.breakpoints[i + 1];
            }
            mgr.num_breakpoints -= 1;
            mgr.breakpoints[mgr.num_breakpoints] = SoftwareBreakpoint::empty();
        }
    }

    if mgr.num_breakpoints == 0 {
        mgr.bp_unique_counter = 0;
    }

    G_SW_BREAKPOINT_LOCK.unlock();
    if ok {
        Ok(())
    } else {
        Err(HvError::Fault)
    }
}

/// Does this BRK immediate belong to one of ours?
pub fn match_uid(uid: u16) -> Option<u64> {
    G_SW_BREAKPOINT_LOCK.lock();
    let r = manager().find_by_uid(uid).map(|bp| bp.address);
    G_SW_BREAKPOINT_LOCK.unlock();
    r
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest_memory::HOST_GUEST_RAM_BASE;


    fn reset() {
        let _ = remove_all(false);
        crate::core_ctx::init(0, true, 0, false);
        crate::core_ctx::set_current_core_active();
    }

    fn write_word(addr: u64, word: u32) {
        assert_eq!(guest_memory::guest_write_memory(addr, &word.to_le_bytes()), 4);
    }

    fn read_word(addr: u64) -> u32 {
        let mut buf = [0u8; 4];
        assert_eq!(guest_memory::guest_read_memory(addr, &mut buf), 4);
        u32::from_le_bytes(buf)
    }

    #[test]
    fn apply_patches_brk_and_revert_restores() {
        let _guard = crate::lib::test_lock();
        reset();

        let addr = HOST_GUEST_RAM_BASE + 0x1000;
        write_word(addr, 0xD280_0020); // mov x0, #1

        add(addr, false).unwrap();

        let patched = read_word(addr);
        assert_eq!(patched & 0xFFE0_001F, 0xD420_0000);
        let uid = ((patched >> 5) & 0xFFFF) as u16;
        assert!(uid >= 0x2000);
        assert_eq!(match_uid(uid), Some(addr));

        remove(addr, false).unwrap();
        assert_eq!(read_word(addr), 0xD280_0020);
        assert_eq!(match_uid(uid), None);
    }

    #[test]
    fn duplicate_and_misaligned_rejected() {
        let _guard = crate::lib::test_lock();
        reset();

        let addr = HOST_GUEST_RAM_BASE + 0x2000;
        write_word(addr, 0x1400_0000);
        assert_eq!(add(addr + 2, false), Err(HvError::InvalidArgument));
        add(addr, false).unwrap();
        assert_eq!(add(addr, false), Err(HvError::AlreadyExists));
        remove(addr, false).unwrap();
    }

    #[test]
    fn unmappable_address_fails_cleanly() {
        let _guard = crate::lib::test_lock();
        reset();

        assert_eq!(add(0x10, false), Err(HvError::Fault));
        // The failed entry still occupies a slot until removed, like any
        // not-applied breakpoint
        let _ = remove(0x10, false);
    }

    #[test]
    fn persistent_breakpoint_survives_soft_remove() {
        let _guard = crate::lib::test_lock();
        reset();

        let addr = HOST_GUEST_RAM_BASE + 0x3000;
        write_word(addr, 0xAA0103E2);

        add(addr, true).unwrap();
        let patched = read_word(addr);

        // Soft remove: patch reverted, entry retained
        remove(addr, true).unwrap();
        assert_eq!(read_word(addr), 0xAA0103E2);
        assert_eq!(add(addr, true), Err(HvError::AlreadyExists));

        // apply_all restores the patch with the same uid
        assert!(apply_all());
        assert_eq!(read_word(addr), patched);

        remove(addr, false).unwrap();
        assert_eq!(read_word(addr), 0xAA0103E2);
    }

    #[test]
    fn table_stays_sorted() {
        let _guard = crate::lib::test_lock();
        reset();

        let a = HOST_GUEST_RAM_BASE + 0x5000;
        let b = HOST_GUEST_RAM_BASE + 0x4000;
        let c = HOST_GUEST_RAM_BASE + 0x6000;
        for addr in [a, b, c] {
            write_word(addr, 0xD503201F); // nop
            add(addr, false).unwrap();
        }

        let mgr = manager();
        assert_eq!(mgr.num_breakpoints, 3);
        assert!(mgr.breakpoints[0].address < mgr.breakpoints[1].address);
        assert!(mgr.breakpoints[1].address < mgr.breakpoints[2].address);

        remove_all(false).unwrap();
        for addr in [a, b, c] {
            assert_eq!(read_word(addr), 0xD503201F);
        }
    }
}
