//! Hypervisor entry and bring-up
//!
//! The loader drops every core into `ventana_start` (vectors.S) with
//! `(core_id, is_boot_core, argument)` in x0..x2, EL2, MMU off, and the
//! `VENTANA_IMAGE_LAYOUT` record filled in. The boot core builds the EL2
//! page tables and turns the MMU on; every core then walks the per-core
//! init ladder and drops to EL1.
//!
//! Warm boots (PSCI CPU_ON / resume from powerdown, retargeted at
//! `ventana_warmboot_start` by the SMC hooks) run the same ladder with the
//! already-built tables, then enter the guest at the entrypoint the PSCI
//! hook captured, with the guest's context id intact in x0.

#![cfg_attr(target_arch = "aarch64", no_std)]
#![cfg_attr(target_arch = "aarch64", no_main)]

#[cfg(target_arch = "aarch64")]
mod el2 {
    use core::sync::atomic::{AtomicU64, Ordering};

    use ventana::memory_map::{self, LoadImageLayout};
    use ventana::{core_ctx, debug, exceptions, gdb, irq, platform, stage2, timer};

    /// Filled in by the loader before it jumps to ventana_start.
    #[no_mangle]
    pub static mut VENTANA_IMAGE_LAYOUT: LoadImageLayout = LoadImageLayout {
        start_pa: 0,
        max_image_size: 0,
        image_size: 0,
        temp_pa: 0,
        max_temp_size: 0,
        temp_size: 0,
        vbar: 0,
    };

    /// Guest kernel entrypoint for the cold-boot path, also loader-provided.
    #[no_mangle]
    pub static VENTANA_KERNEL_ENTRYPOINT: AtomicU64 = AtomicU64::new(0);

    extern "C" {
        fn ventana_switch_stack(new_sp: u64, cont: extern "C" fn() -> !) -> !;
        fn ventana_enter_el1(entrypoint: u64, argument: u64) -> !;
    }

    #[derive(Clone, Copy)]
    struct BootArgs {
        core_id: u32,
        is_boot_core: bool,
        warmboot: bool,
        argument: u64,
    }

    static mut BOOT_ARGS: [BootArgs; core_ctx::MAX_CORES] = [BootArgs {
        core_id: 0,
        is_boot_core: false,
        warmboot: false,
        argument: 0,
    }; core_ctx::MAX_CORES];

    /// First Rust code on every core, still on the early physical-address
    /// stack.
    #[no_mangle]
    pub extern "C" fn ventana_main(
        core_id: u64,
        is_boot_core: u64,
        argument: u64,
        warmboot: u64,
    ) -> ! {
        let core = (core_id & (core_ctx::MAX_CORES as u64 - 1)) as u32;
        let layout = unsafe { *core::ptr::addr_of!(VENTANA_IMAGE_LAYOUT) };

        if is_boot_core != 0 && warmboot == 0 {
            let mmu_table = (layout.temp_pa + layout.max_temp_size as u64) as *mut u64;
            memory_map::setup_mmu(&layout, mmu_table);
        }

        unsafe {
            BOOT_ARGS[core as usize] = BootArgs {
                core_id: core,
                is_boot_core: is_boot_core != 0,
                warmboot: warmboot != 0,
                argument,
            };
        }

        // From here the early stack is gone: enable translation and restart
        // on the mapped per-core stack. The instruction fetch after the
        // SCTLR write faults on the stale physical PC and resumes through
        // the vector table at its linked VA.
        memory_map::enable_mmu(&layout);

        unsafe { ventana_switch_stack(memory_map::stack_top(core), main_with_mmu) }
    }

    extern "C" fn main_with_mmu() -> ! {
        let mpidr = ventana::arch::sysreg::read_mpidr_el1();
        let args = unsafe { BOOT_ARGS[(mpidr & (core_ctx::MAX_CORES as u64 - 1)) as usize] };

        core_ctx::init(args.core_id, args.is_boot_core, args.argument, args.warmboot);
        let ctx = core_ctx::current_core_ctx();
        ctx.crash_stack_top = memory_map::crash_stack_top(args.core_id) as usize;

        exceptions::configure_el2_traps();

        if args.is_boot_core && !args.warmboot {
            let plat = platform::active();
            let uart_va = memory_map::platform_mmio(plat.uart_pa as u64, 0x1000);
            platform::uart::init(uart_va as usize, plat.uart_kind);

            ventana::info!("ventana EL2 up on {} (core {})", plat.name, args.core_id);
        }

        irq::init();
        timer::init();
        debug::breakpoints::init();
        debug::watchpoints::init();

        if args.is_boot_core && !args.warmboot {
            debug::manager::init();
            gdb::context::init();
        }

        stage2::configure_and_enable();

        core_ctx::set_current_core_active();

        let (entrypoint, argument) = if args.warmboot {
            // Let an attached debugger observe the thread coming online
            debug::manager::report_core_on();
            (
                ctx.kernel_entrypoint.load(Ordering::SeqCst),
                ctx.kernel_argument,
            )
        } else {
            let ep = VENTANA_KERNEL_ENTRYPOINT.load(Ordering::SeqCst);
            ctx.kernel_entrypoint.store(ep, Ordering::SeqCst);
            (ep, ctx.kernel_argument)
        };

        if entrypoint == 0 {
            panic!("no guest entrypoint for core {}", args.core_id);
        }

        ventana::info!(
            "core {}: entering guest at {:#x} (x0 = {:#x})",
            args.core_id,
            entrypoint,
            argument
        );

        unsafe { ventana_enter_el1(entrypoint, argument) }
    }
}

#[cfg(not(target_arch = "aarch64"))]
fn main() {
    // The hypervisor only runs on aarch64 hardware; the library (and its
    // test suite) is what a host build is for.
    eprintln!("ventana: aarch64-unknown-none target required");
}
