// Panic handling
//
// A panic at EL2 is unrecoverable: print what we know on the UART and park
// the core. The recursive-panic guard keeps a fault inside the UART path
// from looping forever.

use core::sync::atomic::{AtomicBool, Ordering};

static PANICKING: AtomicBool = AtomicBool::new(false);

pub fn panic_report(info: &core::panic::PanicInfo) -> ! {
    if PANICKING.swap(true, Ordering::SeqCst) {
        crate::platform::uart::debug_write(b"\n!!! RECURSIVE PANIC !!!\n");
        halt();
    }

    crate::arch::mask_irq();

    crate::error!("");
    crate::error!("==================== EL2 PANIC ====================");
    if let Some(location) = info.location() {
        crate::error!("at {}:{}", location.file(), location.line());
    }
    crate::error!("{}", info.message());
    crate::error!("core {}", crate::core_ctx::current_core_id());
    crate::error!("===================================================");

    halt()
}

fn halt() -> ! {
    loop {
        crate::arch::wfi();
    }
}

#[cfg(all(target_arch = "aarch64", not(test)))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    panic_report(info)
}
