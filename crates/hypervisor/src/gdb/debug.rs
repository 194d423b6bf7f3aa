//! Attach/detach, execution control and stop replies

use super::context::{gdb_context, GdbContext, GdbFlags, GdbState};
use super::packet;
use crate::core_ctx::get_active_core_mask;
use crate::debug::manager::{self, DebugEventInfo, DebugEventType, StopReason};
use crate::debug::{LSC_LOAD, LSC_STORE};

pub const SIGINT: u32 = 2;
pub const SIGTRAP: u32 = 5;

/// First contact: stop the machine and start reporting events.
pub fn attach(ctx: &mut GdbContext) {
    crate::info!("gdb: debugger attached");
    ctx.state = GdbState::Attached;
    ctx.last_stop_core = crate::core_ctx::current_core_id();

    manager::set_reporting_enabled(true);
    manager::pause_cores(get_active_core_mask());

    // Log traffic would corrupt the RSP stream from here on
    crate::lib::printk::set_level(crate::lib::printk::LogLevel::Error);
}

pub fn handle_detach(ctx: &mut GdbContext) {
    ctx.reply_ok();
    ctx.state = GdbState::Detaching;
}

pub fn handle_kill(ctx: &mut GdbContext) {
    // No reply for k; tear the session down like a detach
    ctx.state = GdbState::Detaching;
}

/// Undo every debugger-visible modification and let the guest run.
pub fn finalize_detach(ctx: &mut GdbContext) {
    let _ = crate::debug::software_breakpoints::remove_all(false);
    crate::debug::watchpoints::remove_all();
    crate::debug::breakpoints::remove_all();
    manager::set_reporting_enabled(false);

    for core in 0..crate::core_ctx::MAX_CORES as u32 {
        manager::get_debug_event(core).handled = true;
        manager::set_stepping_range(core, 0, 0);
    }
    manager::unpause_cores(get_active_core_mask(), 0);

    ctx.state = GdbState::Disconnected;
    ctx.flags = GdbFlags::empty();
    crate::info!("gdb: debugger detached");
}

/// Ctrl-C break-in.
pub fn handle_break(ctx: &mut GdbContext) {
    ctx.flags |= GdbFlags::CONTINUING; // the stop reply goes out async
    manager::break_cores(get_active_core_mask());
}

fn append(buf: &mut [u8], pos: &mut usize, data: &[u8]) {
    buf[*pos..*pos + data.len()].copy_from_slice(data);
    *pos += data.len();
}

fn append_hex(buf: &mut [u8], pos: &mut usize, val: u64) {
    *pos += packet::write_hex_u64(&mut buf[*pos..], val);
}

/// Format a stop reply for an event. Returns the payload length.
pub fn build_stop_reply(ev: &DebugEventInfo, buf: &mut [u8]) -> usize {
    let mut pos = 0;
    let tid = ev.core_id as u64 + 1;

    match ev.ty {
        DebugEventType::Exit => {
            append(buf, &mut pos, b"W00");
            return pos;
        }
        DebugEventType::CoreOff => {
            // Thread exit (meaningful with QThreadEvents on)
            append(buf, &mut pos, b"w0;");
            append_hex(buf, &mut pos, tid);
            return pos;
        }
        DebugEventType::OutputString { address, size } => {
            // Hex-encoded console output
            append(buf, &mut pos, b"O");
            let mut chunk = [0u8; 64];
            let mut remaining = size;
            let mut addr = address;
            while remaining > 0 && pos + 2 * chunk.len() < buf.len() {
                let n = remaining.min(chunk.len());
                let got = crate::guest_memory::guest_read_memory(addr, &mut chunk[..n]);
                if got == 0 {
                    break;
                }
                let mut hex = [0u8; 128];
                let h = packet::encode_hex(&mut hex, &chunk[..got]);
                append(buf, &mut pos, &hex[..h]);
                addr += got as u64;
                remaining -= got;
            }
            return pos;
        }
        _ => {}
    }

    let signal = match ev.ty {
        DebugEventType::DebuggerBreak => SIGINT,
        _ => SIGTRAP,
    };

    append(buf, &mut pos, b"T");
    let mut sig_hex = [0u8; 2];
    packet::encode_hex(&mut sig_hex, &[signal as u8]);
    append(buf, &mut pos, &sig_hex);

    match ev.stop_reason {
        StopReason::SwBreakpoint { .. } | StopReason::GuestBreak { .. } => {
            append(buf, &mut pos, b"swbreak:;");
        }
        StopReason::HwBreakpoint => {
            append(buf, &mut pos, b"hwbreak:;");
        }
        StopReason::Watchpoint { addr, direction } => {
            let kind: &[u8] = match direction {
                LSC_LOAD => b"rwatch:",
                LSC_STORE => b"watch:",
                _ => b"awatch:",
            };
            append(buf, &mut pos, kind);
            append_hex(buf, &mut pos, addr);
            append(buf, &mut pos, b";");
        }
        _ => {}
    }

    append(buf, &mut pos, b"thread:");
    append_hex(buf, &mut pos, tid);
    append(buf, &mut pos, b";");

    pos
}

/// Called by the debug manager when a core stops: if the debugger is
/// waiting for an asynchronous stop, ship the reply now; otherwise the
/// event stays unhandled and `?` / the pause loop will retry.
pub fn try_signal_debug_event(ev: &mut DebugEventInfo) {
    super::context::lock();
    let ctx = gdb_context();

    if ctx.state == GdbState::Attached && ctx.flags.contains(GdbFlags::CONTINUING) {
        let mut buf = [0u8; 512];
        let len = build_stop_reply(ev, &mut buf);

        if let Some(iface) = ctx.iface {
            iface.acquire();
            ctx.send_packet(&buf[..len]);
            iface.release();
        } else {
            ctx.send_packet(&buf[..len]);
        }

        ctx.flags &= !GdbFlags::CONTINUING;
        ctx.last_stop_core = ev.core_id;
        ev.handled = true;
    }

    super::context::unlock();
}

pub fn handle_get_stop_reason(ctx: &mut GdbContext) {
    // Prefer a core with an unreported event
    for core in 0..crate::core_ctx::MAX_CORES as u32 {
        if manager::has_debug_event(core) {
            let ev = manager::get_debug_event(core);
            let mut buf = [0u8; 512];
            let len = build_stop_reply(ev, &mut buf);
            ev.handled = true;
            ctx.last_stop_core = core;
            ctx.send_packet(&buf[..len]);
            return;
        }
    }

    // Otherwise whatever core we stopped on attach
    let mut buf = [0u8; 64];
    let mut pos = 0;
    append(&mut buf, &mut pos, b"T05thread:");
    append_hex(&mut buf, &mut pos, ctx.last_stop_core as u64 + 1);
    append(&mut buf, &mut pos, b";");
    ctx.send_packet(&buf[..pos]);
}

/// c / C sig[;addr]: continue everything that is paused.
pub fn handle_continue(ctx: &mut GdbContext, _cmd: u8, _args: &[u8]) {
    ctx.flags |= GdbFlags::CONTINUING;
    let mask = get_active_core_mask();
    manager::continue_cores(mask, 0);
    // The reply is the next stop packet
}

/// s / S sig[;addr]: step the selected thread, keep the others paused.
pub fn handle_step(ctx: &mut GdbContext, _cmd: u8, _args: &[u8]) {
    ctx.flags |= GdbFlags::CONTINUING;
    let bit = 1u32 << ctx.selected_core_c;
    manager::continue_cores(bit, bit);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(ty: DebugEventType, reason: StopReason, core: u32) -> DebugEventInfo {
        let mut ev = *manager::get_debug_event(core);
        ev.ty = ty;
        ev.stop_reason = reason;
        ev.core_id = core;
        ev
    }

    #[test]
    fn stop_reply_for_sw_breakpoint() {
        let ev = event(
            DebugEventType::Exception,
            StopReason::SwBreakpoint { uid: 0x2001 },
            0,
        );
        let mut buf = [0u8; 128];
        let len = build_stop_reply(&ev, &mut buf);
        assert_eq!(&buf[..len], b"T05swbreak:;thread:1;");
    }

    #[test]
    fn stop_reply_for_watchpoint_encodes_address() {
        let ev = event(
            DebugEventType::Exception,
            StopReason::Watchpoint {
                addr: 0xDEAD0,
                direction: LSC_STORE,
            },
            2,
        );
        let mut buf = [0u8; 128];
        let len = build_stop_reply(&ev, &mut buf);
        assert_eq!(&buf[..len], b"T05watch:dead0;thread:3;");
    }

    #[test]
    fn stop_reply_for_debugger_break_is_sigint() {
        let ev = event(DebugEventType::DebuggerBreak, StopReason::None, 1);
        let mut buf = [0u8; 128];
        let len = build_stop_reply(&ev, &mut buf);
        assert_eq!(&buf[..len], b"T02thread:2;");
    }

    #[test]
    fn stop_reply_for_exit() {
        let ev = event(DebugEventType::Exit, StopReason::None, 0);
        let mut buf = [0u8; 128];
        let len = build_stop_reply(&ev, &mut buf);
        assert_eq!(&buf[..len], b"W00");
    }
}
