//! Stop points (Z/z): software/hardware breakpoints and watchpoints

use super::context::GdbContext;
use super::packet;
use crate::debug::{breakpoints, software_breakpoints, watchpoints, LSC_ANY, LSC_LOAD, LSC_STORE};
use crate::lib::error::HvError;

/// Z/z type,addr,kind
pub fn handle_toggle_stop_point(ctx: &mut GdbContext, cmd: u8, args: &[u8]) {
    let insert = cmd == b'Z';

    let mut vals = [0u64; 3];
    if packet::parse_hex_list(args, &mut vals, b',').is_none() {
        ctx.reply_error(22);
        return;
    }
    let (ty, addr, kind) = (vals[0], vals[1], vals[2]);

    let result = match ty {
        0 => {
            // Software breakpoint; kind is the instruction size, A64 only
            if kind != 4 {
                Err(HvError::InvalidArgument)
            } else if insert {
                software_breakpoints::add(addr, false)
            } else {
                software_breakpoints::remove(addr, false)
            }
        }
        1 => {
            if insert {
                breakpoints::add(addr)
            } else {
                breakpoints::remove(addr)
            }
        }
        2 | 3 | 4 => {
            let direction = match ty {
                2 => LSC_STORE,
                3 => LSC_LOAD,
                _ => LSC_ANY,
            };
            if insert {
                watchpoints::add(addr, kind, direction)
            } else {
                watchpoints::remove(addr, kind, direction)
            }
        }
        _ => {
            // Unsupported stop-point type: empty reply per the protocol
            ctx.reply_empty();
            return;
        }
    };

    ctx.reply_result(result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest_memory::HOST_GUEST_RAM_BASE;


    #[test]
    fn z0_software_breakpoint_roundtrip() {
        let _guard = crate::lib::test_lock();
        crate::core_ctx::init(0, true, 0, false);
        crate::core_ctx::set_current_core_active();

        let addr = HOST_GUEST_RAM_BASE + 0x9000;
        let _ = crate::guest_memory::guest_write_memory(addr, &0xD503_201Fu32.to_le_bytes());

        let mut ctx = GdbContext::new();
        let insert = std::format!("0,{:x},4", addr);
        handle_toggle_stop_point(&mut ctx, b'Z', insert.as_bytes());
        assert_eq!(ctx.test_last_sent(), b"$OK#9a");

        handle_toggle_stop_point(&mut ctx, b'z', insert.as_bytes());
        assert_eq!(ctx.test_last_sent(), b"$OK#9a");
    }

    #[test]
    fn z0_wrong_kind_rejected() {
        let _guard = crate::lib::test_lock();
        let mut ctx = GdbContext::new();
        handle_toggle_stop_point(&mut ctx, b'Z', b"0,1000,2");
        assert_eq!(ctx.test_last_sent(), b"$E16#ac");
    }

    #[test]
    fn unsupported_type_gets_empty_reply() {
        let _guard = crate::lib::test_lock();
        let mut ctx = GdbContext::new();
        handle_toggle_stop_point(&mut ctx, b'Z', b"5,1000,4");
        assert_eq!(ctx.test_last_sent(), b"$#00");
    }
}
